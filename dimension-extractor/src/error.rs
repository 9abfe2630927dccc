use common_kafka::avro::CodecError;
use thiserror::Error;

use crate::dataset::DatasetError;
use crate::extract::{ExtractError, HeaderError};
use crate::producer::ProduceError;
use crate::retriever::RetrieveError;

/// Everything that can end the processing of one file.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("failed to decode file available event: {0}")]
    Decode(#[from] CodecError),
    #[error("failed to retrieve file: {0}")]
    Retrieve(#[from] RetrieveError),
    #[error("invalid header row: {0}")]
    Header(#[from] HeaderError),
    #[error("failed to read csv: {0}")]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error("dataset API call failed: {0}")]
    Dataset(#[from] DatasetError),
    #[error("failed to produce completion event: {0}")]
    Produce(#[from] ProduceError),
}

/// A failed message, with the instance it concerned when that is known.
#[derive(Error, Debug)]
#[error("{source}")]
pub struct ProcessingError {
    pub instance_id: Option<String>,
    pub source: PipelineError,
}

impl ProcessingError {
    pub fn for_instance(instance_id: &str, source: impl Into<PipelineError>) -> Self {
        Self {
            instance_id: Some(instance_id.to_owned()),
            source: source.into(),
        }
    }

    pub fn malformed(source: impl Into<PipelineError>) -> Self {
        Self {
            instance_id: None,
            source: source.into(),
        }
    }
}
