//! Messages read from and written to Kafka, encoded as bare Avro datums.

use common_kafka::avro::{AvroCodec, CodecError};
use serde::{Deserialize, Serialize};

pub const SERVICE_NAME: &str = "dp-dimension-extractor";

const FILE_EVENT_SCHEMA: &str = r#"{
  "type": "record",
  "name": "input_file_available",
  "fields": [
    {"name": "file_url", "type": "string"},
    {"name": "instance_id", "type": "string"}
  ]
}"#;

const EXTRACTED_EVENT_SCHEMA: &str = r#"{
  "type": "record",
  "name": "dimensions_extracted",
  "fields": [
    {"name": "file_url", "type": "string"},
    {"name": "instance_id", "type": "string"}
  ]
}"#;

const REPORT_EVENT_SCHEMA: &str = r#"{
  "type": "record",
  "name": "report_event",
  "fields": [
    {"name": "instance_id", "type": "string"},
    {"name": "event_type", "type": "string"},
    {"name": "event_message", "type": "string"},
    {"name": "service_name", "type": "string"}
  ]
}"#;

/// Announcement that a file is ready to be read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAvailableEvent {
    pub file_url: String,
    pub instance_id: String,
}

/// Produced once per file whose options and summary reached the dataset API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionCompleteEvent {
    pub file_url: String,
    pub instance_id: String,
}

/// Failure of an instance, published for the import reporter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportEvent {
    pub instance_id: String,
    pub event_type: String,
    pub event_message: String,
    pub service_name: String,
}

impl ReportEvent {
    pub fn error(instance_id: &str, message: &str) -> Self {
        Self {
            instance_id: instance_id.to_owned(),
            event_type: "error".to_owned(),
            event_message: message.to_owned(),
            service_name: SERVICE_NAME.to_owned(),
        }
    }
}

pub fn file_available_codec() -> Result<AvroCodec<FileAvailableEvent>, CodecError> {
    AvroCodec::new(FILE_EVENT_SCHEMA)
}

pub fn extraction_complete_codec() -> Result<AvroCodec<ExtractionCompleteEvent>, CodecError> {
    AvroCodec::new(EXTRACTED_EVENT_SCHEMA)
}

pub fn report_event_codec() -> Result<AvroCodec<ReportEvent>, CodecError> {
    AvroCodec::new(REPORT_EVENT_SCHEMA)
}
