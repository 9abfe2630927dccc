use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use common_kafka::avro::{AvroCodec, CodecError};
use csv::StringRecord;
use tracing::{debug, info};

use crate::accumulator::{Accumulator, Added};
use crate::dataset::{DatasetClient, InstanceSummary};
use crate::error::{PipelineError, ProcessingError};
use crate::event::{file_available_codec, ExtractionCompleteEvent, FileAvailableEvent};
use crate::extract::{Header, HeaderError, RowExtractor};
use crate::producer::EventProducer;
use crate::retriever::Retriever;

/// Processes the payload of one consumed message. On success returns the
/// instance the file belonged to.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, payload: &[u8]) -> Result<String, ProcessingError>;
}

/// Retrieve a file, deliver its dimension options and summary to the
/// dataset API, then announce it as extracted.
pub struct FileHandler {
    codec: AvroCodec<FileAvailableEvent>,
    retriever: Arc<dyn Retriever>,
    dataset: Arc<dyn DatasetClient>,
    producer: Arc<dyn EventProducer>,
    batch_size: usize,
    time_column: Option<usize>,
}

impl FileHandler {
    pub fn new(
        retriever: Arc<dyn Retriever>,
        dataset: Arc<dyn DatasetClient>,
        producer: Arc<dyn EventProducer>,
        batch_size: usize,
    ) -> Result<Self, CodecError> {
        Ok(Self {
            codec: file_available_codec()?,
            retriever,
            dataset,
            producer,
            batch_size,
            time_column: None,
        })
    }

    pub fn time_column(mut self, index: Option<usize>) -> Self {
        self.time_column = index;
        self
    }

    async fn process(&self, event: &FileAvailableEvent) -> Result<(), PipelineError> {
        let instance_id = event.instance_id.as_str();
        let file = self.retriever.retrieve(&event.file_url).await?;
        let codelists = self.dataset.get_codelists(instance_id).await?;

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(file.body.as_ref());
        let mut records = reader.records();

        let header = match records.next() {
            Some(record) => Header::parse(cells(&record?))?,
            None => return Err(HeaderError::Empty.into()),
        };
        debug!(instance_id, offset = header.offset(), "parsed header row");

        let extractor = RowExtractor::new(&header, &codelists).time_column(self.time_column);
        let mut accumulator = Accumulator::new(self.batch_size);
        let mut observations: u64 = 0;

        for record in records {
            let row = cells(&record?);
            observations += 1;

            for option in extractor.extract(&row, accumulator.seen())? {
                if let Added::Full(batch) = accumulator.add(option) {
                    self.dataset.send_options(instance_id, &batch).await?;
                }
            }
        }
        if let Some(batch) = accumulator.flush() {
            self.dataset.send_options(instance_id, &batch).await?;
        }

        info!(
            instance_id,
            observations,
            options = accumulator.accepted(),
            "delivered dimension options"
        );

        let summary = InstanceSummary {
            headers: header.names().to_vec(),
            total_observations: observations,
        };
        self.dataset.submit_summary(instance_id, &summary).await?;

        self.producer
            .extraction_complete(&ExtractionCompleteEvent {
                file_url: file.location.to_string(),
                instance_id: instance_id.to_owned(),
            })
            .await?;
        Ok(())
    }
}

fn cells(record: &StringRecord) -> Vec<String> {
    record.iter().map(str::to_owned).collect()
}

#[async_trait]
impl MessageHandler for FileHandler {
    async fn handle(&self, payload: &[u8]) -> Result<String, ProcessingError> {
        let event = self
            .codec
            .decode(payload)
            .map_err(ProcessingError::malformed)?;
        info!(
            instance_id = %event.instance_id,
            file_url = %event.file_url,
            "processing file available event"
        );

        let start = Instant::now();
        let result = self.process(&event).await;
        metrics::histogram!("dimension_extractor_file_processing_duration_seconds")
            .record(start.elapsed().as_secs_f64());

        result
            .map(|()| event.instance_id.clone())
            .map_err(|error| ProcessingError::for_instance(&event.instance_id, error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::DatasetError;
    use crate::extract::ExtractError;
    use crate::mock::{DatasetCall, MockDatasetClient, MockEventProducer, MockObjectStore};
    use crate::retriever::FileRetriever;
    use bytes::Bytes;
    use reqwest::{Method, StatusCode};

    const HEADER: &str = "V4_2,Data Marking,Year Codelist,Year,League Codelist,League\n";

    fn payload(file_url: &str, instance_id: &str) -> Vec<u8> {
        file_available_codec()
            .unwrap()
            .encode(&FileAvailableEvent {
                file_url: file_url.to_owned(),
                instance_id: instance_id.to_owned(),
            })
            .unwrap()
    }

    fn handler(
        body: &str,
        dataset: &MockDatasetClient,
        producer: &MockEventProducer,
        batch_size: usize,
    ) -> FileHandler {
        let store = MockObjectStore::new().get_object_ret(
            "bucket",
            "file.csv",
            Ok(Bytes::from(body.to_owned())),
        );
        FileHandler::new(
            Arc::new(FileRetriever::new(Arc::new(store))),
            Arc::new(dataset.clone()),
            Arc::new(producer.clone()),
            batch_size,
        )
        .unwrap()
    }

    fn codelists() -> MockDatasetClient {
        MockDatasetClient::new().codelists(&[("year", "T1"), ("league", "T2")])
    }

    #[tokio::test]
    async fn delivers_options_summary_and_event_in_order() {
        let body = format!(
            "{HEADER}20,,Year,2016/17,PL01,Premier-League\n21,,Year,2016/17,PL02,Championship\n"
        );
        let dataset = codelists();
        let producer = MockEventProducer::new();

        let instance_id = handler(&body, &dataset, &producer, 2)
            .handle(&payload(
                "https://s3-eu-west-1.amazonaws.com/bucket/file.csv",
                "inst-1",
            ))
            .await
            .unwrap();
        assert_eq!(instance_id, "inst-1");

        let calls = dataset.calls();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[0], DatasetCall::GetCodelists("inst-1".to_owned()));
        match &calls[1] {
            DatasetCall::SendOptions(_, batch) => {
                let values: Vec<_> = batch.iter().map(|o| o.value.as_str()).collect();
                assert_eq!(values, ["2016/17", "PL01"]);
            }
            other => panic!("unexpected call {other:?}"),
        }
        match &calls[2] {
            DatasetCall::SendOptions(_, batch) => {
                assert_eq!(batch.len(), 1);
                assert_eq!(batch[0].value, "PL02");
            }
            other => panic!("unexpected call {other:?}"),
        }
        match &calls[3] {
            DatasetCall::SubmitSummary(id, summary) => {
                assert_eq!(id, "inst-1");
                assert_eq!(summary.total_observations, 2);
                assert_eq!(summary.headers.len(), 6);
                assert_eq!(summary.headers[0], "V4_2");
            }
            other => panic!("unexpected call {other:?}"),
        }

        assert_eq!(
            producer.events(),
            vec![ExtractionCompleteEvent {
                file_url: "s3://bucket/file.csv".to_owned(),
                instance_id: "inst-1".to_owned(),
            }]
        );
    }

    #[tokio::test]
    async fn malformed_message_has_no_instance() {
        let dataset = codelists();
        let producer = MockEventProducer::new();

        let err = handler(HEADER, &dataset, &producer, 10)
            .handle(b"\x01garbage")
            .await
            .unwrap_err();

        assert_eq!(err.instance_id, None);
        assert!(matches!(err.source, PipelineError::Decode(_)));
        assert!(dataset.calls().is_empty());
    }

    #[tokio::test]
    async fn missing_value_stops_the_file() {
        let body = format!("{HEADER}20,,Year,2015/16,,\n");
        let dataset = codelists();
        let producer = MockEventProducer::new();

        let err = handler(&body, &dataset, &producer, 10)
            .handle(&payload("s3://bucket/file.csv", "inst-2"))
            .await
            .unwrap_err();

        assert_eq!(err.instance_id.as_deref(), Some("inst-2"));
        assert!(matches!(
            err.source,
            PipelineError::Extract(ExtractError::MissingDimensionValue { .. })
        ));
        assert_eq!(dataset.calls().len(), 1);
        assert!(producer.events().is_empty());
    }

    #[tokio::test]
    async fn unmapped_dimension_sends_nothing() {
        let body = format!("{HEADER}20,,Year,2016/17,PL01,Premier-League\n");
        let dataset = MockDatasetClient::new().codelists(&[("year", "T1")]);
        let producer = MockEventProducer::new();

        let err = handler(&body, &dataset, &producer, 1)
            .handle(&payload("s3://bucket/file.csv", "inst-3"))
            .await
            .unwrap_err();

        assert!(matches!(
            err.source,
            PipelineError::Extract(ExtractError::UnmappedDimension(_))
        ));
        assert!(dataset
            .calls()
            .iter()
            .all(|call| matches!(call, DatasetCall::GetCodelists(_))));
    }

    #[tokio::test]
    async fn bad_header_and_missing_file() {
        let dataset = codelists();
        let producer = MockEventProducer::new();

        let err = handler("Year,League\n", &dataset, &producer, 10)
            .handle(&payload("s3://bucket/file.csv", "inst-4"))
            .await
            .unwrap_err();
        assert!(matches!(
            err.source,
            PipelineError::Header(HeaderError::MissingOffset(_))
        ));

        let err = handler("", &dataset, &producer, 10)
            .handle(&payload("s3://bucket/other.csv", "inst-4"))
            .await
            .unwrap_err();
        assert_eq!(err.instance_id.as_deref(), Some("inst-4"));
        assert!(matches!(err.source, PipelineError::Retrieve(_)));
    }

    #[tokio::test]
    async fn failed_summary_produces_no_event() {
        let body = format!("{HEADER}20,,Year,2016/17,PL01,Premier-League\n");
        let dataset = codelists().fail_summary(DatasetError::Status {
            method: Method::PUT,
            url: "http://dataset/instances/inst-5".to_owned(),
            status: StatusCode::NOT_FOUND,
        });
        let producer = MockEventProducer::new();

        let err = handler(&body, &dataset, &producer, 10)
            .handle(&payload("s3://bucket/file.csv", "inst-5"))
            .await
            .unwrap_err();

        assert!(matches!(err.source, PipelineError::Dataset(_)));
        assert!(producer.events().is_empty());
    }
}
