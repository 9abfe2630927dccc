//! In-memory collaborators for tests, always compiled so integration tests
//! can use them too.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time;

use async_trait::async_trait;
use bytes::Bytes;

use crate::consumer::{MessageSource, SourceError};
use crate::dataset::{DatasetClient, DatasetError, InstanceSummary};
use crate::event::ExtractionCompleteEvent;
use crate::extract::{CodelistMap, DimensionOption};
use crate::producer::{EventProducer, ProduceError};
use crate::reporter::{ErrorReporter, ReportError};
use crate::storage::{ObjectStore, S3Location, StorageError};

fn snapshot<T: Clone>(items: &Mutex<Vec<T>>) -> Vec<T> {
    items.lock().map(|items| items.clone()).unwrap_or_default()
}

fn record<T>(items: &Mutex<Vec<T>>, item: T) {
    if let Ok(mut items) = items.lock() {
        items.push(item);
    }
}

/// Object store serving canned responses, recording the customer key each
/// fetch was made with.
#[derive(Clone, Default)]
pub struct MockObjectStore {
    objects: HashMap<S3Location, Result<Bytes, StorageError>>,
    fetched_with: Arc<Mutex<Vec<(S3Location, Option<Vec<u8>>)>>>,
}

impl MockObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_object_ret(
        mut self,
        bucket: &str,
        key: &str,
        response: Result<Bytes, StorageError>,
    ) -> Self {
        self.objects.insert(S3Location::new(bucket, key), response);
        self
    }

    pub fn fetches(&self) -> Vec<(S3Location, Option<Vec<u8>>)> {
        snapshot(&self.fetched_with)
    }
}

#[async_trait]
impl ObjectStore for MockObjectStore {
    async fn get_object(
        &self,
        location: &S3Location,
        customer_key: Option<&[u8]>,
    ) -> Result<Bytes, StorageError> {
        record(
            &self.fetched_with,
            (location.clone(), customer_key.map(<[u8]>::to_vec)),
        );
        match self.objects.get(location) {
            Some(response) => response.clone(),
            None => Err(StorageError::NotFound(location.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatasetCall {
    GetCodelists(String),
    SendOptions(String, Vec<DimensionOption>),
    SubmitSummary(String, InstanceSummary),
}

/// Dataset API double recording every call in order.
#[derive(Clone, Default)]
pub struct MockDatasetClient {
    codelists: CodelistMap,
    calls: Arc<Mutex<Vec<DatasetCall>>>,
    summary_failure: Arc<Mutex<Option<DatasetError>>>,
}

impl MockDatasetClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn codelists(mut self, codelists: &[(&str, &str)]) -> Self {
        self.codelists = codelists
            .iter()
            .map(|(name, id)| (name.to_string(), id.to_string()))
            .collect();
        self
    }

    /// The next summary submission fails with `error`.
    pub fn fail_summary(self, error: DatasetError) -> Self {
        if let Ok(mut failure) = self.summary_failure.lock() {
            *failure = Some(error);
        }
        self
    }

    pub fn calls(&self) -> Vec<DatasetCall> {
        snapshot(&self.calls)
    }
}

#[async_trait]
impl DatasetClient for MockDatasetClient {
    async fn get_codelists(&self, instance_id: &str) -> Result<CodelistMap, DatasetError> {
        record(&self.calls, DatasetCall::GetCodelists(instance_id.to_owned()));
        Ok(self.codelists.clone())
    }

    async fn send_options(
        &self,
        instance_id: &str,
        batch: &[DimensionOption],
    ) -> Result<(), DatasetError> {
        record(
            &self.calls,
            DatasetCall::SendOptions(instance_id.to_owned(), batch.to_vec()),
        );
        Ok(())
    }

    async fn submit_summary(
        &self,
        instance_id: &str,
        summary: &InstanceSummary,
    ) -> Result<(), DatasetError> {
        record(
            &self.calls,
            DatasetCall::SubmitSummary(instance_id.to_owned(), summary.clone()),
        );
        let failure = self
            .summary_failure
            .lock()
            .ok()
            .and_then(|mut failure| failure.take());
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[derive(Clone, Default)]
pub struct MockEventProducer {
    events: Arc<Mutex<Vec<ExtractionCompleteEvent>>>,
}

impl MockEventProducer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ExtractionCompleteEvent> {
        snapshot(&self.events)
    }
}

#[async_trait]
impl EventProducer for MockEventProducer {
    async fn extraction_complete(
        &self,
        event: &ExtractionCompleteEvent,
    ) -> Result<(), ProduceError> {
        record(&self.events, event.clone());
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MockErrorReporter {
    reports: Arc<Mutex<Vec<(String, String)>>>,
}

impl MockErrorReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(instance_id, message)` of every report, in order.
    pub fn reports(&self) -> Vec<(String, String)> {
        snapshot(&self.reports)
    }
}

#[async_trait]
impl ErrorReporter for MockErrorReporter {
    async fn report(&self, instance_id: &str, message: &str) -> Result<(), ReportError> {
        record(
            &self.reports,
            (instance_id.to_owned(), message.to_owned()),
        );
        Ok(())
    }
}

/// Hands out the given payloads in order, acknowledged by their index, then
/// waits forever.
#[derive(Clone)]
pub struct MockMessageSource {
    pending: Arc<Mutex<VecDeque<(Vec<u8>, u64)>>>,
    total: usize,
    polls: Arc<Mutex<Vec<u64>>>,
    acknowledged: Arc<Mutex<Vec<u64>>>,
}

impl MockMessageSource {
    pub fn new(payloads: &[&[u8]]) -> Self {
        let pending = payloads
            .iter()
            .zip(0u64..)
            .map(|(payload, index)| (payload.to_vec(), index))
            .collect();
        Self {
            pending: Arc::new(Mutex::new(pending)),
            total: payloads.len(),
            polls: Arc::default(),
            acknowledged: Arc::default(),
        }
    }

    /// Number of messages handed out.
    pub fn polls(&self) -> usize {
        snapshot(&self.polls).len()
    }

    pub fn acknowledged(&self) -> Vec<u64> {
        snapshot(&self.acknowledged)
    }

    /// Resolves once every payload has been acknowledged.
    pub async fn wait_until_drained(&self) {
        while self.acknowledged().len() < self.total {
            tokio::time::sleep(time::Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl MessageSource for MockMessageSource {
    type Ack = u64;

    async fn next(&self) -> Result<(Vec<u8>, u64), SourceError> {
        let message = self
            .pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.pop_front());
        match message {
            Some(message) => {
                record(&self.polls, message.1);
                Ok(message)
            }
            None => std::future::pending().await,
        }
    }

    fn acknowledge(&self, ack: u64) -> Result<(), SourceError> {
        record(&self.acknowledged, ack);
        Ok(())
    }
}
