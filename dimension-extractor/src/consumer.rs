//! The loop taking file announcements off Kafka, one at a time.
//!
//! ```text
//! AwaitingAuthorization -> Polling <-> Processing
//!          |                  |
//!          |                  +-> ShuttingDown -> Stopped
//!          +--------------------------------------> Stopped
//! ```
//!
//! Every received message is acknowledged once its processing ends, whatever
//! the outcome. Failed files are not redelivered; failures with a known
//! instance are handed to the error reporter instead.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time;

use async_trait::async_trait;
use common_kafka::kafka_consumer::{Offset, SingleTopicConsumer};
use health::HealthHandle;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::handler::MessageHandler;
use crate::reporter::ErrorReporter;

/// Heartbeat while waiting for or processing messages, well under the
/// liveness deadline.
const HEARTBEAT_INTERVAL: time::Duration = time::Duration::from_secs(10);
/// Pause before polling again after the source failed.
const RECEIVE_ERROR_BACKOFF: time::Duration = time::Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("failed to receive message: {0}")]
    Receive(String),
    #[error("failed to acknowledge message: {0}")]
    Acknowledge(String),
}

/// Where messages come from. `Ack` identifies a received message when it is
/// acknowledged.
#[async_trait]
pub trait MessageSource: Send + Sync {
    type Ack: Send + fmt::Debug;

    async fn next(&self) -> Result<(Vec<u8>, Self::Ack), SourceError>;

    fn acknowledge(&self, ack: Self::Ack) -> Result<(), SourceError>;
}

#[async_trait]
impl MessageSource for SingleTopicConsumer {
    type Ack = Offset;

    async fn next(&self) -> Result<(Vec<u8>, Offset), SourceError> {
        self.recv()
            .await
            .map_err(|e| SourceError::Receive(e.to_string()))
    }

    fn acknowledge(&self, offset: Offset) -> Result<(), SourceError> {
        offset
            .store()
            .map_err(|e| SourceError::Acknowledge(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    AwaitingAuthorization,
    Polling,
    Processing,
    ShuttingDown,
    Stopped,
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// Cancelled before authorization completed, nothing was consumed
    CancelledBeforeAuthorization,
    /// The authorization check failed, nothing was consumed
    Unauthorized,
    /// Cancelled after consuming, the in-flight message was finished
    Shutdown,
}

pub struct ConsumerLoop<S: MessageSource> {
    source: S,
    handler: Arc<dyn MessageHandler>,
    reporter: Arc<dyn ErrorReporter>,
    liveness: HealthHandle,
    heartbeat_interval: time::Duration,
    state: LoopState,
}

impl<S: MessageSource> ConsumerLoop<S> {
    pub fn new(
        source: S,
        handler: Arc<dyn MessageHandler>,
        reporter: Arc<dyn ErrorReporter>,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            source,
            handler,
            reporter,
            liveness,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            state: LoopState::AwaitingAuthorization,
        }
    }

    pub fn heartbeat_interval(mut self, interval: time::Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    fn transition(&mut self, next: LoopState) {
        debug!(from = ?self.state, to = ?next, "consumer loop state");
        self.state = next;
    }

    /// Consume until `shutdown` is cancelled. Nothing is polled before
    /// `authorization` resolves successfully.
    pub async fn run<A, E>(mut self, authorization: A, shutdown: CancellationToken) -> LoopExit
    where
        A: Future<Output = Result<(), E>>,
        E: fmt::Display,
    {
        self.transition(LoopState::AwaitingAuthorization);
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!("shutdown requested before authorization, consumer loop not started");
                self.transition(LoopState::Stopped);
                return LoopExit::CancelledBeforeAuthorization;
            }
            authorized = authorization => {
                if let Err(e) = authorized {
                    error!("authorization failed, consumer loop not started: {}", e);
                    self.transition(LoopState::Stopped);
                    return LoopExit::Unauthorized;
                }
            }
        }

        info!("consumer loop authorized, polling for messages");
        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);

        loop {
            self.transition(LoopState::Polling);

            let received = {
                let next = self.source.next();
                tokio::pin!(next);
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break None,
                        _ = heartbeat.tick() => self.liveness.report_healthy(),
                        received = &mut next => break Some(received),
                    }
                }
            };

            let (payload, ack) = match received {
                None => break,
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    warn!("{}", e);
                    metrics::counter!("dimension_extractor_receive_errors_total").increment(1);
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(RECEIVE_ERROR_BACKOFF) => continue,
                    }
                }
            };

            self.transition(LoopState::Processing);
            metrics::counter!("dimension_extractor_messages_consumed_total").increment(1);
            {
                // a file may take minutes, keep reporting while it is processed
                let processing = self.process(&payload);
                tokio::pin!(processing);
                loop {
                    tokio::select! {
                        biased;
                        _ = &mut processing => break,
                        _ = heartbeat.tick() => self.liveness.report_healthy(),
                    }
                }
            }

            debug!(?ack, "acknowledging message");
            if let Err(e) = self.source.acknowledge(ack) {
                error!("{}", e);
            }
            self.liveness.report_healthy();
        }

        self.transition(LoopState::ShuttingDown);
        info!("consumer loop stopped taking messages");
        self.transition(LoopState::Stopped);
        LoopExit::Shutdown
    }

    async fn process(&self, payload: &[u8]) {
        let error = match self.handler.handle(payload).await {
            Ok(instance_id) => {
                info!(instance_id, "file processed");
                metrics::counter!("dimension_extractor_files_processed_total").increment(1);
                return;
            }
            Err(error) => error,
        };

        metrics::counter!("dimension_extractor_files_failed_total").increment(1);
        match &error.instance_id {
            Some(instance_id) => {
                error!(instance_id, "failed to process file: {}", error);
                if let Err(e) = self.reporter.report(instance_id, &error.to_string()).await {
                    error!(instance_id, "failed to report error: {}", e);
                }
            }
            None => error!("discarding malformed message: {}", error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PipelineError, ProcessingError};
    use crate::extract::ExtractError;
    use crate::mock::{MockErrorReporter, MockMessageSource};
    use common_kafka::avro::CodecError;
    use health::HealthRegistry;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Succeeds for `ok`, fails with an instance for `bad`, anything else is malformed.
    struct ScriptedHandler;

    #[async_trait]
    impl MessageHandler for ScriptedHandler {
        async fn handle(&self, payload: &[u8]) -> Result<String, ProcessingError> {
            match payload {
                b"ok" => Ok("inst-ok".to_owned()),
                b"bad" => Err(ProcessingError::for_instance(
                    "inst-bad",
                    ExtractError::UnmappedDimension("Sex".to_owned()),
                )),
                _ => Err(ProcessingError::malformed(CodecError::TrailingBytes(1))),
            }
        }
    }

    /// Signals when it starts, then takes a while to finish.
    struct SlowHandler(Arc<Notify>, time::Duration);

    #[async_trait]
    impl MessageHandler for SlowHandler {
        async fn handle(&self, _: &[u8]) -> Result<String, ProcessingError> {
            self.0.notify_one();
            tokio::time::sleep(self.1).await;
            Ok("inst-slow".to_owned())
        }
    }

    fn liveness() -> HealthHandle {
        HealthRegistry::new("liveness").register("consumer_loop", ::time::Duration::seconds(30))
    }

    #[tokio::test]
    async fn acknowledges_every_outcome() {
        let source = MockMessageSource::new(&[b"ok", b"bad", b"\x00junk"]);
        let reporter = MockErrorReporter::new();
        let shutdown = CancellationToken::new();
        let consumer = ConsumerLoop::new(
            source.clone(),
            Arc::new(ScriptedHandler),
            Arc::new(reporter.clone()),
            liveness(),
        );

        let handle = tokio::spawn(consumer.run(async { Ok::<(), Infallible>(()) }, shutdown.clone()));
        source.wait_until_drained().await;
        shutdown.cancel();

        assert_eq!(handle.await.unwrap(), LoopExit::Shutdown);
        assert_eq!(source.acknowledged(), vec![0, 1, 2]);

        let reports = reporter.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].0, "inst-bad");
        assert!(reports[0].1.contains("Sex"));
    }

    #[tokio::test]
    async fn cancelled_before_authorization_never_polls() {
        let source = MockMessageSource::new(&[b"ok"]);
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let exit = ConsumerLoop::new(
            source.clone(),
            Arc::new(ScriptedHandler),
            Arc::new(MockErrorReporter::new()),
            liveness(),
        )
        .run(std::future::pending::<Result<(), Infallible>>(), shutdown)
        .await;

        assert_eq!(exit, LoopExit::CancelledBeforeAuthorization);
        assert_eq!(source.polls(), 0);
    }

    #[tokio::test]
    async fn failed_authorization_never_polls() {
        let source = MockMessageSource::new(&[b"ok"]);

        let exit = ConsumerLoop::new(
            source.clone(),
            Arc::new(ScriptedHandler),
            Arc::new(MockErrorReporter::new()),
            liveness(),
        )
        .run(async { Err("401 Unauthorized") }, CancellationToken::new())
        .await;

        assert_eq!(exit, LoopExit::Unauthorized);
        assert_eq!(source.polls(), 0);
        assert!(source.acknowledged().is_empty());
    }

    #[tokio::test]
    async fn shutdown_finishes_the_message_in_flight() {
        let source = MockMessageSource::new(&[b"first", b"second"]);
        let started = Arc::new(Notify::new());
        let shutdown = CancellationToken::new();
        let consumer = ConsumerLoop::new(
            source.clone(),
            Arc::new(SlowHandler(started.clone(), time::Duration::from_millis(200))),
            Arc::new(MockErrorReporter::new()),
            liveness(),
        );
        assert_eq!(consumer.state(), LoopState::AwaitingAuthorization);

        let handle = tokio::spawn(consumer.run(async { Ok::<(), Infallible>(()) }, shutdown.clone()));
        started.notified().await;
        shutdown.cancel();

        assert_eq!(handle.await.unwrap(), LoopExit::Shutdown);
        // the first message completes and is acknowledged, the second is never taken
        assert_eq!(source.acknowledged(), vec![0]);
        assert_eq!(source.polls(), 1);
    }

    #[tokio::test]
    async fn stays_healthy_while_a_file_takes_long() {
        let registry = HealthRegistry::new("liveness");
        let source = MockMessageSource::new(&[b"large"]);
        let started = Arc::new(Notify::new());
        let shutdown = CancellationToken::new();
        let consumer = ConsumerLoop::new(
            source.clone(),
            Arc::new(SlowHandler(started.clone(), time::Duration::from_millis(600))),
            Arc::new(MockErrorReporter::new()),
            registry.register("consumer_loop", ::time::Duration::milliseconds(150)),
        )
        .heartbeat_interval(time::Duration::from_millis(20));

        let handle = tokio::spawn(consumer.run(async { Ok::<(), Infallible>(()) }, shutdown.clone()));
        started.notified().await;
        // well past the deadline, the handler is still busy
        tokio::time::sleep(time::Duration::from_millis(400)).await;
        assert!(source.acknowledged().is_empty());
        assert!(registry.get_status().healthy);

        shutdown.cancel();
        assert_eq!(handle.await.unwrap(), LoopExit::Shutdown);
        assert_eq!(source.acknowledged(), vec![0]);
    }

    /// Fails every receive, counting the attempts.
    #[derive(Clone, Default)]
    struct BrokenSource(Arc<AtomicUsize>);

    #[async_trait]
    impl MessageSource for BrokenSource {
        type Ack = ();

        async fn next(&self) -> Result<(Vec<u8>, ()), SourceError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(SourceError::Receive("broker down".to_owned()))
        }

        fn acknowledge(&self, _: ()) -> Result<(), SourceError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn receive_errors_back_off_until_shutdown() {
        let source = BrokenSource::default();
        let shutdown = CancellationToken::new();
        let consumer = ConsumerLoop::new(
            source.clone(),
            Arc::new(ScriptedHandler),
            Arc::new(MockErrorReporter::new()),
            liveness(),
        );

        let handle = tokio::spawn(consumer.run(async { Ok::<(), Infallible>(()) }, shutdown.clone()));
        tokio::time::sleep(RECEIVE_ERROR_BACKOFF * 3 + time::Duration::from_millis(500)).await;
        shutdown.cancel();

        assert_eq!(handle.await.unwrap(), LoopExit::Shutdown);
        let polls = source.0.load(Ordering::SeqCst);
        assert!((3..=5).contains(&polls), "polled {polls} times");
    }

    #[test]
    fn processing_error_displays_its_cause() {
        let error = ProcessingError::for_instance(
            "inst",
            ExtractError::UnmappedDimension("Sex".to_owned()),
        );
        assert!(matches!(error.source, PipelineError::Extract(_)));
        assert_eq!(error.to_string(), "dimension \"Sex\" has no code list on the instance");
    }
}
