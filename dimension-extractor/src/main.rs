//! Consume file announcements, extract their dimensions into the dataset API.
use std::sync::Arc;

use anyhow::{anyhow, Context};
use aws_config::BehaviorVersion;
use common_kafka::kafka_consumer::SingleTopicConsumer;
use common_kafka::kafka_producer::create_kafka_producer;
use envconfig::Envconfig;
use health::HealthRegistry;
use time::Duration;
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use dimension_extractor::api::{router, serve, setup_metrics_recorder};
use dimension_extractor::config::Config;
use dimension_extractor::consumer::{ConsumerLoop, LoopExit};
use dimension_extractor::dataset::HttpDatasetClient;
use dimension_extractor::handler::FileHandler;
use dimension_extractor::identity::check_identity;
use dimension_extractor::producer::KafkaEventProducer;
use dimension_extractor::reporter::KafkaErrorReporter;
use dimension_extractor::retriever::{FileRetriever, KeyStore};
use dimension_extractor::storage::S3ObjectStore;
use dimension_extractor::vault::VaultClient;

async fn wait_for_shutdown_signal() -> Result<(), std::io::Error> {
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::init_from_env().context("invalid configuration")?;
    config.validate()?;
    info!(?config, "starting dimension extractor");

    let liveness = HealthRegistry::new("liveness");
    let recorder = setup_metrics_recorder()?;

    let consumer = SingleTopicConsumer::new(
        &config.kafka,
        &config.consumer,
        liveness.register("kafka_consumer", Duration::seconds(30)),
    )
    .context("failed to create kafka consumer")?;
    let completion_producer = create_kafka_producer(
        &config.kafka,
        liveness.register("completion_producer", Duration::seconds(30)),
    )
    .await
    .context("failed to create completion producer")?;
    let report_producer = create_kafka_producer(
        &config.kafka,
        liveness.register("report_producer", Duration::seconds(30)),
    )
    .await
    .context("failed to create error reporter producer")?;

    let producer = Arc::new(KafkaEventProducer::new(
        completion_producer,
        &config.dimensions_extracted_topic,
    )?);
    let reporter = Arc::new(KafkaErrorReporter::new(
        report_producer,
        &config.event_reporter_topic,
    )?);

    let aws = aws_config::defaults(BehaviorVersion::latest())
        .region(aws_config::Region::new(config.aws_region.clone()))
        .load()
        .await;
    let store = Arc::new(S3ObjectStore::new(aws_sdk_s3::Client::new(&aws)));
    let mut retriever = FileRetriever::new(store).expected_buckets(config.bucket_names.0.clone());
    if config.encryption_disabled {
        warn!("encryption disabled, files are read without a decryption key");
    } else {
        let vault = VaultClient::new(
            &config.vault_addr,
            &config.vault_token,
            config.request_timeout.0,
        )?;
        retriever = retriever.with_encryption(KeyStore {
            secrets: Arc::new(vault),
            vault_path: config.vault_path.clone(),
        });
    }

    let dataset = HttpDatasetClient::new(
        &config.dataset_api_url,
        &config.service_auth_token,
        config.request_timeout.0,
        config.retry_policy(),
    )?;
    let handler = FileHandler::new(
        Arc::new(retriever),
        Arc::new(dataset),
        producer.clone(),
        config.dimension_batch_size,
    )?
    .time_column(config.time_column_index);

    let server_shutdown = CancellationToken::new();
    let app = router(liveness.clone(), recorder);
    let bind = config.bind();
    let server_token = server_shutdown.clone();
    let server = tokio::spawn(async move { serve(app, &bind, server_token).await });
    info!("serving health and metrics on {}", config.bind());

    let zebedee_url = config.zebedee_url.clone();
    let service_token = config.service_auth_token.clone();
    let request_timeout = config.request_timeout.0;
    let authorization =
        async move { check_identity(&zebedee_url, &service_token, request_timeout).await };

    let loop_shutdown = CancellationToken::new();
    let consumer_loop = ConsumerLoop::new(
        consumer.clone(),
        Arc::new(handler),
        reporter.clone(),
        // processing a file may sit in retry backoff for a while
        liveness.register("consumer_loop", Duration::minutes(5)),
    );
    let mut loop_done = tokio::spawn(consumer_loop.run(authorization, loop_shutdown.clone()));

    let early_exit = tokio::select! {
        signal = wait_for_shutdown_signal() => {
            signal.context("failed to install signal handlers")?;
            None
        }
        exit = &mut loop_done => Some(exit),
    };

    let grace = config.graceful_shutdown_timeout.0;
    let shutdown = async {
        loop_shutdown.cancel();
        let exit = match early_exit {
            Some(exit) => exit,
            None => loop_done.await,
        };
        match &exit {
            Ok(exit) => info!(?exit, "consumer loop done"),
            Err(e) => error!("consumer loop panicked: {}", e),
        }

        let flush_producer = producer.clone();
        match tokio::task::spawn_blocking(move || flush_producer.flush(grace)).await {
            Ok(Ok(())) => info!("completion producer flushed"),
            Ok(Err(e)) => error!("failed to flush completion producer: {}", e),
            Err(e) => error!("completion producer flush task failed: {}", e),
        }
        let flush_reporter = reporter.clone();
        match tokio::task::spawn_blocking(move || flush_reporter.flush(grace)).await {
            Ok(Ok(())) => info!("error reporter flushed"),
            Ok(Err(e)) => error!("failed to flush error reporter: {}", e),
            Err(e) => error!("error reporter flush task failed: {}", e),
        }

        let closing = consumer.clone();
        match tokio::task::spawn_blocking(move || {
            let committed = closing.commit();
            closing.unsubscribe();
            committed
        })
        .await
        {
            Ok(Ok(())) => info!("consumer offsets committed"),
            Ok(Err(e)) => error!("failed to commit consumer offsets: {}", e),
            Err(e) => error!("consumer close task failed: {}", e),
        }

        server_shutdown.cancel();
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("http server failed: {}", e),
            Err(e) => error!("http server task failed: {}", e),
        }
        exit
    };

    match tokio::time::timeout(grace, shutdown).await {
        Ok(Ok(LoopExit::Shutdown)) => {
            info!("graceful shutdown complete");
            Ok(())
        }
        Ok(Ok(exit)) => Err(anyhow!("consumer loop stopped without consuming: {:?}", exit)),
        Ok(Err(e)) => Err(anyhow!("consumer loop failed: {}", e)),
        Err(_) => {
            error!("graceful shutdown timed out after {:?}, exiting", grace);
            std::process::exit(1)
        }
    }
}
