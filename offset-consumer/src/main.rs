use std::future::ready;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use offset_consumer::broker::{Broker, KafkaBroker};
use offset_consumer::config::Config;
use offset_consumer::handler::{
    MarkOffsetBatchTx, MessageHandlerBatch, MessageHandlerBatchTx, MessageHandlerBatchTxFn,
    MessageHandlerBatchTxList, MessageHandlerBatchTxMetrics, MessageHandlerBatchTxUpdate,
};
use offset_consumer::log_sampler::{SamplerFactory, TimeSamplerFactory};
use offset_consumer::metrics::KafkaMetrics;
use offset_consumer::offset_manager::{
    http, GroupOffsetManager, OffsetManager, StoreOffsetManager,
};
use offset_consumer::offset_store::KvOffsetStore;
use offset_consumer::run::{Restart, Trigger};
use offset_consumer::store::{BucketName, Db, RocksDb, Tx};
use offset_consumer::{Consumer, HighWaterMarkConsumer, Message, OffsetConsumer};

const BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 50.0, 100.0, 250.0,
];

pub async fn index() -> &'static str {
    "offset consumer"
}

fn setup_metrics_recorder() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .set_buckets(BUCKETS)
        .context("invalid histogram buckets")?
        .install_recorder()
        .context("install prometheus recorder failed")?;
    Ok(handle)
}

fn start_server(config: &Config, router: Router) -> JoinHandle<()> {
    let bind = config.bind_address();
    tokio::task::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(&bind).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(%bind, error = ?e, "bind http server failed");
                return;
            }
        };
        if let Err(e) = axum::serve(listener, router).await {
            error!(error = ?e, "http server failed");
        }
    })
}

/// Copies every message into the topic's data bucket: an empty value
/// deletes the key. With `offsets` the next offset is written in the same
/// transaction.
fn sync_handler(
    db: Arc<dyn Db>,
    offsets: Option<Arc<KvOffsetStore>>,
    bucket: BucketName,
    metrics: Arc<KafkaMetrics>,
) -> Arc<dyn MessageHandlerBatch> {
    let writer = MessageHandlerBatchTxFn::new(move |tx: &dyn Tx, msgs: &[Message]| {
        let data = tx.create_bucket_if_not_exists(&bucket)?;
        for msg in msgs {
            if msg.value.is_empty() {
                data.delete(&msg.key)?;
            } else {
                data.put(&msg.key, &msg.value)?;
            }
        }
        Ok(())
    });
    let writer: Arc<dyn MessageHandlerBatchTx> =
        Arc::new(MessageHandlerBatchTxMetrics::new(Arc::new(writer), metrics));

    let mut handlers = vec![writer];
    if let Some(offsets) = offsets {
        let mark: Arc<dyn MessageHandlerBatchTx> = Arc::new(MarkOffsetBatchTx::new(offsets));
        handlers.push(mark);
    }
    Arc::new(MessageHandlerBatchTxUpdate::new(
        db,
        Arc::new(MessageHandlerBatchTxList::new(handlers)),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting offset consumer");

    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables.")?;
    info!("Configuration loaded: {:?}", config);

    let topic = config.topic();
    let group = config.group();
    let initial_offset = config.initial_offset()?;
    let batch_size = config.batch_size()?;

    let recorder = setup_metrics_recorder()?;
    let metrics = Arc::new(KafkaMetrics::new());
    let sampler_factory: Arc<dyn SamplerFactory> =
        Arc::new(TimeSamplerFactory::new(config.log_sample_interval()));

    let broker: Arc<dyn Broker> = Arc::new(
        KafkaBroker::new(
            config.brokers(),
            config.kafka_tls,
            &config.kafka_client_id,
            config.kafka_timeout(),
        )
        .context("Failed to create kafka broker client")?,
    );

    let db: Arc<dyn Db> = Arc::new(
        RocksDb::open(config.offset_store_path_buf())
            .with_context(|| format!("Failed to open store at {}", config.offset_store_path))?,
    );
    let offsets = Arc::new(match &group {
        Some(group) => KvOffsetStore::new_group(db.clone(), group),
        None => KvOffsetStore::new(db.clone()),
    });

    let group_manager = match (&group, config.kafka_group_commit) {
        (Some(group), true) => Some(Arc::new(GroupOffsetManager::new(
            broker.clone(),
            group.clone(),
            initial_offset,
        ))),
        (None, true) => anyhow::bail!("KAFKA_GROUP_COMMIT requires KAFKA_CONSUMER_GROUP"),
        _ => None,
    };
    let manager: Arc<dyn OffsetManager> = match &group_manager {
        Some(group_manager) => group_manager.clone(),
        None => Arc::new(StoreOffsetManager::new(offsets.clone(), initial_offset)),
    };
    let handler = sync_handler(
        db.clone(),
        group_manager.is_none().then(|| offsets.clone()),
        BucketName::from_strings(&["data", topic.as_str()]),
        metrics.clone(),
    );

    let shutdown = CancellationToken::new();
    let restart = Arc::new(Restart::new());
    let drained = Trigger::new();

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(|| ready("ok")))
        .route("/metrics", get(move || ready(recorder.render())))
        .merge(http::router(manager.clone(), restart.clone()));
    let server_handle = start_server(&config, router);
    info!("Started http server on {}", config.bind_address());

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = ?e, "listen for shutdown signal failed");
                return;
            }
            info!("shutdown signal received");
            shutdown.cancel();
        });
    }

    let result = loop {
        let run = restart.next(&shutdown);
        let consumer: Box<dyn Consumer> = if config.drain {
            Box::new(
                HighWaterMarkConsumer::new(
                    broker.clone(),
                    topic.clone(),
                    manager.clone(),
                    handler.clone(),
                    batch_size,
                    Arc::new(drained.clone()),
                )
                .with_metrics(metrics.clone())
                .with_sampler_factory(sampler_factory.clone()),
            )
        } else {
            Box::new(
                OffsetConsumer::new_batch(
                    broker.clone(),
                    topic.clone(),
                    manager.clone(),
                    handler.clone(),
                    batch_size,
                )
                .with_metrics(metrics.clone())
                .with_sampler_factory(sampler_factory.clone()),
            )
        };

        let watcher = {
            let run = run.clone();
            let drained = drained.clone();
            tokio::spawn(async move {
                drained.fired().await;
                info!("topic drained, stopping consumer");
                run.cancel();
            })
        };
        let result = consumer.consume(&run).await;
        watcher.abort();

        if let Err(e) = result {
            break Err(e);
        }
        if shutdown.is_cancelled() || drained.is_fired() {
            break Ok(());
        }
        info!(%topic, "restarting consumer");
    };

    if let Some(group_manager) = group_manager {
        if let Err(e) = group_manager.close().await {
            warn!(error = ?e, "close group offset manager failed");
        }
    }
    server_handle.abort();

    if let Err(e) = &result {
        error!(error = ?e, "offset consumer failed");
    }
    result
}
