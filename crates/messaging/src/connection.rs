use crate::{Config, Error};
use rdkafka::consumer::{BaseConsumer, Consumer as _};
use rdkafka::ClientConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Broker link manager. Owns the bootstrap configuration and a metadata
/// probe handle, and runs a watchdog that observes link loss and recovery.
/// On a loss-to-recovery transition it broadcasts so producers and consumers
/// can rebuild per-session state.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    base: ClientConfig,
    probe: BaseConsumer,
    notify: broadcast::Sender<()>,
    cancel: CancellationToken,
    closed: AtomicBool,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Establish the link: the initial metadata probe must succeed.
    pub async fn connect(config: Config) -> Result<Self, Error> {
        let mut base = ClientConfig::new();
        base.set("bootstrap.servers", config.brokers.join(","));
        if let Some(client_id) = &config.client_id {
            base.set("client.id", client_id);
        }

        let probe: BaseConsumer = base.create()?;

        let inner = Arc::new(Inner {
            config,
            base,
            probe,
            notify: broadcast::channel(16).0,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            watchdog: Mutex::new(None),
        });

        probe_metadata(inner.clone()).await?;

        let watchdog = tokio::spawn(watchdog(inner.clone()));
        *inner.watchdog.lock().unwrap() = Some(watchdog);

        Ok(Self { inner })
    }

    /// A fresh client configuration for allocating a producer or consumer
    /// session over this link.
    pub fn client_config(&self) -> Result<ClientConfig, Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(self.inner.base.clone())
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Subscribe to reconnect notifications.
    pub fn notify(&self) -> broadcast::Receiver<()> {
        self.inner.notify.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Probe broker reachability: succeeds if at least one broker answers a
    /// metadata request.
    pub async fn ping(&self) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        probe_metadata(self.inner.clone()).await
    }

    /// Close the link. Idempotent; all further operations return
    /// `Error::Closed` and the watchdog exits.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cancel.cancel();
        let watchdog = self.inner.watchdog.lock().unwrap().take();
        if let Some(watchdog) = watchdog {
            let _ = watchdog.await;
        }
    }
}

async fn probe_metadata(inner: Arc<Inner>) -> Result<(), Error> {
    let timeout = inner.config.metadata_timeout;
    let metadata = tokio::task::spawn_blocking(move || {
        inner
            .probe
            .fetch_metadata(None, timeout)
            .map(|metadata| metadata.brokers().len())
    })
    .await
    .expect("metadata probe task");

    match metadata {
        Ok(brokers) if brokers > 0 => Ok(()),
        Ok(_) => Err(rdkafka::error::KafkaError::MetadataFetch(
            rdkafka::types::RDKafkaErrorCode::AllBrokersDown,
        )
        .into()),
        Err(err) => Err(err.into()),
    }
}

/// Re-probes the link at the reconnect interval. Broadcasts on a
/// down-to-up transition; exits once the bounded attempt budget is spent.
async fn watchdog(inner: Arc<Inner>) {
    let interval = inner.config.reconnect_interval;
    let max_attempts = inner.config.max_reconnect_attempts;
    let mut healthy = true;
    let mut attempts = 0i32;

    loop {
        tokio::select! {
            () = inner.cancel.cancelled() => return,
            () = tokio::time::sleep(interval) => (),
        }

        match probe_metadata(inner.clone()).await {
            Ok(()) => {
                if !healthy {
                    tracing::info!("broker link restored");
                    let _ = inner.notify.send(());
                }
                healthy = true;
                attempts = 0;
            }
            Err(error) => {
                attempts += 1;
                tracing::warn!(%error, attempts, "broker link probe failed");
                healthy = false;
                if max_attempts >= 0 && attempts > max_attempts {
                    tracing::error!(max_attempts, "reconnect budget exhausted; watchdog exiting");
                    return;
                }
            }
        }
    }
}
