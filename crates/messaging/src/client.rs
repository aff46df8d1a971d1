use crate::{Config, Connection, Consumer, Error, Producer};
use endpoint::Context;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Lifecycle aggregate: one shared broker link, plus every producer and
/// consumer constructed over it. Shutdown stops inbound flow first
/// (consumers), then lets pending sends finish (producers), then drops the
/// link.
pub struct Client {
    connection: Connection,
    producers: Mutex<Vec<Arc<Producer>>>,
    consumers: Mutex<Vec<Arc<Consumer>>>,
    closed: AtomicBool,
}

impl Client {
    pub async fn connect(config: Config) -> Result<Self, Error> {
        Ok(Self {
            connection: Connection::connect(config).await?,
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Construct and register a producer over the shared link.
    pub fn producer(&self) -> Result<Arc<Producer>, Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let producer = Arc::new(Producer::new(&self.connection)?);
        self.producers.lock().unwrap().push(producer.clone());
        Ok(producer)
    }

    /// Construct and register a consumer for `group_id`. When a dead-letter
    /// policy is configured, the consumer gets its own DLQ producer over the
    /// same link.
    pub fn consumer(&self, group_id: &str) -> Result<Arc<Consumer>, Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        let dlq = match self.connection.config().consumer.dlq {
            Some(_) => {
                let producer = Arc::new(Producer::new(&self.connection)?);
                self.producers.lock().unwrap().push(producer.clone());
                Some(producer as Arc<dyn crate::DlqSink>)
            }
            None => None,
        };

        let consumer = Arc::new(Consumer::new(&self.connection, group_id, dlq)?);
        self.consumers.lock().unwrap().push(consumer.clone());
        Ok(consumer)
    }

    /// Succeeds if at least one broker answers a metadata probe.
    pub async fn health_check(&self, cx: &Context) -> Result<(), Error> {
        tokio::select! {
            () = cx.done() => Err(cx.err().unwrap_or(endpoint::Error::Cancelled).into()),
            result = self.connection.ping() => result,
        }
    }

    /// Ordered shutdown: consumers, then producers, then the link. Each phase
    /// runs its members concurrently and completes before the next begins;
    /// the whole sequence is bounded by `cx`. Idempotent.
    pub async fn shutdown(&self, cx: &Context) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let consumers = std::mem::take(&mut *self.consumers.lock().unwrap());
        let drain = futures::future::join_all(
            consumers.iter().map(|consumer| consumer.close()),
        );
        tokio::select! {
            () = cx.done() => {
                return Err(cx.err().unwrap_or(endpoint::Error::Cancelled).into())
            }
            _ = drain => (),
        }

        let producers = std::mem::take(&mut *self.producers.lock().unwrap());
        let flush = futures::future::join_all(producers.into_iter().map(|producer| {
            tokio::task::spawn_blocking(move || producer.close())
        }));
        tokio::select! {
            () = cx.done() => {
                return Err(cx.err().unwrap_or(endpoint::Error::Cancelled).into())
            }
            _ = flush => (),
        }

        self.connection.close().await;
        Ok(())
    }
}
