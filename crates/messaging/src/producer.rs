use crate::{headers, Connection, Error, Message};
use endpoint::Context;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer as _};
use rdkafka::util::Timeout;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::Instrument;

/// Synchronous at-least-once producer. Sends wait for broker acknowledgment
/// under all-replica acks; the idempotent-producer flag deduplicates
/// session-internal retries. Compression and retry count are fixed
/// production defaults.
pub struct Producer {
    producer: FutureProducer,
    closed: AtomicBool,
}

impl Producer {
    pub(crate) fn new(connection: &Connection) -> Result<Self, Error> {
        let mut config = connection.client_config()?;
        config
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("compression.type", "snappy")
            .set("retries", "3")
            .set(
                "message.timeout.ms",
                connection
                    .config()
                    .producer
                    .message_timeout
                    .as_millis()
                    .to_string(),
            );

        Ok(Self {
            producer: config.create()?,
            closed: AtomicBool::new(false),
        })
    }

    /// Send one message and wait for the broker's acknowledgment. On success
    /// the returned message carries its assigned partition and offset.
    ///
    /// A context cancelled before the acknowledgment surfaces the context's
    /// error; the record may still land (duplicate delivery is possible, and
    /// application-level deduplication is the caller's concern).
    pub async fn send(&self, cx: &Context, message: Message) -> Result<Message, Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        message.validate()?;

        let span = tracing::info_span!(
            "messaging.send",
            topic = %message.topic,
            otel.kind = "producer",
        );

        let mut message = message;
        headers::inject_span(&span, &mut message.headers);

        let topic = message.topic.clone();
        let started = tokio::time::Instant::now();
        let result = self.send_inner(cx, &mut message).instrument(span).await;

        metrics::histogram!("messaging_send_duration_seconds", "topic" => topic.clone())
            .record(started.elapsed().as_secs_f64());
        match &result {
            Ok(()) => {
                metrics::counter!("messaging_send_total", "topic" => topic, "result" => "ok")
                    .increment(1)
            }
            Err(_) => {
                metrics::counter!("messaging_send_total", "topic" => topic, "result" => "error")
                    .increment(1)
            }
        }

        result.map(|()| message)
    }

    async fn send_inner(&self, cx: &Context, message: &mut Message) -> Result<(), Error> {
        let mut record: FutureRecord<'_, String, [u8]> =
            FutureRecord::to(&message.topic).payload(message.payload.as_ref());
        if let Some(key) = &message.key {
            record = record.key(key);
        }
        if !message.headers.is_empty() {
            record = record.headers(owned_headers(&message.headers));
        }

        let delivery = tokio::select! {
            () = cx.done() => {
                return Err(cx.err().unwrap_or(endpoint::Error::Cancelled).into())
            }
            delivery = self.producer.send(record, Timeout::Never) => delivery,
        };

        match delivery {
            Ok((partition, offset)) => {
                message.partition = Some(partition);
                message.offset = Some(offset);
                Ok(())
            }
            Err((error, _unsent)) => Err(error.into()),
        }
    }

    /// Send a batch; acknowledgments are awaited for every message and the
    /// returned messages preserve input order. The first failure fails the
    /// batch.
    pub async fn send_batch(
        &self,
        cx: &Context,
        messages: Vec<Message>,
    ) -> Result<Vec<Message>, Error> {
        if messages.is_empty() {
            return Err(Error::NilMessage);
        }
        for message in &messages {
            message.validate()?;
        }
        futures::future::try_join_all(
            messages.into_iter().map(|message| self.send(cx, message)),
        )
        .await
    }

    /// Flush pending deliveries and refuse further sends. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(error) = self.producer.flush(Timeout::After(std::time::Duration::from_secs(5)))
        {
            tracing::warn!(%error, "flush on producer close failed");
        }
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
    }
}

fn owned_headers(map: &BTreeMap<String, String>) -> OwnedHeaders {
    let mut headers = OwnedHeaders::new_with_capacity(map.len());
    for (key, value) in map {
        headers = headers.insert(Header {
            key,
            value: Some(value),
        });
    }
    headers
}

#[async_trait::async_trait]
impl crate::DlqSink for Producer {
    async fn send(&self, cx: &Context, message: Message) -> Result<Message, Error> {
        Producer::send(self, cx, message).await
    }
}
