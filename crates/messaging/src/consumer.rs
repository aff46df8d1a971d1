use crate::{headers, Connection, ConsumerConfig, Error, Handler, Message};
use endpoint::Context;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer as _, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::client::ClientContext;
use rdkafka::error::KafkaResult;
use rdkafka::message::{BorrowedMessage, Headers as _};
use rdkafka::{ClientConfig, Message as KafkaMessage, Offset, TopicPartitionList};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// Where dead-lettered messages go. Implemented by `Producer`; tests supply
/// their own sink.
#[async_trait::async_trait]
pub trait DlqSink: Send + Sync {
    async fn send(&self, cx: &Context, message: Message) -> Result<Message, Error>;
}

/// Group consumer with at-least-once delivery: the offset of a message is
/// committed only once its handler has succeeded or the message has been
/// routed to the dead-letter topic. Within a partition, messages reach the
/// handler in offset order.
pub struct Consumer {
    group_id: String,
    config: ConsumerConfig,
    client_config: ClientConfig,
    reconnect_interval: Duration,
    dlq: Option<Arc<dyn DlqSink>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    session: Arc<Mutex<Option<Arc<StreamConsumer<LoggingContext>>>>>,
    closed: AtomicBool,
}

impl Consumer {
    pub(crate) fn new(
        connection: &Connection,
        group_id: &str,
        dlq: Option<Arc<dyn DlqSink>>,
    ) -> Result<Self, Error> {
        if group_id.is_empty() {
            return Err(Error::EmptyGroup);
        }
        Ok(Self {
            group_id: group_id.to_string(),
            config: connection.config().consumer.clone(),
            client_config: connection.client_config()?,
            reconnect_interval: connection.config().reconnect_interval,
            dlq,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            session: Arc::new(Mutex::new(None)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Start background processing of `topics` and return immediately.
    /// Processing stops when `cx` is done or the consumer is closed.
    pub fn consume(
        &self,
        cx: &Context,
        topics: Vec<String>,
        handler: Handler,
    ) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        let mut config = self.client_config.clone();
        config
            .set("group.id", &self.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &self.config.offset_reset);

        let consumer: StreamConsumer<LoggingContext> =
            config.create_with_context(LoggingContext {
                group_id: self.group_id.clone(),
            })?;
        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topic_refs)?;

        let consumer = Arc::new(consumer);
        *self.session.lock().unwrap() = Some(consumer.clone());

        // Cancelling either the caller's context or the consumer cancels the loop.
        let token = self.cancel.child_token();
        {
            let (cx, token) = (cx.clone(), token.clone());
            tokio::spawn(async move {
                tokio::select! {
                    () = cx.done() => token.cancel(),
                    () = token.cancelled() => (),
                }
            });
        }

        self.tracker.spawn(supervise(
            consumer,
            Context::with_cancel(token),
            handler,
            self.config.clone(),
            self.dlq.clone(),
            self.group_id.clone(),
            self.reconnect_interval,
            self.session.clone(),
        ));
        Ok(())
    }

    /// Manually commit a delivered message's offset. Used by batch-processing
    /// callers which handle commits themselves; serialized through the
    /// session lock.
    pub fn commit_message(&self, message: &Message) -> Result<(), Error> {
        let session = self.session.lock().unwrap();
        let Some(consumer) = session.as_ref() else {
            return Err(Error::NoActiveSession);
        };

        let (partition, offset) = message
            .partition
            .zip(message.offset)
            .ok_or(Error::Uncommittable)?;

        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(&message.topic, partition, Offset::Offset(offset + 1))?;
        consumer.commit(&offsets, CommitMode::Async)?;
        Ok(())
    }

    /// Stop processing: the in-flight message drains (its retry loop finishes
    /// or aborts on the cancelled context) before this returns. Idempotent.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.session.lock().unwrap().take();
    }
}

/// Restarts the consume loop if it ever panics, at the reconnect interval.
#[allow(clippy::too_many_arguments)]
async fn supervise(
    consumer: Arc<StreamConsumer<LoggingContext>>,
    cx: Context,
    handler: Handler,
    config: ConsumerConfig,
    dlq: Option<Arc<dyn DlqSink>>,
    group_id: String,
    reconnect_interval: Duration,
    session: Arc<Mutex<Option<Arc<StreamConsumer<LoggingContext>>>>>,
) {
    loop {
        let run = tokio::spawn(run_loop(
            consumer.clone(),
            cx.clone(),
            handler.clone(),
            config.clone(),
            dlq.clone(),
            group_id.clone(),
            reconnect_interval,
        ));

        match run.await {
            Ok(()) => break,
            Err(join_error) if join_error.is_panic() => {
                tracing::error!(group = %group_id, "consume loop panicked; restarting");
                tokio::select! {
                    () = cx.done() => break,
                    () = tokio::time::sleep(reconnect_interval) => (),
                }
            }
            Err(_) => break,
        }
    }
    session.lock().unwrap().take();
}

async fn run_loop(
    consumer: Arc<StreamConsumer<LoggingContext>>,
    cx: Context,
    handler: Handler,
    config: ConsumerConfig,
    dlq: Option<Arc<dyn DlqSink>>,
    group_id: String,
    reconnect_interval: Duration,
) {
    loop {
        let received = tokio::select! {
            () = cx.done() => return,
            received = consumer.recv() => received,
        };

        match received {
            Ok(delivery) => {
                let message = from_borrowed(&delivery);
                match process(&cx, &handler, dlq.as_deref(), &config, &group_id, message).await
                {
                    Disposition::Commit => {
                        if let Err(error) =
                            consumer.commit_message(&delivery, CommitMode::Async)
                        {
                            tracing::warn!(%error, "offset commit failed");
                        }
                    }
                    Disposition::Skip => (),
                }
            }
            Err(error) => {
                tracing::warn!(%error, group = %group_id, "consumer poll failed");
                tokio::select! {
                    () = cx.done() => return,
                    () = tokio::time::sleep(reconnect_interval) => (),
                }
            }
        }
    }
}

/// What to do with the offset after the pipeline ran.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Disposition {
    Commit,
    Skip,
}

/// The per-message pipeline: linked consumer span, bounded exponential
/// retry, then dead-letter routing. Without a configured DLQ an exhausted
/// message is logged and skipped uncommitted; later commits subsume its
/// offset and it is redelivered only on rebalance.
pub(crate) async fn process(
    cx: &Context,
    handler: &Handler,
    dlq: Option<&dyn DlqSink>,
    config: &ConsumerConfig,
    group_id: &str,
    message: Message,
) -> Disposition {
    let span = tracing::info_span!(
        "messaging.process",
        topic = %message.topic,
        partition = message.partition,
        offset = message.offset,
        group = %group_id,
        otel.kind = "consumer",
    );
    span.set_parent(headers::extract_context(&message.headers));

    process_inner(cx, handler, dlq, config, group_id, message)
        .instrument(span)
        .await
}

async fn process_inner(
    cx: &Context,
    handler: &Handler,
    dlq: Option<&dyn DlqSink>,
    config: &ConsumerConfig,
    group_id: &str,
    message: Message,
) -> Disposition {
    let topic = message.topic.clone();
    let labels = [
        ("topic", topic.clone()),
        ("group", group_id.to_string()),
    ];
    let started = tokio::time::Instant::now();

    let mut last_error: Option<crate::BoxError> = None;
    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            metrics::counter!("messaging_retries_total", &labels).increment(1);
            let pause = config
                .retry_interval
                .saturating_mul(1u32 << (attempt - 1).min(31));
            tokio::select! {
                () = cx.done() => {
                    tracing::warn!("context done mid-retry; abandoning message");
                    return Disposition::Skip;
                }
                () = tokio::time::sleep(pause) => (),
            }
        }

        match handler(message.clone()).await {
            Ok(()) => {
                metrics::counter!("messaging_consume_total", &labels).increment(1);
                metrics::histogram!("messaging_consume_duration_seconds", &labels)
                    .record(started.elapsed().as_secs_f64());
                return Disposition::Commit;
            }
            Err(error) => {
                tracing::warn!(attempt, %error, "message handler failed");
                last_error = Some(error);
            }
        }
    }

    let error_text = last_error.map(|e| e.to_string()).unwrap_or_default();
    metrics::counter!("messaging_consume_errors_total", &labels).increment(1);

    if let Some(dlq) = dlq {
        let dlq_topic = config
            .dlq
            .as_ref()
            .and_then(|d| d.topic.clone())
            .unwrap_or_else(|| format!("{topic}-dlq"));
        let dead = dlq_message(&message, group_id, &error_text, dlq_topic);

        return match dlq.send(cx, dead).await {
            Ok(_) => {
                metrics::counter!("messaging_dlq_total", &labels).increment(1);
                Disposition::Commit
            }
            Err(error) => {
                // Best-effort: a failed DLQ send must not block progress.
                tracing::error!(%error, "dead-letter send failed");
                Disposition::Skip
            }
        };
    }

    tracing::error!(
        %topic,
        error = %error_text,
        "retries exhausted and no dead-letter topic configured; skipping message"
    );
    Disposition::Skip
}

/// Annotate the failed message for the dead-letter topic. Original headers
/// are preserved where they do not collide with the annotations.
pub(crate) fn dlq_message(
    original: &Message,
    group_id: &str,
    error: &str,
    topic: String,
) -> Message {
    let mut annotated = BTreeMap::new();
    annotated.insert(headers::ORIGINAL_TOPIC.to_string(), original.topic.clone());
    annotated.insert(
        headers::ORIGINAL_PARTITION.to_string(),
        original.partition.unwrap_or(-1).to_string(),
    );
    annotated.insert(
        headers::ORIGINAL_OFFSET.to_string(),
        original.offset.unwrap_or(-1).to_string(),
    );
    annotated.insert(headers::ERROR_MESSAGE.to_string(), error.to_string());
    annotated.insert(headers::CONSUMER_GROUP.to_string(), group_id.to_string());

    for (key, value) in &original.headers {
        annotated.entry(key.clone()).or_insert_with(|| value.clone());
    }

    Message {
        topic,
        key: original.key.clone(),
        payload: original.payload.clone(),
        headers: annotated,
        partition: None,
        offset: None,
        timestamp: None,
    }
}

fn from_borrowed(delivery: &BorrowedMessage<'_>) -> Message {
    let mut header_map = BTreeMap::new();
    if let Some(borrowed) = delivery.headers() {
        for header in borrowed.iter() {
            if let Some(value) = header.value {
                header_map.insert(
                    header.key.to_string(),
                    String::from_utf8_lossy(value).into_owned(),
                );
            }
        }
    }

    Message {
        topic: delivery.topic().to_string(),
        key: delivery
            .key()
            .map(|key| String::from_utf8_lossy(key).into_owned()),
        payload: bytes::Bytes::copy_from_slice(delivery.payload().unwrap_or_default()),
        headers: header_map,
        partition: Some(delivery.partition()),
        offset: Some(delivery.offset()),
        timestamp: delivery.timestamp().to_millis(),
    }
}

pub(crate) struct LoggingContext {
    group_id: String,
}

impl ClientContext for LoggingContext {}

impl ConsumerContext for LoggingContext {
    fn pre_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        log_rebalance(&self.group_id, "pre-rebalance", rebalance);
    }

    fn post_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        log_rebalance(&self.group_id, "post-rebalance", rebalance);
    }

    fn commit_callback(&self, result: KafkaResult<()>, _offsets: &TopicPartitionList) {
        if let Err(error) = result {
            tracing::warn!(group = %self.group_id, %error, "async offset commit failed");
        }
    }
}

fn log_rebalance(group_id: &str, phase: &str, rebalance: &Rebalance<'_>) {
    match rebalance {
        Rebalance::Assign(partitions) => {
            tracing::info!(group = %group_id, phase, partitions = partitions.count(), "partitions assigned")
        }
        Rebalance::Revoke(partitions) => {
            tracing::info!(group = %group_id, phase, partitions = partitions.count(), "partitions revoked")
        }
        Rebalance::Error(error) => {
            tracing::warn!(group = %group_id, phase, %error, "rebalance error")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{handler, DlqConfig};
    use std::sync::atomic::AtomicU32;

    struct MockSink {
        sent: Mutex<Vec<Message>>,
        fail: bool,
    }

    impl MockSink {
        fn new(fail: bool) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                fail,
            }
        }
    }

    #[async_trait::async_trait]
    impl DlqSink for MockSink {
        async fn send(&self, _cx: &Context, message: Message) -> Result<Message, Error> {
            if self.fail {
                return Err(Error::Closed);
            }
            self.sent.lock().unwrap().push(message.clone());
            Ok(message)
        }
    }

    fn counting_handler(fail_times: u32) -> (Handler, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let h = handler(move |_message| {
            let calls = counter.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < fail_times {
                    Err(anyhow::anyhow!("boom").into())
                } else {
                    Ok(())
                }
            }
        });
        (h, calls)
    }

    fn config(max_retries: u32, interval_ms: u64, dlq: bool) -> ConsumerConfig {
        ConsumerConfig {
            max_retries,
            retry_interval: Duration::from_millis(interval_ms),
            offset_reset: "earliest".to_string(),
            dlq: dlq.then(DlqConfig::default),
        }
    }

    fn delivered(topic: &str) -> Message {
        let mut message = Message::new(topic, "payload").with_header("request-id", "r-7");
        message.partition = Some(2);
        message.offset = Some(41);
        message
    }

    #[tokio::test]
    async fn retries_then_succeeds_and_commits() {
        let cx = Context::background();
        let (handler, calls) = counting_handler(2);

        let started = std::time::Instant::now();
        let disposition = process(
            &cx,
            &handler,
            None,
            &config(3, 10, false),
            "orders-workers",
            delivered("orders"),
        )
        .await;

        assert_eq!(disposition, Disposition::Commit);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Backoff pauses: 10ms then 20ms.
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn exhausted_retries_route_to_the_dlq_with_annotations() {
        let cx = Context::background();
        let (handler, calls) = counting_handler(u32::MAX);
        let sink = MockSink::new(false);

        let disposition = process(
            &cx,
            &handler,
            Some(&sink),
            &config(2, 1, true),
            "orders-workers",
            delivered("orders"),
        )
        .await;

        assert_eq!(disposition, Disposition::Commit);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let sent = sink.sent.lock().unwrap();
        let dead = &sent[0];
        assert_eq!(dead.topic, "orders-dlq");
        assert_eq!(dead.headers[headers::ORIGINAL_TOPIC], "orders");
        assert_eq!(dead.headers[headers::ORIGINAL_PARTITION], "2");
        assert_eq!(dead.headers[headers::ORIGINAL_OFFSET], "41");
        assert_eq!(dead.headers[headers::ERROR_MESSAGE], "boom");
        assert_eq!(dead.headers[headers::CONSUMER_GROUP], "orders-workers");
        // Non-conflicting original headers survive.
        assert_eq!(dead.headers["request-id"], "r-7");
    }

    #[tokio::test]
    async fn failed_dlq_send_skips_the_commit() {
        let cx = Context::background();
        let (handler, _calls) = counting_handler(u32::MAX);
        let sink = MockSink::new(true);

        let disposition = process(
            &cx,
            &handler,
            Some(&sink),
            &config(0, 1, true),
            "g",
            delivered("orders"),
        )
        .await;
        assert_eq!(disposition, Disposition::Skip);
    }

    #[tokio::test]
    async fn no_dlq_means_no_commit() {
        let cx = Context::background();
        let (handler, calls) = counting_handler(u32::MAX);

        let disposition = process(
            &cx,
            &handler,
            None,
            &config(1, 1, false),
            "g",
            delivered("orders"),
        )
        .await;
        assert_eq!(disposition, Disposition::Skip);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_retry_loop() {
        let cx = Context::background().with_timeout(Duration::from_millis(20));
        let (handler, calls) = counting_handler(u32::MAX);

        let started = std::time::Instant::now();
        let disposition = process(
            &cx,
            &handler,
            None,
            &config(5, 10_000, false),
            "g",
            delivered("orders"),
        )
        .await;

        assert_eq!(disposition, Disposition::Skip);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn spoofed_annotation_headers_do_not_overwrite() {
        let mut original = delivered("orders");
        original
            .headers
            .insert(headers::ORIGINAL_TOPIC.to_string(), "spoof".to_string());

        let dead = dlq_message(&original, "g", "boom", "orders-dlq".to_string());
        assert_eq!(dead.headers[headers::ORIGINAL_TOPIC], "orders");
    }

    #[tokio::test]
    async fn commit_without_a_session_errors() {
        let consumer = Consumer {
            group_id: "g".to_string(),
            config: config(0, 1, false),
            client_config: ClientConfig::new(),
            reconnect_interval: Duration::from_secs(1),
            dlq: None,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            session: Arc::new(Mutex::new(None)),
            closed: AtomicBool::new(false),
        };

        assert!(matches!(
            consumer.commit_message(&delivered("orders")),
            Err(Error::NoActiveSession)
        ));
    }
}
