use std::sync::Arc;

use futures::{Stream, StreamExt};
use tracing::{debug, info};

use crate::{
    broadcast::Broadcaster,
    classifier::Classifier,
    domain::{Event, RawMessage},
    name_cache::EntityNameCache,
    ports::GatewayPort,
};

/// Turns raw messages into published events: title lookup, classification,
/// history append and fan-out.
pub struct EventPipeline {
    gateway: Arc<dyn GatewayPort>,
    names: EntityNameCache,
    classifier: Arc<Classifier>,
    broadcaster: Arc<Broadcaster>,
    concurrency: usize,
}

impl EventPipeline {
    pub fn new(
        gateway: Arc<dyn GatewayPort>,
        names: EntityNameCache,
        classifier: Arc<Classifier>,
        broadcaster: Arc<Broadcaster>,
        concurrency: usize,
    ) -> Self {
        Self {
            gateway,
            names,
            classifier,
            broadcaster,
            concurrency: concurrency.max(1),
        }
    }

    /// Build the event for `raw` without publishing it.
    ///
    /// Messages without text yield `None` before any lookup or classification.
    pub async fn prepare(&self, raw: &RawMessage, is_sync: bool) -> Option<Event> {
        let text = raw.text()?;

        let (title, analysis) = tokio::join!(
            self.names.resolve(self.gateway.as_ref(), raw.conversation),
            self.classifier.classify(text),
        );
        debug!(
            conversation = %raw.conversation,
            message = raw.message_id.0,
            is_signal = analysis.is_signal,
            "message classified"
        );

        Some(Event::new(raw, title, text.to_string(), is_sync, analysis))
    }

    /// Append to history and push to viewers. Returns the recipient count.
    pub fn commit(&self, event: Event) -> usize {
        if event.analysis.is_signal {
            info!(
                title = %event.title,
                pair = event.analysis.pair.as_deref().unwrap_or_default(),
                "signal detected"
            );
        }
        self.broadcaster.publish_event(event)
    }

    pub async fn process(&self, raw: &RawMessage, is_sync: bool) -> Option<Event> {
        let event = self.prepare(raw, is_sync).await?;
        self.commit(event.clone());
        Some(event)
    }

    /// Process a sequence of messages with overlapping classification while
    /// committing strictly in input order. Returns the number of events committed.
    pub async fn process_ordered<S>(&self, messages: S, is_sync: bool) -> usize
    where
        S: Stream<Item = RawMessage>,
    {
        messages
            .map(|raw| async move { self.prepare(&raw, is_sync).await })
            .buffered(self.concurrency)
            .fold(0, |committed, event| async move {
                match event {
                    Some(event) => {
                        self.commit(event);
                        committed + 1
                    }
                    None => committed,
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::stream;
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        domain::{Action, ConversationId, RawMessage},
        history::HistoryBuffer,
        testutil::{raw, FakeGateway, FakeModel, Reply},
    };

    const SIGNAL: &str =
        r#"{"is_signal":true,"pair":"EURUSD","action":"BUY","sl":"1.08","tp":["1.12"]}"#;
    const NOISE: &str = r#"{"is_signal":false}"#;

    struct Harness {
        gateway: Arc<FakeGateway>,
        model: Arc<FakeModel>,
        broadcaster: Arc<Broadcaster>,
        pipeline: EventPipeline,
    }

    fn harness(model: FakeModel, concurrency: usize) -> Harness {
        let gateway = Arc::new(FakeGateway::default());
        let model = Arc::new(model);
        let (recheck, _) = mpsc::channel(1);
        let broadcaster = Arc::new(Broadcaster::new(HistoryBuffer::new(50), 64, recheck));
        let classifier = Arc::new(Classifier::new(model.clone(), Duration::from_secs(20)));
        let pipeline = EventPipeline::new(
            gateway.clone(),
            EntityNameCache::new(Duration::from_secs(5)),
            classifier,
            broadcaster.clone(),
            concurrency,
        );
        Harness {
            gateway,
            model,
            broadcaster,
            pipeline,
        }
    }

    fn ids(b: &Broadcaster) -> Vec<i32> {
        b.history()
            .snapshot()
            .iter()
            .map(|e| e.message_id.0)
            .collect()
    }

    #[tokio::test]
    async fn blank_messages_have_no_side_effects() {
        let h = harness(FakeModel::replying(Reply::Text(SIGNAL.into())), 1);
        let mut blank = raw(1, 1, "  \n ");
        assert!(h.pipeline.process(&blank, false).await.is_none());
        blank.text = None;
        assert!(h.pipeline.process(&blank, false).await.is_none());

        assert_eq!(h.model.calls(), 0);
        assert_eq!(h.gateway.resolve_calls(), 0);
        assert!(h.broadcaster.history().is_empty());
    }

    #[tokio::test]
    async fn builds_and_publishes_a_signal_event() {
        let h = harness(FakeModel::replying(Reply::Text(SIGNAL.into())), 1);
        h.gateway.set_title(ConversationId(42), "EURUSD Signals");
        let mut viewer = h.broadcaster.attach();

        let msg = raw(42, 7, "EURUSD BUY entry 1.10 sl 1.08 tp 1.12");
        let event = h.pipeline.process(&msg, true).await.unwrap();
        assert_eq!(event.title, "EURUSD Signals");
        assert!(event.is_sync);
        assert_eq!(event.analysis.action, Some(Action::Buy));
        assert_eq!(h.broadcaster.history().snapshot(), vec![event.clone()]);
        assert!(viewer.rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn unresolvable_title_falls_back() {
        let h = harness(FakeModel::replying(Reply::Text(NOISE.into())), 1);
        let event = h.pipeline.process(&raw(99, 1, "hello"), false).await.unwrap();
        assert_eq!(event.title, "Chat 99");
        assert_eq!(event.analysis.reason.as_deref(), Some("not a signal"));
    }

    #[tokio::test(start_paused = true)]
    async fn classifier_timeout_still_publishes_the_event() {
        let h = harness(FakeModel::replying(Reply::Hang), 1);
        let event = h.pipeline.process(&raw(1, 1, "EURUSD BUY"), false).await.unwrap();
        assert!(!event.analysis.is_signal);
        assert!(event.analysis.reason.unwrap().contains("timed out"));
        assert_eq!(ids(&h.broadcaster), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn commits_follow_source_order_when_classification_overlaps() {
        let model = FakeModel::replying(Reply::Text(NOISE.into()))
            .on("msg-alpha", Reply::Slow(Duration::from_secs(3), SIGNAL.into()))
            .on("msg-beta", Reply::Slow(Duration::from_millis(10), NOISE.into()));
        let h = harness(model, 4);

        let messages = vec![
            raw(1, 1, "msg-alpha"),
            raw(1, 2, "  "),
            raw(1, 3, "msg-beta"),
            raw(1, 4, "msg-gamma"),
        ];
        let started = tokio::time::Instant::now();
        let committed = h
            .pipeline
            .process_ordered(stream::iter(messages), false)
            .await;

        assert_eq!(committed, 3);
        assert_eq!(ids(&h.broadcaster), vec![1, 3, 4]);
        // Overlapping: total time is the slowest call, not the sum.
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn ordered_processing_of_empty_input_is_a_noop() {
        let h = harness(FakeModel::replying(Reply::Text(NOISE.into())), 2);
        let none: Vec<RawMessage> = Vec::new();
        assert_eq!(h.pipeline.process_ordered(stream::iter(none), true).await, 0);
    }
}
