//! Hand-written fakes for the ports, shared by the unit tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio::sync::mpsc;

use crate::{
    domain::{Analysis, ConversationId, Event, MessageId, RawMessage},
    errors::Error,
    ports::{GatewayPort, GenerativeModel, MessageStream},
    Result,
};

pub fn raw(conversation: i64, id: i32, text: &str) -> RawMessage {
    RawMessage {
        conversation: ConversationId(conversation),
        message_id: MessageId(id),
        text: Some(text.to_string()),
        date: Utc
            .timestamp_opt(1_767_261_600 + i64::from(id), 0)
            .single()
            .unwrap_or_default(),
    }
}

pub fn event(id: i32) -> Event {
    Event::new(
        &raw(1, id, "x"),
        "Chat 1".to_string(),
        format!("message {id}"),
        false,
        Analysis::negative("not a signal"),
    )
}

#[derive(Default)]
pub struct FakeGateway {
    log: Mutex<Vec<&'static str>>,
    connect_results: Mutex<VecDeque<Result<()>>>,
    whoami_results: Mutex<VecDeque<Result<String>>>,
    titles: Mutex<HashMap<ConversationId, String>>,
    conversations: Mutex<Vec<ConversationId>>,
    messages: Mutex<HashMap<ConversationId, Vec<RawMessage>>>,
    live: Mutex<Option<mpsc::Sender<Result<RawMessage>>>>,
    dead_subscriptions: AtomicUsize,
    subscribe_error: Mutex<Option<Error>>,
    resolve_calls: AtomicUsize,
    resolve_error: Mutex<Option<fn() -> Error>>,
}

impl FakeGateway {
    pub fn set_title(&self, id: ConversationId, title: &str) {
        self.titles.lock().unwrap().insert(id, title.to_string());
    }

    pub fn add_messages(&self, id: ConversationId, msgs: Vec<RawMessage>) {
        self.conversations.lock().unwrap().push(id);
        self.messages.lock().unwrap().insert(id, msgs);
    }

    pub fn push_connect(&self, res: Result<()>) {
        self.connect_results.lock().unwrap().push_back(res);
    }

    pub fn push_whoami(&self, res: Result<String>) {
        self.whoami_results.lock().unwrap().push_back(res);
    }

    pub fn fail_resolution_with(&self, make: fn() -> Error) {
        *self.resolve_error.lock().unwrap() = Some(make);
    }

    /// The next `n` subscriptions end as soon as they start.
    pub fn close_next_subscriptions(&self, n: usize) {
        self.dead_subscriptions.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_subscription(&self, err: Error) {
        *self.subscribe_error.lock().unwrap() = Some(err);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.log.lock().unwrap().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| **c == call).count()
    }

    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }

    /// Sender feeding the most recent subscription, if any.
    pub fn live_sender(&self) -> Option<mpsc::Sender<Result<RawMessage>>> {
        self.live.lock().unwrap().clone()
    }

    /// Drop the live sender, ending the current subscription stream.
    pub fn close_live(&self) {
        self.live.lock().unwrap().take();
    }

    fn record(&self, call: &'static str) {
        self.log.lock().unwrap().push(call);
    }
}

#[async_trait]
impl GatewayPort for FakeGateway {
    async fn connect(&self) -> Result<()> {
        self.record("connect");
        // Reconnecting ends the previous subscription, like the real adapters.
        self.live.lock().unwrap().take();
        self.connect_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()))
    }

    async fn disconnect(&self) -> Result<()> {
        self.record("disconnect");
        self.live.lock().unwrap().take();
        Ok(())
    }

    async fn whoami(&self) -> Result<String> {
        self.record("whoami");
        self.whoami_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("signal_bridge_bot".to_string()))
    }

    async fn recent_conversations(&self, limit: usize) -> Result<Vec<ConversationId>> {
        self.record("recent_conversations");
        Ok(self
            .conversations
            .lock()
            .unwrap()
            .iter()
            .copied()
            .take(limit)
            .collect())
    }

    async fn recent_messages(
        &self,
        conversation: ConversationId,
        limit: usize,
    ) -> Result<Vec<RawMessage>> {
        self.record("recent_messages");
        let msgs = self
            .messages
            .lock()
            .unwrap()
            .get(&conversation)
            .cloned()
            .unwrap_or_default();
        // Newest first, like the platform APIs.
        Ok(msgs.into_iter().rev().take(limit).collect())
    }

    async fn subscribe(&self) -> Result<MessageStream> {
        self.record("subscribe");
        if let Some(err) = self.subscribe_error.lock().unwrap().take() {
            return Err(err);
        }
        let (tx, rx) = mpsc::channel(64);
        let dead = self
            .dead_subscriptions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !dead {
            *self.live.lock().unwrap() = Some(tx);
        }
        Ok(rx)
    }

    async fn resolve_title(&self, conversation: ConversationId) -> Result<String> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(make) = *self.resolve_error.lock().unwrap() {
            return Err(make());
        }
        self.titles
            .lock()
            .unwrap()
            .get(&conversation)
            .cloned()
            .ok_or_else(|| Error::Resolution(format!("no entity for {conversation}")))
    }

    async fn join(&self, _target: &str) -> Result<()> {
        self.record("join");
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub enum Reply {
    Text(String),
    Fail(String),
    /// Sleep before answering with the inner text (for ordering tests).
    Slow(Duration, String),
    /// Never answer.
    Hang,
}

pub struct FakeModel {
    default: Reply,
    by_text: Mutex<Vec<(String, Reply)>>,
    ping_error: Mutex<Option<String>>,
    calls: AtomicUsize,
}

impl FakeModel {
    pub fn replying(default: Reply) -> Self {
        Self {
            default,
            by_text: Mutex::new(Vec::new()),
            ping_error: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    /// Use `reply` whenever the prompt contains `needle`.
    pub fn on(self, needle: &str, reply: Reply) -> Self {
        self.by_text
            .lock()
            .unwrap()
            .push((needle.to_string(), reply));
        self
    }

    pub fn fail_ping(&self, error: Option<&str>) {
        *self.ping_error.lock().unwrap() = error.map(|s| s.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerativeModel for FakeModel {
    async fn generate(&self, prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = self
            .by_text
            .lock()
            .unwrap()
            .iter()
            .find(|(needle, _)| prompt.contains(needle.as_str()))
            .map(|(_, r)| r.clone())
            .unwrap_or_else(|| self.default.clone());

        match reply {
            Reply::Text(t) => Ok(t),
            Reply::Fail(e) => Err(Error::Classification(e)),
            Reply::Slow(d, t) => {
                tokio::time::sleep(d).await;
                Ok(t)
            }
            Reply::Hang => {
                std::future::pending::<()>().await;
                Ok(String::new())
            }
        }
    }

    async fn ping(&self) -> Result<()> {
        match self.ping_error.lock().unwrap().clone() {
            Some(e) => Err(Error::Classification(e)),
            None => Ok(()),
        }
    }
}
