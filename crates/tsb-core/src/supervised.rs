use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use crate::{
    domain::{ConversationId, RawMessage},
    errors::Error,
    ports::{GatewayPort, MessageStream},
    Result,
};

/// Something the connection manager has to react to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fault {
    /// The session credential was rejected by some call.
    Authorization(String),
    /// The live stream died (closed or transport error).
    StreamLost(String),
}

/// A fault stamped with the session it was observed in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FaultReport {
    pub session: u64,
    pub fault: Fault,
}

/// Sending half of the fault channel.
///
/// Every report carries the session number current when it was raised, so the
/// connection manager can drop faults that describe a session it has already
/// replaced.
#[derive(Clone, Debug)]
pub struct FaultSink {
    tx: mpsc::Sender<FaultReport>,
    session: Arc<AtomicU64>,
}

pub fn fault_channel(capacity: usize) -> (FaultSink, mpsc::Receiver<FaultReport>) {
    let (tx, rx) = mpsc::channel(capacity);
    let sink = FaultSink {
        tx,
        session: Arc::new(AtomicU64::new(0)),
    };
    (sink, rx)
}

impl FaultSink {
    pub fn session(&self) -> u64 {
        self.session.load(Ordering::SeqCst)
    }

    /// Start a new session; faults stamped earlier become stale.
    pub fn next_session(&self) -> u64 {
        self.session.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Report against the current session. A full queue drops the report.
    pub fn report(&self, fault: Fault) {
        let _ = self.tx.try_send(FaultReport {
            session: self.session(),
            fault,
        });
    }

    /// Report against `session`, waiting for queue space.
    pub async fn report_for(&self, session: u64, fault: Fault) {
        let _ = self.tx.send(FaultReport { session, fault }).await;
    }
}

/// GatewayPort decorator that reports authorization failures to the
/// connection manager. Every component except the manager talks to the
/// gateway through this handle.
pub struct SupervisedGateway {
    inner: Arc<dyn GatewayPort>,
    faults: FaultSink,
}

impl SupervisedGateway {
    pub fn new(inner: Arc<dyn GatewayPort>, faults: FaultSink) -> Self {
        Self { inner, faults }
    }

    fn observe<T>(&self, call: &str, res: Result<T>) -> Result<T> {
        if let Err(Error::Authorization(detail)) = &res {
            warn!(call, error = %detail, "gateway rejected the session credential");
            // A full queue means a recovery is already pending.
            self.faults.report(Fault::Authorization(detail.clone()));
        }
        res
    }
}

#[async_trait]
impl GatewayPort for SupervisedGateway {
    async fn connect(&self) -> Result<()> {
        let res = self.inner.connect().await;
        self.observe("connect", res)
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.disconnect().await
    }

    async fn whoami(&self) -> Result<String> {
        let res = self.inner.whoami().await;
        self.observe("whoami", res)
    }

    async fn recent_conversations(&self, limit: usize) -> Result<Vec<ConversationId>> {
        let res = self.inner.recent_conversations(limit).await;
        self.observe("recent_conversations", res)
    }

    async fn recent_messages(
        &self,
        conversation: ConversationId,
        limit: usize,
    ) -> Result<Vec<RawMessage>> {
        let res = self.inner.recent_messages(conversation, limit).await;
        self.observe("recent_messages", res)
    }

    async fn subscribe(&self) -> Result<MessageStream> {
        let res = self.inner.subscribe().await;
        self.observe("subscribe", res)
    }

    async fn resolve_title(&self, conversation: ConversationId) -> Result<String> {
        let res = self.inner.resolve_title(conversation).await;
        self.observe("resolve_title", res)
    }

    async fn join(&self, target: &str) -> Result<()> {
        let res = self.inner.join(target).await;
        self.observe("join", res)
    }
}
