use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    domain::{ConversationId, RawMessage},
    Result,
};

/// Live message stream handed out by [`GatewayPort::subscribe`].
///
/// Errors are delivered in-band so the consumer can tell a dropped connection
/// from a revoked credential. The stream ending means the session is gone.
pub type MessageStream = mpsc::Receiver<Result<RawMessage>>;

/// Hexagonal port for the chat-platform gateway.
///
/// The session credential is owned by the implementation; the core never
/// performs interactive authentication. Implementations should report
/// `Error::Authorization` for invalid/revoked credentials and
/// `Error::Connectivity` for transport failures.
#[async_trait]
pub trait GatewayPort: Send + Sync {
    /// Establish (or re-establish) the upstream session.
    async fn connect(&self) -> Result<()>;

    /// Tear the session down. Idempotent.
    async fn disconnect(&self) -> Result<()>;

    /// Lightweight identity probe ("who am I"). Returns a printable identity.
    async fn whoami(&self) -> Result<String>;

    /// Most recently active conversations, most recent first.
    async fn recent_conversations(&self, limit: usize) -> Result<Vec<ConversationId>>;

    /// Most recent messages in a conversation (any order; callers sort).
    async fn recent_messages(
        &self,
        conversation: ConversationId,
        limit: usize,
    ) -> Result<Vec<RawMessage>>;

    /// Start receiving every newly arriving message across all conversations.
    async fn subscribe(&self) -> Result<MessageStream>;

    /// Human-readable name of a conversation.
    async fn resolve_title(&self, conversation: ConversationId) -> Result<String>;

    /// Make sure the session is a member of `target` (`@username` or numeric id).
    async fn join(&self, target: &str) -> Result<()>;
}

/// Hexagonal port for the generative-classification service.
#[async_trait]
pub trait GenerativeModel: Send + Sync {
    /// Submit a prompt, return the raw text of the first candidate.
    async fn generate(&self, prompt: &str) -> Result<String>;

    /// Minimal round trip used for reachability checks.
    async fn ping(&self) -> Result<()>;
}
