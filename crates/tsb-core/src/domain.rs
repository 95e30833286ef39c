use std::fmt;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

/// Chat / channel / user id the message came from (numeric, opaque).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub i64);

impl ConversationId {
    /// Label used when the display name cannot be resolved.
    pub fn fallback_title(&self) -> String {
        format!("Chat {}", self.0)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Telegram message id (numeric, unique per conversation).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i32);

/// A message as delivered by the gateway, before any processing.
#[derive(Clone, Debug, PartialEq)]
pub struct RawMessage {
    pub conversation: ConversationId,
    pub message_id: MessageId,
    pub text: Option<String>,
    pub date: DateTime<Utc>,
}

impl RawMessage {
    /// The message body, if there is one worth processing.
    pub fn text(&self) -> Option<&str> {
        self.text.as_deref().filter(|t| !t.trim().is_empty())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Buy,
    Sell,
}

/// Structured judgement of a message text.
///
/// Negative results always carry a `reason` (not a signal, parse error,
/// upstream failure) so viewers can tell *why* nothing was extracted.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub is_signal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pair: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sl: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tp: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Analysis {
    pub fn negative(reason: impl Into<String>) -> Self {
        Self {
            is_signal: false,
            reason: Some(reason.into()),
            ..Self::default()
        }
    }
}

/// The unit published to viewers. Immutable once built.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub title: String,
    pub text: String,
    /// Local wall-clock time of the message, for display.
    pub date: String,
    /// RFC3339 timestamp of the message.
    pub received_at: String,
    pub is_sync: bool,
    pub analysis: Analysis,
}

impl Event {
    pub fn new(
        raw: &RawMessage,
        title: String,
        text: String,
        is_sync: bool,
        analysis: Analysis,
    ) -> Self {
        Self {
            conversation_id: raw.conversation,
            message_id: raw.message_id,
            title,
            text,
            date: raw.date.with_timezone(&Local).format("%H:%M:%S").to_string(),
            received_at: raw.date.to_rfc3339(),
            is_sync,
            analysis,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceStatus {
    Online,
    Offline,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ComponentHealth {
    pub status: ServiceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentHealth {
    pub fn online() -> Self {
        Self {
            status: ServiceStatus::Online,
            error: None,
        }
    }

    pub fn offline(error: impl Into<String>) -> Self {
        Self {
            status: ServiceStatus::Offline,
            error: Some(error.into()),
        }
    }

    pub fn is_online(&self) -> bool {
        self.status == ServiceStatus::Online
    }
}

/// Point-in-time reachability of both upstream dependencies.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub gateway: ComponentHealth,
    pub classifier: ComponentHealth,
    pub timestamp: String,
    /// True when a viewer asked for this probe, false for the periodic timer.
    pub is_manual: bool,
}

impl HealthStatus {
    pub fn all_online(&self) -> bool {
        self.gateway.is_online() && self.classifier.is_online()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
}

/// Connection state as published by the connection manager.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GatewayStatus {
    pub state: ConnectionState,
    pub error: Option<String>,
}

impl Default for GatewayStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            error: None,
        }
    }
}

impl GatewayStatus {
    pub fn health(&self) -> ComponentHealth {
        match self.state {
            ConnectionState::Connected => ComponentHealth::online(),
            ConnectionState::Disconnected if self.error.is_none() => {
                ComponentHealth::offline("not connected")
            }
            ConnectionState::Connecting if self.error.is_none() => {
                ComponentHealth::offline("connecting")
            }
            _ => ComponentHealth::offline(
                self.error
                    .clone()
                    .unwrap_or_else(|| "connection degraded".to_string()),
            ),
        }
    }
}
