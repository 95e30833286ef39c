use std::time::Duration;

/// Core error type for the bridge.
///
/// Adapter crates map their specific errors into this type so the core can
/// pick a recovery strategy per class (plain reconnect vs full teardown).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("connectivity error: {0}")]
    Connectivity(String),

    /// Session credential invalid or revoked. Not fixed by retrying the same session.
    #[error("authorization error: {0}")]
    Authorization(String),

    #[error("classification error: {0}")]
    Classification(String),

    #[error("resolution error: {0}")]
    Resolution(String),

    #[error("{operation} timed out after {}s", .after.as_secs_f64())]
    Timeout { operation: String, after: Duration },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    pub fn is_authorization(&self) -> bool {
        matches!(self, Error::Authorization(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_names_operation_and_duration() {
        let e = Error::Timeout {
            operation: "classification".to_string(),
            after: Duration::from_secs(20),
        };
        assert_eq!(e.to_string(), "classification timed out after 20s");
        assert!(e.is_timeout());
        assert!(!e.is_authorization());
    }

    #[test]
    fn only_authorization_variant_is_authorization() {
        assert!(Error::Authorization("AUTH_KEY_UNREGISTERED".into()).is_authorization());
        assert!(!Error::Connectivity("reset".into()).is_authorization());
        assert!(!Error::External("500".into()).is_authorization());
    }
}
