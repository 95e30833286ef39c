use std::{collections::HashMap, sync::Mutex, time::Duration};

use tracing::{debug, warn};

use crate::{domain::ConversationId, ports::GatewayPort, utils::with_timeout};

/// Memoized display names per conversation.
///
/// Entries never expire. A failed lookup stores the fallback label so the same
/// conversation does not keep failing remotely.
#[derive(Debug)]
pub struct EntityNameCache {
    timeout: Duration,
    names: Mutex<HashMap<ConversationId, String>>,
}

impl EntityNameCache {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            names: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, id: ConversationId) -> Option<String> {
        self.names
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    /// Cached name, or resolve through the gateway. Never fails.
    pub async fn resolve(&self, gateway: &dyn GatewayPort, id: ConversationId) -> String {
        if let Some(name) = self.get(id) {
            return name;
        }

        // The lock is not held across the remote call; two concurrent misses for
        // the same id both go upstream and the first insert wins.
        let lookup = with_timeout(self.timeout, "resolve_title", gateway.resolve_title(id));
        let name = match lookup.await {
            Ok(name) if !name.trim().is_empty() => {
                debug!(conversation = %id, name = %name, "resolved conversation name");
                name
            }
            Ok(_) => id.fallback_title(),
            Err(e) => {
                warn!(conversation = %id, error = %e, "name resolution failed, using fallback");
                id.fallback_title()
            }
        };

        self.names
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(id)
            .or_insert(name)
            .clone()
    }
}
