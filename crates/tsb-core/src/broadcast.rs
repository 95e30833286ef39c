//! Viewer registry and event fan-out.
//!
//! The [`Broadcaster`] owns the [`HistoryBuffer`]: appending an event and
//! pushing it to viewers happen under one lock, and so does attaching a
//! viewer (snapshot replay + registration). A viewer therefore sees every
//! event exactly once, whether it arrived through the replay or live.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::{
    domain::{Event, HealthStatus},
    history::HistoryBuffer,
};

pub type ViewerId = u64;

/// Consecutive dropped messages after which a viewer is disconnected.
const SLOW_VIEWER_LIMIT: u32 = 16;

/// Server -> viewer message, `{"event": "...", "data": ...}` on the wire.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ViewerMessage {
    NewEvent(Event),
    SystemStatus(HealthStatus),
}

/// Viewer -> server request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ViewerRequest {
    ManualRecheck,
}

impl ViewerRequest {
    /// Accepts the JSON form as well as the bare event name.
    pub fn parse(frame: &str) -> Option<Self> {
        let frame = frame.trim();
        if frame == "manual_recheck" {
            return Some(Self::ManualRecheck);
        }
        serde_json::from_str(frame).ok()
    }
}

/// A registered viewer: its id and the queue the session drains.
///
/// The queue closing means the broadcaster dropped the viewer.
#[derive(Debug)]
pub struct Viewer {
    pub id: ViewerId,
    pub rx: mpsc::Receiver<ViewerMessage>,
}

struct ViewerSlot {
    tx: mpsc::Sender<ViewerMessage>,
    overflows: u32,
}

#[derive(Default)]
struct Registry {
    next_id: ViewerId,
    viewers: HashMap<ViewerId, ViewerSlot>,
    latest_health: Option<HealthStatus>,
}

impl Registry {
    /// Best-effort push to every viewer. Returns the number that accepted it.
    fn fan_out(&mut self, msg: &ViewerMessage) -> usize {
        let mut delivered = 0;
        self.viewers.retain(|id, slot| match slot.tx.try_send(msg.clone()) {
            Ok(()) => {
                slot.overflows = 0;
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                slot.overflows += 1;
                if slot.overflows >= SLOW_VIEWER_LIMIT {
                    warn!(viewer = id, "viewer keeps falling behind, disconnecting");
                    false
                } else {
                    debug!(viewer = id, "viewer queue full, message dropped");
                    true
                }
            }
            Err(TrySendError::Closed(_)) => {
                debug!(viewer = id, "pruning closed viewer");
                false
            }
        });
        delivered
    }
}

pub struct Broadcaster {
    history: HistoryBuffer,
    queue_size: usize,
    registry: Mutex<Registry>,
    recheck: mpsc::Sender<ViewerId>,
}

impl Broadcaster {
    /// `recheck` is the request channel drained by the health monitor.
    pub fn new(
        history: HistoryBuffer,
        queue_size: usize,
        recheck: mpsc::Sender<ViewerId>,
    ) -> Self {
        Self {
            history,
            queue_size: queue_size.max(1),
            registry: Mutex::new(Registry::default()),
            recheck,
        }
    }

    pub fn history(&self) -> &HistoryBuffer {
        &self.history
    }

    /// Register a viewer. Its queue starts with the history replay (oldest
    /// first) followed by the latest health snapshot, if any.
    pub fn attach(&self) -> Viewer {
        let mut reg = self.lock();
        let replay = self.history.snapshot();
        let (tx, rx) = mpsc::channel(replay.len() + self.queue_size + 1);

        for event in replay {
            // Capacity covers the whole replay.
            let _ = tx.try_send(ViewerMessage::NewEvent(event));
        }
        if let Some(status) = &reg.latest_health {
            let _ = tx.try_send(ViewerMessage::SystemStatus(status.clone()));
        }

        let id = reg.next_id;
        reg.next_id += 1;
        reg.viewers.insert(id, ViewerSlot { tx, overflows: 0 });
        info!(viewer = id, viewers = reg.viewers.len(), "viewer attached");
        Viewer { id, rx }
    }

    pub fn detach(&self, id: ViewerId) -> bool {
        let mut reg = self.lock();
        let removed = reg.viewers.remove(&id).is_some();
        if removed {
            info!(viewer = id, viewers = reg.viewers.len(), "viewer detached");
        }
        removed
    }

    /// Append to history and push to every attached viewer.
    pub fn publish_event(&self, event: Event) -> usize {
        let mut reg = self.lock();
        self.history.append(event.clone());
        let recipients = reg.fan_out(&ViewerMessage::NewEvent(event));
        debug!(recipients, "published event");
        recipients
    }

    /// Remember `status` as the latest snapshot and push it to every viewer.
    pub fn publish_health(&self, status: HealthStatus) -> usize {
        let mut reg = self.lock();
        reg.latest_health = Some(status.clone());
        reg.fan_out(&ViewerMessage::SystemStatus(status))
    }

    pub fn latest_health(&self) -> Option<HealthStatus> {
        self.lock().latest_health.clone()
    }

    pub fn viewer_count(&self) -> usize {
        self.lock().viewers.len()
    }

    /// Ask the health monitor for an immediate probe on behalf of `id`.
    pub fn on_manual_recheck(&self, id: ViewerId) {
        match self.recheck.try_send(id) {
            Ok(()) => debug!(viewer = id, "manual recheck requested"),
            // Pending requests will produce a fresh snapshot anyway.
            Err(TrySendError::Full(_)) => debug!(viewer = id, "recheck already pending"),
            Err(TrySendError::Closed(_)) => warn!(viewer = id, "health monitor is not running"),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}
