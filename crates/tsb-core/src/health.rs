use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    sync::{mpsc, watch},
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    broadcast::{Broadcaster, ViewerId},
    classifier::Classifier,
    domain::{ComponentHealth, ConnectionState, GatewayStatus, HealthStatus},
    ports::GatewayPort,
    utils::{iso_timestamp_utc, with_timeout},
};

/// Periodic and on-demand reachability checks of the gateway and the
/// classifier, published to viewers as `system_status`.
pub struct HealthMonitor {
    gateway: Arc<dyn GatewayPort>,
    classifier: Arc<Classifier>,
    broadcaster: Arc<Broadcaster>,
    gateway_status: watch::Receiver<GatewayStatus>,
    interval: Duration,
    timeout: Duration,
    last_classifier: Mutex<ComponentHealth>,
}

impl HealthMonitor {
    pub fn new(
        gateway: Arc<dyn GatewayPort>,
        classifier: Arc<Classifier>,
        broadcaster: Arc<Broadcaster>,
        gateway_status: watch::Receiver<GatewayStatus>,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            gateway,
            classifier,
            broadcaster,
            gateway_status,
            interval,
            timeout,
            last_classifier: Mutex::new(ComponentHealth::offline("not checked yet")),
        }
    }

    /// Check both dependencies concurrently and publish the result.
    pub async fn probe(&self, is_manual: bool) -> HealthStatus {
        let (gateway, classifier) = tokio::join!(self.check_gateway(), self.check_classifier());
        *self
            .last_classifier
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = classifier.clone();

        let status = HealthStatus {
            gateway,
            classifier,
            timestamp: iso_timestamp_utc(),
            is_manual,
        };
        if status.all_online() {
            debug!(is_manual, "health probe: all online");
        } else {
            warn!(
                is_manual,
                gateway = ?status.gateway.error,
                classifier = ?status.classifier.error,
                "health probe: dependency offline"
            );
        }
        self.broadcaster.publish_health(status.clone());
        status
    }

    /// Timer probes, manual rechecks and connection-state transitions until
    /// `cancel` fires. The first probe runs immediately.
    pub async fn run(&self, mut rechecks: mpsc::Receiver<ViewerId>, cancel: CancellationToken) {
        let mut status_rx = self.gateway_status.clone();
        status_rx.borrow_and_update();

        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
              _ = cancel.cancelled() => break,
              _ = tick.tick() => {
                self.probe(false).await;
              }
              Some(viewer) = rechecks.recv() => {
                info!(viewer, "manual health recheck");
                self.probe(true).await;
              }
              Ok(()) = status_rx.changed() => {
                let current = status_rx.borrow_and_update().clone();
                self.publish_transition(&current);
              }
            }
        }
        debug!("health monitor stopped");
    }

    /// Snapshot from the new connection state and the last classifier result,
    /// without any upstream call.
    fn publish_transition(&self, current: &GatewayStatus) -> HealthStatus {
        let classifier = self
            .last_classifier
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let status = HealthStatus {
            gateway: current.health(),
            classifier,
            timestamp: iso_timestamp_utc(),
            is_manual: false,
        };
        debug!(state = ?current.state, "connection state changed");
        self.broadcaster.publish_health(status.clone());
        status
    }

    async fn check_gateway(&self) -> ComponentHealth {
        let current = self.gateway_status.borrow().clone();
        match current.state {
            ConnectionState::Connected | ConnectionState::Degraded => {
                match with_timeout(self.timeout, "whoami", self.gateway.whoami()).await {
                    Ok(_) => ComponentHealth::online(),
                    Err(e) => ComponentHealth::offline(e.to_string()),
                }
            }
            // No session to ask; report why.
            ConnectionState::Disconnected | ConnectionState::Connecting => current.health(),
        }
    }

    async fn check_classifier(&self) -> ComponentHealth {
        match self.classifier.check().await {
            Ok(()) => ComponentHealth::online(),
            Err(e) => ComponentHealth::offline(e.to_string()),
        }
    }
}
