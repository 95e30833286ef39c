//! Gateway session lifecycle.
//!
//! The [`ConnectionManager`] is the only component that connects, disconnects
//! and subscribes. Everything else reaches the gateway through a
//! [`SupervisedGateway`](crate::supervised::SupervisedGateway) whose
//! authorization failures arrive here as [`Fault`]s, next to the faults raised
//! by the live pump.
//!
//! State changes are published on a `watch` channel:
//!
//! ```text
//! DISCONNECTED -> CONNECTING -> CONNECTED -> DEGRADED -> CONNECTING ...
//!                     |                          |
//!                     +-> DISCONNECTED (error) <-+
//! ```

use std::{
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use futures::{stream, StreamExt};
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    domain::{ConnectionState, GatewayStatus, RawMessage},
    errors::Error,
    pipeline::EventPipeline,
    ports::{GatewayPort, MessageStream},
    supervised::{Fault, FaultReport, FaultSink},
    utils::with_timeout,
    Result,
};

#[derive(Clone, Debug)]
pub struct ConnectionSettings {
    /// Bound for every individual gateway call.
    pub call_timeout: Duration,
    pub keepalive_interval: Duration,
    pub backfill_conversations: usize,
    pub backfill_messages: usize,
    /// Conversation to make sure we are a member of after connecting.
    pub target: Option<String>,
}

impl ConnectionSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            call_timeout: cfg.upstream_timeout,
            keepalive_interval: cfg.keepalive_interval,
            backfill_conversations: cfg.backfill_conversations,
            backfill_messages: cfg.backfill_messages,
            target: cfg.target_conversation.clone(),
        }
    }
}

struct LivePump {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl LivePump {
    fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    fn stop(self) {
        self.cancel.cancel();
        self.handle.abort();
    }
}

#[derive(Default)]
struct Session {
    backfilled: bool,
    pump: Option<LivePump>,
}

pub struct ConnectionManager {
    gateway: Arc<dyn GatewayPort>,
    pipeline: Arc<EventPipeline>,
    settings: ConnectionSettings,
    status: watch::Sender<GatewayStatus>,
    faults: FaultSink,
    session: Mutex<Session>,
}

impl ConnectionManager {
    /// `gateway` is the undecorated adapter. `faults` is the same sink the
    /// supervised handle reports into; [`run`](Self::run) drains its receiver.
    pub fn new(
        gateway: Arc<dyn GatewayPort>,
        pipeline: Arc<EventPipeline>,
        settings: ConnectionSettings,
        faults: FaultSink,
    ) -> Self {
        let (status, _) = watch::channel(GatewayStatus::default());
        Self {
            gateway,
            pipeline,
            settings,
            status,
            faults,
            session: Mutex::new(Session::default()),
        }
    }

    pub fn status(&self) -> GatewayStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<GatewayStatus> {
        self.status.subscribe()
    }

    /// Establish the session, then (first time only) backfill, then start the
    /// live pump. Join and backfill failures are logged, not returned.
    ///
    /// Any previous pump is stopped first: the adapter ends the old stream
    /// when it reconnects, and faults from the old session become stale.
    pub async fn connect(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        if let Some(pump) = session.pump.take() {
            pump.stop();
        }
        let id = self.faults.next_session();
        debug!(session = id, "starting gateway session");
        self.set_status(ConnectionState::Connecting, None);

        let t = self.settings.call_timeout;
        if let Err(e) = with_timeout(t, "connect", self.gateway.connect()).await {
            warn!(error = %e, "gateway connect failed");
            self.set_status(ConnectionState::Disconnected, Some(e.to_string()));
            return Err(e);
        }
        self.set_status(ConnectionState::Connected, None);
        info!("gateway connected");

        if let Some(target) = &self.settings.target {
            match with_timeout(t, "join", self.gateway.join(target)).await {
                Ok(()) => info!(channel = %target, "target conversation joined"),
                Err(e) => warn!(channel = %target, error = %e, "could not join target conversation"),
            }
        }

        if !session.backfilled {
            session.backfilled = true;
            self.backfill().await;
        }

        self.ensure_live_pump(&mut session).await;
        Ok(())
    }

    /// Identity probe. Failure degrades the session and reconnects at once;
    /// success restores CONNECTED and restarts a missing live pump.
    pub async fn keepalive(&self) {
        if self.status().state == ConnectionState::Disconnected {
            debug!("keepalive: not connected, reconnecting");
            let _ = self.connect().await;
            return;
        }

        let t = self.settings.call_timeout;
        match with_timeout(t, "whoami", self.gateway.whoami()).await {
            Ok(identity) => {
                debug!(identity = %identity, "keepalive ok");
                let mut session = self.session.lock().await;
                self.set_status(ConnectionState::Connected, None);
                self.ensure_live_pump(&mut session).await;
            }
            Err(Error::Authorization(detail)) => self.recover_authorization(&detail).await,
            Err(e) => {
                warn!(error = %e, "keepalive failed, reconnecting");
                self.set_status(ConnectionState::Degraded, Some(e.to_string()));
                let _ = self.connect().await;
            }
        }
    }

    /// Connect, then serve keepalive ticks and faults until `cancel` fires.
    /// The session is torn down on the way out.
    pub async fn run(&self, mut faults: mpsc::Receiver<FaultReport>, cancel: CancellationToken) {
        tokio::select! {
          biased;
          _ = cancel.cancelled() => {
            self.shutdown().await;
            return;
          }
          res = self.connect() => {
            if let Err(e) = res {
              warn!(error = %e, "initial connect failed, keepalive will retry");
            }
          }
        }

        let every = self.settings.keepalive_interval;
        let mut tick = tokio::time::interval_at(Instant::now() + every, every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
              biased;
              _ = cancel.cancelled() => break,
              Some(report) = faults.recv() => self.on_fault(report).await,
              _ = tick.tick() => self.keepalive().await,
            }
        }

        self.shutdown().await;
    }

    pub async fn shutdown(&self) {
        if let Some(pump) = self.session.lock().await.pump.take() {
            pump.stop();
        }
        if let Err(e) = with_timeout(
            self.settings.call_timeout,
            "disconnect",
            self.gateway.disconnect(),
        )
        .await
        {
            warn!(error = %e, "gateway disconnect failed");
        }
        self.set_status(ConnectionState::Disconnected, None);
        info!("gateway session closed");
    }

    /// Act on a fault unless it belongs to a session already replaced.
    async fn on_fault(&self, report: FaultReport) {
        let current = self.faults.session();
        if report.session != current {
            debug!(
                fault = ?report.fault,
                session = report.session,
                current,
                "ignoring fault from a replaced session"
            );
            return;
        }
        self.handle_fault(report.fault).await;
    }

    async fn handle_fault(&self, fault: Fault) {
        match fault {
            Fault::Authorization(detail) => self.recover_authorization(&detail).await,
            Fault::StreamLost(detail) => {
                warn!(error = %detail, "live stream lost, reconnecting");
                self.set_status(ConnectionState::Degraded, Some(detail));
                if let Some(pump) = self.session.lock().await.pump.take() {
                    pump.stop();
                }
                let _ = self.connect().await;
            }
        }
    }

    /// Full teardown and a fresh session; retrying the old one cannot help.
    async fn recover_authorization(&self, detail: &str) {
        let error = Error::Authorization(detail.to_string()).to_string();
        warn!(error = %error, "session rejected, rebuilding it");

        if let Some(pump) = self.session.lock().await.pump.take() {
            pump.stop();
        }
        self.set_status(ConnectionState::Disconnected, Some(error));

        let t = self.settings.call_timeout;
        if let Err(e) = with_timeout(t, "disconnect", self.gateway.disconnect()).await {
            debug!(error = %e, "disconnect during recovery failed");
        }
        let _ = self.connect().await;
    }

    /// Recent messages of the most recently active conversations, published
    /// oldest first with `is_sync = true`. Returns the number of events.
    async fn backfill(&self) -> usize {
        let t = self.settings.call_timeout;
        let k = self.settings.backfill_conversations;
        let m = self.settings.backfill_messages;

        let listing = self.gateway.recent_conversations(k);
        let conversations = match with_timeout(t, "recent_conversations", listing).await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "backfill skipped: conversation listing failed");
                return 0;
            }
        };

        let mut messages: Vec<RawMessage> = Vec::new();
        for conversation in conversations {
            let fetch = self.gateway.recent_messages(conversation, m);
            match with_timeout(t, "recent_messages", fetch).await {
                Ok(mut batch) => messages.append(&mut batch),
                Err(e) => {
                    warn!(conversation = %conversation, error = %e, "backfill skipped conversation")
                }
            }
        }
        messages.sort_by_key(|msg| (msg.date, msg.conversation, msg.message_id));

        let fetched = messages.len();
        let committed = self
            .pipeline
            .process_ordered(stream::iter(messages), true)
            .await;
        info!(fetched, committed, "backfill complete");
        committed
    }

    async fn ensure_live_pump(&self, session: &mut Session) {
        if session.pump.as_ref().is_some_and(LivePump::is_running) {
            return;
        }

        let t = self.settings.call_timeout;
        match with_timeout(t, "subscribe", self.gateway.subscribe()).await {
            Ok(rx) => {
                session.pump = Some(self.spawn_pump(rx));
                debug!("live pump started");
            }
            Err(Error::Authorization(detail)) => {
                let error = Error::Authorization(detail.clone()).to_string();
                warn!(error = %error, "live subscription rejected");
                self.set_status(ConnectionState::Degraded, Some(error));
                self.faults.report(Fault::Authorization(detail));
            }
            Err(e) => {
                warn!(error = %e, "live subscription failed");
                self.set_status(ConnectionState::Degraded, Some(e.to_string()));
            }
        }
    }

    fn spawn_pump(&self, rx: MessageStream) -> LivePump {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let pipeline = self.pipeline.clone();
        let faults = self.faults.clone();
        let session = faults.session();

        let handle = tokio::spawn(async move {
            tokio::select! {
              biased;
              _ = token.cancelled() => {}
              fault = pump_live(&pipeline, rx) => faults.report_for(session, fault).await,
            }
        });
        LivePump { cancel, handle }
    }

    fn set_status(&self, state: ConnectionState, error: Option<String>) {
        let next = GatewayStatus { state, error };
        let changed = self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next.clone();
            true
        });
        if changed {
            debug!(state = ?next.state, error = ?next.error, "gateway state changed");
        }
    }
}

/// Feed the live stream through the pipeline until it ends; the returned
/// fault says why it ended.
async fn pump_live(pipeline: &EventPipeline, rx: MessageStream) -> Fault {
    let failure: Arc<StdMutex<Option<Error>>> = Arc::default();

    let messages = stream::unfold((rx, failure.clone()), |(mut rx, slot)| async move {
        match rx.recv().await {
            Some(Ok(msg)) => Some((msg, (rx, slot))),
            Some(Err(e)) => {
                *slot.lock().unwrap_or_else(|p| p.into_inner()) = Some(e);
                None
            }
            None => None,
        }
    })
    .boxed();
    pipeline.process_ordered(messages, false).await;

    let failure = failure.lock().unwrap_or_else(|p| p.into_inner()).take();
    match failure {
        Some(Error::Authorization(detail)) => Fault::Authorization(detail),
        Some(e) => Fault::StreamLost(e.to_string()),
        None => Fault::StreamLost("live stream closed".to_string()),
    }
}
