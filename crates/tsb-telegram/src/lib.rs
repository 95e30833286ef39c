//! Telegram adapter (teloxide).
//!
//! Implements the `tsb-core` GatewayPort over the Telegram Bot API. The
//! session credential (`TG_SESSION`) is the bot token; the bot has to be a
//! member of the conversations it should watch.

use std::{
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use teloxide::{
    prelude::*,
    types::{AllowedUpdate, Chat, Recipient, Update, UpdateKind},
    ApiError, RequestError,
};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, info, warn};

use tsb_core::{
    config::Config,
    domain::{ConversationId, MessageId, RawMessage},
    errors::Error,
    ports::{GatewayPort, MessageStream},
    Result,
};

pub mod backlog;

use backlog::Backlog;

/// Long-poll window per `getUpdates` call, below the client's HTTP timeout.
const LONG_POLL_SECS: u32 = 10;
const POLL_RETRY_DELAY: Duration = Duration::from_secs(2);
/// Consecutive poll failures before the stream reports the connection lost.
const MAX_POLL_FAILURES: u32 = 3;
const LIVE_QUEUE: usize = 256;

#[derive(Default)]
struct State {
    bot: Option<Bot>,
    backlog: Backlog,
    /// Set once the startup backlog has been taken; later reconnects leave
    /// queued updates to the live poller.
    backlog_taken: bool,
    poller: Option<JoinHandle<()>>,
}

impl State {
    fn stop_poller(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
    }
}

pub struct TelegramGateway {
    token: Option<String>,
    api_url: Option<reqwest::Url>,
    /// Next `getUpdates` offset, shared with the poller.
    offset: Arc<AtomicI32>,
    state: Mutex<State>,
}

impl TelegramGateway {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token,
            api_url: None,
            offset: Arc::new(AtomicI32::new(0)),
            state: Mutex::new(State::default()),
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(cfg.session_credential.clone())
    }

    /// Talk to a Bot API server other than `api.telegram.org`.
    pub fn with_api_url(mut self, url: reqwest::Url) -> Self {
        self.api_url = Some(url);
        self
    }

    async fn bot(&self) -> Result<Bot> {
        self.state
            .lock()
            .await
            .bot
            .clone()
            .ok_or_else(|| Error::Connectivity("telegram session is not connected".to_string()))
    }
}

#[async_trait]
impl GatewayPort for TelegramGateway {
    async fn connect(&self) -> Result<()> {
        let token = self
            .token
            .clone()
            .ok_or_else(|| Error::Config("TG_SESSION is not set".to_string()))?;

        let mut bot = Bot::new(token);
        if let Some(url) = &self.api_url {
            bot = bot.set_api_url(url.clone());
        }
        let me = bot.get_me().await.map_err(map_err)?;
        info!(username = ?me.user.username, "telegram session ready");

        let mut st = self.state.lock().await;
        st.stop_poller();

        // Updates queued before startup feed the one-time backfill. After
        // that the offset stays put so the poller delivers them live.
        if !st.backlog_taken {
            let pending = bot
                .get_updates()
                .offset(self.offset.load(Ordering::SeqCst))
                .timeout(0)
                .allowed_updates(allowed_updates())
                .await
                .map_err(map_err)?;
            for update in &pending {
                self.offset.store(update.id + 1, Ordering::SeqCst);
                if let Some(msg) = raw_message(update) {
                    st.backlog.push(msg);
                }
            }
            st.backlog_taken = true;
            debug!(backlog = st.backlog.len(), "pending updates snapshotted");
        }

        st.bot = Some(bot);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut st = self.state.lock().await;
        st.stop_poller();
        st.bot = None;
        Ok(())
    }

    async fn whoami(&self) -> Result<String> {
        let me = self.bot().await?.get_me().await.map_err(map_err)?;
        Ok(me
            .user
            .username
            .clone()
            .unwrap_or_else(|| me.user.first_name.clone()))
    }

    async fn recent_conversations(&self, limit: usize) -> Result<Vec<ConversationId>> {
        Ok(self.state.lock().await.backlog.recent_conversations(limit))
    }

    async fn recent_messages(
        &self,
        conversation: ConversationId,
        limit: usize,
    ) -> Result<Vec<RawMessage>> {
        Ok(self
            .state
            .lock()
            .await
            .backlog
            .recent_messages(conversation, limit))
    }

    async fn subscribe(&self) -> Result<MessageStream> {
        let mut st = self.state.lock().await;
        let bot = st
            .bot
            .clone()
            .ok_or_else(|| Error::Connectivity("telegram session is not connected".to_string()))?;

        st.stop_poller();
        let (tx, rx) = mpsc::channel(LIVE_QUEUE);
        st.poller = Some(tokio::spawn(poll_updates(bot, self.offset.clone(), tx)));
        Ok(rx)
    }

    async fn resolve_title(&self, conversation: ConversationId) -> Result<String> {
        let chat = self
            .bot()
            .await?
            .get_chat(teloxide::types::ChatId(conversation.0))
            .await
            .map_err(map_err)?;
        chat_title(&chat)
            .ok_or_else(|| Error::Resolution(format!("conversation {conversation} has no name")))
    }

    async fn join(&self, target: &str) -> Result<()> {
        // Bots cannot join by themselves; verify the membership instead.
        let chat = self
            .bot()
            .await?
            .get_chat(parse_target(target))
            .await
            .map_err(map_err)?;
        info!(
            channel = target,
            title = chat_title(&chat).unwrap_or_default(),
            "target conversation reachable"
        );
        Ok(())
    }
}

async fn poll_updates(bot: Bot, offset: Arc<AtomicI32>, tx: mpsc::Sender<Result<RawMessage>>) {
    let mut failures = 0u32;
    loop {
        let res = bot
            .get_updates()
            .offset(offset.load(Ordering::SeqCst))
            .timeout(LONG_POLL_SECS)
            .allowed_updates(allowed_updates())
            .await;

        match res {
            Ok(updates) => {
                failures = 0;
                for update in updates {
                    offset.store(update.id + 1, Ordering::SeqCst);
                    let Some(msg) = raw_message(&update) else {
                        continue;
                    };
                    if tx.send(Ok(msg)).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                let err = map_err(e);
                failures += 1;
                if err.is_authorization() || failures >= MAX_POLL_FAILURES {
                    let _ = tx.send(Err(err)).await;
                    return;
                }
                warn!(error = %err, failures, "getUpdates failed, retrying");
                if tx.is_closed() {
                    return;
                }
                sleep(POLL_RETRY_DELAY).await;
            }
        }
    }
}

fn allowed_updates() -> Vec<AllowedUpdate> {
    vec![AllowedUpdate::Message, AllowedUpdate::ChannelPost]
}

/// New messages and channel posts; the caption stands in for media messages.
fn raw_message(update: &Update) -> Option<RawMessage> {
    let msg = match &update.kind {
        UpdateKind::Message(m) | UpdateKind::ChannelPost(m) => m,
        _ => return None,
    };
    Some(RawMessage {
        conversation: ConversationId(msg.chat.id.0),
        message_id: MessageId(msg.id.0),
        text: msg.text().or_else(|| msg.caption()).map(str::to_string),
        date: msg.date,
    })
}

fn chat_title(chat: &Chat) -> Option<String> {
    if let Some(title) = chat.title() {
        return Some(title.to_string());
    }
    if let Some(username) = chat.username() {
        return Some(format!("@{username}"));
    }
    let name = [chat.first_name(), chat.last_name()]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ");
    (!name.is_empty()).then_some(name)
}

/// `-100123`, `@name`, `name` or a `t.me/name` link.
fn parse_target(target: &str) -> Recipient {
    let target = target.trim();
    if let Ok(id) = target.parse::<i64>() {
        return Recipient::Id(teloxide::types::ChatId(id));
    }
    let name = target
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_start_matches("t.me/")
        .trim_start_matches('@')
        .trim_end_matches('/');
    Recipient::ChannelUsername(format!("@{name}"))
}

fn map_err(e: RequestError) -> Error {
    match e {
        RequestError::Api(ApiError::NotFound) => {
            Error::Authorization("telegram rejected the bot token".to_string())
        }
        RequestError::Network(e) => Error::Connectivity(format!("telegram network error: {e}")),
        RequestError::Io(e) => Error::Connectivity(format!("telegram i/o error: {e}")),
        other => Error::External(format!("telegram error: {other}")),
    }
}
