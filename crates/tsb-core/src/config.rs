use std::{env, fs, path::Path, time::Duration};

use crate::{errors::Error, Result};

pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash-lite";
pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Typed configuration for the bridge.
///
/// Missing credentials are not load errors: the affected subsystem reports
/// OFFLINE with a reason instead. Malformed values are.
#[derive(Clone, Debug)]
pub struct Config {
    // Gateway
    pub session_credential: Option<String>,
    pub api_id: Option<i32>,
    pub api_hash: Option<String>,
    pub target_conversation: Option<String>,

    // Classifier
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub gemini_base_url: String,

    // Viewer listener
    pub bind_addr: String,
    pub port: u16,

    // Tunables
    pub history_limit: usize,
    pub health_interval: Duration,
    pub keepalive_interval: Duration,
    pub upstream_timeout: Duration,
    pub classifier_timeout: Duration,
    pub backfill_conversations: usize,
    pub backfill_messages: usize,
    pub classify_concurrency: usize,
    pub classification_cache_size: usize,
    pub viewer_queue_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            session_credential: None,
            api_id: None,
            api_hash: None,
            target_conversation: None,
            gemini_api_key: None,
            gemini_model: DEFAULT_GEMINI_MODEL.to_string(),
            gemini_base_url: DEFAULT_GEMINI_BASE_URL.to_string(),
            bind_addr: "0.0.0.0".to_string(),
            port: 2000,
            history_limit: 50,
            health_interval: Duration::from_secs(15),
            keepalive_interval: Duration::from_secs(60),
            upstream_timeout: Duration::from_secs(15),
            classifier_timeout: Duration::from_secs(20),
            backfill_conversations: 10,
            backfill_messages: 5,
            classify_concurrency: 4,
            classification_cache_size: 0,
            viewer_queue_size: 256,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup (the process env in `load()`).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let d = Self::default();
        let get = |key: &str| lookup(key).and_then(non_empty);

        let api_id = match get("TG_API_ID") {
            Some(v) => Some(parse_num::<i32>("TG_API_ID", &v)?),
            None => None,
        };

        let port = match get("PORT") {
            Some(v) => parse_num::<u16>("PORT", &v)?,
            None => d.port,
        };

        let cfg = Self {
            session_credential: get("TG_SESSION"),
            api_id,
            api_hash: get("TG_API_HASH"),
            target_conversation: get("TARGET_CHANNEL"),

            gemini_api_key: get("GEMINI_API_KEY"),
            gemini_model: get("GEMINI_MODEL").unwrap_or(d.gemini_model),
            gemini_base_url: get("GEMINI_BASE_URL")
                .map(|s| s.trim_end_matches('/').to_string())
                .unwrap_or(d.gemini_base_url),

            bind_addr: get("BIND_ADDR").unwrap_or(d.bind_addr),
            port,

            history_limit: positive(&get, "HISTORY_LIMIT", d.history_limit)?,
            health_interval: millis(&get, "HEALTH_CHECK_INTERVAL_MS", d.health_interval)?,
            keepalive_interval: millis(&get, "KEEPALIVE_INTERVAL_MS", d.keepalive_interval)?,
            upstream_timeout: millis(&get, "UPSTREAM_TIMEOUT_MS", d.upstream_timeout)?,
            classifier_timeout: millis(&get, "CLASSIFIER_TIMEOUT_MS", d.classifier_timeout)?,
            backfill_conversations: positive(
                &get,
                "BACKFILL_CONVERSATIONS",
                d.backfill_conversations,
            )?,
            backfill_messages: positive(&get, "BACKFILL_MESSAGES", d.backfill_messages)?,
            classify_concurrency: positive(&get, "CLASSIFY_CONCURRENCY", d.classify_concurrency)?,
            // 0 disables the cache, so no positivity check here.
            classification_cache_size: match get("CLASSIFICATION_CACHE_SIZE") {
                Some(v) => parse_num::<usize>("CLASSIFICATION_CACHE_SIZE", &v)?,
                None => d.classification_cache_size,
            },
            viewer_queue_size: positive(&get, "VIEWER_QUEUE_SIZE", d.viewer_queue_size)?,
        };

        Ok(cfg)
    }

    /// `host:port` the viewer listener binds to.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| Error::Config(format!("{key} must be a number, got {raw:?}")))
}

fn positive(get: &impl Fn(&str) -> Option<String>, key: &str, default: usize) -> Result<usize> {
    let Some(raw) = get(key) else {
        return Ok(default);
    };
    let v = parse_num::<usize>(key, &raw)?;
    if v == 0 {
        return Err(Error::Config(format!("{key} must be greater than zero")));
    }
    Ok(v)
}

fn millis(get: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Result<Duration> {
    let Some(raw) = get(key) else {
        return Ok(default);
    };
    let v = parse_num::<u64>(key, &raw)?;
    if v == 0 {
        return Err(Error::Config(format!("{key} must be greater than zero")));
    }
    Ok(Duration::from_millis(v))
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for (key, val) in parse_dotenv(&contents) {
        if env::var_os(&key).is_some() {
            continue; // do not override existing env
        }
        env::set_var(key, val);
    }
}

fn parse_dotenv(contents: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        out.push((key.to_string(), val));
    }
    out
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
