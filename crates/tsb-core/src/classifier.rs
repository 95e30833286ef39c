//! Trade-signal classification on top of a [`GenerativeModel`].
//!
//! `classify` is total: every failure mode (service error, timeout, empty or
//! malformed response) is encoded into a negative [`Analysis`] with a reason.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, OnceLock},
    time::Duration,
};

use regex::Regex;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::{
    domain::{Action, Analysis},
    ports::GenerativeModel,
    utils::{truncate_text, with_timeout},
    Result,
};

const NOT_A_SIGNAL: &str = "not a signal";
const PARSE_ERROR: &str = "parse error";
const MAX_REASON_LEN: usize = 200;

pub struct Classifier {
    model: Arc<dyn GenerativeModel>,
    timeout: Duration,
    cache: Option<Mutex<ResultCache>>,
}

impl Classifier {
    pub fn new(model: Arc<dyn GenerativeModel>, timeout: Duration) -> Self {
        Self {
            model,
            timeout,
            cache: None,
        }
    }

    /// Remember parsed results per identical text. `0` leaves caching off.
    pub fn with_cache(mut self, capacity: usize) -> Self {
        self.cache = (capacity > 0).then(|| Mutex::new(ResultCache::new(capacity)));
        self
    }

    pub async fn classify(&self, text: &str) -> Analysis {
        let key = self.cache.as_ref().map(|_| cache_key(text));
        if let (Some(cache), Some(key)) = (&self.cache, &key) {
            if let Some(hit) = cache.lock().unwrap_or_else(|e| e.into_inner()).get(key) {
                debug!("classification cache hit");
                return hit;
            }
        }

        let prompt = build_prompt(text);
        let response =
            with_timeout(self.timeout, "classification", self.model.generate(&prompt)).await;

        let reply = match response {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "classification call failed");
                return Analysis::negative(truncate_text(&e.to_string(), MAX_REASON_LEN));
            }
        };

        match parse_analysis(&reply) {
            Ok(analysis) => {
                if let (Some(cache), Some(key)) = (&self.cache, key) {
                    cache
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(key, analysis.clone());
                }
                analysis
            }
            Err(reason) => {
                warn!(reason = %reason, "unparseable classifier response");
                Analysis::negative(reason)
            }
        }
    }

    /// Minimal reachability round trip, bounded by the classifier timeout.
    pub async fn check(&self) -> Result<()> {
        with_timeout(self.timeout, "classifier ping", self.model.ping()).await
    }

    pub async fn ping(&self) -> bool {
        self.check().await.is_ok()
    }
}

pub fn build_prompt(text: &str) -> String {
    format!(
        r#"You classify chat messages as trading signals.
A signal names an instrument/pair, an action (BUY or SELL), a stop-loss (SL) and at least one take-profit target (TP).
Return ONLY a JSON object, no prose and no markdown, with exactly this shape:
{{"is_signal": boolean, "pair": "string", "action": "BUY"|"SELL", "sl": "string", "tp": ["string"], "confidence": number between 0 and 1, "rationale": "string"}}
If the message is not a signal return {{"is_signal": false, "rationale": "string"}}.

Message:
"""
{text}
""""#
    )
}

/// Remove markdown code fences (```json / ```) around a model reply.
pub fn strip_code_fences(raw: &str) -> String {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    let re = FENCE.get_or_init(|| Regex::new(r"(?i)```(?:json)?").expect("valid regex"));
    re.replace_all(raw, "").trim().to_string()
}

/// Parse and validate a model reply.
///
/// `Ok` means the reply was a well-formed object (the analysis may still be
/// negative). `Err` carries a `parse error` reason.
pub fn parse_analysis(raw: &str) -> std::result::Result<Analysis, String> {
    let cleaned = strip_code_fences(raw);
    if cleaned.is_empty() {
        return Err(format!("{PARSE_ERROR}: empty response"));
    }

    let value = match serde_json::from_str::<Value>(&cleaned) {
        Ok(v) => v,
        // Some replies wrap the object in prose despite the prompt.
        Err(e) => match outermost_object(&cleaned).and_then(|s| serde_json::from_str(s).ok()) {
            Some(v) => v,
            None => return Err(format!("{PARSE_ERROR}: {e}")),
        },
    };

    let Some(obj) = value.as_object() else {
        return Err(format!("{PARSE_ERROR}: response is not a JSON object"));
    };

    let is_signal = match obj.get("is_signal") {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) if s.eq_ignore_ascii_case("true") => true,
        Some(Value::String(s)) if s.eq_ignore_ascii_case("false") => false,
        _ => return Err(format!("{PARSE_ERROR}: missing is_signal")),
    };

    let rationale = text_field(obj, "rationale");
    if !is_signal {
        return Ok(Analysis {
            rationale,
            ..Analysis::negative(NOT_A_SIGNAL)
        });
    }

    let pair = text_field(obj, "pair").map(|p| p.to_uppercase());
    let action = text_field(obj, "action").and_then(|a| match a.to_uppercase().as_str() {
        "BUY" => Some(Action::Buy),
        "SELL" => Some(Action::Sell),
        _ => None,
    });
    let sl = text_field(obj, "sl");
    let tp = match obj.get("tp") {
        Some(Value::Array(items)) => items.iter().filter_map(scalar_text).collect(),
        Some(v) => scalar_text(v).into_iter().collect(),
        None => Vec::new(),
    };
    let confidence = match obj.get("confidence") {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|c| (0.0..=1.0).contains(c));

    let mut missing = Vec::new();
    if pair.is_none() {
        missing.push("pair");
    }
    if action.is_none() {
        missing.push("action");
    }
    if sl.is_none() {
        missing.push("sl");
    }
    if tp.is_empty() {
        missing.push("tp");
    }
    if !missing.is_empty() {
        return Ok(Analysis {
            rationale,
            ..Analysis::negative(format!("incomplete signal: missing {}", missing.join(", ")))
        });
    }

    Ok(Analysis {
        is_signal: true,
        pair,
        action,
        sl,
        tp,
        confidence,
        rationale,
        reason: None,
    })
}

fn outermost_object(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let end = s.rfind('}')?;
    (end > start).then(|| &s[start..=end])
}

fn text_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(scalar_text)
}

/// Strings and numbers both count as text (`"sl": 1.08` is common).
fn scalar_text(v: &Value) -> Option<String> {
    let s = match v {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!s.is_empty()).then_some(s)
}

fn cache_key(text: &str) -> [u8; 32] {
    Sha256::digest(text.trim().as_bytes()).into()
}

/// Bounded FIFO map of text digest -> parsed analysis.
struct ResultCache {
    capacity: usize,
    entries: HashMap<[u8; 32], Analysis>,
    order: VecDeque<[u8; 32]>,
}

impl ResultCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, key: &[u8; 32]) -> Option<Analysis> {
        self.entries.get(key).cloned()
    }

    fn insert(&mut self, key: [u8; 32], analysis: Analysis) {
        if self.entries.insert(key, analysis).is_none() {
            self.order.push_back(key);
        }
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.entries.remove(&old);
            }
        }
    }
}
