//! Core domain + application logic for the Telegram signal bridge.
//!
//! This crate is framework-agnostic. Telegram / Gemini / the
//! WebSocket viewer channel live behind ports (traits) or thin adapter crates.

pub mod broadcast;
pub mod classifier;
pub mod config;
pub mod connection;
pub mod domain;
pub mod errors;
pub mod health;
pub mod history;
pub mod logging;
pub mod name_cache;
pub mod pipeline;
pub mod ports;
pub mod supervised;
pub mod utils;

#[cfg(test)]
pub(crate) mod testutil;

pub use errors::{Error, Result};
