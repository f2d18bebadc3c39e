#![allow(clippy::manual_unwrap_or_default)]
#![allow(clippy::manual_unwrap_or)]

pub mod broker;
pub mod candidates;
pub mod constants;
pub mod continuation;
pub mod engine;
pub mod fallback;
pub mod guardrails;
pub mod hardening;
pub mod health;
pub mod ingress;
pub mod json_repair;
pub mod language;
pub mod logging;
pub mod main_helper;
pub mod media;
pub mod redaction;
pub mod server;
pub mod specs;
pub mod str_utils;
pub mod streaming;
pub mod transport;
pub mod types;

pub use types::*;

pub use main_helper::{AppState, Args};
