use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

use crate::broker::Broker;
use crate::candidates::ModelPool;
use crate::constants::*;
use crate::hardening::RetryPolicy;
use crate::transport::Transport;
use crate::types::*;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, default_value_t = 8080)]
    pub port: u16,
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value = GEMINI_BASE_URL)]
    pub upstream_base_url: String,
    /// Ranked model pool, most capable first.
    #[arg(long, value_delimiter = ',', default_values_t = DEFAULT_MODEL_POOL.iter().map(|m| m.to_string()))]
    pub models: Vec<String>,
    #[arg(long, default_value_t = 300)]
    pub request_timeout_secs: u64,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
    #[arg(long, default_value_t = 50 * 1024 * 1024)]
    pub max_body_size: usize,
    #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS)]
    pub max_retries: u32,
    #[arg(long, default_value_t = DEFAULT_RETRY_BASE_MS)]
    pub retry_base_ms: u64,
    #[arg(long, default_value_t = DEFAULT_HEARTBEAT_MS)]
    pub heartbeat_ms: u64,
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_MS)]
    pub default_timeout_ms: u64,
}

impl Default for Args {
    fn default() -> Self {
        Self::parse_from(["parley"])
    }
}

pub struct AppState {
    pub broker: Broker,
    pub max_body_size: usize,
}

impl AppState {
    pub fn from_args(args: &Args, transport: Arc<dyn Transport>) -> Result<Self> {
        let pool = ModelPool::new(args.models.iter().cloned())?;
        let broker = Broker::new(transport, pool)
            .with_retry(RetryPolicy::new(args.max_retries, args.retry_base_ms))
            .with_heartbeat(Duration::from_millis(args.heartbeat_ms))
            .with_default_timeout(Duration::from_millis(
                args.default_timeout_ms.clamp(MIN_TIMEOUT_MS, MAX_TIMEOUT_MS),
            ));
        Ok(Self {
            broker,
            max_body_size: args.max_body_size,
        })
    }
}
