use anyhow::{Context, Result};
use std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

/// Runtime configuration, read from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub db_path: PathBuf,
    /// Upper bound for enqueueing one message onto one connection.
    pub send_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// A connection that sends nothing (not even a pong) for this long is closed.
    pub idle_timeout: Duration,
    pub outbound_queue: usize,
    pub max_message_len: usize,
    /// Deliver a sender's messages to their other open connections as well.
    pub echo_to_sender: bool,
    pub session_ttl: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let home_dir = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            db_path: PathBuf::from(home_dir).join(".courier").join("courier.db"),
            send_timeout: Duration::from_millis(2000),
            heartbeat_interval: Duration::from_secs(20),
            idle_timeout: Duration::from_secs(60),
            outbound_queue: 64,
            max_message_len: 4096,
            echo_to_sender: true,
            session_ttl: Duration::from_secs(168 * 3600),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(addr) = parse(&lookup, "COURIER_BIND")? {
            config.bind_addr = addr;
        }
        if let Some(path) = lookup("COURIER_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(ms) = parse::<u64>(&lookup, "COURIER_SEND_TIMEOUT_MS")? {
            config.send_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = parse::<u64>(&lookup, "COURIER_HEARTBEAT_SECS")? {
            config.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64>(&lookup, "COURIER_IDLE_TIMEOUT_SECS")? {
            config.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(size) = parse(&lookup, "COURIER_OUTBOUND_QUEUE")? {
            config.outbound_queue = size;
        }
        if let Some(len) = parse(&lookup, "COURIER_MAX_MESSAGE_LEN")? {
            config.max_message_len = len;
        }
        if let Some(echo) = parse(&lookup, "COURIER_ECHO_TO_SENDER")? {
            config.echo_to_sender = echo;
        }
        if let Some(hours) = parse::<u64>(&lookup, "COURIER_SESSION_TTL_HOURS")? {
            config.session_ttl = Duration::from_secs(hours * 3600);
        }

        anyhow::ensure!(config.outbound_queue > 0, "COURIER_OUTBOUND_QUEUE must be positive");
        anyhow::ensure!(
            !config.heartbeat_interval.is_zero(),
            "COURIER_HEARTBEAT_SECS must be positive"
        );
        anyhow::ensure!(
            config.heartbeat_interval < config.idle_timeout,
            "COURIER_HEARTBEAT_SECS must be shorter than COURIER_IDLE_TIMEOUT_SECS"
        );

        Ok(config)
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("Invalid value for {}: {:?}", key, raw))
        })
        .transpose()
}
