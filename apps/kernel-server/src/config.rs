// [[CONDUIT]]/apps/kernel-server/src/config.rs
// Purpose: Process configuration, read once from the environment at boot.
// Architecture: Application Boot
// Dependencies: anyhow

use anyhow::{bail, Context};
use std::str::FromStr;
use std::time::Duration;

use crate::models::Retention;
use crate::runtime::DispatchSettings;

/// Which concrete stores and executor the kernel runs with. Chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Redis persistence and the remote agent service
    Live,
    /// In-memory stores and the scripted executor
    Mock,
}

impl FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "live" => Ok(Backend::Live),
            "mock" => Ok(Backend::Mock),
            other => bail!("unknown backend '{}' (expected 'live' or 'mock')", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub port: u16,
    pub api_key: Option<String>,
    pub backend: Backend,
    pub redis_url: Option<String>,
    pub agent_url: String,
    pub dispatch: DispatchSettings,
    pub event_bus_capacity: usize,
    pub connection_buffer: usize,
    pub retention: Retention,
    pub ws_idle_timeout: Duration,
    pub ws_write_timeout: Duration,
    pub http_timeout: Duration,
    pub mock_step_delay: Duration,
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            port: 3000,
            api_key: None,
            backend: Backend::Mock,
            redis_url: None,
            agent_url: "http://127.0.0.1:8000".to_string(),
            dispatch: DispatchSettings::default(),
            event_bus_capacity: 1024,
            connection_buffer: 256,
            retention: Retention::default(),
            ws_idle_timeout: Duration::from_secs(60),
            ws_write_timeout: Duration::from_secs(10),
            http_timeout: Duration::from_secs(30),
            mock_step_delay: Duration::from_millis(250),
        }
    }
}

impl KernelConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = KernelConfig::default();

        if let Some(port) = get("KERNEL_PORT") {
            config.port = parse(&port, "KERNEL_PORT")?;
        }
        config.api_key = get("KERNEL_API_KEY");
        if let Some(backend) = get("KERNEL_BACKEND") {
            config.backend = backend.parse().context("KERNEL_BACKEND")?;
        }
        config.redis_url = get("REDIS_URL");

        let host = get("AGENT_HOST").unwrap_or_else(|| "127.0.0.1".to_string());
        let agent_port = get("AGENT_PORT").unwrap_or_else(|| "8000".to_string());
        config.agent_url = format!("http://{}:{}", host, agent_port);

        if let Some(v) = get("KERNEL_WORKERS") {
            config.dispatch.workers = parse(&v, "KERNEL_WORKERS")?;
        }
        if let Some(v) = get("KERNEL_QUEUE_CAPACITY") {
            config.dispatch.queue_capacity = parse(&v, "KERNEL_QUEUE_CAPACITY")?;
        }
        if let Some(v) = get("KERNEL_EVENT_BUS_CAPACITY") {
            config.event_bus_capacity = parse(&v, "KERNEL_EVENT_BUS_CAPACITY")?;
        }
        if let Some(v) = get("KERNEL_CONNECTION_BUFFER") {
            config.connection_buffer = parse(&v, "KERNEL_CONNECTION_BUFFER")?;
        }
        if let Some(v) = get("KERNEL_TASK_RETENTION_SECS") {
            config.retention.terminal = Duration::from_secs(parse(&v, "KERNEL_TASK_RETENTION_SECS")?);
        }
        if let Some(v) = get("KERNEL_PHANTOM_TTL_SECS") {
            config.retention.phantom = Duration::from_secs(parse(&v, "KERNEL_PHANTOM_TTL_SECS")?);
        }
        if let Some(v) = get("KERNEL_WS_IDLE_TIMEOUT_SECS") {
            config.ws_idle_timeout = Duration::from_secs(parse(&v, "KERNEL_WS_IDLE_TIMEOUT_SECS")?);
        }
        if let Some(v) = get("KERNEL_WS_WRITE_TIMEOUT_SECS") {
            config.ws_write_timeout = Duration::from_secs(parse(&v, "KERNEL_WS_WRITE_TIMEOUT_SECS")?);
        }
        if let Some(v) = get("KERNEL_HTTP_TIMEOUT_SECS") {
            config.http_timeout = Duration::from_secs(parse(&v, "KERNEL_HTTP_TIMEOUT_SECS")?);
        }
        if let Some(v) = get("KERNEL_MOCK_STEP_DELAY_MS") {
            config.mock_step_delay = Duration::from_millis(parse(&v, "KERNEL_MOCK_STEP_DELAY_MS")?);
        }

        if config.backend == Backend::Live && config.redis_url.is_none() {
            bail!("REDIS_URL must be set when KERNEL_BACKEND=live");
        }
        if config.dispatch.workers == 0 {
            bail!("KERNEL_WORKERS must be at least 1");
        }

        Ok(config)
    }
}

fn parse<T>(value: &str, key: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| anyhow::anyhow!("invalid {} '{}': {}", key, value, e))
}
