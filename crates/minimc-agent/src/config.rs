use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::Context;

use crate::launch::LaunchSpec;

const DEFAULT_BIND: &str = "0.0.0.0:8080";
const DEFAULT_DATA_DIR: &str = "./minecraft";
const DEFAULT_PAPER_API_URL: &str = "https://api.papermc.io/v2";
const DEFAULT_LOG_MAX_LINES: usize = 1000;
const DEFAULT_SUBSCRIBER_BUFFER: usize = 100;
const DEFAULT_COMMAND_QUEUE: usize = 100;
const DEFAULT_SHUTDOWN_GRACE_SEC: u64 = 30;

/// Agent settings, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub bind: SocketAddr,
    pub data_dir: PathBuf,
    pub web_dir: Option<PathBuf>,
    pub username: String,
    pub password: String,
    /// `None` means "latest"; `MC_VERSION=no_version` is treated the same way.
    pub mc_version: Option<String>,
    pub paper_api_url: String,
    pub skip_provision: bool,
    pub java_bin: String,
    pub min_heap: String,
    pub max_heap: String,
    pub log_max_lines: usize,
    pub subscriber_buffer: usize,
    pub command_queue: usize,
    pub shutdown_grace: Duration,
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn parse_bool(v: Option<String>) -> bool {
    matches!(
        v.unwrap_or_default().trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_usize(v: Option<String>, min: usize, max: usize, default: usize) -> usize {
    v.and_then(|s| s.trim().parse::<usize>().ok())
        .map(|n| n.clamp(min, max))
        .unwrap_or(default)
}

fn parse_u64(v: Option<String>, min: u64, max: u64, default: u64) -> u64 {
    v.and_then(|s| s.trim().parse::<u64>().ok())
        .map(|n| n.clamp(min, max))
        .unwrap_or(default)
}

fn is_heap_size(s: &str) -> bool {
    let digits = s.trim_end_matches(['k', 'K', 'm', 'M', 'g', 'G']);
    !digits.is_empty() && digits.len() + 1 >= s.len() && digits.chars().all(|c| c.is_ascii_digit())
}

impl AgentConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup so tests don't have to touch the
    /// process environment.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let bind_raw = non_empty(get("MINIMC_BIND")).unwrap_or_else(|| DEFAULT_BIND.to_string());
        let bind: SocketAddr = bind_raw
            .parse()
            .with_context(|| format!("invalid MINIMC_BIND: {bind_raw}"))?;

        let username = non_empty(get("MINIMC_USERNAME"))
            .ok_or_else(|| anyhow::anyhow!("MINIMC_USERNAME is required"))?;
        let password = non_empty(get("MINIMC_PASSWORD"))
            .ok_or_else(|| anyhow::anyhow!("MINIMC_PASSWORD is required"))?;

        let mc_version = non_empty(get("MC_VERSION")).filter(|v| v != "no_version");

        let min_heap = non_empty(get("MINIMC_MIN_HEAP")).unwrap_or_else(|| "2G".to_string());
        let max_heap = non_empty(get("MINIMC_MAX_HEAP")).unwrap_or_else(|| "4G".to_string());
        for (key, v) in [("MINIMC_MIN_HEAP", &min_heap), ("MINIMC_MAX_HEAP", &max_heap)] {
            if !is_heap_size(v) {
                anyhow::bail!("invalid {key}: {v} (expected e.g. 512M or 4G)");
            }
        }

        Ok(Self {
            bind,
            data_dir: non_empty(get("MINIMC_DATA_DIR"))
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
            web_dir: non_empty(get("MINIMC_WEB_DIR")).map(PathBuf::from),
            username,
            password,
            mc_version,
            paper_api_url: non_empty(get("MINIMC_PAPER_API_URL"))
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_PAPER_API_URL.to_string()),
            skip_provision: parse_bool(get("MINIMC_SKIP_PROVISION")),
            java_bin: non_empty(get("MINIMC_JAVA_BIN")).unwrap_or_else(|| "java".to_string()),
            min_heap,
            max_heap,
            log_max_lines: parse_usize(
                get("MINIMC_LOG_MAX_LINES"),
                100,
                50_000,
                DEFAULT_LOG_MAX_LINES,
            ),
            subscriber_buffer: parse_usize(
                get("MINIMC_SUBSCRIBER_BUFFER"),
                16,
                10_000,
                DEFAULT_SUBSCRIBER_BUFFER,
            ),
            command_queue: parse_usize(
                get("MINIMC_COMMAND_QUEUE"),
                1,
                10_000,
                DEFAULT_COMMAND_QUEUE,
            ),
            shutdown_grace: Duration::from_secs(parse_u64(
                get("MINIMC_SHUTDOWN_GRACE_SEC"),
                1,
                600,
                DEFAULT_SHUTDOWN_GRACE_SEC,
            )),
        })
    }

    pub fn launch_spec(&self) -> LaunchSpec {
        LaunchSpec::paper(
            &self.java_bin,
            &self.min_heap,
            &self.max_heap,
            self.data_dir.clone(),
        )
    }
}
