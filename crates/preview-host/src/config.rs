use std::{
    net::{IpAddr, Ipv4Addr, UdpSocket},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;

const DEFAULT_CONFIG_PATH: &str = "preview.toml";

/// Process-wide settings. Read from an optional TOML file, then overridden by
/// `PREVIEW_*` environment variables.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub listen_port: u16,
    pub webhook_secret: String,
    pub github_token: Option<String>,
    /// Host name used in preview links.
    pub link_domain: String,
    pub internal_ip_override: Option<String>,
    pub min_port: u16,
    pub max_port: u16,
    /// 0 = unbounded.
    pub max_concurrent: usize,
    pub instance_open_hours: u64,
    /// Delay before acting on PR events so GitHub has produced a fresh archive.
    pub pr_idle_wait_ms: u64,
    pub site_root: PathBuf,
    pub site_subdir: String,
    pub bot_name: String,
    pub maintainer_login: Option<String>,
    pub server_command: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: 3000,
            webhook_secret: String::new(),
            github_token: None,
            link_domain: "localhost".to_string(),
            internal_ip_override: None,
            min_port: 4000,
            max_port: 4999,
            max_concurrent: 0,
            instance_open_hours: 6,
            pr_idle_wait_ms: 15_000,
            site_root: PathBuf::from("site_instances"),
            site_subdir: "docs".to_string(),
            bot_name: "EPSWebPreview".to_string(),
            maintainer_login: None,
            server_command: ["bundle", "exec", "jekyll", "serve"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl Config {
    /// Loads `$PREVIEW_CONFIG` (default `preview.toml`; a missing default file is
    /// fine), applies environment overrides and validates.
    pub fn load() -> anyhow::Result<Self> {
        let explicit = std::env::var("PREVIEW_CONFIG").ok();
        let path = PathBuf::from(explicit.as_deref().unwrap_or(DEFAULT_CONFIG_PATH));

        let mut config = if path.exists() || explicit.is_some() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<()> {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = get("PREVIEW_LISTEN_PORT") {
            self.listen_port = parse_env("PREVIEW_LISTEN_PORT", &v)?;
        }
        if let Some(v) = get("PREVIEW_WEBHOOK_SECRET") {
            self.webhook_secret = v;
        }
        if let Some(v) = get("PREVIEW_GITHUB_TOKEN").or_else(|| get("GITHUB_TOKEN")) {
            self.github_token = Some(v);
        }
        if let Some(v) = get("PREVIEW_LINK_DOMAIN") {
            self.link_domain = v;
        }
        if let Some(v) = get("PREVIEW_INTERNAL_IP") {
            self.internal_ip_override = Some(v);
        }
        if let Some(v) = get("PREVIEW_MIN_PORT") {
            self.min_port = parse_env("PREVIEW_MIN_PORT", &v)?;
        }
        if let Some(v) = get("PREVIEW_MAX_PORT") {
            self.max_port = parse_env("PREVIEW_MAX_PORT", &v)?;
        }
        if let Some(v) = get("PREVIEW_MAX_CONCURRENT") {
            self.max_concurrent = parse_env("PREVIEW_MAX_CONCURRENT", &v)?;
        }
        if let Some(v) = get("PREVIEW_OPEN_HOURS") {
            self.instance_open_hours = parse_env("PREVIEW_OPEN_HOURS", &v)?;
        }
        if let Some(v) = get("PREVIEW_PR_IDLE_WAIT_MS") {
            self.pr_idle_wait_ms = parse_env("PREVIEW_PR_IDLE_WAIT_MS", &v)?;
        }
        if let Some(v) = get("PREVIEW_SITE_ROOT") {
            self.site_root = PathBuf::from(v);
        }
        if let Some(v) = get("PREVIEW_BOT_NAME") {
            self.bot_name = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min_port == 0 || self.min_port > self.max_port {
            anyhow::bail!(
                "invalid port range {}-{}: need 1 <= min_port <= max_port",
                self.min_port,
                self.max_port
            );
        }
        if self.server_command.is_empty() {
            anyhow::bail!("server_command must be non-empty");
        }
        if self.instance_open_hours == 0 {
            anyhow::bail!("instance_open_hours must be at least 1");
        }
        if self.bot_name.trim().is_empty() {
            anyhow::bail!("bot_name must be non-empty");
        }
        if self.webhook_secret.is_empty() {
            tracing::warn!("webhook_secret is empty; webhook signatures will not be checked");
        }
        Ok(())
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.instance_open_hours.saturating_mul(60 * 60))
    }

    pub fn pr_idle_wait(&self) -> Duration {
        Duration::from_millis(self.pr_idle_wait_ms)
    }

    pub fn max_bindings(&self) -> Option<usize> {
        (self.max_concurrent > 0).then_some(self.max_concurrent)
    }

    /// Address preview servers bind to: the override when set, otherwise the
    /// host's primary internal address.
    pub fn bind_address(&self) -> anyhow::Result<IpAddr> {
        if let Some(raw) = &self.internal_ip_override {
            return raw
                .trim()
                .parse()
                .with_context(|| format!("invalid internal_ip_override: {raw}"));
        }
        Ok(detect_internal_ip().unwrap_or_else(|| {
            tracing::warn!("could not detect an internal IP; binding previews to 127.0.0.1");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }))
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> anyhow::Result<T> {
    value
        .parse::<T>()
        .map_err(|_| anyhow::anyhow!("invalid {name}: {value}"))
}

/// Picks the IPv4 address of the interface that routes outwards. Connecting a
/// UDP socket only consults the routing table; nothing is sent.
pub fn detect_internal_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(10, 254, 254, 254), 1)).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified() && !ip.is_loopback()).then_some(ip)
}
