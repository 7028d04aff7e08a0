#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::{info, warn};
use vkxmpp_remote::SecretString;
use vkxmpp_remote::http::DEFAULT_API_BASE_URL;
use vkxmpp_remote::longpoll::{DEFAULT_POLL_MARGIN_SECS, DEFAULT_POLL_WAIT_SECS};

/// Default config path: `~/.vkxmpp/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".vkxmpp").join("config.toml"))
}

/// Load the gateway config from TOML and env overrides.
pub fn load_gateway_config_from_path(path: &Path) -> anyhow::Result<GatewayConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = GatewayConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RestartMode {
	/// Reconnect in-process after a backoff.
	#[default]
	Reconnect,
	/// Exit with status 3 and let the supervisor restart us.
	Exit,
}

impl FromStr for RestartMode {
	type Err = anyhow::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"reconnect" => Ok(Self::Reconnect),
			"exit" => Ok(Self::Exit),
			other => Err(anyhow!("unknown restart_mode {other:?} (expected reconnect|exit)")),
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
	pub component: ComponentSettings,
	pub remote: RemoteSettings,
	pub sessions: SessionDefaults,
	pub persistence: PersistenceSettings,
	pub server: ServerSettings,
}

/// External component (XEP-0114) connection.
#[derive(Debug, Clone)]
pub struct ComponentSettings {
	/// Gateway JID (a bare domain).
	pub jid: String,
	pub host: String,
	pub port: u16,
	pub secret: SecretString,
	/// MUC service used for bridged chats; groupchats are disabled without it.
	pub conference_domain: Option<String>,
	pub restart_mode: RestartMode,
	/// Delay before reconnecting after a lost connection.
	pub restart_delay: Duration,
}

impl Default for ComponentSettings {
	fn default() -> Self {
		Self {
			jid: String::new(),
			host: "127.0.0.1".to_string(),
			port: 5347,
			secret: SecretString::new(String::new()),
			conference_domain: None,
			restart_mode: RestartMode::Reconnect,
			restart_delay: Duration::from_secs(5),
		}
	}
}

#[derive(Debug, Clone)]
pub struct RemoteSettings {
	pub api_base_url: String,
	pub api_version: String,
	pub poll_wait_secs: u64,
	pub poll_margin: Duration,
	pub reconnect_min_delay: Duration,
	pub reconnect_max_delay: Duration,
}

impl Default for RemoteSettings {
	fn default() -> Self {
		Self {
			api_base_url: DEFAULT_API_BASE_URL.to_string(),
			api_version: "5.81".to_string(),
			poll_wait_secs: DEFAULT_POLL_WAIT_SECS,
			poll_margin: Duration::from_secs(DEFAULT_POLL_MARGIN_SECS),
			reconnect_min_delay: Duration::from_millis(500),
			reconnect_max_delay: Duration::from_secs(30),
		}
	}
}

/// Defaults applied to every new session.
#[derive(Debug, Clone, Copy)]
pub struct SessionDefaults {
	pub preserve_timestamps: bool,
	pub keep_online: bool,
	pub friends_refresh: Duration,
}

impl Default for SessionDefaults {
	fn default() -> Self {
		Self {
			preserve_timestamps: false,
			keep_online: false,
			friends_refresh: Duration::from_secs(300),
		}
	}
}

#[derive(Debug, Clone)]
pub struct PersistenceSettings {
	/// `sqlite:` or `postgres:` URL; in-memory store when unset.
	pub database_url: Option<String>,
	pub max_connections: u32,
}

impl Default for PersistenceSettings {
	fn default() -> Self {
		Self {
			database_url: None,
			max_connections: 5,
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
}

impl GatewayConfig {
	fn from_file(file: FileConfig) -> Self {
		let component_defaults = ComponentSettings::default();
		let remote_defaults = RemoteSettings::default();
		let session_defaults = SessionDefaults::default();
		let persistence_defaults = PersistenceSettings::default();

		let restart_mode = match file.component.restart_mode.as_deref().map(RestartMode::from_str) {
			Some(Ok(mode)) => mode,
			Some(Err(e)) => {
				warn!(error = %e, "component config: invalid restart_mode; using reconnect");
				RestartMode::Reconnect
			}
			None => RestartMode::Reconnect,
		};

		Self {
			component: ComponentSettings {
				jid: file.component.jid.map(|s| s.trim().to_string()).unwrap_or_default(),
				host: file
					.component
					.host
					.filter(|s| !s.trim().is_empty())
					.unwrap_or(component_defaults.host),
				port: file.component.port.unwrap_or(component_defaults.port),
				secret: SecretString::new(file.component.secret.unwrap_or_default()),
				conference_domain: file.component.conference_domain.filter(|s| !s.trim().is_empty()),
				restart_mode,
				restart_delay: file
					.component
					.restart_delay_secs
					.map(Duration::from_secs)
					.unwrap_or(component_defaults.restart_delay),
			},
			remote: RemoteSettings {
				api_base_url: file
					.remote
					.api_base_url
					.filter(|s| !s.trim().is_empty())
					.unwrap_or(remote_defaults.api_base_url),
				api_version: file
					.remote
					.api_version
					.filter(|s| !s.trim().is_empty())
					.unwrap_or(remote_defaults.api_version),
				poll_wait_secs: file.remote.poll_wait_secs.unwrap_or(remote_defaults.poll_wait_secs),
				poll_margin: file
					.remote
					.poll_margin_secs
					.map(Duration::from_secs)
					.unwrap_or(remote_defaults.poll_margin),
				reconnect_min_delay: file
					.remote
					.reconnect_min_delay_ms
					.map(Duration::from_millis)
					.unwrap_or(remote_defaults.reconnect_min_delay),
				reconnect_max_delay: file
					.remote
					.reconnect_max_delay_ms
					.map(Duration::from_millis)
					.unwrap_or(remote_defaults.reconnect_max_delay),
			},
			sessions: SessionDefaults {
				preserve_timestamps: file
					.sessions
					.preserve_timestamps
					.unwrap_or(session_defaults.preserve_timestamps),
				keep_online: file.sessions.keep_online.unwrap_or(session_defaults.keep_online),
				friends_refresh: file
					.sessions
					.friends_refresh_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(session_defaults.friends_refresh),
			},
			persistence: PersistenceSettings {
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
				max_connections: file
					.persistence
					.max_connections
					.filter(|v| *v > 0)
					.unwrap_or(persistence_defaults.max_connections),
			},
			server: ServerSettings {
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
			},
		}
	}

	/// Reject configs the gateway cannot start with.
	pub fn validate(&self) -> anyhow::Result<()> {
		if self.component.jid.is_empty() {
			return Err(anyhow!("component.jid is required"));
		}
		if self.component.jid.contains('@') || self.component.jid.contains('/') {
			return Err(anyhow!("component.jid must be a bare domain"));
		}
		if self.component.secret.is_empty() {
			return Err(anyhow!("component.secret is required"));
		}
		Ok(())
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	component: FileComponentSettings,

	#[serde(default)]
	remote: FileRemoteSettings,

	#[serde(default)]
	sessions: FileSessionSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,

	#[serde(default)]
	server: FileServerSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileComponentSettings {
	jid: Option<String>,
	host: Option<String>,
	port: Option<u16>,
	secret: Option<String>,
	conference_domain: Option<String>,
	restart_mode: Option<String>,
	restart_delay_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileRemoteSettings {
	api_base_url: Option<String>,
	api_version: Option<String>,
	poll_wait_secs: Option<u64>,
	poll_margin_secs: Option<u64>,
	reconnect_min_delay_ms: Option<u64>,
	reconnect_max_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileSessionSettings {
	preserve_timestamps: Option<bool>,
	keep_online: Option<bool>,
	friends_refresh_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
	max_connections: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
	health_bind: Option<String>,
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn env_string(name: &str) -> Option<String> {
	std::env::var(name)
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty())
}

fn apply_env_overrides(cfg: &mut GatewayConfig) {
	if let Some(v) = env_string("VKXMPP_COMPONENT_JID") {
		cfg.component.jid = v;
		info!("component config: jid overridden by env");
	}

	if let Some(v) = env_string("VKXMPP_COMPONENT_HOST") {
		cfg.component.host = v;
		info!("component config: host overridden by env");
	}

	if let Some(v) = env_string("VKXMPP_COMPONENT_PORT")
		&& let Ok(port) = v.parse::<u16>()
	{
		cfg.component.port = port;
		info!(port, "component config: port overridden by env");
	}

	if let Some(v) = env_string("VKXMPP_COMPONENT_SECRET") {
		cfg.component.secret = SecretString::new(v);
		info!("component config: secret overridden by env");
	}

	if let Some(v) = env_string("VKXMPP_CONFERENCE_DOMAIN") {
		cfg.component.conference_domain = Some(v);
		info!("component config: conference_domain overridden by env");
	}

	if let Some(v) = env_string("VKXMPP_RESTART_MODE") {
		match v.parse::<RestartMode>() {
			Ok(mode) => {
				cfg.component.restart_mode = mode;
				info!(?mode, "component config: restart_mode overridden by env");
			}
			Err(e) => warn!(error = %e, "component config: ignoring VKXMPP_RESTART_MODE"),
		}
	}

	if let Some(v) = env_string("VKXMPP_API_BASE_URL") {
		cfg.remote.api_base_url = v;
		info!("remote config: api_base_url overridden by env");
	}

	if let Some(v) = env_string("VKXMPP_POLL_WAIT_SECS")
		&& let Ok(secs) = v.parse::<u64>()
	{
		cfg.remote.poll_wait_secs = secs;
		info!(secs, "remote config: poll_wait_secs overridden by env");
	}

	if let Some(v) = env_string("VKXMPP_RECONNECT_MIN_DELAY_MS")
		&& let Ok(ms) = v.parse::<u64>()
	{
		cfg.remote.reconnect_min_delay = Duration::from_millis(ms);
		info!(ms, "remote config: reconnect_min_delay overridden by env");
	}

	if let Some(v) = env_string("VKXMPP_RECONNECT_MAX_DELAY_MS")
		&& let Ok(ms) = v.parse::<u64>()
	{
		cfg.remote.reconnect_max_delay = Duration::from_millis(ms);
		info!(ms, "remote config: reconnect_max_delay overridden by env");
	}

	if let Some(v) = env_string("VKXMPP_PRESERVE_TIMESTAMPS")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.sessions.preserve_timestamps = enabled;
		info!(enabled, "sessions config: preserve_timestamps overridden by env");
	}

	if let Some(v) = env_string("VKXMPP_KEEP_ONLINE")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.sessions.keep_online = enabled;
		info!(enabled, "sessions config: keep_online overridden by env");
	}

	if let Some(v) = env_string("VKXMPP_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}

	if let Some(v) = env_string("VKXMPP_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = env_string("VKXMPP_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if cfg.remote.reconnect_min_delay > cfg.remote.reconnect_max_delay {
		warn!(
			min_ms = cfg.remote.reconnect_min_delay.as_millis(),
			max_ms = cfg.remote.reconnect_max_delay.as_millis(),
			"remote config: reconnect_min_delay > reconnect_max_delay; swapping"
		);
		std::mem::swap(&mut cfg.remote.reconnect_min_delay, &mut cfg.remote.reconnect_max_delay);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn parse(s: &str) -> GatewayConfig {
		GatewayConfig::from_file(toml::from_str(s).unwrap())
	}

	#[test]
	fn empty_file_gets_defaults() {
		let cfg = parse("");
		assert_eq!(cfg.component.port, 5347);
		assert_eq!(cfg.component.restart_mode, RestartMode::Reconnect);
		assert_eq!(cfg.remote.poll_wait_secs, 25);
		assert_eq!(cfg.remote.poll_margin, Duration::from_secs(10));
		assert_eq!(cfg.sessions.friends_refresh, Duration::from_secs(300));
		assert!(cfg.persistence.database_url.is_none());
		assert!(cfg.validate().is_err());
	}

	#[test]
	fn reads_all_sections() {
		let cfg = parse(
			r#"
			[component]
			jid = "vk.example.org"
			secret = "s3cret"
			port = 5555
			conference_domain = "conference.example.org"
			restart_mode = "exit"

			[remote]
			poll_wait_secs = 20
			reconnect_max_delay_ms = 1000

			[sessions]
			preserve_timestamps = true
			friends_refresh_secs = 60

			[persistence]
			database_url = "sqlite://vkxmpp.db"
			max_connections = 2

			[server]
			health_bind = "127.0.0.1:8080"
			"#,
		);
		cfg.validate().unwrap();
		assert_eq!(cfg.component.port, 5555);
		assert_eq!(cfg.component.restart_mode, RestartMode::Exit);
		assert_eq!(cfg.component.conference_domain.as_deref(), Some("conference.example.org"));
		assert_eq!(cfg.component.secret.expose(), "s3cret");
		assert_eq!(cfg.remote.poll_wait_secs, 20);
		assert_eq!(cfg.remote.reconnect_max_delay, Duration::from_secs(1));
		assert!(cfg.sessions.preserve_timestamps);
		assert!(!cfg.sessions.keep_online);
		assert_eq!(cfg.sessions.friends_refresh, Duration::from_secs(60));
		assert_eq!(cfg.persistence.max_connections, 2);
		assert_eq!(cfg.server.health_bind.as_deref(), Some("127.0.0.1:8080"));
	}

	#[test]
	fn rejects_full_jid() {
		let cfg = parse("[component]\njid = \"gw@example.org\"\nsecret = \"x\"\n");
		assert!(cfg.validate().is_err());
	}

	#[test]
	fn restart_mode_parses() {
		assert_eq!("Exit".parse::<RestartMode>().unwrap(), RestartMode::Exit);
		assert!("sometimes".parse::<RestartMode>().is_err());
	}
}
