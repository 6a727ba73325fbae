#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use palaver_auth::SecretString;
use serde::Deserialize;
use tracing::info;

/// Default config path: `~/.palaver/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".palaver").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
#[allow(dead_code)]
pub fn load_server_config() -> anyhow::Result<ServerConfig> {
	let path = default_config_path()?;
	load_server_config_from_path(&path)
}

/// Same as `load_server_config` but with an explicit config path.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub auth: AuthSettings,
	pub database: DatabaseSettings,
}

/// Transport and observability settings.
#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// PEM-encoded certificate path for QUIC/TLS.
	pub tls_cert_path: Option<PathBuf>,
	/// PEM-encoded private key path for QUIC/TLS.
	pub tls_key_path: Option<PathBuf>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// Number of persisted messages returned on room join.
	pub history_limit: u32,
}

/// Auth provider selection: a remote provider URL, or a local HMAC secret.
#[derive(Debug, Clone, Default)]
pub struct AuthSettings {
	/// Base URL of the external auth provider.
	pub base_url: Option<String>,
	/// HMAC secret for locally issued tokens.
	pub hmac_secret: Option<SecretString>,
}

/// Persistence settings.
#[derive(Debug, Clone, Default)]
pub struct DatabaseSettings {
	/// Database URL (sqlite: or postgres:). Absent runs the in-memory store.
	pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	auth: FileAuthSettings,

	#[serde(default)]
	database: FileDatabaseSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	tls_cert_path: Option<String>,
	tls_key_path: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	history_limit: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAuthSettings {
	base_url: Option<String>,
	hmac_secret: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileDatabaseSettings {
	url: Option<String>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		Self {
			server: ServerSettings {
				tls_cert_path: file.server.tls_cert_path.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
				tls_key_path: file.server.tls_key_path.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
				history_limit: file.server.history_limit.filter(|v| *v > 0).unwrap_or(50),
			},
			auth: AuthSettings {
				base_url: file.auth.base_url.filter(|s| !s.trim().is_empty()),
				hmac_secret: file
					.auth
					.hmac_secret
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
			},
			database: DatabaseSettings {
				url: file.database.url.filter(|s| !s.trim().is_empty()),
			},
		}
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

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("PALAVER_TLS_CERT") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.tls_cert_path = Some(PathBuf::from(v));
			info!("server config: tls_cert_path overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PALAVER_TLS_KEY") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.tls_key_path = Some(PathBuf::from(v));
			info!("server config: tls_key_path overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PALAVER_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PALAVER_HEALTH_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.health_bind = Some(v);
			info!("server config: health_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PALAVER_HISTORY_LIMIT")
		&& let Ok(limit) = v.trim().parse::<u32>()
		&& limit > 0
	{
		cfg.server.history_limit = limit;
		info!(limit, "server config: history_limit overridden by env");
	}

	if let Ok(v) = std::env::var("PALAVER_AUTH_BASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.auth.base_url = Some(v);
			info!("auth config: base_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PALAVER_AUTH_HMAC_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.auth.hmac_secret = Some(SecretString::new(v));
			info!("auth config: hmac_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PALAVER_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.database.url = Some(v);
			info!("database config: url overridden by env");
		}
	}
}
