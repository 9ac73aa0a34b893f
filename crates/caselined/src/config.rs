//! caselined.toml configuration parser.
//!
//! The file is read once at startup. Every section except `[database]` and
//! `[credentials]` may be omitted; missing values take the pool defaults.
//! Durations are strings such as `"500ms"`, `"30s"`, `"5m"` or `"6h"`.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use caseline_db::{
    ConnectTarget, CredentialSource, DatabaseConfig, MaintenanceConfig, PoolConfig,
};
use caseline_secrets::DEFAULT_DEGRADATION_WINDOW;
use serde::{Deserialize, Serialize, Serializer};

const DEFAULT_SECRETS_DIR: &str = "/var/run/secrets/caseline";
const DEFAULT_ADMIN_LISTEN: &str = "127.0.0.1:9091";

// ── File sections ──────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub database: DatabaseSection,
    pub credentials: CredentialsSection,
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub secrets: SecretsSection,
    #[serde(default)]
    pub maintenance: MaintenanceSection,
    #[serde(default)]
    pub admin: AdminSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseSection {
    pub host: String,
    pub port: Option<u16>,
    pub name: String,
    pub connect_timeout: Option<String>,
    pub io_timeout: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CredentialsSection {
    pub secret_name: String,
    pub ttl: Option<String>,
    pub username_key: Option<String>,
    pub password_key: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolSection {
    pub size: Option<usize>,
    pub max_overflow: Option<usize>,
    pub acquire_timeout: Option<String>,
    pub max_idle_time: Option<String>,
    pub max_lifetime: Option<String>,
    pub validation_timeout: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretsBackend {
    /// One `<name>.json` file per secret in `directory`.
    #[default]
    File,
    /// Secrets seeded from `[secrets.seed]`; for local development.
    Memory,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecretsSection {
    pub backend: Option<SecretsBackend>,
    pub directory: Option<PathBuf>,
    pub degradation_window: Option<String>,
    /// Secret name → field → value. Only used by the memory backend.
    pub seed: Option<BTreeMap<String, BTreeMap<String, String>>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MaintenanceSection {
    pub reaper_interval: Option<String>,
    pub prewarm_interval: Option<String>,
    pub prewarm_target: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdminSection {
    pub listen: Option<String>,
}

// ── Resolved settings ──────────────────────────────────────────

/// Validated configuration with every default applied.
#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub credentials: CredentialSettings,
    pub pool: PoolSettings,
    pub secrets: SecretsSettings,
    pub maintenance: MaintenanceSettings,
    pub admin: AdminSettings,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseSettings {
    pub host: String,
    pub port: u16,
    pub name: String,
    #[serde(serialize_with = "as_duration")]
    pub connect_timeout: Duration,
    #[serde(serialize_with = "as_duration")]
    pub io_timeout: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct CredentialSettings {
    pub secret_name: String,
    #[serde(serialize_with = "as_duration")]
    pub ttl: Duration,
    pub username_key: String,
    pub password_key: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolSettings {
    pub size: usize,
    pub max_overflow: usize,
    #[serde(serialize_with = "as_duration")]
    pub acquire_timeout: Duration,
    #[serde(serialize_with = "as_duration")]
    pub max_idle_time: Duration,
    #[serde(serialize_with = "as_duration")]
    pub max_lifetime: Duration,
    #[serde(serialize_with = "as_duration")]
    pub validation_timeout: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct SecretsSettings {
    pub backend: SecretsBackend,
    pub directory: PathBuf,
    #[serde(serialize_with = "as_duration")]
    pub degradation_window: Duration,
    /// Never printed.
    #[serde(skip)]
    pub seed: BTreeMap<String, BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceSettings {
    #[serde(serialize_with = "as_duration")]
    pub reaper_interval: Duration,
    #[serde(serialize_with = "as_duration")]
    pub prewarm_interval: Duration,
    pub prewarm_target: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdminSettings {
    pub listen: SocketAddr,
}

impl Settings {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("loading config file {}", path.display()))
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let file: FileConfig = toml::from_str(content)?;
        Self::resolve(file)
    }

    /// Apply defaults and validate.
    pub fn resolve(file: FileConfig) -> anyhow::Result<Self> {
        let pool_defaults = PoolConfig::default();
        let maintenance_defaults = MaintenanceConfig::default();
        let credential_defaults = CredentialSource::default();

        let database = DatabaseSettings {
            host: file.database.host,
            port: file.database.port.unwrap_or(3306),
            name: file.database.name,
            connect_timeout: duration_or("database.connect_timeout", file.database.connect_timeout, Duration::from_secs(5))?,
            io_timeout: duration_or("database.io_timeout", file.database.io_timeout, Duration::from_secs(30))?,
        };

        let credentials = CredentialSettings {
            secret_name: file.credentials.secret_name,
            ttl: duration_or("credentials.ttl", file.credentials.ttl, credential_defaults.ttl)?,
            username_key: file
                .credentials
                .username_key
                .unwrap_or(credential_defaults.username_key),
            password_key: file
                .credentials
                .password_key
                .unwrap_or(credential_defaults.password_key),
        };

        let pool = PoolSettings {
            size: file.pool.size.unwrap_or(pool_defaults.pool_size),
            max_overflow: file.pool.max_overflow.unwrap_or(pool_defaults.max_overflow),
            acquire_timeout: duration_or("pool.acquire_timeout", file.pool.acquire_timeout, pool_defaults.acquire_timeout)?,
            max_idle_time: duration_or("pool.max_idle_time", file.pool.max_idle_time, pool_defaults.max_idle_time)?,
            max_lifetime: duration_or("pool.max_lifetime", file.pool.max_lifetime, pool_defaults.max_lifetime)?,
            validation_timeout: duration_or(
                "pool.validation_timeout",
                file.pool.validation_timeout,
                pool_defaults.validation_timeout,
            )?,
        };

        let secrets = SecretsSettings {
            backend: file.secrets.backend.unwrap_or_default(),
            directory: file
                .secrets
                .directory
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SECRETS_DIR)),
            degradation_window: duration_or(
                "secrets.degradation_window",
                file.secrets.degradation_window,
                DEFAULT_DEGRADATION_WINDOW,
            )?,
            seed: file.secrets.seed.unwrap_or_default(),
        };

        let maintenance = MaintenanceSettings {
            reaper_interval: duration_or(
                "maintenance.reaper_interval",
                file.maintenance.reaper_interval,
                maintenance_defaults.reaper_interval,
            )?,
            prewarm_interval: duration_or(
                "maintenance.prewarm_interval",
                file.maintenance.prewarm_interval,
                maintenance_defaults.prewarm_interval,
            )?,
            prewarm_target: file.maintenance.prewarm_target.unwrap_or(pool.size),
        };

        let listen = file
            .admin
            .listen
            .unwrap_or_else(|| DEFAULT_ADMIN_LISTEN.to_string());
        let admin = AdminSettings {
            listen: listen
                .parse()
                .with_context(|| format!("admin.listen: invalid socket address '{listen}'"))?,
        };

        let settings = Self {
            database,
            credentials,
            pool,
            secrets,
            maintenance,
            admin,
        };
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.pool.size == 0 {
            bail!("pool.size must be at least 1");
        }
        if self.credentials.secret_name.trim().is_empty() {
            bail!("credentials.secret_name must not be empty");
        }
        if self.database.host.trim().is_empty() {
            bail!("database.host must not be empty");
        }

        let durations = [
            ("database.connect_timeout", self.database.connect_timeout),
            ("database.io_timeout", self.database.io_timeout),
            ("credentials.ttl", self.credentials.ttl),
            ("pool.acquire_timeout", self.pool.acquire_timeout),
            ("pool.max_idle_time", self.pool.max_idle_time),
            ("pool.max_lifetime", self.pool.max_lifetime),
            ("pool.validation_timeout", self.pool.validation_timeout),
            ("secrets.degradation_window", self.secrets.degradation_window),
            ("maintenance.reaper_interval", self.maintenance.reaper_interval),
            ("maintenance.prewarm_interval", self.maintenance.prewarm_interval),
        ];
        if let Some((key, _)) = durations.iter().find(|(_, d)| d.is_zero()) {
            bail!("{key} must be greater than zero");
        }

        // The pool keeps at most `pool.size` idle connections.
        if self.maintenance.prewarm_target > self.pool.size {
            bail!(
                "maintenance.prewarm_target ({}) exceeds pool.size ({})",
                self.maintenance.prewarm_target,
                self.pool.size
            );
        }

        if self.secrets.backend == SecretsBackend::Memory
            && !self.secrets.seed.contains_key(&self.credentials.secret_name)
        {
            bail!(
                "secrets.backend = \"memory\" needs a [secrets.seed.\"{}\"] table",
                self.credentials.secret_name
            );
        }
        Ok(())
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            pool_size: self.pool.size,
            max_overflow: self.pool.max_overflow,
            acquire_timeout: self.pool.acquire_timeout,
            max_idle_time: self.pool.max_idle_time,
            max_lifetime: self.pool.max_lifetime,
            validation_timeout: self.pool.validation_timeout,
        }
    }

    pub fn database_config(&self) -> DatabaseConfig {
        DatabaseConfig {
            target: ConnectTarget::new(&self.database.host, self.database.port, &self.database.name),
            credentials: CredentialSource {
                secret_name: self.credentials.secret_name.clone(),
                ttl: self.credentials.ttl,
                username_key: self.credentials.username_key.clone(),
                password_key: self.credentials.password_key.clone(),
            },
            pool: self.pool_config(),
            maintenance: MaintenanceConfig {
                reaper_interval: self.maintenance.reaper_interval,
                prewarm_interval: self.maintenance.prewarm_interval,
                prewarm_target: self.maintenance.prewarm_target,
            },
        }
    }

    /// Effective configuration as TOML. Seeded secret values are omitted.
    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

// ── Durations ──────────────────────────────────────────────────

fn duration_or(key: &str, value: Option<String>, default: Duration) -> anyhow::Result<Duration> {
    match value {
        Some(s) => parse_duration(&s).with_context(|| format!("{key}: invalid duration '{s}'")),
        None => Ok(default),
    }
}

/// Parse a duration string like "500ms", "30s", "5m", "6h". A bare number
/// is seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim().parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.trim().parse::<u64>().ok().map(|h| Duration::from_secs(h * 3600))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

/// Inverse of [`parse_duration`], using the largest whole unit.
pub fn format_duration(d: Duration) -> String {
    if d.subsec_nanos() != 0 {
        return format!("{}ms", d.as_millis());
    }
    match d.as_secs() {
        0 => "0s".to_string(),
        s if s % 3600 == 0 => format!("{}h", s / 3600),
        s if s % 60 == 0 => format!("{}m", s / 60),
        s => format!("{s}s"),
    }
}

fn as_duration<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format_duration(*d))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[database]
host = "db.internal"
name = "caseline"

[credentials]
secret_name = "prod/caseline/db"
"#;

    const FULL: &str = r#"
[database]
host = "db.internal"
port = 3307
name = "caseline"
connect_timeout = "3s"

[credentials]
secret_name = "prod/caseline/db"
ttl = "6h"
username_key = "user"
password_key = "pass"

[pool]
size = 8
max_overflow = 4
acquire_timeout = "500ms"
max_idle_time = "5m"
max_lifetime = "1h"
validation_timeout = "2s"

[secrets]
backend = "file"
directory = "/tmp/secrets"
degradation_window = "30m"

[maintenance]
reaper_interval = "1h"
prewarm_interval = "5m"
prewarm_target = 6

[admin]
listen = "0.0.0.0:9191"
"#;

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("6h"), Some(Duration::from_secs(6 * 3600)));
        assert_eq!(parse_duration("45"), Some(Duration::from_secs(45)));
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration("5d"), None);
    }

    #[test]
    fn format_duration_picks_largest_unit() {
        assert_eq!(format_duration(Duration::from_millis(500)), "500ms");
        assert_eq!(format_duration(Duration::from_secs(90)), "90s");
        assert_eq!(format_duration(Duration::from_secs(300)), "5m");
        assert_eq!(format_duration(Duration::from_secs(7200)), "2h");
        assert_eq!(format_duration(Duration::ZERO), "0s");
    }

    #[test]
    fn minimal_config_takes_defaults() {
        let settings = Settings::from_toml(MINIMAL).unwrap();
        assert_eq!(settings.database.port, 3306);
        assert_eq!(settings.credentials.ttl, Duration::from_secs(6 * 3600));
        assert_eq!(settings.credentials.username_key, "username");
        assert_eq!(settings.pool_config(), PoolConfig::default());
        assert_eq!(settings.maintenance.prewarm_target, 5);
        assert_eq!(settings.secrets.backend, SecretsBackend::File);
        assert_eq!(settings.secrets.degradation_window, Duration::from_secs(3600));
        assert_eq!(settings.admin.listen.port(), 9091);
    }

    #[test]
    fn full_config_maps_to_database_config() {
        let settings = Settings::from_toml(FULL).unwrap();
        let config = settings.database_config();

        assert_eq!(config.target.to_string(), "db.internal:3307/caseline");
        assert_eq!(config.credentials.username_key, "user");
        assert_eq!(config.pool.pool_size, 8);
        assert_eq!(config.pool.capacity(), 12);
        assert_eq!(config.pool.acquire_timeout, Duration::from_millis(500));
        assert_eq!(config.maintenance.prewarm_target, 6);
        assert_eq!(settings.secrets.degradation_window, Duration::from_secs(1800));
        assert_eq!(settings.database.connect_timeout, Duration::from_secs(3));
        assert_eq!(settings.secrets.directory, PathBuf::from("/tmp/secrets"));
    }

    #[test]
    fn rejects_zero_pool_size() {
        let err = Settings::from_toml(&format!("{MINIMAL}\n[pool]\nsize = 0\n")).unwrap_err();
        assert!(err.to_string().contains("pool.size"));
    }

    #[test]
    fn rejects_zero_timeout() {
        let err = Settings::from_toml(&format!("{MINIMAL}\n[pool]\nacquire_timeout = \"0s\"\n"))
            .unwrap_err();
        assert!(err.to_string().contains("pool.acquire_timeout"));
    }

    #[test]
    fn rejects_empty_secret_name() {
        let toml = MINIMAL.replace("prod/caseline/db", " ");
        let err = Settings::from_toml(&toml).unwrap_err();
        assert!(err.to_string().contains("secret_name"));
    }

    #[test]
    fn rejects_prewarm_target_above_pool_size() {
        let toml = format!("{MINIMAL}\n[pool]\nsize = 2\nmax_overflow = 5\n\n[maintenance]\nprewarm_target = 3\n");
        let err = Settings::from_toml(&toml).unwrap_err();
        assert!(err.to_string().contains("prewarm_target"));
    }

    #[test]
    fn rejects_bad_duration() {
        let err = Settings::from_toml(&format!("{MINIMAL}\n[pool]\nmax_idle_time = \"a while\"\n"))
            .unwrap_err();
        assert!(format!("{err:#}").contains("pool.max_idle_time"));
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(Settings::from_toml(&format!("{MINIMAL}\n[pool]\nsizee = 3\n")).is_err());
    }

    #[test]
    fn memory_backend_requires_seed() {
        let without = format!("{MINIMAL}\n[secrets]\nbackend = \"memory\"\n");
        assert!(Settings::from_toml(&without).is_err());

        let with = format!(
            "{MINIMAL}\n[secrets]\nbackend = \"memory\"\n\n[secrets.seed.\"prod/caseline/db\"]\nusername = \"app\"\npassword = \"dev\"\n"
        );
        let settings = Settings::from_toml(&with).unwrap();
        assert_eq!(settings.secrets.seed["prod/caseline/db"]["password"], "dev");
    }

    #[test]
    fn effective_config_omits_seeded_secrets() {
        let toml = format!(
            "{MINIMAL}\n[secrets]\nbackend = \"memory\"\n\n[secrets.seed.\"prod/caseline/db\"]\nusername = \"app\"\npassword = \"hunter2\"\n"
        );
        let rendered = Settings::from_toml(&toml).unwrap().to_toml_string().unwrap();
        assert!(rendered.contains("acquire_timeout = \"5s\""));
        assert!(rendered.contains("backend = \"memory\""));
        assert!(!rendered.contains("hunter2"));
    }
}
