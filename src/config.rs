//! Controller configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides except
//! `DATABASE_URL`, which follows `sqlx`'s own convention for where a
//! connection string is expected to live.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `broker.url`
//! - `persistence.database_url` (or `DATABASE_URL` in the environment)

use serde::Deserialize;
use std::path::Path;

// ---------------------------------------------------------------------------
// Config types (validated, with defaults applied)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub schema_version: u32,
    pub instance_id: String,
    pub broker: BrokerConfig,
    pub persistence: PersistenceConfig,
    pub listen: ListenConfig,
    pub scripts: ScriptsConfig,
    pub registry: RegistryConfig,
    pub poller: PollerConfig,
    pub commands: CommandsConfig,
    pub sampler: SamplerConfig,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub database_url: String,
}

/// Kept for parity with the donor's status-HTTP shape and so an eventual
/// HTTP facade (out of scope here) has somewhere to read a bind address
/// from; the core controller never binds a socket itself.
#[derive(Debug, Clone)]
pub struct ListenConfig {
    pub bind: String,
}

#[derive(Debug, Clone)]
pub struct ScriptsConfig {
    pub directory: String,
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub stale_after_secs: u64,
    pub offline_after_secs: u64,
    pub health_check_interval_secs: u64,
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub interval_secs: u64,
    pub command_timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct CommandsConfig {
    pub default_timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct SamplerConfig {
    pub interval_secs: u64,
    pub timeout_ms: u64,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    instance_id: Option<String>,
    broker: Option<RawBrokerConfig>,
    persistence: Option<RawPersistenceConfig>,
    listen: Option<RawListenConfig>,
    scripts: Option<RawScriptsConfig>,
    registry: Option<RawRegistryConfig>,
    poller: Option<RawPollerConfig>,
    commands: Option<RawCommandsConfig>,
    sampler: Option<RawSamplerConfig>,
}

#[derive(Debug, Deserialize)]
struct RawBrokerConfig {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPersistenceConfig {
    database_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawListenConfig {
    bind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawScriptsConfig {
    directory: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRegistryConfig {
    stale_after_secs: Option<u64>,
    offline_after_secs: Option<u64>,
    health_check_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawPollerConfig {
    interval_secs: Option<u64>,
    command_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawCommandsConfig {
    default_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawSamplerConfig {
    interval_secs: Option<u64>,
    timeout_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load controller config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<ControllerConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load controller config from the default path `/etc/arturo/controller.toml`.
pub fn load_config() -> Result<ControllerConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/arturo/controller.toml"))
}

pub fn load_config_from_str(toml_str: &str) -> Result<ControllerConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {schema_version}"
        )));
    }

    let instance_id = raw
        .instance_id
        .unwrap_or_else(|| "arturo-controller-01".to_owned());

    let raw_broker = raw
        .broker
        .ok_or_else(|| ConfigError::MissingField("broker".to_owned()))?;
    let broker_url = raw_broker
        .url
        .ok_or_else(|| ConfigError::MissingField("broker.url".to_owned()))?;

    let database_url = std::env::var("DATABASE_URL").ok().or_else(|| {
        raw.persistence
            .as_ref()
            .and_then(|p| p.database_url.clone())
    });
    let database_url = database_url.ok_or_else(|| {
        ConfigError::MissingField(
            "persistence.database_url (or DATABASE_URL environment variable)".to_owned(),
        )
    })?;

    let listen = match raw.listen {
        Some(l) => ListenConfig {
            bind: l.bind.unwrap_or_else(|| "0.0.0.0:8090".to_owned()),
        },
        None => ListenConfig {
            bind: "0.0.0.0:8090".to_owned(),
        },
    };

    let scripts = match raw.scripts {
        Some(s) => ScriptsConfig {
            directory: s
                .directory
                .unwrap_or_else(|| "/var/lib/arturo/scripts".to_owned()),
        },
        None => ScriptsConfig {
            directory: "/var/lib/arturo/scripts".to_owned(),
        },
    };

    let registry = match raw.registry {
        Some(r) => RegistryConfig {
            stale_after_secs: r.stale_after_secs.unwrap_or(5),
            offline_after_secs: r.offline_after_secs.unwrap_or(15),
            health_check_interval_secs: r.health_check_interval_secs.unwrap_or(5),
        },
        None => RegistryConfig {
            stale_after_secs: 5,
            offline_after_secs: 15,
            health_check_interval_secs: 5,
        },
    };

    let poller = match raw.poller {
        Some(p) => PollerConfig {
            interval_secs: p.interval_secs.unwrap_or(5),
            command_timeout_ms: p.command_timeout_ms.unwrap_or(5000),
        },
        None => PollerConfig {
            interval_secs: 5,
            command_timeout_ms: 5000,
        },
    };

    let commands = match raw.commands {
        Some(c) => CommandsConfig {
            default_timeout_ms: c.default_timeout_ms.unwrap_or(5000),
        },
        None => CommandsConfig {
            default_timeout_ms: 5000,
        },
    };

    let sampler = match raw.sampler {
        Some(s) => SamplerConfig {
            interval_secs: s.interval_secs.unwrap_or(5),
            timeout_ms: s.timeout_ms.unwrap_or(5000),
        },
        None => SamplerConfig {
            interval_secs: 5,
            timeout_ms: 5000,
        },
    };

    Ok(ControllerConfig {
        schema_version,
        instance_id,
        broker: BrokerConfig { url: broker_url },
        persistence: PersistenceConfig { database_url },
        listen,
        scripts,
        registry,
        poller,
        commands,
        sampler,
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {s}"),
            ConfigError::Parse(s) => write!(f, "parse error: {s}"),
            ConfigError::MissingField(s) => write!(f, "missing required field: {s}"),
            ConfigError::InvalidValue(s) => write!(f, "invalid config value: {s}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
        schema_version = 1

        [broker]
        url = "redis://127.0.0.1:6379"

        [persistence]
        database_url = "postgres://localhost/arturo"
        "#
    }

    #[test]
    fn minimal_config_applies_defaults() {
        std::env::remove_var("DATABASE_URL");
        let cfg = load_config_from_str(minimal_toml()).expect("config parses");
        assert_eq!(cfg.instance_id, "arturo-controller-01");
        assert_eq!(cfg.registry.stale_after_secs, 5);
        assert_eq!(cfg.registry.offline_after_secs, 15);
        assert_eq!(cfg.poller.interval_secs, 5);
        assert_eq!(cfg.sampler.interval_secs, 5);
        assert_eq!(cfg.commands.default_timeout_ms, 5000);
        assert_eq!(cfg.scripts.directory, "/var/lib/arturo/scripts");
    }

    #[test]
    fn missing_broker_url_is_rejected() {
        let toml_str = r#"
        schema_version = 1

        [persistence]
        database_url = "postgres://localhost/arturo"
        "#;
        std::env::remove_var("DATABASE_URL");
        assert!(matches!(
            load_config_from_str(toml_str),
            Err(ConfigError::MissingField(_))
        ));
    }

    #[test]
    fn wrong_schema_version_is_rejected() {
        let toml_str = r#"
        schema_version = 2

        [broker]
        url = "redis://127.0.0.1:6379"

        [persistence]
        database_url = "postgres://localhost/arturo"
        "#;
        std::env::remove_var("DATABASE_URL");
        assert!(matches!(
            load_config_from_str(toml_str),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn explicit_fields_override_defaults() {
        let toml_str = r#"
        schema_version = 1
        instance_id = "ctrl-west-01"

        [broker]
        url = "redis://broker:6379"

        [persistence]
        database_url = "postgres://db/arturo"

        [registry]
        stale_after_secs = 10
        offline_after_secs = 30

        [poller]
        interval_secs = 60
        "#;
        std::env::remove_var("DATABASE_URL");
        let cfg = load_config_from_str(toml_str).expect("config parses");
        assert_eq!(cfg.instance_id, "ctrl-west-01");
        assert_eq!(cfg.registry.stale_after_secs, 10);
        assert_eq!(cfg.registry.offline_after_secs, 30);
        assert_eq!(cfg.poller.interval_secs, 60);
    }
}
