//! Load — layered config merging: defaults < YAML file < environment < flags.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer};
use svrn_router::RouterMode;
use tracing::{debug, info};

use super::model::{default_node, Config, LoggingConfig, Timeouts};
use crate::cli::Cli;
use crate::error::ConfigError;
use crate::service::ServiceKind;
use crate::state::RoleSet;

pub const ENV_ROLES: &str = "SVRN_ROLES";
pub const ENV_SERVICES: &str = "SVRN_SERVICES";
pub const ENV_COMMUNITY: &str = "SVRN_COMMUNITY";
pub const ENV_ROUTER: &str = "SVRN_ROUTER";
pub const ENV_NODE: &str = "SVRN_NODE";
pub const ENV_CONFIG: &str = "SVRN_CONFIG";

/// One unvalidated configuration source. `None` means "not set here".
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigLayer {
    #[serde(default, deserialize_with = "list_or_csv")]
    pub roles: Option<Vec<String>>,
    #[serde(default, deserialize_with = "list_or_csv")]
    pub services: Option<Vec<String>>,
    pub community: Option<String>,
    pub router: Option<String>,
    pub node: Option<String>,
    pub timeouts: Option<Timeouts>,
    pub logging: Option<LoggingConfig>,
}

impl ConfigLayer {
    /// Values from `upper` win; unset ones fall through to `self`.
    pub fn overlay(self, upper: ConfigLayer) -> ConfigLayer {
        ConfigLayer {
            roles: upper.roles.or(self.roles),
            services: upper.services.or(self.services),
            community: upper.community.or(self.community),
            router: upper.router.or(self.router),
            node: upper.node.or(self.node),
            timeouts: upper.timeouts.or(self.timeouts),
            logging: upper.logging.or(self.logging),
        }
    }

    /// Read `SVRN_*` variables through `lookup`. Blank values count as unset.
    pub fn from_env<F>(lookup: F) -> ConfigLayer
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).and_then(non_blank);
        ConfigLayer {
            roles: get(ENV_ROLES).and_then(|v| split_csv(&v)),
            services: get(ENV_SERVICES).and_then(|v| split_csv(&v)),
            community: get(ENV_COMMUNITY),
            router: get(ENV_ROUTER),
            node: get(ENV_NODE),
            ..Default::default()
        }
    }

    pub fn from_cli(cli: &Cli) -> ConfigLayer {
        ConfigLayer {
            roles: cli.roles.as_deref().and_then(split_csv),
            services: cli.services.as_deref().and_then(split_csv),
            community: cli.community.clone().and_then(non_blank),
            router: cli.router.clone().and_then(non_blank),
            ..Default::default()
        }
    }

    /// Parse a YAML config file. An empty file is an empty layer.
    pub fn from_file(path: &Path) -> Result<ConfigLayer, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileReadError {
            path: path.to_path_buf(),
            source,
        })?;
        if contents.trim().is_empty() {
            return Ok(ConfigLayer::default());
        }
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}

/// Merge every source and validate the result.
///
/// The file path comes from `--config`, else `SVRN_CONFIG`; without either
/// the file layer is skipped. `env` abstracts `std::env::var` for tests.
pub fn load<F>(cli: &Cli, env: F) -> Result<Config, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let path: Option<PathBuf> = cli
        .config
        .clone()
        .or_else(|| env(ENV_CONFIG).and_then(non_blank).map(PathBuf::from));

    let file_layer = match &path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            ConfigLayer::from_file(path)?
        }
        None => {
            debug!("No config file given, using environment and flags only");
            ConfigLayer::default()
        }
    };

    let merged = file_layer
        .overlay(ConfigLayer::from_env(&env))
        .overlay(ConfigLayer::from_cli(cli));
    Config::validate(merged)
}

impl Config {
    /// Pure transform from a merged layer to a validated `Config`, filling in
    /// built-in defaults for anything unset.
    pub fn validate(layer: ConfigLayer) -> Result<Config, ConfigError> {
        let roles = match layer.roles {
            Some(names) => RoleSet::parse(names)?,
            None => RoleSet::default(),
        };

        let mut services: Vec<ServiceKind> = Vec::new();
        for name in layer.services.unwrap_or_default() {
            let kind: ServiceKind = name.parse()?;
            if !services.contains(&kind) {
                services.push(kind);
            }
        }

        let community = match layer.community.and_then(non_blank) {
            Some(uri) => Some(validate_community(uri)?),
            None => None,
        };

        let router = match layer.router.and_then(non_blank) {
            Some(raw) => raw.parse::<RouterMode>()?,
            None => RouterMode::Auto,
        };

        let node = match layer.node {
            Some(node) => validate_node(node)?,
            None => default_node(),
        };

        let timeouts = layer.timeouts.unwrap_or_default();
        timeouts.validate()?;

        let logging = layer.logging.unwrap_or_default();
        if logging.level.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "logging.level",
                reason: "must not be empty".to_string(),
            });
        }
        if let Err(e) = tracing_subscriber::EnvFilter::try_new(&logging.level) {
            return Err(ConfigError::InvalidValue {
                key: "logging.level",
                reason: e.to_string(),
            });
        }

        Ok(Config {
            roles,
            services,
            community,
            router,
            node,
            timeouts,
            logging,
        })
    }
}

/// Split a comma-separated list: trim and lower-case items, drop empty ones.
/// A list with nothing left is treated as unset.
pub fn split_csv(raw: &str) -> Option<Vec<String>> {
    normalize(raw.split(','))
}

fn normalize<I, S>(items: I) -> Option<Vec<String>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let out: Vec<String> = items
        .into_iter()
        .map(|item| item.as_ref().trim().to_ascii_lowercase())
        .filter(|item| !item.is_empty())
        .collect();
    (!out.is_empty()).then_some(out)
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn validate_community(uri: String) -> Result<String, ConfigError> {
    let valid = match uri.split_once("://") {
        Some((scheme, rest)) => {
            !scheme.is_empty()
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
                && !rest.trim_matches('/').is_empty()
                && !rest.chars().any(char::is_whitespace)
        }
        None => false,
    };
    if valid {
        Ok(uri)
    } else {
        Err(ConfigError::InvalidCommunity(uri))
    }
}

fn validate_node(node: String) -> Result<String, ConfigError> {
    let node = node.trim().to_string();
    if node.is_empty() {
        return Err(ConfigError::InvalidValue {
            key: "node",
            reason: "must not be empty".to_string(),
        });
    }
    if let Some(bad) = node
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(ConfigError::InvalidValue {
            key: "node",
            reason: format!("character '{}' is not allowed", bad),
        });
    }
    Ok(node)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ListOrCsv {
    List(Vec<String>),
    Csv(String),
}

fn list_or_csv<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<ListOrCsv>::deserialize(deserializer)? {
        Some(ListOrCsv::List(items)) => normalize(items),
        Some(ListOrCsv::Csv(raw)) => split_csv(&raw),
        None => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    use crate::conf::model::LogFormat;
    use crate::state::Role;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn no_env() -> impl Fn(&str) -> Option<String> {
        |_| None
    }

    fn yaml_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn cli_with_file(file: &tempfile::NamedTempFile) -> Cli {
        Cli {
            config: Some(file.path().to_path_buf()),
            ..Default::default()
        }
    }

    #[test]
    fn test_split_csv_trims_and_drops_empty() {
        assert_eq!(
            split_csv(" Provider, ,relay,"),
            Some(vec!["provider".to_string(), "relay".to_string()])
        );
        assert_eq!(split_csv(" , "), None);
        assert_eq!(split_csv(""), None);
    }

    #[test]
    fn test_defaults_when_nothing_set() {
        let cfg = load(&Cli::default(), no_env()).unwrap();
        assert_eq!(cfg.roles(), &RoleSet::default());
        assert!(cfg.services().is_empty());
        assert!(cfg.router().is_auto());
    }

    #[test]
    fn test_flags_beat_env_beat_file() {
        let file = yaml_file("roles: consumer\n");
        let env = env_of(&[(ENV_ROLES, "provider")]);
        let mut cli = cli_with_file(&file);
        cli.roles = Some("relay".to_string());

        let cfg = load(&cli, env).unwrap();
        assert_eq!(cfg.roles(), &RoleSet::new([Role::Relay]));
    }

    #[test]
    fn test_env_beats_file() {
        let file = yaml_file("roles: [consumer]\nservices: blob\n");
        let env = env_of(&[(ENV_ROLES, "provider")]);

        let cfg = load(&cli_with_file(&file), env).unwrap();
        assert_eq!(cfg.roles(), &RoleSet::new([Role::Provider]));
        assert_eq!(cfg.services(), &[ServiceKind::Blob]);
    }

    #[test]
    fn test_empty_flag_falls_through() {
        let env = env_of(&[(ENV_SERVICES, "crdt")]);
        let cli = Cli {
            services: Some(" , ".to_string()),
            ..Default::default()
        };
        let cfg = load(&cli, env).unwrap();
        assert_eq!(cfg.services(), &[ServiceKind::Crdt]);
    }

    #[test]
    fn test_config_path_from_env() {
        let file = yaml_file("community: svrn://seed-1\nnode: node-a\n");
        let path = file.path().to_string_lossy().to_string();
        let cfg = load(&Cli::default(), env_of(&[(ENV_CONFIG, path.as_str())])).unwrap();
        assert_eq!(cfg.community(), Some("svrn://seed-1"));
        assert_eq!(cfg.node(), "node-a");
    }

    #[test]
    fn test_full_yaml_file() {
        let file = yaml_file(
            r#"
roles:
  - provider
  - seed
services: "blob, crdt, blob"
router: external:10.0.0.5:7656
timeouts:
  operation_ms: 1500
  reconnect_attempts: 7
logging:
  format: json
"#,
        );
        let cfg = load(&cli_with_file(&file), no_env()).unwrap();
        assert_eq!(cfg.roles(), &RoleSet::new([Role::Provider, Role::Seed]));
        assert_eq!(cfg.services(), &[ServiceKind::Blob, ServiceKind::Crdt]);
        assert_eq!(cfg.router().to_string(), "external:10.0.0.5:7656");
        assert_eq!(cfg.timeouts().operation_ms, 1500);
        assert_eq!(cfg.timeouts().reconnect_attempts, 7);
        assert_eq!(cfg.timeouts().connect_attempts, 5);
        assert_eq!(cfg.logging().format, LogFormat::Json);
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let cli = Cli {
            config: Some(PathBuf::from("/definitely/not/here.yaml")),
            ..Default::default()
        };
        assert!(matches!(load(&cli, no_env()), Err(ConfigError::FileReadError { .. })));
    }

    #[test]
    fn test_malformed_yaml_is_parse_error() {
        let file = yaml_file("roles: [provider\n");
        assert!(matches!(
            load(&cli_with_file(&file), no_env()),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn test_unknown_key_is_parse_error() {
        let file = yaml_file("roles: provider\ndht: true\n");
        assert!(matches!(
            load(&cli_with_file(&file), no_env()),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn test_empty_file_is_fine() {
        let file = yaml_file("\n");
        assert!(load(&cli_with_file(&file), no_env()).is_ok());
    }

    #[test]
    fn test_invalid_role_and_service() {
        let env = env_of(&[(ENV_ROLES, "provider,admin")]);
        assert!(matches!(load(&Cli::default(), env), Err(ConfigError::InvalidRole(r)) if r == "admin"));

        let env = env_of(&[(ENV_SERVICES, "blob,dht")]);
        assert!(matches!(load(&Cli::default(), env), Err(ConfigError::InvalidService(s)) if s == "dht"));
    }

    #[test]
    fn test_invalid_router_and_community() {
        let env = env_of(&[(ENV_ROUTER, "external:nohost")]);
        assert!(matches!(load(&Cli::default(), env), Err(ConfigError::InvalidRouter(_))));

        let env = env_of(&[(ENV_COMMUNITY, "not a uri")]);
        assert!(matches!(load(&Cli::default(), env), Err(ConfigError::InvalidCommunity(_))));
    }

    #[test]
    fn test_invalid_node_name() {
        let env = env_of(&[(ENV_NODE, "node a")]);
        assert!(matches!(
            load(&Cli::default(), env),
            Err(ConfigError::InvalidValue { key: "node", .. })
        ));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let file = yaml_file("timeouts:\n  shutdown_grace_secs: 0\n");
        assert!(matches!(
            load(&cli_with_file(&file), no_env()),
            Err(ConfigError::InvalidValue { key: "timeouts.shutdown_grace_secs", .. })
        ));
    }

    #[test]
    fn test_overlay_keeps_lower_values() {
        let lower = ConfigLayer {
            community: Some("svrn://a".to_string()),
            router: Some("auto".to_string()),
            ..Default::default()
        };
        let upper = ConfigLayer {
            router: Some("external:h:1".to_string()),
            ..Default::default()
        };
        let merged = lower.overlay(upper);
        assert_eq!(merged.community.as_deref(), Some("svrn://a"));
        assert_eq!(merged.router.as_deref(), Some("external:h:1"));
    }
}
