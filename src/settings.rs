use config::{Config, ConfigError};
use lazy_static::lazy_static;
use serde::Deserialize;
use std::env;
use std::path::Path;

/// Directory holding the config files
const CONFIG_DIR_VAR: &str = "GENERATOR_CONFIG_DIR";
/// Name of the run-mode specific config file
const RUN_MODE_VAR: &str = "GENERATOR_CONFIG_RUN_MODE";

lazy_static! {
    static ref ENV_VAR_PATTERN: regex::Regex =
        regex::Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub aws: AwsSettings,
    #[serde(default)]
    pub kubernetes: KubernetesSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AwsSettings {
    /// Session name attached to every assumed role session
    #[serde(default = "default_role_session_name")]
    pub role_session_name: String,

    /// Audience always requested for service account tokens
    #[serde(default = "default_audience")]
    pub default_audience: String,
}

impl Default for AwsSettings {
    fn default() -> Self {
        Self {
            role_session_name: default_role_session_name(),
            default_audience: default_audience(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct KubernetesSettings {
    /// Lifetime requested for service account tokens (minimum 600)
    #[serde(default = "default_token_expiration_seconds")]
    pub token_expiration_seconds: i64,

    /// Use ~/.kube/config instead of inferring the cluster configuration
    #[serde(default)]
    pub kubeconfig: bool,
}

impl Default for KubernetesSettings {
    fn default() -> Self {
        Self {
            token_expiration_seconds: default_token_expiration_seconds(),
            kubeconfig: false,
        }
    }
}

fn default_role_session_name() -> String {
    "external-secrets-ecr-generator".to_string()
}

fn default_audience() -> String {
    "sts.amazonaws.com".to_string()
}

fn default_token_expiration_seconds() -> i64 {
    600
}

impl Settings {
    /// Substitute environment variables in a string value
    /// Replaces ${VAR_NAME} or ${VAR_NAME:-default} with environment variable values
    fn substitute_env_vars_in_string(s: &str) -> String {
        ENV_VAR_PATTERN
            .replace_all(s, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default_value = caps.get(2).map(|m| m.as_str());

                match env::var(var_name) {
                    Ok(val) => val,
                    Err(_) => default_value.unwrap_or("").to_string(),
                }
            })
            .to_string()
    }

    /// Convert a config::Value to a serde_json::Value, performing environment variable substitution
    fn config_value_to_json(value: &config::Value) -> serde_json::Value {
        use config::ValueKind;

        match &value.kind {
            ValueKind::Nil => serde_json::Value::Null,
            ValueKind::Boolean(b) => serde_json::Value::Bool(*b),
            ValueKind::I64(i) => serde_json::Value::Number((*i).into()),
            ValueKind::I128(i) => serde_json::Value::Number((*i as i64).into()),
            ValueKind::U64(u) => serde_json::Value::Number((*u).into()),
            ValueKind::U128(u) => serde_json::Value::Number((*u as u64).into()),
            ValueKind::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ValueKind::String(s) => {
                serde_json::Value::String(Self::substitute_env_vars_in_string(s))
            }
            ValueKind::Table(table) => {
                let mut map = serde_json::Map::new();
                for (k, v) in table.iter() {
                    map.insert(k.clone(), Self::config_value_to_json(v));
                }
                serde_json::Value::Object(map)
            }
            ValueKind::Array(arr) => {
                let vec: Vec<serde_json::Value> =
                    arr.iter().map(Self::config_value_to_json).collect();
                serde_json::Value::Array(vec)
            }
        }
    }

    /// Add `{config_dir}/{name}.{toml,yaml,yml}` if present
    fn try_add_config_file(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
        config_dir: &str,
        name: &str,
    ) -> config::ConfigBuilder<config::builder::DefaultState> {
        for ext in ["toml", "yaml", "yml"] {
            let path = format!("{}/{}.{}", config_dir, name, ext);
            if Path::new(&path).exists() {
                tracing::info!("Loading config file: {}", path);
                return builder.add_source(config::File::with_name(&format!(
                    "{}/{}",
                    config_dir, name
                )));
            }
        }

        tracing::debug!(
            "Optional config file not found: {}/{}.{{toml,yaml,yml}}",
            config_dir,
            name
        );
        builder
    }

    /// Collect `GENERATOR_*` overrides, leaving out the variables that locate
    /// the config files themselves
    fn environment_overrides(
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> config::Map<String, String> {
        vars.into_iter()
            .filter(|(key, _)| key != CONFIG_DIR_VAR && key != RUN_MODE_VAR)
            .collect()
    }

    /// `GENERATOR_SECTION__KEY` environment source; values are parsed so that
    /// numeric and boolean settings can be overridden
    fn environment(vars: config::Map<String, String>) -> config::Environment {
        config::Environment::with_prefix("GENERATOR")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .source(Some(vars))
    }

    /// Load settings from `GENERATOR_CONFIG_DIR` (default `config`) and the environment
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var(RUN_MODE_VAR).unwrap_or_else(|_| "development".into());
        let config_dir = env::var(CONFIG_DIR_VAR).unwrap_or_else(|_| "config".into());
        Self::load(&config_dir, &run_mode)
    }

    /// Load settings from `default`, `{run_mode}` and `local` files in
    /// `config_dir`, then `GENERATOR_*` environment variables
    ///
    /// Every file is optional; missing values fall back to defaults.
    pub fn load(config_dir: &str, run_mode: &str) -> Result<Self, ConfigError> {
        Self::load_with_env(
            config_dir,
            run_mode,
            Self::environment_overrides(env::vars()),
        )
    }

    fn load_with_env(
        config_dir: &str,
        run_mode: &str,
        vars: config::Map<String, String>,
    ) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        for name in ["default", run_mode, "local"] {
            builder = Self::try_add_config_file(builder, config_dir, name);
        }
        builder = builder.add_source(Self::environment(vars));

        let config = builder.build()?;

        let root_value = config
            .cache
            .into_table()
            .map_err(|e| ConfigError::Message(format!("Failed to get config table: {}", e)))?;

        let mut json_map = serde_json::Map::new();
        for (k, v) in root_value.iter() {
            json_map.insert(k.clone(), Self::config_value_to_json(v));
        }
        let json_value = serde_json::Value::Object(json_map);

        let mut unused_fields = Vec::new();
        let settings: Settings = serde_ignored::deserialize(json_value, |path| {
            unused_fields.push(path.to_string());
        })
        .map_err(|e| ConfigError::Message(format!("Failed to deserialize settings: {}", e)))?;

        for field in &unused_fields {
            tracing::warn!("Unknown configuration field in generator config: {}", field);
        }

        if settings.aws.role_session_name.is_empty() {
            return Err(ConfigError::Message(
                "aws.role_session_name must not be empty".to_string(),
            ));
        }

        // The TokenRequest API rejects anything shorter than ten minutes.
        if settings.kubernetes.token_expiration_seconds < 600 {
            return Err(ConfigError::Message(format!(
                "kubernetes.token_expiration_seconds must be at least 600, got {}",
                settings.kubernetes.token_expiration_seconds
            )));
        }

        Ok(settings)
    }
}
