use super::schema::Config;
use crate::error::{ConfigError, Result};
use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use regex::Regex;
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "KAFKA_FILTERS_";

pub async fn load_from_env_or_file() -> Result<Config> {
    let config: Config = Figment::new()
        .merge(Toml::file("kafka-proxy-filters.toml"))
        .merge(Json::file("kafka-proxy-filters.json"))
        .merge(Yaml::file("kafka-proxy-filters.yaml"))
        .merge(Yaml::file("kafka-proxy-filters.yml"))
        // e.g. KAFKA_FILTERS_FILTERS__PLUGIN_DIR=/opt/kafka-proxy/plugins
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    let config = apply_env_substitutions(config)?;
    validate(&config)?;

    Ok(config)
}

pub async fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();

    let figment = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Figment::new().merge(Toml::file(path)),
        Some("json") => Figment::new().merge(Json::file(path)),
        Some("yaml") | Some("yml") => Figment::new().merge(Yaml::file(path)),
        _ => {
            return Err(ConfigError::Parse(
                "Unsupported config file format. Use .toml, .json, .yaml, or .yml".into(),
            )
            .into())
        }
    };

    if !path.exists() {
        return Err(ConfigError::Parse(format!(
            "Config file not found: {}",
            path.display()
        ))
        .into());
    }

    let config: Config = figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    let config = apply_env_substitutions(config)?;
    validate(&config)?;

    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    let filters = &config.filters;

    if filters.start_timeout_ms < 100 {
        return Err(
            ConfigError::Validation("start_timeout_ms must be at least 100ms".into()).into(),
        );
    }
    if filters.start_timeout_ms > 600_000 {
        return Err(ConfigError::Validation(
            "start_timeout_ms cannot exceed 600000ms (10 minutes)".into(),
        )
        .into());
    }

    if filters.stop_grace_period_ms > 60_000 {
        return Err(ConfigError::Validation(
            "stop_grace_period_ms cannot exceed 60000ms".into(),
        )
        .into());
    }

    if filters.max_frame_bytes < 1024 {
        return Err(
            ConfigError::Validation("max_frame_bytes must be at least 1024".into()).into(),
        );
    }

    if filters.plugin_dir.is_file() {
        return Err(ConfigError::Validation(format!(
            "Plugin directory path is not a directory: {}",
            filters.plugin_dir.display()
        ))
        .into());
    }

    Ok(())
}

fn apply_env_substitutions(mut config: Config) -> Result<Config> {
    config.filters.plugin_dir = substitute_path(&config.filters.plugin_dir)?;

    if let Some(file) = &config.logging.file {
        config.logging.file = Some(substitute_path(file)?);
    }

    Ok(config)
}

fn substitute_path(path: &Path) -> Result<PathBuf> {
    match path.to_str() {
        Some(raw) => Ok(PathBuf::from(substitute_env_vars(raw)?)),
        None => Ok(path.to_path_buf()),
    }
}

fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();
    let re = Regex::new(r"\$\{([^}]+)\}").map_err(|e| ConfigError::Parse(e.to_string()))?;

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        match std::env::var(var_name) {
            Ok(value) => {
                result = result.replace(&cap[0], &value);
            }
            Err(_) => {
                // ${VAR:-default}
                if let Some((name, default)) = var_name.split_once(":-") {
                    match std::env::var(name) {
                        Ok(value) => result = result.replace(&cap[0], &value),
                        Err(_) => result = result.replace(&cap[0], default),
                    }
                } else {
                    return Err(ConfigError::EnvVar(format!(
                        "Environment variable '{var_name}' not found"
                    ))
                    .into());
                }
            }
        }
    }

    Ok(result)
}
