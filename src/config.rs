#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

use crate::session::Credentials;
use crate::store::{DEFAULT_PLACEHOLDER_THUMBNAIL, StoreOptions};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_DATA_DIR: &str = "data";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_ADMIN_USER: &str = "admin";
pub const DEFAULT_ADMIN_PASSWORD: &str = "admin123";
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 30;

/// Every key understood in `.env` and the process environment.
pub const CONFIG_KEYS: &[&str] = &[
    "CATALOG_DATA_DIR",
    "CATALOG_HOST",
    "CATALOG_PORT",
    "CATALOG_ADMIN_USER",
    "CATALOG_ADMIN_PASSWORD",
    "CATALOG_PLACEHOLDER_THUMBNAIL",
    "CATALOG_SYNC_INTERVAL_SECS",
    "CATALOG_ENRICH",
];

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub data_dir: PathBuf,
    pub host: String,
    pub port: u16,
    pub admin_user: String,
    pub admin_password: String,
    pub placeholder_thumbnail: String,
    pub sync_interval_secs: u64,
    /// Look up oEmbed metadata when resolving from the admin surfaces.
    pub enrich: bool,
}

impl RuntimeConfig {
    pub fn credentials(&self) -> Credentials {
        Credentials::new(&self.admin_user, &self.admin_password)
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            placeholder_thumbnail: self.placeholder_thumbnail.clone(),
        }
    }
}

pub fn load_runtime_config() -> Result<RuntimeConfig> {
    resolve_runtime_config(RuntimeOverrides::default())
}

/// Values taken from the command line; they beat the environment and `.env`.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub data_dir: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub sync_interval_secs: Option<u64>,
    pub enrich: Option<bool>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_config(overrides: RuntimeOverrides) -> Result<RuntimeConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime_config_with_overrides(&file_vars, env_var_string, overrides)
}

#[cfg(test)]
fn build_runtime_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<RuntimeConfig> {
    build_runtime_config_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_runtime_config_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeConfig> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    let data_dir = overrides
        .data_dir
        .or_else(|| lookup("CATALOG_DATA_DIR").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup("CATALOG_HOST"))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = overrides
        .port
        .or_else(|| lookup("CATALOG_PORT").and_then(|value| value.parse::<u16>().ok()))
        .unwrap_or(DEFAULT_PORT);
    let admin_user = lookup("CATALOG_ADMIN_USER").unwrap_or_else(|| DEFAULT_ADMIN_USER.to_string());
    let admin_password =
        lookup("CATALOG_ADMIN_PASSWORD").unwrap_or_else(|| DEFAULT_ADMIN_PASSWORD.to_string());
    let placeholder_thumbnail = lookup("CATALOG_PLACEHOLDER_THUMBNAIL")
        .unwrap_or_else(|| DEFAULT_PLACEHOLDER_THUMBNAIL.to_string());
    let sync_interval_secs = overrides
        .sync_interval_secs
        .or_else(|| {
            lookup("CATALOG_SYNC_INTERVAL_SECS").and_then(|value| value.parse::<u64>().ok())
        })
        .filter(|secs| *secs > 0)
        .unwrap_or(DEFAULT_SYNC_INTERVAL_SECS);
    let enrich = overrides
        .enrich
        .or_else(|| lookup("CATALOG_ENRICH").and_then(|value| parse_bool(&value)))
        .unwrap_or(false);

    if admin_password.is_empty() {
        bail!("CATALOG_ADMIN_PASSWORD must not be empty");
    }

    Ok(RuntimeConfig {
        data_dir,
        host,
        port,
        admin_user,
        admin_password,
        placeholder_thumbnail,
        sync_interval_secs,
        enrich,
    })
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = unquote(value_raw.trim());
        vars.insert(key.to_string(), value);
    }
    Ok(vars)
}

/// Strips matching quotes. Double-quoted values undo the escaping applied by
/// [`upsert_env_value`].
fn unquote(value: &str) -> String {
    if let Some(inner) = value
        .strip_prefix('"')
        .and_then(|value| value.strip_suffix('"'))
    {
        return inner.replace("\\\"", "\"").replace("\\\\", "\\");
    }
    value
        .strip_prefix('\'')
        .and_then(|value| value.strip_suffix('\''))
        .unwrap_or(value)
        .to_string()
}

/// Updates or appends a single env var inside the target file while preserving
/// unrelated lines and comments.
pub fn upsert_env_value(path: &Path, key: &str, value: &str) -> Result<()> {
    if !CONFIG_KEYS.contains(&key) {
        bail!("unknown setting {key} (expected one of {})", CONFIG_KEYS.join(", "));
    }
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("Creating {}", parent.display()))?;
    }

    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(err) => return Err(err).with_context(|| format!("Reading {}", path.display())),
    };
    let mut lines = Vec::new();
    let mut updated = false;
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");

    for line in raw.lines() {
        let trimmed = line.trim_start();
        let indent = &line[..line.len() - trimmed.len()];
        let (prefix, rest) = match trimmed.strip_prefix("export ") {
            Some(stripped) => ("export ", stripped),
            None => ("", trimmed),
        };
        match rest.split_once('=') {
            Some((candidate, _)) if candidate.trim() == key => {
                lines.push(format!("{indent}{prefix}{key}=\"{escaped}\""));
                updated = true;
            }
            _ => lines.push(line.to_string()),
        }
    }

    if !updated {
        lines.push(format!("{key}=\"{escaped}\""));
    }

    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, lines.join("\n") + "\n")
        .with_context(|| format!("Writing {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("Replacing {}", path.display()))?;
    Ok(())
}
