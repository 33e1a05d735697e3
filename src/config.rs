use anyhow::{Context, Result, bail};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_YTDLP_BINARY: &str = "yt-dlp";
pub const DEFAULT_YOUTUBE_API_BASE: &str = "https://www.googleapis.com/youtube/v3";
pub const DEFAULT_INNERTUBE_BASE: &str = "https://www.youtube.com/youtubei/v1";

/// Everything the relay reads from its environment. Built once at startup and
/// handed to constructors; nothing below this looks at env vars itself.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub youtube_api_key: Option<String>,
    pub prefer_external_downloader: bool,
    pub ytdlp_binary: PathBuf,
    pub chrome_path: Option<PathBuf>,
    pub youtube_api_base: String,
    pub innertube_base: String,
    pub host: String,
    pub port: u16,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            youtube_api_key: None,
            prefer_external_downloader: true,
            ytdlp_binary: PathBuf::from(DEFAULT_YTDLP_BINARY),
            chrome_path: None,
            youtube_api_base: DEFAULT_YOUTUBE_API_BASE.to_string(),
            innertube_base: DEFAULT_INNERTUBE_BASE.to_string(),
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub env_path: Option<PathBuf>,
}

pub fn load_config(overrides: ConfigOverrides) -> Result<RelayConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_config_with_overrides(&file_vars, env_var_string, overrides)
}

#[cfg(test)]
fn build_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<RelayConfig> {
    build_config_with_overrides(file_vars, env_lookup, ConfigOverrides::default())
}

fn build_config_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: ConfigOverrides,
) -> Result<RelayConfig> {
    let lookup = |key: &str| {
        lookup_value(key, file_vars, &env_lookup).filter(|value| !value.trim().is_empty())
    };

    let prefer_external_downloader = match lookup("MEDIARELAY_PREFER_YTDLP") {
        Some(value) => parse_bool(&value).with_context(|| {
            format!("MEDIARELAY_PREFER_YTDLP must be true or false, got {value:?}")
        })?,
        None => true,
    };
    let port = overrides
        .port
        .or_else(|| lookup("MEDIARELAY_PORT").and_then(|value| value.parse::<u16>().ok()))
        .unwrap_or(DEFAULT_PORT);
    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup("MEDIARELAY_HOST"))
        .unwrap_or_else(|| DEFAULT_HOST.to_string());

    Ok(RelayConfig {
        youtube_api_key: lookup("YOUTUBE_API_KEY"),
        prefer_external_downloader,
        ytdlp_binary: lookup("MEDIARELAY_YTDLP_BIN")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP_BINARY)),
        chrome_path: lookup("MEDIARELAY_CHROME_PATH").map(PathBuf::from),
        youtube_api_base: base_url(lookup("YOUTUBE_API_BASE_URL"), DEFAULT_YOUTUBE_API_BASE),
        innertube_base: base_url(lookup("YOUTUBE_INNERTUBE_BASE_URL"), DEFAULT_INNERTUBE_BASE),
        host,
        port,
    })
}

fn base_url(value: Option<String>, default: &str) -> String {
    value
        .unwrap_or_else(|| default.to_string())
        .trim_end_matches('/')
        .to_string()
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("unrecognized boolean {other:?}"),
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
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
