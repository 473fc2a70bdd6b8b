use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use gateway::GatewayConfig;
use serde::Deserialize;
use tracing::warn;

pub const DEFAULT_CONFIG_FILE: &str = "pipefit.toml";
const DEFAULT_SUPABASE_URL: &str = "http://127.0.0.1:54321";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub oauth_redirect_url: String,
    pub session_file: PathBuf,
    pub request_timeout_seconds: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            supabase_url: DEFAULT_SUPABASE_URL.into(),
            supabase_anon_key: String::new(),
            oauth_redirect_url: "http://localhost:5173/dashboard".into(),
            session_file: default_session_file(),
            request_timeout_seconds: 15,
        }
    }
}

impl Settings {
    pub fn gateway_config(&self) -> anyhow::Result<GatewayConfig> {
        let config = GatewayConfig::new(&self.supabase_url, self.supabase_anon_key.clone())
            .with_context(|| format!("invalid backend url '{}'", self.supabase_url))?;
        Ok(config.with_request_timeout(Duration::from_secs(self.request_timeout_seconds)))
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    supabase_url: Option<String>,
    supabase_anon_key: Option<String>,
    oauth_redirect_url: Option<String>,
    session_file: Option<PathBuf>,
    request_timeout_seconds: Option<u64>,
}

fn default_session_file() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pipefit")
        .join("session.json")
}

pub fn load_settings(config_file: Option<&Path>) -> Settings {
    let path = config_file.unwrap_or(Path::new(DEFAULT_CONFIG_FILE));
    load_settings_from(path, |key| std::env::var(key).ok())
}

/// File values override defaults; environment values override both.
pub fn load_settings_from(path: &Path, env: impl Fn(&str) -> Option<String>) -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file_cfg) => {
                if let Some(v) = file_cfg.supabase_url {
                    settings.supabase_url = v;
                }
                if let Some(v) = file_cfg.supabase_anon_key {
                    settings.supabase_anon_key = v;
                }
                if let Some(v) = file_cfg.oauth_redirect_url {
                    settings.oauth_redirect_url = v;
                }
                if let Some(v) = file_cfg.session_file {
                    settings.session_file = v;
                }
                if let Some(v) = file_cfg.request_timeout_seconds {
                    settings.request_timeout_seconds = v;
                }
            }
            Err(err) => warn!(path = %path.display(), %err, "ignoring unreadable config file"),
        }
    }

    if let Some(v) = env("SUPABASE_URL") {
        settings.supabase_url = v;
    }
    if let Some(v) = env("APP__SUPABASE_URL") {
        settings.supabase_url = v;
    }

    if let Some(v) = env("SUPABASE_ANON_KEY") {
        settings.supabase_anon_key = v;
    }
    if let Some(v) = env("APP__SUPABASE_ANON_KEY") {
        settings.supabase_anon_key = v;
    }

    if let Some(v) = env("APP__OAUTH_REDIRECT_URL") {
        settings.oauth_redirect_url = v;
    }

    if let Some(v) = env("APP__SESSION_FILE") {
        settings.session_file = PathBuf::from(v);
    }

    if let Some(v) = env("APP__REQUEST_TIMEOUT_SECONDS") {
        match v.parse::<u64>() {
            Ok(parsed) if parsed > 0 => settings.request_timeout_seconds = parsed,
            _ => warn!(value = %v, "ignoring invalid APP__REQUEST_TIMEOUT_SECONDS"),
        }
    }

    settings.supabase_url = normalize_supabase_url(&settings.supabase_url);
    settings
}

pub fn normalize_supabase_url(raw: &str) -> String {
    let raw = raw.trim().trim_end_matches('/');

    if raw.is_empty() {
        return DEFAULT_SUPABASE_URL.to_string();
    }

    if raw.contains("://") {
        return raw.to_string();
    }

    let scheme = if raw.starts_with("localhost") || raw.starts_with("127.0.0.1") {
        "http"
    } else {
        "https"
    };
    format!("{scheme}://{raw}")
}

pub fn prepare_session_file(path: &Path) -> anyhow::Result<PathBuf> {
    let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) else {
        return Ok(path.to_path_buf());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for session file '{}'",
            parent.display(),
            path.display()
        )
    })?;

    Ok(path.to_path_buf())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
