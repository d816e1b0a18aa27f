use std::{collections::HashMap, fs, path::PathBuf, time::Duration};

use serde::Deserialize;
use shared::domain::UserId;

use crate::realtime::RealtimeOptions;

#[derive(Debug, Clone, Deserialize)]
pub struct ClientSettings {
    pub server_url: String,
    pub storage_path: PathBuf,
    pub viewer_id: Option<UserId>,
    pub request_timeout_ms: u64,
    pub group_threshold_ms: u64,
    pub connect_recheck_ms: u64,
    pub connect_recheck_attempts: u32,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            storage_path: PathBuf::from("./data/portal.db"),
            viewer_id: None,
            request_timeout_ms: 10_000,
            group_threshold_ms: 600_000,
            connect_recheck_ms: 1_000,
            connect_recheck_attempts: 10,
        }
    }
}

impl ClientSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn group_threshold(&self) -> Duration {
        Duration::from_millis(self.group_threshold_ms)
    }

    pub fn realtime_options(&self) -> RealtimeOptions {
        RealtimeOptions {
            connect_recheck_interval: Duration::from_millis(self.connect_recheck_ms),
            connect_recheck_attempts: self.connect_recheck_attempts,
        }
    }
}

/// Defaults, then `client.toml` in the working directory, then `APP__*`
/// environment variables.
pub fn load_settings() -> ClientSettings {
    let mut settings = ClientSettings::default();
    if let Ok(raw) = fs::read_to_string("client.toml") {
        apply_file(&mut settings, &raw);
    }
    apply_env(&mut settings, |name| std::env::var(name).ok());
    settings
}

fn apply_file(settings: &mut ClientSettings, raw: &str) {
    let Ok(file_cfg) = toml::from_str::<HashMap<String, toml::Value>>(raw) else {
        return;
    };
    let text = |key: &str| -> Option<String> {
        match file_cfg.get(key)? {
            toml::Value::String(v) => Some(v.clone()),
            toml::Value::Integer(v) => Some(v.to_string()),
            _ => None,
        }
    };
    apply_values(settings, text);
}

fn apply_env(settings: &mut ClientSettings, lookup: impl Fn(&str) -> Option<String>) {
    apply_values(settings, |key| lookup(&format!("APP__{}", key.to_ascii_uppercase())));
}

fn apply_values(settings: &mut ClientSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("server_url") {
        settings.server_url = v;
    }
    if let Some(v) = lookup("storage_path") {
        settings.storage_path = PathBuf::from(v);
    }
    if let Some(v) = lookup("viewer_id").and_then(|v| v.parse::<i64>().ok()) {
        settings.viewer_id = Some(UserId(v));
    }
    if let Some(v) = lookup("request_timeout_ms").and_then(|v| v.parse().ok()) {
        settings.request_timeout_ms = v;
    }
    if let Some(v) = lookup("group_threshold_ms").and_then(|v| v.parse().ok()) {
        settings.group_threshold_ms = v;
    }
    if let Some(v) = lookup("connect_recheck_ms").and_then(|v| v.parse().ok()) {
        settings.connect_recheck_ms = v;
    }
    if let Some(v) = lookup("connect_recheck_attempts").and_then(|v| v.parse().ok()) {
        settings.connect_recheck_attempts = v;
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
