use std::fs;

use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: String,
    pub database_url: String,
    /// Base URL of the analysis service that performs extraction, sector
    /// detection, ranking, report generation and graph rendering. When unset
    /// every analysis route answers 502.
    pub pipeline_upstream_url: Option<String>,
    pub shortlist_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8000".into(),
            database_url: "sqlite://./data/market_scout.db".into(),
            pipeline_upstream_url: None,
            shortlist_size: 5,
        }
    }
}

/// Optional overrides read from `server.toml`. Every field may be omitted.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    bind_addr: Option<String>,
    database_url: Option<String>,
    pipeline_upstream_url: Option<String>,
    shortlist_size: Option<usize>,
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("server.toml") {
        apply_file_config(&mut settings, &raw);
    }

    if let Ok(v) = std::env::var("SERVER_BIND") {
        settings.bind_addr = v;
    }
    if let Ok(v) = std::env::var("APP__BIND_ADDR") {
        settings.bind_addr = v;
    }

    if let Ok(v) = std::env::var("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Ok(v) = std::env::var("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Ok(v) = std::env::var("PIPELINE_UPSTREAM_URL") {
        settings.pipeline_upstream_url = Some(v);
    }
    if let Ok(v) = std::env::var("APP__PIPELINE_UPSTREAM_URL") {
        settings.pipeline_upstream_url = Some(v);
    }

    if let Ok(v) = std::env::var("APP__SHORTLIST_SIZE") {
        if let Ok(parsed) = v.parse::<usize>() {
            if parsed > 0 {
                settings.shortlist_size = parsed;
            }
        }
    }

    settings
}

fn apply_file_config(settings: &mut Settings, raw: &str) {
    let Ok(file_cfg) = toml::from_str::<FileConfig>(raw) else {
        return;
    };

    if let Some(v) = file_cfg.bind_addr {
        settings.bind_addr = v;
    }
    if let Some(v) = file_cfg.database_url {
        settings.database_url = v;
    }
    if let Some(v) = file_cfg.pipeline_upstream_url {
        settings.pipeline_upstream_url = Some(v);
    }
    if let Some(v) = file_cfg.shortlist_size {
        if v > 0 {
            settings.shortlist_size = v;
        }
    }
}

/// Accepts operator-supplied database locations in a few spellings (plain
/// path, `sqlite:path`, full URL) and returns a URL sqlx understands. Parent
/// directory creation happens in `storage::Storage::new`.
pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:") || raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    let path = raw_database_url
        .strip_prefix("sqlite:")
        .unwrap_or(raw_database_url)
        .replace('\\', "/");

    format!("sqlite://{path}")
}
