use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

pub const DEFAULT_ENV_FILE: &str = ".env";

#[derive(Clone, Debug)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    /// Accepted for compatibility with existing deployments; hot reload is
    /// not supported by this binary.
    pub reload: bool,
    pub cookies_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub api_prefix: String,
    pub max_upload_bytes: usize,
    pub stale_job_max_age: u64,
}

impl Settings {
    /// Reads settings from the process environment, falling back to values
    /// from a `.env` file in the working directory.
    pub fn from_env() -> Self {
        let file = read_env_file(Path::new(DEFAULT_ENV_FILE));
        Self::from_lookup(|key| env::var(key).ok().or_else(|| file.get(key).cloned()))
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let source = Source { lookup: &lookup };
        Self {
            host: source.str("HOST", "0.0.0.0"),
            port: source.parse("PORT", 8000),
            reload: source.flag("RELOAD", false),
            cookies_dir: expand_home(&source.str("YOUTUBE_COOKIES_DIR", "storage/cookies")),
            temp_dir: source
                .get("DOWNLOAD_TMP_DIR")
                .map(|value| expand_home(&value))
                .unwrap_or_else(env::temp_dir),
            api_prefix: normalize_prefix(&source.str("API_PREFIX", "")),
            max_upload_bytes: source.parse("MAX_UPLOAD_BYTES", 16 * 1024 * 1024),
            stale_job_max_age: source.parse("STALE_JOB_MAX_AGE", 3600),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

struct Source<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Source<'_> {
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn str(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        match self.get(key) {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                warn!("Ignoring invalid value {raw:?} for {key}");
                default
            }),
            None => default,
        }
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        match self.get(key).map(|v| v.to_ascii_lowercase()) {
            Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
            Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
            Some(v) => {
                warn!("Ignoring invalid value {v:?} for {key}");
                default
            }
            None => default,
        }
    }
}

/// Parses `KEY=value` lines, skipping blanks and `#` comments. A missing or
/// unreadable file yields an empty map.
pub fn read_env_file(path: &Path) -> HashMap<String, String> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(_) => return HashMap::new(),
    };
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| {
            let value = value.trim().trim_matches('"').trim_matches('\'');
            (key.trim().to_string(), value.to_string())
        })
        .collect()
}

fn expand_home(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix('~') {
        if rest.is_empty() || rest.starts_with('/') {
            if let Some(home) = env::var_os("HOME") {
                return PathBuf::from(home).join(rest.trim_start_matches('/'));
            }
        }
    }
    PathBuf::from(raw)
}

fn normalize_prefix(raw: &str) -> String {
    let trimmed = raw.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}
