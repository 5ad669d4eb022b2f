//! Key/value configuration: defaults, ~/.config/dgpt/.dgptrc overlay, env overlay.

use std::{
    collections::HashMap,
    env, fs,
    io::{BufRead, BufReader},
    path::PathBuf,
    time::Duration,
};

use directories::BaseDirs;

#[derive(Debug, Clone)]
pub struct Config {
    inner: HashMap<String, String>,
    pub config_path: PathBuf,
}

impl Config {
    pub fn load() -> Self {
        let mut map = default_map();
        let config_path = default_config_path();

        // Read .dgptrc if exists
        if config_path.exists() {
            if let Ok(file) = fs::File::open(&config_path) {
                let reader = BufReader::new(file);
                for line in reader.lines().map_while(Result::ok) {
                    let line = line.trim();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    if let Some((k, v)) = line.split_once('=') {
                        map.insert(k.trim().to_string(), v.trim().to_string());
                    }
                }
            }
        }

        // Overlay environment variables (take precedence)
        for (k, v) in env::vars() {
            if is_config_key(&k) {
                map.insert(k, v);
            }
        }

        Self { inner: map, config_path }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        // ENV first
        if let Ok(v) = env::var(key) {
            return Some(v);
        }
        self.inner.get(key).cloned()
    }

    fn get_u64(&self, key: &str, fallback: u64) -> u64 {
        self.get(key)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(fallback)
    }

    pub fn python_bin(&self) -> String {
        self.get("PYTHON_BIN").unwrap_or_else(|| "python3".into())
    }

    pub fn workspace_root(&self) -> PathBuf {
        self.get("WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| env::temp_dir().join("dgpt"))
    }

    /// Wall-clock bound for one sandboxed execution.
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.get_u64("EXECUTION_TIMEOUT", 30))
    }

    /// Bound for the schema-probe subprocess, distinct from the execution bound.
    pub fn schema_timeout(&self) -> Duration {
        Duration::from_secs(self.get_u64("SCHEMA_TIMEOUT", 10))
    }

    /// Cap on captured stdout/stderr per execution.
    pub fn max_output_bytes(&self) -> usize {
        self.get_u64("MAX_OUTPUT_BYTES", 10 * 1024 * 1024) as usize
    }
}

fn is_config_key(k: &str) -> bool {
    const KEYS: &[&str] = &[
        "OPENAI_API_KEY",
        "API_BASE_URL",
        "DEFAULT_MODEL",
        "REQUEST_TIMEOUT",
        "PYTHON_BIN",
        "EXECUTION_TIMEOUT",
        "SCHEMA_TIMEOUT",
        "MAX_OUTPUT_BYTES",
        "WORKSPACE_ROOT",
    ];

    KEYS.contains(&k) || k.starts_with("DGPT_") || k.starts_with("OPENAI_")
}

fn default_config_path() -> PathBuf {
    let base = BaseDirs::new()
        .map(|b| b.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("~/.config"));
    base.join("dgpt").join(".dgptrc")
}

fn default_map() -> HashMap<String, String> {
    let mut m = HashMap::new();

    m.insert("REQUEST_TIMEOUT".into(), "60".into());
    m.insert("DEFAULT_MODEL".into(), "gpt-4o".into());
    m.insert("API_BASE_URL".into(), "default".into());
    m.insert("PYTHON_BIN".into(), "python3".into());
    m.insert("EXECUTION_TIMEOUT".into(), "30".into());
    m.insert("SCHEMA_TIMEOUT".into(), "10".into());
    m.insert("MAX_OUTPUT_BYTES".into(), (10 * 1024 * 1024).to_string());

    m
}
