use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize, Default)]
struct FileConfig {
    bind_addr: Option<String>,
    config_dir: Option<String>,
    poll_interval_seconds: Option<u64>,
    debrid_base_url: Option<String>,
    debrid_timeout_seconds: Option<u64>,
    feed_timeout_seconds: Option<u64>,
    submit_retry_attempts: Option<usize>,
    submit_retry_backoff_sec: Option<f64>,
    session_max_age_seconds: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct SessionConfig {
    secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct RootConfig {
    #[serde(default, flatten)]
    top: FileConfig,
    rdgrab: Option<FileConfig>,
    session: Option<SessionConfig>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub config_dir: String,
    pub poll_interval_seconds: u64,
    pub debrid_base_url: String,
    pub debrid_timeout_seconds: u64,
    pub feed_timeout_seconds: u64,
    pub submit_retry_attempts: usize,
    pub submit_retry_backoff_sec: f64,
    pub username: String,
    pub default_password: String,
    pub session_secret: String,
    pub session_max_age_seconds: i64,
    pub config_path: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:10500".to_string(),
            config_dir: "./config".to_string(),
            poll_interval_seconds: 3600,
            debrid_base_url: "https://api.real-debrid.com/rest/1.0".to_string(),
            debrid_timeout_seconds: 30,
            feed_timeout_seconds: 20,
            submit_retry_attempts: 5,
            submit_retry_backoff_sec: 2.0,
            username: "admin".to_string(),
            default_password: "ADM2024".to_string(),
            session_secret: String::new(),
            session_max_age_seconds: 60 * 60 * 24 * 7,
            config_path: PathBuf::from("config.toml"),
        }
    }
}

impl AppConfig {
    pub fn load() -> Self {
        let mut cfg = Self::default();

        let config_path = find_config_file().unwrap_or_else(|| config_search_paths()[0].clone());
        cfg.config_path = config_path.clone();

        let root = load_root_config(&config_path).unwrap_or_default();
        let RootConfig {
            top,
            rdgrab,
            session,
        } = root;

        cfg.apply_file(top);
        if let Some(section) = rdgrab {
            cfg.apply_file(section);
        }

        if let Some(secret) = session.and_then(|entry| entry.secret) {
            cfg.session_secret = secret;
        }

        cfg.apply_env();

        if cfg.session_secret.is_empty() {
            cfg.session_secret = generate_secret();
            let _ = persist_session_secret(&cfg.config_path, &cfg.session_secret);
        }

        cfg
    }

    fn apply_file(&mut self, file_cfg: FileConfig) {
        set_opt(&mut self.bind_addr, file_cfg.bind_addr);
        set_opt(&mut self.config_dir, file_cfg.config_dir);
        set_opt_u64_min(
            &mut self.poll_interval_seconds,
            file_cfg.poll_interval_seconds,
            60,
        );
        set_opt(&mut self.debrid_base_url, file_cfg.debrid_base_url);
        set_opt_u64_min(
            &mut self.debrid_timeout_seconds,
            file_cfg.debrid_timeout_seconds,
            5,
        );
        set_opt_u64_min(
            &mut self.feed_timeout_seconds,
            file_cfg.feed_timeout_seconds,
            5,
        );
        set_opt_usize_min(
            &mut self.submit_retry_attempts,
            file_cfg.submit_retry_attempts,
            1,
        );
        set_opt_f64_min(
            &mut self.submit_retry_backoff_sec,
            file_cfg.submit_retry_backoff_sec,
            0.0,
        );
        set_opt_i64_min(
            &mut self.session_max_age_seconds,
            file_cfg.session_max_age_seconds,
            60,
        );
    }

    fn apply_env(&mut self) {
        let env_cfg = FileConfig {
            bind_addr: env_string("RDGRAB_BIND_ADDR"),
            config_dir: env_string("RDGRAB_CONFIG_DIR"),
            poll_interval_seconds: env_parse("RDGRAB_POLL_INTERVAL_SECONDS"),
            debrid_base_url: env_string("RDGRAB_DEBRID_BASE_URL"),
            debrid_timeout_seconds: env_parse("RDGRAB_DEBRID_TIMEOUT_SECONDS"),
            feed_timeout_seconds: env_parse("RDGRAB_FEED_TIMEOUT_SECONDS"),
            submit_retry_attempts: env_parse("RDGRAB_SUBMIT_RETRY_ATTEMPTS"),
            submit_retry_backoff_sec: env_parse("RDGRAB_SUBMIT_RETRY_BACKOFF_SEC"),
            session_max_age_seconds: env_parse("RDGRAB_SESSION_MAX_AGE_SECONDS"),
        };
        self.apply_file(env_cfg);

        if let Some(v) = env_string("RDGRAB_USERNAME") {
            self.username = v;
        }
        if let Some(v) = env_string("RDGRAB_PASSWORD") {
            self.default_password = v;
        }
        if let Some(v) = env_string("RDGRAB_SESSION_SECRET") {
            self.session_secret = v;
        }
    }

    pub fn config_dir(&self) -> PathBuf {
        PathBuf::from(&self.config_dir)
    }

    pub fn auth_store_path(&self) -> PathBuf {
        self.config_dir().join("auth.json")
    }

    pub fn settings_store_path(&self) -> PathBuf {
        self.config_dir().join("settings.json")
    }

    pub fn seen_store_path(&self) -> PathBuf {
        self.config_dir().join("torrents.json")
    }
}

pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("config.toml"), PathBuf::from("rdgrab.toml")];
    if let Some(home) = dirs_home() {
        paths.push(home.join(".config").join("rdgrab").join("config.toml"));
    }
    paths
}

pub fn find_config_file() -> Option<PathBuf> {
    config_search_paths().into_iter().find(|path| path.exists())
}

/// Writes a generated session secret into the `[session]` table of the config
/// file so signed cookies survive restarts.
pub fn persist_session_secret(path: &Path, secret: &str) -> Result<()> {
    let mut table = load_toml_table(path).unwrap_or_default();

    let mut session = table
        .remove("session")
        .and_then(|v| v.as_table().cloned())
        .unwrap_or_default();
    session.insert(
        "secret".to_string(),
        toml::Value::String(secret.to_string()),
    );
    table.insert("session".to_string(), toml::Value::Table(session));

    let encoded = toml::to_string(&table).context("failed encoding toml")?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed creating config dir {parent:?}"))?;
        }
    }
    fs::write(path, encoded).with_context(|| format!("failed writing config to {path:?}"))?;
    Ok(())
}

pub fn generate_secret() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

fn load_toml_table(path: &Path) -> Result<toml::value::Table> {
    if !path.exists() {
        return Ok(Default::default());
    }
    let raw = fs::read_to_string(path).with_context(|| format!("failed reading {path:?}"))?;
    let value = toml::from_str::<toml::Value>(&raw).context("failed parsing toml")?;
    Ok(value.as_table().cloned().unwrap_or_default())
}

fn load_root_config(path: &Path) -> Result<RootConfig> {
    if !path.exists() {
        return Ok(RootConfig::default());
    }
    let raw = fs::read_to_string(path).with_context(|| format!("failed reading {path:?}"))?;
    toml::from_str::<RootConfig>(&raw).context("failed parsing config as root structure")
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn env_parse<T>(key: &str) -> Option<T>
where
    T: std::str::FromStr,
{
    env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

fn set_opt<T>(dst: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *dst = v;
    }
}

fn set_opt_usize_min(dst: &mut usize, value: Option<usize>, min: usize) {
    if let Some(v) = value {
        *dst = v.max(min);
    }
}

fn set_opt_u64_min(dst: &mut u64, value: Option<u64>, min: u64) {
    if let Some(v) = value {
        *dst = v.max(min);
    }
}

fn set_opt_i64_min(dst: &mut i64, value: Option<i64>, min: i64) {
    if let Some(v) = value {
        *dst = v.max(min);
    }
}

fn set_opt_f64_min(dst: &mut f64, value: Option<f64>, min: f64) {
    if let Some(v) = value {
        *dst = v.max(min);
    }
}

fn dirs_home() -> Option<PathBuf> {
    env::var("HOME").ok().map(PathBuf::from)
}
