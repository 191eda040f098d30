use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::auth::{hash_password, verify_password};
use crate::models::SettingsDocument;

/// Username to salted password hash, persisted as a JSON object.
pub struct AuthStore {
    path: PathBuf,
    users: Mutex<BTreeMap<String, String>>,
}

impl AuthStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let users = read_json(&path)?.unwrap_or_default();
        Ok(Self {
            path,
            users: Mutex::new(users),
        })
    }

    /// Seeds the admin account when the store is empty. Returns true when the
    /// account was created on this call.
    pub async fn ensure_user(&self, username: &str, default_password: &str) -> Result<bool> {
        let mut users = self.users.lock().await;
        if !users.is_empty() {
            return Ok(false);
        }
        users.insert(username.to_string(), hash_password(default_password));
        write_json_atomic(&self.path, &*users)?;
        Ok(true)
    }

    /// Unknown usernames and wrong passwords both return false so callers
    /// cannot tell them apart.
    pub async fn verify(&self, username: &str, password: &str) -> bool {
        let users = self.users.lock().await;
        users
            .get(username)
            .map(|stored| verify_password(password, stored))
            .unwrap_or(false)
    }

    pub async fn set_password(&self, username: &str, new_password: &str) -> Result<()> {
        let mut users = self.users.lock().await;
        users.insert(username.to_string(), hash_password(new_password));
        write_json_atomic(&self.path, &*users)
    }
}

/// Feed list, Real-Debrid API key and the passive `api_methods` object.
pub struct SettingsStore {
    path: PathBuf,
    doc: Mutex<SettingsDocument>,
}

impl SettingsStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let doc = read_json(&path)?.unwrap_or_default();
        Ok(Self {
            path,
            doc: Mutex::new(doc),
        })
    }

    pub async fn snapshot(&self) -> SettingsDocument {
        self.doc.lock().await.clone()
    }

    pub async fn feeds(&self) -> Vec<String> {
        self.doc.lock().await.feeds.clone()
    }

    /// Appends a feed URL unless it is already present. Returns true when the
    /// list changed.
    pub async fn add_feed(&self, url: &str) -> Result<bool> {
        let mut doc = self.doc.lock().await;
        if doc.feeds.iter().any(|existing| existing == url) {
            return Ok(false);
        }
        doc.feeds.push(url.to_string());
        write_json_atomic(&self.path, &*doc)?;
        Ok(true)
    }

    /// Removes the feed at `index`, preserving the order of the rest. An
    /// out-of-range index is a no-op returning None.
    pub async fn remove_feed(&self, index: usize) -> Result<Option<String>> {
        let mut doc = self.doc.lock().await;
        if index >= doc.feeds.len() {
            return Ok(None);
        }
        let removed = doc.feeds.remove(index);
        write_json_atomic(&self.path, &*doc)?;
        Ok(Some(removed))
    }

    pub async fn rd_api_key(&self) -> String {
        self.doc.lock().await.rd_api_key.clone()
    }

    pub async fn set_rd_api_key(&self, key: &str) -> Result<()> {
        let mut doc = self.doc.lock().await;
        doc.rd_api_key = key.to_string();
        write_json_atomic(&self.path, &*doc)
    }
}

/// Magnet links already submitted, persisted as a JSON array and used as a
/// set for duplicate suppression.
pub struct SeenStore {
    path: PathBuf,
    magnets: Mutex<HashSet<String>>,
}

impl SeenStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let magnets = read_json(&path)?.unwrap_or_default();
        Ok(Self {
            path,
            magnets: Mutex::new(magnets),
        })
    }

    pub async fn contains(&self, magnet: &str) -> bool {
        self.magnets.lock().await.contains(magnet)
    }

    /// Records a magnet as submitted. Returns false when it was already
    /// known, in which case nothing is written.
    pub async fn record(&self, magnet: &str) -> Result<bool> {
        let mut magnets = self.magnets.lock().await;
        if !magnets.insert(magnet.to_string()) {
            return Ok(false);
        }
        write_json_atomic(&self.path, &*magnets)?;
        Ok(true)
    }

    pub async fn len(&self) -> usize {
        self.magnets.lock().await.len()
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw =
        fs::read_to_string(path).with_context(|| format!("failed reading {}", path.display()))?;
    let value = serde_json::from_str(&raw)
        .with_context(|| format!("failed parsing {}", path.display()))?;
    Ok(Some(value))
}

/// Serializes to a sibling temp file and renames it over the target so a
/// crash mid-write never leaves a truncated document.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed creating {}", parent.display()))?;
        }
    }

    let encoded = serde_json::to_string_pretty(value).context("failed encoding json")?;
    let tmp = temp_path(path);
    fs::write(&tmp, encoded).with_context(|| format!("failed writing {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("failed replacing {}", path.display()))?;
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "store".into());
    name.push(".tmp");
    path.with_file_name(name)
}
