//! Durable cookie/storage snapshots, one JSON file per context id.
//!
//! The layout mirrors the automation engine's own storage-state format so a
//! snapshot can be replayed into a fresh context unchanged.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::BrowserError;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    #[serde(default = "default_path")]
    pub path: String,
    /// Unix seconds; `-1` for session cookies.
    #[serde(default = "session_expiry")]
    pub expires: f64,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub secure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub same_site: Option<String>,
}

fn default_path() -> String {
    "/".to_string()
}

fn session_expiry() -> f64 {
    -1.0
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StorageEntry {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginStorage {
    pub origin: String,
    #[serde(default)]
    pub local_storage: Vec<StorageEntry>,
}

/// Cookies plus per-origin storage for one logical context.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSnapshot {
    #[serde(default)]
    pub cookies: Vec<StoredCookie>,
    #[serde(default)]
    pub origins: Vec<OriginStorage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_at: Option<DateTime<Utc>>,
}

impl ContextSnapshot {
    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty() && self.origins.is_empty()
    }
}

/// Snapshot files derived from a base path: `state/browser.json` stores
/// context `work` at `state/browser-work.json`.
#[derive(Debug, Clone)]
pub struct ContextStore {
    base: PathBuf,
}

impl ContextStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn path_for(&self, context_id: &str) -> PathBuf {
        let stem = self
            .base
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "browser-state".to_string());
        let file_name = match self.base.extension() {
            Some(ext) => format!("{stem}-{}.{}", sanitize(context_id), ext.to_string_lossy()),
            None => format!("{stem}-{}", sanitize(context_id)),
        };
        self.base.with_file_name(file_name)
    }

    /// Missing or unreadable snapshots load as `None`.
    pub async fn load(&self, context_id: &str) -> Option<ContextSnapshot> {
        let path = self.path_for(context_id);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                log::warn!("could not read context state {}: {err}", path.display());
                return None;
            }
        };
        match serde_json::from_slice(&raw) {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                log::warn!("ignoring corrupt context state {}: {err}", path.display());
                None
            }
        }
    }

    pub async fn save(&self, context_id: &str, snapshot: &ContextSnapshot) -> Result<PathBuf, BrowserError> {
        let path = self.path_for(context_id);
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut snapshot = snapshot.clone();
        snapshot.saved_at = Some(Utc::now());
        let encoded = serde_json::to_vec_pretty(&snapshot)?;

        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &encoded).await?;
        tokio::fs::rename(&tmp, &path).await?;
        log::debug!("persisted context '{context_id}' to {}", path.display());
        Ok(path)
    }
}

fn sanitize(context_id: &str) -> String {
    context_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_per_context_paths() {
        let store = ContextStore::new("/var/lib/searchguard/browser.json");
        assert_eq!(
            store.path_for("default"),
            PathBuf::from("/var/lib/searchguard/browser-default.json")
        );
        assert_eq!(
            store.path_for("../evil id"),
            PathBuf::from("/var/lib/searchguard/browser-.._evil_id.json")
        );
        let bare = ContextStore::new("state/session");
        assert_eq!(bare.path_for("a"), PathBuf::from("state/session-a"));
    }

    #[tokio::test]
    async fn round_trips_and_tolerates_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContextStore::new(dir.path().join("nested/state.json"));
        assert!(store.load("work").await.is_none());

        let snapshot = ContextSnapshot {
            cookies: vec![StoredCookie {
                name: "sid".into(),
                value: "42".into(),
                domain: ".example.com".into(),
                ..StoredCookie::default()
            }],
            origins: vec![OriginStorage {
                origin: "https://example.com".into(),
                local_storage: vec![StorageEntry {
                    name: "theme".into(),
                    value: "dark".into(),
                }],
            }],
            saved_at: None,
        };
        let path = store.save("work", &snapshot).await.unwrap();
        let loaded = store.load("work").await.unwrap();
        assert_eq!(loaded.cookies, snapshot.cookies);
        assert_eq!(loaded.origins, snapshot.origins);
        assert!(loaded.saved_at.is_some());

        tokio::fs::write(&path, b"{not json").await.unwrap();
        assert!(store.load("work").await.is_none());
    }

    #[test]
    fn reads_engine_storage_state_format() {
        let raw = r#"{"cookies":[{"name":"a","value":"b","domain":"x.test","path":"/","expires":-1,"httpOnly":true,"secure":false,"sameSite":"Lax"}],"origins":[{"origin":"https://x.test","localStorage":[{"name":"k","value":"v"}]}]}"#;
        let snapshot: ContextSnapshot = serde_json::from_str(raw).unwrap();
        assert!(snapshot.cookies[0].http_only);
        assert_eq!(snapshot.origins[0].local_storage[0].value, "v");
    }
}
