//! Learned state persistence using JSON file storage

use crate::error::EngineError;
use crate::model::{CorrelationLink, LearnedPattern, ScenePattern};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

/// Everything the store knows, as written to disk
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    #[serde(default)]
    pub patterns: Vec<LearnedPattern>,
    #[serde(default)]
    pub scenes: Vec<ScenePattern>,
    #[serde(default)]
    pub links: Vec<CorrelationLink>,
}

/// Load a snapshot from a JSON file; a missing file is an empty store
pub async fn load_snapshot(path: &Path) -> Result<StoreSnapshot, EngineError> {
    match fs::read_to_string(path).await {
        Ok(contents) => {
            let snapshot: StoreSnapshot = serde_json::from_str(&contents)?;
            tracing::info!(
                "Loaded {} patterns, {} scenes, {} links from {:?}",
                snapshot.patterns.len(),
                snapshot.scenes.len(),
                snapshot.links.len(),
                path
            );
            Ok(snapshot)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No pattern store found at {:?}, starting fresh", path);
            Ok(StoreSnapshot::default())
        }
        Err(e) => Err(EngineError::StoreUnavailable(format!(
            "failed to read {}: {e}",
            path.display()
        ))),
    }
}

/// Save a snapshot to a JSON file atomically
pub async fn save_snapshot(path: &Path, snapshot: &StoreSnapshot) -> Result<(), EngineError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let json = serde_json::to_string_pretty(snapshot)?;

    // Write to temp file, then rename
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, &json)
        .await
        .map_err(|e| EngineError::StoreUnavailable(format!("failed to write {}: {e}", tmp_path.display())))?;
    fs::rename(&tmp_path, path).await?;

    tracing::debug!(
        "Saved {} patterns, {} scenes, {} links to {:?}",
        snapshot.patterns.len(),
        snapshot.scenes.len(),
        snapshot.links.len(),
        path
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_is_empty_store() {
        let path = std::env::temp_dir()
            .join(format!("pattern-persist-{}", uuid::Uuid::new_v4()))
            .join("missing.json");
        let snapshot = load_snapshot(&path).await.unwrap();
        assert!(snapshot.patterns.is_empty());
        assert!(snapshot.links.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = std::env::temp_dir().join(format!("pattern-persist-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("patterns.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(load_snapshot(&path).await, Err(EngineError::Json(_))));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_save_leaves_no_temp_file() {
        let dir = std::env::temp_dir().join(format!("pattern-persist-{}", uuid::Uuid::new_v4()));
        let path = dir.join("patterns.json");
        save_snapshot(&path, &StoreSnapshot::default()).await.unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
