//! Pattern store interface and in-process implementations
//!
//! The store is the single writer of record. Deltas are applied to the
//! stored row inside the store's own per-key critical section, so callers
//! never read-modify-write a copy.

use crate::correlation::LinkDelta;
use crate::error::EngineError;
use crate::model::{
    CorrelationLink, Evidence, LearnedPattern, LinkKey, PatternKey, PatternStatus, SceneMember, ScenePattern,
};
use crate::persistence::{self, StoreSnapshot};
use crate::scorer::{Applied, EvidenceDelta};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Row returned from an upsert
#[derive(Debug, Clone)]
pub struct Upserted<T> {
    pub record: T,
    pub applied: Applied,
}

/// Selection for [`PatternStore::list_patterns`]
#[derive(Debug, Clone, Default)]
pub struct PatternFilter {
    pub entity_id: Option<String>,
    pub status: Option<PatternStatus>,
    /// Compared against the stored (not decayed) confidence
    pub min_confidence: Option<f64>,
}

impl PatternFilter {
    #[must_use]
    pub fn with_status(status: PatternStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn for_entity(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: Some(entity_id.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, pattern: &LearnedPattern) -> bool {
        self.entity_id
            .as_ref()
            .map_or(true, |id| *id == pattern.key.entity_id)
            && self.status.map_or(true, |s| s == pattern.evidence.status)
            && self
                .min_confidence
                .map_or(true, |min| pattern.evidence.confidence >= min)
    }
}

/// Durable storage for patterns, scenes and links
#[async_trait]
pub trait PatternStore: Send + Sync {
    /// Apply a delta to the row for `key`, creating it for observations
    async fn upsert_pattern(
        &self,
        key: &PatternKey,
        delta: EvidenceDelta,
    ) -> Result<Upserted<LearnedPattern>, EngineError>;

    async fn get_pattern(&self, key: &PatternKey) -> Result<Option<LearnedPattern>, EngineError>;

    async fn list_patterns(&self, filter: &PatternFilter) -> Result<Vec<LearnedPattern>, EngineError>;

    async fn set_status(
        &self,
        key: &PatternKey,
        status: PatternStatus,
    ) -> Result<LearnedPattern, EngineError>;

    async fn upsert_scene(
        &self,
        members: &[SceneMember],
        delta: EvidenceDelta,
    ) -> Result<Upserted<ScenePattern>, EngineError>;

    async fn list_scenes(&self, status: Option<PatternStatus>) -> Result<Vec<ScenePattern>, EngineError>;

    async fn set_scene_status(
        &self,
        members: &[SceneMember],
        status: PatternStatus,
    ) -> Result<ScenePattern, EngineError>;

    async fn upsert_link(
        &self,
        key: &LinkKey,
        delta: LinkDelta,
    ) -> Result<Upserted<CorrelationLink>, EngineError>;

    /// Links touching `entity_id`, or all links
    async fn list_links(&self, entity_id: Option<&str>) -> Result<Vec<CorrelationLink>, EngineError>;
}

/// Volatile store keyed by pattern/scene/link key
#[derive(Debug, Default)]
pub struct MemoryPatternStore {
    patterns: DashMap<PatternKey, LearnedPattern>,
    scenes: DashMap<Vec<SceneMember>, ScenePattern>,
    links: DashMap<LinkKey, CorrelationLink>,
}

impl MemoryPatternStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a snapshot, merging duplicate rows
    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let store = Self::new();
        for pattern in snapshot.patterns {
            match store.patterns.entry(pattern.key.clone()) {
                Entry::Occupied(mut existing) => {
                    tracing::warn!(
                        "{}",
                        EngineError::InconsistentState(format!(
                            "duplicate pattern row {}, merging",
                            pattern.key
                        ))
                    );
                    existing.get_mut().evidence.merge(pattern.evidence);
                }
                Entry::Vacant(slot) => {
                    slot.insert(pattern);
                }
            }
        }
        for scene in snapshot.scenes {
            match store.scenes.entry(scene.members.clone()) {
                Entry::Occupied(mut existing) => {
                    tracing::warn!(
                        "{}",
                        EngineError::InconsistentState(format!(
                            "duplicate scene row with {} members, merging",
                            scene.members.len()
                        ))
                    );
                    existing.get_mut().evidence.merge(scene.evidence);
                }
                Entry::Vacant(slot) => {
                    slot.insert(scene);
                }
            }
        }
        for link in snapshot.links {
            store.links.insert(link.key.clone(), link);
        }
        store
    }

    /// Copy of every row
    pub fn snapshot(&self) -> StoreSnapshot {
        let mut snapshot = StoreSnapshot {
            patterns: self.patterns.iter().map(|r| r.value().clone()).collect(),
            scenes: self.scenes.iter().map(|r| r.value().clone()).collect(),
            links: self.links.iter().map(|r| r.value().clone()).collect(),
        };
        snapshot.patterns.sort_by(|a, b| a.key.cmp(&b.key));
        snapshot.scenes.sort_by(|a, b| a.members.cmp(&b.members));
        snapshot.links.sort_by(|a, b| a.key.cmp(&b.key));
        snapshot
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }
}

#[async_trait]
impl PatternStore for MemoryPatternStore {
    async fn upsert_pattern(
        &self,
        key: &PatternKey,
        delta: EvidenceDelta,
    ) -> Result<Upserted<LearnedPattern>, EngineError> {
        let mut row = match self.patterns.entry(key.clone()) {
            Entry::Occupied(row) => row.into_ref(),
            Entry::Vacant(slot) if delta.creates_row() => {
                slot.insert(LearnedPattern::new(key.clone(), delta.at()))
            }
            Entry::Vacant(_) => return Err(EngineError::NotFound(key.to_string())),
        };
        let applied = delta.apply(&mut row.evidence);
        Ok(Upserted {
            record: row.clone(),
            applied,
        })
    }

    async fn get_pattern(&self, key: &PatternKey) -> Result<Option<LearnedPattern>, EngineError> {
        Ok(self.patterns.get(key).map(|r| r.value().clone()))
    }

    async fn list_patterns(&self, filter: &PatternFilter) -> Result<Vec<LearnedPattern>, EngineError> {
        let mut patterns: Vec<LearnedPattern> = self
            .patterns
            .iter()
            .filter(|r| filter.matches(r.value()))
            .map(|r| r.value().clone())
            .collect();
        patterns.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(patterns)
    }

    async fn set_status(
        &self,
        key: &PatternKey,
        status: PatternStatus,
    ) -> Result<LearnedPattern, EngineError> {
        let mut row = self
            .patterns
            .get_mut(key)
            .ok_or_else(|| EngineError::NotFound(key.to_string()))?;
        transition(&mut row.evidence, status, || key.to_string())?;
        Ok(row.clone())
    }

    async fn upsert_scene(
        &self,
        members: &[SceneMember],
        delta: EvidenceDelta,
    ) -> Result<Upserted<ScenePattern>, EngineError> {
        let mut row = match self.scenes.entry(members.to_vec()) {
            Entry::Occupied(row) => row.into_ref(),
            Entry::Vacant(slot) if delta.creates_row() => {
                slot.insert(ScenePattern::new(members.to_vec(), delta.at()))
            }
            Entry::Vacant(_) => return Err(EngineError::NotFound(scene_label(members))),
        };
        let applied = delta.apply(&mut row.evidence);
        Ok(Upserted {
            record: row.clone(),
            applied,
        })
    }

    async fn list_scenes(&self, status: Option<PatternStatus>) -> Result<Vec<ScenePattern>, EngineError> {
        let mut scenes: Vec<ScenePattern> = self
            .scenes
            .iter()
            .filter(|r| status.map_or(true, |s| s == r.evidence.status))
            .map(|r| r.value().clone())
            .collect();
        scenes.sort_by(|a, b| a.members.cmp(&b.members));
        Ok(scenes)
    }

    async fn set_scene_status(
        &self,
        members: &[SceneMember],
        status: PatternStatus,
    ) -> Result<ScenePattern, EngineError> {
        let mut row = self
            .scenes
            .get_mut(members)
            .ok_or_else(|| EngineError::NotFound(scene_label(members)))?;
        transition(&mut row.evidence, status, || scene_label(members))?;
        Ok(row.clone())
    }

    async fn upsert_link(
        &self,
        key: &LinkKey,
        delta: LinkDelta,
    ) -> Result<Upserted<CorrelationLink>, EngineError> {
        let mut row = match self.links.entry(key.clone()) {
            Entry::Occupied(row) => row.into_ref(),
            Entry::Vacant(slot) if delta.creates_row() => {
                slot.insert(CorrelationLink::new(key.clone(), delta.room_scope, delta.at()))
            }
            Entry::Vacant(_) => return Err(EngineError::NotFound(key.to_string())),
        };
        let applied = delta.apply(&mut *row);
        Ok(Upserted {
            record: row.clone(),
            applied,
        })
    }

    async fn list_links(&self, entity_id: Option<&str>) -> Result<Vec<CorrelationLink>, EngineError> {
        let mut links: Vec<CorrelationLink> = self
            .links
            .iter()
            .filter(|r| {
                entity_id.map_or(true, |id| r.source_entity() == id || r.target_entity() == id)
            })
            .map(|r| r.value().clone())
            .collect();
        links.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(links)
    }
}

/// Apply a review status change if the lifecycle allows it
fn transition(
    evidence: &mut Evidence,
    status: PatternStatus,
    label: impl FnOnce() -> String,
) -> Result<(), EngineError> {
    if !evidence.status.can_become(status) {
        return Err(EngineError::InvalidTransition {
            key: label(),
            from: evidence.status,
            to: status,
        });
    }
    evidence.status = status;
    Ok(())
}

fn scene_label(members: &[SceneMember]) -> String {
    members
        .iter()
        .map(|m| format!("{}={}", m.entity_id, m.target_state))
        .collect::<Vec<_>>()
        .join(",")
}

/// In-memory store mirrored to a JSON file on [`JsonPatternStore::flush`]
#[derive(Debug)]
pub struct JsonPatternStore {
    inner: MemoryPatternStore,
    path: PathBuf,
    dirty: AtomicBool,
}

impl JsonPatternStore {
    /// Open the store at `path`, starting empty if the file does not exist
    pub async fn open(path: &Path) -> Result<Self, EngineError> {
        let snapshot = persistence::load_snapshot(path).await?;
        Ok(Self {
            inner: MemoryPatternStore::from_snapshot(snapshot),
            path: path.to_path_buf(),
            dirty: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write all rows to disk if anything changed since the last flush
    pub async fn flush(&self) -> Result<(), EngineError> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let snapshot = self.inner.snapshot();
        if let Err(e) = persistence::save_snapshot(&self.path, &snapshot).await {
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }

    fn touch(&self) {
        self.dirty.store(true, Ordering::Release);
    }
}

#[async_trait]
impl PatternStore for JsonPatternStore {
    async fn upsert_pattern(
        &self,
        key: &PatternKey,
        delta: EvidenceDelta,
    ) -> Result<Upserted<LearnedPattern>, EngineError> {
        let upserted = self.inner.upsert_pattern(key, delta).await?;
        self.touch();
        Ok(upserted)
    }

    async fn get_pattern(&self, key: &PatternKey) -> Result<Option<LearnedPattern>, EngineError> {
        self.inner.get_pattern(key).await
    }

    async fn list_patterns(&self, filter: &PatternFilter) -> Result<Vec<LearnedPattern>, EngineError> {
        self.inner.list_patterns(filter).await
    }

    async fn set_status(
        &self,
        key: &PatternKey,
        status: PatternStatus,
    ) -> Result<LearnedPattern, EngineError> {
        let pattern = self.inner.set_status(key, status).await?;
        self.touch();
        Ok(pattern)
    }

    async fn upsert_scene(
        &self,
        members: &[SceneMember],
        delta: EvidenceDelta,
    ) -> Result<Upserted<ScenePattern>, EngineError> {
        let upserted = self.inner.upsert_scene(members, delta).await?;
        self.touch();
        Ok(upserted)
    }

    async fn list_scenes(&self, status: Option<PatternStatus>) -> Result<Vec<ScenePattern>, EngineError> {
        self.inner.list_scenes(status).await
    }

    async fn set_scene_status(
        &self,
        members: &[SceneMember],
        status: PatternStatus,
    ) -> Result<ScenePattern, EngineError> {
        let scene = self.inner.set_scene_status(members, status).await?;
        self.touch();
        Ok(scene)
    }

    async fn upsert_link(
        &self,
        key: &LinkKey,
        delta: LinkDelta,
    ) -> Result<Upserted<CorrelationLink>, EngineError> {
        let upserted = self.inner.upsert_link(key, delta).await?;
        self.touch();
        Ok(upserted)
    }

    async fn list_links(&self, entity_id: Option<&str>) -> Result<Vec<CorrelationLink>, EngineError> {
        self.inner.list_links(entity_id).await
    }
}
