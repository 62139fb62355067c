//! Rollback points backed by a content-addressed blob store.
//!
//! A [`RollbackPoint`] only holds `path → sha256`. The content behind each
//! hash lives once in the store's blob map, so points that share files share
//! storage. Blobs no longer referenced by any point are dropped on eviction.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::SecurityError;
use crate::fs_store::{sha256_hex, FileStore};
use crate::task::TaskId;

/// Rollback points kept per task; older ones are evicted.
pub const MAX_ROLLBACK_POINTS: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackPoint {
    pub id: String,
    pub task_id: TaskId,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    pub file_hashes: BTreeMap<String, String>,
}

/// What [`RollbackStore::execute`] changed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackReport {
    pub rollback_id: String,
    /// Files rewritten from the snapshot
    pub restored: Vec<String>,
    /// Files created after the snapshot and deleted
    pub removed: Vec<String>,
    /// Integrity findings: files modified or removed since the snapshot
    pub mismatches: Vec<String>,
}

#[derive(Default)]
pub(crate) struct RollbackStore {
    points: RwLock<HashMap<TaskId, VecDeque<RollbackPoint>>>,
    blobs: RwLock<HashMap<String, Arc<str>>>,
}

impl RollbackStore {
    pub async fn create(
        &self,
        file_store: &dyn FileStore,
        task_id: &TaskId,
        description: &str,
        project_path: &Path,
    ) -> Result<RollbackPoint, SecurityError> {
        let files = file_store
            .list_project_files(project_path)
            .await
            .map_err(|e| SecurityError::Io(format!("{:#}", e)))?;

        let hashed: Vec<(String, String, String)> = files
            .into_iter()
            .map(|(path, content)| {
                let hash = sha256_hex(&content);
                (path, hash, content)
            })
            .collect();
        let file_hashes: BTreeMap<String, String> = hashed
            .iter()
            .map(|(path, hash, _)| (path.clone(), hash.clone()))
            .collect();

        let point = RollbackPoint {
            id: format!("rb-{}", &Uuid::new_v4().simple().to_string()[..12]),
            task_id: task_id.clone(),
            timestamp: Utc::now(),
            description: description.to_string(),
            file_hashes,
        };

        // Lock order is points, then blobs. The point and its blobs become
        // visible together, so a concurrent collection never sees one without
        // the other.
        {
            let mut points = self.points.write().await;
            let mut blobs = self.blobs.write().await;
            for (_, hash, content) in hashed {
                blobs
                    .entry(hash)
                    .or_insert_with(|| Arc::from(content.as_str()));
            }
            let list = points.entry(task_id.clone()).or_default();
            list.push_back(point.clone());
            let mut evicted = false;
            while list.len() > MAX_ROLLBACK_POINTS {
                list.pop_front();
                evicted = true;
            }
            if evicted {
                collect_garbage(&points, &mut blobs);
            }
        }

        tracing::info!(
            task_id = %task_id,
            rollback_id = %point.id,
            files = point.file_hashes.len(),
            "Created rollback point"
        );
        Ok(point)
    }

    pub async fn list(&self, task_id: &TaskId) -> Vec<RollbackPoint> {
        self.points
            .read()
            .await
            .get(task_id)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Restore the project to `rollback_id`.
    ///
    /// Integrity is checked first; mismatches are reported and logged but do
    /// not stop the restore.
    pub async fn execute(
        &self,
        file_store: &dyn FileStore,
        task_id: &TaskId,
        rollback_id: &str,
        project_path: &Path,
    ) -> Result<RollbackReport, SecurityError> {
        // Resolve the point and copy out its blobs under one consistent view.
        let (point, contents) = {
            let points = self.points.read().await;
            let list = points
                .get(task_id)
                .ok_or_else(|| SecurityError::NoRollbackPoints(task_id.to_string()))?;
            let point = list
                .iter()
                .find(|p| p.id == rollback_id)
                .cloned()
                .ok_or_else(|| SecurityError::RollbackNotFound(rollback_id.to_string()))?;
            let blobs = self.blobs.read().await;
            let mut contents = HashMap::new();
            for hash in point.file_hashes.values() {
                let blob = blobs
                    .get(hash)
                    .ok_or_else(|| SecurityError::MissingBlob(hash.clone()))?;
                contents.insert(hash.clone(), Arc::clone(blob));
            }
            (point, contents)
        };

        let current = file_store
            .list_project_files(project_path)
            .await
            .map_err(|e| SecurityError::Io(format!("{:#}", e)))?;
        let current_hashes: BTreeMap<&String, String> = current
            .iter()
            .map(|(path, content)| (path, sha256_hex(content)))
            .collect();

        let mut report = RollbackReport {
            rollback_id: point.id.clone(),
            ..Default::default()
        };
        let stale: Vec<(&String, &String)> = point
            .file_hashes
            .iter()
            .filter(|(path, hash)| current_hashes.get(path) != Some(*hash))
            .collect();
        for (path, _) in &stale {
            let state = if current.contains_key(*path) {
                "modified"
            } else {
                "removed"
            };
            report.mismatches.push(format!("{} {}", state, path));
        }
        if !report.mismatches.is_empty() {
            tracing::warn!(
                task_id = %task_id,
                rollback_id,
                "Integrity check found {} change(s) since snapshot: {:?}",
                report.mismatches.len(),
                report.mismatches
            );
        }

        for (path, hash) in stale {
            let content = contents
                .get(hash)
                .ok_or_else(|| SecurityError::MissingBlob(hash.clone()))?;
            file_store
                .write(project_path, path, content)
                .await
                .map_err(|e| SecurityError::Io(format!("{:#}", e)))?;
            report.restored.push(path.clone());
        }

        for path in current.keys() {
            if !point.file_hashes.contains_key(path) {
                file_store
                    .delete(project_path, path)
                    .await
                    .map_err(|e| SecurityError::Io(format!("{:#}", e)))?;
                report.removed.push(path.clone());
            }
        }

        tracing::info!(
            task_id = %task_id,
            rollback_id,
            restored = report.restored.len(),
            removed = report.removed.len(),
            "Rollback executed"
        );
        Ok(report)
    }

    pub async fn forget(&self, task_id: &TaskId) {
        let mut points = self.points.write().await;
        if points.remove(task_id).is_some() {
            let mut blobs = self.blobs.write().await;
            collect_garbage(&points, &mut blobs);
        }
    }

    #[cfg(test)]
    pub async fn blob_count(&self) -> usize {
        self.blobs.read().await.len()
    }

    #[cfg(test)]
    pub async fn has_blob(&self, hash: &str) -> bool {
        self.blobs.read().await.contains_key(hash)
    }
}

/// Drop blobs no remaining point references. Callers hold both locks.
fn collect_garbage(
    points: &HashMap<TaskId, VecDeque<RollbackPoint>>,
    blobs: &mut HashMap<String, Arc<str>>,
) {
    let referenced: HashSet<&String> = points
        .values()
        .flatten()
        .flat_map(|p| p.file_hashes.values())
        .collect();
    blobs.retain(|hash, _| referenced.contains(hash));
}
