// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! Configuration revisions: immutable snapshots keyed by a monotonically
//! growing id, exactly one of which is applied.

use crate::MgmtError;
use config::Model;
use serde::{Deserialize, Serialize};
use store::{Bucket, Store};
use std::sync::Arc;
use tracing::{debug, info};

pub type RevisionId = u64;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RevisionStatus {
    Staged,
    Applied,
    Superseded,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfigRevision {
    pub id: RevisionId,
    pub parent: Option<RevisionId>,
    /// Where the model came from: a file path, `rpc`, or `signal`.
    pub source: String,
    pub model: Model,
    /// Unix seconds.
    pub staged_at: u64,
    pub applied_at: Option<u64>,
    pub status: RevisionStatus,
}

/// The revision database, persisted in the `revisions` bucket (keyed by a
/// zero-padded id so iteration is ordered) with the staged head mirrored in
/// `staged`.
pub struct ConfigDb {
    store: Arc<Store>,
    revisions: Vec<ConfigRevision>,
}

fn revision_key(id: RevisionId) -> String {
    format!("{id:020}")
}

impl ConfigDb {
    pub fn load(store: Arc<Store>) -> Result<ConfigDb, MgmtError> {
        let mut revisions: Vec<ConfigRevision> = store
            .scan_json::<ConfigRevision>(Bucket::Revisions)?
            .into_iter()
            .map(|(_, revision)| revision)
            .collect();
        revisions.sort_by_key(|r| r.id);
        debug!(revisions = revisions.len(), "config db loaded");
        Ok(ConfigDb { store, revisions })
    }

    #[must_use]
    pub fn applied(&self) -> Option<&ConfigRevision> {
        self.revisions
            .iter()
            .rev()
            .find(|r| r.status == RevisionStatus::Applied)
    }

    #[must_use]
    pub fn staged(&self) -> Option<&ConfigRevision> {
        self.revisions
            .iter()
            .rev()
            .find(|r| r.status == RevisionStatus::Staged)
    }

    #[must_use]
    pub fn get(&self, id: RevisionId) -> Option<&ConfigRevision> {
        self.revisions.iter().find(|r| r.id == id)
    }

    fn next_id(&self) -> RevisionId {
        self.revisions.last().map_or(1, |r| r.id + 1)
    }

    /// Stage a new revision, superseding any previously staged one.
    pub fn stage(&mut self, model: Model, source: &str, now: u64) -> Result<RevisionId, MgmtError> {
        let id = self.next_id();
        let revision = ConfigRevision {
            id,
            parent: self.applied().map(|r| r.id),
            source: source.to_string(),
            model,
            staged_at: now,
            applied_at: None,
            status: RevisionStatus::Staged,
        };

        let mut txn = self.store.begin();
        // The previous staged head is superseded, never silently replaced.
        for old in &mut self.revisions {
            if old.status == RevisionStatus::Staged {
                old.status = RevisionStatus::Superseded;
                txn.put_json(Bucket::Revisions, &revision_key(old.id), old)?;
            }
        }
        txn.put_json(Bucket::Revisions, &revision_key(id), &revision)?;
        txn.put_json(Bucket::Staged, "head", &id)?;
        txn.commit()?;

        info!(revision = id, source, "configuration staged");
        self.revisions.push(revision);
        Ok(id)
    }

    pub fn discard_staged(&mut self) -> Result<bool, MgmtError> {
        let mut discarded = false;
        let mut txn = self.store.begin();
        for revision in &mut self.revisions {
            if revision.status == RevisionStatus::Staged {
                revision.status = RevisionStatus::Superseded;
                txn.put_json(Bucket::Revisions, &revision_key(revision.id), revision)?;
                discarded = true;
            }
        }
        txn.delete(Bucket::Staged, "head");
        txn.commit()?;
        Ok(discarded)
    }

    /// Mark `id` applied inside `txn`; the caller commits as part of the
    /// global apply transaction.
    pub fn mark_applied(
        &mut self,
        id: RevisionId,
        now: u64,
        txn: &mut store::Txn<'_>,
    ) -> Result<(), MgmtError> {
        for revision in &mut self.revisions {
            if revision.status == RevisionStatus::Applied {
                revision.status = RevisionStatus::Superseded;
                txn.put_json(Bucket::Revisions, &revision_key(revision.id), revision)?;
            }
        }
        if let Some(revision) = self.revisions.iter_mut().find(|r| r.id == id) {
            revision.status = RevisionStatus::Applied;
            revision.applied_at = Some(now);
            txn.put_json(Bucket::Revisions, &revision_key(id), revision)?;
        }
        txn.delete(Bucket::Staged, "head");
        Ok(())
    }

    pub fn mark_failed(&mut self, id: RevisionId) -> Result<(), MgmtError> {
        let mut txn = self.store.begin();
        if let Some(revision) = self.revisions.iter_mut().find(|r| r.id == id) {
            revision.status = RevisionStatus::Failed;
            txn.put_json(Bucket::Revisions, &revision_key(id), revision)?;
        }
        txn.delete(Bucket::Staged, "head");
        txn.commit()?;
        Ok(())
    }

    /// Section-level diff between the applied and staged models, for the UI.
    #[must_use]
    pub fn diff(&self) -> serde_json::Value {
        let applied = self.applied().map(|r| &r.model);
        let staged = self.staged().map(|r| &r.model);
        let (Some(applied), Some(staged)) = (applied, staged) else {
            return serde_json::json!({
                "staged": staged.is_some(),
                "sections_changed": [],
            });
        };

        let a = serde_json::to_value(applied).unwrap_or_default();
        let b = serde_json::to_value(staged).unwrap_or_default();
        let mut changed = Vec::new();
        if let (Some(a), Some(b)) = (a.as_object(), b.as_object()) {
            for (section, old) in a {
                if b.get(section) != Some(old) {
                    changed.push(section.clone());
                }
            }
            for section in b.keys() {
                if !a.contains_key(section) {
                    changed.push(section.clone());
                }
            }
        }
        changed.sort();
        changed.dedup();
        serde_json::json!({
            "staged": true,
            "applied_revision": self.applied().map(|r| r.id),
            "staged_revision": self.staged().map(|r| r.id),
            "sections_changed": changed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn db() -> (tempfile::TempDir, ConfigDb) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(&dir.path().join("state.db")).unwrap());
        (dir, ConfigDb::load(store).unwrap())
    }

    #[test]
    fn staging_supersedes_previous_staged() {
        let (_dir, mut db) = db();
        let first = db.stage(Model::default(), "rpc", 1).unwrap();
        let second = db.stage(Model::default(), "rpc", 2).unwrap();
        assert_eq!(db.get(first).unwrap().status, RevisionStatus::Superseded);
        assert_eq!(db.staged().unwrap().id, second);
    }

    #[test]
    fn exactly_one_applied_at_a_time() {
        let (_dir, mut db) = db();
        let first = db.stage(Model::default(), "rpc", 1).unwrap();
        let store = db.store.clone();
        let mut txn = store.begin();
        db.mark_applied(first, 1, &mut txn).unwrap();
        txn.commit().unwrap();

        let second = db.stage(Model::default(), "rpc", 2).unwrap();
        let store = db.store.clone();
        let mut txn = store.begin();
        db.mark_applied(second, 2, &mut txn).unwrap();
        txn.commit().unwrap();

        let applied: Vec<_> = db
            .revisions
            .iter()
            .filter(|r| r.status == RevisionStatus::Applied)
            .collect();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].id, second);
        assert_eq!(applied[0].parent, Some(first));
    }

    #[test]
    fn survives_reload_from_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        {
            let store = Arc::new(Store::open(&path).unwrap());
            let mut db = ConfigDb::load(store).unwrap();
            db.stage(Model::default(), "file", 1).unwrap();
        }
        let store = Arc::new(Store::open(&path).unwrap());
        let db = ConfigDb::load(store).unwrap();
        assert_eq!(db.staged().unwrap().source, "file");
    }

    #[test]
    fn diff_reports_changed_sections() {
        let (_dir, mut db) = db();
        let base = Model::default();
        let id = db.stage(base.clone(), "rpc", 1).unwrap();
        let store = db.store.clone();
        let mut txn = store.begin();
        db.mark_applied(id, 1, &mut txn).unwrap();
        txn.commit().unwrap();

        let mut changed = base;
        changed.system.hostname = Some("edge".to_string());
        db.stage(changed, "rpc", 2).unwrap();
        let diff = db.diff();
        let sections: Vec<String> = diff["sections_changed"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        assert_eq!(sections, vec!["system".to_string()]);
    }
}
