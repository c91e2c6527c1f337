//! Graph Store (C6): the persistent module/edge database at the heart of
//! incremental correctness. Backed by `sled`, namespaced per configuration
//! version so that two versions never share a tree.
//!
//! Forward edges live in the `nodes` tree (one bincode-encoded [`ModuleNode`]
//! per key); the reverse index lives in the `rev` tree as `target\0dependent`
//! keys with an empty value, so `dependents(id)` is a bounded prefix scan
//! rather than a full scan of every node. Both trees are updated inside one
//! `sled` transaction per `record`/`remove` call, so a reader never observes
//! a forward edge without its matching reverse entry.

use crate::data::{ContentHash, ModuleId, ModuleKind, ModuleNode};
use crate::error::{GraphError, VersionMismatch};
use sled::Transactional;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::data::VersionHash;

const REV_SEP: u8 = 0;

pub struct GraphStore {
    db: sled::Db,
    nodes: sled::Tree,
    rev: sled::Tree,
    version: VersionHash,
    dirty: Arc<AtomicBool>,
    auto_flush_stop: Arc<AtomicBool>,
    auto_flush: Option<std::thread::JoinHandle<()>>,
}

impl GraphStore {
    /// Open the persistent store under `<path>/v<version>/`. Plain
    /// (non-async) by design, so it can be called from `#[test]` functions
    /// and other non-Tokio contexts without panicking for lack of a
    /// runtime; the auto-flush timer runs on its own OS thread rather than
    /// as a Tokio task.
    #[tracing::instrument(level = "debug", skip(path))]
    pub fn init(path: impl AsRef<Path>, version: VersionHash) -> Result<Self, GraphError> {
        let db_path = path.as_ref().join(format!("v{}", version.0));
        let db = sled::open(db_path)?;
        let nodes = db.open_tree("nodes")?;
        let rev = db.open_tree("rev")?;

        let dirty = Arc::new(AtomicBool::new(false));
        let auto_flush_stop = Arc::new(AtomicBool::new(false));
        let auto_flush = {
            let db = db.clone();
            let dirty = dirty.clone();
            let stop = auto_flush_stop.clone();
            std::thread::Builder::new()
                .name("ionify-graph-auto-flush".to_string())
                .spawn(move || {
                    while !stop.load(Ordering::Acquire) {
                        std::thread::sleep(Duration::from_millis(250));
                        if stop.load(Ordering::Acquire) {
                            break;
                        }
                        if dirty.swap(false, Ordering::AcqRel) {
                            if let Err(err) = db.flush() {
                                tracing::warn!(error = ?err, "auto-flush of graph store failed");
                            }
                        }
                    }
                })
                .ok()
        };

        Ok(Self {
            db,
            nodes,
            rev,
            version,
            dirty,
            auto_flush_stop,
            auto_flush,
        })
    }

    fn node_key(id: &ModuleId) -> Vec<u8> {
        id.canonical_key().into_bytes()
    }

    fn rev_key(target: &ModuleId, dependent: &ModuleId) -> Vec<u8> {
        let mut key = Self::node_key(target);
        key.push(REV_SEP);
        key.extend(Self::node_key(dependent));
        key
    }

    fn decode_node(bytes: &[u8]) -> Result<ModuleNode, GraphError> {
        Ok(bincode::deserialize(bytes)?)
    }

    fn encode_node(node: &ModuleNode) -> Result<Vec<u8>, GraphError> {
        Ok(bincode::serialize(node)?)
    }

    /// Distinguishes a node recorded under a different `config_hash` from
    /// one that simply isn't there. `checked` collapses this to `None`
    /// either way per the uniform-missing policy below; kept separate so
    /// the distinction stays assertable from a test.
    fn version_check(&self, node: ModuleNode) -> Result<ModuleNode, VersionMismatch> {
        match &node.config_hash {
            Some(h) if h != &self.version => Err(VersionMismatch),
            _ => Ok(node),
        }
    }

    /// `spec.md` §9 mandates uniform treatment of a version mismatch as
    /// "missing"; this is the single checkpoint that enforces it.
    fn checked(&self, node: ModuleNode) -> Option<ModuleNode> {
        self.version_check(node).ok()
    }

    /// Upsert a node. Returns whether anything observable changed.
    #[tracing::instrument(level = "trace", skip(self, static_deps, dynamic_deps))]
    pub fn record(
        &self,
        id: ModuleId,
        content_hash: Option<ContentHash>,
        static_deps: Vec<ModuleId>,
        dynamic_deps: Vec<ModuleId>,
        kind: ModuleKind,
    ) -> Result<bool, GraphError> {
        let key = Self::node_key(&id);
        let previous = match self.nodes.get(&key)? {
            Some(bytes) => Some(Self::decode_node(&bytes)?),
            None => None,
        };

        let changed = match &previous {
            None => true,
            Some(prev) => {
                prev.content_hash != content_hash
                    || prev.static_deps != static_deps
                    || prev.dynamic_deps != dynamic_deps
            }
        };

        let new_node = ModuleNode {
            id: id.clone(),
            content_hash,
            kind,
            static_deps: dedup_preserve_order(static_deps),
            dynamic_deps: dedup_preserve_order(dynamic_deps),
            config_hash: Some(self.version.clone()),
            mtime_ms: previous.as_ref().and_then(|p| p.mtime_ms),
        };

        (&self.nodes, &self.rev)
            .transaction(|(nodes, rev)| {
                // Drop this node's previous reverse-index entries before
                // writing the new edge set, so stale dependents never linger.
                if let Some(prev) = &previous {
                    for old_dep in prev.all_deps() {
                        rev.remove(Self::rev_key(old_dep, &id))?;
                    }
                }
                for dep in new_node.all_deps() {
                    rev.insert(Self::rev_key(dep, &id), &[][..])?;
                }
                nodes.insert(
                    key.clone(),
                    Self::encode_node(&new_node)
                        .map_err(|e| sled::transaction::ConflictableTransactionError::Abort(e))?,
                )?;
                Ok(())
            })
            .map_err(graph_tx_err)?;

        self.dirty.store(true, Ordering::Release);
        Ok(changed)
    }

    pub fn get(&self, id: &ModuleId) -> Result<Option<ModuleNode>, GraphError> {
        match self.nodes.get(Self::node_key(id))? {
            Some(bytes) => Ok(self.checked(Self::decode_node(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn deps(&self, id: &ModuleId) -> Result<Vec<ModuleId>, GraphError> {
        Ok(self
            .get(id)?
            .map(|n| n.all_deps().cloned().collect())
            .unwrap_or_default())
    }

    /// O(1) relative to graph size: a bounded prefix scan of the reverse
    /// index, never a scan of every node.
    pub fn dependents(&self, id: &ModuleId) -> Result<Vec<ModuleId>, GraphError> {
        let prefix = {
            let mut p = Self::node_key(id);
            p.push(REV_SEP);
            p
        };
        let mut out = Vec::new();
        for entry in self.rev.scan_prefix(&prefix) {
            let (key, _) = entry?;
            let dependent_bytes = &key[prefix.len()..];
            let dependent_key = String::from_utf8_lossy(dependent_bytes).into_owned();
            if let Some(bytes) = self.nodes.get(dependent_key.as_bytes())? {
                let node = Self::decode_node(&bytes)?;
                if self.checked(node.clone()).is_some() {
                    out.push(node.id);
                }
            }
        }
        Ok(out)
    }

    /// Remove `id`; also prunes it from every dependent's dep sets, using
    /// the reverse index to find them in O(k) rather than scanning.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn remove(&self, id: &ModuleId) -> Result<(), GraphError> {
        let dependents = self.dependents(id)?;
        let key = Self::node_key(id);

        let node = match self.nodes.get(&key)? {
            Some(bytes) => Some(Self::decode_node(&bytes)?),
            None => None,
        };

        (&self.nodes, &self.rev)
            .transaction(|(nodes, rev)| {
                if let Some(node) = &node {
                    for dep in node.all_deps() {
                        rev.remove(Self::rev_key(dep, id))?;
                    }
                }
                nodes.remove(key.clone())?;
                Ok(())
            })
            .map_err(graph_tx_err)?;

        for dependent_id in dependents {
            if let Some(mut dependent) = self.get(&dependent_id)? {
                dependent.static_deps.retain(|d| d != id);
                dependent.dynamic_deps.retain(|d| d != id);
                self.record(
                    dependent.id,
                    dependent.content_hash,
                    dependent.static_deps,
                    dependent.dynamic_deps,
                    dependent.kind,
                )?;
            }
        }

        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    /// BFS over the reverse index from `seeds`. Seeds come first in the
    /// given order, then discovered nodes in BFS order; never revisits a
    /// node, so cycles in the dependency graph cannot cause an infinite loop.
    #[tracing::instrument(level = "trace", skip(self, seeds))]
    pub fn collect_affected(&self, seeds: &[ModuleId]) -> Result<Vec<ModuleId>, GraphError> {
        let mut seen: std::collections::HashSet<ModuleId> = seeds.iter().cloned().collect();
        let mut ordered: Vec<ModuleId> = seeds.to_vec();
        let mut queue: VecDeque<ModuleId> = seeds.iter().cloned().collect();

        while let Some(current) = queue.pop_front() {
            for dependent in self.dependents(&current)? {
                if seen.insert(dependent.clone()) {
                    ordered.push(dependent.clone());
                    queue.push_back(dependent);
                }
            }
        }

        Ok(ordered)
    }

    pub fn snapshot(&self) -> Result<Vec<ModuleNode>, GraphError> {
        let mut out = Vec::new();
        for entry in self.nodes.iter() {
            let (_, bytes) = entry?;
            if let Some(node) = self.checked(Self::decode_node(&bytes)?) {
                out.push(node);
            }
        }
        Ok(out)
    }

    pub async fn flush(&self) -> Result<(), GraphError> {
        self.db.flush_async().await?;
        self.dirty.store(false, Ordering::Release);
        Ok(())
    }
}

impl Drop for GraphStore {
    fn drop(&mut self) {
        self.auto_flush_stop.store(true, Ordering::Release);
        if let Some(handle) = self.auto_flush.take() {
            let _ = handle.join();
        }
    }
}

fn dedup_preserve_order(ids: Vec<ModuleId>) -> Vec<ModuleId> {
    let mut seen = std::collections::HashSet::new();
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

fn graph_tx_err(e: sled::transaction::TransactionError<GraphError>) -> GraphError {
    match e {
        sled::transaction::TransactionError::Abort(inner) => inner,
        sled::transaction::TransactionError::Storage(e) => GraphError::Storage(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> GraphStore {
        let dir = tempfile::tempdir().unwrap();
        GraphStore::init(dir.path(), VersionHash("v1".into())).unwrap()
    }

    #[test]
    fn record_twice_with_same_args_reports_unchanged() {
        let s = store();
        let a = ModuleId::new("/a.ts");
        let changed1 = s
            .record(a.clone(), None, vec![], vec![], ModuleKind::Js)
            .unwrap();
        let changed2 = s
            .record(a, None, vec![], vec![], ModuleKind::Js)
            .unwrap();
        assert!(changed1);
        assert!(!changed2);
    }

    #[test]
    fn remove_prunes_dependents_and_reverse_index() {
        let s = store();
        let a = ModuleId::new("/a.ts");
        let b = ModuleId::new("/b.ts");
        let c = ModuleId::new("/c.ts");

        s.record(a.clone(), None, vec![b.clone()], vec![], ModuleKind::Js).unwrap();
        s.record(b.clone(), None, vec![c.clone()], vec![], ModuleKind::Js).unwrap();
        s.record(c.clone(), None, vec![], vec![], ModuleKind::Js).unwrap();

        s.remove(&b).unwrap();

        assert!(s.get(&b).unwrap().is_none());
        assert_eq!(s.deps(&a).unwrap(), Vec::<ModuleId>::new());
        assert_eq!(s.dependents(&c).unwrap(), Vec::<ModuleId>::new());
    }

    #[test]
    fn collect_affected_orders_seeds_then_bfs_discovery() {
        let s = store();
        let a = ModuleId::new("/a.ts");
        let b = ModuleId::new("/b.ts");

        s.record(a.clone(), None, vec![b.clone()], vec![], ModuleKind::Js).unwrap();
        s.record(b.clone(), None, vec![], vec![], ModuleKind::Js).unwrap();

        let affected = s.collect_affected(&[b.clone()]).unwrap();
        assert_eq!(affected, vec![b, a]);
    }

    #[test]
    fn version_mismatch_is_treated_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        {
            let s = GraphStore::init(dir.path().join("store"), VersionHash("old".into())).unwrap();
            s.record(ModuleId::new("/a.ts"), None, vec![], vec![], ModuleKind::Js)
                .unwrap();
        }
        // Re-open the same on-disk root under a different namespace: the new
        // version never shares a tree with the old one, so the node is gone.
        let s2 = GraphStore::init(dir.path().join("store"), VersionHash("new".into())).unwrap();
        assert!(s2.get(&ModuleId::new("/a.ts")).unwrap().is_none());
    }

    #[test]
    fn version_check_reports_the_mismatch_reason() {
        let s = store();
        let mismatched = ModuleNode {
            id: ModuleId::new("/a.ts"),
            content_hash: None,
            kind: ModuleKind::Js,
            static_deps: vec![],
            dynamic_deps: vec![],
            config_hash: Some(VersionHash("other".into())),
            mtime_ms: None,
        };
        assert!(matches!(s.version_check(mismatched), Err(VersionMismatch)));
    }

    #[test]
    fn cyclic_graph_does_not_loop_forever() {
        let s = store();
        let a = ModuleId::new("/a.ts");
        let b = ModuleId::new("/b.ts");
        s.record(a.clone(), None, vec![b.clone()], vec![], ModuleKind::Js).unwrap();
        s.record(b.clone(), None, vec![a.clone()], vec![], ModuleKind::Js).unwrap();

        let affected = s.collect_affected(&[a.clone()]).unwrap();
        assert_eq!(affected.len(), 2);
    }
}
