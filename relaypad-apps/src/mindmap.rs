//! Shared mind map: nodes and edges as whole JSON records keyed by id
//! (`mindmap-nodes`, `mindmap-edges`) plus a layout setting.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde_json::Value;
use yrs::{Any, Doc, Map, MapRef, Transact, TransactionMut};

use crate::value::{self, json_to_any};
use crate::AppError;

pub const NODES: &str = "mindmap-nodes";
pub const EDGES: &str = "mindmap-edges";
pub const SETTINGS: &str = "mindmap-settings";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Layout {
    Horizontal,
    #[default]
    Vertical,
}

impl Layout {
    pub const fn as_str(self) -> &'static str {
        match self {
            Layout::Horizontal => "horizontal",
            Layout::Vertical => "vertical",
        }
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Layout {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "horizontal" => Ok(Layout::Horizontal),
            "vertical" => Ok(Layout::Vertical),
            _ => Err(()),
        }
    }
}

/// What a diff-sync wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub written: usize,
    pub removed: usize,
}

pub struct Mindmap {
    doc: Doc,
    nodes: MapRef,
    edges: MapRef,
    settings: MapRef,
}

fn record_id(record: &Value) -> Result<&str, AppError> {
    record.get("id").and_then(Value::as_str).ok_or(AppError::MissingId)
}

/// Writes `record` unless an identical one is stored.
fn upsert(map: &MapRef, txn: &mut TransactionMut<'_>, record: &Value) -> Result<bool, AppError> {
    let id = record_id(record)?;
    let encoded = json_to_any(record)?;
    if value::any(map.get(txn, id)).as_ref() == Some(&encoded) {
        return Ok(false);
    }
    map.insert(txn, id, encoded);
    Ok(true)
}

/// Makes `map` hold exactly `records`, touching only what differs.
fn diff_sync(map: &MapRef, txn: &mut TransactionMut<'_>, records: &[Value]) -> Result<SyncStats, AppError> {
    let mut stats = SyncStats::default();
    let mut keep = HashSet::new();
    for record in records {
        keep.insert(record_id(record)?.to_string());
        if upsert(map, txn, record)? {
            stats.written += 1;
        }
    }
    let stale: Vec<String> = map
        .keys(txn)
        .filter(|id| !keep.contains(*id))
        .map(str::to_string)
        .collect();
    for id in stale {
        map.remove(txn, &id);
        stats.removed += 1;
    }
    Ok(stats)
}

fn records(map: &MapRef, doc: &Doc) -> Vec<Value> {
    let txn = doc.transact();
    let mut records: Vec<(String, Value)> = map
        .iter(&txn)
        .filter_map(|(id, out)| {
            let record = value::any(Some(out))?;
            Some((id.to_string(), value::any_to_json(&record)?))
        })
        .collect();
    records.sort_by(|a, b| a.0.cmp(&b.0));
    records.into_iter().map(|(_, record)| record).collect()
}

impl Mindmap {
    pub fn new(doc: &Doc) -> Self {
        Self {
            nodes: doc.get_or_insert_map(NODES),
            edges: doc.get_or_insert_map(EDGES),
            settings: doc.get_or_insert_map(SETTINGS),
            doc: doc.clone(),
        }
    }

    /// Stores a node record (any JSON object with a string `id`).
    pub fn upsert_node(&self, node: &Value) -> Result<bool, AppError> {
        upsert(&self.nodes, &mut self.doc.transact_mut(), node)
    }

    pub fn remove_node(&self, id: &str) -> bool {
        self.nodes.remove(&mut self.doc.transact_mut(), id).is_some()
    }

    pub fn upsert_edge(&self, edge: &Value) -> Result<bool, AppError> {
        upsert(&self.edges, &mut self.doc.transact_mut(), edge)
    }

    pub fn remove_edge(&self, id: &str) -> bool {
        self.edges.remove(&mut self.doc.transact_mut(), id).is_some()
    }

    /// Replaces the node set with `nodes` in one transaction.
    pub fn sync_nodes(&self, nodes: &[Value]) -> Result<SyncStats, AppError> {
        diff_sync(&self.nodes, &mut self.doc.transact_mut(), nodes)
    }

    pub fn sync_edges(&self, edges: &[Value]) -> Result<SyncStats, AppError> {
        diff_sync(&self.edges, &mut self.doc.transact_mut(), edges)
    }

    /// Node records ordered by id.
    pub fn nodes(&self) -> Vec<Value> {
        records(&self.nodes, &self.doc)
    }

    pub fn edges(&self) -> Vec<Value> {
        records(&self.edges, &self.doc)
    }

    pub fn layout(&self) -> Layout {
        let txn = self.doc.transact();
        value::string(self.settings.get(&txn, "layout"))
            .and_then(|layout| layout.parse().ok())
            .unwrap_or_default()
    }

    pub fn set_layout(&self, layout: Layout) {
        let mut txn = self.doc.transact_mut();
        if value::string(self.settings.get(&txn, "layout")).as_deref() != Some(layout.as_str()) {
            self.settings.insert(&mut txn, "layout", Any::from(layout.as_str()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sync, update_count};
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn node(id: &str, label: &str) -> Value {
        json!({"id": id, "data": {"label": label}, "position": {"x": 1.5, "y": 2.5}})
    }

    #[test]
    fn test_upsert_skips_identical() {
        let doc = Doc::new();
        let map = Mindmap::new(&doc);
        assert!(map.upsert_node(&node("n1", "root")).unwrap());
        assert!(!map.upsert_node(&node("n1", "root")).unwrap());
        assert!(map.upsert_node(&node("n1", "renamed")).unwrap());
        assert_eq!(map.nodes(), vec![node("n1", "renamed")]);
        assert!(matches!(map.upsert_node(&json!({"label": "x"})), Err(AppError::MissingId)));
    }

    #[test]
    fn test_diff_sync_is_one_transaction() {
        let doc = Doc::new();
        let map = Mindmap::new(&doc);
        map.sync_nodes(&[node("a", "a"), node("b", "b")]).unwrap();

        let (count, _sub) = update_count(&doc);
        let stats = map.sync_nodes(&[node("b", "b"), node("c", "c")]).unwrap();
        assert_eq!(stats, SyncStats { written: 1, removed: 1 });
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(map.nodes(), vec![node("b", "b"), node("c", "c")]);
    }

    #[test]
    fn test_edges_and_layout_replicate() {
        let one = Doc::new();
        let two = Doc::new();
        let local = Mindmap::new(&one);
        local.upsert_edge(&json!({"id": "e1", "source": "a", "target": "b"})).unwrap();
        assert_eq!(local.layout(), Layout::Vertical);
        local.set_layout(Layout::Horizontal);
        sync(&one, &two);

        let remote = Mindmap::new(&two);
        assert_eq!(remote.layout(), Layout::Horizontal);
        assert_eq!(remote.edges().len(), 1);
        assert!(remote.remove_edge("e1"));
        assert!(remote.edges().is_empty());
        assert_eq!("sideways".parse::<Layout>(), Err(()));
    }
}
