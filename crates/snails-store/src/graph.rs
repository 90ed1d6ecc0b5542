use rusqlite::{params, OptionalExtension};

use snails_shared::graph::{validate_soul, GraphNode, GraphValue, MergeReport, State};

use crate::database::Database;
use crate::error::{Result, StoreError};

/// Size of the stored graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct StoreStats {
    pub nodes: usize,
    pub fields: usize,
}

impl Database {
    /// Load a whole node, `None` if no field was ever written under `soul`.
    pub fn get_node(&self, soul: &str) -> Result<Option<GraphNode>> {
        let mut stmt = self
            .conn()
            .prepare_cached("SELECT key, value, state FROM graph_fields WHERE soul = ?1")?;

        let rows = stmt.query_map(params![soul], |row| {
            let key: String = row.get(0)?;
            let value: String = row.get(1)?;
            let state: f64 = row.get(2)?;
            Ok((key, value, state))
        })?;

        let mut node = GraphNode::new(soul);
        for row in rows {
            let (key, raw, state) = row?;
            let value = decode_value(soul, &key, &raw)?;
            node.set(key, value, state);
        }

        if node.fields.is_empty() {
            Ok(None)
        } else {
            Ok(Some(node))
        }
    }

    /// Load a single field of a node.
    pub fn get_field(&self, soul: &str, key: &str) -> Result<Option<GraphNode>> {
        let row = self
            .conn()
            .query_row(
                "SELECT value, state FROM graph_fields WHERE soul = ?1 AND key = ?2",
                params![soul, key],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)),
            )
            .optional()?;

        match row {
            Some((raw, state)) => {
                let value = decode_value(soul, key, &raw)?;
                Ok(Some(GraphNode::new(soul).with_field(key, value, state)))
            }
            None => Ok(None),
        }
    }

    /// Merge `incoming` into the stored node and persist the winning fields.
    ///
    /// Returns the report of what changed; its `diff` is what should be
    /// forwarded to other peers.
    pub fn put_node(&self, incoming: &GraphNode, now: State) -> Result<MergeReport> {
        validate_soul(&incoming.soul)?;

        let tx = self.conn().unchecked_transaction()?;

        let mut current = self
            .get_node(&incoming.soul)?
            .unwrap_or_else(|| GraphNode::new(incoming.soul.clone()));
        let report = current.merge(incoming, now);

        {
            let mut upsert = tx.prepare_cached(
                "INSERT INTO graph_fields (soul, key, value, state) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(soul, key) DO UPDATE SET value = excluded.value, state = excluded.state",
            )?;
            for (key, field) in &report.diff.fields {
                upsert.execute(params![
                    incoming.soul,
                    key,
                    field.value.to_json().to_string(),
                    field.state
                ])?;
            }
        }

        tx.commit()?;

        if report.changed() {
            tracing::debug!(
                soul = %incoming.soul,
                changed = report.diff.fields.len(),
                historical = report.historical,
                deferred = report.deferred,
                "graph node merged"
            );
        }

        Ok(report)
    }

    /// Souls directly or indirectly under `prefix/`.
    pub fn souls_under(&self, prefix: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn().prepare_cached(
            "SELECT DISTINCT soul FROM graph_fields WHERE substr(soul, 1, ?2) = ?1 ORDER BY soul",
        )?;
        let pattern = format!("{prefix}/");
        // substr counts characters, not bytes.
        let rows = stmt.query_map(params![pattern, pattern.chars().count() as i64], |row| {
            row.get::<_, String>(0)
        })?;

        let mut souls = Vec::new();
        for row in rows {
            souls.push(row?);
        }
        Ok(souls)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let (nodes, fields) = self.conn().query_row(
            "SELECT COUNT(DISTINCT soul), COUNT(*) FROM graph_fields",
            [],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )?;
        Ok(StoreStats {
            nodes: nodes as usize,
            fields: fields as usize,
        })
    }
}

fn decode_value(soul: &str, key: &str, raw: &str) -> Result<GraphValue> {
    serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .and_then(|v| GraphValue::from_json(&v))
        .ok_or_else(|| StoreError::Corrupt {
            soul: soul.to_string(),
            key: key.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: State = 1_700_000_000_000.0;

    fn db() -> Database {
        Database::open_in_memory().unwrap()
    }

    #[test]
    fn missing_node_is_none() {
        assert!(db().get_node("users/nobody").unwrap().is_none());
    }

    #[test]
    fn put_then_get() {
        let db = db();
        let node = GraphNode::new("users/stars1abc")
            .with_field("name", GraphValue::Text("turbo".into()), NOW - 10.0)
            .with_field("data", GraphValue::Link("users/stars1abc/data".into()), NOW - 10.0);

        let report = db.put_node(&node, NOW).unwrap();
        assert_eq!(report.diff.fields.len(), 2);

        let loaded = db.get_node("users/stars1abc").unwrap().unwrap();
        assert_eq!(loaded, node);
    }

    #[test]
    fn older_write_does_not_overwrite() {
        let db = db();
        let newer = GraphNode::new("rooms/1").with_field("name", GraphValue::Text("new".into()), NOW - 1.0);
        let older = GraphNode::new("rooms/1").with_field("name", GraphValue::Text("old".into()), NOW - 5.0);

        db.put_node(&newer, NOW).unwrap();
        let report = db.put_node(&older, NOW).unwrap();
        assert!(!report.changed());
        assert_eq!(report.historical, 1);

        let loaded = db.get_field("rooms/1", "name").unwrap().unwrap();
        assert_eq!(loaded.get("name"), Some(&GraphValue::Text("new".into())));
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.db");
        {
            let db = Database::open_at(&path).unwrap();
            let node = GraphNode::new("snails-social/42/likes")
                .with_field("stars1abc", GraphValue::Bool(true), NOW - 1.0);
            db.put_node(&node, NOW).unwrap();
        }
        let db = Database::open_at(&path).unwrap();
        let node = db.get_node("snails-social/42/likes").unwrap().unwrap();
        assert_eq!(node.get("stars1abc"), Some(&GraphValue::Bool(true)));
    }

    #[test]
    fn souls_under_prefix_and_stats() {
        let db = db();
        for soul in ["rooms/a", "rooms/a/users", "rooms/b", "roomsx/c"] {
            let node = GraphNode::new(soul).with_field("k", GraphValue::Number(1.0), NOW - 1.0);
            db.put_node(&node, NOW).unwrap();
        }
        assert_eq!(
            db.souls_under("rooms").unwrap(),
            vec!["rooms/a", "rooms/a/users", "rooms/b"]
        );
        assert_eq!(db.stats().unwrap(), StoreStats { nodes: 4, fields: 4 });
    }

    #[test]
    fn souls_under_non_ascii_prefix() {
        let db = db();
        for soul in ["salons/caf\u{e9}/users", "salons/caf\u{e9}/m1", "salons/cafe/m1"] {
            let node = GraphNode::new(soul).with_field("k", GraphValue::Number(1.0), NOW - 1.0);
            db.put_node(&node, NOW).unwrap();
        }
        assert_eq!(
            db.souls_under("salons/caf\u{e9}").unwrap(),
            vec!["salons/caf\u{e9}/m1", "salons/caf\u{e9}/users"]
        );
    }

    #[test]
    fn invalid_soul_rejected() {
        let node = GraphNode::new("").with_field("k", GraphValue::Null, NOW);
        assert!(matches!(db().put_node(&node, NOW), Err(StoreError::Graph(_))));
    }
}
