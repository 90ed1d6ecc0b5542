//! Graph node model and merge policy.
//!
//! A node is a flat bag of fields addressed by a *soul*. Every field carries
//! a *state*: milliseconds since the Unix epoch at which it was written.
//! Nested objects never live inside a node; they are split into child nodes
//! (`parent/key`) and the parent holds a link to each one.
//!
//! Merge policy, applied per field:
//!
//! 1. a state more than [`MAX_CLOCK_DRIFT_MS`] ahead of the local clock is
//!    deferred and not applied;
//! 2. a field unknown locally is applied;
//! 3. the greater state wins;
//! 4. on equal states the value with the greater canonical JSON encoding
//!    wins.
//!
//! The rule is total and does not depend on arrival order, so every replica
//! that saw the same writes ends in the same state.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde_json::{Map, Value};

use crate::constants::{MAX_CLOCK_DRIFT_MS, META_KEY};
use crate::error::GraphError;

pub type State = f64;

/// Current wall clock in state units.
pub fn now_state() -> State {
    chrono::Utc::now().timestamp_micros() as f64 / 1000.0
}

/// Hands out strictly increasing states even when called twice in the same
/// millisecond.
#[derive(Debug, Default)]
pub struct StateClock {
    last: Mutex<State>,
}

impl StateClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> State {
        let now = now_state();
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        *last = if now > *last { now } else { *last + 0.001 };
        *last
    }
}

/// Join a parent soul and a key into the child soul.
pub fn child_soul(parent: &str, key: &str) -> String {
    format!("{parent}/{key}")
}

pub fn validate_soul(soul: &str) -> Result<(), GraphError> {
    if soul.is_empty() || soul.starts_with('/') || soul.ends_with('/') || soul.contains("//") {
        return Err(GraphError::InvalidSoul(soul.to_string()));
    }
    Ok(())
}

fn validate_key(key: &str) -> Result<(), GraphError> {
    if key.is_empty() || key == META_KEY || key.contains('/') {
        return Err(GraphError::UnsupportedValue(key.to_string()));
    }
    Ok(())
}

/// A single field value. Objects are never values; they become links.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    Link(String),
}

impl GraphValue {
    /// Parse a wire value. Objects other than `{"#": soul}` are rejected.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(Self::Null),
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Number(n) => n.as_f64().map(Self::Number),
            Value::String(s) => Some(Self::Text(s.clone())),
            Value::Object(map) if map.len() == 1 => map
                .get("#")
                .and_then(Value::as_str)
                .map(|soul| Self::Link(soul.to_string())),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::Text(s) => Value::String(s.clone()),
            Self::Link(soul) => serde_json::json!({ "#": soul }),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_link(&self) -> Option<&str> {
        match self {
            Self::Link(soul) => Some(soul),
            _ => None,
        }
    }

    fn canonical(&self) -> String {
        self.to_json().to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub state: State,
    pub value: GraphValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Incoming field replaced (or created) the local one.
    Applied,
    /// Incoming field is older than the local one.
    Historical,
    /// Same state and same value.
    Unchanged,
    /// State too far in the future.
    Deferred,
}

/// Decide whether `incoming` replaces `current`.
pub fn merge_field(current: Option<&Field>, incoming: &Field, now: State) -> MergeOutcome {
    if incoming.state > now + MAX_CLOCK_DRIFT_MS {
        return MergeOutcome::Deferred;
    }
    let Some(current) = current else {
        return MergeOutcome::Applied;
    };
    if incoming.state > current.state {
        return MergeOutcome::Applied;
    }
    if incoming.state < current.state {
        return MergeOutcome::Historical;
    }
    match incoming.value.canonical().cmp(&current.value.canonical()) {
        std::cmp::Ordering::Greater => MergeOutcome::Applied,
        std::cmp::Ordering::Less => MergeOutcome::Historical,
        std::cmp::Ordering::Equal => MergeOutcome::Unchanged,
    }
}

/// Result of merging one node into another.
#[derive(Debug, Clone)]
pub struct MergeReport {
    /// Only the fields that changed, ready to be re-broadcast.
    pub diff: GraphNode,
    pub historical: usize,
    pub deferred: usize,
}

impl MergeReport {
    pub fn changed(&self) -> bool {
        !self.diff.fields.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct GraphNode {
    pub soul: String,
    pub fields: BTreeMap<String, Field>,
}

impl GraphNode {
    pub fn new(soul: impl Into<String>) -> Self {
        Self {
            soul: soul.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: GraphValue, state: State) -> Self {
        self.set(key, value, state);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: GraphValue, state: State) {
        self.fields.insert(key.into(), Field { state, value });
    }

    pub fn get(&self, key: &str) -> Option<&GraphValue> {
        self.fields.get(key).map(|f| &f.value)
    }

    /// Keys whose value is not `null` (deleted).
    pub fn live_keys(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|(_, f)| !f.value.is_null())
            .map(|(k, _)| k.as_str())
    }

    /// Merge `incoming` into `self` according to the merge policy.
    pub fn merge(&mut self, incoming: &GraphNode, now: State) -> MergeReport {
        let mut report = MergeReport {
            diff: GraphNode::new(self.soul.clone()),
            historical: 0,
            deferred: 0,
        };

        for (key, field) in &incoming.fields {
            match merge_field(self.fields.get(key), field, now) {
                MergeOutcome::Applied => {
                    self.fields.insert(key.clone(), field.clone());
                    report.diff.fields.insert(key.clone(), field.clone());
                }
                MergeOutcome::Historical => report.historical += 1,
                MergeOutcome::Deferred => report.deferred += 1,
                MergeOutcome::Unchanged => {}
            }
        }

        report
    }

    /// Field values only, without metadata.
    pub fn to_plain_json(&self) -> Value {
        let map: Map<String, Value> = self
            .fields
            .iter()
            .map(|(k, f)| (k.clone(), f.value.to_json()))
            .collect();
        Value::Object(map)
    }

    /// Wire form: `{ "_": { "#": soul, ">": { key: state } }, key: value }`.
    pub fn to_wire(&self) -> Value {
        let mut states = Map::new();
        let mut map = Map::new();
        for (key, field) in &self.fields {
            states.insert(
                key.clone(),
                serde_json::Number::from_f64(field.state)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            );
            map.insert(key.clone(), field.value.to_json());
        }
        map.insert(
            META_KEY.to_string(),
            serde_json::json!({ "#": self.soul, ">": Value::Object(states) }),
        );
        Value::Object(map)
    }

    /// Parse a node from its wire form.
    pub fn from_wire(soul: &str, value: &Value) -> Result<Self, GraphError> {
        validate_soul(soul)?;
        let obj = value
            .as_object()
            .ok_or_else(|| GraphError::UnsupportedValue(soul.to_string()))?;
        let meta = obj
            .get(META_KEY)
            .and_then(Value::as_object)
            .ok_or_else(|| GraphError::MissingState(META_KEY.to_string()))?;

        if let Some(meta_soul) = meta.get("#").and_then(Value::as_str) {
            if meta_soul != soul {
                return Err(GraphError::SoulMismatch {
                    soul: soul.to_string(),
                    meta: meta_soul.to_string(),
                });
            }
        }

        let states = meta.get(">").and_then(Value::as_object);
        let mut node = GraphNode::new(soul);
        for (key, raw) in obj {
            if key == META_KEY {
                continue;
            }
            let state = states
                .and_then(|s| s.get(key))
                .and_then(Value::as_f64)
                .ok_or_else(|| GraphError::MissingState(key.clone()))?;
            let value =
                GraphValue::from_json(raw).ok_or_else(|| GraphError::UnsupportedValue(key.clone()))?;
            node.set(key.clone(), value, state);
        }
        Ok(node)
    }
}

/// Split a JSON object into graph nodes rooted at `soul`.
///
/// Nested objects become child nodes linked from their parent. Arrays have
/// no graph representation and are stored as their JSON text.
pub fn explode(soul: &str, data: &Map<String, Value>, state: State) -> Result<Vec<GraphNode>, GraphError> {
    validate_soul(soul)?;
    let mut nodes = Vec::new();
    let mut root = GraphNode::new(soul);

    for (key, value) in data {
        validate_key(key)?;
        let graph_value = match value {
            Value::Object(child) if !is_link(child) => {
                let child_soul = child_soul(soul, key);
                nodes.extend(explode(&child_soul, child, state)?);
                GraphValue::Link(child_soul)
            }
            Value::Array(_) => GraphValue::Text(value.to_string()),
            other => GraphValue::from_json(other)
                .ok_or_else(|| GraphError::UnsupportedValue(key.clone()))?,
        };
        root.set(key.clone(), graph_value, state);
    }

    nodes.insert(0, root);
    Ok(nodes)
}

/// Link nodes tying `soul` to its ancestors, so that listing a parent shows
/// the child key: for `a/b/c`, node `a` gets `b -> a/b` and node `a/b` gets
/// `c -> a/b/c`.
pub fn ancestor_links(soul: &str, state: State) -> Vec<GraphNode> {
    let mut links = Vec::new();
    let mut child = soul;
    while let Some((parent, key)) = child.rsplit_once('/') {
        links.push(GraphNode::new(parent).with_field(key, GraphValue::Link(child.to_string()), state));
        child = parent;
    }
    links.reverse();
    links
}

fn is_link(map: &Map<String, Value>) -> bool {
    map.len() == 1 && map.get("#").map(Value::is_string).unwrap_or(false)
}
