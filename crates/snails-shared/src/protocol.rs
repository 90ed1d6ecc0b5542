use serde_json::{Map, Value};

use crate::constants::META_KEY;
use crate::error::SnailsError;
use crate::graph::GraphNode;

/// Frames exchanged between a client and the relay over the graph socket.
///
/// Everything is JSON text:
///
/// - hello: `{"dam": "hi", "#": peer_id}`
/// - get:   `{"#": id, "get": {"#": soul, ".": key?}}`
/// - put:   `{"#": id, "put": {soul: node, ...}}`
/// - ack:   `{"#": id, "@": reply_to, "ok": true | "err": "...", "put": {...}?}`
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    /// First frame each side sends after the socket opens.
    Hello { peer_id: String },
    /// Read a node (optionally a single field of it).
    Get {
        id: String,
        soul: String,
        key: Option<String>,
    },
    /// Write one or more nodes.
    Put { id: String, nodes: Vec<GraphNode> },
    /// Reply to a get or put.
    Ack {
        id: String,
        reply_to: String,
        err: Option<String>,
        nodes: Vec<GraphNode>,
    },
}

pub fn new_message_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

impl WireMessage {
    pub fn hello(peer_id: impl Into<String>) -> Self {
        Self::Hello {
            peer_id: peer_id.into(),
        }
    }

    pub fn get(soul: impl Into<String>) -> Self {
        Self::Get {
            id: new_message_id(),
            soul: soul.into(),
            key: None,
        }
    }

    pub fn put(nodes: Vec<GraphNode>) -> Self {
        Self::Put {
            id: new_message_id(),
            nodes,
        }
    }

    pub fn ok(reply_to: impl Into<String>, nodes: Vec<GraphNode>) -> Self {
        Self::Ack {
            id: new_message_id(),
            reply_to: reply_to.into(),
            err: None,
            nodes,
        }
    }

    pub fn err(reply_to: impl Into<String>, err: impl Into<String>) -> Self {
        Self::Ack {
            id: new_message_id(),
            reply_to: reply_to.into(),
            err: Some(err.into()),
            nodes: Vec::new(),
        }
    }

    /// Message id, if the frame has one.
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Hello { .. } => None,
            Self::Get { id, .. } | Self::Put { id, .. } | Self::Ack { id, .. } => Some(id),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Hello { peer_id } => serde_json::json!({ "dam": "hi", "#": peer_id }),
            Self::Get { id, soul, key } => {
                let mut get = Map::new();
                get.insert("#".into(), Value::String(soul.clone()));
                if let Some(key) = key {
                    get.insert(".".into(), Value::String(key.clone()));
                }
                serde_json::json!({ "#": id, "get": get })
            }
            Self::Put { id, nodes } => serde_json::json!({ "#": id, "put": nodes_to_json(nodes) }),
            Self::Ack {
                id,
                reply_to,
                err,
                nodes,
            } => {
                let mut map = Map::new();
                map.insert("#".into(), Value::String(id.clone()));
                map.insert("@".into(), Value::String(reply_to.clone()));
                match err {
                    Some(err) => map.insert("err".into(), Value::String(err.clone())),
                    None => map.insert("ok".into(), Value::Bool(true)),
                };
                if !nodes.is_empty() {
                    map.insert("put".into(), nodes_to_json(nodes));
                }
                Value::Object(map)
            }
        }
    }

    pub fn encode(&self) -> String {
        self.to_json().to_string()
    }

    pub fn decode(text: &str) -> Result<Self, SnailsError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_json(&value)
    }

    pub fn from_json(value: &Value) -> Result<Self, SnailsError> {
        let obj = value
            .as_object()
            .ok_or_else(|| SnailsError::Protocol("frame is not an object".into()))?;

        if obj.get("dam").and_then(Value::as_str) == Some("hi") {
            let peer_id = string_field(obj, "#")?;
            return Ok(Self::Hello { peer_id });
        }

        let id = string_field(obj, "#")?;

        if let Some(reply_to) = obj.get("@").and_then(Value::as_str) {
            let err = obj.get("err").and_then(Value::as_str).map(str::to_string);
            let nodes = match obj.get("put") {
                Some(put) if !put.is_null() => nodes_from_json(put)?,
                _ => Vec::new(),
            };
            return Ok(Self::Ack {
                id,
                reply_to: reply_to.to_string(),
                err,
                nodes,
            });
        }

        if let Some(get) = obj.get("get").and_then(Value::as_object) {
            let soul = string_field(get, "#")?;
            let key = get.get(".").and_then(Value::as_str).map(str::to_string);
            return Ok(Self::Get { id, soul, key });
        }

        if let Some(put) = obj.get("put") {
            return Ok(Self::Put {
                id,
                nodes: nodes_from_json(put)?,
            });
        }

        Err(SnailsError::Protocol("unknown frame".into()))
    }
}

fn string_field(obj: &Map<String, Value>, key: &str) -> Result<String, SnailsError> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| SnailsError::Protocol(format!("missing {key:?}")))
}

fn nodes_to_json(nodes: &[GraphNode]) -> Value {
    let map: Map<String, Value> = nodes
        .iter()
        .map(|node| (node.soul.clone(), node.to_wire()))
        .collect();
    Value::Object(map)
}

fn nodes_from_json(value: &Value) -> Result<Vec<GraphNode>, SnailsError> {
    let obj = value
        .as_object()
        .ok_or_else(|| SnailsError::Protocol("put is not an object".into()))?;
    let mut nodes = Vec::with_capacity(obj.len());
    for (soul, node) in obj {
        if soul == META_KEY {
            continue;
        }
        nodes.push(GraphNode::from_wire(soul, node)?);
    }
    Ok(nodes)
}
