//! Group rooms, polls and direct messages.
//!
//! Graph layout:
//!
//! - `rooms/<room>`: room settings; `rooms/<room>/users/<addr>` while joined
//! - `messages/<room>/<message>`: room messages
//! - `messages/<a>-<b>/<ts>`: direct messages, `a` and `b` sorted
//! - `users/<addr>/chats/<peer>`: direct chat summary per participant
//! - `polls/<poll>/votes/<addr>`: one vote per user
//!
//! Every write carries a `MESSAGE` permit from the session's wallet.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use snails_shared::{Address, GraphNode, GraphValue, PermitType};

use crate::context::DatabaseContext;
use crate::error::{ChatError, Result};
use crate::graph_client::NodeSubscription;

const MAX_USERS: u64 = 100;
const MAX_USERS_PREMIUM: u64 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Sticker,
    Game,
    Poll,
}

impl MessageKind {
    fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Sticker => "sticker",
            MessageKind::Game => "game",
            MessageKind::Poll => "poll",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "sticker" => MessageKind::Sticker,
            "game" => MessageKind::Game,
            "poll" => MessageKind::Poll,
            _ => MessageKind::Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRoom {
    pub id: String,
    pub name: String,
    pub description: String,
    pub created_by: String,
    pub created_at: i64,
    pub is_premium: bool,
    pub max_users: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub text: String,
    pub sender: String,
    pub timestamp: i64,
    pub kind: MessageKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirectMessage {
    pub from: String,
    pub to: String,
    pub text: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    pub peer: String,
    pub last_message: Option<String>,
    pub timestamp: i64,
    pub unread: u64,
}

fn text(node: &GraphNode, key: &str) -> Option<String> {
    node.get(key).and_then(GraphValue::as_str).map(str::to_string)
}

fn number(node: &GraphNode, key: &str) -> Option<f64> {
    node.get(key).and_then(GraphValue::as_f64)
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Key of the direct conversation between two addresses.
pub fn direct_chat_id(a: &Address, b: &Address) -> String {
    let mut pair = [a.as_str(), b.as_str()];
    pair.sort_unstable();
    pair.join("-")
}

impl ChatRoom {
    fn from_node(id: &str, node: &GraphNode) -> Option<Self> {
        let is_premium = matches!(node.get("isPremium"), Some(GraphValue::Bool(true)));
        Some(Self {
            id: id.to_string(),
            name: text(node, "name")?,
            description: text(node, "description").unwrap_or_default(),
            created_by: text(node, "createdBy").unwrap_or_default(),
            created_at: number(node, "createdAt").unwrap_or(0.0) as i64,
            is_premium,
            max_users: number(node, "maxUsers")
                .map(|n| n as u64)
                .unwrap_or(if is_premium { MAX_USERS_PREMIUM } else { MAX_USERS }),
        })
    }
}

impl ChatMessage {
    fn from_node(id: &str, node: &GraphNode) -> Option<Self> {
        Some(Self {
            id: id.to_string(),
            text: text(node, "text")?,
            sender: text(node, "sender").unwrap_or_default(),
            timestamp: number(node, "timestamp").unwrap_or(0.0) as i64,
            kind: text(node, "type")
                .map(|t| MessageKind::parse(&t))
                .unwrap_or(MessageKind::Text),
        })
    }
}

pub struct ChatService {
    ctx: Arc<DatabaseContext>,
    current_room: RwLock<Option<String>>,
}

impl ChatService {
    pub fn new(ctx: Arc<DatabaseContext>) -> Self {
        Self {
            ctx,
            current_room: RwLock::new(None),
        }
    }

    pub fn current_room(&self) -> Option<String> {
        self.current_room
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_current_room(&self, room: Option<String>) {
        *self.current_room.write().unwrap_or_else(|e| e.into_inner()) = room;
    }

    async fn permit(&self, address: &Address, data: Value) -> Result<Value> {
        let permit = self
            .ctx
            .signer()
            .sign_gun_permit(address, PermitType::Message, &data)
            .await?;
        Ok(permit.to_value())
    }

    /// Whether `address` has a subscription that has not ended yet.
    pub async fn is_premium(&self, address: &Address) -> Result<bool> {
        let subscription = self.ctx.get(&format!("users/{address}/subscription")).await?;
        Ok(subscription
            .and_then(|node| number(&node, "end"))
            .is_some_and(|end| end > now_millis() as f64))
    }

    async fn require_premium(&self, address: &Address) -> Result<()> {
        if self.is_premium(address).await? {
            Ok(())
        } else {
            Err(ChatError::PremiumRequired.into())
        }
    }

    pub async fn rooms(&self) -> Result<Vec<ChatRoom>> {
        let children = self.ctx.graph().children("rooms").await?;
        Ok(children
            .iter()
            .filter_map(|(id, node)| ChatRoom::from_node(id, node))
            .collect())
    }

    pub async fn room(&self, room_id: &str) -> Result<ChatRoom> {
        self.ctx
            .get(&format!("rooms/{room_id}"))
            .await?
            .and_then(|node| ChatRoom::from_node(room_id, &node))
            .ok_or_else(|| ChatError::RoomNotFound(room_id.to_string()).into())
    }

    /// Users currently joined to the room.
    pub async fn room_users(&self, room_id: &str) -> Result<usize> {
        Ok(self
            .ctx
            .get(&format!("rooms/{room_id}/users"))
            .await?
            .map(|node| node.live_keys().count())
            .unwrap_or(0))
    }

    pub async fn create_room(&self, name: &str, description: &str, is_premium: bool) -> Result<ChatRoom> {
        let address = self.ctx.require_session()?;
        if is_premium {
            self.require_premium(&address).await?;
        }

        let created_at = now_millis();
        let permit = self
            .permit(
                &address,
                json!({ "action": "create_room", "name": name, "timestamp": created_at }),
            )
            .await?;

        let room = ChatRoom {
            id: format!("{created_at}-{address}"),
            name: name.to_string(),
            description: description.to_string(),
            created_by: address.to_string(),
            created_at,
            is_premium,
            max_users: if is_premium { MAX_USERS_PREMIUM } else { MAX_USERS },
        };

        let fields = object(json!({
            "name": room.name,
            "description": room.description,
            "createdBy": room.created_by,
            "createdAt": room.created_at,
            "isPremium": room.is_premium,
            "maxUsers": room.max_users,
            "permit": permit,
        }));
        self.ctx.put(&format!("rooms/{}", room.id), &fields).await?;
        info!(room = %room.id, premium = is_premium, "Created room");
        Ok(room)
    }

    pub async fn join_room(&self, room_id: &str) -> Result<()> {
        let address = self.ctx.require_session()?;
        let room = self.room(room_id).await?;

        if self.room_users(room_id).await? as u64 >= room.max_users {
            return Err(ChatError::RoomFull(room_id.to_string()).into());
        }
        if room.is_premium {
            self.require_premium(&address).await?;
        }

        let joined = now_millis();
        let permit = self
            .permit(
                &address,
                json!({ "action": "join_room", "roomId": room_id, "timestamp": joined }),
            )
            .await?;

        let fields = object(json!({ "joined": joined, "permit": permit }));
        self.ctx
            .put(&format!("rooms/{room_id}/users/{address}"), &fields)
            .await?;
        self.set_current_room(Some(room_id.to_string()));
        debug!(room = %room_id, address = %address, "Joined room");
        Ok(())
    }

    /// Leave the current room, if any.
    pub async fn leave_room(&self) -> Result<()> {
        let (Some(room_id), Some(address)) = (self.current_room(), self.ctx.session_address()) else {
            return Ok(());
        };
        self.ctx
            .graph()
            .put_value(&format!("rooms/{room_id}/users"), address.as_str(), Value::Null)
            .await?;
        self.set_current_room(None);
        Ok(())
    }

    /// Post to the current room and return the new message id.
    pub async fn send_message(&self, text: &str, kind: MessageKind) -> Result<String> {
        let address = self.ctx.require_session()?;
        let room_id = self.current_room().ok_or(ChatError::NotInRoom)?;
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyMessage.into());
        }

        let timestamp = now_millis();
        let permit = self
            .permit(
                &address,
                json!({ "action": "send_message", "roomId": room_id, "timestamp": timestamp }),
            )
            .await?;

        // Suffix keeps two messages in the same millisecond apart.
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let id = format!("{timestamp}-{address}-{}", &nonce[..8]);
        let fields = object(json!({
            "text": text,
            "sender": address.as_str(),
            "timestamp": timestamp,
            "type": kind.as_str(),
            "permit": permit,
        }));
        self.ctx
            .put(&format!("messages/{room_id}/{id}"), &fields)
            .await?;
        Ok(id)
    }

    /// Messages of a room, oldest first.
    pub async fn messages(&self, room_id: &str) -> Result<Vec<ChatMessage>> {
        let children = self
            .ctx
            .graph()
            .children(&format!("messages/{room_id}"))
            .await?;
        let mut messages: Vec<ChatMessage> = children
            .iter()
            .filter_map(|(id, node)| ChatMessage::from_node(id, node))
            .collect();
        messages.sort_by_key(|m| m.timestamp);
        Ok(messages)
    }

    pub fn subscribe_room(&self, room_id: &str) -> NodeSubscription {
        self.ctx.subscribe(&format!("messages/{room_id}"))
    }

    /// Post a poll to the current room. Returns the poll id.
    pub async fn start_poll(&self, question: &str, options: &[String]) -> Result<String> {
        let address = self.ctx.require_session()?;
        self.require_premium(&address).await?;
        if options.len() < 2 {
            return Err(ChatError::InvalidPoll.into());
        }
        let body = json!({ "question": question, "options": options }).to_string();
        self.send_message(&body, MessageKind::Poll).await
    }

    pub async fn vote(&self, poll_id: &str, option: &str) -> Result<()> {
        let address = self.ctx.require_session()?;
        if self.current_room().is_none() {
            return Err(ChatError::NotInRoom.into());
        }
        self.require_premium(&address).await?;

        let timestamp = now_millis();
        let permit = self
            .permit(
                &address,
                json!({ "action": "vote", "pollId": poll_id, "option": option, "timestamp": timestamp }),
            )
            .await?;

        let fields = object(json!({ "option": option, "timestamp": timestamp, "permit": permit }));
        self.ctx
            .put(&format!("polls/{poll_id}/votes/{address}"), &fields)
            .await
    }

    /// Votes per option.
    pub async fn poll_results(&self, poll_id: &str) -> Result<BTreeMap<String, usize>> {
        let votes = self
            .ctx
            .graph()
            .children(&format!("polls/{poll_id}/votes"))
            .await?;
        let mut tally = BTreeMap::new();
        for (_, vote) in &votes {
            if let Some(option) = text(vote, "option") {
                *tally.entry(option).or_insert(0) += 1;
            }
        }
        Ok(tally)
    }

    pub async fn start_direct_chat(&self, peer: &Address) -> Result<()> {
        let address = self.ctx.require_session()?;
        let timestamp = now_millis();
        let permit = self
            .permit(
                &address,
                json!({ "action": "start_chat", "with": peer.as_str(), "timestamp": timestamp }),
            )
            .await?;

        let fields = object(json!({ "timestamp": timestamp, "permit": permit }));
        self.ctx
            .put(&format!("users/{address}/chats/{peer}"), &fields)
            .await
    }

    /// Send a direct message and update both participants' chat summaries.
    pub async fn send_direct_message(&self, peer: &Address, text: &str) -> Result<()> {
        let address = self.ctx.require_session()?;
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyMessage.into());
        }

        let chat_id = direct_chat_id(&address, peer);
        let timestamp = now_millis();
        let permit = self
            .permit(
                &address,
                json!({
                    "chatId": chat_id,
                    "timestamp": timestamp,
                    "messageHash": base64::engine::general_purpose::STANDARD.encode(text),
                }),
            )
            .await?;

        let message = object(json!({
            "from": address.as_str(),
            "to": peer.as_str(),
            "text": text,
            "timestamp": timestamp,
            "permit": permit,
        }));
        self.ctx
            .put(&format!("messages/{chat_id}/{timestamp}"), &message)
            .await?;

        let own = object(json!({ "lastMessage": text, "timestamp": timestamp, "permit": permit }));
        self.ctx
            .put(&format!("users/{address}/chats/{peer}"), &own)
            .await?;

        let peer_soul = format!("users/{peer}/chats/{address}");
        let unread = self
            .ctx
            .get(&peer_soul)
            .await?
            .and_then(|node| number(&node, "unread"))
            .unwrap_or(0.0) as u64;
        let theirs = object(json!({
            "lastMessage": text,
            "timestamp": timestamp,
            "permit": permit,
            "unread": unread + 1,
        }));
        self.ctx.put(&peer_soul, &theirs).await
    }

    /// Conversation with `peer`, oldest first.
    pub async fn direct_messages(&self, peer: &Address) -> Result<Vec<DirectMessage>> {
        let address = self.ctx.require_session()?;
        let children = self
            .ctx
            .graph()
            .children(&format!("messages/{}", direct_chat_id(&address, peer)))
            .await?;

        let mut messages: Vec<DirectMessage> = children
            .iter()
            .filter_map(|(_, node)| {
                Some(DirectMessage {
                    from: text(node, "from")?,
                    to: text(node, "to")?,
                    text: text(node, "text")?,
                    timestamp: number(node, "timestamp")? as i64,
                })
            })
            .collect();
        messages.sort_by_key(|m| m.timestamp);
        Ok(messages)
    }

    /// Direct chats of the session user, most recent first.
    pub async fn chats(&self) -> Result<Vec<ChatSummary>> {
        let address = self.ctx.require_session()?;
        let children = self
            .ctx
            .graph()
            .children(&format!("users/{address}/chats"))
            .await?;

        let mut chats: Vec<ChatSummary> = children
            .iter()
            .map(|(peer, node)| ChatSummary {
                peer: peer.clone(),
                last_message: text(node, "lastMessage"),
                timestamp: number(node, "timestamp").unwrap_or(0.0) as i64,
                unread: number(node, "unread").unwrap_or(0.0) as u64,
            })
            .collect();
        chats.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(chats)
    }

    pub async fn mark_read(&self, peer: &Address) -> Result<()> {
        let address = self.ctx.require_session()?;
        self.ctx
            .graph()
            .put_value(&format!("users/{address}/chats/{peer}"), "unread", json!(0))
            .await
    }
}
