//! Signed permits.
//!
//! A permit is a wallet signature over an application message, packaged
//! with the parameters the application cares about. Permits travel as
//! companion fields next to graph writes; nothing downstream treats them as
//! a gate.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{Address, PermitType};

/// Amino type tag of a secp256k1 public key.
pub const PUBKEY_TYPE_SECP256K1: &str = "tendermint/PubKeySecp256k1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PubKey {
    #[serde(rename = "type")]
    pub key_type: String,
    /// Base64 of the 33-byte compressed point.
    pub value: String,
}

/// What a wallet returns from an arbitrary-message signing request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StdSignature {
    pub pub_key: PubKey,
    /// Base64 of the 64-byte `r || s` signature.
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PermitParams {
    pub permit_name: String,
    pub chain_id: String,
    pub allowed_tokens: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Permit {
    pub params: PermitParams,
    pub signature: StdSignature,
}

impl Permit {
    pub fn new(
        permit_type: PermitType,
        chain_id: &str,
        allowed_tokens: Vec<String>,
        signature: StdSignature,
    ) -> Self {
        Self {
            params: PermitParams {
                permit_name: permit_type.permit_name().to_string(),
                chain_id: chain_id.to_string(),
                allowed_tokens,
            },
            signature,
        }
    }

    /// The permit as a JSON value, ready to be stored next to a graph write.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Message signed for the generic graph-write permit.
pub fn gun_permit_message(address: &Address, permit_type: PermitType, data: &Value) -> String {
    serde_json::json!({
        "type": permit_type.as_str(),
        "address": address.as_str(),
        "data": data,
    })
    .to_string()
}

/// Message signed when a user changes their display name.
pub fn username_permit_message(address: &Address, username: &str) -> String {
    serde_json::json!({
        "action": "change_username",
        "address": address.as_str(),
        "username": username,
    })
    .to_string()
}

/// Message signed when a user comments on a piece of content.
pub fn comment_permit_message(address: &Address, content_id: &str, text: &str) -> String {
    serde_json::json!({
        "action": "comment",
        "address": address.as_str(),
        "content_id": content_id,
        "text": text,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_signature() -> StdSignature {
        StdSignature {
            pub_key: PubKey {
                key_type: PUBKEY_TYPE_SECP256K1.to_string(),
                value: "AAAA".to_string(),
            },
            signature: "BBBB".to_string(),
        }
    }

    #[test]
    fn permit_json_shape() {
        let permit = Permit::new(PermitType::Message, "stargaze-1", vec![], sample_signature());
        let v = permit.to_value();
        assert_eq!(v["params"]["permit_name"], "snails-message");
        assert_eq!(v["params"]["chain_id"], "stargaze-1");
        assert_eq!(v["signature"]["pub_key"]["type"], PUBKEY_TYPE_SECP256K1);
    }

    #[test]
    fn gun_message_carries_type_and_data() {
        let addr = Address::from("stars1abc");
        let msg = gun_permit_message(&addr, PermitType::Message, &serde_json::json!({"text": "hi"}));
        let parsed: Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(parsed["type"], "MESSAGE");
        assert_eq!(parsed["data"]["text"], "hi");
    }
}
