use serde::{Deserialize, Serialize};

// Wallet address, bech32 with the chain prefix (e.g. `stars1...`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct Address(pub String);

impl Address {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 and last 4 characters, for logs and labels.
    pub fn short(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        if chars.len() <= 14 {
            return self.0.clone();
        }
        let head: String = chars[..8].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{head}...{tail}")
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Address {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The action a permit authorizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PermitType {
    Username,
    Comment,
    Message,
}

impl PermitType {
    pub const ALL: [PermitType; 3] = [PermitType::Username, PermitType::Comment, PermitType::Message];

    pub fn as_str(&self) -> &'static str {
        match self {
            PermitType::Username => "USERNAME",
            PermitType::Comment => "COMMENT",
            PermitType::Message => "MESSAGE",
        }
    }

    /// Name carried in `PermitParams::permit_name`.
    pub fn permit_name(&self) -> &'static str {
        match self {
            PermitType::Username => "snails-username",
            PermitType::Comment => "snails-comment",
            PermitType::Message => "snails-message",
        }
    }
}

impl std::fmt::Display for PermitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Four-valued traffic light for peer and session health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// No reachable peer.
    #[default]
    Red,
    /// A peer is reachable but the round-trip test has not passed.
    Yellow,
    /// Round-trip write/read test passed.
    Green,
    /// Healthy and a user session is initialized.
    Blue,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Red => "red",
            ConnectionStatus::Yellow => "yellow",
            ConnectionStatus::Green => "green",
            ConnectionStatus::Blue => "blue",
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, ConnectionStatus::Green | ConnectionStatus::Blue)
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A graph network peer as seen by either side of a connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: String,
    pub url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permit_type_serializes_screaming() {
        let json = serde_json::to_string(&PermitType::Message).unwrap();
        assert_eq!(json, "\"MESSAGE\"");
        assert_eq!(PermitType::Username.as_str(), "USERNAME");
    }

    #[test]
    fn status_default_is_red() {
        assert_eq!(ConnectionStatus::default(), ConnectionStatus::Red);
        assert!(!ConnectionStatus::Yellow.is_healthy());
        assert!(ConnectionStatus::Blue.is_healthy());
    }

    #[test]
    fn address_short_form() {
        let addr = Address::from("stars1qqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqabcd");
        assert_eq!(addr.short(), "stars1qq...abcd");
        assert_eq!(Address::from("stars1abc").short(), "stars1abc");
        assert_eq!(
            Address::from("stars1\u{e9}\u{e9}\u{e9}\u{e9}\u{e9}\u{e9}\u{e9}\u{e9}\u{e9}\u{e9}").short(),
            "stars1\u{e9}\u{e9}...\u{e9}\u{e9}\u{e9}\u{e9}"
        );
    }
}
