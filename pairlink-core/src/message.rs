//! Peer message model: flat string-keyed payloads and their discriminators.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Relay payload key (both directions).
pub const KEY: &str = "key";
/// Alternate relay payload key used by the phone side.
pub const MESSAGE: &str = "message";
/// Command discriminator.
pub const CMD: &str = "cmd";
/// Command reply flag.
pub const SUCCESS: &str = "success";
/// Bulk transfer metadata discriminator.
pub const TYPE: &str = "type";
/// Startup attempt counter carried by `setStartingUp`.
pub const ATTEMPT: &str = "attempt";

/// `type` value marking a log bundle transfer.
pub const LOG_TRANSFER_TYPE: &str = "log";

/// Scalar payload value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Str(_) => "string",
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Str(s) => write!(f, "{:?}", s),
        }
    }
}

/// Commands understood by either peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    GetLogs,
    SetStartingUp,
    Unknown(String),
}

impl Command {
    pub fn parse(s: &str) -> Self {
        match s {
            "getLogs" => Command::GetLogs,
            "setStartingUp" => Command::SetStartingUp,
            other => Command::Unknown(other.to_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Command::GetLogs => "getLogs",
            Command::SetStartingUp => "setStartingUp",
            Command::Unknown(s) => s,
        }
    }
}

/// Logical purpose of a message, derived from its discriminator field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind<'a> {
    Command(Command),
    Reply(bool),
    Relay(&'a str),
    Unknown,
}

/// Flat key/value payload exchanged over the link. Immutable once built.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerMessage(BTreeMap<String, Value>);

impl PeerMessage {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        PeerMessage(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Plain relay: `{key: text}`.
    pub fn relay(text: impl Into<String>) -> Self {
        Self::from_pairs([(KEY, text.into())])
    }

    pub fn command(cmd: &Command) -> Self {
        Self::from_pairs([(CMD, cmd.as_str())])
    }

    /// `{cmd: "setStartingUp", attempt: n}`.
    pub fn starting_up(attempt: u64) -> Self {
        PeerMessage(BTreeMap::from([
            (CMD.to_owned(), Value::from(Command::SetStartingUp.as_str())),
            (ATTEMPT.to_owned(), Value::Int(attempt as i64)),
        ]))
    }

    /// Command reply: `{success: ok}`.
    pub fn success(ok: bool) -> Self {
        Self::from_pairs([(SUCCESS, ok)])
    }

    /// Bulk transfer metadata: `{type: kind}`.
    pub fn file_metadata(kind: &str) -> Self {
        Self::from_pairs([(TYPE, kind)])
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_int)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Relay text under `key`, falling back to `message`.
    pub fn relay_text(&self) -> Option<&str> {
        self.get_str(KEY).or_else(|| self.get_str(MESSAGE))
    }

    /// The `type` of a bulk transfer, if this is transfer metadata.
    pub fn transfer_type(&self) -> Option<&str> {
        self.get_str(TYPE)
    }

    /// Classify by discriminator. `cmd` wins over `success`, which wins over relay keys.
    pub fn kind(&self) -> MessageKind<'_> {
        if let Some(cmd) = self.get_str(CMD) {
            return MessageKind::Command(Command::parse(cmd));
        }
        if let Some(ok) = self.get_bool(SUCCESS) {
            return MessageKind::Reply(ok);
        }
        match self.relay_text() {
            Some(text) => MessageKind::Relay(text),
            None => MessageKind::Unknown,
        }
    }
}

impl fmt::Display for PeerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}: {}", k, v)?;
        }
        f.write_str("}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_relay_command_reply() {
        let relay = PeerMessage::relay("from phone: action button");
        assert_eq!(
            relay.kind(),
            MessageKind::Relay("from phone: action button")
        );
        assert_eq!(
            PeerMessage::command(&Command::GetLogs).kind(),
            MessageKind::Command(Command::GetLogs)
        );
        assert_eq!(PeerMessage::success(false).kind(), MessageKind::Reply(false));
    }

    #[test]
    fn message_key_is_relay_fallback() {
        let msg = PeerMessage::from_pairs([(MESSAGE, "test")]);
        assert_eq!(msg.kind(), MessageKind::Relay("test"));
        let both = PeerMessage::from_pairs([(KEY, "a"), (MESSAGE, "b")]);
        assert_eq!(both.relay_text(), Some("a"));
    }

    #[test]
    fn wrong_type_is_unknown() {
        let msg = PeerMessage::from_pairs([(KEY, true)]);
        assert_eq!(msg.kind(), MessageKind::Unknown);
        let msg = PeerMessage::from_pairs([(SUCCESS, "yes")]);
        assert_eq!(msg.kind(), MessageKind::Unknown);
    }

    #[test]
    fn unknown_command_is_kept() {
        let msg = PeerMessage::from_pairs([(CMD, "reboot")]);
        assert_eq!(
            msg.kind(),
            MessageKind::Command(Command::Unknown("reboot".into()))
        );
    }

    #[test]
    fn starting_up_carries_attempt() {
        let msg = PeerMessage::starting_up(3);
        assert_eq!(msg.kind(), MessageKind::Command(Command::SetStartingUp));
        assert_eq!(msg.get_int(ATTEMPT), Some(3));
        assert_eq!(msg.to_string(), "{attempt: 3, cmd: \"setStartingUp\"}");
    }
}
