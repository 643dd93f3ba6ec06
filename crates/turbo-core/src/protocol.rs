//! Wire messages exchanged over a session.
//!
//! Client frames are [`Command`]s. The server answers with [`Ack`]s
//! correlated by the `ack` id and pushes uncorrelated [`ChangeEvent`]s.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::errors::TurboError;
use crate::event::EventClass;
use crate::path;

pub const ACK_TYPE: &str = "ack";
pub const EVENT_TYPE: &str = "on";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandKind {
    On,
    Off,
    Set,
    Update,
    Remove,
    TransSet,
    TransGet,
    Push,
    Auth,
    Unauth,
}

impl CommandKind {
    pub const COUNT: usize = 10;

    pub const ALL: [CommandKind; Self::COUNT] = [
        CommandKind::On,
        CommandKind::Off,
        CommandKind::Set,
        CommandKind::Update,
        CommandKind::Remove,
        CommandKind::TransSet,
        CommandKind::TransGet,
        CommandKind::Push,
        CommandKind::Auth,
        CommandKind::Unauth,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
            Self::Set => "set",
            Self::Update => "update",
            Self::Remove => "remove",
            Self::TransSet => "transSet",
            Self::TransGet => "transGet",
            Self::Push => "push",
            Self::Auth => "auth",
            Self::Unauth => "unauth",
        }
    }

    /// Commands that write to storage and run off the session's read loop.
    pub fn is_mutation(self) -> bool {
        matches!(self, Self::Set | Self::Update | Self::Remove | Self::TransSet)
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandKind {
    type Err = TurboError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "on" => Self::On,
            "off" => Self::Off,
            "set" => Self::Set,
            "update" => Self::Update,
            "remove" => Self::Remove,
            "transSet" => Self::TransSet,
            "transGet" => Self::TransGet,
            "push" => Self::Push,
            "auth" => Self::Auth,
            "unauth" => Self::Unauth,
            other => return Err(TurboError::UnsupportedCommand(other.to_string())),
        })
    }
}

/// Inbound client frame.
#[derive(Clone, Debug, Deserialize)]
pub struct Command {
    pub cmd: String,
    #[serde(default = "root_path")]
    pub path: String,
    #[serde(rename = "eventType", default)]
    pub event_type: Option<EventClass>,
    /// `None` when the field is missing, `Some(Value::Null)` for an explicit null.
    #[serde(default, deserialize_with = "present")]
    pub value: Option<Value>,
    #[serde(default)]
    pub revision: Option<u64>,
    #[serde(default)]
    pub ack: Option<i64>,
}

fn root_path() -> String {
    path::ROOT.to_string()
}

fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

impl Command {
    /// Decode a text frame and canonicalize its path.
    pub fn decode(raw: &str) -> Result<Self, TurboError> {
        let mut cmd: Command = serde_json::from_str(raw)
            .map_err(|e| TurboError::protocol(format!("malformed command: {e}")))?;
        cmd.path = path::canonicalize(&cmd.path);
        Ok(cmd)
    }

    pub fn kind(&self) -> Result<CommandKind, TurboError> {
        self.cmd.parse()
    }

    pub fn require_event_type(&self) -> Result<EventClass, TurboError> {
        self.event_type
            .ok_or_else(|| TurboError::protocol(format!("'{}' requires eventType", self.cmd)))
    }

    pub fn require_value(&self) -> Result<&Value, TurboError> {
        self.value
            .as_ref()
            .ok_or_else(|| TurboError::protocol(format!("'{}' requires a value", self.cmd)))
    }

    pub fn require_revision(&self) -> Result<u64, TurboError> {
        self.revision
            .ok_or_else(|| TurboError::protocol(format!("'{}' requires a revision", self.cmd)))
    }
}

/// Best-effort ack id from a frame that failed to decode.
pub fn recover_ack(raw: &str) -> Option<i64> {
    serde_json::from_str::<Value>(raw)
        .ok()?
        .get("ack")
        .and_then(Value::as_i64)
}

/// Server acknowledgment for one command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ack: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub res: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<u64>,
}

impl Ack {
    pub fn ok(ack: Option<i64>) -> Self {
        Self {
            kind: ACK_TYPE.to_string(),
            ack,
            err: None,
            res: None,
            revision: None,
        }
    }

    pub fn with_result(ack: Option<i64>, res: Value, revision: u64) -> Self {
        Self {
            res: Some(res),
            revision: Some(revision),
            ..Self::ok(ack)
        }
    }

    /// Error ack. Conflicts carry the server's current value and revision.
    pub fn error(ack: Option<i64>, error: &TurboError) -> Self {
        let mut out = Self {
            err: Some(error.to_string()),
            ..Self::ok(ack)
        };
        if let TurboError::Conflict { current, value, .. } = error {
            out.res = Some(value.clone());
            out.revision = Some(*current);
        }
        out
    }

    pub fn is_error(&self) -> bool {
        self.err.is_some()
    }
}

/// Change notification pushed to subscribers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub path: String,
    #[serde(rename = "eventType")]
    pub event_type: EventClass,
    pub value: Value,
    /// The path that changed, for events delivered to its parent.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub child: Option<String>,
}

impl ChangeEvent {
    pub fn value(path: &str, value: Value) -> Self {
        Self {
            kind: EVENT_TYPE.to_string(),
            path: path.to_string(),
            event_type: EventClass::Value,
            value,
            child: None,
        }
    }

    pub fn child(class: EventClass, parent: &str, child: &str, value: Value) -> Self {
        Self {
            kind: EVENT_TYPE.to_string(),
            path: parent.to_string(),
            event_type: class,
            value,
            child: Some(child.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_full_command() {
        let cmd = Command::decode(
            r#"{"cmd":"transSet","path":"a/b/","eventType":0,"value":{"x":1},"revision":3,"ack":9}"#,
        )
        .unwrap();
        assert_eq!(cmd.kind().unwrap(), CommandKind::TransSet);
        assert_eq!(cmd.path, "/a/b");
        assert_eq!(cmd.event_type, Some(EventClass::Value));
        assert_eq!(cmd.value, Some(json!({"x": 1})));
        assert_eq!(cmd.revision, Some(3));
        assert_eq!(cmd.ack, Some(9));
    }

    #[test]
    fn decode_distinguishes_missing_and_null_value() {
        let missing = Command::decode(r#"{"cmd":"set","path":"/a"}"#).unwrap();
        let null = Command::decode(r#"{"cmd":"set","path":"/a","value":null}"#).unwrap();
        assert_eq!(missing.value, None);
        assert_eq!(null.value, Some(Value::Null));
        assert!(missing.require_value().is_err());
        assert!(null.require_value().is_ok());
    }

    #[test]
    fn decode_defaults_path_to_root() {
        let cmd = Command::decode(r#"{"cmd":"on","eventType":"value"}"#).unwrap();
        assert_eq!(cmd.path, "/");
        assert_eq!(cmd.ack, None);
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = Command::decode("not json").unwrap_err();
        assert_eq!(err.error_kind(), "protocol");
        let err = Command::decode(r#"{"path":"/a"}"#).unwrap_err();
        assert!(err.to_string().contains("cmd"));
    }

    #[test]
    fn unknown_command_is_unsupported() {
        let cmd = Command::decode(r#"{"cmd":"explode","ack":1}"#).unwrap();
        let err = cmd.kind().unwrap_err();
        assert!(matches!(err, TurboError::UnsupportedCommand(ref c) if c == "explode"));
    }

    #[test]
    fn reserved_commands_parse() {
        for name in ["push", "auth", "unauth"] {
            let kind: CommandKind = name.parse().unwrap();
            assert_eq!(kind.as_str(), name);
            assert!(!kind.is_mutation());
        }
    }

    #[test]
    fn kinds_index_into_all() {
        for (i, kind) in CommandKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
            assert_eq!(kind.as_str().parse::<CommandKind>().unwrap(), *kind);
        }
    }

    #[test]
    fn recover_ack_from_bad_frame() {
        assert_eq!(recover_ack(r#"{"cmd":5,"ack":12}"#), Some(12));
        assert_eq!(recover_ack("{{{"), None);
    }

    #[test]
    fn ack_ok_serializes_minimal() {
        let json = serde_json::to_value(Ack::ok(Some(4))).unwrap();
        assert_eq!(json, json!({"type": "ack", "ack": 4}));
    }

    #[test]
    fn ack_result_carries_revision() {
        let json = serde_json::to_value(Ack::with_result(Some(1), json!("v"), 7)).unwrap();
        assert_eq!(json["res"], "v");
        assert_eq!(json["revision"], 7);
        assert!(json.get("err").is_none());
    }

    #[test]
    fn ack_conflict_carries_current_value() {
        let err = TurboError::Conflict {
            expected: 1,
            current: 2,
            value: json!({"n": 2}),
        };
        let ack = Ack::error(Some(3), &err);
        assert!(ack.is_error());
        assert_eq!(ack.res, Some(json!({"n": 2})));
        assert_eq!(ack.revision, Some(2));
    }

    #[test]
    fn change_event_shapes() {
        let value = serde_json::to_value(ChangeEvent::value("/a/b", json!(1))).unwrap();
        assert_eq!(
            value,
            json!({"type": "on", "path": "/a/b", "eventType": 0, "value": 1})
        );

        let child = serde_json::to_value(ChangeEvent::child(
            EventClass::ChildRemoved,
            "/a",
            "/a/b",
            Value::Null,
        ))
        .unwrap();
        assert_eq!(child["eventType"], 4);
        assert_eq!(child["path"], "/a");
        assert_eq!(child["child"], "/a/b");
        assert!(child["value"].is_null());
    }
}
