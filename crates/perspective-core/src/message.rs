//! Protocol frames.
//!
//! Every frame is one JSON object tagged by `type`. The broker on each end
//! owns the meaning; this module only fixes the shapes.

use crate::{Clid, Jelly, RequestId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single frame exchanged between two brokers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// First frame in each direction.
    Version { version: u32 },
    /// Invoke a method on an object the receiver exported.
    Message(Request),
    /// Push an update to a cache mirror the receiver holds.
    CacheMessage(Request),
    /// Successful result of a request.
    Answer { request_id: RequestId, result: Jelly },
    /// Failed result of a request.
    Error {
        request_id: RequestId,
        failure: WireFailure,
    },
    /// The sender dropped every proxy for `clid`; `count` is how many times
    /// it had received that reference.
    Decref { clid: Clid, count: u32 },
    /// Same as `Decref`, for a cache mirror.
    Decache { luid: Clid, count: u32 },
    /// The exporter forgot `luid`; the mirror can go.
    Uncache { luid: Clid },
    /// The sender could not interpret a frame of type `command`.
    DidNotUnderstand { command: String },
}

impl Frame {
    /// Every `type` tag this protocol version defines.
    pub const COMMANDS: &[&str] = &[
        "version",
        "message",
        "cache_message",
        "answer",
        "error",
        "decref",
        "decache",
        "uncache",
        "did_not_understand",
    ];

    /// The `type` tag of this frame.
    pub fn command(&self) -> &'static str {
        match self {
            Frame::Version { .. } => "version",
            Frame::Message(_) => "message",
            Frame::CacheMessage(_) => "cache_message",
            Frame::Answer { .. } => "answer",
            Frame::Error { .. } => "error",
            Frame::Decref { .. } => "decref",
            Frame::Decache { .. } => "decache",
            Frame::Uncache { .. } => "uncache",
            Frame::DidNotUnderstand { .. } => "did_not_understand",
        }
    }
}

/// A method invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub request_id: RequestId,
    /// Export (or cache mirror) the call is addressed to.
    pub target: Clid,
    pub method: String,
    /// When false the receiver sends neither answer nor error.
    pub answer_required: bool,
    #[serde(default)]
    pub args: Vec<Jelly>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub kwargs: BTreeMap<String, Jelly>,
}

/// Why a request failed, as reported by the side that handled it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The handler returned an application error.
    Application,
    /// The target has no handler for the method.
    NoSuchMethod,
    /// The handler rejected the shape or types of its arguments.
    BadArguments,
    /// No object is exported under the target id.
    InvalidObject,
    /// The request could not be decoded.
    Protocol,
    /// The request named a type outside the receiver's registry.
    Security,
}

/// Payload of an error frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireFailure {
    pub kind: FailureKind,
    /// Application error tag, if the handler supplied one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_shape() {
        let frame = Frame::Message(Request {
            request_id: 4,
            target: 0,
            method: "echo".into(),
            answer_required: true,
            args: vec![Jelly::Str("hi".into())],
            kwargs: BTreeMap::new(),
        });
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({
                "type": "message",
                "request_id": 4,
                "target": 0,
                "method": "echo",
                "answer_required": true,
                "args": [{"type": "str", "value": "hi"}]
            })
        );
    }

    #[test]
    fn error_frame_roundtrip() {
        let frame = Frame::Error {
            request_id: 9,
            failure: WireFailure {
                kind: FailureKind::Security,
                tag: None,
                message: "type tag \"evil\" is not registered".into(),
            },
        };
        let text = serde_json::to_string(&frame).unwrap();
        assert!(text.contains("\"kind\":\"security\""));
        assert_eq!(serde_json::from_str::<Frame>(&text).unwrap(), frame);
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(serde_json::from_str::<Frame>(r#"{"type":"teleport"}"#).is_err());
        assert!(!Frame::COMMANDS.contains(&"teleport"));
    }

    #[test]
    fn command_matches_serialized_tag() {
        let frames = [
            Frame::Version { version: 1 },
            Frame::Uncache { luid: 3 },
            Frame::DidNotUnderstand {
                command: "teleport".into(),
            },
        ];
        for frame in frames {
            let value = serde_json::to_value(&frame).unwrap();
            assert_eq!(value["type"], frame.command());
            assert!(Frame::COMMANDS.contains(&frame.command()));
        }
    }
}
