//! Serialized value form.

use crate::Clid;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One value as it appears on the wire.
///
/// Plain data maps one to one. Objects appear as flavor atoms: a reference
/// (`remote`), a snapshot (`copy`), a first cache transfer (`cache`) or a
/// repeat of one (`cached`), and back-references to objects the receiver
/// itself owns (`local`, `local_cache`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Jelly {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Jelly>),
    Dict(BTreeMap<String, Jelly>),
    /// An object exported by the sender. Interfaces are listed only on the
    /// first send over a connection.
    Remote {
        clid: Clid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        interfaces: Option<Vec<String>>,
    },
    /// An object the receiver exported earlier, coming back.
    Local { clid: Clid },
    /// A snapshot to be rebuilt by the type registered for `tag`.
    Copy { tag: String, state: Box<Jelly> },
    /// Full state of a cacheable, sent once per connection.
    Cache {
        luid: Clid,
        tag: String,
        state: Box<Jelly>,
    },
    /// A cacheable the receiver already mirrors.
    Cached { luid: Clid },
    /// A cache mirror handed back to the peer that owns the original.
    LocalCache { luid: Clid },
}

impl Jelly {
    /// The atom name, as used in log lines and error messages.
    pub fn atom(&self) -> &'static str {
        match self {
            Jelly::None => "none",
            Jelly::Bool(_) => "bool",
            Jelly::Int(_) => "int",
            Jelly::Float(_) => "float",
            Jelly::Str(_) => "str",
            Jelly::Bytes(_) => "bytes",
            Jelly::List(_) => "list",
            Jelly::Dict(_) => "dict",
            Jelly::Remote { .. } => "remote",
            Jelly::Local { .. } => "local",
            Jelly::Copy { .. } => "copy",
            Jelly::Cache { .. } => "cache",
            Jelly::Cached { .. } => "cached",
            Jelly::LocalCache { .. } => "local_cache",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_values_are_adjacently_tagged() {
        let value = Jelly::List(vec![Jelly::None, Jelly::Str("hi".into())]);
        assert_eq!(
            serde_json::to_value(&value).unwrap(),
            json!({"type": "list", "value": [{"type": "none"}, {"type": "str", "value": "hi"}]})
        );
    }

    #[test]
    fn interfaces_omitted_after_first_send() {
        let repeat = Jelly::Remote {
            clid: 7,
            interfaces: None,
        };
        assert_eq!(
            serde_json::to_value(&repeat).unwrap(),
            json!({"type": "remote", "value": {"clid": 7}})
        );

        let parsed: Jelly =
            serde_json::from_value(json!({"type": "remote", "value": {"clid": 7}})).unwrap();
        assert_eq!(parsed, repeat);
    }

    #[test]
    fn copy_carries_nested_state() {
        let copy = Jelly::Copy {
            tag: "demo.Point".into(),
            state: Box::new(Jelly::Dict(BTreeMap::from([("x".into(), Jelly::Int(3))]))),
        };
        let text = serde_json::to_string(&copy).unwrap();
        let back: Jelly = serde_json::from_str(&text).unwrap();
        assert_eq!(back, copy);
        assert_eq!(back.atom(), "copy");
    }
}
