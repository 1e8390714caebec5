use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use starry_types::{Route, Value};

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Every operation a client may invoke on an opened depot.
///
/// The set is closed: a name outside it fails to decode at the frame
/// boundary instead of reaching a depot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    Get { route: Route },
    Exist { route: Route },
    Update { route: Route, value: Value },
    Insert { route: Route, value: Value },
    Delete { route: Route },
    Copy { old_key: String, new_key: String },
    Rename { old_key: String, new_key: String },
    List,
    GetMulti { keys: Vec<String> },
    GetAll,
    UpdateMulti { values: BTreeMap<String, Value> },
    UpdateAll { values: BTreeMap<String, Value> },
    InsertMulti { values: BTreeMap<String, Value> },
    DeleteMulti { keys: Vec<String> },
    Backup,
    Recover,
    Clone { path: String },
    Upgrade { path: String },
    Clear,
    EnableBackup,
    DisableBackup,
    EnableCache,
    DisableCache,
    EnableFsync,
    DisableFsync,
}

impl Operation {
    /// Wire-visible operation name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Get { .. } => "get",
            Self::Exist { .. } => "exist",
            Self::Update { .. } => "update",
            Self::Insert { .. } => "insert",
            Self::Delete { .. } => "delete",
            Self::Copy { .. } => "copy",
            Self::Rename { .. } => "rename",
            Self::List => "list",
            Self::GetMulti { .. } => "getMulti",
            Self::GetAll => "getAll",
            Self::UpdateMulti { .. } => "updateMulti",
            Self::UpdateAll { .. } => "updateAll",
            Self::InsertMulti { .. } => "insertMulti",
            Self::DeleteMulti { .. } => "deleteMulti",
            Self::Backup => "backup",
            Self::Recover => "recover",
            Self::Clone { .. } => "clone",
            Self::Upgrade { .. } => "upgrade",
            Self::Clear => "clear",
            Self::EnableBackup => "enableBackup",
            Self::DisableBackup => "disableBackup",
            Self::EnableCache => "enableCache",
            Self::DisableCache => "disableCache",
            Self::EnableFsync => "enableFsync",
            Self::DisableFsync => "disableFsync",
        }
    }

    /// The call rendered as `name(arg, ...)` for diagnostics.
    ///
    /// Only routes, keys and paths are shown. Document values never are,
    /// and multi-key calls report how many keys they carry.
    pub fn describe(&self) -> String {
        let args = match self {
            Self::Get { route }
            | Self::Exist { route }
            | Self::Delete { route }
            | Self::Update { route, .. }
            | Self::Insert { route, .. } => format!("{:?}", route.to_string()),
            Self::Copy { old_key, new_key } | Self::Rename { old_key, new_key } => {
                format!("{old_key:?}, {new_key:?}")
            }
            Self::GetMulti { keys } | Self::DeleteMulti { keys } => format!("{} keys", keys.len()),
            Self::UpdateMulti { values }
            | Self::UpdateAll { values }
            | Self::InsertMulti { values } => format!("{} keys", values.len()),
            Self::Clone { path } | Self::Upgrade { path } => format!("{path:?}"),
            _ => String::new(),
        };
        format!("{}({args})", self.name())
    }
}

/// A client request on a connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Bind the connection to the depot at `path`, creating it on first use.
    Open { path: String },
    /// Run an operation on the bound depot.
    Call(Operation),
}

/// Successful result of a request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    /// The connection is bound to the requested depot.
    Opened,
    Done,
    /// An update or insert found nothing to change.
    Unchanged,
    Value(Value),
    Values(BTreeMap<String, Value>),
    Keys(Vec<String>),
    Exists(bool),
}

/// Outcome of a request. Failures carry the rendered, user-facing message.
pub type Response = Result<Reply, String>;

/// Every frame exchanged on a connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum StarryMessage {
    /// Server greeting carrying the authentication nonce.
    Challenge { version: u32, nonce: [u8; 32] },
    /// Client answer: keyed hash of the nonce.
    Proof { digest: [u8; 32] },
    Welcome,
    Rejected { reason: String },
    Request(Request),
    Response(Response),
}

impl StarryMessage {
    pub fn type_tag(&self) -> u8 {
        match self {
            Self::Challenge { .. } => 1,
            Self::Proof { .. } => 2,
            Self::Welcome => 3,
            Self::Rejected { .. } => 4,
            Self::Request(_) => 5,
            Self::Response(_) => 6,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Challenge { .. } => "Challenge",
            Self::Proof { .. } => "Proof",
            Self::Welcome => "Welcome",
            Self::Rejected { .. } => "Rejected",
            Self::Request(_) => "Request",
            Self::Response(_) => "Response",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_names_match_wire_names() {
        assert_eq!(Operation::GetMulti { keys: vec![] }.name(), "getMulti");
        assert_eq!(Operation::DisableFsync.name(), "disableFsync");
        assert_eq!(Operation::Clone { path: "/d".into() }.name(), "clone");
    }

    #[test]
    fn describe_renders_arguments_without_values() {
        let op = Operation::Update {
            route: Route::new("alice").at("tags").at(0),
            value: Value::from("secret payload"),
        };
        assert_eq!(op.describe(), r#"update("alice.tags.0")"#);
        let mut values = BTreeMap::new();
        values.insert("a".to_string(), Value::from("secret payload"));
        values.insert("b".to_string(), Value::from(2));
        let described = Operation::UpdateMulti { values }.describe();
        assert_eq!(described, "updateMulti(2 keys)");
        assert_eq!(Operation::List.describe(), "list()");
        assert_eq!(
            Operation::Rename { old_key: "a".into(), new_key: "b".into() }.describe(),
            r#"rename("a", "b")"#
        );
    }
}
