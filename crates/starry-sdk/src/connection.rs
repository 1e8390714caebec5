use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use starry_protocol::{Operation, Reply, Request, Response};
use starry_types::{Route, Value};

use crate::channel::Channel;
use crate::error::SdkError;

/// Typed calls against the depot a session has opened.
///
/// Every call reports failure as the message the server rendered, or as a
/// local `... timeout.` / `Caught exception: ...` message. None of them
/// panic or return transport errors.
#[derive(Debug)]
pub struct Connection {
    channel: Option<Channel>,
    timeout: Duration,
}

fn unexpected(name: &str, reply: Reply) -> String {
    format!("Caught exception: unexpected reply to {name}: {reply:?}")
}

fn absolute(path: &Path) -> Result<String, String> {
    std::path::absolute(path)
        .map(|p| p.display().to_string())
        .map_err(|e| format!("Caught exception: {e}"))
}

impl Connection {
    pub(crate) fn new(channel: Channel, timeout: Duration) -> Self {
        Self {
            channel: Some(channel),
            timeout,
        }
    }

    pub(crate) fn take_channel(&mut self) -> Option<Channel> {
        self.channel.take()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Bind the channel to the depot at `path`.
    pub(crate) async fn bind(&mut self, path: &Path) -> Result<(), SdkError> {
        let channel = self.channel.as_mut().ok_or(SdkError::Poisoned)?;
        let request = Request::Open {
            path: path.display().to_string(),
        };
        match channel.request(request, self.timeout).await? {
            Ok(Reply::Opened) => Ok(()),
            Ok(other) => Err(SdkError::Open(unexpected("open", other))),
            Err(message) => Err(SdkError::Open(message)),
        }
    }

    /// Run any operation and return the raw response.
    pub async fn call(&mut self, op: Operation) -> Response {
        let call = op.describe();
        let Some(channel) = self.channel.as_mut() else {
            return Err(format!("Caught exception: {}", SdkError::Poisoned));
        };
        match channel.request(Request::Call(op), self.timeout).await {
            Ok(response) => response,
            Err(SdkError::Timeout(_)) => Err(format!("{call} timeout.")),
            Err(e) => Err(format!("Caught exception: {e}")),
        }
    }

    async fn done(&mut self, op: Operation) -> Result<(), String> {
        let name = op.name();
        match self.call(op).await? {
            Reply::Done => Ok(()),
            other => Err(unexpected(name, other)),
        }
    }

    /// `true` when the document was written, `false` when nothing changed.
    async fn written(&mut self, op: Operation) -> Result<bool, String> {
        let name = op.name();
        match self.call(op).await? {
            Reply::Done => Ok(true),
            Reply::Unchanged => Ok(false),
            other => Err(unexpected(name, other)),
        }
    }

    async fn values(&mut self, op: Operation) -> Result<BTreeMap<String, Value>, String> {
        let name = op.name();
        match self.call(op).await? {
            Reply::Values(values) => Ok(values),
            other => Err(unexpected(name, other)),
        }
    }

    pub async fn get(&mut self, route: impl Into<Route>) -> Result<Value, String> {
        match self.call(Operation::Get { route: route.into() }).await? {
            Reply::Value(value) => Ok(value),
            other => Err(unexpected("get", other)),
        }
    }

    pub async fn exist(&mut self, route: impl Into<Route>) -> Result<bool, String> {
        match self.call(Operation::Exist { route: route.into() }).await? {
            Reply::Exists(exists) => Ok(exists),
            other => Err(unexpected("exist", other)),
        }
    }

    pub async fn update(
        &mut self,
        route: impl Into<Route>,
        value: impl Into<Value>,
    ) -> Result<bool, String> {
        self.written(Operation::Update { route: route.into(), value: value.into() })
            .await
    }

    pub async fn insert(
        &mut self,
        route: impl Into<Route>,
        value: impl Into<Value>,
    ) -> Result<bool, String> {
        self.written(Operation::Insert { route: route.into(), value: value.into() })
            .await
    }

    pub async fn delete(&mut self, route: impl Into<Route>) -> Result<(), String> {
        self.done(Operation::Delete { route: route.into() }).await
    }

    pub async fn copy(&mut self, old_key: &str, new_key: &str) -> Result<(), String> {
        self.done(Operation::Copy {
            old_key: old_key.to_string(),
            new_key: new_key.to_string(),
        })
        .await
    }

    pub async fn rename(&mut self, old_key: &str, new_key: &str) -> Result<(), String> {
        self.done(Operation::Rename {
            old_key: old_key.to_string(),
            new_key: new_key.to_string(),
        })
        .await
    }

    pub async fn list(&mut self) -> Result<Vec<String>, String> {
        match self.call(Operation::List).await? {
            Reply::Keys(keys) => Ok(keys),
            other => Err(unexpected("list", other)),
        }
    }

    pub async fn get_multi(&mut self, keys: &[&str]) -> Result<BTreeMap<String, Value>, String> {
        let keys = keys.iter().map(|k| k.to_string()).collect();
        self.values(Operation::GetMulti { keys }).await
    }

    pub async fn get_all(&mut self) -> Result<BTreeMap<String, Value>, String> {
        self.values(Operation::GetAll).await
    }

    pub async fn update_multi(&mut self, values: BTreeMap<String, Value>) -> Result<(), String> {
        self.done(Operation::UpdateMulti { values }).await
    }

    /// Make the depot hold exactly `values`.
    pub async fn update_all(&mut self, values: BTreeMap<String, Value>) -> Result<(), String> {
        self.done(Operation::UpdateAll { values }).await
    }

    pub async fn insert_multi(&mut self, values: BTreeMap<String, Value>) -> Result<(), String> {
        self.done(Operation::InsertMulti { values }).await
    }

    pub async fn delete_multi(&mut self, keys: &[&str]) -> Result<(), String> {
        let keys = keys.iter().map(|k| k.to_string()).collect();
        self.done(Operation::DeleteMulti { keys }).await
    }

    pub async fn backup(&mut self) -> Result<(), String> {
        self.done(Operation::Backup).await
    }

    pub async fn recover(&mut self) -> Result<(), String> {
        self.done(Operation::Recover).await
    }

    /// Copy every document into the directory `path`, resolved locally.
    pub async fn clone_to(&mut self, path: impl AsRef<Path>) -> Result<(), String> {
        let path = absolute(path.as_ref())?;
        self.done(Operation::Clone { path }).await
    }

    /// Replace the depot's contents with the depot at `path`, resolved locally.
    pub async fn upgrade(&mut self, path: impl AsRef<Path>) -> Result<(), String> {
        let path = absolute(path.as_ref())?;
        self.done(Operation::Upgrade { path }).await
    }

    pub async fn clear(&mut self) -> Result<(), String> {
        self.done(Operation::Clear).await
    }

    pub async fn enable_backup(&mut self) -> Result<(), String> {
        self.done(Operation::EnableBackup).await
    }

    pub async fn disable_backup(&mut self) -> Result<(), String> {
        self.done(Operation::DisableBackup).await
    }

    pub async fn enable_cache(&mut self) -> Result<(), String> {
        self.done(Operation::EnableCache).await
    }

    pub async fn disable_cache(&mut self) -> Result<(), String> {
        self.done(Operation::DisableCache).await
    }

    pub async fn enable_fsync(&mut self) -> Result<(), String> {
        self.done(Operation::EnableFsync).await
    }

    pub async fn disable_fsync(&mut self) -> Result<(), String> {
        self.done(Operation::DisableFsync).await
    }
}
