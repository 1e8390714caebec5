use starry_protocol::{Operation, Reply, Response};
use starry_store::{Change, Depot, StoreResult};
use tracing::{debug, error};

fn changed(change: Change) -> Reply {
    match change {
        Change::Written => Reply::Done,
        Change::Unchanged => Reply::Unchanged,
    }
}

fn done(_: ()) -> Reply {
    Reply::Done
}

/// Run one operation against `depot`. Blocks on the depot scheduler.
pub fn execute(depot: &Depot, op: Operation) -> StoreResult<Reply> {
    match op {
        Operation::Get { route } => depot.get(&route).map(Reply::Value),
        Operation::Exist { route } => depot.exist(&route).map(Reply::Exists),
        Operation::Update { route, value } => depot.update(&route, value).map(changed),
        Operation::Insert { route, value } => depot.insert(&route, value).map(changed),
        Operation::Delete { route } => depot.delete(&route).map(done),
        Operation::Copy { old_key, new_key } => depot.copy(&old_key, &new_key).map(done),
        Operation::Rename { old_key, new_key } => depot.rename(&old_key, &new_key).map(done),
        Operation::List => depot.list().map(Reply::Keys),
        Operation::GetMulti { keys } => depot.get_multi(&keys).map(Reply::Values),
        Operation::GetAll => depot.get_all().map(Reply::Values),
        Operation::UpdateMulti { values } => depot.update_multi(values).map(done),
        Operation::UpdateAll { values } => depot.update_all(values).map(done),
        Operation::InsertMulti { values } => depot.insert_multi(values).map(done),
        Operation::DeleteMulti { keys } => depot.delete_multi(&keys).map(done),
        Operation::Backup => depot.backup().map(done),
        Operation::Recover => depot.recover().map(done),
        Operation::Clone { path } => depot.clone_to(&path).map(done),
        Operation::Upgrade { path } => depot.upgrade_from(&path).map(done),
        Operation::Clear => depot.clear().map(done),
        Operation::EnableBackup => depot.enable_backup().map(done),
        Operation::DisableBackup => depot.disable_backup().map(done),
        Operation::EnableCache => depot.enable_cache().map(done),
        Operation::DisableCache => depot.disable_cache().map(done),
        Operation::EnableFsync => depot.enable_fsync().map(done),
        Operation::DisableFsync => depot.disable_fsync().map(done),
    }
}

/// Run `op` and render a failure as the message the client sees.
pub fn dispatch(depot: &Depot, op: Operation) -> Response {
    let call = op.describe();
    match execute(depot, op) {
        Ok(reply) => {
            debug!(depot = %depot.path().display(), %call, "operation completed");
            Ok(reply)
        }
        Err(e) => {
            error!(depot = %depot.path().display(), %call, error = %e, "operation failed");
            Err(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use starry_store::DepotOptions;
    use serde_json::json;
    use starry_types::{Route, Value};
    use std::collections::BTreeMap;

    fn depot() -> (tempfile::TempDir, Depot) {
        let dir = tempfile::tempdir().unwrap();
        let depot = Depot::open(dir.path(), DepotOptions::default()).unwrap();
        (dir, depot)
    }

    fn alice() -> Value {
        Value::from(json!({"name": "Alice", "tags": ["x", "y"]}))
    }

    #[test]
    fn writes_report_whether_anything_changed() {
        let (_dir, depot) = depot();
        let insert = Operation::Insert { route: Route::new("alice"), value: alice() };
        assert_eq!(dispatch(&depot, insert), Ok(Reply::Done));

        let same = Operation::Update { route: Route::new("alice"), value: alice() };
        assert_eq!(dispatch(&depot, same), Ok(Reply::Unchanged));

        let tag = Operation::Update {
            route: Route::new("alice").at("tags").at(0),
            value: Value::from("z"),
        };
        assert_eq!(dispatch(&depot, tag), Ok(Reply::Done));
        assert_eq!(
            dispatch(&depot, Operation::Get { route: Route::new("alice").at("tags") }),
            Ok(Reply::Value(Value::from(json!(["z", "y"]))))
        );
    }

    #[test]
    fn failures_carry_the_user_message() {
        let (_dir, depot) = depot();
        assert_eq!(
            dispatch(&depot, Operation::Get { route: Route::new("nobody") }),
            Err("No nobody.".to_string())
        );
        assert_eq!(
            dispatch(&depot, Operation::Exist { route: Route::new("nobody") }),
            Ok(Reply::Exists(false))
        );
    }

    #[test]
    fn multi_key_and_listing() {
        let (_dir, depot) = depot();
        let mut values = BTreeMap::new();
        values.insert("a".to_string(), Value::from(1));
        values.insert("b".to_string(), Value::from(2));
        assert_eq!(dispatch(&depot, Operation::InsertMulti { values: values.clone() }), Ok(Reply::Done));
        assert_eq!(
            dispatch(&depot, Operation::List),
            Ok(Reply::Keys(vec!["a".to_string(), "b".to_string()]))
        );
        assert_eq!(dispatch(&depot, Operation::GetAll), Ok(Reply::Values(values)));

        assert_eq!(
            dispatch(&depot, Operation::DeleteMulti { keys: vec!["a".into()] }),
            Ok(Reply::Done)
        );
        assert_eq!(dispatch(&depot, Operation::List), Ok(Reply::Keys(vec!["b".to_string()])));
    }

    #[test]
    fn toggles_are_reachable() {
        let (dir, depot) = depot();
        assert_eq!(dispatch(&depot, Operation::EnableBackup), Ok(Reply::Done));
        assert!(depot.backup_enabled());
        assert!(dir.path().join(".backup").is_dir());
        assert_eq!(dispatch(&depot, Operation::EnableFsync), Ok(Reply::Done));
        assert!(depot.fsync_enabled());
        assert_eq!(dispatch(&depot, Operation::DisableBackup), Ok(Reply::Done));
        assert!(!depot.backup_enabled());
    }
}
