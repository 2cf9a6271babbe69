use serde_json::{Map, Value, json};
use tracing::debug;

use super::{ObjectKey, ObjectStore, StoreObject, StoreResult, kind_of};
use crate::config::RetryPolicy;

/// Outcome of a conflict-retrying write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verb {
    Unchanged,
    Patched,
}

/// RFC 7386 merge patch turning `orig` into `modified`. Keys missing from
/// `modified` become `null`; non-object values are replaced wholesale.
pub fn create_merge_patch(orig: &Value, modified: &Value) -> Value {
    match (orig, modified) {
        (Value::Object(a), Value::Object(b)) => {
            let mut out = Map::new();
            for (k, old) in a {
                match b.get(k) {
                    None => {
                        out.insert(k.clone(), Value::Null);
                    }
                    Some(new) if new != old => {
                        out.insert(k.clone(), create_merge_patch(old, new));
                    }
                    Some(_) => {}
                }
            }
            for (k, new) in b {
                if !a.contains_key(k) {
                    out.insert(k.clone(), new.clone());
                }
            }
            Value::Object(out)
        }
        (_, new) => new.clone(),
    }
}

fn is_empty_patch(p: &Value) -> bool {
    matches!(p, Value::Object(m) if m.is_empty())
}

/// Insert the resourceVersion the transform was computed against, so the
/// write is rejected if anybody else wrote in between.
fn with_precondition(mut patch: Value, resource_version: Option<&str>) -> Value {
    if let (Value::Object(map), Some(rv)) = (&mut patch, resource_version) {
        let meta = map
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(meta) = meta {
            meta.insert("resourceVersion".into(), json!(rv));
        }
    }
    patch
}

#[derive(Clone, Copy)]
enum Target {
    Main,
    Status,
}

fn diff_for<K: StoreObject>(
    current: &K,
    desired: &K,
    target: Target,
) -> StoreResult<Value> {
    let mut a = serde_json::to_value(current)?;
    let mut b = serde_json::to_value(desired)?;
    let patch = match target {
        Target::Main => {
            // status has its own subresource
            for v in [&mut a, &mut b] {
                if let Value::Object(m) = v {
                    m.remove("status");
                }
            }
            create_merge_patch(&a, &b)
        }
        Target::Status => {
            let a = a.get("status").cloned().unwrap_or(Value::Null);
            let b = b.get("status").cloned().unwrap_or(Value::Null);
            if a == b {
                json!({})
            } else {
                json!({ "status": create_merge_patch(&a, &b) })
            }
        }
    };
    Ok(patch)
}

async fn write_with_retry<K, F>(
    store: &dyn ObjectStore<K>,
    key: &ObjectKey,
    policy: RetryPolicy,
    target: Target,
    transform: F,
) -> StoreResult<(K, Verb)>
where
    K: StoreObject,
    F: Fn(K) -> K + Send + Sync,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let current = store.get(key).await?;
        let desired = transform(current.clone());
        let patch = diff_for(&current, &desired, target)?;
        if is_empty_patch(&patch) {
            return Ok((current, Verb::Unchanged));
        }
        let patch =
            with_precondition(patch, current.meta().resource_version.as_deref());
        let res = match target {
            Target::Main => store.patch(key, &patch).await,
            Target::Status => store.patch_status(key, &patch).await,
        };
        match res {
            Ok(obj) => return Ok((obj, Verb::Patched)),
            Err(e) if e.is_conflict() && attempt < policy.attempts => {
                debug!(
                    kind = %kind_of::<K>(),
                    %key,
                    attempt,
                    "write conflict, retrying"
                );
                tokio::time::sleep(policy.interval).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Read-modify-write of everything but status. `transform` must be pure: it
/// is re-applied to a fresh read after every conflict.
pub async fn patch_with_retry<K, F>(
    store: &dyn ObjectStore<K>,
    key: &ObjectKey,
    policy: RetryPolicy,
    transform: F,
) -> StoreResult<(K, Verb)>
where
    K: StoreObject,
    F: Fn(K) -> K + Send + Sync,
{
    write_with_retry(store, key, policy, Target::Main, transform).await
}

/// Same as [`patch_with_retry`] for the status subresource.
pub async fn update_status_with_retry<K, F>(
    store: &dyn ObjectStore<K>,
    key: &ObjectKey,
    policy: RetryPolicy,
    transform: F,
) -> StoreResult<(K, Verb)>
where
    K: StoreObject,
    F: Fn(K) -> K + Send + Sync,
{
    write_with_retry(store, key, policy, Target::Status, transform).await
}
