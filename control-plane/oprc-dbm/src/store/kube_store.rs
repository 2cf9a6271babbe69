use std::marker::PhantomData;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::watcher;
use kube::Client;
use tracing::trace;

use super::{
    LabelSet, ObjectKey, ObjectStore, StoreError, StoreObject, StoreResult,
    WatchEvent, kind_of, label_selector,
};

/// [`ObjectStore`] backed by the Kubernetes API server.
pub struct KubeStore<K> {
    client: Client,
    watch_namespace: Option<String>,
    _kind: PhantomData<fn() -> K>,
}

impl<K: StoreObject> KubeStore<K> {
    pub fn new(client: Client, watch_namespace: Option<String>) -> Self {
        Self {
            client,
            watch_namespace,
            _kind: PhantomData,
        }
    }

    fn api(&self, ns: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), ns)
    }
}

fn into_store_err<K: StoreObject>(
    err: kube::Error,
    key: &ObjectKey,
) -> StoreError {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound {
            kind: kind_of::<K>(),
            key: key.to_string(),
        },
        kube::Error::Api(ae)
            if ae.code == 409 && ae.reason == "AlreadyExists" =>
        {
            StoreError::AlreadyExists {
                kind: kind_of::<K>(),
                key: key.to_string(),
            }
        }
        kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict {
            kind: kind_of::<K>(),
            key: key.to_string(),
            message: ae.message,
        },
        kube::Error::Api(ae) => StoreError::Api {
            code: ae.code,
            message: ae.message,
        },
        other => StoreError::Api {
            code: 0,
            message: other.to_string(),
        },
    }
}

#[async_trait]
impl<K: StoreObject> ObjectStore<K> for KubeStore<K> {
    async fn get(&self, key: &ObjectKey) -> StoreResult<K> {
        self.api(&key.namespace)
            .get(&key.name)
            .await
            .map_err(|e| into_store_err::<K>(e, key))
    }

    async fn list(
        &self,
        namespace: &str,
        labels: &LabelSet,
    ) -> StoreResult<Vec<K>> {
        let mut lp = ListParams::default();
        if !labels.is_empty() {
            lp = lp.labels(&label_selector(labels));
        }
        let any = ObjectKey::new(namespace, "*");
        let list = self
            .api(namespace)
            .list(&lp)
            .await
            .map_err(|e| into_store_err::<K>(e, &any))?;
        Ok(list.items)
    }

    async fn create(&self, obj: &K) -> StoreResult<K> {
        let key = ObjectKey::of(obj).ok_or_else(|| {
            StoreError::Invalid(format!(
                "{} without namespace/name",
                kind_of::<K>()
            ))
        })?;
        trace!(kind = %kind_of::<K>(), %key, "create");
        self.api(&key.namespace)
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| into_store_err::<K>(e, &key))
    }

    async fn patch(
        &self,
        key: &ObjectKey,
        patch: &serde_json::Value,
    ) -> StoreResult<K> {
        trace!(kind = %kind_of::<K>(), %key, %patch, "patch");
        self.api(&key.namespace)
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| into_store_err::<K>(e, key))
    }

    async fn patch_status(
        &self,
        key: &ObjectKey,
        patch: &serde_json::Value,
    ) -> StoreResult<K> {
        trace!(kind = %kind_of::<K>(), %key, %patch, "patch status");
        self.api(&key.namespace)
            .patch_status(
                &key.name,
                &PatchParams::default(),
                &Patch::Merge(patch),
            )
            .await
            .map_err(|e| into_store_err::<K>(e, key))
    }

    async fn delete(&self, key: &ObjectKey) -> StoreResult<()> {
        trace!(kind = %kind_of::<K>(), %key, "delete");
        self.api(&key.namespace)
            .delete(&key.name, &DeleteParams::background())
            .await
            .map(|_| ())
            .map_err(|e| into_store_err::<K>(e, key))
    }

    fn watch(&self) -> BoxStream<'static, StoreResult<WatchEvent<K>>> {
        let api: Api<K> = match self.watch_namespace.as_deref() {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        watcher(api, watcher::Config::default())
            .filter_map(|ev| async move {
                match ev {
                    Ok(watcher::Event::Apply(obj))
                    | Ok(watcher::Event::InitApply(obj)) => {
                        Some(Ok(WatchEvent::Applied(obj)))
                    }
                    Ok(watcher::Event::Delete(obj)) => {
                        Some(Ok(WatchEvent::Deleted(obj)))
                    }
                    Ok(watcher::Event::Init)
                    | Ok(watcher::Event::InitDone) => None,
                    Err(e) => Some(Err(StoreError::Watch(e.to_string()))),
                }
            })
            .boxed()
    }
}
