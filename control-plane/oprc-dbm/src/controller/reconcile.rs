use std::collections::BTreeMap;

use chrono::Utc;
use k8s_openapi::api::core::v1::{
    Secret, Service, ServiceAccount, ServicePort, ServiceSpec,
};
use k8s_openapi::api::rbac::v1::{
    PolicyRule, Role, RoleBinding, RoleRef, Subject,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use rand::Rng;
use rand::distr::Alphanumeric;
use tracing::{debug, info, instrument};

use super::events::{REASON_SUCCESSFUL_CREATE, Severity, obj_ref_of};
use super::{ControllerContext, ReconcileErr, status};
use crate::crd::postgres::{
    DatabasePhase, Postgres, SecretRef, auth_secret_name, governing_service_name,
    leader_lock_name, offshoot_labels, offshoot_selectors, snapshot_sa_name,
};
use crate::store::{
    ObjectKey, ObjectStore, StoreObject, Verb, patch_with_retry,
    update_status_with_retry,
};

const POSTGRES_PORT: i32 = 5432;
const PASSWORD_LEN: usize = 16;

struct Identity<'a> {
    key: ObjectKey,
    labels: BTreeMap<String, String>,
    owner: Option<OwnerReference>,
    pg: &'a Postgres,
}

impl Identity<'_> {
    fn meta(&self, name: String) -> ObjectMeta {
        ObjectMeta {
            name: Some(name),
            namespace: Some(self.key.namespace.clone()),
            labels: Some(self.labels.clone()),
            owner_references: self.owner.clone().map(|o| vec![o]),
            ..Default::default()
        }
    }

    /// Same as [`Identity::meta`] without the owner reference: the object
    /// outlives the instance and is only deleted by wipe-out.
    fn unowned_meta(&self, name: String) -> ObjectMeta {
        ObjectMeta {
            owner_references: None,
            ..self.meta(name)
        }
    }
}

fn owner_ref(pg: &Postgres) -> Option<OwnerReference> {
    Some(OwnerReference {
        api_version: "db.oaas.io/v1alpha1".into(),
        kind: "Postgres".into(),
        name: pg.metadata.name.clone()?,
        uid: pg.metadata.uid.clone()?,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

/// Bring the dependents of `pg` into existence and mark it running.
#[instrument(skip_all, fields(key = ?ObjectKey::of(pg)))]
pub async fn provision(
    ctx: &ControllerContext,
    pg: &Postgres,
) -> Result<(), ReconcileErr> {
    let key = ObjectKey::of(pg).ok_or_else(|| {
        ReconcileErr::Unrecoverable("Postgres without namespace/name".into())
    })?;
    let id = Identity {
        labels: offshoot_labels(
            &key.name,
            pg.metadata.labels.as_ref().unwrap_or(&BTreeMap::new()),
        ),
        owner: owner_ref(pg),
        key,
        pg,
    };

    ctx.archiver().delete_matching(&id.key).await?;
    ensure_auth_secret(ctx, &id).await?;

    let stores = &ctx.stores;
    create_if_absent(
        stores.service_accounts.as_ref(),
        &service_account(&id, id.key.name.clone()),
    )
    .await?;
    create_if_absent(
        stores.service_accounts.as_ref(),
        &service_account(&id, snapshot_sa_name(&id.key.name)),
    )
    .await?;
    create_if_absent(stores.roles.as_ref(), &role(&id)).await?;
    create_if_absent(stores.role_bindings.as_ref(), &role_binding(&id)).await?;
    create_if_absent(stores.services.as_ref(), &primary_service(&id)).await?;
    create_if_absent(stores.services.as_ref(), &governing_service(&id)).await?;

    let was_running = pg
        .status
        .as_ref()
        .and_then(|s| s.phase)
        .is_some_and(|p| p == DatabasePhase::Running);
    let now = Utc::now().to_rfc3339();
    let (_, verb) = update_status_with_retry(
        stores.postgres.as_ref(),
        &id.key,
        ctx.settings.retry,
        |mut cur| {
            cur.status = Some(status::running(&cur, &now));
            cur
        },
    )
    .await?;
    if verb == Verb::Patched && !was_running {
        info!("database is running");
        if let Some(r) = obj_ref_of(pg) {
            ctx.events
                .publish(
                    &r,
                    Severity::Normal,
                    REASON_SUCCESSFUL_CREATE,
                    "Provision",
                    None,
                )
                .await;
        }
    }
    Ok(())
}

async fn create_if_absent<K: StoreObject>(
    store: &dyn ObjectStore<K>,
    obj: &K,
) -> Result<(), ReconcileErr> {
    match store.create(obj).await {
        Ok(_) => {
            debug!(name = ?obj.meta().name, "created");
            Ok(())
        }
        Err(e) if e.is_already_exists() => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn generate_password() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LEN)
        .map(char::from)
        .collect()
}

/// Generate `<name>-auth` when the spec names no secret and record it in the
/// spec. A user-named secret is taken as is.
async fn ensure_auth_secret(
    ctx: &ControllerContext,
    id: &Identity<'_>,
) -> Result<(), ReconcileErr> {
    if id.pg.spec.database_secret.is_some() {
        return Ok(());
    }
    let name = auth_secret_name(&id.key.name);
    let secret = Secret {
        metadata: id.unowned_meta(name.clone()),
        string_data: Some(BTreeMap::from([
            ("POSTGRES_USER".to_string(), "postgres".to_string()),
            ("POSTGRES_PASSWORD".to_string(), generate_password()),
        ])),
        type_: Some("Opaque".into()),
        ..Default::default()
    };
    create_if_absent(ctx.stores.secrets.as_ref(), &secret).await?;
    patch_with_retry(
        ctx.stores.postgres.as_ref(),
        &id.key,
        ctx.settings.retry,
        |mut cur| {
            if cur.spec.database_secret.is_none() {
                cur.spec.database_secret = Some(SecretRef {
                    secret_name: name.clone(),
                });
            }
            cur
        },
    )
    .await?;
    Ok(())
}

fn service_account(id: &Identity<'_>, name: String) -> ServiceAccount {
    ServiceAccount {
        metadata: id.meta(name),
        ..Default::default()
    }
}

fn role(id: &Identity<'_>) -> Role {
    let strs = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    Role {
        metadata: id.meta(id.key.name.clone()),
        rules: Some(vec![
            PolicyRule {
                api_groups: Some(strs(&[""])),
                resources: Some(strs(&["pods"])),
                verbs: strs(&["get", "list", "patch"]),
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(strs(&["coordination.k8s.io"])),
                resources: Some(strs(&["leases"])),
                resource_names: Some(vec![leader_lock_name(&id.key.name)]),
                verbs: strs(&["get", "update", "patch"]),
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(strs(&["coordination.k8s.io"])),
                resources: Some(strs(&["leases"])),
                verbs: strs(&["create"]),
                ..Default::default()
            },
        ]),
    }
}

fn role_binding(id: &Identity<'_>) -> RoleBinding {
    RoleBinding {
        metadata: id.meta(id.key.name.clone()),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".into(),
            kind: "Role".into(),
            name: id.key.name.clone(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".into(),
            name: id.key.name.clone(),
            namespace: Some(id.key.namespace.clone()),
            ..Default::default()
        }]),
    }
}

fn postgres_port() -> ServicePort {
    ServicePort {
        name: Some("api".into()),
        port: POSTGRES_PORT,
        target_port: Some(IntOrString::Int(POSTGRES_PORT)),
        protocol: Some("TCP".into()),
        ..Default::default()
    }
}

fn primary_service(id: &Identity<'_>) -> Service {
    Service {
        metadata: id.meta(id.key.name.clone()),
        spec: Some(ServiceSpec {
            selector: Some(offshoot_selectors(&id.key.name)),
            ports: Some(vec![postgres_port()]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Headless service giving each replica a stable DNS name.
fn governing_service(id: &Identity<'_>) -> Service {
    Service {
        metadata: id.meta(governing_service_name(&id.key.name)),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".into()),
            selector: Some(offshoot_selectors(&id.key.name)),
            ports: Some(vec![postgres_port()]),
            publish_not_ready_addresses: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}
