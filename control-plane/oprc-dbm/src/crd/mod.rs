pub mod dormant_database;
pub mod postgres;

/// API group shared by every resource of this operator; also the value of
/// the managed-by label on objects the operator creates.
pub const GENERIC_KEY: &str = "db.oaas.io";

pub const LABEL_DATABASE_KIND: &str = "db.oaas.io/kind";
pub const LABEL_DATABASE_NAME: &str = "db.oaas.io/name";

pub const MANAGED_BY_LABEL_KEY: &str = "app.kubernetes.io/managed-by";
pub const NAME_LABEL_KEY: &str = "app.kubernetes.io/name";

pub const RESOURCE_KIND_POSTGRES: &str = "Postgres";

/// Path segment under which WAL archives live in object storage.
pub const DATABASE_NAME_PREFIX: &str = "dbm";
