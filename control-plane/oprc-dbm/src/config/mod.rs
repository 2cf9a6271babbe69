mod types;

pub use types::{
    CleanupConfig, ControllerSettings, DbmConfig, QueueConfig, RetryPolicy,
};
