pub mod config;

pub use config::{
    SpineConfig, DEFAULT_CHAOS_TTL, DEFAULT_CLEANUP_INTERVAL, DEFAULT_RECEIPT_TTL,
    DEFAULT_SERVICE_NAME, DEFAULT_TENANT,
};
