use std::env;
use std::time::Duration;

use tracing::warn;

/// Tenant scope used when neither the caller nor `SANDBOX_TENANT` names one.
pub const DEFAULT_TENANT: &str = "sandbox";

pub const DEFAULT_SERVICE_NAME: &str = "event-spine";

/// Receipts are honored for a day unless the caller overrides the TTL.
pub const DEFAULT_RECEIPT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Events carrying injected delay get a short TTL so simulation runs stay bounded.
pub const DEFAULT_CHAOS_TTL: Duration = Duration::from_secs(60);

pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Runtime configuration loaded from environment variables.
///
/// Every value is optional. Durable I/O and span export degrade to no-ops
/// when their settings are absent, so a bare environment yields a working
/// in-memory spine.
#[derive(Debug, Clone)]
pub struct SpineConfig {
    /// Disables all durable I/O (`SIM_MODE`).
    pub sim_mode: bool,
    /// Default tenant scope for persistence (`SANDBOX_TENANT`).
    pub sandbox_tenant: String,
    pub database_url: Option<String>,

    // Span export
    pub otel_exporter_enabled: bool,
    pub otel_exporter_endpoint: Option<String>,
    pub service_name: String,

    // Idempotency
    pub receipt_ttl: Duration,
    pub chaos_ttl: Duration,
    pub cleanup_interval: Duration,
}

impl Default for SpineConfig {
    fn default() -> Self {
        Self {
            sim_mode: false,
            sandbox_tenant: DEFAULT_TENANT.to_string(),
            database_url: None,
            otel_exporter_enabled: false,
            otel_exporter_endpoint: None,
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            receipt_ttl: DEFAULT_RECEIPT_TTL,
            chaos_ttl: DEFAULT_CHAOS_TTL,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }
}

impl SpineConfig {
    /// Load configuration from the process environment (and `.env`, if present).
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary variable lookup. Malformed values
    /// fall back to their defaults with a warning.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            sim_mode: flag(&lookup, "SIM_MODE"),
            sandbox_tenant: non_empty("SANDBOX_TENANT").unwrap_or(defaults.sandbox_tenant),
            database_url: non_empty("DATABASE_URL"),
            otel_exporter_enabled: flag(&lookup, "OTEL_EXPORTER_ENABLED"),
            otel_exporter_endpoint: non_empty("OTEL_EXPORTER_OTLP_ENDPOINT"),
            service_name: non_empty("SERVICE_NAME").unwrap_or(defaults.service_name),
            receipt_ttl: millis(&lookup, "IDEMPOTENCY_TTL_MS").unwrap_or(defaults.receipt_ttl),
            chaos_ttl: millis(&lookup, "CHAOS_TTL_MS").unwrap_or(defaults.chaos_ttl),
            cleanup_interval: millis(&lookup, "CLEANUP_INTERVAL_MS")
                .unwrap_or(defaults.cleanup_interval),
        }
    }

    /// Whether durable receipt storage can be reached at all.
    pub fn durable_store_enabled(&self) -> bool {
        !self.sim_mode && self.database_url.is_some()
    }

    /// Log the loaded config without leaking credentials.
    pub fn log_redacted(&self) {
        fn preview(val: &str) -> String {
            let n = val.char_indices().nth(5).map_or(val.len(), |(i, _)| i);
            format!("{}...({} chars)", &val[..n], val.len())
        }
        fn preview_opt(val: &Option<String>) -> String {
            match val {
                Some(v) if !v.is_empty() => preview(v),
                _ => "<not set>".to_string(),
            }
        }

        tracing::info!("Config loaded:");
        tracing::info!("  SIM_MODE: {}", self.sim_mode);
        tracing::info!("  SANDBOX_TENANT: {}", self.sandbox_tenant);
        tracing::info!("  DATABASE_URL: {}", preview_opt(&self.database_url));
        tracing::info!("  OTEL_EXPORTER_ENABLED: {}", self.otel_exporter_enabled);
        tracing::info!(
            "  OTEL_EXPORTER_OTLP_ENDPOINT: {}",
            self.otel_exporter_endpoint.as_deref().unwrap_or("<not set>")
        );
        tracing::info!("  IDEMPOTENCY_TTL_MS: {}", self.receipt_ttl.as_millis());
        tracing::info!("  CHAOS_TTL_MS: {}", self.chaos_ttl.as_millis());
        tracing::info!("  CLEANUP_INTERVAL_MS: {}", self.cleanup_interval.as_millis());
    }
}

fn flag<F>(lookup: &F, key: &str) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => false,
    }
}

fn millis<F>(lookup: &F, key: &str) -> Option<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(ms) if ms > 0 => Some(Duration::from_millis(ms)),
        _ => {
            warn!(key, value = raw.as_str(), "Ignoring malformed duration, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_yields_in_memory_defaults() {
        let config = SpineConfig::from_lookup(lookup(&[]));

        assert!(!config.sim_mode);
        assert_eq!(config.sandbox_tenant, DEFAULT_TENANT);
        assert!(config.database_url.is_none());
        assert!(!config.otel_exporter_enabled);
        assert_eq!(config.receipt_ttl, DEFAULT_RECEIPT_TTL);
        assert_eq!(config.chaos_ttl, DEFAULT_CHAOS_TTL);
        assert!(!config.durable_store_enabled());
    }

    #[test]
    fn reads_flags_and_overrides() {
        let config = SpineConfig::from_lookup(lookup(&[
            ("SIM_MODE", "true"),
            ("SANDBOX_TENANT", "tenant-7"),
            ("DATABASE_URL", "postgres://localhost/spine"),
            ("OTEL_EXPORTER_ENABLED", "1"),
            ("OTEL_EXPORTER_OTLP_ENDPOINT", "http://collector:4318"),
            ("IDEMPOTENCY_TTL_MS", "5000"),
            ("CLEANUP_INTERVAL_MS", "250"),
        ]));

        assert!(config.sim_mode);
        assert_eq!(config.sandbox_tenant, "tenant-7");
        assert!(config.otel_exporter_enabled);
        assert_eq!(
            config.otel_exporter_endpoint.as_deref(),
            Some("http://collector:4318")
        );
        assert_eq!(config.receipt_ttl, Duration::from_millis(5000));
        assert_eq!(config.cleanup_interval, Duration::from_millis(250));
        // SIM_MODE wins over a configured database
        assert!(!config.durable_store_enabled());
    }

    #[test]
    fn malformed_durations_fall_back_to_defaults() {
        let config = SpineConfig::from_lookup(lookup(&[
            ("IDEMPOTENCY_TTL_MS", "soon"),
            ("CHAOS_TTL_MS", "0"),
        ]));

        assert_eq!(config.receipt_ttl, DEFAULT_RECEIPT_TTL);
        assert_eq!(config.chaos_ttl, DEFAULT_CHAOS_TTL);
    }

    #[test]
    fn blank_tenant_is_ignored() {
        let config = SpineConfig::from_lookup(lookup(&[("SANDBOX_TENANT", "  ")]));
        assert_eq!(config.sandbox_tenant, DEFAULT_TENANT);
    }
}
