//! Audit trail for hardware resources and engine lifecycle.
//!
//! Engines build an [`AuditRecord`] for each LAG, tunnel endpoint, tenant or
//! access port they create or destroy, and the sync engine records its own
//! start, shutdown and hardware faults. [`audit_log!`](crate::audit_log)
//! emits the record on the `audit` tracing target with the record's JSON form
//! attached as a field.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    ResourceCreate,
    ResourceDelete,
    /// Engine start, shutdown, restart
    SystemLifecycle,
    /// Kernel configuration the engines refused or could only partly apply
    NetworkConfig,
    ErrorCondition,
}

impl AuditCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditCategory::ResourceCreate => "resource_create",
            AuditCategory::ResourceDelete => "resource_delete",
            AuditCategory::SystemLifecycle => "system_lifecycle",
            AuditCategory::NetworkConfig => "network_config",
            AuditCategory::ErrorCondition => "error_condition",
        }
    }
}

impl fmt::Display for AuditCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Pending,
    Success,
    Failure,
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AuditOutcome::Pending => "pending",
            AuditOutcome::Success => "success",
            AuditOutcome::Failure => "failure",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub at: DateTime<Utc>,
    pub category: AuditCategory,
    /// "SyncEngine", "VxlanEngine", "BondManager"
    pub source: String,
    pub action: String,
    pub outcome: AuditOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_type: Option<String>,
    /// Hardware id, LAG name, VNI: whatever names the object
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditRecord {
    pub fn new(category: AuditCategory, source: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            category,
            source: source.into(),
            action: action.into(),
            outcome: AuditOutcome::Pending,
            object_type: None,
            object_id: None,
            details: None,
            error: None,
        }
    }

    pub fn with_outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn with_object_type(mut self, object_type: impl Into<String>) -> Self {
        self.object_type = Some(object_type.into());
        self
    }

    pub fn with_object_id(mut self, id: impl ToString) -> Self {
        self.object_id = Some(id.to_string());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Implies [`AuditOutcome::Failure`].
    pub fn with_error(mut self, error: impl fmt::Display) -> Self {
        self.error = Some(error.to_string());
        self.outcome = AuditOutcome::Failure;
        self
    }

    /// "source/action object_type:object_id"
    pub fn subject(&self) -> String {
        let mut s = format!("{}/{}", self.source, self.action);
        match (&self.object_type, &self.object_id) {
            (Some(t), Some(id)) => s.push_str(&format!(" {}:{}", t, id)),
            (Some(t), None) => s.push_str(&format!(" {}", t)),
            (None, Some(id)) => s.push_str(&format!(" {}", id)),
            (None, None) => {}
        }
        s
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!(r#"{{"audit_error":"{}"}}"#, e))
    }
}

/// Writes `record` on the `audit` target: failures at warn, successes at
/// info, pending records at debug.
pub fn emit(record: &AuditRecord) {
    let json = record.to_json();
    match record.outcome {
        AuditOutcome::Failure => tracing::warn!(
            target: "audit",
            category = %record.category,
            error = record.error.as_deref().unwrap_or(""),
            audit_json = %json,
            "Audit: {} {} failed",
            record.category,
            record.subject()
        ),
        AuditOutcome::Success => tracing::info!(
            target: "audit",
            category = %record.category,
            audit_json = %json,
            "Audit: {} {}",
            record.category,
            record.subject()
        ),
        AuditOutcome::Pending => tracing::debug!(
            target: "audit",
            category = %record.category,
            audit_json = %json,
            "Audit: {} {} pending",
            record.category,
            record.subject()
        ),
    }
}

/// ```ignore
/// audit_log!(AuditRecord::new(AuditCategory::ResourceCreate, "BondManager", "create_lag")
///     .with_outcome(AuditOutcome::Success)
///     .with_object_id(lag));
/// ```
#[macro_export]
macro_rules! audit_log {
    ($record:expr) => {
        $crate::audit::emit(&$record)
    };
}

/// JSON `tracing` output for `--json-logs`. `RUST_LOG` wins over `log_level`.
pub fn init_logging(log_level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true).with_target(true))
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_builder_defaults_to_pending() {
        let record = AuditRecord::new(AuditCategory::ResourceCreate, "BondManager", "create_lag");
        assert_eq!(record.outcome, AuditOutcome::Pending);
        assert_eq!(record.subject(), "BondManager/create_lag");
    }

    #[test]
    fn test_error_marks_failure() {
        let record = AuditRecord::new(AuditCategory::ErrorCondition, "SyncEngine", "hardware_error")
            .with_object_type("tunnel_endpoint")
            .with_object_id(0x1c00_0001u32)
            .with_error("table full");

        assert_eq!(record.outcome, AuditOutcome::Failure);
        assert_eq!(record.error.as_deref(), Some("table full"));
        assert_eq!(record.subject(), "SyncEngine/hardware_error tunnel_endpoint:469762049");
    }

    #[test]
    fn test_json_omits_empty_fields() {
        let record = AuditRecord::new(AuditCategory::SystemLifecycle, "SyncEngine", "shutdown")
            .with_outcome(AuditOutcome::Failure)
            .with_details(serde_json::json!({ "reason": "kernel feed lost" }));

        let value: serde_json::Value = serde_json::from_str(&record.to_json()).unwrap();
        assert_eq!(value["category"], "system_lifecycle");
        assert_eq!(value["outcome"], "failure");
        assert_eq!(value["details"]["reason"], "kernel feed lost");
        assert!(value.get("object_id").is_none());
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_display_matches_serde() {
        for category in [
            AuditCategory::ResourceCreate,
            AuditCategory::ResourceDelete,
            AuditCategory::SystemLifecycle,
            AuditCategory::NetworkConfig,
            AuditCategory::ErrorCondition,
        ] {
            let json = serde_json::to_string(&category).unwrap();
            assert_eq!(json, format!("\"{}\"", category));
        }
    }
}
