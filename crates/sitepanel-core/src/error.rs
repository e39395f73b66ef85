//! Error taxonomy for registry loading, rendering and orchestration.

use crate::dispatch::DispatchError;
use crate::template::TemplateError;

/// Site Panel errors.
///
/// Registry errors (`MalformedTemplate`, `DuplicateRole`) are fatal at startup.
/// Everything else is scoped to one orchestration session.
#[derive(Debug, thiserror::Error)]
pub enum PanelError {
    #[error("role {role_id} has a malformed input template: {detail}")]
    MalformedTemplate { role_id: String, detail: String },

    #[error("role {role_id} is already registered")]
    DuplicateRole { role_id: String },

    #[error("unknown role: {role_id}")]
    UnknownRole { role_id: String },

    #[error("role {role_id} is missing fields: {}", fields.join(", "))]
    MissingField { role_id: String, fields: Vec<String> },

    #[error("role {role_id} does not accept fields: {}", fields.join(", "))]
    UnexpectedField { role_id: String, fields: Vec<String> },

    #[error("dispatch for role {role_id} failed: {source}")]
    Dispatch {
        role_id: String,
        #[source]
        source: DispatchError,
    },

    #[error("opinion set incomplete, missing: {}", missing.join(", "))]
    IncompleteOpinionSet { missing: Vec<String> },

    #[error("opinion for role {role_id} was already recorded")]
    DuplicateOpinion { role_id: String },

    #[error("invalid session transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("site id {site_id} appears more than once")]
    DuplicateSite { site_id: String },

    #[error("site id {site_id:?} is not usable as a file name: {reason}")]
    InvalidSiteId { site_id: String, reason: String },

    #[error("a process-wide role registry is already installed")]
    RegistryAlreadyInstalled,

    #[error("config error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PanelError {
    pub(crate) fn malformed(role_id: &str, err: TemplateError) -> Self {
        PanelError::MalformedTemplate {
            role_id: role_id.to_string(),
            detail: err.to_string(),
        }
    }

    /// Role id the error is attributed to, when there is one.
    pub fn role_id(&self) -> Option<&str> {
        match self {
            PanelError::MalformedTemplate { role_id, .. }
            | PanelError::DuplicateRole { role_id }
            | PanelError::UnknownRole { role_id }
            | PanelError::MissingField { role_id, .. }
            | PanelError::UnexpectedField { role_id, .. }
            | PanelError::Dispatch { role_id, .. }
            | PanelError::DuplicateOpinion { role_id } => Some(role_id),
            _ => None,
        }
    }
}

/// Result type for Site Panel operations.
pub type PanelResult<T> = std::result::Result<T, PanelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_field_lists_every_name() {
        let err = PanelError::MissingField {
            role_id: "explorer".to_string(),
            fields: vec!["ndvi".to_string(), "slope_deg".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("explorer"));
        assert!(msg.contains("ndvi, slope_deg"));
        assert_eq!(err.role_id(), Some("explorer"));
    }

    #[test]
    fn test_dispatch_error_carries_role_and_cause() {
        let err = PanelError::Dispatch {
            role_id: "skeptic".to_string(),
            source: DispatchError::Timeout { after_ms: 1500 },
        };
        let msg = err.to_string();
        assert!(msg.contains("skeptic"));
        assert!(msg.contains("1500"));
    }

    #[test]
    fn test_site_errors_name_the_site() {
        let err = PanelError::DuplicateSite {
            site_id: "site_000".to_string(),
        };
        assert!(err.to_string().contains("site_000"));
        assert!(err.role_id().is_none());
    }

    #[test]
    fn test_incomplete_opinion_set_has_no_role() {
        let err = PanelError::IncompleteOpinionSet {
            missing: vec!["historian".to_string()],
        };
        assert!(err.to_string().contains("historian"));
        assert!(err.role_id().is_none());
    }
}
