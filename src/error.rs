use thiserror::Error;

use crate::data_quality::GateReport;
use crate::temporal::EntityId;

/// Failures surfaced by the merge engine, the in-memory table and the quality gate.
///
/// None of these are retried internally. `InputIntegrity` means the snapshot must be
/// fixed upstream, `InvariantViolation` means the historized table was already
/// corrupt, and `QualityGateFailure` means the post-merge table failed a blocking
/// check.
#[derive(Debug, Error)]
pub enum ScdError {
    #[error("input integrity error: {message}")]
    InputIntegrity {
        entity_id: Option<EntityId>,
        message: String,
    },
    #[error("invariant violation for entity {entity_id}: {message}")]
    InvariantViolation { entity_id: EntityId, message: String },
    #[error(
        "quality gate failed: {} error finding(s), {} warning(s)",
        .report.error_count(),
        .report.warning_count()
    )]
    QualityGateFailure { report: Box<GateReport> },
}

impl ScdError {
    pub fn input(message: impl Into<String>) -> Self {
        Self::InputIntegrity {
            entity_id: None,
            message: message.into(),
        }
    }

    pub fn input_for(entity_id: &EntityId, message: impl Into<String>) -> Self {
        Self::InputIntegrity {
            entity_id: Some(entity_id.clone()),
            message: format!("entity {}: {}", entity_id, message.into()),
        }
    }

    pub fn invariant(entity_id: &EntityId, message: impl Into<String>) -> Self {
        Self::InvariantViolation {
            entity_id: entity_id.clone(),
            message: message.into(),
        }
    }

    pub fn gate_failure(report: GateReport) -> Self {
        Self::QualityGateFailure {
            report: Box::new(report),
        }
    }

    /// Stable name of the error kind, used in logs and the audit trail.
    pub fn kind(&self) -> &'static str {
        match self {
            ScdError::InputIntegrity { .. } => "InputIntegrityError",
            ScdError::InvariantViolation { .. } => "InvariantViolationError",
            ScdError::QualityGateFailure { .. } => "QualityGateFailure",
        }
    }

    pub fn entity_id(&self) -> Option<&EntityId> {
        match self {
            ScdError::InputIntegrity { entity_id, .. } => entity_id.as_ref(),
            ScdError::InvariantViolation { entity_id, .. } => Some(entity_id),
            ScdError::QualityGateFailure { .. } => None,
        }
    }

    pub fn report(&self) -> Option<&GateReport> {
        match self {
            ScdError::QualityGateFailure { report } => Some(report.as_ref()),
            _ => None,
        }
    }
}

pub type ScdResult<T> = Result<T, ScdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_for_names_entity() {
        let err = ScdError::input_for(&EntityId::new("42"), "duplicate entity_id in snapshot");

        assert_eq!(err.kind(), "InputIntegrityError");
        assert_eq!(err.entity_id(), Some(&EntityId::new("42")));
        assert!(err.to_string().contains("entity 42"));
    }

    #[test]
    fn test_invariant_display() {
        let err = ScdError::invariant(&EntityId::new("7"), "2 current versions");

        assert_eq!(err.kind(), "InvariantViolationError");
        assert_eq!(
            err.to_string(),
            "invariant violation for entity 7: 2 current versions"
        );
        assert!(err.report().is_none());
    }
}
