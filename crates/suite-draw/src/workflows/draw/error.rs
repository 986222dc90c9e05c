use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;
use tracing::error;

use super::domain::{DrawAction, DrawId, DrawPhase, GroupId, SuiteSize};
use super::repository::RepositoryError;

/// Operation requested in a phase that does not allow it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GuardViolation {
    #[error("cannot {} while the draw is in the {} phase", .action.label(), .phase.label())]
    WrongPhase { action: DrawAction, phase: DrawPhase },
    #[error("all groups must have lottery numbers assigned ({unnumbered} still without one)")]
    LotteryIncomplete { unnumbered: usize },
}

impl GuardViolation {
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::WrongPhase { .. } => "wrong_phase",
            Self::LotteryIncomplete { .. } => "lottery_incomplete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    GuardViolation,
    ValidationFailure,
    StaleEligibility,
    Conflict,
    NotFound,
    Persistence,
}

/// Error raised by the draw lifecycle and the engines behind it.
#[derive(Debug, thiserror::Error)]
pub enum DrawError {
    #[error(transparent)]
    Guard(#[from] GuardViolation),
    #[error("{}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("group {group} is not up yet: lottery number {ahead} selects size {size} first")]
    StaleEligibility {
        group: GroupId,
        size: SuiteSize,
        ahead: u32,
    },
    #[error("{0}")]
    Conflict(String),
    #[error("draw {0} not found")]
    NotFound(DrawId),
    #[error(transparent)]
    Persistence(RepositoryError),
}

impl DrawError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::Validation(vec![message.into()])
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Guard(_) => FailureKind::GuardViolation,
            Self::Validation(_) => FailureKind::ValidationFailure,
            Self::StaleEligibility { .. } => FailureKind::StaleEligibility,
            Self::Conflict(_) => FailureKind::Conflict,
            Self::NotFound(_) => FailureKind::NotFound,
            Self::Persistence(_) => FailureKind::Persistence,
        }
    }

    /// Every message the caller should render; validation failures keep one entry per rule.
    pub fn messages(&self) -> Vec<String> {
        match self {
            Self::Validation(messages) => messages.clone(),
            other => vec![other.to_string()],
        }
    }

    /// Safe to retry once eligibility or the draw snapshot has been re-read.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StaleEligibility { .. } | Self::Conflict(_))
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::Guard(_) | Self::StaleEligibility { .. } | Self::Conflict(_) => {
                StatusCode::CONFLICT
            }
            Self::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<RepositoryError> for DrawError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::VersionMismatch { .. } => {
                Self::Conflict(format!("{value}; reload the draw and retry"))
            }
            other => Self::Persistence(other),
        }
    }
}

impl IntoResponse for DrawError {
    fn into_response(self) -> Response {
        if let Self::Persistence(source) = &self {
            error!(error = %source, "draw commit failed");
        }

        let mut body = json!({
            "kind": self.kind(),
            "messages": self.messages(),
            "retryable": self.is_retryable(),
        });
        if let Self::Guard(violation) = &self {
            body["reason"] = json!(violation.reason());
        }

        (self.status(), Json(body)).into_response()
    }
}
