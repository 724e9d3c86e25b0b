//! The `{status, message, details}` envelope handed to the index layer.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::pipeline::{BuildFailure, BuildResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub status: CommandStatus,
    pub message: String,
    #[serde(default)]
    pub details: Value,
}

impl ExecutionOutcome {
    pub fn success(message: impl Into<String>, details: Value) -> Self {
        Self {
            status: CommandStatus::Ok,
            message: message.into(),
            details,
        }
    }

    pub fn failure(message: impl Into<String>, details: Value) -> Self {
        Self {
            status: CommandStatus::Failure,
            message: message.into(),
            details,
        }
    }

    pub fn user_error(message: impl Into<String>, details: Value) -> Self {
        Self {
            status: CommandStatus::UserError,
            message: message.into(),
            details,
        }
    }
}

impl From<&BuildResult> for ExecutionOutcome {
    fn from(result: &BuildResult) -> Self {
        let details = serde_json::to_value(result).unwrap_or_else(|_| json!({}));
        Self::success(result.message.clone(), details)
    }
}

impl From<&BuildFailure> for ExecutionOutcome {
    fn from(failure: &BuildFailure) -> Self {
        if failure.is_user_error() {
            Self::user_error(failure.to_string(), failure.details())
        } else {
            Self::failure(failure.to_string(), failure.details())
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Ok,
    UserError,
    Failure,
}

impl CommandStatus {
    /// Process exit code for this status.
    #[must_use]
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::UserError => 1,
            Self::Failure => 2,
        }
    }
}
