use super::cloud::CloudApiError;
use cloudrow_schema::SchemaError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error as ThisError;

/// One record that could not be reconciled, with its cause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFailure {
    pub entity_type: String,
    /// Identity key of the record (`*` when the whole entity type failed).
    pub key: String,
    /// Attempted action: create, update, replace, delete, read or write.
    pub action: String,
    pub cause: String,
}

impl fmt::Display for RecordFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({}): {}",
            self.entity_type, self.key, self.action, self.cause
        )
    }
}

fn bullet_list(failures: &[RecordFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("\n- {f}"))
        .collect::<String>()
}

#[derive(Debug, ThisError)]
pub enum CloudrowError {
    #[error("dependency cycle between modules: {}", participants.join(", "))]
    DependencyCycle { participants: Vec<String> },

    #[error("the following modules do not exist: {}", names.join(", "))]
    UnknownModule { names: Vec<String> },

    #[error("cannot uninstall {module}: still required by enabled module(s) {}", dependents.join(", "))]
    DependentModuleStillEnabled {
        module: String,
        dependents: Vec<String>,
    },

    #[error("cannot enable {module}: dependencies not enabled: {}", dependencies.join(", "))]
    DependencyNotEnabled {
        module: String,
        dependencies: Vec<String>,
    },

    #[error("module {0} is not installed")]
    ModuleNotInstalled(String),

    #[error("module {0} is installed but not enabled")]
    ModuleNotEnabled(String),

    #[error("module {module} collides with existing tables: {}", tables.join(", "))]
    TableCollision { module: String, tables: Vec<String> },

    #[error("module {module} has no rpc named {method}")]
    UnknownRpc { module: String, method: String },

    #[error("invalid module definition: {0}")]
    InvalidModule(String),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Cloud(#[from] CloudApiError),

    #[error("reconciliation conflict on {entity_type} {key}: {reason}")]
    ReconciliationConflict {
        entity_type: String,
        key: String,
        reason: String,
    },

    #[error("reconciliation failed for {} record(s):{}", failures.len(), bullet_list(failures))]
    Reconciliation { failures: Vec<RecordFailure> },

    #[error(
        "operation timed out after {elapsed:?}; {skipped} action(s) not started{}",
        bullet_list(failures)
    )]
    OperationTimeout {
        elapsed: Duration,
        skipped: usize,
        failures: Vec<RecordFailure>,
    },

    #[error("target {target} already has operation {running_opid} ({running_kind}) in flight")]
    ConcurrentOperation {
        target: String,
        running_opid: String,
        running_kind: String,
    },

    #[error("no cloud account configured for this target")]
    MissingAccount,

    #[error("invalid {entity_type} record: {message}")]
    InvalidRecord {
        entity_type: String,
        message: String,
    },

    #[error("invalid target name: {0}")]
    InvalidTarget(String),

    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Ractor error: {0}")]
    RactorError(String),

    #[error("Unexpected error: {0}")]
    UnexpectedError(String),
}

impl CloudrowError {
    /// Human-readable lines for the operation log: one per failed record when the error
    /// aggregates several, otherwise the error itself.
    pub fn message_lines(&self) -> Vec<String> {
        match self {
            CloudrowError::Reconciliation { failures } => {
                let mut lines = vec![format!(
                    "reconciliation failed for {} record(s)",
                    failures.len()
                )];
                lines.extend(failures.iter().map(ToString::to_string));
                lines
            }
            CloudrowError::OperationTimeout {
                elapsed,
                skipped,
                failures,
            } => {
                let mut lines = vec![format!(
                    "operation timed out after {elapsed:?}; {skipped} action(s) not started"
                )];
                lines.extend(failures.iter().map(ToString::to_string));
                lines
            }
            other => vec![other.to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(key: &str) -> RecordFailure {
        RecordFailure {
            entity_type: "subnet".into(),
            key: key.into(),
            action: "create".into(),
            cause: "cloud API rejected the request: bad cidr".into(),
        }
    }

    #[test]
    fn aggregate_names_every_record() {
        let err = CloudrowError::Reconciliation {
            failures: vec![failure("us-east-1|a"), failure("us-east-1|b")],
        };
        let text = err.to_string();
        assert!(text.starts_with("reconciliation failed for 2 record(s):"));
        assert!(text.contains("subnet us-east-1|a (create)"));
        assert!(text.contains("subnet us-east-1|b (create)"));
        assert_eq!(err.message_lines().len(), 3);
    }

    #[test]
    fn single_line_for_plain_errors() {
        let err = CloudrowError::UnknownModule {
            names: vec!["dns".into()],
        };
        assert_eq!(
            err.message_lines(),
            ["the following modules do not exist: dns"]
        );
    }
}
