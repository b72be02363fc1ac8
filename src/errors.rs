use serde::Serialize;
use std::fmt;

/// Error surface of the orchestration core.
///
/// Interactive operations (`spawn`, `reserve`) surface these synchronously;
/// teardown paths (`kill_all`, `stop`, cleanup sweeps) log and swallow them.
#[derive(Debug, Serialize, Clone)]
#[serde(tag = "type", content = "data")]
pub enum CoreError {
    ServerNotReady,
    Spawn {
        command: String,
        message: String,
    },
    Reservation {
        repository: String,
        message: String,
    },
    CorrelationMiss {
        token: String,
    },
    TerminationTimeout {
        session_id: String,
        grace_ms: u64,
    },
    SessionNotFound {
        session_id: String,
    },
    GitOperationFailed {
        operation: String,
        message: String,
    },
    IoError {
        operation: String,
        path: String,
        message: String,
    },
    InvalidInput {
        field: String,
        message: String,
    },
}

impl CoreError {
    pub fn spawn(command: &str, error: impl ToString) -> Self {
        CoreError::Spawn {
            command: command.to_string(),
            message: error.to_string(),
        }
    }

    pub fn reservation(repository: impl ToString, error: impl ToString) -> Self {
        CoreError::Reservation {
            repository: repository.to_string(),
            message: error.to_string(),
        }
    }

    pub fn git(operation: &str, error: impl ToString) -> Self {
        CoreError::GitOperationFailed {
            operation: operation.to_string(),
            message: error.to_string(),
        }
    }

    pub fn io(operation: &str, path: impl ToString, error: impl ToString) -> Self {
        CoreError::IoError {
            operation: operation.to_string(),
            path: path.to_string(),
            message: error.to_string(),
        }
    }

    pub fn invalid_input(field: &str, message: impl ToString) -> Self {
        CoreError::InvalidInput {
            field: field.to_string(),
            message: message.to_string(),
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::ServerNotReady => {
                write!(
                    f,
                    "Hook server is not listening; sessions cannot be spawned yet"
                )
            }
            Self::Spawn { command, message } => {
                write!(f, "Failed to spawn session process '{command}': {message}")
            }
            Self::Reservation {
                repository,
                message,
            } => {
                write!(f, "Worktree reservation failed for '{repository}': {message}")
            }
            Self::CorrelationMiss { token } => {
                write!(f, "Hook event carried unknown correlation token '{token}'")
            }
            Self::TerminationTimeout {
                session_id,
                grace_ms,
            } => {
                write!(
                    f,
                    "Session '{session_id}' did not stop within {grace_ms}ms grace period"
                )
            }
            Self::SessionNotFound { session_id } => {
                write!(f, "Session '{session_id}' not found")
            }
            Self::GitOperationFailed { operation, message } => {
                write!(f, "Git operation '{operation}' failed: {message}")
            }
            Self::IoError {
                operation,
                path,
                message,
            } => {
                write!(f, "I/O error during '{operation}' on '{path}': {message}")
            }
            Self::InvalidInput { field, message } => {
                write!(f, "Invalid input for field '{field}': {message}")
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<CoreError> for String {
    fn from(error: CoreError) -> Self {
        error.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_grace_period_for_termination_timeout() {
        let err = CoreError::TerminationTimeout {
            session_id: "s-1".into(),
            grace_ms: 2000,
        };
        assert!(err.to_string().contains("2000ms"));
    }

    #[test]
    fn serializes_with_type_tag() {
        let err = CoreError::ServerNotReady;
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["type"], "ServerNotReady");
    }
}
