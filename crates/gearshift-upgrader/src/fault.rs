use std::any::Any;

use serde::Serialize;
use thiserror::Error;

/// A cartridge or gear command that exited non-zero where success was required.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ShellError {
    pub message: String,
    pub rc: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Error)]
pub enum Fault {
    #[error("{0}")]
    Precondition(String),
    #[error("{0}")]
    Extension(String),
    #[error("{message}")]
    Execution { message: String, trace: String },
    #[error("{}", .error.message)]
    Shell { error: ShellError, trace: String },
    #[error("{0}")]
    SoftWarning(String),
}

impl Fault {
    pub fn status_code(&self) -> i32 {
        match self {
            Self::Precondition(_) | Self::SoftWarning(_) => 0,
            Self::Extension(_) => 127,
            Self::Execution { .. } | Self::Shell { .. } => 1,
        }
    }

    /// Classifies an error escaping the main sequence, keeping shell details
    /// when a `ShellError` is anywhere in the chain.
    pub fn from_error(err: &anyhow::Error) -> Self {
        let trace = format!("{err:?}");
        match err.chain().find_map(|cause| cause.downcast_ref::<ShellError>()) {
            Some(shell) => Self::Shell {
                error: ShellError {
                    message: format!("{err:#}"),
                    ..shell.clone()
                },
                trace,
            },
            None => Self::Execution {
                message: format!("{err:#}"),
                trace,
            },
        }
    }

    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = panic_message(payload.as_ref());
        Self::Execution {
            trace: format!("panic: {message}"),
            message,
        }
    }

    pub fn to_record(&self) -> ErrorRecord {
        match self {
            Self::Shell { error, trace } => ErrorRecord {
                rc: Some(error.rc),
                stdout: Some(error.stdout.clone()),
                stderr: Some(error.stderr.clone()),
                message: error.message.clone(),
                trace: trace.clone(),
            },
            Self::Execution { message, trace } => ErrorRecord {
                rc: None,
                stdout: None,
                stderr: None,
                message: message.clone(),
                trace: trace.clone(),
            },
            other => ErrorRecord {
                rc: None,
                stdout: None,
                stderr: None,
                message: other.to_string(),
                trace: String::new(),
            },
        }
    }
}

pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rc: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    pub message: String,
    pub trace: String,
}
