use std::fmt;

use crate::config::ConfigError;
use crate::orchestrator::{FailureReason, SessionReport};

/// Top-level error carrying the process exit code
#[derive(Debug)]
pub enum FormpilotError {
    /// Session ended in FAILED (exit code 2)
    SessionFailed {
        url: String,
        reason: Option<FailureReason>,
    },
    /// Configuration rejected (exit code 3)
    InvalidConfig(String),
    /// WebDriver connection failed (exit code 4)
    WebDriverFailed(String),
    /// Operation timeout (exit code 5)
    Timeout(String),
    /// Generic error (exit code 1)
    Other(anyhow::Error),
}

impl FormpilotError {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            FormpilotError::SessionFailed { .. } => 2,
            FormpilotError::InvalidConfig(_) => 3,
            FormpilotError::WebDriverFailed(_) => 4,
            FormpilotError::Timeout(_) => 5,
            FormpilotError::Other(_) => 1,
        }
    }

    /// The error for a report that did not complete, if any
    pub fn from_report(report: &SessionReport) -> Option<Self> {
        (!report.is_complete()).then(|| FormpilotError::SessionFailed {
            url: report.url.clone(),
            reason: report.failure,
        })
    }
}

impl fmt::Display for FormpilotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormpilotError::SessionFailed { url, reason } => match reason {
                Some(reason) => write!(f, "Session on {} failed: {:?}", url, reason),
                None => write!(f, "Session on {} failed", url),
            },
            FormpilotError::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
            FormpilotError::WebDriverFailed(msg) => {
                write!(f, "WebDriver connection failed: {}", msg)
            }
            FormpilotError::Timeout(msg) => write!(f, "Operation timed out: {}", msg),
            FormpilotError::Other(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for FormpilotError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FormpilotError::Other(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for FormpilotError {
    fn from(err: anyhow::Error) -> Self {
        let err = match err.downcast::<FormpilotError>() {
            Ok(formpilot_err) => return formpilot_err,
            Err(err) => err,
        };
        if let Some(config_err) = err.downcast_ref::<ConfigError>() {
            return FormpilotError::InvalidConfig(config_err.to_string());
        }

        // Otherwise classify by message
        let msg = format!("{:#}", err);
        if msg.contains("Failed to connect to WebDriver")
            || msg.contains("WebDriver")
            || msg.contains("geckodriver")
            || msg.contains("chromedriver")
        {
            FormpilotError::WebDriverFailed(msg)
        } else if msg.contains("timeout") || msg.contains("timed out") {
            FormpilotError::Timeout(msg)
        } else if msg.contains("Invalid configuration") || msg.contains("Failed to parse config") {
            FormpilotError::InvalidConfig(msg)
        } else {
            FormpilotError::Other(err)
        }
    }
}
