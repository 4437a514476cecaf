use std::{error::Error as StdError, time::Duration};

use mcpdock_common::{FromMessage, PluginId};

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("'{method}' timed out after {}s", after.as_secs_f32())]
    Timeout { method: String, after: Duration },
    #[error("cannot reach {endpoint}: {message}")]
    Unreachable { endpoint: String, message: String },
    #[error("{endpoint} rejected the credentials (HTTP {status})")]
    AuthRejected { endpoint: String, status: u16 },
    #[error("protocol error: {message}")]
    Protocol { message: String },
    #[error("plugin '{id}' is not running")]
    NotRunning { id: PluginId },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("{message}")]
    Message { message: String },
    #[error("{context}: {source}")]
    External {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

impl BridgeError {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn external<E>(context: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::External {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Classify a failed HTTP exchange with `endpoint`.
    pub(crate) fn from_http(endpoint: &str, method: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                method: method.to_string(),
                after: Duration::ZERO,
            }
        } else if err.is_connect() || err.is_request() {
            Self::Unreachable {
                endpoint: endpoint.to_string(),
                message: err.to_string(),
            }
        } else {
            Self::external(format!("'{method}' to {endpoint} failed"), err)
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl FromMessage for BridgeError {
    fn from_message(message: String) -> Self {
        Self::Message { message }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

mcpdock_common::impl_context!(BridgeError);
