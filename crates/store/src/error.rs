use std::error::Error as StdError;

use mcpdock_common::{FromMessage, InvalidPluginId, PluginId};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The supplied document could not be parsed or has the wrong shape.
    /// The store is untouched when this is returned.
    #[error("invalid config document: {reason}")]
    ConfigParse { reason: String },
    #[error("plugin '{id}' already exists")]
    IdConflict { id: PluginId },
    #[error("plugin '{id}' not found")]
    NotFound { id: PluginId },
    #[error("plugin '{id}' is not a remote server")]
    NotRemote { id: PluginId },
    #[error(transparent)]
    InvalidId(#[from] InvalidPluginId),
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

impl StoreError {
    #[must_use]
    pub fn config_parse(reason: impl Into<String>) -> Self {
        Self::ConfigParse {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
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
}

impl FromMessage for StoreError {
    fn from_message(message: String) -> Self {
        Self::Message { message }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

mcpdock_common::impl_context!(StoreError);
