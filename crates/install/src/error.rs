use std::error::Error as StdError;

use {
    mcpdock_common::{FromMessage, InvalidPluginId, PluginId},
    mcpdock_store::StoreError,
};

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("network failure: {message}")]
    NetworkFailure { message: String },
    #[error("invalid archive: {reason}")]
    ArchiveInvalid { reason: String },
    #[error("plugin '{id}' is already installed")]
    IdConflict { id: PluginId },
    #[error("invalid plugin source '{input}': expected 'owner/repo' or a GitHub URL")]
    InvalidSource { input: String },
    #[error(transparent)]
    InvalidId(#[from] InvalidPluginId),
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{message}")]
    Message { message: String },
    #[error("{context}: {source}")]
    External {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

impl InstallError {
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkFailure {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn archive(reason: impl Into<String>) -> Self {
        Self::ArchiveInvalid {
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

impl From<StoreError> for InstallError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::IdConflict { id } => Self::IdConflict { id },
            other => Self::Store(other),
        }
    }
}

impl From<reqwest::Error> for InstallError {
    fn from(err: reqwest::Error) -> Self {
        Self::network(err.to_string())
    }
}

impl FromMessage for InstallError {
    fn from_message(message: String) -> Self {
        Self::Message { message }
    }
}

pub type Result<T> = std::result::Result<T, InstallError>;

mcpdock_common::impl_context!(InstallError);
