use std::error::Error as StdError;

use {
    mcpdock_common::{FailureReason, FromMessage, PluginId},
    mcpdock_install::InstallError,
    mcpdock_store::StoreError,
};

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("plugin '{id}' has no recognizable manifest")]
    MissingManifest { id: PluginId },
    #[error("missing required env: {}", names.join(", "))]
    MissingRequiredEnv { names: Vec<String> },
    #[error("`{command}` exited with code {exit_code}\n{output}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        output: String,
    },
    #[error("deployment cancelled")]
    Cancelled,
    #[error("plugin '{id}' is already deploying")]
    AlreadyDeploying { id: PluginId },
    #[error("plugin '{id}' is not installed")]
    NotInstalled { id: PluginId },
    #[error("plugin '{id}' is remote and cannot be deployed")]
    NotDeployable { id: PluginId },
    #[error(transparent)]
    Install(#[from] InstallError),
    #[error(transparent)]
    Store(#[from] StoreError),
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

impl DeployError {
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

    /// The failure recorded in the deployment state for this error.
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            Self::MissingManifest { .. } => FailureReason::MissingManifest,
            Self::MissingRequiredEnv { names } => FailureReason::MissingRequiredEnv {
                names: names.clone(),
            },
            Self::CommandFailed {
                command, exit_code, ..
            } => FailureReason::CommandFailed {
                command: command.clone(),
                exit_code: *exit_code,
            },
            Self::Cancelled => FailureReason::Cancelled,
            other => FailureReason::Spawn {
                message: other.to_string(),
            },
        }
    }
}

impl FromMessage for DeployError {
    fn from_message(message: String) -> Self {
        Self::Message { message }
    }
}

pub type Result<T> = std::result::Result<T, DeployError>;

mcpdock_common::impl_context!(DeployError);
