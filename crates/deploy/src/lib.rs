//! Deployment of installed plugins: command generation, sequential execution
//! in the sandbox, and the per-plugin deployment state machine.

pub mod commands;
pub mod deployer;
pub mod error;
pub mod runner;

pub use {
    commands::{CommandGenerator, DeployPlan, ManifestCommandGenerator},
    deployer::{DeployEvent, DeployRequest, Deployer},
    error::{DeployError, Result},
    runner::{CommandOutcome, CommandRunner, OutputLine, OutputStream, ShellRunner},
};
