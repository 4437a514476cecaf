//! The plugin hub: reconciles declared, discovered and remote plugins into one
//! ordered view and composes the store, installer, deployer and bridge behind
//! a single context object.

pub mod reconcile;
pub mod repository;

pub use {
    reconcile::{OrderCache, OrderKey, Readiness, display_order, visible_ids},
    repository::{PluginRepository, PluginView},
};
