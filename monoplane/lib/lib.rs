//! `monoplane` is the control plane of an ephemeral-compute platform.
//!
//! # Overview
//!
//! monoplane places short-lived sandboxes onto a fleet of remote runners spread across regions.
//! It handles:
//! - Runner registration, health checking and capacity accounting
//! - Sandbox placement and the sandbox lifecycle state machine
//! - Snapshot builds, registry pushes and cross-region replication
//! - Region definitions and rotating per-region endpoint credentials
//!
//! # Architecture
//!
//! monoplane consists of several key components, leaves first:
//!
//! - **Region Registry**: regions and their endpoint credentials
//! - **Fleet Manager**: runners, health loops, placement, and the runner adapters
//! - **Snapshot Pipeline**: snapshot builds, replication and registry artifacts
//! - **Orchestrator**: the sandbox lifecycle, migration, backup and restore
//!
//! Every component reaches the store through the repository functions in [`db`].
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use monoplane::{bootstrap, config::MonoplaneConfig, Services};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = MonoplaneConfig::load("/etc/monoplane/monoplane.toml").await?;
//!     let services = Services::open(&config, "/var/lib/monoplane").await?;
//!
//!     bootstrap::bootstrap(&services, &config).await?;
//!
//!     services.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`bootstrap`] - Idempotent startup routine
//! - [`cli`] - Command-line interface and argument parsing
//! - [`config`] - Configuration types and defaults
//! - [`db`] - Schema migrations and repository functions
//! - [`fleet`] - Runner fleet management and runner adapters
//! - [`orchestration`] - Sandbox lifecycle management
//! - [`region`] - Region registry
//! - [`snapshot`] - Snapshot pipeline and registry providers
//! - [`utils`] - Common utilities and helpers

#![warn(missing_docs)]

mod error;
mod services;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod bootstrap;
pub mod cli;
pub mod config;
pub mod db;
pub mod fleet;
pub mod models;
pub mod orchestration;
pub mod region;
pub mod snapshot;
pub mod utils;

pub use error::*;
pub use services::*;
