//! Runner fleet management.
//!
//! The [`FleetManager`] owns runner registration, periodic health checks, capacity accounting and
//! placement. Runners are reached through a [`RunnerAdapter`], built per protocol generation by
//! an [`AdapterFactory`].

mod adapter;
mod adapters;
mod health;
mod manager;
mod placement;
mod types;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use adapter::*;
pub use adapters::*;
pub use manager::*;
pub use placement::*;
pub use types::*;
