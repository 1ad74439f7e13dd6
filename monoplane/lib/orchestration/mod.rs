//! Sandbox lifecycle orchestration across the runner fleet.

mod backup;
mod down;
mod events;
mod migrate;
mod orchestrator;
mod status;
mod up;
mod utils;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use orchestrator::*;
