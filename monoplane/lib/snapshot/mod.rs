//! Snapshot builds, cross-region replication and registry artifacts.

mod pipeline;
mod provider;
mod resolver;
mod types;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use pipeline::*;
pub use provider::*;
pub use resolver::*;
pub use types::*;
