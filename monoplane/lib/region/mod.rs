//! Region definitions and their per-region endpoint credentials.

mod registry;
mod types;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use registry::*;
pub use types::*;
