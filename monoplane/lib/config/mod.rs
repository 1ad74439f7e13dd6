//! Configuration types and helpers.

mod defaults;
mod monoplane;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use defaults::*;
pub use monoplane::*;
