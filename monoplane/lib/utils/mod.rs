//! Utility functions and types.

mod env;
mod http;
mod lock;
mod path;
mod retry;
mod secret;
mod validate;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use env::*;
pub use http::*;
pub use lock::*;
pub use path::*;
pub use retry::*;
pub use secret::*;
pub use validate::*;
