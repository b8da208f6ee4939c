//! Uptime analysis over ping logs.

mod incidents;
mod summary;

pub use incidents::*;
pub use summary::*;
