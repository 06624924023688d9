//! Shared utilities.

pub mod clock;
pub mod shutdown;
pub mod telemetry;

pub use clock::*;
pub use shutdown::Shutdown;
pub use telemetry::*;
