mod registry;
mod types;

pub use registry::{ConnectionManager, SweepOutcome};
pub use types::{ConnectionError, ConnectionHandle, ConnectionLimits, ConnectionOrigin};
