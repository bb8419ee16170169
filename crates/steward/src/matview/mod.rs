pub mod refresh;
pub mod registry;

pub use refresh::{RefreshEngine, RefreshOutcome};
pub use registry::{MatviewEntry, MatviewStore, RefreshMode};
