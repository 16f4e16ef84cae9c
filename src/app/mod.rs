//! Headless application runtime.

mod state;

pub use state::{AppState, ReceivedFile};
