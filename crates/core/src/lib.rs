pub mod aggregator;
pub mod coordinator;
pub mod error;
pub mod generic_types;
pub mod instructions;
pub mod messages;
pub mod persistence;
pub mod realtime_api;
pub mod scoring;
pub mod session_state;
pub mod settings;
pub mod supervisor;

#[cfg(test)]
mod fakes;

pub use coordinator::{CoordinatorState, SessionCoordinator, SessionDeps};
pub use error::{Error, Result};
pub use settings::SessionSettings;
