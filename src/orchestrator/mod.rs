//! Application-level orchestration.
//!
//! This module owns the run registry and the controller task that UI/CLI layers talk to
//! over channels, keeping process supervision out of presentation code.

mod controller;
mod registry;

pub(crate) use controller::{run_controller, UiCommand};
pub use registry::RunRegistry;
