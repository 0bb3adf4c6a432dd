//! Mocks and fixtures shared by the AGIR crates' tests.

pub mod fixtures;
pub mod provider;
pub mod store;

pub use fixtures::{scenario_a, write_temp_file, CLINIC_YAML};
pub use provider::{MockFactory, ScriptedProvider};
pub use store::RecordingStore;
