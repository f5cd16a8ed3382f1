//! Process-level plumbing shared by the VisPred crates: tracing subscriber
//! setup, seeding policy, and layered TOML/JSON configuration.

pub mod determinism;
pub mod layered;
pub mod tracing;

pub use determinism::DeterminismConfig;
pub use layered::{ConfigLayer, ConfigLayering, LayeredConfig, LayeredConfigError};
