//! Legacy checkpoint conversion
//!
//! Reading checkpoints, rewriting legacy parameter names, and saving the
//! converted backbone.

pub mod converter;
pub mod legacy;
pub mod loader;
pub mod rules;
pub mod saver;

// Re-exports
pub use converter::{CheckpointConverter, ConversionOutcome};
pub use loader::{inspect_safetensors, load_state_dict, CheckpointFormat, TensorSummary};
pub use rules::{KeyRemapper, RemapReport, RenameRule};
pub use saver::save_state_dict;
