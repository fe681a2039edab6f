//! Image classification models

pub mod chexnet;
pub mod densenet;

// Re-exports
pub use chexnet::{ChexNet, StateDict};
pub use densenet::{DenseNet, DenseNetConfig};
