//! Model discovery and classification
//!
//! Model files are opaque blobs to the rest of the core. This module turns a
//! path into a [`ModelDescriptor`] that declares which execution strategy can
//! run the file natively.

pub mod classifier;

pub use classifier::{
    ClassificationMethod, ClassifierConfig, DEFAULT_HEURISTIC_SIZE_THRESHOLD, ModelDescriptor,
    ModelFormat, classify, discover_models,
};
