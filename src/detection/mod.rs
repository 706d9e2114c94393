// src/detection/mod.rs

mod bundle;
pub mod merge;
mod types;

// Re-export public APIs
pub use bundle::{DetectionBundle, ItemPath};
pub use merge::{merge_detection, MergeDecision};
pub use types::*;
