// src/lib.rs

pub mod analysis;
pub mod config;
pub mod detection;
pub mod frame_buffer;
pub mod geometry;
pub mod inference;
pub mod pipeline;
pub mod trace_sink;
pub mod types;
pub mod video_processor;

pub use types::{Config, Frame, SharedFrame};
