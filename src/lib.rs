//! # flowprobe
//!
//! Capture front-end for the `flowprobe-core` flow-context engine: replays
//! PCAP / PCAPNG files (gzip aware) through the engine and formats the
//! protocol events it emits.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use flowprobe::capture::{replay, ReplayOptions};
//! use flowprobe_core::{Engine, EngineConfig, VecSink};
//!
//! let sink = Arc::new(VecSink::new());
//! let engine = Engine::new(EngineConfig::default(), sink.clone());
//! let stats = replay(&engine, "capture.pcap", &ReplayOptions::default()).unwrap();
//! println!("{} frames, {} events", stats.frames, sink.len());
//! ```

pub mod capture;
pub mod cli;
pub mod error;

pub use error::{CaptureError, Error, Result};
