//! Frame sources feeding the live pipeline
//!
//! Real detectors are integrated outside this crate; they only need to call
//! [`LiveController::submit`](crate::pipeline::controller::LiveController::submit).
//! This module provides a simulated detector for the demo binary, tests and
//! benchmarks.

pub mod mock_detector;

pub use mock_detector::{DetectorPattern, MockDetector, ScanOrder};
