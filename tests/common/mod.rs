//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;

use beamview::pipeline::{ControllerState, LiveController};
use std::time::Duration;

/// Upper bound for waiting on worker threads
pub fn test_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Wait until the controller has no dispatched work, failing the test otherwise
pub fn wait_idle(controller: &LiveController) {
    assert!(
        controller.wait_idle(test_timeout()),
        "Controller did not go idle (state {:?}, stats {:?})",
        controller.state(),
        controller.stats()
    );
}

/// Assert the controller reached `state`
pub fn assert_state(controller: &LiveController, state: ControllerState) {
    assert_eq!(controller.state(), state);
}

/// Assert two floats are approximately equal
pub fn assert_float_eq(a: f64, b: f64, epsilon: f64) {
    assert!(
        (a - b).abs() < epsilon,
        "Expected {} to be approximately equal to {} (epsilon: {})",
        a,
        b,
        epsilon
    );
}
