//! Integration tests for the live pipeline
//!
//! These tests drive the public controller API the way acquisition and a GUI do:
//! - Submitting frames and reading back the live map
//! - Pause/resume with deferred reduction
//! - Out-of-order arrival and last-writer-wins
//! - Shutdown behaviour

mod common;

use beamview::acquisition::MockDetector;
use beamview::pipeline::{
    ControllerState, Generation, LiveController, MapNotification, PipelineError, ReductionRecipe,
    Region, Roi, SequenceId,
};
use beamview::types::{Coordinate, FrameStatus};
use common::builders::{config_with, FrameBuilder};
use common::{assert_float_eq, assert_state, test_timeout, wait_idle};
use std::sync::Arc;
use std::thread;

#[test]
fn test_sum_over_three_positions() {
    let controller =
        LiveController::new(&config_with(2, ReductionRecipe::sum(Roi::Full))).unwrap();
    controller.start().unwrap();

    for (row, col) in [(0, 0), (0, 1), (1, 0)] {
        controller.submit(FrameBuilder::new().at(row, col).build()).unwrap();
    }
    wait_idle(&controller);

    let map = controller.get_latest_map();
    for (row, col) in [(0, 0), (0, 1), (1, 0)] {
        assert_eq!(map.value_at(Coordinate::new(row, col)), Some(16.0));
    }
    assert_eq!(map.generation, Generation(3));
    assert_eq!(controller.stats().reduced, 3);
}

#[test]
fn test_paused_controller_defers_then_reduces_in_order() {
    let controller =
        LiveController::new(&config_with(1, ReductionRecipe::sum(Roi::Full))).unwrap();
    controller.start().unwrap();
    controller.pause().unwrap();

    // All frames hit the same coordinate, so any out-of-order reduction would
    // show up as a stale rejection.
    let ids: Vec<SequenceId> = (0..10)
        .map(|i| {
            controller
                .submit(FrameBuilder::new().value(i as f64).at(5, 5).build())
                .unwrap()
        })
        .collect();

    wait_idle(&controller);
    assert!(controller.get_latest_map().is_empty());
    assert_eq!(controller.stats().deferred, 10);
    assert_eq!(controller.map().generation(), Generation::ZERO);

    controller.resume().unwrap();
    wait_idle(&controller);

    let stats = controller.stats();
    assert_eq!(stats.reduced, 10);
    assert_eq!(stats.stale_rejected, 0);
    assert_eq!(stats.deferred, 0);
    assert_eq!(stats.generation, Generation(10));

    let cell = controller.map().get(Coordinate::new(5, 5)).unwrap();
    assert_eq!(cell.sequence_id(), ids[9]);
    assert_eq!(cell.value().unwrap().scalar(), 9.0 * 16.0);
}

#[test]
fn test_idle_controller_buffers_until_start() {
    let controller = LiveController::new(&config_with(2, ReductionRecipe::default())).unwrap();
    assert_state(&controller, ControllerState::Idle);
    controller.submit(FrameBuilder::new().build()).unwrap();
    assert_eq!(controller.stats().deferred, 1);

    controller.start().unwrap();
    wait_idle(&controller);
    assert_eq!(controller.get_latest_map().filled_len(), 1);
}

#[test]
fn test_out_of_order_positions_keep_newest_frame() {
    let controller =
        LiveController::new(&config_with(1, ReductionRecipe::max(Roi::Full))).unwrap();
    controller.pause().unwrap_err();
    controller.start().unwrap();

    let c = Coordinate::new(2, 2);
    controller.submit(FrameBuilder::new().value(7.0).at(2, 2).timestamp_ms(50).build()).unwrap();
    // Later sequence id, earlier timestamp: admission order wins.
    controller.submit(FrameBuilder::new().value(3.0).at(2, 2).timestamp_ms(10).build()).unwrap();
    wait_idle(&controller);

    assert_eq!(controller.get_latest_map().value_at(c), Some(3.0));
}

#[test]
fn test_recipe_change_applies_to_new_frames_only() {
    let controller =
        LiveController::new(&config_with(1, ReductionRecipe::sum(Roi::Full))).unwrap();
    controller.submit(FrameBuilder::new().at(0, 0).build()).unwrap();
    controller.set_recipe(ReductionRecipe::mean(Roi::Full));
    controller.submit(FrameBuilder::new().at(0, 1).build()).unwrap();
    controller.start().unwrap();
    wait_idle(&controller);

    let map = controller.get_latest_map();
    assert_eq!(map.value_at(Coordinate::new(0, 0)), Some(16.0));
    assert_eq!(map.value_at(Coordinate::new(0, 1)), Some(1.0));
}

#[test]
fn test_bad_roi_discards_frame_and_marks_unfilled() {
    let roi = Roi::Region(Region::new(2, 2, 4, 4).unwrap());
    let controller = LiveController::new(&config_with(1, ReductionRecipe::sum(roi))).unwrap();
    controller.start().unwrap();

    let id = controller.submit(FrameBuilder::new().at(1, 1).build()).unwrap();
    // A larger frame fits the ROI and keeps the pipeline going.
    controller
        .submit(FrameBuilder::new().shape(8, 8).at(1, 2).build())
        .unwrap();
    wait_idle(&controller);

    let map = controller.get_latest_map();
    assert_eq!(map.unfilled().collect::<Vec<_>>(), vec![Coordinate::new(1, 1)]);
    assert_eq!(map.value_at(Coordinate::new(1, 2)), Some(16.0));
    assert_eq!(controller.buffer().get(id).unwrap().status, FrameStatus::Discarded);
    assert_eq!(controller.stats().discarded, 1);
}

#[test]
fn test_monitor_normalization() {
    let recipe = ReductionRecipe::sum(Roi::Full)
        .with_normalization(beamview::pipeline::Normalization::Monitor)
        .unwrap();
    let controller = LiveController::new(&config_with(1, recipe)).unwrap();
    controller.start().unwrap();
    controller
        .submit(FrameBuilder::new().value(2.0).monitor(4.0).build())
        .unwrap();
    controller.submit(FrameBuilder::new().at(0, 1).build()).unwrap();
    wait_idle(&controller);

    let map = controller.get_latest_map();
    assert_float_eq(map.value_at(Coordinate::new(0, 0)).unwrap(), 8.0, 1e-12);
    // No monitor reading: the frame is discarded
    assert_eq!(map.value_at(Coordinate::new(0, 1)), None);
}

#[test]
fn test_stopped_controller_rejects_frames() {
    let controller = LiveController::new(&config_with(2, ReductionRecipe::default())).unwrap();
    let updates = controller.subscribe();
    controller.start().unwrap();
    controller.submit(FrameBuilder::new().build()).unwrap();
    controller.stop().unwrap();
    controller.stop().unwrap();

    assert_state(&controller, ControllerState::Stopped);
    assert!(matches!(
        controller.submit(FrameBuilder::new().build()),
        Err(PipelineError::ControllerStopped)
    ));
    assert!(matches!(
        controller.start(),
        Err(PipelineError::InvalidTransition { .. })
    ));
    assert_eq!(controller.stats().rejected, 1);

    // Queued work finished before the workers exited
    assert_eq!(controller.get_latest_map().filled_len(), 1);
    let received: Vec<_> = updates.iter().collect();
    assert_eq!(received.last(), Some(&MapNotification::Stopped));
}

#[test]
fn test_concurrent_producers_and_readers() {
    let controller = Arc::new(
        LiveController::new(&config_with(4, ReductionRecipe::sum(Roi::Full))).unwrap(),
    );
    controller.start().unwrap();

    let producers: Vec<_> = (0..4)
        .map(|p| {
            let controller = Arc::clone(&controller);
            thread::spawn(move || {
                for i in 0..50 {
                    controller
                        .submit(FrameBuilder::new().at(p, i).build())
                        .unwrap();
                }
            })
        })
        .collect();

    let reader = {
        let controller = Arc::clone(&controller);
        thread::spawn(move || {
            let mut last = Generation::ZERO;
            for _ in 0..100 {
                let snapshot = controller.get_latest_map();
                assert!(snapshot.generation >= last);
                for value in snapshot.values() {
                    assert_eq!(value, 16.0);
                }
                last = snapshot.generation;
            }
        })
    };

    for p in producers {
        p.join().unwrap();
    }
    reader.join().unwrap();
    assert!(controller.wait_idle(test_timeout()));

    let map = controller.get_latest_map();
    assert_eq!(map.filled_len(), 200);
    assert_eq!(map.generation, Generation(200));
}

#[test]
fn test_mock_detector_scan_fills_map() {
    let controller = LiveController::new(&config_with(2, ReductionRecipe::default())).unwrap();
    controller.start().unwrap();
    let detector = MockDetector::new(16, 16).with_scan(6, 6);
    for frame in detector {
        controller.submit(frame).unwrap();
    }
    wait_idle(&controller);

    let map = controller.get_latest_map();
    assert_eq!(map.filled_len(), 36);
    let grid = map.to_grid().unwrap();
    assert_eq!((grid.rows, grid.cols), (6, 6));
    // The simulated sample is brightest in the middle of the scan
    let centre = grid.get(Coordinate::new(3, 3)).unwrap();
    let corner = grid.get(Coordinate::new(0, 0)).unwrap();
    assert!(centre > corner);
}
