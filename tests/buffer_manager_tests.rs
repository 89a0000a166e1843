//! Device Buffer Manager against the simulated sensor

use std::sync::Arc;

use camhal::capture::device::FrameFormat;
use camhal::capture::frame::{CaptureMode, PixelFormat};
use camhal::capture::manager::{BufferManager, DeviceState};
use camhal::capture::sim::{SimFaults, SimulatedSensor};
use camhal::registry::{CameraRegistry, Facing};
use camhal::CameraError;

fn setup() -> (Arc<CameraRegistry>, SimulatedSensor) {
    let sensor = SimulatedSensor::default();
    let mut registry = CameraRegistry::new();
    registry
        .register_simulated(Facing::Back, 90, sensor.clone())
        .unwrap();
    (Arc::new(registry), sensor)
}

fn vga() -> FrameFormat {
    FrameFormat {
        width: 640,
        height: 480,
        format: PixelFormat::Yuyv4,
    }
}

#[test]
fn configure_allocates_exactly_the_requested_pool() {
    let (registry, _) = setup();
    let mut mgr = BufferManager::new(registry, 0);
    mgr.open().unwrap();
    mgr.configure(CaptureMode::Preview, vga(), 4).unwrap();

    assert_eq!(mgr.state(), DeviceState::Configured);
    let slots = mgr.pool_slots();
    assert_eq!(slots.len(), 4);
    for slot in &slots {
        assert_eq!(slot.len, 640 * 480 * 2);
        assert_eq!(slot.format, PixelFormat::Yuyv4);
        assert!(!slot.queued);
    }
    assert_eq!(mgr.pool_format(), Some(vga()));
}

#[test]
fn start_primes_every_buffer() {
    let (registry, sensor) = setup();
    let mut mgr = BufferManager::new(registry, 0);
    mgr.open().unwrap();
    mgr.configure(CaptureMode::Preview, vga(), 4).unwrap();
    mgr.start().unwrap();

    assert_eq!(mgr.queued_count(), 4);
    assert!(mgr.pool_slots().iter().all(|s| s.queued));
    let c = sensor.counters();
    assert_eq!((c.queued, c.stream_on), (4, 1));
}

#[test]
fn ten_acquire_release_cycles_leave_the_queue_unchanged() {
    let (registry, sensor) = setup();
    let mut mgr = BufferManager::new(registry, 0);
    mgr.open().unwrap();
    mgr.configure(CaptureMode::Preview, vga(), 4).unwrap();
    mgr.start().unwrap();

    let queued = mgr.queued_count();
    for _ in 0..10 {
        let frame = mgr.acquire().unwrap();
        assert_eq!(mgr.queued_count(), queued - 1);
        mgr.release(frame.handle).unwrap();
        assert_eq!(mgr.queued_count(), queued);
    }
    assert_eq!(sensor.counters().dequeued, 10);
}

#[test]
fn a_released_slot_comes_around_again() {
    let (registry, _) = setup();
    let mut mgr = BufferManager::new(registry, 0);
    mgr.start_session(CaptureMode::Preview, vga(), 2).unwrap();

    let first = mgr.acquire().unwrap();
    mgr.release(first.handle).unwrap();
    let second = mgr.acquire().unwrap();
    let third = mgr.acquire().unwrap();

    assert_ne!(second.handle.slot, first.handle.slot);
    assert_eq!(third.handle.slot, first.handle.slot);
    assert!(third.handle.sequence > first.handle.sequence);
}

#[test]
fn release_from_an_earlier_epoch_is_stale_and_not_requeued() {
    let (registry, sensor) = setup();
    let mut mgr = BufferManager::new(registry, 0);
    mgr.start_session(CaptureMode::Preview, vga(), 4).unwrap();
    let old = mgr.acquire().unwrap();
    let old_epoch = mgr.epoch();

    mgr.stop();
    mgr.start().unwrap();
    assert_ne!(mgr.epoch(), old_epoch);
    assert!(!mgr.is_valid(&old.handle));

    let queued_calls = sensor.counters().queued;
    assert_eq!(
        mgr.release(old.handle),
        Err(CameraError::StaleBuffer {
            slot: old.handle.slot
        })
    );
    assert_eq!(sensor.counters().queued, queued_calls);
    assert_eq!(mgr.queued_count(), 4);
}

#[test]
fn releasing_twice_is_stale() {
    let (registry, _) = setup();
    let mut mgr = BufferManager::new(registry, 0);
    mgr.start_session(CaptureMode::Preview, vga(), 4).unwrap();

    let frame = mgr.acquire().unwrap();
    mgr.release(frame.handle).unwrap();
    assert!(mgr.release(frame.handle).unwrap_err().is_stale());
    assert_eq!(mgr.queued_count(), 4);
}

#[test]
fn allocation_failure_rolls_back_and_allows_retry() {
    let (registry, sensor) = setup();
    sensor.set_faults(SimFaults {
        fail_query_buffer_at: Some(2),
        ..Default::default()
    });

    let mut mgr = BufferManager::new(registry, 0);
    mgr.open().unwrap();
    let err = mgr.configure(CaptureMode::Preview, vga(), 4).unwrap_err();
    assert!(matches!(err, CameraError::AllocationFailed(_)));
    assert_eq!(mgr.state(), DeviceState::Opened);
    assert_eq!(mgr.pool_len(), 0);
    // Request for 4, then the rollback request for 0.
    assert_eq!(sensor.counters().buffer_requests, 2);

    sensor.clear_faults();
    mgr.configure(CaptureMode::Preview, vga(), 4).unwrap();
    assert_eq!(mgr.pool_len(), 4);
}

#[test]
fn short_grant_is_an_allocation_failure() {
    let (registry, sensor) = setup();
    sensor.set_faults(SimFaults {
        short_grant: Some(2),
        ..Default::default()
    });

    let mut mgr = BufferManager::new(registry, 0);
    mgr.open().unwrap();
    assert!(matches!(
        mgr.configure(CaptureMode::Video, vga(), 4),
        Err(CameraError::AllocationFailed(_))
    ));
    assert_eq!(mgr.pool_len(), 0);
}

#[test]
fn second_manager_on_the_same_camera_is_refused() {
    let (registry, _) = setup();
    let mut first = BufferManager::new(Arc::clone(&registry), 0);
    let mut second = BufferManager::new(Arc::clone(&registry), 0);

    first.open().unwrap();
    assert!(matches!(
        second.open(),
        Err(CameraError::DeviceUnavailable(_))
    ));

    first.close();
    second.open().unwrap();
}

#[test]
fn unknown_camera_is_unavailable() {
    let (registry, _) = setup();
    let mut mgr = BufferManager::new(registry, 5);
    assert!(matches!(mgr.open(), Err(CameraError::DeviceUnavailable(_))));
}

#[test]
fn failed_session_start_unwinds_everything() {
    let (registry, sensor) = setup();
    sensor.set_faults(SimFaults {
        fail_stream_on: true,
        ..Default::default()
    });

    let mut mgr = BufferManager::new(Arc::clone(&registry), 0);
    assert!(mgr
        .start_session(CaptureMode::Preview, vga(), 4)
        .is_err());
    assert_eq!(mgr.state(), DeviceState::Closed);
    assert!(!registry.is_open(0));

    let c = sensor.counters();
    assert_eq!(c.opens, c.closes);
}

#[test]
fn acquire_outside_streaming_is_rejected() {
    let (registry, _) = setup();
    let mut mgr = BufferManager::new(registry, 0);
    mgr.open().unwrap();
    mgr.configure(CaptureMode::Preview, vga(), 2).unwrap();
    assert!(matches!(
        mgr.acquire(),
        Err(CameraError::InvalidStateTransition(_))
    ));
    assert!(!mgr.data_available());
}

#[test]
fn frames_carry_the_negotiated_geometry() {
    let (registry, _) = setup();
    let mut mgr = BufferManager::new(registry, 0);
    mgr.start_session(CaptureMode::Video, vga(), 3).unwrap();

    let frame = mgr.acquire().unwrap();
    assert_eq!(frame.meta.width, 640);
    assert_eq!(frame.meta.height, 480);
    assert_eq!(frame.meta.format, PixelFormat::Yuyv4);
    assert_eq!(frame.data.len(), 640 * 480 * 2);
    assert!(frame.meta.device_timestamp.is_some());
    assert_eq!(frame.handle.epoch, mgr.epoch());
}

#[test]
fn stop_session_closes_and_is_repeatable() {
    let (registry, sensor) = setup();
    let mut mgr = BufferManager::new(Arc::clone(&registry), 0);
    mgr.start_session(CaptureMode::Preview, vga(), 2).unwrap();
    mgr.stop_session();
    mgr.stop_session();

    assert_eq!(mgr.state(), DeviceState::Closed);
    assert!(!registry.is_open(0));
    let c = sensor.counters();
    assert_eq!((c.stream_on, c.stream_off), (1, 1));
}

#[test]
fn failed_requeue_parks_the_slot_until_restart() {
    let (registry, sensor) = setup();
    let mut mgr = BufferManager::new(registry, 0);
    mgr.start_session(CaptureMode::Preview, vga(), 4).unwrap();
    let frame = mgr.acquire().unwrap();

    sensor.set_faults(SimFaults {
        fail_queue: true,
        ..Default::default()
    });
    assert!(matches!(
        mgr.release(frame.handle),
        Err(CameraError::Unknown(_))
    ));
    sensor.clear_faults();

    // The delivery is finished; a second return does not requeue it.
    assert!(mgr.release(frame.handle).unwrap_err().is_stale());
    assert_eq!(mgr.queued_count(), 3);

    mgr.stop();
    mgr.start().unwrap();
    assert_eq!(mgr.queued_count(), 4);
}
