//! Tests that compare the accelerated backend with the reference backend.

mod common;

use common::*;
use traffic_grid::dispatch::{ComputeError, DeviceId, Dispatcher, HostDispatcher};
use traffic_grid::{Backend, GenerationParams, SimulationError};

/// Test that a batch on the device reaches the same state as reference steps.
#[test]
fn batch_matches_reference() {
    let dispatcher = HostDispatcher::new(1).unwrap();
    for kind in MODELS {
        let mut reference = generated(kind, &busy_params());
        let mut accelerated = generated(kind, &busy_params());
        for _ in 0..15 {
            reference.do_step_reference().unwrap();
        }
        accelerated
            .do_batch_accelerated(&dispatcher, DeviceId(0), 15)
            .unwrap();
        assert_eq!(accelerated.current_step(), 15);
        assert_eq!(
            reference.state_hash().unwrap(),
            accelerated.state_hash().unwrap(),
            "{} backends diverged",
            kind
        );
    }
}

/// Test that the backends can be switched between steps.
#[test]
fn alternating_backends() {
    let dispatcher = HostDispatcher::new(1).unwrap();
    let device = DeviceId(0);
    for kind in MODELS {
        let mut reference = generated(kind, &busy_params());
        let mut mixed = generated(kind, &busy_params());
        for step in 0..10 {
            reference.step(Backend::Reference).unwrap();
            let backend = if step % 2 == 0 {
                Backend::Accelerated {
                    dispatcher: &dispatcher,
                    device,
                }
            } else {
                Backend::Reference
            };
            mixed.step(backend).unwrap();
            assert!(mixed.check_integrity().consistent);
        }
        assert_eq!(reference.to_bytes().unwrap(), mixed.to_bytes().unwrap());
    }
}

/// Test that a device that runs out of memory leaves the simulation usable.
#[test]
fn out_of_memory_falls_back() {
    let small = HostDispatcher::with_memory_limit(1, 256).unwrap();
    for kind in MODELS {
        let mut sim = generated(kind, &busy_params());
        sim.do_step_reference().unwrap();
        let before = sim.to_bytes().unwrap();

        let err = sim.do_batch_accelerated(&small, DeviceId(0), 5).unwrap_err();
        assert!(matches!(
            err,
            SimulationError::Compute(ComputeError::OutOfMemory { .. })
        ));
        assert_eq!(sim.current_step(), 1);
        assert_eq!(sim.to_bytes().unwrap(), before);

        sim.do_step_reference().unwrap();
        assert_eq!(sim.current_step(), 2);
        assert!(sim.check_integrity().consistent);
    }
}

/// Test that an unknown device is reported.
#[test]
fn unknown_device() {
    let dispatcher = HostDispatcher::new(1).unwrap();
    assert_eq!(dispatcher.devices(), vec![DeviceId(0)]);
    let mut sim = generated(MODELS[0], &busy_params());
    let err = sim.do_step_accelerated(&dispatcher, DeviceId(3)).unwrap_err();
    assert!(matches!(
        err,
        SimulationError::Compute(ComputeError::UnknownDevice(DeviceId(3)))
    ));
    assert_eq!(sim.current_step(), 0);
}

/// Test that a device with many workers keeps the state consistent.
#[test]
fn parallel_device_stays_consistent() {
    let dispatcher = HostDispatcher::new(4).unwrap();
    let params = GenerationParams::new(6, 4, 4, 150, 250, 0.3).with_seed(4);
    for kind in MODELS {
        let mut sim = generated(kind, &params);
        for _ in 0..5 {
            sim.do_batch_accelerated(&dispatcher, DeviceId(0), 8).unwrap();
            assert!(sim.check_integrity().consistent);
        }
        assert_eq!(sim.current_step(), 40);
    }
}
