//! Tests of network generation.

mod common;

use assert_approx_eq::assert_approx_eq;
use common::*;
use traffic_grid::{GenerationParams, ModelKind, SimulationError};

/// Test the size of a 10x10 grid with lanes of 24 cells.
#[test]
fn grid_dimensions() {
    let params = GenerationParams::new(24, 10, 10, 0, 0, 0.1).with_seed(1);
    let sim = generated(ModelKind::CellBased, &params);
    let stats = sim.statistics();
    assert_eq!(stats.cells, 15460);
    assert_eq!(stats.junctions, 100);
    assert_eq!(stats.generators, 140);

    let sim = generated(ModelKind::CarFollowing, &params);
    let stats = sim.statistics();
    assert_eq!(stats.cells, 1380);
    assert_eq!(stats.junctions, 100);
    assert_eq!(stats.generators, 140);
    assert_eq!(sim.car_following().unwrap().cars_per_cell(), 24);
}

/// Test that routing probabilities sum to one over the existing targets.
#[test]
fn probabilities_sum_to_one() {
    for kind in MODELS {
        let sim = generated(kind, &busy_params());
        let routings = match kind {
            ModelKind::CellBased => sim
                .cell_based()
                .unwrap()
                .cells()
                .iter()
                .map(|cell| *cell.routing())
                .collect::<Vec<_>>(),
            ModelKind::CarFollowing => sim
                .car_following()
                .unwrap()
                .cells()
                .iter()
                .map(|cell| *cell.routing())
                .collect::<Vec<_>>(),
        };
        for routing in routings {
            let sum = (0..5).map(|k| routing.probability(k)).sum::<f32>();
            if routing.targets().next().is_some() {
                assert_approx_eq!(sum, 1.0, 1e-5);
            } else {
                assert_eq!(sum, 0.0);
            }
            for k in 0..5 {
                if routing.target(k).is_none() {
                    assert_eq!(routing.probability(k), 0.0);
                }
            }
        }
    }
}

/// Test that the requested cars are placed and the state starts out consistent.
#[test]
fn initial_state_consistent() {
    for kind in MODELS {
        let sim = generated(kind, &busy_params());
        let report = sim.check_integrity();
        assert!(report.consistent);
        assert_eq!(report.active_cars, 60);
        assert_eq!(sim.statistics().cars, 90);
        assert_eq!(sim.current_step(), 0);
    }
}

/// Test that the same seed produces the same network.
#[test]
fn seeded_generation_repeats() {
    for kind in MODELS {
        let a = generated(kind, &busy_params());
        let b = generated(kind, &busy_params());
        assert_eq!(a.to_bytes().unwrap(), b.to_bytes().unwrap());
    }
}

/// Test that cars never start on a junction.
#[test]
fn cars_start_off_junctions() {
    let sim = generated(ModelKind::CellBased, &busy_params());
    let data = sim.cell_based().unwrap();
    for (index, _) in data.cars().iter().enumerate() {
        let Some(cells) = data.car_cells(index) else {
            continue;
        };
        for cell in cells {
            assert!(data.cells()[cell].junction().is_none());
            assert_eq!(data.occupant(cell), Some(index));
        }
    }

    let sim = generated(ModelKind::CarFollowing, &busy_params());
    let data = sim.car_following().unwrap();
    for car in data.cars() {
        if let Some(cell) = car.position() {
            assert!(data.cells()[cell].length() > 0.0);
            assert!(car.position_in_cell() >= car.size() as f32);
        }
    }
}

/// Test that a maximum below the car count is raised to it.
#[test]
fn capacity_covers_car_count() {
    let params = GenerationParams::new(8, 2, 2, 20, 5, 0.1).with_seed(2);
    for kind in MODELS {
        assert_eq!(generated(kind, &params).statistics().cars, 20);
    }
}

/// Test that invalid parameters are rejected.
#[test]
fn invalid_parameters() {
    for kind in MODELS {
        let mut sim = generated(kind, &busy_params());
        let before = sim.to_bytes().unwrap();
        for params in [
            GenerationParams::new(0, 2, 2, 1, 1, 0.1),
            GenerationParams::new(4, 0, 2, 1, 1, 0.1),
            GenerationParams::new(4, 2, -1, 1, 1, 0.1),
        ] {
            assert!(matches!(
                sim.generate_new(&params),
                Err(SimulationError::InvalidParams(_))
            ));
        }
        assert_eq!(sim.to_bytes().unwrap(), before);
    }
}
