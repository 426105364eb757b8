use super::{Car, Cell, SimulationData, MAX_CAR_SIZE};
use crate::network::{self, draw_probabilities, CarUi, CellUi, Generator, Junction, LaneShape};
use crate::network::{Routing, Topology, NONE};
use crate::GenerationParams;
use arrayvec::ArrayVec;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::AtomicI32;

/// Attempts to place one car before giving up on the rest.
const PLACEMENT_ATTEMPTS: usize = 1000;

/// Largest initially placed car.
const MAX_INITIAL_SIZE: usize = 6; // cells

/// Generates a grid network and places the initial cars.
pub(crate) fn generate(params: &GenerationParams) -> SimulationData {
    let mut rng = match params.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let topology = network::build(params, LaneShape::Chained);
    let capacity = params.capacity();

    let mut occupancy = vec![NONE; topology.cells.len()];
    let mut cars = Vec::with_capacity(capacity);
    let mut cars_ui = Vec::with_capacity(capacity);
    for car in 0..params.car_count {
        let size = rng.gen_range(1..=MAX_INITIAL_SIZE);
        let chain = (0..PLACEMENT_ATTEMPTS).find_map(|_| {
            let start = rng.gen_range(0..topology.cells.len());
            free_chain(&topology, &occupancy, start, size)
        });
        let Some(chain) = chain else {
            log::warn!(
                "placed {} of {} requested cars",
                car,
                params.car_count
            );
            break;
        };
        for &cell in &chain {
            occupancy[cell] = car as i32;
        }
        cars.push(Car::new(chain[0] as i32, 0, size as i32));
        cars_ui.push(CarUi {
            color: rng.gen_range(0..10),
        });
    }
    while cars.len() < capacity {
        cars.push(Car::new(NONE, 0, 0));
        cars_ui.push(CarUi {
            color: rng.gen_range(0..10),
        });
    }

    let cells = topology
        .cells
        .iter()
        .map(|template| Cell {
            routing: Routing::new(
                template.targets,
                draw_probabilities(&template.targets, &mut rng),
            ),
            junction_index: template.junction_index,
            nearest_junction_index: template.nearest_junction_index,
        })
        .collect();
    let cells_ui = topology
        .cells
        .iter()
        .map(|template| CellUi {
            position: template.ui,
        })
        .collect();

    SimulationData {
        cells,
        occupancy: occupancy.into_iter().map(AtomicI32::new).collect(),
        junctions: topology
            .junctions
            .iter()
            .map(|&cell| Junction::new(cell, 0))
            .collect(),
        generators: topology
            .generators
            .iter()
            .map(|&cell| Generator::new(cell, params.generator_probability))
            .collect(),
        cars,
        cells_ui,
        cars_ui,
    }
}

/// Collects `size` free lane cells along first transitions from `start`.
fn free_chain(
    topology: &Topology,
    occupancy: &[i32],
    start: usize,
    size: usize,
) -> Option<ArrayVec<usize, MAX_CAR_SIZE>> {
    let mut chain = ArrayVec::new();
    let mut cell = start;
    for _ in 0..size {
        let template = &topology.cells[cell];
        if template.junction_index != NONE || template.targets[0] == NONE || occupancy[cell] != NONE {
            return None;
        }
        chain.push(cell);
        cell = template.targets[0] as usize;
    }
    Some(chain)
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn probabilities_sum_to_one() {
        let data = generate(&GenerationParams::new(5, 3, 2, 10, 10, 0.1).with_seed(3));
        for cell in &data.cells {
            let total: f32 = cell.routing.probabilities.iter().sum();
            if cell.routing.targets().count() == 0 {
                assert_eq!(total, 0.0);
            } else {
                assert_approx_eq!(total, 1.0, 1e-5);
            }
            for k in 0..5 {
                if cell.routing.target(k).is_none() {
                    assert_eq!(cell.routing.probability(k), 0.0);
                }
            }
        }
    }

    #[test]
    fn same_seed_same_network() {
        let params = GenerationParams::new(8, 3, 3, 40, 60, 0.2).with_seed(17);
        let a = generate(&params);
        let b = generate(&params);
        assert_eq!(a.cells, b.cells);
        let positions = |data: &SimulationData| {
            data.cars.iter().map(|car| car.position()).collect::<Vec<_>>()
        };
        assert_eq!(positions(&a), positions(&b));
        assert_eq!(a.cars.len(), 60);
    }

    #[test]
    fn placement_truncates() {
        // With unit lanes the only candidate cells are the five generator cells.
        let data = generate(&GenerationParams::new(1, 1, 1, 50, 50, 0.1).with_seed(5));
        let placed = data.cars.iter().filter(|car| car.position().is_some()).count();
        assert!(placed <= 5);
        assert_eq!(data.cars.len(), 50);
        assert!(data.check_integrity().consistent);
    }
}
