use super::{Car, Cell, SimulationData};
use crate::network::{self, draw_probabilities, CarUi, CellUi, Generator, Junction, LaneShape};
use crate::network::{Routing, NONE};
use crate::GenerationParams;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use smallvec::SmallVec;
use std::sync::atomic::AtomicI32;

/// Attempts to place one car before giving up on the rest.
const PLACEMENT_ATTEMPTS: usize = 1000;

const MAX_INITIAL_SIZE: i32 = 6;

/// Generates a grid network of lane segments and places the initial cars.
pub(crate) fn generate(params: &GenerationParams) -> SimulationData {
    let mut rng = match params.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let topology = network::build(params, LaneShape::Endpoints);
    let capacity = params.capacity();
    let cars_per_cell = params.distance as usize;

    let mut slots = vec![NONE; topology.cells.len() * cars_per_cell];
    let mut cars = Vec::with_capacity(capacity);
    let mut cars_ui = Vec::with_capacity(capacity);
    for car in 0..params.car_count {
        let size = rng.gen_range(1..=MAX_INITIAL_SIZE);
        let placement = (0..PLACEMENT_ATTEMPTS).find_map(|_| {
            let cell = rng.gen_range(0..topology.cells.len());
            let length = topology.cells[cell].length as i32;
            if length == 0 || size > length {
                return None;
            }
            let position = if size == length {
                size
            } else {
                rng.gen_range(size..length)
            };
            let lane = &slots[cell * cars_per_cell..(cell + 1) * cars_per_cell];
            let slot = lane.iter().position(|&slot| slot == NONE)?;
            Some((cell, slot, position))
        });
        let Some((cell, slot, position)) = placement else {
            log::warn!("placed {} of {} requested cars", car, params.car_count);
            break;
        };
        slots[cell * cars_per_cell + slot] = car as i32;
        cars.push(Car::new(cell as i32, position as f32, 0.0, size));
        cars_ui.push(CarUi {
            color: rng.gen_range(0..10),
        });
    }
    while cars.len() < capacity {
        cars.push(Car::new(NONE, 0.0, 0.0, 0));
        cars_ui.push(CarUi {
            color: rng.gen_range(0..10),
        });
    }
    if cars_per_cell > 0 {
        for lane in slots.chunks_exact_mut(cars_per_cell) {
            sort_lane(lane, &cars);
        }
    }

    let cells = topology
        .cells
        .iter()
        .map(|template| {
            Cell::new(
                Routing::new(
                    template.targets,
                    draw_probabilities(&template.targets, &mut rng),
                ),
                template.junction_index,
                template.nearest_junction_index,
                template.length,
            )
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
        cars_per_cell,
        slots: slots.into_iter().map(AtomicI32::new).collect(),
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

/// Orders the cars of a lane by descending position, empty slots last.
fn sort_lane(lane: &mut [i32], cars: &[Car]) {
    let mut occupants = lane
        .iter()
        .copied()
        .filter(|&car| car != NONE)
        .collect::<SmallVec<[i32; 16]>>();
    occupants.sort_by(|&a, &b| {
        let a = cars[a as usize].position_in_cell.load();
        let b = cars[b as usize].position_in_cell.load();
        b.total_cmp(&a)
    });
    for (slot, car) in lane.iter_mut().zip(occupants.iter().copied().chain(std::iter::repeat(NONE))) {
        *slot = car;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn lengths_of_endpoint_lanes() {
        let data = generate(&GenerationParams::new(24, 10, 10, 0, 0, 0.1).with_seed(1));
        assert_eq!(data.cells.len(), 1380);
        assert_eq!(data.slots.len(), 1380 * 24);
        let long = data.cells.iter().filter(|cell| cell.length > 0.0).count();
        assert!(long > 0);
        for cell in &data.cells {
            assert!(cell.length == 0.0 || cell.length == 24.0);
        }
    }

    #[test]
    fn positions_fit_in_cells() {
        let data = generate(&GenerationParams::new(10, 3, 3, 60, 80, 0.1).with_seed(9));
        for car in data.cars.iter().filter(|car| car.position().is_some()) {
            let cell = &data.cells[car.position().unwrap()];
            assert!(car.position_in_cell() >= car.size() as f32);
            assert!(car.position_in_cell() <= cell.length);
            assert_eq!(car.speed(), 0.0);
        }
        assert_eq!(data.cars.len(), 80);
    }

    #[test]
    fn sorted_with_empty_slots_last() {
        let cars = [
            Car::new(0, 2.0, 0.0, 1),
            Car::new(0, 7.0, 0.0, 1),
            Car::new(0, 4.0, 0.0, 1),
        ];
        let mut lane = [0, NONE, 1, 2, NONE];
        sort_lane(&mut lane, &cars);
        assert_eq!(lane, [1, 2, 0, NONE, NONE]);
        assert_eq!(cars[1].position.load(Ordering::Relaxed), 0);
    }
}
