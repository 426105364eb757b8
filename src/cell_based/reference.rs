//! The multi-threaded host implementation of a cell-based step.

use super::{find_car_cells, Car, Cell, SimulationData, FRONT_CELLS, SLOWDOWN_PROBABILITY, SPEED_LIMIT};
use crate::network::{add_waiting, Generator, Junction, NONE, TERMINATOR};
use crate::random::{exp_sample, spawn_size, RandomTable};
use crate::util::rotated_range;
use crate::StepTimings;
use arrayvec::ArrayVec;
use rayon::prelude::*;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Instant;

/// The parts of the state shared by all workers of a step.
struct StepContext<'a> {
    cells: &'a [Cell],
    occupancy: &'a [AtomicI32],
    random: &'a RandomTable,
    seed: i32,
}

impl StepContext<'_> {
    fn is_free(&self, cell: i32) -> bool {
        cell != NONE && self.occupancy[cell as usize].load(Ordering::Relaxed) == NONE
    }

    fn claim(&self, cell: i32, car: i32) -> bool {
        self.occupancy[cell as usize]
            .compare_exchange(NONE, car, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn release(&self, cell: i32) {
        self.occupancy[cell as usize].store(NONE, Ordering::Relaxed);
    }

    /// Samples the route of up to `count` cells beyond `head`.
    ///
    /// Each choice is keyed by `agent` and the cell it is made from; unused entries are [NONE].
    fn front_cells(&self, agent: i32, mut head: i32, count: usize) -> [i32; FRONT_CELLS] {
        let mut front = [NONE; FRONT_CELLS];
        for slot in front.iter_mut().take(count) {
            let key = self.seed.wrapping_add(agent.wrapping_mul(head));
            let next = self.cells[head as usize].routing.next_cell(self.random.at(key));
            if next == NONE {
                break;
            }
            *slot = next;
            head = next;
        }
        front
    }

    fn step_car(&self, junctions: &[Junction], index: usize, car: &Car) {
        let mut position = car.position.load(Ordering::Relaxed);
        if position == NONE {
            return;
        }
        let me = index as i32;
        let size = car.size.load(Ordering::Relaxed);
        let mut chain = find_car_cells(self.cells, self.occupancy, me, position, size);
        if size < 1 || chain.len() != size as usize {
            // Broken chains are left for the integrity check to report.
            return;
        }

        let front = self.front_cells(me, chain[chain.len() - 1], FRONT_CELLS);
        let mut speed = car.speed.load(Ordering::Relaxed).clamp(0, SPEED_LIMIT);
        let mut can_accelerate = true;
        for (j, &cell) in front.iter().enumerate().take(speed as usize) {
            if !self.is_free(cell) {
                speed = j as i32;
                can_accelerate = false;
                break;
            }
        }
        if speed < SPEED_LIMIT && can_accelerate && self.is_free(front[speed as usize]) {
            speed += 1;
        }
        if speed >= 1 {
            let key = self.seed.wrapping_add(me.wrapping_mul(chain[0]));
            if self.random.at(key) < SLOWDOWN_PROBABILITY {
                speed -= 1;
            }
        }

        for &next in front.iter().take(speed as usize) {
            if self.cells[next as usize].junction_index == TERMINATOR {
                position = NONE;
                speed = 0;
                for &cell in &chain {
                    self.release(cell);
                }
                break;
            }
            if !self.claim(next, me) {
                speed = 0;
                break;
            }
            self.release(chain[0]);
            chain.remove(0);
            chain.push(next);
            position = chain[0];
        }

        car.position.store(position, Ordering::Relaxed);
        car.speed.store(speed, Ordering::Relaxed);
        if speed == 0 {
            let head = chain[chain.len() - 1];
            add_waiting(junctions, self.cells[head as usize].nearest_junction_index);
        }
    }

    fn spawn(&self, cars: &[Car], index: usize, generator: &mut Generator) {
        if generator.time_left > 0.0 {
            generator.time_left -= 1.0;
            return;
        }
        let me = index as i32;
        let key = self.seed.wrapping_mul(me.wrapping_add(1));
        generator.time_left = exp_sample(self.random.at(key), generator.probability_lambda);

        let cell = generator.cell_index;
        if !self.is_free(cell) {
            return;
        }
        let size = spawn_size(self.random.at(key.wrapping_mul(2)));
        let ahead = (size - 1) as usize;
        let front = self.front_cells(me, cell, ahead);
        if !front[..ahead].iter().all(|&cell| self.is_free(cell)) {
            return;
        }

        for slot in rotated_range(cars.len(), cars.len() / 2 + 10 * index) {
            let car = &cars[slot];
            if car
                .position
                .compare_exchange(NONE, cell, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                continue;
            }
            let cells = std::iter::once(cell)
                .chain(front[..ahead].iter().copied())
                .collect::<ArrayVec<i32, FRONT_CELLS>>();
            let claimed = cells
                .iter()
                .take_while(|&&c| self.claim(c, slot as i32))
                .count();
            if claimed < cells.len() {
                for &c in &cells[..claimed] {
                    self.release(c);
                }
                car.position.store(NONE, Ordering::SeqCst);
                return;
            }
            car.speed.store(0, Ordering::Relaxed);
            car.size.store(size, Ordering::Relaxed);
            break;
        }
    }
}

/// Advances the state by one step.
pub(crate) fn step(data: &mut SimulationData, random: &RandomTable, seed: i32, spawn: bool) -> StepTimings {
    let mut timings = StepTimings::default();
    data.junctions.par_iter().for_each(Junction::reset);

    let ctx = StepContext {
        cells: &data.cells,
        occupancy: &data.occupancy,
        random,
        seed,
    };
    let timer = Instant::now();
    let junctions = &data.junctions;
    data.cars
        .par_iter()
        .enumerate()
        .for_each(|(index, car)| ctx.step_car(junctions, index, car));
    timings.cars = timer.elapsed();

    let timer = Instant::now();
    if spawn {
        let cars = &data.cars;
        data.generators
            .par_iter_mut()
            .enumerate()
            .for_each(|(index, generator)| ctx.spawn(cars, index, generator));
    }
    timings.generators = timer.elapsed();
    timings
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cell_based::generate;
    use crate::GenerationParams;

    #[test]
    fn steps_keep_chains_intact() {
        let mut data = generate(&GenerationParams::new(10, 3, 3, 80, 120, 0.2).with_seed(1));
        let random = RandomTable::new(Some(1));
        for seed in 2..60 {
            step(&mut data, &random, seed, true);
            assert!(data.check_integrity().consistent);
        }
    }

    #[test]
    fn car_accelerates_from_rest() {
        let mut data = generate(&GenerationParams::new(10, 2, 1, 0, 1, 0.1).with_seed(3));
        let random = RandomTable::from_values(vec![0.5]).unwrap();
        let start = data.generators[0].cell_index;
        data.cars[0] = Car::new(start, 0, 1);
        data.occupancy[start as usize].store(0, Ordering::Relaxed);
        let next = data.cells[start as usize].routing().target(0).unwrap();

        step(&mut data, &random, 1, false);
        assert_eq!(data.cars[0].position(), Some(next));
        assert_eq!(data.cars[0].speed(), 1);
        assert_eq!(data.occupant(next), Some(0));
        assert_eq!(data.occupant(start as usize), None);
        assert_eq!(data.car_cells(0), Some(vec![next]));
    }

    #[test]
    fn blocked_car_waits() {
        // Car 0 holds the junction of a 1x1 grid with unit lanes, car 1 queues behind it.
        let mut data = generate(&GenerationParams::new(1, 1, 1, 0, 2, 0.1).with_seed(1));
        let random = RandomTable::from_values(vec![0.5]).unwrap();
        let generator = data.generators[0].cell_index;
        data.cars[0] = Car::new(0, 0, 1);
        data.occupancy[0].store(0, Ordering::Relaxed);
        data.cars[1] = Car::new(generator, 0, 1);
        data.occupancy[generator as usize].store(1, Ordering::Relaxed);
        // Mark every exit of the junction as taken.
        for exit in data.cells[0].routing.targets {
            data.occupancy[exit as usize].store(0, Ordering::Relaxed);
        }
        step(&mut data, &random, 1, false);
        assert_eq!(data.cars[1].position(), Some(generator as usize));
        assert_eq!(data.cars[1].speed(), 0);
        assert!(data.junctions[0].waiting_count() >= 1);
    }
}
