//! The multi-threaded host implementation of a car-following step.

use super::{Car, Cell, SimulationData, DT, LONG_FIXPOINT, SLOWDOWN_PROBABILITY, SPEED_LIMIT};
use super::WAITING_SPEED;
use crate::network::{add_waiting, Generator, Junction, NONE, TERMINATOR};
use crate::random::{exp_sample, spawn_size, RandomTable};
use crate::util::{index, rotated_range};
use crate::StepTimings;
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Instant;

/// What happened to a car offered to the next lane.
enum Entry {
    Moved,
    /// The source lane was locked; try again in the next pass.
    Postponed,
    Blocked,
}

struct StepContext<'a> {
    cells: &'a [Cell],
    slots: &'a [AtomicI32],
    cars_per_cell: usize,
    cars: &'a [Car],
    random: &'a RandomTable,
    seed: i32,
}

impl StepContext<'_> {
    fn lane(&self, cell: usize) -> &[AtomicI32] {
        &self.slots[cell * self.cars_per_cell..(cell + 1) * self.cars_per_cell]
    }

    fn car_at(&self, slot: &AtomicI32) -> &Car {
        &self.cars[slot.load(Ordering::Relaxed) as usize]
    }

    /// Advances every car of a lane and applies the following rule.
    fn pre_cell(&self, junctions: &[Junction], cell: usize) {
        let mut leader: Option<&Car> = None;
        for slot in self.lane(cell) {
            let Some(me) = index(slot.load(Ordering::Relaxed)) else {
                break;
            };
            let car = &self.cars[me];
            car.already_processed.store(0, Ordering::Relaxed);
            let speed = car.speed();
            car.position_in_cell
                .store(car.position_in_cell() + speed * DT);
            if speed < WAITING_SPEED {
                add_waiting(junctions, self.cells[cell].nearest_junction_index);
            }
            self.follow(me, car, leader);
            leader = Some(car);
        }
    }

    fn follow(&self, me: usize, car: &Car, leader: Option<&Car>) {
        let speed = car.speed();
        let speed = match leader {
            None => (speed + DT).min(SPEED_LIMIT),
            Some(leader) => {
                let gap = leader.rear() - car.position_in_cell();
                let mut speed = if gap < 0.0 {
                    0.0
                } else {
                    (speed + DT).min(gap).min(SPEED_LIMIT)
                };
                if speed >= 1.0
                    && self.random.at(self.seed.wrapping_add(me as i32)) < SLOWDOWN_PROBABILITY
                {
                    speed -= 1.0;
                }
                speed
            }
        };
        car.speed.store(speed);
    }

    /// Moves the cars that reached the end of a lane on to their next cell.
    fn post_cell(&self, cell: usize, changed: &AtomicBool) {
        let lane = self.lane(cell);
        let length = self.cells[cell].length;
        let mut k = 0;
        while k < lane.len() {
            let Some(me) = index(lane[k].load(Ordering::Relaxed)) else {
                break;
            };
            let car = &self.cars[me];
            if car.already_processed.swap(1, Ordering::SeqCst) != 0 {
                k += 1;
                continue;
            }
            let position_in_cell = car.position_in_cell();
            if position_in_cell < length {
                k += 1;
                continue;
            }

            let key = self.seed.wrapping_add(cell as i32).wrapping_add(k as i32);
            let next = self.cells[cell].routing.next_cell(self.random.at(key));
            if next == NONE {
                car.speed.store(0.0);
                k += 1;
                continue;
            }
            let target = &self.cells[next as usize];
            if target.junction_index == TERMINATOR {
                if self.remove(cell, k) {
                    car.position.store(NONE, Ordering::Relaxed);
                    car.position_in_cell.store(0.0);
                    car.speed.store(0.0);
                } else {
                    car.already_processed.store(0, Ordering::Relaxed);
                    changed.store(true, Ordering::Relaxed);
                    k += 1;
                }
                continue;
            }
            if !target.try_lock() {
                car.already_processed.store(0, Ordering::Relaxed);
                changed.store(true, Ordering::Relaxed);
                k += 1;
                continue;
            }
            let entry = self.enter(cell, k, me, next as usize, position_in_cell - length);
            target.unlock();
            match entry {
                Entry::Moved => {
                    car.already_processed.store(0, Ordering::Relaxed);
                    changed.store(true, Ordering::Relaxed);
                }
                Entry::Postponed => {
                    car.already_processed.store(0, Ordering::Relaxed);
                    changed.store(true, Ordering::Relaxed);
                    k += 1;
                }
                Entry::Blocked => {
                    car.speed.store(0.0);
                    k += 1;
                }
            }
        }
    }

    /// Moves car `me` from slot `k` of `cell` to the back of `next`, which the caller holds
    /// locked.
    fn enter(&self, cell: usize, k: usize, me: usize, next: usize, overshoot: f32) -> Entry {
        let lane = self.lane(next);
        let Some(free) = lane.iter().position(|slot| slot.load(Ordering::Relaxed) == NONE) else {
            return Entry::Blocked;
        };
        lane[free].store(me as i32, Ordering::Relaxed);
        let mut position_in_cell = overshoot;
        let mut clamped = false;
        if free > 0 {
            let gap = self.car_at(&lane[free - 1]).rear();
            if overshoot > gap {
                if gap < 0.0 {
                    lane[free].store(NONE, Ordering::Relaxed);
                    return Entry::Blocked;
                }
                position_in_cell = gap;
                clamped = true;
            }
        }
        if !self.remove(cell, k) {
            lane[free].store(NONE, Ordering::Relaxed);
            return Entry::Postponed;
        }
        let car = &self.cars[me];
        car.position.store(next as i32, Ordering::Relaxed);
        car.position_in_cell.store(position_in_cell);
        if clamped {
            car.speed.store(car.speed().min(position_in_cell));
        }
        Entry::Moved
    }

    /// Removes slot `k` from a lane, moving the cars behind it forward.
    fn remove(&self, cell: usize, k: usize) -> bool {
        let owner = &self.cells[cell];
        if !owner.try_lock() {
            return false;
        }
        let lane = self.lane(cell);
        for j in k..lane.len() - 1 {
            let behind = lane[j + 1].load(Ordering::Relaxed);
            lane[j].store(behind, Ordering::Relaxed);
            if behind == NONE {
                owner.unlock();
                return true;
            }
        }
        lane[lane.len() - 1].store(NONE, Ordering::Relaxed);
        owner.unlock();
        true
    }

    fn spawn(&self, index: usize, generator: &mut Generator) {
        if generator.time_left > 0.0 {
            generator.time_left -= DT;
            return;
        }
        let me = index as i32;
        let key = self.seed.wrapping_mul(me.wrapping_add(1));
        generator.time_left = exp_sample(self.random.at(key), generator.probability_lambda);
        let size = spawn_size(self.random.at(key.wrapping_mul(2)));

        let cell = generator.cell_index;
        for slot in rotated_range(self.cars.len(), self.cars.len() / 2 + 10 * index) {
            let car = &self.cars[slot];
            if car
                .position
                .compare_exchange(NONE, cell, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                continue;
            }
            let lane = self.lane(cell as usize);
            let spawned = match lane.iter().position(|s| s.load(Ordering::Relaxed) == NONE) {
                Some(free) => {
                    lane[free].store(slot as i32, Ordering::Relaxed);
                    if free == 0 || self.car_at(&lane[free - 1]).rear() >= 0.0 {
                        true
                    } else {
                        lane[free].store(NONE, Ordering::Relaxed);
                        false
                    }
                }
                None => false,
            };
            if spawned {
                car.position_in_cell.store(0.0);
                car.speed.store(0.0);
                car.size.store(size, Ordering::Relaxed);
                car.already_processed.store(1, Ordering::Relaxed);
            } else {
                car.position.store(NONE, Ordering::SeqCst);
            }
            break;
        }
    }
}

/// Repeats post-phase passes until no lane changes, returning the number of passes.
fn settle(ctx: &StepContext<'_>, cells: usize) -> usize {
    let mut passes = 0;
    loop {
        let changed = AtomicBool::new(false);
        (0..cells)
            .into_par_iter()
            .for_each(|cell| ctx.post_cell(cell, &changed));
        passes += 1;
        if !changed.load(Ordering::Relaxed) {
            return passes;
        }
        if passes == LONG_FIXPOINT {
            log::warn!("lane transitions still changing after {} passes", passes);
        }
    }
}

/// Advances the state by one step.
pub(crate) fn step(data: &mut SimulationData, random: &RandomTable, seed: i32, spawn: bool) -> StepTimings {
    let mut timings = StepTimings::default();
    data.junctions.par_iter().for_each(Junction::reset);

    let ctx = StepContext {
        cells: &data.cells,
        slots: &data.slots,
        cars_per_cell: data.cars_per_cell,
        cars: &data.cars,
        random,
        seed,
    };
    let cells = data.cells.len();
    let timer = Instant::now();
    let junctions = &data.junctions;
    (0..cells)
        .into_par_iter()
        .for_each(|cell| ctx.pre_cell(junctions, cell));

    let passes = settle(&ctx, cells);
    log::trace!("lane transitions settled after {} passes", passes);
    timings.cars = timer.elapsed();

    let timer = Instant::now();
    if spawn {
        data.generators
            .par_iter_mut()
            .enumerate()
            .for_each(|(index, generator)| ctx.spawn(index, generator));
    }
    timings.generators = timer.elapsed();
    timings
}
