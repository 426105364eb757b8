//! Kernels of the car-following model.
//!
//! `do_step_car_pre` runs per cell, `spawn_cars` per generator, both over
//! `(cells, slots, cells_len, junctions | generators, len, cars, cars_len, cars_per_cell,
//! random, random_len, seed, dt)`. `do_step_car_post` replaces `dt` with a one-word
//! buffer that is set whenever a lane changed during the pass.

use super::*;
use crate::car_following::{CAR_POSITION, CAR_POSITION_IN_CELL, CAR_PROCESSED, CAR_SIZE};
use crate::car_following::{CAR_SPEED, CAR_WORDS, CELL_JUNCTION, CELL_LENGTH, CELL_LOCK};
use crate::car_following::{CELL_NEAREST, CELL_TARGETS, CELL_WORDS, LOCKED, UNLOCKED};
use crate::car_following::{SLOWDOWN_PROBABILITY, SPEED_LIMIT, WAITING_SPEED};
use crate::dispatch::Access;
use crate::network::{NONE, TERMINATOR};
use crate::random::{exp_sample, spawn_size};
use crate::util::rotated_range;

/// Position of the seed in the argument list of every step kernel.
pub(crate) const SEED_ARG: usize = 10;

/// Outcomes of offering a car to its next lane.
const ENTRY_BLOCKED: i32 = 0;
const ENTRY_MOVED: i32 = 1;
/// The source lane was locked; the car retries in the next pass.
const ENTRY_POSTPONED: i32 = 2;

const STEP_SIGNATURE: &[ArgKind] = &[
    ArgKind::Buffer(Access::ReadWrite),
    ArgKind::Buffer(Access::ReadWrite),
    ArgKind::Int,
    ArgKind::Buffer(Access::ReadWrite),
    ArgKind::Int,
    ArgKind::Buffer(Access::ReadWrite),
    ArgKind::Int,
    ArgKind::Int,
    ArgKind::Buffer(Access::ReadOnly),
    ArgKind::Int,
    ArgKind::Int,
    ArgKind::Float,
];

const POST_SIGNATURE: &[ArgKind] = &[
    ArgKind::Buffer(Access::ReadWrite),
    ArgKind::Buffer(Access::ReadWrite),
    ArgKind::Int,
    ArgKind::Buffer(Access::ReadWrite),
    ArgKind::Int,
    ArgKind::Buffer(Access::ReadWrite),
    ArgKind::Int,
    ArgKind::Int,
    ArgKind::Buffer(Access::ReadOnly),
    ArgKind::Int,
    ArgKind::Int,
    ArgKind::Buffer(Access::ReadWrite),
];

pub(crate) static PROGRAM: Program = Program {
    name: "car_following",
    kernels: &[
        KernelEntry {
            name: "reset_junctions",
            signature: RESET_JUNCTIONS_SIGNATURE,
            func: reset_junctions,
        },
        KernelEntry {
            name: "do_step_car_pre",
            signature: STEP_SIGNATURE,
            func: do_step_car_pre,
        },
        KernelEntry {
            name: "do_step_car_post",
            signature: POST_SIGNATURE,
            func: do_step_car_post,
        },
        KernelEntry {
            name: "spawn_cars",
            signature: STEP_SIGNATURE,
            func: spawn_cars,
        },
    ],
};

struct Lanes<'a> {
    cells: &'a Words,
    slots: &'a Words,
    cells_len: i32,
    cars: &'a Words,
    cars_len: i32,
    cars_per_cell: usize,
    random: &'a Words,
    random_len: i32,
    seed: i32,
}

impl<'a> Lanes<'a> {
    fn new(args: &LaunchArgs<'a>) -> Self {
        Self {
            cells: args.buffer(0),
            slots: args.buffer(1),
            cells_len: args.int(2),
            cars: args.buffer(5),
            cars_len: args.int(6),
            cars_per_cell: args.int(7).max(0) as usize,
            random: args.buffer(8),
            random_len: args.int(9),
            seed: args.int(SEED_ARG),
        }
    }

    fn random(&self, key: i32) -> f32 {
        random_at(self.random, self.random_len, key)
    }

    fn slot(&self, cell: usize, k: usize) -> usize {
        cell * self.cars_per_cell + k
    }

    fn slot_car(&self, cell: usize, k: usize) -> i32 {
        load_i32(self.slots, self.slot(cell, k))
    }

    fn set_slot(&self, cell: usize, k: usize, car: i32) {
        store_i32(self.slots, self.slot(cell, k), car);
    }

    fn first_free(&self, cell: usize) -> Option<usize> {
        (0..self.cars_per_cell).find(|&k| self.slot_car(cell, k) == NONE)
    }

    fn car(&self, car: i32, field: usize) -> usize {
        car as usize * CAR_WORDS + field
    }

    fn position_in_cell(&self, car: i32) -> f32 {
        load_f32(self.cars, self.car(car, CAR_POSITION_IN_CELL))
    }

    fn speed(&self, car: i32) -> f32 {
        load_f32(self.cars, self.car(car, CAR_SPEED))
    }

    fn set_speed(&self, car: i32, speed: f32) {
        store_f32(self.cars, self.car(car, CAR_SPEED), speed);
    }

    fn rear(&self, car: i32) -> f32 {
        self.position_in_cell(car) - load_i32(self.cars, self.car(car, CAR_SIZE)) as f32
    }

    fn set_processed(&self, car: i32, processed: i32) {
        store_i32(self.cars, self.car(car, CAR_PROCESSED), processed);
    }

    fn cell_word(&self, cell: usize, field: usize) -> usize {
        cell * CELL_WORDS + field
    }

    fn try_lock(&self, cell: usize) -> bool {
        atomic_xchg(self.cells, self.cell_word(cell, CELL_LOCK), LOCKED) == UNLOCKED
    }

    fn unlock(&self, cell: usize) {
        atomic_xchg(self.cells, self.cell_word(cell, CELL_LOCK), UNLOCKED);
    }

    fn remove(&self, cell: usize, k: usize) -> bool {
        if !self.try_lock(cell) {
            return false;
        }
        let last = self.cars_per_cell - 1;
        for j in k..last {
            let behind = self.slot_car(cell, j + 1);
            self.set_slot(cell, j, behind);
            if behind == NONE {
                self.unlock(cell);
                return true;
            }
        }
        self.set_slot(cell, last, NONE);
        self.unlock(cell);
        true
    }
}

/// Advances the cars of one cell.
fn do_step_car_pre(args: &LaunchArgs<'_>, cell: usize) {
    let lanes = Lanes::new(args);
    if cell as i32 >= lanes.cells_len {
        return;
    }
    let junctions = args.buffer(3);
    let dt = args.float(11);
    let nearest = load_i32(lanes.cells, lanes.cell_word(cell, CELL_NEAREST));
    let mut leader = NONE;
    for k in 0..lanes.cars_per_cell {
        let me = lanes.slot_car(cell, k);
        if me == NONE || me >= lanes.cars_len {
            break;
        }
        lanes.set_processed(me, 0);
        let speed = lanes.speed(me);
        let position = lanes.position_in_cell(me) + speed * dt;
        store_f32(lanes.cars, lanes.car(me, CAR_POSITION_IN_CELL), position);
        if speed < WAITING_SPEED {
            add_waiting_at(junctions, nearest);
        }

        let speed = if leader == NONE {
            (speed + dt).min(SPEED_LIMIT)
        } else {
            let gap = lanes.rear(leader) - position;
            let mut speed = if gap < 0.0 {
                0.0
            } else {
                (speed + dt).min(gap).min(SPEED_LIMIT)
            };
            if speed >= 1.0 && lanes.random(lanes.seed.wrapping_add(me)) < SLOWDOWN_PROBABILITY {
                speed -= 1.0;
            }
            speed
        };
        lanes.set_speed(me, speed);
        leader = me;
    }
}

/// Runs one pass of lane transitions for one cell.
fn do_step_car_post(args: &LaunchArgs<'_>, cell: usize) {
    let lanes = Lanes::new(args);
    if cell as i32 >= lanes.cells_len {
        return;
    }
    let changed = args.buffer(11);
    let length = load_f32(lanes.cells, lanes.cell_word(cell, CELL_LENGTH));
    let mut k = 0;
    while k < lanes.cars_per_cell {
        let me = lanes.slot_car(cell, k);
        if me == NONE || me >= lanes.cars_len {
            break;
        }
        if atomic_xchg(lanes.cars, lanes.car(me, CAR_PROCESSED), 1) != 0 {
            k += 1;
            continue;
        }
        let position_in_cell = lanes.position_in_cell(me);
        if position_in_cell < length {
            k += 1;
            continue;
        }

        let key = lanes.seed.wrapping_add(cell as i32).wrapping_add(k as i32);
        let next = next_cell_at(lanes.cells, lanes.cell_word(cell, CELL_TARGETS), lanes.random(key));
        if next == NONE {
            lanes.set_speed(me, 0.0);
            k += 1;
            continue;
        }
        let next = next as usize;
        if load_i32(lanes.cells, lanes.cell_word(next, CELL_JUNCTION)) == TERMINATOR {
            if lanes.remove(cell, k) {
                store_i32(lanes.cars, lanes.car(me, CAR_POSITION), NONE);
                store_f32(lanes.cars, lanes.car(me, CAR_POSITION_IN_CELL), 0.0);
                lanes.set_speed(me, 0.0);
            } else {
                lanes.set_processed(me, 0);
                store_i32(changed, 0, 1);
                k += 1;
            }
            continue;
        }
        if !lanes.try_lock(next) {
            lanes.set_processed(me, 0);
            store_i32(changed, 0, 1);
            k += 1;
            continue;
        }

        let mut outcome = ENTRY_BLOCKED;
        if let Some(free) = lanes.first_free(next) {
            lanes.set_slot(next, free, me);
            let overshoot = position_in_cell - length;
            let mut target_position = overshoot;
            let mut clamped = false;
            let mut fits = true;
            if free > 0 {
                let gap = lanes.rear(lanes.slot_car(next, free - 1));
                if overshoot > gap {
                    if gap < 0.0 {
                        fits = false;
                    } else {
                        target_position = gap;
                        clamped = true;
                    }
                }
            }
            if !fits {
                lanes.set_slot(next, free, NONE);
            } else if !lanes.remove(cell, k) {
                lanes.set_slot(next, free, NONE);
                outcome = ENTRY_POSTPONED;
            } else {
                store_i32(lanes.cars, lanes.car(me, CAR_POSITION), next as i32);
                store_f32(lanes.cars, lanes.car(me, CAR_POSITION_IN_CELL), target_position);
                if clamped {
                    lanes.set_speed(me, lanes.speed(me).min(target_position));
                }
                outcome = ENTRY_MOVED;
            }
        }
        lanes.unlock(next);

        match outcome {
            ENTRY_MOVED => {
                lanes.set_processed(me, 0);
                store_i32(changed, 0, 1);
            }
            ENTRY_POSTPONED => {
                lanes.set_processed(me, 0);
                store_i32(changed, 0, 1);
                k += 1;
            }
            _ => {
                lanes.set_speed(me, 0.0);
                k += 1;
            }
        }
    }
}

/// Runs one generator.
fn spawn_cars(args: &LaunchArgs<'_>, index: usize) {
    if index as i32 >= args.int(4) {
        return;
    }
    let lanes = Lanes::new(args);
    let generators = args.buffer(3);
    let dt = args.float(11);
    let cars_len = lanes.cars_len.max(0) as usize;
    let generator = index * GENERATOR_WORDS;

    let time_left = load_f32(generators, generator + GENERATOR_TIME_LEFT);
    if time_left > 0.0 {
        store_f32(generators, generator + GENERATOR_TIME_LEFT, time_left - dt);
        return;
    }
    let me = index as i32;
    let key = lanes.seed.wrapping_mul(me.wrapping_add(1));
    let lambda = load_f32(generators, generator + GENERATOR_LAMBDA);
    store_f32(generators, generator + GENERATOR_TIME_LEFT, exp_sample(lanes.random(key), lambda));
    let size = spawn_size(lanes.random(key.wrapping_mul(2)));

    let cell = load_i32(generators, generator + GENERATOR_CELL);
    for slot in rotated_range(cars_len, cars_len / 2 + 10 * index) {
        let car = slot as i32;
        if atomic_cmpxchg(lanes.cars, lanes.car(car, CAR_POSITION), NONE, cell) != NONE {
            continue;
        }
        let lane = cell as usize;
        let spawned = match lanes.first_free(lane) {
            Some(free) => {
                lanes.set_slot(lane, free, car);
                if free == 0 || lanes.rear(lanes.slot_car(lane, free - 1)) >= 0.0 {
                    true
                } else {
                    lanes.set_slot(lane, free, NONE);
                    false
                }
            }
            None => false,
        };
        if spawned {
            store_f32(lanes.cars, lanes.car(car, CAR_POSITION_IN_CELL), 0.0);
            lanes.set_speed(car, 0.0);
            store_i32(lanes.cars, lanes.car(car, CAR_SIZE), size);
            lanes.set_processed(car, 1);
        } else {
            atomic_xchg(lanes.cars, lanes.car(car, CAR_POSITION), NONE);
        }
        break;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::car_following::{generate, reference, Car, SimulationData, DT};
    use crate::dispatch::Resolved;
    use crate::random::RandomTable;
    use crate::GenerationParams;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn words(values: Vec<u32>) -> Vec<AtomicU32> {
        values.into_iter().map(AtomicU32::new).collect()
    }

    fn read(words: &[AtomicU32]) -> Vec<u32> {
        words.iter().map(|word| word.load(Ordering::Relaxed)).collect()
    }

    #[test]
    fn pre_phase_matches_reference() {
        let params = GenerationParams::new(10, 2, 2, 40, 40, 0.2).with_seed(6);
        let random = RandomTable::new(Some(2));
        let mut data: SimulationData = generate(&params);

        let cells = words(pack(&data.cells));
        let slots = words(
            data.slots
                .iter()
                .map(|slot| slot.load(Ordering::Relaxed) as u32)
                .collect(),
        );
        let junctions = words(pack(&data.junctions));
        let cars = words(pack(&data.cars));
        let table = words(random.as_slice().iter().map(|value| value.to_bits()).collect());
        let changed = words(vec![0]);
        let mut args = vec![
            Resolved::Buffer(&cells),
            Resolved::Buffer(&slots),
            Resolved::Int(data.cells.len() as i32),
            Resolved::Buffer(&junctions),
            Resolved::Int(data.junctions.len() as i32),
            Resolved::Buffer(&cars),
            Resolved::Int(data.cars.len() as i32),
            Resolved::Int(data.cars_per_cell as i32),
            Resolved::Buffer(&table),
            Resolved::Int(random.len() as i32),
            Resolved::Int(5),
            Resolved::Float(DT),
        ];
        let pre = LaunchArgs::new(args.clone());
        for cell in 0..data.cells.len() {
            do_step_car_pre(&pre, cell);
        }
        args[11] = Resolved::Buffer(&changed);
        let post = LaunchArgs::new(args);
        loop {
            changed[0].store(0, Ordering::Relaxed);
            for cell in 0..data.cells.len() {
                do_step_car_post(&post, cell);
            }
            if changed[0].load(Ordering::Relaxed) == 0 {
                break;
            }
        }

        let pool = rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap();
        pool.install(|| reference::step(&mut data, &random, 5, false));

        let device = unpack::<Car>(&read(&cars));
        for (device, host) in device.iter().zip(&data.cars) {
            assert_eq!(device.position(), host.position());
            assert_eq!(device.position_in_cell().to_bits(), host.position_in_cell().to_bits());
            assert_eq!(device.speed().to_bits(), host.speed().to_bits());
        }
        let host_slots = data
            .slots
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed) as u32)
            .collect::<Vec<_>>();
        assert_eq!(read(&slots), host_slots);
    }

    #[test]
    fn removal_at_terminator_leaves_flag_clear() {
        let params = GenerationParams::new(10, 1, 1, 0, 1, 0.1).with_seed(3);
        let mut data: SimulationData = generate(&params);
        let cell = (0..data.cells.len())
            .find(|&cell| {
                data.cells[cell]
                    .routing()
                    .target(0)
                    .map_or(false, |next| data.cells[next].is_terminator())
            })
            .unwrap();
        data.cars[0] = Car::new(cell as i32, 10.5, 3.0, 1);
        data.slots[cell * data.cars_per_cell].store(0, Ordering::Relaxed);
        let random = RandomTable::from_values(vec![0.5]).unwrap();

        let cells = words(pack(&data.cells));
        let slots = words(
            data.slots
                .iter()
                .map(|slot| slot.load(Ordering::Relaxed) as u32)
                .collect(),
        );
        let junctions = words(pack(&data.junctions));
        let cars = words(pack(&data.cars));
        let table = words(random.as_slice().iter().map(|value| value.to_bits()).collect());
        let changed = words(vec![0]);
        let post = LaunchArgs::new(vec![
            Resolved::Buffer(&cells),
            Resolved::Buffer(&slots),
            Resolved::Int(data.cells.len() as i32),
            Resolved::Buffer(&junctions),
            Resolved::Int(data.junctions.len() as i32),
            Resolved::Buffer(&cars),
            Resolved::Int(data.cars.len() as i32),
            Resolved::Int(data.cars_per_cell as i32),
            Resolved::Buffer(&table),
            Resolved::Int(random.len() as i32),
            Resolved::Int(2),
            Resolved::Buffer(&changed),
        ]);
        for cell in 0..data.cells.len() {
            do_step_car_post(&post, cell);
        }

        assert_eq!(changed[0].load(Ordering::Relaxed), 0);
        let device = unpack::<Car>(&read(&cars));
        assert_eq!(device[0].position(), None);
        assert_eq!(read(&slots)[cell * data.cars_per_cell], NONE as u32);
    }
}
