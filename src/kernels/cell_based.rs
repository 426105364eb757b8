//! Kernels of the cellular automaton model.
//!
//! `do_step_car` and `spawn_cars` take
//! `(cells, occupancy, cells_len, junctions | generators, len, cars, cars_len, random, random_len, seed)`.

use super::*;
use crate::cell_based::{CAR_POSITION, CAR_SIZE, CAR_SPEED, CAR_WORDS, CELL_JUNCTION, CELL_NEAREST};
use crate::cell_based::{CELL_TARGETS, CELL_WORDS, FRONT_CELLS, MAX_CAR_SIZE};
use crate::cell_based::{SLOWDOWN_PROBABILITY, SPEED_LIMIT};
use crate::dispatch::Access;
use crate::network::{NONE, TERMINATOR};
use crate::random::{exp_sample, spawn_size};
use crate::util::rotated_range;
use arrayvec::ArrayVec;

/// Position of the seed in the argument list of the step kernels.
pub(crate) const SEED_ARG: usize = 9;

const STEP_SIGNATURE: &[ArgKind] = &[
    ArgKind::Buffer(Access::ReadOnly),
    ArgKind::Buffer(Access::ReadWrite),
    ArgKind::Int,
    ArgKind::Buffer(Access::ReadWrite),
    ArgKind::Int,
    ArgKind::Buffer(Access::ReadWrite),
    ArgKind::Int,
    ArgKind::Buffer(Access::ReadOnly),
    ArgKind::Int,
    ArgKind::Int,
];

pub(crate) static PROGRAM: Program = Program {
    name: "cell_based",
    kernels: &[
        KernelEntry {
            name: "reset_junctions",
            signature: RESET_JUNCTIONS_SIGNATURE,
            func: reset_junctions,
        },
        KernelEntry {
            name: "do_step_car",
            signature: STEP_SIGNATURE,
            func: do_step_car,
        },
        KernelEntry {
            name: "spawn_cars",
            signature: STEP_SIGNATURE,
            func: spawn_cars,
        },
    ],
};

/// The lane memory shared by both kernels.
struct Lanes<'a> {
    cells: &'a Words,
    occupancy: &'a Words,
    cells_len: i32,
    random: &'a Words,
    random_len: i32,
    seed: i32,
}

impl<'a> Lanes<'a> {
    fn new(args: &LaunchArgs<'a>) -> Self {
        Self {
            cells: args.buffer(0),
            occupancy: args.buffer(1),
            cells_len: args.int(2),
            random: args.buffer(7),
            random_len: args.int(8),
            seed: args.int(SEED_ARG),
        }
    }

    fn random(&self, key: i32) -> f32 {
        random_at(self.random, self.random_len, key)
    }

    fn is_free(&self, cell: i32) -> bool {
        cell != NONE && load_i32(self.occupancy, cell as usize) == NONE
    }

    fn claim(&self, cell: i32, car: i32) -> bool {
        atomic_cmpxchg(self.occupancy, cell as usize, NONE, car) == NONE
    }

    fn release(&self, cell: i32) {
        store_i32(self.occupancy, cell as usize, NONE);
    }

    fn cell_word(&self, cell: i32, field: usize) -> i32 {
        load_i32(self.cells, cell as usize * CELL_WORDS + field)
    }

    fn next_cell(&self, cell: i32, rand: f32) -> i32 {
        next_cell_at(self.cells, cell as usize * CELL_WORDS + CELL_TARGETS, rand)
    }

    fn front_cells(&self, agent: i32, mut head: i32, count: usize) -> [i32; FRONT_CELLS] {
        let mut front = [NONE; FRONT_CELLS];
        for slot in front.iter_mut().take(count) {
            let key = self.seed.wrapping_add(agent.wrapping_mul(head));
            let next = self.next_cell(head, self.random(key));
            if next == NONE {
                break;
            }
            *slot = next;
            head = next;
        }
        front
    }

    /// Walks the cells of `car` from its tail.
    fn chain(&self, car: i32, position: i32, size: i32) -> ArrayVec<i32, MAX_CAR_SIZE> {
        let mut chain = ArrayVec::new();
        if size < 1 || size as usize > MAX_CAR_SIZE {
            return chain;
        }
        chain.push(position);
        let mut cell = position;
        for _ in 1..size {
            let next = (0..TARGETS)
                .map(|k| self.cell_word(cell, CELL_TARGETS + k))
                .find(|&target| target != NONE && load_i32(self.occupancy, target as usize) == car);
            match next {
                Some(next) => {
                    chain.push(next);
                    cell = next;
                }
                None => break,
            }
        }
        chain
    }
}

/// Moves one car.
fn do_step_car(args: &LaunchArgs<'_>, index: usize) {
    if index as i32 >= args.int(6) {
        return;
    }
    let lanes = Lanes::new(args);
    let junctions = args.buffer(3);
    let cars = args.buffer(5);
    let car = index * CAR_WORDS;

    let mut position = load_i32(cars, car + CAR_POSITION);
    if position == NONE || position >= lanes.cells_len {
        return;
    }
    let me = index as i32;
    let size = load_i32(cars, car + CAR_SIZE);
    let mut chain = lanes.chain(me, position, size);
    if size < 1 || chain.len() != size as usize {
        return;
    }

    let front = lanes.front_cells(me, chain[chain.len() - 1], FRONT_CELLS);
    let mut speed = load_i32(cars, car + CAR_SPEED).clamp(0, SPEED_LIMIT);
    let mut can_accelerate = true;
    for j in 0..speed as usize {
        if !lanes.is_free(front[j]) {
            speed = j as i32;
            can_accelerate = false;
            break;
        }
    }
    if speed < SPEED_LIMIT && can_accelerate && lanes.is_free(front[speed as usize]) {
        speed += 1;
    }
    if speed >= 1 {
        let key = lanes.seed.wrapping_add(me.wrapping_mul(chain[0]));
        if lanes.random(key) < SLOWDOWN_PROBABILITY {
            speed -= 1;
        }
    }

    for &next in front.iter().take(speed as usize) {
        if lanes.cell_word(next, CELL_JUNCTION) == TERMINATOR {
            position = NONE;
            speed = 0;
            for &cell in &chain {
                lanes.release(cell);
            }
            break;
        }
        if !lanes.claim(next, me) {
            speed = 0;
            break;
        }
        lanes.release(chain[0]);
        chain.remove(0);
        chain.push(next);
        position = chain[0];
    }

    store_i32(cars, car + CAR_POSITION, position);
    store_i32(cars, car + CAR_SPEED, speed);
    if speed == 0 {
        add_waiting_at(junctions, lanes.cell_word(chain[chain.len() - 1], CELL_NEAREST));
    }
}

/// Runs one generator.
fn spawn_cars(args: &LaunchArgs<'_>, index: usize) {
    if index as i32 >= args.int(4) {
        return;
    }
    let lanes = Lanes::new(args);
    let generators = args.buffer(3);
    let cars = args.buffer(5);
    let cars_len = args.int(6).max(0) as usize;
    let generator = index * GENERATOR_WORDS;

    let time_left = load_f32(generators, generator + GENERATOR_TIME_LEFT);
    if time_left > 0.0 {
        store_f32(generators, generator + GENERATOR_TIME_LEFT, time_left - 1.0);
        return;
    }
    let me = index as i32;
    let key = lanes.seed.wrapping_mul(me.wrapping_add(1));
    let lambda = load_f32(generators, generator + GENERATOR_LAMBDA);
    store_f32(generators, generator + GENERATOR_TIME_LEFT, exp_sample(lanes.random(key), lambda));

    let cell = load_i32(generators, generator + GENERATOR_CELL);
    if !lanes.is_free(cell) {
        return;
    }
    let size = spawn_size(lanes.random(key.wrapping_mul(2)));
    let ahead = (size - 1) as usize;
    let front = lanes.front_cells(me, cell, ahead);
    if !front[..ahead].iter().all(|&cell| lanes.is_free(cell)) {
        return;
    }

    for slot in rotated_range(cars_len, cars_len / 2 + 10 * index) {
        let car = slot * CAR_WORDS;
        if atomic_cmpxchg(cars, car + CAR_POSITION, NONE, cell) != NONE {
            continue;
        }
        let cells = std::iter::once(cell)
            .chain(front[..ahead].iter().copied())
            .collect::<ArrayVec<i32, FRONT_CELLS>>();
        let claimed = cells.iter().take_while(|&&c| lanes.claim(c, slot as i32)).count();
        if claimed < cells.len() {
            for &c in &cells[..claimed] {
                lanes.release(c);
            }
            atomic_xchg(cars, car + CAR_POSITION, NONE);
            return;
        }
        store_i32(cars, car + CAR_SPEED, 0);
        store_i32(cars, car + CAR_SIZE, size);
        break;
    }
}
