//! Accelerator kernels for both traffic models.
//!
//! Kernels see the simulation state only as flat 32-bit words laid out by the
//! [DeviceRecord] implementations of each model. Indices are `i32` words, floats are
//! stored as their bit patterns.

use crate::dispatch::{ArgKind, LaunchArgs};
use crate::network::{choose_target, Generator, Junction, TARGETS};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

pub(crate) mod car_following;
pub(crate) mod cell_based;

/// Device memory as seen by a kernel.
pub(crate) type Words = [AtomicU32];

/// A kernel entry point, invoked once per global index.
pub(crate) type KernelFn = fn(&LaunchArgs<'_>, usize);

pub(crate) struct KernelEntry {
    pub name: &'static str,
    pub signature: &'static [ArgKind],
    pub func: KernelFn,
}

/// A named collection of kernels.
pub(crate) struct Program {
    pub name: &'static str,
    pub kernels: &'static [KernelEntry],
}

impl Program {
    pub fn kernel(&self, name: &str) -> Option<&KernelEntry> {
        self.kernels.iter().find(|kernel| kernel.name == name)
    }
}

static PROGRAMS: Lazy<HashMap<&'static str, &'static Program>> = Lazy::new(|| {
    [&cell_based::PROGRAM, &car_following::PROGRAM]
        .into_iter()
        .map(|program| (program.name, program))
        .collect()
});

/// Looks up a kernel program by name.
pub(crate) fn program(name: &str) -> Option<&'static Program> {
    PROGRAMS.get(name).copied()
}

pub(crate) const JUNCTION_WORDS: usize = 2;
pub(crate) const JUNCTION_CELL: usize = 0;
pub(crate) const JUNCTION_WAITING: usize = 1;

pub(crate) const GENERATOR_WORDS: usize = 3;
pub(crate) const GENERATOR_CELL: usize = 0;
pub(crate) const GENERATOR_LAMBDA: usize = 1;
pub(crate) const GENERATOR_TIME_LEFT: usize = 2;

/// A record with a fixed-size word layout in device memory.
pub(crate) trait DeviceRecord: Sized {
    const WORDS: usize;

    fn write_words(&self, out: &mut Vec<u32>);

    fn read_words(words: &[u32]) -> Self;
}

/// Packs records into device words.
pub(crate) fn pack<T: DeviceRecord>(records: &[T]) -> Vec<u32> {
    let mut words = Vec::with_capacity(records.len() * T::WORDS);
    for record in records {
        record.write_words(&mut words);
    }
    words
}

/// Unpacks device words into records.
pub(crate) fn unpack<T: DeviceRecord>(words: &[u32]) -> Vec<T> {
    words.chunks_exact(T::WORDS).map(T::read_words).collect()
}

impl DeviceRecord for Junction {
    const WORDS: usize = JUNCTION_WORDS;

    fn write_words(&self, out: &mut Vec<u32>) {
        out.push(self.cell_index as u32);
        out.push(self.waiting_count() as u32);
    }

    fn read_words(words: &[u32]) -> Self {
        Junction::new(words[JUNCTION_CELL] as i32, words[JUNCTION_WAITING] as i32)
    }
}

impl DeviceRecord for Generator {
    const WORDS: usize = GENERATOR_WORDS;

    fn write_words(&self, out: &mut Vec<u32>) {
        out.push(self.cell_index as u32);
        out.push(self.probability_lambda.to_bits());
        out.push(self.time_left.to_bits());
    }

    fn read_words(words: &[u32]) -> Self {
        Generator {
            cell_index: words[GENERATOR_CELL] as i32,
            probability_lambda: f32::from_bits(words[GENERATOR_LAMBDA]),
            time_left: f32::from_bits(words[GENERATOR_TIME_LEFT]),
        }
    }
}

#[inline]
pub(crate) fn load_i32(mem: &Words, at: usize) -> i32 {
    mem[at].load(Ordering::Relaxed) as i32
}

#[inline]
pub(crate) fn store_i32(mem: &Words, at: usize, value: i32) {
    mem[at].store(value as u32, Ordering::Relaxed);
}

#[inline]
pub(crate) fn load_f32(mem: &Words, at: usize) -> f32 {
    f32::from_bits(mem[at].load(Ordering::Relaxed))
}

#[inline]
pub(crate) fn store_f32(mem: &Words, at: usize, value: f32) {
    mem[at].store(value.to_bits(), Ordering::Relaxed);
}

/// Compare-and-exchange; returns the previous value.
#[inline]
pub(crate) fn atomic_cmpxchg(mem: &Words, at: usize, current: i32, new: i32) -> i32 {
    match mem[at].compare_exchange(current as u32, new as u32, Ordering::SeqCst, Ordering::SeqCst) {
        Ok(old) | Err(old) => old as i32,
    }
}

/// Exchange; returns the previous value.
#[inline]
pub(crate) fn atomic_xchg(mem: &Words, at: usize, value: i32) -> i32 {
    mem[at].swap(value as u32, Ordering::SeqCst) as i32
}

#[inline]
pub(crate) fn atomic_inc(mem: &Words, at: usize) {
    mem[at].fetch_add(1, Ordering::SeqCst);
}

/// Reads the random table for a wrapping `i32` key.
#[inline]
pub(crate) fn random_at(random: &Words, random_len: i32, key: i32) -> f32 {
    load_f32(random, ((key as u32) % (random_len as u32)) as usize)
}

/// Picks the next cell from the routing words starting at `base`.
pub(crate) fn next_cell_at(cells: &Words, base: usize, rand: f32) -> i32 {
    let mut targets = [0; TARGETS];
    let mut probabilities = [0.0; TARGETS];
    for k in 0..TARGETS {
        targets[k] = load_i32(cells, base + k);
        probabilities[k] = load_f32(cells, base + TARGETS + k);
    }
    choose_target(&targets, &probabilities, rand)
}

/// Adds a stalled car to a junction's waiting counter.
pub(crate) fn add_waiting_at(junctions: &Words, junction: i32) {
    if junction >= 0 {
        atomic_inc(junctions, junction as usize * JUNCTION_WORDS + JUNCTION_WAITING);
    }
}

/// `reset_junctions(junctions, junctions_len)`
pub(crate) fn reset_junctions(args: &LaunchArgs<'_>, index: usize) {
    let junctions = args.buffer(0);
    let junctions_len = args.int(1);
    if index as i32 >= junctions_len {
        return;
    }
    store_i32(junctions, index * JUNCTION_WORDS + JUNCTION_WAITING, 0);
}

pub(crate) const RESET_JUNCTIONS_SIGNATURE: &[ArgKind] =
    &[ArgKind::Buffer(crate::dispatch::Access::ReadWrite), ArgKind::Int];

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn programs_registered() {
        let cell_based = program("cell_based").unwrap();
        assert!(cell_based.kernel("do_step_car").is_some());
        assert!(cell_based.kernel("spawn_cars").is_some());
        let car_following = program("car_following").unwrap();
        assert!(car_following.kernel("do_step_car_pre").is_some());
        assert!(car_following.kernel("do_step_car_post").is_some());
        assert!(program("unknown").is_none());
    }

    #[test]
    fn generator_words() {
        let generator = Generator {
            cell_index: 12,
            probability_lambda: 0.1,
            time_left: 3.5,
        };
        let words = pack(&[generator]);
        assert_eq!(words.len(), GENERATOR_WORDS);
        assert_eq!(unpack::<Generator>(&words), vec![generator]);
    }

    #[test]
    fn random_key_wraps() {
        let random = [0.1f32, 0.2, 0.3]
            .iter()
            .map(|v| AtomicU32::new(v.to_bits()))
            .collect::<Vec<_>>();
        // u32::MAX % 3 == 0
        assert_eq!(random_at(&random, 3, -1), 0.1);
        assert_eq!(random_at(&random, 3, 5), 0.3);
    }
}
