//! The continuous car-following model.
//!
//! Each cell is a lane segment of a given length with `cars_per_cell` ordered slots. Slot 0
//! holds the car furthest along the cell; every car follows the car in the slot before it.
//! Cars that cross the end of their cell move on to the next cell in a post-phase that is
//! repeated until no lane changes any more.

use crate::checkpoint::{check_ref, CheckpointReader, CheckpointWriter};
use crate::kernels::DeviceRecord;
use crate::network::{CarUi, CellUi, Generator, Junction, Routing, NONE, TARGETS, TERMINATOR};
use crate::util::{index, AtomicF32};
use crate::{CheckpointError, IntegrityReport};
use cgmath::Point2;
use std::io::Read;
use std::sync::atomic::{AtomicI32, Ordering};

pub(crate) use generate::generate;

pub(crate) mod accelerated;
mod generate;
pub(crate) mod reference;

/// Maximum speed of a car.
pub const SPEED_LIMIT: f32 = 6.0; // units/step

/// Probability of a random unit slowdown of a following car.
pub const SLOWDOWN_PROBABILITY: f32 = 0.2;

/// Length of a step.
pub const DT: f32 = 1.0;

/// Cars slower than this count as waiting.
pub const WAITING_SPEED: f32 = 0.1; // units/step

/// Fixpoint passes after which a step is reported as slow to settle.
pub(crate) const LONG_FIXPOINT: usize = 1024;

pub(crate) const UNLOCKED: i32 = 0;
pub(crate) const LOCKED: i32 = 1;

/// A lane segment.
#[derive(Debug)]
pub struct Cell {
    pub(crate) routing: Routing,
    /// The junction this cell belongs to, [NONE], or [TERMINATOR].
    pub(crate) junction_index: i32,
    pub(crate) nearest_junction_index: i32,
    /// The distance a car covers before leaving the cell.
    pub(crate) length: f32,
    /// Guards slot list changes made on behalf of other cells.
    pub(crate) lock: AtomicI32,
}

impl Cell {
    pub(crate) fn new(routing: Routing, junction_index: i32, nearest_junction_index: i32, length: f32) -> Self {
        Self {
            routing,
            junction_index,
            nearest_junction_index,
            length,
            lock: AtomicI32::new(UNLOCKED),
        }
    }

    pub fn routing(&self) -> &Routing {
        &self.routing
    }

    pub fn junction(&self) -> Option<usize> {
        index(self.junction_index)
    }

    pub fn is_terminator(&self) -> bool {
        self.junction_index == TERMINATOR
    }

    pub fn nearest_junction(&self) -> Option<usize> {
        index(self.nearest_junction_index)
    }

    pub fn length(&self) -> f32 {
        self.length
    }

    /// Attempts to take the cell's lock without waiting.
    pub(crate) fn try_lock(&self) -> bool {
        self.lock.swap(LOCKED, Ordering::Acquire) == UNLOCKED
    }

    pub(crate) fn unlock(&self) {
        self.lock.store(UNLOCKED, Ordering::Release);
    }
}

/// A car in the car-following model.
#[derive(Debug, Default)]
pub struct Car {
    /// The cell the car is in, or [NONE] when not spawned.
    pub(crate) position: AtomicI32,
    /// The position of the car's front bumper within its cell.
    pub(crate) position_in_cell: AtomicF32,
    pub(crate) speed: AtomicF32,
    pub(crate) size: AtomicI32,
    /// Set once the car has been looked at in a post-phase pass.
    pub(crate) already_processed: AtomicI32,
}

impl Car {
    pub(crate) fn new(position: i32, position_in_cell: f32, speed: f32, size: i32) -> Self {
        Self {
            position: AtomicI32::new(position),
            position_in_cell: AtomicF32::new(position_in_cell),
            speed: AtomicF32::new(speed),
            size: AtomicI32::new(size),
            already_processed: AtomicI32::new(0),
        }
    }

    pub fn position(&self) -> Option<usize> {
        index(self.position.load(Ordering::Relaxed))
    }

    pub fn position_in_cell(&self) -> f32 {
        self.position_in_cell.load()
    }

    pub fn speed(&self) -> f32 {
        self.speed.load()
    }

    pub fn size(&self) -> i32 {
        self.size.load(Ordering::Relaxed)
    }

    /// The position of the rear bumper within the cell; negative while the car straddles
    /// the start of the cell.
    pub(crate) fn rear(&self) -> f32 {
        self.position_in_cell() - self.size() as f32
    }
}

/// The complete state of a car-following simulation.
#[derive(Debug)]
pub struct SimulationData {
    pub(crate) cells: Vec<Cell>,
    pub(crate) cars_per_cell: usize,
    /// `cars_per_cell` car indices per cell, ordered from the front of the cell.
    pub(crate) slots: Vec<AtomicI32>,
    pub(crate) junctions: Vec<Junction>,
    pub(crate) generators: Vec<Generator>,
    pub(crate) cars: Vec<Car>,
    pub(crate) cells_ui: Vec<CellUi>,
    pub(crate) cars_ui: Vec<CarUi>,
}

impl SimulationData {
    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    /// The number of lane slots of every cell.
    pub fn cars_per_cell(&self) -> usize {
        self.cars_per_cell
    }

    pub fn junctions(&self) -> &[Junction] {
        &self.junctions
    }

    pub fn generators(&self) -> &[Generator] {
        &self.generators
    }

    pub fn cars(&self) -> &[Car] {
        &self.cars
    }

    pub fn cells_ui(&self) -> &[CellUi] {
        &self.cells_ui
    }

    pub fn cars_ui(&self) -> &[CarUi] {
        &self.cars_ui
    }

    /// The slots of a cell.
    pub(crate) fn lane(&self, cell: usize) -> &[AtomicI32] {
        &self.slots[cell * self.cars_per_cell..(cell + 1) * self.cars_per_cell]
    }

    /// The cars in a cell, front first.
    pub fn cars_in(&self, cell: usize) -> Vec<usize> {
        self.lane(cell)
            .iter()
            .map_while(|slot| index(slot.load(Ordering::Relaxed)))
            .collect()
    }

    pub(crate) fn check_integrity(&self) -> IntegrityReport {
        let mut report = IntegrityReport::default();
        let mut occurrences = vec![0u32; self.cars.len()];
        for cell in 0..self.cells.len() {
            let mut ended = false;
            let mut previous: Option<f32> = None;
            for slot in self.lane(cell) {
                let car = slot.load(Ordering::Relaxed);
                if car == NONE {
                    ended = true;
                    continue;
                }
                if ended {
                    report.broken_cars += 1;
                }
                let Some(entry) = index(car).and_then(|car| occurrences.get_mut(car)) else {
                    report.broken_cars += 1;
                    continue;
                };
                *entry += 1;
                let car = &self.cars[car as usize];
                if car.position.load(Ordering::Relaxed) != cell as i32 {
                    report.broken_cars += 1;
                }
                let position = car.position_in_cell();
                if previous.map_or(false, |previous| position > previous) {
                    report.misordered_slots += 1;
                }
                previous = Some(position);
            }
        }
        for (car, &count) in self.cars.iter().zip(&occurrences) {
            if car.position.load(Ordering::Relaxed) != NONE {
                report.active_cars += 1;
                if count != 1 {
                    report.broken_cars += 1;
                }
            }
        }
        report.waiting_cars = self
            .junctions
            .iter()
            .map(|junction| junction.waiting_count() as u64)
            .sum();
        report.consistent = report.broken_cars == 0;
        report
    }

    pub(crate) fn save(&self, w: &mut CheckpointWriter) {
        w.count(self.cells.len());
        for (cell, ui) in self.cells.iter().zip(&self.cells_ui) {
            for target in cell.routing.targets {
                w.i32(target);
            }
            for probability in cell.routing.probabilities {
                w.f32(probability);
            }
            w.i32(cell.junction_index);
            w.i32(cell.nearest_junction_index);
            w.f32(cell.length);
            w.i32(ui.position.x);
            w.i32(ui.position.y);
        }
        w.count(self.cars_per_cell);
        for slot in &self.slots {
            w.i32(slot.load(Ordering::Relaxed));
        }
        w.count(self.junctions.len());
        for junction in &self.junctions {
            w.i32(junction.cell_index);
            w.i32(junction.waiting_count());
        }
        w.count(self.generators.len());
        for generator in &self.generators {
            w.i32(generator.cell_index);
            w.f32(generator.probability_lambda);
            w.f32(generator.time_left);
        }
        w.count(self.cars.len());
        for (car, ui) in self.cars.iter().zip(&self.cars_ui) {
            w.i32(car.position.load(Ordering::Relaxed));
            w.f32(car.position_in_cell());
            w.f32(car.speed());
            w.i32(car.size());
            w.i32(ui.color);
        }
    }

    pub(crate) fn load<R: Read>(r: &mut CheckpointReader<R>) -> Result<Self, CheckpointError> {
        let count = r.count()?;
        let mut cells = Vec::with_capacity(count.min(1 << 20));
        let mut cells_ui = Vec::with_capacity(count.min(1 << 20));
        for _ in 0..count {
            let mut targets = [NONE; TARGETS];
            for target in &mut targets {
                *target = r.i32()?;
            }
            let mut probabilities = [0.0; TARGETS];
            for probability in &mut probabilities {
                *probability = r.f32()?;
            }
            let junction_index = r.i32()?;
            let nearest_junction_index = r.i32()?;
            let length = r.f32()?;
            cells.push(Cell::new(
                Routing::new(targets, probabilities),
                junction_index,
                nearest_junction_index,
                length,
            ));
            let x = r.i32()?;
            let y = r.i32()?;
            cells_ui.push(CellUi {
                position: Point2::new(x, y),
            });
        }
        let cars_per_cell = r.count()?;
        if cars_per_cell == 0 && !cells.is_empty() {
            return Err(CheckpointError::Corrupt("cells without lane slots"));
        }
        let slot_count = cells
            .len()
            .checked_mul(cars_per_cell)
            .ok_or(CheckpointError::Corrupt("too many lane slots"))?;
        let mut slots = Vec::with_capacity(slot_count.min(1 << 22));
        for _ in 0..slot_count {
            slots.push(AtomicI32::new(r.i32()?));
        }
        let count = r.count()?;
        let mut junctions = Vec::with_capacity(count.min(1 << 20));
        for _ in 0..count {
            let cell_index = r.i32()?;
            junctions.push(Junction::new(cell_index, r.i32()?));
        }
        let count = r.count()?;
        let mut generators = Vec::with_capacity(count.min(1 << 20));
        for _ in 0..count {
            generators.push(Generator {
                cell_index: r.i32()?,
                probability_lambda: r.f32()?,
                time_left: r.f32()?,
            });
        }
        let count = r.count()?;
        let mut cars = Vec::with_capacity(count.min(1 << 20));
        let mut cars_ui = Vec::with_capacity(count.min(1 << 20));
        for _ in 0..count {
            let position = r.i32()?;
            let position_in_cell = r.f32()?;
            let speed = r.f32()?;
            let size = r.i32()?;
            cars.push(Car::new(position, position_in_cell, speed, size));
            cars_ui.push(CarUi { color: r.i32()? });
        }
        let data = Self {
            cells,
            cars_per_cell,
            slots,
            junctions,
            generators,
            cars,
            cells_ui,
            cars_ui,
        };
        data.validate()?;
        Ok(data)
    }

    fn validate(&self) -> Result<(), CheckpointError> {
        let cells = self.cells.len();
        for cell in &self.cells {
            for &target in &cell.routing.targets {
                check_ref(target, cells, "cell target out of range")?;
            }
            if cell.junction_index != TERMINATOR {
                check_ref(cell.junction_index, self.junctions.len(), "junction out of range")?;
            }
            check_ref(
                cell.nearest_junction_index,
                self.junctions.len(),
                "nearest junction out of range",
            )?;
            if !cell.length.is_finite() || cell.length < 0.0 {
                return Err(CheckpointError::Corrupt("invalid cell length"));
            }
        }
        for slot in &self.slots {
            check_ref(slot.load(Ordering::Relaxed), self.cars.len(), "slot car out of range")?;
        }
        for junction in &self.junctions {
            if junction.cell_index == NONE {
                return Err(CheckpointError::Corrupt("junction without cell"));
            }
            check_ref(junction.cell_index, cells, "junction cell out of range")?;
        }
        for generator in &self.generators {
            if generator.cell_index == NONE {
                return Err(CheckpointError::Corrupt("generator without cell"));
            }
            check_ref(generator.cell_index, cells, "generator cell out of range")?;
        }
        for car in &self.cars {
            check_ref(car.position.load(Ordering::Relaxed), cells, "car position out of range")?;
        }
        if self.cars.len() > i32::MAX as usize || self.cars_per_cell > i32::MAX as usize {
            return Err(CheckpointError::Corrupt("too many cars"));
        }
        Ok(())
    }
}

pub(crate) const CELL_WORDS: usize = 2 * TARGETS + 4;
pub(crate) const CELL_TARGETS: usize = 0;
pub(crate) const CELL_JUNCTION: usize = 2 * TARGETS;
pub(crate) const CELL_NEAREST: usize = 2 * TARGETS + 1;
pub(crate) const CELL_LENGTH: usize = 2 * TARGETS + 2;
pub(crate) const CELL_LOCK: usize = 2 * TARGETS + 3;

pub(crate) const CAR_WORDS: usize = 5;
pub(crate) const CAR_POSITION: usize = 0;
pub(crate) const CAR_POSITION_IN_CELL: usize = 1;
pub(crate) const CAR_SPEED: usize = 2;
pub(crate) const CAR_SIZE: usize = 3;
pub(crate) const CAR_PROCESSED: usize = 4;

impl DeviceRecord for Cell {
    const WORDS: usize = CELL_WORDS;

    fn write_words(&self, out: &mut Vec<u32>) {
        out.extend(self.routing.targets.iter().map(|&target| target as u32));
        out.extend(self.routing.probabilities.iter().map(|p| p.to_bits()));
        out.push(self.junction_index as u32);
        out.push(self.nearest_junction_index as u32);
        out.push(self.length.to_bits());
        out.push(self.lock.load(Ordering::Relaxed) as u32);
    }

    fn read_words(words: &[u32]) -> Self {
        let mut targets = [NONE; TARGETS];
        let mut probabilities = [0.0; TARGETS];
        for k in 0..TARGETS {
            targets[k] = words[CELL_TARGETS + k] as i32;
            probabilities[k] = f32::from_bits(words[CELL_TARGETS + TARGETS + k]);
        }
        let cell = Cell::new(
            Routing::new(targets, probabilities),
            words[CELL_JUNCTION] as i32,
            words[CELL_NEAREST] as i32,
            f32::from_bits(words[CELL_LENGTH]),
        );
        cell.lock.store(words[CELL_LOCK] as i32, Ordering::Relaxed);
        cell
    }
}

impl DeviceRecord for Car {
    const WORDS: usize = CAR_WORDS;

    fn write_words(&self, out: &mut Vec<u32>) {
        out.push(self.position.load(Ordering::Relaxed) as u32);
        out.push(self.position_in_cell().to_bits());
        out.push(self.speed().to_bits());
        out.push(self.size() as u32);
        out.push(self.already_processed.load(Ordering::Relaxed) as u32);
    }

    fn read_words(words: &[u32]) -> Self {
        let car = Car::new(
            words[CAR_POSITION] as i32,
            f32::from_bits(words[CAR_POSITION_IN_CELL]),
            f32::from_bits(words[CAR_SPEED]),
            words[CAR_SIZE] as i32,
        );
        car.already_processed
            .store(words[CAR_PROCESSED] as i32, Ordering::Relaxed);
        car
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::kernels::{pack, unpack};
    use crate::GenerationParams;
    use assert_approx_eq::assert_approx_eq;

    fn small() -> SimulationData {
        generate(&GenerationParams::new(12, 2, 2, 20, 30, 0.1).with_seed(7))
    }

    #[test]
    fn lanes_sorted_front_first() {
        let data = small();
        assert_eq!(data.cars_per_cell(), 12);
        for cell in 0..data.cells.len() {
            let positions = data
                .cars_in(cell)
                .into_iter()
                .map(|car| data.cars[car].position_in_cell())
                .collect::<Vec<_>>();
            assert!(positions.windows(2).all(|pair| pair[0] >= pair[1]));
        }
        let report = data.check_integrity();
        assert!(report.consistent);
        assert_eq!(report.misordered_slots, 0);
        assert_eq!(report.active_cars, 20);
    }

    #[test]
    fn slot_gap_detected() {
        let data = small();
        let cell = (0..data.cells.len())
            .find(|&cell| !data.cars_in(cell).is_empty())
            .unwrap();
        let lane = data.lane(cell);
        let car = lane[0].load(Ordering::Relaxed);
        lane[0].store(NONE, Ordering::Relaxed);
        lane[data.cars_per_cell - 1].store(car, Ordering::Relaxed);
        assert!(!data.check_integrity().consistent);
    }

    #[test]
    fn duplicate_slot_detected() {
        let data = small();
        let cell = (0..data.cells.len())
            .find(|&cell| data.cars_in(cell).len() == 1)
            .unwrap();
        let lane = data.lane(cell);
        lane[1].store(lane[0].load(Ordering::Relaxed), Ordering::Relaxed);
        let report = data.check_integrity();
        assert!(!report.consistent);
        assert_eq!(report.broken_cars, 1);
    }

    #[test]
    fn cell_lock() {
        let data = small();
        let cell = &data.cells[0];
        assert!(cell.try_lock());
        assert!(!cell.try_lock());
        cell.unlock();
        assert!(cell.try_lock());
    }

    #[test]
    fn device_records() {
        let data = small();
        let cells = unpack::<Cell>(&pack(&data.cells));
        for (copy, cell) in cells.iter().zip(&data.cells) {
            assert_eq!(copy.routing, cell.routing);
            assert_approx_eq!(copy.length, cell.length);
        }
        let car = &data.cars[0];
        let copy = Car::read_words(&pack(std::slice::from_ref(car)));
        assert_eq!(copy.position(), car.position());
        assert_approx_eq!(copy.position_in_cell(), car.position_in_cell());
    }
}
