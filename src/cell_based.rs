//! The cellular automaton model.
//!
//! Every cell holds at most one car segment. Cars are chains of `size` cells and move by
//! claiming the cells ahead of their head with compare-and-swap on the occupancy array.

use crate::checkpoint::{check_ref, CheckpointReader, CheckpointWriter};
use crate::kernels::DeviceRecord;
use crate::network::{CarUi, CellUi, Generator, Junction, Routing, NONE, TARGETS, TERMINATOR};
use crate::util::index;
use crate::{CheckpointError, IntegrityReport};
use arrayvec::ArrayVec;
use cgmath::Point2;
use std::io::Read;
use std::sync::atomic::{AtomicI32, Ordering};

pub(crate) use generate::generate;

pub(crate) mod accelerated;
mod generate;
pub(crate) mod reference;

/// Maximum speed of a car.
pub const SPEED_LIMIT: i32 = 6; // cells/step

/// Probability of a random unit slowdown.
pub const SLOWDOWN_PROBABILITY: f32 = 0.2;

/// Longest car chain the engine can track.
pub const MAX_CAR_SIZE: usize = 10; // cells

/// Number of cells sampled ahead of a car's head.
pub(crate) const FRONT_CELLS: usize = SPEED_LIMIT as usize + 1;

/// A unit of road.
#[derive(Clone, Debug, PartialEq)]
pub struct Cell {
    pub(crate) routing: Routing,
    /// The junction this cell belongs to, [NONE], or [TERMINATOR].
    pub(crate) junction_index: i32,
    /// The junction cars on this cell are waiting to enter.
    pub(crate) nearest_junction_index: i32,
}

impl Cell {
    pub fn routing(&self) -> &Routing {
        &self.routing
    }

    /// The junction this cell belongs to, if any.
    pub fn junction(&self) -> Option<usize> {
        index(self.junction_index)
    }

    /// Whether cars entering this cell leave the network.
    pub fn is_terminator(&self) -> bool {
        self.junction_index == TERMINATOR
    }

    pub fn nearest_junction(&self) -> Option<usize> {
        index(self.nearest_junction_index)
    }
}

/// A car in the cell-based model.
#[derive(Debug, Default)]
pub struct Car {
    /// The cell of the car's tail, or [NONE] when not spawned.
    pub(crate) position: AtomicI32,
    pub(crate) speed: AtomicI32,
    /// The number of cells the car occupies.
    pub(crate) size: AtomicI32,
}

impl Car {
    pub(crate) fn new(position: i32, speed: i32, size: i32) -> Self {
        Self {
            position: AtomicI32::new(position),
            speed: AtomicI32::new(speed),
            size: AtomicI32::new(size),
        }
    }

    /// The cell of the car's tail, if the car is spawned.
    pub fn position(&self) -> Option<usize> {
        index(self.position.load(Ordering::Relaxed))
    }

    /// The current speed in cells per step.
    pub fn speed(&self) -> i32 {
        self.speed.load(Ordering::Relaxed)
    }

    pub fn size(&self) -> i32 {
        self.size.load(Ordering::Relaxed)
    }
}

/// The complete state of a cell-based simulation.
#[derive(Debug)]
pub struct SimulationData {
    pub(crate) cells: Vec<Cell>,
    /// The car occupying each cell, or [NONE].
    pub(crate) occupancy: Vec<AtomicI32>,
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

    /// The car occupying the given cell, if any.
    pub fn occupant(&self, cell: usize) -> Option<usize> {
        index(self.occupancy[cell].load(Ordering::Relaxed))
    }

    /// The cells occupied by a car, tail first, if its chain is intact.
    pub fn car_cells(&self, car: usize) -> Option<Vec<usize>> {
        let position = self.cars[car].position.load(Ordering::Relaxed);
        let size = self.cars[car].size();
        if position == NONE {
            return None;
        }
        let chain = find_car_cells(&self.cells, &self.occupancy, car as i32, position, size);
        (size >= 1 && chain.len() == size as usize)
            .then(|| chain.iter().map(|&cell| cell as usize).collect())
    }

    /// Re-walks every active car's chain and recounts the statistics.
    pub(crate) fn check_integrity(&self) -> IntegrityReport {
        let mut report = IntegrityReport::default();
        for (index, car) in self.cars.iter().enumerate() {
            let position = car.position.load(Ordering::Relaxed);
            if position == NONE {
                continue;
            }
            report.active_cars += 1;
            let size = car.size();
            let chain = find_car_cells(&self.cells, &self.occupancy, index as i32, position, size);
            let owns_tail = self.occupancy[position as usize].load(Ordering::Relaxed) == index as i32;
            if size < 1 || chain.len() != size as usize || !owns_tail {
                report.broken_cars += 1;
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
        for ((cell, occupant), ui) in self.cells.iter().zip(&self.occupancy).zip(&self.cells_ui) {
            for target in cell.routing.targets {
                w.i32(target);
            }
            for probability in cell.routing.probabilities {
                w.f32(probability);
            }
            w.i32(cell.junction_index);
            w.i32(cell.nearest_junction_index);
            w.i32(occupant.load(Ordering::Relaxed));
            w.i32(ui.position.x);
            w.i32(ui.position.y);
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
            w.i32(car.speed());
            w.i32(car.size());
            w.i32(ui.color);
        }
    }

    pub(crate) fn load<R: Read>(r: &mut CheckpointReader<R>) -> Result<Self, CheckpointError> {
        let count = r.count()?;
        let mut cells = Vec::with_capacity(count.min(1 << 20));
        let mut occupancy = Vec::with_capacity(count.min(1 << 20));
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
            cells.push(Cell {
                routing: Routing::new(targets, probabilities),
                junction_index: r.i32()?,
                nearest_junction_index: r.i32()?,
            });
            occupancy.push(AtomicI32::new(r.i32()?));
            let x = r.i32()?;
            let y = r.i32()?;
            cells_ui.push(CellUi {
                position: Point2::new(x, y),
            });
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
            let speed = r.i32()?;
            let size = r.i32()?;
            cars.push(Car::new(position, speed, size));
            cars_ui.push(CarUi { color: r.i32()? });
        }
        let data = Self {
            cells,
            occupancy,
            junctions,
            generators,
            cars,
            cells_ui,
            cars_ui,
        };
        data.validate()?;
        Ok(data)
    }

    /// Checks that every stored index refers to an existing record.
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
        }
        for occupant in &self.occupancy {
            check_ref(occupant.load(Ordering::Relaxed), self.cars.len(), "occupant out of range")?;
        }
        for junction in &self.junctions {
            check_ref(junction.cell_index, cells, "junction cell out of range")?;
            if junction.cell_index == NONE {
                return Err(CheckpointError::Corrupt("junction without cell"));
            }
        }
        for generator in &self.generators {
            check_ref(generator.cell_index, cells, "generator cell out of range")?;
            if generator.cell_index == NONE {
                return Err(CheckpointError::Corrupt("generator without cell"));
            }
        }
        for car in &self.cars {
            check_ref(car.position.load(Ordering::Relaxed), cells, "car position out of range")?;
        }
        if self.cars.len() > i32::MAX as usize {
            return Err(CheckpointError::Corrupt("too many cars"));
        }
        Ok(())
    }
}

/// Walks a car's chain from its tail, following transitions onto cells it occupies.
///
/// The chain is shorter than `size` when it cannot be walked completely.
pub(crate) fn find_car_cells(
    cells: &[Cell],
    occupancy: &[AtomicI32],
    car: i32,
    position: i32,
    size: i32,
) -> ArrayVec<i32, MAX_CAR_SIZE> {
    let mut chain = ArrayVec::new();
    if size < 1 || size as usize > MAX_CAR_SIZE {
        return chain;
    }
    chain.push(position);
    let mut cell = position;
    for _ in 1..size {
        let next = cells[cell as usize].routing.targets.iter().copied().find(|&target| {
            target != NONE && occupancy[target as usize].load(Ordering::Relaxed) == car
        });
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

pub(crate) const CELL_WORDS: usize = 2 * TARGETS + 2;
pub(crate) const CELL_TARGETS: usize = 0;
pub(crate) const CELL_JUNCTION: usize = 2 * TARGETS;
pub(crate) const CELL_NEAREST: usize = 2 * TARGETS + 1;

pub(crate) const CAR_WORDS: usize = 3;
pub(crate) const CAR_POSITION: usize = 0;
pub(crate) const CAR_SPEED: usize = 1;
pub(crate) const CAR_SIZE: usize = 2;

impl DeviceRecord for Cell {
    const WORDS: usize = CELL_WORDS;

    fn write_words(&self, out: &mut Vec<u32>) {
        out.extend(self.routing.targets.iter().map(|&target| target as u32));
        out.extend(self.routing.probabilities.iter().map(|p| p.to_bits()));
        out.push(self.junction_index as u32);
        out.push(self.nearest_junction_index as u32);
    }

    fn read_words(words: &[u32]) -> Self {
        let mut targets = [NONE; TARGETS];
        let mut probabilities = [0.0; TARGETS];
        for k in 0..TARGETS {
            targets[k] = words[CELL_TARGETS + k] as i32;
            probabilities[k] = f32::from_bits(words[CELL_TARGETS + TARGETS + k]);
        }
        Cell {
            routing: Routing::new(targets, probabilities),
            junction_index: words[CELL_JUNCTION] as i32,
            nearest_junction_index: words[CELL_NEAREST] as i32,
        }
    }
}

impl DeviceRecord for Car {
    const WORDS: usize = CAR_WORDS;

    fn write_words(&self, out: &mut Vec<u32>) {
        out.push(self.position.load(Ordering::Relaxed) as u32);
        out.push(self.speed() as u32);
        out.push(self.size() as u32);
    }

    fn read_words(words: &[u32]) -> Self {
        Car::new(
            words[CAR_POSITION] as i32,
            words[CAR_SPEED] as i32,
            words[CAR_SIZE] as i32,
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::kernels::{pack, unpack};
    use crate::GenerationParams;

    fn small() -> SimulationData {
        generate(&GenerationParams::new(6, 2, 2, 20, 30, 0.1).with_seed(99))
    }

    #[test]
    fn chains_of_generated_cars() {
        let data = small();
        for (index, car) in data.cars.iter().enumerate() {
            match car.position() {
                Some(_) => {
                    let chain = data.car_cells(index).unwrap();
                    assert_eq!(chain.len(), car.size() as usize);
                    for cell in chain {
                        assert_eq!(data.occupant(cell), Some(index));
                    }
                }
                None => assert!(data.car_cells(index).is_none()),
            }
        }
        assert!(data.check_integrity().consistent);
    }

    #[test]
    fn broken_chain_detected() {
        let data = small();
        let (index, car) = data
            .cars
            .iter()
            .enumerate()
            .find(|(_, car)| car.size() > 1)
            .unwrap();
        let chain = data.car_cells(index).unwrap();
        data.occupancy[chain[1]].store(NONE, Ordering::Relaxed);
        let report = data.check_integrity();
        assert!(!report.consistent);
        assert_eq!(report.broken_cars, 1);
        assert!(car.position().is_some());
    }

    #[test]
    fn device_records() {
        let data = small();
        let cells = unpack::<Cell>(&pack(&data.cells));
        assert_eq!(cells, data.cells);
        let car = &data.cars[0];
        let words = pack(std::slice::from_ref(car));
        let copy = Car::read_words(&words);
        assert_eq!(copy.position(), car.position());
        assert_eq!(copy.size(), car.size());
    }
}
