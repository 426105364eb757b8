//! Road network records shared by both traffic models.

use crate::util::index;
use crate::SimulationError;
use cgmath::Point2;
use rand::Rng;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI32, Ordering};

pub(crate) use builder::{build, LaneShape, Topology};

mod builder;

/// Marks an absent cell, junction or car.
pub const NONE: i32 = -1;

/// Marks a terminator cell in [Cell](crate::cell_based::Cell) junction indices.
pub const TERMINATOR: i32 = -2;

/// Number of outgoing transitions per cell.
pub const TARGETS: usize = 5;

/// The outgoing transitions of a cell and their routing probabilities.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Routing {
    pub(crate) targets: [i32; TARGETS],
    pub(crate) probabilities: [f32; TARGETS],
}

impl Routing {
    pub(crate) fn new(targets: [i32; TARGETS], probabilities: [f32; TARGETS]) -> Self {
        Self {
            targets,
            probabilities,
        }
    }

    /// Gets the `k`-th transition target, if any.
    pub fn target(&self, k: usize) -> Option<usize> {
        index(self.targets[k])
    }

    /// Gets the probability of taking the `k`-th transition.
    pub fn probability(&self, k: usize) -> f32 {
        self.probabilities[k]
    }

    /// Iterates over the existing transition targets.
    pub fn targets(&self) -> impl Iterator<Item = usize> + '_ {
        self.targets.iter().copied().filter_map(index)
    }

    /// Picks the next cell for the random value `rand`.
    pub(crate) fn next_cell(&self, rand: f32) -> i32 {
        choose_target(&self.targets, &self.probabilities, rand)
    }
}

/// Chooses a transition by walking the cumulative routing probabilities.
///
/// Falls through to the fifth target, which may be [NONE].
pub(crate) fn choose_target(
    targets: &[i32; TARGETS],
    probabilities: &[f32; TARGETS],
    rand: f32,
) -> i32 {
    let mut cumulative = 0.0f32;
    for k in 0..TARGETS - 1 {
        cumulative += probabilities[k];
        if rand <= cumulative && targets[k] != NONE {
            return targets[k];
        }
    }
    targets[TARGETS - 1]
}

/// Draws normalised routing probabilities for the given targets.
pub(crate) fn draw_probabilities<R: Rng>(targets: &[i32; TARGETS], rng: &mut R) -> [f32; TARGETS] {
    let weights = targets.map(|target| if target == NONE { 0.0 } else { rng.gen::<f64>() });
    let total: f64 = weights.iter().sum();
    if total > 0.0 {
        weights.map(|weight| (weight / total) as f32)
    } else {
        [0.0; TARGETS]
    }
}

/// An intersection of lanes.
#[derive(Debug)]
pub struct Junction {
    /// The cell representing the junction.
    pub(crate) cell_index: i32,
    /// The number of cars stalled while approaching the junction this step.
    pub(crate) waiting_count: AtomicI32,
}

impl Junction {
    pub(crate) fn new(cell_index: i32, waiting_count: i32) -> Self {
        Self {
            cell_index,
            waiting_count: AtomicI32::new(waiting_count),
        }
    }

    /// The index of the junction's cell.
    pub fn cell(&self) -> usize {
        self.cell_index as usize
    }

    /// The number of cars waiting to enter the junction.
    pub fn waiting_count(&self) -> i32 {
        self.waiting_count.load(Ordering::Relaxed)
    }

    pub(crate) fn reset(&self) {
        self.waiting_count.store(0, Ordering::Relaxed);
    }
}

/// Increments the waiting counter of the junction, if there is one.
pub(crate) fn add_waiting(junctions: &[Junction], junction: i32) {
    if let Some(junction) = index(junction) {
        junctions[junction].waiting_count.fetch_add(1, Ordering::SeqCst);
    }
}

/// A boundary source of cars.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Generator {
    /// The cell cars are spawned into.
    pub(crate) cell_index: i32,
    /// The rate of the exponential inter-arrival distribution.
    pub(crate) probability_lambda: f32,
    /// Time until the next spawn attempt.
    pub(crate) time_left: f32,
}

impl Generator {
    pub(crate) fn new(cell_index: i32, probability_lambda: f32) -> Self {
        Self {
            cell_index,
            probability_lambda,
            time_left: 0.0,
        }
    }

    /// The index of the cell cars are spawned into.
    pub fn cell(&self) -> usize {
        self.cell_index as usize
    }

    pub fn time_left(&self) -> f32 {
        self.time_left
    }
}

/// Display-only data of a cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CellUi {
    pub position: Point2<i32>,
}

/// Display-only data of a car.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CarUi {
    pub color: i32,
}

/// The parameters of a generated grid network.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GenerationParams {
    /// Distance between neighbouring junctions.
    pub distance: i32,
    /// Number of junctions along the x axis.
    pub junctions_x: i32,
    /// Number of junctions along the y axis.
    pub junctions_y: i32,
    /// Number of cars placed initially.
    pub car_count: usize,
    /// Capacity of the car array; raised to `car_count` if smaller.
    pub max_car_count: usize,
    /// The rate of car generation at boundary generators.
    pub generator_probability: f32,
    /// Seed for the generation stream; entropy when absent.
    #[cfg_attr(feature = "serde", serde(default))]
    pub seed: Option<u64>,
}

impl GenerationParams {
    /// Creates unseeded generation parameters.
    pub fn new(
        distance: i32,
        junctions_x: i32,
        junctions_y: i32,
        car_count: usize,
        max_car_count: usize,
        generator_probability: f32,
    ) -> Self {
        Self {
            distance,
            junctions_x,
            junctions_y,
            car_count,
            max_car_count,
            generator_probability,
            seed: None,
        }
    }

    /// Sets the generation seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub(crate) fn capacity(&self) -> usize {
        self.max_car_count.max(self.car_count)
    }

    pub(crate) fn validate(&self) -> Result<(), SimulationError> {
        if self.distance < 1 {
            return Err(SimulationError::InvalidParams("distance must be at least 1"));
        }
        if self.junctions_x < 1 || self.junctions_y < 1 {
            return Err(SimulationError::InvalidParams("grid needs at least one junction"));
        }
        if !(self.generator_probability.is_finite() && self.generator_probability >= 0.0) {
            return Err(SimulationError::InvalidParams(
                "generator probability must be finite and non-negative",
            ));
        }
        if self.capacity() > i32::MAX as usize {
            return Err(SimulationError::InvalidParams("too many cars"));
        }
        // One junction cell plus at most ten lanes of `distance` cells each.
        let cells = (self.junctions_x as i64 * self.junctions_y as i64)
            * (1 + 10 * self.distance as i64);
        if cells > i32::MAX as i64 {
            return Err(SimulationError::InvalidParams("network too large"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn choose_cumulative() {
        let targets = [4, 7, NONE, 9, NONE];
        let probabilities = [0.25, 0.5, 0.0, 0.25, 0.0];
        assert_eq!(choose_target(&targets, &probabilities, 0.1), 4);
        assert_eq!(choose_target(&targets, &probabilities, 0.25), 4);
        assert_eq!(choose_target(&targets, &probabilities, 0.6), 7);
        assert_eq!(choose_target(&targets, &probabilities, 0.9), 9);
    }

    #[test]
    fn choose_falls_through_to_last() {
        let targets = [NONE, NONE, NONE, NONE, 3];
        let probabilities = [0.0, 0.0, 0.0, 0.0, 1.0];
        assert_eq!(choose_target(&targets, &probabilities, 0.5), 3);
        let dead = [NONE; TARGETS];
        assert_eq!(choose_target(&dead, &[0.0; TARGETS], 0.5), NONE);
    }

    #[test]
    fn probabilities_normalised() {
        let mut rng = StdRng::seed_from_u64(7);
        let targets = [1, NONE, 2, 3, NONE];
        let probabilities = draw_probabilities(&targets, &mut rng);
        assert_approx_eq!(probabilities.iter().sum::<f32>(), 1.0, 1e-5);
        assert_eq!(probabilities[1], 0.0);
        assert_eq!(probabilities[4], 0.0);
        assert_eq!(draw_probabilities(&[NONE; TARGETS], &mut rng), [0.0; TARGETS]);
    }

    #[test]
    fn params_validated() {
        assert!(GenerationParams::new(0, 1, 1, 0, 0, 0.1).validate().is_err());
        assert!(GenerationParams::new(3, 0, 1, 0, 0, 0.1).validate().is_err());
        assert!(GenerationParams::new(3, 2, 2, 5, 1, 0.1).validate().is_ok());
        assert_eq!(GenerationParams::new(3, 2, 2, 5, 1, 0.1).capacity(), 5);
    }

    #[test]
    fn generator_probability_validated() {
        assert!(GenerationParams::new(4, 2, 2, 10, 10, 0.0).validate().is_ok());
        for probability in [f32::NAN, -1.0, f32::INFINITY] {
            let params = GenerationParams::new(4, 2, 2, 10, 10, probability);
            assert!(matches!(params.validate(), Err(SimulationError::InvalidParams(_))));
            for kind in [crate::ModelKind::CellBased, crate::ModelKind::CarFollowing] {
                let mut sim = crate::Simulation::new(kind, Some(1)).unwrap();
                assert!(matches!(
                    sim.generate_new(&params),
                    Err(SimulationError::InvalidParams(_))
                ));
                assert!(!sim.is_ready());
            }
        }
    }
}
