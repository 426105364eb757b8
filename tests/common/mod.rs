//! Helpers shared by the integration tests.
//!
//! Each test crate compiles its own copy, so helpers used by only some of them carry an
//! item-level `allow(dead_code)`.

use traffic_grid::{GenerationParams, ModelKind, RandomTable, Simulation, SimulationConfig, SimulationFlags};

pub const MODELS: [ModelKind; 2] = [ModelKind::CellBased, ModelKind::CarFollowing];

/// A reproducible config with the given spawn switch.
pub fn single_worker(no_spawn: bool) -> SimulationConfig {
    SimulationConfig {
        flags: SimulationFlags { no_spawn },
        ..SimulationConfig::deterministic()
    }
}

/// Creates a single-threaded simulation with a freshly generated network.
pub fn generated(kind: ModelKind, params: &GenerationParams) -> Simulation {
    let mut sim = Simulation::with_config(kind, Some(7), single_worker(false)).unwrap();
    sim.generate_new(params).unwrap();
    sim
}

/// Creates a simulation whose random table always yields `value`.
#[allow(dead_code)]
pub fn constant(kind: ModelKind, value: f32, params: &GenerationParams) -> Simulation {
    let random = RandomTable::from_values(vec![value]).unwrap();
    let mut sim = Simulation::with_random_table(kind, random, single_worker(true)).unwrap();
    sim.generate_new(params).unwrap();
    sim
}

/// A mid-sized network with some traffic.
pub fn busy_params() -> GenerationParams {
    GenerationParams::new(8, 3, 3, 60, 90, 0.2).with_seed(11)
}

#[allow(dead_code)]
pub fn active_cars(sim: &Simulation) -> u64 {
    sim.statistics().active_cars
}
