use crate::checkpoint::{CheckpointReader, CheckpointWriter, EXTENSION};
use crate::dispatch::{DeviceId, Dispatcher};
use crate::random::RandomTable;
use crate::{car_following, cell_based, CheckpointError, GenerationParams, SimulationError};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::time::{Duration, Instant};

/// The traffic model a simulation runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ModelKind {
    /// Cars are chains of unit cells.
    CellBased,
    /// Cars follow each other along lane segments of continuous length.
    CarFollowing,
}

impl ModelKind {
    /// The tag identifying the model in checkpoints.
    pub fn tag(self) -> u16 {
        match self {
            ModelKind::CellBased => 0,
            ModelKind::CarFollowing => 1,
        }
    }

    pub fn from_tag(tag: u16) -> Option<Self> {
        match tag {
            0 => Some(ModelKind::CellBased),
            1 => Some(ModelKind::CarFollowing),
            _ => None,
        }
    }
}

impl Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelKind::CellBased => write!(f, "cell-based"),
            ModelKind::CarFollowing => write!(f, "car-following"),
        }
    }
}

/// Switches that alter what a step does.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SimulationFlags {
    /// Skip the generators, so no new cars enter the network.
    #[cfg_attr(feature = "serde", serde(default))]
    pub no_spawn: bool,
}

/// The configuration of a simulation.
///
/// The default runs the reference backend on one worker per CPU. Workers race for cells and
/// lane slots, so two runs from the same seed can end in different (but consistent) states.
/// Use [SimulationConfig::deterministic] when runs must be reproducible.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SimulationConfig {
    /// The number of worker threads of the reference backend; one per CPU when absent.
    ///
    /// Runs are only reproducible with a single worker.
    #[cfg_attr(feature = "serde", serde(default))]
    pub worker_threads: Option<usize>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub flags: SimulationFlags,
}

impl SimulationConfig {
    /// A single-worker configuration, under which the same seed and inputs always produce
    /// the same state.
    ///
    /// Accelerated steps are only reproducible on a device with a single compute unit.
    pub fn deterministic() -> Self {
        Self {
            worker_threads: Some(1),
            flags: SimulationFlags::default(),
        }
    }

    /// Whether reference steps run in a fixed order.
    pub fn is_deterministic(&self) -> bool {
        self.worker_threads == Some(1)
    }
}

/// The backend a step is executed on.
#[derive(Clone, Copy)]
pub enum Backend<'a> {
    /// The multi-threaded host implementation.
    Reference,
    /// Kernels run on a device of a dispatcher.
    Accelerated {
        dispatcher: &'a dyn Dispatcher,
        device: DeviceId,
    },
}

/// Wall-clock time spent in a step or batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StepTimings {
    pub total: Duration,
    /// Moving cars, including lane transitions.
    pub cars: Duration,
    /// Running the generators.
    pub generators: Duration,
}

/// The outcome of an integrity check.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IntegrityReport {
    /// Whether the state is internally consistent.
    pub consistent: bool,
    pub active_cars: u64,
    /// The sum of all junction waiting counters.
    pub waiting_cars: u64,
    /// Cars whose occupancy could not be reconstructed.
    pub broken_cars: u64,
    /// Lane slots whose car is ahead of the car in the slot before (car-following only).
    pub misordered_slots: u64,
}

/// Aggregate counts of the current state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Statistics {
    pub cells: usize,
    pub junctions: usize,
    pub generators: usize,
    /// The capacity of the car array.
    pub cars: usize,
    pub active_cars: u64,
    pub waiting_cars: u64,
}

/// The state of either model.
enum Model {
    CellBased(cell_based::SimulationData),
    CarFollowing(car_following::SimulationData),
}

/// A traffic simulation.
pub struct Simulation {
    kind: ModelKind,
    random: RandomTable,
    pool: rayon::ThreadPool,
    flags: SimulationFlags,
    model: Option<Model>,
    /// The number of completed steps.
    current_step: i64,
    last_timings: StepTimings,
    /// A summary of the previous step.
    #[cfg(feature = "debug")]
    debug: serde_json::Value,
}

/// The random seed of the step that brought the counter to `step`.
fn step_seed(step: i64) -> i32 {
    step.wrapping_add(1) as i32
}

impl Simulation {
    /// Creates an empty simulation with a random table drawn from `random_seed`.
    pub fn new(kind: ModelKind, random_seed: Option<u64>) -> Result<Self, SimulationError> {
        Self::with_config(kind, random_seed, SimulationConfig::default())
    }

    pub fn with_config(
        kind: ModelKind,
        random_seed: Option<u64>,
        config: SimulationConfig,
    ) -> Result<Self, SimulationError> {
        Self::with_random_table(kind, RandomTable::new(random_seed), config)
    }

    /// Creates an empty simulation sharing an existing random table.
    pub fn with_random_table(
        kind: ModelKind,
        random: RandomTable,
        config: SimulationConfig,
    ) -> Result<Self, SimulationError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_threads.unwrap_or(0))
            .thread_name(|i| format!("traffic-worker-{}", i))
            .build()?;
        Ok(Self {
            kind,
            random,
            pool,
            flags: config.flags,
            model: None,
            current_step: 0,
            last_timings: StepTimings::default(),
            #[cfg(feature = "debug")]
            debug: serde_json::Value::Null,
        })
    }

    /// Generates a new grid network, replacing any current state.
    pub fn generate_new(&mut self, params: &GenerationParams) -> Result<(), SimulationError> {
        params.validate()?;
        let model = match self.kind {
            ModelKind::CellBased => Model::CellBased(cell_based::generate(params)),
            ModelKind::CarFollowing => Model::CarFollowing(car_following::generate(params)),
        };
        self.model = Some(model);
        self.current_step = 0;
        self.last_timings = StepTimings::default();
        let stats = self.statistics();
        log::info!(
            "generated {} network: {} cells, {} junctions, {} generators, {} of {} cars placed",
            self.kind,
            stats.cells,
            stats.junctions,
            stats.generators,
            stats.active_cars,
            stats.cars
        );
        Ok(())
    }

    /// Advances the simulation by one step on the host.
    pub fn do_step_reference(&mut self) -> Result<StepTimings, SimulationError> {
        let timer = Instant::now();
        let seed = step_seed(self.current_step + 1);
        let spawn = !self.flags.no_spawn;
        let random = &self.random;
        let mut timings = match self.model.as_mut().ok_or(SimulationError::NotReady)? {
            Model::CellBased(data) => self
                .pool
                .install(|| cell_based::reference::step(data, random, seed, spawn)),
            Model::CarFollowing(data) => self
                .pool
                .install(|| car_following::reference::step(data, random, seed, spawn)),
        };
        self.current_step += 1;
        timings.total = timer.elapsed();
        self.finish_steps("reference", timings);
        Ok(timings)
    }

    /// Advances the simulation by one step on a compute device.
    ///
    /// On failure the state and step counter are left unchanged.
    pub fn do_step_accelerated(
        &mut self,
        dispatcher: &dyn Dispatcher,
        device: DeviceId,
    ) -> Result<StepTimings, SimulationError> {
        self.do_batch_accelerated(dispatcher, device, 1)
    }

    /// Advances the simulation by `steps` steps on a compute device, keeping the state in
    /// device memory in between.
    ///
    /// On failure the state and step counter are left as they were before the batch.
    pub fn do_batch_accelerated(
        &mut self,
        dispatcher: &dyn Dispatcher,
        device: DeviceId,
        steps: usize,
    ) -> Result<StepTimings, SimulationError> {
        let timer = Instant::now();
        let model = self.model.as_mut().ok_or(SimulationError::NotReady)?;
        let device = dispatcher.device(device)?;
        let seeds = (1..=steps as i64)
            .map(|k| step_seed(self.current_step + k))
            .collect::<Vec<_>>();
        let spawn = !self.flags.no_spawn;
        let mut timings = match model {
            Model::CellBased(data) => {
                cell_based::accelerated::run(device, data, &self.random, &seeds, spawn)?
            }
            Model::CarFollowing(data) => {
                car_following::accelerated::run(device, data, &self.random, &seeds, spawn)?
            }
        };
        self.current_step += steps as i64;
        timings.total = timer.elapsed();
        self.finish_steps(&device.info().name, timings);
        Ok(timings)
    }

    /// Advances the simulation by one step on the given backend.
    ///
    /// The result only depends on the state and the seed when the simulation was built with
    /// [SimulationConfig::deterministic], or the device has a single compute unit.
    pub fn step(&mut self, backend: Backend<'_>) -> Result<StepTimings, SimulationError> {
        match backend {
            Backend::Reference => self.do_step_reference(),
            Backend::Accelerated { dispatcher, device } => {
                self.do_step_accelerated(dispatcher, device)
            }
        }
    }

    fn finish_steps(&mut self, backend: &str, timings: StepTimings) {
        log::debug!(
            "step {} on {}: {:?} total, {:?} cars, {:?} generators",
            self.current_step,
            backend,
            timings.total,
            timings.cars,
            timings.generators
        );
        self.last_timings = timings;
        #[cfg(feature = "debug")]
        {
            self.debug = crate::debug::step_frame(self, backend);
        }
    }

    /// Checks that the state is internally consistent.
    ///
    /// An empty simulation is consistent.
    pub fn check_integrity(&self) -> IntegrityReport {
        let report = match &self.model {
            Some(Model::CellBased(data)) => data.check_integrity(),
            Some(Model::CarFollowing(data)) => data.check_integrity(),
            None => IntegrityReport {
                consistent: true,
                ..Default::default()
            },
        };
        if !report.consistent {
            log::warn!(
                "integrity check failed at step {}: {} broken cars",
                self.current_step,
                report.broken_cars
            );
        }
        report
    }

    /// The number of completed steps.
    pub fn current_step(&self) -> i64 {
        self.current_step
    }

    /// Whether a network has been generated or loaded.
    pub fn is_ready(&self) -> bool {
        self.model.is_some()
    }

    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    pub fn flags(&self) -> SimulationFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: SimulationFlags) {
        self.flags = flags;
    }

    pub fn random_table(&self) -> &RandomTable {
        &self.random
    }

    /// The timings of the most recent step or batch.
    pub fn last_timings(&self) -> StepTimings {
        self.last_timings
    }

    /// Gets the state of a cell-based simulation.
    pub fn cell_based(&self) -> Option<&cell_based::SimulationData> {
        match &self.model {
            Some(Model::CellBased(data)) => Some(data),
            _ => None,
        }
    }

    /// Gets the state of a car-following simulation.
    pub fn car_following(&self) -> Option<&car_following::SimulationData> {
        match &self.model {
            Some(Model::CarFollowing(data)) => Some(data),
            _ => None,
        }
    }

    pub fn statistics(&self) -> Statistics {
        match &self.model {
            Some(Model::CellBased(data)) => Statistics {
                cells: data.cells().len(),
                junctions: data.junctions().len(),
                generators: data.generators().len(),
                cars: data.cars().len(),
                active_cars: data.cars().iter().filter(|car| car.position().is_some()).count() as u64,
                waiting_cars: waiting_cars(data.junctions()),
            },
            Some(Model::CarFollowing(data)) => Statistics {
                cells: data.cells().len(),
                junctions: data.junctions().len(),
                generators: data.generators().len(),
                cars: data.cars().len(),
                active_cars: data.cars().iter().filter(|car| car.position().is_some()).count() as u64,
                waiting_cars: waiting_cars(data.junctions()),
            },
            None => Statistics::default(),
        }
    }

    /// Writes a checkpoint of the current state.
    pub fn save<W: Write>(&self, mut writer: W) -> Result<(), CheckpointError> {
        writer.write_all(&self.to_bytes()?)?;
        writer.flush()?;
        Ok(())
    }

    /// Serialises the current state into a checkpoint.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CheckpointError> {
        let mut w = CheckpointWriter::new();
        w.header(self.kind, self.current_step);
        match self.model.as_ref().ok_or(CheckpointError::NotReady)? {
            Model::CellBased(data) => data.save(&mut w),
            Model::CarFollowing(data) => data.save(&mut w),
        }
        Ok(w.into_bytes())
    }

    /// Replaces the current state with a checkpoint.
    ///
    /// The checkpoint must be of this simulation's model. Nothing is changed on failure.
    pub fn load<R: Read>(&mut self, reader: R) -> Result<(), CheckpointError> {
        let mut r = CheckpointReader::new(reader);
        let (kind, step) = r.header()?;
        if kind != self.kind {
            return Err(CheckpointError::ModelMismatch {
                expected: self.kind,
                found: kind,
            });
        }
        let model = match kind {
            ModelKind::CellBased => Model::CellBased(cell_based::SimulationData::load(&mut r)?),
            ModelKind::CarFollowing => {
                Model::CarFollowing(car_following::SimulationData::load(&mut r)?)
            }
        };
        r.expect_end()?;
        self.model = Some(model);
        self.current_step = step;
        self.last_timings = StepTimings::default();
        log::info!("loaded {} checkpoint at step {}", self.kind, step);
        Ok(())
    }

    /// Writes a checkpoint file, adding the checkpoint extension if the path has none.
    pub fn save_file(&self, path: impl AsRef<Path>) -> Result<(), CheckpointError> {
        let path = path.as_ref();
        let path = match path.extension() {
            Some(_) => path.to_path_buf(),
            None => path.with_extension(EXTENSION),
        };
        self.save(BufWriter::new(File::create(path)?))
    }

    pub fn load_file(&mut self, path: impl AsRef<Path>) -> Result<(), CheckpointError> {
        self.load(BufReader::new(File::open(path)?))
    }

    /// Hashes the checkpoint of the current state.
    pub fn state_hash(&self) -> Result<blake3::Hash, CheckpointError> {
        Ok(blake3::hash(&self.to_bytes()?))
    }

    /// Gets the debugging summary of the previous step.
    #[cfg(feature = "debug")]
    pub fn debug(&self) -> &serde_json::Value {
        &self.debug
    }
}

fn waiting_cars(junctions: &[crate::network::Junction]) -> u64 {
    junctions
        .iter()
        .map(|junction| junction.waiting_count().max(0) as u64)
        .sum()
}

impl Display for Simulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_ready() {
            return write!(f, "empty {} simulation", self.kind);
        }
        let stats = self.statistics();
        write!(
            f,
            "{} simulation at step {}: {} cells, {} junctions, {}/{} cars active, {} waiting",
            self.kind,
            self.current_step,
            stats.cells,
            stats.junctions,
            stats.active_cars,
            stats.cars,
            stats.waiting_cars
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn config() -> SimulationConfig {
        SimulationConfig::deterministic()
    }

    #[test]
    fn deterministic_config() {
        let config = SimulationConfig::deterministic();
        assert_eq!(config.worker_threads, Some(1));
        assert!(!config.flags.no_spawn);
        assert!(config.is_deterministic());
        assert!(!SimulationConfig::default().is_deterministic());
    }

    #[test]
    fn model_tags() {
        for kind in [ModelKind::CellBased, ModelKind::CarFollowing] {
            assert_eq!(ModelKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(ModelKind::from_tag(2), None);
    }

    #[test]
    fn not_ready() {
        let mut sim = Simulation::with_config(ModelKind::CellBased, Some(1), config()).unwrap();
        assert!(!sim.is_ready());
        assert!(matches!(sim.do_step_reference(), Err(SimulationError::NotReady)));
        assert!(matches!(sim.to_bytes(), Err(CheckpointError::NotReady)));
        assert!(sim.check_integrity().consistent);
        assert_eq!(sim.current_step(), 0);
        assert_eq!(sim.to_string(), "empty cell-based simulation");
    }

    #[test]
    fn invalid_params() {
        let mut sim = Simulation::with_config(ModelKind::CarFollowing, Some(1), config()).unwrap();
        let params = GenerationParams::new(0, 2, 2, 1, 1, 0.1);
        assert!(matches!(
            sim.generate_new(&params),
            Err(SimulationError::InvalidParams(_))
        ));
        assert!(!sim.is_ready());
    }

    #[test]
    fn step_counter_and_seed() {
        let mut sim = Simulation::with_config(ModelKind::CellBased, Some(1), config()).unwrap();
        sim.generate_new(&GenerationParams::new(5, 2, 2, 5, 10, 0.1).with_seed(1))
            .unwrap();
        sim.do_step_reference().unwrap();
        sim.do_step_reference().unwrap();
        assert_eq!(sim.current_step(), 2);
        assert_eq!(step_seed(1), 2);
        assert_eq!(step_seed(i32::MAX as i64), i32::MIN);
    }

    #[test]
    fn wrong_model_rejected() {
        let mut a = Simulation::with_config(ModelKind::CellBased, Some(1), config()).unwrap();
        a.generate_new(&GenerationParams::new(4, 1, 1, 2, 2, 0.1).with_seed(1))
            .unwrap();
        let bytes = a.to_bytes().unwrap();
        let mut b = Simulation::with_config(ModelKind::CarFollowing, Some(1), config()).unwrap();
        assert!(matches!(
            b.load(bytes.as_slice()),
            Err(CheckpointError::ModelMismatch { .. })
        ));
        assert!(!b.is_ready());
    }
}
