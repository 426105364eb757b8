//! A grid traffic simulator with two models: a cellular automaton where cars are chains of
//! unit cells, and a car-following model on lanes of continuous length.
//!
//! Both models step either on a multi-threaded host backend or by running kernels on a
//! compute device through a [dispatch::Dispatcher].

pub use cgmath;
pub use checkpoint::{EXTENSION, FORMAT_VERSION};
pub use error::{CheckpointError, SimulationError};
pub use network::{
    CarUi, CellUi, GenerationParams, Generator, Junction, Routing, NONE, TARGETS, TERMINATOR,
};
pub use random::{RandomTable, RANDOM_LENGTH};
pub use simulation::{
    Backend, IntegrityReport, ModelKind, Simulation, SimulationConfig, SimulationFlags,
    Statistics, StepTimings,
};
pub use util::AtomicF32;

pub mod car_following;
pub mod cell_based;
mod checkpoint;
#[cfg(feature = "debug")]
mod debug;
pub mod dispatch;
mod error;
mod kernels;
mod network;
mod random;
mod simulation;
mod util;
