use crate::dispatch::ComputeError;
use crate::ModelKind;
use thiserror::Error;

/// Errors surfaced by the simulation engine.
#[derive(Debug, Error)]
pub enum SimulationError {
    /// No network has been generated or loaded yet.
    #[error("simulation has no network; generate or load one first")]
    NotReady,

    #[error("invalid generation parameters: {0}")]
    InvalidParams(&'static str),

    #[error("random table must contain between 1 and i32::MAX values")]
    InvalidRandomTable,

    /// The accelerator backend failed; the state is left as it was before the call.
    #[error("accelerated step failed")]
    Compute(#[from] ComputeError),

    #[error("failed to build worker pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Errors raised while reading or writing checkpoints.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint i/o failed")]
    Io(#[from] std::io::Error),

    #[error("unsupported checkpoint format version {0}")]
    UnsupportedVersion(u16),

    #[error("unknown simulation model tag {0}")]
    UnknownModel(u16),

    /// The body decoded but describes an impossible state.
    #[error("corrupt checkpoint: {0}")]
    Corrupt(&'static str),

    #[error("checkpoint holds a {found} simulation, expected {expected}")]
    ModelMismatch { expected: ModelKind, found: ModelKind },

    #[error("simulation has no network to save")]
    NotReady,

    #[error(transparent)]
    Simulation(#[from] SimulationError),
}
