//! The compute dispatch collaborator used by the accelerated backend.
//!
//! A device owns opaque memory buffers of 32-bit words. Kernel programs are compiled once
//! per device, kernel arguments are bound in order, and kernels are launched over an index
//! range. [HostDispatcher] provides a software device running on a thread pool.

use slotmap::new_key_type;
use std::collections::TryReserveError;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use thiserror::Error;

pub use host::{HostDevice, HostDispatcher};

mod host;

new_key_type! {
    /// Unique ID of a device memory buffer.
    pub struct BufferId;
}

/// Identifies a device of a [Dispatcher].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub usize);

/// Describes a compute device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    /// The number of kernel invocations that may run at once.
    pub compute_units: usize,
    /// The maximum number of words of live buffer memory, if limited.
    pub memory_limit: Option<usize>,
}

/// How kernels may access a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

/// A scalar kernel argument.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    Int(i32),
    Float(f32),
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value)
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::Float(value)
    }
}

/// A bound kernel argument.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Arg {
    Buffer(BufferId),
    Value(Value),
}

/// The expected type of a kernel parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgKind {
    Buffer(Access),
    Int,
    Float,
}

/// Failures of a compute device.
#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("no compute device {0:?}")]
    UnknownDevice(DeviceId),

    #[error("kernel program `{0}` is not available")]
    UnknownProgram(String),

    #[error("kernel program `{program}` has no kernel `{kernel}`")]
    UnknownKernel { program: String, kernel: String },

    #[error("kernel set for device {kernels:?} used on device {device:?}")]
    ForeignKernelSet { kernels: DeviceId, device: DeviceId },

    #[error("device has {available} free words, {requested} requested")]
    OutOfMemory { requested: usize, available: usize },

    #[error("failed to allocate a buffer of {words} words")]
    BufferAllocation {
        words: usize,
        #[source]
        source: TryReserveError,
    },

    #[error("buffer {0:?} does not exist")]
    UnknownBuffer(BufferId),

    #[error("buffer holds {buffer} words, {requested} requested")]
    BufferSize { buffer: usize, requested: usize },

    #[error("kernel `{kernel}` takes {expected} arguments, {actual} bound")]
    ArgumentCount {
        kernel: String,
        expected: usize,
        actual: usize,
    },

    #[error("argument {index} of kernel `{kernel}` must be {expected:?}")]
    ArgumentMismatch {
        kernel: String,
        index: usize,
        expected: ArgKind,
    },

    #[error("argument {index} of kernel `{kernel}` is not bound")]
    UnboundArgument { kernel: String, index: usize },

    #[error("argument {index} of kernel `{kernel}` is read-only")]
    ReadOnlyBuffer { kernel: String, index: usize },

    #[error("kernel `{kernel}` faulted")]
    KernelFault { kernel: String },

    #[error("failed to start device workers")]
    DeviceInit(#[from] rayon::ThreadPoolBuildError),
}

/// The kernels of a program compiled for one device.
#[derive(Clone, Debug)]
pub struct KernelSet {
    device: DeviceId,
    program: String,
    kernels: Vec<(String, Vec<ArgKind>)>,
}

impl KernelSet {
    /// Creates a kernel set from the kernel names and signatures of a program.
    pub fn new(device: DeviceId, program: &str, kernels: Vec<(String, Vec<ArgKind>)>) -> Self {
        Self {
            device,
            program: program.to_string(),
            kernels,
        }
    }

    /// The device the program was compiled for.
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// The name of the compiled program.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// The parameter types of the named kernel.
    pub fn signature(&self, kernel: &str) -> Option<&[ArgKind]> {
        self.kernels
            .iter()
            .find(|(name, _)| name == kernel)
            .map(|(_, signature)| signature.as_slice())
    }
}

/// A device able to hold buffers and run kernels.
pub trait ComputeDevice: Send + Sync {
    /// The device's ID within its dispatcher.
    fn id(&self) -> DeviceId;

    fn info(&self) -> &DeviceInfo;

    /// Compiles the named program, reusing an earlier compilation if there is one.
    fn compile(&self, program: &str) -> Result<Arc<KernelSet>, ComputeError>;

    /// Creates a buffer initialised with `words`.
    fn create_buffer(&self, words: &[u32], access: Access) -> Result<BufferId, ComputeError>;

    /// Copies the start of a buffer into `out`.
    fn read_buffer(&self, buffer: BufferId, out: &mut [u32]) -> Result<(), ComputeError>;

    /// Overwrites the start of a buffer with `words`.
    fn write_buffer(&self, buffer: BufferId, words: &[u32]) -> Result<(), ComputeError>;

    fn release_buffer(&self, buffer: BufferId) -> Result<(), ComputeError>;

    /// Runs a kernel for every index in `0..global_size`.
    fn launch(
        &self,
        kernels: &KernelSet,
        kernel: &str,
        args: &[Arg],
        global_size: usize,
    ) -> Result<(), ComputeError>;

    /// Waits for all launched work to complete.
    fn finish(&self) -> Result<(), ComputeError>;
}

/// Provides access to compute devices.
pub trait Dispatcher {
    /// The IDs of the available devices.
    fn devices(&self) -> Vec<DeviceId>;

    /// Looks up a device.
    fn device(&self, id: DeviceId) -> Result<&dyn ComputeDevice, ComputeError>;

    /// Compiles a program on the given device.
    fn compile(&self, id: DeviceId, program: &str) -> Result<Arc<KernelSet>, ComputeError> {
        self.device(id)?.compile(program)
    }
}

/// A kernel together with its bound arguments.
pub struct Kernel<'d> {
    device: &'d dyn ComputeDevice,
    kernels: Arc<KernelSet>,
    name: String,
    args: Vec<Option<Arg>>,
    /// Position of the next argument bound without an explicit index.
    next: usize,
}

impl<'d> Kernel<'d> {
    /// Looks up a kernel of a compiled program.
    pub fn new(
        device: &'d dyn ComputeDevice,
        kernels: &Arc<KernelSet>,
        name: &str,
    ) -> Result<Self, ComputeError> {
        if kernels.signature(name).is_none() {
            return Err(ComputeError::UnknownKernel {
                program: kernels.program().to_string(),
                kernel: name.to_string(),
            });
        }
        Ok(Self {
            device,
            kernels: kernels.clone(),
            name: name.to_string(),
            args: Vec::new(),
            next: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Binds a buffer as the next argument.
    pub fn bind_buffer(&mut self, buffer: BufferId) -> &mut Self {
        self.push(Arg::Buffer(buffer))
    }

    /// Binds a scalar as the next argument.
    pub fn bind_value(&mut self, value: impl Into<Value>) -> &mut Self {
        self.push(Arg::Value(value.into()))
    }

    /// Replaces the scalar argument at `index`, keeping all other bindings.
    pub fn bind_value_at(&mut self, index: usize, value: impl Into<Value>) -> &mut Self {
        self.put(index, Arg::Value(value.into()));
        self
    }

    fn push(&mut self, arg: Arg) -> &mut Self {
        self.put(self.next, arg);
        self.next += 1;
        self
    }

    fn put(&mut self, index: usize, arg: Arg) {
        if self.args.len() <= index {
            self.args.resize(index + 1, None);
        }
        self.args[index] = Some(arg);
    }

    /// Launches the kernel over `0..global_size`.
    pub fn run(&mut self, global_size: usize) -> Result<&mut Self, ComputeError> {
        let args = self
            .args
            .iter()
            .enumerate()
            .map(|(index, arg)| {
                arg.ok_or_else(|| ComputeError::UnboundArgument {
                    kernel: self.name.clone(),
                    index,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.device
            .launch(&self.kernels, &self.name, &args, global_size)?;
        Ok(self)
    }

    /// Waits for the launched work to complete.
    pub fn finish(&mut self) -> Result<(), ComputeError> {
        self.device.finish()
    }
}

/// Buffers of one device, released when dropped.
pub struct DeviceBuffers<'d> {
    device: &'d dyn ComputeDevice,
    buffers: Vec<BufferId>,
}

impl<'d> DeviceBuffers<'d> {
    pub fn new(device: &'d dyn ComputeDevice) -> Self {
        Self {
            device,
            buffers: Vec::new(),
        }
    }

    /// Creates a buffer holding `words`.
    pub fn upload(&mut self, words: &[u32], access: Access) -> Result<BufferId, ComputeError> {
        let buffer = self.device.create_buffer(words, access)?;
        self.buffers.push(buffer);
        Ok(buffer)
    }

    /// Reads the first `len` words of a buffer.
    pub fn download(&self, buffer: BufferId, len: usize) -> Result<Vec<u32>, ComputeError> {
        let mut words = vec![0; len];
        self.device.read_buffer(buffer, &mut words)?;
        Ok(words)
    }
}

impl Drop for DeviceBuffers<'_> {
    fn drop(&mut self) {
        for buffer in self.buffers.drain(..) {
            if let Err(err) = self.device.release_buffer(buffer) {
                log::warn!("failed to release device buffer: {}", err);
            }
        }
    }
}

/// An argument resolved to device memory for the duration of a launch.
#[derive(Clone, Copy)]
pub enum Resolved<'a> {
    Buffer(&'a [AtomicU32]),
    Int(i32),
    Float(f32),
}

/// The arguments seen by a kernel invocation.
///
/// Arguments are checked against the kernel signature before launch, so
/// accessors fall back to empty values only for mismatches that cannot occur.
pub struct LaunchArgs<'a> {
    args: Vec<Resolved<'a>>,
}

impl<'a> LaunchArgs<'a> {
    pub fn new(args: Vec<Resolved<'a>>) -> Self {
        Self { args }
    }

    pub fn buffer(&self, index: usize) -> &'a [AtomicU32] {
        match self.args.get(index) {
            Some(Resolved::Buffer(words)) => words,
            _ => &[],
        }
    }

    pub fn int(&self, index: usize) -> i32 {
        match self.args.get(index) {
            Some(Resolved::Int(value)) => *value,
            _ => 0,
        }
    }

    pub fn float(&self, index: usize) -> f32 {
        match self.args.get(index) {
            Some(Resolved::Float(value)) => *value,
            _ => 0.0,
        }
    }
}
