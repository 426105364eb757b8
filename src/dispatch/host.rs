//! A software compute device running kernels on a rayon thread pool.

use super::*;
use crate::kernels;
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use slotmap::SlotMap;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;

struct HostBuffer {
    words: Arc<[AtomicU32]>,
    access: Access,
}

/// An argument with its buffer kept alive for the launch.
enum Bound {
    Buffer(Arc<[AtomicU32]>),
    Value(Value),
}

/// A device whose memory lives in host RAM.
pub struct HostDevice {
    id: DeviceId,
    info: DeviceInfo,
    pool: rayon::ThreadPool,
    buffers: RwLock<SlotMap<BufferId, HostBuffer>>,
    compiled: Mutex<HashMap<String, Arc<KernelSet>>>,
}

impl HostDevice {
    /// Creates a device with `threads` workers; zero picks one per CPU.
    fn new(id: DeviceId, threads: usize, memory_limit: Option<usize>) -> Result<Self, ComputeError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(move |i| format!("host-device-{}-{}", id.0, i))
            .build()?;
        let info = DeviceInfo {
            name: format!("host device {}", id.0),
            compute_units: pool.current_num_threads(),
            memory_limit,
        };
        Ok(Self {
            id,
            info,
            pool,
            buffers: RwLock::new(SlotMap::with_key()),
            compiled: Mutex::new(HashMap::new()),
        })
    }

    fn with_buffer<T>(
        &self,
        buffer: BufferId,
        f: impl FnOnce(&HostBuffer) -> Result<T, ComputeError>,
    ) -> Result<T, ComputeError> {
        let buffers = self.buffers.read();
        let buffer = buffers
            .get(buffer)
            .ok_or(ComputeError::UnknownBuffer(buffer))?;
        f(buffer)
    }
}

impl ComputeDevice for HostDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn compile(&self, program: &str) -> Result<Arc<KernelSet>, ComputeError> {
        let mut compiled = self.compiled.lock();
        if let Some(kernels) = compiled.get(program) {
            return Ok(kernels.clone());
        }
        let source = kernels::program(program)
            .ok_or_else(|| ComputeError::UnknownProgram(program.to_string()))?;
        let signatures = source
            .kernels
            .iter()
            .map(|kernel| (kernel.name.to_string(), kernel.signature.to_vec()))
            .collect();
        let kernels = Arc::new(KernelSet::new(self.id, program, signatures));
        log::debug!("compiled kernel program `{}` for {}", program, self.info.name);
        compiled.insert(program.to_string(), kernels.clone());
        Ok(kernels)
    }

    fn create_buffer(&self, words: &[u32], access: Access) -> Result<BufferId, ComputeError> {
        let mut buffers = self.buffers.write();
        if let Some(limit) = self.info.memory_limit {
            let used: usize = buffers.values().map(|buffer| buffer.words.len()).sum();
            let available = limit.saturating_sub(used);
            if words.len() > available {
                return Err(ComputeError::OutOfMemory {
                    requested: words.len(),
                    available,
                });
            }
        }
        let mut storage = Vec::new();
        storage
            .try_reserve_exact(words.len())
            .map_err(|source| ComputeError::BufferAllocation {
                words: words.len(),
                source,
            })?;
        storage.extend(words.iter().map(|&word| AtomicU32::new(word)));
        Ok(buffers.insert(HostBuffer {
            words: storage.into(),
            access,
        }))
    }

    fn read_buffer(&self, buffer: BufferId, out: &mut [u32]) -> Result<(), ComputeError> {
        self.with_buffer(buffer, |buffer| {
            if out.len() > buffer.words.len() {
                return Err(ComputeError::BufferSize {
                    buffer: buffer.words.len(),
                    requested: out.len(),
                });
            }
            for (out, word) in out.iter_mut().zip(buffer.words.iter()) {
                *out = word.load(Ordering::Relaxed);
            }
            Ok(())
        })
    }

    fn write_buffer(&self, buffer: BufferId, words: &[u32]) -> Result<(), ComputeError> {
        self.with_buffer(buffer, |buffer| {
            if words.len() > buffer.words.len() {
                return Err(ComputeError::BufferSize {
                    buffer: buffer.words.len(),
                    requested: words.len(),
                });
            }
            for (word, value) in buffer.words.iter().zip(words) {
                word.store(*value, Ordering::Relaxed);
            }
            Ok(())
        })
    }

    fn release_buffer(&self, buffer: BufferId) -> Result<(), ComputeError> {
        self.buffers
            .write()
            .remove(buffer)
            .map(|_| ())
            .ok_or(ComputeError::UnknownBuffer(buffer))
    }

    fn launch(
        &self,
        kernels: &KernelSet,
        kernel: &str,
        args: &[Arg],
        global_size: usize,
    ) -> Result<(), ComputeError> {
        if kernels.device() != self.id {
            return Err(ComputeError::ForeignKernelSet {
                kernels: kernels.device(),
                device: self.id,
            });
        }
        let entry = kernels::program(kernels.program())
            .and_then(|program| program.kernel(kernel))
            .ok_or_else(|| ComputeError::UnknownKernel {
                program: kernels.program().to_string(),
                kernel: kernel.to_string(),
            })?;
        if args.len() != entry.signature.len() {
            return Err(ComputeError::ArgumentCount {
                kernel: kernel.to_string(),
                expected: entry.signature.len(),
                actual: args.len(),
            });
        }

        let bound = {
            let buffers = self.buffers.read();
            let mut bound = Vec::with_capacity(args.len());
            for (index, (arg, kind)) in args.iter().zip(entry.signature).enumerate() {
                match (arg, kind) {
                    (Arg::Buffer(id), ArgKind::Buffer(access)) => {
                        let buffer = buffers.get(*id).ok_or(ComputeError::UnknownBuffer(*id))?;
                        if *access == Access::ReadWrite && buffer.access == Access::ReadOnly {
                            return Err(ComputeError::ReadOnlyBuffer {
                                kernel: kernel.to_string(),
                                index,
                            });
                        }
                        bound.push(Bound::Buffer(buffer.words.clone()));
                    }
                    (Arg::Value(value @ Value::Int(_)), ArgKind::Int)
                    | (Arg::Value(value @ Value::Float(_)), ArgKind::Float) => {
                        bound.push(Bound::Value(*value));
                    }
                    _ => {
                        return Err(ComputeError::ArgumentMismatch {
                            kernel: kernel.to_string(),
                            index,
                            expected: *kind,
                        })
                    }
                }
            }
            bound
        };

        let launch_args = LaunchArgs::new(
            bound
                .iter()
                .map(|arg| match arg {
                    Bound::Buffer(words) => Resolved::Buffer(words),
                    Bound::Value(Value::Int(value)) => Resolved::Int(*value),
                    Bound::Value(Value::Float(value)) => Resolved::Float(*value),
                })
                .collect(),
        );
        let func = entry.func;
        let result = catch_unwind(AssertUnwindSafe(|| {
            self.pool.install(|| {
                (0..global_size)
                    .into_par_iter()
                    .for_each(|index| func(&launch_args, index))
            })
        }));
        result.map_err(|_| ComputeError::KernelFault {
            kernel: kernel.to_string(),
        })
    }

    fn finish(&self) -> Result<(), ComputeError> {
        // Launches complete before `launch` returns.
        Ok(())
    }
}

/// A dispatcher over software devices.
pub struct HostDispatcher {
    devices: Vec<HostDevice>,
}

impl HostDispatcher {
    /// Creates a dispatcher with one device of `threads` workers; zero picks one per CPU.
    pub fn new(threads: usize) -> Result<Self, ComputeError> {
        let mut dispatcher = Self {
            devices: Vec::new(),
        };
        dispatcher.add_device(threads, None)?;
        Ok(dispatcher)
    }

    /// Creates a dispatcher with one device limited to `words` words of buffer memory.
    pub fn with_memory_limit(threads: usize, words: usize) -> Result<Self, ComputeError> {
        let mut dispatcher = Self {
            devices: Vec::new(),
        };
        dispatcher.add_device(threads, Some(words))?;
        Ok(dispatcher)
    }

    /// Adds another device.
    pub fn add_device(
        &mut self,
        threads: usize,
        memory_limit: Option<usize>,
    ) -> Result<DeviceId, ComputeError> {
        let id = DeviceId(self.devices.len());
        self.devices.push(HostDevice::new(id, threads, memory_limit)?);
        Ok(id)
    }
}

impl Dispatcher for HostDispatcher {
    fn devices(&self) -> Vec<DeviceId> {
        self.devices.iter().map(|device| device.id).collect()
    }

    fn device(&self, id: DeviceId) -> Result<&dyn ComputeDevice, ComputeError> {
        self.devices
            .get(id.0)
            .map(|device| device as &dyn ComputeDevice)
            .ok_or(ComputeError::UnknownDevice(id))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::kernels::JUNCTION_WORDS;

    fn device(dispatcher: &HostDispatcher) -> &dyn ComputeDevice {
        dispatcher.device(DeviceId(0)).unwrap()
    }

    #[test]
    fn buffers_round_trip() {
        let dispatcher = HostDispatcher::new(1).unwrap();
        let device = device(&dispatcher);
        let buffer = device.create_buffer(&[1, 2, 3], Access::ReadWrite).unwrap();
        device.write_buffer(buffer, &[7, 8]).unwrap();
        let mut out = [0; 3];
        device.read_buffer(buffer, &mut out).unwrap();
        assert_eq!(out, [7, 8, 3]);
        let mut too_long = [0; 4];
        assert!(matches!(
            device.read_buffer(buffer, &mut too_long),
            Err(ComputeError::BufferSize { .. })
        ));
        device.release_buffer(buffer).unwrap();
        assert!(matches!(
            device.release_buffer(buffer),
            Err(ComputeError::UnknownBuffer(_))
        ));
    }

    #[test]
    fn memory_limit() {
        let dispatcher = HostDispatcher::with_memory_limit(1, 4).unwrap();
        let device = device(&dispatcher);
        let first = device.create_buffer(&[0; 3], Access::ReadWrite).unwrap();
        assert!(matches!(
            device.create_buffer(&[0; 2], Access::ReadWrite),
            Err(ComputeError::OutOfMemory { available: 1, .. })
        ));
        device.release_buffer(first).unwrap();
        assert!(device.create_buffer(&[0; 4], Access::ReadWrite).is_ok());
    }

    #[test]
    fn compile_is_cached() {
        let dispatcher = HostDispatcher::new(1).unwrap();
        let a = dispatcher.compile(DeviceId(0), "cell_based").unwrap();
        let b = dispatcher.compile(DeviceId(0), "cell_based").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.signature("do_step_car").is_some());
        assert!(matches!(
            dispatcher.compile(DeviceId(0), "lattice_boltzmann"),
            Err(ComputeError::UnknownProgram(_))
        ));
        assert!(matches!(
            dispatcher.device(DeviceId(3)),
            Err(ComputeError::UnknownDevice(DeviceId(3)))
        ));
    }

    #[test]
    fn reset_junctions_kernel() {
        let dispatcher = HostDispatcher::new(2).unwrap();
        let device = device(&dispatcher);
        let kernels = device.compile("cell_based").unwrap();
        let words = [0, 5, 10, 9, 20, 1];
        let junctions = device.create_buffer(&words, Access::ReadWrite).unwrap();
        let count = (words.len() / JUNCTION_WORDS) as i32;
        Kernel::new(device, &kernels, "reset_junctions")
            .unwrap()
            .bind_buffer(junctions)
            .bind_value(count)
            .run(count as usize)
            .unwrap()
            .finish()
            .unwrap();
        let mut out = [0; 6];
        device.read_buffer(junctions, &mut out).unwrap();
        assert_eq!(out, [0, 0, 10, 0, 20, 0]);
    }

    #[test]
    fn launch_validates_arguments() {
        let dispatcher = HostDispatcher::new(1).unwrap();
        let device = device(&dispatcher);
        let kernels = device.compile("cell_based").unwrap();
        let junctions = device.create_buffer(&[0, 5], Access::ReadOnly).unwrap();

        let mut kernel = Kernel::new(device, &kernels, "reset_junctions").unwrap();
        let err = kernel.bind_buffer(junctions).bind_value(1).run(1).err();
        assert!(matches!(err, Some(ComputeError::ReadOnlyBuffer { index: 0, .. })));

        let mut kernel = Kernel::new(device, &kernels, "reset_junctions").unwrap();
        let err = kernel.bind_value(1).bind_value(1).run(1).err();
        assert!(matches!(err, Some(ComputeError::ArgumentMismatch { index: 0, .. })));

        let mut kernel = Kernel::new(device, &kernels, "reset_junctions").unwrap();
        let err = kernel.bind_value_at(1, 1).run(1).err();
        assert!(matches!(err, Some(ComputeError::UnboundArgument { index: 0, .. })));

        assert!(matches!(
            Kernel::new(device, &kernels, "do_step_car_post"),
            Err(ComputeError::UnknownKernel { .. })
        ));
    }
}
