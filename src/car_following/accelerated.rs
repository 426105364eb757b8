//! Drives car-following steps on a compute device.
//!
//! The post-phase kernel is relaunched until a pass leaves the device's change flag unset.

use super::{SimulationData, CAR_WORDS, DT, LONG_FIXPOINT};
use crate::dispatch::{Access, ComputeDevice, ComputeError, DeviceBuffers, Kernel};
use crate::kernels::car_following::SEED_ARG;
use crate::kernels::{pack, unpack, GENERATOR_WORDS, JUNCTION_WORDS};
use crate::random::RandomTable;
use crate::StepTimings;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Instant;

pub(crate) const PROGRAM: &str = "car_following";

/// Runs one step per seed, keeping the state on the device in between.
///
/// `data` is only modified once every step has completed.
pub(crate) fn run(
    device: &dyn ComputeDevice,
    data: &mut SimulationData,
    random: &RandomTable,
    seeds: &[i32],
    spawn: bool,
) -> Result<StepTimings, ComputeError> {
    let kernels = device.compile(PROGRAM)?;
    let mut buffers = DeviceBuffers::new(device);

    let slot_words = data
        .slots
        .iter()
        .map(|slot| slot.load(Ordering::Relaxed) as u32)
        .collect::<Vec<_>>();
    let random_words = random.as_slice().iter().map(|value| value.to_bits()).collect::<Vec<_>>();
    let cells = buffers.upload(&pack(&data.cells), Access::ReadWrite)?;
    let slots = buffers.upload(&slot_words, Access::ReadWrite)?;
    let junctions = buffers.upload(&pack(&data.junctions), Access::ReadWrite)?;
    let generators = buffers.upload(&pack(&data.generators), Access::ReadWrite)?;
    let cars = buffers.upload(&pack(&data.cars), Access::ReadWrite)?;
    let random_buffer = buffers.upload(&random_words, Access::ReadOnly)?;
    let changed = buffers.upload(&[0], Access::ReadWrite)?;

    let cells_len = data.cells.len() as i32;
    let junctions_len = data.junctions.len() as i32;
    let generators_len = data.generators.len() as i32;
    let cars_len = data.cars.len() as i32;
    let cars_per_cell = data.cars_per_cell as i32;
    let random_len = random.len() as i32;

    let mut reset = Kernel::new(device, &kernels, "reset_junctions")?;
    reset.bind_buffer(junctions).bind_value(junctions_len);
    let mut pre = Kernel::new(device, &kernels, "do_step_car_pre")?;
    pre.bind_buffer(cells)
        .bind_buffer(slots)
        .bind_value(cells_len)
        .bind_buffer(junctions)
        .bind_value(junctions_len)
        .bind_buffer(cars)
        .bind_value(cars_len)
        .bind_value(cars_per_cell)
        .bind_buffer(random_buffer)
        .bind_value(random_len)
        .bind_value(0)
        .bind_value(DT);
    let mut post = Kernel::new(device, &kernels, "do_step_car_post")?;
    post.bind_buffer(cells)
        .bind_buffer(slots)
        .bind_value(cells_len)
        .bind_buffer(junctions)
        .bind_value(junctions_len)
        .bind_buffer(cars)
        .bind_value(cars_len)
        .bind_value(cars_per_cell)
        .bind_buffer(random_buffer)
        .bind_value(random_len)
        .bind_value(0)
        .bind_buffer(changed);
    let mut spawn_cars = Kernel::new(device, &kernels, "spawn_cars")?;
    spawn_cars
        .bind_buffer(cells)
        .bind_buffer(slots)
        .bind_value(cells_len)
        .bind_buffer(generators)
        .bind_value(generators_len)
        .bind_buffer(cars)
        .bind_value(cars_len)
        .bind_value(cars_per_cell)
        .bind_buffer(random_buffer)
        .bind_value(random_len)
        .bind_value(0)
        .bind_value(DT);

    let mut timings = StepTimings::default();
    let mut flag = [0];
    for &seed in seeds {
        reset.run(data.junctions.len())?;
        let timer = Instant::now();
        pre.bind_value_at(SEED_ARG, seed).run(data.cells.len())?.finish()?;
        post.bind_value_at(SEED_ARG, seed);
        let mut passes = 0;
        loop {
            device.write_buffer(changed, &[0])?;
            post.run(data.cells.len())?.finish()?;
            device.read_buffer(changed, &mut flag)?;
            passes += 1;
            if flag[0] == 0 {
                break;
            }
            if passes == LONG_FIXPOINT {
                log::warn!("lane transitions still changing after {} passes", passes);
            }
        }
        log::trace!("lane transitions settled after {} passes", passes);
        timings.cars += timer.elapsed();
        if spawn {
            let timer = Instant::now();
            spawn_cars
                .bind_value_at(SEED_ARG, seed)
                .run(data.generators.len())?
                .finish()?;
            timings.generators += timer.elapsed();
        }
    }

    let slot_words = buffers.download(slots, data.slots.len())?;
    let junction_words = buffers.download(junctions, data.junctions.len() * JUNCTION_WORDS)?;
    let generator_words = buffers.download(generators, data.generators.len() * GENERATOR_WORDS)?;
    let car_words = buffers.download(cars, data.cars.len() * CAR_WORDS)?;

    data.slots = slot_words
        .into_iter()
        .map(|word| AtomicI32::new(word as i32))
        .collect();
    data.junctions = unpack(&junction_words);
    data.generators = unpack(&generator_words);
    data.cars = unpack(&car_words);
    Ok(timings)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::car_following::{generate, reference};
    use crate::dispatch::{DeviceId, Dispatcher, HostDispatcher};
    use crate::GenerationParams;

    #[test]
    fn batch_matches_reference() {
        let params = GenerationParams::new(10, 2, 2, 30, 40, 0.3).with_seed(14);
        let random = RandomTable::new(Some(9));
        let mut host = generate(&params);
        let mut device_data = generate(&params);
        let seeds = (2..22).collect::<Vec<i32>>();

        let pool = rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap();
        pool.install(|| {
            for &seed in &seeds {
                reference::step(&mut host, &random, seed, true);
            }
        });
        let dispatcher = HostDispatcher::new(1).unwrap();
        let device = dispatcher.device(DeviceId(0)).unwrap();
        run(device, &mut device_data, &random, &seeds, true).unwrap();

        for (a, b) in host.cars.iter().zip(&device_data.cars) {
            assert_eq!(a.position(), b.position());
            assert_eq!(a.position_in_cell().to_bits(), b.position_in_cell().to_bits());
            assert_eq!(a.speed().to_bits(), b.speed().to_bits());
        }
        for cell in 0..host.cells.len() {
            assert_eq!(host.cars_in(cell), device_data.cars_in(cell));
        }
        assert!(device_data.check_integrity().consistent);
    }

    #[test]
    fn out_of_memory_leaves_state() {
        let params = GenerationParams::new(5, 1, 1, 3, 3, 0.3).with_seed(1);
        let mut data = generate(&params);
        let random = RandomTable::from_values(vec![0.5]).unwrap();
        let dispatcher = HostDispatcher::with_memory_limit(1, 16).unwrap();
        let device = dispatcher.device(DeviceId(0)).unwrap();
        let slots = data.cars_in(data.cars[0].position().unwrap());
        assert!(run(device, &mut data, &random, &[2], false).is_err());
        assert_eq!(data.cars_in(data.cars[0].position().unwrap()), slots);
    }
}
