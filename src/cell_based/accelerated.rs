//! Drives cell-based steps on a compute device.

use super::SimulationData;
use crate::dispatch::{Access, ComputeDevice, ComputeError, DeviceBuffers, Kernel};
use crate::kernels::cell_based::SEED_ARG;
use crate::kernels::{pack, unpack, GENERATOR_WORDS, JUNCTION_WORDS};
use crate::random::RandomTable;
use crate::StepTimings;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Instant;

/// The kernel program run by this driver.
pub(crate) const PROGRAM: &str = "cell_based";

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

    let occupancy_words = data
        .occupancy
        .iter()
        .map(|occupant| occupant.load(Ordering::Relaxed) as u32)
        .collect::<Vec<_>>();
    let random_words = random.as_slice().iter().map(|value| value.to_bits()).collect::<Vec<_>>();
    let cells = buffers.upload(&pack(&data.cells), Access::ReadOnly)?;
    let occupancy = buffers.upload(&occupancy_words, Access::ReadWrite)?;
    let junctions = buffers.upload(&pack(&data.junctions), Access::ReadWrite)?;
    let generators = buffers.upload(&pack(&data.generators), Access::ReadWrite)?;
    let cars = buffers.upload(&pack(&data.cars), Access::ReadWrite)?;
    let random_buffer = buffers.upload(&random_words, Access::ReadOnly)?;

    let cells_len = data.cells.len() as i32;
    let junctions_len = data.junctions.len() as i32;
    let generators_len = data.generators.len() as i32;
    let cars_len = data.cars.len() as i32;
    let random_len = random.len() as i32;

    let mut reset = Kernel::new(device, &kernels, "reset_junctions")?;
    reset.bind_buffer(junctions).bind_value(junctions_len);
    let mut step_cars = Kernel::new(device, &kernels, "do_step_car")?;
    step_cars
        .bind_buffer(cells)
        .bind_buffer(occupancy)
        .bind_value(cells_len)
        .bind_buffer(junctions)
        .bind_value(junctions_len)
        .bind_buffer(cars)
        .bind_value(cars_len)
        .bind_buffer(random_buffer)
        .bind_value(random_len)
        .bind_value(0);
    let mut spawn_cars = Kernel::new(device, &kernels, "spawn_cars")?;
    spawn_cars
        .bind_buffer(cells)
        .bind_buffer(occupancy)
        .bind_value(cells_len)
        .bind_buffer(generators)
        .bind_value(generators_len)
        .bind_buffer(cars)
        .bind_value(cars_len)
        .bind_buffer(random_buffer)
        .bind_value(random_len)
        .bind_value(0);

    let mut timings = StepTimings::default();
    for &seed in seeds {
        reset.run(data.junctions.len())?;
        let timer = Instant::now();
        step_cars
            .bind_value_at(SEED_ARG, seed)
            .run(data.cars.len())?
            .finish()?;
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

    let occupancy_words = buffers.download(occupancy, data.occupancy.len())?;
    let junction_words = buffers.download(junctions, data.junctions.len() * JUNCTION_WORDS)?;
    let generator_words = buffers.download(generators, data.generators.len() * GENERATOR_WORDS)?;
    let car_words = buffers.download(cars, data.cars.len() * super::CAR_WORDS)?;

    data.occupancy = occupancy_words
        .into_iter()
        .map(|word| AtomicI32::new(word as i32))
        .collect();
    data.junctions = unpack(&junction_words);
    data.generators = unpack(&generator_words);
    data.cars = unpack(&car_words);
    Ok(timings)
}
