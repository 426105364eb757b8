use std::time::Instant;

use traffic_grid::{GenerationParams, ModelKind, Simulation};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let kind = match std::env::args().nth(1).as_deref() {
        Some("car-following") => ModelKind::CarFollowing,
        _ => ModelKind::CellBased,
    };
    let mut sim = Simulation::new(kind, None)?;
    match std::env::args().nth(2) {
        Some(path) => sim.load_file(path)?,
        None => sim.generate_new(&GenerationParams::new(24, 10, 10, 2000, 4000, 0.1))?,
    }

    println!("Simulating {}...", sim);
    let num_frames = 100;
    for _ in 0..10 {
        let start = Instant::now();
        for _ in 0..num_frames {
            sim.do_step_reference()?;
        }
        let frame = start.elapsed() / num_frames;
        let active = sim.statistics().active_cars;
        println!(
            "Avg. frame: {:?} --> {:.0} steps/s ({} cars, {:.0} car-steps/s)",
            frame,
            1.0 / frame.as_secs_f32(),
            active,
            active as f32 / frame.as_secs_f32(),
        );
    }
    Ok(())
}
