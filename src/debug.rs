use crate::Simulation;
use serde_json::json;

/// Summarises the step that just completed.
pub(crate) fn step_frame(sim: &Simulation, backend: &str) -> serde_json::Value {
    let stats = sim.statistics();
    let timings = sim.last_timings();
    json!({
        "model": sim.kind().to_string(),
        "backend": backend,
        "step": sim.current_step(),
        "active_cars": stats.active_cars,
        "waiting_cars": stats.waiting_cars,
        "timings": {
            "total": timings.total.as_secs_f64(),
            "cars": timings.cars.as_secs_f64(),
            "generators": timings.generators.as_secs_f64(),
        },
    })
}
