//! Logging a small training loop with tracklab.

use tracklab::{
    init, init_tracing, Array, Image, LogData, LogLevel, RunConfig, TelemetryConfig, Text,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _guard = init_tracing(&TelemetryConfig::default());

    let config = RunConfig::new("demo_project")
        .with_experiment_name("sine_fit")
        .with_base_dir("./tracklab_runs")
        .with_param("lr", 0.01)
        .with_param("optimizer", "adam");

    let mut run = init(config)?;
    println!("Started run {} in {}", run.id(), run.run_dir().display());

    for step in 0..50u64 {
        let x = step as f64 * 0.1;
        let data = LogData::new()
            .with("train/loss", (-x).exp())
            .with("train/acc", 1.0 - (-x).exp())
            .with("lr", 0.01 * 0.95f64.powi(step as i32));
        run.log(data, Some(step));
    }

    // A 16x16 gradient image and a text note
    let pixels: Vec<f32> = (0..16 * 16).map(|i| (i % 16) as f32 / 15.0).collect();
    let image = Image::from_array(Array::new(pixels, vec![16, 16])?)?.with_caption("gradient");
    run.log(
        LogData::new()
            .with("samples/gradient", image)
            .with("notes", Text::new("converged")),
        None,
    );

    run.console(LogLevel::Info, "training done");
    let record = run.finish();
    println!(
        "Run {} finished as {} after {} log calls ({:?})",
        record.id, record.state, record.epochs, record.delivery
    );
    Ok(())
}
