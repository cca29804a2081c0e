// Sine wave prediction with a sparse clockwork hierarchy
//
// Trains a three-layer hierarchy on a sampled sine wave, then runs it
// autonomously on its own predictions and prints the recalled curve.
//
// Run with: cargo run --release --example sine_wave
// Optional: pass a JSON config path to override the default hierarchy.
// Set RUST_LOG=info (or debug) for library logging.

use std::f32::consts::PI;

use sparse_clockwork::compute_system::ComputeSystem;
use sparse_clockwork::config::HierarchyConfig;
use sparse_clockwork::error::Result;
use sparse_clockwork::hierarchy::Hierarchy;

// --- Encoding helpers ---

/// Encode a value in [-1, 1] as one cell of a 64-cell column.
fn value_to_ci(v: f32, num_cells: i32) -> i32 {
    ((v + 1.0) * 0.5 * (num_cells - 1) as f32 + 0.5) as i32
}

fn ci_to_value(ci: i32, num_cells: i32) -> f32 {
    ci as f32 / (num_cells - 1) as f32 * 2.0 - 1.0
}

fn wave(t: usize) -> f32 {
    (t as f32 * 0.02 * 2.0 * PI).sin()
}

/// Render a value in [-1, 1] as a 32-character ASCII bar with a marker.
fn ascii_plot(v: f32) -> String {
    let pos = (((v + 1.0) * 0.5 * 31.0) + 0.5) as usize;
    (0..32).map(|i| if i == pos.min(31) { '*' } else { ' ' }).collect()
}

fn build() -> Result<Hierarchy> {
    match std::env::args().nth(1) {
        Some(path) => HierarchyConfig::from_file(path)?.build(),
        None => HierarchyConfig::default().build(),
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let mut cs = ComputeSystem::with_available_parallelism(0);
    let mut h = build()?;

    let input = h.get_input_desc(0);
    let num_cells = input.column_size * input.column_size;

    // --- Training phase ---

    let train_steps = 5_000;
    println!("Training for {train_steps} steps...");

    for t in 0..train_steps {
        let ci = value_to_ci(wave(t), num_cells);
        h.step(&mut cs, &[&[ci]], true, 0.0, None)?;

        if t % 1000 == 0 {
            println!("  step {t}");
        }
    }

    // --- Recall phase ---

    let recall_steps = 100;
    println!("\nRecall phase ({recall_steps} steps), feeding own predictions back:");

    let mut error_sum = 0.0;

    for t in train_steps..train_steps + recall_steps {
        let prediction = h.get_predictions(0).to_vec();
        h.step(&mut cs, &[&prediction], false, 0.0, None)?;

        let predicted = ci_to_value(h.get_predictions(0)[0], num_cells);
        let actual = wave(t + 1);
        error_sum += (predicted - actual) * (predicted - actual);

        println!("t={:<5} {:>6.3} {:>6.3} |{}|", t + 1, actual, predicted, ascii_plot(predicted));
    }

    let rms = (error_sum / recall_steps as f32).sqrt();
    println!("\nRecall RMS error: {rms:.4}");

    Ok(())
}
