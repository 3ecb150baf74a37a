// src/main.rs
use anyhow::Result;
use clap::{Parser, ValueEnum};
use delivery_risk_lib::config::PipelineConfig;
use delivery_risk_lib::inference::run_inference;
use delivery_risk_lib::orchestrator::run_pipeline;
use delivery_risk_lib::training::train_and_save;
use delivery_risk_lib::utils::env::load_env;
use delivery_risk_lib::warehouse::build_warehouse;
use log::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Stage {
    /// Rebuild the fact table from the operational store.
    Etl,
    /// Train the model from the fact table and save artifacts.
    Train,
    /// Score unfulfilled orders with the saved model.
    Infer,
    /// Run all three stages in sequence.
    All,
}

/// Late-delivery prediction pipeline.
#[derive(Debug, Parser)]
#[command(name = "pipeline")]
struct Args {
    /// Which stage to run.
    #[arg(long, value_enum, default_value_t = Stage::All)]
    stage: Stage,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    load_env();
    let args = Args::parse();
    let config = PipelineConfig::from_env();
    info!(
        "Data dir: {}, artifacts dir: {}",
        config.data_dir.display(),
        config.artifacts_dir.display()
    );

    match args.stage {
        Stage::Etl => {
            let report = build_warehouse(&config)?;
            println!("Warehouse updated. fact_orders_ml rows: {}", report.rows_written);
        }
        Stage::Train => {
            let report = train_and_save(&config)?;
            println!(
                "Training complete. Threshold: {:.2} (recall-focused for late_delivery)",
                report.threshold
            );
        }
        Stage::Infer => {
            let written = run_inference(&config)?;
            println!("Inference complete. Predictions written: {}", written);
        }
        Stage::All => {
            let summary = run_pipeline(&config)?;
            println!("\n=== PIPELINE SUMMARY ===");
            println!("Fact rows: {}", summary.fact_rows);
            println!("Classification threshold: {:.2}", summary.threshold);
            println!("Predictions written: {}", summary.predictions_written);
        }
    }
    Ok(())
}
