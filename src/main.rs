use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;

use robot_ekf_rs::config::EstimatorConfig;
use robot_ekf_rs::simulation::{run_simulation, SimulationOptions};

#[derive(Parser, Debug)]
#[command(name = "arm_ekf")]
#[command(about = "Simulated arm with encoders and a biased gyro - raw encoders vs EKF", long_about = None)]
struct Args {
    /// Number of control ticks to simulate
    #[arg(long, default_value = "4000")]
    ticks: usize,

    /// Control period in seconds (overrides the config file)
    #[arg(long)]
    dt: Option<f64>,

    /// Number of arm joints
    #[arg(long, default_value = "3")]
    joints: usize,

    /// Noise generator seed
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Estimator config (JSON, missing fields use defaults)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write a JSON report to this path
    #[arg(long)]
    report: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => EstimatorConfig::from_json_file(path)
            .with_context(|| format!("loading estimator config from {}", path.display()))?,
        None => EstimatorConfig::default(),
    };
    if let Some(dt) = args.dt {
        config.dt = dt;
    }
    config.validate().context("invalid estimator config")?;

    let options = SimulationOptions {
        ticks: args.ticks,
        joints: args.joints,
        seed: args.seed,
        ..Default::default()
    };

    println!("[{}] Arm EKF simulation starting", ts_now());
    println!("  Ticks: {} (dt = {} s)", options.ticks, config.dt);
    println!("  Joints: {}", options.joints);
    println!("  Seed: {}", options.seed);

    let report = run_simulation(&config, &options).context("simulation failed")?;

    println!("[{}] Done", ts_now());
    println!("  Raw encoder RMS error: {:.6} rad", report.raw_rms_error);
    println!("  Filtered RMS error:    {:.6} rad", report.filtered_rms_error);
    println!(
        "  Gyro bias estimate:    [{:.4}, {:.4}, {:.4}] rad/s (true [{:.4}, {:.4}, {:.4}])",
        report.gyro_bias_estimate[0],
        report.gyro_bias_estimate[1],
        report.gyro_bias_estimate[2],
        options.gyro_bias[0],
        options.gyro_bias[1],
        options.gyro_bias[2],
    );
    println!(
        "  Ticks: {} corrected, {} integrate-only, mean {:.1} us, max {:.1} us",
        report.stats.corrected_ticks,
        report.stats.integrate_only_ticks,
        report.stats.mean_tick_us,
        report.stats.max_tick_us,
    );

    if let Some(path) = &args.report {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json).with_context(|| format!("writing report to {}", path.display()))?;
        println!("[{}] Report written to {}", ts_now(), path.display());
    }

    Ok(())
}

fn ts_now() -> String {
    Utc::now().format("%H:%M:%S").to_string()
}
