//! CLI entry point for the gateway binary.
//!
//! Parsing, telemetry setup, model-pool construction, and the exit-code
//! contract live here: 0 on clean shutdown, 1 when the listen socket cannot
//! be opened, 2 when the model pool fails to initialise at startup.

use std::sync::Arc;

use clap::Parser;
use seg_core::tch::Device;
use seg_core::{ModelMode, ModelPool};
use tracing::{error, info, warn};

use crate::gateway::{telemetry, GatewayArgs, GatewayConfig};

const EXIT_OK: i32 = 0;
const EXIT_BIND_FAILED: i32 = 1;
const EXIT_POOL_INIT_FAILED: i32 = 2;

#[derive(Debug, Parser)]
#[command(
    name = "seg-gateway",
    version,
    about = "Real-time semantic segmentation over WebSocket"
)]
struct AppCli {
    #[command(flatten)]
    gateway: GatewayArgs,
}

/// Run the gateway and translate the outcome into a process exit code.
pub fn run() -> i32 {
    let cli = AppCli::parse();
    let config = match GatewayConfig::try_from(cli.gateway) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err:#}");
            return EXIT_BIND_FAILED;
        }
    };

    telemetry::init_tracing(config.verbose);
    telemetry::init_metrics_recorder();

    let device = if config.use_cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available()
    };
    let fp16 = matches!(device, Device::Cuda(_));
    info!("inference device: {device:?} (fp16: {fp16})");

    let pool = Arc::new(ModelPool::new(config.model_dir.clone(), device, fp16));
    if let Err(err) = preload_models(&pool, &config) {
        error!("model pool initialisation failed: {err:#}");
        return EXIT_POOL_INIT_FAILED;
    }

    let outcome = crate::gateway::run(config, pool.clone());
    pool.clear();

    match outcome {
        Ok(()) => {
            info!("gateway stopped cleanly");
            EXIT_OK
        }
        Err(err) => {
            error!("{err}");
            EXIT_BIND_FAILED
        }
    }
}

/// Load the default model (fatal on failure) and, when requested, the rest
/// of the catalogue (best effort).
fn preload_models(pool: &ModelPool, config: &GatewayConfig) -> anyhow::Result<()> {
    info!("loading default model: {}", config.default_mode);
    pool.get(config.default_mode)?;

    if config.preload_all {
        for mode in ModelMode::ALL {
            if mode == config.default_mode {
                continue;
            }
            let profile = mode.profile();
            match pool.get(mode) {
                Ok(_) => info!(
                    "preloaded {mode} ({}, ~{} MB)",
                    profile.name, profile.memory_mb
                ),
                Err(err) => warn!("failed to preload {mode} model: {err}"),
            }
        }
    }
    Ok(())
}
