//! Configuration parsing for the gateway.
//!
//! CLI arguments are validated once into a `GatewayConfig` which every stage
//! consumes without re-parsing flags. Nothing here is per-session: clients
//! adjust their visualization over the wire, not the process configuration.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Args;
use seg_core::ModelMode;

use crate::gateway::codec::ReplyFormat;

#[derive(Debug, Clone, Args)]
pub struct GatewayArgs {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Port to bind the HTTP/WebSocket listener to.
    #[arg(long, default_value_t = 8000)]
    pub port: u16,

    /// Directory holding the TorchScript model exports.
    #[arg(long, default_value = "./models")]
    pub model_dir: PathBuf,

    /// Model preset selected for new sessions.
    #[arg(long, default_value = "balanced")]
    pub default_mode: String,

    /// Encoding quality for reply frames (1-100).
    #[arg(long, default_value_t = 60)]
    pub reply_quality: u8,

    /// Reply image format ("jpeg" or "png").
    #[arg(long, default_value = "jpeg")]
    pub reply_format: String,

    /// PNG compression level (0-9) when replies are PNG encoded.
    #[arg(long, default_value_t = 6)]
    pub png_compression: u8,

    /// Maximum reply width; larger frames are downscaled proportionally.
    #[arg(long, default_value_t = 960)]
    pub max_reply_width: u32,

    /// Maximum reply height; larger frames are downscaled proportionally.
    #[arg(long, default_value_t = 540)]
    pub max_reply_height: u32,

    /// Quality clients are advised to use for inbound JPEG frames.
    #[arg(long, default_value_t = 80)]
    pub inbound_quality_hint: u8,

    /// Maximum frames a session may have in flight at once.
    #[arg(long, default_value_t = 2)]
    pub max_in_flight: u32,

    /// Minimum milliseconds between accepted frames per session.
    #[arg(long, default_value_t = 33)]
    pub min_frame_interval_ms: u64,

    /// Synthetic forward passes run when warming a model up.
    #[arg(long, default_value_t = 3)]
    pub warmup_iterations: usize,

    /// Seconds a ready session may stay silent before being torn down.
    #[arg(long, default_value_t = 10)]
    pub init_timeout_secs: u64,

    /// Force CPU inference even when CUDA is available.
    #[arg(long)]
    pub cpu: bool,

    /// Load every model profile at startup instead of on demand.
    #[arg(long)]
    pub preload_all: bool,

    /// Emit verbose logging (frame drops, per-frame details).
    #[arg(long)]
    pub verbose: bool,
}

/// Canonical configuration shared by every stage of the gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub model_dir: PathBuf,
    pub default_mode: ModelMode,
    pub reply_quality: u8,
    pub reply_format: ReplyFormat,
    pub png_compression: u8,
    pub max_reply_width: u32,
    pub max_reply_height: u32,
    pub inbound_quality_hint: u8,
    pub max_in_flight: u32,
    pub min_frame_interval: Duration,
    pub warmup_iterations: usize,
    pub init_timeout: Duration,
    pub use_cpu: bool,
    pub preload_all: bool,
    pub verbose: bool,
}

impl TryFrom<GatewayArgs> for GatewayConfig {
    type Error = anyhow::Error;

    fn try_from(args: GatewayArgs) -> Result<Self> {
        let default_mode: ModelMode = args
            .default_mode
            .parse()
            .with_context(|| format!("--default-mode {:?} is not a model preset", args.default_mode))?;

        let reply_format = match args.reply_format.as_str() {
            "jpeg" | "jpg" => ReplyFormat::Jpeg,
            "png" => ReplyFormat::Png,
            other => bail!("--reply-format must be \"jpeg\" or \"png\", got {other:?}"),
        };

        if !(1..=100).contains(&args.reply_quality) {
            bail!("--reply-quality must be between 1 and 100");
        }
        if args.png_compression > 9 {
            bail!("--png-compression must be between 0 and 9");
        }
        if !(1..=100).contains(&args.inbound_quality_hint) {
            bail!("--inbound-quality-hint must be between 1 and 100");
        }
        if args.max_reply_width == 0 || args.max_reply_height == 0 {
            bail!("reply dimensions must be positive");
        }
        if args.max_in_flight == 0 {
            bail!("--max-in-flight must be at least 1");
        }
        if args.warmup_iterations == 0 {
            bail!("--warmup-iterations must be at least 1");
        }

        Ok(Self {
            host: args.host,
            port: args.port,
            model_dir: args.model_dir,
            default_mode,
            reply_quality: args.reply_quality,
            reply_format,
            png_compression: args.png_compression,
            max_reply_width: args.max_reply_width,
            max_reply_height: args.max_reply_height,
            inbound_quality_hint: args.inbound_quality_hint,
            max_in_flight: args.max_in_flight,
            min_frame_interval: Duration::from_millis(args.min_frame_interval_ms),
            warmup_iterations: args.warmup_iterations,
            init_timeout: Duration::from_secs(args.init_timeout_secs),
            use_cpu: args.cpu,
            preload_all: args.preload_all,
            verbose: args.verbose,
        })
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Debug, Parser)]
    struct TestCli {
        #[command(flatten)]
        gateway: GatewayArgs,
    }

    fn parse(extra: &[&str]) -> Result<GatewayConfig> {
        let mut argv = vec!["seg-gateway"];
        argv.extend_from_slice(extra);
        GatewayConfig::try_from(TestCli::parse_from(argv).gateway)
    }

    #[test]
    fn defaults_match_the_service_contract() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.port, 8000);
        assert_eq!(config.default_mode, ModelMode::Balanced);
        assert_eq!(config.reply_quality, 60);
        assert_eq!(config.reply_format, ReplyFormat::Jpeg);
        assert_eq!(config.max_reply_width, 960);
        assert_eq!(config.max_reply_height, 540);
        assert_eq!(config.max_in_flight, 2);
        assert_eq!(config.min_frame_interval, Duration::from_millis(33));
        assert_eq!(config.warmup_iterations, 3);
        assert_eq!(config.init_timeout, Duration::from_secs(10));
        assert!(!config.use_cpu);
        assert!(!config.preload_all);
    }

    #[test]
    fn unknown_default_mode_is_rejected() {
        let err = parse(&["--default-mode", "turbo"]).unwrap_err();
        assert!(err.to_string().contains("turbo"));
    }

    #[test]
    fn quality_bounds_are_enforced()  {
        assert!(parse(&["--reply-quality", "0"]).is_err());
        assert!(parse(&["--reply-quality", "100"]).is_ok());
        assert!(parse(&["--png-compression", "10"]).is_err());
    }

    #[test]
    fn reply_format_accepts_both_codecs() {
        assert_eq!(parse(&["--reply-format", "png"]).unwrap().reply_format, ReplyFormat::Png);
        assert_eq!(parse(&["--reply-format", "jpg"]).unwrap().reply_format, ReplyFormat::Jpeg);
        assert!(parse(&["--reply-format", "webp"]).is_err());
    }

    #[test]
    fn flow_control_knobs_must_be_positive() {
        assert!(parse(&["--max-in-flight", "0"]).is_err());
        assert!(parse(&["--warmup-iterations", "0"]).is_err());
        assert!(parse(&["--min-frame-interval-ms", "0"]).is_ok());
    }
}
