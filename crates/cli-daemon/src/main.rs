use anyhow::{Context, Result};
use clap::Parser;
use daemon::{config::TranscodeConfig, watch, SystemRunner, Triage};
use log::{info, LevelFilter};
use std::path::PathBuf;

/// Library transcoding daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Library root: one directory per media item
    library_root: Option<PathBuf>,

    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Hardware acceleration driver passed to ffmpeg
    #[arg(long)]
    hwaccel: Option<String>,

    /// Encoder threads (0 lets ffmpeg decide)
    #[arg(long)]
    threads: Option<u32>,

    /// Quality factor
    #[arg(long)]
    crf: Option<u32>,

    /// Video codec
    #[arg(long)]
    codec: Option<String>,

    /// Encoder speed preset
    #[arg(long)]
    speed: Option<String>,

    /// Output pixel format
    #[arg(long)]
    pix_fmt: Option<String>,

    /// Subtitle codec
    #[arg(long)]
    subtitle_codec: Option<String>,

    /// Files at or below this many bytes are never transcoded
    #[arg(long)]
    min_bytes: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    /// Command-line values win over the file and the defaults
    fn apply(self, cfg: &mut TranscodeConfig) {
        if let Some(root) = self.library_root {
            cfg.library_root = root;
        }
        if let Some(hwaccel) = self.hwaccel {
            cfg.hwaccel = hwaccel;
        }
        if let Some(threads) = self.threads {
            cfg.threads = threads;
        }
        if let Some(crf) = self.crf {
            cfg.crf = crf;
        }
        if let Some(codec) = self.codec {
            cfg.codec = codec;
        }
        if let Some(speed) = self.speed {
            cfg.speed = speed;
        }
        if let Some(pix_fmt) = self.pix_fmt {
            cfg.pix_fmt = pix_fmt;
        }
        if let Some(subtitle_codec) = self.subtitle_codec {
            cfg.subtitle_codec = subtitle_codec;
        }
        if let Some(min_bytes) = self.min_bytes {
            cfg.min_bytes = min_bytes;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins; otherwise info, or debug with --verbose
    let mut logger = env_logger::Builder::new();
    logger
        .filter_level(if args.verbose { LevelFilter::Debug } else { LevelFilter::Info })
        .parse_default_env()
        .format_timestamp_secs()
        .init();

    let mut cfg = TranscodeConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    args.apply(&mut cfg);

    cfg.library_root = cfg
        .library_root
        .canonicalize()
        .with_context(|| format!("Cannot open library root: {}", cfg.library_root.display()))?;

    info!("Transcode daemon starting");
    info!("Configuration loaded:");
    info!("  Library root: {}", cfg.library_root.display());
    info!("  Codec: {} (crf {}, preset {}, {})", cfg.codec, cfg.crf, cfg.speed, cfg.pix_fmt);
    info!("  Min bytes: {}", cfg.min_bytes);
    info!("  Max width: {}", cfg.max_width);
    info!("  Rescan interval: {}s", cfg.rescan_interval_secs);

    let triage = Triage::new(cfg, SystemRunner);
    watch::run(triage).await
}
