use anyhow::Context;
use clap::Parser;
use macropadd::device::link::HidApiConnector;
use macropadd::update::{FirmwareImage, FirmwareVersion};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// macropadd: host daemon for a USB macro keypad
#[derive(Parser)]
#[command(name = "macropadd", version, about)]
struct Cli {
    /// Path to the config file (TOML).
    #[arg(short, long, default_value = "macropadd.toml")]
    config: PathBuf,

    /// Enable JSON log output (for journald).
    #[arg(long)]
    json: bool,

    /// Validate config and exit.
    #[arg(long)]
    check: bool,

    /// Flash this firmware image to the keypad and exit.
    #[arg(long, value_name = "IMAGE", requires = "update_version")]
    update: Option<PathBuf>,

    /// Version installed by the `--update` image, e.g. 1.2.0.
    #[arg(long, value_name = "X.Y.Z")]
    update_version: Option<FirmwareVersion>,

    /// Flash even if the keypad already runs that version or newer.
    #[arg(long, requires = "update")]
    force: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Init tracing.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("macropadd=info"));

    if cli.json {
        fmt().with_env_filter(filter).json().init();
    } else {
        fmt().with_env_filter(filter).init();
    }

    info!("macropadd v{}", env!("CARGO_PKG_VERSION"));

    // Load config.
    let config_path = cli
        .config
        .canonicalize()
        .unwrap_or_else(|_| cli.config.clone());
    let config = macropadd::config::load(&config_path)?;

    if cli.check {
        println!(
            "config OK: {} buttons, {} LED slots, relay on {}:{}",
            config.buttons.len(),
            config.leds.len(),
            config.relay.bind_address,
            config.relay.bind_port,
        );
        return Ok(());
    }

    if let (Some(path), Some(version)) = (&cli.update, cli.update_version) {
        let image = FirmwareImage::from_file(path, version)
            .with_context(|| format!("reading firmware image {}", path.display()))?;
        macropadd::daemon::update_firmware(Arc::new(HidApiConnector), &config, &image, cli.force).await?;
        println!("keypad firmware is {version}");
        return Ok(());
    }

    info!(
        "loaded config: {} buttons, {} LED slots",
        config.buttons.len(),
        config.leds.len()
    );

    // Run the daemon.
    macropadd::daemon::run(config, config_path).await?;

    Ok(())
}
