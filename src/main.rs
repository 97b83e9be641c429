use anyhow::Result;
use clap::{CommandFactory, Parser};
use owo_colors::OwoColorize;
use pcmlink::app::{apply_overrides, layout_report, run_listener, run_stream};
use pcmlink::cli::{Cli, Commands, ConfigAction, RunArgs};
use pcmlink::config::Config;
use std::io::IsTerminal;
use std::path::Path;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.quiet, cli.verbose);

    match cli.command {
        None => {
            let config = load_config(cli.config.as_deref())?;
            handle_run(config, &cli.run).await?;
        }
        Some(Commands::Run(args)) => {
            let config = load_config(cli.config.as_deref())?;
            handle_run(config, &args).await?;
        }
        Some(Commands::Listen { bind }) => {
            run_listener(&bind).await?;
        }
        Some(Commands::Layout) => {
            print!("{}", layout_report()?);
            if std::io::stdout().is_terminal() {
                println!("{}", "layout OK".green());
            }
        }
        Some(Commands::Config { action }) => {
            handle_config_command(action, cli.config.as_deref())?;
        }
        #[cfg(feature = "cpal-audio")]
        Some(Commands::Devices) => {
            list_audio_devices()?;
        }
        Some(Commands::Completions { shell }) => {
            clap_complete::generate(shell, &mut Cli::command(), "pcmlink", &mut std::io::stdout());
        }
    }

    Ok(())
}

/// Install the tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise -q/-v pick the level.
fn init_logging(quiet: bool, verbose: u8) {
    let level = match (quiet, verbose) {
        (true, _) => "warn",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("pcmlink={level},warn")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .init();
}

/// Load configuration from file or use defaults.
///
/// Priority order:
/// 1. Custom config path from CLI (--config)
/// 2. Default config path (~/.config/pcmlink/config.toml)
/// 3. Built-in defaults with environment variable overrides
fn load_config(custom_path: Option<&Path>) -> Result<Config> {
    let config = if let Some(path) = custom_path {
        Config::load(path)?
    } else {
        Config::load_or_default(&Config::default_path())?
    };

    Ok(config.with_env_overrides())
}

async fn handle_run(mut config: Config, args: &RunArgs) -> Result<()> {
    apply_overrides(&mut config, args);
    let snapshot = run_stream(config, args.duration).await?;

    let summary = format!(
        "captured {} frames ({} dropped), sent {} batches ({} evicted, {} discarded offline, {} send failures)",
        snapshot.frames_captured,
        snapshot.frames_dropped,
        snapshot.batches_sent,
        snapshot.output_evictions,
        snapshot.dropped_disconnected,
        snapshot.send_failures,
    );
    if snapshot.batches_sent == 0 && snapshot.batches_sealed > 0 {
        eprintln!("{}", summary.yellow());
    } else {
        eprintln!("{}", summary.green());
    }
    Ok(())
}

/// Handle configuration commands.
fn handle_config_command(action: ConfigAction, custom_path: Option<&Path>) -> Result<()> {
    let config_path = custom_path
        .map(Path::to_path_buf)
        .unwrap_or_else(Config::default_path);

    match action {
        ConfigAction::Show => {
            let config = load_config(custom_path)?;
            if let Err(e) = config.validate() {
                eprintln!("{}", format!("Warning: {}", e).red());
            }
            print!("{}", config.to_toml()?);
        }
        ConfigAction::Path => {
            println!("{}", config_path.display());
        }
    }

    Ok(())
}

/// List available audio input devices.
#[cfg(feature = "cpal-audio")]
fn list_audio_devices() -> Result<()> {
    let devices = pcmlink::audio::list_devices()?;

    if devices.is_empty() {
        eprintln!("No audio input devices found");
        std::process::exit(1);
    }

    println!("Available audio input devices:");
    for (idx, device) in devices.iter().enumerate() {
        println!("  [{}] {}", idx, device);
    }

    Ok(())
}
