use anyhow::Result;
use clap::{CommandFactory, Parser};
use renova_live::app::run_talk;
use renova_live::audio::capture::list_devices;
use renova_live::cli::{Cli, Commands, ConfigAction, TalkArgs, log_level};
use renova_live::config::Config;
use std::path::{Path, PathBuf};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.quiet, cli.verbose);
    tracing::debug!("renova-live {}", renova_live::version_string());

    match cli.command {
        None => {
            let config = load_config(cli.config.as_deref())?;
            run_talk(config, TalkArgs::default(), cli.quiet).await?;
        }
        Some(Commands::Talk(args)) => {
            let config = load_config(cli.config.as_deref())?;
            run_talk(config, args, cli.quiet).await?;
        }
        Some(Commands::Devices) => {
            list_audio_devices()?;
        }
        Some(Commands::Config { action }) => {
            handle_config_command(action, cli.config.as_deref())?;
        }
        Some(Commands::Completions { shell }) => {
            clap_complete::generate(
                shell,
                &mut Cli::command(),
                "renova-live",
                &mut std::io::stdout(),
            );
        }
    }

    Ok(())
}

/// Install the stderr log subscriber. `RUST_LOG` wins over `-v`/`-q`.
fn init_tracing(quiet: bool, verbose: u8) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level(quiet, verbose)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbose >= 2)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Priority order:
/// 1. Custom config path from CLI (--config)
/// 2. Default config path (~/.config/renova-live/config.toml)
/// 3. Built-in defaults with environment variable overrides
fn load_config(custom_path: Option<&Path>) -> Result<Config> {
    let config = if let Some(path) = custom_path {
        Config::load(path)?
    } else {
        Config::load_or_default(&Config::default_path())?
    };

    Ok(config.with_env_overrides())
}

/// List available audio input devices.
fn list_audio_devices() -> Result<()> {
    let devices = list_devices()?;

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

/// Handle configuration commands.
fn handle_config_command(action: ConfigAction, custom_path: Option<&Path>) -> Result<()> {
    let config_path = custom_path
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_path);

    match action {
        ConfigAction::Show => {
            let config = Config::load_or_default(&config_path)?.with_env_overrides();
            print!("{}", toml::to_string_pretty(&config)?);
        }
        ConfigAction::Path => {
            println!("{}", config_path.display());
        }
    }
    Ok(())
}
