//! Command-line interface for renova-live
//!
//! Provides argument parsing using clap derive macros.

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

/// Talk to the Renova voice companion
#[derive(Parser, Debug)]
#[command(
    name = "renova-live",
    version,
    about = "Real-time voice conversations with the Renova companion"
)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Suppress output (quiet mode)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose output (-v: session events, -vv: full diagnostics)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Options for a live conversation
#[derive(clap::Args, Debug, Default, Clone)]
pub struct TalkArgs {
    /// Voice gateway endpoint (host:port or unix:/path)
    #[arg(long, value_name = "ENDPOINT")]
    pub endpoint: Option<String>,

    /// Audio input device (e.g., hw:0)
    #[arg(long, value_name = "DEVICE")]
    pub device: Option<String>,

    /// Audio output device
    #[arg(long, value_name = "DEVICE")]
    pub output_device: Option<String>,

    /// Read your side of the conversation from a WAV file instead of the microphone
    #[arg(long, value_name = "FILE.wav")]
    pub input: Option<PathBuf>,

    /// Prebuilt voice of the assistant (e.g., Kore, Puck)
    #[arg(long, value_name = "VOICE")]
    pub voice: Option<String>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a live conversation (default when no command is given)
    Talk(TalkArgs),

    /// List available audio input devices
    Devices,

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

/// Configuration actions
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Print the configuration file path
    Path,
}

/// Map `-q`/`-v` to a default tracing filter directive.
pub fn log_level(quiet: bool, verbose: u8) -> &'static str {
    if quiet {
        return "error";
    }
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_no_command_defaults_to_none() {
        let cli = Cli::try_parse_from(["renova-live"]).unwrap();
        assert!(cli.command.is_none());
        assert!(!cli.quiet);
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn test_talk_with_all_options() {
        let cli = Cli::try_parse_from([
            "renova-live",
            "talk",
            "--endpoint",
            "unix:/run/renova.sock",
            "--device",
            "USB",
            "--output-device",
            "HDMI",
            "--input",
            "hello.wav",
            "--voice",
            "Puck",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Talk(args)) => {
                assert_eq!(args.endpoint.as_deref(), Some("unix:/run/renova.sock"));
                assert_eq!(args.device.as_deref(), Some("USB"));
                assert_eq!(args.output_device.as_deref(), Some("HDMI"));
                assert_eq!(args.input, Some(PathBuf::from("hello.wav")));
                assert_eq!(args.voice.as_deref(), Some("Puck"));
            }
            other => panic!("Expected Talk command, got {:?}", other),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["renova-live", "talk", "-vv", "--config", "/tmp/c.toml"])
            .unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.toml")));
    }

    #[test]
    fn test_config_actions() {
        let cli = Cli::try_parse_from(["renova-live", "config", "show"]).unwrap();
        match cli.command {
            Some(Commands::Config { action }) => assert_eq!(action, ConfigAction::Show),
            other => panic!("Expected Config command, got {:?}", other),
        }

        let cli = Cli::try_parse_from(["renova-live", "config", "path"]).unwrap();
        match cli.command {
            Some(Commands::Config { action }) => assert_eq!(action, ConfigAction::Path),
            other => panic!("Expected Config command, got {:?}", other),
        }
    }

    #[test]
    fn test_completions_requires_shell() {
        assert!(Cli::try_parse_from(["renova-live", "completions"]).is_err());
        let cli = Cli::try_parse_from(["renova-live", "completions", "bash"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Completions { shell: Shell::Bash })
        ));
    }

    #[test]
    fn test_log_level_mapping() {
        assert_eq!(log_level(true, 3), "error");
        assert_eq!(log_level(false, 0), "warn");
        assert_eq!(log_level(false, 1), "info");
        assert_eq!(log_level(false, 2), "debug");
        assert_eq!(log_level(false, 5), "trace");
    }
}
