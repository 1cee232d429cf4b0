//! Live conversation entry point.
//!
//! Wires the CPAL (or WAV) backend and the socket transport into a
//! [`VoiceSession`], renders a volume/speaking line on stderr and tears the
//! session down on Ctrl+C or when it ends on its own.

use crate::audio::backend::{CpalBackend, WavBackend};
use crate::audio::capture::suppress_audio_warnings;
use crate::audio::device::AudioBackend;
use crate::cli::TalkArgs;
use crate::config::Config;
use crate::error::{Result, VoiceError};
use crate::pipeline::error::eprintln_clear;
use crate::session::{SessionCallbacks, SessionOptions, SessionState, VoiceSession};
use crate::transport::SocketTransport;
use owo_colors::OwoColorize;
use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

const BAR_WIDTH: usize = 30;

/// Render the input level (0-255) as a fixed-width bar.
pub fn format_volume_bar(volume: f32, speaking: bool) -> String {
    let filled = ((volume.clamp(0.0, 255.0) / 255.0) * BAR_WIDTH as f32).round() as usize;
    let bar: String = (0..BAR_WIDTH)
        .map(|i| if i < filled { '█' } else { '░' })
        .collect();
    let marker = if speaking { " ◀ speaking" } else { "" };
    format!("[{}] {:>3}{}", bar, volume.round() as u32, marker)
}

/// Single stderr line showing the microphone level and whether the
/// assistant is talking.
struct StatusLine {
    enabled: bool,
    speaking: AtomicBool,
}

impl StatusLine {
    fn new(enabled: bool) -> Self {
        Self {
            enabled,
            speaking: AtomicBool::new(false),
        }
    }

    fn volume(&self, volume: f32) {
        if !self.enabled {
            return;
        }
        let line = format_volume_bar(volume, self.speaking.load(Ordering::Relaxed));
        eprint!("\r\x1b[2K{}", line);
        io::stderr().flush().ok();
    }

    fn speaking(&self, speaking: bool) {
        self.speaking.store(speaking, Ordering::Relaxed);
    }

    fn status(&self, state: SessionState) {
        if !self.enabled {
            return;
        }
        let message = match state {
            SessionState::Connecting => "Connecting...".dimmed().to_string(),
            SessionState::Connected => "Connected. Start talking.".green().to_string(),
            SessionState::Disconnected => "Disconnected.".dimmed().to_string(),
            SessionState::Error => "Session failed.".red().to_string(),
        };
        eprintln_clear(&message);
    }
}

/// Apply command-line overrides on top of the loaded configuration.
pub fn apply_talk_args(mut config: Config, args: &TalkArgs) -> Config {
    if let Some(endpoint) = &args.endpoint {
        config.service.endpoint = endpoint.clone();
    }
    if let Some(device) = &args.device {
        config.audio.device = Some(device.clone());
    }
    if let Some(device) = &args.output_device {
        config.audio.output_device = Some(device.clone());
    }
    if let Some(voice) = &args.voice {
        config.service.voice = voice.clone();
    }
    config
}

/// Run a live conversation until Ctrl+C or until the session ends.
///
/// # Errors
/// Returns an error if the configuration is invalid, the session cannot be
/// established, or it ends in the `error` state.
pub async fn run_talk(config: Config, args: TalkArgs, quiet: bool) -> Result<()> {
    suppress_audio_warnings();

    let config = apply_talk_args(config, &args);
    config.validate()?;

    let transport = SocketTransport::new(&config.service.endpoint)?;
    let backend: Arc<dyn AudioBackend> = match &args.input {
        Some(path) => {
            if !quiet {
                eprintln!("Reading microphone input from {}", path.display());
            }
            Arc::new(WavBackend::new(path.clone(), config.audio.output_device.clone()))
        }
        None => Arc::new(CpalBackend::new(
            config.audio.device.clone(),
            config.audio.output_device.clone(),
        )),
    };

    let line = Arc::new(StatusLine::new(!quiet));
    let (status_tx, mut status_rx) = mpsc::unbounded_channel::<SessionState>();
    let callbacks = {
        let on_volume = line.clone();
        let on_speaking = line.clone();
        SessionCallbacks::new()
            .on_status(move |state| {
                // Receiver gone means we are already shutting down.
                if status_tx.send(state).is_err() {
                    tracing::trace!("status {} after shutdown", state);
                }
            })
            .on_volume(move |volume| on_volume.volume(volume))
            .on_speaking(move |speaking| on_speaking.speaking(speaking))
    };

    let session = Arc::new(VoiceSession::new(
        backend,
        Arc::new(transport),
        SessionOptions::from_config(&config),
        callbacks,
    ));

    if !quiet {
        eprintln!(
            "Talking to {} as {} (Ctrl+C to hang up)",
            config.service.endpoint.bold(),
            config.service.voice
        );
    }

    let connecting = session.clone();
    tokio::task::spawn_blocking(move || connecting.connect())
        .await
        .map_err(|e| VoiceError::Other(format!("connect task failed: {}", e)))??;

    let mut last = session.state();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, hanging up");
                break;
            }
            state = status_rx.recv() => {
                let Some(state) = state else { break };
                line.status(state);
                last = state;
                if !state.is_active() {
                    break;
                }
            }
        }
    }

    let closing = session.clone();
    tokio::task::spawn_blocking(move || closing.disconnect())
        .await
        .map_err(|e| VoiceError::Other(format!("disconnect task failed: {}", e)))?;
    while let Ok(state) = status_rx.try_recv() {
        line.status(state);
    }

    if last == SessionState::Error {
        return Err(VoiceError::Other("voice session ended with an error".to_string()));
    }
    Ok(())
}
