//! voicesat daemon entry point.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info, warn};

use voicesat_core::{TracingConfig, init_tracing};
use voicesat_daemon::{CaptureProcess, Cli, CommandPlayer, DaemonConfig, DaemonResult};
use voicesat_server::{DeviceIdentity, Players, Satellite, SignalHandler, TcpServer, audio_channel};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let tracing_config = if cli.debug {
        TracingConfig::cli_debug()
    } else if cli.json_logs {
        TracingConfig::daemon()
    } else {
        TracingConfig::default()
    };
    if let Err(e) = init_tracing(tracing_config) {
        eprintln!("error: {}", e);
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "voicesat failed");
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> DaemonResult<()> {
    let mut config = match cli.config {
        Some(ref path) => DaemonConfig::load_from(path)?,
        None => DaemonConfig::load()?,
    };
    config.apply_cli(&cli);

    let server_config = config.server_config()?;
    let entities = config.entity_registry()?;
    let duck_volume = f32::from(config.audio.duck_volume) / 100.0;
    let players = Players::new(
        Box::new(CommandPlayer::new("music", &config.audio.player_command)?.with_duck_volume(duck_volume)),
        Box::new(CommandPlayer::new("announcer", config.announcer_command())?),
    );

    let mut satellite = Satellite::new(server_config.clone(), entities, players);
    let capture = match config.audio.capture_command {
        Some(ref command) => {
            let (producer, consumer) = audio_channel(server_config.audio_queue_capacity);
            satellite = satellite.with_audio(consumer);
            Some(CaptureProcess::start(command, producer)?)
        }
        None => {
            info!("No capture command configured, waiting for SIGUSR1 wake signals");
            None
        }
    };

    let handle = satellite.handle();
    let event_loop = tokio::spawn(satellite.run());

    let mut signals = SignalHandler::new();
    signals.spawn_listener()?;
    if let Some(mut wakes) = signals.take_wake_requests() {
        let handle = handle.clone();
        tokio::spawn(async move {
            while wakes.recv().await.is_some() {
                if handle.wake(None).await.is_err() {
                    break;
                }
            }
        });
    }

    let identity = DeviceIdentity::from_config(&server_config);
    let served = match TcpServer::bind(server_config, identity).await {
        Ok(server) => server
            .run_until_shutdown(handle.clone(), signals.shutdown_handle())
            .await,
        Err(e) => Err(e),
    };

    handle.shutdown().await;
    if let Err(e) = event_loop.await {
        warn!(error = %e, "Event loop task failed");
    }
    if let Some(capture) = capture
        && let Err(e) = tokio::task::spawn_blocking(move || capture.stop()).await
    {
        warn!(error = %e, "Capture shutdown failed");
    }

    served?;
    info!("voicesat stopped");
    Ok(())
}
