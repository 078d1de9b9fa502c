//! Survey Call Simulator
//!
//! Runs the call orchestrator from a terminal. Commands are read from stdin, one per
//! line, and every status snapshot is printed as a JSON line on stdout.
//!
//! ```text
//! start <survey-id>   dial the respondent
//! listen | stop       open / close a listening window by hand
//! end                 hang up
//! status              print the current snapshot
//! surveys             list the catalog
//! quit                hang up and exit
//! ```

use anyhow::Context;
use std::sync::Arc;
use survey_voice::{
    create_best_generator, create_best_synthesizer, create_best_transcriber, AppConfig,
    AudioSink, CallOrchestrator, Capabilities, CommandSynthesizer, InMemoryCatalog, PlaybackError,
    Recorder, SpeechOutput,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before any env::var calls)
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[survey-sim] .env not loaded: {} (using system environment)", e);
    }

    // Logs go to stderr so stdout stays a clean JSON feed.
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = AppConfig::load().context("load survey-voice config")?;
    let catalog = InMemoryCatalog::load(&config.surveys_path)
        .with_context(|| format!("load surveys from {}", config.surveys_path.display()))?;
    if catalog.is_empty() {
        tracing::warn!(path = %config.surveys_path.display(), "survey catalog is empty");
    }
    let catalog = Arc::new(catalog);

    let speech = SpeechOutput::new(
        create_best_synthesizer(&config.backend),
        Arc::new(CommandSynthesizer::new(&config.backend.local_tts_command)),
        open_speaker,
    );
    let caps = Capabilities {
        recorder: microphone(),
        transcriber: create_best_transcriber(&config.backend),
        generator: create_best_generator(&config.backend),
        speech,
    };
    let orch = CallOrchestrator::new(config.call.clone(), catalog.clone(), caps);

    tracing::info!(
        surveys = catalog.len(),
        listen_window_ms = config.call.listen_window_ms,
        auto_listen = config.call.auto_listen,
        "survey simulator ready"
    );

    let mut feed = orch.subscribe();
    tokio::spawn(async move {
        loop {
            match feed.recv().await {
                Ok(snap) => match serde_json::to_string(&snap) {
                    Ok(line) => println!("{}", line),
                    Err(e) => tracing::warn!(error = %e, "snapshot not serializable"),
                },
                Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "status feed lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("read stdin")? else {
                    break;
                };
                if !run_command(&orch, &catalog, line.trim()).await {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("CTRL-C received; hanging up");
                break;
            }
        }
    }

    orch.shutdown().await;
    Ok(())
}

/// Execute one operator command. Returns false when the simulator should exit.
async fn run_command(orch: &CallOrchestrator, catalog: &InMemoryCatalog, line: &str) -> bool {
    let mut parts = line.split_whitespace();
    let Some(cmd) = parts.next() else {
        return true;
    };
    match cmd {
        "start" => match parts.next() {
            Some(id) => match orch.start_call(id).await {
                Ok(call_id) => tracing::info!(%call_id, survey = id, "call started"),
                Err(e) => tracing::warn!(error = %e, "start rejected"),
            },
            None => eprintln!("usage: start <survey-id>"),
        },
        "end" => orch.end_call().await,
        "listen" => {
            if let Err(e) = orch.manual_start_listening().await {
                tracing::warn!(error = %e, "listen rejected");
            }
        }
        "stop" => {
            if let Err(e) = orch.manual_stop_listening().await {
                tracing::warn!(error = %e, "stop rejected");
            }
        }
        "status" => match serde_json::to_string_pretty(&orch.snapshot().await) {
            Ok(s) => println!("{}", s),
            Err(e) => tracing::warn!(error = %e, "snapshot not serializable"),
        },
        "surveys" => {
            for s in catalog.list() {
                println!("{}\t{}\t{}", s.id, s.language, s.name);
            }
        }
        "quit" | "exit" => return false,
        other => eprintln!("unknown command: {} (start, listen, stop, end, status, surveys, quit)", other),
    }
    true
}

#[cfg(feature = "device")]
fn microphone() -> Arc<dyn Recorder> {
    Arc::new(survey_voice::CpalRecorder)
}

#[cfg(feature = "device")]
fn open_speaker() -> Result<Arc<dyn AudioSink>, PlaybackError> {
    Ok(Arc::new(survey_voice::RodioSink::open()?))
}

#[cfg(not(feature = "device"))]
fn microphone() -> Arc<dyn Recorder> {
    tracing::info!("built without the device feature: every listening window is silent");
    Arc::new(survey_voice::PlaceholderRecorder)
}

#[cfg(not(feature = "device"))]
fn open_speaker() -> Result<Arc<dyn AudioSink>, PlaybackError> {
    Ok(Arc::new(survey_voice::NullSink))
}
