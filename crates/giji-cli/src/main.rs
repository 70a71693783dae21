mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::{Config, ConfigError, ConfigPaths};
use giji_core::bus::{BusTryRecvError, EventReceiver};
use giji_core::capture::AudioSource;
use giji_core::capture::wav::WavFileSource;
use giji_core::error::{RecognizerError, SessionError, StoreError};
use giji_core::process::segment::VadMethodChoice;
use giji_core::process::vad::{NeuralVad, SileroVad};
use giji_core::session::{Engine, FullTranscriptionParams};
use giji_core::store::meta::{self, SessionLayout};
use giji_core::transcribe::whisper::WhisperRecognizer;
use giji_core::types::{
    CaptureMode, ChunkStatus, EngineEvent, SessionRecord, SessionStatus, StreamTag,
};

#[derive(Parser)]
#[command(name = "giji", version, about = "meeting capture engine")]
struct Cli {
    /// Override the sessions directory (default: ~/.giji/sessions)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the config directory and a default config file
    Init,
    /// Record a session from two WAV files (one per stream)
    Record(RecordArgs),
    /// List sessions
    Sessions,
    /// Print a session's transcript
    Show {
        id: String,
    },
    /// Re-run transcription for one chunk or the whole session
    Retranscribe(RetranscribeArgs),
    /// Delete a session's data directory
    Delete {
        id: String,
        /// Skip confirmation
        #[arg(long)]
        yes: bool,
    },
    /// Print the effective configuration
    Config,
}

#[derive(Parser, Debug)]
struct RecordArgs {
    /// WAV file standing in for the microphone stream
    #[arg(long)]
    mic: PathBuf,

    /// WAV file standing in for the system-audio stream
    #[arg(long)]
    sys: PathBuf,

    /// Path to a GGML whisper model (overrides config)
    #[arg(long)]
    model: Option<String>,

    /// Transcribe mic and sys separately instead of their mix
    #[arg(long)]
    stereo: bool,
}

#[derive(Parser, Debug)]
struct RetranscribeArgs {
    id: String,

    /// Chunk index to retranscribe
    #[arg(long, conflicts_with = "full")]
    chunk: Option<u64>,

    /// Retranscribe the whole recording
    #[arg(long)]
    full: bool,

    /// Path to a GGML whisper model (overrides config)
    #[arg(long)]
    model: Option<String>,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Recognizer(#[from] RecognizerError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Usage(String),
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let (config, sessions_dir) = load_config(&cli)?;
    match cli.command {
        Command::Init => run_init(),
        Command::Record(args) => run_record(config, sessions_dir, args),
        Command::Sessions => run_sessions(sessions_dir),
        Command::Show { id } => run_show(sessions_dir, &id),
        Command::Retranscribe(args) => run_retranscribe(config, sessions_dir, args),
        Command::Delete { id, yes } => run_delete(sessions_dir, &id, yes),
        Command::Config => {
            print!("{}", toml::to_string_pretty(&config).map_err(ConfigError::Serialize)?);
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> Result<(Config, PathBuf), CliError> {
    match ConfigPaths::from_home() {
        Ok(paths) => {
            let config = Config::load_or_create(&paths)?;
            let sessions_dir = cli
                .data_dir
                .clone()
                .unwrap_or_else(|| paths.sessions_dir.clone());
            Ok((config, sessions_dir))
        }
        Err(ConfigError::HomeMissing) => {
            let sessions_dir = cli.data_dir.clone().ok_or_else(|| {
                CliError::Usage("no HOME and no --data-dir given".to_string())
            })?;
            Ok((Config::default(), sessions_dir))
        }
        Err(e) => Err(e.into()),
    }
}

fn run_init() -> Result<(), CliError> {
    let paths = ConfigPaths::from_home()?;
    Config::load_or_create(&paths)?;
    println!("config:   {}", paths.config_path.display());
    println!("models:   {}", paths.models_dir.display());
    println!("sessions: {}", paths.sessions_dir.display());
    println!();
    println!("Set [recognizer].model to a GGML whisper model path before recording.");
    Ok(())
}

fn build_engine(
    config: &Config,
    sessions_dir: &std::path::Path,
    model_override: Option<&str>,
) -> Result<Engine, CliError> {
    let model = model_override
        .map(str::to_string)
        .or_else(|| {
            let configured = config.recognizer.model.trim();
            (!configured.is_empty()).then(|| configured.to_string())
        })
        .ok_or_else(|| {
            CliError::Usage(
                "no model configured: pass --model or set [recognizer].model".to_string(),
            )
        })?;

    info!("loading model {model}");
    let recognizer = WhisperRecognizer::new(&model)?;
    let watchdog = (config.recognizer.watchdog_ms > 0)
        .then(|| Duration::from_millis(config.recognizer.watchdog_ms));

    let engine = Engine::new(sessions_dir, Box::new(recognizer), watchdog)?;
    engine.publish_model_progress(&model, 1.0);
    Ok(engine)
}

/// Print every engine event as one JSON line on stdout until the bus closes.
fn spawn_event_printer(rx: EventReceiver) -> thread::JoinHandle<()> {
    thread::spawn(move || loop {
        match rx.recv() {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!("event serialization failed: {e}"),
            },
            Err(giji_core::bus::BusRecvError::Lagged(missed)) => {
                warn!("event stream lagged, {missed} events dropped");
            }
            Err(giji_core::bus::BusRecvError::Closed) => break,
        }
    })
}

fn run_record(
    config: Config,
    sessions_dir: PathBuf,
    args: RecordArgs,
) -> Result<(), CliError> {
    config.validate()?;
    let mut session_config = config.session_config()?;
    if args.stereo {
        session_config.mode = CaptureMode::VoiceIsolation;
    }

    let mic = WavFileSource::open(&args.mic, StreamTag::Mic)?;
    let sys = WavFileSource::open(&args.sys, StreamTag::Sys)?;
    info!(
        mic_ms = mic.duration_ms(),
        sys_ms = sys.duration_ms(),
        "feeding session from files"
    );

    let engine = build_engine(&config, &sessions_dir, args.model.as_deref())?;
    let printer = spawn_event_printer(engine.subscribe());

    let neural_vads = build_neural_vads(&session_config);
    let record = engine.start_session(
        session_config,
        vec![
            Box::new(mic) as Box<dyn AudioSource>,
            Box::new(sys) as Box<dyn AudioSource>,
        ],
        neural_vads,
    )?;
    info!(session = %record.id, "recording");

    let interrupted = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&interrupted))
        .map_err(CliError::Io)?;

    // File sources feed at full speed and then end; once the mixed-sample
    // counter goes quiet the pipeline has consumed everything. Ctrl-C ends
    // the session early either way.
    let stats = engine.active_stats().unwrap_or_default();
    let mut last_mixed = (stats.samples_mixed(), Instant::now());
    while !interrupted.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(200));
        let mixed = stats.samples_mixed();
        if mixed != last_mixed.0 {
            last_mixed = (mixed, Instant::now());
        } else if last_mixed.1.elapsed() > Duration::from_millis(700) {
            break;
        }
    }

    let stopped = engine.stop_session()?;
    drop(engine);
    let _ = printer.join();

    print_summary(&stopped);
    Ok(())
}

fn build_neural_vads(
    session_config: &giji_core::session::SessionConfig,
) -> Vec<Box<dyn NeuralVad>> {
    if !matches!(
        session_config.segmenter.method,
        VadMethodChoice::Auto | VadMethodChoice::Neural
    ) {
        return Vec::new();
    }
    let channels = if session_config.mode.is_stereo() { 2 } else { 1 };
    let mut vads: Vec<Box<dyn NeuralVad>> = Vec::with_capacity(channels);
    for _ in 0..channels {
        match SileroVad::new(session_config.segmenter.frame_ms) {
            Ok(vad) => vads.push(Box::new(vad)),
            Err(e) => {
                warn!("neural vad unavailable ({e}); the segmenter will use energy");
                return Vec::new();
            }
        }
    }
    vads
}

fn run_sessions(sessions_dir: PathBuf) -> Result<(), CliError> {
    let sessions = meta::list_sessions(&sessions_dir)?;
    if sessions.is_empty() {
        println!("no sessions in {}", sessions_dir.display());
        return Ok(());
    }
    for session in sessions {
        println!(
            "{}  {}  {:<7}  {:>9}  {} chunks",
            session.id,
            session.start_time,
            status_label(session.status),
            format_timestamp(session.total_duration),
            session.chunks.len(),
        );
    }
    Ok(())
}

fn status_label(status: SessionStatus) -> &'static str {
    match status {
        SessionStatus::Active => "active",
        SessionStatus::Stopped => "stopped",
        SessionStatus::Failed => "failed",
    }
}

fn run_show(sessions_dir: PathBuf, id: &str) -> Result<(), CliError> {
    let layout = SessionLayout::new(&sessions_dir, id);
    if !layout.exists() {
        return Err(SessionError::NotFound(id.to_string()).into());
    }
    let session = meta::load_meta(&layout)?;

    println!(
        "session {} ({}, {}, {} chunks)",
        session.id,
        status_label(session.status),
        format_timestamp(session.total_duration),
        session.chunks.len()
    );
    for chunk in &session.chunks {
        let range = format!(
            "[{}-{}]",
            format_timestamp(chunk.start_ms),
            format_timestamp(chunk.end_ms)
        );
        match chunk.status {
            ChunkStatus::Completed => {
                if let Some(dialogue) = &chunk.dialogue {
                    for segment in dialogue {
                        println!(
                            "[{}-{}] {}: {}",
                            format_timestamp(segment.start_ms),
                            format_timestamp(segment.end_ms),
                            segment.speaker,
                            segment.text.trim()
                        );
                    }
                } else if let Some(text) = &chunk.transcription {
                    println!("{range} {}", text.trim());
                }
            }
            ChunkStatus::Failed => {
                println!(
                    "{range} <failed: {}>",
                    chunk.error.as_deref().unwrap_or("unknown")
                );
            }
            ChunkStatus::Pending | ChunkStatus::Transcribing => {
                println!("{range} <not transcribed>");
            }
        }
    }
    Ok(())
}

fn run_retranscribe(
    config: Config,
    sessions_dir: PathBuf,
    args: RetranscribeArgs,
) -> Result<(), CliError> {
    if !args.full && args.chunk.is_none() {
        return Err(CliError::Usage(
            "pass --chunk <index> or --full".to_string(),
        ));
    }

    let engine = build_engine(&config, &sessions_dir, args.model.as_deref())?;
    let rx = engine.subscribe();
    let printer = spawn_event_printer(engine.subscribe());

    if args.full {
        engine.retranscribe_full(&args.id, FullTranscriptionParams::default())?;
        wait_for_event(&rx, Duration::from_secs(3600), |event| {
            matches!(
                event,
                EngineEvent::FullTranscriptionCompleted { .. }
                    | EngineEvent::FullTranscriptionCancelled { .. }
                    | EngineEvent::FullTranscriptionError { .. }
            )
        })?;
    } else {
        let index = args.chunk.unwrap_or_default();
        let session = engine.get_session(&args.id)?;
        let chunk = session
            .chunks
            .iter()
            .find(|c| c.index == index)
            .ok_or_else(|| SessionError::ChunkNotFound(format!("index {index}")))?;
        let chunk_id = chunk.id.clone();
        engine.retranscribe_chunk(&args.id, &chunk_id)?;
        wait_for_event(&rx, Duration::from_secs(600), |event| {
            matches!(
                event,
                EngineEvent::ChunkTranscribed { chunk_id: id, status, .. }
                    if *id == chunk_id && status.is_terminal()
            )
        })?;
    }

    drop(engine);
    let _ = printer.join();
    Ok(())
}

fn wait_for_event(
    rx: &EventReceiver,
    timeout: Duration,
    pred: impl Fn(&EngineEvent) -> bool,
) -> Result<EngineEvent, CliError> {
    let deadline = Instant::now() + timeout;
    loop {
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(event) => {
                if pred(&event) {
                    return Ok(event);
                }
            }
            Err(BusTryRecvError::Empty) => {
                if Instant::now() >= deadline {
                    return Err(CliError::Usage("timed out waiting for result".to_string()));
                }
            }
            Err(BusTryRecvError::Lagged(_)) => {}
            Err(BusTryRecvError::Closed) => {
                return Err(CliError::Usage("engine shut down".to_string()));
            }
        }
    }
}

fn run_delete(sessions_dir: PathBuf, id: &str, yes: bool) -> Result<(), CliError> {
    let layout = SessionLayout::new(&sessions_dir, id);
    if !layout.exists() {
        return Err(SessionError::NotFound(id.to_string()).into());
    }
    if !yes {
        return Err(CliError::Usage(format!(
            "this removes {} permanently; re-run with --yes",
            layout.root().display()
        )));
    }
    let session = meta::load_meta(&layout)?;
    if session.status == SessionStatus::Active {
        warn!("session {id} is marked active; deleting anyway (stale crash state)");
    }
    layout.remove()?;
    println!("deleted {id}");
    Ok(())
}

fn print_summary(session: &SessionRecord) {
    println!();
    println!(
        "session {} ({}, {} chunks)",
        session.id,
        format_timestamp(session.total_duration),
        session.chunks.len()
    );
    for chunk in &session.chunks {
        let preview = chunk
            .transcription
            .as_deref()
            .or(chunk.dialogue.as_ref().and_then(|d| {
                d.first().map(|s| s.text.as_str())
            }))
            .unwrap_or_default();
        let preview: String = preview.chars().take(60).collect();
        println!(
            "  #{:03} [{}-{}] {:<9} {}",
            chunk.index,
            format_timestamp(chunk.start_ms),
            format_timestamp(chunk.end_ms),
            format!("{:?}", chunk.status).to_lowercase(),
            preview
        );
    }
}

fn format_timestamp(ms: u64) -> String {
    let total_seconds = ms / 1000;
    let minutes = total_seconds / 60;
    let seconds = total_seconds % 60;
    format!("{minutes:02}:{seconds:02}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_format_as_minutes_seconds() {
        assert_eq!(format_timestamp(0), "00:00");
        assert_eq!(format_timestamp(65_000), "01:05");
        assert_eq!(format_timestamp(3_600_000), "60:00");
    }

    #[test]
    fn cli_parses_record_command() {
        let cli = Cli::try_parse_from([
            "giji", "record", "--mic", "mic.wav", "--sys", "sys.wav", "--stereo",
        ])
        .unwrap();
        match cli.command {
            Command::Record(args) => {
                assert_eq!(args.mic, PathBuf::from("mic.wav"));
                assert!(args.stereo);
                assert!(args.model.is_none());
            }
            _ => panic!("expected record"),
        }
    }

    #[test]
    fn retranscribe_requires_a_scope() {
        let cli = Cli::try_parse_from(["giji", "retranscribe", "abc"]).unwrap();
        match cli.command {
            Command::Retranscribe(args) => {
                assert!(!args.full);
                assert!(args.chunk.is_none());
            }
            _ => panic!("expected retranscribe"),
        }
        // --chunk and --full conflict.
        assert!(
            Cli::try_parse_from(["giji", "retranscribe", "abc", "--chunk", "1", "--full"]).is_err()
        );
    }
}
