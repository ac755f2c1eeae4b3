//! CLI binary for parley.

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use parley::audio::capture::{CpalCapture, Framer, resample};
use parley::audio::playback::CpalOutput;
use parley::engine::InitializedEngines;
use parley::engine::scripted::{
    MemoryOutput, ScriptedGenerator, ScriptedSynthesizer, ScriptedTranscriber, ScriptedWakeWord,
};
use parley::wakeword::{save_reference, trim_silence};
use parley::{AssistantConfig, FrameRouter, PipelineCoordinator, RuntimeEvent};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Frames buffered between the capture callback and the router thread.
const FRAME_CHANNEL_SIZE: usize = 256;

/// Wake word references are always 16kHz mono.
const REFERENCE_RATE: u32 = 16_000;

/// RMS below which a 10ms window counts as silence when trimming.
const SILENCE_THRESHOLD: f32 = 0.005;

/// Parley: an interruptible, streaming voice assistant.
#[derive(Parser)]
#[command(name = "parley", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Also write logs to a daily rolling file in this directory.
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    command: Option<Command>,
}

/// Available commands.
#[derive(Subcommand)]
enum Command {
    /// Talk to the assistant through the microphone.
    Chat,

    /// Feed a WAV recording through the pipeline instead of the microphone.
    Replay {
        /// Recording to route, frame by frame.
        wav: PathBuf,
    },

    /// List available audio devices.
    Devices,

    /// Record wake word reference samples from the microphone.
    RecordWakeword {
        /// Number of samples to record.
        #[arg(long, default_value_t = 5)]
        count: usize,

        /// Length of each recording in seconds.
        #[arg(long, default_value_t = 2.0)]
        seconds: f32,
    },

    /// Write the default configuration file.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },

    /// Run one scripted exchange without models or sound hardware.
    Demo,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_dir.as_deref())?;

    match cli.command.unwrap_or(Command::Chat) {
        Command::Chat => run_chat(load_config(cli.config.as_deref())?).await,
        Command::Replay { wav } => run_replay(load_config(cli.config.as_deref())?, &wav).await,
        Command::Devices => list_devices(),
        Command::RecordWakeword { count, seconds } => {
            record_wakeword(load_config(cli.config.as_deref())?, count, seconds).await
        }
        Command::InitConfig { force } => init_config(cli.config, force),
        Command::Demo => run_demo().await,
    }
}

/// Console logging filtered by `RUST_LOG`, plus an optional log file.
fn init_tracing(
    log_dir: Option<&Path>,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("parley=info"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("cannot create log dir {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "parley.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    Ok(guard)
}

fn load_config(path: Option<&Path>) -> anyhow::Result<AssistantConfig> {
    match path {
        Some(path) => AssistantConfig::from_file(path)
            .with_context(|| format!("cannot load config {}", path.display())),
        None => {
            let default = AssistantConfig::default_config_path();
            if default.exists() {
                AssistantConfig::from_file(&default)
                    .with_context(|| format!("cannot load config {}", default.display()))
            } else {
                Ok(AssistantConfig::default())
            }
        }
    }
}

async fn run_chat(config: AssistantConfig) -> anyhow::Result<()> {
    println!("Parley v{}", env!("CARGO_PKG_VERSION"));

    let capture = CpalCapture::new(&config.audio)?;
    let (events_tx, events_rx) = broadcast::channel(256);
    let mut coordinator = PipelineCoordinator::new(config).with_runtime_events(events_tx);
    let router = coordinator.load(parley::initialize_engines)?;

    let cancel = CancellationToken::new();
    let printer = tokio::spawn(print_events(events_rx, cancel.clone()));

    let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_SIZE);
    let router_thread = spawn_router(router, frame_rx);
    let capture_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { capture.run(frame_tx, cancel).await })
    };

    println!("\nSay the wake word to talk. Say it again to interrupt. Press Ctrl+C to quit.\n");
    tokio::signal::ctrl_c().await?;
    info!("received Ctrl+C, shutting down...");

    cancel.cancel();
    if let Err(e) = capture_task.await? {
        warn!("capture ended with error: {e}");
    }
    coordinator.shutdown().await;
    join_router(router_thread).await?;
    printer.await?;
    Ok(())
}

async fn run_replay(config: AssistantConfig, wav: &Path) -> anyhow::Result<()> {
    let frames = read_frames(wav, config.audio.sample_rate, config.audio.frame_length)?;
    let frame_secs = config.audio.frame_length as f64 / f64::from(config.audio.sample_rate);
    info!("replaying {} frames from {}", frames.len(), wav.display());

    let (events_tx, events_rx) = broadcast::channel(256);
    let mut coordinator = PipelineCoordinator::new(config).with_runtime_events(events_tx);
    let router = coordinator.load(parley::initialize_engines)?;
    let cancel = CancellationToken::new();
    let printer = tokio::spawn(print_events(events_rx, cancel.clone()));

    let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_SIZE);
    let router_thread = spawn_router(router, frame_rx);
    for frame in frames {
        if frame_tx.send(frame).await.is_err() {
            break;
        }
        tokio::time::sleep(Duration::from_secs_f64(frame_secs)).await;
    }
    drop(frame_tx);
    join_router(router_thread).await?;

    coordinator.wait_for_runs().await;
    coordinator.shutdown().await;
    cancel.cancel();
    printer.await?;
    Ok(())
}

/// Decode a WAV file into mono frames at the routing rate.
fn read_frames(path: &Path, sample_rate: u32, frame_length: usize) -> anyhow::Result<Vec<Vec<i16>>> {
    let mut reader =
        hound::WavReader::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    let spec = reader.spec();
    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()?
        }
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
    };
    let channels = usize::from(spec.channels.max(1));
    let mono: Vec<f32> = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();

    let mut framer = Framer::new(frame_length);
    Ok(framer.push(&resample(&mono, spec.sample_rate, sample_rate)))
}

/// Drive the router from a dedicated thread so routing never waits on the
/// async runtime.
fn spawn_router(
    mut router: FrameRouter,
    mut frames: mpsc::Receiver<Vec<i16>>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        while let Some(frame) = frames.blocking_recv() {
            router.route(&frame);
        }
    })
}

async fn join_router(handle: std::thread::JoinHandle<()>) -> anyhow::Result<()> {
    tokio::task::spawn_blocking(move || handle.join())
        .await?
        .map_err(|_| anyhow::anyhow!("router thread panicked"))
}

async fn print_events(mut rx: broadcast::Receiver<RuntimeEvent>, cancel: CancellationToken) {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = rx.recv() => event,
        };
        match event {
            Ok(RuntimeEvent::StateChanged { to, .. }) => println!("[{to}]"),
            Ok(RuntimeEvent::FinalTranscript(text)) => println!("You: {text}"),
            Ok(RuntimeEvent::Completion { text, reason }) => {
                println!("Assistant: {text} ({reason})");
            }
            Ok(RuntimeEvent::Error { stage, message }) => eprintln!("{stage} error: {message}"),
            Ok(RuntimeEvent::Profile(report)) => println!(
                "  {:.1} tok/s, rtf {:.2}, first audio {:.2}s",
                report.tokens_per_sec, report.real_time_factor, report.first_audio_delay_secs
            ),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => warn!("event printer lagged by {n}"),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn list_devices() -> anyhow::Result<()> {
    println!("Input devices:");
    for name in CpalCapture::list_input_devices()? {
        println!("  - {name}");
    }

    println!("\nOutput devices:");
    for name in CpalOutput::list_output_devices()? {
        println!("  - {name}");
    }

    Ok(())
}

async fn record_wakeword(
    config: AssistantConfig,
    count: usize,
    seconds: f32,
) -> anyhow::Result<()> {
    if config.audio.sample_rate != REFERENCE_RATE {
        bail!("wake word references are recorded at {REFERENCE_RATE}Hz; set audio.sample_rate");
    }
    let dir = config.wakeword.references_dir.clone();
    let capture = CpalCapture::new(&config.audio)?;
    println!("Recording {count} samples of {seconds:.1}s into {}", dir.display());

    for i in 1..=count {
        println!("Sample {i}/{count}: press Enter, then say the wake word.");
        wait_for_enter().await?;
        let clip = record_clip(&capture, seconds).await?;
        let trimmed = trim_silence(&clip, SILENCE_THRESHOLD);
        if trimmed.len() < REFERENCE_RATE as usize / 10 {
            warn!("sample {i} is very short or silent, saving anyway");
        }
        let path = dir.join(format!("reference_{i}.wav"));
        save_reference(&path, trimmed)?;
        println!(
            "  saved {} ({:.1}s)",
            path.display(),
            trimmed.len() as f32 / REFERENCE_RATE as f32
        );
    }
    Ok(())
}

/// Capture `seconds` of microphone audio at the routing rate.
async fn record_clip(capture: &CpalCapture, seconds: f32) -> anyhow::Result<Vec<i16>> {
    let (tx, mut rx) = mpsc::channel(FRAME_CHANNEL_SIZE);
    let cancel = CancellationToken::new();
    let stop = async {
        tokio::time::sleep(Duration::from_secs_f32(seconds.max(0.1))).await;
        cancel.cancel();
    };
    let collect = async {
        let mut clip = Vec::new();
        while let Some(frame) = rx.recv().await {
            clip.extend(frame);
        }
        clip
    };
    let (captured, (), clip) = tokio::join!(capture.run(tx, cancel.clone()), stop, collect);
    captured?;
    Ok(clip)
}

async fn wait_for_enter() -> anyhow::Result<()> {
    tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin().read_line(&mut line).map(|_| ())
    })
    .await??;
    Ok(())
}

fn init_config(path: Option<PathBuf>, force: bool) -> anyhow::Result<()> {
    let path = path.unwrap_or_else(AssistantConfig::default_config_path);
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    AssistantConfig::default().save_to_file(&path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

async fn run_demo() -> anyhow::Result<()> {
    let mut config = AssistantConfig::default();
    config.pipeline.profile = true;
    let output = MemoryOutput::new().with_write_delay(Duration::from_millis(20));

    let (events_tx, events_rx) = broadcast::channel(256);
    let mut coordinator = PipelineCoordinator::new(config).with_runtime_events(events_tx);
    let mut router = coordinator.load(|_| {
        Ok(InitializedEngines {
            wake_word: Box::new(ScriptedWakeWord::new([0])),
            transcriber: Box::new(
                ScriptedTranscriber::new()
                    .partial("What's")
                    .partial(" the")
                    .endpoint(" weather"),
            ),
            generator: Box::new(
                ScriptedGenerator::new(["It's", " sunny", " today.", "</s>"])
                    .with_fragment_delay(Duration::from_millis(50)),
            ),
            synthesizer: Arc::new(ScriptedSynthesizer::new(16_000, 800)),
            output: Arc::new(output.clone()),
        })
    })?;
    let cancel = CancellationToken::new();
    let printer = tokio::spawn(print_events(events_rx, cancel.clone()));

    for _ in 0..4 {
        router.route(&[0; 512]);
    }
    coordinator.wait_for_runs().await;
    println!("played {} samples", output.samples().len());

    coordinator.shutdown().await;
    cancel.cancel();
    printer.await?;
    Ok(())
}
