//! Console front-end for cithia.

use cithia::audio::capture::CpalMicrophone;
use cithia::audio::playback::{AudioPlaybackController, CpalOutput};
use cithia::stt::ParakeetDecoder;
use cithia::tts::{CommandSynthesizer, Speaker};
use cithia::{AssistantConfig, Orchestrator, PresentationSurface, Role, UserAction};
use clap::{Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Cithia: voice-enabled chat and image generation assistant.
#[derive(Parser)]
#[command(name = "cithia", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long, env = "CITHIA_CONFIG")]
    config: Option<PathBuf>,

    /// Language model to use instead of the configured one.
    #[arg(short, long)]
    model: Option<String>,

    /// Do not speak responses aloud.
    #[arg(long)]
    no_speech: bool,

    /// Log to stderr instead of the log directory.
    #[arg(long)]
    log_stderr: bool,

    /// Subcommand to run.
    #[command(subcommand)]
    command: Option<Command>,
}

/// Available commands.
#[derive(Subcommand)]
enum Command {
    /// Start an interactive session (default).
    Chat,

    /// List available audio devices.
    Devices,
}

const HELP: &str = "\
Type a message and press Enter to chat.
  generate image: <prompt>   generate an image
  /voice                     speak your message
  /stop                      stop speaking
  /save <path>               save the last generated image
  /tts on|off                toggle spoken responses
  /help                      show this help
  /quit                      exit";

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_stderr)?;

    let mut config = match cli.config {
        Some(ref path) => AssistantConfig::from_file(path)?,
        None => {
            let path = AssistantConfig::default_config_path();
            if path.is_file() {
                AssistantConfig::from_file(&path)?
            } else {
                AssistantConfig::default()
            }
        }
    };
    if let Some(model) = cli.model {
        config.llm.model = model;
    }
    if cli.no_speech {
        config.tts.enabled = false;
    }

    match cli.command.unwrap_or(Command::Chat) {
        Command::Chat => run_chat(config),
        Command::Devices => list_devices(),
    }
}

/// Install the tracing subscriber. The returned guard flushes the file writer on drop.
fn init_tracing(to_stderr: bool) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    // Keep dependency logs quiet by default; RUST_LOG overrides.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("cithia=info,hf_hub=warn,ort=warn"));

    if to_stderr {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        return Ok(None);
    }

    let log_dir = AssistantConfig::log_dir();
    std::fs::create_dir_all(&log_dir)?;
    let appender = tracing_appender::rolling::daily(&log_dir, "cithia.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Ok(Some(guard))
}

fn run_chat(config: AssistantConfig) -> anyhow::Result<()> {
    println!("Cithia v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "starting session: model={}, backend={}",
        config.llm.model, config.llm.api_url
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("cithia-worker")
        .build()?;

    let playback = AudioPlaybackController::new(
        CpalOutput::new(&config.audio),
        Duration::from_millis(config.audio.watcher_poll_ms),
    );
    let speaker = Speaker::new(
        CommandSynthesizer::new(&config.tts),
        playback,
        runtime.handle().clone(),
        config.tts.enabled,
    );

    let controls = Arc::new(AtomicBool::new(true));
    let surface = ConsoleSurface::new(Arc::clone(&controls));
    let microphone = CpalMicrophone::new(&config.audio);
    let decoder = ParakeetDecoder::new(&config.stt, config.audio.input_sample_rate);
    let tick = config.ui.tick_interval();

    let mut orchestrator = Orchestrator::new(config, runtime.handle().clone(), surface, speaker)?
        .with_speech_capture(microphone, decoder);

    let (tx, rx) = crossbeam_channel::unbounded();
    std::thread::Builder::new()
        .name("cithia-stdin".into())
        .spawn(move || read_input(&tx, &controls))?;

    println!("{HELP}\n");
    orchestrator.run(&rx, tick);
    println!();
    info!("session ended");

    runtime.shutdown_timeout(Duration::from_secs(1));
    Ok(())
}

/// What one line of console input means.
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Action(UserAction),
    Help,
    Quit,
    Invalid(&'static str),
}

fn parse_input(line: &str) -> Option<Input> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Some(Input::Action(UserAction::SubmitText(line.to_owned())));
    };

    let (name, arg) = match command.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (command, ""),
    };
    let input = match name {
        "voice" => Input::Action(UserAction::RequestVoiceInput),
        "stop" => Input::Action(UserAction::RequestStopPlayback),
        "save" if arg.is_empty() => Input::Invalid("usage: /save <path>"),
        "save" => Input::Action(UserAction::RequestSaveLastImage {
            destination: PathBuf::from(arg),
        }),
        "tts" => match arg {
            "on" => Input::Action(UserAction::SetSpeechOutput(true)),
            "off" => Input::Action(UserAction::SetSpeechOutput(false)),
            _ => Input::Invalid("usage: /tts on|off"),
        },
        "help" => Input::Help,
        "quit" | "exit" => Input::Quit,
        _ => Input::Invalid("unknown command, try /help"),
    };
    Some(input)
}

/// Forward stdin lines as actions until EOF or `/quit`.
fn read_input(tx: &crossbeam_channel::Sender<UserAction>, controls: &AtomicBool) {
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else {
            break;
        };
        let action = match parse_input(&line) {
            None => continue,
            Some(Input::Action(action)) => action,
            Some(Input::Help) => {
                println!("{HELP}");
                continue;
            }
            Some(Input::Quit) => break,
            Some(Input::Invalid(usage)) => {
                println!("{usage}");
                continue;
            }
        };

        let allowed = controls.load(Ordering::Relaxed)
            || matches!(action, UserAction::RequestStopPlayback);
        if !allowed {
            println!("(input is paused while the image is generated)");
            continue;
        }
        if tx.send(action).is_err() {
            break;
        }
    }
}

/// Line-oriented surface: streamed replies are extended in place.
struct ConsoleSurface {
    controls: Arc<AtomicBool>,
    /// Role and text of a message still being written on the current line.
    open: Option<(Role, String)>,
}

impl ConsoleSurface {
    fn new(controls: Arc<AtomicBool>) -> Self {
        Self {
            controls,
            open: None,
        }
    }

    fn close_line(&mut self) {
        if self.open.take().is_some() {
            println!();
        }
    }
}

impl PresentationSurface for ConsoleSurface {
    fn append_message(&mut self, role: Role, text: &str) {
        self.close_line();
        print!("{role}: {text}");
        let _ = std::io::stdout().flush();
        self.open = Some((role, text.to_owned()));
    }

    fn replace_last_message(&mut self, text: &str) {
        let mut stdout = std::io::stdout();
        let Some((role, shown)) = self.open.as_mut() else {
            let _ = write!(stdout, "{text}");
            let _ = stdout.flush();
            self.open = Some((Role::Bot, text.to_owned()));
            return;
        };

        if let Some(suffix) = text.strip_prefix(shown.as_str()) {
            let _ = write!(stdout, "{suffix}");
        } else {
            let _ = write!(stdout, "\n{role}: {text}");
        }
        *shown = text.to_owned();
        let _ = stdout.flush();
    }

    fn show_image(&mut self, path: &Path) {
        self.close_line();
        println!("[image] {}", path.display());
    }

    fn set_controls_enabled(&mut self, enabled: bool) {
        self.controls.store(enabled, Ordering::Relaxed);
    }
}

fn list_devices() -> anyhow::Result<()> {
    println!("Input devices:");
    for name in CpalMicrophone::list_input_devices()? {
        println!("  - {name}");
    }

    println!("\nOutput devices:");
    for name in CpalOutput::list_output_devices()? {
        println!("  - {name}");
    }

    Ok(())
}
