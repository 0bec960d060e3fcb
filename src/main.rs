use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use voxroom::Config;
use voxroom::config::Transport;
use voxroom::auth::{AlwaysAuthenticated, AuthCheck, SessionSigner};
use voxroom::voice::playback::AudioSink;
use voxroom::voice::provider::gateway::GatewayClient;
use voxroom::voice::provider::{RecordedAudio, llm, stt, tts};
use voxroom::voice::recognizer::{ConsoleListening, ConsoleRecognizer};
use voxroom::voice::sink::{CommandSink, DirectorySink};
use voxroom::voice::{
    Capabilities, ConversationTurn, SessionEvent, SessionHandle, SessionParts, build_session,
};

#[derive(Parser, Debug)]
#[command(name = "voxroom", version, about = "Bilingual voice conversation gateway")]
struct Cli {
    /// Config file (default: ~/.voxroom/config.toml)
    #[arg(short, long, global = true, env = "VOXROOM_CONFIG")]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP/WebSocket gateway
    Serve {
        /// Override server.bind
        #[arg(long)]
        bind: Option<String>,
    },
    /// Talk to the assistant from the terminal
    Chat(ChatArgs),
    /// Issue a session token
    Token {
        #[arg(long)]
        user: String,
    },
    /// Inspect or create the config file
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Args, Debug)]
struct ChatArgs {
    /// Use a running gateway instead of calling providers directly
    #[arg(long, requires = "token")]
    remote: Option<String>,

    /// Session token for --remote
    #[arg(long, env = "VOXROOM_TOKEN")]
    token: Option<String>,

    /// Save reply audio here instead of playing it
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Write a default config file
    Init {
        #[arg(long)]
        force: bool,
    },
    /// Print the effective config with secrets redacted
    Show,
    /// Print the config file path
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    match cli.command {
        Command::Config(cmd) => config_command(cmd, cli.config.as_deref()),
        Command::Token { user } => {
            let config = load_config(cli.config.as_deref())?;
            issue_token(&config, &user)
        }
        Command::Serve { bind } => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            voxroom::server::run(config).await
        }
        Command::Chat(args) => {
            let config = load_config(cli.config.as_deref())?;
            chat(config, args).await
        }
    }
}

fn init_logging(verbose: bool, json: bool) {
    let default = if verbose { "voxroom=debug" } else { "voxroom=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    Config::load(path).context("failed to load config")
}

fn config_path(path: Option<&Path>) -> Result<PathBuf> {
    path.map(Path::to_path_buf)
        .or_else(Config::default_path)
        .context("cannot resolve a home directory; pass --config")
}

fn config_command(cmd: ConfigCommand, path: Option<&Path>) -> Result<()> {
    match cmd {
        ConfigCommand::Path => {
            println!("{}", config_path(path)?.display());
        }
        ConfigCommand::Show => {
            let config = load_config(path)?;
            print!("{}", toml::to_string_pretty(&config.redacted())?);
        }
        ConfigCommand::Init { force } => {
            let path = config_path(path)?;
            if path.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", path.display());
            }
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("failed to create {}", dir.display()))?;
            }
            std::fs::write(&path, Config::default_file_contents()?)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("Wrote {}", path.display());
        }
    }
    Ok(())
}

fn issue_token(config: &Config, user: &str) -> Result<()> {
    let Some(secret) = config.auth.secret.as_deref() else {
        bail!("auth.secret is not set (or VOXROOM_AUTH_SECRET)");
    };
    let ttl = i64::try_from(config.token_ttl().as_secs()).context("token ttl too large")?;
    let expires = chrono::Utc::now().timestamp() + ttl;
    let token = SessionSigner::new(secret).issue(user, expires)?;
    println!("{token}");
    Ok(())
}

// ── Console chat ─────────────────────────────────────────────────

fn choose_sink(config: &Config, out: Option<PathBuf>) -> Result<Arc<dyn AudioSink>> {
    if let Some(dir) = out {
        return Ok(Arc::new(DirectorySink::new(dir)));
    }
    if !config.playback.player.is_empty() {
        return Ok(Arc::new(CommandSink::new(&config.playback.player)?));
    }
    let dir = match &config.playback.output_dir {
        Some(dir) => PathBuf::from(dir),
        None => config_path(None)?.with_file_name("audio"),
    };
    Ok(Arc::new(DirectorySink::new(dir)))
}

fn session_parts(config: &Config, args: &ChatArgs) -> Result<SessionParts> {
    let sink = choose_sink(config, args.out.clone())?;
    let local_voice = tts::create_local_synthesizer(config);

    if let Some(url) = &args.remote {
        let token = args.token.clone().unwrap_or_default();
        let gateway = Arc::new(GatewayClient::new(url, token, &config.openai)?);
        info!(%url, "Using remote gateway");
        return Ok(SessionParts {
            capabilities: Capabilities {
                transcriber: gateway.clone(),
                generator: gateway.clone(),
                synthesizer: gateway.clone(),
            },
            local_voice,
            sink,
            auth: gateway as Arc<dyn AuthCheck>,
            realtime: None,
        });
    }

    Ok(SessionParts {
        capabilities: Capabilities {
            transcriber: stt::create_transcriber(config),
            generator: llm::create_reply_generator(config),
            synthesizer: tts::create_synthesizer(config),
        },
        local_voice,
        sink,
        auth: Arc::new(AlwaysAuthenticated),
        realtime: None,
    })
}

enum Input {
    Line(String),
    Audio(PathBuf),
    Reconnect,
    Quit,
}

fn parse_input(line: &str) -> Option<Input> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if line == "/quit" || line == "/exit" {
        return Some(Input::Quit);
    }
    if line == "/reconnect" {
        return Some(Input::Reconnect);
    }
    if let Some(path) = line.strip_prefix("/audio") {
        let path = path.trim();
        if path.is_empty() {
            eprintln!("usage: /audio <file>");
            return None;
        }
        return Some(Input::Audio(PathBuf::from(shellexpand::tilde(path).as_ref())));
    }
    Some(Input::Line(line.to_string()))
}

fn prompt(listening: &ConsoleListening) -> String {
    match listening.locale() {
        Some(locale) => format!("[{locale}] > "),
        None => "[busy] > ".to_string(),
    }
}

/// Blocking line reader; one message per line, `Quit` on EOF or Ctrl-C.
fn read_lines(listening: ConsoleListening, tx: mpsc::UnboundedSender<Input>) -> Result<()> {
    let mut editor = DefaultEditor::new()?;
    loop {
        match editor.readline(&prompt(&listening)) {
            Ok(line) => {
                let _ = editor.add_history_entry(line.as_str());
                let Some(input) = parse_input(&line) else { continue };
                let quit = matches!(input, Input::Quit);
                if tx.send(input).is_err() || quit {
                    return Ok(());
                }
            }
            Err(ReadlineError::Eof | ReadlineError::Interrupted) => {
                let _ = tx.send(Input::Quit);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
    }
}

async fn submit_audio(handle: &SessionHandle, path: &Path) -> Result<()> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "audio.webm".to_string());
    let mime = RecordedAudio::mime_for(&file_name);
    handle.send(SessionEvent::Audio(RecordedAudio::new(bytes, file_name, mime)));
    Ok(())
}

fn print_turn(turn: &ConversationTurn) {
    println!("you ({}): {}", turn.language, turn.user_text);
    println!("assistant: {}", turn.assistant_text);
}

async fn chat(config: Config, args: ChatArgs) -> Result<()> {
    if config.conversation.transport == Transport::Realtime {
        warn!("The console has no peer connection; chatting over the chained transport");
    }
    let parts = session_parts(&config, &args)?;
    let (recognizer, listening) = ConsoleRecognizer::new();
    let (transcript_tx, mut transcript_rx) = mpsc::unbounded_channel();
    let (session, handle) = build_session(&config, recognizer, parts, Some(transcript_tx));

    let mut session_task = tokio::spawn(session.run());

    let printer = tokio::spawn(async move {
        while let Some(turn) = transcript_rx.recv().await {
            print_turn(&turn);
        }
    });

    let errors = {
        let mut states = handle.subscribe();
        tokio::spawn(async move {
            let mut last = None;
            while states.changed().await.is_ok() {
                let state = states.borrow_and_update().clone();
                if state.last_error_message != last {
                    if let Some(message) = &state.last_error_message {
                        eprintln!("! {message}");
                    }
                    last = state.last_error_message;
                }
                debug!(status = ?state.connection_status, text = %state.status_text, "State");
            }
        })
    };

    let (input_tx, mut input_rx) = mpsc::unbounded_channel();
    // A plain thread: a pending readline must not hold the runtime open.
    std::thread::spawn(move || {
        if let Err(e) = read_lines(listening, input_tx) {
            eprintln!("! line editor: {e:#}");
        }
    });

    println!("Type to talk (/audio <file> to send a clip, /reconnect after an error, /quit to leave).");
    loop {
        tokio::select! {
            result = &mut session_task => {
                printer.abort();
                errors.abort();
                result.context("session task failed")??;
                return Ok(());
            }
            input = input_rx.recv() => match input {
                Some(Input::Line(text)) => {
                    handle.utterance(&text, true);
                }
                Some(Input::Audio(path)) => {
                    if let Err(e) = submit_audio(&handle, &path).await {
                        eprintln!("! {e:#}");
                    }
                }
                Some(Input::Reconnect) => {
                    handle.send(SessionEvent::Reconnect);
                }
                Some(Input::Quit) | None => break,
            }
        }
    }

    handle.stop();
    session_task.await.context("session task failed")??;
    let _ = tokio::time::timeout(Duration::from_millis(200), printer).await;
    errors.abort();
    Ok(())
}
