//! Chat Relay CLI
//!
//! One-shot prompts, image generation, a connection test and an
//! interactive REPL with progressive rendering of streamed answers.

use anyhow::Result;
use chat_relay::auth::resolve_credential;
use chat_relay::{
    AuthConfig, ChatMode, ChatSession, CompletionResult, Config, Dispatcher, HttpTransport,
    RoutePolicy, Telemetry, TurnOutcome,
};
use clap::{Parser, Subcommand};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Get the default data directory
/// Uses XDG_DATA_HOME if set, otherwise ~/.chat_relay
fn default_data_dir() -> PathBuf {
    if let Ok(xdg_data) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg_data).join("chat_relay")
    } else if let Some(home) = dirs::home_dir() {
        home.join(".chat_relay")
    } else {
        PathBuf::from(".chat_relay")
    }
}

/// Build configuration from CLI args and auth.json
/// Priority: CLI flags > auth.json > defaults
fn build_config(cli: &Cli, auth: &AuthConfig) -> Result<Config> {
    let model = cli.model.as_deref().unwrap_or_default();
    let mut config = if let Some(ref base_url) = cli.base_url {
        Config::custom(base_url, model)
    } else if let Some(ref provider) = cli.provider {
        Config::from_auth(auth, provider, model)?
    } else {
        Config::openrouter(model)
    };

    if cli.model.is_none() {
        config = config.with_default_model();
    }

    if let Some(ref api_key) = cli.api_key {
        config = config.with_api_key(api_key.clone());
    }
    if !cli.fallback_model.is_empty() {
        config = config.with_fallback_models(cli.fallback_model.clone());
    }
    if let Some(ref image_model) = cli.image_model {
        config = config.with_image_model(image_model.clone());
    }

    let policy = if cli.keep_route {
        RoutePolicy::Persist
    } else {
        RoutePolicy::DropAfterFirstFailure
    };

    Ok(config
        .with_route(cli.route.clone())
        .with_route_policy(policy)
        .with_stream(!cli.no_stream)
        .with_timeout_secs(cli.timeout_secs)
        .with_system_prompt(cli.system.clone()))
}

#[derive(Parser)]
#[command(name = "chat-relay")]
#[command(about = "Chat Relay - chat with hosted LLMs with automatic fallback", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// LLM model to use (default: the provider's default model)
    #[arg(short, long)]
    model: Option<String>,

    /// Model to try when the primary fails (repeatable, tried in order)
    #[arg(long = "fallback-model")]
    fallback_model: Vec<String>,

    /// Model for image generation
    #[arg(long)]
    image_model: Option<String>,

    /// Preferred upstream backend, e.g. "groq"
    #[arg(long)]
    route: Option<String>,

    /// Keep the route on every fallback attempt
    #[arg(long)]
    keep_route: bool,

    /// Wait for the full answer instead of streaming
    #[arg(long)]
    no_stream: bool,

    /// System prompt prepended to the conversation
    #[arg(long)]
    system: Option<String>,

    /// Provider entry in auth.json to use
    #[arg(long)]
    provider: Option<String>,

    /// Base URL for custom LLM endpoint (e.g., LM Studio) - overrides auth.json
    #[arg(long)]
    base_url: Option<String>,

    /// API key - overrides auth.json and env vars
    #[arg(long)]
    api_key: Option<String>,

    /// Request timeout in seconds
    #[arg(long, default_value = "120")]
    timeout_secs: u64,

    /// Data directory (default: ~/.chat_relay or $XDG_DATA_HOME/chat_relay)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// OpenTelemetry collector endpoint (e.g., http://localhost:4318)
    #[arg(long)]
    otel_endpoint: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive REPL session
    Repl,

    /// Send a single prompt
    Prompt {
        /// The prompt to send
        message: String,
    },

    /// Generate an image from a prompt
    Image {
        /// Image description
        prompt: String,
    },

    /// Test the connection and API key
    Ping,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
    std::fs::create_dir_all(&data_dir)?;

    let auth = AuthConfig::load().unwrap_or_default();
    let config = build_config(&cli, &auth)?
        .with_verbose(cli.verbose)
        .with_log_dir(data_dir.clone())
        .with_otel_endpoint(cli.otel_endpoint.clone());

    let telemetry = Telemetry::init(
        config.telemetry.log_dir.clone(),
        config.telemetry.verbose,
        config.telemetry.otel_endpoint.as_deref(),
        Some(&config.llm.model),
        Some(config.llm.provider.as_str()),
    )?;

    let provider = config.llm.provider_config();
    let credential = resolve_credential(config.llm.api_key.as_deref(), &provider, &auth);
    let transport = HttpTransport::new(provider, config.llm.timeout())?;

    let dispatcher = Dispatcher::new(Arc::new(transport))
        .with_fallback_models(config.llm.fallback_models.clone())
        .with_image_fallback_models(config.llm.image_fallback_models.clone())
        .with_route_policy(config.llm.route_policy)
        .with_probe_model(config.llm.probe_model.clone())
        .with_observer(telemetry.observer());

    let mut session = ChatSession::new(dispatcher, credential, &config.llm);

    match cli.command {
        Some(Commands::Prompt { message }) => {
            run_turn(&mut session, &telemetry, &message).await;
        }
        Some(Commands::Image { prompt }) => {
            session.set_mode(ChatMode::Image);
            run_turn(&mut session, &telemetry, &prompt).await;
        }
        Some(Commands::Ping) => run_ping(&session).await,
        Some(Commands::Repl) | None => run_repl(&mut session, &telemetry, &data_dir).await?,
    }

    Ok(())
}

async fn run_ping(session: &ChatSession) {
    match session.dispatcher().ping(session.credential()).await {
        Ok(()) => println!("Connection successful"),
        Err(e) => eprintln!("Connection failed: {}", e),
    }
}

/// Send one prompt, printing streamed text as it arrives.
/// Ctrl-C cancels the turn in flight.
async fn run_turn(session: &mut ChatSession, telemetry: &Telemetry, prompt: &str) -> TurnOutcome {
    let mode = match session.mode() {
        ChatMode::Text => "text",
        ChatMode::Image => "image",
    };
    telemetry.log_turn(mode, session.model(), prompt);

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let token = CancellationToken::new();
    let mut shown = String::new();

    let outcome = {
        let turn = session.send(prompt, Some(tx), Some(token.clone()));
        tokio::pin!(turn);
        loop {
            tokio::select! {
                outcome = &mut turn => break outcome,
                Some(snapshot) = rx.recv() => print_suffix(snapshot, &mut shown),
                _ = tokio::signal::ctrl_c(), if !token.is_cancelled() => token.cancel(),
            }
        }
    };
    while let Ok(snapshot) = rx.try_recv() {
        print_suffix(snapshot, &mut shown);
    }

    render(&outcome, &shown);
    outcome
}

/// Print the part of `snapshot` not yet shown
fn print_suffix(snapshot: String, shown: &mut String) {
    if let Some(suffix) = snapshot.strip_prefix(shown.as_str()) {
        print!("{}", suffix);
        std::io::stdout().flush().ok();
    }
    *shown = snapshot;
}

fn render(outcome: &TurnOutcome, shown: &str) {
    let content = &outcome.reply.content;
    match &outcome.result {
        CompletionResult::Failure(_) => {
            if !shown.is_empty() {
                println!();
            }
            eprintln!("{}", content);
        }
        CompletionResult::Image(image) => {
            println!("{}", content);
            println!("Image: {}", image);
        }
        CompletionResult::Text(_) => match content.strip_prefix(shown) {
            // Streamed prefix already on screen
            Some(rest) if !shown.is_empty() => println!("{}", rest),
            _ => {
                if !shown.is_empty() {
                    println!();
                }
                println!("{}", content);
            }
        },
    }
}

fn print_help() {
    println!("Commands:");
    println!("  /quit, /exit        - Exit the REPL");
    println!("  /clear              - Clear chat history");
    println!("  /mode <text|image>  - Switch between chat and image generation");
    println!("  /model [id]         - Show or set the model for the current mode");
    println!("  /ping               - Test the connection");
    println!("  /stats              - Show session statistics");
    println!("  /help               - Show this help");
}

async fn run_repl(session: &mut ChatSession, telemetry: &Telemetry, data_dir: &Path) -> Result<()> {
    println!("Chat Relay REPL");
    println!("Model: {}", session.model());
    println!("Session: {}", telemetry.session_id());
    if !session.has_credential() {
        println!("Warning: no API key configured (set OPENROUTER_API_KEY or pass --api-key)");
    }
    println!();
    print_help();
    println!();

    let mut rl = DefaultEditor::new()?;
    let history_path = data_dir.join("history.txt");

    let _ = rl.load_history(&history_path);

    loop {
        let prompt = match session.mode() {
            ChatMode::Text => "chat> ",
            ChatMode::Image => "image> ",
        };

        let readline = rl.readline(prompt);

        match readline {
            Ok(line) => {
                let line = line.trim();

                if line.is_empty() {
                    continue;
                }

                rl.add_history_entry(line)?;

                if line.starts_with('/') {
                    let mut parts = line.splitn(2, ' ');
                    let cmd = parts.next().unwrap_or_default();
                    let arg = parts.next().map(str::trim).filter(|s| !s.is_empty());

                    match cmd {
                        "/quit" | "/exit" => {
                            println!("Goodbye!");
                            break;
                        }
                        "/clear" => {
                            session.clear();
                            println!("Chat history cleared.");
                        }
                        "/mode" => match arg.map(str::parse::<ChatMode>) {
                            Some(Ok(mode)) => {
                                session.set_mode(mode);
                                println!("Mode: {:?} (model {})", mode, session.model());
                            }
                            Some(Err(e)) => eprintln!("{}", e),
                            None => println!("Usage: /mode <text|image>"),
                        },
                        "/model" => {
                            if let Some(model) = arg {
                                session.set_model(model);
                            }
                            println!("Model: {}", session.model());
                        }
                        "/ping" => run_ping(session).await,
                        "/stats" => println!("{}", telemetry.stats()),
                        "/help" => print_help(),
                        _ => println!("Unknown command: {}", cmd),
                    }
                    continue;
                }

                println!();
                run_turn(session, telemetry, line).await;
                println!();
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("Goodbye!");
                break;
            }
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    let _ = rl.save_history(&history_path);

    println!("\nSession summary: {}", telemetry.stats());

    Ok(())
}
