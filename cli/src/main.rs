//! Weft CLI binary: wire config → pool → cache → manager → agent, then run
//! one message (streamed by default) or print tools/status.
//!
//! Subcommands: `run` (default when a bare message is given), `tools`,
//! `status`. Env layering (existing env > .env > XDG config.toml) is applied
//! before anything reads the environment.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use stream_event::{to_json, EnvelopeState, ProtocolEvent};
use tokio_stream::StreamExt;
use weft::{
    Agent, ChatOpenAI, ConnectionPool, McpManager, ToolCache, TransportConnector, WeftConfig,
};

const DEFAULT_CONFIG_PATH: &str = "weft.yaml";

#[derive(Parser, Debug)]
#[command(name = "weft")]
#[command(about = "Weft — autonomous ReAct agent over MCP tool servers")]
struct Args {
    /// Path to the YAML config file
    #[arg(
        short,
        long,
        value_name = "PATH",
        env = "WEFT_CONFIG",
        default_value = DEFAULT_CONFIG_PATH
    )]
    config: PathBuf,

    /// Verbose tracing on stderr (RUST_LOG overrides)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Option<Command>,

    /// Positional message: same as `run <message>`
    #[arg(trailing_var_arg = true)]
    rest: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one message through the agent
    Run {
        /// The user message / goal
        message: Vec<String>,
        /// Print the final result without live progress events
        #[arg(long)]
        no_stream: bool,
        /// Emit events / results as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Print the tool catalogue
    Tools,
    /// Show server, tool and cache status
    Status,
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("config: {0}")]
    Config(#[from] weft::ConfigError),
    #[error("llm: {0}")]
    Llm(#[from] weft::LlmError),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("no message given; try: weft run \"your goal\"")]
    NoMessage,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    let args = Args::parse();
    let _ = env_config::load_and_apply("weft", None);
    init_tracing(args.verbose);

    let config = load_config(&args.config)?;
    let (command, positional) = (args.cmd, args.rest);
    let command = command.unwrap_or(Command::Run {
        message: positional,
        no_stream: false,
        json: false,
    });

    let agent = build_agent(&config).await?;

    let result = match command {
        Command::Run {
            message,
            no_stream,
            json,
        } => {
            let message = message.join(" ");
            if message.trim().is_empty() {
                Err(CliError::NoMessage)
            } else if no_stream {
                run_once(&agent, &message, json).await
            } else {
                run_streamed(&agent, &message, json).await
            }
        }
        Command::Tools => {
            let outcome = agent.run("list tools").await;
            println!("{}", outcome.answer);
            Ok(())
        }
        Command::Status => {
            let status = agent.status();
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
    };

    agent.shutdown().await;
    result
}

async fn build_agent(config: &WeftConfig) -> Result<Arc<Agent>, CliError> {
    let llm = Arc::new(ChatOpenAI::from_settings(&config.llm)?);
    let pool = ConnectionPool::new(config.pool.clone(), Arc::new(TransportConnector));
    pool.start();
    let cache = ToolCache::new(config.cache.clone());
    let manager = Arc::new(McpManager::new(
        config.servers.clone(),
        pool,
        cache,
        config.agent.action_timeout(),
    ));
    let discovered = manager.initialize_with_caching().await;
    tracing::info!(
        servers = discovered.len(),
        tools = discovered.values().map(Vec::len).sum::<usize>(),
        "mcp discovery complete"
    );
    Ok(Arc::new(Agent::new(
        llm,
        Some(manager),
        config.agent.clone(),
    )))
}

async fn run_once(agent: &Arc<Agent>, message: &str, json: bool) -> Result<(), CliError> {
    let outcome = agent.run(message).await;
    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        println!("{}", outcome.answer);
        eprintln!(
            "[{} | {} iterations | confidence {:.2} | {:.2}s]",
            if outcome.success { "ok" } else { "incomplete" },
            outcome.reasoning.iterations,
            outcome.reasoning.confidence,
            outcome.execution_time
        );
    }
    Ok(())
}

async fn run_streamed(agent: &Arc<Agent>, message: &str, json: bool) -> Result<(), CliError> {
    let mut stream = agent.run_stream(message);
    let mut envelope: Option<EnvelopeState> = None;
    let mut printed_answer = false;

    while let Some(event) = stream.next().await {
        if json {
            // The envelope's run id comes from the first RunStarted event.
            let state = envelope.get_or_insert_with(|| {
                let run_id = match &event {
                    ProtocolEvent::RunStarted { run_id, .. } => run_id.clone(),
                    _ => "run-0".to_string(),
                };
                EnvelopeState::new(run_id)
            });
            println!("{}", to_json(&event, state)?);
            continue;
        }
        match event {
            ProtocolEvent::RunStarted { goal, .. } => eprintln!("goal: {}", goal),
            ProtocolEvent::Thought { content, .. } => eprintln!("[think] {}", content),
            ProtocolEvent::Action { name, params, .. } => {
                eprintln!("[act] {} {}", name, params)
            }
            ProtocolEvent::ToolResult {
                name,
                success,
                summary,
                ..
            } => eprintln!(
                "[tool] {} {} {}",
                name,
                if success { "ok" } else { "failed" },
                summary
            ),
            ProtocolEvent::Observation { content, .. } => eprintln!("[observe] {}", content),
            ProtocolEvent::Reflection {
                content,
                confidence,
                ..
            } => eprintln!("[reflect] ({:.1}) {}", confidence, content),
            ProtocolEvent::ToolCatalogue { content } => {
                println!("{}", content);
                printed_answer = true;
            }
            ProtocolEvent::AnswerChunk { content } => {
                print!("{}", content);
                printed_answer = true;
            }
            ProtocolEvent::RunCompleted {
                success,
                iterations,
                confidence,
                duration_ms,
            } => {
                if printed_answer {
                    println!();
                }
                eprintln!(
                    "[{} | {} iterations | confidence {:.2} | {}ms]",
                    if success { "ok" } else { "incomplete" },
                    iterations,
                    confidence,
                    duration_ms
                );
            }
            ProtocolEvent::RunFailed { error } => eprintln!("[failed] {}", error),
            ProtocolEvent::PhaseEnter { .. } => {}
        }
    }
    Ok(())
}

fn load_config(path: &PathBuf) -> Result<WeftConfig, CliError> {
    if path.exists() {
        return Ok(WeftConfig::load(path)?);
    }
    // Zero-config mode: defaults with no servers, built-in actions only.
    if path.as_os_str() == DEFAULT_CONFIG_PATH {
        tracing::warn!("no {} found; starting with defaults", DEFAULT_CONFIG_PATH);
        return Ok(WeftConfig::default());
    }
    Err(CliError::Config(weft::ConfigError::Invalid(format!(
        "config file not found: {}",
        path.display()
    ))))
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "weft=debug,cli=debug" } else { "weft=info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
