mod cli;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use familiar::config;
use familiar::engine::{Engine, EngineHandle};
use familiar::event::EngineEvent;
use familiar::paths;
use familiar::protocol::types::{ContentBlock, StreamMessage, SystemMessage};
use familiar::session::record::SessionId;
use familiar::session::store::SessionStore;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::timeout;

use cli::{Cli, Command};

/// Grace period for trailing events once no round is believed active.
const QUIESCE_WINDOW: Duration = Duration::from_secs(1);

/// One turn of the drive loop: an engine event or a line of input.
enum Step {
    Event(Option<EngineEvent>),
    Line(Option<String>),
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let state_dir = match &cli.state_dir {
        Some(dir) => dir.clone(),
        None => default_state_dir()?,
    };
    std::fs::create_dir_all(&state_dir)
        .with_context(|| format!("failed to create state directory {}", state_dir.display()))?;

    match cli.command {
        Some(Command::Sessions) => list_sessions(&state_dir),
        None => drive(cli, &state_dir).await,
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("familiar=info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn default_state_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("home directory not found; use --state-dir")?;
    Ok(home.join(".familiar"))
}

fn list_sessions(state_dir: &Path) -> Result<()> {
    let store = SessionStore::open(state_dir)?;
    let ids = store.list()?;
    if ids.is_empty() {
        println!("no stored sessions");
        return Ok(());
    }
    for id in ids {
        match store.load(&id) {
            Some(session) => {
                let compacted = if session.compaction.was_compacted {
                    ", compacted"
                } else {
                    ""
                };
                println!(
                    "{id}  {}  {} messages, {} tokens{compacted}",
                    session.working_directory.display(),
                    session.messages.len(),
                    session.token_usage.total(),
                );
            }
            None => println!("{id}  (unreadable)"),
        }
    }
    Ok(())
}

/// Run the engine and bridge it to stdin/stdout, line by line.
async fn drive(cli: Cli, state_dir: &Path) -> Result<()> {
    let mut config = config::load(state_dir)?;
    if let Some(model) = cli.model {
        config.model = Some(model);
    }
    if let Some(directory) = &cli.directory {
        // Accept the agent's mount form too.
        config.default_working_directory = Some(paths::to_host_path(directory));
    }

    let (engine, mut events) = Engine::start(config, state_dir)?;
    let session_id = match cli.session {
        Some(id) => SessionId::new(id),
        None => SessionId::mint(),
    };
    println!("[session {session_id}]");
    engine.select_session(session_id.clone());

    // One-shot mode sends the prompt and drains; interactive mode keeps
    // reading lines until EOF, then drains whatever is still running.
    let mut in_flight: u32 = 0;
    let mut compacting = false;
    let mut lines = if let Some(prompt) = cli.prompt {
        engine.send(session_id.clone(), prompt);
        in_flight = 1;
        None
    } else {
        Some(stdin_lines())
    };

    loop {
        let step = if let Some(line_rx) = lines.as_mut() {
            tokio::select! {
                event = events.recv() => Step::Event(event),
                line = line_rx.recv() => Step::Line(line),
            }
        } else if in_flight > 0 || compacting {
            Step::Event(events.recv().await)
        } else {
            match timeout(QUIESCE_WINDOW, events.recv()).await {
                Ok(event) => Step::Event(event),
                Err(_) => break,
            }
        };

        match step {
            Step::Line(Some(line)) => {
                if handle_line(&engine, &session_id, &line, &mut in_flight) {
                    break;
                }
            }
            Step::Line(None) => lines = None,
            Step::Event(None) => break,
            Step::Event(Some(event)) => {
                match &event {
                    EngineEvent::Message { message, .. } => {
                        if matches!(message.as_ref(), StreamMessage::Result(_)) {
                            in_flight = in_flight.saturating_sub(1);
                        }
                    }
                    EngineEvent::ProcessError { .. } => in_flight = in_flight.saturating_sub(1),
                    EngineEvent::CompactionStart { .. } => compacting = true,
                    EngineEvent::CompactionComplete { .. } => compacting = false,
                    _ => {}
                }
                print_event(&event);
            }
        }
    }

    engine.shutdown().await;
    Ok(())
}

/// Returns true when the user asked to leave.
fn handle_line(
    engine: &EngineHandle,
    session_id: &SessionId,
    line: &str,
    in_flight: &mut u32,
) -> bool {
    let line = line.trim();
    match line {
        "" => {}
        "exit" | "quit" => return true,
        "/stop" => {
            engine.stop(session_id.clone());
            // A stopped round never reports a result.
            *in_flight = in_flight.saturating_sub(1);
        }
        _ => {
            engine.send(session_id.clone(), line.to_string());
            *in_flight += 1;
        }
    }
    false
}

fn stdin_lines() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn print_event(event: &EngineEvent) {
    match event {
        EngineEvent::Message { message, .. } => print_message(message),
        EngineEvent::TokenUpdate { usage, ratio, .. } => {
            println!(
                "[tokens: {} total, {:.0}% of context]",
                usage.total(),
                ratio * 100.0
            );
        }
        EngineEvent::CompactionStart { .. } => println!("[compacting context...]"),
        EngineEvent::CompactionComplete { compacted, .. } => {
            if *compacted {
                println!("[compaction complete]");
            } else {
                println!("[compaction failed; continuing uncompacted]");
            }
        }
        EngineEvent::ResumeInvalidated { .. } => {
            println!("[stored conversation expired; starting fresh]");
        }
        EngineEvent::ProcessError { error, .. } => eprintln!("error: {error}"),
    }
}

fn print_message(message: &StreamMessage) {
    match message {
        StreamMessage::System(SystemMessage::Init(init)) => {
            println!("[{} via {}]", init.session_id, init.model);
        }
        StreamMessage::System(SystemMessage::CompactBoundary(boundary)) => {
            let pre_tokens = boundary
                .compact_metadata
                .as_ref()
                .map_or(0, |metadata| metadata.pre_tokens);
            println!("[context boundary: {pre_tokens} tokens summarized]");
        }
        StreamMessage::System(SystemMessage::Other) => {}
        StreamMessage::Assistant(assistant) => {
            let Some(body) = &assistant.message else {
                return;
            };
            for block in &body.content {
                match block {
                    ContentBlock::Text { text } => println!("{text}"),
                    ContentBlock::ToolUse { name, .. } => println!("[tool: {name}]"),
                    _ => {}
                }
            }
        }
        StreamMessage::ToolUse(tool) => println!("[tool: {}]", tool.name),
        StreamMessage::Result(result) => {
            if result.is_error {
                eprintln!("agent error: {}", result.result);
            } else {
                println!(
                    "[done: {} turns in {} ms, ${:.4}]",
                    result.num_turns, result.duration_ms, result.total_cost_usd
                );
            }
        }
        StreamMessage::Error(error) => eprintln!("agent error: {}", error.message),
        StreamMessage::User(_) | StreamMessage::ToolResult(_) => {}
    }
}
