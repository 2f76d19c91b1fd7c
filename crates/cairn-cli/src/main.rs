mod provider;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use cairn_config::{find_config_path, load_config, resolve_workspace, Config};
use cairn_core::agent::{
    AgenticLoop, ContextBuilder, ConversationManager, LoopEvent, LoopRunner, LoopStatus,
    SubAgentManager,
};
use cairn_core::llm::LlmClient;
use cairn_core::memory::{MemoryStore, SharedMemory, TaskStatus};
use cairn_core::scheduler::{get_next_tasks, NextTaskOptions};
use cairn_core::tools::{register_session_tools, register_workspace_tools, ToolRegistry};
use cairn_core::trace::{TraceEvent, TraceSummary, TraceWriter};

use provider::RigClient;

const PREVIEW_LEN: usize = 120;

/// Render markdown text to the terminal with formatting.
fn render_markdown(text: &str) {
    let skin = termimad::MadSkin::default();
    skin.print_text(text);
}

#[derive(Parser)]
#[command(name = "cairn", about = "Coding agent with session memory and subagents", version)]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with the agent (interactive unless -m is given)
    Agent {
        /// Single message mode (non-interactive)
        #[arg(short, long)]
        message: Option<String>,

        /// Session name; selects the memory snapshot and trace file
        #[arg(short, long, default_value = "default")]
        session: String,
    },
    /// Show the next ready tasks from a session's task graph
    Tasks {
        #[arg(short, long, default_value = "default")]
        session: String,

        /// Select mutually independent tasks that can run together
        #[arg(long)]
        parallel: bool,

        /// Maximum number of tasks to return (with --parallel)
        #[arg(long, default_value_t = 1)]
        max: usize,
    },
    /// Show configuration and session memory status
    Status {
        #[arg(short, long, default_value = "default")]
        session: String,
    },
    /// Inspect session traces
    Trace {
        #[command(subcommand)]
        action: TraceCommands,
    },
}

#[derive(Subcommand)]
enum TraceCommands {
    /// Summarize a JSONL trace file
    Summarize {
        /// Trace file path
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let base_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = format!("{base_filter},cairn_core::agent=debug");
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::Trace { action } = &cli.command {
        return match action {
            TraceCommands::Summarize { file } => run_trace_summary(file),
        };
    }

    let config_path = cli.config.unwrap_or_else(find_config_path);
    let config = load_config(&config_path)?;
    let workspace = resolve_workspace(&config.agents.defaults.workspace);

    match cli.command {
        Commands::Agent { message, session } => {
            std::fs::create_dir_all(&workspace)
                .with_context(|| format!("failed to create workspace {}", workspace.display()))?;
            let session = Session::open(&config, &workspace, &session)?;
            match message {
                Some(msg) => run_single_message(session, &msg).await?,
                None => run_interactive(session).await?,
            }
        }
        Commands::Tasks {
            session,
            parallel,
            max,
        } => run_tasks(&config, &workspace, &session, parallel, max)?,
        Commands::Status { session } => run_status(&config_path, &config, &workspace, &session)?,
        Commands::Trace { .. } => unreachable!(),
    }

    Ok(())
}

/// File-name-safe form of a session name.
fn safe_session_name(session: &str) -> String {
    session
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | ' ' => '_',
            _ => c,
        })
        .collect()
}

fn snapshot_path(workspace: &Path, session: &str) -> PathBuf {
    workspace
        .join("memory")
        .join(format!("{}.json", safe_session_name(session)))
}

fn trace_path(config: &Config, workspace: &Path, session: &str) -> PathBuf {
    match config.trace.path.as_deref().filter(|p| !p.is_empty()) {
        Some(p) => resolve_workspace(p),
        None => workspace
            .join("traces")
            .join(format!("{}.jsonl", safe_session_name(session))),
    }
}

fn load_memory(config: &Config, workspace: &Path, session: &str) -> Result<MemoryStore> {
    let path = snapshot_path(workspace, session);
    MemoryStore::load(&path, config.memory.clone())
}

/// Agent loop plus the session memory it persists between turns.
struct Session {
    agent: AgenticLoop,
    memory: SharedMemory,
    snapshot: PathBuf,
    trace: Option<Arc<TraceWriter>>,
    printer: tokio::task::JoinHandle<()>,
}

impl Session {
    fn open(config: &Config, workspace: &Path, name: &str) -> Result<Self> {
        let snapshot = snapshot_path(workspace, name);
        let mut store = MemoryStore::load(&snapshot, config.memory.clone())?;
        let report = store.apply_confidence_decay(None);
        debug!(
            "Confidence decay on load: {} decayed, {} at floor",
            report.decayed, report.at_floor
        );
        let memory = store.shared();

        let client: Arc<dyn LlmClient> = Arc::new(RigClient::from_config(config, "default")?);
        let worker_client: Arc<dyn LlmClient> = if config.agents.models.contains_key("subagent") {
            Arc::new(RigClient::from_config(config, "subagent")?)
        } else {
            client.clone()
        };

        let mut worker_tools =
            ToolRegistry::new().with_allowlist(config.subagents.allowlist.clone());
        register_workspace_tools(&mut worker_tools, workspace, &config.tools, None);
        let runner = LoopRunner::new(worker_client, worker_tools, workspace, config);
        let subagents = SubAgentManager::new(Arc::new(runner), config.subagents.max_concurrent);

        let mut tools = ToolRegistry::new().with_allowlist(config.tools.allowlist.clone());
        register_workspace_tools(&mut tools, workspace, &config.tools, Some(memory.clone()));
        register_session_tools(&mut tools, memory.clone(), subagents);
        info!("Session '{name}': tools {:?}", tools.permitted_names());

        let conversation = ConversationManager::new(
            memory.clone(),
            ContextBuilder::new(workspace),
            config.agents.defaults.context_window_tokens,
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let mut agent = AgenticLoop::new(client.clone(), tools, conversation)
            .with_max_iterations(config.agents.defaults.max_tool_iterations)
            .with_streaming(config.agents.defaults.stream)
            .with_events(tx);

        let trace = if config.trace.enabled {
            let path = trace_path(config, workspace, name);
            let writer = Arc::new(TraceWriter::create(&path)?);
            writer.record(&TraceEvent::SessionStart {
                timestamp: chrono::Utc::now(),
                session: name.to_string(),
                model: client.model_name().to_string(),
            });
            info!("Tracing session to {}", path.display());
            agent = agent.with_trace(writer.clone());
            Some(writer)
        } else {
            None
        };

        Ok(Self {
            agent,
            memory,
            snapshot,
            trace,
            printer: tokio::spawn(print_events(rx)),
        })
    }

    /// Run one user turn and persist the memory snapshot afterwards.
    async fn turn(&mut self, input: &str) -> Result<String> {
        let result = self.agent.process_user_message(input).await;
        if let Err(e) = self.memory.lock().await.save(&self.snapshot) {
            warn!("Failed to save memory snapshot: {e:#}");
        }
        let outcome = result?;
        debug!(
            "Turn finished: {} after {} iteration(s), {} tool error(s)",
            outcome.status.as_str(),
            outcome.iterations,
            outcome.tool_errors
        );
        if outcome.status == LoopStatus::ToolFailures {
            warn!("Stopped after repeated tool failures");
        }
        Ok(outcome.response)
    }

    async fn close(self) {
        if let Some(trace) = &self.trace {
            debug!("Trace written to {}", trace.path().display());
        }
        // Dropping the loop closes the event channel; the printer drains and exits.
        drop(self.agent);
        let _ = self.printer.await;
    }
}

fn preview(text: &str) -> String {
    let flat = text.replace('\n', " ");
    if flat.chars().count() <= PREVIEW_LEN {
        flat
    } else {
        let cut: String = flat.chars().take(PREVIEW_LEN).collect();
        format!("{cut}...")
    }
}

/// Print tool activity and diagnostics while a turn runs.
async fn print_events(mut rx: mpsc::UnboundedReceiver<LoopEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            LoopEvent::ToolCall {
                name, arguments, ..
            } => {
                eprintln!("  -> {name}({})", preview(&arguments.to_string()));
            }
            LoopEvent::ToolResult {
                name,
                success: false,
                output,
                ..
            } => {
                eprintln!("  !! {name} failed: {}", preview(&output));
            }
            LoopEvent::Diagnostic { message } => eprintln!("  .. {message}"),
            _ => {}
        }
    }
}

async fn run_single_message(mut session: Session, message: &str) -> Result<()> {
    let response = session.turn(message).await;
    session.close().await;
    render_markdown(&response?);
    Ok(())
}

async fn run_interactive(mut session: Session) -> Result<()> {
    let history_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cairn")
        .join("history");
    std::fs::create_dir_all(&history_dir)?;
    let history_path = history_dir.join("cli_history");

    let mut rl = DefaultEditor::new()?;
    let _ = rl.load_history(&history_path);

    println!("cairn interactive mode (type /help for commands, Ctrl-D to quit)");
    println!();

    loop {
        match rl.readline("you> ") {
            Ok(line) => {
                let input = line.trim();
                if input.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(input);

                if matches!(input, "exit" | "quit" | "/exit" | "/quit" | ":q") {
                    break;
                }

                match input {
                    "/help" => {
                        println!("Commands:");
                        println!("  /new     - Clear the conversation (session memory is kept)");
                        println!("  /memory  - Show the session memory summary");
                        println!("  /tasks   - Show the next ready tasks");
                        println!("  /help    - Show this help");
                        println!("  /quit    - Exit");
                        println!();
                        continue;
                    }
                    "/new" => {
                        session.agent.conversation_mut().clear();
                        println!("Conversation cleared.");
                        println!();
                        continue;
                    }
                    "/memory" => {
                        let summary = session.memory.lock().await.summary();
                        if summary.is_empty() {
                            println!("(session memory is empty)");
                        } else {
                            render_markdown(&summary);
                        }
                        println!();
                        continue;
                    }
                    "/tasks" => {
                        let m = session.memory.lock().await;
                        print_ready_tasks(&m, NextTaskOptions::default());
                        println!();
                        continue;
                    }
                    _ => {}
                }

                match session.turn(input).await {
                    Ok(response) => {
                        println!();
                        render_markdown(&response);
                        println!();
                    }
                    Err(e) => {
                        eprintln!("Error: {e}");
                        println!();
                    }
                }
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
                eprintln!("Error: {err}");
                break;
            }
        }
    }

    let _ = rl.save_history(&history_path);
    session.close().await;
    Ok(())
}

fn print_ready_tasks(store: &MemoryStore, opts: NextTaskOptions) {
    let result = get_next_tasks(store.tasks(), opts);
    if let Some(message) = &result.message {
        println!("{message}");
    }
    for task in &result.ready_tasks {
        println!(
            "  [{}] {} (priority {:?}, depth {}, unblocks {})",
            task.id, task.description, task.priority, task.depth, task.blocking_count
        );
        for (id, desc) in &task.dependencies_completed {
            println!("      after {id}: {desc}");
        }
    }
}

fn run_tasks(
    config: &Config,
    workspace: &Path,
    session: &str,
    parallel: bool,
    max: usize,
) -> Result<()> {
    let store = load_memory(config, workspace, session)?;
    println!("Session '{session}': {} task(s)", store.tasks().len());
    print_ready_tasks(
        &store,
        NextTaskOptions {
            max_tasks: max.max(1),
            include_parallel: parallel,
        },
    );
    Ok(())
}

fn run_status(config_path: &Path, config: &Config, workspace: &Path, session: &str) -> Result<()> {
    println!("cairn status");
    println!();

    if config_path.exists() {
        println!("  Config:    {} (found)", config_path.display());
    } else {
        println!("  Config:    {} (not found, using defaults)", config_path.display());
    }
    if workspace.exists() {
        println!("  Workspace: {} (found)", workspace.display());
    } else {
        println!("  Workspace: {} (not found)", workspace.display());
    }

    let mut tiers: Vec<_> = config.agents.models.iter().collect();
    tiers.sort_by(|a, b| a.0.cmp(b.0));
    if tiers.is_empty() {
        println!("  Models:    (not set)");
    }
    for (tier, model) in tiers {
        println!("  Model:     {tier} = {} / {}", model.provider, model.model);
    }
    println!();

    let allowlist = |list: &Option<Vec<String>>| match list {
        None => "all".to_string(),
        Some(names) if names.is_empty() => "none".to_string(),
        Some(names) => names.join(", "),
    };
    println!("  Tools:     {}", allowlist(&config.tools.allowlist));
    println!(
        "    Workspace restriction: {}",
        if config.tools.restrict_to_workspace {
            "enabled"
        } else {
            "disabled"
        }
    );
    println!(
        "  Subagents: max {} concurrent, {} iterations, tools {}",
        config.subagents.max_concurrent,
        config.subagents.max_iterations,
        allowlist(&config.subagents.allowlist)
    );
    println!(
        "  Trace:     {}",
        if config.trace.enabled {
            trace_path(config, workspace, session).display().to_string()
        } else {
            "disabled".to_string()
        }
    );
    println!();

    let snapshot = snapshot_path(workspace, session);
    if !snapshot.exists() {
        println!("  Session '{session}': no memory snapshot yet");
        return Ok(());
    }
    let store = load_memory(config, workspace, session)?;
    let count = |status: TaskStatus| store.tasks().iter().filter(|t| t.status == status).count();
    println!("  Session '{session}': {}", snapshot.display());
    println!("    Goals:       {}", store.goals().len());
    println!(
        "    Tasks:       {} ({} active, {} waiting, {} completed)",
        store.tasks().len(),
        count(TaskStatus::Active),
        count(TaskStatus::Waiting),
        count(TaskStatus::Completed)
    );
    println!("    Preferences: {}", store.preferences().len());
    println!("    User facts:  {}", store.user_facts().len());
    println!("    Decisions:   {}", store.decisions().len());
    println!("    Open errors: {}", store.unresolved_errors().len());
    Ok(())
}

fn run_trace_summary(path: &Path) -> Result<()> {
    let summary = TraceSummary::from_path(path)?;
    println!("Trace {}", path.display());
    println!("  Sessions:      {}", summary.sessions);
    println!("  User messages: {}", summary.user_messages);
    println!("  Model turns:   {}", summary.model_turns);
    println!(
        "  Tool calls:    {} ({} failed)",
        summary.tool_calls, summary.tool_errors
    );
    println!("  Diagnostics:   {}", summary.diagnostics);
    if let Some(last) = summary.responses.last() {
        println!();
        render_markdown(last);
    }
    Ok(())
}
