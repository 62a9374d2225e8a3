use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use clap::{error::ErrorKind, CommandFactory, Parser, Subcommand};
use serde_json::json;
use tokio::sync::mpsc;

use agent_fleet::{
    automation::{DisplayProvider, StaticDisplays, TmuxAutomation},
    catalog::ToolCatalog,
    config::{Config, FleetPaths},
    controller::{CancelFlag, Controller, LaunchProgress},
    error::FleetError,
    event_bus::EventLog,
    events::{init_logging, init_wrapper_logging, EventEmitter},
    layout::{allocate, select_displays},
    planner::{
        LaunchPlanner, WrapperInvocation, ENV_AGENT_ID, ENV_COMMAND_B64, ENV_SESSION_ID, ENV_TOOL,
    },
    protocol::{ActiveSession, AgentState, LaunchRequest},
    store::{JsonFileStore, PresetStore, SessionStore},
    wrap::{
        resolve_identity, run_wrap, AgentIdentity, Reporter, WrapOptions, INTERNAL_FAILURE_EXIT,
    },
};

#[derive(Debug, Parser)]
#[command(name = "agent-fleet")]
#[command(about = "Launch, tile and watch a fleet of coding-agent terminals")]
struct Cli {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Internal: runs one tool inside a fleet window and reports its lifecycle.
    #[command(hide = true)]
    Wrap(WrapCommand),
    /// Append a lifecycle event for the current agent.
    Report(ReportCommand),
    /// Validate a launch request and print the planned windows.
    Plan {
        request: PathBuf,
    },
    Launch(LaunchCommand),
    /// Poll the active session until Ctrl-C.
    Watch,
    /// Print the active session.
    Status,
    /// Track existing windows as attached agents.
    Attach {
        #[arg(required = true)]
        window_ids: Vec<String>,
    },
    Focus {
        agent_id: String,
    },
    /// Override an agent's state.
    SetState {
        agent_id: String,
        state: AgentState,
    },
    /// Close every window of the active session.
    Close {
        /// Keep closing after a window fails.
        #[arg(long, default_value_t = false)]
        keep_going: bool,
    },
    #[command(subcommand)]
    Preset(PresetCommand),
}

#[derive(Debug, clap::Args)]
struct WrapCommand {
    #[arg(long, env = ENV_TOOL)]
    tool: String,

    #[arg(long, env = ENV_SESSION_ID)]
    session_id: String,

    #[arg(long, env = ENV_AGENT_ID)]
    agent_id: String,

    #[arg(long)]
    command: Option<String>,

    #[arg(long, env = ENV_COMMAND_B64, hide = true)]
    command_b64: Option<String>,
}

#[derive(Debug, clap::Args)]
struct ReportCommand {
    state: AgentState,

    #[arg(long, env = ENV_SESSION_ID)]
    session_id: Option<String>,

    #[arg(long, env = ENV_AGENT_ID)]
    agent_id: Option<String>,

    #[arg(long, env = ENV_TOOL)]
    tool: Option<String>,

    #[arg(long)]
    reason: Option<String>,
}

#[derive(Debug, clap::Args)]
struct LaunchCommand {
    /// Launch request JSON file.
    #[arg(required_unless_present = "preset", conflicts_with = "preset")]
    request: Option<PathBuf>,

    #[arg(long)]
    preset: Option<String>,

    /// Keep polling the new session after launch.
    #[arg(long, default_value_t = false)]
    watch: bool,
}

#[derive(Debug, Subcommand)]
enum PresetCommand {
    Save { name: String, request: PathBuf },
    List,
    Show { name: String },
    Delete { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.config;

    match cli.command {
        Commands::Wrap(cmd) => {
            init_wrapper_logging()?;
            let code = match run_wrap(wrap_options(cmd, &config)).await {
                Ok(code) => code,
                Err(error) => {
                    tracing::error!(target = "agent_fleet::wrap", error = %error, "wrapper failed");
                    INTERNAL_FAILURE_EXIT
                }
            };
            std::process::exit(code);
        }
        Commands::Report(cmd) => run_report(cmd, &config),
        command => {
            init_logging(&config)?;
            run_command(command, config).await
        }
    }
}

fn wrap_options(cmd: WrapCommand, config: &Config) -> WrapOptions {
    WrapOptions {
        identity: AgentIdentity {
            session_id: cmd.session_id,
            agent_id: cmd.agent_id,
            tool: cmd.tool,
        },
        command: cmd.command,
        command_b64: cmd.command_b64,
        event_log: config.paths().events,
    }
}

fn run_report(cmd: ReportCommand, config: &Config) -> Result<()> {
    let identity = match resolve_identity(cmd.session_id, cmd.agent_id, cmd.tool) {
        Ok(identity) => identity,
        Err(error) => {
            let mut command = Cli::command();
            let report = command
                .find_subcommand_mut("report")
                .map(|sub| sub.error(ErrorKind::MissingRequiredArgument, error.to_string()));
            match report {
                Some(err) => err.exit(),
                None => {
                    eprintln!("error: {error}");
                    std::process::exit(2);
                }
            }
        }
    };
    let paths = config.paths();
    let reporter = Reporter::new(EventLog::new(&paths.events), identity);
    reporter
        .report(cmd.state, cmd.reason)
        .with_context(|| format!("failed to append to {}", paths.events.display()))
}

fn read_request(path: &Path) -> Result<LaunchRequest> {
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("failed reading launch request {}", path.display()))?;
    serde_json::from_str(&body)
        .with_context(|| format!("failed parsing launch request {}", path.display()))
}

fn display_provider(config: &Config) -> StaticDisplays {
    if config.displays.is_empty() {
        StaticDisplays::default()
    } else {
        StaticDisplays::new(&config.displays)
    }
}

fn build_controller(config: &Config, paths: &FleetPaths) -> Result<Controller> {
    let executable = std::env::current_exe().context("failed to locate agent-fleet executable")?;
    let controller = Controller::new(
        Arc::new(JsonFileStore::new(&paths.session)),
        Arc::new(TmuxAutomation::new(&config.tmux_session)),
        Arc::new(display_provider(config)),
        LaunchPlanner::new(ToolCatalog::builtin()),
        WrapperInvocation::new(executable, &paths.events),
    )?
    .with_emitter(EventEmitter::new(config.json_output))
    .with_launch_delay(config.launch_delay());
    Ok(controller)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn summary_line(session: &ActiveSession) -> String {
    session
        .agents
        .iter()
        .map(|agent| format!("{} {}", agent.title(), agent.state.badge()))
        .collect::<Vec<_>>()
        .join(" | ")
}

async fn run_command(command: Commands, config: Config) -> Result<()> {
    let paths = config.paths();
    match command {
        Commands::Wrap(_) | Commands::Report(_) => {
            anyhow::bail!("wrap and report run without the controller")
        }
        Commands::Plan { request } => run_plan(&read_request(&request)?, &config),
        Commands::Status => {
            match JsonFileStore::new(&paths.session).load()? {
                Some(session) => print_json(&session)?,
                None => println!("no active session"),
            }
            Ok(())
        }
        Commands::Preset(cmd) => run_preset(cmd, &paths),
        Commands::Launch(cmd) => {
            let request = match (&cmd.request, &cmd.preset) {
                (Some(path), _) => read_request(path)?,
                (None, Some(name)) => PresetStore::new(&paths.presets)
                    .get(name)?
                    .map(|preset| preset.request)
                    .with_context(|| format!("no preset named '{name}'"))?,
                (None, None) => anyhow::bail!("pass a request file or --preset"),
            };
            let _lock = paths.lock_controller()?;
            let controller = Arc::new(build_controller(&config, &paths)?);
            run_launch(&controller, request).await?;
            if cmd.watch {
                run_watch(controller, &config).await;
            }
            Ok(())
        }
        Commands::Watch => {
            let _lock = paths.lock_controller()?;
            let controller = Arc::new(build_controller(&config, &paths)?);
            if controller.session().is_none() {
                println!("no active session");
                return Ok(());
            }
            run_watch(controller, &config).await;
            Ok(())
        }
        Commands::Attach { window_ids } => {
            let _lock = paths.lock_controller()?;
            let controller = build_controller(&config, &paths)?;
            let added = controller.attach(window_ids).await?;
            println!("attached {} window(s)", added.len());
            Ok(())
        }
        Commands::Focus { agent_id } => {
            let _lock = paths.lock_controller()?;
            build_controller(&config, &paths)?
                .focus_agent(&agent_id)
                .await?;
            Ok(())
        }
        Commands::SetState { agent_id, state } => {
            let _lock = paths.lock_controller()?;
            let transition = build_controller(&config, &paths)?
                .set_state(&agent_id, state)
                .await?;
            println!("{}: {} -> {}", agent_id, transition.from, transition.to);
            Ok(())
        }
        Commands::Close { keep_going } => {
            let _lock = paths.lock_controller()?;
            let controller = build_controller(&config, &paths)?;
            match controller.close_session(keep_going).await {
                Ok(closed) => {
                    println!("closed {closed} window(s)");
                    Ok(())
                }
                Err(FleetError::PartialClose { failures }) => {
                    for failure in &failures {
                        eprintln!("  {failure}");
                    }
                    anyhow::bail!("{} window(s) failed to close", failures.len())
                }
                Err(error) => Err(error.into()),
            }
        }
    }
}

fn run_plan(request: &LaunchRequest, config: &Config) -> Result<()> {
    let planner = LaunchPlanner::new(ToolCatalog::builtin());
    let plans = planner.plan(&request.items)?;
    let displays = select_displays(display_provider(config).displays(), &request.displays);
    let placements = allocate(plans.len(), request.layout, &displays);
    let windows: Vec<_> = plans
        .iter()
        .zip(placements.iter())
        .map(|(plan, placement)| json!({ "plan": plan, "placement": placement }))
        .collect();
    print_json(&windows)
}

fn run_preset(cmd: PresetCommand, paths: &FleetPaths) -> Result<()> {
    paths.ensure()?;
    let presets = PresetStore::new(&paths.presets);
    match cmd {
        PresetCommand::Save { name, request } => {
            let preset = presets.save(&name, read_request(&request)?)?;
            println!("saved preset '{}'", preset.name);
        }
        PresetCommand::List => {
            for preset in presets.list()? {
                let instances: u32 = preset.request.items.iter().map(|i| i.count).sum();
                println!(
                    "{}\t{} instance(s)\t{}",
                    preset.name,
                    instances,
                    preset.saved_at.to_rfc3339()
                );
            }
        }
        PresetCommand::Show { name } => {
            let preset = presets
                .get(&name)?
                .with_context(|| format!("no preset named '{name}'"))?;
            print_json(&preset)?;
        }
        PresetCommand::Delete { name } => {
            if !presets.delete(&name)? {
                anyhow::bail!("no preset named '{name}'");
            }
            println!("deleted preset '{name}'");
        }
    }
    Ok(())
}

async fn run_launch(controller: &Controller, request: LaunchRequest) -> Result<()> {
    let cancel = CancelFlag::new();
    let (tx, mut rx) = mpsc::channel::<LaunchProgress>(64);
    let printer = tokio::spawn(async move {
        while let Some(progress) = rx.recv().await {
            match progress {
                LaunchProgress::Started { session_id, total } => {
                    println!("launching {total} window(s) for session {session_id}")
                }
                LaunchProgress::WindowOpened {
                    index,
                    total,
                    name,
                    window_id,
                    ..
                } => println!("[{}/{}] {} ({})", index + 1, total, name, window_id),
                LaunchProgress::Cancelled { opened, total } => {
                    println!("cancelled after {opened} of {total} window(s)")
                }
                LaunchProgress::Finished { opened } => println!("opened {opened} window(s)"),
            }
        }
    });
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let result = controller.launch(request, cancel, Some(tx)).await;
    interrupt.abort();
    let _ = printer.await;
    result?;
    Ok(())
}

async fn run_watch(controller: Arc<Controller>, config: &Config) {
    let mut updates = controller.subscribe();
    let printer = tokio::spawn(async move {
        while updates.changed().await.is_ok() {
            let line = match updates.borrow_and_update().as_ref() {
                Some(session) => summary_line(session),
                None => "session ended".to_string(),
            };
            println!("{line}");
        }
    });
    if let Some(session) = controller.session() {
        println!("{}", summary_line(&session));
    }
    Arc::clone(&controller)
        .run_poll_loop(config.poll_interval(), async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;
    printer.abort();
}
