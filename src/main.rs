use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(name = "amesh")]
#[command(about = "Register agents, run tasks and workflows across them", long_about = None)]
#[command(version)]
struct Cli {
    /// Data directory
    #[arg(long, global = true, default_value = ".agentmesh")]
    dir: PathBuf,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the data directory with default config and executors
    Init,

    /// List registered agents
    Agents {
        /// Only agents with this trigger type (always, on_demand, repository)
        #[arg(long)]
        trigger: Option<String>,
    },

    /// Show one agent's definition and state
    Show { name: String },

    /// Register an agent from a definition document
    Register {
        file: PathBuf,

        /// Replace the definition of an already registered agent
        #[arg(long)]
        update: bool,
    },

    /// Remove an agent
    Deregister {
        name: String,

        /// Cancel in-flight tasks instead of refusing
        #[arg(long)]
        force: bool,
    },

    /// Run a task on an agent
    Submit {
        agent: String,
        instruction: String,

        /// Task context as a JSON object
        #[arg(long)]
        context: Option<String>,

        /// Deadline in seconds (0 disables it)
        #[arg(long)]
        timeout: Option<u64>,

        /// Print the finished task and fail unless it succeeded
        #[arg(long)]
        wait: bool,
    },

    /// Run a workflow file (YAML or JSON)
    Workflow {
        file: PathBuf,

        /// Validate and print the layers without running anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Write the registry snapshot (stdout when no file is given)
    Export { file: Option<PathBuf> },

    /// Register every agent in a snapshot file
    Import { file: PathBuf },

    /// Probe agent health
    Health {
        /// Probe once and exit instead of looping
        #[arg(long)]
        once: bool,
    },

    /// Return a failed agent to registered
    Reset { name: String },

    /// Bring a stopped agent back into service
    Start { name: String },

    /// Take an agent out of service
    Stop { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let dir = cli.dir;
    let json = cli.json;

    match cli.command {
        Commands::Init => commands::init::run(&dir),
        Commands::Agents { trigger } => commands::agents::run(&dir, trigger.as_deref(), json),
        Commands::Show { name } => commands::show::run(&dir, &name, json),
        Commands::Register { file, update } => commands::register::run(&dir, &file, update, json),
        Commands::Deregister { name, force } => commands::deregister::run(&dir, &name, force),
        Commands::Submit {
            agent,
            instruction,
            context,
            timeout,
            wait,
        } => {
            commands::submit::run(
                &dir,
                &agent,
                &instruction,
                context.as_deref(),
                timeout,
                wait,
                json,
            )
            .await
        }
        Commands::Workflow { file, dry_run } => {
            commands::workflow::run(&dir, &file, dry_run, json).await
        }
        Commands::Export { file } => commands::export::run(&dir, file.as_deref()),
        Commands::Import { file } => commands::import::run(&dir, &file),
        Commands::Health { once } => commands::health::run(&dir, once, json).await,
        Commands::Reset { name } => {
            commands::lifecycle::run(&dir, &name, commands::lifecycle::Action::Reset, json)
        }
        Commands::Start { name } => {
            commands::lifecycle::run(&dir, &name, commands::lifecycle::Action::Start, json)
        }
        Commands::Stop { name } => {
            commands::lifecycle::run(&dir, &name, commands::lifecycle::Action::Stop, json)
        }
    }
}
