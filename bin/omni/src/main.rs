mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "omni")]
#[command(about = "An agent that acquires new commands from natural-language requests", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire a new capability: plan, synthesize, validate and integrate it
    Add {
        /// Command name (lowercase, underscores)
        name: String,

        /// What the command should do
        description: String,
    },

    /// Plan a client integration for an external MCP tool
    #[command(name = "add-mcp-tool", alias = "add_mcp_tool")]
    AddMcpTool {
        /// Local name for the tool (lowercase, underscores)
        tool_name: String,

        /// JSON object with the tool's connection details
        mcp_config_json: String,

        /// What the tool does
        description: String,
    },

    /// Continue an interrupted workflow from its last durable stage
    Resume {
        name: String,
    },

    /// Show the lifecycle state of one capability, or of all of them
    Status {
        name: Option<String>,
    },

    /// Stop a workflow that has not reached integration yet
    Cancel {
        name: String,
    },

    /// Print transaction log entries
    #[command(name = "show-transactions", alias = "show_transactions")]
    ShowTransactions {
        /// Only entries for this capability
        #[arg(short, long)]
        capability: Option<String>,

        /// First sequence id (inclusive)
        #[arg(long)]
        from: Option<u64>,

        /// Last sequence id (inclusive)
        #[arg(long)]
        to: Option<u64>,

        /// One JSON object per line
        #[arg(long)]
        json: bool,
    },

    /// Print the stored plan of a capability
    #[command(name = "show-plan", alias = "show_plan")]
    ShowPlan {
        name: String,
    },

    /// List acquired commands
    List,

    /// Invoke an acquired command
    Run {
        name: String,

        /// Arguments; JSON literals are passed typed, anything else as a string
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Take an acquired command out of the dispatch table
    Disable {
        name: String,
    },

    /// Show the agent version and its history
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG 优先，其次 -v
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Add { name, description } => {
            commands::add::run(&name, &description).await?;
        }
        Commands::AddMcpTool {
            tool_name,
            mcp_config_json,
            description,
        } => {
            commands::add::run_mcp_tool(&tool_name, &mcp_config_json, &description).await?;
        }
        Commands::Resume { name } => {
            commands::resume::run(&name).await?;
        }
        Commands::Status { name } => {
            commands::status::run(name.as_deref()).await?;
        }
        Commands::Cancel { name } => {
            commands::cancel::run(&name).await?;
        }
        Commands::ShowTransactions {
            capability,
            from,
            to,
            json,
        } => {
            commands::transactions::run(capability.as_deref(), from, to, json).await?;
        }
        Commands::ShowPlan { name } => {
            commands::plan::run(&name).await?;
        }
        Commands::List => {
            commands::list::run().await?;
        }
        Commands::Run { name, args } => {
            commands::run_cmd::run(&name, &args).await?;
        }
        Commands::Disable { name } => {
            commands::disable::run(&name).await?;
        }
        Commands::Version => {
            commands::version::run().await?;
        }
    }

    Ok(())
}
