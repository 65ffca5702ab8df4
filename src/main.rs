use toolsmith::capabilities::CapabilityStatus;
use toolsmith::cli;
use toolsmith::relay::Direction;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "toolsmith",
    version,
    about = "Agent runtime that builds its own tools"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the gateway and the build workers
    Start,
    /// Check if a toolsmith server is running
    Status,
    /// Talk to the agent (one message, or a session on stdin)
    Chat {
        #[arg(short, long)]
        message: Option<String>,
    },
    /// Run a capability build in the foreground
    Build {
        /// What the capability should do
        #[arg(short, long)]
        description: String,
        /// Build an existing catalog entry, or reuse a build id
        #[arg(long)]
        build_id: Option<String>,
    },
    /// Inspect and manage cataloged capabilities
    Capabilities {
        #[command(subcommand)]
        command: CapabilitiesCmd,
    },
    /// Manage capability secrets
    Secrets {
        #[command(subcommand)]
        command: SecretsCmd,
    },
    /// Read a build's relay queues
    Relay {
        #[command(subcommand)]
        command: RelayCmd,
    },
}

#[derive(Subcommand, Debug)]
enum CapabilitiesCmd {
    /// List capabilities, optionally by status
    List {
        #[arg(long)]
        status: Option<String>,
    },
    /// Show one capability by id or name
    Show { id: String },
    Disable { id: String },
    Enable { id: String },
    /// Mark a capability as failed
    Fail { id: String },
    /// Delete a capability with its code, secrets and storage
    Delete { id: String },
}

#[derive(Subcommand, Debug)]
enum SecretsCmd {
    /// Store a secret value (prompted securely)
    Set {
        /// Capability id or name
        #[arg(long)]
        capability: String,
        /// Secret key name (e.g. API_KEY)
        key: String,
    },
}

#[derive(Subcommand, Debug)]
enum RelayCmd {
    /// Show pending messages without consuming them
    Peek {
        #[arg(long)]
        build: String,
        #[arg(long, default_value = "to_user")]
        direction: Direction,
    },
    /// Consume pending messages
    Poll {
        #[arg(long)]
        build: String,
        #[arg(long, default_value = "to_user")]
        direction: Direction,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    toolsmith::logs::init_tracing();

    let cli = Cli::parse();
    let config_path = cli
        .config
        .unwrap_or_else(toolsmith::config::Config::default_path);
    let path = config_path.as_path();

    match cli.command.unwrap_or(Command::Start) {
        Command::Start => cli::start(path).await,
        Command::Status => cli::check_status(path).await,
        Command::Chat { message } => cli::chat(path, message.as_deref()).await,
        Command::Build {
            description,
            build_id,
        } => cli::build(path, &description, build_id.as_deref()).await,
        Command::Capabilities { command } => match command {
            CapabilitiesCmd::List { status } => {
                cli::list_capabilities(path, status.as_deref()).await
            }
            CapabilitiesCmd::Show { id } => cli::show_capability(path, &id).await,
            CapabilitiesCmd::Disable { id } => {
                cli::set_capability_status(path, &id, CapabilityStatus::Disabled).await
            }
            CapabilitiesCmd::Enable { id } => {
                cli::set_capability_status(path, &id, CapabilityStatus::Active).await
            }
            CapabilitiesCmd::Fail { id } => {
                cli::set_capability_status(path, &id, CapabilityStatus::Failed).await
            }
            CapabilitiesCmd::Delete { id } => cli::delete_capability(path, &id).await,
        },
        Command::Secrets { command } => match command {
            SecretsCmd::Set { capability, key } => cli::set_secret(path, &capability, &key).await,
        },
        Command::Relay { command } => match command {
            RelayCmd::Peek { build, direction } => {
                cli::relay_messages(path, &build, direction, false).await
            }
            RelayCmd::Poll { build, direction } => {
                cli::relay_messages(path, &build, direction, true).await
            }
        },
    }
}
