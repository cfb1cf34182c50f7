use crate::{command, config};
use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "sandboxd")]
#[command(about = "Per-session sandboxed web app containers behind a REST API")]
pub struct Cli {
    /// Path to a config file (defaults to ~/.config/sandboxd/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API
    Serve {
        /// Address to listen on (overrides `bind` from the config)
        #[arg(long)]
        bind: Option<SocketAddr>,
    },

    /// List sandboxes known to the container engine
    #[command(visible_alias = "ls")]
    List,

    /// Stop and remove a sandbox, releasing its port
    #[command(visible_alias = "rm")]
    Stop {
        /// Instance id, id prefix, session id, or instance name
        id: String,
    },

    /// Build the runtime image for a session id
    Build {
        sandbox_id: String,
    },

    /// Run a read-only shell command inside a sandbox
    Exec {
        id: String,

        /// Command to run, e.g. `-- ls -la`
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },

    /// Generate shell completions
    Completions {
        /// The shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Cli {
    /// Whether logs should also be mirrored to stderr.
    pub fn logs_to_stderr(&self) -> bool {
        matches!(self.command, Commands::Serve { .. })
    }
}

pub async fn run(cli: Cli) -> Result<()> {
    if let Commands::Completions { shell } = cli.command {
        generate_completions(shell);
        return Ok(());
    }

    let cfg = config::Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { bind } => command::serve::run(&cfg, bind).await,
        Commands::List => command::list::run(&cfg).await,
        Commands::Stop { id } => command::stop::run(&cfg, &id).await,
        Commands::Build { sandbox_id } => command::build::run(&cfg, &sandbox_id).await,
        Commands::Exec { id, command } => command::exec::run(&cfg, &id, &command).await,
        Commands::Completions { .. } => Ok(()),
    }
}

fn generate_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut std::io::stdout());
}
