// ABOUTME: Entry point for the convoke binary.
// ABOUTME: Parses arguments, loads .env and convoke.toml, then dispatches to the subcommand.

use anyhow::Result;
use clap::{Parser, Subcommand};
use convoke_cli::{commands, Config};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "convoke")]
#[command(about = "Agent coordination: router, orchestrator and agents")]
#[command(version)]
struct Cli {
    /// Config file path (default: $XDG_CONFIG_HOME/convoke/convoke.toml)
    #[arg(long, global = true, env = "CONVOKE_CONFIG")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the router
    Serve {
        /// Listen address, overriding [router].listen_addr
        #[arg(short, long, env = "CONVOKE_LISTEN")]
        listen: Option<String>,
    },

    /// Run the research workflow orchestrator as an agent
    Orchestrate {
        /// Router address, overriding [connector].router_addr
        #[arg(short, long, env = "CONVOKE_ROUTER")]
        router: Option<String>,

        /// Agent id, overriding [orchestrator].agent_id
        #[arg(long)]
        id: Option<String>,
    },

    /// Run an agent that echoes every task it receives
    Agent {
        /// Unique agent id
        #[arg(long)]
        id: String,

        /// Agent type used for routing (e.g., "literature")
        #[arg(long = "type")]
        agent_type: String,

        /// Action this agent performs (repeatable)
        #[arg(long = "capability", short = 'c', required = true)]
        capabilities: Vec<String>,

        /// Router address, overriding [connector].router_addr
        #[arg(short, long, env = "CONVOKE_ROUTER")]
        router: Option<String>,
    },

    /// Print the effective configuration as TOML
    Config,

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            print_version();
            return Ok(());
        }
        Commands::Config => {
            let config = Config::resolve(cli.config.as_deref())?;
            print!("{}", config.to_toml()?);
            return Ok(());
        }
        _ => {}
    }

    convoke_log::init_with_verbosity(cli.verbose);
    let config = Config::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { listen } => commands::serve(&config, listen).await,
        Commands::Orchestrate { router, id } => {
            let router = router.unwrap_or_else(|| config.connector.router_addr.clone());
            commands::orchestrate(&config, &router, id).await
        }
        Commands::Agent {
            id,
            agent_type,
            capabilities,
            router,
        } => {
            let router = router.unwrap_or_else(|| config.connector.router_addr.clone());
            commands::agent(&config, &router, &id, &agent_type, capabilities).await
        }
        Commands::Config | Commands::Version => Ok(()),
    }
}

fn print_version() {
    println!("convoke {}", convoke_cli::VERSION);
    println!();
    println!("Components:");
    println!("  router:        convoke-serve");
    println!("  connector:     convoke-connect");
    println!("  orchestrator:  convoke-orchestrator");
}
