//! Storage Converge
//!
//! Command-line entry point: reads one task file, converges the object it
//! describes and prints the result as JSON on stdout. Logs go to stderr.
//!
//! ```text
//! storage-converge apply share.yaml --dry-run
//! storage-converge apply share.yaml --simulate appliance.yaml
//! storage-converge validate share.yaml
//! ```

use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use storage_converge::{
    ApiFactory, ConnectionOverrides, ManagementApiRef, Result, Session, Task, TaskFile,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Storage Converge - desired-state convergence for storage appliances
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, global = true, env = "LOG_JSON")]
    log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Converge the object described by a task file
    Apply {
        /// Task file (YAML)
        task: PathBuf,

        /// Report the planned changes without making them
        #[arg(long)]
        dry_run: bool,

        /// Run against an in-memory appliance seeded from this file
        #[arg(long, value_name = "SEED")]
        simulate: Option<PathBuf>,

        #[command(flatten)]
        connection: ConnectionArgs,
    },

    /// Check a task file without contacting the appliance
    Validate {
        /// Task file (YAML)
        task: PathBuf,
    },
}

/// Connection settings; these override the task file's `connection` block
#[derive(Args, Debug)]
struct ConnectionArgs {
    /// Appliance host name or address
    #[arg(long, env = "APPLIANCE_HOST")]
    host: Option<String>,

    /// Management API port
    #[arg(long, env = "APPLIANCE_PORT")]
    port: Option<u16>,

    #[arg(long, env = "APPLIANCE_USER")]
    username: Option<String>,

    #[arg(long, env = "APPLIANCE_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Skip TLS certificate verification
    #[arg(long, env = "APPLIANCE_INSECURE")]
    insecure: bool,
}

impl From<ConnectionArgs> for ConnectionOverrides {
    fn from(args: ConnectionArgs) -> Self {
        Self {
            host: args.host,
            port: args.port,
            username: args.username,
            password: args.password,
            insecure: args.insecure,
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);

    match run(cli.command).await {
        Ok(output) => match serde_json::to_string_pretty(&output) {
            Ok(text) => {
                println!("{}", text);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            eprintln!("Error: {}", e);
            let code = e.class().exit_code();
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

async fn run(command: Command) -> Result<Value> {
    match command {
        Command::Validate { task } => {
            let file = TaskFile::load(&task)?;
            let task = Task::from_file(&file)?;
            task.check()?;
            Ok(json!({
                "valid": true,
                "resource": task.kind(),
                "access_zone": task.zone(),
            }))
        }
        Command::Apply {
            task,
            dry_run,
            simulate,
            connection,
        } => {
            let file = TaskFile::load(&task)?;
            let task = Task::from_file(&file)?;
            task.check()?;

            let api = connect(&file, simulate, connection.into())?;
            info!(
                "Converging {} in zone {}{}",
                task.kind(),
                task.zone(),
                if dry_run { " (dry-run)" } else { "" }
            );
            let session = Session::new(api, task.zone(), dry_run);
            task.run(&session).await
        }
    }
}

fn connect(
    file: &TaskFile,
    simulate: Option<PathBuf>,
    overrides: ConnectionOverrides,
) -> Result<ManagementApiRef> {
    if let Some(seed) = simulate {
        return ApiFactory::simulate(seed);
    }
    let config = file.connection(&overrides);
    config.validate()?;
    debug!("Connection: {:?}", config);
    ApiFactory::connect(&config)
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(cli: &Cli) {
    let directives = format!("{},hyper=warn,reqwest=warn", cli.log_level.to_lowercase());
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&directives))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    if cli.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
