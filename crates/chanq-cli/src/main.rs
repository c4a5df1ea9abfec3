//! chanq Command-Line Client
//!
//! Inspect and administer a chanq store while no server holds it open.

mod executor;
mod formatter;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use executor::Context;
use formatter::{create_formatter, OutputFormat};

/// chanq Command-Line Client
#[derive(Parser, Debug)]
#[command(name = "chanq")]
#[command(version, about = "chanq Command-Line Client")]
pub struct Args {
    /// Path to the store directory
    #[arg(short, long, global = true, default_value = "./data")]
    pub data_path: PathBuf,

    /// Path to the JSON bindings file
    #[arg(short, long, global = true, default_value = "./bindings.json")]
    pub bindings: PathBuf,

    /// Output format
    #[arg(long, global = true, default_value = "table", value_enum)]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Load the bindings file and list its channels
    Bindings,

    /// Enqueue a change record
    Enqueue {
        /// Entity type, resolved to its channel
        entity_type: String,
        /// Primary key of the changed row
        primary_key: String,
        /// insert, update or delete
        operation: String,
        /// Row image before the change (JSON text)
        #[arg(long)]
        old: Option<String>,
        /// Row image after the change (JSON text)
        #[arg(long)]
        new: Option<String>,
    },

    /// Show queue and lease counts
    Status {
        /// Restrict to one channel
        channel: Option<String>,
    },

    /// Show the oldest queued records on a channel
    Peek {
        channel: String,
        #[arg(short = 'n', long, default_value_t = 10)]
        limit: usize,
    },

    /// Return expired leases to their queues
    Reclaim,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chanq=warn,chanq_core=warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match run(args) {
        Ok(output) => println!("{}", output),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

fn run(args: Args) -> Result<String, executor::ExecuteError> {
    let formatter = create_formatter(args.format);
    let ctx = Context {
        bindings_path: args.bindings,
        data_path: args.data_path,
    };

    match args.command {
        Command::Bindings => executor::validate_bindings(&ctx, formatter.as_ref()),
        Command::Enqueue {
            entity_type,
            primary_key,
            operation,
            old,
            new,
        } => executor::enqueue(
            &ctx,
            formatter.as_ref(),
            &entity_type,
            &primary_key,
            &operation,
            old,
            new,
        ),
        Command::Status { channel } => executor::status(&ctx, formatter.as_ref(), channel.as_deref()),
        Command::Peek { channel, limit } => executor::peek(&ctx, formatter.as_ref(), &channel, limit),
        Command::Reclaim => executor::reclaim(&ctx, formatter.as_ref()),
    }
}
