//! Conduit CLI
//!
//! Hosts the connection registry and message router behind a line-delimited
//! JSON protocol on stdin/stdout, plus small offline helpers.

mod commands;
mod config;

use clap::{Parser, Subcommand};
use commands::{ParseUriCommand, ServeCommand};
use tracing_subscriber::{layer::SubscriberExt, Layer};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "CONDUIT_LOG_LEVEL", global = true)]
    log_level: String,

    /// Log format: compact, full
    #[arg(
        long,
        default_value = "compact",
        env = "CONDUIT_LOG_FORMAT",
        global = true
    )]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve JSON requests on stdin, one per line, answering on stdout
    Serve(ServeCommand),
    /// Parse a connection URI and print the resulting config
    ParseUri(ParseUriCommand),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log_level = cli.log_level.clone();

    // RUST_LOG takes full control when set
    let filter = match std::env::var("RUST_LOG") {
        Ok(_) => tracing_subscriber::EnvFilter::try_from_default_env()?,
        Err(_) => tracing_subscriber::EnvFilter::try_new(format!(
            "conduit={level},\
             conduit_cli={level},\
             conduit_query={level},\
             conduit_query_sqlite={level},\
             conduit_query_postgres={level},\
             conduit_query_redis={level},\
             conduit_tunnel={level},\
             conduit_connections={level},\
             conduit_router={level},\
             russh=warn,\
             tokio_postgres=warn,\
             redis=warn",
            level = log_level
        ))?,
    };

    // stdout carries protocol responses, so logs go to stderr
    let fmt_layer = match cli.log_format.as_str() {
        "full" => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed(),
        _ => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed(),
    };

    let subscriber = tracing_subscriber::registry().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Serve(serve_cmd) => serve_cmd.execute(),
        Commands::ParseUri(parse_cmd) => parse_cmd.execute(),
    }
}
