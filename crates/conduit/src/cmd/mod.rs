use std::net::SocketAddr;
use std::time::Duration;

use clap::{Args, Subcommand};
use conduit_peer::{CancelToken, ConduitConfig, RetryPolicy};

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod listen;
pub mod send;
pub mod serve;
pub mod version;

/// Settings shared by every subcommand.
#[derive(Debug, Clone)]
pub struct Globals {
    pub format: OutputFormat,
    pub endpoint: SocketAddr,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Join the conduit, send one message, and leave.
    Send(SendArgs),
    /// Join the conduit and print delivered messages.
    Listen(ListenArgs),
    /// Run a standalone leader server until interrupted.
    Serve(ServeArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, globals: &Globals) -> CliResult<i32> {
    match command {
        Command::Send(args) => send::run(args, globals),
        Command::Listen(args) => listen::run(args, globals),
        Command::Serve(args) => serve::run(args, globals),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Routing id receivers filter on.
    pub id: String,
    /// Message payload.
    pub payload: String,
    /// Give up after this many failed connection attempts.
    #[arg(long, default_value_t = 20)]
    pub retries: u32,
    /// Return as soon as the message is written, without waiting for the relay.
    #[arg(long, conflicts_with = "confirm_timeout")]
    pub no_confirm: bool,
    /// How long to wait for the leader to relay the message back (e.g. 2s, 500ms).
    #[arg(long)]
    pub confirm_timeout: Option<String>,
}

#[derive(Args, Debug)]
pub struct ListenArgs {
    /// Only print messages sent by this user.
    #[arg(long)]
    pub user: Option<String>,
    /// Only print messages with this routing id.
    #[arg(long)]
    pub id: Option<String>,
    /// Exit after receiving N messages.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Do not relay a message back to the peer that sent it.
    #[arg(long)]
    pub no_echo: bool,
    /// Drop a peer whose socket stays unwritable this long (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub write_timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Conduit configuration for a CLI invocation.
pub fn conduit_config(
    globals: &Globals,
    max_attempts: Option<u32>,
    cancel: CancelToken,
) -> ConduitConfig {
    ConduitConfig::default()
        .with_endpoint(globals.endpoint)
        .with_retry(RetryPolicy {
            max_attempts,
            ..RetryPolicy::default()
        })
        .with_cancel_token(cancel)
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

/// Cancel `token` on Ctrl-C.
pub fn cancel_on_ctrlc(token: CancelToken) -> CliResult<()> {
    ctrlc::set_handler(move || token.cancel()).map_err(|err| {
        CliError::new(
            crate::exit::INTERNAL,
            format!("signal handler setup failed: {err}"),
        )
    })
}
