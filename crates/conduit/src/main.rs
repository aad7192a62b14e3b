mod cmd;
mod exit;
mod logging;
mod output;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use clap::Parser;
use conduit_transport::DEFAULT_PORT;

use crate::cmd::{Command, Globals};
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "conduit", version, about = "Local process message conduit CLI")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr). CONDUIT_LOG overrides with a full filter.
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    /// Address the conduit endpoint lives on.
    #[arg(long, value_name = "ADDR", default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST), global = true)]
    host: IpAddr,

    /// Conduit port shared by every participating process.
    #[arg(long, env = "CONDUIT_PORT", default_value_t = DEFAULT_PORT, global = true)]
    port: u16,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let globals = Globals {
        format: cli.format.unwrap_or_else(OutputFormat::default_for_stdout),
        endpoint: SocketAddr::new(cli.host, cli.port),
    };
    let result = cmd::run(cli.command, &globals);

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}
