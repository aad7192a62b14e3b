use std::time::Duration;

use conduit_peer::{CancelToken, LeaderServer, ServerConfig};
use tracing::debug;

use crate::cmd::{cancel_on_ctrlc, parse_duration, Globals, ServeArgs};
use crate::exit::{conduit_error, CliError, CliResult, SUCCESS, TRANSPORT_ERROR};
use crate::output::print_serving;

const STATUS_INTERVAL: Duration = Duration::from_secs(1);

pub fn run(args: ServeArgs, globals: &Globals) -> CliResult<i32> {
    let config = ServerConfig {
        echo_to_sender: !args.no_echo,
        write_timeout: Some(parse_duration(&args.write_timeout)?),
    };

    let stop = CancelToken::new();
    cancel_on_ctrlc(stop.clone())?;

    let mut server = LeaderServer::bind(globals.endpoint, config).map_err(|err| {
        if err.is_addr_in_use() {
            CliError::new(
                TRANSPORT_ERROR,
                format!("{} already has a leader", globals.endpoint),
            )
        } else {
            conduit_error("bind failed", err)
        }
    })?;

    print_serving(server.local_addr(), !args.no_echo, globals.format);

    while !stop.wait(STATUS_INTERVAL) {
        debug!(peers = server.peer_count(), "leader status");
    }

    server.shutdown();
    Ok(SUCCESS)
}
