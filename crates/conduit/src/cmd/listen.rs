use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::Duration;

use conduit_peer::{CancelToken, ChannelReceiver, Conduit, ConduitError, Delivery};
use tracing::info;

use crate::cmd::{cancel_on_ctrlc, conduit_config, Globals, ListenArgs};
use crate::exit::{conduit_error, CliResult, SUCCESS};
use crate::output::print_message;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub fn run(args: ListenArgs, globals: &Globals) -> CliResult<i32> {
    let stop = CancelToken::new();
    cancel_on_ctrlc(stop.clone())?;

    let (mut receiver, rx) = ChannelReceiver::new();
    if let Some(user) = args.user {
        receiver = receiver.with_user_filter(user);
    }
    if let Some(id) = args.id {
        receiver = receiver.with_id_filter(id);
    }

    let config = conduit_config(globals, None, stop.clone());
    let conduit = match Conduit::with_config(Arc::new(receiver), Delivery::Inline, config) {
        Ok(conduit) => conduit,
        Err(ConduitError::Cancelled) => return Ok(SUCCESS),
        Err(err) => return Err(conduit_error("join failed", err)),
    };
    info!(endpoint = %conduit.endpoint(), role = %conduit.role(), "listening");

    let mut printed = 0usize;
    while !stop.is_cancelled() {
        let message = match rx.recv_timeout(POLL_INTERVAL) {
            Ok(message) => message,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        print_message(&message, globals.format);
        printed = printed.saturating_add(1);

        if args.count.is_some_and(|count| printed >= count) {
            break;
        }
    }

    conduit.close();
    Ok(SUCCESS)
}
