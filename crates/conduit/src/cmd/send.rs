use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use conduit_frame::ConduitMessage;
use conduit_peer::{CancelToken, ChannelReceiver, Conduit, Delivery};
use tracing::debug;

use crate::cmd::{conduit_config, parse_duration, Globals, SendArgs};
use crate::exit::{conduit_error, CliError, CliResult, SUCCESS, TIMEOUT};
use crate::output::print_sent;

const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(2);

pub fn run(args: SendArgs, globals: &Globals) -> CliResult<i32> {
    let confirm_timeout = match &args.confirm_timeout {
        Some(input) => parse_duration(input)?,
        None => DEFAULT_CONFIRM_TIMEOUT,
    };
    let message = ConduitMessage::new(args.id, args.payload);

    // Only our own echo matters here.
    let (receiver, rx) = ChannelReceiver::new();
    let receiver = receiver
        .with_user_filter(message.user())
        .with_id_filter(message.id());

    let config = conduit_config(globals, Some(args.retries), CancelToken::new());
    let conduit = Conduit::with_config(Arc::new(receiver), Delivery::Inline, config)
        .map_err(|err| conduit_error("join failed", err))?;
    let role = conduit.role();

    conduit
        .send(&message)
        .map_err(|err| conduit_error("send failed", err))?;

    let confirmed = (!args.no_confirm).then(|| wait_for_relay(&rx, &message, confirm_timeout));
    conduit.close();

    print_sent(&message, &role.to_string(), confirmed, globals.format);
    if confirmed == Some(false) {
        return Err(CliError::new(
            TIMEOUT,
            format!("message not relayed back within {confirm_timeout:?}"),
        ));
    }
    Ok(SUCCESS)
}

/// Wait until the leader relays `sent` back to us.
fn wait_for_relay(
    rx: &mpsc::Receiver<ConduitMessage>,
    sent: &ConduitMessage,
    timeout: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return false;
        }
        match rx.recv_timeout(remaining) {
            Ok(message) if message == *sent => return true,
            Ok(other) => debug!(payload = other.payload(), "ignoring earlier message"),
            Err(_) => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_confirmed_after_unrelated_messages() {
        let (tx, rx) = mpsc::channel();
        let sent = ConduitMessage::from_parts("ann", "open", "mine");
        tx.send(ConduitMessage::from_parts("ann", "open", "older")).unwrap();
        tx.send(sent.clone()).unwrap();

        assert!(wait_for_relay(&rx, &sent, Duration::from_secs(1)));
    }

    #[test]
    fn relay_times_out() {
        let (_tx, rx) = mpsc::channel();
        let sent = ConduitMessage::from_parts("ann", "open", "mine");

        let start = Instant::now();
        assert!(!wait_for_relay(&rx, &sent, Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn relay_fails_fast_when_channel_closes() {
        let (tx, rx) = mpsc::channel::<ConduitMessage>();
        drop(tx);
        let sent = ConduitMessage::from_parts("ann", "open", "mine");
        assert!(!wait_for_relay(&rx, &sent, Duration::from_secs(5)));
    }
}
