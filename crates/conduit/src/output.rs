use std::io::{IsTerminal, Write};
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use conduit_frame::ConduitMessage;
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct MessageOutput<'a> {
    event: &'static str,
    user: &'a str,
    id: &'a str,
    payload: &'a str,
    wire_size: usize,
    timestamp: String,
}

impl<'a> MessageOutput<'a> {
    fn new(event: &'static str, message: &'a ConduitMessage) -> Self {
        Self {
            event,
            user: message.user(),
            id: message.id(),
            payload: message.payload(),
            wire_size: message.wire_size(),
            timestamp: now_unix_seconds(),
        }
    }
}

#[derive(Serialize)]
struct SentOutput<'a> {
    #[serde(flatten)]
    message: MessageOutput<'a>,
    role: &'a str,
    confirmed: Option<bool>,
}

#[derive(Serialize)]
struct ServeOutput {
    event: &'static str,
    addr: String,
    echo_to_sender: bool,
    timestamp: String,
}

/// Print a message delivered by the conduit.
pub fn print_message(message: &ConduitMessage, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&MessageOutput::new("received", message)),
        OutputFormat::Table => print_table(
            vec!["USER", "ID", "SIZE", "PAYLOAD"],
            vec![
                message.user().to_string(),
                message.id().to_string(),
                message.wire_size().to_string(),
                message.payload().to_string(),
            ],
        ),
        OutputFormat::Pretty => {
            println!(
                "user={} id={} size={} payload={}",
                message.user(),
                message.id(),
                message.wire_size(),
                message.payload()
            );
        }
        OutputFormat::Raw => {
            let mut out = std::io::stdout();
            let _ = writeln!(out, "{}", message.payload());
            let _ = out.flush();
        }
    }
}

/// Report a sent message. `confirmed` is `None` when no relay was awaited.
pub fn print_sent(
    message: &ConduitMessage,
    role: &str,
    confirmed: Option<bool>,
    format: OutputFormat,
) {
    let confirmed_text = match confirmed {
        Some(true) => "yes",
        Some(false) => "no",
        None => "skipped",
    };
    match format {
        OutputFormat::Json => print_json(&SentOutput {
            message: MessageOutput::new("sent", message),
            role,
            confirmed,
        }),
        OutputFormat::Table => print_table(
            vec!["ID", "SIZE", "ROLE", "CONFIRMED"],
            vec![
                message.id().to_string(),
                message.wire_size().to_string(),
                role.to_string(),
                confirmed_text.to_string(),
            ],
        ),
        OutputFormat::Pretty => {
            println!(
                "sent id={} size={} role={} confirmed={}",
                message.id(),
                message.wire_size(),
                role,
                confirmed_text
            );
        }
        OutputFormat::Raw => {}
    }
}

/// Report that a standalone leader is serving.
pub fn print_serving(addr: SocketAddr, echo_to_sender: bool, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&ServeOutput {
            event: "serving",
            addr: addr.to_string(),
            echo_to_sender,
            timestamp: now_unix_seconds(),
        }),
        OutputFormat::Table => print_table(
            vec!["ADDR", "ECHO"],
            vec![addr.to_string(), echo_to_sender.to_string()],
        ),
        OutputFormat::Pretty => println!("serving addr={addr} echo={echo_to_sender}"),
        OutputFormat::Raw => println!("{addr}"),
    }
    let _ = std::io::stdout().flush();
}

fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
    let _ = std::io::stdout().flush();
}

fn print_table(header: Vec<&str>, row: Vec<String>) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header)
        .add_row(row);
    println!("{table}");
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
