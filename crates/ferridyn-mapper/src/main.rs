//! ferridyn-tail: print a table's stream records as JSON lines.
//!
//! Connects to a store over its Unix socket, resolves the table's latest
//! stream and writes one `{"type": ..., "item": ...}` line per record.

use std::path::PathBuf;

use ferridyn_mapper::{Client, SocketTransport, codec};
use serde_json::json;
use tracing::info;

const USAGE: &str = "usage: ferridyn-tail --table NAME [--socket PATH] [--follow]";

struct Args {
    socket: PathBuf,
    table: String,
    follow: bool,
}

fn default_socket_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ferridyn")
        .join("server.sock")
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut socket: Option<PathBuf> = None;
    let mut table: Option<String> = None;
    let mut follow = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--socket" if i + 1 < args.len() => {
                i += 1;
                socket = Some(PathBuf::from(&args[i]));
            }
            "--table" if i + 1 < args.len() => {
                i += 1;
                table = Some(args[i].clone());
            }
            "--follow" => follow = true,
            other => {
                eprintln!("unknown argument: {other}");
                eprintln!("{USAGE}");
                std::process::exit(1);
            }
        }
        i += 1;
    }

    let Some(table) = table else {
        eprintln!("{USAGE}");
        std::process::exit(1);
    };

    Args {
        socket: socket.unwrap_or_else(default_socket_path),
        table,
        follow,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = parse_args();
    info!(socket = %args.socket.display(), table = %args.table, "connecting");

    let transport = SocketTransport::connect(&args.socket).await?;
    let client = Client::new(transport);
    let mut records = client.stream(&args.table).await?;
    info!(stream = records.stream_arn(), "tailing");

    loop {
        let more = if args.follow {
            records.wait_next().await?
        } else {
            records.has_next().await?
        };
        if !more {
            break;
        }
        let record = records.next_record()?;
        let line = json!({
            "type": record.record_type,
            "item": codec::map_to_json(&record.image)?,
        });
        println!("{line}");
    }

    Ok(())
}
