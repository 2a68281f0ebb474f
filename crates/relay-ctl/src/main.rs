//! relay-ctl — operator CLI for probing a running relayd.
//!
//! Thin wrapper over the unauthenticated `/health`, `/ready`, and `/status`
//! routes (§4.10) — it never touches the capability-gated transfer plane,
//! since an operator probing the daemon has no session to act as.

mod cmd;

use anyhow::{Context, Result};

const DEFAULT_PORT: u16 = 8443;

fn print_usage() {
    println!("Usage: relay-ctl [--port <port>] <command>");
    println!();
    println!("  health     Liveness probe");
    println!("  ready      Readiness probe (sweeper has run recently)");
    println!("  status     Process-wide metrics snapshot");
    println!();
    println!(
        "Options:\n  --port <port>   API port (default: {})",
        DEFAULT_PORT
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut port = DEFAULT_PORT;
    let mut remaining: Vec<String> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--port" {
            i += 1;
            port = args
                .get(i)
                .context("--port requires a value")?
                .parse()
                .context("--port must be a number")?;
        } else {
            remaining.push(args[i].clone());
        }
        i += 1;
    }

    match remaining.first().map(String::as_str) {
        Some("health") => cmd::status::cmd_health(port).await,
        Some("ready") => cmd::status::cmd_ready(port).await,
        Some("status") | None => cmd::status::cmd_status(port).await,
        Some("help") | Some("--help") | Some("-h") => {
            print_usage();
            Ok(())
        }
        Some(other) => {
            eprintln!("Unknown command: {other}");
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
