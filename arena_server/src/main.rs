//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p arena_server -- [--addr 127.0.0.1:40000] [--tick-hz 60]
//!       [--max-clients 4] [--physics-mode tick|free_running] [--config server.json]
//!
//! Console commands:
//!   status         - Show server status
//!   score <p1> <p2> - Set and broadcast the score pair
//!   quit           - Shutdown server

use std::env;
use std::io::{BufRead, Write};
use std::path::Path;

use anyhow::Context;
use arena_server::GameServer;
use arena_shared::config::ServerConfig;
use tokio::sync::mpsc;
use tracing::info;

fn parse_args() -> anyhow::Result<ServerConfig> {
    let args: Vec<String> = env::args().collect();

    // The config file is the base layer; flags override it.
    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => ServerConfig::from_file(Path::new(&args[i + 1]))?,
        _ => ServerConfig::default(),
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.server_addr = args[i + 1].clone();
                i += 2;
            }
            "--tick-hz" if i + 1 < args.len() => {
                cfg.tick_hz = args[i + 1].parse().unwrap_or(cfg.tick_hz);
                i += 2;
            }
            "--max-clients" if i + 1 < args.len() => {
                cfg.max_clients = args[i + 1].parse().unwrap_or(cfg.max_clients);
                i += 2;
            }
            "--physics-mode" if i + 1 < args.len() => {
                cfg.physics_mode = args[i + 1]
                    .parse()
                    .with_context(|| format!("invalid --physics-mode {:?}", args[i + 1]))?;
                i += 2;
            }
            _ => i += 1,
        }
    }
    cfg.validate().context("invalid server config")?;
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(
        addr = %cfg.server_addr,
        tick_hz = cfg.tick_hz,
        max_clients = cfg.max_clients,
        physics_mode = ?cfg.physics_mode,
        "Starting server"
    );

    let mut server = GameServer::bind(cfg).await.context("create server")?;
    if let Some(local) = server.local_addr() {
        info!(%local, "Server listening");
    }

    // Set up console input channel.
    let (console_tx, console_rx) = mpsc::channel::<String>(32);
    server.set_console_input(console_rx);

    // Spawn stdin reader thread.
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    println!("Server ready. Type 'status' for info, 'score <p1> <p2>' to set the score, 'quit' to exit.");
    println!();

    server.run().await.context("server loop")?;
    Ok(())
}
