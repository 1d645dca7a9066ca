//! Tunnel client binary.
//!
//! Usage: veiltun-client --config <FILE>

use std::env;
use std::time::Duration;

use veiltun::{Session, TunnelConfig};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .init();

    std::process::exit(run().await);
}

async fn run() -> i32 {
    let args: Vec<String> = env::args().collect();

    let config_path = match args.as_slice() {
        [_, flag, path] if flag == "-c" || flag == "--config" => path.clone(),
        [_, flag] if flag == "-h" || flag == "--help" => {
            print_usage();
            return 0;
        }
        _ => {
            print_usage();
            return 1;
        }
    };

    let config = match TunnelConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("config: {}", e);
            return e.exit_code();
        }
    };

    let remote = config.remote_addr;
    tracing::info!(
        local = %config.local_addr,
        remote = ?remote,
        mode = ?config.mode,
        "starting tunnel client"
    );

    let session = match Session::connect(config).await {
        Ok(session) => session,
        Err(e) => {
            tracing::error!("startup: {}", e);
            return e.exit_code();
        }
    };

    tracing::info!("tunnel established");
    run_until_interrupted(&session).await;

    match session.shutdown().await {
        Ok(()) => {
            tracing::info!("clean shutdown");
            0
        }
        Err(e) => {
            tracing::error!("shutdown: {}", e);
            e.exit_code()
        }
    }
}

async fn run_until_interrupted(session: &Session) {
    let mut ticker = tokio::time::interval(Duration::from_secs(30));
    ticker.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received");
                return;
            }
            _ = ticker.tick() => {
                let stats = session.stats();
                let (send_depth, recv_depth) = session.queue_depths();
                tracing::info!(
                    tx = stats.tx_packets.load(std::sync::atomic::Ordering::Relaxed),
                    rx = stats.rx_packets.load(std::sync::atomic::Ordering::Relaxed),
                    drops = stats.open_failures.load(std::sync::atomic::Ordering::Relaxed),
                    send_depth,
                    recv_depth,
                    "tunnel stats"
                );
            }
        }
    }
}

fn print_usage() {
    println!(
        r#"veiltun client

USAGE:
    veiltun-client --config <FILE>

CONFIGURATION FILE FORMAT (JSON):
    {{
        "role": "client",
        "mode": "raw",
        "local_addr": "10.0.0.1:4000",
        "remote_addr": "203.0.113.7:443",
        "key": "shared passphrase"
    }}

Raw mode needs root (raw sockets and iptables)."#
    );
}
