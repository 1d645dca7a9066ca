//! Tunnel server binary.
//!
//! Usage: veiltun-server --config <FILE>

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

    tracing::info!(
        listen = %config.local_addr,
        mode = ?config.mode,
        "starting tunnel server"
    );

    let session = match Session::serve(config).await {
        Ok(session) => session,
        Err(e) => {
            tracing::error!("startup: {}", e);
            return e.exit_code();
        }
    };

    tracing::info!("listening for peers");

    let mut ticker = tokio::time::interval(Duration::from_secs(30));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received");
                break;
            }
            _ = ticker.tick() => {
                let stats = session.stats();
                tracing::info!(
                    tx = stats.tx_packets.load(std::sync::atomic::Ordering::Relaxed),
                    rx = stats.rx_packets.load(std::sync::atomic::Ordering::Relaxed),
                    drops = stats.open_failures.load(std::sync::atomic::Ordering::Relaxed),
                    "tunnel stats"
                );
            }
        }
    }

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

fn print_usage() {
    println!(
        r#"veiltun server

USAGE:
    veiltun-server --config <FILE>

CONFIGURATION FILE FORMAT (JSON):
    {{
        "role": "server",
        "mode": "raw",
        "local_addr": "0.0.0.0:443",
        "remote_addr": null,
        "key": "shared passphrase"
    }}

Raw mode needs root (raw sockets and iptables)."#
    );
}
