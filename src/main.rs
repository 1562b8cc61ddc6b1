//! MySQL binlog 미러
//!
//! Primary에서 binlog를 받아 로컬 디렉터리에 그대로 복제합니다.
//! `binlog-mirror <config.toml>`

use clap::Parser;
use mysql_binlog_mirror::{ConnectionConfig, MySqlConnector, Replica, ReplicaConfig};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "binlog-mirror", version, about = "Mirror MySQL binary logs as a virtual replica")]
struct Args {
    /// TOML 설정 파일
    config: PathBuf,
}

fn init_logging(config: &ReplicaConfig) -> std::io::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));

    match &config.log_file {
        Some(name) => {
            std::fs::create_dir_all(config.binlog_dir())?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(config.binlog_dir().join(name))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }
    Ok(())
}

/// Ctrl-C 또는 SIGTERM을 받으면 true 전송
fn spawn_signal_handler(tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(e) => {
                    error!("Could not install SIGTERM handler: {}", e);
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("Received shutdown signal");
        let _ = tx.send(true);
    });
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match ReplicaConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {}", args.config.display(), e);
            return ExitCode::from(1);
        }
    };
    if let Err(e) = init_logging(&config) {
        eprintln!("Could not open log file: {}", e);
        return ExitCode::from(1);
    }

    info!(
        "Starting binlog mirror for {}:{} into {}",
        config.master_host,
        config.master_port,
        config.binlog_dir().display()
    );

    let (tx, rx) = watch::channel(false);
    spawn_signal_handler(tx);

    let connector = MySqlConnector::new(ConnectionConfig::from(&config));
    let mut replica = match Replica::new(config, connector) {
        Ok(replica) => replica,
        Err(e) => {
            error!("Could not start: {}", e);
            return ExitCode::from(1);
        }
    };

    match replica.run(rx).await {
        Ok(()) => {
            info!(position = %replica.cursor(), "Binlog mirror stopped");
            ExitCode::SUCCESS
        }
        Err(_) => ExitCode::from(1),
    }
}
