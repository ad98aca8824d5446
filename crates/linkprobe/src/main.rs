//! linkprobe - LedgerLink session probe
//!
//! Connects two in-process nodes through the signaling ledger and reports
//! connection time and transfer throughput.

use clap::Parser;
use linkprobe::config::Config;
use linkprobe::probe;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_logging(config: &Config) {
    let default_directive = if config.verbose {
        "linkprobe=debug,ledgerlink_net=debug"
    } else {
        "linkprobe=info,ledgerlink_net=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Parse configuration
    let config = Config::parse();
    init_logging(&config);

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return ExitCode::FAILURE;
    }

    info!("linkprobe v{} - LedgerLink session probe", env!("CARGO_PKG_VERSION"));
    info!(
        "{} messages of {} bytes, gather delay {}ms, shuffle {}",
        config.messages, config.message_size, config.gather_delay_ms, config.shuffle
    );

    match probe::run(&config).await {
        Ok(report) => {
            info!("Dialer:   {}", report.dialer);
            info!("Listener: {}", report.listener);
            info!("Connect time: {:?}", report.connect_time);
            info!(
                "Transferred {} bytes in {:?} ({:.1} MiB/s)",
                report.bytes,
                report.transfer_time,
                report.throughput_mib_s()
            );
            info!(
                "Frames sent {}, received {}, duplicates {}, dropped {}",
                report.sender.frames_sent,
                report.receiver.frames_received,
                report.receiver.duplicate_frames,
                report.receiver.dropped_frames
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Probe failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
