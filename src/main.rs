mod client;
mod config;
mod device;
mod error;
mod listener;
mod session;
mod stats;
mod wire;

use std::sync::Arc;

use clap::Parser;
use config::Config;
use device::DeviceChannel;
use stats::Stats;
use tokio::sync::Mutex;
use tracing::{ error, info, warn };

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber
        ::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter
                ::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .init();

    let config = Config::parse();

    info!(
        listen = config.listen_addr(),
        vendor_id = format!("{:#06x}", config.usb_vendor_id),
        product_id = format!("{:#06x}", config.usb_product_id),
        "harp-soundcard-bridge starting"
    );

    let mut device = DeviceChannel::new(
        config.usb_vendor_id,
        config.usb_product_id,
        config.usb_config_value,
        config.reconnect_backoff(),
        config.reset_settle()
    )?;

    if let Err(e) = device.open() {
        warn!(error = %e, "initial USB open failed, will retry lazily on first session");
    }

    let device = Arc::new(Mutex::new(device));
    let stats = Stats::new();

    let stats_clone = stats.clone();
    let stats_interval = config.stats_interval_secs;
    tokio::spawn(async move {
        stats::stats_reporter(stats_clone, stats_interval).await;
    });

    let listen_device = device.clone();
    let listen_stats = stats.clone();
    let listen_config = config.clone();
    let server = tokio::spawn(async move {
        listener::run(listen_config, listen_device, listen_stats).await
    });

    info!("listening for sound card upload sessions, press Ctrl-C to stop");

    tokio::select! {
        result = server => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "listener exited with an error"),
                Err(e) => error!(error = %e, "listener task panicked"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
        }
    }

    device.lock().await.close();
    info!("device connection closed, exiting");
    Ok(())
}
