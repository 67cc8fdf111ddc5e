//! TCP front door: accepts connections, admits exactly one upload session
//! at a time (§3 "single active session"), and bridges each session's
//! device commands onto the shared `DeviceChannel` via `spawn_blocking`
//! (§4.5). Accept-loop structure mirrors the teacher's
//! `transport_tcp::spawn_tcp_receiver`.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{ TcpListener, TcpStream };
use tokio::sync::{ Mutex, Semaphore };
use tracing::{ error, info, warn };

use crate::config::Config;
use crate::device::DeviceChannel;
use crate::error::{ SessionError, UsbError };
use crate::session::{ self, SessionTimeouts };
use crate::stats::Stats;

/// Bind the listener and run the accept loop until the socket errors out or
/// the process is asked to shut down (the caller races this future against
/// `tokio::signal::ctrl_c()`).
pub async fn run(
    config: Config,
    device: Arc<Mutex<DeviceChannel>>,
    stats: Arc<Stats>
) -> anyhow::Result<()> {
    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "listening for sound card upload sessions");

    // Only one upload session may occupy the device at a time; everyone
    // else waits in line for the single permit (§3, §4.5).
    let admission = Arc::new(Semaphore::new(1));
    let timeouts = SessionTimeouts {
        header: config.header_timeout(),
        data: config.data_timeout(),
    };

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept() failed, continuing");
                continue;
            }
        };

        let admission = admission.clone();
        let device = device.clone();
        let stats = stats.clone();
        let timeouts = timeouts.clone();

        tokio::spawn(async move {
            let _permit = match admission.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };

            info!(%peer, "session admitted");
            stats.record_session_started();

            match run_session(stream, device, stats.clone(), timeouts).await {
                Ok(()) => {
                    info!(%peer, "session completed");
                    stats.record_session_completed();
                }
                Err(SessionError::ClientDisconnect) => {
                    info!(%peer, "client disconnected");
                }
                Err(e) => {
                    error!(%peer, error = %e, "session ended with an error");
                    stats.record_session_error(&e);
                }
            }
        });
    }
}

/// Drive one connection's state machine, routing its device commands
/// through `spawn_blocking` since `rusb` is a blocking API (§4.3, §4.5).
async fn run_session(
    stream: TcpStream,
    device: Arc<Mutex<DeviceChannel>>,
    stats: Arc<Stats>,
    timeouts: SessionTimeouts
) -> Result<(), SessionError> {
    let send_to_device = move |payload: Vec<u8>, timeout: Duration| {
        let device = device.clone();
        let stats = stats.clone();
        async move {
            let byte_len = payload.len();
            let is_header_cmd = payload.get(3) == Some(&0x80);
            let mut payload = payload;
            let result = tokio::task::spawn_blocking(move || {
                let mut guard = device.blocking_lock();
                guard.send_cmd(&mut payload, timeout)
            }).await;

            match result {
                Ok(Ok(reply)) => {
                    if is_header_cmd {
                        stats.record_header_frame(byte_len);
                    } else {
                        stats.record_data_frame(byte_len);
                    }
                    Ok(reply)
                }
                Ok(Err(e)) => Err(e),
                Err(join_err) => Err(UsbError::Fatal(format!("device task panicked: {join_err}"))),
            }
        }
    };

    session::handle_session(stream, send_to_device, timeouts).await
}
