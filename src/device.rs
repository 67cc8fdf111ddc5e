//! USB channel to the Harp sound card: request/reply semantics over a pair
//! of bulk endpoints, with nonce correlation and a reconnect-on-error loop
//! (§4.3). Blocking by nature (`rusb` offers no async API) — callers drive
//! this from `tokio::task::spawn_blocking` (see `session.rs`).

use std::thread;
use std::time::Duration;

use rand::Rng as _;
use rusb::{ Context, DeviceHandle, UsbContext };
use tracing::{ debug, info, warn };

use crate::error::UsbError;

pub const EP_OUT: u8 = 0x01;
pub const EP_IN: u8 = 0x81;
const INTERFACE_NUMBER: u8 = 0;

const WRITE_TIMEOUT: Duration = Duration::from_millis(100);

const REPLY_LEN: usize = 12;

/// The decoded 12-byte reply to a `0x80`/`0x81` command:
/// `'c','m','d',<opcode>, nonce(4 LE i32), error(4 LE u32)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    pub nonce: i32,
    pub error: u32,
}

/// Wraps a `rusb::DeviceHandle` to the Harp sound card. Process-wide
/// resource: opened once at server start, reopened transparently on any
/// I/O failure, torn down explicitly on shutdown (§3 "Device handle").
pub struct DeviceChannel {
    context: Context,
    vendor_id: u16,
    product_id: u16,
    config_value: u8,
    reconnect_backoff: Duration,
    reset_settle: Duration,
    handle: Option<DeviceHandle<Context>>,
}

impl DeviceChannel {
    pub fn new(
        vendor_id: u16,
        product_id: u16,
        config_value: u8,
        reconnect_backoff: Duration,
        reset_settle: Duration
    ) -> Result<Self, UsbError> {
        let context = Context::new()?;
        Ok(DeviceChannel {
            context,
            vendor_id,
            product_id,
            config_value,
            reconnect_backoff,
            reset_settle,
            handle: None,
        })
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Enumerate the device, set its configuration, and claim the bulk
    /// interface. Idempotent: a no-op if already open.
    pub fn open(&mut self) -> Result<(), UsbError> {
        if self.handle.is_some() {
            return Ok(());
        }

        info!("trying to open USB connection to the Harp sound card");
        let device = self.context
            .devices()?
            .iter()
            .find(|d| {
                d.device_descriptor().map(|desc|
                    desc.vendor_id() == self.vendor_id && desc.product_id() == self.product_id
                ).unwrap_or(false)
            })
            .ok_or(UsbError::DeviceNotFound { vid: self.vendor_id, pid: self.product_id })?;

        let mut handle = device.open()?;
        if handle.active_configuration().unwrap_or(0) != self.config_value {
            handle.set_active_configuration(self.config_value)?;
        }
        handle.claim_interface(INTERFACE_NUMBER)?;

        self.handle = Some(handle);
        info!("USB connection to Harp sound card established");
        Ok(())
    }

    /// Release the USB resources. Used on shutdown and before a reconnect.
    pub fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!("closing USB connection");
            let _ = handle.release_interface(INTERFACE_NUMBER);
        }
    }

    /// Block until `open()` succeeds, sleeping `reconnect_backoff` before the
    /// first attempt and between every subsequent one. Unbounded — mirrors
    /// `original_source/server.py`'s `time.sleep(1)` followed by
    /// `_wait_for_device_connection`.
    fn wait_for_device_connection(&mut self) {
        self.handle = None;
        thread::sleep(self.reconnect_backoff);
        loop {
            match self.open() {
                Ok(()) => return,
                Err(e) => {
                    warn!(error = %e, backoff_ms = self.reconnect_backoff.as_millis(), "USB reconnect attempt failed, retrying");
                    thread::sleep(self.reconnect_backoff);
                }
            }
        }
    }

    /// Send a reset command (opcode `0x88`, no reply expected), sleep
    /// `reset_settle`, then reopen the connection.
    pub fn reset(&mut self) -> Result<(), UsbError> {
        info!("resetting device");
        let reset_cmd: [u8; 5] = [b'c', b'm', b'd', 0x88, b'f'];
        let handle = self.handle.as_ref().ok_or_else(||
            UsbError::Fatal("reset requested on a closed device handle".into())
        )?;
        let written = handle.write_bulk(EP_OUT, &reset_cmd, WRITE_TIMEOUT)?;
        if written != reset_cmd.len() {
            return Err(UsbError::Fatal("short write on reset command".into()));
        }

        self.close();
        thread::sleep(self.reset_settle);
        self.open()
    }

    /// Issue one command-and-reply round trip. `payload` must already carry
    /// the `'c','m','d',<opcode>` preamble and trailing `'f'`; a fresh nonce
    /// is generated and written into bytes `[4..8)` before sending.
    ///
    /// On a transient USB failure the channel reconnects (§4.3) and retries
    /// the same command exactly once; a second failure, a nonce mismatch, or
    /// a non-zero device error code is fatal and surfaces to the caller.
    pub fn send_cmd(&mut self, payload: &mut [u8], read_timeout: Duration) -> Result<Reply, UsbError> {
        match self.try_send_cmd(payload, read_timeout) {
            Ok(reply) => Ok(reply),
            Err(UsbError::Transient(e)) => {
                warn!(error = %e, "USB I/O error, reconnecting and retrying once");
                self.wait_for_device_connection();
                self.try_send_cmd(payload, read_timeout)
            }
            Err(e) => Err(e),
        }
    }

    fn try_send_cmd(&mut self, payload: &mut [u8], read_timeout: Duration) -> Result<Reply, UsbError> {
        let nonce: i32 = rand::rng().random_range(-32768..32768);
        payload[4..8].copy_from_slice(&nonce.to_le_bytes());

        let handle = self.handle.as_ref().ok_or(UsbError::Transient(rusb::Error::NoDevice))?;

        let written = handle.write_bulk(EP_OUT, payload, WRITE_TIMEOUT)?;
        if written != payload.len() {
            return Err(UsbError::Fatal(format!("short USB write: {written} of {} bytes", payload.len())));
        }

        let mut reply_buf = [0u8; REPLY_LEN];
        let read = handle.read_bulk(EP_IN, &mut reply_buf, read_timeout)?;
        if read != REPLY_LEN {
            return Err(UsbError::Fatal(format!("short USB reply: {read} of {REPLY_LEN} bytes")));
        }

        let nonce_received = i32::from_le_bytes(reply_buf[4..8].try_into().unwrap());
        let error_received = u32::from_le_bytes(reply_buf[8..12].try_into().unwrap());

        if nonce_received != nonce {
            return Err(
                UsbError::Fatal(
                    format!("nonce mismatch: sent {nonce}, device echoed {nonce_received}")
                )
            );
        }
        if error_received != 0 {
            return Err(UsbError::Fatal(format!("device reported error code {error_received}")));
        }

        Ok(Reply { nonce: nonce_received, error: error_received })
    }
}
