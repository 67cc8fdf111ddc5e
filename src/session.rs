//! Per-connection upload session state machine (§4.4): reads TCP frames,
//! validates checksums, converts each frame into the matching USB payload,
//! drives the device channel, and replies to the client with
//! device-sourced timestamps.
//!
//! The state machine is generic over the byte stream and over how a USB
//! command actually gets sent, so it can be driven in tests against an
//! in-memory duplex stream and a mock device closure without touching real
//! sockets or `rusb` (see the `tests` module below); `listener.rs` supplies
//! the production stream and a closure that locks the shared
//! `DeviceChannel` and drives it via `spawn_blocking`.

use std::future::Future;
use std::time::{ Duration, SystemTime, UNIX_EPOCH };

use tokio::io::{ AsyncReadExt, AsyncWriteExt };
use tracing::{ debug, info, warn };

use crate::device::Reply;
use crate::error::{ FramingError, FramingReason, SessionError, UsbError };
use crate::wire::{ self, FrameKind, ParsedFrame, DATA_BLOCK_SIZE, FILE_METADATA_SIZE, METADATA_SIZE };

const METADATA_CMD_OPCODE: u8 = 0x80;
const DATA_CMD_OPCODE: u8 = 0x81;

const METADATA_CMD_LEN: usize = 4 + 4 + METADATA_SIZE + DATA_BLOCK_SIZE + FILE_METADATA_SIZE + 1;
const DATA_CMD_LEN: usize = 4 + 4 + 4 + DATA_BLOCK_SIZE + 1;

/// Timeouts for the two kinds of USB command a session issues (§4.3/§4.6).
#[derive(Debug, Clone, Copy)]
pub struct SessionTimeouts {
    pub header: Duration,
    pub data: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        SessionTimeouts { header: Duration::from_millis(1000), data: Duration::from_millis(400) }
    }
}

/// Drive one upload session to completion over `stream`, sending every USB
/// command through `send_to_device`. Returns `Ok(())` on a clean "OK" close,
/// `Err` otherwise — callers log the error and move on; a single session
/// failing never brings the server down (§7).
pub async fn handle_session<S, F, Fut>(
    mut stream: S,
    mut send_to_device: F,
    timeouts: SessionTimeouts
) -> Result<(), SessionError>
    where S: AsyncReadExt + AsyncWriteExt + Unpin, F: FnMut(Vec<u8>, Duration) -> Fut, Fut: Future<
        Output = Result<Reply, UsbError>
    >
{
    let header = match wire::parse_frame_from_stream(&mut stream).await {
        Ok(frame) => frame,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            debug!("client disconnected before sending a header");
            return Err(SessionError::ClientDisconnect);
        }
        Err(e) => {
            return Err(SessionError::ProtocolViolation(format!("failed to read header: {e}")));
        }
    };

    if header.kind == FrameKind::Data {
        return Err(SessionError::ProtocolViolation("DATA frame received before HEADER".into()));
    }

    if !header.is_checksum_valid() {
        warn!(kind = ?header.kind, "header checksum mismatch, replying with error and closing");
        let reply = wire::pack_reply(header.kind.reply_tag(), now_timestamp(), true);
        stream.write_all(&reply).await.map_err(|e|
            SessionError::ProtocolViolation(format!("failed to send error reply: {e}"))
        )?;
        return Err(
            SessionError::Framing(FramingError { kind: header.kind, reason: FramingReason::ChecksumMismatch })
        );
    }

    let with_data = header.kind.carries_first_block();
    let with_file_metadata = header.kind.carries_file_metadata();
    let metadata = header.metadata();

    info!(
        kind = ?header.kind,
        sound_index = metadata.sound_index,
        samples = metadata.sound_file_size_in_samples,
        sample_rate = metadata.sample_rate,
        "header received"
    );

    let mut metadata_cmd = vec![0u8; METADATA_CMD_LEN];
    metadata_cmd[0..4].copy_from_slice(&[b'c', b'm', b'd', METADATA_CMD_OPCODE]);
    metadata_cmd[METADATA_CMD_LEN - 1] = b'f';
    metadata_cmd[8..8 + METADATA_SIZE].copy_from_slice(&metadata.to_bytes());

    let first_block_offset = 8 + METADATA_SIZE;
    if with_data {
        let block = header.first_block().expect("FULL header always carries its first block");
        metadata_cmd[first_block_offset..first_block_offset + DATA_BLOCK_SIZE].copy_from_slice(block);
    } else {
        // Ask the client to send the first block as an ordinary DATA frame.
        let reply = wire::pack_reply(header.kind.reply_tag(), now_timestamp(), false);
        stream.write_all(&reply).await.map_err(|e|
            SessionError::ProtocolViolation(format!("failed to send first-block-request reply: {e}"))
        )?;

        let first = read_data_frame(&mut stream).await?;
        if !first.is_checksum_valid() {
            warn!("first data-frame checksum mismatch, replying with error and closing");
            let reply = wire::pack_reply(FrameKind::Data.reply_tag(), now_timestamp(), true);
            let _ = stream.write_all(&reply).await;
            return Err(
                SessionError::Framing(FramingError {
                    kind: FrameKind::Data,
                    reason: FramingReason::ChecksumMismatch,
                })
            );
        }
        if first.data_index() != 0 {
            warn!(index = first.data_index(), "first data frame must carry index 0");
            let reply = wire::pack_reply(FrameKind::Data.reply_tag(), now_timestamp(), true);
            let _ = stream.write_all(&reply).await;
            return Err(
                SessionError::Framing(FramingError {
                    kind: FrameKind::Data,
                    reason: FramingReason::UnexpectedIndex,
                })
            );
        }
        metadata_cmd[first_block_offset..first_block_offset + DATA_BLOCK_SIZE].copy_from_slice(
            first.data_block()
        );
    }

    if with_file_metadata {
        let fm_offset = first_block_offset + DATA_BLOCK_SIZE;
        if let Some(fm) = header.file_metadata() {
            metadata_cmd[fm_offset..fm_offset + FILE_METADATA_SIZE].copy_from_slice(fm);
        }
    }

    send_to_device(metadata_cmd, timeouts.header).await.map_err(SessionError::Usb)?;

    let ack = wire::pack_reply(header.kind.reply_tag(), now_timestamp(), false);
    stream.write_all(&ack).await.map_err(|e|
        SessionError::ProtocolViolation(format!("failed to send header-ack reply: {e}"))
    )?;

    let mut packets_forwarded: u64 = 0;

    loop {
        let frame = match read_data_frame(&mut stream).await {
            Ok(frame) => frame,
            Err(SessionError::ClientDisconnect) => break,
            Err(e) => return Err(e),
        };

        if !frame.is_checksum_valid() {
            warn!(index = frame.data_index(), "data frame checksum mismatch, replying with error");
            let reply = wire::pack_reply(FrameKind::Data.reply_tag(), now_timestamp(), true);
            stream.write_all(&reply).await.map_err(|e|
                SessionError::ProtocolViolation(format!("failed to send data error reply: {e}"))
            )?;
            continue;
        }

        let mut data_cmd = vec![0u8; DATA_CMD_LEN];
        data_cmd[0..4].copy_from_slice(&[b'c', b'm', b'd', DATA_CMD_OPCODE]);
        data_cmd[DATA_CMD_LEN - 1] = b'f';
        data_cmd[8..12].copy_from_slice(&frame.data_index().to_le_bytes());
        data_cmd[12..12 + DATA_BLOCK_SIZE].copy_from_slice(frame.data_block());

        send_to_device(data_cmd, timeouts.data).await.map_err(SessionError::Usb)?;
        packets_forwarded += 1;

        let reply = wire::pack_reply(FrameKind::Data.reply_tag(), now_timestamp(), false);
        stream.write_all(&reply).await.map_err(|e|
            SessionError::ProtocolViolation(format!("failed to send data-ack reply: {e}"))
        )?;
    }

    stream.write_all(b"OK").await.map_err(|e|
        SessionError::ProtocolViolation(format!("failed to send final OK: {e}"))
    )?;
    info!(packets = packets_forwarded, "upload completed");
    Ok(())
}

/// Read one DATA frame, mapping a clean EOF to [`SessionError::ClientDisconnect`].
async fn read_data_frame<S: AsyncReadExt + Unpin>(stream: &mut S) -> Result<ParsedFrame, SessionError> {
    match wire::parse_frame_from_stream(stream).await {
        Ok(frame) if frame.kind == FrameKind::Data => Ok(frame),
        Ok(frame) =>
            Err(
                SessionError::ProtocolViolation(
                    format!("expected DATA frame, got {:?}", frame.kind)
                )
            ),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(SessionError::ClientDisconnect),
        Err(e) => Err(SessionError::ProtocolViolation(format!("failed to read data frame: {e}"))),
    }
}

/// `seconds = floor(now)`, `ticks = round((now - seconds) / 32e-6)` (§4.4).
fn now_timestamp() -> [u8; 6] {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64();
    wire::build_timestamp(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::SoundCardFrameBuilder;
    use crate::wire::Metadata;

    fn metadata(samples: i32) -> Metadata {
        Metadata { sound_index: 4, sound_file_size_in_samples: samples, sample_rate: 96_000, data_type: 0 }
    }

    async fn ok_device(_payload: Vec<u8>, _timeout: Duration) -> Result<Reply, UsbError> {
        Ok(Reply { nonce: 0, error: 0 })
    }

    #[tokio::test]
    async fn full_upload_round_trip_produces_ok() {
        let waveform = vec![0x11u8; 2 * DATA_BLOCK_SIZE];
        let mut builder = SoundCardFrameBuilder::new(&waveform, metadata((2 * DATA_BLOCK_SIZE as i32) / 4));
        builder.set_sound_filename("a.bin");

        let mut client_bytes = builder.build_header(true, true);
        client_bytes.extend(builder.build_data_packet(1));

        let (mut client, server) = tokio::io::duplex(8 * DATA_BLOCK_SIZE);
        client.write_all(&client_bytes).await.unwrap();
        drop(client_bytes);

        let handle = tokio::spawn(async move {
            handle_session(server, ok_device, SessionTimeouts::default()).await
        });

        client.shutdown().await.unwrap();

        let mut replies = vec![0u8; wire::REPLY_LEN * 2 + 2];
        client.read_exact(&mut replies).await.unwrap();

        assert_eq!(replies[0], 0x02, "header ack should not be an error reply");
        assert_eq!(&replies[replies.len() - 2..], b"OK");

        handle.await.unwrap().expect("session should complete cleanly");
    }

    #[tokio::test]
    async fn bad_header_checksum_replies_with_error_and_closes() {
        let waveform = vec![0u8; DATA_BLOCK_SIZE];
        let builder = SoundCardFrameBuilder::new(&waveform, metadata(8192));
        let mut header = builder.build_header(true, true);
        let last = header.len() - 1;
        header[last] ^= 0xff;

        let (mut client, server) = tokio::io::duplex(8 * DATA_BLOCK_SIZE);
        client.write_all(&header).await.unwrap();

        let handle = tokio::spawn(async move {
            handle_session(server, ok_device, SessionTimeouts::default()).await
        });

        let mut reply = [0u8; wire::REPLY_LEN];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[0], 0x10, "checksum failure must reply with the error byte");

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::Framing(_)));
    }

    #[tokio::test]
    async fn no_data_header_requests_first_block_from_client() {
        let waveform = vec![0x22u8; DATA_BLOCK_SIZE];
        let mut builder = SoundCardFrameBuilder::new(&waveform, metadata(8192));
        builder.set_metadata_content("hello");

        let header = builder.build_header(false, true);
        let first_block = builder.build_data_packet(0);

        let (mut client, server) = tokio::io::duplex(8 * DATA_BLOCK_SIZE);
        client.write_all(&header).await.unwrap();

        let handle = tokio::spawn(async move {
            handle_session(server, ok_device, SessionTimeouts::default()).await
        });

        let mut first_reply = [0u8; wire::REPLY_LEN];
        client.read_exact(&mut first_reply).await.unwrap();
        assert_eq!(first_reply[0], 0x02);

        client.write_all(&first_block).await.unwrap();
        client.shutdown().await.unwrap();

        let mut second_reply = [0u8; wire::REPLY_LEN];
        client.read_exact(&mut second_reply).await.unwrap();
        assert_eq!(second_reply[0], 0x02);

        let mut ok = [0u8; 2];
        client.read_exact(&mut ok).await.unwrap();
        assert_eq!(&ok, b"OK");

        handle.await.unwrap().expect("session should complete cleanly");
    }

    #[tokio::test]
    async fn fatal_device_error_aborts_session() {
        let waveform = vec![0u8; DATA_BLOCK_SIZE];
        let builder = SoundCardFrameBuilder::new(&waveform, metadata(8192));
        let header = builder.build_header(true, true);

        let (mut client, server) = tokio::io::duplex(8 * DATA_BLOCK_SIZE);
        client.write_all(&header).await.unwrap();

        let failing_device = |_payload: Vec<u8>, _timeout: Duration| async {
            Err(UsbError::Fatal("nonce mismatch".into()))
        };

        let result = handle_session(server, failing_device, SessionTimeouts::default()).await;
        assert!(matches!(result, Err(SessionError::Usb(_))));
    }
}
