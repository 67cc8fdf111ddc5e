//! Harp sound-card TCP framing protocol: packet layouts, checksums, and
//! timestamp encoding. Pure, allocation-light functions — no I/O here beyond
//! [`parse_frame_from_stream`], which only knows how to read exactly the
//! right number of bytes off an `AsyncRead`.
//!
//! Wire format is bit-exact and described in full in `SPEC_FULL.md` §4.1/§6.
//! All multi-byte integers are little-endian; the trailing checksum byte is
//! the wrapping sum of every byte that precedes it.

use tokio::io::{ self, AsyncReadExt };

pub const PREAMBLE_LONG: usize = 7;
pub const PREAMBLE_SHORT: usize = 5;
pub const METADATA_SIZE: usize = 16;
pub const DATA_BLOCK_SIZE: usize = 32768;
pub const FILE_METADATA_SIZE: usize = 2048;
pub const CHECKSUM_SIZE: usize = 1;
pub const DATA_INDEX_SIZE: usize = 4;
pub const TIMESTAMP_SIZE: usize = 6;

pub const FULL_HEADER_LEN: usize =
    PREAMBLE_LONG + METADATA_SIZE + DATA_BLOCK_SIZE + FILE_METADATA_SIZE + CHECKSUM_SIZE;
pub const NO_DATA_HEADER_LEN: usize = PREAMBLE_LONG + METADATA_SIZE + FILE_METADATA_SIZE + CHECKSUM_SIZE;
pub const MIN_HEADER_LEN: usize = PREAMBLE_SHORT + METADATA_SIZE + CHECKSUM_SIZE;
pub const DATA_FRAME_LEN: usize = PREAMBLE_LONG + DATA_INDEX_SIZE + DATA_BLOCK_SIZE + CHECKSUM_SIZE;
pub const REPLY_LEN: usize = PREAMBLE_SHORT + TIMESTAMP_SIZE + CHECKSUM_SIZE;

pub const FULL_HEADER_PREAMBLE: [u8; PREAMBLE_LONG] = [0x02, 0xff, 0x10, 0x88, 0x80, 0xff, 0x01];
pub const NO_DATA_HEADER_PREAMBLE: [u8; PREAMBLE_LONG] = [0x02, 0xff, 0x14, 0x08, 0x81, 0xff, 0x01];
pub const MIN_HEADER_PREAMBLE: [u8; PREAMBLE_SHORT] = [0x02, 0x14, 0x82, 0xff, 0x01];
pub const DATA_FRAME_PREAMBLE: [u8; PREAMBLE_LONG] = [0x02, 0xff, 0x04, 0x80, 0x84, 0xff, 0x84];

// ── File-metadata region offsets (§3) ──────────────────────────────────

pub const SOUND_FILENAME_OFFSET: usize = 0;
pub const SOUND_FILENAME_MAX: usize = 169;
pub const METADATA_FILENAME_OFFSET: usize = 170;
pub const METADATA_FILENAME_MAX: usize = 169;
pub const DESCRIPTION_FILENAME_OFFSET: usize = 340;
pub const DESCRIPTION_FILENAME_MAX: usize = 169;
pub const METADATA_CONTENT_OFFSET: usize = 512;
pub const METADATA_CONTENT_MAX: usize = 1023;
pub const DESCRIPTION_CONTENT_OFFSET: usize = 1536;
pub const DESCRIPTION_CONTENT_MAX: usize = 511;

/// Which kind of TCP frame this is — drives both the parse-time layout
/// decision and the `kind_tag` byte used in the matching reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    FullHeader,
    NoDataHeader,
    MinHeader,
    Data,
}

impl FrameKind {
    /// The reply `kind_tag` byte (§6) that acknowledges this frame kind.
    pub fn reply_tag(self) -> u8 {
        match self {
            FrameKind::FullHeader => 128,
            FrameKind::NoDataHeader => 129,
            FrameKind::MinHeader => 130,
            FrameKind::Data => 132,
        }
    }

    /// Whether the header embeds the first 32768-byte data block.
    pub fn carries_first_block(self) -> bool {
        matches!(self, FrameKind::FullHeader)
    }

    /// Whether the header embeds the 2048-byte file-metadata block.
    pub fn carries_file_metadata(self) -> bool {
        matches!(self, FrameKind::FullHeader | FrameKind::NoDataHeader)
    }
}

/// Sum-of-bytes-mod-256 checksum, computed as an unsigned 8-bit wrap.
#[inline]
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

// ── Metadata record (§3) ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub sound_index: i32,
    pub sound_file_size_in_samples: i32,
    pub sample_rate: i32,
    pub data_type: i32,
}

impl Metadata {
    pub fn to_bytes(self) -> [u8; METADATA_SIZE] {
        let mut buf = [0u8; METADATA_SIZE];
        buf[0..4].copy_from_slice(&self.sound_index.to_le_bytes());
        buf[4..8].copy_from_slice(&self.sound_file_size_in_samples.to_le_bytes());
        buf[8..12].copy_from_slice(&self.sample_rate.to_le_bytes());
        buf[12..16].copy_from_slice(&self.data_type.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        Metadata {
            sound_index: i32::from_le_bytes(buf[0..4].try_into().unwrap()),
            sound_file_size_in_samples: i32::from_le_bytes(buf[4..8].try_into().unwrap()),
            sample_rate: i32::from_le_bytes(buf[8..12].try_into().unwrap()),
            data_type: i32::from_le_bytes(buf[12..16].try_into().unwrap()),
        }
    }
}

// ── File-metadata block (§3) ────────────────────────────────────────────

/// The 2048-byte zero-filled-then-overwritten block of ASCII filename and
/// content regions carried by FULL and NO-DATA headers.
#[derive(Debug, Clone)]
pub struct FileMetadata {
    buf: [u8; FILE_METADATA_SIZE],
}

impl Default for FileMetadata {
    fn default() -> Self {
        FileMetadata { buf: [0u8; FILE_METADATA_SIZE] }
    }
}

impl FileMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_sound_filename(&mut self, s: &str) {
        self.write_region(SOUND_FILENAME_OFFSET, SOUND_FILENAME_MAX, s);
    }

    pub fn set_metadata_filename(&mut self, s: &str) {
        self.write_region(METADATA_FILENAME_OFFSET, METADATA_FILENAME_MAX, s);
    }

    pub fn set_description_filename(&mut self, s: &str) {
        self.write_region(DESCRIPTION_FILENAME_OFFSET, DESCRIPTION_FILENAME_MAX, s);
    }

    pub fn set_metadata_content(&mut self, s: &str) {
        self.write_region(METADATA_CONTENT_OFFSET, METADATA_CONTENT_MAX, s);
    }

    pub fn set_description_content(&mut self, s: &str) {
        self.write_region(DESCRIPTION_CONTENT_OFFSET, DESCRIPTION_CONTENT_MAX, s);
    }

    /// Bytes beyond `s`'s length are left zero; bytes beyond `max_len` are
    /// dropped (truncation), matching `original_source/soundcard_protocol.py`'s
    /// `_add_filemetadata_info`.
    fn write_region(&mut self, offset: usize, max_len: usize, s: &str) {
        let bytes = s.as_bytes();
        let n = bytes.len().min(max_len);
        self.buf[offset..offset + n].copy_from_slice(&bytes[..n]);
        for b in &mut self.buf[offset + n..offset + max_len] {
            *b = 0;
        }
    }

    pub fn as_bytes(&self) -> &[u8; FILE_METADATA_SIZE] {
        &self.buf
    }
}

// ── Header kind (client-side builder input) ────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderKind {
    Full,
    NoData,
    Min,
}

impl HeaderKind {
    pub fn frame_kind(self) -> FrameKind {
        match self {
            HeaderKind::Full => FrameKind::FullHeader,
            HeaderKind::NoData => FrameKind::NoDataHeader,
            HeaderKind::Min => FrameKind::MinHeader,
        }
    }
}

/// Build a HEADER frame. `first_block` is ignored unless `kind == Full`;
/// `file_metadata` is ignored when `kind == Min`.
pub fn pack_header(
    kind: HeaderKind,
    metadata: Metadata,
    file_metadata: Option<&FileMetadata>,
    first_block: Option<&[u8]>
) -> Vec<u8> {
    let frame_kind = kind.frame_kind();
    let (preamble, total_len): (&[u8], usize) = match kind {
        HeaderKind::Full => (&FULL_HEADER_PREAMBLE, FULL_HEADER_LEN),
        HeaderKind::NoData => (&NO_DATA_HEADER_PREAMBLE, NO_DATA_HEADER_LEN),
        HeaderKind::Min => (&MIN_HEADER_PREAMBLE, MIN_HEADER_LEN),
    };

    let mut buf = vec![0u8; total_len];
    buf[..preamble.len()].copy_from_slice(preamble);

    let metadata_offset = preamble.len();
    buf[metadata_offset..metadata_offset + METADATA_SIZE].copy_from_slice(&metadata.to_bytes());

    if frame_kind.carries_first_block() {
        let data_offset = metadata_offset + METADATA_SIZE;
        if let Some(block) = first_block {
            let n = block.len().min(DATA_BLOCK_SIZE);
            buf[data_offset..data_offset + n].copy_from_slice(&block[..n]);
        }
    }

    if frame_kind.carries_file_metadata() {
        let fm_offset = total_len - CHECKSUM_SIZE - FILE_METADATA_SIZE;
        if let Some(fm) = file_metadata {
            buf[fm_offset..fm_offset + FILE_METADATA_SIZE].copy_from_slice(fm.as_bytes());
        }
    }

    let cksum = checksum(&buf[..total_len - 1]);
    buf[total_len - 1] = cksum;
    buf
}

/// Build a DATA frame for packet `index`. `block` shorter than
/// [`DATA_BLOCK_SIZE`] is zero-padded (the final packet of a waveform).
pub fn pack_data(index: i32, block: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; DATA_FRAME_LEN];
    buf[..DATA_FRAME_PREAMBLE.len()].copy_from_slice(&DATA_FRAME_PREAMBLE);

    let index_offset = DATA_FRAME_PREAMBLE.len();
    buf[index_offset..index_offset + DATA_INDEX_SIZE].copy_from_slice(&index.to_le_bytes());

    let block_offset = index_offset + DATA_INDEX_SIZE;
    let n = block.len().min(DATA_BLOCK_SIZE);
    buf[block_offset..block_offset + n].copy_from_slice(&block[..n]);

    let cksum = checksum(&buf[..DATA_FRAME_LEN - 1]);
    buf[DATA_FRAME_LEN - 1] = cksum;
    buf
}

/// Build a 12-byte server → client reply.
pub fn pack_reply(kind_tag: u8, timestamp: [u8; TIMESTAMP_SIZE], with_error: bool) -> [u8; REPLY_LEN] {
    let mut buf = [0u8; REPLY_LEN];
    buf[0] = if with_error { 0x10 } else { 0x02 };
    buf[1] = 0x0a;
    buf[2] = kind_tag;
    buf[3] = 0xff;
    buf[4] = 0x10;
    buf[5..11].copy_from_slice(&timestamp);
    buf[REPLY_LEN - 1] = checksum(&buf[..REPLY_LEN - 1]);
    buf
}

/// Decode a 6-byte timestamp as `seconds + ticks * 32e-6`.
pub fn parse_timestamp(bytes: &[u8]) -> f64 {
    let seconds = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    let ticks = u16::from_le_bytes(bytes[4..6].try_into().unwrap());
    (seconds as f64) + (ticks as f64) * 32e-6
}

/// Encode a wall-clock timestamp (seconds since epoch) into the 6-byte
/// wire format: `floor(now)` as a u32 LE second count, plus the fractional
/// remainder quantized into 32 µs ticks, clamped to 16 bits.
pub fn build_timestamp(now: f64) -> [u8; TIMESTAMP_SIZE] {
    let seconds = now.floor();
    let frac = now - seconds;
    let ticks = (frac / 32e-6).round().clamp(0.0, u16::MAX as f64) as u16;

    let mut buf = [0u8; TIMESTAMP_SIZE];
    buf[0..4].copy_from_slice(&(seconds as u32).to_le_bytes());
    buf[4..6].copy_from_slice(&ticks.to_le_bytes());
    buf
}

// ── Receiving frames off the wire ──────────────────────────────────────

/// A frame read off the TCP stream, still in wire form. Field accessors
/// below only make sense for the matching `kind`; callers in `session.rs`
/// know which kind they asked to read.
#[derive(Debug, Clone)]
pub struct ParsedFrame {
    pub kind: FrameKind,
    bytes: Vec<u8>,
}

impl ParsedFrame {
    pub fn declared_checksum(&self) -> u8 {
        *self.bytes.last().expect("frame always has a trailing checksum byte")
    }

    pub fn is_checksum_valid(&self) -> bool {
        checksum(&self.bytes[..self.bytes.len() - 1]) == self.declared_checksum()
    }

    fn metadata_offset(&self) -> usize {
        match self.kind {
            FrameKind::MinHeader => PREAMBLE_SHORT,
            FrameKind::FullHeader | FrameKind::NoDataHeader => PREAMBLE_LONG,
            FrameKind::Data => unreachable!("data frames carry no metadata"),
        }
    }

    /// Valid for header frames only.
    pub fn metadata(&self) -> Metadata {
        let off = self.metadata_offset();
        Metadata::from_bytes(&self.bytes[off..off + METADATA_SIZE])
    }

    /// The embedded first data block, if this is a FULL header.
    pub fn first_block(&self) -> Option<&[u8]> {
        if self.kind != FrameKind::FullHeader {
            return None;
        }
        let off = self.metadata_offset() + METADATA_SIZE;
        Some(&self.bytes[off..off + DATA_BLOCK_SIZE])
    }

    /// The embedded file-metadata block, for FULL/NO-DATA headers.
    pub fn file_metadata(&self) -> Option<&[u8]> {
        match self.kind {
            FrameKind::FullHeader => {
                let off = self.metadata_offset() + METADATA_SIZE + DATA_BLOCK_SIZE;
                Some(&self.bytes[off..off + FILE_METADATA_SIZE])
            }
            FrameKind::NoDataHeader => {
                let off = self.metadata_offset() + METADATA_SIZE;
                Some(&self.bytes[off..off + FILE_METADATA_SIZE])
            }
            _ => None,
        }
    }

    /// Valid for DATA frames only.
    pub fn data_index(&self) -> i32 {
        debug_assert_eq!(self.kind, FrameKind::Data);
        i32::from_le_bytes(self.bytes[7..11].try_into().unwrap())
    }

    /// Valid for DATA frames only.
    pub fn data_block(&self) -> &[u8] {
        debug_assert_eq!(self.kind, FrameKind::Data);
        &self.bytes[11..11 + DATA_BLOCK_SIZE]
    }
}

/// Read one frame off `reader`. Always reads the 7-byte long preamble
/// first — a MIN header's 5-byte preamble plus the first two bytes of its
/// metadata region happen to occupy the same 7 bytes, so this is safe —
/// then dispatches on byte 4 (and byte 2, for the short-preamble case) to
/// learn the remaining length, and reads the rest.
///
/// Returns an `UnexpectedEof` io error on a clean disconnect or short read;
/// the caller (session.rs) maps that to [`crate::error::SessionError::ClientDisconnect`].
pub async fn parse_frame_from_stream<R: AsyncReadExt + Unpin>(
    reader: &mut R
) -> io::Result<ParsedFrame> {
    let mut head = [0u8; PREAMBLE_LONG];
    reader.read_exact(&mut head).await?;

    let (kind, total_len) = if head[4] == FrameKind::FullHeader.reply_tag() {
        (FrameKind::FullHeader, FULL_HEADER_LEN)
    } else if head[4] == FrameKind::NoDataHeader.reply_tag() {
        (FrameKind::NoDataHeader, NO_DATA_HEADER_LEN)
    } else if head[2] == FrameKind::MinHeader.reply_tag() {
        (FrameKind::MinHeader, MIN_HEADER_LEN)
    } else {
        (FrameKind::Data, DATA_FRAME_LEN)
    };

    let mut bytes = vec![0u8; total_len];
    bytes[..PREAMBLE_LONG].copy_from_slice(&head);
    reader.read_exact(&mut bytes[PREAMBLE_LONG..]).await?;

    Ok(ParsedFrame { kind, bytes })
}

/// `ceil(waveform_bytes / DATA_BLOCK_SIZE)`, with packet 0's bytes
/// understood to live inside the HEADER frame (§4.2).
pub fn total_packets(waveform_bytes: usize) -> usize {
    waveform_bytes.div_ceil(DATA_BLOCK_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_header_matches_literal_layout() {
        let metadata = Metadata {
            sound_index: 4,
            sound_file_size_in_samples: 0,
            sample_rate: 96_000,
            data_type: 0,
        };
        let frame = pack_header(HeaderKind::Min, metadata, None, None);

        assert_eq!(frame.len(), MIN_HEADER_LEN);
        assert_eq!(&frame[0..5], &MIN_HEADER_PREAMBLE);
        assert_eq!(&frame[5..9], &[4, 0, 0, 0]);
        assert_eq!(&frame[9..13], &[0, 0, 0, 0]);
        assert_eq!(&frame[13..17], &[0x00, 0x77, 0x01, 0x00]);
        assert_eq!(&frame[17..21], &[0, 0, 0, 0]);
        assert_eq!(frame[21], checksum(&frame[..21]));
    }

    #[test]
    fn full_header_matches_literal_layout() {
        let waveform = vec![0x42u8; DATA_BLOCK_SIZE];
        let metadata = Metadata {
            sound_index: 2,
            sound_file_size_in_samples: 8192,
            sample_rate: 96_000,
            data_type: 0,
        };
        let mut fm = FileMetadata::new();
        fm.set_sound_filename("a");
        fm.set_metadata_filename("b");
        fm.set_description_filename("c");
        fm.set_metadata_content("x");
        fm.set_description_content("y");

        let frame = pack_header(HeaderKind::Full, metadata, Some(&fm), Some(&waveform));

        assert_eq!(frame.len(), FULL_HEADER_LEN);
        assert_eq!(&frame[0..7], &FULL_HEADER_PREAMBLE);
        assert_eq!(&frame[7..23], &metadata.to_bytes());
        assert_eq!(&frame[23..32791], &waveform[..]);
        assert_eq!(frame[32791], b'a');
        assert_eq!(frame[32791 + 170], b'b');
        assert_eq!(*frame.last().unwrap(), checksum(&frame[..frame.len() - 1]));
    }

    #[test]
    fn data_packet_numbering_and_zero_padding() {
        let waveform: Vec<u8> = (0..98_304u32).map(|i| (i % 256) as u8).collect();
        assert_eq!(total_packets(waveform.len()), 3);

        let block1 = &waveform[DATA_BLOCK_SIZE..2 * DATA_BLOCK_SIZE];
        let pkt1 = pack_data(1, block1);
        assert_eq!(&pkt1[7..11], &[1, 0, 0, 0]);
        assert_eq!(&pkt1[11..32779], block1);

        // Final block, shorter than DATA_BLOCK_SIZE, must be zero-padded.
        let short_block = &waveform[2 * DATA_BLOCK_SIZE..2 * DATA_BLOCK_SIZE + 100];
        let pkt2 = pack_data(2, short_block);
        assert_eq!(&pkt2[7..11], &[2, 0, 0, 0]);
        assert_eq!(&pkt2[11..11 + 100], short_block);
        assert!(pkt2[11 + 100..32779].iter().all(|&b| b == 0));
    }

    #[test]
    fn checksum_round_trips_through_all_frame_builders() {
        let metadata = Metadata { sound_index: 1, sound_file_size_in_samples: 1, sample_rate: 1, data_type: 1 };
        for frame in [
            pack_header(HeaderKind::Full, metadata, Some(&FileMetadata::new()), Some(&[0u8; DATA_BLOCK_SIZE])),
            pack_header(HeaderKind::NoData, metadata, Some(&FileMetadata::new()), None),
            pack_header(HeaderKind::Min, metadata, None, None),
            pack_data(0, &[7u8; DATA_BLOCK_SIZE]),
        ] {
            let cksum = checksum(&frame[..frame.len() - 1]);
            assert_eq!(*frame.last().unwrap(), cksum);
        }
    }

    #[test]
    fn file_metadata_truncates_and_zero_fills() {
        let mut fm = FileMetadata::new();
        let long = "x".repeat(SOUND_FILENAME_MAX + 50);
        fm.set_sound_filename(&long);
        let bytes = fm.as_bytes();
        assert_eq!(&bytes[0..SOUND_FILENAME_MAX], vec![b'x'; SOUND_FILENAME_MAX].as_slice());
        // Next region starts untouched (zero).
        assert_eq!(bytes[METADATA_FILENAME_OFFSET], 0);

        let mut fm2 = FileMetadata::new();
        fm2.set_sound_filename("hi");
        let bytes2 = fm2.as_bytes();
        assert_eq!(&bytes2[0..2], b"hi");
        assert!(bytes2[2..SOUND_FILENAME_MAX].iter().all(|&b| b == 0));
    }

    #[test]
    fn timestamp_round_trips_within_one_tick() {
        for t in [0.0, 1.0, 12345.678, 4_294_967_295.0] {
            let encoded = build_timestamp(t);
            let decoded = parse_timestamp(&encoded);
            assert!((decoded - t).abs() < 32e-6);
        }
    }

    #[tokio::test]
    async fn parse_frame_from_stream_reads_each_kind() {
        let metadata = Metadata { sound_index: 1, sound_file_size_in_samples: 1, sample_rate: 1, data_type: 1 };

        let min = pack_header(HeaderKind::Min, metadata, None, None);
        let mut cursor = std::io::Cursor::new(min.clone());
        let parsed = parse_frame_from_stream(&mut cursor).await.unwrap();
        assert_eq!(parsed.kind, FrameKind::MinHeader);
        assert!(parsed.is_checksum_valid());
        assert_eq!(parsed.metadata(), metadata);

        let data = pack_data(5, &[9u8; DATA_BLOCK_SIZE]);
        let mut cursor = std::io::Cursor::new(data);
        let parsed = parse_frame_from_stream(&mut cursor).await.unwrap();
        assert_eq!(parsed.kind, FrameKind::Data);
        assert_eq!(parsed.data_index(), 5);
        assert!(parsed.data_block().iter().all(|&b| b == 9));
    }

    #[tokio::test]
    async fn parse_frame_from_stream_reports_disconnect_on_short_read() {
        let mut cursor = std::io::Cursor::new(vec![0x02, 0x14, 0x82]);
        let err = parse_frame_from_stream(&mut cursor).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn checksum_rejection_is_detectable() {
        let metadata = Metadata { sound_index: 2, sound_file_size_in_samples: 8192, sample_rate: 96_000, data_type: 0 };
        let mut frame = pack_header(
            HeaderKind::Full,
            metadata,
            Some(&FileMetadata::new()),
            Some(&[0u8; DATA_BLOCK_SIZE])
        );
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        assert!(!ParsedFrame { kind: FrameKind::FullHeader, bytes: frame }.is_checksum_valid());
    }
}
