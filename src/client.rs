//! Client-side frame builder: turns a waveform plus user metadata into the
//! same TCP frames the server expects (§4.2). Holds only a borrowed view of
//! the waveform — it never copies the samples, it only slices them.

use crate::wire::{
    self,
    FileMetadata,
    HeaderKind,
    Metadata,
    DATA_BLOCK_SIZE,
};

/// Assembles the HEADER frame and the stream of DATA frames for one upload,
/// over a borrowed `&[u8]` view of the waveform (§3, §9 "dynamic buffer
/// views"). Mirrors `original_source/soundcard_protocol.py`'s append-style
/// setter API; unlike the Python original, each `build_*` call returns a
/// freshly owned `Vec<u8>` rather than mutating a shared scratch buffer.
pub struct SoundCardFrameBuilder<'a> {
    waveform: &'a [u8],
    metadata: Metadata,
    file_metadata: FileMetadata,
}

impl<'a> SoundCardFrameBuilder<'a> {
    /// `waveform` must be a multiple of 4 bytes (stereo 16-bit samples).
    pub fn new(waveform: &'a [u8], metadata: Metadata) -> Self {
        debug_assert_eq!(waveform.len() % 4, 0, "waveform byte length must be a multiple of 4");
        SoundCardFrameBuilder {
            waveform,
            metadata,
            file_metadata: FileMetadata::new(),
        }
    }

    /// Number of samples in the waveform (`bytes / 4`).
    pub fn sound_file_size_in_samples(&self) -> usize {
        self.waveform.len() / 4
    }

    /// `ceil(waveform_bytes / DATA_BLOCK_SIZE)` — packet 0's bytes live
    /// inside the HEADER frame when `with_data=true`.
    pub fn total_packets(&self) -> usize {
        wire::total_packets(self.waveform.len())
    }

    pub fn set_metadata(&mut self, metadata: Metadata) {
        self.metadata = metadata;
    }

    pub fn set_sound_filename(&mut self, s: &str) {
        self.file_metadata.set_sound_filename(s);
    }

    pub fn set_metadata_filename(&mut self, s: &str) {
        self.file_metadata.set_metadata_filename(s);
    }

    pub fn set_description_filename(&mut self, s: &str) {
        self.file_metadata.set_description_filename(s);
    }

    pub fn set_metadata_content(&mut self, s: &str) {
        self.file_metadata.set_metadata_content(s);
    }

    pub fn set_description_content(&mut self, s: &str) {
        self.file_metadata.set_description_content(s);
    }

    /// Build the HEADER frame. `with_data=false` omits the first data block
    /// (the client must then send packet 0 as an ordinary DATA frame);
    /// `with_file_metadata=false` drops down to the MIN header shape.
    pub fn build_header(&self, with_data: bool, with_file_metadata: bool) -> Vec<u8> {
        let kind = match (with_data, with_file_metadata) {
            (_, false) => HeaderKind::Min,
            (true, true) => HeaderKind::Full,
            (false, true) => HeaderKind::NoData,
        };

        let first_block = if with_data {
            Some(&self.waveform[..self.waveform.len().min(DATA_BLOCK_SIZE)])
        } else {
            None
        };
        let fm = if with_file_metadata { Some(&self.file_metadata) } else { None };

        wire::pack_header(kind, self.metadata, fm, first_block)
    }

    /// Build the DATA frame for packet `index`, `index in [1, total_packets)`.
    /// The final packet's block is zero-padded by [`wire::pack_data`] when
    /// the waveform ends mid-block.
    pub fn build_data_packet(&self, index: i32) -> Vec<u8> {
        let start = (index as usize) * DATA_BLOCK_SIZE;
        let end = (start + DATA_BLOCK_SIZE).min(self.waveform.len());
        let block = if start < self.waveform.len() { &self.waveform[start..end] } else { &[] };
        wire::pack_data(index, block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(samples: i32) -> Metadata {
        Metadata { sound_index: 4, sound_file_size_in_samples: samples, sample_rate: 96_000, data_type: 0 }
    }

    #[test]
    fn total_packets_matches_ceil_division() {
        let waveform = vec![0u8; 98_304];
        let builder = SoundCardFrameBuilder::new(&waveform, metadata(24_576));
        assert_eq!(builder.total_packets(), 3);
        assert_eq!(builder.sound_file_size_in_samples(), 24_576);
    }

    #[test]
    fn full_header_embeds_metadata_and_files() {
        let waveform = vec![0x42u8; DATA_BLOCK_SIZE];
        let mut builder = SoundCardFrameBuilder::new(&waveform, metadata(8192));
        builder.set_sound_filename("a");
        builder.set_metadata_filename("b");

        let header = builder.build_header(true, true);
        assert_eq!(header.len(), wire::FULL_HEADER_LEN);
        assert_eq!(&header[0..7], &wire::FULL_HEADER_PREAMBLE);
        assert_eq!(header[32791], b'a');
        assert_eq!(header[32791 + 170], b'b');
        assert_eq!(*header.last().unwrap(), wire::checksum(&header[..header.len() - 1]));
    }

    #[test]
    fn min_header_drops_data_and_file_metadata() {
        let waveform = vec![0u8; DATA_BLOCK_SIZE];
        let builder = SoundCardFrameBuilder::new(&waveform, metadata(8192));
        let header = builder.build_header(false, false);
        assert_eq!(header.len(), wire::MIN_HEADER_LEN);
        assert_eq!(&header[0..5], &wire::MIN_HEADER_PREAMBLE);
    }

    #[test]
    fn data_packets_cover_the_waveform_with_final_zero_padding() {
        let waveform: Vec<u8> = (0..98_304u32).map(|i| (i % 256) as u8).collect();
        let builder = SoundCardFrameBuilder::new(&waveform, metadata(24_576));

        let pkt1 = builder.build_data_packet(1);
        assert_eq!(&pkt1[7..11], &1i32.to_le_bytes());
        assert_eq!(&pkt1[11..11 + DATA_BLOCK_SIZE], &waveform[DATA_BLOCK_SIZE..2 * DATA_BLOCK_SIZE]);

        // Waveform is exactly 3 blocks here, so packet 2 is still full; shrink
        // the waveform by truncating the builder's view to exercise padding.
        let short_waveform = &waveform[..2 * DATA_BLOCK_SIZE + 100];
        let short_builder = SoundCardFrameBuilder::new(short_waveform, metadata(short_waveform.len() as i32 / 4));
        let pkt2 = short_builder.build_data_packet(2);
        assert_eq!(&pkt2[11..11 + 100], &short_waveform[2 * DATA_BLOCK_SIZE..]);
        assert!(pkt2[11 + 100..wire::DATA_FRAME_LEN - 1].iter().all(|&b| b == 0));
    }
}
