//! Resumable Ogg page parser.
//!
//! Bytes are pushed in arbitrary chunks; complete pages are handed out as
//! soon as all of their bytes have arrived. Packets that span page
//! boundaries are stitched together, so callers only ever see whole packets.

use log::{debug, trace};

pub const CAPTURE_PATTERN: &[u8; 4] = b"OggS";
pub const HEADER_LEN: usize = 27;

pub const FLAG_CONTINUED: u8 = 0x01;
pub const FLAG_BOS: u8 = 0x02;
pub const FLAG_EOS: u8 = 0x04;

const CRC_OFFSET: usize = 22;
const CRC_TABLE: [u32; 256] = build_crc_table();

const fn build_crc_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut r = (i as u32) << 24;
        let mut j = 0;
        while j < 8 {
            r = if r & 0x8000_0000 != 0 {
                (r << 1) ^ 0x04c1_1db7
            } else {
                r << 1
            };
            j += 1;
        }
        table[i] = r;
        i += 1;
    }
    table
}

fn crc32_update(mut crc: u32, data: &[u8]) -> u32 {
    for &byte in data {
        crc = (crc << 8) ^ CRC_TABLE[((crc >> 24) as u8 ^ byte) as usize];
    }
    crc
}

/// Ogg page checksum, computed with the checksum field itself zeroed
pub fn page_checksum(page: &[u8]) -> u32 {
    let crc = crc32_update(0, &page[..CRC_OFFSET]);
    let crc = crc32_update(crc, &[0u8; 4]);
    crc32_update(crc, &page[CRC_OFFSET + 4..])
}

/// One parsed page with the packets that were completed on it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OggPage {
    pub flags: u8,
    pub granule_position: u64,
    pub serial: u32,
    pub sequence: u32,
    pub packets: Vec<Vec<u8>>,
}

impl OggPage {
    pub fn is_eos(&self) -> bool {
        self.flags & FLAG_EOS != 0
    }
}

enum Scan {
    NeedMore,
    Resync(usize),
    Page(usize),
}

#[derive(Debug, Default)]
pub struct OggPageReader {
    pending: Vec<u8>,
    serial: Option<u32>,
    partial_packet: Vec<u8>,
    bytes_skipped: u64,
}

impl OggPageReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue newly arrived bytes
    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Bytes received but not yet consumed as part of a page
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Bytes discarded while hunting for a valid page
    pub fn bytes_skipped(&self) -> u64 {
        self.bytes_skipped
    }

    pub fn serial(&self) -> Option<u32> {
        self.serial
    }

    /// Drop all state so a new stream can be read
    pub fn reset(&mut self) {
        self.pending.clear();
        self.serial = None;
        self.partial_packet.clear();
        self.bytes_skipped = 0;
    }

    /// Parse the next complete page, or `None` when more bytes are needed
    pub fn next_page(&mut self) -> Option<OggPage> {
        loop {
            match self.scan() {
                Scan::NeedMore => return None,
                Scan::Resync(skip) => {
                    self.bytes_skipped += skip as u64;
                    self.pending.drain(..skip);
                }
                Scan::Page(len) => {
                    let page = self.assemble(len);
                    self.pending.drain(..len);
                    if let Some(page) = page {
                        return Some(page);
                    }
                }
            }
        }
    }

    fn scan(&self) -> Scan {
        let data = &self.pending;

        let start = match data.windows(4).position(|w| w == CAPTURE_PATTERN) {
            Some(start) => start,
            // Keep a possible partial capture pattern at the tail
            None => return match data.len().saturating_sub(3) {
                0 => Scan::NeedMore,
                skip => Scan::Resync(skip),
            },
        };
        if start > 0 {
            return Scan::Resync(start);
        }

        if data.len() < HEADER_LEN {
            return Scan::NeedMore;
        }
        if data[4] != 0 {
            trace!("Unknown Ogg stream version {}, resyncing", data[4]);
            return Scan::Resync(1);
        }

        let segment_count = data[26] as usize;
        let header_len = HEADER_LEN + segment_count;
        if data.len() < header_len {
            return Scan::NeedMore;
        }

        let body_len: usize = data[HEADER_LEN..header_len].iter().map(|&l| l as usize).sum();
        let page_len = header_len + body_len;
        if data.len() < page_len {
            return Scan::NeedMore;
        }

        let stored = u32::from_le_bytes([data[22], data[23], data[24], data[25]]);
        if page_checksum(&data[..page_len]) != stored {
            debug!("Ogg page checksum mismatch, resyncing");
            return Scan::Resync(1);
        }

        Scan::Page(page_len)
    }

    /// Build a page from the first `len` pending bytes.
    ///
    /// Returns `None` for pages of a foreign logical stream.
    fn assemble(&mut self, len: usize) -> Option<OggPage> {
        let data = &self.pending[..len];
        let flags = data[5];
        let granule_position = u64::from_le_bytes([
            data[6], data[7], data[8], data[9], data[10], data[11], data[12], data[13],
        ]);
        let serial = u32::from_le_bytes([data[14], data[15], data[16], data[17]]);
        let sequence = u32::from_le_bytes([data[18], data[19], data[20], data[21]]);

        match self.serial {
            None => self.serial = Some(serial),
            Some(locked) if locked != serial => {
                trace!("Skipping page of logical stream {:08x}", serial);
                return None;
            }
            Some(_) => {}
        }

        let segment_count = data[26] as usize;
        let lacing = &data[HEADER_LEN..HEADER_LEN + segment_count];
        let mut body = &data[HEADER_LEN + segment_count..];

        let continued = flags & FLAG_CONTINUED != 0;
        let mut discard_continuation = false;
        if continued && self.partial_packet.is_empty() {
            // Joined mid-packet; the tail of it is useless
            discard_continuation = true;
        } else if !continued && !self.partial_packet.is_empty() {
            debug!("Dropping {} bytes of an unterminated packet", self.partial_packet.len());
            self.partial_packet.clear();
        }

        let mut packets = Vec::new();
        for &segment in lacing {
            let (chunk, rest) = body.split_at(segment as usize);
            body = rest;

            if !discard_continuation {
                self.partial_packet.extend_from_slice(chunk);
            }
            if segment < 255 {
                if discard_continuation {
                    discard_continuation = false;
                } else {
                    packets.push(std::mem::take(&mut self.partial_packet));
                }
            }
        }

        if flags & FLAG_EOS != 0 {
            self.partial_packet.clear();
        }

        Some(OggPage {
            flags,
            granule_position,
            serial,
            sequence,
            packets,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ogg_page;

    #[test]
    fn test_checksum_of_known_page() {
        // Checksum verifies against the value written into the page
        let page = ogg_page(7, 0, FLAG_BOS, 0, &[b"hello"]);
        let stored = u32::from_le_bytes([page[22], page[23], page[24], page[25]]);
        assert_eq!(page_checksum(&page), stored);
        assert_ne!(stored, 0);
    }

    #[test]
    fn test_single_page_single_packet() {
        let mut reader = OggPageReader::new();
        reader.push(&ogg_page(1, 0, FLAG_BOS, 0, &[b"abc"]));

        let page = reader.next_page().unwrap();
        assert_eq!(page.flags, FLAG_BOS);
        assert_eq!(page.packets, vec![b"abc".to_vec()]);
        assert_eq!(reader.serial(), Some(1));
        assert!(reader.next_page().is_none());
    }

    #[test]
    fn test_page_split_across_pushes() {
        let bytes = ogg_page(1, 0, 0, 42, &[b"first", b"second"]);
        let mut reader = OggPageReader::new();

        for byte in &bytes[..bytes.len() - 1] {
            reader.push(std::slice::from_ref(byte));
            assert!(reader.next_page().is_none());
        }
        reader.push(&bytes[bytes.len() - 1..]);

        let page = reader.next_page().unwrap();
        assert_eq!(page.granule_position, 42);
        assert_eq!(page.packets.len(), 2);
        assert_eq!(page.packets[1], b"second".to_vec());
    }

    #[test]
    fn test_packet_spanning_pages() {
        let big = vec![9u8; 600];
        let mut bytes = Vec::new();
        // 600 = 255 + 255 + 90; split after the first two full segments
        bytes.extend(crate::test_support::ogg_page_raw(1, 0, 0, 0, &[255, 255], &big[..510]));
        bytes.extend(crate::test_support::ogg_page_raw(1, 1, FLAG_CONTINUED, 0, &[90], &big[510..]));

        let mut reader = OggPageReader::new();
        reader.push(&bytes);

        let first = reader.next_page().unwrap();
        assert!(first.packets.is_empty());
        let second = reader.next_page().unwrap();
        assert_eq!(second.packets, vec![big]);
    }

    #[test]
    fn test_resync_after_garbage_and_bad_checksum() {
        let mut corrupt = ogg_page(1, 0, FLAG_BOS, 0, &[b"lost"]);
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0xff;

        let mut bytes = b"garbage".to_vec();
        bytes.extend(corrupt);
        bytes.extend(ogg_page(1, 1, 0, 0, &[b"kept"]));

        let mut reader = OggPageReader::new();
        reader.push(&bytes);

        let page = reader.next_page().unwrap();
        assert_eq!(page.packets, vec![b"kept".to_vec()]);
        assert!(reader.bytes_skipped() >= 7);
    }

    #[test]
    fn test_foreign_stream_is_ignored() {
        let mut bytes = ogg_page(1, 0, FLAG_BOS, 0, &[b"mine"]);
        bytes.extend(ogg_page(2, 0, FLAG_BOS, 0, &[b"theirs"]));
        bytes.extend(ogg_page(1, 1, FLAG_EOS, 0, &[b"end"]));

        let mut reader = OggPageReader::new();
        reader.push(&bytes);

        assert_eq!(reader.next_page().unwrap().packets, vec![b"mine".to_vec()]);
        let last = reader.next_page().unwrap();
        assert!(last.is_eos());
        assert_eq!(last.packets, vec![b"end".to_vec()]);
    }

    #[test]
    fn test_continuation_without_start_is_discarded() {
        let bytes = crate::test_support::ogg_page_raw(1, 5, FLAG_CONTINUED, 0, &[3, 2], b"xyzok");
        let mut reader = OggPageReader::new();
        reader.push(&bytes);

        let page = reader.next_page().unwrap();
        assert_eq!(page.packets, vec![b"ok".to_vec()]);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut reader = OggPageReader::new();
        reader.push(&ogg_page(1, 0, 0, 0, &[b"a"])[..10]);
        reader.reset();
        assert_eq!(reader.buffered(), 0);
        assert_eq!(reader.serial(), None);
    }
}
