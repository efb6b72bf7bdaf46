//! On-flash encoding of one table generation: bitmap bytes followed by a
//! trailer (magic pattern, version, integrity hash), padded to an even number
//! of pages.

use deku::prelude::*;

use super::bitmap::StatusBitmap;
use crate::nand::NandLayout;

/// Sentinel: no generation here / slot must never be touched
pub const VERSION_INVALID: u32 = 0xFFFF_FFFF;

/// Sentinel: read failed or pattern/hash mismatch; the slot may be unreliable
pub const VERSION_BLOCK_ABNORMAL: u32 = VERSION_INVALID - 1;

/// Upper bound on legitimate versions, leaving headroom below the sentinels
/// for the updater's arithmetic
pub const VERSION_MAX: u32 = VERSION_INVALID - 8;

const TABLE_PATTERN: [u8; 4] = *b"Bbt0";

pub(crate) const TRAILER_BYTES: usize = 12;

/// Rolling, order-sensitive checksum over a byte buffer. Corruption
/// detection only, not cryptographic.
pub(crate) fn js_hash(buf: &[u8]) -> u32 {
    let mut hash: u32 = 0x47C6_A7E6;
    for &byte in buf {
        hash ^= hash
            .wrapping_shl(5)
            .wrapping_add(byte as u32)
            .wrapping_add(hash >> 2);
    }
    hash
}

fn hash_matches(buf: &[u8], stored: u32) -> bool {
    // generations written before hashing existed store 0 or all-ones here
    if stored == 0 || stored == 0xFFFF_FFFF {
        return true;
    }
    js_hash(buf) == stored
}

#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
struct TableTrailer {
    pattern: [u8; 4],
    version: u32,
    hash: u32,
}

/// Byte/page counts of one encoded generation for a given device layout
#[derive(Debug, Copy, Clone)]
pub(crate) struct PayloadShape {
    pub bitmap_bytes: usize,
    pub pages: u32,
    pub data_len: usize,
    pub oob_len: usize,
}

pub(crate) fn payload_shape(layout: &NandLayout, bitmap_bytes: usize) -> PayloadShape {
    let pages = (bitmap_bytes + TRAILER_BYTES).div_ceil(layout.bytes_per_page) as u32;
    // some NAND controllers require paired page writes
    let pages = (pages + 1) / 2 * 2;

    PayloadShape {
        bitmap_bytes,
        pages,
        data_len: pages as usize * layout.bytes_per_page,
        oob_len: pages as usize * layout.oob_per_page,
    }
}

/// Serialize `bitmap` as a generation numbered `version`, returning the data
/// and OOB buffers to program. The hash covers the bitmap bytes, pattern,
/// and version; the hash field itself is excluded.
pub(crate) fn encode(
    bitmap: &StatusBitmap,
    version: u32,
    shape: &PayloadShape,
) -> anyhow::Result<(Vec<u8>, Vec<u8>)> {
    let mut data = vec![0u8; shape.data_len];
    data[..shape.bitmap_bytes].copy_from_slice(&bitmap.to_bytes());

    let trailer = TableTrailer {
        pattern: TABLE_PATTERN,
        version,
        hash: 0,
    };
    data[shape.bitmap_bytes..][..TRAILER_BYTES].copy_from_slice(&trailer.to_bytes()?);

    let hashed_len = shape.bitmap_bytes + TRAILER_BYTES - 4;
    let hash = js_hash(&data[..hashed_len]);
    data[hashed_len..][..4].copy_from_slice(&hash.to_le_bytes());

    Ok((data, vec![0u8; shape.oob_len]))
}

/// Result of decoding one slot's payload
#[derive(Debug, Eq, PartialEq)]
pub(crate) enum DecodedTable {
    /// No recognizable generation; the expected case for a never-written or
    /// foreign block
    Absent,

    /// A generation was started here but cannot be trusted
    Abnormal,

    /// A well-formed generation
    Valid { version: u32 },
}

pub(crate) fn decode(data: &[u8], oob: &[u8], shape: &PayloadShape) -> DecodedTable {
    let Ok((_, trailer)) = TableTrailer::from_bytes((&data[shape.bitmap_bytes..], 0)) else {
        return DecodedTable::Absent;
    };

    if trailer.pattern != TABLE_PATTERN {
        return DecodedTable::Absent;
    }

    let hashed = &data[..shape.bitmap_bytes + TRAILER_BYTES - 4];
    if oob.first() == Some(&0xFF)
        || !hash_matches(hashed, trailer.hash)
        || trailer.version > VERSION_MAX
    {
        return DecodedTable::Abnormal;
    }

    DecodedTable::Valid {
        version: trailer.version,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bbt::bitmap::BlockStatus;

    const LAYOUT: NandLayout = NandLayout {
        blocks: 64,
        pages_per_block: 4,
        bytes_per_page: 64,
        oob_per_page: 16,
        reserved_blocks: 4,
    };

    fn test_bitmap() -> StatusBitmap {
        let mut bitmap = StatusBitmap::new(LAYOUT.blocks);
        bitmap.set(3, BlockStatus::FactoryBad).unwrap();
        bitmap.set(17, BlockStatus::Worn).unwrap();
        bitmap.set(63, BlockStatus::Good).unwrap();
        bitmap
    }

    fn test_shape() -> PayloadShape {
        payload_shape(&LAYOUT, test_bitmap().byte_len())
    }

    #[test]
    fn test_trailer_size() {
        let trailer = TableTrailer {
            pattern: TABLE_PATTERN,
            version: 1,
            hash: 2,
        };
        assert_eq!(trailer.to_bytes().unwrap().len(), TRAILER_BYTES);
    }

    #[test]
    fn test_shape_even_pages() {
        // 64 blocks -> 16 bitmap bytes, + 12 trailer = 28 bytes, < 1 page
        let shape = test_shape();
        assert_eq!(shape.pages, 2);
        assert_eq!(shape.data_len, 128);
        assert_eq!(shape.oob_len, 32);

        // barely spilling into a third page still rounds up to four
        let mut layout = LAYOUT;
        layout.bytes_per_page = 16;
        let shape = payload_shape(&layout, 16 + 16);
        assert_eq!(shape.pages, 4);
    }

    #[test]
    fn test_hash_deterministic_and_sensitive() {
        let buf: Vec<u8> = (0u16..512).map(|x| (x % 251) as u8).collect();
        let hash = js_hash(&buf);
        assert_eq!(hash, js_hash(&buf));

        for flip in [0, 1, 255, 511] {
            let mut corrupted = buf.clone();
            corrupted[flip] ^= 0x01;
            assert_ne!(hash, js_hash(&corrupted), "flip at {flip}");
        }
    }

    #[test]
    fn test_hash_compat_sentinels() {
        let buf = [1, 2, 3, 4];
        assert!(hash_matches(&buf, 0));
        assert!(hash_matches(&buf, 0xFFFF_FFFF));
        assert!(hash_matches(&buf, js_hash(&buf)));
        assert!(!hash_matches(&buf, js_hash(&buf) ^ 1));
    }

    #[test]
    fn test_roundtrip() {
        let bitmap = test_bitmap();
        let shape = test_shape();

        for version in [1, 7, VERSION_MAX] {
            let (data, oob) = encode(&bitmap, version, &shape).unwrap();
            assert_eq!(data.len(), shape.data_len);
            assert_eq!(oob.len(), shape.oob_len);
            assert_eq!(decode(&data, &oob, &shape), DecodedTable::Valid { version });
            assert_eq!(&data[..shape.bitmap_bytes], &bitmap.to_bytes()[..]);
        }
    }

    #[test]
    fn test_decode_absent() {
        let shape = test_shape();
        let oob = vec![0u8; shape.oob_len];

        // erased block
        let erased = vec![0xFFu8; shape.data_len];
        assert_eq!(decode(&erased, &oob, &shape), DecodedTable::Absent);

        // foreign content without the pattern
        let foreign = vec![0x42u8; shape.data_len];
        assert_eq!(decode(&foreign, &oob, &shape), DecodedTable::Absent);
    }

    #[test]
    fn test_decode_abnormal() {
        let bitmap = test_bitmap();
        let shape = test_shape();
        let (data, oob) = encode(&bitmap, 9, &shape).unwrap();

        // bitmap corruption breaks the hash
        let mut corrupted = data.clone();
        corrupted[0] ^= 0xFF;
        assert_eq!(decode(&corrupted, &oob, &shape), DecodedTable::Abnormal);

        // an unwritten OOB marks an interrupted program
        let mut blank_oob = oob.clone();
        blank_oob[0] = 0xFF;
        assert_eq!(decode(&data, &blank_oob, &shape), DecodedTable::Abnormal);

        // versions in the sentinel range can never come from a legitimate write
        let (data, oob) = encode(&bitmap, VERSION_MAX + 1, &shape).unwrap();
        assert_eq!(decode(&data, &oob, &shape), DecodedTable::Abnormal);
    }
}
