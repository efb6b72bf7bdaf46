//! The in-memory table: one fixed-width status code per erase block, packed
//! into an array of words.

use super::BbtError;

/// Width of one packed status entry, in bits
pub const STATUS_BITS: u32 = 2;

const WORD_BITS: u32 = u64::BITS;

/// These are the states an erase block may be recorded in
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum BlockStatus {
    /// Not yet classified
    Unknown,

    /// Known usable
    Good,

    /// Retired from user data, e.g. reserved for table storage
    Worn,

    /// Defective as shipped by the manufacturer
    FactoryBad,
}

impl BlockStatus {
    fn from_bits(bits: u64) -> Self {
        match bits & 0b11 {
            0b00 => Self::Unknown,
            0b01 => Self::Good,
            0b10 => Self::Worn,
            _ => Self::FactoryBad,
        }
    }

    fn to_bits(self) -> u64 {
        match self {
            Self::Unknown => 0b00,
            Self::Good => 0b01,
            Self::Worn => 0b10,
            Self::FactoryBad => 0b11,
        }
    }
}

/// A packed array of `BITS`-wide entries over 64-bit words.
///
/// An entry occupies bits `[entry * BITS, entry * BITS + BITS)` of the array
/// and may straddle two adjacent words when `BITS` does not divide the word
/// width evenly.
#[derive(Debug, Clone)]
pub(crate) struct PackedWords<const BITS: u32> {
    words: Box<[u64]>,
    entries: u32,
}

impl<const BITS: u32> PackedWords<BITS> {
    const MASK: u64 = (1u64 << BITS) - 1;

    pub fn new(entries: u32) -> Self {
        let bits = entries as u64 * BITS as u64;
        let nwords = bits.div_ceil(WORD_BITS as u64) as usize;

        Self {
            words: vec![0; nwords].into_boxed_slice(),
            entries,
        }
    }

    pub fn get(&self, entry: u32) -> Option<u64> {
        if entry >= self.entries {
            return None;
        }

        let bit = entry as u64 * BITS as u64;
        let word = (bit / WORD_BITS as u64) as usize;
        let offs = (bit % WORD_BITS as u64) as u32;

        let mut val = self.words[word] >> offs;
        if offs + BITS > WORD_BITS {
            val |= self.words[word + 1] << (WORD_BITS - offs);
        }

        Some(val & Self::MASK)
    }

    pub fn set(&mut self, entry: u32, val: u64) -> Option<()> {
        if entry >= self.entries {
            return None;
        }

        let val = val & Self::MASK;
        let bit = entry as u64 * BITS as u64;
        let word = (bit / WORD_BITS as u64) as usize;
        let offs = (bit % WORD_BITS as u64) as u32;

        self.words[word] = (self.words[word] & !(Self::MASK << offs)) | (val << offs);
        if offs + BITS > WORD_BITS {
            let rbits = WORD_BITS - offs;
            self.words[word + 1] = (self.words[word + 1] & !(Self::MASK >> rbits)) | (val >> rbits);
        }

        Some(())
    }

    pub fn clear(&mut self) {
        self.words.fill(0);
    }

    /// Length of the word-aligned byte form of this array
    pub fn byte_len(&self) -> usize {
        self.words.len() * (WORD_BITS / 8) as usize
    }

    /// Serialize the words in order, each little-endian
    pub fn to_bytes(&self) -> Vec<u8> {
        self.words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    /// Replace the array contents with a byte form produced by [`Self::to_bytes`]
    pub fn load_bytes(&mut self, bytes: &[u8]) {
        debug_assert_eq!(bytes.len(), self.byte_len());
        for (word, chunk) in self.words.iter_mut().zip(bytes.chunks_exact(8)) {
            *word = u64::from_le_bytes(chunk.try_into().unwrap());
        }
    }
}

/// The per-block status table, indexed by erase block.
///
/// This is the single in-memory source of truth for block status; every
/// consumer goes through [`get`](Self::get)/[`set`](Self::set).
#[derive(Debug, Clone)]
pub struct StatusBitmap {
    cache: PackedWords<STATUS_BITS>,
}

impl StatusBitmap {
    pub(crate) fn new(nblocks: u32) -> Self {
        Self {
            cache: PackedWords::new(nblocks),
        }
    }

    /// How many erase blocks this table covers
    pub fn entries(&self) -> u32 {
        self.cache.entries
    }

    pub fn get(&self, entry: u32) -> Result<BlockStatus, BbtError> {
        self.cache
            .get(entry)
            .map(BlockStatus::from_bits)
            .ok_or(BbtError::OutOfRange(entry))
    }

    pub fn set(&mut self, entry: u32, status: BlockStatus) -> Result<(), BbtError> {
        self.cache
            .set(entry, status.to_bits())
            .ok_or(BbtError::OutOfRange(entry))
    }

    pub(crate) fn clear(&mut self) {
        self.cache.clear();
    }

    pub(crate) fn byte_len(&self) -> usize {
        self.cache.byte_len()
    }

    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        self.cache.to_bytes()
    }

    pub(crate) fn load_bytes(&mut self, bytes: &[u8]) {
        self.cache.load_bytes(bytes);
    }
}

#[cfg(test)]
const ALL_STATUSES: [BlockStatus; 4] = [
    BlockStatus::Unknown,
    BlockStatus::Good,
    BlockStatus::Worn,
    BlockStatus::FactoryBad,
];

#[test]
fn test_bitmap_roundtrip() {
    // 67 entries: the last word is only partly used
    let mut bitmap = StatusBitmap::new(67);

    for status in ALL_STATUSES {
        for entry in 0..67 {
            bitmap.set(entry, status).unwrap();
            assert_eq!(bitmap.get(entry).unwrap(), status);
        }
    }
}

#[test]
fn test_bitmap_preserves_neighbors() {
    let mut bitmap = StatusBitmap::new(64);

    for entry in 0..64 {
        bitmap.set(entry, ALL_STATUSES[entry as usize % 4]).unwrap();
    }
    bitmap.set(13, BlockStatus::FactoryBad).unwrap();

    for entry in 0..64 {
        let expected = if entry == 13 {
            BlockStatus::FactoryBad
        } else {
            ALL_STATUSES[entry as usize % 4]
        };
        assert_eq!(bitmap.get(entry).unwrap(), expected);
    }
}

#[test]
fn test_bitmap_range() {
    let mut bitmap = StatusBitmap::new(16);

    assert!(matches!(bitmap.get(16), Err(BbtError::OutOfRange(16))));
    assert!(matches!(
        bitmap.set(16, BlockStatus::Good),
        Err(BbtError::OutOfRange(16))
    ));
    assert!(matches!(bitmap.get(u32::MAX), Err(BbtError::OutOfRange(_))));
    assert!(bitmap.get(15).is_ok());
}

#[test]
fn test_packed_straddles_word_boundary() {
    // 3-bit entries over 64-bit words: entry 21 occupies bits 63..66
    let mut packed = PackedWords::<3>::new(64);

    for entry in 0..64 {
        packed.set(entry, (entry as u64 * 3) % 8).unwrap();
    }
    for entry in 0..64 {
        assert_eq!(packed.get(entry).unwrap(), (entry as u64 * 3) % 8);
    }

    packed.set(21, 0b101).unwrap();
    assert_eq!(packed.get(21).unwrap(), 0b101);
    assert_eq!(packed.get(20).unwrap(), (20 * 3) % 8);
    assert_eq!(packed.get(22).unwrap(), (22 * 3) % 8);

    // 5-bit entries: entry 12 occupies bits 60..65
    let mut packed = PackedWords::<5>::new(100);
    packed.set(12, 0b10011).unwrap();
    packed.set(11, 0b01100).unwrap();
    packed.set(13, 0b11111).unwrap();
    assert_eq!(packed.get(12).unwrap(), 0b10011);
    assert_eq!(packed.get(11).unwrap(), 0b01100);
    assert_eq!(packed.get(13).unwrap(), 0b11111);
    assert_eq!(packed.get(100), None);
}

#[test]
fn test_bitmap_byte_form() {
    let mut bitmap = StatusBitmap::new(64);
    assert_eq!(bitmap.byte_len(), 16);

    bitmap.set(0, BlockStatus::Good).unwrap();
    bitmap.set(63, BlockStatus::FactoryBad).unwrap();
    let bytes = bitmap.to_bytes();
    assert_eq!(bytes.len(), 16);
    assert_eq!(bytes[0], 0b01);

    let mut restored = StatusBitmap::new(64);
    restored.load_bytes(&bytes);
    assert_eq!(restored.get(0).unwrap(), BlockStatus::Good);
    assert_eq!(restored.get(63).unwrap(), BlockStatus::FactoryBad);
    assert_eq!(restored.get(1).unwrap(), BlockStatus::Unknown);
}
