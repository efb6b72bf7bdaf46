//! This module contains code to read the reserved slots and recover the most
//! recent valid table generation.

use log::{debug, warn};

use super::bitmap::StatusBitmap;
use super::table::{self, DecodedTable, PayloadShape, VERSION_BLOCK_ABNORMAL};
use crate::nand::{Nand, ReadOutcome};

/// What one reserved slot was found to contain
#[derive(Debug)]
pub(crate) enum SlotContent {
    /// No generation stored here
    Absent,

    /// Unreadable, or a generation that failed pattern/hash verification
    Abnormal,

    /// A well-formed generation and its bitmap bytes
    Valid { version: u32, bitmap: Vec<u8> },
}

impl SlotContent {
    /// The version this slot contributes to the updater's selection
    /// arithmetic; absent slots count as 0
    pub(crate) fn version_key(&self) -> u32 {
        match self {
            Self::Absent => 0,
            Self::Abnormal => VERSION_BLOCK_ABNORMAL,
            Self::Valid { version, .. } => *version,
        }
    }
}

/// Read one reserved slot and characterize its content.
///
/// A transport-level read failure classifies the slot as [`SlotContent::Abnormal`]
/// rather than propagating: one damaged slot must not block recovery from the
/// others.
pub(crate) fn read_slot<N: Nand>(nand: &N, block: u32, shape: &PayloadShape) -> SlotContent {
    let mut data = vec![0u8; shape.data_len];
    let mut oob = vec![0u8; shape.oob_len];

    match nand.read_pages(block, 0, &mut data, &mut oob) {
        Ok(ReadOutcome::Clean) => {}
        Ok(ReadOutcome::Corrected) => debug!("slot {block}: corrected bitflips on read"),
        Err(err) => {
            warn!("slot {block}: unreadable: {err:#}");
            return SlotContent::Abnormal;
        }
    }

    match table::decode(&data, &oob, shape) {
        DecodedTable::Absent => SlotContent::Absent,
        DecodedTable::Abnormal => {
            warn!("slot {block}: rejected generation");
            SlotContent::Abnormal
        }
        DecodedTable::Valid { version } => {
            data.truncate(shape.bitmap_bytes);
            SlotContent::Valid {
                version,
                bitmap: data,
            }
        }
    }
}

/// Sweep every reserved slot and load the bitmap of the highest-versioned
/// valid generation found. Returns the loaded version, or 0 if no valid
/// generation exists anywhere.
pub(crate) fn scan<N: Nand>(nand: &N, bitmap: &mut StatusBitmap, shape: &PayloadShape) -> u32 {
    let layout = nand.get_layout();
    let mut version = 0;

    for block in layout.first_reserved()..layout.blocks {
        match read_slot(nand, block, shape) {
            SlotContent::Valid {
                version: found,
                bitmap: bytes,
            } if found > version => {
                debug!("slot {block}: adopting generation {found}");
                bitmap.load_bytes(&bytes);
                version = found;
            }
            _ => {}
        }
    }

    version
}

#[test]
fn test_scan_picks_newest_despite_damage() -> anyhow::Result<()> {
    use crate::bbt::bitmap::BlockStatus;
    use crate::nand::{NandLayout, SimNand};

    const TEST_LAYOUT: NandLayout = NandLayout {
        blocks: 64,
        pages_per_block: 4,
        bytes_per_page: 64,
        oob_per_page: 16,
        reserved_blocks: 4,
    };

    let mut nand = SimNand::new(TEST_LAYOUT);
    let mut bitmap = StatusBitmap::new(TEST_LAYOUT.blocks);
    let shape = table::payload_shape(&TEST_LAYOUT, bitmap.byte_len());

    // Slot 60: a stale generation
    bitmap.set(7, BlockStatus::Worn)?;
    let (data, oob) = table::encode(&bitmap, 3, &shape)?;
    nand.program_pages(60, 0, &data, &oob)?;

    // Slot 61: the newest generation
    bitmap.set(7, BlockStatus::FactoryBad)?;
    let (data, oob) = table::encode(&bitmap, 5, &shape)?;
    nand.program_pages(61, 0, &data, &oob)?;

    // Slot 62: corrupt (pattern intact, hash wrong); slot 63: unreadable
    let mut garbage = data.clone();
    garbage[0] ^= 0xFF;
    nand.program_pages(62, 0, &garbage, &oob)?;
    nand.fail_reads(63);

    let mut loaded = StatusBitmap::new(TEST_LAYOUT.blocks);
    assert_eq!(scan(&nand, &mut loaded, &shape), 5);
    assert_eq!(loaded.get(7)?, BlockStatus::FactoryBad);

    assert!(matches!(read_slot(&nand, 62, &shape), SlotContent::Abnormal));
    assert!(matches!(read_slot(&nand, 63, &shape), SlotContent::Abnormal));
    assert_eq!(
        SlotContent::Abnormal.version_key(),
        table::VERSION_BLOCK_ABNORMAL
    );

    // A slot that needed ECC correction still decodes
    let mut nand = SimNand::new(TEST_LAYOUT);
    nand.program_pages(61, 0, &data, &oob)?;
    nand.corrected_reads(61);
    assert!(matches!(
        read_slot(&nand, 61, &shape),
        SlotContent::Valid { version: 5, .. }
    ));

    Ok(())
}
