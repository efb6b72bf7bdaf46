//! This module persists the in-memory bitmap as a new generation, spread
//! redundantly across the reserved slots, reclaiming stale or damaged slots
//! as it goes.

use log::{debug, warn};

use super::bitmap::{BlockStatus, StatusBitmap};
use super::scan::{read_slot, SlotContent};
use super::table::{self, PayloadShape, VERSION_BLOCK_ABNORMAL, VERSION_INVALID};
use super::BbtError;
use crate::nand::Nand;

/// How many copies of each generation to write per update
const WRITE_REDUNDANCY: usize = 2;

/// Ordering key for victim selection: damaged slots sort lowest, so they are
/// recycled before anything stale.
fn reclaim_key(version: u32) -> u32 {
    if version == VERSION_BLOCK_ABNORMAL {
        0
    } else {
        version
    }
}

/// Erase a slot, program one encoded generation into it, and prove the write
/// took by decoding it back. A readback mismatch erases the slot again so a
/// half-programmed generation is never left behind.
fn write_table<N: Nand>(
    nand: &mut N,
    bitmap: &StatusBitmap,
    version: u32,
    block: u32,
    shape: &PayloadShape,
) -> anyhow::Result<()> {
    debug!("writing generation {version} to slot {block}");
    let (data, oob) = table::encode(bitmap, version, shape)?;

    nand.erase_block(block)?;
    if let Err(err) = nand.program_pages(block, 0, &data, &oob) {
        let _ = nand.erase_block(block);
        return Err(err);
    }

    match read_slot(nand, block, shape) {
        SlotContent::Valid { version: found, .. } if found == version => Ok(()),
        other => {
            let found = other.version_key();
            let _ = nand.erase_block(block);
            anyhow::bail!("slot {block}: wrote generation {version}, read back {found:#x}");
        }
    }
}

/// Persist `bitmap` as a generation newer than anything stored on flash.
///
/// On success the new generation exists in up to [`WRITE_REDUNDANCY`] slots
/// and `version` holds its number. On failure the bitmap and flash contents
/// remain consistent, so retrying the whole update is safe.
pub(crate) fn update<N: Nand>(
    nand: &mut N,
    bitmap: &StatusBitmap,
    version: &mut u32,
    shape: &PayloadShape,
) -> Result<(), BbtError> {
    let layout = nand.get_layout();
    let first = layout.first_reserved();

    let mut slot_versions: Vec<u32> = (first..layout.blocks)
        .map(|block| {
            let content = read_slot(nand, block, shape);
            match (&content, bitmap.get(block)) {
                // A slot with no generation that the table says is factory-bad
                // must never be touched; a readable generation counts by its
                // version even in a suspect block.
                (SlotContent::Absent, Ok(BlockStatus::FactoryBad)) => VERSION_INVALID,
                _ => content.version_key(),
            }
        })
        .collect();

    let mut wrote = false;
    let mut last_err = None;
    for attempt in 0..WRITE_REDUNDANCY {
        let candidate = slot_versions
            .iter()
            .enumerate()
            .filter(|&(_, &v)| v != VERSION_INVALID)
            .min_by_key(|&(_, &v)| reclaim_key(v));
        let Some((index, &slot_version)) = candidate else {
            if wrote {
                break;
            }
            return Err(BbtError::NoUsableSlot);
        };

        let min = reclaim_key(slot_version);
        if *version < min {
            // guarantee forward progress past any stale value
            *version = min + 4;
        }
        if attempt == 0 {
            // redundant copies share one generation number, so a failed
            // attempt does not burn it
            *version += 1;
        }

        let block = first + index as u32;
        match write_table(nand, bitmap, *version, block, shape) {
            Ok(()) => wrote = true,
            Err(err) => {
                warn!("slot {block}: update write failed: {err:#}");
                last_err = Some(err);
            }
        }
        // used either way: a fresh copy lives here, or the slot was just
        // erased after a failed verify
        slot_versions[index] = VERSION_INVALID;
    }

    // A corrupt slot that did not receive a fresh write this round is
    // actively scrubbed so it cannot be mistaken for valid data later.
    for (index, &slot_version) in slot_versions.iter().enumerate() {
        if slot_version == VERSION_BLOCK_ABNORMAL {
            let block = first + index as u32;
            debug!("scrubbing abnormal slot {block}");
            if let Err(err) = nand.erase_block(block) {
                warn!("slot {block}: scrub failed: {err:#}");
            }
        }
    }

    if wrote {
        Ok(())
    } else {
        Err(last_err.map(BbtError::Io).unwrap_or(BbtError::NoUsableSlot))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bbt::table::payload_shape;
    use crate::nand::{NandLayout, SimNand};

    const TEST_LAYOUT: NandLayout = NandLayout {
        blocks: 64,
        pages_per_block: 4,
        bytes_per_page: 64,
        oob_per_page: 16,
        reserved_blocks: 4,
    };

    fn setup() -> (SimNand, StatusBitmap, PayloadShape) {
        let nand = SimNand::new(TEST_LAYOUT);
        let bitmap = StatusBitmap::new(TEST_LAYOUT.blocks);
        let shape = payload_shape(&TEST_LAYOUT, bitmap.byte_len());
        (nand, bitmap, shape)
    }

    fn slot_versions(nand: &SimNand, shape: &PayloadShape) -> Vec<Option<u32>> {
        (60..64)
            .map(|block| match read_slot(nand, block, shape) {
                SlotContent::Valid { version, .. } => Some(version),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_update_writes_two_copies() {
        let (mut nand, bitmap, shape) = setup();
        let mut version = 0;

        update(&mut nand, &bitmap, &mut version, &shape).unwrap();
        assert_eq!(version, 1);
        assert_eq!(slot_versions(&nand, &shape), [Some(1), Some(1), None, None]);

        update(&mut nand, &bitmap, &mut version, &shape).unwrap();
        assert_eq!(version, 2);
        assert_eq!(
            slot_versions(&nand, &shape),
            [Some(1), Some(1), Some(2), Some(2)]
        );

        // the next round recycles the stalest slots
        update(&mut nand, &bitmap, &mut version, &shape).unwrap();
        assert_eq!(version, 3);
        assert_eq!(
            slot_versions(&nand, &shape),
            [Some(3), Some(3), Some(2), Some(2)]
        );
    }

    #[test]
    fn test_update_bumps_past_stale_versions() {
        let (mut nand, bitmap, shape) = setup();

        for (slot, stale) in (60..64).zip([10, 11, 12, 13]) {
            write_table(&mut nand, &bitmap, stale, slot, &shape).unwrap();
        }

        let mut version = 0;
        update(&mut nand, &bitmap, &mut version, &shape).unwrap();
        assert_eq!(version, 15);
        assert_eq!(
            slot_versions(&nand, &shape),
            [Some(15), Some(15), Some(12), Some(13)]
        );
    }

    #[test]
    fn test_update_moves_on_after_failed_verify() {
        let (mut nand, bitmap, shape) = setup();
        let mut version = 0;

        nand.corrupt_writes(60, 1);
        update(&mut nand, &bitmap, &mut version, &shape).unwrap();

        // one failed attempt, one good copy, one version consumed
        assert_eq!(version, 1);
        assert_eq!(slot_versions(&nand, &shape), [None, Some(1), None, None]);
    }

    #[test]
    fn test_update_reports_total_failure() {
        let (mut nand, bitmap, shape) = setup();
        let mut version = 0;

        nand.corrupt_writes(60, 1);
        nand.corrupt_writes(61, 1);
        let result = update(&mut nand, &bitmap, &mut version, &shape);
        assert!(matches!(result, Err(BbtError::Io(_))));

        // both victims were erased, nothing half-written survives
        assert_eq!(slot_versions(&nand, &shape), [None, None, None, None]);
    }

    #[test]
    fn test_update_skips_factory_bad_slots() {
        let (mut nand, mut bitmap, shape) = setup();
        for block in 60..64 {
            bitmap.set(block, BlockStatus::FactoryBad).unwrap();
        }

        let mut version = 0;
        let result = update(&mut nand, &bitmap, &mut version, &shape);
        assert!(matches!(result, Err(BbtError::NoUsableSlot)));
        assert_eq!(slot_versions(&nand, &shape), [None, None, None, None]);
    }

    #[test]
    fn test_update_scrubs_leftover_abnormal_slot() {
        let (mut nand, bitmap, shape) = setup();

        // slot 63: a generation with a broken hash
        let (mut data, oob) = table::encode(&bitmap, 5, &shape).unwrap();
        data[0] ^= 0xFF;
        nand.program_pages(63, 0, &data, &oob).unwrap();
        assert!(matches!(read_slot(&nand, 63, &shape), SlotContent::Abnormal));

        let mut version = 5;
        update(&mut nand, &bitmap, &mut version, &shape).unwrap();
        assert_eq!(version, 6);

        // the abnormal slot was recycled or scrubbed; nothing abnormal remains
        for block in 60..64 {
            assert!(!matches!(
                read_slot(&nand, block, &shape),
                SlotContent::Abnormal
            ));
        }
    }
}
