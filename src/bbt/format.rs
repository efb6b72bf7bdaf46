//! This module builds a table from nothing: used on first-ever initialization
//! of a device, or after total loss of every stored generation.

use log::warn;

use super::bitmap::{BlockStatus, StatusBitmap};
use super::BbtError;
use crate::nand::Nand;

/// Sweep every block, record manufacturer-marked defects, and reserve the
/// trailing slot region.
///
/// The factory defect signal decides the fate of real data regions, so it is
/// cross-checked before anything is recorded: a known-good reference block
/// (block 0) must report good, and the block that just reported defective
/// must report defective again. A failed check clears the bitmap and aborts,
/// since writing a table built on an unreliable signal risks permanently
/// retiring healthy blocks.
pub(crate) fn format<N: Nand>(nand: &N, bitmap: &mut StatusBitmap) -> Result<(), BbtError> {
    let layout = nand.get_layout();

    for block in 0..layout.blocks {
        if nand.is_factory_bad(block)? {
            if nand.is_factory_bad(0)? {
                bitmap.clear();
                warn!("format: reference block 0 reports defective");
                return Err(BbtError::UntrustedClassification);
            }
            if !nand.is_factory_bad(block)? {
                bitmap.clear();
                warn!("format: block {block} defect marking is unstable");
                return Err(BbtError::UntrustedClassification);
            }

            bitmap.set(block, BlockStatus::FactoryBad)?;
        }
    }

    // The reserved region holds the table itself; whatever is not factory-bad
    // there is retired from user data.
    for block in layout.first_reserved()..layout.blocks {
        if bitmap.get(block)? != BlockStatus::FactoryBad {
            bitmap.set(block, BlockStatus::Worn)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nand::{NandLayout, ReadOutcome, SimNand};

    use std::cell::Cell;

    const TEST_LAYOUT: NandLayout = NandLayout {
        blocks: 64,
        pages_per_block: 4,
        bytes_per_page: 64,
        oob_per_page: 16,
        reserved_blocks: 4,
    };

    #[test]
    fn test_format_blank() -> anyhow::Result<()> {
        let nand = SimNand::new(TEST_LAYOUT);
        let mut bitmap = StatusBitmap::new(TEST_LAYOUT.blocks);

        format(&nand, &mut bitmap)?;

        for block in 0..60 {
            assert_eq!(bitmap.get(block)?, BlockStatus::Unknown);
        }
        for block in 60..64 {
            assert_eq!(bitmap.get(block)?, BlockStatus::Worn);
        }

        Ok(())
    }

    #[test]
    fn test_format_records_factory_bad() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        nand.mark_factory_bad(7);
        nand.mark_factory_bad(62);

        let mut bitmap = StatusBitmap::new(TEST_LAYOUT.blocks);
        format(&nand, &mut bitmap)?;

        assert_eq!(bitmap.get(7)?, BlockStatus::FactoryBad);
        assert_eq!(bitmap.get(8)?, BlockStatus::Unknown);

        // a factory-bad reserved block stays factory-bad, not worn
        assert_eq!(bitmap.get(62)?, BlockStatus::FactoryBad);
        assert_eq!(bitmap.get(63)?, BlockStatus::Worn);

        Ok(())
    }

    #[test]
    fn test_format_distrusts_bad_reference_block() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        nand.mark_factory_bad(0);

        let mut bitmap = StatusBitmap::new(TEST_LAYOUT.blocks);
        bitmap.set(5, BlockStatus::Good)?;

        let result = format(&nand, &mut bitmap);
        assert!(matches!(result, Err(BbtError::UntrustedClassification)));

        // nothing half-built survives
        for block in 0..TEST_LAYOUT.blocks {
            assert_eq!(bitmap.get(block)?, BlockStatus::Unknown);
        }

        Ok(())
    }

    /// Wraps a SimNand with a defect signal that reports a block bad exactly
    /// once, then recants.
    struct FlakyBad {
        inner: SimNand,
        block: u32,
        reported: Cell<bool>,
    }

    impl Nand for FlakyBad {
        fn get_layout(&self) -> NandLayout {
            self.inner.get_layout()
        }
        fn read_pages(
            &self,
            block: u32,
            start_page: u32,
            data: &mut [u8],
            oob: &mut [u8],
        ) -> anyhow::Result<ReadOutcome> {
            self.inner.read_pages(block, start_page, data, oob)
        }
        fn program_pages(
            &mut self,
            block: u32,
            start_page: u32,
            data: &[u8],
            oob: &[u8],
        ) -> anyhow::Result<()> {
            self.inner.program_pages(block, start_page, data, oob)
        }
        fn erase_block(&mut self, block: u32) -> anyhow::Result<()> {
            self.inner.erase_block(block)
        }
        fn is_factory_bad(&self, block: u32) -> anyhow::Result<bool> {
            if block == self.block && !self.reported.replace(true) {
                return Ok(true);
            }
            self.inner.is_factory_bad(block)
        }
    }

    #[test]
    fn test_format_distrusts_unstable_marking() -> anyhow::Result<()> {
        let nand = FlakyBad {
            inner: SimNand::new(TEST_LAYOUT),
            block: 9,
            reported: Cell::new(false),
        };

        let mut bitmap = StatusBitmap::new(TEST_LAYOUT.blocks);
        let result = format(&nand, &mut bitmap);
        assert!(matches!(result, Err(BbtError::UntrustedClassification)));

        for block in 0..TEST_LAYOUT.blocks {
            assert_eq!(bitmap.get(block)?, BlockStatus::Unknown);
        }

        Ok(())
    }
}
