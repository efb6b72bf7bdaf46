//! This module implements the flash-resident bad block table (BBT).
//!
//! The table records a 2-bit status code per erase block and must survive
//! power cycles on a medium where writes are not idempotent, erases are
//! destructive, and any block — including the ones holding the table — can
//! spontaneously go bad. To cope, the last few erase blocks of the device are
//! reserved as *slots*, and each flush writes a fresh, versioned, hashed
//! snapshot ("generation") of the table into the stalest slots:
//!
//! ```text
//! |  user data blocks ...              |  reserved slots (last R blocks)  |
//! |                                    | gen v4 | gen v4 |  v3   | (bad)  |
//!
//! one slot payload, an even number of pages:
//! | bitmap bytes | "Bbt0" | version | hash |     padding to page ...      |
//! ```
//!
//! At bring-up the scanner decodes every slot and adopts the newest
//! generation that passes pattern and hash verification; a device with no
//! valid generation anywhere is formatted from the manufacturer's factory
//! bad-block marks and flushed before use. Damaged slots are tolerated on
//! read, preferentially recycled on write, and scrubbed when left behind, so
//! a single surviving copy is always enough to recover the table.

mod bitmap;
mod format;
mod scan;
mod table;
mod update;

pub use bitmap::{BlockStatus, StatusBitmap, STATUS_BITS};
pub use table::{VERSION_BLOCK_ABNORMAL, VERSION_INVALID, VERSION_MAX};

use anyhow::ensure;
use log::debug;
use thiserror::Error;

use crate::nand::{Nand, NandLayout};
use table::PayloadShape;

/// Errors reported by table operations
#[derive(Debug, Error)]
pub enum BbtError {
    /// Block index past the end of the device; a caller bug, never retried
    #[error("block {0} out of range")]
    OutOfRange(u32),

    /// The formatter's defect-signal self-check failed; no table was written
    #[error("factory defect classification cannot be trusted")]
    UntrustedClassification,

    /// Every reserved slot is unusable; the table cannot be persisted
    #[error("no usable slot in the reserved table region")]
    NoUsableSlot,

    /// Transport-level failure; the in-memory table is intact and the
    /// operation may be retried
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

/// A bad block table attached to a NAND device.
///
/// The handle owns the transport and the in-memory bitmap; one handle per
/// device, one exclusive owner per handle. [`Bbt::attach`] only returns
/// scanned handles, so statuses read through it are authoritative.
pub struct Bbt<N: Nand> {
    nand: N,
    layout: NandLayout,
    bitmap: StatusBitmap,
    shape: PayloadShape,
    version: u32,
    scanned: bool,
}

fn validate(layout: &NandLayout, shape: &PayloadShape) -> anyhow::Result<()> {
    ensure!(layout.bytes_per_page > 0, "zero-sized pages");
    ensure!(layout.oob_per_page > 0, "pages carry no OOB area");
    ensure!(
        layout.reserved_blocks > 0 && layout.reserved_blocks < layout.blocks,
        "cannot reserve {} of {} blocks",
        layout.reserved_blocks,
        layout.blocks,
    );
    ensure!(
        shape.pages <= layout.pages_per_block,
        "table payload of {} pages does not fit one erase block",
        shape.pages,
    );
    Ok(())
}

impl<N: Nand> Bbt<N> {
    /// Attach to a device: allocate the bitmap, recover the newest stored
    /// generation, and — if no valid generation exists anywhere — format the
    /// table from factory defect marks and flush it before returning.
    pub fn attach(nand: N) -> Result<Self, BbtError> {
        let layout = nand.get_layout();
        let bitmap = StatusBitmap::new(layout.blocks);
        let shape = table::payload_shape(&layout, bitmap.byte_len());
        validate(&layout, &shape)?;

        let mut bbt = Self {
            nand,
            layout,
            bitmap,
            shape,
            version: 0,
            scanned: false,
        };

        bbt.version = scan::scan(&bbt.nand, &mut bbt.bitmap, &bbt.shape);
        bbt.scanned = true;

        if bbt.version == 0 {
            debug!("no valid generation found, formatting");
            format::format(&bbt.nand, &mut bbt.bitmap)?;
            bbt.flush()?;
        }

        Ok(bbt)
    }

    /// The status recorded for an erase block
    pub fn get_status(&self, block: u32) -> Result<BlockStatus, BbtError> {
        self.bitmap.get(block)
    }

    /// Record a new status for an erase block, in memory only; call
    /// [`Bbt::flush`] to persist
    pub fn set_status(&mut self, block: u32, status: BlockStatus) -> Result<(), BbtError> {
        self.bitmap.set(block, status)
    }

    /// Persist the current table as a new generation across the reserved
    /// slots. On failure the in-memory table is untouched and the flush may
    /// simply be retried.
    pub fn flush(&mut self) -> Result<(), BbtError> {
        debug_assert!(self.scanned, "flush before scan");
        update::update(&mut self.nand, &self.bitmap, &mut self.version, &self.shape)
    }

    /// The version of the most recent generation (loaded or written)
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn layout(&self) -> NandLayout {
        self.layout
    }

    /// Detach from the device, releasing the table and returning the
    /// transport
    pub fn detach(self) -> N {
        self.nand
    }
}
