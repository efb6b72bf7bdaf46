//! Abstractions and code to access raw NAND flash.

use std::str::FromStr;

use anyhow::ensure;

#[cfg(target_os = "linux")]
pub mod mtd;

/// Convenience methods for operating on `[u8]`s that represent page contents
pub trait PageUtil {
    /// Does this page contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }
}

/// A pub-fields struct describing the data layout of a NAND flash device
#[derive(Debug, Copy, Clone)]
pub struct NandLayout {
    pub blocks: u32,
    pub pages_per_block: u32,
    pub bytes_per_page: usize,
    pub oob_per_page: usize,

    /// How many blocks at the end of the device are reserved for metadata
    pub reserved_blocks: u32,
}

impl NandLayout {
    /// Index of the first block of the reserved region at the end of the device
    pub fn first_reserved(&self) -> u32 {
        self.blocks - self.reserved_blocks
    }
}

/// Parse strings like "BLOCKSxPAGESxBYTESxOOBxRESERVED"
impl FromStr for NandLayout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let [blocks, pages_per_block, bytes_per_page, oob_per_page, reserved_blocks]: [&str; 5] =
            s.split('x')
                .collect::<Vec<_>>()
                .try_into()
                .map_err(|_| anyhow::anyhow!("expected #x#x#x#x#"))?;
        let blocks = blocks.parse()?;
        let pages_per_block = pages_per_block.parse()?;
        let bytes_per_page = bytes_per_page.parse()?;
        let oob_per_page = oob_per_page.parse()?;
        let reserved_blocks = reserved_blocks.parse()?;

        Ok(NandLayout {
            blocks,
            pages_per_block,
            bytes_per_page,
            oob_per_page,
            reserved_blocks,
        })
    }
}

/// Did a page read come back clean, or were correctable bitflips repaired on the way?
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum ReadOutcome {
    Clean,
    Corrected,
}

/// Represents a NAND flash device, addressed by (block, page) coordinates.
pub trait Nand {
    /// Get the layout of the NAND
    fn get_layout(&self) -> NandLayout;

    /// Read an integral number of pages and their OOB areas, starting at `start_page`.
    ///
    /// A read that succeeded only thanks to ECC correction reports
    /// [`ReadOutcome::Corrected`]; an uncorrectable read is an `Err`.
    fn read_pages(
        &self,
        block: u32,
        start_page: u32,
        data: &mut [u8],
        oob: &mut [u8],
    ) -> anyhow::Result<ReadOutcome>;

    /// Program pages and their OOB areas, beginning at `start_page`.
    ///
    /// Note that pages within a block must be programmed in increasing order, to comply with the
    /// sequential-write requirements of certain MLC NANDs.
    fn program_pages(
        &mut self,
        block: u32,
        start_page: u32,
        data: &[u8],
        oob: &[u8],
    ) -> anyhow::Result<()>;

    /// Erase a block, making all of its pages writable again
    fn erase_block(&mut self, block: u32) -> anyhow::Result<()>;

    /// Manufacturer bad-block marking for this block, independent of any table kept by this crate
    fn is_factory_bad(&self, block: u32) -> anyhow::Result<bool>;
}

/// A simulated in-memory NAND flash, for testing purposes
#[derive(Debug, Clone)]
pub struct SimNand {
    blocks: Box<[SimBlock]>,
    layout: NandLayout,
}

/// A block of SimNand
#[derive(Debug, Clone)]
struct SimBlock {
    /// All bytes of all written pages (legally, can only append to this)
    data: Vec<u8>,

    /// OOB bytes of all written pages, kept in step with `data`
    oob: Vec<u8>,

    /// Manufacturer bad-block mark
    factory_bad: bool,

    /// Fault injection: reads of this block fail as uncorrectable
    fail_reads: bool,

    /// Fault injection: reads of this block report corrected bitflips
    corrected_reads: bool,

    /// Fault injection: this many upcoming writes silently corrupt a byte
    corrupt_writes: u32,
}

impl SimNand {
    /// Create an empty SimNand with the specified layout
    pub fn new(layout: NandLayout) -> Self {
        let blocks = vec![
            SimBlock {
                data: Vec::new(),
                oob: Vec::new(),
                factory_bad: false,
                fail_reads: false,
                corrected_reads: false,
                corrupt_writes: 0,
            };
            layout.blocks as usize
        ];

        Self {
            blocks: blocks.into_boxed_slice(),
            layout,
        }
    }

    /// Give this block a manufacturer bad-block mark
    pub fn mark_factory_bad(&mut self, block: u32) {
        self.blocks[block as usize].factory_bad = true;
    }

    /// Make every read of this block fail as uncorrectable
    pub fn fail_reads(&mut self, block: u32) {
        self.blocks[block as usize].fail_reads = true;
    }

    /// Make every read of this block report corrected bitflips
    pub fn corrected_reads(&mut self, block: u32) {
        self.blocks[block as usize].corrected_reads = true;
    }

    /// Make the next `count` writes to this block silently corrupt one byte
    pub fn corrupt_writes(&mut self, block: u32, count: u32) {
        self.blocks[block as usize].corrupt_writes = count;
    }

    /// Validate a (start_page, data, oob) span and return its page count
    fn page_span(&self, block: u32, start_page: u32, data_len: usize, oob_len: usize) -> anyhow::Result<u32> {
        ensure!(block < self.layout.blocks, "block {block} out of range");
        ensure!(
            data_len % self.layout.bytes_per_page == 0,
            "buffer not a multiple of page size"
        );
        let pages = (data_len / self.layout.bytes_per_page) as u32;
        ensure!(
            oob_len == pages as usize * self.layout.oob_per_page,
            "OOB buffer does not match page count"
        );
        ensure!(
            start_page + pages <= self.layout.pages_per_block,
            "block {block}, page range {start_page}..{} out of bounds",
            start_page + pages,
        );
        Ok(pages)
    }
}

impl Nand for SimNand {
    fn get_layout(&self) -> NandLayout {
        self.layout
    }

    fn read_pages(
        &self,
        block: u32,
        start_page: u32,
        data: &mut [u8],
        oob: &mut [u8],
    ) -> anyhow::Result<ReadOutcome> {
        self.page_span(block, start_page, data.len(), oob.len())?;
        let blk = &self.blocks[block as usize];
        ensure!(!blk.fail_reads, "block {block}: uncorrectable read error");

        for (region, stored, unit) in [
            (&mut *data, &blk.data, self.layout.bytes_per_page),
            (&mut *oob, &blk.oob, self.layout.oob_per_page),
        ] {
            for (page, chunk) in region.chunks_mut(unit).enumerate() {
                let begin = (start_page as usize + page) * unit;
                match stored.get(begin..begin + unit) {
                    Some(src) => chunk.copy_from_slice(src),
                    None => chunk.fill(0xFF),
                }
            }
        }

        Ok(if blk.corrected_reads {
            ReadOutcome::Corrected
        } else {
            ReadOutcome::Clean
        })
    }

    fn program_pages(
        &mut self,
        block: u32,
        start_page: u32,
        data: &[u8],
        oob: &[u8],
    ) -> anyhow::Result<()> {
        self.page_span(block, start_page, data.len(), oob.len())?;
        let (page_size, oob_size) = (self.layout.bytes_per_page, self.layout.oob_per_page);
        let blk = &mut self.blocks[block as usize];

        let begin = start_page as usize * page_size;
        ensure!(
            begin >= blk.data.len(),
            "block {block}: write in already-written area"
        );
        blk.data.resize(begin, 0xFF);
        blk.oob.resize(start_page as usize * oob_size, 0xFF);
        blk.data.extend_from_slice(data);
        blk.oob.extend_from_slice(oob);

        if blk.corrupt_writes > 0 {
            blk.corrupt_writes -= 1;
            blk.data[begin] ^= 0xFF;
        }

        Ok(())
    }

    fn erase_block(&mut self, block: u32) -> anyhow::Result<()> {
        ensure!(block < self.layout.blocks, "block {block} out of range");
        let blk = &mut self.blocks[block as usize];
        blk.data.clear();
        blk.oob.clear();
        Ok(())
    }

    fn is_factory_bad(&self, block: u32) -> anyhow::Result<bool> {
        ensure!(block < self.layout.blocks, "block {block} out of range");
        Ok(self.blocks[block as usize].factory_bad)
    }
}

#[cfg(test)]
const TEST_LAYOUT: NandLayout = NandLayout {
    blocks: 8,
    pages_per_block: 16,
    bytes_per_page: 256,
    oob_per_page: 16,
    reserved_blocks: 2,
};

#[test]
fn test_layout_from_str() {
    let layout: NandLayout = "64x16x256x16x4".parse().unwrap();
    assert_eq!(layout.blocks, 64);
    assert_eq!(layout.pages_per_block, 16);
    assert_eq!(layout.bytes_per_page, 256);
    assert_eq!(layout.oob_per_page, 16);
    assert_eq!(layout.reserved_blocks, 4);
    assert_eq!(layout.first_reserved(), 60);

    assert!("64x16x256".parse::<NandLayout>().is_err());
    assert!("64x16x256x16xq".parse::<NandLayout>().is_err());
}

#[test]
fn test_sim_range_checks() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    let mut data = vec![0; TEST_LAYOUT.bytes_per_page];
    let mut oob = vec![0; TEST_LAYOUT.oob_per_page];

    assert!(nand
        .read_pages(TEST_LAYOUT.blocks, 0, &mut data, &mut oob)
        .is_err());
    assert!(nand
        .read_pages(0, TEST_LAYOUT.pages_per_block, &mut data, &mut oob)
        .is_err());
    let mut short_oob = vec![0; TEST_LAYOUT.oob_per_page - 1];
    assert!(nand.read_pages(0, 0, &mut data, &mut short_oob).is_err());
    assert!(nand.erase_block(TEST_LAYOUT.blocks).is_err());
    assert!(nand.is_factory_bad(TEST_LAYOUT.blocks).is_err());
    assert!(nand.erase_block(0).is_ok());
}

#[test]
fn test_sim_read_write() {
    let mut nand = SimNand::new(TEST_LAYOUT);

    let data_in = vec![0xA5u8; TEST_LAYOUT.bytes_per_page];
    let oob_in = vec![0x00u8; TEST_LAYOUT.oob_per_page];
    let mut data_out = data_in.clone();
    let mut oob_out = oob_in.clone();

    nand.program_pages(0, 2, &data_in, &oob_in).unwrap();
    assert!(nand.program_pages(0, 1, &data_in, &oob_in).is_err());

    nand.read_pages(0, 1, &mut data_out, &mut oob_out).unwrap();
    assert!(data_out.is_erased());
    assert!(oob_out.is_erased());

    nand.read_pages(0, 2, &mut data_out, &mut oob_out).unwrap();
    assert_eq!(data_out, data_in);
    assert_eq!(oob_out, oob_in);

    nand.read_pages(0, 3, &mut data_out, &mut oob_out).unwrap();
    assert!(data_out.is_erased());

    nand.erase_block(0).unwrap();
    nand.read_pages(0, 2, &mut data_out, &mut oob_out).unwrap();
    assert!(data_out.is_erased());
    nand.program_pages(0, 0, &data_in, &oob_in).unwrap();
}

#[test]
fn test_sim_fault_injection() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    let data_in = vec![0xA5u8; TEST_LAYOUT.bytes_per_page];
    let oob_in = vec![0x00u8; TEST_LAYOUT.oob_per_page];
    let mut data_out = data_in.clone();
    let mut oob_out = oob_in.clone();

    assert!(!nand.is_factory_bad(3).unwrap());
    nand.mark_factory_bad(3);
    assert!(nand.is_factory_bad(3).unwrap());

    nand.fail_reads(1);
    assert!(nand.read_pages(1, 0, &mut data_out, &mut oob_out).is_err());

    nand.corrected_reads(2);
    assert_eq!(
        nand.read_pages(2, 0, &mut data_out, &mut oob_out).unwrap(),
        ReadOutcome::Corrected
    );

    nand.corrupt_writes(4, 1);
    nand.program_pages(4, 0, &data_in, &oob_in).unwrap();
    nand.read_pages(4, 0, &mut data_out, &mut oob_out).unwrap();
    assert_ne!(data_out, data_in);
    assert_eq!(data_out[1..], data_in[1..]);

    nand.program_pages(4, 1, &data_in, &oob_in).unwrap();
    nand.read_pages(4, 1, &mut data_out, &mut oob_out).unwrap();
    assert_eq!(data_out, data_in);
}
