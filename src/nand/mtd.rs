//! NAND transport implementation over the Linux MTD subsystem

use super::{Nand, NandLayout, ReadOutcome};

use anyhow::{bail, ensure};

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::mem::MaybeUninit;
use std::os::{fd::AsRawFd, unix::fs::FileExt};
use std::path::Path;

/// NAND flash that wraps an open /dev/mtdX file
#[derive(Debug)]
pub struct MtdNand {
    file: File,
    layout: NandLayout,
}

impl MtdNand {
    /// Open an `mtd` device, by path (e.g. "/dev/mtd0"), reserving the trailing
    /// `reserved_blocks` erase blocks for table storage
    pub fn open<P: AsRef<Path>>(path: P, reserved_blocks: u32) -> anyhow::Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        let info = unsafe {
            let mut info = MaybeUninit::<ioctl::mtd_info_user>::uninit();
            ioctl::memgetinfo(file.as_raw_fd(), info.as_mut_ptr())?;
            info.assume_init()
        };
        let layout = ioctl::layout_from(info, reserved_blocks)?;

        Ok(Self { file, layout })
    }

    /// Open an `mtd` device by its name, by searching `/proc/mtd`
    pub fn open_named(name: &str, reserved_blocks: u32) -> anyhow::Result<Self> {
        // Put `name` in quotes
        let name = format!("\"{name}\"");

        let proc_mtd = File::open("/proc/mtd")?;
        let proc_mtd = BufReader::new(proc_mtd);
        for line in proc_mtd.lines() {
            let line = line?;
            if line.contains(&name) {
                let mtd_dev = line.split(':').next().unwrap();
                return Self::open(Path::new("/dev").join(mtd_dev), reserved_blocks);
            }
        }

        bail!("MTD device {name} could not be found");
    }

    /// Compute the offset of the first byte of this block
    fn block_base(&self, block: u32) -> u64 {
        self.layout.pages_per_block as u64 * self.layout.bytes_per_page as u64 * block as u64
    }

    /// Ensure that the byte counts and starting page range are valid, and compute the /dev/mtdX
    /// offset for the page
    fn offset_for(
        &self,
        block: u32,
        start_page: u32,
        data_len: usize,
        oob_len: usize,
    ) -> anyhow::Result<u64> {
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

        Ok(self.block_base(block) + self.layout.bytes_per_page as u64 * start_page as u64)
    }
}

impl Nand for MtdNand {
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
        let offset = self.offset_for(block, start_page, data.len(), oob.len())?;
        self.file.read_exact_at(data, offset)?;

        for (page, chunk) in oob.chunks_mut(self.layout.oob_per_page).enumerate() {
            let mut buf = ioctl::mtd_oob_buf {
                start: (offset + page as u64 * self.layout.bytes_per_page as u64) as u32,
                length: chunk.len() as u32,
                ptr: chunk.as_mut_ptr(),
            };
            unsafe {
                ioctl::memreadoob(self.file.as_raw_fd(), &mut buf)?;
            }
        }

        // The char device folds corrected bitflips into a successful read; an
        // uncorrectable page surfaces as an I/O error above.
        Ok(ReadOutcome::Clean)
    }

    fn program_pages(
        &mut self,
        block: u32,
        start_page: u32,
        data: &[u8],
        oob: &[u8],
    ) -> anyhow::Result<()> {
        let offset = self.offset_for(block, start_page, data.len(), oob.len())?;
        self.file.write_all_at(data, offset)?;

        for (page, chunk) in oob.chunks(self.layout.oob_per_page).enumerate() {
            let mut buf = ioctl::mtd_oob_buf {
                start: (offset + page as u64 * self.layout.bytes_per_page as u64) as u32,
                length: chunk.len() as u32,
                ptr: chunk.as_ptr() as *mut u8,
            };
            unsafe {
                ioctl::memwriteoob(self.file.as_raw_fd(), &mut buf)?;
            }
        }

        Ok(())
    }

    fn erase_block(&mut self, block: u32) -> anyhow::Result<()> {
        ensure!(block < self.layout.blocks, "block {block} out of range");
        let erase_info = ioctl::erase_info_user {
            start: self.block_base(block) as u32,
            length: self.layout.pages_per_block * self.layout.bytes_per_page as u32,
        };
        unsafe {
            ioctl::memerase(self.file.as_raw_fd(), &erase_info)?;
        }
        Ok(())
    }

    fn is_factory_bad(&self, block: u32) -> anyhow::Result<bool> {
        ensure!(block < self.layout.blocks, "block {block} out of range");
        let block_base: u64 = self.block_base(block);
        let bad = unsafe { ioctl::memgetbadblock(self.file.as_raw_fd(), &block_base)? };
        Ok(bad != 0)
    }
}

mod ioctl {
    //! The private ioctls for interfacing with MTD devices

    use super::NandLayout;

    use anyhow::ensure;
    use nix::{ioctl_read, ioctl_readwrite, ioctl_write_ptr};

    const MTD_IOC_MAGIC: u8 = b'M';

    #[repr(C)]
    pub struct mtd_info_user {
        pub r#type: u8,
        pub flags: u32,
        pub size: u32,
        pub erasesize: u32,
        pub writesize: u32,
        pub oobsize: u32,
        pub padding: u64,
    }
    ioctl_read!(memgetinfo, MTD_IOC_MAGIC, 1, mtd_info_user);

    #[repr(C)]
    pub struct erase_info_user {
        pub start: u32,
        pub length: u32,
    }
    ioctl_write_ptr!(memerase, MTD_IOC_MAGIC, 2, erase_info_user);

    #[repr(C)]
    pub struct mtd_oob_buf {
        pub start: u32,
        pub length: u32,
        pub ptr: *mut u8,
    }
    ioctl_readwrite!(memwriteoob, MTD_IOC_MAGIC, 3, mtd_oob_buf);
    ioctl_readwrite!(memreadoob, MTD_IOC_MAGIC, 4, mtd_oob_buf);

    ioctl_write_ptr!(memgetbadblock, MTD_IOC_MAGIC, 11, u64);

    pub fn layout_from(info: mtd_info_user, reserved_blocks: u32) -> anyhow::Result<NandLayout> {
        ensure!(
            info.size % info.erasesize == 0,
            "MTD size not multiple of erasesize"
        );
        ensure!(
            info.erasesize % info.writesize == 0,
            "MTD erasesize not multiple of writesize"
        );

        let blocks = info.size / info.erasesize;
        ensure!(
            reserved_blocks > 0 && reserved_blocks < blocks,
            "cannot reserve {reserved_blocks} of {blocks} blocks"
        );

        Ok(NandLayout {
            blocks,
            pages_per_block: info.erasesize / info.writesize,
            bytes_per_page: info.writesize as usize,
            oob_per_page: info.oobsize as usize,
            reserved_blocks,
        })
    }
}
