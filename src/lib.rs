//! Bad block table (BBT) management for raw NAND flash.
//!
//! NAND erase blocks wear out and occasionally ship defective, so something
//! has to remember which blocks are usable — and that record itself has to
//! live on the same unreliable flash. This crate keeps a small per-block
//! status table in memory and persists it redundantly, with versioning and
//! integrity hashing, across a handful of erase blocks reserved at the end of
//! the device. See the [`bbt`] module for the on-flash layout and recovery
//! rules, and [`nand`] for the flash transport this crate drives.

pub mod bbt;
pub mod nand;
