// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! # SectorFs
//!
//! SectorFs is a small append-only file system for raw NOR SPI flash. It
//! stores a handful of files, identified by a single byte id, directly on
//! a block-erasable device, with wear leveling across erase blocks,
//! optional write protection, and an optional circular mode that recycles
//! the oldest data when the medium fills.
//!
//! ## Goals of SectorFs
//!
//! SectorFs is designed with these main goals (in order)
//!
//!  * Fully implemented in no_std Rust
//!  * Tolerate power loss between page programs
//!  * Wear leveling
//!  * Low memory usage
//!  * Low storage overhead
//!  * No external crates in use (not including unit tests)
//!
//! SectorFs is also designed with some assumptions
//!
//!  * Files are only ever appended to, never rewritten in place
//!  * A small fixed set of files is enough (ids 0 to 254)
//!  * The application tolerates losing bytes that were never flushed
//!
//! ## How SectorFs works
//!
//! The flash is divided into equally sized erase blocks, called sectors.
//! The first page of every sector holds its allocation unit header: the
//! owning file id, the write protect byte, the link to the next sector of
//! the file, a flags byte, a monotonically increasing erase counter, and
//! a table of committed write offsets (the session table). The rest of
//! the sector is file data.
//!
//! Every field starts out as all ones after an erase, and every update
//! only ever clears bits. That is what makes the format work on NOR
//! flash without rewriting: claiming a sector, linking it into a file
//! chain, committing a write offset and toggling write protection are all
//! single small programs into previously erased bytes.
//!
//! A file is a chain of sectors connected by the header links. Writes go
//! through a small page-aligned cache so the flash only ever sees one
//! page program at a time, in increasing address order. A flush commits
//! the current length into the sector's session table; after a power
//! loss, the last committed length is recovered by scanning that table
//! for the first unused slot.
//!
//! When a sector fills up, the least worn free sector is claimed and
//! linked to the end of the chain. Circular files instead recycle their
//! own oldest sector once no free sector remains, so they are bounded
//! and drop oldest data first.
//!
//! ## Using SectorFs
//!
//! To use SectorFs, implement the [`FlashController`] trait for your
//! flash hardware, then create a [`SectorFs`] instance with the page size
//! as a const generic and the erase block size at construction:
//!
//! ```rust
//! use std::cell::RefCell;
//! use sectorfs::{ErrorCode, FlashController, SectorFs, MODE_CREATE, MODE_READONLY};
//!
//! const PAGE_SIZE: usize = 512;
//! const SECTOR_SIZE: usize = 4096;
//!
//! struct FlashCtrl {
//!     buf: RefCell<Vec<u8>>,
//! }
//!
//! impl FlashCtrl {
//!     fn new() -> Self {
//!         Self {
//!             buf: RefCell::new(vec![0xFF; 16 * SECTOR_SIZE]),
//!         }
//!     }
//! }
//!
//! impl FlashController for FlashCtrl {
//!     fn read(&self, address: usize, buf: &mut [u8]) -> Result<(), ErrorCode> {
//!         buf.copy_from_slice(&self.buf.borrow()[address..address + buf.len()]);
//!         Ok(())
//!     }
//!
//!     fn write(&self, address: usize, buf: &[u8]) -> Result<(), ErrorCode> {
//!         for (i, d) in buf.iter().enumerate() {
//!             // NOR programs can only clear bits.
//!             self.buf.borrow_mut()[address + i] &= *d;
//!         }
//!         Ok(())
//!     }
//!
//!     fn erase_block(&self, address: usize) -> Result<(), ErrorCode> {
//!         let start = address - (address % SECTOR_SIZE);
//!         for d in self.buf.borrow_mut()[start..start + SECTOR_SIZE].iter_mut() {
//!             *d = 0xFF;
//!         }
//!         Ok(())
//!     }
//!
//!     fn capacity(&self) -> usize {
//!         self.buf.borrow().len()
//!     }
//! }
//!
//! let mut fs = SectorFs::<FlashCtrl, PAGE_SIZE, 1>::new(FlashCtrl::new(), SECTOR_SIZE).unwrap();
//!
//! // Create a file and write to it.
//! let handle = fs.open(7, MODE_CREATE, None).unwrap();
//! fs.write(handle, b"hello flash").unwrap();
//! fs.close(handle).unwrap();
//!
//! // Read it back.
//! let mut buf = [0; 11];
//! let handle = fs.open(7, MODE_READONLY, None).unwrap();
//! assert_eq!(fs.read(handle, &mut buf), Ok(11));
//! assert_eq!(&buf, b"hello flash");
//! fs.close(handle).unwrap();
//! ```
//!
//! ## Power loss protection
//!
//! Data reaches the flash in two steps: page programs move bytes out of
//! the cache, and a flush (or close) commits the new length into the
//! session table. Only committed bytes are readable after a remount, so
//! the most that a power loss can cost is what was written since the last
//! flush. Session slots are programmed in increasing order, which is what
//! makes the committed length recoverable by a simple scan.
//!
//! A sector is linked into a file chain only after its own header has
//! been programmed. If power is lost between claiming a sector and
//! linking it, the sector was still fully erased at the time and reads
//! back as free on the next mount, so nothing leaks.
//!
//! ## Concurrency
//!
//! SectorFs issues one flash operation at a time and assumes it has
//! exclusive access to the device for the duration of each call. Sharing
//! a filesystem between threads requires external locking.

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod error_codes;
pub mod flash_controller;
pub mod sectorfs;

pub use crate::error_codes::ErrorCode;
pub use crate::flash_controller::FlashController;
pub use crate::sectorfs::{
    FileHandle, SectorFs, FILE_CIRCULAR, FILE_CREATE, FILE_WRITEABLE, MAX_SECTORS, MODE_CREATE,
    MODE_CREATE_CIRCULAR, MODE_READONLY, MODE_WRITEONLY,
};
