// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! The SectorFs implementation.

use crate::error_codes::ErrorCode;
use crate::flash_controller::FlashController;

/// The maximum number of sectors (erase blocks) a filesystem can manage.
///
/// Sector indices are stored on media in a single byte with `0xFF`
/// reserved as the not-allocated sentinel, so this must stay below 255.
/// Devices with more erase blocks than this only have the first
/// `MAX_SECTORS` blocks managed.
pub const MAX_SECTORS: usize = 64;

/// Create the file; fails if it already exists.
pub const FILE_CREATE: u8 = 0x08;
/// Open the file for appending.
pub const FILE_WRITEABLE: u8 = 0x04;
/// Recycle the oldest sector of the file when the filesystem is full.
/// This is the only mode bit persisted to the media.
pub const FILE_CIRCULAR: u8 = 0x02;

/// Create a new file for writing.
pub const MODE_CREATE: u8 = FILE_CREATE | FILE_WRITEABLE;
/// Create a new circular file for writing.
pub const MODE_CREATE_CIRCULAR: u8 = FILE_CREATE | FILE_WRITEABLE | FILE_CIRCULAR;
/// Append to an existing file.
pub const MODE_WRITEONLY: u8 = FILE_WRITEABLE;
/// Read an existing file from the start.
pub const MODE_READONLY: u8 = 0x00;

// Erased NOR flash reads back all ones, so 0xFF doubles as the
// not-allocated sentinel for every single-byte header field.
pub(crate) const UNALLOCATED: u8 = 0xFF;
pub(crate) const UNALLOCATED_WORD: u32 = 0xFFFF_FFFF;

// A list of offsets into the allocation unit header, which occupies the
// first page of every sector.
pub(crate) const FILE_ID_OFFSET: usize = 0;
pub(crate) const FILE_PROTECT_OFFSET: usize = 1;
pub(crate) const NEXT_ALLOC_UNIT_OFFSET: usize = 2;
pub(crate) const FLAGS_OFFSET: usize = 3;
pub(crate) const ALLOC_COUNTER_OFFSET: usize = 4;
pub(crate) const SESSION_TABLE_OFFSET: usize = 8;
pub(crate) const FILE_INFO_LENGTH: usize = 4;

/// In-memory mirror of the leading bytes of a sector's allocation unit
/// header. One of these is cached per sector for the lifetime of the
/// filesystem; the session table that follows them on media is only ever
/// scanned in place.
#[derive(Clone, Copy)]
struct AllocUnitHeader {
    file_id: u8,
    file_protect: u8,
    next_allocation_unit: u8,
    // Mode flags in the low nibble (only FILE_CIRCULAR persists), user
    // flags in the high nibble.
    flags: u8,
    alloc_counter: u32,
}

impl AllocUnitHeader {
    const ERASED: AllocUnitHeader = AllocUnitHeader {
        file_id: UNALLOCATED,
        file_protect: UNALLOCATED,
        next_allocation_unit: UNALLOCATED,
        flags: UNALLOCATED,
        alloc_counter: UNALLOCATED_WORD,
    };

    fn from_bytes(buf: &[u8; SESSION_TABLE_OFFSET]) -> AllocUnitHeader {
        AllocUnitHeader {
            file_id: buf[FILE_ID_OFFSET],
            file_protect: buf[FILE_PROTECT_OFFSET],
            next_allocation_unit: buf[NEXT_ALLOC_UNIT_OFFSET],
            flags: buf[FLAGS_OFFSET],
            alloc_counter: u32::from_le_bytes([
                buf[ALLOC_COUNTER_OFFSET],
                buf[ALLOC_COUNTER_OFFSET + 1],
                buf[ALLOC_COUNTER_OFFSET + 2],
                buf[ALLOC_COUNTER_OFFSET + 3],
            ]),
        }
    }

    // The first four header bytes, the part rewritten when a sector is
    // claimed or linked.
    fn file_info_bytes(&self) -> [u8; FILE_INFO_LENGTH] {
        [
            self.file_id,
            self.file_protect,
            self.next_allocation_unit,
            self.flags,
        ]
    }

    fn is_free(&self) -> bool {
        self.file_id == UNALLOCATED
    }

    fn mode_flags(&self) -> u8 {
        self.flags & 0x0F
    }

    fn user_flags(&self) -> u8 {
        (self.flags >> 4) & 0x0F
    }
}

/// An opaque reference to an open file.
///
/// Handles are only minted by [`SectorFs::open`] and become invalid at
/// [`SectorFs::close`]. Every operation validates the handle against the
/// filesystem's slot table and reports `ErrorCode::InvalidHandle` for
/// tokens it does not currently own.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileHandle(u8);

/// Volatile per-open-file state, one slot per handle.
struct Handle<const P: usize> {
    open: bool,
    file_id: u8,
    mode_flags: u8,
    user_flags: u8,
    /// First sector of the chain; UNALLOCATED until one is claimed.
    root_allocation_unit: u8,
    /// Sector currently being read or written.
    curr_allocation_unit: u8,
    /// Session table slot that receives the next commit; UNALLOCATED once
    /// the table is exhausted.
    curr_session_offset: u8,
    /// Most recent value already committed to the session table.
    curr_session_value: u32,
    /// Readers: end of committed data in the current sector.
    /// Writers: last position actually programmed to flash.
    last_data_offset: u32,
    /// Read cursor, or write cursor including cached bytes.
    curr_data_offset: u32,
    page_cache: [u8; P],
}

impl<const P: usize> Handle<P> {
    const FREE: Handle<P> = Handle {
        open: false,
        file_id: UNALLOCATED,
        mode_flags: 0,
        user_flags: 0,
        root_allocation_unit: UNALLOCATED,
        curr_allocation_unit: UNALLOCATED,
        curr_session_offset: UNALLOCATED,
        curr_session_value: 0,
        last_data_offset: 0,
        curr_data_offset: 0,
        page_cache: [0; P],
    };

    // Writer invariant: curr_data_offset never trails last_data_offset and
    // the gap is exactly what the page cache holds.
    fn cached_bytes(&self) -> u32 {
        self.curr_data_offset - self.last_data_offset
    }

    fn is_writeable(&self) -> bool {
        self.mode_flags & FILE_WRITEABLE != 0
    }
}

/// Odd population count encodes "protected". Starting from the erased
/// 0xFF, each state change clears one more bit so the byte never needs a
/// re-erase.
fn is_protected(protection_bits: u8) -> bool {
    protection_bits.count_ones() & 1 == 1
}

fn set_protected(prot: bool, protection_bits: u8) -> u8 {
    // Only update the bits if the current parity does not match the
    // required protection state. Once every bit is cleared the byte is
    // pinned and further requests change nothing.
    if prot != is_protected(protection_bits) {
        protection_bits & protection_bits.wrapping_sub(1)
    } else {
        protection_bits
    }
}

/// The main SectorFs struct.
///
/// `C` is an implementation of the [`FlashController`] trait.
/// `P` is the flash page size in bytes; it sets the size of the
/// allocation unit header page and of the per-handle page cache.
/// `H` is the number of handle slots (at most 255).
pub struct SectorFs<C: FlashController, const P: usize, const H: usize> {
    controller: C,
    sector_size: usize,
    num_sectors: usize,
    alloc_units: [AllocUnitHeader; MAX_SECTORS],
    handles: [Handle<P>; H],
}

impl<C: FlashController, const P: usize, const H: usize> SectorFs<C, P, H> {
    /// Number of session commit slots in a sector's header page. Slot
    /// indices live in a u8 with 0xFF reserved, which caps the table at
    /// 254 entries for large pages.
    const NUM_WRITE_SESSIONS: usize = {
        let slots = (P - SESSION_TABLE_OFFSET) / 4;
        if slots > 254 {
            254
        } else {
            slots
        }
    };

    /// Mount a filesystem from the device behind `controller`.
    ///
    /// `sector_size` is the erase block size in bytes; it must be a
    /// multiple of the page size `P`, and `P` must hold the 8 byte header
    /// plus at least one session slot. The number of managed sectors is
    /// the device capacity divided by `sector_size`, capped at
    /// [`MAX_SECTORS`].
    ///
    /// Mounting reads the allocation unit header of every sector to build
    /// the in-memory sector table. The media is not otherwise validated.
    pub fn new(controller: C, sector_size: usize) -> Result<Self, ErrorCode> {
        if P < SESSION_TABLE_OFFSET + 4 || sector_size <= P || sector_size % P != 0 || H > 255 {
            return Err(ErrorCode::BadDevice);
        }

        let num_sectors = core::cmp::min(controller.capacity() / sector_size, MAX_SECTORS);
        let mut fs = SectorFs {
            controller,
            sector_size,
            num_sectors,
            alloc_units: [AllocUnitHeader::ERASED; MAX_SECTORS],
            handles: [Handle::FREE; H],
        };

        for sector in 0..fs.num_sectors as u8 {
            let mut buf = [0; SESSION_TABLE_OFFSET];
            fs.controller.read(fs.sector_address(sector), &mut buf)?;
            fs.alloc_units[sector as usize] = AllocUnitHeader::from_bytes(&buf);
        }

        Ok(fs)
    }

    fn sector_address(&self, sector: u8) -> usize {
        sector as usize * self.sector_size
    }

    // Bytes of file data payload per sector; the first page holds the
    // allocation unit header.
    fn usable_size(&self) -> usize {
        self.sector_size - P
    }

    /// The next link of `sector`, with out-of-range values from corrupt
    /// media treated as the end of the chain so a bad link can never index
    /// outside the sector table.
    fn chain_next(&self, sector: u8) -> u8 {
        let next = self.alloc_units[sector as usize].next_allocation_unit;
        if (next as usize) < self.num_sectors {
            next
        } else {
            UNALLOCATED
        }
    }

    fn is_last_allocation_unit(&self, sector: u8) -> bool {
        self.chain_next(sector) == UNALLOCATED
    }

    /// Resolve a file id to the root sector of its chain, or UNALLOCATED
    /// if no sector carries the id.
    ///
    /// Scans the sector table once to build a transient reverse-link
    /// index, then walks backwards from the first matching sector until a
    /// sector with no parent is found. The walk is bounded so a corrupt
    /// circular chain terminates at an arbitrary member instead of
    /// looping.
    fn find_file_root(&self, file_id: u8) -> u8 {
        if file_id == UNALLOCATED {
            return UNALLOCATED;
        }

        let mut parent = [UNALLOCATED; MAX_SECTORS];
        let mut root = UNALLOCATED;

        for sector in 0..self.num_sectors as u8 {
            if self.alloc_units[sector as usize].file_id == file_id {
                let next = self.chain_next(sector);
                if next != UNALLOCATED {
                    parent[next as usize] = sector;
                }
                // Arbitrarily keep the first matching sector as the
                // candidate root.
                if root == UNALLOCATED {
                    root = sector;
                }
            }
        }

        for _ in 0..MAX_SECTORS {
            if root == UNALLOCATED || parent[root as usize] == UNALLOCATED {
                break;
            }
            root = parent[root as usize];
        }

        root
    }

    /// Pick the free sector to claim next: a never-used sector if one
    /// exists, otherwise the free sector with the lowest erase count
    /// (ties broken by lowest index).
    fn find_free_allocation_unit(&self) -> u8 {
        let mut min_alloc_counter = UNALLOCATED_WORD;
        let mut free_sector = UNALLOCATED;

        for sector in 0..self.num_sectors as u8 {
            let unit = &self.alloc_units[sector as usize];
            if unit.is_free() {
                if unit.alloc_counter == UNALLOCATED_WORD {
                    // Fresh from the factory, use it first.
                    return sector;
                }
                if unit.alloc_counter < min_alloc_counter {
                    min_alloc_counter = unit.alloc_counter;
                    free_sector = sector;
                }
            }
        }

        free_sector
    }

    fn find_last_allocation_unit(&self, root: u8) -> u8 {
        let mut sector = root;
        for _ in 0..MAX_SECTORS {
            if sector == UNALLOCATED || self.is_last_allocation_unit(sector) {
                break;
            }
            sector = self.chain_next(sector);
        }
        sector
    }

    /// Scan a sector's session table on flash. Returns the index of the
    /// first unused slot (UNALLOCATED when the table is exhausted) and the
    /// last committed data offset, zero if nothing was ever committed.
    fn find_next_session_offset(&self, sector: u8) -> Result<(u8, u32), ErrorCode> {
        let mut page = [0; P];
        self.controller
            .read(self.sector_address(sector), &mut page)?;

        let mut data_offset = 0;
        let mut session_offset = UNALLOCATED;
        for slot in 0..Self::NUM_WRITE_SESSIONS {
            let at = SESSION_TABLE_OFFSET + 4 * slot;
            let value = u32::from_le_bytes([page[at], page[at + 1], page[at + 2], page[at + 3]]);
            if value == UNALLOCATED_WORD {
                session_offset = slot as u8;
                break;
            }
            // Slots are committed in order, so the last used one holds the
            // committed length.
            data_offset = value;
        }

        Ok((session_offset, data_offset))
    }

    /// Erase `sector` and carry its allocation counter forward,
    /// incremented, so the wear history survives the erase.
    fn erase_allocation_unit(&mut self, sector: u8) -> Result<(), ErrorCode> {
        let new_alloc_counter = self.alloc_units[sector as usize].alloc_counter.wrapping_add(1);

        self.controller.erase_block(self.sector_address(sector))?;

        self.alloc_units[sector as usize] = AllocUnitHeader::ERASED;
        self.alloc_units[sector as usize].alloc_counter = new_alloc_counter;

        self.controller.write(
            self.sector_address(sector) + ALLOC_COUNTER_OFFSET,
            &new_alloc_counter.to_le_bytes(),
        )
    }

    fn allocate_handle(&mut self) -> Result<usize, ErrorCode> {
        for index in 0..H {
            if !self.handles[index].open {
                self.handles[index] = Handle::FREE;
                self.handles[index].open = true;
                return Ok(index);
            }
        }
        Err(ErrorCode::NoFreeHandle)
    }

    fn handle_index(&self, handle: FileHandle) -> Result<usize, ErrorCode> {
        let index = handle.0 as usize;
        if index >= H || !self.handles[index].open {
            return Err(ErrorCode::InvalidHandle);
        }
        Ok(index)
    }

    fn check_file_flags(&self, root: u8, mode: u8) -> Result<(), ErrorCode> {
        if root == UNALLOCATED {
            // The file does not exist, so unless this is a create request
            // the open fails.
            if mode & FILE_CREATE == 0 {
                return Err(ErrorCode::FileNotFound);
            }
        } else {
            if mode & FILE_CREATE != 0 {
                return Err(ErrorCode::FileAlreadyExists);
            }
            let protection_bits = self.alloc_units[root as usize].file_protect;
            if mode & FILE_WRITEABLE != 0 && is_protected(protection_bits) {
                return Err(ErrorCode::FileProtected);
            }
        }
        Ok(())
    }

    fn is_eof(&self, index: usize) -> bool {
        let handle = &self.handles[index];
        handle.last_data_offset == handle.curr_data_offset
            && self.is_last_allocation_unit(handle.curr_allocation_unit)
    }

    fn is_full(&self, index: usize) -> bool {
        let handle = &self.handles[index];
        handle.curr_session_offset == UNALLOCATED
            || handle.curr_data_offset >= self.usable_size() as u32
    }

    /// Program whatever the page cache holds at the current write
    /// position. The cache fill policy keeps the content inside one page
    /// window, so this is always a single partial or full page program.
    fn flush_page_cache(&mut self, index: usize) -> Result<(), ErrorCode> {
        let handle = &self.handles[index];
        let size = handle.cached_bytes() as usize;
        if size > 0 {
            let address = self.sector_address(handle.curr_allocation_unit)
                + P
                + handle.last_data_offset as usize;
            self.controller.write(address, &handle.page_cache[..size])?;
            self.handles[index].last_data_offset = self.handles[index].curr_data_offset;
        }
        Ok(())
    }

    /// Append the current committed length to the sector's session table,
    /// unless the last commit already recorded it.
    fn update_session_offset(&mut self, index: usize) -> Result<(), ErrorCode> {
        let handle = &self.handles[index];
        if handle.last_data_offset == handle.curr_session_value {
            return Ok(());
        }

        let address = self.sector_address(handle.curr_allocation_unit)
            + SESSION_TABLE_OFFSET
            + 4 * handle.curr_session_offset as usize;
        self.controller
            .write(address, &handle.last_data_offset.to_le_bytes())?;

        let handle = &mut self.handles[index];
        handle.curr_session_value = handle.last_data_offset;
        handle.curr_session_offset += 1;
        if handle.curr_session_offset as usize >= Self::NUM_WRITE_SESSIONS {
            handle.curr_session_offset = UNALLOCATED;
        }
        Ok(())
    }

    fn flush_handle(&mut self, index: usize) -> Result<(), ErrorCode> {
        // No commits are possible once the session table is exhausted.
        if self.handles[index].curr_session_offset == UNALLOCATED {
            return Err(ErrorCode::FilesystemFull);
        }
        self.flush_page_cache(index)?;
        self.update_session_offset(index)
    }

    /// Claim a sector for the handle's file and make it the new tail of
    /// the chain (or the root for a fresh file).
    ///
    /// The commit order matters for power loss: the claimed sector's
    /// header only becomes reachable once the old tail's next link is
    /// programmed, and a crash before that leaves the claimed sector
    /// fully erased, i.e. free again at the next mount.
    fn allocate_new_sector_to_file(&mut self, index: usize) -> Result<(), ErrorCode> {
        let mut sector = self.find_free_allocation_unit();
        if sector == UNALLOCATED {
            let handle = &self.handles[index];
            if handle.mode_flags & FILE_CIRCULAR == 0
                || handle.root_allocation_unit == UNALLOCATED
            {
                return Err(ErrorCode::FilesystemFull);
            }

            // Circular file: recycle the oldest sector. The second sector
            // of the chain, if any, becomes the new root.
            let old_root = handle.root_allocation_unit;
            let new_root = self.chain_next(old_root);
            self.erase_allocation_unit(old_root)?;
            sector = old_root;
            self.handles[index].root_allocation_unit = new_root;
        }

        let handle = &self.handles[index];
        let file_id = handle.file_id;
        let root = handle.root_allocation_unit;
        let prev_tail = handle.curr_allocation_unit;
        let flags = (handle.mode_flags & FILE_CIRCULAR) | ((handle.user_flags & 0x0F) << 4);

        {
            let unit = &mut self.alloc_units[sector as usize];
            unit.file_id = file_id;
            unit.next_allocation_unit = UNALLOCATED;
            unit.flags = flags;
        }

        if root == UNALLOCATED {
            // First sector of a fresh file (or of a fully recycled single
            // sector circular file): it becomes the root, with the protect
            // bits in their erased state.
            self.handles[index].root_allocation_unit = sector;
            self.alloc_units[sector as usize].file_protect = UNALLOCATED;
        } else {
            let protection_bits = self.alloc_units[root as usize].file_protect;
            self.alloc_units[sector as usize].file_protect = protection_bits;

            // The linking commit: the old tail's next byte goes from 0xFF
            // to the new sector index in a single byte program.
            self.alloc_units[prev_tail as usize].next_allocation_unit = sector;
            let info = self.alloc_units[prev_tail as usize].file_info_bytes();
            self.controller
                .write(self.sector_address(prev_tail), &info)?;
        }

        let handle = &mut self.handles[index];
        handle.curr_allocation_unit = sector;
        handle.last_data_offset = 0;
        handle.curr_data_offset = 0;
        handle.curr_session_offset = 0;
        handle.curr_session_value = 0;

        let info = self.alloc_units[sector as usize].file_info_bytes();
        self.controller.write(self.sector_address(sector), &info)
    }

    /// Accept bytes into the page cache, programming through to flash each
    /// time the cache exactly reaches the next page boundary.
    ///
    /// The cache may never hold more than the distance to the next page
    /// boundary, which keeps every program inside one page window and in
    /// strictly increasing address order.
    ///
    /// Returns the number of bytes accepted. If the page program fails
    /// after some of `src` was already accepted, the short count is
    /// returned and the error is left to surface on the next attempt;
    /// with no progress the error is returned directly.
    fn write_through_cache(&mut self, index: usize, src: &[u8]) -> Result<usize, ErrorCode> {
        let handle = &self.handles[index];
        let cached = handle.cached_bytes() as usize;
        let page_boundary = P - (handle.last_data_offset as usize % P);
        let mut written = 0;

        // Fill the cache up to the limit of the next page boundary.
        let size = core::cmp::min(page_boundary - cached, src.len());
        if size > 0 {
            let handle = &mut self.handles[index];
            handle.page_cache[cached..cached + size].copy_from_slice(&src[..size]);
            handle.curr_data_offset += size as u32;
            written += size;
        }

        // Drain once there is exactly enough to reach the boundary.
        if cached + size == page_boundary {
            let handle = &self.handles[index];
            let address = self.sector_address(handle.curr_allocation_unit)
                + P
                + handle.last_data_offset as usize;
            match self
                .controller
                .write(address, &handle.page_cache[..page_boundary])
            {
                Ok(()) => self.handles[index].last_data_offset += page_boundary as u32,
                Err(error) => {
                    return if written > 0 { Ok(written) } else { Err(error) };
                }
            }
        }

        // Whatever is left is less than a page and the cache is empty.
        let remaining = &src[size..];
        if !remaining.is_empty() {
            let handle = &mut self.handles[index];
            handle.page_cache[..remaining.len()].copy_from_slice(remaining);
            handle.curr_data_offset += remaining.len() as u32;
            written += remaining.len();
        }

        Ok(written)
    }

    fn open_handle(
        &mut self,
        index: usize,
        root: u8,
        mode: u8,
        user_flags: Option<&mut u8>,
    ) -> Result<(), ErrorCode> {
        if root != UNALLOCATED {
            let unit = &self.alloc_units[root as usize];
            let persisted_user = unit.user_flags();
            let persisted_mode = unit.mode_flags();
            {
                let handle = &mut self.handles[index];
                handle.root_allocation_unit = root;
                handle.user_flags = persisted_user;
                // The persisted circular bit survives every reopen.
                handle.mode_flags = persisted_mode | (mode & 0x0F);
            }
            if let Some(user) = user_flags {
                *user = persisted_user;
            }

            if mode & FILE_WRITEABLE == 0 {
                // Reading starts at the beginning of the root sector; its
                // session table bounds what is readable there.
                let (_, data_offset) = self.find_next_session_offset(root)?;
                let handle = &mut self.handles[index];
                handle.curr_allocation_unit = root;
                handle.curr_data_offset = 0;
                handle.last_data_offset = data_offset;
            } else {
                // Appending starts at the committed end of the tail
                // sector, with an empty page cache.
                let tail = self.find_last_allocation_unit(root);
                let (session_offset, data_offset) = self.find_next_session_offset(tail)?;
                let handle = &mut self.handles[index];
                handle.curr_allocation_unit = tail;
                handle.curr_session_offset = session_offset;
                handle.curr_session_value = data_offset;
                handle.curr_data_offset = data_offset;
                handle.last_data_offset = data_offset;
            }
            Ok(())
        } else {
            {
                let handle = &mut self.handles[index];
                handle.mode_flags = mode & 0x0F;
                handle.user_flags = user_flags.map_or(0, |user| *user & 0x0F);
            }
            // A fresh file claims its first sector immediately.
            self.allocate_new_sector_to_file(index)
        }
    }

    /// Erase every managed sector.
    ///
    /// Existing files are destroyed. The per-sector allocation counters
    /// are incremented and carried forward so wear leveling keeps working
    /// across formats.
    pub fn format(&mut self) -> Result<(), ErrorCode> {
        for sector in 0..self.num_sectors as u8 {
            self.erase_allocation_unit(sector)?;
        }
        Ok(())
    }

    /// Open the file `file_id` (0 to 254) in the given mode.
    ///
    /// `mode` is a combination of [`FILE_CREATE`], [`FILE_WRITEABLE`] and
    /// [`FILE_CIRCULAR`]; see the `MODE_*` shorthands. Opening a missing
    /// file without `FILE_CREATE` fails with `FileNotFound`, opening an
    /// existing one with `FILE_CREATE` fails with `FileAlreadyExists`, and
    /// opening a protected file writeable fails with `FileProtected`.
    ///
    /// `user_flags` carries the four application-defined flag bits kept in
    /// the file's header: when creating, the value passed in (low nibble)
    /// is persisted; when opening an existing file the persisted value is
    /// written back out.
    ///
    /// Creating a file claims its first sector immediately, so creation
    /// on a full filesystem fails with `FilesystemFull` and releases the
    /// handle.
    pub fn open(
        &mut self,
        file_id: u8,
        mode: u8,
        user_flags: Option<&mut u8>,
    ) -> Result<FileHandle, ErrorCode> {
        // The sentinel id must never reach the media, where it would read
        // back as a free sector.
        if file_id == UNALLOCATED {
            return Err(ErrorCode::FileNotFound);
        }

        let root = self.find_file_root(file_id);
        self.check_file_flags(root, mode)?;

        let index = self.allocate_handle()?;
        self.handles[index].file_id = file_id;

        match self.open_handle(index, root, mode, user_flags) {
            Ok(()) => Ok(FileHandle(index as u8)),
            Err(error) => {
                self.handles[index].open = false;
                Err(error)
            }
        }
    }

    /// Close an open file, committing any pending writes first on a best
    /// effort basis, and release its handle slot.
    pub fn close(&mut self, handle: FileHandle) -> Result<(), ErrorCode> {
        let index = self.handle_index(handle)?;
        if self.handles[index].is_writeable() {
            let _ = self.flush_handle(index);
        }
        self.handles[index].open = false;
        Ok(())
    }

    /// Commit the handle's pending writes: drain the page cache to flash
    /// and record the new committed length in the sector's session table.
    ///
    /// Flushing twice without intervening writes consumes a single
    /// session slot; once a sector's table is exhausted flushing there
    /// fails with `FilesystemFull` until the chain grows into a fresh
    /// sector.
    pub fn flush(&mut self, handle: FileHandle) -> Result<(), ErrorCode> {
        let index = self.handle_index(handle)?;
        if !self.handles[index].is_writeable() {
            return Err(ErrorCode::InvalidMode);
        }
        self.flush_handle(index)
    }

    /// Read from the file into `dest`, advancing across the sector chain
    /// as needed.
    ///
    /// Returns the number of bytes read, which is short only at the end
    /// of the chain. A read attempted at end of file fails with
    /// `EndOfFile`. If the device fails after some bytes were already
    /// read, the short count is returned and the error surfaces on the
    /// next call.
    pub fn read(&mut self, handle: FileHandle, dest: &mut [u8]) -> Result<usize, ErrorCode> {
        let index = self.handle_index(handle)?;
        if self.handles[index].is_writeable() {
            return Err(ErrorCode::InvalidMode);
        }
        if self.is_eof(index) {
            return Err(ErrorCode::EndOfFile);
        }

        let mut read = 0;
        while read < dest.len() {
            let handle = &self.handles[index];
            if handle.last_data_offset == handle.curr_data_offset {
                // Everything committed in this sector is consumed; move to
                // the next sector of the chain, if there is one.
                if self.is_last_allocation_unit(handle.curr_allocation_unit) {
                    break;
                }
                let sector = self.chain_next(handle.curr_allocation_unit);
                let (_, data_offset) = match self.find_next_session_offset(sector) {
                    Ok(eof) => eof,
                    Err(error) => return if read > 0 { Ok(read) } else { Err(error) },
                };
                let handle = &mut self.handles[index];
                handle.curr_allocation_unit = sector;
                handle.curr_data_offset = 0;
                handle.last_data_offset = data_offset;
                continue;
            }

            let handle = &self.handles[index];
            let read_size = core::cmp::min(
                dest.len() - read,
                (handle.last_data_offset - handle.curr_data_offset) as usize,
            );
            let address = self.sector_address(handle.curr_allocation_unit)
                + P
                + handle.curr_data_offset as usize;
            if let Err(error) = self
                .controller
                .read(address, &mut dest[read..read + read_size])
            {
                return if read > 0 { Ok(read) } else { Err(error) };
            }
            read += read_size;
            self.handles[index].curr_data_offset += read_size as u32;
        }

        Ok(read)
    }

    /// Write `src` to the file through the page cache, growing the sector
    /// chain as sectors fill up.
    ///
    /// Returns the number of bytes accepted. The count is short only when
    /// an error interrupted the write; the error itself is reported by
    /// the next call, so the total accumulated across calls always
    /// reflects exactly what the filesystem accepted. An error with no
    /// progress is returned directly, `FilesystemFull` once no sector can
    /// be claimed (and the file is not circular).
    pub fn write(&mut self, handle: FileHandle, src: &[u8]) -> Result<usize, ErrorCode> {
        let index = self.handle_index(handle)?;
        if !self.handles[index].is_writeable() {
            return Err(ErrorCode::InvalidMode);
        }

        let mut written = 0;
        while written < src.len() {
            if self.is_full(index) {
                // Commit this sector before leaving it. An exhausted
                // session table is not fatal here; the allocation below
                // reports the filesystem state.
                match self.flush_handle(index) {
                    Ok(()) | Err(ErrorCode::FilesystemFull) => {}
                    Err(error) => return if written > 0 { Ok(written) } else { Err(error) },
                }
                if let Err(error) = self.allocate_new_sector_to_file(index) {
                    return if written > 0 { Ok(written) } else { Err(error) };
                }
            }

            // Clip to one page and to the room left in this sector, so
            // the cache never absorbs bytes that could not be placed.
            let handle = &self.handles[index];
            let write_size = core::cmp::min(
                core::cmp::min(P, src.len() - written),
                self.usable_size() - handle.curr_data_offset as usize,
            );

            match self.write_through_cache(index, &src[written..written + write_size]) {
                Ok(accepted) => {
                    written += accepted;
                    if accepted < write_size {
                        // A page program failed mid-write; report what
                        // went through and let the next call surface the
                        // error.
                        break;
                    }
                }
                Err(error) => return if written > 0 { Ok(written) } else { Err(error) },
            }
        }

        Ok(written)
    }

    /// Write-protect the file. Protection blocks writeable opens and
    /// [`SectorFs::remove`] until [`SectorFs::unprotect`] is called.
    ///
    /// The state is stored as the bit parity of one header byte and each
    /// change clears a bit, so after roughly seven toggles the byte is
    /// exhausted and further protect or unprotect requests are silent
    /// no-ops.
    pub fn protect(&mut self, file_id: u8) -> Result<(), ErrorCode> {
        self.set_protect(file_id, true)
    }

    /// Remove write protection from the file. See [`SectorFs::protect`]
    /// for the parity scheme and its exhaustion behavior.
    pub fn unprotect(&mut self, file_id: u8) -> Result<(), ErrorCode> {
        self.set_protect(file_id, false)
    }

    fn set_protect(&mut self, file_id: u8, prot: bool) -> Result<(), ErrorCode> {
        let root = self.find_file_root(file_id);
        if root == UNALLOCATED {
            return Err(ErrorCode::FileNotFound);
        }

        let protection_bits = self.alloc_units[root as usize].file_protect;
        if prot == is_protected(protection_bits) {
            return Ok(());
        }

        let file_protect = set_protected(prot, protection_bits);
        self.controller.write(
            self.sector_address(root) + FILE_PROTECT_OFFSET,
            &[file_protect],
        )?;
        self.alloc_units[root as usize].file_protect = file_protect;

        Ok(())
    }

    /// Delete the file, erasing every sector of its chain.
    ///
    /// Fails with `FileNotFound` if no such file exists and with
    /// `FileProtected` if it is write-protected.
    pub fn remove(&mut self, file_id: u8) -> Result<(), ErrorCode> {
        let root = self.find_file_root(file_id);
        if root == UNALLOCATED {
            return Err(ErrorCode::FileNotFound);
        }
        if is_protected(self.alloc_units[root as usize].file_protect) {
            return Err(ErrorCode::FileProtected);
        }

        let mut sector = root;
        while sector != UNALLOCATED {
            // Grab the next link before the erase resets the header.
            let next = self.chain_next(sector);
            self.erase_allocation_unit(sector)?;
            sector = next;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::cell::RefCell;
    use std::rc::Rc;

    const PAGE_SIZE: usize = 512;
    const SECTOR_SIZE: usize = 256 * 1024;
    const CAPACITY: usize = MAX_SECTORS * SECTOR_SIZE;

    // Reduced geometry for the chain and recycling tests: four sectors of
    // 2 KiB, three data pages each.
    const SMALL_SECTOR_SIZE: usize = 2048;
    const SMALL_CAPACITY: usize = 4 * SMALL_SECTOR_SIZE;
    const SMALL_USABLE: usize = SMALL_SECTOR_SIZE - PAGE_SIZE;

    /// A RAM-backed flash controller with NOR semantics: programs can only
    /// clear bits and erases return a whole block to 0xFF.
    #[derive(Clone)]
    struct FlashCtrl {
        buf: Rc<RefCell<Vec<u8>>>,
        block_size: usize,
        fail_writes: Rc<Cell<bool>>,
    }

    impl FlashCtrl {
        fn new(capacity: usize, block_size: usize) -> Self {
            Self {
                buf: Rc::new(RefCell::new(vec![0xFF; capacity])),
                block_size,
                fail_writes: Rc::new(Cell::new(false)),
            }
        }

        fn read_u32(&self, address: usize) -> u32 {
            let flash = self.buf.borrow();
            u32::from_le_bytes([
                flash[address],
                flash[address + 1],
                flash[address + 2],
                flash[address + 3],
            ])
        }
    }

    impl FlashController for FlashCtrl {
        fn read(&self, address: usize, buf: &mut [u8]) -> Result<(), ErrorCode> {
            buf.copy_from_slice(&self.buf.borrow()[address..address + buf.len()]);
            Ok(())
        }

        fn write(&self, address: usize, buf: &[u8]) -> Result<(), ErrorCode> {
            if self.fail_writes.get() {
                return Err(ErrorCode::FlashMedia);
            }
            let mut flash = self.buf.borrow_mut();
            for (i, d) in buf.iter().enumerate() {
                flash[address + i] &= *d;
            }
            Ok(())
        }

        fn erase_block(&self, address: usize) -> Result<(), ErrorCode> {
            let start = address - (address % self.block_size);
            for d in self.buf.borrow_mut()[start..start + self.block_size].iter_mut() {
                *d = 0xFF;
            }
            Ok(())
        }

        fn capacity(&self) -> usize {
            self.buf.borrow().len()
        }
    }

    type TestFs = SectorFs<FlashCtrl, PAGE_SIZE, 1>;

    fn new_fs() -> TestFs {
        TestFs::new(FlashCtrl::new(CAPACITY, SECTOR_SIZE), SECTOR_SIZE).unwrap()
    }

    fn new_small_fs() -> TestFs {
        TestFs::new(
            FlashCtrl::new(SMALL_CAPACITY, SMALL_SECTOR_SIZE),
            SMALL_SECTOR_SIZE,
        )
        .unwrap()
    }

    // A byte pattern whose period is coprime with page and sector sizes,
    // so shifted or recycled data can never alias the expected bytes.
    fn pattern(start: usize, len: usize) -> Vec<u8> {
        (start..start + len).map(|i| (i % 251) as u8).collect()
    }

    fn write_all(fs: &mut TestFs, handle: FileHandle, mut src: &[u8]) {
        while !src.is_empty() {
            let written = fs.write(handle, src).unwrap();
            assert!(written > 0);
            src = &src[written..];
        }
    }

    fn read_to_end(fs: &mut TestFs, handle: FileHandle) -> Vec<u8> {
        let mut data = Vec::new();
        let mut buf = [0; 700];
        loop {
            match fs.read(handle, &mut buf) {
                Ok(read) => {
                    data.extend_from_slice(&buf[..read]);
                    if read == 0 {
                        break;
                    }
                }
                Err(ErrorCode::EndOfFile) => break,
                Err(error) => panic!("read failed: {:?}", error),
            }
        }
        data
    }

    #[test]
    fn remove_none_existent_file() {
        let mut fs = new_fs();
        assert_eq!(fs.remove(0), Err(ErrorCode::FileNotFound));
    }

    #[test]
    fn basic_api_checks() {
        let mut fs = new_fs();
        let wr_buffer: Vec<u8> = (0..1024).map(|i| (i % 256) as u8).collect();
        let mut rd_buffer = [0; 1024];

        let handle = fs.open(0, MODE_CREATE, None).unwrap();
        assert_eq!(
            fs.open(0, MODE_CREATE, None),
            Err(ErrorCode::FileAlreadyExists)
        );
        assert_eq!(fs.write(handle, &wr_buffer), Ok(1024));
        assert_eq!(fs.close(handle), Ok(()));

        let handle = fs.open(0, MODE_READONLY, None).unwrap();
        assert_eq!(fs.read(handle, &mut rd_buffer), Ok(1024));
        assert_eq!(&rd_buffer[..], &wr_buffer[..]);
        assert_eq!(fs.read(handle, &mut rd_buffer), Err(ErrorCode::EndOfFile));
        assert_eq!(fs.close(handle), Ok(()));
        assert_eq!(fs.close(handle), Err(ErrorCode::InvalidHandle));
    }

    #[test]
    fn format_erases_existing_files() {
        let mut fs = new_fs();
        let wr_buffer: Vec<u8> = (0..1024).map(|i| (i % 256) as u8).collect();

        let handle = fs.open(0, MODE_CREATE, None).unwrap();
        assert_eq!(fs.write(handle, &wr_buffer), Ok(1024));
        assert_eq!(fs.close(handle), Ok(()));
        assert_eq!(fs.format(), Ok(()));
        assert_eq!(
            fs.open(0, MODE_READONLY, None),
            Err(ErrorCode::FileNotFound)
        );
    }

    #[test]
    fn many_files_exhaust_all_sectors() {
        let mut fs = new_fs();

        for file_id in 0..MAX_SECTORS as u8 {
            let handle = fs.open(file_id, MODE_CREATE, None).unwrap();
            assert_eq!(fs.close(handle), Ok(()));
        }

        assert_eq!(
            fs.open(MAX_SECTORS as u8, MODE_CREATE, None),
            Err(ErrorCode::FilesystemFull)
        );
    }

    #[test]
    fn create_failure_releases_handle() {
        let mut fs = new_small_fs();

        for file_id in 0..4 {
            let handle = fs.open(file_id, MODE_CREATE, None).unwrap();
            assert_eq!(fs.close(handle), Ok(()));
        }
        assert_eq!(
            fs.open(9, MODE_CREATE, None),
            Err(ErrorCode::FilesystemFull)
        );

        // The failed create must not leak its handle slot.
        let handle = fs.open(0, MODE_READONLY, None).unwrap();
        assert_eq!(fs.close(handle), Ok(()));
    }

    #[test]
    fn open_too_many_handles() {
        let mut fs = new_fs();

        let _handle = fs.open(0, MODE_CREATE, None).unwrap();
        assert_eq!(fs.open(1, MODE_CREATE, None), Err(ErrorCode::NoFreeHandle));
    }

    #[test]
    fn remove_file_and_try_to_open_it() {
        let mut fs = new_fs();

        let handle = fs.open(0, MODE_CREATE, None).unwrap();
        assert_eq!(fs.close(handle), Ok(()));
        assert_eq!(fs.remove(0), Ok(()));
        assert_eq!(
            fs.open(0, MODE_READONLY, None),
            Err(ErrorCode::FileNotFound)
        );
    }

    #[test]
    fn invalid_handles() {
        let mut fs = new_fs();
        let mut buf = [0; 16];

        let bogus = FileHandle(0xde);
        assert_eq!(fs.close(bogus), Err(ErrorCode::InvalidHandle));
        assert_eq!(fs.flush(bogus), Err(ErrorCode::InvalidHandle));
        assert_eq!(fs.read(bogus, &mut buf), Err(ErrorCode::InvalidHandle));
        assert_eq!(fs.write(bogus, &buf), Err(ErrorCode::InvalidHandle));

        let handle = fs.open(0, MODE_CREATE, None).unwrap();
        // One slot past the only valid one.
        assert_eq!(
            fs.close(FileHandle(handle.0 + 1)),
            Err(ErrorCode::InvalidHandle)
        );
        assert_eq!(fs.close(handle), Ok(()));
        // Stale token after close.
        assert_eq!(fs.flush(handle), Err(ErrorCode::InvalidHandle));
    }

    #[test]
    fn single_file_fill_the_flash() {
        let mut fs = new_small_fs();
        let chunk = pattern(0, 1000);
        let max_capacity = 4 * SMALL_USABLE;

        let handle = fs.open(0, MODE_CREATE, None).unwrap();
        let mut total = 0;
        loop {
            match fs.write(handle, &chunk) {
                Ok(written) => total += written,
                Err(ErrorCode::FilesystemFull) => break,
                Err(error) => panic!("write failed: {:?}", error),
            }
        }

        assert_eq!(total, max_capacity);
        assert_eq!(fs.close(handle), Ok(()));
        assert_eq!(
            fs.open(1, MODE_CREATE, None),
            Err(ErrorCode::FilesystemFull)
        );
    }

    #[test]
    fn chained_sectors_round_trip() {
        let mut fs = new_small_fs();
        // Spans two sector boundaries and ends mid-page.
        let data = pattern(0, 2 * SMALL_USABLE + 700);

        let handle = fs.open(5, MODE_CREATE, None).unwrap();
        write_all(&mut fs, handle, &data);
        assert_eq!(fs.close(handle), Ok(()));

        let handle = fs.open(5, MODE_READONLY, None).unwrap();
        assert_eq!(read_to_end(&mut fs, handle), data);
        assert_eq!(fs.close(handle), Ok(()));
    }

    #[test]
    fn circular_file_recycles_oldest_sector() {
        let mut fs = new_small_fs();
        // Five sectors worth of data through a four sector device.
        let data = pattern(0, 5 * SMALL_USABLE);

        let handle = fs.open(0, MODE_CREATE_CIRCULAR, None).unwrap();
        write_all(&mut fs, handle, &data);
        assert_eq!(fs.close(handle), Ok(()));

        // The first sector's worth was recycled; everything after it is
        // still readable, oldest first.
        let handle = fs.open(0, MODE_READONLY, None).unwrap();
        assert_eq!(read_to_end(&mut fs, handle), data[SMALL_USABLE..]);
        assert_eq!(fs.close(handle), Ok(()));
    }

    #[test]
    fn circular_single_sector_file_recycles_in_place() {
        let flash = FlashCtrl::new(SMALL_SECTOR_SIZE, SMALL_SECTOR_SIZE);
        let mut fs = TestFs::new(flash, SMALL_SECTOR_SIZE).unwrap();
        let data = pattern(0, 2 * SMALL_USABLE + 64);

        let handle = fs.open(0, MODE_CREATE_CIRCULAR, None).unwrap();
        write_all(&mut fs, handle, &data);
        assert_eq!(fs.close(handle), Ok(()));

        let handle = fs.open(0, MODE_READONLY, None).unwrap();
        assert_eq!(read_to_end(&mut fs, handle), data[2 * SMALL_USABLE..]);
        assert_eq!(fs.close(handle), Ok(()));
    }

    #[test]
    fn format_cycles_level_wear() {
        let flash = FlashCtrl::new(SMALL_CAPACITY, SMALL_SECTOR_SIZE);
        let mut fs = TestFs::new(flash.clone(), SMALL_SECTOR_SIZE).unwrap();

        for _ in 0..3 {
            assert_eq!(fs.format(), Ok(()));
        }

        // Counters start from the never-used 0xFFFFFFFF and wrap to zero
        // on the first erase.
        for sector in 0..4 {
            let address = sector * SMALL_SECTOR_SIZE + ALLOC_COUNTER_OFFSET;
            assert_eq!(flash.read_u32(address), 2);
        }
    }

    #[test]
    fn create_remove_cycles_level_wear() {
        let flash = FlashCtrl::new(SMALL_CAPACITY, SMALL_SECTOR_SIZE);
        let mut fs = TestFs::new(flash.clone(), SMALL_SECTOR_SIZE).unwrap();
        assert_eq!(fs.format(), Ok(()));

        // Each cycle claims the least-worn sector and erases it again on
        // remove, so the erases rotate across the whole device.
        for _ in 0..8 {
            let handle = fs.open(0, MODE_CREATE, None).unwrap();
            assert_eq!(fs.close(handle), Ok(()));
            assert_eq!(fs.remove(0), Ok(()));
        }

        for sector in 0..4 {
            let address = sector * SMALL_SECTOR_SIZE + ALLOC_COUNTER_OFFSET;
            assert_eq!(flash.read_u32(address), 2);
        }
    }

    #[test]
    fn flush_is_idempotent() {
        let flash = FlashCtrl::new(SMALL_CAPACITY, SMALL_SECTOR_SIZE);
        let mut fs = TestFs::new(flash.clone(), SMALL_SECTOR_SIZE).unwrap();

        let handle = fs.open(0, MODE_CREATE, None).unwrap();
        assert_eq!(fs.write(handle, &pattern(0, 10)), Ok(10));
        assert_eq!(fs.flush(handle), Ok(()));
        assert_eq!(fs.flush(handle), Ok(()));

        // Two flushes with nothing new committed use a single slot.
        assert_eq!(flash.read_u32(SESSION_TABLE_OFFSET), 10);
        assert_eq!(flash.read_u32(SESSION_TABLE_OFFSET + 4), UNALLOCATED_WORD);

        assert_eq!(fs.write(handle, &pattern(10, 5)), Ok(5));
        assert_eq!(fs.flush(handle), Ok(()));
        assert_eq!(flash.read_u32(SESSION_TABLE_OFFSET + 4), 15);
        assert_eq!(fs.close(handle), Ok(()));
    }

    #[test]
    fn session_table_exhaustion_grows_chain() {
        let mut fs = new_small_fs();
        let sessions = (PAGE_SIZE - SESSION_TABLE_OFFSET) / 4;

        let handle = fs.open(0, MODE_CREATE, None).unwrap();
        for i in 0..sessions {
            assert_eq!(fs.write(handle, &[(i % 251) as u8]), Ok(1));
            assert_eq!(fs.flush(handle), Ok(()));
        }

        // The root's table is spent even though its payload is nearly
        // empty; the next commit is impossible there.
        assert_eq!(fs.flush(handle), Err(ErrorCode::FilesystemFull));

        // A write still succeeds by growing the chain into a new sector.
        assert_eq!(fs.write(handle, &[(sessions % 251) as u8]), Ok(1));
        assert_eq!(fs.close(handle), Ok(()));

        let handle = fs.open(0, MODE_READONLY, None).unwrap();
        assert_eq!(read_to_end(&mut fs, handle), pattern(0, sessions + 1));
        assert_eq!(fs.close(handle), Ok(()));
    }

    #[test]
    fn interleaved_writers_keep_chains_intact() {
        let flash = FlashCtrl::new(SMALL_CAPACITY, SMALL_SECTOR_SIZE);
        let mut fs = SectorFs::<FlashCtrl, PAGE_SIZE, 2>::new(flash, SMALL_SECTOR_SIZE).unwrap();
        let data_a = pattern(0, SMALL_USABLE + 300);
        let data_b = pattern(7, SMALL_USABLE + 200);

        let handle_a = fs.open(10, MODE_CREATE, None).unwrap();
        let handle_b = fs.open(11, MODE_CREATE, None).unwrap();

        // Alternate so the two chains claim interleaved sectors.
        let mut a = &data_a[..];
        let mut b = &data_b[..];
        while !a.is_empty() || !b.is_empty() {
            if !a.is_empty() {
                let n = core::cmp::min(600, a.len());
                assert_eq!(fs.write(handle_a, &a[..n]), Ok(n));
                a = &a[n..];
            }
            if !b.is_empty() {
                let n = core::cmp::min(600, b.len());
                assert_eq!(fs.write(handle_b, &b[..n]), Ok(n));
                b = &b[n..];
            }
        }
        assert_eq!(fs.close(handle_a), Ok(()));
        assert_eq!(fs.close(handle_b), Ok(()));

        for (file_id, expect) in [(10u8, &data_a), (11u8, &data_b)] {
            let handle = fs.open(file_id, MODE_READONLY, None).unwrap();
            let mut data = Vec::new();
            let mut buf = [0; 256];
            loop {
                match fs.read(handle, &mut buf) {
                    Ok(read) if read > 0 => data.extend_from_slice(&buf[..read]),
                    _ => break,
                }
            }
            assert_eq!(data, *expect);
            assert_eq!(fs.close(handle), Ok(()));
        }
    }

    #[test]
    fn append_reopen_continues_at_eof() {
        let mut fs = new_small_fs();

        let handle = fs.open(0, MODE_CREATE, None).unwrap();
        assert_eq!(fs.write(handle, &pattern(0, 10)), Ok(10));
        assert_eq!(fs.close(handle), Ok(()));

        assert_eq!(
            fs.open(1, MODE_WRITEONLY, None),
            Err(ErrorCode::FileNotFound)
        );

        let handle = fs.open(0, MODE_WRITEONLY, None).unwrap();
        assert_eq!(fs.write(handle, &pattern(10, 10)), Ok(10));
        assert_eq!(fs.close(handle), Ok(()));

        let handle = fs.open(0, MODE_READONLY, None).unwrap();
        assert_eq!(read_to_end(&mut fs, handle), pattern(0, 20));
        assert_eq!(fs.close(handle), Ok(()));
    }

    #[test]
    fn user_flags_survive_remount() {
        let flash = FlashCtrl::new(SMALL_CAPACITY, SMALL_SECTOR_SIZE);
        let mut fs = TestFs::new(flash.clone(), SMALL_SECTOR_SIZE).unwrap();

        let mut user_flags = 0x5;
        let handle = fs.open(3, MODE_CREATE, Some(&mut user_flags)).unwrap();
        assert_eq!(fs.write(handle, &pattern(0, 32)), Ok(32));
        assert_eq!(fs.close(handle), Ok(()));

        // A fresh mount rebuilds the sector table from the media alone.
        let mut fs = TestFs::new(flash, SMALL_SECTOR_SIZE).unwrap();
        let mut user_flags = 0;
        let handle = fs.open(3, MODE_READONLY, Some(&mut user_flags)).unwrap();
        assert_eq!(user_flags, 0x5);
        assert_eq!(read_to_end(&mut fs, handle), pattern(0, 32));
        assert_eq!(fs.close(handle), Ok(()));
    }

    #[test]
    fn protect_round_trip() {
        let mut fs = new_small_fs();

        let handle = fs.open(0, MODE_CREATE, None).unwrap();
        assert_eq!(fs.close(handle), Ok(()));

        assert_eq!(fs.protect(9), Err(ErrorCode::FileNotFound));
        assert_eq!(fs.protect(0), Ok(()));
        // Protecting twice must not consume another parity bit.
        assert_eq!(fs.protect(0), Ok(()));

        assert_eq!(
            fs.open(0, MODE_WRITEONLY, None),
            Err(ErrorCode::FileProtected)
        );
        assert_eq!(fs.remove(0), Err(ErrorCode::FileProtected));

        // Reading stays allowed.
        let handle = fs.open(0, MODE_READONLY, None).unwrap();
        assert_eq!(fs.close(handle), Ok(()));

        assert_eq!(fs.unprotect(0), Ok(()));
        let handle = fs.open(0, MODE_WRITEONLY, None).unwrap();
        assert_eq!(fs.close(handle), Ok(()));
        assert_eq!(fs.remove(0), Ok(()));
    }

    #[test]
    fn protect_parity_exhausts_silently() {
        let mut fs = new_small_fs();

        let handle = fs.open(0, MODE_CREATE, None).unwrap();
        assert_eq!(fs.close(handle), Ok(()));

        // Each state change clears one of the eight parity bits.
        for _ in 0..4 {
            assert_eq!(fs.protect(0), Ok(()));
            assert_eq!(fs.unprotect(0), Ok(()));
        }

        // All bits are spent; protection can no longer engage.
        assert_eq!(fs.protect(0), Ok(()));
        let handle = fs.open(0, MODE_WRITEONLY, None).unwrap();
        assert_eq!(fs.close(handle), Ok(()));
    }

    #[test]
    fn write_media_error_is_reported() {
        let flash = FlashCtrl::new(SMALL_CAPACITY, SMALL_SECTOR_SIZE);
        let mut fs = TestFs::new(flash.clone(), SMALL_SECTOR_SIZE).unwrap();
        let data = pattern(0, PAGE_SIZE + 88);

        let handle = fs.open(0, MODE_CREATE, None).unwrap();
        flash.fail_writes.set(true);

        // The first page's worth is accepted into the cache before the
        // program fails; the error itself surfaces on the next call.
        assert_eq!(fs.write(handle, &data), Ok(PAGE_SIZE));
        assert_eq!(
            fs.write(handle, &data[PAGE_SIZE..]),
            Err(ErrorCode::FlashMedia)
        );
        assert_eq!(fs.flush(handle), Err(ErrorCode::FlashMedia));

        // Once the device recovers the cached page drains and commits.
        flash.fail_writes.set(false);
        assert_eq!(fs.flush(handle), Ok(()));
        assert_eq!(fs.close(handle), Ok(()));

        let handle = fs.open(0, MODE_READONLY, None).unwrap();
        assert_eq!(read_to_end(&mut fs, handle), data[..PAGE_SIZE]);
        assert_eq!(fs.close(handle), Ok(()));
    }

    #[test]
    fn read_write_mode_checks() {
        let mut fs = new_small_fs();
        let mut buf = [0; 8];

        let writer = fs.open(0, MODE_CREATE, None).unwrap();
        assert_eq!(fs.read(writer, &mut buf), Err(ErrorCode::InvalidMode));
        assert_eq!(fs.close(writer), Ok(()));

        let reader = fs.open(0, MODE_READONLY, None).unwrap();
        assert_eq!(fs.write(reader, &buf), Err(ErrorCode::InvalidMode));
        assert_eq!(fs.flush(reader), Err(ErrorCode::InvalidMode));
        assert_eq!(fs.close(reader), Ok(()));
    }

    #[test]
    fn rejects_bad_geometry() {
        // Sector size must be a positive multiple of the page size and
        // leave room for file data.
        assert!(matches!(
            TestFs::new(FlashCtrl::new(8192, 1000), 1000),
            Err(ErrorCode::BadDevice)
        ));
        assert!(matches!(
            TestFs::new(FlashCtrl::new(8192, PAGE_SIZE), PAGE_SIZE),
            Err(ErrorCode::BadDevice)
        ));

        // A device with no whole sector mounts but holds nothing.
        let mut fs =
            TestFs::new(FlashCtrl::new(0, SMALL_SECTOR_SIZE), SMALL_SECTOR_SIZE).unwrap();
        assert_eq!(fs.format(), Ok(()));
        assert_eq!(
            fs.open(0, MODE_CREATE, None),
            Err(ErrorCode::FilesystemFull)
        );
    }

    #[test]
    fn open_rejects_the_sentinel_id() {
        let mut fs = new_small_fs();
        assert_eq!(
            fs.open(0xFF, MODE_CREATE, None),
            Err(ErrorCode::FileNotFound)
        );
    }
}
