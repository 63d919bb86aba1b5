// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! The flash controller interface with hardware.

use crate::error_codes::ErrorCode;

/// Implementation required for the flash controller hardware. This should
/// read, program and erase flash from the hardware using the flash
/// controller.
///
/// This is the public trait for the flash controller implementation.
///
/// Addresses are offsets into a single flat byte space of `capacity()`
/// bytes, starting at zero. If the storage used for the filesystem does
/// not start at the beginning of flash, or is a partition offset from the
/// start of flash, the implementation must add that offset to the
/// addresses it receives.
///
/// The boiler plate for an implementation will look something like this
///
/// ```rust
/// use sectorfs::error_codes::ErrorCode;
/// use sectorfs::flash_controller::FlashController;
///
/// #[derive(Default)]
/// struct FlashCtrl {}
///
/// impl FlashCtrl {
///     fn new() -> Self {
///         Self { /* fields */ }
///     }
/// }
///
/// impl FlashController for FlashCtrl {
///     fn read(&self, address: usize, buf: &mut [u8]) -> Result<(), ErrorCode> {
///         unimplemented!()
///     }
///
///     fn write(&self, address: usize, buf: &[u8]) -> Result<(), ErrorCode> {
///         unimplemented!()
///     }
///
///     fn erase_block(&self, address: usize) -> Result<(), ErrorCode> {
///         unimplemented!()
///     }
///
///     fn capacity(&self) -> usize {
///         unimplemented!()
///     }
/// }
/// ```
pub trait FlashController {
    /// This function must read `buf.len()` bytes starting at `address`
    /// into `buf`. Any alignment and length must be supported.
    ///
    /// On success it should return nothing, on failure it should return
    /// `ErrorCode::FlashMedia`.
    fn read(&self, address: usize, buf: &mut [u8]) -> Result<(), ErrorCode>;

    /// This function must program the length of `buf` to the specified
    /// address in flash. The write may start at any address and the
    /// implementation must split it across page program operations as the
    /// hardware requires.
    ///
    /// Programming can only clear bits (turn 1s into 0s). The caller
    /// guarantees that the target bytes are either still erased or that
    /// no already-cleared bit is asked to change, so the implementation
    /// must not read-modify-erase-write.
    ///
    /// On success it should return nothing, on failure it should return
    /// `ErrorCode::FlashMedia`. A returned success means the bytes are
    /// durable.
    fn write(&self, address: usize, buf: &[u8]) -> Result<(), ErrorCode>;

    /// This function must erase the entire erase block containing
    /// `address`, returning every byte in it to `0xFF`.
    ///
    /// On success it should return nothing, on failure it should return
    /// `ErrorCode::FlashMedia`.
    fn erase_block(&self, address: usize) -> Result<(), ErrorCode>;

    /// The total number of addressable bytes of the device.
    fn capacity(&self) -> usize;
}
