// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! The standard error codes used by SectorFs.

/// Standard error codes.
///
/// The integer values obtained through the `From` conversions are part of
/// the stable public contract and match the codes reported by other
/// implementations of the same on-media format.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ErrorCode {
    /// The underlying flash device reported a failure. The operation is
    /// not retried; in-memory state is left as it was when the device
    /// failed, so the caller should close and re-open the file.
    FlashMedia,
    /// The file exists and the open mode requested creation.
    FileAlreadyExists,
    /// No file with the requested identifier exists.
    FileNotFound,
    /// The file is write-protected and the operation would modify it.
    FileProtected,
    /// Every handle slot is currently in use.
    NoFreeHandle,
    /// The operation is not permitted by the handle's open mode, e.g.
    /// writing through a read handle.
    InvalidMode,
    /// No free sector is available, or the current sector's session table
    /// is exhausted and no further commits are possible there.
    FilesystemFull,
    /// A read was attempted with the cursor already at the end of the
    /// file chain.
    EndOfFile,
    /// The device geometry cannot support the on-media layout.
    BadDevice,
    /// Reserved for on-media format revisions; never returned by this
    /// version.
    FileVersionMismatch,
    /// The handle does not refer to a currently open slot of this
    /// filesystem.
    InvalidHandle,
}

impl From<ErrorCode> for isize {
    fn from(original: ErrorCode) -> isize {
        match original {
            ErrorCode::FlashMedia => -1,
            ErrorCode::FileAlreadyExists => -2,
            ErrorCode::FileNotFound => -3,
            ErrorCode::FileProtected => -4,
            ErrorCode::NoFreeHandle => -5,
            ErrorCode::InvalidMode => -6,
            ErrorCode::FilesystemFull => -7,
            ErrorCode::EndOfFile => -8,
            ErrorCode::BadDevice => -9,
            ErrorCode::FileVersionMismatch => -10,
            ErrorCode::InvalidHandle => -11,
        }
    }
}

impl From<ErrorCode> for usize {
    fn from(original: ErrorCode) -> usize {
        isize::from(original) as usize
    }
}
