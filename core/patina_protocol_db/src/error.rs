//! Error definitions for the protocol database
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use core::fmt;

use r_efi::efi;

/// Result type returned by every protocol database operation.
pub type Result<T> = core::result::Result<T, EfiError>;

/// Failure kinds reported by the protocol database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EfiError {
    /// A required handle or identifier was missing or malformed for the requested operation.
    InvalidParameter,
    /// The referenced handle/protocol/interface combination does not exist.
    NotFound,
    /// The handle exists but does not support the requested protocol.
    Unsupported,
    /// The requested open (or device path registration) is already in place.
    AlreadyStarted,
    /// The request conflicts with existing consumers that could not be evicted.
    AccessDenied,
    /// An internal record could not be allocated.
    OutOfResources,
}

impl From<EfiError> for efi::Status {
    fn from(err: EfiError) -> Self {
        match err {
            EfiError::InvalidParameter => efi::Status::INVALID_PARAMETER,
            EfiError::NotFound => efi::Status::NOT_FOUND,
            EfiError::Unsupported => efi::Status::UNSUPPORTED,
            EfiError::AlreadyStarted => efi::Status::ALREADY_STARTED,
            EfiError::AccessDenied => efi::Status::ACCESS_DENIED,
            EfiError::OutOfResources => efi::Status::OUT_OF_RESOURCES,
        }
    }
}

impl TryFrom<efi::Status> for EfiError {
    type Error = efi::Status;

    fn try_from(status: efi::Status) -> core::result::Result<Self, Self::Error> {
        match status {
            efi::Status::INVALID_PARAMETER => Ok(EfiError::InvalidParameter),
            efi::Status::NOT_FOUND => Ok(EfiError::NotFound),
            efi::Status::UNSUPPORTED => Ok(EfiError::Unsupported),
            efi::Status::ALREADY_STARTED => Ok(EfiError::AlreadyStarted),
            efi::Status::ACCESS_DENIED => Ok(EfiError::AccessDenied),
            efi::Status::OUT_OF_RESOURCES => Ok(EfiError::OutOfResources),
            other => Err(other),
        }
    }
}

impl fmt::Display for EfiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            EfiError::InvalidParameter => "invalid parameter",
            EfiError::NotFound => "not found",
            EfiError::Unsupported => "unsupported",
            EfiError::AlreadyStarted => "already started",
            EfiError::AccessDenied => "access denied",
            EfiError::OutOfResources => "out of resources",
        };
        f.write_str(text)
    }
}
