//! DXE Core Handle and Protocol Database
//!
//! The handle/protocol registry of a UEFI DXE core: the table of handles, the protocol interfaces installed on them,
//! the open-protocol ledger that arbitrates which drivers may use an interface, and the notification machinery that
//! tells listeners when a protocol appears.
//!
//! All state lives in a [`ProtocolServices`] instance. Operations that must call out to driver code (connecting and
//! disconnecting controllers, protocol notify callbacks) always do so with the database lock released, so those
//! callbacks may re-enter the database.
//!
//! ## Examples
//!
//! ```
//! use patina_protocol_db::ProtocolServices;
//! use r_efi::efi;
//!
//! const EXAMPLE_PROTOCOL: efi::Guid =
//!     efi::Guid::from_fields(0x0ad5d4e8, 0x5ff5, 0x4cd9, 0x8b, 0x1c, &[0x3c, 0x8d, 0x2b, 0x5e, 0x6e, 0x11]);
//!
//! let services = ProtocolServices::new();
//! let mut interface = 0_u32;
//! let interface_ptr = &mut interface as *mut u32 as *mut core::ffi::c_void;
//!
//! let handle = services.install_protocol_interface(None, EXAMPLE_PROTOCOL, interface_ptr).unwrap();
//! assert_eq!(services.handle_protocol(handle, EXAMPLE_PROTOCOL), Ok(interface_ptr));
//! services.uninstall_protocol_interface(handle, EXAMPLE_PROTOCOL, interface_ptr).unwrap();
//! assert!(services.validate_handle(handle).is_err());
//! ```
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#![cfg_attr(all(not(feature = "std"), not(test)), no_std)]

extern crate alloc;

pub mod driver_services;
pub mod error;
pub mod event_db;
pub mod protocol_db;
pub mod tpl_lock;

mod events;
mod protocols;

#[cfg(test)]
mod test_support;

use alloc::boxed::Box;
use core::{fmt, sync::atomic::AtomicUsize};

use r_efi::efi;

use driver_services::ControllerServices;
use event_db::EventDb;
use protocol_db::ProtocolDb;
use tpl_lock::{TplControl, TplGuard, TplMutex};

pub use error::{EfiError, Result};
pub use protocol_db::{DXE_CORE_HANDLE, OpenProtocolInformation};
pub use protocols::SearchType;

/// The handle and protocol database together with the task priority and event state it signals through.
///
/// A `ProtocolServices` is an explicit context object: independent instances share nothing.
pub struct ProtocolServices {
    protocol_db: TplMutex<ProtocolDb>,
    event_db: spin::Mutex<EventDb>,
    current_tpl: AtomicUsize,
    controller_services: Option<Box<dyn ControllerServices>>,
}

impl ProtocolServices {
    /// Creates a database containing only [`DXE_CORE_HANDLE`], running at `TPL_APPLICATION`.
    pub fn new() -> Self {
        let services = ProtocolServices {
            protocol_db: TplMutex::new(efi::TPL_NOTIFY, ProtocolDb::new(), "ProtocolDbLock"),
            event_db: spin::Mutex::new(EventDb::new()),
            current_tpl: AtomicUsize::new(efi::TPL_APPLICATION),
            controller_services: None,
        };
        services.protocol_db.lock(None).init_protocol_db();
        services
    }

    /// Configures the driver model used to connect and disconnect controllers.
    ///
    /// Without controller services, connecting is a no-op and disconnecting fails with [`EfiError::Unsupported`].
    pub fn with_controller_services(mut self, controller_services: Box<dyn ControllerServices>) -> Self {
        self.controller_services = Some(controller_services);
        self
    }

    fn lock_db(&self) -> TplGuard<'_, ProtocolDb> {
        self.protocol_db.lock(Some(self as &dyn TplControl))
    }
}

impl Default for ProtocolServices {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ProtocolServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolServices")
            .field("protocol_db", &self.protocol_db)
            .field("current_tpl", &self.current_tpl)
            .field("controller_services", &self.controller_services.is_some())
            .finish()
    }
}

// Handles, events and registration keys share one value space. The low bits of a token name its kind, so a token of
// one kind never validates as another.
const TOKEN_KIND_BITS: u32 = 2;
pub(crate) const HANDLE_TOKEN: usize = 1;
pub(crate) const EVENT_TOKEN: usize = 2;
pub(crate) const REGISTRATION_TOKEN: usize = 3;

/// Returns the `index`-th token of `kind`.
pub(crate) const fn token(kind: usize, index: usize) -> usize {
    (index << TOKEN_KIND_BITS) | kind
}

/// Displays an [`efi::Guid`] in registry format for log output.
pub(crate) struct GuidFmt<'a>(pub &'a efi::Guid);

impl fmt::Display for GuidFmt<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let uuid = uuid::Uuid::from_bytes_le(*self.0.as_bytes());
        write!(f, "{}", uuid.hyphenated())
    }
}
