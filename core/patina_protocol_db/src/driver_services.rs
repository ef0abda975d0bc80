//! Driver model boundary for the protocol database.
//!
//! The database does not implement driver binding itself. Connecting and disconnecting controllers is delegated to a
//! [`ControllerServices`] implementation supplied at construction, which is always invoked with the database lock
//! released and may re-enter the database through the [`ProtocolServices`] it is handed.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::vec::Vec;

use r_efi::efi::{self, protocols::device_path::Protocol as DevicePath};

use crate::{
    error::{EfiError, Result},
    GuidFmt, ProtocolServices,
};

/// Connects drivers to controllers and disconnects them again.
#[cfg_attr(test, mockall::automock)]
pub trait ControllerServices {
    /// Connects one or more drivers to `controller_handle`, optionally limited to `driver_image_handles`. If
    /// `recursive`, child controllers created along the way are connected as well.
    fn connect_controller(
        &self,
        services: &ProtocolServices,
        controller_handle: efi::Handle,
        driver_image_handles: Vec<efi::Handle>,
        remaining_device_path: Option<*mut DevicePath>,
        recursive: bool,
    ) -> Result<()>;

    /// Disconnects `driver_image_handle` (or every driver, if `None`) from `controller_handle`, optionally limited to
    /// one child. On success the disconnected drivers have closed the protocols they opened `BY_DRIVER`.
    fn disconnect_controller(
        &self,
        services: &ProtocolServices,
        controller_handle: efi::Handle,
        driver_image_handle: Option<efi::Handle>,
        child_handle: Option<efi::Handle>,
    ) -> Result<()>;
}

impl ProtocolServices {
    /// Connects drivers to a controller through the configured [`ControllerServices`]. Without controller services
    /// there is nothing to connect and the call succeeds.
    pub fn connect_controller(
        &self,
        controller_handle: efi::Handle,
        driver_image_handles: Vec<efi::Handle>,
        remaining_device_path: Option<*mut DevicePath>,
        recursive: bool,
    ) -> Result<()> {
        match &self.controller_services {
            Some(controller_services) => controller_services.connect_controller(
                self,
                controller_handle,
                driver_image_handles,
                remaining_device_path,
                recursive,
            ),
            None => Ok(()),
        }
    }

    /// Disconnects drivers from a controller through the configured [`ControllerServices`].
    ///
    /// ## Errors
    ///
    /// [`EfiError::Unsupported`] if no controller services are configured, otherwise whatever the controller services
    /// report.
    pub fn disconnect_controller(
        &self,
        controller_handle: efi::Handle,
        driver_image_handle: Option<efi::Handle>,
        child_handle: Option<efi::Handle>,
    ) -> Result<()> {
        match &self.controller_services {
            Some(controller_services) => {
                controller_services.disconnect_controller(self, controller_handle, driver_image_handle, child_handle)
            }
            None => Err(EfiError::Unsupported),
        }
    }

    /// Returns the current handle database key.
    pub fn get_handle_database_key(&self) -> u64 {
        self.lock_db().handle_database_key()
    }

    /// Recursively connects every handle created or modified since `key` was read.
    ///
    /// The set of handles is captured before any driver runs; handles destroyed by an earlier connect are skipped.
    /// Connect failures are ignored.
    pub fn connect_handles_by_key(&self, key: u64) {
        let handles = self.lock_db().handles_modified_since(key);
        log::debug!("connect_handles_by_key: {} handle(s) modified since key {}", handles.len(), key);
        for handle in handles {
            if self.validate_handle(handle).is_err() {
                continue;
            }
            if let Err(err) = self.connect_controller(handle, Vec::new(), None, true) {
                log::trace!("connect_handles_by_key: connect of {:?} failed: {:?}", handle, err);
            }
        }
    }

    /// Evicts every consumer of `protocol` on `handle` so that the interface can be removed or replaced.
    ///
    /// `BY_DRIVER` owners are disconnected one at a time. Once none remain, advisory records are dropped. If an owner
    /// cannot be disconnected, or records that cannot be dropped remain, the handle is reconnected and
    /// [`EfiError::AccessDenied`] is returned.
    pub(crate) fn disconnect_protocol_consumers(&self, handle: efi::Handle, protocol: efi::Guid) -> Result<()> {
        let mut status = Ok(());
        loop {
            let owner = self.lock_db().by_driver_agent(handle, protocol);
            let Some(agent) = owner else {
                break;
            };
            log::debug!("Disconnecting driver {:?} from {:?} to release {}", agent, handle, GuidFmt(&protocol));
            if let Err(err) = self.disconnect_controller(handle, Some(agent), None) {
                log::warn!("Failed to disconnect driver {:?} from {:?}: {:?}", agent, handle, err);
                status = Err(err);
                break;
            }
            if self.lock_db().has_by_driver_usage(handle, protocol, agent) {
                log::error!("Driver {:?} disconnected from {:?} but still holds {}", agent, handle, GuidFmt(&protocol));
                status = Err(EfiError::AccessDenied);
                break;
            }
        }

        let remaining = match status {
            Ok(()) => self.lock_db().remove_advisory_usages(handle, protocol),
            Err(_) => 0,
        };

        if status.is_err() || remaining != 0 {
            log::warn!(
                "Unable to release {} on {:?} ({} record(s) remain); reconnecting.",
                GuidFmt(&protocol),
                handle,
                remaining
            );
            let _ = self.connect_controller(handle, Vec::new(), None, true);
            return Err(EfiError::AccessDenied);
        }
        Ok(())
    }
}
