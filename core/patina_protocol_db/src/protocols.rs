//! Protocol interface services
//!
//! The caller-facing handle and protocol operations. Each operation takes the database lock for its own bookkeeping
//! and releases it before calling into driver code (disconnect sweeps, reconnects) or signaling notify events.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::vec::Vec;
use core::ffi::c_void;

use patina_internal_device_path::{is_device_path_end, remaining_device_path};
use r_efi::efi::{self, protocols::device_path::Protocol as DevicePath};

use crate::{
    error::{EfiError, Result},
    protocol_db::{OpenDisposition, OpenProtocolInformation, DXE_CORE_HANDLE},
    tpl_lock::{TplControl, TplMutex},
    GuidFmt, ProtocolServices,
};

/// Selects the handles returned by [`ProtocolServices::locate_handle_buffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchType {
    /// Every handle in the database.
    AllHandles,
    /// Every handle that supports the protocol.
    ByProtocol(efi::Guid),
    /// The next handle that gained the protocol of a notify registration.
    ByRegisterNotify(*mut c_void),
}

impl ProtocolServices {
    /// Returns `Ok(())` if `handle` is a live handle, or [`EfiError::InvalidParameter`] otherwise.
    pub fn validate_handle(&self, handle: efi::Handle) -> Result<()> {
        self.lock_db().validate_handle(handle)
    }

    /// Installs `interface` for `protocol` on `handle`, or on a new handle if `handle` is `None`, and returns the
    /// handle. Every notify subscription for `protocol` is signaled once the database lock has been released.
    ///
    /// ## Errors
    ///
    /// - [`EfiError::InvalidParameter`] if `handle` is not a live handle or already carries `protocol`.
    /// - [`EfiError::OutOfResources`] if a record could not be allocated.
    pub fn install_protocol_interface(
        &self,
        handle: Option<efi::Handle>,
        protocol: efi::Guid,
        interface: *mut c_void,
    ) -> Result<efi::Handle> {
        log::info!("InstallProtocolInterface: {} @ {:#x?}", GuidFmt(&protocol), interface);
        let (handle, notify_events) = self.lock_db().install_protocol_interface(handle, protocol, interface)?;
        self.signal_protocol_notifies(notify_events);
        Ok(handle)
    }

    /// Removes `interface` for `protocol` from `handle`, first evicting every consumer of the interface. The handle
    /// is destroyed once its last interface is removed.
    ///
    /// ## Errors
    ///
    /// - [`EfiError::InvalidParameter`] if `handle` is not a live handle.
    /// - [`EfiError::NotFound`] if `handle` does not carry `interface` for `protocol`.
    /// - [`EfiError::AccessDenied`] if a consumer could not be evicted. The database is left unchanged.
    pub fn uninstall_protocol_interface(
        &self,
        handle: efi::Handle,
        protocol: efi::Guid,
        interface: *mut c_void,
    ) -> Result<()> {
        log::info!("UninstallProtocolInterface: {} @ {:#x?}", GuidFmt(&protocol), interface);
        self.lock_db().find_protocol_interface(handle, protocol, interface)?;
        self.disconnect_protocol_consumers(handle, protocol)?;
        self.lock_db().uninstall_protocol_interface(handle, protocol, interface)
    }

    /// Replaces `old_interface` with `new_interface` for `protocol` on `handle`.
    ///
    /// Consumers of the old interface are evicted first. The handle is then reconnected and every notify subscription
    /// for `protocol` is signaled as if the interface had been newly installed.
    pub fn reinstall_protocol_interface(
        &self,
        handle: efi::Handle,
        protocol: efi::Guid,
        old_interface: *mut c_void,
        new_interface: *mut c_void,
    ) -> Result<()> {
        log::info!(
            "ReinstallProtocolInterface: {} @ {:#x?} -> {:#x?}",
            GuidFmt(&protocol),
            old_interface,
            new_interface
        );
        self.lock_db().find_protocol_interface(handle, protocol, old_interface)?;
        self.disconnect_protocol_consumers(handle, protocol)?;
        let notify_events =
            self.lock_db().reinstall_protocol_interface(handle, protocol, old_interface, new_interface)?;

        if let Err(err) = self.connect_controller(handle, Vec::new(), None, true) {
            log::trace!("ReinstallProtocolInterface: reconnect of {:?} failed: {:?}", handle, err);
        }
        self.signal_protocol_notifies(notify_events);
        Ok(())
    }

    /// Installs a list of protocol interfaces on one handle as a unit.
    ///
    /// If any install fails, the interfaces already installed by this call are removed again and the error is
    /// returned. If the list contains a device path that is already installed on another handle as a complete path,
    /// nothing is installed and [`EfiError::AlreadyStarted`] is returned. Notifications are held back until the whole
    /// list has been processed.
    ///
    /// ## Errors
    ///
    /// [`EfiError::InvalidParameter`] if `handle` is `None` and `interfaces` is empty, in addition to the errors of
    /// [`install_protocol_interface`](ProtocolServices::install_protocol_interface).
    ///
    /// # Safety
    ///
    /// Every non-null device path interface in `interfaces`, and every device path interface already installed in the
    /// database, must point to a well-formed device path.
    pub unsafe fn install_multiple_protocol_interfaces(
        &self,
        handle: Option<efi::Handle>,
        interfaces: &[(efi::Guid, *mut c_void)],
    ) -> Result<efi::Handle> {
        let tpl_mutex = TplMutex::new(efi::TPL_NOTIFY, (), "install_multiple_protocol_interfaces");
        let _tpl_guard = tpl_mutex.lock(Some(self as &dyn TplControl));

        for (protocol, interface) in interfaces {
            if *protocol != efi::protocols::device_path::PROTOCOL_GUID || interface.is_null() {
                continue;
            }
            let device_path = *interface as *const DevicePath;
            if let Ok((remaining, _)) =
                unsafe { self.locate_device_path(efi::protocols::device_path::PROTOCOL_GUID, device_path) }
            {
                if unsafe { is_device_path_end(remaining as *const DevicePath) } {
                    log::warn!("InstallMultipleProtocolInterfaces: device path {:#x?} is already installed", interface);
                    return Err(EfiError::AlreadyStarted);
                }
            }
        }

        let mut installed = Vec::new();
        installed.try_reserve(interfaces.len()).map_err(|_| EfiError::OutOfResources)?;
        let mut current_handle = handle;
        for &(protocol, interface) in interfaces {
            match self.install_protocol_interface(current_handle, protocol, interface) {
                Ok(new_handle) => {
                    current_handle = Some(new_handle);
                    installed.push((protocol, interface));
                }
                Err(err) => {
                    log::warn!(
                        "InstallMultipleProtocolInterfaces: {} failed: {:?}; rolling back",
                        GuidFmt(&protocol),
                        err
                    );
                    if let Some(rollback_handle) = current_handle {
                        for (protocol, interface) in installed.into_iter().rev() {
                            let _ = self.uninstall_protocol_interface(rollback_handle, protocol, interface);
                        }
                    }
                    return Err(err);
                }
            }
        }
        current_handle.ok_or(EfiError::InvalidParameter)
    }

    /// Removes a list of protocol interfaces from one handle as a unit.
    ///
    /// Every (protocol, interface) pair must be present on `handle`, and no protocol may be listed twice, before
    /// anything is removed. If a later uninstall fails, the interfaces already removed by this call are reinstalled
    /// and [`EfiError::InvalidParameter`] is returned.
    pub fn uninstall_multiple_protocol_interfaces(
        &self,
        handle: efi::Handle,
        interfaces: &[(efi::Guid, *mut c_void)],
    ) -> Result<()> {
        {
            let protocol_db = self.lock_db();
            for (index, &(protocol, interface)) in interfaces.iter().enumerate() {
                let repeated = interfaces[..index].iter().any(|(listed, _)| *listed == protocol);
                if repeated || protocol_db.find_protocol_interface(handle, protocol, interface).is_err() {
                    log::warn!(
                        "UninstallMultipleProtocolInterfaces: {} @ {:#x?} is not installed on {:?}",
                        GuidFmt(&protocol),
                        interface,
                        handle
                    );
                    return Err(EfiError::InvalidParameter);
                }
            }
        }

        let mut removed = Vec::new();
        removed.try_reserve(interfaces.len()).map_err(|_| EfiError::OutOfResources)?;
        for &(protocol, interface) in interfaces {
            if let Err(err) = self.uninstall_protocol_interface(handle, protocol, interface) {
                log::warn!(
                    "UninstallMultipleProtocolInterfaces: {} failed: {:?}; rolling back",
                    GuidFmt(&protocol),
                    err
                );
                // the handle may have been destroyed along with its last interface.
                let mut restore_handle = if self.validate_handle(handle).is_ok() { Some(handle) } else { None };
                for (protocol, interface) in removed.into_iter().rev() {
                    if let Ok(restored) = self.install_protocol_interface(restore_handle, protocol, interface) {
                        restore_handle = Some(restored);
                    }
                }
                return Err(EfiError::InvalidParameter);
            }
            removed.push((protocol, interface));
        }
        Ok(())
    }

    /// Opens `protocol` on `handle` on behalf of `agent_handle` and records the open in the interface's ledger.
    ///
    /// `interface` receives the interface pointer; it is required for every mode except `TEST_PROTOCOL`, is cleared
    /// on entry, and is filled in whenever `handle` carries `protocol`, even if the open is then refused.
    ///
    /// Exclusive opens that collide with `BY_DRIVER` owners disconnect those owners first and then retry.
    ///
    /// ## Errors
    ///
    /// - [`EfiError::InvalidParameter`] if `interface` is missing, a required handle does not validate, or
    ///   `attributes` is not a supported combination.
    /// - [`EfiError::Unsupported`] if `handle` does not carry `protocol`.
    /// - [`EfiError::AlreadyStarted`] if the identical `BY_DRIVER` open is already recorded.
    /// - [`EfiError::AccessDenied`] if the open conflicts with existing owners that could not be evicted.
    /// - [`EfiError::OutOfResources`] if the ledger record could not be allocated.
    pub fn open_protocol(
        &self,
        handle: efi::Handle,
        protocol: efi::Guid,
        mut interface: Option<&mut *mut c_void>,
        agent_handle: Option<efi::Handle>,
        controller_handle: Option<efi::Handle>,
        attributes: u32,
    ) -> Result<()> {
        log::trace!(
            "OpenProtocol: {} on {:?} agent {:?} controller {:?} attributes {:#x}",
            GuidFmt(&protocol),
            handle,
            agent_handle,
            controller_handle,
            attributes
        );
        if attributes != efi::OPEN_PROTOCOL_TEST_PROTOCOL {
            match interface.as_deref_mut() {
                Some(slot) => *slot = core::ptr::null_mut(),
                None => return Err(EfiError::InvalidParameter),
            }
        }

        loop {
            let disposition = {
                let mut protocol_db = self.lock_db();
                protocol_db.validate_open_parameters(handle, agent_handle, controller_handle, attributes)?;
                let found = protocol_db.get_interface_for_handle(handle, protocol)?;
                if attributes != efi::OPEN_PROTOCOL_TEST_PROTOCOL {
                    if let Some(slot) = interface.as_deref_mut() {
                        *slot = found;
                    }
                }
                protocol_db.add_protocol_usage(handle, protocol, agent_handle, controller_handle, attributes)?
            };

            match disposition {
                OpenDisposition::Opened => return Ok(()),
                OpenDisposition::DisconnectRequired(owner) => {
                    log::debug!("OpenProtocol: exclusive open of {} evicting driver {:?}", GuidFmt(&protocol), owner);
                    if let Err(err) = self.disconnect_controller(handle, Some(owner), None) {
                        log::warn!("OpenProtocol: failed to disconnect driver {:?}: {:?}", owner, err);
                        return Err(EfiError::AccessDenied);
                    }
                    if self.lock_db().has_by_driver_usage(handle, protocol, owner) {
                        log::error!("OpenProtocol: driver {:?} disconnected but still holds the protocol", owner);
                        return Err(EfiError::AccessDenied);
                    }
                }
            }
        }
    }

    /// Removes every ledger record of `protocol` on `handle` opened by `agent_handle` for `controller_handle`.
    ///
    /// ## Errors
    ///
    /// - [`EfiError::InvalidParameter`] if `handle`, `agent_handle` or a given `controller_handle` does not validate.
    /// - [`EfiError::NotFound`] if `handle` does not carry `protocol` or no record matched.
    pub fn close_protocol(
        &self,
        handle: efi::Handle,
        protocol: efi::Guid,
        agent_handle: efi::Handle,
        controller_handle: Option<efi::Handle>,
    ) -> Result<()> {
        log::trace!(
            "CloseProtocol: {} on {:?} agent {:?} controller {:?}",
            GuidFmt(&protocol),
            handle,
            agent_handle,
            controller_handle
        );
        let mut protocol_db = self.lock_db();
        protocol_db.validate_handle(handle)?;
        protocol_db.validate_handle(agent_handle)?;
        if let Some(controller_handle) = controller_handle {
            protocol_db.validate_handle(controller_handle)?;
        }
        protocol_db.remove_protocol_usage(handle, protocol, Some(agent_handle), controller_handle)
    }

    /// Returns the interface for `protocol` on `handle`, recording a `BY_HANDLE_PROTOCOL` open by
    /// [`DXE_CORE_HANDLE`].
    pub fn handle_protocol(&self, handle: efi::Handle, protocol: efi::Guid) -> Result<*mut c_void> {
        let mut interface = core::ptr::null_mut();
        self.open_protocol(
            handle,
            protocol,
            Some(&mut interface),
            Some(DXE_CORE_HANDLE),
            None,
            efi::OPEN_PROTOCOL_BY_HANDLE_PROTOCOL,
        )?;
        Ok(interface)
    }

    /// Returns a snapshot of the ledger for `protocol` on `handle`.
    pub fn open_protocol_information(
        &self,
        handle: efi::Handle,
        protocol: efi::Guid,
    ) -> Result<Vec<OpenProtocolInformation>> {
        self.lock_db().get_open_protocol_information_by_protocol(handle, protocol)
    }

    /// Returns a snapshot of every ledger on `handle`, most recently installed protocol first.
    pub fn get_open_protocol_information(
        &self,
        handle: efi::Handle,
    ) -> Result<Vec<(efi::Guid, Vec<OpenProtocolInformation>)>> {
        self.lock_db().get_open_protocol_information(handle)
    }

    /// Returns the child controllers opened `BY_CHILD_CONTROLLER` on any protocol of `parent_handle`.
    pub fn get_child_handles(&self, parent_handle: efi::Handle) -> Vec<efi::Handle> {
        self.lock_db().get_child_handles(parent_handle)
    }

    /// Returns the interface for `protocol` on `handle` without recording an open.
    pub fn get_interface_for_handle(&self, handle: efi::Handle, protocol: efi::Guid) -> Result<*mut c_void> {
        self.lock_db().get_interface_for_handle(handle, protocol)
    }

    /// Returns the protocols installed on `handle`, most recently installed first.
    pub fn protocols_per_handle(&self, handle: efi::Handle) -> Result<Vec<efi::Guid>> {
        self.lock_db().get_protocols_on_handle(handle)
    }

    /// Subscribes `event` to installs (and reinstalls) of `protocol` and returns the registration key.
    ///
    /// Only handles that gain the protocol after registration are reported through the key.
    pub fn register_protocol_notify(&self, protocol: efi::Guid, event: efi::Event) -> Result<*mut c_void> {
        if !self.is_valid_event(event) {
            return Err(EfiError::InvalidParameter);
        }
        log::debug!("RegisterProtocolNotify: {} event {:?}", GuidFmt(&protocol), event);
        self.lock_db().register_protocol_notify(protocol, event)
    }

    /// Removes every protocol notify subscription that signals `event`.
    pub fn unregister_protocol_notify(&self, event: efi::Event) -> Result<()> {
        let removed = self.lock_db().unregister_protocol_notify(event);
        log::debug!("UnregisterProtocolNotify: removed {} registration(s) for event {:?}", removed, event);
        Ok(())
    }

    /// Pops the oldest handle that gained the protocol of `registration` since the previous lookup.
    pub fn next_handle_for_registration(&self, registration: *mut c_void) -> Option<efi::Handle> {
        self.lock_db().next_handle_for_registration(registration)
    }

    /// Returns all handles in creation order, or the handles supporting `protocol` in install order.
    pub fn locate_handles(&self, protocol: Option<efi::Guid>) -> Vec<efi::Handle> {
        self.lock_db().locate_handles(protocol)
    }

    /// Returns the handles selected by `search`.
    ///
    /// ## Errors
    ///
    /// [`EfiError::InvalidParameter`] for a null registration key; [`EfiError::NotFound`] if nothing matched.
    pub fn locate_handle_buffer(&self, search: SearchType) -> Result<Vec<efi::Handle>> {
        let handles = match search {
            SearchType::AllHandles => self.locate_handles(None),
            SearchType::ByProtocol(protocol) => self.locate_handles(Some(protocol)),
            SearchType::ByRegisterNotify(registration) => {
                if registration.is_null() {
                    return Err(EfiError::InvalidParameter);
                }
                self.next_handle_for_registration(registration).into_iter().collect()
            }
        };
        if handles.is_empty() {
            return Err(EfiError::NotFound);
        }
        Ok(handles)
    }

    /// Returns the first interface installed for `protocol`, or with a registration key, the interface on the next
    /// handle that gained the protocol since the previous lookup.
    pub fn locate_protocol(&self, protocol: efi::Guid, registration: Option<*mut c_void>) -> Result<*mut c_void> {
        let mut protocol_db = self.lock_db();
        match registration {
            None => protocol_db.locate_protocol(protocol),
            Some(registration) => {
                if protocol_db.registration_protocol(registration) != Some(protocol) {
                    return Err(EfiError::NotFound);
                }
                let handle = protocol_db.next_handle_for_registration(registration).ok_or(EfiError::NotFound)?;
                protocol_db.get_interface_for_handle(handle, protocol).map_err(|_| EfiError::NotFound)
            }
        }
    }

    /// Finds the handle supporting `protocol` whose device path is the longest prefix of `device_path`, and returns
    /// the unmatched remainder of `device_path` along with the handle.
    ///
    /// ## Errors
    ///
    /// [`EfiError::InvalidParameter`] for a null `device_path`; [`EfiError::NotFound`] if no handle matched.
    ///
    /// # Safety
    ///
    /// `device_path` and every device path interface installed in the database must point to well-formed device
    /// paths.
    pub unsafe fn locate_device_path(
        &self,
        protocol: efi::Guid,
        device_path: *const DevicePath,
    ) -> Result<(*const DevicePath, efi::Handle)> {
        if device_path.is_null() {
            return Err(EfiError::InvalidParameter);
        }

        let candidates: Vec<(efi::Handle, *const DevicePath)> = {
            let protocol_db = self.lock_db();
            protocol_db
                .locate_handles(Some(protocol))
                .into_iter()
                .filter_map(|handle| {
                    let path = protocol_db.get_interface_for_handle(handle, efi::protocols::device_path::PROTOCOL_GUID);
                    path.ok().filter(|path| !path.is_null()).map(|path| (handle, path as *const DevicePath))
                })
                .collect()
        };

        let mut best: Option<(usize, *const DevicePath, efi::Handle)> = None;
        for (handle, handle_path) in candidates {
            let Some((remaining, matching_nodes)) = (unsafe { remaining_device_path(handle_path, device_path) }) else {
                continue;
            };
            let remaining = remaining as *const DevicePath;
            let better = match best {
                Some((best_nodes, _, _)) => matching_nodes > best_nodes,
                None => true,
            };
            if better {
                best = Some((matching_nodes, remaining, handle));
            }
        }

        best.map(|(_, remaining, handle)| (remaining, handle)).ok_or(EfiError::NotFound)
    }

    // Signals notify events collected under the lock. Subscriptions whose events have since been closed are removed.
    fn signal_protocol_notifies(&self, notify_events: Vec<efi::Event>) {
        let mut closed_events = Vec::new();
        for event in notify_events {
            if self.signal_event(event).is_err() {
                log::warn!("Protocol notify event {:?} is no longer valid; unregistering it.", event);
                closed_events.push(event);
            }
        }
        if !closed_events.is_empty() {
            self.lock_db().unregister_protocol_notify_events(closed_events);
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use alloc::{boxed::Box, vec};
    use core::{
        ptr,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use super::*;
    use crate::{
        driver_services::MockControllerServices,
        test_support::{guid, interface_value, DevicePathBuilder},
    };

    extern "efiapi" fn count_notify(_event: efi::Event, context: *mut c_void) {
        let counter = unsafe { &*(context as *const AtomicUsize) };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    fn counting_event(services: &ProtocolServices, counter: &AtomicUsize) -> efi::Event {
        services
            .create_event(
                efi::EVT_NOTIFY_SIGNAL,
                efi::TPL_CALLBACK,
                Some(count_notify),
                Some(counter as *const AtomicUsize as *mut c_void),
            )
            .unwrap()
    }

    fn open(
        services: &ProtocolServices,
        handle: efi::Handle,
        protocol: efi::Guid,
        agent: Option<efi::Handle>,
        controller: Option<efi::Handle>,
        attributes: u32,
    ) -> Result<*mut c_void> {
        let mut interface = ptr::null_mut();
        services.open_protocol(handle, protocol, Some(&mut interface), agent, controller, attributes)?;
        Ok(interface)
    }

    #[test]
    fn install_on_new_handle_should_report_protocol() {
        let services = ProtocolServices::new();
        let handle = services.install_protocol_interface(None, guid(1), interface_value(0xAA)).unwrap();
        assert_eq!(services.protocols_per_handle(handle), Ok(vec![guid(1)]));
    }

    #[test]
    fn duplicate_install_should_be_rejected() {
        let services = ProtocolServices::new();
        let handle = services.install_protocol_interface(None, guid(1), interface_value(0xAA)).unwrap();
        assert_eq!(
            services.install_protocol_interface(Some(handle), guid(1), interface_value(0xAA)),
            Err(EfiError::InvalidParameter)
        );
        assert_eq!(services.protocols_per_handle(handle), Ok(vec![guid(1)]));
    }

    #[test]
    fn handle_should_exist_only_while_it_has_interfaces() {
        let services = ProtocolServices::new();
        let handle = services.install_protocol_interface(None, guid(1), interface_value(0xAA)).unwrap();
        services.install_protocol_interface(Some(handle), guid(2), interface_value(0xBB)).unwrap();

        services.uninstall_protocol_interface(handle, guid(1), interface_value(0xAA)).unwrap();
        assert_eq!(services.protocols_per_handle(handle), Ok(vec![guid(2)]));

        services.uninstall_protocol_interface(handle, guid(2), interface_value(0xBB)).unwrap();
        assert_eq!(services.protocols_per_handle(handle), Err(EfiError::InvalidParameter));
        assert!(!services.locate_handles(None).contains(&handle));
        assert_eq!(
            services.uninstall_protocol_interface(handle, guid(2), interface_value(0xBB)),
            Err(EfiError::InvalidParameter)
        );
    }

    #[test]
    fn uninstall_of_unknown_interface_should_be_not_found() {
        let services = ProtocolServices::new();
        let handle = services.install_protocol_interface(None, guid(1), interface_value(0xAA)).unwrap();
        let result = services.uninstall_protocol_interface(handle, guid(1), interface_value(0xAB));
        assert_eq!(result, Err(EfiError::NotFound));
        let result = services.uninstall_protocol_interface(handle, guid(9), interface_value(0xAA));
        assert_eq!(result, Err(EfiError::NotFound));
    }

    #[test]
    fn database_key_should_strictly_increase_on_mutation() {
        let services = ProtocolServices::new();
        let mut last = services.get_handle_database_key();
        let mut check = |services: &ProtocolServices| {
            let key = services.get_handle_database_key();
            assert!(key > last);
            last = key;
        };

        let handle = services.install_protocol_interface(None, guid(1), interface_value(1)).unwrap();
        check(&services);
        services.install_protocol_interface(Some(handle), guid(2), interface_value(2)).unwrap();
        check(&services);
        services.reinstall_protocol_interface(handle, guid(2), interface_value(2), interface_value(3)).unwrap();
        check(&services);
        services.uninstall_protocol_interface(handle, guid(2), interface_value(3)).unwrap();
        check(&services);

        // failed and read-only operations leave the key alone.
        let key = services.get_handle_database_key();
        let _ = services.install_protocol_interface(Some(handle), guid(1), interface_value(1));
        let _ = services.protocols_per_handle(handle);
        assert_eq!(services.get_handle_database_key(), key);
    }

    #[test]
    fn open_should_validate_interface_slot_and_handles() {
        let services = ProtocolServices::new();
        let handle = services.install_protocol_interface(None, guid(1), interface_value(0xAA)).unwrap();

        assert_eq!(
            services.open_protocol(handle, guid(1), None, None, None, efi::OPEN_PROTOCOL_GET_PROTOCOL),
            Err(EfiError::InvalidParameter)
        );
        assert!(services.open_protocol(handle, guid(1), None, None, None, efi::OPEN_PROTOCOL_TEST_PROTOCOL).is_ok());
        assert_eq!(
            services.open_protocol(handle, guid(2), None, None, None, efi::OPEN_PROTOCOL_TEST_PROTOCOL),
            Err(EfiError::Unsupported)
        );

        let mut interface = interface_value(0x1234);
        assert_eq!(
            services.open_protocol(
                handle,
                guid(1),
                Some(&mut interface),
                None,
                Some(handle),
                efi::OPEN_PROTOCOL_BY_DRIVER
            ),
            Err(EfiError::InvalidParameter)
        );
        assert!(interface.is_null());

        assert_eq!(
            open(&services, handle, guid(2), None, None, efi::OPEN_PROTOCOL_GET_PROTOCOL),
            Err(EfiError::Unsupported)
        );
        assert_eq!(
            open(&services, interface_value(0x77), guid(1), None, None, efi::OPEN_PROTOCOL_GET_PROTOCOL),
            Err(EfiError::InvalidParameter)
        );
    }

    #[test]
    fn repeated_by_driver_open_should_be_already_started_but_return_interface() {
        let services = ProtocolServices::new();
        let controller = services.install_protocol_interface(None, guid(1), interface_value(0xAA)).unwrap();
        let agent = services.install_protocol_interface(None, guid(2), interface_value(0xBB)).unwrap();

        assert_eq!(
            open(&services, controller, guid(1), Some(agent), Some(controller), efi::OPEN_PROTOCOL_BY_DRIVER),
            Ok(interface_value(0xAA))
        );

        let mut interface = ptr::null_mut();
        assert_eq!(
            services.open_protocol(
                controller,
                guid(1),
                Some(&mut interface),
                Some(agent),
                Some(controller),
                efi::OPEN_PROTOCOL_BY_DRIVER
            ),
            Err(EfiError::AlreadyStarted)
        );
        assert_eq!(interface, interface_value(0xAA));
        assert_eq!(services.open_protocol_information(controller, guid(1)).unwrap().len(), 1);
    }

    #[test]
    fn identical_get_protocol_opens_should_share_one_record() {
        let services = ProtocolServices::new();
        let handle = services.install_protocol_interface(None, guid(1), interface_value(0xAA)).unwrap();
        let agent = services.install_protocol_interface(None, guid(2), interface_value(0xBB)).unwrap();
        for _ in 0..2 {
            open(&services, handle, guid(1), Some(agent), Some(handle), efi::OPEN_PROTOCOL_GET_PROTOCOL).unwrap();
        }
        let info = services.open_protocol_information(handle, guid(1)).unwrap();
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].open_count, 2);
        assert_eq!(info[0].agent_handle, Some(agent));
        assert_eq!(info[0].controller_handle, Some(handle));
    }

    #[test]
    fn close_should_remove_matching_records() {
        let services = ProtocolServices::new();
        let handle = services.install_protocol_interface(None, guid(1), interface_value(0xAA)).unwrap();
        let agent = services.install_protocol_interface(None, guid(2), interface_value(0xBB)).unwrap();

        open(&services, handle, guid(1), Some(agent), None, efi::OPEN_PROTOCOL_GET_PROTOCOL).unwrap();
        open(&services, handle, guid(1), Some(agent), None, efi::OPEN_PROTOCOL_GET_PROTOCOL).unwrap();
        open(&services, handle, guid(1), Some(agent), None, efi::OPEN_PROTOCOL_BY_HANDLE_PROTOCOL).unwrap();
        assert_eq!(services.open_protocol_information(handle, guid(1)).unwrap().len(), 2);

        assert!(services.close_protocol(handle, guid(1), agent, None).is_ok());
        assert!(services.open_protocol_information(handle, guid(1)).unwrap().is_empty());
        assert_eq!(services.close_protocol(handle, guid(1), agent, None), Err(EfiError::NotFound));
        assert_eq!(services.close_protocol(handle, guid(3), agent, None), Err(EfiError::NotFound));
        assert_eq!(
            services.close_protocol(handle, guid(1), interface_value(0x99), None),
            Err(EfiError::InvalidParameter)
        );
        assert_eq!(
            services.close_protocol(handle, guid(1), agent, Some(interface_value(0x99))),
            Err(EfiError::InvalidParameter)
        );
    }

    #[test]
    fn handle_protocol_should_record_core_agent() {
        let services = ProtocolServices::new();
        let handle = services.install_protocol_interface(None, guid(1), interface_value(0xAA)).unwrap();
        assert_eq!(services.handle_protocol(handle, guid(1)), Ok(interface_value(0xAA)));
        assert_eq!(services.handle_protocol(handle, guid(2)), Err(EfiError::Unsupported));

        let info = services.open_protocol_information(handle, guid(1)).unwrap();
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].agent_handle, Some(DXE_CORE_HANDLE));
        assert_eq!(info[0].attributes, efi::OPEN_PROTOCOL_BY_HANDLE_PROTOCOL);

        // advisory records do not block uninstall.
        assert!(services.uninstall_protocol_interface(handle, guid(1), interface_value(0xAA)).is_ok());
    }

    #[test]
    fn exclusive_open_should_evict_by_driver_owner() {
        let mut controller_services = MockControllerServices::new();
        controller_services.expect_disconnect_controller().times(1).returning_st(|services, controller, driver, _| {
            let driver = driver.unwrap();
            services.close_protocol(controller, guid(1), driver, Some(controller))
        });

        let services = ProtocolServices::new().with_controller_services(Box::new(controller_services));
        let controller = services.install_protocol_interface(None, guid(1), interface_value(0xAA)).unwrap();
        let driver_b = services.install_protocol_interface(None, guid(2), interface_value(0xB0)).unwrap();
        let agent_a = services.install_protocol_interface(None, guid(2), interface_value(0xA0)).unwrap();

        open(&services, controller, guid(1), Some(driver_b), Some(controller), efi::OPEN_PROTOCOL_BY_DRIVER).unwrap();
        assert_eq!(
            open(&services, controller, guid(1), Some(agent_a), None, efi::OPEN_PROTOCOL_EXCLUSIVE),
            Ok(interface_value(0xAA))
        );

        let info = services.open_protocol_information(controller, guid(1)).unwrap();
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].agent_handle, Some(agent_a));
        assert_eq!(info[0].attributes, efi::OPEN_PROTOCOL_EXCLUSIVE);

        // only one exclusive holder at a time.
        let attributes = efi::OPEN_PROTOCOL_BY_DRIVER | efi::OPEN_PROTOCOL_EXCLUSIVE;
        assert_eq!(
            open(&services, controller, guid(1), Some(driver_b), Some(controller), attributes),
            Err(EfiError::AccessDenied)
        );
    }

    #[test]
    fn exclusive_open_should_be_denied_when_owner_refuses_to_stop() {
        let mut controller_services = MockControllerServices::new();
        controller_services.expect_disconnect_controller().times(1).returning(|_, _, _, _| Err(EfiError::Unsupported));

        let services = ProtocolServices::new().with_controller_services(Box::new(controller_services));
        let controller = services.install_protocol_interface(None, guid(1), interface_value(0xAA)).unwrap();
        let driver = services.install_protocol_interface(None, guid(2), interface_value(0xB0)).unwrap();
        let agent = services.install_protocol_interface(None, guid(2), interface_value(0xA0)).unwrap();

        open(&services, controller, guid(1), Some(driver), Some(controller), efi::OPEN_PROTOCOL_BY_DRIVER).unwrap();
        assert_eq!(
            open(&services, controller, guid(1), Some(agent), None, efi::OPEN_PROTOCOL_EXCLUSIVE),
            Err(EfiError::AccessDenied)
        );
        let info = services.open_protocol_information(controller, guid(1)).unwrap();
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].agent_handle, Some(driver));
    }

    #[test]
    fn uninstall_should_drain_by_driver_owners() {
        let mut controller_services = MockControllerServices::new();
        controller_services.expect_disconnect_controller().times(1).returning_st(|services, controller, driver, _| {
            services.close_protocol(controller, guid(1), driver.unwrap(), Some(controller))
        });
        controller_services.expect_connect_controller().never();

        let services = ProtocolServices::new().with_controller_services(Box::new(controller_services));
        let controller = services.install_protocol_interface(None, guid(1), interface_value(0xAA)).unwrap();
        let driver = services.install_protocol_interface(None, guid(2), interface_value(0xB0)).unwrap();
        open(&services, controller, guid(1), Some(driver), Some(controller), efi::OPEN_PROTOCOL_BY_DRIVER).unwrap();
        services.handle_protocol(controller, guid(1)).unwrap();

        assert!(services.uninstall_protocol_interface(controller, guid(1), interface_value(0xAA)).is_ok());
        assert!(services.validate_handle(controller).is_err());
    }

    #[test]
    fn failed_uninstall_should_leave_database_unchanged() {
        let reconnects = std::rc::Rc::new(core::cell::Cell::new(0));
        let reconnects_clone = reconnects.clone();
        let mut controller_services = MockControllerServices::new();
        controller_services.expect_disconnect_controller().times(1).returning(|_, _, _, _| Err(EfiError::Unsupported));
        controller_services.expect_connect_controller().times(1).returning_st(move |_, _, _, _, recursive| {
            assert!(recursive);
            reconnects_clone.set(reconnects_clone.get() + 1);
            Ok(())
        });

        let services = ProtocolServices::new().with_controller_services(Box::new(controller_services));
        let controller = services.install_protocol_interface(None, guid(1), interface_value(0xAA)).unwrap();
        let driver = services.install_protocol_interface(None, guid(2), interface_value(0xB0)).unwrap();
        open(&services, controller, guid(1), Some(driver), Some(controller), efi::OPEN_PROTOCOL_BY_DRIVER).unwrap();
        services.handle_protocol(controller, guid(1)).unwrap();

        let key_before = services.get_handle_database_key();
        let ledger_before = services.get_open_protocol_information(controller).unwrap();
        let protocols_before = services.protocols_per_handle(controller).unwrap();

        assert_eq!(
            services.uninstall_protocol_interface(controller, guid(1), interface_value(0xAA)),
            Err(EfiError::AccessDenied)
        );
        assert_eq!(reconnects.get(), 1);
        assert_eq!(services.get_handle_database_key(), key_before);
        assert_eq!(services.get_open_protocol_information(controller).unwrap(), ledger_before);
        assert_eq!(services.protocols_per_handle(controller).unwrap(), protocols_before);
    }

    #[test]
    fn uninstall_should_be_denied_while_child_records_remain() {
        let services = ProtocolServices::new();
        let parent = services.install_protocol_interface(None, guid(1), interface_value(0xAA)).unwrap();
        let driver = services.install_protocol_interface(None, guid(2), interface_value(0xB0)).unwrap();
        let child = services.install_protocol_interface(None, guid(3), interface_value(0xC0)).unwrap();
        open(&services, parent, guid(1), Some(driver), Some(child), efi::OPEN_PROTOCOL_BY_CHILD_CONTROLLER).unwrap();
        assert_eq!(services.get_child_handles(parent), vec![child]);

        assert_eq!(
            services.uninstall_protocol_interface(parent, guid(1), interface_value(0xAA)),
            Err(EfiError::AccessDenied)
        );
        services.close_protocol(parent, guid(1), driver, Some(child)).unwrap();
        assert!(services.uninstall_protocol_interface(parent, guid(1), interface_value(0xAA)).is_ok());
    }

    #[test]
    fn protocol_notify_should_fire_once_per_install() {
        let services = ProtocolServices::new();
        let counter = AtomicUsize::new(0);
        let event = counting_event(&services, &counter);
        let registration = services.register_protocol_notify(guid(2), event).unwrap();

        let first = services.install_protocol_interface(None, guid(2), interface_value(1)).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        services.install_protocol_interface(None, guid(2), interface_value(2)).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        services.install_protocol_interface(None, guid(3), interface_value(3)).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        assert_eq!(services.locate_handle_buffer(SearchType::ByRegisterNotify(registration)), Ok(vec![first]));
        assert_eq!(services.locate_protocol(guid(2), Some(registration)), Ok(interface_value(2)));
        assert_eq!(services.locate_protocol(guid(2), Some(registration)), Err(EfiError::NotFound));
        assert_eq!(
            services.locate_handle_buffer(SearchType::ByRegisterNotify(registration)),
            Err(EfiError::NotFound)
        );
    }

    #[test]
    fn register_protocol_notify_should_require_valid_event() {
        let services = ProtocolServices::new();
        assert_eq!(
            services.register_protocol_notify(guid(1), interface_value(0x4444)),
            Err(EfiError::InvalidParameter)
        );
    }

    #[test]
    fn unregistered_or_closed_events_should_not_fire() {
        let services = ProtocolServices::new();
        let counter = AtomicUsize::new(0);
        let event = counting_event(&services, &counter);
        services.register_protocol_notify(guid(1), event).unwrap();
        services.register_protocol_notify(guid(2), event).unwrap();
        services.unregister_protocol_notify(event).unwrap();
        services.install_protocol_interface(None, guid(1), interface_value(1)).unwrap();
        services.install_protocol_interface(None, guid(2), interface_value(2)).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        let event = counting_event(&services, &counter);
        services.register_protocol_notify(guid(1), event).unwrap();
        services.close_event(event).unwrap();
        services.install_protocol_interface(None, guid(1), interface_value(3)).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn reinstall_should_notify_and_reconnect() {
        let mut controller_services = MockControllerServices::new();
        controller_services.expect_connect_controller().times(1).returning_st(|services, handle, _, _, recursive| {
            assert!(recursive);
            // the new interface is in place by the time drivers reconnect.
            assert_eq!(services.get_interface_for_handle(handle, guid(1)), Ok(interface_value(0xBB)));
            Ok(())
        });

        let services = ProtocolServices::new().with_controller_services(Box::new(controller_services));
        let counter = AtomicUsize::new(0);
        let event = counting_event(&services, &counter);
        let handle = services.install_protocol_interface(None, guid(1), interface_value(0xAA)).unwrap();
        let registration = services.register_protocol_notify(guid(1), event).unwrap();

        assert_eq!(
            services.reinstall_protocol_interface(handle, guid(1), interface_value(0xCC), interface_value(0xBB)),
            Err(EfiError::NotFound)
        );
        services.reinstall_protocol_interface(handle, guid(1), interface_value(0xAA), interface_value(0xBB)).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(services.next_handle_for_registration(registration), Some(handle));
        assert_eq!(services.handle_protocol(handle, guid(1)), Ok(interface_value(0xBB)));
    }

    #[test]
    fn reinstall_should_evict_by_driver_owner_first() {
        let mut controller_services = MockControllerServices::new();
        controller_services.expect_disconnect_controller().times(1).returning_st(|services, controller, driver, _| {
            services.close_protocol(controller, guid(1), driver.unwrap(), Some(controller))
        });
        controller_services.expect_connect_controller().times(1).returning(|_, _, _, _, _| Ok(()));

        let services = ProtocolServices::new().with_controller_services(Box::new(controller_services));
        let controller = services.install_protocol_interface(None, guid(1), interface_value(0xAA)).unwrap();
        let driver = services.install_protocol_interface(None, guid(2), interface_value(0xB0)).unwrap();
        open(&services, controller, guid(1), Some(driver), Some(controller), efi::OPEN_PROTOCOL_BY_DRIVER).unwrap();

        services
            .reinstall_protocol_interface(controller, guid(1), interface_value(0xAA), interface_value(0xBB))
            .unwrap();
        assert_eq!(services.handle_protocol(controller, guid(1)), Ok(interface_value(0xBB)));
        let info = services.open_protocol_information(controller, guid(1)).unwrap();
        assert!(info.iter().all(|record| record.agent_handle != Some(driver)));
    }

    #[test]
    fn reinstall_should_be_denied_when_owner_refuses_to_stop() {
        let mut controller_services = MockControllerServices::new();
        controller_services.expect_disconnect_controller().times(1).returning(|_, _, _, _| Err(EfiError::Unsupported));
        // only the recovery reconnect runs.
        controller_services.expect_connect_controller().times(1).returning(|_, _, _, _, _| Ok(()));

        let services = ProtocolServices::new().with_controller_services(Box::new(controller_services));
        let counter = AtomicUsize::new(0);
        let event = counting_event(&services, &counter);
        services.register_protocol_notify(guid(1), event).unwrap();
        let controller = services.install_protocol_interface(None, guid(1), interface_value(0xAA)).unwrap();
        let driver = services.install_protocol_interface(None, guid(2), interface_value(0xB0)).unwrap();
        open(&services, controller, guid(1), Some(driver), Some(controller), efi::OPEN_PROTOCOL_BY_DRIVER).unwrap();
        counter.store(0, Ordering::SeqCst);

        assert_eq!(
            services.reinstall_protocol_interface(controller, guid(1), interface_value(0xAA), interface_value(0xBB)),
            Err(EfiError::AccessDenied)
        );
        assert_eq!(services.handle_protocol(controller, guid(1)), Ok(interface_value(0xAA)));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        let info = services.open_protocol_information(controller, guid(1)).unwrap();
        assert!(info.iter().any(|record| record.agent_handle == Some(driver)));
    }

    #[test]
    fn tokens_of_one_kind_should_not_validate_as_another() {
        let services = ProtocolServices::new();
        let handle = services.install_protocol_interface(None, guid(1), interface_value(1)).unwrap();
        let other = services.install_protocol_interface(None, guid(2), interface_value(2)).unwrap();
        let first_event = services.create_event(0, efi::TPL_APPLICATION, None, None).unwrap();
        let event = services.create_event(0, efi::TPL_APPLICATION, None, None).unwrap();
        let notify_event = services
            .create_event(efi::EVT_NOTIFY_SIGNAL, efi::TPL_CALLBACK, Some(count_notify), Some(ptr::null_mut()))
            .unwrap();
        let registration = services.register_protocol_notify(guid(3), notify_event).unwrap();

        for candidate in [first_event, event, notify_event, registration] {
            assert_eq!(services.validate_handle(candidate), Err(EfiError::InvalidParameter));
        }
        assert_eq!(
            open(&services, handle, guid(1), Some(event), None, efi::OPEN_PROTOCOL_EXCLUSIVE),
            Err(EfiError::InvalidParameter)
        );
        assert!(services.open_protocol_information(handle, guid(1)).unwrap().is_empty());

        for candidate in [handle, other, registration] {
            assert!(!services.is_valid_event(candidate));
            assert_eq!(services.register_protocol_notify(guid(3), candidate), Err(EfiError::InvalidParameter));
        }
    }

    #[test]
    fn install_multiple_should_defer_notifies_and_install_everything() {
        let services = ProtocolServices::new();
        let counter = AtomicUsize::new(0);
        let event = counting_event(&services, &counter);
        services.register_protocol_notify(guid(1), event).unwrap();

        let handle = unsafe {
            services.install_multiple_protocol_interfaces(
                None,
                &[(guid(1), interface_value(1)), (guid(2), interface_value(2))],
            )
        }
        .unwrap();
        assert_eq!(services.protocols_per_handle(handle), Ok(vec![guid(2), guid(1)]));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(services.current_tpl(), efi::TPL_APPLICATION);
    }

    #[test]
    fn install_multiple_should_roll_back_on_failure() {
        let services = ProtocolServices::new();
        let handle = services.install_protocol_interface(None, guid(3), interface_value(3)).unwrap();

        let result = unsafe {
            services.install_multiple_protocol_interfaces(
                Some(handle),
                &[(guid(1), interface_value(1)), (guid(2), interface_value(2)), (guid(3), interface_value(4))],
            )
        };
        assert_eq!(result, Err(EfiError::InvalidParameter));
        assert_eq!(services.protocols_per_handle(handle), Ok(vec![guid(3)]));

        // a newly created handle disappears entirely.
        let before = services.locate_handles(None);
        let result = unsafe {
            services.install_multiple_protocol_interfaces(
                None,
                &[(guid(1), interface_value(1)), (guid(1), interface_value(2))],
            )
        };
        assert_eq!(result, Err(EfiError::InvalidParameter));
        assert_eq!(services.locate_handles(None), before);

        assert_eq!(
            unsafe { services.install_multiple_protocol_interfaces(None, &[]) },
            Err(EfiError::InvalidParameter)
        );
    }

    #[test]
    fn install_multiple_should_reject_duplicate_device_path() {
        let services = ProtocolServices::new();
        let path = DevicePathBuilder::new().node(1, 1, &[0, 0, 0, 0]).node(3, 1, &[5]).build();
        let duplicate = DevicePathBuilder::new().node(1, 1, &[0, 0, 0, 0]).node(3, 1, &[5]).build();
        let child = DevicePathBuilder::new().node(1, 1, &[0, 0, 0, 0]).node(3, 1, &[5]).node(4, 1, &[9]).build();
        let dp_guid = efi::protocols::device_path::PROTOCOL_GUID;

        let existing = unsafe { services.install_multiple_protocol_interfaces(None, &[(dp_guid, path.as_interface())]) }
            .unwrap();

        let result = unsafe {
            services.install_multiple_protocol_interfaces(
                None,
                &[(guid(1), interface_value(1)), (dp_guid, duplicate.as_interface())],
            )
        };
        assert_eq!(result, Err(EfiError::AlreadyStarted));
        assert!(services.locate_handles(Some(guid(1))).is_empty());

        let child_handle =
            unsafe { services.install_multiple_protocol_interfaces(None, &[(dp_guid, child.as_interface())]) }.unwrap();
        assert_ne!(child_handle, existing);
    }

    #[test]
    fn locate_device_path_should_pick_longest_prefix() {
        let services = ProtocolServices::new();
        let dp_guid = efi::protocols::device_path::PROTOCOL_GUID;
        let root = DevicePathBuilder::new().node(2, 1, &[1, 0, 0, 0]).build();
        let bridge = DevicePathBuilder::new().node(2, 1, &[1, 0, 0, 0]).node(1, 1, &[0, 3]).build();
        let target =
            DevicePathBuilder::new().node(2, 1, &[1, 0, 0, 0]).node(1, 1, &[0, 3]).node(3, 5, &[0x10, 0x20]).build();

        let root_handle = services.install_protocol_interface(None, dp_guid, root.as_interface()).unwrap();
        services.install_protocol_interface(Some(root_handle), guid(1), interface_value(1)).unwrap();
        let bridge_handle = services.install_protocol_interface(None, dp_guid, bridge.as_interface()).unwrap();
        services.install_protocol_interface(Some(bridge_handle), guid(1), interface_value(2)).unwrap();
        // supports the device path but not the requested protocol.
        services.install_protocol_interface(None, dp_guid, target.as_interface()).unwrap();

        let (remaining, handle) = unsafe { services.locate_device_path(guid(1), target.as_ptr()) }.unwrap();
        assert_eq!(handle, bridge_handle);
        assert_eq!(unsafe { (*remaining).r#type }, 3);
        let length = u16::from_le_bytes(unsafe { (*remaining).length }) as usize;
        let next = unsafe { (remaining as *const u8).add(length) } as *const DevicePath;
        assert!(unsafe { is_device_path_end(next) });

        let unrelated = DevicePathBuilder::new().node(2, 1, &[2, 0, 0, 0]).build();
        assert_eq!(unsafe { services.locate_device_path(guid(1), unrelated.as_ptr()) }, Err(EfiError::NotFound));
        assert_eq!(
            unsafe { services.locate_device_path(guid(1), ptr::null()) },
            Err(EfiError::InvalidParameter)
        );
        // the core's own handle is never a device path match.
        assert_ne!(handle, DXE_CORE_HANDLE);
    }

    #[test]
    fn uninstall_multiple_should_reject_missing_pairs_before_removing_anything() {
        let services = ProtocolServices::new();
        let handle = services.install_protocol_interface(None, guid(1), interface_value(1)).unwrap();
        let key_before = services.get_handle_database_key();

        let interfaces = [(guid(1), interface_value(1)), (guid(2), interface_value(2))];
        let result = services.uninstall_multiple_protocol_interfaces(handle, &interfaces);
        assert_eq!(result, Err(EfiError::InvalidParameter));
        assert!(services.validate_handle(handle).is_ok());
        assert_eq!(services.locate_handle_buffer(SearchType::ByProtocol(guid(1))), Ok(vec![handle]));
        assert_eq!(services.get_handle_database_key(), key_before);

        let repeated = [(guid(1), interface_value(1)), (guid(1), interface_value(1))];
        let result = services.uninstall_multiple_protocol_interfaces(handle, &repeated);
        assert_eq!(result, Err(EfiError::InvalidParameter));
        assert_eq!(services.handle_protocol(handle, guid(1)), Ok(interface_value(1)));
    }

    #[test]
    fn uninstall_multiple_should_reinstall_when_a_driver_refuses_to_stop() {
        let mut controller_services = MockControllerServices::new();
        controller_services.expect_disconnect_controller().times(1).returning(|_, _, _, _| Err(EfiError::Unsupported));
        controller_services.expect_connect_controller().returning(|_, _, _, _, _| Ok(()));

        let services = ProtocolServices::new().with_controller_services(Box::new(controller_services));
        let handle = unsafe {
            services.install_multiple_protocol_interfaces(
                None,
                &[(guid(1), interface_value(1)), (guid(2), interface_value(2))],
            )
        }
        .unwrap();
        let driver = services.install_protocol_interface(None, guid(3), interface_value(3)).unwrap();
        open(&services, handle, guid(2), Some(driver), Some(handle), efi::OPEN_PROTOCOL_BY_DRIVER).unwrap();

        let interfaces = [(guid(1), interface_value(1)), (guid(2), interface_value(2))];
        let result = services.uninstall_multiple_protocol_interfaces(handle, &interfaces);
        assert_eq!(result, Err(EfiError::InvalidParameter));
        let mut protocols = services.protocols_per_handle(handle).unwrap();
        protocols.sort_by_key(|guid| *guid.as_bytes());
        assert_eq!(protocols, vec![guid(1), guid(2)]);
        assert_eq!(services.handle_protocol(handle, guid(1)), Ok(interface_value(1)));
    }

    #[test]
    fn uninstall_multiple_should_restore_on_failure() {
        let services = ProtocolServices::new();
        let handle = unsafe {
            services.install_multiple_protocol_interfaces(
                None,
                &[(guid(1), interface_value(1)), (guid(2), interface_value(2))],
            )
        }
        .unwrap();

        assert_eq!(
            services.uninstall_multiple_protocol_interfaces(
                handle,
                &[(guid(1), interface_value(1)), (guid(2), interface_value(9))]
            ),
            Err(EfiError::InvalidParameter)
        );
        let mut protocols = services.protocols_per_handle(handle).unwrap();
        protocols.sort_by_key(|guid| *guid.as_bytes());
        assert_eq!(protocols, vec![guid(1), guid(2)]);

        let interfaces = [(guid(1), interface_value(1)), (guid(2), interface_value(2))];
        assert!(services.uninstall_multiple_protocol_interfaces(handle, &interfaces).is_ok());
        assert!(services.validate_handle(handle).is_err());
    }

    #[test]
    fn locate_should_report_not_found_for_empty_results() {
        let services = ProtocolServices::new();
        assert_eq!(services.locate_handle_buffer(SearchType::ByProtocol(guid(1))), Err(EfiError::NotFound));
        assert_eq!(
            services.locate_handle_buffer(SearchType::ByRegisterNotify(ptr::null_mut())),
            Err(EfiError::InvalidParameter)
        );
        assert_eq!(services.locate_protocol(guid(1), None), Err(EfiError::NotFound));

        let first = services.install_protocol_interface(None, guid(1), interface_value(1)).unwrap();
        let second = services.install_protocol_interface(None, guid(1), interface_value(2)).unwrap();
        assert_eq!(services.locate_handle_buffer(SearchType::ByProtocol(guid(1))), Ok(vec![first, second]));
        assert_eq!(services.locate_protocol(guid(1), None), Ok(interface_value(1)));
    }
}
