//! UEFI Protocol Database support
//!
//! This module holds the handle table, the protocol entry table and the per-interface open-protocol ledgers. Every
//! operation here runs to completion without calling out of the database; operations that must call external
//! driver code (forced disconnects, reconnects, notifications) are sequenced by
//! [`ProtocolServices`](crate::ProtocolServices) around the primitives in this module.
//!
//! Both tables are keyed collections addressed by plain identifiers:
//! - the handle table owns each handle's protocol interfaces, newest first;
//! - each protocol entry lists the handles implementing it in install order, together with its notify subscriptions.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::{
    collections::{BTreeMap, VecDeque},
    vec::Vec,
};
use core::{cmp::Ordering, ffi::c_void};
use r_efi::efi;

use crate::{
    error::{EfiError, Result},
    token, HANDLE_TOKEN, REGISTRATION_TOKEN,
};

/// Handle that identifies the core itself. It is the agent recorded for opens made through `HandleProtocol`.
pub const DXE_CORE_HANDLE: efi::Handle = token(HANDLE_TOKEN, 0) as efi::Handle;

// {A8E2C1F6-0B4E-4D7A-9F2C-6E1B3D5A7C90}
const DXE_CORE_PROTOCOL_GUID: efi::Guid =
    efi::Guid::from_fields(0xa8e2c1f6, 0x0b4e, 0x4d7a, 0x9f, 0x2c, &[0x6e, 0x1b, 0x3d, 0x5a, 0x7c, 0x90]);

const BY_DRIVER_EXCLUSIVE: u32 = efi::OPEN_PROTOCOL_BY_DRIVER | efi::OPEN_PROTOCOL_EXCLUSIVE;

const ADVISORY_ATTRIBUTES: u32 =
    efi::OPEN_PROTOCOL_BY_HANDLE_PROTOCOL | efi::OPEN_PROTOCOL_GET_PROTOCOL | efi::OPEN_PROTOCOL_TEST_PROTOCOL;

// efi::Guid carries no ordering of its own; order by raw bytes so it can key a BTreeMap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OrdGuid(efi::Guid);

impl PartialOrd for OrdGuid {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrdGuid {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.as_bytes().cmp(other.0.as_bytes())
    }
}

/// One consumer's claim on a protocol interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenProtocolInformation {
    /// Agent (typically a driver image handle) that opened the protocol.
    pub agent_handle: Option<efi::Handle>,
    /// Controller the agent is managing, if any.
    pub controller_handle: Option<efi::Handle>,
    /// The `OPEN_PROTOCOL_*` attributes used to open the protocol.
    pub attributes: u32,
    /// Number of identical opens folded into this record.
    pub open_count: u32,
}

impl From<OpenProtocolInformation> for efi::OpenProtocolInformationEntry {
    fn from(item: OpenProtocolInformation) -> Self {
        efi::OpenProtocolInformationEntry {
            agent_handle: item.agent_handle.unwrap_or(core::ptr::null_mut()),
            controller_handle: item.controller_handle.unwrap_or(core::ptr::null_mut()),
            attributes: item.attributes,
            open_count: item.open_count,
        }
    }
}

/// Result of recording an open against the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenDisposition {
    /// The open was recorded (or folded into an existing identical record, or needs no record).
    Opened,
    /// An exclusive open must first evict the given `BY_DRIVER` agent before it can be retried.
    DisconnectRequired(efi::Handle),
}

#[derive(Debug)]
struct ProtocolInterface {
    protocol: efi::Guid,
    interface: *mut c_void,
    usages: Vec<OpenProtocolInformation>,
}

#[derive(Debug)]
struct HandleEntry {
    key: u64,
    // most recently installed first.
    interfaces: Vec<ProtocolInterface>,
}

impl HandleEntry {
    fn interface(&self, protocol: &efi::Guid) -> Option<&ProtocolInterface> {
        self.interfaces.iter().find(|x| x.protocol == *protocol)
    }

    fn interface_mut(&mut self, protocol: &efi::Guid) -> Option<&mut ProtocolInterface> {
        self.interfaces.iter_mut().find(|x| x.protocol == *protocol)
    }
}

#[derive(Debug)]
struct ProtocolNotify {
    event: efi::Event,
    registration: usize,
    // handles that gained this protocol since the last lookup by registration.
    fresh_handles: VecDeque<efi::Handle>,
}

#[derive(Debug, Default)]
struct ProtocolEntry {
    // install order, oldest first.
    handles: Vec<usize>,
    notifies: Vec<ProtocolNotify>,
}

/// The handle and protocol database.
#[derive(Debug)]
pub struct ProtocolDb {
    handles: BTreeMap<usize, HandleEntry>,
    protocols: BTreeMap<OrdGuid, ProtocolEntry>,
    next_handle: usize,
    next_registration: usize,
    handle_db_key: u64,
}

// Safety: interfaces, handles and events are opaque tokens owned by their installers; the database never dereferences
// them, so moving the database between execution contexts is sound.
unsafe impl Send for ProtocolDb {}

impl Default for ProtocolDb {
    fn default() -> Self {
        Self::new()
    }
}

fn reserve_one<T>(vec: &mut Vec<T>) -> Result<()> {
    vec.try_reserve(1).map_err(|_| EfiError::OutOfResources)
}

impl ProtocolDb {
    /// Creates an empty protocol database. [`init_protocol_db`](ProtocolDb::init_protocol_db) must be called before
    /// use so that the well-known handles exist.
    pub const fn new() -> Self {
        ProtocolDb {
            handles: BTreeMap::new(),
            protocols: BTreeMap::new(),
            next_handle: 1,
            next_registration: 0,
            handle_db_key: 0,
        }
    }

    /// Creates the well-known [`DXE_CORE_HANDLE`]. Calling it more than once has no further effect.
    pub fn init_protocol_db(&mut self) {
        let core_key = DXE_CORE_HANDLE as usize;
        if self.handles.contains_key(&core_key) {
            return;
        }
        self.handle_db_key += 1;
        let interfaces = alloc::vec![ProtocolInterface {
            protocol: DXE_CORE_PROTOCOL_GUID,
            interface: core::ptr::null_mut(),
            usages: Vec::new(),
        }];
        self.handles.insert(core_key, HandleEntry { key: self.handle_db_key, interfaces });
        self.protocols.entry(OrdGuid(DXE_CORE_PROTOCOL_GUID)).or_default().handles.push(core_key);
    }

    /// Returns `Ok(())` if `handle` refers to a live handle, or [`EfiError::InvalidParameter`] otherwise.
    pub fn validate_handle(&self, handle: efi::Handle) -> Result<()> {
        if handle.is_null() || !self.handles.contains_key(&(handle as usize)) {
            return Err(EfiError::InvalidParameter);
        }
        Ok(())
    }

    fn require_handle(&self, handle: Option<efi::Handle>) -> Result<efi::Handle> {
        let handle = handle.ok_or(EfiError::InvalidParameter)?;
        self.validate_handle(handle)?;
        Ok(handle)
    }

    fn handle_entry(&self, handle: efi::Handle) -> Result<&HandleEntry> {
        self.handles.get(&(handle as usize)).ok_or(EfiError::InvalidParameter)
    }

    fn handle_entry_mut(&mut self, handle: efi::Handle) -> Result<&mut HandleEntry> {
        if handle.is_null() {
            return Err(EfiError::InvalidParameter);
        }
        self.handles.get_mut(&(handle as usize)).ok_or(EfiError::InvalidParameter)
    }

    fn bump_key(&mut self) -> u64 {
        self.handle_db_key += 1;
        self.handle_db_key
    }

    /// Returns the current handle database key. It increases on every handle creation and on every install,
    /// uninstall or reinstall.
    pub fn handle_database_key(&self) -> u64 {
        self.handle_db_key
    }

    /// Returns the key last assigned to `handle`.
    pub fn handle_key(&self, handle: efi::Handle) -> Result<u64> {
        Ok(self.handle_entry(handle)?.key)
    }

    /// Returns every handle whose key is newer than `key`, in creation order.
    pub fn handles_modified_since(&self, key: u64) -> Vec<efi::Handle> {
        self.handles.iter().filter(|(_, entry)| entry.key > key).map(|(id, _)| *id as efi::Handle).collect()
    }

    /// Installs `interface` for `protocol` on `handle`, creating a new handle if `handle` is `None`.
    ///
    /// Returns the handle the interface was installed on and the events of every notify subscription registered for
    /// `protocol`; the caller is responsible for signaling them.
    ///
    /// ## Errors
    ///
    /// - [`EfiError::InvalidParameter`] if `handle` is given but invalid, or already carries `protocol`.
    /// - [`EfiError::OutOfResources`] if an internal record cannot be allocated. No state is modified in that case,
    ///   except that the protocol entry for `protocol` may have been created.
    pub fn install_protocol_interface(
        &mut self,
        handle: Option<efi::Handle>,
        protocol: efi::Guid,
        interface: *mut c_void,
    ) -> Result<(efi::Handle, Vec<efi::Event>)> {
        if let Some(handle) = handle {
            self.validate_handle(handle)?;
            if self.handle_entry(handle)?.interface(&protocol).is_some() {
                return Err(EfiError::InvalidParameter);
            }
        }

        let mut notify_events = Vec::new();
        let protocol_entry = self.protocols.entry(OrdGuid(protocol)).or_default();
        reserve_one(&mut protocol_entry.handles)?;
        notify_events.try_reserve(protocol_entry.notifies.len()).map_err(|_| EfiError::OutOfResources)?;
        for notify in protocol_entry.notifies.iter_mut() {
            notify.fresh_handles.try_reserve(1).map_err(|_| EfiError::OutOfResources)?;
        }

        let new_interface = ProtocolInterface { protocol, interface, usages: Vec::new() };
        let handle = match handle {
            Some(handle) => {
                let entry = self.handle_entry_mut(handle)?;
                reserve_one(&mut entry.interfaces)?;
                entry.interfaces.insert(0, new_interface);
                handle
            }
            None => {
                let mut interfaces = Vec::new();
                reserve_one(&mut interfaces)?;
                interfaces.push(new_interface);
                let id = token(HANDLE_TOKEN, self.next_handle);
                self.next_handle += 1;
                let key = self.bump_key();
                self.handles.insert(id, HandleEntry { key, interfaces });
                id as efi::Handle
            }
        };

        let key = self.bump_key();
        if let Some(entry) = self.handles.get_mut(&(handle as usize)) {
            entry.key = key;
        }

        // Space for both pushes was reserved above.
        if let Some(protocol_entry) = self.protocols.get_mut(&OrdGuid(protocol)) {
            protocol_entry.handles.push(handle as usize);
            for notify in protocol_entry.notifies.iter_mut() {
                notify.fresh_handles.push_back(handle);
                notify_events.push(notify.event);
            }
        }

        Ok((handle, notify_events))
    }

    /// Locates the exact (handle, protocol, interface) triple.
    ///
    /// ## Errors
    ///
    /// [`EfiError::InvalidParameter`] for an invalid handle; [`EfiError::NotFound`] if the handle does not carry
    /// `protocol` or carries it with a different interface.
    pub fn find_protocol_interface(
        &self,
        handle: efi::Handle,
        protocol: efi::Guid,
        interface: *mut c_void,
    ) -> Result<()> {
        self.validate_handle(handle)?;
        match self.handle_entry(handle)?.interface(&protocol) {
            Some(instance) if instance.interface == interface => Ok(()),
            _ => Err(EfiError::NotFound),
        }
    }

    /// Removes `interface` for `protocol` from `handle`. The handle is destroyed if this was its last interface.
    ///
    /// The ledger must already have been drained; any remaining open record causes [`EfiError::AccessDenied`].
    pub fn uninstall_protocol_interface(
        &mut self,
        handle: efi::Handle,
        protocol: efi::Guid,
        interface: *mut c_void,
    ) -> Result<()> {
        self.find_protocol_interface(handle, protocol, interface)?;
        let handle_id = handle as usize;
        let entry = self.handle_entry_mut(handle)?;
        let position = entry.interfaces.iter().position(|x| x.protocol == protocol).ok_or(EfiError::NotFound)?;
        if !entry.interfaces[position].usages.is_empty() {
            return Err(EfiError::AccessDenied);
        }
        entry.interfaces.remove(position);
        let handle_is_empty = entry.interfaces.is_empty();

        if let Some(protocol_entry) = self.protocols.get_mut(&OrdGuid(protocol)) {
            protocol_entry.handles.retain(|x| *x != handle_id);
            for notify in protocol_entry.notifies.iter_mut() {
                notify.fresh_handles.retain(|x| *x != handle);
            }
        }

        let key = self.bump_key();
        if handle_is_empty {
            self.handles.remove(&handle_id);
        } else if let Some(entry) = self.handles.get_mut(&handle_id) {
            entry.key = key;
        }
        Ok(())
    }

    /// Replaces `old_interface` with `new_interface` in place.
    ///
    /// The interface keeps its position on the handle, moves to the tail of the protocol's install order and is
    /// queued for every notify subscription of `protocol`, whose events are returned.
    pub fn reinstall_protocol_interface(
        &mut self,
        handle: efi::Handle,
        protocol: efi::Guid,
        old_interface: *mut c_void,
        new_interface: *mut c_void,
    ) -> Result<Vec<efi::Event>> {
        self.find_protocol_interface(handle, protocol, old_interface)?;
        let handle_id = handle as usize;

        let mut notify_events = Vec::new();
        let protocol_entry = self.protocols.get_mut(&OrdGuid(protocol)).ok_or(EfiError::NotFound)?;
        notify_events.try_reserve(protocol_entry.notifies.len()).map_err(|_| EfiError::OutOfResources)?;
        for notify in protocol_entry.notifies.iter_mut() {
            notify.fresh_handles.try_reserve(1).map_err(|_| EfiError::OutOfResources)?;
        }

        let instance = self.handle_entry_mut(handle)?.interface_mut(&protocol).ok_or(EfiError::NotFound)?;
        if !instance.usages.is_empty() {
            return Err(EfiError::AccessDenied);
        }
        instance.interface = new_interface;

        let key = self.bump_key();
        if let Some(entry) = self.handles.get_mut(&handle_id) {
            entry.key = key;
        }

        if let Some(protocol_entry) = self.protocols.get_mut(&OrdGuid(protocol)) {
            protocol_entry.handles.retain(|x| *x != handle_id);
            protocol_entry.handles.push(handle_id);
            for notify in protocol_entry.notifies.iter_mut() {
                if !notify.fresh_handles.contains(&handle) {
                    notify.fresh_handles.push_back(handle);
                }
                notify_events.push(notify.event);
            }
        }
        Ok(notify_events)
    }

    /// Returns the interface `handle` carries for `protocol` without recording an open.
    ///
    /// ## Errors
    ///
    /// [`EfiError::InvalidParameter`] for an invalid handle; [`EfiError::Unsupported`] if the protocol is absent.
    pub fn get_interface_for_handle(&self, handle: efi::Handle, protocol: efi::Guid) -> Result<*mut c_void> {
        self.validate_handle(handle)?;
        self.handle_entry(handle)?.interface(&protocol).map(|x| x.interface).ok_or(EfiError::Unsupported)
    }

    /// Checks the handles required by the given open `attributes`.
    ///
    /// `BY_CHILD_CONTROLLER`, `BY_DRIVER` and `BY_DRIVER | EXCLUSIVE` need valid agent and controller handles (and a
    /// child controller must differ from `handle`); `EXCLUSIVE` needs a valid agent; the advisory modes need neither.
    /// Any other attribute combination is invalid.
    pub fn validate_open_parameters(
        &self,
        handle: efi::Handle,
        agent_handle: Option<efi::Handle>,
        controller_handle: Option<efi::Handle>,
        attributes: u32,
    ) -> Result<()> {
        self.validate_handle(handle)?;
        match attributes {
            efi::OPEN_PROTOCOL_BY_CHILD_CONTROLLER => {
                self.require_handle(agent_handle)?;
                let controller = self.require_handle(controller_handle)?;
                if controller == handle {
                    return Err(EfiError::InvalidParameter);
                }
            }
            efi::OPEN_PROTOCOL_BY_DRIVER | BY_DRIVER_EXCLUSIVE => {
                self.require_handle(agent_handle)?;
                self.require_handle(controller_handle)?;
            }
            efi::OPEN_PROTOCOL_EXCLUSIVE => {
                self.require_handle(agent_handle)?;
            }
            efi::OPEN_PROTOCOL_BY_HANDLE_PROTOCOL
            | efi::OPEN_PROTOCOL_GET_PROTOCOL
            | efi::OPEN_PROTOCOL_TEST_PROTOCOL => {}
            _ => return Err(EfiError::InvalidParameter),
        }
        Ok(())
    }

    /// Records an open of `protocol` on `handle` in the ledger.
    ///
    /// Repeating an identical non-exclusive open increments the existing record's open count. An identical
    /// `BY_DRIVER` open fails with [`EfiError::AlreadyStarted`]. A `BY_DRIVER` open conflicts with any existing
    /// `BY_DRIVER` or `EXCLUSIVE` record; an exclusive open conflicts with an existing `EXCLUSIVE` record and requires
    /// existing `BY_DRIVER` owners to be disconnected first, reported as [`OpenDisposition::DisconnectRequired`].
    /// `TEST_PROTOCOL` opens and opens without an agent are never recorded.
    pub fn add_protocol_usage(
        &mut self,
        handle: efi::Handle,
        protocol: efi::Guid,
        agent_handle: Option<efi::Handle>,
        controller_handle: Option<efi::Handle>,
        attributes: u32,
    ) -> Result<OpenDisposition> {
        self.validate_open_parameters(handle, agent_handle, controller_handle, attributes)?;
        let instance = self.handle_entry_mut(handle)?.interface_mut(&protocol).ok_or(EfiError::Unsupported)?;

        let mut by_driver = false;
        let mut exclusive = false;
        let mut by_driver_owner = None;
        for usage in instance.usages.iter_mut() {
            let exact_match = usage.agent_handle == agent_handle
                && usage.attributes == attributes
                && usage.controller_handle == controller_handle;
            if usage.attributes & efi::OPEN_PROTOCOL_BY_DRIVER != 0 {
                by_driver = true;
                if by_driver_owner.is_none() {
                    by_driver_owner = usage.agent_handle;
                }
                if exact_match {
                    return Err(EfiError::AlreadyStarted);
                }
            }
            if usage.attributes & efi::OPEN_PROTOCOL_EXCLUSIVE != 0 {
                exclusive = true;
            } else if exact_match {
                usage.open_count += 1;
                return Ok(OpenDisposition::Opened);
            }
        }

        match attributes {
            efi::OPEN_PROTOCOL_BY_DRIVER => {
                if exclusive || by_driver {
                    return Err(EfiError::AccessDenied);
                }
            }
            BY_DRIVER_EXCLUSIVE | efi::OPEN_PROTOCOL_EXCLUSIVE => {
                if exclusive {
                    return Err(EfiError::AccessDenied);
                }
                if by_driver {
                    return by_driver_owner.map(OpenDisposition::DisconnectRequired).ok_or(EfiError::AccessDenied);
                }
            }
            _ => (),
        }

        if attributes == efi::OPEN_PROTOCOL_TEST_PROTOCOL || agent_handle.is_none() {
            return Ok(OpenDisposition::Opened);
        }

        reserve_one(&mut instance.usages)?;
        instance.usages.push(OpenProtocolInformation { agent_handle, controller_handle, attributes, open_count: 1 });
        Ok(OpenDisposition::Opened)
    }

    /// Removes every ledger record of `protocol` on `handle` opened by `agent_handle` for `controller_handle`.
    ///
    /// ## Errors
    ///
    /// [`EfiError::InvalidParameter`] for an invalid handle; [`EfiError::NotFound`] if the handle does not carry
    /// `protocol` or no record matched.
    pub fn remove_protocol_usage(
        &mut self,
        handle: efi::Handle,
        protocol: efi::Guid,
        agent_handle: Option<efi::Handle>,
        controller_handle: Option<efi::Handle>,
    ) -> Result<()> {
        self.validate_handle(handle)?;
        let instance = self.handle_entry_mut(handle)?.interface_mut(&protocol).ok_or(EfiError::NotFound)?;
        let before = instance.usages.len();
        instance
            .usages
            .retain(|x| !(x.agent_handle == agent_handle && x.controller_handle == controller_handle));
        if instance.usages.len() == before {
            return Err(EfiError::NotFound);
        }
        Ok(())
    }

    /// Returns the agent of the first `BY_DRIVER` record on `protocol` of `handle`, if any.
    pub fn by_driver_agent(&self, handle: efi::Handle, protocol: efi::Guid) -> Option<efi::Handle> {
        let entry = self.handles.get(&(handle as usize))?;
        entry
            .interface(&protocol)?
            .usages
            .iter()
            .find(|x| x.attributes & efi::OPEN_PROTOCOL_BY_DRIVER != 0)
            .and_then(|x| x.agent_handle)
    }

    /// Indicates whether `agent_handle` still holds a `BY_DRIVER` record on `protocol` of `handle`.
    pub fn has_by_driver_usage(&self, handle: efi::Handle, protocol: efi::Guid, agent_handle: efi::Handle) -> bool {
        let Some(entry) = self.handles.get(&(handle as usize)) else {
            return false;
        };
        entry.interface(&protocol).is_some_and(|instance| {
            instance
                .usages
                .iter()
                .any(|x| x.attributes & efi::OPEN_PROTOCOL_BY_DRIVER != 0 && x.agent_handle == Some(agent_handle))
        })
    }

    /// Drops every advisory (`BY_HANDLE_PROTOCOL`, `GET_PROTOCOL`, `TEST_PROTOCOL`) record on `protocol` of `handle`
    /// and returns the number of records that remain. A missing interface has no records.
    pub fn remove_advisory_usages(&mut self, handle: efi::Handle, protocol: efi::Guid) -> usize {
        let Some(entry) = self.handles.get_mut(&(handle as usize)) else {
            return 0;
        };
        match entry.interface_mut(&protocol) {
            Some(instance) => {
                instance.usages.retain(|x| x.attributes & ADVISORY_ATTRIBUTES == 0);
                instance.usages.len()
            }
            None => 0,
        }
    }

    /// Returns a snapshot of the ledger for `protocol` on `handle`.
    ///
    /// ## Errors
    ///
    /// [`EfiError::InvalidParameter`] for an invalid handle; [`EfiError::NotFound`] if the protocol is absent.
    pub fn get_open_protocol_information_by_protocol(
        &self,
        handle: efi::Handle,
        protocol: efi::Guid,
    ) -> Result<Vec<OpenProtocolInformation>> {
        self.validate_handle(handle)?;
        let instance = self.handle_entry(handle)?.interface(&protocol).ok_or(EfiError::NotFound)?;
        Ok(instance.usages.clone())
    }

    /// Returns a snapshot of every ledger on `handle`, keyed by protocol, in handle order.
    pub fn get_open_protocol_information(
        &self,
        handle: efi::Handle,
    ) -> Result<Vec<(efi::Guid, Vec<OpenProtocolInformation>)>> {
        self.validate_handle(handle)?;
        Ok(self.handle_entry(handle)?.interfaces.iter().map(|x| (x.protocol, x.usages.clone())).collect())
    }

    /// Returns the protocols installed on `handle`, most recently installed first.
    pub fn get_protocols_on_handle(&self, handle: efi::Handle) -> Result<Vec<efi::Guid>> {
        self.validate_handle(handle)?;
        Ok(self.handle_entry(handle)?.interfaces.iter().map(|x| x.protocol).collect())
    }

    /// Returns the distinct child controllers opened `BY_CHILD_CONTROLLER` on any protocol of `parent_handle`.
    pub fn get_child_handles(&self, parent_handle: efi::Handle) -> Vec<efi::Handle> {
        let Some(entry) = self.handles.get(&(parent_handle as usize)) else {
            return Vec::new();
        };
        let mut children: Vec<efi::Handle> = Vec::new();
        let candidates = entry
            .interfaces
            .iter()
            .flat_map(|x| x.usages.iter())
            .filter(|x| x.attributes & efi::OPEN_PROTOCOL_BY_CHILD_CONTROLLER != 0)
            .filter_map(|x| x.controller_handle);
        for child in candidates {
            if !children.contains(&child) {
                children.push(child);
            }
        }
        children
    }

    /// Returns every handle (creation order) or the handles supporting `protocol` (install order).
    pub fn locate_handles(&self, protocol: Option<efi::Guid>) -> Vec<efi::Handle> {
        match protocol {
            None => self.handles.keys().map(|x| *x as efi::Handle).collect(),
            Some(protocol) => match self.protocols.get(&OrdGuid(protocol)) {
                Some(entry) => entry.handles.iter().map(|x| *x as efi::Handle).collect(),
                None => Vec::new(),
            },
        }
    }

    /// Returns the oldest interface installed for `protocol`.
    pub fn locate_protocol(&self, protocol: efi::Guid) -> Result<*mut c_void> {
        let entry = self.protocols.get(&OrdGuid(protocol)).ok_or(EfiError::NotFound)?;
        let handle = entry.handles.first().ok_or(EfiError::NotFound)?;
        self.handles
            .get(handle)
            .and_then(|x| x.interface(&protocol))
            .map(|x| x.interface)
            .ok_or(EfiError::NotFound)
    }

    /// Subscribes `event` to installs of `protocol` and returns the registration key.
    pub fn register_protocol_notify(&mut self, protocol: efi::Guid, event: efi::Event) -> Result<*mut c_void> {
        let registration = token(REGISTRATION_TOKEN, self.next_registration);
        let entry = self.protocols.entry(OrdGuid(protocol)).or_default();
        reserve_one(&mut entry.notifies)?;
        entry.notifies.push(ProtocolNotify { event, registration, fresh_handles: VecDeque::new() });
        self.next_registration += 1;
        Ok(registration as *mut c_void)
    }

    /// Removes every subscription for `event` across all protocols and returns how many were removed.
    pub fn unregister_protocol_notify(&mut self, event: efi::Event) -> usize {
        let mut removed = 0;
        for entry in self.protocols.values_mut() {
            let before = entry.notifies.len();
            entry.notifies.retain(|x| x.event != event);
            removed += before - entry.notifies.len();
        }
        removed
    }

    /// Removes every subscription for each of the given events.
    pub fn unregister_protocol_notify_events(&mut self, events: Vec<efi::Event>) {
        for event in events {
            self.unregister_protocol_notify(event);
        }
    }

    /// Pops the oldest handle that gained the protocol of `registration` since the previous call.
    pub fn next_handle_for_registration(&mut self, registration: *mut c_void) -> Option<efi::Handle> {
        let registration = registration as usize;
        let notify = self
            .protocols
            .values_mut()
            .flat_map(|entry| entry.notifies.iter_mut())
            .find(|notify| notify.registration == registration)?;
        notify.fresh_handles.pop_front()
    }

    /// Returns the protocol a registration key was issued for.
    pub fn registration_protocol(&self, registration: *mut c_void) -> Option<efi::Guid> {
        let registration = registration as usize;
        self.protocols
            .iter()
            .find(|(_, entry)| entry.notifies.iter().any(|x| x.registration == registration))
            .map(|(guid, _)| guid.0)
    }
}
