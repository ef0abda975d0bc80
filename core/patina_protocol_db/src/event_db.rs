//! UEFI Event Database support
//!
//! This module provides the event database used to deliver protocol notifications. It covers event creation and
//! destruction, the signaled state, and a priority queue of pending notify callbacks ordered by TPL.
//!
//! ## Examples and Usage
//!
//! ```
//! use patina_protocol_db::event_db::EventDb;
//!
//! let mut event_db = EventDb::new();
//! let event = event_db.create_event(0, 0, None, None).unwrap();
//!
//! event_db.signal_event(event).unwrap();
//!
//! assert!(event_db.is_signaled(event));
//! ```
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::collections::{BTreeMap, BTreeSet};
use core::{cmp::Ordering, ffi::c_void, fmt};
use r_efi::efi;

use crate::{
    error::{EfiError, Result},
    token, EVENT_TOKEN,
};

/// Defines the supported event types
#[repr(u32)]
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum EventType {
    ///
    /// 0x00000200       Generic event with a notification function that
    /// is queued when the event is signaled with SignalEvent()
    ///
    NotifySignalEvent = efi::EVT_NOTIFY_SIGNAL,
    ///
    /// 0x00000100       Generic event with a notification function that
    /// can be waited on with CheckEvent()
    ///
    NotifyWaitEvent = efi::EVT_NOTIFY_WAIT,
    ///
    /// 0x00000000       Generic event without a notification function.
    /// It can be signaled with SignalEvent() and checked with CheckEvent().
    ///
    GenericEvent = 0x00000000,
}

impl TryFrom<u32> for EventType {
    type Error = EfiError;
    fn try_from(value: u32) -> Result<Self> {
        match value {
            x if x == EventType::NotifySignalEvent as u32 => Ok(EventType::NotifySignalEvent),
            x if x == EventType::NotifyWaitEvent as u32 => Ok(EventType::NotifyWaitEvent),
            x if x == EventType::GenericEvent as u32 => Ok(EventType::GenericEvent),
            _ => Err(EfiError::InvalidParameter),
        }
    }
}

impl EventType {
    /// indicates whether this EventType is NOTIFY_SIGNAL
    pub fn is_notify_signal(&self) -> bool {
        (*self as u32) & efi::EVT_NOTIFY_SIGNAL != 0
    }

    /// indicates whether this EventType is NOTIFY_WAIT
    pub fn is_notify_wait(&self) -> bool {
        (*self as u32) & efi::EVT_NOTIFY_WAIT != 0
    }
}

/// Event Notification
#[derive(Clone)]
pub struct EventNotification {
    /// event handle
    pub event: efi::Event,
    /// efi::TPL that notification should run at
    pub notify_tpl: efi::Tpl,
    /// notification function
    pub notify_function: Option<efi::EventNotify>,
    /// context passed to the notification function
    pub notify_context: Option<*mut c_void>,
}

impl fmt::Debug for EventNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventNotification")
            .field("event", &self.event)
            .field("notify_tpl", &self.notify_tpl)
            .field("notify_function", &self.notify_function.map(|f| f as usize))
            .field("notify_context", &self.notify_context)
            .finish()
    }
}

//BTreeSet ordering alone does not preserve insertion order between notifications at the same TPL, so every queued
//notification is tagged with an increasing counter that breaks ties.
#[derive(Debug, Clone)]
struct TaggedEventNotification(EventNotification, u64);

impl PartialOrd for TaggedEventNotification {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TaggedEventNotification {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.0.event == other.0.event {
            Ordering::Equal
        } else if self.0.notify_tpl == other.0.notify_tpl {
            self.1.cmp(&other.1)
        } else {
            other.0.notify_tpl.cmp(&self.0.notify_tpl)
        }
    }
}

impl PartialEq for TaggedEventNotification {
    fn eq(&self, other: &Self) -> bool {
        self.0.event == other.0.event
    }
}

impl Eq for TaggedEventNotification {}

// Private bookkeeping for one event; efi::Event is only the public index into the database.
struct Event {
    event_id: usize,
    event_type: EventType,
    signaled: bool,
    notify_tpl: efi::Tpl,
    notify_function: Option<efi::EventNotify>,
    notify_context: Option<*mut c_void>,
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("event_id", &self.event_id)
            .field("event_type", &self.event_type)
            .field("signaled", &self.signaled)
            .field("notify_tpl", &self.notify_tpl)
            .field("notify_function", &self.notify_function.map(|f| f as usize))
            .field("notify_context", &self.notify_context)
            .finish()
    }
}

impl Event {
    fn new(
        event_id: usize,
        event_type: u32,
        notify_tpl: efi::Tpl,
        notify_function: Option<efi::EventNotify>,
        notify_context: Option<*mut c_void>,
    ) -> Result<Self> {
        let event_type: EventType = event_type.try_into()?;

        if event_type.is_notify_signal() || event_type.is_notify_wait() {
            if notify_function.is_none() {
                return Err(EfiError::InvalidParameter);
            }
            if !((efi::TPL_APPLICATION + 1)..=efi::TPL_HIGH_LEVEL).contains(&notify_tpl) {
                return Err(EfiError::InvalidParameter);
            }
        }

        Ok(Event { event_id, event_type, signaled: false, notify_tpl, notify_function, notify_context })
    }

    fn notification(&self) -> EventNotification {
        EventNotification {
            event: self.event_id as efi::Event,
            notify_tpl: self.notify_tpl,
            notify_function: self.notify_function,
            notify_context: self.notify_context,
        }
    }
}

/// Event database: the set of live events and the queue of pending notifications.
#[derive(Debug)]
pub struct EventDb {
    events: BTreeMap<usize, Event>,
    next_event_id: usize,
    pending_notifies: BTreeSet<TaggedEventNotification>,
    notify_tags: u64, //used to ensure that each notify gets a unique tag in increasing order
}

// Safety: notify contexts are opaque values owned by the event creator; the database never dereferences them.
unsafe impl Send for EventDb {}

impl Default for EventDb {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDb {
    /// Creates an empty event database.
    pub const fn new() -> Self {
        EventDb { events: BTreeMap::new(), next_event_id: 0, pending_notifies: BTreeSet::new(), notify_tags: 0 }
    }

    /// Creates a new event in the event database
    ///
    /// Matches the semantics of EFI_BOOT_SERVICES.CreateEvent() for the generic, notify-signal and notify-wait event
    /// types.
    ///
    /// ## Errors
    ///
    /// Returns [`EfiError::InvalidParameter`] for unsupported event types, or for notify events that lack a notify
    /// function or have a notify TPL outside `(TPL_APPLICATION, TPL_HIGH_LEVEL]`.
    ///
    /// ## Examples
    ///
    /// ```
    /// use patina_protocol_db::event_db::EventDb;
    ///
    /// let mut event_db = EventDb::new();
    /// let event = event_db.create_event(0, 0, None, None).unwrap();
    /// assert_ne!(event, core::ptr::null_mut());
    /// ```
    pub fn create_event(
        &mut self,
        event_type: u32,
        notify_tpl: efi::Tpl,
        notify_function: Option<efi::EventNotify>,
        notify_context: Option<*mut c_void>,
    ) -> Result<efi::Event> {
        let id = token(EVENT_TOKEN, self.next_event_id);
        let event = Event::new(id, event_type, notify_tpl, notify_function, notify_context)?;
        self.next_event_id += 1;
        self.events.insert(id, event);
        Ok(id as efi::Event)
    }

    /// Closes (deletes) an event from the event database. Pending notifications for the event are discarded.
    pub fn close_event(&mut self, event: efi::Event) -> Result<()> {
        let id = event as usize;
        self.events.remove(&id).ok_or(EfiError::InvalidParameter)?;
        Ok(())
    }

    /// Marks an event as signaled, and queues its notification if it is of type NotifySignalEvent.
    ///
    /// ## Errors
    ///
    /// Returns [`EfiError::InvalidParameter`] if the event does not exist.
    pub fn signal_event(&mut self, event: efi::Event) -> Result<()> {
        let id = event as usize;
        let current_event = self.events.get_mut(&id).ok_or(EfiError::InvalidParameter)?;
        let already_signaled = current_event.signaled;
        current_event.signaled = true;
        if current_event.event_type.is_notify_signal() && !already_signaled {
            self.pending_notifies.insert(TaggedEventNotification(current_event.notification(), self.notify_tags));
            self.notify_tags += 1;
        }
        Ok(())
    }

    /// Queues the notification of a notify event regardless of its signaled state.
    ///
    /// Used by `CheckEvent` to give a notify-wait event's notification the chance to signal it.
    ///
    /// ## Errors
    ///
    /// Returns [`EfiError::InvalidParameter`] if the event does not exist or has no notification.
    pub fn queue_event_notify(&mut self, event: efi::Event) -> Result<()> {
        let current_event = self.events.get(&(event as usize)).ok_or(EfiError::InvalidParameter)?;
        if current_event.notify_function.is_none() {
            return Err(EfiError::InvalidParameter);
        }
        self.pending_notifies.insert(TaggedEventNotification(current_event.notification(), self.notify_tags));
        self.notify_tags += 1;
        Ok(())
    }

    /// Indicates whether the given event is in the signaled state. Unknown events are never signaled.
    pub fn is_signaled(&self, event: efi::Event) -> bool {
        self.events.get(&(event as usize)).is_some_and(|event| event.signaled)
    }

    /// Atomically reads and clears the signaled state.
    ///
    /// ## Examples
    ///
    /// ```
    /// use patina_protocol_db::event_db::EventDb;
    ///
    /// let mut event_db = EventDb::new();
    /// let event = event_db.create_event(0, 0, None, None).unwrap();
    ///
    /// event_db.signal_event(event).unwrap();
    /// assert_eq!(event_db.read_and_clear_signaled(event), Ok(true));
    /// assert_eq!(event_db.read_and_clear_signaled(event), Ok(false));
    /// ```
    pub fn read_and_clear_signaled(&mut self, event: efi::Event) -> Result<bool> {
        let event = self.events.get_mut(&(event as usize)).ok_or(EfiError::InvalidParameter)?;
        let signaled = event.signaled;
        event.signaled = false;
        Ok(signaled)
    }

    /// Returns the event type for the given event
    pub fn get_event_type(&self, event: efi::Event) -> Result<EventType> {
        Ok(self.events.get(&(event as usize)).ok_or(EfiError::InvalidParameter)?.event_type)
    }

    /// Indicates whether a given event is valid.
    pub fn is_valid(&self, event: efi::Event) -> bool {
        self.events.contains_key(&(event as usize))
    }

    /// Pops the next pending notification that should run above `tpl_level`, marking its event un-signaled.
    ///
    /// Notifications for events closed after they were queued are silently discarded.
    pub fn consume_next_event_notify(&mut self, tpl_level: efi::Tpl) -> Option<EventNotification> {
        while let Some(item) = self.pending_notifies.first() {
            if !self.events.contains_key(&(item.0.event as usize)) {
                self.pending_notifies.pop_first();
            } else {
                break;
            }
        }
        let item = self.pending_notifies.first()?;
        if item.0.notify_tpl <= tpl_level {
            return None;
        }
        let item = self.pending_notifies.pop_first()?;
        self.events.get_mut(&(item.0.event as usize))?.signaled = false;
        Some(item.0)
    }
}
