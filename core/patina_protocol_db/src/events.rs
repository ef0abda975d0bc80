//! Task priority and event services for the protocol database.
//!
//! Protocol notifications are delivered by signaling events. Notify-signal events queue their notification function,
//! which runs once the current TPL drops below the notification TPL.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use core::{ffi::c_void, sync::atomic::Ordering};

use r_efi::efi;

use crate::{
    error::{EfiError, Result},
    tpl_lock::TplControl,
    ProtocolServices,
};

impl TplControl for ProtocolServices {
    fn raise_tpl(&self, new_tpl: efi::Tpl) -> efi::Tpl {
        let prev_tpl = self.current_tpl.load(Ordering::SeqCst);
        if new_tpl < prev_tpl {
            log::error!("RaiseTpl: requested tpl {:#x} is lower than current tpl {:#x}", new_tpl, prev_tpl);
            return prev_tpl;
        }
        self.current_tpl.store(new_tpl, Ordering::SeqCst);
        prev_tpl
    }

    fn restore_tpl(&self, old_tpl: efi::Tpl) {
        let prev_tpl = self.current_tpl.load(Ordering::SeqCst);
        if old_tpl > prev_tpl {
            log::error!("RestoreTpl: requested tpl {:#x} is higher than current tpl {:#x}", old_tpl, prev_tpl);
            return;
        }

        loop {
            // the event lock must not be held while the notification runs.
            let notification = self.event_db.lock().consume_next_event_notify(old_tpl);
            let Some(notification) = notification else {
                break;
            };
            self.current_tpl.store(notification.notify_tpl, Ordering::SeqCst);
            if let Some(notify_function) = notification.notify_function {
                let context = notification.notify_context.unwrap_or(core::ptr::null_mut());
                notify_function(notification.event, context);
            }
        }
        self.current_tpl.store(old_tpl, Ordering::SeqCst);
    }
}

impl ProtocolServices {
    /// Returns the current task priority level.
    pub fn current_tpl(&self) -> efi::Tpl {
        self.current_tpl.load(Ordering::SeqCst)
    }

    /// Raises the current TPL and returns the previous one. See [`TplControl::raise_tpl`].
    pub fn raise_tpl(&self, new_tpl: efi::Tpl) -> efi::Tpl {
        TplControl::raise_tpl(self, new_tpl)
    }

    /// Restores a TPL returned by [`raise_tpl`](ProtocolServices::raise_tpl), dispatching pending notifications.
    pub fn restore_tpl(&self, old_tpl: efi::Tpl) {
        TplControl::restore_tpl(self, old_tpl)
    }

    /// Creates an event. See [`EventDb::create_event`](crate::event_db::EventDb::create_event).
    pub fn create_event(
        &self,
        event_type: u32,
        notify_tpl: efi::Tpl,
        notify_function: Option<efi::EventNotify>,
        notify_context: Option<*mut c_void>,
    ) -> Result<efi::Event> {
        self.event_db.lock().create_event(event_type, notify_tpl, notify_function, notify_context)
    }

    /// Closes an event. Any protocol notify subscriptions for it are removed as well.
    pub fn close_event(&self, event: efi::Event) -> Result<()> {
        self.event_db.lock().close_event(event)?;
        self.lock_db().unregister_protocol_notify(event);
        Ok(())
    }

    /// Signals an event and dispatches any notification that can run at the current TPL.
    pub fn signal_event(&self, event: efi::Event) -> Result<()> {
        self.event_db.lock().signal_event(event)?;
        let old_tpl = self.raise_tpl(efi::TPL_HIGH_LEVEL);
        self.restore_tpl(old_tpl);
        Ok(())
    }

    /// Returns whether the event was signaled, clearing the signaled state.
    ///
    /// An unsignaled notify-wait event has its notification dispatched first, which may signal it.
    ///
    /// ## Errors
    ///
    /// [`EfiError::InvalidParameter`] for unknown events and notify-signal events.
    pub fn check_event(&self, event: efi::Event) -> Result<bool> {
        let event_type = self.event_db.lock().get_event_type(event)?;
        if event_type.is_notify_signal() {
            return Err(EfiError::InvalidParameter);
        }

        let signaled = self.event_db.lock().read_and_clear_signaled(event)?;
        if signaled || !event_type.is_notify_wait() {
            return Ok(signaled);
        }

        self.event_db.lock().queue_event_notify(event)?;
        let old_tpl = self.raise_tpl(efi::TPL_HIGH_LEVEL);
        self.restore_tpl(old_tpl);
        self.event_db.lock().read_and_clear_signaled(event)
    }

    /// Indicates whether the event is in the signaled state without clearing it.
    pub fn is_signaled(&self, event: efi::Event) -> bool {
        self.event_db.lock().is_signaled(event)
    }

    /// Indicates whether the event exists.
    pub fn is_valid_event(&self, event: efi::Event) -> bool {
        self.event_db.lock().is_valid(event)
    }
}
