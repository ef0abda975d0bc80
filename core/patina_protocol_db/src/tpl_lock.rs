//! Task Priority Level (TPL) Locking support
//!
//! This module provides the mutual exclusion primitive that guards the protocol database. A [`TplMutex`] is tagged
//! with a TPL; when it is locked through a [`TplControl`] implementation the TPL is raised for the life of the guard
//! and restored once the lock has been released.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use core::{
    cell::UnsafeCell,
    fmt,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

use r_efi::efi;

/// Raise/restore interface for the owner of the current task priority level.
pub trait TplControl {
    /// Raises the current TPL to `new_tpl` and returns the previous TPL.
    fn raise_tpl(&self, new_tpl: efi::Tpl) -> efi::Tpl;
    /// Restores the TPL to `old_tpl`, dispatching any work pending above it.
    fn restore_tpl(&self, old_tpl: efi::Tpl);
}

/// Used to guard data with a locked MUTEX and TPL level.
///
/// The execution model is a single logical thread with re-entrancy only through explicit callbacks, so contention
/// always indicates a re-entrant acquisition and is treated as a fatal error.
pub struct TplMutex<T: ?Sized> {
    tpl_lock_level: efi::Tpl,
    lock: AtomicBool,
    name: &'static str,
    data: UnsafeCell<T>,
}

/// Wrapper for guarded data, which can be accessed by Deref or DerefMut on this object.
pub struct TplGuard<'a, T: ?Sized + 'a> {
    release_tpl: Option<efi::Tpl>,
    tpl_control: Option<&'a dyn TplControl>,
    lock: &'a AtomicBool,
    data: &'a mut T,
}

unsafe impl<T: ?Sized + Send> Sync for TplMutex<T> {}
unsafe impl<T: ?Sized + Send> Send for TplMutex<T> {}

impl<T> TplMutex<T> {
    /// Instantiates a new TplMutex with the given TPL level, data object, and name string.
    pub const fn new(tpl_lock_level: efi::Tpl, data: T, name: &'static str) -> Self {
        Self { tpl_lock_level, lock: AtomicBool::new(false), data: UnsafeCell::new(data), name }
    }
}

impl<T: ?Sized> TplMutex<T> {
    /// Lock the TplMutex and return a TplGuard object used to access the data. If `tpl_control` is given, the TPL is
    /// raised to the level specified at TplMutex creation until the guard is dropped.
    ///
    /// Lock reentrance is not supported; an attempt to re-lock something already locked will panic.
    pub fn lock<'a>(&'a self, tpl_control: Option<&'a dyn TplControl>) -> TplGuard<'a, T> {
        self.try_lock(tpl_control).unwrap_or_else(|| panic!("Re-entrant locks for {:?} not permitted.", self.name))
    }

    /// Attempts to lock the TplMutex, and if successful, returns a guard object that can be used to access the data.
    pub fn try_lock<'a>(&'a self, tpl_control: Option<&'a dyn TplControl>) -> Option<TplGuard<'a, T>> {
        let release_tpl = tpl_control.map(|control| control.raise_tpl(self.tpl_lock_level));

        if self.lock.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed).is_err() {
            if let (Some(release_tpl), Some(control)) = (release_tpl, tpl_control) {
                control.restore_tpl(release_tpl);
            }
            return None;
        }

        // Safety: the lock flag was just acquired, so this is the only live reference to the data.
        let data = unsafe { &mut *self.data.get() };
        Some(TplGuard { release_tpl, tpl_control, lock: &self.lock, data })
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for TplMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.try_lock(None) {
            Some(guard) => write!(f, "Mutex {{ data: ").and_then(|()| (*guard).fmt(f)).and_then(|()| write!(f, "}}")),
            None => write!(f, "Mutex {{ <locked> }}"),
        }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for TplGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T: ?Sized> Deref for TplGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.data
    }
}

impl<T: ?Sized> DerefMut for TplGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.data
    }
}

impl<T: ?Sized> Drop for TplGuard<'_, T> {
    fn drop(&mut self) {
        // The lock must be released before the TPL is restored: restoring may dispatch notifications that re-enter
        // the guarded data.
        self.lock.store(false, Ordering::Release);
        if let (Some(tpl), Some(control)) = (self.release_tpl, self.tpl_control) {
            control.restore_tpl(tpl);
        }
    }
}
