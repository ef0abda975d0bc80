//! Shared helpers for unit tests.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
extern crate std;

use alloc::vec::Vec;
use core::ffi::c_void;
use std::io::{self, Write};

use log::Log;
use r_efi::efi::{
    self,
    protocols::device_path::{End, Protocol as DevicePath, TYPE_END},
};

#[ctor::ctor]
fn setup_test_logger() {
    _ = log::set_logger(&TestLogger);
    log::set_max_level(log::LevelFilter::Trace);
}

struct TestLogger;

impl Log for TestLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        _ = io::stdout().write_fmt(format_args!("[{}] {}\n", record.level(), record.args()))
    }

    fn flush(&self) {
        _ = io::stdout().flush()
    }
}

/// Builds a distinct test GUID from a small number.
pub(crate) fn guid(n: u8) -> efi::Guid {
    efi::Guid::from_fields(0x1234_5678, 0x9abc, 0xdef0, n, 0x00, &[0x01, 0x02, 0x03, 0x04, 0x05, n])
}

/// Fabricates an opaque handle value that the database never handed out.
pub(crate) fn handle_value(value: usize) -> efi::Handle {
    value as efi::Handle
}

/// Fabricates an opaque interface pointer.
pub(crate) fn interface_value(value: usize) -> *mut c_void {
    value as *mut c_void
}

/// Assembles an in-memory device path terminated by an end-entire node.
pub(crate) struct DevicePathBuilder {
    bytes: Vec<u8>,
}

impl DevicePathBuilder {
    pub(crate) fn new() -> Self {
        DevicePathBuilder { bytes: Vec::new() }
    }

    pub(crate) fn node(mut self, node_type: u8, sub_type: u8, data: &[u8]) -> Self {
        let length = (data.len() + 4) as u16;
        self.bytes.push(node_type);
        self.bytes.push(sub_type);
        self.bytes.extend_from_slice(&length.to_le_bytes());
        self.bytes.extend_from_slice(data);
        self
    }

    pub(crate) fn build(mut self) -> OwnedDevicePath {
        self.bytes.extend_from_slice(&[TYPE_END, End::SUBTYPE_ENTIRE, 4, 0]);
        OwnedDevicePath { bytes: self.bytes }
    }
}

/// Heap storage for a device path built by [`DevicePathBuilder`].
pub(crate) struct OwnedDevicePath {
    bytes: Vec<u8>,
}

impl OwnedDevicePath {
    pub(crate) fn as_ptr(&self) -> *const DevicePath {
        self.bytes.as_ptr() as *const DevicePath
    }

    /// The path as an installable interface pointer.
    pub(crate) fn as_interface(&self) -> *mut c_void {
        self.bytes.as_ptr() as *mut c_void
    }
}
