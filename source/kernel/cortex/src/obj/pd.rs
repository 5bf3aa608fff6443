// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Protection domain.

extern crate alloc;

use alloc::collections::BTreeSet;

use crate::arena::Handle;
use crate::cap::{CapError, Capability, Perms, Typed};
use crate::space::{MemSpace, ObjSpace, Quota, Space};
use crate::types::{CpuMask, Selector};

pub struct Pd {
    pub obj: ObjSpace,
    pub mem: MemSpace,
    pub quota: Quota,
    /// May use the privileged platform hypercalls.
    pub passthrough: bool,
    /// Processors this domain has run on; targets of TLB shootdowns.
    pub cpus: CpuMask,
    /// Guest-physical page of the APIC access page, once mapped.
    pub access_page: Option<u64>,
    /// Pages of the kernel object window backed for this domain.
    pub obj_window: BTreeSet<u64>,
}

impl Pd {
    /// `quota == None` is unlimited.
    pub fn new(passthrough: bool, quota: Option<usize>) -> Self {
        Self {
            obj: Space::new(),
            mem: Space::new(),
            quota: quota.map_or(Quota::unlimited(), Quota::limited),
            passthrough,
            cpus: CpuMask::EMPTY,
            access_page: None,
            obj_window: BTreeSet::new(),
        }
    }

    pub fn lookup(&self, sel: Selector) -> Option<Capability> {
        self.obj
            .get(sel.as_raw())
            .map(|(obj, attr)| Capability::new(obj, Perms::from_bits_truncate(attr)))
    }

    /// Resolves `sel` to an object of type `T` carrying `perms`.
    pub fn cast<T: Typed>(&self, sel: Selector, perms: Perms) -> Result<Handle<T>, CapError> {
        self.lookup(sel).ok_or(CapError::NotFound)?.cast(perms)
    }
}
