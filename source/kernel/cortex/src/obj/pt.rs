// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Portal: entry point into a local EC.

use crate::ec::{EcId, Mtd};
use crate::types::Mword;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pt {
    pub ec: EcId,
    pub ip: Mword,
    /// State transferred when an exception is delivered through this portal.
    pub mtd: Mtd,
    /// Value the receiver finds in its first argument register.
    pub id: Mword,
}

impl Pt {
    pub const fn new(ec: EcId, mtd: Mtd, ip: Mword) -> Self {
        Self { ec, ip, mtd, id: 0 }
    }
}
