// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Kernel object kinds reachable through capabilities.

pub mod kp;
pub mod pd;
pub mod pt;
pub mod sc;
pub mod sm;

pub use kp::Kp;
pub use pd::Pd;
pub use pt::Pt;
pub use sc::Sc;
pub use sm::Sm;

use crate::arena::Handle;

pub type PdId = Handle<Pd>;
pub type ScId = Handle<Sc>;
pub type PtId = Handle<Pt>;
pub type SmId = Handle<Sm>;
pub type KpId = Handle<Kp>;
