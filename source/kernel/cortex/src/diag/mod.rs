// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Diagnostics: leveled log lines and the kernel event ring.

#[macro_use]
pub mod log;
pub mod trace;
