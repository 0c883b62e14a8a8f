// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Host side of the Repetier link: the service facade a host UI drives, and
// the status view used by the headless monitor.

pub mod services;
pub mod state;

pub use services::host_services::HostServices;
