// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Repetier Net: HTTP transport, mDNS discovery, printer sessions and the
// session registry. Sessions poll a Repetier-Server instance, upload print
// jobs and recover on their own from network silence.

pub mod camera;
pub mod discovery;
pub mod pairing;
pub mod payload;
pub mod probe;
pub mod recovery;
pub mod registry;
pub mod session;
pub mod transport;
pub mod upload;

pub use discovery::{DiscoveryEvent, DiscoveryFeed};
pub use pairing::{PairingHandle, request_api_key, supports_pairing};
pub use probe::{ApiKeyCheck, InstanceProbe};
pub use registry::{DeviceEvent, SessionRegistry};
pub use session::{Session, SessionEvent, SessionStatus};
pub use transport::{HttpTransport, HttpTransportFactory, Transport, TransportFactory};
pub use upload::UploadOutcome;
