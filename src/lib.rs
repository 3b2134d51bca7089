//! attguard: the trust boundary between local workloads and a remote
//! policy service.
//!
//! Local processes register principals (an IP plus an exclusive port
//! range) over a Unix socket. The daemon allocates the ports, registers
//! the principal with the policy service, persists what it knows, and
//! answers attestation and access queries on the caller's behalf.
//!
//! See `DESIGN.md` for the module map.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod logging;

pub mod ports;
pub mod policy;
pub mod registry;

pub mod dispatch;
pub mod protocol;
pub mod server;
