//! Core traits for instrument communication.
//!
//! This module defines the transport seam between the acquisition logic and
//! whatever actually carries SCPI traffic to the oscilloscope. Everything
//! above this seam ([`crate::instrument::ScopeInterface`], the lifecycle
//! controller) is written against these traits; the concrete backends live in
//! [`crate::instrument::visa`] (real hardware) and
//! [`crate::instrument::mock`] (tests, development without hardware).
//!
//! # Protocol Model
//!
//! The wire protocol is strictly half-duplex: a command is written in full,
//! then (for queries) the complete response is read back before anything else
//! is sent. Exactly one request is outstanding at any time; there is no
//! pipelining. The traits encode this by taking `&mut self` on every
//! operation, so an exclusive session cannot interleave requests.
//!
//! # Ownership
//!
//! A [`ScpiSession`] is exclusively owned by the component that opened it for
//! the lifetime of the service. Nothing else may issue instrument I/O.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::ShotResult;

/// Resolver for instrument transports.
///
/// A bus can enumerate the resource addresses it knows about and open an
/// exclusive session to one of them. Resolution by identifying substring is
/// done by the caller ([`crate::instrument::ScopeInterface::connect`]) so the
/// zero/ambiguous-match policy lives in one place.
#[async_trait]
pub trait ScpiBus: Send + Sync {
    /// List every resource address currently visible on this bus.
    fn list_resources(&self) -> ShotResult<Vec<String>>;

    /// Open an exclusive session to the given resource address.
    async fn open(&self, resource: &str) -> ShotResult<Box<dyn ScpiSession>>;
}

/// One exclusive, half-duplex connection to an instrument.
#[async_trait]
pub trait ScpiSession: Send {
    /// Write one command, no response expected.
    async fn write(&mut self, command: &str) -> ShotResult<()>;

    /// Write one query and read back its ASCII response, trimmed.
    async fn query(&mut self, command: &str) -> ShotResult<String>;

    /// Read one raw binary response for a query that was already written.
    ///
    /// Used for block transfers (`:WAV:DATA?`), where the response is a
    /// length-prefixed binary block rather than ASCII.
    async fn read_raw(&mut self) -> ShotResult<Bytes>;
}
