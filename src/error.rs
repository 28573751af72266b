//! Custom error types for the service.
//!
//! This module defines the primary error type, `ScopeError`, for the entire
//! application. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different failures a shot can run into, from
//! configuration problems to instrument I/O and storage conflicts.
//!
//! ## Error Hierarchy
//!
//! - **`DeviceNotFound`**: connect-time resolution failed. Either no visible
//!   resource matched the identifying substring or more than one did. Fatal
//!   at startup; there is no retry policy because the service cannot usefully
//!   run without its instrument.
//! - **`ChannelOutOfRange`**: a channel index fell outside `[1, count]`.
//!   Raised before any instrument I/O, so it is always safe to fix the shot
//!   descriptor and try again.
//! - **`ProtocolViolation`**: an unrecognized command token arrived on the
//!   control link. Surfaced immediately with no instrument side effects.
//! - **`Acquisition`**: instrument I/O failed mid-read. The controller aborts
//!   the shot before this reaches the caller.
//! - **`SeriesConflict`**: a trace series name was written twice within one
//!   shot. Distinct shots never reuse names, so this always indicates a bug
//!   in the caller and fails loudly.
//! - **`MalformedBlock` / `MalformedPreamble`**: the instrument returned a
//!   binary block or preamble record the decoder could not interpret.
//!
//! By using `#[from]`, `ScopeError` can be seamlessly created from underlying
//! error types, simplifying error handling throughout the application with
//! the `?` operator.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type ShotResult<T> = std::result::Result<T, ScopeError>;

/// Application error type.
#[derive(Error, Debug)]
pub enum ScopeError {
    /// Resource resolution at connect time did not produce exactly one match.
    #[error("could not find exactly one device matching '{needle}'; visible resources:\n{available}")]
    DeviceNotFound {
        /// Identifying substring that was searched for.
        needle: String,
        /// Newline-joined listing of every resource that was visible.
        available: String,
    },

    /// A channel index fell outside the instrument's valid range.
    #[error("channel must be between 1 and {count}, got {channel}")]
    ChannelOutOfRange {
        /// The offending 1-based channel index.
        channel: i64,
        /// The channel count queried at connect time.
        count: u8,
    },

    /// An unrecognized command token arrived on the control link.
    #[error("invalid request: {0}")]
    ProtocolViolation(String),

    /// Instrument I/O failed during a channel read or control command.
    #[error("instrument I/O failed: {0}")]
    Acquisition(String),

    /// A trace series name was written twice within the same shot.
    #[error("series '{0}' already written for this shot")]
    SeriesConflict(String),

    /// The instrument's binary block response could not be interpreted.
    #[error("malformed waveform block: {0}")]
    MalformedBlock(String),

    /// The instrument's preamble record could not be interpreted.
    #[error("malformed waveform preamble: {0}")]
    MalformedPreamble(String),

    /// Configure arrived while a shot was still buffered.
    #[error("a shot is already buffered; finalize or abort it first")]
    ShotAlreadyBuffered,

    /// Finalize arrived with no buffered shot.
    #[error("no shot is buffered")]
    NoActiveShot,

    /// The shot descriptor was missing or could not be read.
    #[error("shot descriptor error: {0}")]
    Descriptor(String),

    /// Persistence backend failure outside the conflict cases above.
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration load or validation error.
    #[error("configuration error: {0}")]
    Config(#[from] figment::Error),

    /// I/O error outside instrument communication.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Functionality compiled out by feature flags.
    #[error("feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}
