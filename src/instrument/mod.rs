//! Synchronous oscilloscope driver abstraction.
//!
//! [`ScopeInterface`] owns the single instrument session for the service's
//! lifetime and exposes the handful of operations the shot lifecycle needs:
//! channel selection, waveform transfer, run/stop, and timebase programming.
//!
//! The interface is deliberately narrow. Anything the lifecycle controller
//! does to the instrument goes through here, which is what makes the
//! half-duplex, one-request-outstanding discipline of
//! [`crate::core::ScpiSession`] enforceable.

pub mod mock;
#[cfg(feature = "instrument_visa")]
pub mod visa;

use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info};

use crate::core::{ScpiBus, ScpiSession};
use crate::data::waveform::WaveformPreamble;
use crate::error::{ScopeError, ShotResult};

/// Driver for one oscilloscope connection.
pub struct ScopeInterface {
    session: Box<dyn ScpiSession>,
    channel_count: u8,
    settle_delay: Duration,
}

impl std::fmt::Debug for ScopeInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeInterface")
            .field("channel_count", &self.channel_count)
            .field("settle_delay", &self.settle_delay)
            .finish_non_exhaustive()
    }
}

impl ScopeInterface {
    /// Resolve and open the instrument whose resource address contains
    /// `needle`.
    ///
    /// Exactly one visible resource must match; zero or several matches fail
    /// with [`ScopeError::DeviceNotFound`] carrying the full listing. This is
    /// fatal at startup, no retry: the service cannot usefully run without
    /// its instrument. The channel count is queried once here and frozen for
    /// the connection's lifetime.
    pub async fn connect(
        bus: &dyn ScpiBus,
        needle: &str,
        settle_delay: Duration,
    ) -> ShotResult<Self> {
        let resources = bus.list_resources()?;
        let matches: Vec<&String> = resources
            .iter()
            .filter(|r| r.contains(needle))
            .collect();
        if matches.len() != 1 {
            return Err(ScopeError::DeviceNotFound {
                needle: needle.to_string(),
                available: resources.join("\n"),
            });
        }

        let mut session = bus.open(matches[0]).await?;
        let reply = session.query(":SYST:RAM?").await?;
        let channel_count = parse_f64(&reply, "channel count")? as u8;
        info!(resource = %matches[0], channel_count, "connected to scope");

        Ok(Self {
            session,
            channel_count,
            settle_delay,
        })
    }

    /// Channel count queried at connect time; immutable for the connection.
    pub fn channel_count(&self) -> u8 {
        self.channel_count
    }

    /// Route waveform transfers to the given 1-based channel.
    ///
    /// Fails with [`ScopeError::ChannelOutOfRange`] before any instrument
    /// I/O when the index is not in `[1, channel_count]`.
    pub async fn select_channel(&mut self, channel: u8) -> ShotResult<()> {
        if channel < 1 || channel > self.channel_count {
            return Err(ScopeError::ChannelOutOfRange {
                channel: i64::from(channel),
                count: self.channel_count,
            });
        }
        self.session
            .write(&format!(":WAV:SOUR CHAN{channel}"))
            .await
    }

    /// Transfer one channel's waveform: raw sample block plus the preamble
    /// that scales it.
    ///
    /// With `stop_acquisition` the scope is halted for the transfer and
    /// resumed afterwards, so the block is a consistent snapshot; without it
    /// the scope keeps acquiring while the transfer runs. The preamble is
    /// queried fresh on every call because instrument state changes between
    /// channel selections.
    pub async fn read_channel(
        &mut self,
        channel: u8,
        stop_acquisition: bool,
    ) -> ShotResult<(Bytes, WaveformPreamble)> {
        if stop_acquisition {
            self.session.write(":STOP").await?;
        }
        self.select_channel(channel).await?;
        self.session.write(":WAV:MODE NORM").await?;
        self.session.write(":WAV:FORM BYTE").await?;
        self.session.write(":WAV:DATA?").await?;
        let raw = self.session.read_raw().await?;
        let preamble: WaveformPreamble = self.session.query(":WAV:PRE?").await?.parse()?;
        if stop_acquisition {
            self.session.write(":RUN").await?;
        }
        debug!(channel, points = preamble.points, "read channel block");
        Ok((raw, preamble))
    }

    /// Start continuous acquisition.
    pub async fn run(&mut self) -> ShotResult<()> {
        self.session.write(":RUN").await
    }

    /// Halt continuous acquisition.
    pub async fn stop(&mut self) -> ShotResult<()> {
        self.session.write(":STOP").await
    }

    /// Program the timebase to `seconds_per_division`.
    ///
    /// Reads the current value first and only writes on change, followed by
    /// the settle delay, avoiding needless instrument state churn.
    pub async fn set_timebase(&mut self, seconds_per_division: f64) -> ShotResult<()> {
        let reply = self.session.query(":TIM:SCAL?").await?;
        let current = parse_f64(&reply, "timebase")?;
        if seconds_per_division != current {
            self.session
                .write(&format!(":TIM:SCAL {seconds_per_division}"))
                .await?;
            tokio::time::sleep(self.settle_delay).await;
        }
        Ok(())
    }

    /// Program the horizontal offset relative to the trigger, in seconds.
    ///
    /// Same read-compare-write discipline as [`Self::set_timebase`].
    pub async fn set_horizontal_offset(&mut self, offset: f64) -> ShotResult<()> {
        let reply = self.session.query(":TIM:OFFS?").await?;
        let current = parse_f64(&reply, "horizontal offset")?;
        if offset != current {
            self.session.write(&format!(":TIM:OFFS {offset}")).await?;
            tokio::time::sleep(self.settle_delay).await;
        }
        Ok(())
    }
}

fn parse_f64(reply: &str, what: &str) -> ShotResult<f64> {
    reply
        .trim()
        .parse::<f64>()
        .map_err(|_| ScopeError::Acquisition(format!("unparseable {what} reply '{reply}'")))
}
