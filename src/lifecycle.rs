//! Shot lifecycle state machine.
//!
//! [`ShotController`] drives one shot at a time through
//! `Idle → Buffered → Static → Idle`:
//!
//! | From | Command | Action | To |
//! |---|---|---|---|
//! | Idle | Configure(shot) | load selection + timebase from the descriptor; program the instrument; arm run mode | Buffered |
//! | Buffered | Finalize | acquire every selected channel in order; decode; persist | Idle (Static is transient) |
//! | any | Abort | best-effort restore, discard the in-flight shot | Idle |
//!
//! Any failure inside Configure or Finalize triggers an automatic Abort
//! before the error propagates (unless the failing operation was Abort
//! itself), so the instrument is always left in a state where a subsequent
//! Configure can proceed. Abort runs every cleanup step independently:
//! a failing step is logged and the remaining steps still run.
//!
//! Device-revision differences (calibration order, time-axis direction,
//! time-series naming, whether reads halt acquisition) are expressed through
//! the [`DeviceStrategy`] interface, selected per device profile at
//! construction rather than by subclassing.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{DeviceProfile, Settings};
use crate::data::storage::{
    ShotDescriptor, ShotDescriptorSource, ShotToken, TimeAxisLayout, TraceSink,
};
use crate::data::waveform::{self, CalibrationPolicy, TimeAxisPolicy, Waveform};
use crate::error::{ScopeError, ShotResult};
use crate::instrument::ScopeInterface;

/// Lifecycle phase of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShotPhase {
    /// No shot in flight; ready for Configure.
    Idle,
    /// A shot is configured and the instrument is acquiring.
    Buffered,
    /// Finalize is acquiring and persisting; collapses back to Idle.
    Static,
}

/// Ordered channel selection for one shot.
///
/// Built once per shot from the descriptor. The descriptor carries the
/// orchestrator's 0-based indices; here they are already mapped onto the
/// instrument's 1-based channels. Index and name lists always have the same
/// length, and names are unique.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSelection {
    channels: Vec<u8>,
    names: Vec<String>,
}

impl ChannelSelection {
    /// Validate a descriptor against the connected instrument and map its
    /// 0-based channel indices to 1-based instrument channels.
    ///
    /// Performs no instrument I/O, so a bad selection fails the shot before
    /// the instrument is touched.
    pub fn from_descriptor(descriptor: &ShotDescriptor, channel_count: u8) -> ShotResult<Self> {
        if descriptor.channels.len() != descriptor.names.len() {
            return Err(ScopeError::Descriptor(format!(
                "{} channels but {} names",
                descriptor.channels.len(),
                descriptor.names.len()
            )));
        }
        for (i, name) in descriptor.names.iter().enumerate() {
            if descriptor.names[..i].contains(name) {
                return Err(ScopeError::Descriptor(format!(
                    "duplicate series name '{name}'"
                )));
            }
        }

        let mut channels = Vec::with_capacity(descriptor.channels.len());
        for &index in &descriptor.channels {
            let mapped = index + 1;
            if mapped < 1 || mapped > i64::from(channel_count) {
                return Err(ScopeError::ChannelOutOfRange {
                    channel: mapped,
                    count: channel_count,
                });
            }
            channels.push(mapped as u8);
        }

        Ok(Self {
            channels,
            names: descriptor.names.clone(),
        })
    }

    /// Iterate `(instrument channel, series name)` pairs in selection order.
    pub fn iter(&self) -> impl Iterator<Item = (u8, &str)> {
        self.channels
            .iter()
            .copied()
            .zip(self.names.iter().map(String::as_str))
    }

    /// Number of selected channels.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Returns true when no channels are selected.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// Device-revision behavior, selected per device profile at construction.
///
/// The hooks run inside Configure and Finalize and may talk to the
/// instrument; the policy accessors feed the decoder and the persistence
/// layout. The default `on_configure` arms continuous acquisition so the
/// instrument keeps sampling through the buffered window.
#[async_trait]
pub trait DeviceStrategy: Send + Sync {
    /// Vertical calibration formula for this revision.
    fn calibration(&self) -> CalibrationPolicy;

    /// Time-axis direction for this revision.
    fn time_axis(&self) -> TimeAxisPolicy;

    /// Time-series naming convention for this revision.
    fn time_layout(&self) -> TimeAxisLayout;

    /// Whether channel reads halt acquisition for a consistent snapshot.
    fn stop_for_read(&self) -> bool;

    /// Device-specific work at the end of Configure.
    async fn on_configure(&self, scope: &mut ScopeInterface) -> ShotResult<()> {
        scope.run().await
    }

    /// Device-specific work after acquisition, before persistence.
    async fn on_finalize(&self, scope: &mut ScopeInterface) -> ShotResult<()> {
        let _ = scope;
        Ok(())
    }
}

/// Canonical policy set.
pub struct StandardProfile;

#[async_trait]
impl DeviceStrategy for StandardProfile {
    fn calibration(&self) -> CalibrationPolicy {
        CalibrationPolicy::OffsetBeforeScale
    }

    fn time_axis(&self) -> TimeAxisPolicy {
        TimeAxisPolicy::Ascending
    }

    fn time_layout(&self) -> TimeAxisLayout {
        TimeAxisLayout::Shared
    }

    fn stop_for_read(&self) -> bool {
        true
    }
}

/// Behavior of the historical instrument revisions.
pub struct LegacyProfile;

#[async_trait]
impl DeviceStrategy for LegacyProfile {
    fn calibration(&self) -> CalibrationPolicy {
        CalibrationPolicy::OffsetAfterScale
    }

    fn time_axis(&self) -> TimeAxisPolicy {
        TimeAxisPolicy::Descending
    }

    fn time_layout(&self) -> TimeAxisLayout {
        TimeAxisLayout::PerChannel
    }

    fn stop_for_read(&self) -> bool {
        false
    }
}

/// Strategy for a configured device profile.
pub fn strategy_for(profile: DeviceProfile) -> Box<dyn DeviceStrategy> {
    match profile {
        DeviceProfile::Standard => Box::new(StandardProfile),
        DeviceProfile::Legacy => Box::new(LegacyProfile),
    }
}

#[derive(Debug, Clone)]
struct ActiveShot {
    token: ShotToken,
    selection: Option<ChannelSelection>,
}

/// The shot state machine.
///
/// Owns the instrument interface exclusively for the service's lifetime; no
/// other component issues instrument I/O.
pub struct ShotController {
    scope: ScopeInterface,
    strategy: Box<dyn DeviceStrategy>,
    descriptors: Arc<dyn ShotDescriptorSource>,
    sink: Arc<dyn TraceSink>,
    device_name: String,
    trace_group: String,
    phase: ShotPhase,
    shot: Option<ActiveShot>,
    pending_write: Option<JoinHandle<ShotResult<()>>>,
}

impl ShotController {
    /// Build a controller from loaded settings and its collaborators.
    pub fn new(
        settings: &Settings,
        scope: ScopeInterface,
        descriptors: Arc<dyn ShotDescriptorSource>,
        sink: Arc<dyn TraceSink>,
    ) -> Self {
        Self {
            scope,
            strategy: strategy_for(settings.device.profile),
            descriptors,
            sink,
            device_name: settings.device.name.clone(),
            trace_group: settings.storage.trace_group.clone(),
            phase: ShotPhase::Idle,
            shot: None,
            pending_write: None,
        }
    }

    /// Replace the device strategy (for device types outside the built-in
    /// profiles).
    pub fn with_strategy(mut self, strategy: Box<dyn DeviceStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> ShotPhase {
        self.phase
    }

    /// Transition Idle → Buffered for the given shot.
    pub async fn configure(&mut self, token: ShotToken) -> ShotResult<()> {
        match self.try_configure(token).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.abort_after_failure().await;
                Err(err)
            }
        }
    }

    async fn try_configure(&mut self, token: ShotToken) -> ShotResult<()> {
        if self.phase != ShotPhase::Idle {
            return Err(ScopeError::ShotAlreadyBuffered);
        }
        info!(shot = %token, "configuring shot");
        self.shot = Some(ActiveShot {
            token: token.clone(),
            selection: None,
        });

        let descriptor = self.descriptors.load(&token, &self.device_name).await?;
        let selection =
            ChannelSelection::from_descriptor(&descriptor, self.scope.channel_count())?;

        self.scope.set_timebase(descriptor.timestep).await?;
        self.scope
            .set_horizontal_offset(descriptor.offset)
            .await?;
        self.strategy.on_configure(&mut self.scope).await?;

        if let Some(shot) = self.shot.as_mut() {
            shot.selection = Some(selection);
        }
        self.phase = ShotPhase::Buffered;
        Ok(())
    }

    /// Transition Buffered → Idle, acquiring, decoding, and persisting every
    /// selected channel. Returns only after persistence has completed, so a
    /// caller that depends on artifact availability can rely on the reply.
    pub async fn finalize(&mut self) -> ShotResult<()> {
        match self.try_finalize().await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.abort_after_failure().await;
                Err(err)
            }
        }
    }

    async fn try_finalize(&mut self) -> ShotResult<()> {
        let (token, selection) = match self.shot.as_ref() {
            Some(shot) if self.phase == ShotPhase::Buffered => {
                match shot.selection.clone() {
                    Some(selection) => (shot.token.clone(), selection),
                    None => return Err(ScopeError::NoActiveShot),
                }
            }
            _ => return Err(ScopeError::NoActiveShot),
        };
        self.phase = ShotPhase::Static;

        let mut traces: Vec<(String, Waveform)> = Vec::with_capacity(selection.len());
        for (channel, name) in selection.iter() {
            let (raw, preamble) = self
                .scope
                .read_channel(channel, self.strategy.stop_for_read())
                .await?;
            let decoded = waveform::decode(
                &raw,
                &preamble,
                self.strategy.calibration(),
                self.strategy.time_axis(),
            )?;
            traces.push((name.to_string(), decoded));
        }
        self.strategy.on_finalize(&mut self.scope).await?;

        let task = persist(
            self.sink.clone(),
            token.clone(),
            self.trace_group.clone(),
            self.strategy.time_layout(),
            traces,
        );
        self.pending_write = Some(tokio::spawn(task));
        self.wait_persisted().await?;

        self.shot = None;
        self.phase = ShotPhase::Idle;
        info!(shot = %token, "shot finalized");
        Ok(())
    }

    /// Await the in-flight persistence task, if any.
    ///
    /// Finalize calls this before acknowledging, which closes the ordering
    /// gap between the reply and artifact availability.
    pub async fn wait_persisted(&mut self) -> ShotResult<()> {
        if let Some(handle) = self.pending_write.take() {
            handle
                .await
                .map_err(|err| ScopeError::Storage(format!("persistence task died: {err}")))??;
        }
        Ok(())
    }

    /// Return the instrument and controller to a state where Configure can
    /// proceed, discarding any in-flight shot. Never fails: every cleanup
    /// step runs even when earlier ones error.
    pub async fn abort(&mut self) {
        if let Some(handle) = self.pending_write.take() {
            handle.abort();
            warn!("abandoned in-flight persistence");
        }

        if let Err(err) = self.scope.run().await {
            warn!(%err, "could not restore continuous acquisition");
        }

        if let Some(shot) = self.shot.take() {
            info!(shot = %shot.token, "discarded in-flight shot");
        }
        self.phase = ShotPhase::Idle;
    }

    async fn abort_after_failure(&mut self) {
        // Mirrors the protocol handler contract: a failure with a shot in
        // flight aborts before the error propagates; without one there is
        // nothing to clean up.
        if self.shot.is_some() {
            warn!("shot failed, aborting");
            self.abort().await;
        }
    }
}

async fn persist(
    sink: Arc<dyn TraceSink>,
    token: ShotToken,
    group_name: String,
    layout: TimeAxisLayout,
    traces: Vec<(String, Waveform)>,
) -> ShotResult<()> {
    let group = sink.ensure_group(&token, &group_name).await?;
    match layout {
        TimeAxisLayout::Shared => {
            if let Some((_, first)) = traces.first() {
                sink.write_series(&group, "times", &first.time).await?;
            }
            for (name, trace) in &traces {
                sink.write_series(&group, name, &trace.voltage).await?;
            }
        }
        TimeAxisLayout::PerChannel => {
            for (name, trace) in &traces {
                sink.write_series(&group, &format!("times{name}"), &trace.time)
                    .await?;
                sink.write_series(&group, name, &trace.voltage).await?;
            }
        }
    }
    Ok(())
}
