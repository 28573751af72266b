//! End-to-end shot lifecycle tests against the mock transport and the
//! in-memory store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use scope_daq::config::{DeviceProfile, Settings};
use scope_daq::data::storage::{MemoryStore, ShotDescriptor, ShotToken};
use scope_daq::error::{ScopeError, ShotResult};
use scope_daq::instrument::mock::MockScope;
use scope_daq::instrument::ScopeInterface;
use scope_daq::lifecycle::{ShotController, ShotPhase};
use scope_daq::server::{CommandDispatcher, CommandLink};

const SHOT_PATH: &str = "/shots/2024_07_09_0001.h5";

struct EmptyFollowupLink {
    sent: Vec<String>,
}

impl EmptyFollowupLink {
    fn new() -> Self {
        Self { sent: Vec::new() }
    }
}

#[async_trait]
impl CommandLink for EmptyFollowupLink {
    async fn send(&mut self, reply: &str) -> ShotResult<()> {
        self.sent.push(reply.to_string());
        Ok(())
    }

    async fn recv(&mut self) -> ShotResult<String> {
        Ok(String::new())
    }
}

struct Harness {
    dispatcher: CommandDispatcher,
    scope: MockScope,
    store: Arc<MemoryStore>,
    trace_group: String,
}

impl Harness {
    async fn new(profile: DeviceProfile, descriptor: ShotDescriptor) -> Self {
        let mut settings = Settings::load(None).unwrap();
        settings.device.profile = profile;
        settings.device.settle_delay = Duration::from_millis(0);

        let scope = MockScope::new(4);
        let bus = scope.bus(vec![
            "USB0::0x1AB1::0x04CE::DS1ZA203514731::INSTR".to_string()
        ]);
        let interface = ScopeInterface::connect(&bus, "DS1ZA", settings.device.settle_delay)
            .await
            .unwrap();

        let store = Arc::new(MemoryStore::new());
        store.insert_descriptor(&ShotToken::new(SHOT_PATH), &settings.device.name, descriptor);

        let controller =
            ShotController::new(&settings, interface, store.clone(), store.clone());
        let trace_group = settings.storage.trace_group.clone();
        Self {
            dispatcher: CommandDispatcher::new(&settings, controller),
            scope,
            store,
            trace_group,
        }
    }

    async fn command(&mut self, token: &str) -> ShotResult<String> {
        let mut link = EmptyFollowupLink::new();
        self.dispatcher.dispatch(token, &mut link).await
    }

    fn phase(&self) -> ShotPhase {
        self.dispatcher.controller().phase()
    }

    fn series_names(&self) -> Vec<String> {
        self.store
            .series_names(&ShotToken::new(SHOT_PATH), &self.trace_group)
    }

    fn series(&self, name: &str) -> Option<Vec<f64>> {
        self.store
            .series(&ShotToken::new(SHOT_PATH), &self.trace_group, name)
    }
}

fn two_channel_descriptor() -> ShotDescriptor {
    ShotDescriptor {
        timestep: 0.001,
        offset: 0.0,
        channels: vec![0, 2],
        names: vec!["A".into(), "C".into()],
    }
}

#[tokio::test]
async fn test_end_to_end_standard_profile() {
    let mut harness = Harness::new(DeviceProfile::Standard, two_channel_descriptor()).await;
    // Descriptor channel 0 is instrument channel 1, descriptor 2 is 3.
    harness.scope.set_channel_samples(1, vec![128, 138, 148, 0]);
    harness.scope.set_channel_samples(3, vec![108, 118, 128, 0]);

    let reply = harness.command(SHOT_PATH).await.unwrap();
    assert_eq!(reply, "done");
    assert_eq!(harness.phase(), ShotPhase::Buffered);
    assert_eq!(harness.scope.timebase(), 0.001);
    assert!(harness.scope.is_running());

    let reply = harness.command("done").await.unwrap();
    assert_eq!(reply, "done");
    assert_eq!(harness.phase(), ShotPhase::Idle);

    // Exactly two value series plus one shared time axis, in selection order.
    assert_eq!(
        harness.series_names(),
        vec!["times".to_string(), "A".to_string(), "C".to_string()]
    );

    // (sample - y_ref - y_origin) * y_inc with y_ref=128, y_origin=0, y_inc=0.01.
    let a = harness.series("A").unwrap();
    assert_eq!(a.len(), 3);
    for (value, expected) in a.iter().zip([0.0, 0.1, 0.2]) {
        assert!((value - expected).abs() < 1e-12);
    }
    let c = harness.series("C").unwrap();
    for (value, expected) in c.iter().zip([-0.2, -0.1, 0.0]) {
        assert!((value - expected).abs() < 1e-12);
    }

    // Ascending axis: t[i] = i * x_inc - x_origin with x_inc=1e-6, x_origin=0.
    let times = harness.series("times").unwrap();
    assert_eq!(times.len(), 3);
    for (value, expected) in times.iter().zip([0.0, 1e-6, 2e-6]) {
        assert!((value - expected).abs() < 1e-18);
    }
}

#[tokio::test]
async fn test_two_phase_reply_sequence() {
    let mut harness = Harness::new(DeviceProfile::Standard, two_channel_descriptor()).await;
    harness.scope.set_channel_samples(1, vec![1, 2, 0]);
    harness.scope.set_channel_samples(3, vec![3, 4, 0]);

    let mut link = EmptyFollowupLink::new();
    let reply = harness
        .dispatcher
        .dispatch(SHOT_PATH, &mut link)
        .await
        .unwrap();
    // Interim "ok" first, final "done" as the return value.
    assert_eq!(link.sent, vec!["ok".to_string()]);
    assert_eq!(reply, "done");

    let mut link = EmptyFollowupLink::new();
    let reply = harness.dispatcher.dispatch("done", &mut link).await.unwrap();
    assert_eq!(link.sent, vec!["ok".to_string()]);
    assert_eq!(reply, "done");
}

#[tokio::test]
async fn test_legacy_profile_layout_and_calibration() {
    let descriptor = ShotDescriptor {
        timestep: 0.001,
        offset: 0.0,
        channels: vec![0],
        names: vec!["probe".into()],
    };
    let mut harness = Harness::new(DeviceProfile::Legacy, descriptor).await;
    harness
        .scope
        .set_preamble_scaling(1e-6, 0.0, 0.01, 2.0, 128.0);
    harness.scope.set_channel_samples(1, vec![128, 138, 0]);

    harness.command(SHOT_PATH).await.unwrap();
    harness.command("done").await.unwrap();

    // Per-channel time series naming.
    assert_eq!(
        harness.series_names(),
        vec!["timesprobe".to_string(), "probe".to_string()]
    );

    // (sample - y_ref) * y_inc - y_origin.
    let probe = harness.series("probe").unwrap();
    assert!((probe[0] + 2.0).abs() < 1e-12);
    assert!((probe[1] - (0.1 - 2.0)).abs() < 1e-12);

    // Descending axis: t[i] = -i * x_inc - x_origin.
    let times = harness.series("timesprobe").unwrap();
    assert!((times[0] - 0.0).abs() < 1e-18);
    assert!((times[1] + 1e-6).abs() < 1e-18);

    // Legacy reads never halt acquisition.
    assert!(!harness.scope.command_log().iter().any(|c| c == ":STOP"));
}

#[tokio::test]
async fn test_finalize_failure_returns_to_idle_via_abort() {
    let mut harness = Harness::new(DeviceProfile::Standard, two_channel_descriptor()).await;
    harness.scope.set_channel_samples(1, vec![1, 2, 0]);
    harness.scope.set_channel_samples(3, vec![3, 4, 0]);

    harness.command(SHOT_PATH).await.unwrap();
    harness.scope.fail_on(":WAV:DATA?");

    let err = harness.command("done").await.unwrap_err();
    assert!(matches!(err, ScopeError::Acquisition(_)));

    // Auto-abort ran: back to Idle with acquisition restored, not stuck in
    // Buffered.
    assert_eq!(harness.phase(), ShotPhase::Idle);
    assert!(harness.scope.is_running());
    assert!(harness.series_names().is_empty());

    // The instrument is left in a state where the next shot can proceed.
    harness.scope.clear_fail();
    harness.command(SHOT_PATH).await.unwrap();
    assert_eq!(harness.phase(), ShotPhase::Buffered);
    harness.command("done").await.unwrap();
    assert_eq!(harness.phase(), ShotPhase::Idle);
}

#[tokio::test]
async fn test_configure_rejects_out_of_range_before_instrument_io() {
    let descriptor = ShotDescriptor {
        timestep: 0.001,
        offset: 0.0,
        channels: vec![0, 9],
        names: vec!["A".into(), "B".into()],
    };
    let mut harness = Harness::new(DeviceProfile::Standard, descriptor).await;
    let io_before = harness.scope.command_log().len();

    let err = harness.command(SHOT_PATH).await.unwrap_err();
    assert!(matches!(
        err,
        ScopeError::ChannelOutOfRange { channel: 10, count: 4 }
    ));
    assert_eq!(harness.phase(), ShotPhase::Idle);

    // Validation failed fast; the only instrument traffic is abort's
    // best-effort restore.
    let log = harness.scope.command_log();
    assert_eq!(log.len(), io_before + 1);
    assert_eq!(log.last().map(String::as_str), Some(":RUN"));
}

#[tokio::test]
async fn test_finalize_without_shot_is_rejected() {
    let mut harness = Harness::new(DeviceProfile::Standard, two_channel_descriptor()).await;
    let io_before = harness.scope.command_log().len();

    let err = harness.command("done").await.unwrap_err();
    assert!(matches!(err, ScopeError::NoActiveShot));
    assert_eq!(harness.phase(), ShotPhase::Idle);
    // No shot was in flight, so nothing was aborted and nothing touched the
    // instrument.
    assert_eq!(harness.scope.command_log().len(), io_before);
}

#[tokio::test]
async fn test_abort_discards_buffered_shot() {
    let mut harness = Harness::new(DeviceProfile::Standard, two_channel_descriptor()).await;
    harness.scope.set_channel_samples(1, vec![1, 2, 0]);
    harness.scope.set_channel_samples(3, vec![3, 4, 0]);

    harness.command(SHOT_PATH).await.unwrap();
    assert_eq!(harness.phase(), ShotPhase::Buffered);

    let reply = harness.command("abort").await.unwrap();
    assert_eq!(reply, "done");
    assert_eq!(harness.phase(), ShotPhase::Idle);
    assert!(harness.series_names().is_empty());

    // A fresh Configure proceeds after the abort.
    harness.command(SHOT_PATH).await.unwrap();
    assert_eq!(harness.phase(), ShotPhase::Buffered);
}

#[tokio::test]
async fn test_configure_while_buffered_aborts_previous_shot() {
    let mut harness = Harness::new(DeviceProfile::Standard, two_channel_descriptor()).await;
    harness.scope.set_channel_samples(1, vec![1, 2, 0]);
    harness.scope.set_channel_samples(3, vec![3, 4, 0]);

    harness.command(SHOT_PATH).await.unwrap();
    let err = harness.command(SHOT_PATH).await.unwrap_err();
    assert!(matches!(err, ScopeError::ShotAlreadyBuffered));

    // The stale shot was discarded, so the orchestrator can reconfigure.
    assert_eq!(harness.phase(), ShotPhase::Idle);
    harness.command(SHOT_PATH).await.unwrap();
    assert_eq!(harness.phase(), ShotPhase::Buffered);
}
