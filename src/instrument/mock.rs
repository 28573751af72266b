//! Mock oscilloscope for testing without physical hardware.
//!
//! [`MockScope`] simulates the instrument end of the SCPI session: it tracks
//! run state, the selected channel, timebase and offset values, serves
//! preambles and length-prefixed sample blocks, and records every command it
//! receives so tests can assert on the exact traffic (including its absence).
//!
//! Failure injection is by command substring: [`MockScope::fail_on`] makes
//! the next matching command error, which is how the lifecycle tests force a
//! mid-acquisition fault.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;

use crate::core::{ScpiBus, ScpiSession};
use crate::error::{ScopeError, ShotResult};

#[derive(Debug)]
struct ScopeState {
    channel_count: u8,
    timebase: f64,
    horizontal_offset: f64,
    running: bool,
    selected: Option<u8>,
    samples: HashMap<u8, Vec<u8>>,
    pending_block: Option<Bytes>,
    log: Vec<String>,
    fail_matching: Option<String>,
    // Preamble scaling served with every channel.
    x_increment: f64,
    x_origin: f64,
    y_increment: f64,
    y_origin: f64,
    y_reference: f64,
}

/// Simulated oscilloscope shared between a test and the session it hands out.
///
/// Cloning shares the simulated instrument state, so a test keeps a handle
/// while the service owns the session.
#[derive(Clone)]
pub struct MockScope {
    inner: Arc<Mutex<ScopeState>>,
}

impl MockScope {
    /// Create a scope with the given channel count and free-running state.
    pub fn new(channel_count: u8) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ScopeState {
                channel_count,
                timebase: 5e-4,
                horizontal_offset: 0.0,
                running: true,
                selected: None,
                samples: HashMap::new(),
                pending_block: None,
                log: Vec::new(),
                fail_matching: None,
                x_increment: 1e-6,
                x_origin: 0.0,
                y_increment: 0.01,
                y_origin: 0.0,
                y_reference: 128.0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ScopeState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bus that resolves the given resource addresses and opens this scope.
    pub fn bus(&self, resources: Vec<String>) -> MockBus {
        MockBus {
            resources,
            scope: self.clone(),
        }
    }

    /// Install the raw sample block for a channel, trailing sentinel byte
    /// included.
    pub fn set_channel_samples(&self, channel: u8, samples: Vec<u8>) {
        self.lock().samples.insert(channel, samples);
    }

    /// Override the scaling fields served in every preamble.
    pub fn set_preamble_scaling(
        &self,
        x_increment: f64,
        x_origin: f64,
        y_increment: f64,
        y_origin: f64,
        y_reference: f64,
    ) {
        let mut state = self.lock();
        state.x_increment = x_increment;
        state.x_origin = x_origin;
        state.y_increment = y_increment;
        state.y_origin = y_origin;
        state.y_reference = y_reference;
    }

    /// Make every command containing `needle` fail until cleared.
    pub fn fail_on(&self, needle: &str) {
        self.lock().fail_matching = Some(needle.to_string());
    }

    /// Clear failure injection.
    pub fn clear_fail(&self) {
        self.lock().fail_matching = None;
    }

    /// Every command received so far, in order.
    pub fn command_log(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    /// Current timebase in seconds per division.
    pub fn timebase(&self) -> f64 {
        self.lock().timebase
    }

    /// Current horizontal offset in seconds.
    pub fn horizontal_offset(&self) -> f64 {
        self.lock().horizontal_offset
    }

    /// Whether continuous acquisition is running.
    pub fn is_running(&self) -> bool {
        self.lock().running
    }
}

impl ScopeState {
    fn check_fail(&self, command: &str) -> ShotResult<()> {
        if let Some(needle) = &self.fail_matching {
            if command.contains(needle.as_str()) {
                return Err(ScopeError::Acquisition(format!(
                    "injected fault on '{command}'"
                )));
            }
        }
        Ok(())
    }

    fn preamble_reply(&self) -> ShotResult<String> {
        let channel = self
            .selected
            .ok_or_else(|| ScopeError::Acquisition("no channel selected".into()))?;
        let samples = self
            .samples
            .get(&channel)
            .ok_or_else(|| ScopeError::Acquisition(format!("no data on channel {channel}")))?;
        Ok(format!(
            "0,0,{},1,{},{},0,{},{},{}",
            samples.len(),
            self.x_increment,
            self.x_origin,
            self.y_increment,
            self.y_origin,
            self.y_reference,
        ))
    }

    fn stage_block(&mut self) -> ShotResult<()> {
        let channel = self
            .selected
            .ok_or_else(|| ScopeError::Acquisition("no channel selected".into()))?;
        let samples = self
            .samples
            .get(&channel)
            .ok_or_else(|| ScopeError::Acquisition(format!("no data on channel {channel}")))?;
        let mut raw = format!("#9{:09}", samples.len()).into_bytes();
        raw.extend_from_slice(samples);
        raw.push(b'\n');
        self.pending_block = Some(Bytes::from(raw));
        Ok(())
    }

    fn apply_write(&mut self, command: &str) -> ShotResult<()> {
        if command == ":RUN" {
            self.running = true;
        } else if command == ":STOP" {
            self.running = false;
        } else if let Some(rest) = command.strip_prefix(":WAV:SOUR CHAN") {
            let channel = rest
                .trim()
                .parse::<u8>()
                .map_err(|_| ScopeError::Acquisition(format!("bad channel in '{command}'")))?;
            self.selected = Some(channel);
        } else if let Some(rest) = command.strip_prefix(":TIM:SCAL ") {
            self.timebase = rest
                .trim()
                .parse()
                .map_err(|_| ScopeError::Acquisition(format!("bad timebase in '{command}'")))?;
        } else if let Some(rest) = command.strip_prefix(":TIM:OFFS ") {
            self.horizontal_offset = rest
                .trim()
                .parse()
                .map_err(|_| ScopeError::Acquisition(format!("bad offset in '{command}'")))?;
        } else if command == ":WAV:DATA?" {
            self.stage_block()?;
        }
        // :WAV:MODE / :WAV:FORM and anything else are accepted silently.
        Ok(())
    }
}

/// Session handle the mock bus hands to the service.
pub struct MockSession {
    inner: Arc<Mutex<ScopeState>>,
}

impl MockSession {
    fn lock(&self) -> MutexGuard<'_, ScopeState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ScpiSession for MockSession {
    async fn write(&mut self, command: &str) -> ShotResult<()> {
        let mut state = self.lock();
        state.log.push(command.to_string());
        state.check_fail(command)?;
        state.apply_write(command)
    }

    async fn query(&mut self, command: &str) -> ShotResult<String> {
        let mut state = self.lock();
        state.log.push(command.to_string());
        state.check_fail(command)?;
        match command {
            ":SYST:RAM?" => Ok(state.channel_count.to_string()),
            ":TIM:SCAL?" => Ok(state.timebase.to_string()),
            ":TIM:OFFS?" => Ok(state.horizontal_offset.to_string()),
            ":WAV:PRE?" => state.preamble_reply(),
            other => Err(ScopeError::Acquisition(format!(
                "mock has no reply for '{other}'"
            ))),
        }
    }

    async fn read_raw(&mut self) -> ShotResult<Bytes> {
        self.lock()
            .pending_block
            .take()
            .ok_or_else(|| ScopeError::Acquisition("no block transfer pending".into()))
    }
}

/// Bus resolving a fixed resource listing onto one [`MockScope`].
pub struct MockBus {
    resources: Vec<String>,
    scope: MockScope,
}

#[async_trait]
impl ScpiBus for MockBus {
    fn list_resources(&self) -> ShotResult<Vec<String>> {
        Ok(self.resources.clone())
    }

    async fn open(&self, _resource: &str) -> ShotResult<Box<dyn ScpiSession>> {
        Ok(Box::new(MockSession {
            inner: self.scope.inner.clone(),
        }))
    }
}
