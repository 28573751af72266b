//! VISA transport backend for the scope session.
//!
//! Implements [`ScpiBus`]/[`ScpiSession`] over the `visa-rs` crate, covering
//! instruments reachable via USB, Ethernet/LXI, or GPIB. Resource strings
//! look like:
//!
//! - `USB0::0x1AB1::0x04CE::DS1ZA203514731::INSTR` (USB)
//! - `TCPIP0::192.168.1.101::INSTR` (Ethernet/LXI)
//! - `GPIB0::7::INSTR` (GPIB)
//!
//! VISA calls are synchronous, so every operation runs on Tokio's blocking
//! executor; the session itself stays behind an `Arc<Mutex>` that the
//! blocking closures lock for the duration of one half-duplex exchange.

use std::ffi::CString;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;
use visa_rs::prelude::*;

use crate::core::{ScpiBus, ScpiSession};
use crate::error::{ScopeError, ShotResult};

const READ_CHUNK: usize = 64 * 1024;

fn visa_err(context: &str, err: impl std::fmt::Display) -> ScopeError {
    ScopeError::Acquisition(format!("{context}: {err}"))
}

fn visa_string(s: &str) -> ShotResult<VisaString> {
    let c_string =
        CString::new(s).map_err(|_| ScopeError::Acquisition(format!("invalid resource '{s}'")))?;
    Ok(VisaString::from(c_string))
}

/// VISA resource manager wrapper implementing [`ScpiBus`].
pub struct VisaBus {
    rm: Arc<Mutex<DefaultRM>>,
}

impl VisaBus {
    /// Open the default VISA resource manager.
    pub fn new() -> ShotResult<Self> {
        let rm = DefaultRM::new().map_err(|e| visa_err("cannot open VISA resource manager", e))?;
        Ok(Self {
            rm: Arc::new(Mutex::new(rm)),
        })
    }
}

#[async_trait]
impl ScpiBus for VisaBus {
    fn list_resources(&self) -> ShotResult<Vec<String>> {
        let rm = self.rm.lock().unwrap_or_else(PoisonError::into_inner);
        let expr = visa_string("?*INSTR")?;
        let list = rm
            .find_res_list(&expr)
            .map_err(|e| visa_err("resource enumeration failed", e))?;
        let mut resources = Vec::new();
        for res in list {
            let res = res.map_err(|e| visa_err("resource enumeration failed", e))?;
            resources.push(res.to_string());
        }
        Ok(resources)
    }

    async fn open(&self, resource: &str) -> ShotResult<Box<dyn ScpiSession>> {
        let rm = self.rm.clone();
        let resource = resource.to_string();
        let session = tokio::task::spawn_blocking(move || {
            let rm = rm.lock().unwrap_or_else(PoisonError::into_inner);
            let addr = visa_string(&resource)?;
            rm.open(&addr, AccessMode::NO_LOCK, TIMEOUT_IMMEDIATE)
                .map_err(|e| visa_err(&format!("cannot open '{resource}'"), e))
        })
        .await
        .map_err(|e| ScopeError::Acquisition(format!("VISA open task panicked: {e}")))??;

        debug!("VISA session opened");
        Ok(Box::new(VisaSession {
            instrument: Arc::new(Mutex::new(session)),
        }))
    }
}

/// One half-duplex VISA session.
pub struct VisaSession {
    instrument: Arc<Mutex<Instrument>>,
}

impl VisaSession {
    fn blocking<T, F>(&self, op: F) -> impl std::future::Future<Output = ShotResult<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut Instrument) -> ShotResult<T> + Send + 'static,
    {
        let instrument = self.instrument.clone();
        async move {
            tokio::task::spawn_blocking(move || {
                let mut guard = instrument.lock().unwrap_or_else(PoisonError::into_inner);
                op(&mut guard)
            })
            .await
            .map_err(|e| ScopeError::Acquisition(format!("VISA I/O task panicked: {e}")))?
        }
    }
}

fn read_to_end(instrument: &mut Instrument) -> ShotResult<Vec<u8>> {
    // One response per request; the instrument signals the end of the
    // response with a short read.
    let mut response = Vec::new();
    loop {
        let mut chunk = vec![0u8; READ_CHUNK];
        let n = instrument
            .read(&mut chunk)
            .map_err(|e| visa_err("VISA read failed", e))?;
        response.extend_from_slice(&chunk[..n]);
        if n < READ_CHUNK {
            return Ok(response);
        }
    }
}

#[async_trait]
impl ScpiSession for VisaSession {
    async fn write(&mut self, command: &str) -> ShotResult<()> {
        let line = format!("{command}\n");
        debug!(command, "VISA write");
        self.blocking(move |instrument| {
            instrument
                .write_all(line.as_bytes())
                .map_err(|e| visa_err("VISA write failed", e))
        })
        .await
    }

    async fn query(&mut self, command: &str) -> ShotResult<String> {
        let line = format!("{command}\n");
        debug!(command, "VISA query");
        self.blocking(move |instrument| {
            instrument
                .write_all(line.as_bytes())
                .map_err(|e| visa_err("VISA write failed", e))?;
            let response = read_to_end(instrument)?;
            Ok(String::from_utf8_lossy(&response).trim().to_string())
        })
        .await
    }

    async fn read_raw(&mut self) -> ShotResult<Bytes> {
        self.blocking(|instrument| read_to_end(instrument).map(Bytes::from))
            .await
    }
}
