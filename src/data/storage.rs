//! Shot-scoped trace persistence with clean feature flag handling.
//!
//! Two seams are defined here and implemented twice each:
//!
//! - [`ShotDescriptorSource`] reads per-shot acquisition parameters, keyed by
//!   device name, out of the shot artifact.
//! - [`TraceSink`] writes named time/voltage series into the shot artifact
//!   under one trace group.
//!
//! The HDF5 backend ([`Hdf5Store`], `storage_hdf5` feature) talks to the real
//! shot files produced by the experiment orchestrator. The in-memory backend
//! ([`MemoryStore`], always available) backs tests and development without a
//! native HDF5 toolchain.
//!
//! # Contract
//!
//! `ensure_group` is idempotent: when the group already exists because a
//! concurrent writer raced ahead, the existing group is returned rather than
//! an error. `write_series` is the opposite: rewriting a series name within
//! one shot fails loudly with [`ScopeError::SeriesConflict`], because
//! distinct shots never legitimately reuse a name.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ScopeError, ShotResult};

/// Opaque handle for one experimental run's descriptor and output artifact.
///
/// Carries the artifact path delivered by the configure command. Created when
/// a configure command arrives, retired when the run completes or aborts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShotToken(String);

impl ShotToken {
    /// Wrap the artifact path received over the control link.
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// The artifact path as received.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ShotToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-shot acquisition parameters, addressed by device name.
///
/// `channels` uses the orchestrator's 0-based indexing; the lifecycle
/// controller maps it onto the instrument's 1-based channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShotDescriptor {
    /// Timebase scale in seconds per division.
    pub timestep: f64,
    /// Horizontal offset relative to the trigger, in seconds.
    pub offset: f64,
    /// Ordered 0-based channel indices to acquire.
    pub channels: Vec<i64>,
    /// Parallel ordered human-readable series names.
    pub names: Vec<String>,
}

/// Naming convention for the time-axis series within a shot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimeAxisLayout {
    /// One `times` series per shot, shared by every channel. Valid because
    /// the timebase is configured once per shot for all channels.
    #[default]
    Shared,
    /// One `times<name>` series per channel, matching the historical reader
    /// contract.
    PerChannel,
}

/// Handle to one trace group inside one shot artifact.
#[derive(Debug, Clone)]
pub struct TraceGroup {
    shot: ShotToken,
    name: String,
}

impl TraceGroup {
    /// The shot this group belongs to.
    pub fn shot(&self) -> &ShotToken {
        &self.shot
    }

    /// The group name inside the artifact.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Reader of per-shot acquisition parameters.
#[async_trait]
pub trait ShotDescriptorSource: Send + Sync {
    /// Load the descriptor for `device` out of the given shot artifact.
    async fn load(&self, shot: &ShotToken, device: &str) -> ShotResult<ShotDescriptor>;
}

/// Writer of named series into a shot-scoped store.
#[async_trait]
pub trait TraceSink: Send + Sync {
    /// Get or create the named group inside the shot artifact.
    async fn ensure_group(&self, shot: &ShotToken, name: &str) -> ShotResult<TraceGroup>;

    /// Write one named series into the group. Fails with
    /// [`ScopeError::SeriesConflict`] if the name was already written for
    /// this shot.
    async fn write_series(&self, group: &TraceGroup, name: &str, values: &[f64])
        -> ShotResult<()>;
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Default)]
struct MemoryInner {
    descriptors: HashMap<(String, String), ShotDescriptor>,
    groups: HashMap<(String, String), Vec<(String, Vec<f64>)>>,
}

/// In-memory descriptor source and trace sink.
///
/// Cloning shares the underlying store, so a test can keep a handle and
/// inspect what the service wrote.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register the descriptor a later `load` will return.
    pub fn insert_descriptor(&self, shot: &ShotToken, device: &str, descriptor: ShotDescriptor) {
        self.lock()
            .descriptors
            .insert((shot.as_str().into(), device.into()), descriptor);
    }

    /// Names of every series written to the given group, in write order.
    pub fn series_names(&self, shot: &ShotToken, group: &str) -> Vec<String> {
        self.lock()
            .groups
            .get(&(shot.as_str().into(), group.into()))
            .map(|series| series.iter().map(|(n, _)| n.clone()).collect())
            .unwrap_or_default()
    }

    /// Values of one series, if it was written.
    pub fn series(&self, shot: &ShotToken, group: &str, name: &str) -> Option<Vec<f64>> {
        self.lock()
            .groups
            .get(&(shot.as_str().into(), group.into()))
            .and_then(|series| {
                series
                    .iter()
                    .find(|(n, _)| n == name)
                    .map(|(_, v)| v.clone())
            })
    }
}

#[async_trait]
impl ShotDescriptorSource for MemoryStore {
    async fn load(&self, shot: &ShotToken, device: &str) -> ShotResult<ShotDescriptor> {
        self.lock()
            .descriptors
            .get(&(shot.as_str().into(), device.into()))
            .cloned()
            .ok_or_else(|| {
                ScopeError::Descriptor(format!("no descriptor for device '{device}' in {shot}"))
            })
    }
}

#[async_trait]
impl TraceSink for MemoryStore {
    async fn ensure_group(&self, shot: &ShotToken, name: &str) -> ShotResult<TraceGroup> {
        let mut inner = self.lock();
        let key = (shot.as_str().to_string(), name.to_string());
        if inner.groups.contains_key(&key) {
            tracing::debug!(group = name, "group already existed");
        } else {
            inner.groups.insert(key, Vec::new());
        }
        Ok(TraceGroup {
            shot: shot.clone(),
            name: name.to_string(),
        })
    }

    async fn write_series(
        &self,
        group: &TraceGroup,
        name: &str,
        values: &[f64],
    ) -> ShotResult<()> {
        let mut inner = self.lock();
        let key = (group.shot.as_str().to_string(), group.name.clone());
        let series = inner
            .groups
            .get_mut(&key)
            .ok_or_else(|| ScopeError::Storage(format!("group '{}' was never ensured", group.name)))?;
        if series.iter().any(|(n, _)| n == name) {
            return Err(ScopeError::SeriesConflict(name.to_string()));
        }
        series.push((name.to_string(), values.to_vec()));
        Ok(())
    }
}

// ============================================================================
// HDF5 store
// ============================================================================

#[cfg(feature = "storage_hdf5")]
mod hdf5_enabled {
    use super::*;
    use hdf5::types::VarLenUnicode;

    /// HDF5-backed descriptor source and trace sink.
    ///
    /// The shot token is the path of an HDF5 file created by the experiment
    /// orchestrator. Descriptors are read from the attributes of
    /// `devices/<device>`; traces are written as datasets under the
    /// configured trace group.
    #[derive(Clone, Default)]
    pub struct Hdf5Store;

    impl Hdf5Store {
        /// Create a store. Stateless; every call addresses the shot file.
        pub fn new() -> Self {
            Self
        }

        fn storage_err(context: &str, err: hdf5::Error) -> ScopeError {
            ScopeError::Storage(format!("{context}: {err}"))
        }
    }

    #[async_trait]
    impl ShotDescriptorSource for Hdf5Store {
        async fn load(&self, shot: &ShotToken, device: &str) -> ShotResult<ShotDescriptor> {
            let file = hdf5::File::open(shot.as_str())
                .map_err(|e| ScopeError::Descriptor(format!("cannot open {shot}: {e}")))?;
            let group = file.group(&format!("devices/{device}")).map_err(|e| {
                ScopeError::Descriptor(format!("no devices/{device} group in {shot}: {e}"))
            })?;

            let read_f64 = |name: &str| -> ShotResult<f64> {
                group
                    .attr(name)
                    .and_then(|a| a.read_scalar::<f64>())
                    .map_err(|e| {
                        ScopeError::Descriptor(format!("attribute '{name}' of {device}: {e}"))
                    })
            };

            let timestep = read_f64("timestep")?;
            let offset = read_f64("offset")?;
            let channels = group
                .attr("channels")
                .and_then(|a| a.read_1d::<i64>())
                .map_err(|e| {
                    ScopeError::Descriptor(format!("attribute 'channels' of {device}: {e}"))
                })?
                .to_vec();
            let names = group
                .attr("names")
                .and_then(|a| a.read_1d::<VarLenUnicode>())
                .map_err(|e| {
                    ScopeError::Descriptor(format!("attribute 'names' of {device}: {e}"))
                })?
                .iter()
                .map(|n| n.to_string())
                .collect();

            Ok(ShotDescriptor {
                timestep,
                offset,
                channels,
                names,
            })
        }
    }

    #[async_trait]
    impl TraceSink for Hdf5Store {
        async fn ensure_group(&self, shot: &ShotToken, name: &str) -> ShotResult<TraceGroup> {
            let file = hdf5::File::append(shot.as_str())
                .map_err(|e| Self::storage_err("cannot open shot file", e))?;

            // A concurrent writer may have raced ahead; the existing group is
            // the success case, not an error.
            match file.group(name) {
                Ok(_) => {
                    tracing::debug!(group = name, "group already existed");
                }
                Err(_) => {
                    let group = file
                        .create_group(name)
                        .map_err(|e| Self::storage_err("cannot create trace group", e))?;
                    let created: VarLenUnicode = chrono::Utc::now()
                        .to_rfc3339()
                        .parse()
                        .map_err(|_| ScopeError::Storage("timestamp encoding".into()))?;
                    group
                        .new_attr::<VarLenUnicode>()
                        .create("created_at")
                        .and_then(|a| a.write_scalar(&created))
                        .map_err(|e| Self::storage_err("cannot stamp trace group", e))?;
                }
            }

            Ok(TraceGroup {
                shot: shot.clone(),
                name: name.to_string(),
            })
        }

        async fn write_series(
            &self,
            group: &TraceGroup,
            name: &str,
            values: &[f64],
        ) -> ShotResult<()> {
            let file = hdf5::File::append(group.shot().as_str())
                .map_err(|e| Self::storage_err("cannot open shot file", e))?;
            let h5_group = file
                .group(group.name())
                .map_err(|e| Self::storage_err("trace group disappeared", e))?;

            if h5_group.link_exists(name) {
                return Err(ScopeError::SeriesConflict(name.to_string()));
            }

            h5_group
                .new_dataset::<f64>()
                .shape(values.len())
                .create(name)
                .and_then(|ds| ds.write_slice(values, hdf5::s![..]))
                .map_err(|e| Self::storage_err("cannot write series", e))?;
            Ok(())
        }
    }
}

#[cfg(feature = "storage_hdf5")]
pub use hdf5_enabled::Hdf5Store;

#[cfg(test)]
mod tests {
    use super::*;

    fn shot() -> ShotToken {
        ShotToken::new("/shots/2024_07_09_0001.h5")
    }

    #[tokio::test]
    async fn test_ensure_group_is_idempotent() {
        let store = MemoryStore::new();
        let first = store.ensure_group(&shot(), "ScopeTraces").await.unwrap();
        let second = store.ensure_group(&shot(), "ScopeTraces").await.unwrap();

        // Both handles stay usable.
        store.write_series(&first, "A", &[1.0]).await.unwrap();
        store.write_series(&second, "B", &[2.0]).await.unwrap();
        assert_eq!(
            store.series_names(&shot(), "ScopeTraces"),
            vec!["A".to_string(), "B".to_string()]
        );
    }

    #[tokio::test]
    async fn test_duplicate_series_fails_loudly() {
        let store = MemoryStore::new();
        let group = store.ensure_group(&shot(), "ScopeTraces").await.unwrap();
        store.write_series(&group, "A", &[1.0, 2.0]).await.unwrap();

        let err = store
            .write_series(&group, "A", &[3.0])
            .await
            .unwrap_err();
        assert!(matches!(err, ScopeError::SeriesConflict(name) if name == "A"));
    }

    #[tokio::test]
    async fn test_distinct_shots_do_not_conflict() {
        let store = MemoryStore::new();
        let other = ShotToken::new("/shots/2024_07_09_0002.h5");
        let a = store.ensure_group(&shot(), "ScopeTraces").await.unwrap();
        let b = store.ensure_group(&other, "ScopeTraces").await.unwrap();
        store.write_series(&a, "A", &[1.0]).await.unwrap();
        store.write_series(&b, "A", &[2.0]).await.unwrap();
        assert_eq!(store.series(&shot(), "ScopeTraces", "A"), Some(vec![1.0]));
        assert_eq!(store.series(&other, "ScopeTraces", "A"), Some(vec![2.0]));
    }

    #[tokio::test]
    async fn test_descriptor_roundtrip() {
        let store = MemoryStore::new();
        let descriptor = ShotDescriptor {
            timestep: 0.001,
            offset: 0.0,
            channels: vec![0, 2],
            names: vec!["A".into(), "C".into()],
        };
        store.insert_descriptor(&shot(), "tisapph_scope", descriptor.clone());

        let loaded = store.load(&shot(), "tisapph_scope").await.unwrap();
        assert_eq!(loaded, descriptor);

        let err = store.load(&shot(), "other_scope").await.unwrap_err();
        assert!(matches!(err, ScopeError::Descriptor(_)));
    }
}
