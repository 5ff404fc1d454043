use crate::artifact::{ArtifactInner, LoadedArtifact};
use crate::config::UnloadPolicy;
use crate::isolation::{IsolationUnit, UnitInner, UnitState};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Watches one unit and the artifacts loaded through it without keeping any
/// of them alive.
#[derive(Debug)]
pub struct ObservationHandle {
    unit_id: Uuid,
    unit_name: String,
    unit: Weak<UnitInner>,
    artifacts: Mutex<Vec<Weak<ArtifactInner>>>,
}

impl ObservationHandle {
    pub(crate) fn new(unit: &IsolationUnit) -> Self {
        Self {
            unit_id: unit.id(),
            unit_name: unit.name().to_string(),
            unit: unit.downgrade(),
            artifacts: Mutex::new(Vec::new()),
        }
    }

    pub fn unit_id(&self) -> Uuid {
        self.unit_id
    }

    pub fn unit_name(&self) -> &str {
        &self.unit_name
    }

    /// Whether anything still holds the unit
    pub fn is_alive(&self) -> bool {
        self.unit.strong_count() > 0
    }

    pub fn state(&self) -> UnitState {
        match self.unit.upgrade() {
            Some(inner) => IsolationUnit::from_inner(inner).state(),
            None => UnitState::Unloaded,
        }
    }

    /// Artifacts recorded through this handle that are still reachable
    pub fn live_artifacts(&self) -> usize {
        self.artifacts
            .lock()
            .iter()
            .filter(|artifact| artifact.strong_count() > 0)
            .count()
    }

    pub(crate) fn record(&self, artifact: &LoadedArtifact) {
        self.artifacts.lock().push(artifact.downgrade());
    }

    /// Drop observations of artifacts that are gone; returns how many remain
    fn collect(&self) -> usize {
        let mut artifacts = self.artifacts.lock();
        artifacts.retain(|artifact| artifact.strong_count() > 0);
        artifacts.len()
    }

    fn request_unload(&self) -> bool {
        match self.unit.upgrade() {
            Some(inner) => IsolationUnit::from_inner(inner).request_unload(),
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnloadStatus {
    Unloaded,
    /// Something still references the unit after the attempt bound
    StillAlive,
}

/// Outcome of one [`LifecycleTracker::unload_all`] pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnloadReport {
    pub units_unloaded: usize,
    pub units_still_alive: usize,
    pub still_alive: Vec<Uuid>,
}

impl UnloadReport {
    pub fn is_complete(&self) -> bool {
        self.units_still_alive == 0
    }
}

/// Registry of observation handles for every isolated unit.
///
/// Safe to share between orchestrators: tracking and unloading may run
/// concurrently.
#[derive(Debug, Default)]
pub struct LifecycleTracker {
    units: DashMap<Uuid, Arc<ObservationHandle>>,
}

impl LifecycleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start observing a unit
    pub fn track(&self, unit: &IsolationUnit) -> Arc<ObservationHandle> {
        let handle = Arc::new(unit.observe());
        self.units.insert(unit.id(), handle.clone());
        debug!("Tracking unit {} ({})", unit.name(), unit.id());
        handle
    }

    pub fn record_artifact(&self, handle: &ObservationHandle, artifact: &LoadedArtifact) {
        handle.record(artifact);
        debug!(
            "Recorded artifact {} for unit {}",
            artifact.name(),
            handle.unit_id
        );
    }

    /// Wait, within the policy's bound, for a unit to become unreachable
    pub fn confirm_unload(&self, handle: &ObservationHandle, policy: &UnloadPolicy) -> UnloadStatus {
        for attempt in 1..=policy.max_attempts {
            let remaining = handle.collect();
            if !handle.is_alive() {
                debug!(
                    "Unit {} unloaded after {} attempt(s)",
                    handle.unit_id, attempt
                );
                return UnloadStatus::Unloaded;
            }
            debug!(
                "Unit {} still reachable ({} live artifact(s)), attempt {}/{}",
                handle.unit_id, remaining, attempt, policy.max_attempts
            );
            policy.yield_strategy.pause();
        }

        if !handle.is_alive() {
            return UnloadStatus::Unloaded;
        }
        warn!(
            "Unit {} ({}) is still alive after {} attempt(s)",
            handle.unit_name, handle.unit_id, policy.max_attempts
        );
        UnloadStatus::StillAlive
    }

    /// Request unload of every tracked unit and confirm each one.
    ///
    /// Confirmed units stop being tracked; units that are still alive stay
    /// registered so a later call can try again.
    pub fn unload_all(&self, policy: &UnloadPolicy) -> UnloadReport {
        let handles: Vec<Arc<ObservationHandle>> =
            self.units.iter().map(|entry| entry.value().clone()).collect();

        for handle in &handles {
            handle.request_unload();
        }

        let mut report = UnloadReport::default();
        for handle in handles {
            match self.confirm_unload(&handle, policy) {
                UnloadStatus::Unloaded => {
                    self.units.remove(&handle.unit_id);
                    report.units_unloaded += 1;
                }
                UnloadStatus::StillAlive => {
                    report.units_still_alive += 1;
                    report.still_alive.push(handle.unit_id);
                }
            }
        }

        if report.units_unloaded > 0 || report.units_still_alive > 0 {
            info!(
                "Unloaded {} unit(s), {} still alive",
                report.units_unloaded, report.units_still_alive
            );
        }
        report
    }

    /// Number of units currently tracked
    pub fn tracked(&self) -> usize {
        self.units.len()
    }

    /// Tracked units that are still reachable
    pub fn live_units(&self) -> Vec<Uuid> {
        self.units
            .iter()
            .filter(|entry| entry.value().is_alive())
            .map(|entry| *entry.key())
            .collect()
    }
}
