//! Answering a single rollcall.
//!
//! Radar rollcalls are answered with a sequential beacon sweep and, failing
//! that, a position estimated from the distances the sweep produced. Numeric
//! rollcalls are answered by trying every four-digit code, one concurrent
//! batch at a time.

use crate::client::{ClientError, PlatformApi};
use crate::geolocation::{self, DistanceObservation, Estimate};
use rc_core::types::{BeaconPoint, BeaconTable, RollcallId};
use rc_telemetry::account_log::AccountLogger;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinSet;

/// Largest numeric code; codes are `0000..=9999`.
pub const MAX_NUMBER_CODE: u16 = 9999;

pub const DEFAULT_BATCH_SIZE: usize = 200;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum RadarResolution {
    /// A beacon was accepted.
    Beacon { key: String },
    /// The estimated position was accepted.
    Estimated(Estimate),
    Failed { attempts: usize, reason: String },
}

impl RadarResolution {
    pub fn is_success(&self) -> bool {
        !matches!(self, RadarResolution::Failed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericResolution {
    Found { code: u16, submitted: usize },
    Exhausted { submitted: usize },
    /// Stop was requested between batches.
    Stopped { submitted: usize },
}

// ---------------------------------------------------------------------------
// In-flight registry
// ---------------------------------------------------------------------------

/// Per-engine set of numeric rollcalls currently being searched.
#[derive(Debug, Clone, Default)]
pub struct InFlightRegistry {
    active: Arc<Mutex<HashSet<RollcallId>>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically claim `id`. `None` when a search is already running.
    pub fn try_claim(&self, id: RollcallId) -> Option<InFlightClaim> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if active.insert(id) {
            Some(InFlightClaim {
                id,
                registry: self.clone(),
            })
        } else {
            None
        }
    }

    pub fn contains(&self, id: RollcallId) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&id)
    }

    pub fn len(&self) -> usize {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, id: RollcallId) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }
}

/// Held for the duration of a search; releases the claim on drop.
#[derive(Debug)]
pub struct InFlightClaim {
    id: RollcallId,
    registry: InFlightRegistry,
}

impl InFlightClaim {
    pub fn id(&self) -> RollcallId {
        self.id
    }
}

impl Drop for InFlightClaim {
    fn drop(&mut self) {
        self.registry.release(self.id);
    }
}

// ---------------------------------------------------------------------------
// SignalResponder
// ---------------------------------------------------------------------------

pub struct SignalResponder {
    api: Arc<PlatformApi>,
    beacons: Arc<BeaconTable>,
    preferred: Option<BeaconPoint>,
    logger: Arc<AccountLogger>,
    batch_size: usize,
}

impl SignalResponder {
    pub fn new(
        api: Arc<PlatformApi>,
        beacons: Arc<BeaconTable>,
        preferred_key: Option<&str>,
        logger: Arc<AccountLogger>,
    ) -> Self {
        let preferred = preferred_key.and_then(|k| beacons.get(k)).cloned();
        Self {
            api,
            beacons,
            preferred,
            logger,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Drive a radar rollcall to completion.
    ///
    /// Only `AuthExpired` is returned as an error; every other failure ends
    /// in [`RadarResolution::Failed`].
    pub async fn resolve_radar(
        &self,
        rollcall_id: RollcallId,
    ) -> Result<RadarResolution, ClientError> {
        let mut observations: Vec<DistanceObservation> = Vec::new();
        let mut attempts = 0usize;

        if let Some(point) = &self.preferred {
            attempts += 1;
            match self.submit(rollcall_id, point.longitude, point.latitude).await? {
                Submission::Accepted => {
                    self.logger
                        .success(format!(
                            "Rollcall #{rollcall_id} signed at preferred location {}",
                            point.key
                        ))
                        .await;
                    return Ok(RadarResolution::Beacon {
                        key: point.key.clone(),
                    });
                }
                Submission::Rejected(distance) => {
                    self.logger
                        .warn(format!(
                            "Rollcall #{rollcall_id}: preferred location {} was rejected{}",
                            point.key,
                            describe_distance(distance)
                        ))
                        .await;
                    observations.extend(distance.map(|d| observe(point, d)));
                }
            }
        }

        for point in self.beacons.iter() {
            attempts += 1;
            self.logger
                .info(format!("Rollcall #{rollcall_id}: trying location {}", point.key))
                .await;
            match self.submit(rollcall_id, point.longitude, point.latitude).await? {
                Submission::Accepted => {
                    self.logger
                        .success(format!(
                            "Rollcall #{rollcall_id} signed at location {}",
                            point.key
                        ))
                        .await;
                    return Ok(RadarResolution::Beacon {
                        key: point.key.clone(),
                    });
                }
                Submission::Rejected(distance) => {
                    observations.extend(distance.map(|d| observe(point, d)));
                }
            }
        }

        if observations.len() < geolocation::MIN_OBSERVATIONS {
            return Ok(self
                .fail(
                    rollcall_id,
                    attempts,
                    format!(
                        "only {} of {attempts} answers reported a distance",
                        observations.len()
                    ),
                )
                .await);
        }

        let estimate = match geolocation::estimate(&observations) {
            Ok(estimate) => estimate,
            Err(e) => return Ok(self.fail(rollcall_id, attempts, e.to_string()).await),
        };
        self.logger
            .info(format!(
                "Rollcall #{rollcall_id}: estimated position ({:.6}, {:.6}) from {} distances, rms {:.1} m{}",
                estimate.longitude,
                estimate.latitude,
                estimate.used,
                estimate.rms,
                if estimate.degenerate { ", degenerate geometry" } else { "" }
            ))
            .await;

        attempts += 1;
        match self
            .submit(rollcall_id, estimate.longitude, estimate.latitude)
            .await?
        {
            Submission::Accepted => {
                self.logger
                    .success(format!(
                        "Rollcall #{rollcall_id} signed at the estimated position"
                    ))
                    .await;
                Ok(RadarResolution::Estimated(estimate))
            }
            Submission::Rejected(distance) => Ok(self
                .fail(
                    rollcall_id,
                    attempts,
                    format!("estimated position rejected{}", describe_distance(distance)),
                )
                .await),
        }
    }

    async fn submit(
        &self,
        rollcall_id: RollcallId,
        longitude: f64,
        latitude: f64,
    ) -> Result<Submission, ClientError> {
        match self.api.answer_radar(rollcall_id, longitude, latitude).await {
            Ok(outcome) if outcome.on_call => Ok(Submission::Accepted),
            Ok(outcome) => {
                tracing::debug!(rollcall_id, longitude, latitude, raw = %outcome.raw, "radar answer rejected");
                Ok(Submission::Rejected(outcome.distance))
            }
            Err(e) if e.is_auth_expired() => Err(e),
            Err(e) => {
                tracing::warn!(rollcall_id, error = %e, "radar answer failed");
                Ok(Submission::Rejected(None))
            }
        }
    }

    async fn fail(&self, rollcall_id: RollcallId, attempts: usize, reason: String) -> RadarResolution {
        self.logger
            .warn(format!(
                "Rollcall #{rollcall_id} could not be signed after {attempts} attempts: {reason}"
            ))
            .await;
        RadarResolution::Failed { attempts, reason }
    }

    /// Search the numeric code of a rollcall.
    ///
    /// Codes are submitted in ascending batches; within a batch all
    /// submissions run concurrently and the first accepted code aborts the
    /// rest. `stop` is checked before each batch.
    pub async fn resolve_numeric(
        &self,
        rollcall_id: RollcallId,
        stop: watch::Receiver<bool>,
    ) -> Result<NumericResolution, ClientError> {
        let resolution = self.search_codes(rollcall_id, stop).await?;
        match resolution {
            NumericResolution::Found { code, submitted } => {
                self.logger
                    .success(format!(
                        "Number rollcall #{rollcall_id} signed with code {code:04} after {submitted} submissions"
                    ))
                    .await;
            }
            NumericResolution::Exhausted { .. } => {
                self.logger
                    .error(format!(
                        "Number rollcall #{rollcall_id}: no valid code found"
                    ))
                    .await;
            }
            NumericResolution::Stopped { submitted } => {
                self.logger
                    .info(format!(
                        "Number rollcall #{rollcall_id}: search stopped after {submitted} submissions"
                    ))
                    .await;
            }
        }
        Ok(resolution)
    }

    async fn search_codes(
        &self,
        rollcall_id: RollcallId,
        stop: watch::Receiver<bool>,
    ) -> Result<NumericResolution, ClientError> {
        let batch = self.batch_size;
        let mut submitted = 0usize;
        let mut start = 0usize;
        let last = usize::from(MAX_NUMBER_CODE);

        while start <= last {
            if *stop.borrow() {
                return Ok(NumericResolution::Stopped { submitted });
            }

            let end = (start + batch - 1).min(last);
            let mut set = JoinSet::new();
            for code in start..=end {
                let api = self.api.clone();
                // `code` never exceeds 9999.
                let code = code as u16;
                set.spawn(async move { (code, api.answer_number(rollcall_id, code).await) });
            }
            submitted += end - start + 1;
            tracing::debug!(rollcall_id, start, end, "number batch submitted");

            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((code, Ok(true))) => {
                        set.shutdown().await;
                        return Ok(NumericResolution::Found { code, submitted });
                    }
                    Ok((_, Ok(false))) => {}
                    Ok((_, Err(e))) if e.is_auth_expired() => {
                        set.shutdown().await;
                        return Err(e);
                    }
                    Ok((code, Err(e))) => {
                        tracing::debug!(rollcall_id, code, error = %e, "number submission failed");
                    }
                    Err(e) if e.is_panic() => {
                        tracing::error!(rollcall_id, error = %e, "number submission panicked");
                    }
                    Err(_) => {}
                }
            }

            start = end + 1;
        }

        Ok(NumericResolution::Exhausted { submitted })
    }
}

enum Submission {
    Accepted,
    /// Rejected, with the reported distance when there was one.
    Rejected(Option<f64>),
}

fn observe(point: &BeaconPoint, distance: f64) -> DistanceObservation {
    DistanceObservation::new(point.longitude, point.latitude, distance)
}

fn describe_distance(distance: Option<f64>) -> String {
    distance
        .map(|d| format!(" ({d:.0} m away)"))
        .unwrap_or_default()
}
