//! Sync engine
//!
//! Sweeps unsynced results out of the store and posts them to the remote
//! endpoint. One background task per engine; realtime mode polls every
//! five seconds and also exposes a per-patient trigger the parsers fire
//! right after a message finishes persisting. The store lock is never
//! held across an HTTP await: the sweep snapshots rows, sends, then marks.

use crate::config::{SyncConfig, SyncMethod, SyncMode};
use crate::error::{LinkError, Result};
use crate::model::{AttemptStatus, ResultRecord, SyncStatus};
use crate::protocol::SyncTrigger;
use crate::store::ResultStore;
use crate::sync::auth::Authenticator;
use crate::sync::schedule::{next_daily, CronExpr};
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const REALTIME_POLL: Duration = Duration::from_secs(5);
const SCHEDULED_GUARD: Duration = Duration::from_secs(60);
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Observable engine lifecycle state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineState {
    Disabled,
    Starting,
    Running(SyncMode),
    Stopping,
}

/// Result of one sync sweep
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub ok: bool,
    pub message: String,
    pub count: usize,
}

impl SyncOutcome {
    fn ok(message: impl Into<String>, count: usize) -> Self {
        SyncOutcome {
            ok: true,
            message: message.into(),
            count,
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        SyncOutcome {
            ok: false,
            message: message.into(),
            count: 0,
        }
    }
}

/// Uploads persisted results to the configured remote endpoint
pub struct SyncEngine {
    config: SyncConfig,
    store: Arc<dyn ResultStore>,
    client: reqwest::Client,
    auth: Authenticator,
    state: StdMutex<EngineState>,
    /// Delay before the next retry after a failure
    backoff: StdMutex<Duration>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    pub fn new(config: SyncConfig, store: Arc<dyn ResultStore>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        let auth = Authenticator::new(config.auth.clone());
        let initial = config.initial_backoff;
        Ok(SyncEngine {
            config,
            store,
            client,
            auth,
            state: StdMutex::new(EngineState::Disabled),
            backoff: StdMutex::new(initial),
            task: Mutex::new(None),
        })
    }

    pub fn state(&self) -> EngineState {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_state(&self, state: EngineState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Delay to apply after a failure; doubles up to the ceiling
    fn next_backoff(&self) -> Duration {
        let mut backoff = self.backoff.lock().unwrap_or_else(|e| e.into_inner());
        let current = *backoff;
        *backoff = (current * 2).min(self.config.max_backoff);
        current
    }

    fn reset_backoff(&self) {
        *self.backoff.lock().unwrap_or_else(|e| e.into_inner()) = self.config.initial_backoff;
    }

    /// Spawn the background loop, replacing any previous one
    pub async fn start(self: &Arc<Self>) {
        self.set_state(EngineState::Starting);
        let mut task = self.task.lock().await;
        if let Some(previous) = task.take() {
            previous.abort();
        }

        let engine = self.clone();
        let mode = self.config.mode.clone();
        *task = Some(tokio::spawn(async move {
            engine.set_state(EngineState::Running(mode.clone()));
            info!(mode = ?mode, endpoint = %engine.config.endpoint(), "Sync engine running");
            match mode {
                SyncMode::Realtime => engine.run_realtime().await,
                SyncMode::Scheduled { hour, minute } => engine.run_scheduled(hour, minute).await,
                SyncMode::Cron(expr) => engine.run_cron(&expr).await,
            }
        }));
    }

    /// Cancel the loop; cancellation is normal shutdown
    pub async fn stop(&self) {
        self.set_state(EngineState::Stopping);
        let mut task = self.task.lock().await;
        if let Some(handle) = task.take() {
            handle.abort();
            let _ = tokio::time::timeout(STOP_TIMEOUT, handle).await;
        }
        self.set_state(EngineState::Disabled);
        info!("Sync engine stopped");
    }

    async fn run_realtime(&self) {
        loop {
            let outcome = self.sync_now().await;
            let delay = if outcome.ok {
                REALTIME_POLL
            } else {
                self.next_backoff()
            };
            tokio::time::sleep(delay).await;
        }
    }

    async fn run_scheduled(&self, hour: u32, minute: u32) {
        loop {
            let next = match next_daily(Utc::now(), hour, minute) {
                Ok(next) => next,
                Err(e) => {
                    error!(error = %e, "Scheduled sync misconfigured, engine idle");
                    return;
                }
            };
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            debug!(fire_at = %next, "Next scheduled sync");
            tokio::time::sleep(wait).await;
            let outcome = self.sync_now().await;
            if !outcome.ok {
                tokio::time::sleep(self.next_backoff()).await;
            }
            // Guard against firing twice inside the same minute
            tokio::time::sleep(SCHEDULED_GUARD).await;
        }
    }

    async fn run_cron(&self, expr: &str) {
        let cron = match CronExpr::parse(expr) {
            Ok(cron) => cron,
            Err(e) => {
                error!(expr, error = %e, "Cron expression invalid, engine idle");
                return;
            }
        };
        loop {
            let next = match cron.next_fire(Utc::now()) {
                Some(next) => next,
                None => {
                    error!(expr, "Cron expression never fires, engine idle");
                    return;
                }
            };
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            debug!(fire_at = %next, "Next cron sync");
            tokio::time::sleep(wait).await;
            let outcome = self.sync_now().await;
            if !outcome.ok {
                tokio::time::sleep(self.next_backoff()).await;
            }
        }
    }

    /// Sweep every unsynced result in one batch upload
    pub async fn sync_now(&self) -> SyncOutcome {
        let results = match self
            .store
            .results_by_sync_status(SyncStatus::Local, self.config.batch_limit)
        {
            Ok(results) => results,
            Err(e) => {
                warn!(error = %e, "Sync sweep query failed");
                return SyncOutcome::failed(format!("store query failed: {e}"));
            }
        };
        if results.is_empty() {
            return SyncOutcome::ok("nothing to sync", 0);
        }

        let payload = match self.batch_payload(&results) {
            Ok(payload) => payload,
            Err(e) => {
                self.record(AttemptStatus::Error, &e.to_string(), 0);
                return SyncOutcome::failed(e.to_string());
            }
        };

        match self.send(&payload).await {
            Ok(()) => {
                for result in &results {
                    if let Err(e) = self.store.mark_result_synced(result.id) {
                        warn!(result_id = result.id, error = %e, "Mark-synced failed");
                    }
                }
                self.reset_backoff();
                let message = format!("synced {} results", results.len());
                self.record(AttemptStatus::Success, &message, results.len());
                info!(count = results.len(), "Sync batch accepted");
                SyncOutcome::ok(message, results.len())
            }
            Err(e) => {
                let status = match e {
                    LinkError::Auth(_) => AttemptStatus::Error,
                    _ => AttemptStatus::Failed,
                };
                self.record(status, &e.to_string(), 0);
                warn!(error = %e, "Sync batch failed, records stay local");
                SyncOutcome::failed(e.to_string())
            }
        }
    }

    /// Upload one patient's full record set; wired as the parsers' trigger
    pub async fn sync_patient(&self, patient_id: i64) -> SyncOutcome {
        let (patient, results) = match self.patient_snapshot(patient_id) {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                warn!(patient_id, "Sync requested for unknown patient");
                return SyncOutcome::failed("unknown patient");
            }
            Err(e) => return SyncOutcome::failed(e.to_string()),
        };

        let payload = json!({
            "instance_id": self.config.instance_id,
            "analyzer_type": self.config.analyzer_type,
            "timestamp": Utc::now().to_rfc3339(),
            "patient": {
                "id": patient.id,
                "external_patient_id": patient.external_patient_id,
                "sample_id": patient.sample_id,
                "name": patient.name,
                "date_of_birth": patient.date_of_birth,
                "sex": patient.sex.as_str(),
                "physician": patient.physician,
            },
            "results": results.iter().map(|r| json!({
                "id": r.id,
                "test_code": r.test_code,
                "value": r.value,
                "unit": r.unit,
                "flags": r.flags,
                "timestamp": r.timestamp.to_rfc3339(),
                "sequence": r.sequence,
            })).collect::<Vec<_>>(),
        });

        match self.send(&payload).await {
            Ok(()) => {
                if let Err(e) = self.store.mark_patient_synced(patient_id) {
                    warn!(patient_id, error = %e, "Mark patient synced failed");
                }
                for result in &results {
                    if let Err(e) = self.store.mark_result_synced(result.id) {
                        warn!(result_id = result.id, error = %e, "Mark-synced failed");
                    }
                }
                self.reset_backoff();
                let message = format!("synced patient {patient_id}");
                self.record(AttemptStatus::Success, &message, results.len());
                debug!(patient_id, results = results.len(), "Patient sync accepted");
                SyncOutcome::ok(message, results.len())
            }
            Err(e) => {
                let status = match e {
                    LinkError::Auth(_) => AttemptStatus::Error,
                    _ => AttemptStatus::Failed,
                };
                self.record(status, &e.to_string(), 0);
                warn!(patient_id, error = %e, "Patient sync failed");
                SyncOutcome::failed(e.to_string())
            }
        }
    }

    /// Trigger handed to parsers; fires a per-patient sync task
    pub fn realtime_trigger(self: &Arc<Self>) -> SyncTrigger {
        let engine = self.clone();
        Arc::new(move |patient_id| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine.sync_patient(patient_id).await;
            });
        })
    }

    fn patient_snapshot(
        &self,
        patient_id: i64,
    ) -> Result<Option<(crate::model::PatientRecord, Vec<ResultRecord>)>> {
        let patient = match self.store.patient(patient_id)? {
            Some(patient) => patient,
            None => return Ok(None),
        };
        let results = self.store.patient_results(patient_id)?;
        Ok(Some((patient, results)))
    }

    fn batch_payload(&self, results: &[ResultRecord]) -> Result<serde_json::Value> {
        // Resolve each patient once for its display name
        let mut names: HashMap<i64, String> = HashMap::new();
        for result in results {
            if let std::collections::hash_map::Entry::Vacant(entry) =
                names.entry(result.patient_id)
            {
                let name = self
                    .store
                    .patient(result.patient_id)?
                    .map(|p| p.name)
                    .unwrap_or_default();
                entry.insert(name);
            }
        }

        Ok(json!({
            "instance_id": self.config.instance_id,
            "analyzer_type": self.config.analyzer_type,
            "timestamp": Utc::now().to_rfc3339(),
            "results": results.iter().map(|r| json!({
                "id": r.id,
                "patient_id": r.patient_id,
                "patient_name": names.get(&r.patient_id).cloned().unwrap_or_default(),
                "test_code": r.test_code,
                "value": r.value,
                "unit": r.unit,
                "flags": r.flags,
                "timestamp": r.timestamp.to_rfc3339(),
            })).collect::<Vec<_>>(),
        }))
    }

    async fn send(&self, payload: &serde_json::Value) -> Result<()> {
        let url = self.config.endpoint();
        let request = match self.config.method {
            SyncMethod::Post => self.client.post(&url),
            SyncMethod::Put => self.client.put(&url),
            SyncMethod::Patch => self.client.patch(&url),
        };
        let request = self.auth.apply(&self.client, request).await?;
        let response = request.json(payload).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(LinkError::Sync(format!("remote returned {status}")))
        }
    }

    fn record(&self, status: AttemptStatus, message: &str, count: usize) {
        if let Err(e) = self.store.record_sync_attempt(status, message, count) {
            warn!(error = %e, "Sync attempt audit write failed");
        }
    }
}
