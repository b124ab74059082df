//! Tamper-evident audit ledger.
//!
//! Events are signed with HMAC-SHA256 and appended to one in-memory buffer.
//! The buffer lock is only held to append or to take a batch; sink writes
//! run under a separate flush lock, and a batch the sink rejects goes back
//! to the front of the buffer before any backoff sleep. Appends therefore
//! never wait on a slow or failing sink.
//!
//! Persistence failures never reach callers of [`AuditLedger::log_event`].
//! They are logged on the `kidsafe::audit::fallback` target, retried with
//! backoff, and on exhaustion recorded as a CRITICAL `audit_flush_failed`
//! event in the in-memory fallback sink.

pub mod event;
pub mod integrity;
pub mod query;
pub mod sink;

pub use event::{AuditEvent, EventCategory, EventContext, Severity};
pub use integrity::{IntegritySigner, VerificationReport};
pub use query::AuditQuery;
pub use sink::{AuditSink, JsonlFileSink, MemorySink};

use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::LedgerConfig;
use crate::error::{ConfigError, IntegrityError, StorageError};
use crate::types::{SafetyAnalysisResult, SafetyCategory};

const FALLBACK_TARGET: &str = "kidsafe::audit::fallback";

#[derive(Debug, Default)]
struct LedgerCounters {
    logged: AtomicU64,
    flushed: AtomicU64,
    flush_failures: AtomicU64,
    escalations: AtomicU64,
    rotated: AtomicU64,
}

/// Point-in-time ledger counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStats {
    pub events_logged: u64,
    pub events_flushed: u64,
    pub flush_failures: u64,
    pub escalations: u64,
    pub segments_rotated: u64,
    pub pending: usize,
}

pub struct AuditLedger {
    config: LedgerConfig,
    signer: Option<IntegritySigner>,
    sink: Arc<dyn AuditSink>,
    fallback: Arc<MemorySink>,
    buffer: Mutex<Vec<AuditEvent>>,
    /// Serializes sink writes so batches land in log order.
    flush_lock: Mutex<()>,
    flush_needed: Notify,
    counters: LedgerCounters,
}

impl std::fmt::Debug for AuditLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLedger")
            .field("batch_size", &self.config.batch_size)
            .field("signed", &self.signer.is_some())
            .finish_non_exhaustive()
    }
}

impl AuditLedger {
    pub fn new(config: &LedgerConfig, sink: Arc<dyn AuditSink>) -> Result<Self, ConfigError> {
        config.validate()?;
        let signer = config
            .hmac_secret
            .as_deref()
            .map(|secret| IntegritySigner::new(secret.as_bytes()))
            .transpose()?;
        if signer.is_none() {
            warn!("Audit ledger running without an HMAC secret; events will not be signed");
        }
        Ok(Self {
            config: config.clone(),
            signer,
            sink,
            fallback: Arc::new(MemorySink::new()),
            buffer: Mutex::new(Vec::with_capacity(config.batch_size)),
            flush_lock: Mutex::new(()),
            flush_needed: Notify::new(),
            counters: LedgerCounters::default(),
        })
    }

    /// Build the sink from config: daily JSONL files under `log_dir`, or an
    /// in-memory sink when no directory is configured.
    pub fn from_config(config: &LedgerConfig) -> crate::error::Result<Self> {
        let sink: Arc<dyn AuditSink> = match &config.log_dir {
            Some(dir) => Arc::new(JsonlFileSink::new(dir)?),
            None => Arc::new(MemorySink::new()),
        };
        Ok(Self::new(config, sink)?)
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn signer(&self) -> Option<&IntegritySigner> {
        self.signer.as_ref()
    }

    /// Append an event and return its id.
    ///
    /// `ERROR` and `CRITICAL` events are flushed before this returns. A failed
    /// write is reported on the fallback target; the id is returned anyway.
    pub async fn log_event(
        &self,
        event_type: &str,
        severity: Severity,
        category: EventCategory,
        description: &str,
        context: EventContext,
        details: BTreeMap<String, Value>,
    ) -> Uuid {
        self.record_event(event_type, severity, category, description, context, details)
            .await
            .event_id
    }

    /// Like [`AuditLedger::log_event`], returning the stored event itself.
    pub async fn record_event(
        &self,
        event_type: &str,
        severity: Severity,
        category: EventCategory,
        description: &str,
        context: EventContext,
        details: BTreeMap<String, Value>,
    ) -> AuditEvent {
        let event = self.build_event(event_type, severity, category, description, context, details);
        self.counters.logged.fetch_add(1, Ordering::Relaxed);

        let pending = {
            let mut buffer = self.buffer.lock().await;
            buffer.push(event.clone());
            buffer.len()
        };

        if severity.requires_immediate_flush() {
            if let Err(e) = self.flush_with_retries(1).await {
                self.fallback_line(&event, &e);
                let pending = self.buffer.lock().await.len();
                self.escalate(&e, pending).await;
            }
        } else if pending >= self.config.batch_size {
            debug!(pending, "Audit buffer reached batch size");
            self.flush_needed.notify_one();
        }
        event
    }

    fn build_event(
        &self,
        event_type: &str,
        severity: Severity,
        category: EventCategory,
        description: &str,
        context: EventContext,
        details: BTreeMap<String, Value>,
    ) -> AuditEvent {
        let timestamp = Utc::now();
        let mut event = AuditEvent {
            event_id: Uuid::new_v4(),
            timestamp,
            event_type: event_type.to_string(),
            severity,
            category,
            description: description.to_string(),
            context,
            details,
            integrity_hash: None,
            retention_date: timestamp + ChronoDuration::days(i64::from(self.config.retention_days)),
        };
        if let Some(signer) = &self.signer {
            match signer.sign(&event) {
                Ok(hash) => event.integrity_hash = Some(hash),
                Err(e) => warn!(
                    target: FALLBACK_TARGET,
                    event_id = %event.event_id,
                    error = %e,
                    "Failed to sign audit event"
                ),
            }
        }
        event
    }

    /// One write attempt: take everything buffered, hand it to the sink
    /// without holding the buffer lock, and requeue it in front of newer
    /// events if the sink rejects it.
    async fn flush_once(&self) -> Result<usize, StorageError> {
        let _writer = self.flush_lock.lock().await;
        let batch = std::mem::take(&mut *self.buffer.lock().await);
        if batch.is_empty() {
            return Ok(0);
        }
        match self.sink.write_batch(&batch).await {
            Ok(()) => {
                let count = batch.len();
                self.counters
                    .flushed
                    .fetch_add(count as u64, Ordering::Relaxed);
                debug!(count, "Flushed audit batch");
                Ok(count)
            }
            Err(e) => {
                self.counters.flush_failures.fetch_add(1, Ordering::Relaxed);
                let mut buffer = self.buffer.lock().await;
                let newer = std::mem::replace(&mut *buffer, batch);
                buffer.extend(newer);
                Err(e)
            }
        }
    }

    /// Flush with up to `attempts` write attempts and doubling backoff. No
    /// lock is held while sleeping between attempts.
    async fn flush_with_retries(&self, attempts: u32) -> Result<usize, StorageError> {
        let mut delay = Duration::from_millis(self.config.retry_backoff_ms);
        let mut attempt = 1;
        loop {
            match self.flush_once().await {
                Ok(count) => return Ok(count),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    warn!(
                        attempt,
                        attempts,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Audit flush failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
            }
        }
    }

    /// Flush everything pending, with the configured retry policy. On
    /// exhaustion the failure is escalated and the events stay buffered.
    pub async fn flush(&self) -> Result<usize, StorageError> {
        let attempts = self.config.max_flush_retries.saturating_add(1);
        match self.flush_with_retries(attempts).await {
            Ok(count) => Ok(count),
            Err(e) => {
                let pending = self.buffer.lock().await.len();
                error!(
                    target: FALLBACK_TARGET,
                    pending,
                    error = %e,
                    "Audit flush failed after retries"
                );
                self.escalate(&e, pending).await;
                Err(e)
            }
        }
    }

    fn fallback_line(&self, event: &AuditEvent, e: &StorageError) {
        error!(
            target: FALLBACK_TARGET,
            event_id = %event.event_id,
            event_type = %event.event_type,
            severity = %event.severity,
            error = %e,
            "Audit event not yet durable"
        );
    }

    async fn escalate(&self, e: &StorageError, pending: usize) {
        self.counters.escalations.fetch_add(1, Ordering::Relaxed);
        let details = BTreeMap::from([
            ("error".to_string(), json!(e.to_string())),
            ("pending_events".to_string(), json!(pending)),
        ]);
        let event = self.build_event(
            "audit_flush_failed",
            Severity::Critical,
            EventCategory::System,
            "Audit ledger could not persist pending events",
            EventContext::default(),
            details,
        );
        // The memory sink is infallible.
        let _ = self.fallback.write_batch(std::slice::from_ref(&event)).await;
    }

    /// Delete persisted segments older than `retention_days`. The buffer is
    /// never touched.
    pub async fn rotate(&self) -> Result<usize, StorageError> {
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(self.config.retention_days));
        let removed = self.sink.purge_before(cutoff).await?;
        self.fallback.purge_before(cutoff).await?;
        self.counters
            .rotated
            .fetch_add(removed as u64, Ordering::Relaxed);
        if removed > 0 {
            info!(removed, cutoff = %cutoff, "Rotated expired audit segments");
        }
        Ok(removed)
    }

    /// Spawn the periodic flush loop and the rotation loop.
    pub fn start(self: &Arc<Self>) -> LedgerHandle {
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let ledger = Arc::clone(self);
        let mut flush_cancel = cancel_rx.clone();
        let flush_task = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(ledger.config.flush_interval_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = ledger.flush_needed.notified() => {}
                    _ = flush_cancel.changed() => break,
                }
                // Failures are already escalated inside `flush`.
                let _ = ledger.flush().await;
            }
            debug!("Audit flush loop stopped");
        });

        let ledger = Arc::clone(self);
        let mut rotation_cancel = cancel_rx;
        let rotation_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(
                ledger.config.rotation_interval_secs,
            ));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = rotation_cancel.changed() => break,
                }
                if let Err(e) = ledger.rotate().await {
                    warn!(error = %e, "Audit rotation failed");
                }
            }
            debug!("Audit rotation loop stopped");
        });

        info!(
            batch_size = self.config.batch_size,
            flush_interval_ms = self.config.flush_interval_ms,
            "Audit ledger started"
        );
        LedgerHandle {
            cancel_tx,
            flush_task,
            rotation_task,
            ledger: Arc::clone(self),
        }
    }

    /// Safety decision record. Severity is CRITICAL when a personal-info or
    /// contact rule fired, WARNING when the content was rejected, else INFO.
    pub async fn log_safety_decision(
        &self,
        result: &SafetyAnalysisResult,
        context: EventContext,
    ) -> Uuid {
        let severity = if result.flagged(SafetyCategory::PersonalInfo)
            || result.flagged(SafetyCategory::InappropriateContact)
        {
            Severity::Critical
        } else if !result.is_appropriate() {
            Severity::Warning
        } else {
            Severity::Info
        };
        let scores: BTreeMap<String, f64> = result
            .category_scores()
            .iter()
            .map(|(c, s)| (c.to_string(), *s))
            .collect();
        let details = BTreeMap::from([
            ("risk_level".to_string(), json!(result.risk_level())),
            ("risk_score".to_string(), json!(result.risk_score())),
            ("is_appropriate".to_string(), json!(result.is_appropriate())),
            ("confidence".to_string(), json!(result.confidence())),
            ("violations".to_string(), json!(result.violations())),
            ("category_scores".to_string(), json!(scores)),
        ]);
        let description = format!("Content classified as {}", result.risk_level());
        self.log_event(
            "safety_decision",
            severity,
            EventCategory::ContentSafety,
            &description,
            context,
            details,
        )
        .await
    }

    pub async fn log_consent_event(
        &self,
        child_id: &str,
        action: &str,
        severity: Severity,
        details: BTreeMap<String, Value>,
    ) -> Uuid {
        self.log_event(
            &format!("consent_{}", action),
            severity,
            EventCategory::Consent,
            &format!("Consent {} for child", action),
            EventContext::for_child(child_id),
            details,
        )
        .await
    }

    pub async fn log_data_access(&self, child_id: &str, operation: &str, fields: &[String]) -> Uuid {
        let details = BTreeMap::from([
            ("operation".to_string(), json!(operation)),
            ("fields".to_string(), json!(fields)),
        ]);
        self.log_event(
            "data_access",
            Severity::Info,
            EventCategory::DataAccess,
            &format!("Child data {}", operation),
            EventContext::for_child(child_id),
            details,
        )
        .await
    }

    pub fn verify_integrity(&self, event: &AuditEvent) -> bool {
        self.verify_event(event).is_ok()
    }

    pub fn verify_event(&self, event: &AuditEvent) -> Result<(), IntegrityError> {
        self.signer
            .as_ref()
            .ok_or(IntegrityError::NoSecret)?
            .verify(event)
    }

    /// Events accepted but not yet durable.
    pub async fn pending_events(&self) -> Vec<AuditEvent> {
        self.buffer.lock().await.clone()
    }

    /// Escalation records written after flush failures.
    pub fn fallback_events(&self) -> Vec<AuditEvent> {
        self.fallback.events()
    }

    pub async fn stats(&self) -> LedgerStats {
        LedgerStats {
            events_logged: self.counters.logged.load(Ordering::Relaxed),
            events_flushed: self.counters.flushed.load(Ordering::Relaxed),
            flush_failures: self.counters.flush_failures.load(Ordering::Relaxed),
            escalations: self.counters.escalations.load(Ordering::Relaxed),
            segments_rotated: self.counters.rotated.load(Ordering::Relaxed),
            pending: self.buffer.lock().await.len(),
        }
    }
}

/// Running background tasks of a started ledger.
pub struct LedgerHandle {
    cancel_tx: watch::Sender<bool>,
    flush_task: JoinHandle<()>,
    rotation_task: JoinHandle<()>,
    ledger: Arc<AuditLedger>,
}

impl LedgerHandle {
    pub fn ledger(&self) -> &Arc<AuditLedger> {
        &self.ledger
    }

    /// Stop both loops and flush whatever is still buffered.
    pub async fn shutdown(self) -> Result<usize, StorageError> {
        info!("Stopping audit ledger");
        let _ = self.cancel_tx.send(true);
        let timeout = Duration::from_secs(10);
        let _ = tokio::time::timeout(timeout, self.flush_task).await;
        let _ = tokio::time::timeout(timeout, self.rotation_task).await;
        let flushed = self.ledger.flush().await?;
        info!(flushed, "Audit ledger stopped");
        Ok(flushed)
    }
}
