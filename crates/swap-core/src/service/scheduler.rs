//! # Claim Scheduler
//!
//! Priority-ordered, bounded-concurrency execution of ready claims.
//!
//! ## Tick
//!
//! 1. Abandon claims whose deadline passed or whose retry budget is spent.
//! 2. Refresh priorities (minutes to deadline) and order `ready` claims,
//!    soonest deadline first.
//! 3. For each, take a semaphore permit without waiting; stop when none is
//!    free. Flip the claim `ready → claiming` through the repository; a claim
//!    that is no longer `ready` is skipped. `claiming` is the per-claim lock.
//! 4. Execute on a spawned task holding the permit.
//!
//! ## Failure
//!
//! Fatal and non-retryable errors abandon the claim. Otherwise the claim
//! moves to `backoff` and a per-claim timer (`base * 2^(retry - 1)`, capped)
//! returns it to `ready`. Each failure replaces the claim's timer; there is
//! never more than one pending timer per claim. Once stopped, failures of
//! claims still in flight leave them in `backoff` with no timer; recovery on
//! the next start returns them to `ready`.
//!
//! Secrets are stored sealed and only unsealed inside the worker.

use super::events::EventBus;
use super::task::ScheduledTask;
use crate::algorithms::{SecretSealer, SecretVault};
use crate::domain::{
    unix_now, ClaimKind, ClaimStatus, ClaimTarget, Hash, PendingClaim, SchedulerConfig, SecureSecret, SwapError,
    SwapEvent,
};
use crate::ports::{ClaimExecutor, ClaimOutcome, Repository};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// What one tick did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Claims dispatched, in dispatch order.
    pub dispatched: Vec<String>,
    /// Claims abandoned by the sweep.
    pub abandoned: Vec<String>,
}

/// Bounded-concurrency claim worker pool.
pub struct ClaimScheduler {
    claims: Arc<dyn Repository<PendingClaim>>,
    executors: HashMap<ClaimKind, Arc<dyn ClaimExecutor>>,
    sealer: Arc<SecretSealer>,
    events: Arc<EventBus>,
    config: SchedulerConfig,
    semaphore: Arc<Semaphore>,
    timers: Mutex<HashMap<String, ScheduledTask>>,
    ticker: Mutex<Option<ScheduledTask>>,
    stopped: AtomicBool,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ClaimScheduler {
    /// Scheduler with no executors registered.
    pub fn new(
        claims: Arc<dyn Repository<PendingClaim>>,
        sealer: Arc<SecretSealer>,
        events: Arc<EventBus>,
        config: SchedulerConfig,
    ) -> Result<Self, SwapError> {
        config
            .validate()
            .map_err(|e| SwapError::InvalidParameter(e.to_string()))?;
        Ok(Self {
            claims,
            executors: HashMap::new(),
            sealer,
            events,
            semaphore: Arc::new(Semaphore::new(config.concurrent_claims)),
            config,
            timers: Mutex::new(HashMap::new()),
            ticker: Mutex::new(None),
            stopped: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        })
    }

    /// Route claims of `kind` to `executor`.
    pub fn with_executor(mut self, kind: ClaimKind, executor: Arc<dyn ClaimExecutor>) -> Self {
        self.executors.insert(kind, executor);
        self
    }

    /// Scheduler configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Sealing key holder.
    pub fn sealer(&self) -> &Arc<SecretSealer> {
        &self.sealer
    }

    // -------------------------------------------------------------------------
    // Queue
    // -------------------------------------------------------------------------

    /// Queue a claim; `ready` when the secret is supplied, else `pending`.
    pub fn enqueue(
        &self,
        target: ClaimTarget,
        secret_hash: Hash,
        secret: Option<&SecureSecret>,
        deadline: u64,
    ) -> Result<PendingClaim, SwapError> {
        let sealed = match secret {
            Some(secret) => {
                SecretVault::ensure_valid(secret, &secret_hash)?;
                Some(self.sealer.seal(secret)?)
            }
            None => None,
        };
        self.submit(PendingClaim::new(target, secret_hash, sealed, deadline, self.config.max_retries))
    }

    /// Queue a fully formed claim.
    pub fn submit(&self, claim: PendingClaim) -> Result<PendingClaim, SwapError> {
        let now = unix_now();
        if claim.is_expired(now) {
            return Err(SwapError::TimelockExpired {
                current: now,
                timelock: claim.timelock,
            });
        }
        if !self.executors.contains_key(&claim.target.kind()) {
            return Err(SwapError::InvalidParameter(format!(
                "no executor registered for {:?} claims",
                claim.target.kind()
            )));
        }
        self.claims.put(claim.clone())?;
        info!(claim_id = %claim.id, status = %claim.status, priority = claim.priority, "[scheduler] claim queued");
        if claim.status == ClaimStatus::Ready {
            self.events.publish(SwapEvent::ClaimReady {
                claim_id: claim.id.clone(),
            });
        }
        Ok(claim)
    }

    /// Supply the secret for a `pending` claim, checked against its hash-lock.
    pub fn reveal_secret(&self, claim_id: &str, secret: &SecureSecret) -> Result<PendingClaim, SwapError> {
        let claim = self.claims.require(claim_id)?;
        SecretVault::ensure_valid(secret, &claim.secret_hash)?;
        let sealed = self.sealer.seal(secret)?;
        let updated = self.claims.update(claim_id, &mut |c| {
            if c.status != ClaimStatus::Pending {
                return Err(SwapError::InvalidTransition {
                    from: c.status.to_string(),
                    to: ClaimStatus::Ready.to_string(),
                });
            }
            c.secret = Some(sealed.clone());
            c.set_status(ClaimStatus::Ready);
            Ok(())
        })?;
        info!(claim_id = %claim_id, "[scheduler] secret revealed, claim ready");
        self.events.publish(SwapEvent::ClaimReady {
            claim_id: claim_id.to_string(),
        });
        Ok(updated)
    }

    /// Reveal `secret` to every pending claim locked to its hash.
    pub fn reveal_secret_for_hash(&self, secret: &SecureSecret) -> Result<Vec<String>, SwapError> {
        let hash = SecretVault::hash_lock(secret.as_bytes());
        let mut revealed = Vec::new();
        for claim in self.claims.list()? {
            if claim.status == ClaimStatus::Pending && claim.secret_hash == hash {
                self.reveal_secret(&claim.id, secret)?;
                revealed.push(claim.id);
            }
        }
        Ok(revealed)
    }

    /// Claim by id.
    pub fn get(&self, claim_id: &str) -> Result<PendingClaim, SwapError> {
        self.claims.require(claim_id)
    }

    /// Return claims interrupted by a restart (`claiming`, `backoff`) to `ready`.
    pub fn recover_interrupted(&self) -> Result<usize, SwapError> {
        let mut recovered = 0;
        for claim in self.claims.list()? {
            if matches!(claim.status, ClaimStatus::Claiming | ClaimStatus::Backoff) {
                self.claims.update(&claim.id, &mut |c| {
                    c.set_status(ClaimStatus::Ready);
                    Ok(())
                })?;
                recovered += 1;
            }
        }
        if recovered > 0 {
            warn!("[scheduler] recovered {} interrupted claim(s)", recovered);
        }
        Ok(recovered)
    }

    /// Delete terminal claims last touched more than `cleanup_age_secs` before `now`.
    pub fn cleanup(&self, now: u64) -> Result<usize, SwapError> {
        let mut removed = 0;
        for claim in self.claims.list()? {
            if claim.status.is_terminal()
                && claim.updated_at.saturating_add(self.config.cleanup_age_secs) <= now
                && self.claims.delete(&claim.id)?
            {
                self.cancel_timer(&claim.id);
                removed += 1;
            }
        }
        if removed > 0 {
            debug!("[scheduler] cleaned up {} claim(s)", removed);
        }
        Ok(removed)
    }

    // -------------------------------------------------------------------------
    // Dispatch
    // -------------------------------------------------------------------------

    /// Run one scheduling pass.
    pub fn tick(self: &Arc<Self>) -> Result<TickReport, SwapError> {
        let now = unix_now();
        let mut report = TickReport::default();
        let mut ready = Vec::new();

        for claim in self.claims.list()? {
            if claim.status.is_terminal() || claim.status == ClaimStatus::Claiming {
                continue;
            }
            if claim.is_expired(now) || !claim.has_budget() {
                let reason = if claim.is_expired(now) {
                    "deadline passed"
                } else {
                    "retry budget exhausted"
                };
                if self.abandon(&claim.id, reason)? {
                    report.abandoned.push(claim.id);
                }
                continue;
            }
            if claim.status == ClaimStatus::Ready {
                ready.push(claim);
            }
        }

        for claim in &mut ready {
            claim.refresh_priority(now);
        }
        ready.sort_by(|a, b| {
            (a.priority, a.timelock, a.created_at).cmp(&(b.priority, b.timelock, b.created_at))
        });

        for claim in ready {
            let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
                debug!("[scheduler] all {} slots busy", self.config.concurrent_claims);
                break;
            };
            let priority = claim.priority;
            let gated = self.claims.update(&claim.id, &mut |c| {
                if c.status != ClaimStatus::Ready {
                    return Err(SwapError::InvalidTransition {
                        from: c.status.to_string(),
                        to: ClaimStatus::Claiming.to_string(),
                    });
                }
                c.priority = priority;
                c.set_status(ClaimStatus::Claiming);
                Ok(())
            });
            let claim = match gated {
                Ok(claim) => claim,
                Err(e) => {
                    debug!(claim_id = %claim.id, "[scheduler] skipped: {}", e);
                    continue;
                }
            };

            info!(claim_id = %claim.id, priority, "[scheduler] dispatching claim");
            self.events.publish(SwapEvent::ClaimDispatched {
                claim_id: claim.id.clone(),
                priority,
            });
            report.dispatched.push(claim.id.clone());

            let this = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                this.enter();
                let result = this.execute(&claim).await;
                this.leave();
                if let Err(e) = this.finish(&claim, result) {
                    error!(claim_id = %claim.id, "[scheduler] failed to record claim result: {}", e);
                }
            });
        }
        Ok(report)
    }

    async fn execute(&self, claim: &PendingClaim) -> Result<ClaimOutcome, SwapError> {
        let sealed = claim.secret.as_ref().ok_or(SwapError::InvalidSecret)?;
        let secret = self
            .sealer
            .unseal(sealed)
            .map_err(|e| SwapError::InvalidParameter(format!("sealed secret unreadable: {e}")))?;
        SecretVault::ensure_valid(&secret, &claim.secret_hash)?;
        let executor = self.executors.get(&claim.target.kind()).ok_or_else(|| {
            SwapError::InvalidParameter(format!("no executor for {:?}", claim.target.kind()))
        })?;
        if self.config.dry_run {
            executor.simulate(claim, &secret).await
        } else {
            executor.execute(claim, &secret).await
        }
    }

    fn finish(self: &Arc<Self>, claim: &PendingClaim, result: Result<ClaimOutcome, SwapError>) -> Result<(), SwapError> {
        let error = match result {
            Ok(outcome) => {
                self.claims.update(&claim.id, &mut |c| {
                    c.txid = outcome.txid.clone();
                    c.last_error = None;
                    c.set_status(ClaimStatus::Completed);
                    Ok(())
                })?;
                info!(
                    claim_id = %claim.id,
                    txid = ?outcome.txid,
                    simulated = outcome.simulated,
                    "[scheduler] claim completed"
                );
                self.events.publish(SwapEvent::ClaimSucceeded {
                    claim_id: claim.id.clone(),
                    txid: outcome.txid,
                    simulated: outcome.simulated,
                });
                return Ok(());
            }
            Err(e) => e,
        };

        let message = error.to_string();
        let now = unix_now();
        let updated = self.claims.update(&claim.id, &mut |c| {
            c.retry_count += 1;
            c.last_error = Some(message.clone());
            c.set_status(ClaimStatus::Backoff);
            Ok(())
        })?;
        warn!(claim_id = %claim.id, retry = updated.retry_count, "[scheduler] claim failed: {}", message);
        self.events.publish(SwapEvent::ClaimFailed {
            claim_id: claim.id.clone(),
            retry_count: updated.retry_count,
            error: message.clone(),
        });

        let reason = if error.is_fatal() || !error.is_retryable() {
            Some(format!("unrecoverable: {message}"))
        } else if !updated.has_budget() {
            Some("retry budget exhausted".to_string())
        } else if updated.is_expired(now) {
            Some("deadline passed".to_string())
        } else {
            None
        };
        match reason {
            Some(reason) => {
                self.abandon(&claim.id, &reason)?;
            }
            None => self.schedule_retry(&claim.id, self.backoff_delay(updated.retry_count)),
        }
        Ok(())
    }

    fn abandon(&self, claim_id: &str, reason: &str) -> Result<bool, SwapError> {
        let mut changed = false;
        self.claims.update(claim_id, &mut |c| {
            if !c.status.is_terminal() {
                c.set_status(ClaimStatus::Failed);
                if c.last_error.is_none() {
                    c.last_error = Some(reason.to_string());
                }
                changed = true;
            }
            Ok(())
        })?;
        self.cancel_timer(claim_id);
        if changed {
            warn!(claim_id = %claim_id, "[scheduler] claim abandoned: {}", reason);
            self.events.publish(SwapEvent::ClaimAbandoned {
                claim_id: claim_id.to_string(),
                reason: reason.to_string(),
            });
        }
        Ok(changed)
    }

    /// `base * 2^(retry - 1)`, capped at `max_delay_ms`.
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(31);
        let delay = self.config.base_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.config.max_delay_ms))
    }

    fn schedule_retry(self: &Arc<Self>, claim_id: &str, delay: Duration) {
        // Checked under the timers lock so `stop` cannot miss a timer.
        let mut timers = self.timers.lock();
        if self.stopped.load(Ordering::SeqCst) {
            debug!(claim_id = %claim_id, "[scheduler] stopped, claim left in backoff");
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let id = claim_id.to_string();
        let task = ScheduledTask::after(format!("claim-retry-{claim_id}"), delay, async move {
            if let Some(this) = weak.upgrade() {
                this.retry_due(&id);
            }
        });
        debug!(claim_id = %claim_id, ?delay, "[scheduler] retry scheduled");
        if let Some(previous) = timers.insert(claim_id.to_string(), task) {
            previous.stop();
        }
    }

    fn retry_due(&self, claim_id: &str) {
        let result = self.claims.update(claim_id, &mut |c| {
            if c.status == ClaimStatus::Backoff {
                c.set_status(ClaimStatus::Ready);
            }
            Ok(())
        });
        match result {
            Ok(claim) if claim.status == ClaimStatus::Ready => {
                debug!(claim_id = %claim_id, "[scheduler] back-off elapsed");
                self.events.publish(SwapEvent::ClaimReady {
                    claim_id: claim_id.to_string(),
                });
            }
            Ok(_) => {}
            Err(e) => warn!(claim_id = %claim_id, "[scheduler] retry timer: {}", e),
        }
        self.timers.lock().remove(claim_id);
    }

    fn cancel_timer(&self, claim_id: &str) {
        if let Some(timer) = self.timers.lock().remove(claim_id) {
            timer.stop();
        }
    }

    fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// Claims executing right now.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest concurrent execution count observed.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Pending back-off timers.
    pub fn pending_timers(&self) -> usize {
        self.timers.lock().len()
    }

    /// Wait until no claim is executing.
    pub async fn wait_idle(&self) {
        let slots = self.config.concurrent_claims as u32;
        if let Ok(permits) = self.semaphore.acquire_many(slots).await {
            drop(permits);
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Tick every `tick_interval_ms` until stopped.
    pub fn start(self: &Arc<Self>) {
        self.stopped.store(false, Ordering::SeqCst);
        let weak: Weak<Self> = Arc::downgrade(self);
        let task = ScheduledTask::every(
            "claim-scheduler",
            Duration::from_millis(self.config.tick_interval_ms),
            move || {
                let weak = weak.clone();
                async move {
                    let Some(this) = weak.upgrade() else {
                        return;
                    };
                    if let Err(e) = this.tick() {
                        error!("[scheduler] tick failed: {}", e);
                    }
                }
            },
        );
        if let Some(previous) = self.ticker.lock().replace(task) {
            previous.stop();
        }
        info!(
            slots = self.config.concurrent_claims,
            dry_run = self.config.dry_run,
            "[scheduler] started"
        );
    }

    /// Stop ticking and cancel every back-off timer. Claims still executing
    /// finish, but a failure no longer schedules a retry.
    pub fn stop(&self) {
        if let Some(ticker) = self.ticker.lock().take() {
            ticker.stop();
        }
        let timers: Vec<ScheduledTask> = {
            let mut timers = self.timers.lock();
            self.stopped.store(true, Ordering::SeqCst);
            timers.drain().map(|(_, t)| t).collect()
        };
        for timer in &timers {
            timer.stop();
        }
        info!(cancelled = timers.len(), "[scheduler] stopped");
    }

    /// Tick loop alive.
    pub fn is_running(&self) -> bool {
        self.ticker
            .lock()
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for ClaimScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryRepository;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    const SECRET: [u8; 32] = [0x07; 32];

    /// Fails the first `failures` calls with `error`, then succeeds.
    struct ScriptedExecutor {
        calls: AtomicU32,
        failures: u32,
        error: fn() -> SwapError,
        latency: Duration,
        order: Mutex<Vec<String>>,
    }

    impl ScriptedExecutor {
        fn new(failures: u32, error: fn() -> SwapError) -> Arc<Self> {
            Self::slow(failures, error, Duration::ZERO)
        }

        fn slow(failures: u32, error: fn() -> SwapError, latency: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                failures,
                error,
                latency,
                order: Mutex::new(Vec::new()),
            })
        }
    }

    fn broadcast_failure() -> SwapError {
        SwapError::TransactionBroadcastFailed {
            attempts: 1,
            errors: vec!["sim: HTTP 503".into()],
            last_error: "sim: HTTP 503".into(),
        }
    }

    #[async_trait]
    impl ClaimExecutor for ScriptedExecutor {
        async fn execute(&self, claim: &PendingClaim, secret: &SecureSecret) -> Result<ClaimOutcome, SwapError> {
            assert_eq!(secret.as_bytes(), &SECRET);
            self.order.lock().push(claim.id.clone());
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err((self.error)());
            }
            Ok(ClaimOutcome {
                txid: Some(format!("tx-{}", claim.id)),
                fee: Some(1_000),
                simulated: false,
            })
        }

        async fn simulate(&self, _claim: &PendingClaim, _secret: &SecureSecret) -> Result<ClaimOutcome, SwapError> {
            Ok(ClaimOutcome {
                txid: Some("would-be".into()),
                fee: Some(1_000),
                simulated: true,
            })
        }
    }

    fn scheduler(executor: Arc<ScriptedExecutor>, config: SchedulerConfig) -> Arc<ClaimScheduler> {
        Arc::new(
            ClaimScheduler::new(
                Arc::new(InMemoryRepository::<PendingClaim>::new()),
                Arc::new(SecretSealer::generate()),
                Arc::new(EventBus::new()),
                config,
            )
            .unwrap()
            .with_executor(ClaimKind::Escrow, executor),
        )
    }

    fn target(n: u32) -> ClaimTarget {
        ClaimTarget::Escrow {
            escrow_id: format!("escrow-{n}"),
        }
    }

    fn hash() -> Hash {
        SecretVault::hash_lock(&SECRET)
    }

    #[tokio::test]
    async fn test_ready_claim_completes() {
        let executor = ScriptedExecutor::new(0, broadcast_failure);
        let s = scheduler(executor.clone(), SchedulerConfig::default());
        let claim = s
            .enqueue(target(1), hash(), Some(&SecureSecret::new(SECRET)), unix_now() + 3600)
            .unwrap();
        assert_eq!(claim.status, ClaimStatus::Ready);
        assert!(claim.secret.is_some());

        let report = s.tick().unwrap();
        assert_eq!(report.dispatched, vec![claim.id.clone()]);
        s.wait_idle().await;
        let done = s.get(&claim.id).unwrap();
        assert_eq!(done.status, ClaimStatus::Completed);
        assert_eq!(done.txid, Some(format!("tx-{}", claim.id)));
    }

    #[tokio::test]
    async fn test_enqueue_rejects_wrong_secret_and_expired() {
        let s = scheduler(ScriptedExecutor::new(0, broadcast_failure), SchedulerConfig::default());
        assert!(matches!(
            s.enqueue(target(1), hash(), Some(&SecureSecret::new([0x08; 32])), unix_now() + 60),
            Err(SwapError::InvalidSecret)
        ));
        assert!(matches!(
            s.enqueue(target(1), hash(), None, unix_now().saturating_sub(1)),
            Err(SwapError::TimelockExpired { .. })
        ));
        let unrouted = PendingClaim::new(
            ClaimTarget::ScriptChain { htlc_id: "h".into() },
            hash(),
            None,
            unix_now() + 60,
            3,
        );
        assert!(s.submit(unrouted).is_err());
    }

    #[tokio::test]
    async fn test_pending_waits_for_secret() {
        let s = scheduler(ScriptedExecutor::new(0, broadcast_failure), SchedulerConfig::default());
        let claim = s.enqueue(target(1), hash(), None, unix_now() + 3600).unwrap();
        assert_eq!(claim.status, ClaimStatus::Pending);
        assert!(s.tick().unwrap().dispatched.is_empty());

        assert!(matches!(
            s.reveal_secret(&claim.id, &SecureSecret::new([0x09; 32])),
            Err(SwapError::InvalidSecret)
        ));
        let revealed = s.reveal_secret_for_hash(&SecureSecret::new(SECRET)).unwrap();
        assert_eq!(revealed, vec![claim.id.clone()]);
        assert_eq!(s.tick().unwrap().dispatched, vec![claim.id]);
        s.wait_idle().await;
    }

    #[tokio::test]
    async fn test_priority_orders_soonest_deadline_first() {
        let executor = ScriptedExecutor::new(0, broadcast_failure);
        let s = scheduler(
            executor.clone(),
            SchedulerConfig {
                concurrent_claims: 1,
                ..Default::default()
            },
        );
        let now = unix_now();
        let secret = SecureSecret::new(SECRET);
        let t3 = s.enqueue(target(3), hash(), Some(&secret), now + 3 * 3600).unwrap();
        let t1 = s.enqueue(target(1), hash(), Some(&secret), now + 3600).unwrap();
        let t2 = s.enqueue(target(2), hash(), Some(&secret), now + 2 * 3600).unwrap();

        for _ in 0..3 {
            s.tick().unwrap();
            s.wait_idle().await;
        }
        assert_eq!(*executor.order.lock(), vec![t1.id, t2.id, t3.id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_replaces_timer_and_retries() {
        let executor = ScriptedExecutor::new(2, broadcast_failure);
        let s = scheduler(
            executor.clone(),
            SchedulerConfig {
                base_delay_ms: 1_000,
                ..Default::default()
            },
        );
        let claim = s
            .enqueue(target(1), hash(), Some(&SecureSecret::new(SECRET)), unix_now() + 3600)
            .unwrap();

        s.tick().unwrap();
        s.wait_idle().await;
        let after_first = s.get(&claim.id).unwrap();
        assert_eq!(after_first.status, ClaimStatus::Backoff);
        assert_eq!(after_first.retry_count, 1);
        assert_eq!(s.pending_timers(), 1);
        assert!(s.tick().unwrap().dispatched.is_empty());

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(s.get(&claim.id).unwrap().status, ClaimStatus::Ready);
        s.tick().unwrap();
        s.wait_idle().await;
        assert_eq!(s.get(&claim.id).unwrap().retry_count, 2);
        assert_eq!(s.pending_timers(), 1);

        // Second back-off is 2s.
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(s.get(&claim.id).unwrap().status, ClaimStatus::Backoff);
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        s.tick().unwrap();
        s.wait_idle().await;
        assert_eq!(s.get(&claim.id).unwrap().status, ClaimStatus::Completed);
        assert_eq!(s.pending_timers(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_budget_abandons() {
        let executor = ScriptedExecutor::new(u32::MAX, broadcast_failure);
        let s = scheduler(executor.clone(), SchedulerConfig::default());
        let sealed = s.sealer().seal(&SecureSecret::new(SECRET)).unwrap();
        let mut claim = PendingClaim::new(target(1), hash(), Some(sealed), unix_now() + 3600, 3);
        claim.retry_count = 3;
        let claim = s.submit(claim).unwrap();

        let report = s.tick().unwrap();
        assert_eq!(report.abandoned, vec![claim.id.clone()]);
        assert!(report.dispatched.is_empty());
        assert_eq!(s.get(&claim.id).unwrap().status, ClaimStatus::Failed);
        assert!(s.tick().unwrap().dispatched.is_empty());
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_last_retry_failure_abandons() {
        let executor = ScriptedExecutor::new(u32::MAX, broadcast_failure);
        let s = scheduler(executor, SchedulerConfig::default());
        let sealed = s.sealer().seal(&SecureSecret::new(SECRET)).unwrap();
        let mut claim = PendingClaim::new(target(1), hash(), Some(sealed), unix_now() + 3600, 3);
        claim.retry_count = 2;
        let claim = s.submit(claim).unwrap();

        s.tick().unwrap();
        s.wait_idle().await;
        let failed = s.get(&claim.id).unwrap();
        assert_eq!(failed.status, ClaimStatus::Failed);
        assert!(failed.last_error.unwrap().contains("HTTP 503"));
        assert_eq!(s.pending_timers(), 0);
    }

    #[tokio::test]
    async fn test_fatal_error_abandons_immediately() {
        let executor = ScriptedExecutor::new(u32::MAX, || SwapError::ScriptReuse {
            script_hash: "ab".repeat(32),
        });
        let s = scheduler(executor, SchedulerConfig::default());
        let claim = s
            .enqueue(target(1), hash(), Some(&SecureSecret::new(SECRET)), unix_now() + 3600)
            .unwrap();
        s.tick().unwrap();
        s.wait_idle().await;
        let claim = s.get(&claim.id).unwrap();
        assert_eq!(claim.status, ClaimStatus::Failed);
        assert_eq!(claim.retry_count, 1);
    }

    #[tokio::test]
    async fn test_dry_run_simulates() {
        let executor = ScriptedExecutor::new(0, broadcast_failure);
        let s = scheduler(
            executor.clone(),
            SchedulerConfig {
                dry_run: true,
                ..Default::default()
            },
        );
        let mut rx = s.events.subscribe();
        let claim = s
            .enqueue(target(1), hash(), Some(&SecureSecret::new(SECRET)), unix_now() + 3600)
            .unwrap();
        s.tick().unwrap();
        s.wait_idle().await;
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
        assert_eq!(s.get(&claim.id).unwrap().txid.as_deref(), Some("would-be"));

        let mut simulated = false;
        while let Ok(event) = rx.try_recv() {
            if let SwapEvent::ClaimSucceeded { simulated: flag, .. } = event {
                simulated = flag;
            }
        }
        assert!(simulated);
    }

    #[test]
    fn test_backoff_delay_doubles_and_caps() {
        let s = ClaimScheduler::new(
            Arc::new(InMemoryRepository::<PendingClaim>::new()),
            Arc::new(SecretSealer::generate()),
            Arc::new(EventBus::new()),
            SchedulerConfig {
                base_delay_ms: 1_000,
                max_delay_ms: 10_000,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(s.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(s.backoff_delay(2), Duration::from_secs(2));
        assert_eq!(s.backoff_delay(4), Duration::from_secs(8));
        assert_eq!(s.backoff_delay(5), Duration::from_secs(10));
        assert_eq!(s.backoff_delay(60), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_cleanup_removes_old_terminal_claims() {
        let s = scheduler(ScriptedExecutor::new(0, broadcast_failure), SchedulerConfig::default());
        let claim = s
            .enqueue(target(1), hash(), Some(&SecureSecret::new(SECRET)), unix_now() + 3600)
            .unwrap();
        let pending = s.enqueue(target(2), hash(), None, unix_now() + 3600).unwrap();
        s.tick().unwrap();
        s.wait_idle().await;

        assert_eq!(s.cleanup(unix_now()).unwrap(), 0);
        assert_eq!(s.cleanup(unix_now() + 48 * 3600).unwrap(), 1);
        assert!(s.get(&claim.id).is_err());
        assert!(s.get(&pending.id).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_ticker_and_timers() {
        let executor = ScriptedExecutor::new(u32::MAX, broadcast_failure);
        let s = scheduler(
            executor.clone(),
            SchedulerConfig {
                tick_interval_ms: 100,
                base_delay_ms: 10_000,
                max_delay_ms: 10_000,
                ..Default::default()
            },
        );
        s.enqueue(target(1), hash(), Some(&SecureSecret::new(SECRET)), unix_now() + 3600)
            .unwrap();
        s.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        s.wait_idle().await;
        assert!(s.is_running());
        assert_eq!(s.pending_timers(), 1);

        s.stop();
        assert_eq!(s.pending_timers(), 0);
        assert!(!s.is_running());
        let calls = executor.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(executor.calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_after_stop_leaves_no_timer() {
        let executor = ScriptedExecutor::slow(u32::MAX, broadcast_failure, Duration::from_secs(1));
        let s = scheduler(
            executor.clone(),
            SchedulerConfig {
                tick_interval_ms: 100,
                base_delay_ms: 5_000,
                ..Default::default()
            },
        );
        let claim = s
            .enqueue(target(1), hash(), Some(&SecureSecret::new(SECRET)), unix_now() + 3600)
            .unwrap();
        s.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(s.in_flight(), 1);

        s.stop();
        s.wait_idle().await;
        assert_eq!(s.pending_timers(), 0);
        assert_eq!(s.get(&claim.id).unwrap().status, ClaimStatus::Backoff);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(s.get(&claim.id).unwrap().status, ClaimStatus::Backoff);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);

        assert_eq!(s.recover_interrupted().unwrap(), 1);
        s.start();
        tokio::time::sleep(Duration::from_millis(150)).await;
        let resumed = s.get(&claim.id).unwrap();
        assert_eq!(resumed.status, ClaimStatus::Claiming);
        assert_eq!(resumed.retry_count, 1);
        s.stop();
    }
}
