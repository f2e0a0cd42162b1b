#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use campaign_engine_domain::{
    idempotency_key, retry_backoff, CampaignId, CampaignRecord, DateTimeUtc, DispatchJob, JobId,
    JobStatus, Lead, RunId, RunStatus, TickCounters, DEFAULT_LEASE_SECONDS, LEASE_REFRESH_INTERVAL,
    PER_TICK_HARD_CAP,
};
use campaign_engine_narrative::{next_step_for_lead, MessageSequence, NextStep};
use campaign_engine_policy::{evaluate_lead, evaluate_tick, LeadGate, LeadGateInputs, TickGate};
use campaign_engine_sender::{SendCapability, SendRequest};
use campaign_engine_store_core::CampaignStore;
use serde::Serialize;
use time::{Duration, Time};
use tracing::{debug, info, warn};

/// Wall-clock seam so the tick driver is testable at fixed instants.
pub trait Clock {
    fn now(&self) -> DateTimeUtc;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTimeUtc {
        campaign_engine_domain::now_utc()
    }
}

/// Settable clock for tests.
#[derive(Debug)]
pub struct FixedClock {
    now: std::sync::Mutex<DateTimeUtc>,
}

impl FixedClock {
    #[must_use]
    pub fn new(now: DateTimeUtc) -> Self {
        Self {
            now: std::sync::Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTimeUtc) {
        *self
            .now
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self
            .now
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTimeUtc {
        *self
            .now
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Budget source for the per-tick dispatch cap.
pub trait QuotaProvider {
    #[allow(clippy::missing_errors_doc)]
    fn remaining_quota(&self, campaign: &CampaignRecord, now: DateTimeUtc) -> Result<u32>;
}

/// Constant budget, for tests and unthrottled campaigns.
#[derive(Debug, Clone, Copy)]
pub struct FixedQuotaProvider {
    pub remaining: u32,
}

impl QuotaProvider for FixedQuotaProvider {
    fn remaining_quota(&self, _campaign: &CampaignRecord, _now: DateTimeUtc) -> Result<u32> {
        Ok(self.remaining)
    }
}

/// Daily cap: the campaign's quota minus jobs delivered since UTC midnight.
pub struct DailyCapQuotaProvider<'a> {
    store: &'a dyn CampaignStore,
}

impl<'a> DailyCapQuotaProvider<'a> {
    #[must_use]
    pub fn new(store: &'a dyn CampaignStore) -> Self {
        Self { store }
    }
}

impl QuotaProvider for DailyCapQuotaProvider<'_> {
    fn remaining_quota(&self, campaign: &CampaignRecord, now: DateTimeUtc) -> Result<u32> {
        let midnight = now.replace_time(Time::MIDNIGHT);
        let delivered = self
            .store
            .count_delivered_since(campaign.campaign_id, midnight)?;
        let delivered = u32::try_from(delivered).unwrap_or(u32::MAX);
        Ok(campaign.daily_quota.saturating_sub(delivered))
    }
}

#[derive(Debug, Clone)]
pub struct TickConfig {
    pub batch_size: u32,
    pub lease_duration: Duration,
    pub leaseholder: String,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            lease_duration: Duration::seconds(DEFAULT_LEASE_SECONDS),
            leaseholder: "campaign-engine".to_string(),
        }
    }
}

/// Why a tick ended the way it did.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TickDisposition {
    /// Batch ran to its natural end (possibly empty, possibly quota-capped).
    Completed,
    /// Another leaseholder holds an unexpired lease; nothing was touched.
    ClaimDenied,
    Paused,
    CampaignInactive,
    /// Kill switch was engaged at validation or observed mid-batch.
    KillSwitch,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TickSummary {
    pub run_id: Option<RunId>,
    pub disposition: TickDisposition,
    pub counters: TickCounters,
}

impl TickSummary {
    fn without_run(disposition: TickDisposition) -> Self {
        Self {
            run_id: None,
            disposition,
            counters: TickCounters::default(),
        }
    }
}

/// The tick driver. Stateless across ticks; every decision is read from
/// the store under the lease claimed at the start of the tick.
pub struct Engine<'a> {
    store: &'a dyn CampaignStore,
    sender: &'a dyn SendCapability,
    quota: &'a dyn QuotaProvider,
    clock: &'a dyn Clock,
}

impl<'a> Engine<'a> {
    #[must_use]
    pub fn new(
        store: &'a dyn CampaignStore,
        sender: &'a dyn SendCapability,
        quota: &'a dyn QuotaProvider,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            store,
            sender,
            quota,
            clock,
        }
    }

    /// Execute one tick for the campaign: claim the lease, validate, select
    /// a bounded batch, dispatch lead by lead, write the terminal run state.
    ///
    /// Lead-level send failures are tallied and do not abort the batch.
    /// Storage failures abort the tick; the run is marked failed best-effort
    /// and the error propagates.
    ///
    /// # Errors
    /// Returns an error when the campaign does not exist, its sequence is
    /// empty, or a storage operation fails mid-tick.
    pub fn tick(&self, campaign_id: CampaignId, config: &TickConfig) -> Result<TickSummary> {
        let now = self.clock.now();
        let campaign = self
            .store
            .get_campaign(campaign_id)?
            .ok_or_else(|| anyhow!("campaign {campaign_id} not found"))?;

        let run_id = RunId::new();
        let Some(run) = self.store.claim_run(
            campaign_id,
            run_id,
            &config.leaseholder,
            now,
            config.lease_duration,
        )?
        else {
            debug!(%campaign_id, leaseholder = %config.leaseholder, "claim denied");
            return Ok(TickSummary::without_run(TickDisposition::ClaimDenied));
        };
        info!(%campaign_id, %run_id, leaseholder = %config.leaseholder, "lease claimed");

        match self.run_batch(&campaign, run.run_id, config) {
            Ok((disposition, counters)) => {
                let terminal = match disposition {
                    TickDisposition::Completed => RunStatus::Completed,
                    _ => RunStatus::Stopped,
                };
                self.store
                    .complete_run(run.run_id, terminal, self.clock.now())
                    .context("failed to write terminal run status")?;
                info!(
                    %campaign_id,
                    %run_id,
                    ?disposition,
                    leads = counters.leads_processed,
                    jobs = counters.jobs_created,
                    "tick finished"
                );
                Ok(TickSummary {
                    run_id: Some(run.run_id),
                    disposition,
                    counters,
                })
            }
            Err(err) => {
                if let Err(complete_err) =
                    self.store
                        .complete_run(run.run_id, RunStatus::Failed, self.clock.now())
                {
                    warn!(%run_id, error = %complete_err, "could not mark run failed");
                }
                Err(err)
            }
        }
    }

    fn run_batch(
        &self,
        campaign: &CampaignRecord,
        run_id: RunId,
        config: &TickConfig,
    ) -> Result<(TickDisposition, TickCounters)> {
        let mut counters = TickCounters::default();
        let now = self.clock.now();

        let gate = evaluate_tick(campaign);
        if gate != TickGate::Clear {
            info!(campaign_id = %campaign.campaign_id, ?gate, "tick blocked at validation");
            let disposition = match gate {
                TickGate::KillSwitch => TickDisposition::KillSwitch,
                TickGate::Paused => TickDisposition::Paused,
                TickGate::CampaignInactive | TickGate::Clear => TickDisposition::CampaignInactive,
            };
            return Ok((disposition, counters));
        }

        let sequence =
            MessageSequence::new(&campaign.sequence_name, campaign.sequence.clone())
                .map_err(|err| anyhow!("campaign {} misconfigured: {err}", campaign.campaign_id))?;

        let mut budget = self.quota.remaining_quota(campaign, now)?;
        let limit = config
            .batch_size
            .min(PER_TICK_HARD_CAP)
            .min(budget);
        let batch = self
            .store
            .select_eligible(campaign.campaign_id, now, sequence.len(), limit)?;
        debug!(
            campaign_id = %campaign.campaign_id,
            selected = batch.len(),
            budget,
            "batch selected"
        );

        // Progress record also flips the run to running before any dispatch.
        self.store.record_progress(run_id, &TickCounters::default())?;

        let mut disposition = TickDisposition::Completed;
        let mut since_refresh: u64 = 0;
        for lead in &batch {
            if since_refresh >= LEASE_REFRESH_INTERVAL {
                let extended = self.store.refresh_lease(
                    run_id,
                    &config.leaseholder,
                    self.clock.now() + config.lease_duration,
                )?;
                if !extended {
                    return Err(anyhow!(
                        "lease for run {run_id} lost mid-batch; abandoning the tick"
                    ));
                }
                since_refresh = 0;
            }
            since_refresh += 1;

            // The kill switch and block-lists are read fresh per lead, never
            // cached at tick start.
            let inputs = LeadGateInputs {
                kill_switch: self.store.kill_switch(campaign.campaign_id)?,
                unsubscribed: self.store.is_unsubscribed(&lead.email)?,
                suppressed_reason: self.store.find_suppression(
                    &lead.email,
                    campaign_engine_domain::email_domain(&lead.email).as_deref(),
                    &lead.identity_hash,
                )?,
                remaining_quota: budget,
            };
            match evaluate_lead(lead, &inputs) {
                LeadGate::KillSwitch => {
                    info!(campaign_id = %campaign.campaign_id, "kill switch engaged mid-batch");
                    disposition = TickDisposition::KillSwitch;
                    break;
                }
                LeadGate::QuotaExhausted => {
                    debug!(campaign_id = %campaign.campaign_id, "quota budget exhausted");
                    break;
                }
                LeadGate::DoNotContact => {
                    counters.skipped_dnc += 1;
                    counters.leads_processed += 1;
                    continue;
                }
                LeadGate::Unsubscribed => {
                    counters.skipped_unsubscribed += 1;
                    counters.leads_processed += 1;
                    continue;
                }
                LeadGate::Suppressed { reason } => {
                    debug!(lead_id = %lead.lead_id, reason, "lead suppressed");
                    counters.skipped_suppressed += 1;
                    counters.leads_processed += 1;
                    continue;
                }
                LeadGate::Clear => {}
            }

            let NextStep::Message {
                message_id,
                step_index,
            } = next_step_for_lead(&sequence, lead)
            else {
                self.store
                    .mark_lead_completed(lead.lead_id, self.clock.now())?;
                counters.leads_completed += 1;
                counters.leads_processed += 1;
                continue;
            };

            let dispatched =
                self.dispatch_lead(campaign, lead, &message_id, step_index, &mut counters)?;
            counters.leads_processed += 1;
            if dispatched {
                budget = budget.saturating_sub(1);
            }
        }

        self.store.record_progress(run_id, &counters)?;
        Ok((disposition, counters))
    }

    /// Dispatch one message to one lead, including the idempotency check and
    /// retry scheduling. Returns whether a delivery consumed quota budget.
    fn dispatch_lead(
        &self,
        campaign: &CampaignRecord,
        lead: &Lead,
        message_id: &str,
        step_index: u32,
        counters: &mut TickCounters,
    ) -> Result<bool> {
        let key = idempotency_key(campaign.campaign_id, lead.lead_id, message_id, step_index);
        let now = self.clock.now();
        let cooldown = Duration::hours(campaign.cooldown_hours);

        let existing = self.store.find_job_by_key(&key)?;
        if let Some(job) = &existing {
            if job.status.is_delivered() {
                // Already delivered; advance the lead in case the earlier
                // advance was lost, without touching the channel, the job
                // row, or the recorded contact time.
                debug!(lead_id = %lead.lead_id, message_id, "idempotent skip");
                self.store.heal_lead_advance(
                    lead.lead_id,
                    job.step_index.saturating_add(1),
                    now + cooldown,
                )?;
                counters.skipped_idempotent += 1;
                return Ok(false);
            }
        }

        // A prior retry_scheduled/failed job transitions in place; a fresh
        // dispatch gets a new row.
        let fresh = existing.is_none();
        let mut job = existing.unwrap_or_else(|| DispatchJob {
            job_id: JobId::new(),
            campaign_id: campaign.campaign_id,
            lead_id: lead.lead_id,
            idempotency_key: key.clone(),
            message_id: message_id.to_string(),
            step_index,
            status: JobStatus::Failed,
            retry_count: 0,
            max_retries: campaign.max_retries,
            next_retry_at: None,
            provider_reference: None,
            error_text: None,
            created_at: now,
            updated_at: now,
        });

        let request = SendRequest {
            campaign_id: campaign.campaign_id,
            lead_id: lead.lead_id,
            email: lead.email.clone(),
            channel: campaign.channel.clone(),
            message_id: message_id.to_string(),
            step_index,
            idempotency_key: key,
        };

        match self.sender.send(&request) {
            Ok(receipt) => {
                job.status = if receipt.proof.is_some() {
                    JobStatus::SentProof
                } else {
                    JobStatus::Sent
                };
                job.provider_reference = Some(receipt.provider_reference);
                job.error_text = None;
                job.next_retry_at = None;
                job.updated_at = now;
                self.store
                    .commit_dispatch_success(&job, now + cooldown, now)?;
                if fresh {
                    counters.jobs_created += 1;
                }
                counters.attempts_succeeded += 1;
                debug!(lead_id = %lead.lead_id, message_id, "dispatched");
                Ok(true)
            }
            Err(err) => {
                warn!(lead_id = %lead.lead_id, message_id, error = %err, "send failed");
                counters.attempts_failed += 1;
                job.error_text = Some(err.to_string());
                job.updated_at = now;

                let next_count = job.retry_count.saturating_add(1);
                if next_count > job.max_retries {
                    job.status = JobStatus::FailedPermanent;
                    job.next_retry_at = None;
                    self.store.commit_dispatch_retry(&job, None)?;
                } else {
                    let retry_at = now + retry_backoff(next_count);
                    job.status = JobStatus::RetryScheduled;
                    job.retry_count = next_count;
                    job.next_retry_at = Some(retry_at);
                    self.store.commit_dispatch_retry(&job, Some(retry_at))?;
                }
                if fresh {
                    counters.jobs_created += 1;
                }
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Clock, FixedClock, FixedQuotaProvider, QuotaProvider};
    use campaign_engine_domain::{now_utc, CampaignId, CampaignRecord, CampaignStatus};
    use time::Duration;

    #[test]
    fn fixed_clock_is_settable_and_advancable() {
        let start = now_utc();
        let clock = FixedClock::new(start);
        assert_eq!(clock.now(), start);
        clock.advance(Duration::hours(2));
        assert_eq!(clock.now(), start + Duration::hours(2));
        clock.set(start);
        assert_eq!(clock.now(), start);
    }

    #[test]
    fn fixed_quota_ignores_the_campaign() {
        let campaign = CampaignRecord {
            campaign_id: CampaignId::new(),
            name: "q".to_string(),
            status: CampaignStatus::Active,
            kill_switch: false,
            channel: "email".to_string(),
            sequence_name: "default".to_string(),
            sequence: vec!["intro".to_string()],
            cooldown_hours: 24,
            daily_quota: 5,
            max_retries: 3,
            created_at: now_utc(),
        };
        let provider = FixedQuotaProvider { remaining: 42 };
        let remaining = provider.remaining_quota(&campaign, now_utc());
        assert!(remaining.is_ok());
        assert_eq!(remaining.unwrap_or_else(|_| unreachable!()), 42);
    }
}
