#![forbid(unsafe_code)]

use anyhow::Result;
use campaign_engine_domain::{
    CampaignId, CampaignRecord, CampaignRun, CampaignStatus, DateTimeUtc, DispatchJob, Lead,
    LeadId, RunId, RunStatus, SuppressionRecord, TickCounters, UnsubscribeRecord,
};
use time::Duration;

/// Persistence boundary for the campaign execution engine.
///
/// Run-record mutations are conditional writes scoped to the current
/// leaseholder; lead and job mutations happen one lead per transaction.
pub trait CampaignStore {
    #[allow(clippy::missing_errors_doc)]
    fn migrate(&self) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn upsert_campaign(&self, campaign: &CampaignRecord) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn get_campaign(&self, campaign_id: CampaignId) -> Result<Option<CampaignRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_campaigns(&self) -> Result<Vec<CampaignRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn set_campaign_status(&self, campaign_id: CampaignId, status: CampaignStatus) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn set_kill_switch(&self, campaign_id: CampaignId, engaged: bool) -> Result<()>;

    /// Read the kill switch fresh; the engine polls this before every
    /// dispatch rather than caching it at tick start.
    #[allow(clippy::missing_errors_doc)]
    fn kill_switch(&self, campaign_id: CampaignId) -> Result<bool>;

    /// Atomically claim the campaign's exclusive lease.
    ///
    /// Succeeds only when no run for the campaign is in a claimed/running
    /// status with an unexpired lease. `Ok(None)` means another leaseholder
    /// is active — a normal outcome, not an error.
    #[allow(clippy::missing_errors_doc)]
    fn claim_run(
        &self,
        campaign_id: CampaignId,
        run_id: RunId,
        leaseholder: &str,
        now: DateTimeUtc,
        lease_duration: Duration,
    ) -> Result<Option<CampaignRun>>;

    /// Conditionally extend the lease. Returns `false` when the run is no
    /// longer held by `leaseholder` (expired and reclaimed, or terminal).
    #[allow(clippy::missing_errors_doc)]
    fn refresh_lease(
        &self,
        run_id: RunId,
        leaseholder: &str,
        lease_expires_at: DateTimeUtc,
    ) -> Result<bool>;

    /// Add counter deltas to the run record and mark it running. Counters
    /// only ever grow.
    #[allow(clippy::missing_errors_doc)]
    fn record_progress(&self, run_id: RunId, delta: &TickCounters) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn complete_run(
        &self,
        run_id: RunId,
        status: RunStatus,
        completed_at: DateTimeUtc,
    ) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn get_run(&self, run_id: RunId) -> Result<Option<CampaignRun>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_runs(&self, campaign_id: CampaignId) -> Result<Vec<CampaignRun>>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_lead(&self, lead: &Lead) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn get_lead(&self, lead_id: LeadId) -> Result<Option<Lead>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_leads(&self, campaign_id: CampaignId) -> Result<Vec<Lead>>;

    /// Deterministic bounded selection of leads eligible for contact now:
    /// `next_eligible_at <= now`, `step_index <= max_steps`, status not
    /// dnc/completed/failed; ordered by `next_eligible_at ASC, lead_id ASC`.
    /// The inclusive step bound surfaces leads that walked the whole
    /// sequence so the engine can mark them completed.
    #[allow(clippy::missing_errors_doc)]
    fn select_eligible(
        &self,
        campaign_id: CampaignId,
        now: DateTimeUtc,
        max_steps: u32,
        limit: u32,
    ) -> Result<Vec<Lead>>;

    /// Mark a lead whose sequence is exhausted as completed, without a
    /// dispatch.
    #[allow(clippy::missing_errors_doc)]
    fn mark_lead_completed(&self, lead_id: LeadId, now: DateTimeUtc) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn find_job_by_key(&self, idempotency_key: &str) -> Result<Option<DispatchJob>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_jobs(&self, campaign_id: CampaignId) -> Result<Vec<DispatchJob>>;

    /// Count of jobs in a delivered status whose delivery landed at or
    /// after `since`, for daily-quota accounting. A retried job created
    /// earlier counts on the day it actually delivered.
    #[allow(clippy::missing_errors_doc)]
    fn count_delivered_since(&self, campaign_id: CampaignId, since: DateTimeUtc) -> Result<u64>;

    /// One atomic transaction: upsert the delivered job and advance its
    /// lead (status contacted, step +1, cooldown applied). Commits together
    /// or rolls back together.
    #[allow(clippy::missing_errors_doc)]
    fn commit_dispatch_success(
        &self,
        job: &DispatchJob,
        next_eligible_at: DateTimeUtc,
        contacted_at: DateTimeUtc,
    ) -> Result<()>;

    /// Advance a lead to the position an already-delivered job implies,
    /// leaving the job row and the lead's contact timestamp untouched.
    #[allow(clippy::missing_errors_doc)]
    fn heal_lead_advance(
        &self,
        lead_id: LeadId,
        step_index: u32,
        next_eligible_at: DateTimeUtc,
    ) -> Result<()>;

    /// One atomic transaction for a failed attempt: upsert the job in its
    /// retry/terminal state and align the lead's `next_eligible_at` with
    /// the retry schedule (`None` parks a permanently failed lead).
    #[allow(clippy::missing_errors_doc)]
    fn commit_dispatch_retry(
        &self,
        job: &DispatchJob,
        lead_next_eligible_at: Option<DateTimeUtc>,
    ) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn is_unsubscribed(&self, email: &str) -> Result<bool>;

    /// Suppression match by email, domain, or identity hash; returns the
    /// recorded reason when any identifier matches.
    #[allow(clippy::missing_errors_doc)]
    fn find_suppression(
        &self,
        email: &str,
        domain: Option<&str>,
        identity_hash: &str,
    ) -> Result<Option<String>>;

    #[allow(clippy::missing_errors_doc)]
    fn add_unsubscribe(&self, record: &UnsubscribeRecord) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn add_suppression(&self, record: &SuppressionRecord) -> Result<()>;
}
