#![forbid(unsafe_code)]

use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use campaign_engine_domain::{
    CampaignId, CampaignRecord, CampaignRun, CampaignStatus, ConsentStatus, DateTimeUtc,
    DispatchJob, JobId, JobStatus, Lead, LeadId, LeadStatus, RunId, RunStatus, SuppressionRecord,
    TickCounters, UnsubscribeRecord,
};
use campaign_engine_store_core::CampaignStore;
use rusqlite::{params, Connection, OptionalExtension, Row};
use time::{Duration, OffsetDateTime};
use ulid::Ulid;

const SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS campaigns (
  campaign_id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('active','paused','archived')),
  kill_switch INTEGER NOT NULL CHECK (kill_switch IN (0,1)),
  channel TEXT NOT NULL,
  sequence_name TEXT NOT NULL,
  sequence_json TEXT NOT NULL,
  cooldown_hours INTEGER NOT NULL,
  daily_quota INTEGER NOT NULL,
  max_retries INTEGER NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS campaign_runs (
  run_id TEXT PRIMARY KEY,
  campaign_id TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('claimed','running','stopped','failed','completed')),
  leaseholder TEXT NOT NULL,
  lease_expires_at TEXT NOT NULL,
  started_at TEXT NOT NULL,
  completed_at TEXT,
  leads_processed INTEGER NOT NULL DEFAULT 0,
  jobs_created INTEGER NOT NULL DEFAULT 0,
  attempts_succeeded INTEGER NOT NULL DEFAULT 0,
  attempts_failed INTEGER NOT NULL DEFAULT 0,
  FOREIGN KEY (campaign_id) REFERENCES campaigns(campaign_id)
);

CREATE TABLE IF NOT EXISTS leads (
  lead_id TEXT PRIMARY KEY,
  campaign_id TEXT NOT NULL,
  email TEXT NOT NULL,
  identity_hash TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('new','contacted','completed','dnc','failed')),
  consent TEXT NOT NULL CHECK (consent IN ('granted','unknown','do_not_contact')),
  sequence_name TEXT NOT NULL,
  step_index INTEGER NOT NULL CHECK (step_index >= 0),
  next_eligible_at TEXT NOT NULL,
  last_contacted_at TEXT,
  created_at TEXT NOT NULL,
  FOREIGN KEY (campaign_id) REFERENCES campaigns(campaign_id)
);

CREATE TABLE IF NOT EXISTS dispatch_jobs (
  job_id TEXT PRIMARY KEY,
  campaign_id TEXT NOT NULL,
  lead_id TEXT NOT NULL,
  idempotency_key TEXT NOT NULL UNIQUE,
  message_id TEXT NOT NULL,
  step_index INTEGER NOT NULL CHECK (step_index >= 0),
  status TEXT NOT NULL CHECK (status IN ('sent','sent_proof','failed','retry_scheduled','failed_permanent')),
  retry_count INTEGER NOT NULL DEFAULT 0,
  max_retries INTEGER NOT NULL,
  next_retry_at TEXT,
  provider_reference TEXT,
  error_text TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  FOREIGN KEY (campaign_id) REFERENCES campaigns(campaign_id),
  FOREIGN KEY (lead_id) REFERENCES leads(lead_id)
);

CREATE TABLE IF NOT EXISTS unsubscribes (
  email TEXT PRIMARY KEY,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS suppressions (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  email TEXT,
  domain TEXT,
  identity_hash TEXT,
  reason TEXT NOT NULL,
  created_at TEXT NOT NULL,
  CHECK (email IS NOT NULL OR domain IS NOT NULL OR identity_hash IS NOT NULL)
);

CREATE INDEX IF NOT EXISTS idx_runs_campaign_lease
  ON campaign_runs(campaign_id, status, lease_expires_at);
CREATE INDEX IF NOT EXISTS idx_leads_eligibility
  ON leads(campaign_id, next_eligible_at, lead_id);
CREATE INDEX IF NOT EXISTS idx_jobs_campaign_created
  ON dispatch_jobs(campaign_id, created_at);
CREATE INDEX IF NOT EXISTS idx_jobs_lead
  ON dispatch_jobs(lead_id, step_index);
CREATE INDEX IF NOT EXISTS idx_suppressions_email ON suppressions(email);
CREATE INDEX IF NOT EXISTS idx_suppressions_domain ON suppressions(domain);
CREATE INDEX IF NOT EXISTS idx_suppressions_identity ON suppressions(identity_hash);
";

pub struct SqliteCampaignStore {
    conn: Connection,
}

impl SqliteCampaignStore {
    /// Open or create the campaign database and configure local pragmas.
    ///
    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    fn upsert_job_tx(tx: &rusqlite::Transaction<'_>, job: &DispatchJob) -> Result<()> {
        let updated = tx
            .execute(
                "UPDATE dispatch_jobs SET
                    status = ?2, retry_count = ?3, next_retry_at = ?4,
                    provider_reference = ?5, error_text = ?6, updated_at = ?7
                 WHERE job_id = ?1",
                params![
                    job.job_id.to_string(),
                    job.status.as_str(),
                    i64::from(job.retry_count),
                    job.next_retry_at.map(rfc3339).transpose()?,
                    job.provider_reference,
                    job.error_text,
                    rfc3339(job.updated_at)?,
                ],
            )
            .context("failed to update dispatch job")?;
        if updated > 0 {
            return Ok(());
        }

        tx.execute(
            "INSERT INTO dispatch_jobs(
                job_id, campaign_id, lead_id, idempotency_key, message_id,
                step_index, status, retry_count, max_retries, next_retry_at,
                provider_reference, error_text, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                job.job_id.to_string(),
                job.campaign_id.to_string(),
                job.lead_id.to_string(),
                job.idempotency_key,
                job.message_id,
                i64::from(job.step_index),
                job.status.as_str(),
                i64::from(job.retry_count),
                i64::from(job.max_retries),
                job.next_retry_at.map(rfc3339).transpose()?,
                job.provider_reference,
                job.error_text,
                rfc3339(job.created_at)?,
                rfc3339(job.updated_at)?,
            ],
        )
        .context("failed to insert dispatch job")?;
        Ok(())
    }
}

impl CampaignStore for SqliteCampaignStore {
    fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA_V1)
            .context("failed to apply campaign schema")?;

        let now = rfc3339(OffsetDateTime::now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![SCHEMA_VERSION, now],
            )
            .context("failed to record schema migration")?;
        Ok(())
    }

    fn upsert_campaign(&self, campaign: &CampaignRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO campaigns(
                    campaign_id, name, status, kill_switch, channel,
                    sequence_name, sequence_json, cooldown_hours, daily_quota,
                    max_retries, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                ON CONFLICT(campaign_id) DO UPDATE SET
                    name = excluded.name,
                    status = excluded.status,
                    kill_switch = excluded.kill_switch,
                    channel = excluded.channel,
                    sequence_name = excluded.sequence_name,
                    sequence_json = excluded.sequence_json,
                    cooldown_hours = excluded.cooldown_hours,
                    daily_quota = excluded.daily_quota,
                    max_retries = excluded.max_retries",
                params![
                    campaign.campaign_id.to_string(),
                    campaign.name,
                    campaign.status.as_str(),
                    i64::from(campaign.kill_switch),
                    campaign.channel,
                    campaign.sequence_name,
                    serde_json::to_string(&campaign.sequence)?,
                    campaign.cooldown_hours,
                    i64::from(campaign.daily_quota),
                    i64::from(campaign.max_retries),
                    rfc3339(campaign.created_at)?,
                ],
            )
            .context("failed to upsert campaign")?;
        Ok(())
    }

    fn get_campaign(&self, campaign_id: CampaignId) -> Result<Option<CampaignRecord>> {
        self.conn
            .query_row(
                "SELECT campaign_id, name, status, kill_switch, channel,
                        sequence_name, sequence_json, cooldown_hours, daily_quota,
                        max_retries, created_at
                 FROM campaigns WHERE campaign_id = ?1",
                params![campaign_id.to_string()],
                campaign_from_row,
            )
            .optional()
            .context("failed to load campaign")
    }

    fn list_campaigns(&self) -> Result<Vec<CampaignRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT campaign_id, name, status, kill_switch, channel,
                    sequence_name, sequence_json, cooldown_hours, daily_quota,
                    max_retries, created_at
             FROM campaigns ORDER BY campaign_id ASC",
        )?;
        let rows = stmt.query_map([], campaign_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed to read campaign row")?);
        }
        Ok(out)
    }

    fn set_campaign_status(&self, campaign_id: CampaignId, status: CampaignStatus) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE campaigns SET status = ?2 WHERE campaign_id = ?1",
                params![campaign_id.to_string(), status.as_str()],
            )
            .context("failed to update campaign status")?;
        if changed == 0 {
            return Err(anyhow!("campaign {campaign_id} not found"));
        }
        Ok(())
    }

    fn set_kill_switch(&self, campaign_id: CampaignId, engaged: bool) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE campaigns SET kill_switch = ?2 WHERE campaign_id = ?1",
                params![campaign_id.to_string(), i64::from(engaged)],
            )
            .context("failed to update kill switch")?;
        if changed == 0 {
            return Err(anyhow!("campaign {campaign_id} not found"));
        }
        Ok(())
    }

    fn kill_switch(&self, campaign_id: CampaignId) -> Result<bool> {
        let engaged: i64 = self
            .conn
            .query_row(
                "SELECT kill_switch FROM campaigns WHERE campaign_id = ?1",
                params![campaign_id.to_string()],
                |row| row.get(0),
            )
            .context("failed to read kill switch")?;
        Ok(engaged == 1)
    }

    fn claim_run(
        &self,
        campaign_id: CampaignId,
        run_id: RunId,
        leaseholder: &str,
        now: DateTimeUtc,
        lease_duration: Duration,
    ) -> Result<Option<CampaignRun>> {
        let started_at = rfc3339(now)?;
        let lease_expires_at = rfc3339(now + lease_duration)?;

        // Single conditional INSERT: the guard subquery and the insert are
        // one statement, so two concurrent claimants cannot both pass.
        let inserted = self
            .conn
            .execute(
                "INSERT INTO campaign_runs(
                    run_id, campaign_id, status, leaseholder,
                    lease_expires_at, started_at
                )
                SELECT ?1, ?2, 'claimed', ?3, ?4, ?5
                WHERE NOT EXISTS (
                    SELECT 1 FROM campaign_runs
                    WHERE campaign_id = ?2
                      AND status IN ('claimed','running')
                      AND lease_expires_at > ?5
                )",
                params![
                    run_id.to_string(),
                    campaign_id.to_string(),
                    leaseholder,
                    lease_expires_at,
                    started_at,
                ],
            )
            .context("failed to claim campaign run")?;

        if inserted == 0 {
            return Ok(None);
        }

        self.get_run(run_id)
    }

    fn refresh_lease(
        &self,
        run_id: RunId,
        leaseholder: &str,
        lease_expires_at: DateTimeUtc,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE campaign_runs SET lease_expires_at = ?3
                 WHERE run_id = ?1
                   AND leaseholder = ?2
                   AND status IN ('claimed','running')",
                params![run_id.to_string(), leaseholder, rfc3339(lease_expires_at)?],
            )
            .context("failed to refresh lease")?;
        Ok(changed > 0)
    }

    fn record_progress(&self, run_id: RunId, delta: &TickCounters) -> Result<()> {
        self.conn
            .execute(
                "UPDATE campaign_runs SET
                    status = 'running',
                    leads_processed = leads_processed + ?2,
                    jobs_created = jobs_created + ?3,
                    attempts_succeeded = attempts_succeeded + ?4,
                    attempts_failed = attempts_failed + ?5
                 WHERE run_id = ?1",
                params![
                    run_id.to_string(),
                    to_i64(delta.leads_processed)?,
                    to_i64(delta.jobs_created)?,
                    to_i64(delta.attempts_succeeded)?,
                    to_i64(delta.attempts_failed)?,
                ],
            )
            .context("failed to record run progress")?;
        Ok(())
    }

    fn complete_run(
        &self,
        run_id: RunId,
        status: RunStatus,
        completed_at: DateTimeUtc,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE campaign_runs SET status = ?2, completed_at = ?3 WHERE run_id = ?1",
                params![
                    run_id.to_string(),
                    status.as_str(),
                    rfc3339(completed_at)?
                ],
            )
            .context("failed to complete run")?;
        Ok(())
    }

    fn get_run(&self, run_id: RunId) -> Result<Option<CampaignRun>> {
        self.conn
            .query_row(
                "SELECT run_id, campaign_id, status, leaseholder, lease_expires_at,
                        started_at, completed_at, leads_processed, jobs_created,
                        attempts_succeeded, attempts_failed
                 FROM campaign_runs WHERE run_id = ?1",
                params![run_id.to_string()],
                run_from_row,
            )
            .optional()
            .context("failed to load run")
    }

    fn list_runs(&self, campaign_id: CampaignId) -> Result<Vec<CampaignRun>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, campaign_id, status, leaseholder, lease_expires_at,
                    started_at, completed_at, leads_processed, jobs_created,
                    attempts_succeeded, attempts_failed
             FROM campaign_runs WHERE campaign_id = ?1 ORDER BY run_id ASC",
        )?;
        let rows = stmt.query_map(params![campaign_id.to_string()], run_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed to read run row")?);
        }
        Ok(out)
    }

    fn insert_lead(&self, lead: &Lead) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO leads(
                    lead_id, campaign_id, email, identity_hash, status, consent,
                    sequence_name, step_index, next_eligible_at, last_contacted_at,
                    created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    lead.lead_id.to_string(),
                    lead.campaign_id.to_string(),
                    lead.email,
                    lead.identity_hash,
                    lead.status.as_str(),
                    lead.consent.as_str(),
                    lead.sequence_name,
                    i64::from(lead.step_index),
                    rfc3339(lead.next_eligible_at)?,
                    lead.last_contacted_at.map(rfc3339).transpose()?,
                    rfc3339(lead.created_at)?,
                ],
            )
            .context("failed to insert lead")?;
        Ok(())
    }

    fn get_lead(&self, lead_id: LeadId) -> Result<Option<Lead>> {
        self.conn
            .query_row(
                "SELECT lead_id, campaign_id, email, identity_hash, status, consent,
                        sequence_name, step_index, next_eligible_at, last_contacted_at,
                        created_at
                 FROM leads WHERE lead_id = ?1",
                params![lead_id.to_string()],
                lead_from_row,
            )
            .optional()
            .context("failed to load lead")
    }

    fn list_leads(&self, campaign_id: CampaignId) -> Result<Vec<Lead>> {
        let mut stmt = self.conn.prepare(
            "SELECT lead_id, campaign_id, email, identity_hash, status, consent,
                    sequence_name, step_index, next_eligible_at, last_contacted_at,
                    created_at
             FROM leads WHERE campaign_id = ?1 ORDER BY lead_id ASC",
        )?;
        let rows = stmt.query_map(params![campaign_id.to_string()], lead_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed to read lead row")?);
        }
        Ok(out)
    }

    fn select_eligible(
        &self,
        campaign_id: CampaignId,
        now: DateTimeUtc,
        max_steps: u32,
        limit: u32,
    ) -> Result<Vec<Lead>> {
        let mut stmt = self.conn.prepare(
            "SELECT lead_id, campaign_id, email, identity_hash, status, consent,
                    sequence_name, step_index, next_eligible_at, last_contacted_at,
                    created_at
             FROM leads
             WHERE campaign_id = ?1
               AND next_eligible_at <= ?2
               AND step_index <= ?3
               AND status NOT IN ('dnc','completed','failed')
             ORDER BY next_eligible_at ASC, lead_id ASC
             LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![
                campaign_id.to_string(),
                rfc3339(now)?,
                i64::from(max_steps),
                i64::from(limit)
            ],
            lead_from_row,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed to read eligible lead row")?);
        }
        Ok(out)
    }

    fn mark_lead_completed(&self, lead_id: LeadId, now: DateTimeUtc) -> Result<()> {
        self.conn
            .execute(
                "UPDATE leads SET status = 'completed', next_eligible_at = ?2 WHERE lead_id = ?1",
                params![lead_id.to_string(), rfc3339(now)?],
            )
            .context("failed to mark lead completed")?;
        Ok(())
    }

    fn find_job_by_key(&self, idempotency_key: &str) -> Result<Option<DispatchJob>> {
        self.conn
            .query_row(
                "SELECT job_id, campaign_id, lead_id, idempotency_key, message_id,
                        step_index, status, retry_count, max_retries, next_retry_at,
                        provider_reference, error_text, created_at, updated_at
                 FROM dispatch_jobs WHERE idempotency_key = ?1",
                params![idempotency_key],
                job_from_row,
            )
            .optional()
            .context("failed to load dispatch job by key")
    }

    fn list_jobs(&self, campaign_id: CampaignId) -> Result<Vec<DispatchJob>> {
        let mut stmt = self.conn.prepare(
            "SELECT job_id, campaign_id, lead_id, idempotency_key, message_id,
                    step_index, status, retry_count, max_retries, next_retry_at,
                    provider_reference, error_text, created_at, updated_at
             FROM dispatch_jobs WHERE campaign_id = ?1 ORDER BY job_id ASC",
        )?;
        let rows = stmt.query_map(params![campaign_id.to_string()], job_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed to read job row")?);
        }
        Ok(out)
    }

    fn count_delivered_since(&self, campaign_id: CampaignId, since: DateTimeUtc) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM dispatch_jobs
                 WHERE campaign_id = ?1
                   AND status IN ('sent','sent_proof')
                   AND updated_at >= ?2",
                params![campaign_id.to_string(), rfc3339(since)?],
                |row| row.get(0),
            )
            .context("failed to count delivered jobs")?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    fn commit_dispatch_success(
        &self,
        job: &DispatchJob,
        next_eligible_at: DateTimeUtc,
        contacted_at: DateTimeUtc,
    ) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("failed to open dispatch transaction")?;

        Self::upsert_job_tx(&tx, job)?;
        tx.execute(
            "UPDATE leads SET
                status = 'contacted',
                step_index = ?2,
                next_eligible_at = ?3,
                last_contacted_at = ?4
             WHERE lead_id = ?1",
            params![
                job.lead_id.to_string(),
                i64::from(job.step_index) + 1,
                rfc3339(next_eligible_at)?,
                rfc3339(contacted_at)?,
            ],
        )
        .context("failed to advance lead after dispatch")?;

        tx.commit().context("failed to commit dispatch success")?;
        Ok(())
    }

    fn heal_lead_advance(
        &self,
        lead_id: LeadId,
        step_index: u32,
        next_eligible_at: DateTimeUtc,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE leads SET
                    status = 'contacted',
                    step_index = ?2,
                    next_eligible_at = ?3
                 WHERE lead_id = ?1",
                params![
                    lead_id.to_string(),
                    i64::from(step_index),
                    rfc3339(next_eligible_at)?,
                ],
            )
            .context("failed to heal lead position")?;
        Ok(())
    }

    fn commit_dispatch_retry(
        &self,
        job: &DispatchJob,
        lead_next_eligible_at: Option<DateTimeUtc>,
    ) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("failed to open retry transaction")?;

        Self::upsert_job_tx(&tx, job)?;
        if let Some(next_eligible_at) = lead_next_eligible_at {
            tx.execute(
                "UPDATE leads SET next_eligible_at = ?2 WHERE lead_id = ?1",
                params![job.lead_id.to_string(), rfc3339(next_eligible_at)?],
            )
            .context("failed to reschedule lead for retry")?;
        } else if job.status == JobStatus::FailedPermanent {
            tx.execute(
                "UPDATE leads SET status = 'failed' WHERE lead_id = ?1",
                params![job.lead_id.to_string()],
            )
            .context("failed to park permanently failed lead")?;
        }

        tx.commit().context("failed to commit dispatch retry")?;
        Ok(())
    }

    fn is_unsubscribed(&self, email: &str) -> Result<bool> {
        let hit: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM unsubscribes WHERE email = ?1",
                params![email.trim().to_ascii_lowercase()],
                |row| row.get(0),
            )
            .optional()
            .context("failed to consult unsubscribe list")?;
        Ok(hit.is_some())
    }

    fn find_suppression(
        &self,
        email: &str,
        domain: Option<&str>,
        identity_hash: &str,
    ) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT reason FROM suppressions
                 WHERE (email IS NOT NULL AND email = ?1)
                    OR (domain IS NOT NULL AND domain = ?2)
                    OR (identity_hash IS NOT NULL AND identity_hash = ?3)
                 ORDER BY id ASC
                 LIMIT 1",
                params![
                    email.trim().to_ascii_lowercase(),
                    domain.unwrap_or(""),
                    identity_hash
                ],
                |row| row.get(0),
            )
            .optional()
            .context("failed to consult suppression list")
    }

    fn add_unsubscribe(&self, record: &UnsubscribeRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO unsubscribes(email, created_at) VALUES (?1, ?2)",
                params![
                    record.email.trim().to_ascii_lowercase(),
                    rfc3339(record.created_at)?
                ],
            )
            .context("failed to insert unsubscribe record")?;
        Ok(())
    }

    fn add_suppression(&self, record: &SuppressionRecord) -> Result<()> {
        if record.email.is_none() && record.domain.is_none() && record.identity_hash.is_none() {
            return Err(anyhow!(
                "suppression requires at least one of email, domain, identity_hash"
            ));
        }
        let email = record
            .email
            .as_deref()
            .map(|value| value.trim().to_ascii_lowercase());
        let domain = record
            .domain
            .as_deref()
            .map(|value| value.trim().to_ascii_lowercase());
        let identity_hash = record.identity_hash.as_deref().map(str::trim);
        // An empty identifier would match leads that lack that identifier
        // entirely (e.g. an address with no parseable domain).
        for (field, value) in [
            ("email", email.as_deref()),
            ("domain", domain.as_deref()),
            ("identity_hash", identity_hash),
        ] {
            if value == Some("") {
                return Err(anyhow!("suppression {field} MUST be non-empty when given"));
            }
        }
        self.conn
            .execute(
                "INSERT INTO suppressions(email, domain, identity_hash, reason, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![email, domain, identity_hash, record.reason, rfc3339(record.created_at)?],
            )
            .context("failed to insert suppression record")?;
        Ok(())
    }
}

/// Whole-second RFC3339 so stored timestamps are fixed-width and their
/// lexicographic order matches time order inside SQL comparisons.
fn rfc3339(value: DateTimeUtc) -> Result<String> {
    let truncated = value
        .replace_nanosecond(0)
        .map_err(|err| anyhow!("invalid timestamp: {err}"))?;
    truncated
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid RFC3339 value: {err}"))
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("counter delta too large for sqlite"))
}

fn invalid_column(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn parse_ulid_column(index: usize, raw: &str) -> Result<Ulid, rusqlite::Error> {
    Ulid::from_str(raw).map_err(|err| invalid_column(index, format!("invalid ULID '{raw}': {err}")))
}

fn parse_datetime_column(index: usize, raw: &str) -> Result<DateTimeUtc, rusqlite::Error> {
    OffsetDateTime::parse(raw, &time::format_description::well_known::Rfc3339)
        .map_err(|err| invalid_column(index, format!("invalid timestamp '{raw}': {err}")))
}

fn parse_u32_column(index: usize, raw: i64) -> Result<u32, rusqlite::Error> {
    u32::try_from(raw).map_err(|_| invalid_column(index, format!("invalid u32 value: {raw}")))
}

fn campaign_from_row(row: &Row<'_>) -> Result<CampaignRecord, rusqlite::Error> {
    let campaign_raw: String = row.get(0)?;
    let status_raw: String = row.get(2)?;
    let status = CampaignStatus::parse(&status_raw)
        .ok_or_else(|| invalid_column(2, format!("invalid campaign status: {status_raw}")))?;
    let sequence_raw: String = row.get(6)?;
    let sequence: Vec<String> = serde_json::from_str(&sequence_raw)
        .map_err(|err| invalid_column(6, format!("invalid sequence_json: {err}")))?;
    let created_raw: String = row.get(10)?;

    Ok(CampaignRecord {
        campaign_id: CampaignId(parse_ulid_column(0, &campaign_raw)?),
        name: row.get(1)?,
        status,
        kill_switch: row.get::<_, i64>(3)? == 1,
        channel: row.get(4)?,
        sequence_name: row.get(5)?,
        sequence,
        cooldown_hours: row.get(7)?,
        daily_quota: parse_u32_column(8, row.get(8)?)?,
        max_retries: parse_u32_column(9, row.get(9)?)?,
        created_at: parse_datetime_column(10, &created_raw)?,
    })
}

fn run_from_row(row: &Row<'_>) -> Result<CampaignRun, rusqlite::Error> {
    let run_raw: String = row.get(0)?;
    let campaign_raw: String = row.get(1)?;
    let status_raw: String = row.get(2)?;
    let status = RunStatus::parse(&status_raw)
        .ok_or_else(|| invalid_column(2, format!("invalid run status: {status_raw}")))?;
    let lease_raw: String = row.get(4)?;
    let started_raw: String = row.get(5)?;
    let completed_raw: Option<String> = row.get(6)?;

    Ok(CampaignRun {
        run_id: RunId(parse_ulid_column(0, &run_raw)?),
        campaign_id: CampaignId(parse_ulid_column(1, &campaign_raw)?),
        status,
        leaseholder: row.get(3)?,
        lease_expires_at: parse_datetime_column(4, &lease_raw)?,
        started_at: parse_datetime_column(5, &started_raw)?,
        completed_at: completed_raw
            .as_deref()
            .map(|raw| parse_datetime_column(6, raw))
            .transpose()?,
        leads_processed: u64::try_from(row.get::<_, i64>(7)?).unwrap_or(0),
        jobs_created: u64::try_from(row.get::<_, i64>(8)?).unwrap_or(0),
        attempts_succeeded: u64::try_from(row.get::<_, i64>(9)?).unwrap_or(0),
        attempts_failed: u64::try_from(row.get::<_, i64>(10)?).unwrap_or(0),
    })
}

fn lead_from_row(row: &Row<'_>) -> Result<Lead, rusqlite::Error> {
    let lead_raw: String = row.get(0)?;
    let campaign_raw: String = row.get(1)?;
    let status_raw: String = row.get(4)?;
    let status = LeadStatus::parse(&status_raw)
        .ok_or_else(|| invalid_column(4, format!("invalid lead status: {status_raw}")))?;
    let consent_raw: String = row.get(5)?;
    let consent = ConsentStatus::parse(&consent_raw)
        .ok_or_else(|| invalid_column(5, format!("invalid consent status: {consent_raw}")))?;
    let next_eligible_raw: String = row.get(8)?;
    let last_contacted_raw: Option<String> = row.get(9)?;
    let created_raw: String = row.get(10)?;

    Ok(Lead {
        lead_id: LeadId(parse_ulid_column(0, &lead_raw)?),
        campaign_id: CampaignId(parse_ulid_column(1, &campaign_raw)?),
        email: row.get(2)?,
        identity_hash: row.get(3)?,
        status,
        consent,
        sequence_name: row.get(6)?,
        step_index: parse_u32_column(7, row.get(7)?)?,
        next_eligible_at: parse_datetime_column(8, &next_eligible_raw)?,
        last_contacted_at: last_contacted_raw
            .as_deref()
            .map(|raw| parse_datetime_column(9, raw))
            .transpose()?,
        created_at: parse_datetime_column(10, &created_raw)?,
    })
}

fn job_from_row(row: &Row<'_>) -> Result<DispatchJob, rusqlite::Error> {
    let job_raw: String = row.get(0)?;
    let campaign_raw: String = row.get(1)?;
    let lead_raw: String = row.get(2)?;
    let status_raw: String = row.get(6)?;
    let status = JobStatus::parse(&status_raw)
        .ok_or_else(|| invalid_column(6, format!("invalid job status: {status_raw}")))?;
    let next_retry_raw: Option<String> = row.get(9)?;
    let created_raw: String = row.get(12)?;
    let updated_raw: String = row.get(13)?;

    Ok(DispatchJob {
        job_id: JobId(parse_ulid_column(0, &job_raw)?),
        campaign_id: CampaignId(parse_ulid_column(1, &campaign_raw)?),
        lead_id: LeadId(parse_ulid_column(2, &lead_raw)?),
        idempotency_key: row.get(3)?,
        message_id: row.get(4)?,
        step_index: parse_u32_column(5, row.get(5)?)?,
        status,
        retry_count: parse_u32_column(7, row.get(7)?)?,
        max_retries: parse_u32_column(8, row.get(8)?)?,
        next_retry_at: next_retry_raw
            .as_deref()
            .map(|raw| parse_datetime_column(9, raw))
            .transpose()?,
        provider_reference: row.get(10)?,
        error_text: row.get(11)?,
        created_at: parse_datetime_column(12, &created_raw)?,
        updated_at: parse_datetime_column(13, &updated_raw)?,
    })
}
