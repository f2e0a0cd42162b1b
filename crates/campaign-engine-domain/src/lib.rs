#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};
use ulid::Ulid;

pub type DateTimeUtc = OffsetDateTime;

/// Base delay for the exponential retry schedule, in seconds.
pub const BASE_BACKOFF_SECONDS: i64 = 300;
/// Default contact cooldown applied after a successful dispatch.
pub const DEFAULT_COOLDOWN_HOURS: i64 = 24;
/// Default maximum delivery attempts per dispatch job.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Hard upper bound on leads touched in a single tick, regardless of the
/// requested batch size.
pub const PER_TICK_HARD_CAP: u32 = 100;
/// Default exclusive-lease duration for a campaign run.
pub const DEFAULT_LEASE_SECONDS: i64 = 120;
/// The lease is re-extended after this many leads inside a batch.
pub const LEASE_REFRESH_INTERVAL: u64 = 25;

#[derive(Debug, thiserror::Error)]
pub enum DomainError {
    #[error("invalid {field} value: {value}")]
    InvalidStatus { field: &'static str, value: String },
    #[error("{field} MUST be non-empty")]
    EmptyField { field: &'static str },
}

macro_rules! ulid_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
        )]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = ulid::DecodeError;

            fn from_str(input: &str) -> Result<Self, Self::Err> {
                Ok(Self(Ulid::from_string(input)?))
            }
        }
    };
}

ulid_id!(CampaignId);
ulid_id!(RunId);
ulid_id!(LeadId);
ulid_id!(JobId);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Active,
    Paused,
    Archived,
}

impl CampaignStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Archived => "archived",
        }
    }

    #[must_use]
    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Claimed,
    Running,
    Stopped,
    Failed,
    Completed,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claimed => "claimed",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Completed => "completed",
        }
    }

    #[must_use]
    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "claimed" => Some(Self::Claimed),
            "running" => Some(Self::Running),
            "stopped" => Some(Self::Stopped),
            "failed" => Some(Self::Failed),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    /// A run in a terminal status no longer holds its lease.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed | Self::Completed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    New,
    Contacted,
    Completed,
    Dnc,
    Failed,
}

impl LeadStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Contacted => "contacted",
            Self::Completed => "completed",
            Self::Dnc => "dnc",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "new" => Some(Self::New),
            "contacted" => Some(Self::Contacted),
            "completed" => Some(Self::Completed),
            "dnc" => Some(Self::Dnc),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ConsentStatus {
    Granted,
    Unknown,
    DoNotContact,
}

impl ConsentStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Granted => "granted",
            Self::Unknown => "unknown",
            Self::DoNotContact => "do_not_contact",
        }
    }

    #[must_use]
    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "granted" => Some(Self::Granted),
            "unknown" => Some(Self::Unknown),
            "do_not_contact" => Some(Self::DoNotContact),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Sent,
    SentProof,
    Failed,
    RetryScheduled,
    FailedPermanent,
}

impl JobStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::SentProof => "sent_proof",
            Self::Failed => "failed",
            Self::RetryScheduled => "retry_scheduled",
            Self::FailedPermanent => "failed_permanent",
        }
    }

    #[must_use]
    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "sent" => Some(Self::Sent),
            "sent_proof" => Some(Self::SentProof),
            "failed" => Some(Self::Failed),
            "retry_scheduled" => Some(Self::RetryScheduled),
            "failed_permanent" => Some(Self::FailedPermanent),
            _ => None,
        }
    }

    /// Delivered statuses make a later attempt with the same idempotency key
    /// a duplicate rather than a retry.
    #[must_use]
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Sent | Self::SentProof)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CampaignRecord {
    pub campaign_id: CampaignId,
    pub name: String,
    pub status: CampaignStatus,
    pub kill_switch: bool,
    pub channel: String,
    pub sequence_name: String,
    pub sequence: Vec<String>,
    pub cooldown_hours: i64,
    pub daily_quota: u32,
    pub max_retries: u32,
    pub created_at: DateTimeUtc,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CampaignRun {
    pub run_id: RunId,
    pub campaign_id: CampaignId,
    pub status: RunStatus,
    pub leaseholder: String,
    pub lease_expires_at: DateTimeUtc,
    pub started_at: DateTimeUtc,
    pub completed_at: Option<DateTimeUtc>,
    pub leads_processed: u64,
    pub jobs_created: u64,
    pub attempts_succeeded: u64,
    pub attempts_failed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lead {
    pub lead_id: LeadId,
    pub campaign_id: CampaignId,
    pub email: String,
    pub identity_hash: String,
    pub status: LeadStatus,
    pub consent: ConsentStatus,
    pub sequence_name: String,
    pub step_index: u32,
    pub next_eligible_at: DateTimeUtc,
    pub last_contacted_at: Option<DateTimeUtc>,
    pub created_at: DateTimeUtc,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DispatchJob {
    pub job_id: JobId,
    pub campaign_id: CampaignId,
    pub lead_id: LeadId,
    pub idempotency_key: String,
    pub message_id: String,
    pub step_index: u32,
    pub status: JobStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: Option<DateTimeUtc>,
    pub provider_reference: Option<String>,
    pub error_text: Option<String>,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnsubscribeRecord {
    pub email: String,
    pub created_at: DateTimeUtc,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SuppressionRecord {
    pub email: Option<String>,
    pub domain: Option<String>,
    pub identity_hash: Option<String>,
    pub reason: String,
    pub created_at: DateTimeUtc,
}

/// Per-tick outcome tallies. Every skip and failure carries an explicit
/// reason; there is no silent path.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TickCounters {
    pub leads_processed: u64,
    pub jobs_created: u64,
    pub leads_completed: u64,
    pub skipped_dnc: u64,
    pub skipped_unsubscribed: u64,
    pub skipped_suppressed: u64,
    pub skipped_idempotent: u64,
    pub attempts_succeeded: u64,
    pub attempts_failed: u64,
}

impl TickCounters {
    #[must_use]
    pub fn merged(&self, other: &Self) -> Self {
        Self {
            leads_processed: self.leads_processed + other.leads_processed,
            jobs_created: self.jobs_created + other.jobs_created,
            leads_completed: self.leads_completed + other.leads_completed,
            skipped_dnc: self.skipped_dnc + other.skipped_dnc,
            skipped_unsubscribed: self.skipped_unsubscribed + other.skipped_unsubscribed,
            skipped_suppressed: self.skipped_suppressed + other.skipped_suppressed,
            skipped_idempotent: self.skipped_idempotent + other.skipped_idempotent,
            attempts_succeeded: self.attempts_succeeded + other.attempts_succeeded,
            attempts_failed: self.attempts_failed + other.attempts_failed,
        }
    }
}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc()
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Deterministic idempotency key for one logical dispatch attempt.
///
/// Stable across restarts and leaseholders: two ticks that try to send the
/// same message at the same step to the same lead derive the same key.
#[must_use]
pub fn idempotency_key(
    campaign_id: CampaignId,
    lead_id: LeadId,
    message_id: &str,
    step_index: u32,
) -> String {
    hash_bytes(format!("{campaign_id}:{lead_id}:{message_id}:{step_index}").as_bytes())
}

/// Stable hash of a contact identity for block-list matching.
#[must_use]
pub fn hash_identity(email: &str) -> String {
    hash_bytes(email.trim().to_ascii_lowercase().as_bytes())
}

/// Domain part of an email address, lowercased.
#[must_use]
pub fn email_domain(email: &str) -> Option<String> {
    let (_, domain) = email.rsplit_once('@')?;
    if domain.is_empty() {
        return None;
    }
    Some(domain.to_ascii_lowercase())
}

/// Delay before the n-th retry: `BASE_BACKOFF_SECONDS * 2^retry_count`.
///
/// `retry_count` here is the count *after* incrementing for the attempt
/// being scheduled, so the first retry waits 600s, the second 1200s.
#[must_use]
pub fn retry_backoff(retry_count: u32) -> Duration {
    let factor = 2_i64.checked_pow(retry_count).unwrap_or(i64::MAX);
    Duration::seconds(BASE_BACKOFF_SECONDS.saturating_mul(factor))
}

/// Ensure a string field is non-empty after trimming.
///
/// # Errors
/// Returns `DomainError::EmptyField` when the value is empty/whitespace.
pub fn ensure_non_empty(field: &'static str, value: &str) -> Result<(), DomainError> {
    if value.trim().is_empty() {
        return Err(DomainError::EmptyField { field });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{
        email_domain, hash_identity, idempotency_key, retry_backoff, CampaignId, ConsentStatus,
        JobStatus, LeadId, LeadStatus, RunStatus, TickCounters, BASE_BACKOFF_SECONDS,
    };
    use time::Duration;

    #[test]
    fn idempotency_key_is_deterministic() {
        let campaign = CampaignId::new();
        let lead = LeadId::new();
        let first = idempotency_key(campaign, lead, "intro", 0);
        let second = idempotency_key(campaign, lead, "intro", 0);
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
    }

    #[test]
    fn idempotency_key_varies_with_every_component() {
        let campaign = CampaignId::new();
        let lead = LeadId::new();
        let base = idempotency_key(campaign, lead, "intro", 0);
        assert_ne!(base, idempotency_key(CampaignId::new(), lead, "intro", 0));
        assert_ne!(base, idempotency_key(campaign, LeadId::new(), "intro", 0));
        assert_ne!(base, idempotency_key(campaign, lead, "follow-up-1", 0));
        assert_ne!(base, idempotency_key(campaign, lead, "intro", 1));
    }

    #[test]
    fn backoff_doubles_per_retry() {
        assert_eq!(retry_backoff(1), Duration::seconds(BASE_BACKOFF_SECONDS * 2));
        assert_eq!(retry_backoff(2), Duration::seconds(BASE_BACKOFF_SECONDS * 4));
        assert_eq!(retry_backoff(3), Duration::seconds(BASE_BACKOFF_SECONDS * 8));
    }

    #[test]
    fn backoff_saturates_instead_of_overflowing() {
        let huge = retry_backoff(63);
        assert!(huge > Duration::seconds(BASE_BACKOFF_SECONDS));
    }

    #[test]
    fn status_round_trips() {
        for status in [
            RunStatus::Claimed,
            RunStatus::Running,
            RunStatus::Stopped,
            RunStatus::Failed,
            RunStatus::Completed,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        for status in [
            LeadStatus::New,
            LeadStatus::Contacted,
            LeadStatus::Completed,
            LeadStatus::Dnc,
            LeadStatus::Failed,
        ] {
            assert_eq!(LeadStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::parse("bogus"), None);
        assert_eq!(
            ConsentStatus::parse("do_not_contact"),
            Some(ConsentStatus::DoNotContact)
        );
    }

    #[test]
    fn terminal_and_delivered_predicates() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(JobStatus::Sent.is_delivered());
        assert!(JobStatus::SentProof.is_delivered());
        assert!(!JobStatus::RetryScheduled.is_delivered());
        assert!(!JobStatus::FailedPermanent.is_delivered());
    }

    #[test]
    fn identity_hash_normalizes_case_and_whitespace() {
        assert_eq!(hash_identity(" Ada@Example.COM "), hash_identity("ada@example.com"));
    }

    #[test]
    fn email_domain_extraction() {
        assert_eq!(email_domain("ada@Example.com"), Some("example.com".to_string()));
        assert_eq!(email_domain("no-at-sign"), None);
        assert_eq!(email_domain("trailing@"), None);
    }

    #[test]
    fn counters_merge_fieldwise() {
        let first = TickCounters {
            leads_processed: 2,
            jobs_created: 1,
            skipped_dnc: 1,
            ..TickCounters::default()
        };
        let second = TickCounters {
            leads_processed: 3,
            attempts_failed: 1,
            ..TickCounters::default()
        };
        let merged = first.merged(&second);
        assert_eq!(merged.leads_processed, 5);
        assert_eq!(merged.jobs_created, 1);
        assert_eq!(merged.skipped_dnc, 1);
        assert_eq!(merged.attempts_failed, 1);
    }
}
