#![forbid(unsafe_code)]

use campaign_engine_domain::{CampaignRecord, CampaignStatus, ConsentStatus, Lead};
use serde::Serialize;

/// Campaign-level verdict, evaluated once before any lead is touched.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TickGate {
    Clear,
    CampaignInactive,
    Paused,
    KillSwitch,
}

/// Per-lead verdict, re-evaluated immediately before each dispatch.
///
/// `KillSwitch` and `QuotaExhausted` stop the remainder of the batch;
/// the skip variants apply to the current lead only.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LeadGate {
    Clear,
    KillSwitch,
    QuotaExhausted,
    DoNotContact,
    Unsubscribed,
    Suppressed { reason: String },
}

/// Inputs the gate cannot derive from the lead itself, read fresh from the
/// store for every lead rather than cached at tick start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeadGateInputs {
    pub kill_switch: bool,
    pub unsubscribed: bool,
    pub suppressed_reason: Option<String>,
    pub remaining_quota: u32,
}

#[must_use]
pub fn evaluate_tick(campaign: &CampaignRecord) -> TickGate {
    if campaign.kill_switch {
        return TickGate::KillSwitch;
    }
    match campaign.status {
        CampaignStatus::Active => TickGate::Clear,
        CampaignStatus::Paused => TickGate::Paused,
        CampaignStatus::Archived => TickGate::CampaignInactive,
    }
}

/// Composes the compliance checks in a fixed precedence: kill switch, then
/// quota, then consent, then the block-lists.
#[must_use]
pub fn evaluate_lead(lead: &Lead, inputs: &LeadGateInputs) -> LeadGate {
    if inputs.kill_switch {
        return LeadGate::KillSwitch;
    }
    if inputs.remaining_quota == 0 {
        return LeadGate::QuotaExhausted;
    }
    if lead.consent == ConsentStatus::DoNotContact {
        return LeadGate::DoNotContact;
    }
    if inputs.unsubscribed {
        return LeadGate::Unsubscribed;
    }
    if let Some(reason) = &inputs.suppressed_reason {
        return LeadGate::Suppressed {
            reason: reason.clone(),
        };
    }
    LeadGate::Clear
}

#[cfg(test)]
mod tests {
    use super::{evaluate_lead, evaluate_tick, LeadGate, LeadGateInputs, TickGate};
    use campaign_engine_domain::{
        now_utc, CampaignId, CampaignRecord, CampaignStatus, ConsentStatus, Lead, LeadId,
        LeadStatus,
    };

    fn fixture_campaign(status: CampaignStatus, kill_switch: bool) -> CampaignRecord {
        CampaignRecord {
            campaign_id: CampaignId::new(),
            name: "spring-launch".to_string(),
            status,
            kill_switch,
            channel: "email".to_string(),
            sequence_name: "default".to_string(),
            sequence: vec!["intro".to_string()],
            cooldown_hours: 24,
            daily_quota: 100,
            max_retries: 3,
            created_at: now_utc(),
        }
    }

    fn fixture_lead(consent: ConsentStatus) -> Lead {
        Lead {
            lead_id: LeadId::new(),
            campaign_id: CampaignId::new(),
            email: "ada@example.com".to_string(),
            identity_hash: "hash".to_string(),
            status: LeadStatus::New,
            consent,
            sequence_name: "default".to_string(),
            step_index: 0,
            next_eligible_at: now_utc(),
            last_contacted_at: None,
            created_at: now_utc(),
        }
    }

    fn clear_inputs() -> LeadGateInputs {
        LeadGateInputs {
            kill_switch: false,
            unsubscribed: false,
            suppressed_reason: None,
            remaining_quota: 10,
        }
    }

    #[test]
    fn active_campaign_is_clear() {
        let campaign = fixture_campaign(CampaignStatus::Active, false);
        assert_eq!(evaluate_tick(&campaign), TickGate::Clear);
    }

    #[test]
    fn paused_and_archived_campaigns_block_the_tick() {
        assert_eq!(
            evaluate_tick(&fixture_campaign(CampaignStatus::Paused, false)),
            TickGate::Paused
        );
        assert_eq!(
            evaluate_tick(&fixture_campaign(CampaignStatus::Archived, false)),
            TickGate::CampaignInactive
        );
    }

    #[test]
    fn kill_switch_outranks_campaign_status() {
        assert_eq!(
            evaluate_tick(&fixture_campaign(CampaignStatus::Active, true)),
            TickGate::KillSwitch
        );
        assert_eq!(
            evaluate_tick(&fixture_campaign(CampaignStatus::Paused, true)),
            TickGate::KillSwitch
        );
    }

    #[test]
    fn clear_lead_passes() {
        let lead = fixture_lead(ConsentStatus::Granted);
        assert_eq!(evaluate_lead(&lead, &clear_inputs()), LeadGate::Clear);
    }

    #[test]
    fn kill_switch_outranks_every_lead_check() {
        let lead = fixture_lead(ConsentStatus::DoNotContact);
        let inputs = LeadGateInputs {
            kill_switch: true,
            unsubscribed: true,
            suppressed_reason: Some("bounce".to_string()),
            remaining_quota: 0,
        };
        assert_eq!(evaluate_lead(&lead, &inputs), LeadGate::KillSwitch);
    }

    #[test]
    fn quota_exhaustion_outranks_skip_reasons() {
        let lead = fixture_lead(ConsentStatus::DoNotContact);
        let inputs = LeadGateInputs {
            remaining_quota: 0,
            ..clear_inputs()
        };
        assert_eq!(evaluate_lead(&lead, &inputs), LeadGate::QuotaExhausted);
    }

    #[test]
    fn dnc_outranks_block_lists() {
        let lead = fixture_lead(ConsentStatus::DoNotContact);
        let inputs = LeadGateInputs {
            unsubscribed: true,
            suppressed_reason: Some("complaint".to_string()),
            ..clear_inputs()
        };
        assert_eq!(evaluate_lead(&lead, &inputs), LeadGate::DoNotContact);
    }

    #[test]
    fn unsubscribe_outranks_suppression() {
        let lead = fixture_lead(ConsentStatus::Granted);
        let inputs = LeadGateInputs {
            unsubscribed: true,
            suppressed_reason: Some("complaint".to_string()),
            ..clear_inputs()
        };
        assert_eq!(evaluate_lead(&lead, &inputs), LeadGate::Unsubscribed);
    }

    #[test]
    fn suppression_carries_its_reason() {
        let lead = fixture_lead(ConsentStatus::Unknown);
        let inputs = LeadGateInputs {
            suppressed_reason: Some("hard_bounce".to_string()),
            ..clear_inputs()
        };
        assert_eq!(
            evaluate_lead(&lead, &inputs),
            LeadGate::Suppressed {
                reason: "hard_bounce".to_string()
            }
        );
    }
}
