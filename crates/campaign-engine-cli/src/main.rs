use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, Result};
use campaign_engine::{
    DailyCapQuotaProvider, Engine, SystemClock, TickConfig,
};
use campaign_engine_domain::{
    ensure_non_empty, hash_identity, now_utc, CampaignId, CampaignRecord, CampaignStatus,
    ConsentStatus, Lead, LeadId, LeadStatus, SuppressionRecord, UnsubscribeRecord,
    DEFAULT_COOLDOWN_HOURS, DEFAULT_LEASE_SECONDS, DEFAULT_MAX_RETRIES,
};
use campaign_engine_sender::{HttpJsonSender, MockSender, SendCapability};
use campaign_engine_store_core::CampaignStore;
use campaign_engine_store_sqlite::SqliteCampaignStore;
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use time::Duration;

#[derive(Debug, Parser)]
#[command(name = "campaign-engine")]
#[command(about = "Recurring batch dispatcher for outreach campaign sequences")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create or upgrade the campaign database schema.
    Migrate {
        #[arg(long)]
        db: PathBuf,
    },
    Campaign(CampaignArgs),
    Lead(LeadArgs),
    Unsubscribe(UnsubscribeArgs),
    Suppress(SuppressArgs),
    /// Execute one tick for a campaign.
    Tick(TickArgs),
    /// List runs for a campaign as JSON lines.
    Runs {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        campaign_id: String,
    },
    /// List dispatch jobs for a campaign as JSON lines.
    Jobs {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        campaign_id: String,
    },
}

#[derive(Debug, Args)]
struct CampaignArgs {
    #[command(subcommand)]
    command: CampaignSubcommand,
}

#[derive(Debug, Subcommand)]
enum CampaignSubcommand {
    Create {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "email")]
        channel: String,
        #[arg(long, default_value = "default")]
        sequence_name: String,
        /// Comma-separated ordered message ids.
        #[arg(long)]
        sequence: String,
        #[arg(long, default_value_t = DEFAULT_COOLDOWN_HOURS)]
        cooldown_hours: i64,
        #[arg(long, default_value_t = 100)]
        daily_quota: u32,
        #[arg(long, default_value_t = DEFAULT_MAX_RETRIES)]
        max_retries: u32,
    },
    List {
        #[arg(long)]
        db: PathBuf,
    },
    Pause {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        campaign_id: String,
    },
    Resume {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        campaign_id: String,
    },
    Archive {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        campaign_id: String,
    },
    /// Engage or release the campaign kill switch.
    Kill {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        campaign_id: String,
        #[arg(long, default_value_t = false)]
        release: bool,
    },
}

#[derive(Debug, Args)]
struct LeadArgs {
    #[command(subcommand)]
    command: LeadSubcommand,
}

#[derive(Debug, Subcommand)]
enum LeadSubcommand {
    Add {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        campaign_id: String,
        #[arg(long)]
        email: String,
        #[arg(long, default_value = "unknown")]
        consent: String,
    },
    List {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        campaign_id: String,
    },
}

#[derive(Debug, Args)]
struct UnsubscribeArgs {
    #[command(subcommand)]
    command: UnsubscribeSubcommand,
}

#[derive(Debug, Subcommand)]
enum UnsubscribeSubcommand {
    Add {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        email: String,
    },
}

#[derive(Debug, Args)]
struct SuppressArgs {
    #[command(subcommand)]
    command: SuppressSubcommand,
}

#[derive(Debug, Subcommand)]
enum SuppressSubcommand {
    Add {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        domain: Option<String>,
        /// Raw email to suppress by identity hash.
        #[arg(long)]
        identity: Option<String>,
        #[arg(long)]
        reason: String,
    },
}

#[derive(Debug, Args)]
struct TickArgs {
    #[arg(long)]
    db: PathBuf,
    #[arg(long)]
    campaign_id: String,
    #[arg(long, default_value_t = 50)]
    batch_size: u32,
    #[arg(long, default_value_t = DEFAULT_LEASE_SECONDS)]
    lease_seconds: i64,
    #[arg(long, default_value = "campaign-engine-cli")]
    leaseholder: String,
    /// Delivery channel: mock, mock-proof, or http.
    #[arg(long, default_value = "mock")]
    sender: String,
    /// JSON params for the http sender (url, timeout_ms, headers,
    /// auth_bearer_env).
    #[arg(long)]
    sender_params: Option<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Migrate { db } => {
            open_store(&db)?;
            println!("{}", json!({"migrated": true}));
            Ok(())
        }
        Commands::Campaign(args) => campaign_command(args),
        Commands::Lead(args) => lead_command(args),
        Commands::Unsubscribe(args) => unsubscribe_command(args),
        Commands::Suppress(args) => suppress_command(args),
        Commands::Tick(args) => tick_command(&args),
        Commands::Runs { db, campaign_id } => {
            let store = open_store(&db)?;
            for run in store.list_runs(parse_campaign_id(&campaign_id)?)? {
                println!("{}", serde_json::to_string(&run)?);
            }
            Ok(())
        }
        Commands::Jobs { db, campaign_id } => {
            let store = open_store(&db)?;
            for job in store.list_jobs(parse_campaign_id(&campaign_id)?)? {
                println!("{}", serde_json::to_string(&job)?);
            }
            Ok(())
        }
    }
}

fn campaign_command(args: CampaignArgs) -> Result<()> {
    match args.command {
        CampaignSubcommand::Create {
            db,
            name,
            channel,
            sequence_name,
            sequence,
            cooldown_hours,
            daily_quota,
            max_retries,
        } => {
            ensure_non_empty("name", &name)?;
            let messages: Vec<String> = sequence
                .split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(str::to_string)
                .collect();
            if messages.is_empty() {
                return Err(anyhow!("--sequence must name at least one message id"));
            }

            let store = open_store(&db)?;
            let campaign = CampaignRecord {
                campaign_id: CampaignId::new(),
                name,
                status: CampaignStatus::Active,
                kill_switch: false,
                channel,
                sequence_name,
                sequence: messages,
                cooldown_hours,
                daily_quota,
                max_retries,
                created_at: now_utc(),
            };
            store.upsert_campaign(&campaign)?;
            println!("{}", json!({"campaign_id": campaign.campaign_id.to_string()}));
        }
        CampaignSubcommand::List { db } => {
            let store = open_store(&db)?;
            for campaign in store.list_campaigns()? {
                println!("{}", serde_json::to_string(&campaign)?);
            }
        }
        CampaignSubcommand::Pause { db, campaign_id } => {
            set_status(&db, &campaign_id, CampaignStatus::Paused)?;
        }
        CampaignSubcommand::Resume { db, campaign_id } => {
            set_status(&db, &campaign_id, CampaignStatus::Active)?;
        }
        CampaignSubcommand::Archive { db, campaign_id } => {
            set_status(&db, &campaign_id, CampaignStatus::Archived)?;
        }
        CampaignSubcommand::Kill {
            db,
            campaign_id,
            release,
        } => {
            let store = open_store(&db)?;
            let campaign_id = parse_campaign_id(&campaign_id)?;
            store.set_kill_switch(campaign_id, !release)?;
            println!(
                "{}",
                json!({"campaign_id": campaign_id.to_string(), "kill_switch": !release})
            );
        }
    }
    Ok(())
}

fn lead_command(args: LeadArgs) -> Result<()> {
    match args.command {
        LeadSubcommand::Add {
            db,
            campaign_id,
            email,
            consent,
        } => {
            ensure_non_empty("email", &email)?;
            let consent = ConsentStatus::parse(&consent)
                .ok_or_else(|| anyhow!("invalid consent value '{consent}'"))?;
            let store = open_store(&db)?;
            let campaign_id = parse_campaign_id(&campaign_id)?;
            let campaign = store
                .get_campaign(campaign_id)?
                .ok_or_else(|| anyhow!("campaign {campaign_id} not found"))?;

            let lead = Lead {
                lead_id: LeadId::new(),
                campaign_id,
                email: email.trim().to_ascii_lowercase(),
                identity_hash: hash_identity(&email),
                status: LeadStatus::New,
                consent,
                sequence_name: campaign.sequence_name,
                step_index: 0,
                next_eligible_at: now_utc(),
                last_contacted_at: None,
                created_at: now_utc(),
            };
            store.insert_lead(&lead)?;
            println!("{}", json!({"lead_id": lead.lead_id.to_string()}));
        }
        LeadSubcommand::List { db, campaign_id } => {
            let store = open_store(&db)?;
            for lead in store.list_leads(parse_campaign_id(&campaign_id)?)? {
                println!("{}", serde_json::to_string(&lead)?);
            }
        }
    }
    Ok(())
}

fn unsubscribe_command(args: UnsubscribeArgs) -> Result<()> {
    match args.command {
        UnsubscribeSubcommand::Add { db, email } => {
            ensure_non_empty("email", &email)?;
            let store = open_store(&db)?;
            store.add_unsubscribe(&UnsubscribeRecord {
                email,
                created_at: now_utc(),
            })?;
            println!("{}", json!({"unsubscribed": true}));
        }
    }
    Ok(())
}

fn suppress_command(args: SuppressArgs) -> Result<()> {
    match args.command {
        SuppressSubcommand::Add {
            db,
            email,
            domain,
            identity,
            reason,
        } => {
            ensure_non_empty("reason", &reason)?;
            let store = open_store(&db)?;
            store.add_suppression(&SuppressionRecord {
                email,
                domain,
                identity_hash: identity.as_deref().map(hash_identity),
                reason,
                created_at: now_utc(),
            })?;
            println!("{}", json!({"suppressed": true}));
        }
    }
    Ok(())
}

fn tick_command(args: &TickArgs) -> Result<()> {
    let store = open_store(&args.db)?;
    let campaign_id = parse_campaign_id(&args.campaign_id)?;

    let sender: Box<dyn SendCapability> = match args.sender.as_str() {
        "mock" => Box::new(MockSender::new()),
        "mock-proof" => Box::new(MockSender::with_proof()),
        "http" => {
            let raw = args
                .sender_params
                .as_deref()
                .ok_or_else(|| anyhow!("--sender http requires --sender-params"))?;
            let params = serde_json::from_str(raw)?;
            Box::new(HttpJsonSender::from_params(&params)?)
        }
        other => return Err(anyhow!("unknown sender '{other}'")),
    };

    let quota = DailyCapQuotaProvider::new(&store);
    let clock = SystemClock;
    let engine = Engine::new(&store, sender.as_ref(), &quota, &clock);
    let config = TickConfig {
        batch_size: args.batch_size,
        lease_duration: Duration::seconds(args.lease_seconds),
        leaseholder: args.leaseholder.clone(),
    };

    let summary = engine.tick(campaign_id, &config)?;
    println!("{}", serde_json::to_string(&summary)?);
    Ok(())
}

fn open_store(db: &Path) -> Result<SqliteCampaignStore> {
    let store = SqliteCampaignStore::open(db)?;
    store.migrate()?;
    Ok(store)
}

fn set_status(db: &Path, campaign_id: &str, status: CampaignStatus) -> Result<()> {
    let store = open_store(db)?;
    let campaign_id = parse_campaign_id(campaign_id)?;
    store.set_campaign_status(campaign_id, status)?;
    println!(
        "{}",
        json!({"campaign_id": campaign_id.to_string(), "status": status.as_str()})
    );
    Ok(())
}

fn parse_campaign_id(raw: &str) -> Result<CampaignId> {
    CampaignId::from_str(raw).map_err(|err| anyhow!("invalid campaign id '{raw}': {err}"))
}
