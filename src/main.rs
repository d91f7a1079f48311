//! Referral Store CLI
//!
//! Operates the referral store in a local SQLite database. Every command
//! prints its result as JSON on stdout; logs go to stderr.
//!
//! ## Usage
//!
//! ```bash
//! # Create the database and a page
//! referral-store init
//! referral-store page-add launch --title "Launch page"
//!
//! # Someone follows alice's link and signs up
//! referral-store click launch --handle alice
//! referral-store submit launch --handle alice --name Bob --email bob@example.org
//!
//! # Inspect the hierarchy
//! referral-store upline <node-id>
//! referral-store stats alice --page launch
//! referral-store leaderboard launch --limit 10
//!
//! # Administrative moves
//! referral-store reassign <node-id> <new-parent-id> --actor admin
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use referral_store::db::leads::LeadQuery;
use referral_store::db::{closure, pages};
use referral_store::services::spawn_logging_listener;
use referral_store::{Applicant, Config, OperatorContext, ReferralDb, Services};

#[derive(Parser, Debug)]
#[command(name = "referral-store")]
#[command(about = "Referral attribution store over a closure-table hierarchy")]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "REFERRAL_STORE_CONFIG")]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long, env = "REFERRAL_STORE_DIR")]
    storage_dir: Option<PathBuf>,

    /// Base URL for generated referral links
    #[arg(long, env = "REFERRAL_SHARE_BASE_URL")]
    share_base_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

/// Node given by id, or by handle when `--page` is set
#[derive(clap::Args, Debug)]
struct NodeArg {
    /// Node id, or handle together with --page
    node: String,

    /// Page the handle belongs to
    #[arg(long)]
    page: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the database and write a default config
    Init,

    /// Register a landing page
    PageAdd {
        page_id: String,
        #[arg(long, default_value = "")]
        title: String,
        #[arg(long)]
        owner: Option<String>,
    },

    /// Enable or disable a landing page
    PageActive {
        page_id: String,
        #[arg(action = clap::ArgAction::Set)]
        active: bool,
    },

    /// Attribute a capture-form submission
    Submit {
        page_id: String,
        /// Handle from the link the applicant followed
        #[arg(long)]
        handle: Option<String>,
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        phone: Option<String>,
    },

    /// Count a click on a shared link
    Click {
        page_id: String,
        #[arg(long)]
        handle: Option<String>,
    },

    /// Ancestors of a node, nearest first
    Upline(NodeArg),

    /// Descendants of a node, shallowest first
    Downline(NodeArg),

    /// Direct referrals with owner details
    Referrals(NodeArg),

    /// Subtree statistics
    Stats(NodeArg),

    /// Performance score
    Score(NodeArg),

    /// Paged detail of direct referrals
    LevelOne {
        #[command(flatten)]
        node: NodeArg,
        #[arg(long, default_value_t = 1)]
        page_no: i64,
        #[arg(long, default_value_t = 20)]
        page_size: i64,
    },

    /// Active nodes of a page ranked by score
    Leaderboard {
        page_id: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Move a node and its downline under a new parent
    Reassign {
        node_id: String,
        new_parent_id: String,
        #[arg(long, default_value = "system")]
        actor: String,
    },

    /// Move a lead to a new status
    LeadStatus {
        lead_id: String,
        status: String,
        #[arg(long, default_value = "system")]
        actor: String,
    },

    /// Look up the lead an email submitted on a page
    Lead { page_id: String, email: String },

    /// List leads of a page, newest first
    Leads {
        page_id: String,
        #[arg(long)]
        referrer: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 100)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },

    /// Check closure invariants for a page
    Check { page_id: String },

    /// Row counts
    Info,
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn resolve_node(services: &Services, arg: &NodeArg) -> anyhow::Result<String> {
    match &arg.page {
        Some(page_id) => {
            let node = services
                .attribution
                .find_node(page_id, &arg.node)?
                .with_context(|| format!("no node with handle '{}' on page {}", arg.node, page_id))?;
            Ok(node.id)
        }
        None => Ok(arg.node.clone()),
    }
}

fn run(command: Command, db: Arc<ReferralDb>, config: Arc<Config>, services: &Services) -> anyhow::Result<()> {
    match command {
        Command::Init => {
            let config_path = config.config_path();
            if !config_path.exists() {
                config.save(&config_path)?;
                info!(path = %config_path.display(), "Created default config");
            }
            print_json(&db.stats()?)
        }
        Command::PageAdd { page_id, title, owner } => {
            let page = db.transaction(|conn| pages::create_page(conn, &page_id, owner.as_deref(), &title))?;
            print_json(&page)
        }
        Command::PageActive { page_id, active } => {
            let updated = db.transaction(|conn| pages::set_page_active(conn, &page_id, active))?;
            if !updated {
                bail!("page not found: {}", page_id);
            }
            print_json(&db.with_conn(|conn| pages::get_page(conn, &page_id))?)
        }
        Command::Submit {
            page_id,
            handle,
            name,
            email,
            phone,
        } => {
            let mut applicant = Applicant::new(name, email);
            if let Some(phone) = phone {
                applicant = applicant.with_phone(phone);
            }
            let result = services
                .attribution
                .submit_lead(&page_id, handle.as_deref(), &applicant)?;
            print_json(&result)
        }
        Command::Click { page_id, handle } => {
            let node = services.attribution.record_click(&page_id, handle.as_deref())?;
            print_json(&node)
        }
        Command::Upline(arg) => print_json(&services.tree.full_upline(&resolve_node(services, &arg)?)?),
        Command::Downline(arg) => print_json(&services.tree.full_downline(&resolve_node(services, &arg)?)?),
        Command::Referrals(arg) => print_json(&services.tree.direct_referrals(&resolve_node(services, &arg)?)?),
        Command::Stats(arg) => print_json(&services.tree.subtree_statistics(&resolve_node(services, &arg)?)?),
        Command::Score(arg) => {
            let node_id = resolve_node(services, &arg)?;
            let score = services.tree.performance_score(&node_id)?;
            print_json(&serde_json::json!({ "node_id": node_id, "score": score }))
        }
        Command::LevelOne { node, page_no, page_size } => {
            let node_id = resolve_node(services, &node)?;
            print_json(&services.tree.level_one_detail(&node_id, page_no, page_size)?)
        }
        Command::Leaderboard { page_id, limit } => print_json(&services.tree.leaderboard(&page_id, limit)?),
        Command::Reassign {
            node_id,
            new_parent_id,
            actor,
        } => {
            let outcome = services
                .reassignment
                .reassign(&OperatorContext::new(actor), &node_id, &new_parent_id)?;
            print_json(&outcome)
        }
        Command::LeadStatus { lead_id, status, actor } => {
            let lead = services
                .attribution
                .update_lead_status(&OperatorContext::new(actor), &lead_id, &status)?;
            print_json(&lead)
        }
        Command::Lead { page_id, email } => print_json(&services.attribution.find_lead(&page_id, &email)?),
        Command::Leads {
            page_id,
            referrer,
            status,
            limit,
            offset,
        } => {
            let query = LeadQuery {
                page_id: Some(page_id),
                referrer_node_id: referrer,
                status,
                limit,
                offset,
            };
            print_json(&services.attribution.list_leads(&query)?)
        }
        Command::Check { page_id } => {
            let violations = db.with_conn(|conn| closure::closure_violations(conn, &page_id))?;
            print_json(&violations)?;
            if !violations.is_empty() {
                bail!("{} closure violations on page {}", violations.len(), page_id);
            }
            Ok(())
        }
        Command::Info => print_json(&db.stats()?),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs on stderr so stdout stays machine readable
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive("referral_store=info".parse()?))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path).with_context(|| format!("loading config {}", path.display()))?,
        None => Config::default(),
    };

    // Apply CLI overrides
    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }
    if let Some(url) = args.share_base_url {
        config.share_base_url = url;
    }
    config.validate()?;

    let db = Arc::new(ReferralDb::open(&config)?);
    let config = Arc::new(config);
    let services = Services::new(db.clone(), config.clone());
    let listener = spawn_logging_listener(services.events.clone());

    let result = run(args.command, db, config, &services);

    // Dropping the bus lets the listener drain and exit
    drop(services);
    listener.await?;

    result
}
