//! Quizlock command-line interface: lock reports, supervisor unlocks, and
//! configuration tooling.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use quizlock_core::{
    build_fingerprint, logging, AttemptId, AttemptLockSummary, BulkUnlockReport, ConfigAccessPolicy,
    LogEventSink, QuizId, QuizlockConfig, RuleProfile, SessionBindingRule, SkipReason,
    UnlockOutcome, UnlockService, UserId,
};
use quizlock_sqlite::{SqliteAttemptDirectory, SqliteLockStore};
use schemars::schema_for;
use serde_json::to_string_pretty;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG: &str = "/etc/quizlock/quizlock.toml";

/// Top-level options shared by every subcommand.
#[derive(Parser, Debug)]
#[command(
    name = "quizlock",
    version,
    about = "Session lock administration for proctored quizzes."
)]
struct Cli {
    /// Path to the Quizlock configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Rule profile to operate on.
    #[arg(long, default_value = "oneconnection")]
    rule: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the attempts of a quiz with their lock state and last unlock.
    Report {
        #[arg(long)]
        quiz: i64,
    },

    /// Show the lock state of one attempt.
    Status { attempt: i64 },

    /// Allow one attempt to continue from a different device.
    Unlock {
        attempt: i64,

        /// Supervisor performing the unlock.
        #[arg(long = "as")]
        actor: i64,
    },

    /// Allow several attempts to continue from a different device.
    UnlockMany {
        #[arg(required = true)]
        attempts: Vec<i64>,

        #[arg(long = "as")]
        actor: i64,
    },

    /// Print the fingerprint a request would produce under the rule's exempt subnets.
    Fingerprint {
        #[arg(long)]
        session_key: String,

        #[arg(long)]
        ip: Option<String>,

        #[arg(long)]
        user_agent: Option<String>,
    },

    /// Turn the rule on for a quiz.
    Enable {
        #[arg(long)]
        quiz: i64,

        #[arg(long = "as")]
        actor: i64,
    },

    /// Turn the rule off for a quiz and drop its locks.
    Disable {
        #[arg(long)]
        quiz: i64,

        #[arg(long = "as")]
        actor: i64,
    },

    /// Erase every unlock audit entry recorded for a supervisor, in every rule.
    ForgetUser { user: i64 },

    /// Validate a configuration file or emit the config schema.
    Validate {
        #[arg(short = 'f', long, default_value = DEFAULT_CONFIG)]
        file: PathBuf,

        /// Output the JSON schema instead of validating a file.
        #[arg(long)]
        schema: bool,
    },
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    logging::init("warn");
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { file, schema } => {
            if schema {
                let schema = schema_for!(QuizlockConfig);
                println!("{}", to_string_pretty(&schema)?);
                return Ok(());
            }

            let cfg = load_config(&file)?;
            let issues = cfg.validate();
            if issues.is_empty() {
                println!("Configuration valid ({} rule profiles).", cfg.rules.len());
            } else {
                eprintln!("Configuration validation failed:");
                for issue in issues {
                    eprintln!("  - {issue}");
                }
                std::process::exit(1);
            }
        }
        Commands::Fingerprint {
            session_key,
            ip,
            user_agent,
        } => {
            let config = load_config(&cli.config)?;
            let profile = resolve_profile(&config, &cli.rule)?;
            let exempt = ip
                .as_deref()
                .map(|addr| profile.exempt.contains(addr))
                .unwrap_or(false);
            let fingerprint = build_fingerprint(
                &session_key,
                ip.as_deref(),
                user_agent.as_deref(),
                &profile.exempt,
            );
            println!("{fingerprint}");
            if ip.is_some() {
                println!(
                    "client IP {} the exempt subnets of `{}`",
                    if exempt { "is inside" } else { "is outside" },
                    profile.name
                );
            }
        }
        Commands::Report { quiz } => {
            let config = load_config(&cli.config)?;
            let profile = resolve_profile(&config, &cli.rule)?;
            let service = unlock_service(&config, &profile)?;
            let rows = service.report(QuizId(quiz))?;
            if rows.is_empty() {
                println!("No attempts recorded for quiz {quiz}.");
            } else {
                print_report_table(&rows);
            }
        }
        Commands::Status { attempt } => {
            let config = load_config(&cli.config)?;
            let profile = resolve_profile(&config, &cli.rule)?;
            let service = unlock_service(&config, &profile)?;
            let summary = service.status(AttemptId(attempt))?;
            let state = if summary.locked {
                "bound to its first client"
            } else {
                "not bound"
            };
            println!(
                "Attempt {} (quiz {}, user {}, {}) is {state}.",
                summary.attempt.attempt_id,
                summary.attempt.quiz_id,
                summary.attempt.user_id,
                summary.attempt.status.label()
            );
            println!("  {}", unlock_cell(&summary));
        }
        Commands::Unlock { attempt, actor } => {
            let config = load_config(&cli.config)?;
            let profile = resolve_profile(&config, &cli.rule)?;
            let service = unlock_service(&config, &profile)?;
            let report = service.unlock(AttemptId(attempt), UserId(actor))?;
            let bulk = BulkUnlockReport {
                succeeded: usize::from(report.succeeded()),
                reports: vec![report],
            };
            print_unlock_summary(&bulk);
        }
        Commands::UnlockMany { attempts, actor } => {
            let config = load_config(&cli.config)?;
            let profile = resolve_profile(&config, &cli.rule)?;
            let service = unlock_service(&config, &profile)?;
            let ids: Vec<AttemptId> = attempts.into_iter().map(AttemptId).collect();
            let bulk = service.unlock_many(&ids, UserId(actor))?;
            print_unlock_summary(&bulk);
        }
        Commands::Enable { quiz, actor } => {
            set_enabled(&cli.config, &cli.rule, quiz, actor, true)?;
        }
        Commands::Disable { quiz, actor } => {
            set_enabled(&cli.config, &cli.rule, quiz, actor, false)?;
        }
        Commands::ForgetUser { user } => {
            let config = load_config(&cli.config)?;
            let user = UserId(user);
            for rule in &config.rules {
                let profile = RuleProfile::from_cfg(rule)?;
                let service = unlock_service(&config, &profile)?;
                let quizzes = service.quizzes_with_audit_by(user)?;
                let erased = service.erase_audit_by_user(user)?;
                println!(
                    "{}: erased {erased} unlock entries across {} quizzes.",
                    profile.name,
                    quizzes.len()
                );
            }
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<QuizlockConfig> {
    QuizlockConfig::load(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

/// Look up the rule profile named on the command line.
fn resolve_profile(config: &QuizlockConfig, name: &str) -> Result<RuleProfile> {
    let cfg = config.rule(name).ok_or_else(|| {
        let known: Vec<&str> = config.rules.iter().map(|rule| rule.name.as_str()).collect();
        anyhow!("no rule profile named `{name}` (configured: {})", known.join(", "))
    })?;
    Ok(RuleProfile::from_cfg(cfg)?)
}

fn unlock_service(
    config: &QuizlockConfig,
    profile: &RuleProfile,
) -> Result<UnlockService<SqliteLockStore, SqliteAttemptDirectory, ConfigAccessPolicy, LogEventSink>>
{
    let db = config.database_path();
    let store = SqliteLockStore::from_config(config, profile)
        .with_context(|| format!("open lock store in {}", db.display()))?;
    let attempts = SqliteAttemptDirectory::open(&db)
        .with_context(|| format!("open attempt table in {}", db.display()))?;
    Ok(UnlockService::new(
        profile.name.clone(),
        store,
        attempts,
        ConfigAccessPolicy::new(&config.access),
        LogEventSink,
    ))
}

fn set_enabled(config_path: &Path, rule: &str, quiz: i64, actor: i64, enabled: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let profile = resolve_profile(&config, rule)?;
    let store = SqliteLockStore::from_config(&config, &profile)?;
    let name = profile.name.clone();
    let binding = SessionBindingRule::new(profile, store, LogEventSink);
    binding.set_quiz_enabled(
        QuizId(quiz),
        enabled,
        UserId(actor),
        &ConfigAccessPolicy::new(&config.access),
    )?;
    info!("rule {name} set to {enabled} for quiz {quiz}");
    println!(
        "Rule `{name}` {} for quiz {quiz}.",
        if enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}

/// Last-unlock column as supervisors see it.
fn unlock_cell(summary: &AttemptLockSummary) -> String {
    match &summary.last_unlock {
        Some(entry) => format!(
            "Allowed by user {} on {}",
            entry.unlocked_by,
            entry.unlocked_at.format("%Y-%m-%d %H:%M:%S UTC")
        ),
        None if !summary.unlockable => "Not possible".to_string(),
        None => String::new(),
    }
}

fn print_report_table(rows: &[AttemptLockSummary]) {
    println!(
        "{:<10} {:<10} {:<16} {:<8} {}",
        "ATTEMPT", "USER", "STATUS", "LOCKED", "CONNECTION CHANGE"
    );
    for row in rows {
        println!(
            "{:<10} {:<10} {:<16} {:<8} {}",
            row.attempt.attempt_id,
            row.attempt.user_id,
            row.attempt.status.label(),
            if row.locked { "yes" } else { "no" },
            unlock_cell(row)
        );
    }
}

fn print_unlock_summary(bulk: &BulkUnlockReport) {
    println!(
        "Connection change allowed for {} attempt(s).",
        bulk.succeeded
    );
    for report in &bulk.reports {
        if let UnlockOutcome::Unlocked {
            lock_removed: false,
            ..
        } = report.outcome
        {
            println!("  - attempt {} held no lock", report.attempt_id);
        }
    }
    for (attempt, reason) in bulk.skipped() {
        let why = match reason {
            SkipReason::NotFound => "not found".to_string(),
            SkipReason::Ineligible(status) => format!("{} attempts cannot be unlocked", status.label()),
            SkipReason::Unauthorized => "not permitted in that quiz".to_string(),
        };
        println!("  - attempt {attempt} skipped: {why}");
    }
}
