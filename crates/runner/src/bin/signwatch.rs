//! signwatch: alert on successful interactive sign-ins from outside the
//! allowed region.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use signwatch_core::config::{load_dotenv, Config, NotifyChannel};
use signwatch_notify::{AlertTemplates, EmailNotifier, GraphMailNotifier, Notification, Notifier};
use signwatch_runner::{
    parse_schedule, watch, AlertFormat, Orchestrator, RunReport, RunSettings,
};
use signwatch_source::{ClientCredentialProvider, CredentialProvider, GraphSignInSource};
use signwatch_watermark::{plan_window, FileWatermarkStore, WatermarkStore, WindowPolicy};

// ── CLI ─────────────────────────────────────────────────────────────

/// Polls the sign-in audit log and mails an alert for suspicious sign-ins.
#[derive(Parser, Debug)]
#[command(name = "signwatch", version, about)]
struct Cli {
    /// Configuration profile; keys resolve as `{PROFILE}_{KEY}` first.
    #[arg(long, env = "SIGNWATCH_PROFILE", default_value = "")]
    profile: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a single run.
    Run {
        /// Fetch and render the alert without sending it or advancing state.
        #[arg(long)]
        dry_run: bool,
    },
    /// Execute runs sequentially on a cron schedule.
    Watch {
        /// 5- or 6-field cron expression.
        #[arg(long, env = "SIGNWATCH_CRON", default_value = "*/15 * * * *")]
        cron: String,
    },
    /// Show the stored watermark and the window the next run would query.
    Status,
    /// Send a test message through the configured channel.
    TestNotify,
}

// ── wiring ──────────────────────────────────────────────────────────

fn build_notifier(
    config: &Config,
    credentials: Arc<dyn CredentialProvider>,
) -> Result<Arc<dyn Notifier>> {
    let sender = config
        .alert
        .sender
        .as_deref()
        .context("SENDER_EMAIL is not set")?;

    let notifier: Arc<dyn Notifier> = match config.alert.channel {
        NotifyChannel::Graph => Arc::new(GraphMailNotifier::new(
            &config.graph.base_url,
            sender,
            credentials,
            config.graph.timeout,
        )?),
        NotifyChannel::Smtp => Arc::new(EmailNotifier::from_config(
            &config.smtp,
            sender,
            config.graph.timeout,
        )?),
    };
    Ok(notifier)
}

fn build_orchestrator(config: &Config, dry_run: bool) -> Result<Orchestrator> {
    let credentials: Arc<dyn CredentialProvider> =
        Arc::new(ClientCredentialProvider::from_config(&config.graph)?);
    let source = Arc::new(GraphSignInSource::from_config(config)?);
    let notifier = build_notifier(config, credentials.clone())?;
    let store = Arc::new(FileWatermarkStore::new(&config.state.path));

    let templates = AlertTemplates::new(
        config.alert.subject_template.clone(),
        config.alert.body_template.clone(),
    )?;
    let format = AlertFormat::new(
        config.alert.allowed_region.clone(),
        config.alert.recipients.clone(),
        templates,
    );

    let settings = RunSettings {
        policy: WindowPolicy::from(&config.window),
        call_timeout: config.graph.call_timeout(),
        fetch_timeout: config.graph.fetch_timeout(),
        lease_ttl: config.state.lease_ttl,
        dry_run,
    };

    Ok(Orchestrator::new(
        credentials,
        source,
        notifier,
        store,
        format,
        settings,
    ))
}

fn print_report(report: &RunReport) {
    if let Some(preview) = &report.preview {
        println!("To: {}", preview.recipients.join(", "));
        println!("Subject: {}\n", preview.subject);
        println!("{}", preview.body);
    }
    match &report.abort {
        Some(err) => warn!(run_id = %report.run_id, error = %err, "run aborted"),
        None => info!(
            run_id = %report.run_id,
            stage = %report.stage,
            matched = report.matched,
            notified = report.notified,
            persisted = ?report.persisted.map(|w| w.to_string()),
            soft_failures = report.soft_failures.len(),
            "run finished"
        ),
    }
}

// ── commands ────────────────────────────────────────────────────────

fn status(config: &Config) -> Result<()> {
    let store = FileWatermarkStore::new(&config.state.path);
    let now = Utc::now();
    let policy = WindowPolicy::from(&config.window);

    match store.read() {
        Ok(Some(w)) => println!("watermark:   {w}"),
        Ok(None) => println!("watermark:   (none stored)"),
        Err(e) => println!("watermark:   unreadable ({e})"),
    }

    let loaded = store.load(now, policy.lookback);
    let window = plan_window(loaded.value, now, &policy);
    println!("next start:  {}", window.start_rfc3339());
    if window.reset {
        println!("note:        stored watermark is in the future and will be reset");
    }

    let lease_path = store.lease_path();
    if lease_path.exists() {
        println!("lease:       held ({})", lease_path.display());
    } else {
        println!("lease:       free");
    }
    Ok(())
}

async fn test_notify(config: &Config) -> Result<()> {
    let credentials: Arc<dyn CredentialProvider> =
        Arc::new(ClientCredentialProvider::from_config(&config.graph)?);
    let notifier = build_notifier(config, credentials)?;

    let notification = Notification {
        recipients: config.alert.recipients.clone(),
        subject: "[Test] signwatch alert channel".to_string(),
        body: format!(
            "This is a test message from signwatch (profile: {}) sent at {}.\n",
            config.profile_label(),
            Utc::now().to_rfc3339()
        ),
    };
    notifier
        .send(&notification)
        .await
        .with_context(|| format!("test message via {} failed", notifier.channel_name()))?;
    info!(channel = notifier.channel_name(), "test message sent");
    Ok(())
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::for_profile(&cli.profile);

    if let Command::Status = cli.command {
        return status(&config);
    }

    config.validate().context("invalid configuration")?;
    config.log_summary();

    match cli.command {
        Command::Run { dry_run } => {
            let orchestrator = build_orchestrator(&config, dry_run)?;
            let report = orchestrator.run().await;
            print_report(&report);
        }
        Command::Watch { cron } => {
            let schedule = parse_schedule(&cron)?;
            let orchestrator = build_orchestrator(&config, false)?;
            info!(cron = %cron, "entering watch mode");
            let shutdown = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "failed to listen for ctrl-c");
                    std::future::pending::<()>().await;
                }
            };
            let runs = watch(&orchestrator, &schedule, shutdown).await;
            info!(runs, "watch mode exited cleanly");
        }
        Command::TestNotify => test_notify(&config).await?,
        Command::Status => {}
    }

    Ok(())
}
