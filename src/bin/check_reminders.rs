use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use eldercare::config::AppConfig;
use eldercare::line::LineClient;
use eldercare::reminders::{reminder_text, ReminderService};
use eldercare::supabase::SupabaseClient;

#[derive(Parser, Debug)]
#[command(name = "check_reminders")]
#[command(about = "Push due calendar reminders over LINE once and exit")]
struct Cli {
    /// List what is due without pushing or flagging anything.
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = AppConfig::from_env();
    let timeout = config.request_timeout();
    let supabase = SupabaseClient::new(&config.supabase, timeout)?;
    let line = LineClient::new(&config.line, timeout)?;
    let reminders = ReminderService::new(supabase, line, config.local_offset());

    let now = Utc::now();
    if cli.dry_run {
        let due = reminders.due_items(now).await?;
        println!("{} reminder(s) due", due.len());
        for item in &due {
            println!(
                "[{}] to={} {}",
                item.uuid,
                item.elder_user_id.as_deref().unwrap_or("-"),
                reminder_text(item).replace('\n', " | ")
            );
        }
        return Ok(());
    }

    let report = reminders.run_once(now).await?;
    println!(
        "due={} sent={} failed={}",
        report.due, report.sent, report.failed
    );
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
