use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use serde_json::json;
use tokio::sync::Mutex;

use crate::line::LineClient;
use crate::models::{ReminderReport, ScheduleItem};
use crate::supabase::{Query, SupabaseClient, SCHEDULES};

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Pushes calendar reminders whose time has come and flags them as sent.
#[derive(Clone)]
pub struct ReminderService {
    supabase: SupabaseClient,
    line: LineClient,
    offset: FixedOffset,
    sweep: Arc<Mutex<()>>,
}

impl ReminderService {
    pub fn new(supabase: SupabaseClient, line: LineClient, offset: FixedOffset) -> Self {
        Self {
            supabase,
            line,
            offset,
            sweep: Arc::new(Mutex::new(())),
        }
    }

    pub async fn due_items(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleItem>> {
        let rows = self
            .supabase
            .select(
                &Query::table(SCHEDULES)
                    .select("uuid, elder_user_id, schedule_note, schedule_time, is_reminded")
                    .order("schedule_time", true),
            )
            .await
            .context("failed to load schedules")?;

        let items: Vec<ScheduleItem> = rows
            .into_iter()
            .filter_map(|row| match serde_json::from_value(row) {
                Ok(item) => Some(item),
                Err(err) => {
                    tracing::warn!(error = %err, "skipping undecodable schedule row");
                    None
                }
            })
            .collect();

        Ok(due_reminders(items, now, self.offset))
    }

    /// One sweep. Per-item failures are counted; the item stays pending for the next sweep.
    /// Sweeps from the endpoint and the poller never overlap.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<ReminderReport> {
        let _sweep = self.sweep.lock().await;
        let due = self.due_items(now).await?;
        let mut report = ReminderReport {
            success: true,
            due: due.len(),
            ..ReminderReport::default()
        };

        for item in &due {
            match self.deliver(item).await {
                Ok(()) => {
                    report.sent += 1;
                    tracing::info!(schedule = %item.uuid, "reminder sent");
                }
                Err(err) => {
                    report.failed += 1;
                    tracing::error!(schedule = %item.uuid, error = %err, "reminder failed");
                }
            }
        }

        Ok(report)
    }

    async fn deliver(&self, item: &ScheduleItem) -> Result<()> {
        let recipient = item
            .elder_user_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .context("schedule has no elder_user_id")?;

        self.line.push_text(recipient, &reminder_text(item)).await?;

        self.supabase
            .update(
                SCHEDULES,
                &[("uuid", item.uuid.as_str())],
                &json!({ "is_reminded": true }),
            )
            .await
            .context("reminder sent but flag update failed")?;

        Ok(())
    }

    /// Background sweep every `every`; runs until the task is dropped.
    pub async fn poll_forever(self, every: Duration) {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match self.run_once(Utc::now()).await {
                Ok(report) if report.due > 0 => {
                    tracing::info!(
                        due = report.due,
                        sent = report.sent,
                        failed = report.failed,
                        "reminder sweep done"
                    );
                }
                Ok(_) => {}
                Err(err) => tracing::error!("reminder sweep failed: {err:#}"),
            }
        }
    }
}

pub fn reminder_text(item: &ScheduleItem) -> String {
    format!(
        "🔔 行程提醒：\n{}\n🕒 時間：{}",
        item.schedule_note.as_deref().unwrap_or(""),
        item.schedule_time.as_deref().unwrap_or("")
    )
}

/// Not yet reminded and scheduled at or before `now`. Unparsable times are never due.
pub fn due_reminders(
    items: Vec<ScheduleItem>,
    now: DateTime<Utc>,
    offset: FixedOffset,
) -> Vec<ScheduleItem> {
    items
        .into_iter()
        .filter(|item| !item.is_reminded)
        .filter(|item| {
            item.schedule_time
                .as_deref()
                .and_then(|raw| parse_schedule_time(raw, offset))
                .is_some_and(|at| at <= now)
        })
        .collect()
}

/// RFC 3339 (or Postgres `+08` style) timestamps keep their offset; naive ones use `offset`.
pub fn parse_schedule_time(raw: &str, offset: FixedOffset) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(at.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"] {
        if let Ok(at) = DateTime::parse_from_str(trimmed, format) {
            return Some(at.with_timezone(&Utc));
        }
    }

    NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(trimmed, format).ok())
        .and_then(|naive| offset.from_local_datetime(&naive).single())
        .map(|at| at.with_timezone(&Utc))
}
