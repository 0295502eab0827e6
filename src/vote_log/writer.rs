//! Single-writer CSV appender
//!
//! All appends funnel through one task that owns the file handle, giving a
//! total order over rows; readers only ever see monotonically-growing
//! suffixes. Each append is flushed and fsynced before the caller's ack
//! fires. CSV encoding is minimal RFC-4180 field escaping — quotes around
//! fields containing commas, quotes or newlines, with quotes doubled.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::session_store::InstanceId;

use super::{AppendRequest, Counters, FailureKind, VoteAttempt, VoteStatus};

pub(super) const CSV_HEADER: &str = "timestamp,instance_id,instance_name,time_of_click,status,\
voting_url,cooldown_message,failure_type,failure_reason,initial_vote_count,final_vote_count,\
proxy_ip,session_id,click_attempts,error_message,browser_closed";

/// Open the log file in append mode, writing the header for a new file
pub(super) async fn open_append(path: &Path, is_new: bool) -> Result<tokio::fs::File> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("open vote log {}", path.display()))?;
    if is_new {
        file.write_all(CSV_HEADER.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        file.sync_data().await?;
    }
    Ok(file)
}

/// The writer task: drains the bounded queue until every sender is dropped
pub(super) async fn run_writer(
    mut file: tokio::fs::File,
    mut rx: mpsc::Receiver<AppendRequest>,
    counters: Arc<Counters>,
    last_success: Arc<RwLock<HashMap<InstanceId, DateTime<Utc>>>>,
) {
    while let Some(AppendRequest { attempt, ack }) = rx.recv().await {
        let result = write_row(&mut file, &attempt).await;
        if result.is_ok() {
            update_counters(&counters, &attempt);
            if attempt.status == VoteStatus::Success {
                last_success
                    .write()
                    .insert(attempt.instance_id, attempt.timestamp);
            }
        } else if let Err(ref e) = result {
            error!(instance_id = attempt.instance_id, error = %e, "vote log append failed");
        }
        // A dropped receiver just means the caller gave up waiting.
        let _ = ack.send(result);
    }
    debug!("vote log writer exiting");
}

async fn write_row(file: &mut tokio::fs::File, attempt: &VoteAttempt) -> Result<()> {
    let row = encode_row(attempt);
    file.write_all(row.as_bytes()).await.context("append row")?;
    file.write_all(b"\n").await.context("append newline")?;
    file.flush().await.context("flush vote log")?;
    file.sync_data().await.context("fsync vote log")?;
    Ok(())
}

fn update_counters(counters: &Counters, attempt: &VoteAttempt) {
    counters.total.fetch_add(1, Ordering::AcqRel);
    match attempt.status {
        VoteStatus::Success => counters.successful.fetch_add(1, Ordering::AcqRel),
        VoteStatus::Failed => counters.failed.fetch_add(1, Ordering::AcqRel),
    };
    if attempt.failure_kind == Some(FailureKind::GlobalHourlyLimit) {
        counters.hourly_limit_hits.fetch_add(1, Ordering::AcqRel);
    }
}

pub(super) fn encode_row(a: &VoteAttempt) -> String {
    let fields: [String; 16] = [
        a.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
        a.instance_id.to_string(),
        a.instance_name.clone(),
        a.time_of_click
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_default(),
        a.status.as_str().to_string(),
        a.voting_url.clone(),
        a.cooldown_message.clone(),
        a.failure_kind.map(FailureKind::log_type).unwrap_or("").to_string(),
        a.failure_reason.clone(),
        a.initial_vote_count.map(|c| c.to_string()).unwrap_or_default(),
        a.final_vote_count.map(|c| c.to_string()).unwrap_or_default(),
        a.proxy_ip.clone(),
        a.session_id.clone().unwrap_or_default(),
        a.click_attempts.to_string(),
        a.error_message.clone(),
        a.browser_closed.to_string(),
    ];
    fields
        .iter()
        .map(|f| escape_field(f))
        .collect::<Vec<_>>()
        .join(",")
}

fn escape_field(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Rebuild the per-instance last-success index from an existing file.
///
/// Tolerant by design: malformed rows are skipped, not fatal — a single
/// corrupt line must not block startup of the whole fleet.
pub(super) fn scan_last_success(contents: &str) -> HashMap<InstanceId, DateTime<Utc>> {
    let mut map: HashMap<InstanceId, DateTime<Utc>> = HashMap::new();
    for line in contents.lines().skip_while(|l| l.starts_with("timestamp,")) {
        if line.trim().is_empty() {
            continue;
        }
        let fields = split_csv_line(line);
        if fields.len() < 5 {
            continue;
        }
        if fields[4] != "success" {
            continue;
        }
        let Ok(instance_id) = fields[1].parse::<InstanceId>() else {
            continue;
        };
        let Ok(ts) = DateTime::parse_from_rfc3339(&fields[0]) else {
            continue;
        };
        let ts = ts.with_timezone(&Utc);
        map.entry(instance_id)
            .and_modify(|existing| {
                if ts > *existing {
                    *existing = ts;
                }
            })
            .or_insert(ts);
    }
    map
}

/// Split one CSV line honoring quoted fields with doubled quotes
pub(super) fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    current.push('"');
                } else {
                    in_quotes = false;
                }
            }
            '"' => in_quotes = true,
            ',' if !in_quotes => {
                fields.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}
