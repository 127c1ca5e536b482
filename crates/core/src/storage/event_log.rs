use crate::events::{Event, EventLog};
use crate::types::RunId;
use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Event log implementation using gzip-compressed JSONL (JSON Lines)
pub struct JsonlEventLog {
    base_path: PathBuf,
    // Events not yet written to disk, across all runs
    buffer: RwLock<Vec<Event>>,
}

impl JsonlEventLog {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path).context("Failed to create event log directory")?;
        Ok(Self {
            base_path,
            buffer: RwLock::new(Vec::new()),
        })
    }

    /// Get the path to the event log file for a specific run
    /// Format: events/YYYY/MM/DD/<run_id>.jsonl.gz
    fn event_log_path(&self, run_id: &RunId, date: &DateTime<Utc>) -> PathBuf {
        self.base_path
            .join("events")
            .join(format!("{:04}", date.year()))
            .join(format!("{:02}", date.month()))
            .join(format!("{:02}", date.day()))
            .join(format!("{}.jsonl.gz", run_id))
    }

    /// Read JSONL.GZ file
    fn read_jsonl_gz(path: &Path) -> Result<Vec<Event>> {
        use flate2::read::GzDecoder;
        use std::io::BufRead;

        let file = std::fs::File::open(path).context("Failed to open event log")?;
        let reader = std::io::BufReader::new(GzDecoder::new(file));

        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line.context("Failed to read line from event log")?;
            let event: Event = serde_json::from_str(&line).context("Failed to parse event")?;
            events.push(event);
        }

        Ok(events)
    }

    /// Write JSONL.GZ file
    async fn write_jsonl_gz(path: &Path, events: &[Event]) -> Result<()> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());

        for event in events {
            let json = serde_json::to_string(event).context("Failed to serialize event")?;
            encoder
                .write_all(json.as_bytes())
                .context("Failed to write event")?;
            encoder.write_all(b"\n").context("Failed to write newline")?;
        }

        let compressed = encoder.finish().context("Failed to finish compression")?;

        tokio::fs::write(path, compressed)
            .await
            .context("Failed to write event log file")?;

        Ok(())
    }

    /// Get all event log files for a run
    fn get_log_files(&self, run_id: &RunId) -> Result<Vec<PathBuf>> {
        let events_dir = self.base_path.join("events");
        if !events_dir.exists() {
            return Ok(Vec::new());
        }

        let filename = format!("{}.jsonl.gz", run_id);
        let mut files = Vec::new();

        // Walk through year/month/day directories
        for year in subdirectories(&events_dir)? {
            for month in subdirectories(&year)? {
                for day in subdirectories(&month)? {
                    let log_file = day.join(&filename);
                    if log_file.exists() {
                        files.push(log_file);
                    }
                }
            }
        }

        Ok(files)
    }
}

fn subdirectories(path: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(path).context("Failed to read event log directory")? {
        let entry = entry.context("Failed to read directory entry")?;
        if entry.path().is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

#[async_trait::async_trait]
impl EventLog for JsonlEventLog {
    async fn append(&self, event: Event) -> Result<()> {
        let run_id = event.run_id;
        let mut buffer = self.buffer.write().await;
        buffer.push(event);

        // Flush buffer if it gets large (e.g., > 100 events)
        if buffer.len() > 100 {
            drop(buffer);
            self.flush(run_id).await?;
        }

        Ok(())
    }

    async fn flush(&self, run_id: RunId) -> Result<()> {
        let mut buffer = self.buffer.write().await;
        let (events, rest): (Vec<Event>, Vec<Event>) =
            buffer.drain(..).partition(|e| e.run_id == run_id);
        *buffer = rest;
        if events.is_empty() {
            return Ok(());
        }

        // Group events by date
        let mut events_by_date: std::collections::BTreeMap<DateTime<Utc>, Vec<Event>> =
            std::collections::BTreeMap::new();
        for event in events {
            let midnight = event
                .timestamp
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .context("Invalid event date")?;
            let date = DateTime::<Utc>::from_naive_utc_and_offset(midnight, Utc);
            events_by_date.entry(date).or_default().push(event);
        }

        for (date, events) in events_by_date {
            let path = self.event_log_path(&run_id, &date);

            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("Failed to create event log directory")?;
            }

            let mut all_events = if path.exists() {
                Self::read_jsonl_gz(&path)?
            } else {
                Vec::new()
            };
            all_events.extend(events);

            Self::write_jsonl_gz(&path, &all_events).await?;
        }

        Ok(())
    }

    async fn get_run_events(&self, run_id: RunId) -> Result<Vec<Event>> {
        // Flush any buffered events first
        self.flush(run_id).await?;

        let mut all_events = Vec::new();
        for file in self.get_log_files(&run_id)? {
            all_events.extend(Self::read_jsonl_gz(&file)?);
        }

        all_events.sort_by_key(|e| e.timestamp);

        Ok(all_events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;
    use crate::types::{DagId, ExecutionStatus, WorkflowId};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_jsonl_event_log() {
        let temp_dir = TempDir::new().unwrap();
        let log = JsonlEventLog::new(temp_dir.path().to_path_buf()).unwrap();

        let run_id = RunId::new();
        let event = Event::new(
            run_id,
            EventType::RunStarted {
                workflow_id: WorkflowId::new(),
                dag_id: DagId::new(),
            },
        );

        log.append(event.clone()).await.unwrap();
        log.flush(run_id).await.unwrap();

        let events = log.get_run_events(run_id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, event.id);
    }

    #[tokio::test]
    async fn test_flush_keeps_other_runs_buffered() {
        let temp_dir = TempDir::new().unwrap();
        let log = JsonlEventLog::new(temp_dir.path().to_path_buf()).unwrap();

        let first = RunId::new();
        let second = RunId::new();
        let finished = |run_id| {
            Event::new(
                run_id,
                EventType::RunFinished {
                    status: ExecutionStatus::Succeeded,
                },
            )
        };
        log.append(finished(first)).await.unwrap();
        log.append(finished(second)).await.unwrap();

        log.flush(first).await.unwrap();

        assert_eq!(log.get_run_events(first).await.unwrap().len(), 1);
        assert_eq!(log.get_run_events(second).await.unwrap().len(), 1);
    }
}
