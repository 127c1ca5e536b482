use crate::error::JobError;
use crate::job::JobSpec;
use chrono::Utc;
use cron::Schedule;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;

/// Launches one job for a cron tick
pub type Launcher = Arc<dyn Fn(&str, &JobSpec) -> Result<(), JobError> + Send + Sync>;

struct CronEntry {
    period: String,
    spec: JobSpec,
    ticker: Option<JoinHandle<()>>,
}

/// In-process table of named recurring triggers
pub struct CronTable {
    entries: Arc<Mutex<HashMap<String, CronEntry>>>,
    launcher: Launcher,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CronTable {
    pub fn new(launcher: Launcher) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            launcher,
        }
    }

    /// Install a new entry; fails if the name is taken or the period is invalid
    pub fn deploy(&self, name: &str, period: &str, spec: &JobSpec) -> Result<(), JobError> {
        let schedule = parse_period(period)?;

        let mut entries = lock(&self.entries);
        if entries.contains_key(name) {
            return Err(JobError::User(format!("cron job {} already exists", name)));
        }

        let ticker = schedule.map(|schedule| self.start_ticker(name, schedule, spec.clone()));
        entries.insert(
            name.to_string(),
            CronEntry {
                period: period.to_string(),
                spec: spec.clone(),
                ticker,
            },
        );

        tracing::info!("Deployed cron job {} with period '{}'", name, period);
        Ok(())
    }

    pub fn exists(&self, name: &str) -> bool {
        lock(&self.entries).contains_key(name)
    }

    /// Current period of an entry; empty when paused
    pub fn period(&self, name: &str) -> Option<String> {
        lock(&self.entries).get(name).map(|e| e.period.clone())
    }

    /// Replace the period of an existing entry, keeping the entry itself
    pub fn edit(&self, name: &str, period: &str) -> Result<(), JobError> {
        let schedule = parse_period(period)?;

        let mut entries = lock(&self.entries);
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| JobError::JobMissing(name.to_string()))?;

        if let Some(ticker) = entry.ticker.take() {
            ticker.abort();
        }
        entry.period = period.to_string();
        entry.ticker = schedule.map(|schedule| self.start_ticker(name, schedule, entry.spec.clone()));

        if entry.ticker.is_none() {
            tracing::info!("Paused cron job {}", name);
        } else {
            tracing::info!("Updated cron job {} to period '{}'", name, period);
        }
        Ok(())
    }

    pub fn delete(&self, name: &str) -> Result<(), JobError> {
        let entry = lock(&self.entries)
            .remove(name)
            .ok_or_else(|| JobError::JobMissing(name.to_string()))?;

        if let Some(ticker) = entry.ticker {
            ticker.abort();
        }
        tracing::info!("Deleted cron job {}", name);
        Ok(())
    }

    fn start_ticker(&self, name: &str, schedule: Schedule, spec: JobSpec) -> JoinHandle<()> {
        let name = name.to_string();
        let launcher = self.launcher.clone();

        tokio::spawn(async move {
            for next_run in schedule.upcoming(Utc) {
                let wait = (next_run - Utc::now()).to_std().unwrap_or_default();
                tokio::time::sleep(wait).await;

                let job_name = format!("{}-{}", name, Utc::now().timestamp());
                tracing::info!("Cron job {} firing as {}", name, job_name);
                if let Err(e) = launcher(&job_name, &spec.renamed(job_name.as_str())) {
                    tracing::error!("Cron job {} failed to launch {}: {}", name, job_name, e);
                }
            }
        })
    }
}

impl Drop for CronTable {
    fn drop(&mut self) {
        for entry in lock(&self.entries).values_mut() {
            if let Some(ticker) = entry.ticker.take() {
                ticker.abort();
            }
        }
    }
}

/// Accept both classic five-field and six-field (with seconds) expressions
pub fn normalize_cron(period: &str) -> String {
    let period = period.trim();
    if period.split_whitespace().count() == 5 {
        format!("0 {}", period)
    } else {
        period.to_string()
    }
}

/// Parse a period; an empty period is a paused entry
pub fn parse_period(period: &str) -> Result<Option<Schedule>, JobError> {
    if period.trim().is_empty() {
        return Ok(None);
    }

    Schedule::from_str(&normalize_cron(period))
        .map(Some)
        .map_err(|e| JobError::User(format!("invalid cron expression '{}': {}", period, e)))
}
