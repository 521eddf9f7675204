//! Synchronization scheduling.

use chrono::{DateTime, Duration, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};

/// How often an adapter is synchronized with the aggregator.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncFrequency {
    #[display(fmt = "manual")]
    Manual,
    #[display(fmt = "daily")]
    Daily,
    #[display(fmt = "weekly")]
    Weekly,
}

impl Default for SyncFrequency {
    fn default() -> Self {
        SyncFrequency::Manual
    }
}

impl SyncFrequency {
    /// The period between two runs, or `None` for manual synchronization.
    pub fn period(self) -> Option<Duration> {
        match self {
            SyncFrequency::Manual => None,
            SyncFrequency::Daily => Some(Duration::seconds(86_400)),
            SyncFrequency::Weekly => Some(Duration::seconds(604_800)),
        }
    }
}

/// Computes the next eligible synchronization time.
///
/// Returns `None` for [`SyncFrequency::Manual`] and when there is no previous run to anchor the
/// period on.
pub fn next_run(
    frequency: SyncFrequency,
    last_run: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    let period = frequency.period()?;
    last_run.map(|last_run| last_run + period)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
/// The current synchronization schedule.
pub struct SchedulePolicy {
    pub frequency: SyncFrequency,
    pub next_run: Option<DateTime<Utc>>,
    /// Whether synchronization runs periodically, i.e. the frequency isn't manual.
    pub enabled: bool,
}

impl SchedulePolicy {
    pub fn from_last_run(frequency: SyncFrequency, last_run: Option<DateTime<Utc>>) -> Self {
        Self {
            frequency,
            next_run: next_run(frequency, last_run),
            enabled: frequency != SyncFrequency::Manual,
        }
    }
}

impl Default for SchedulePolicy {
    fn default() -> Self {
        Self::from_last_run(SyncFrequency::Manual, None)
    }
}
