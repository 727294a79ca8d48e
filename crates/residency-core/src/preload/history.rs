//! Usage history and the prediction strategies built on it.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

/// Which signal a prediction is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreloadStrategy {
    /// Most used artifacts overall.
    Frequency,
    /// What historically followed the most recent accesses.
    Sequence,
    /// Scheduled loads due within the horizon.
    Schedule,
    /// Schedule, then sequence, then frequency.
    Adaptive,
}

/// A load the caller expects to need at a given time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledLoad {
    pub name: String,
    pub at: DateTime<Utc>,
}

/// Persisted access history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageHistory {
    /// Access timestamps per artifact, oldest first.
    pub accesses: HashMap<String, VecDeque<DateTime<Utc>>>,
    /// Rolling access sequence, oldest first.
    pub sequence: VecDeque<String>,
    /// Scheduled loads ordered by due time.
    pub scheduled: Vec<ScheduledLoad>,
}

impl UsageHistory {
    /// Record one access, keeping at most `limit` timestamps per artifact and
    /// `limit` entries in the sequence.
    pub fn record(&mut self, name: &str, at: DateTime<Utc>, limit: usize) {
        let limit = limit.max(1);
        let stamps = self.accesses.entry(name.to_string()).or_default();
        stamps.push_back(at);
        while stamps.len() > limit {
            stamps.pop_front();
        }
        self.sequence.push_back(name.to_string());
        while self.sequence.len() > limit {
            self.sequence.pop_front();
        }
    }

    pub fn schedule(&mut self, name: &str, at: DateTime<Utc>) {
        let already = self
            .scheduled
            .iter()
            .any(|load| load.name == name && load.at == at);
        if !already {
            self.scheduled.push(ScheduledLoad {
                name: name.to_string(),
                at,
            });
            self.scheduled.sort_by(|a, b| a.at.cmp(&b.at));
        }
    }

    /// Drop scheduled loads more than `horizon` overdue.
    pub fn prune_schedule(&mut self, now: DateTime<Utc>, horizon: Duration) -> usize {
        let cutoff = now - chrono_duration(horizon);
        let before = self.scheduled.len();
        self.scheduled.retain(|load| load.at >= cutoff);
        before - self.scheduled.len()
    }

    pub fn access_count(&self, name: &str) -> usize {
        self.accesses.get(name).map(VecDeque::len).unwrap_or(0)
    }

    /// Artifacts by access count, most used first. Ties go to the most
    /// recently used, then to name order.
    pub fn by_frequency(&self) -> Vec<String> {
        let mut ranked: Vec<(&String, usize, Option<&DateTime<Utc>>)> = self
            .accesses
            .iter()
            .filter(|(_, stamps)| !stamps.is_empty())
            .map(|(name, stamps)| (name, stamps.len(), stamps.back()))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(b.2.cmp(&a.2)).then(a.0.cmp(b.0)));
        ranked.into_iter().map(|(name, _, _)| name.clone()).collect()
    }

    /// Artifacts that followed earlier occurrences of the current context.
    ///
    /// The context is the last `order` accesses; when it never occurred
    /// before, shorter contexts are tried down to a single access. Followers
    /// are ranked by how often they followed, then by how recently.
    pub fn by_sequence(&self, order: usize) -> Vec<String> {
        let sequence: Vec<&str> = self.sequence.iter().map(String::as_str).collect();
        let len = sequence.len();
        if len < 2 {
            return Vec::new();
        }

        for n in (1..=order.min(len - 1)).rev() {
            let context = &sequence[len - n..];
            // follower -> (count, last position)
            let mut followers: HashMap<&str, (usize, usize)> = HashMap::new();
            for start in 0..len - n {
                if &sequence[start..start + n] == context {
                    let position = start + n;
                    let entry = followers.entry(sequence[position]).or_insert((0, 0));
                    entry.0 += 1;
                    entry.1 = position;
                }
            }
            if followers.is_empty() {
                continue;
            }
            let mut ranked: Vec<(&str, (usize, usize))> = followers.into_iter().collect();
            ranked.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then(b.1 .1.cmp(&a.1 .1)));
            return ranked.into_iter().map(|(name, _)| name.to_string()).collect();
        }
        Vec::new()
    }

    /// Scheduled loads due before `now + horizon`, soonest first.
    pub fn by_schedule(&self, now: DateTime<Utc>, horizon: Duration) -> Vec<String> {
        let deadline = now + chrono_duration(horizon);
        let mut seen = HashSet::new();
        self.scheduled
            .iter()
            .filter(|load| load.at <= deadline)
            .filter(|load| seen.insert(load.name.as_str()))
            .map(|load| load.name.clone())
            .collect()
    }

    /// Ranked predictions for `strategy`, without duplicates.
    pub fn predict(
        &self,
        strategy: PreloadStrategy,
        order: usize,
        now: DateTime<Utc>,
        horizon: Duration,
    ) -> Vec<String> {
        match strategy {
            PreloadStrategy::Frequency => self.by_frequency(),
            PreloadStrategy::Sequence => self.by_sequence(order),
            PreloadStrategy::Schedule => self.by_schedule(now, horizon),
            PreloadStrategy::Adaptive => {
                let mut seen = HashSet::new();
                self.by_schedule(now, horizon)
                    .into_iter()
                    .chain(self.by_sequence(order))
                    .chain(self.by_frequency())
                    .filter(|name| seen.insert(name.clone()))
                    .collect()
            }
        }
    }
}

fn chrono_duration(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::days(36_500))
}
