//! Stats Buckets
//!
//! Pre-aggregated counts per (scope, endpoint, period). Every recorded event
//! bumps one bucket per configured granularity in each of its scopes and
//! every deleted event takes it back out, so a bucket always equals the raw
//! count of its period and reading a period's totals never scans events.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Bucket period size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Hour,
    Day,
    Month,
}

impl Granularity {
    pub const ALL: [Granularity; 3] = [Granularity::Hour, Granularity::Day, Granularity::Month];

    /// Label of the period containing `at`, e.g. `2024-05-01T13`, `2024-05-01`, `2024-05`
    pub fn period_label(&self, at: DateTime<Utc>) -> String {
        match self {
            Granularity::Hour => at.format("%Y-%m-%dT%H").to_string(),
            Granularity::Day => at.format("%Y-%m-%d").to_string(),
            Granularity::Month => at.format("%Y-%m").to_string(),
        }
    }

    /// Half-open `[start, end)` bounds of the period containing `at`
    pub fn bounds(&self, at: DateTime<Utc>) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let secs = at.timestamp();
        match self {
            Granularity::Hour | Granularity::Day => {
                let size = if *self == Granularity::Hour { 3_600 } else { 86_400 };
                let start = secs.div_euclid(size) * size;
                Some((
                    DateTime::from_timestamp(start, 0)?,
                    DateTime::from_timestamp(start + size, 0)?,
                ))
            }
            Granularity::Month => {
                let (year, month) = (at.year(), at.month());
                let (next_year, next_month) = if month == 12 {
                    (year + 1, 1)
                } else {
                    (year, month + 1)
                };
                let start = NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)?;
                let end = NaiveDate::from_ymd_opt(next_year, next_month, 1)?.and_hms_opt(0, 0, 0)?;
                Some((start.and_utc(), end.and_utc()))
            }
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "hour" => Some(Granularity::Hour),
            "day" => Some(Granularity::Day),
            "month" => Some(Granularity::Month),
            _ => None,
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Month => "month",
        };
        f.write_str(name)
    }
}

/// Whose usage a bucket counts
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum BucketScope {
    Credential(String),
    User(String),
}

/// Count for one (scope, endpoint, granularity, period)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsBucket {
    pub scope: BucketScope,
    pub endpoint: String,
    pub granularity: Granularity,
    pub period: String,
    pub count: u64,
    pub last_updated: DateTime<Utc>,
}

/// (granularity, period, endpoint)
type BucketKey = (Granularity, String, String);

/// All buckets, grouped by scope
#[derive(Debug)]
pub struct BucketIndex {
    granularities: Vec<Granularity>,
    scopes: RwLock<HashMap<BucketScope, BTreeMap<BucketKey, StatsBucket>>>,
}

impl BucketIndex {
    pub fn new(granularities: &[Granularity]) -> Self {
        let mut granularities = granularities.to_vec();
        granularities.sort();
        granularities.dedup();
        Self {
            granularities,
            scopes: RwLock::new(HashMap::new()),
        }
    }

    pub fn granularities(&self) -> &[Granularity] {
        &self.granularities
    }

    /// Count one event at `at` in every scope and granularity
    ///
    /// Returns the updated buckets.
    pub fn increment(
        &self,
        scopes: &[BucketScope],
        endpoint: &str,
        at: DateTime<Utc>,
    ) -> Vec<StatsBucket> {
        let mut updated = Vec::with_capacity(scopes.len() * self.granularities.len());
        let mut index = self.scopes.write();
        for scope in scopes {
            let buckets = index.entry(scope.clone()).or_default();
            for granularity in &self.granularities {
                let period = granularity.period_label(at);
                let bucket = buckets
                    .entry((*granularity, period.clone(), endpoint.to_string()))
                    .or_insert_with(|| StatsBucket {
                        scope: scope.clone(),
                        endpoint: endpoint.to_string(),
                        granularity: *granularity,
                        period,
                        count: 0,
                        last_updated: at,
                    });
                bucket.count += 1;
                bucket.last_updated = bucket.last_updated.max(at);
                updated.push(bucket.clone());
            }
        }
        updated
    }

    /// Uncount one event at `at`, dropping buckets that reach zero
    pub fn decrement(&self, scopes: &[BucketScope], endpoint: &str, at: DateTime<Utc>) {
        let mut index = self.scopes.write();
        for scope in scopes {
            let Some(buckets) = index.get_mut(scope) else {
                continue;
            };
            for granularity in &self.granularities {
                let key = (*granularity, granularity.period_label(at), endpoint.to_string());
                if let Some(bucket) = buckets.get_mut(&key) {
                    bucket.count = bucket.count.saturating_sub(1);
                    if bucket.count == 0 {
                        buckets.remove(&key);
                    }
                }
            }
            if buckets.is_empty() {
                index.remove(scope);
            }
        }
    }

    /// Bucket for the period containing `at`
    pub fn get(
        &self,
        scope: &BucketScope,
        endpoint: &str,
        granularity: Granularity,
        at: DateTime<Utc>,
    ) -> Option<StatsBucket> {
        let key = (granularity, granularity.period_label(at), endpoint.to_string());
        self.scopes.read().get(scope)?.get(&key).cloned()
    }

    /// Endpoint counts for one period of a scope
    pub fn period_counts(
        &self,
        scope: &BucketScope,
        granularity: Granularity,
        period: &str,
    ) -> BTreeMap<String, u64> {
        let index = self.scopes.read();
        let Some(buckets) = index.get(scope) else {
            return BTreeMap::new();
        };
        let start = (granularity, period.to_string(), String::new());
        buckets
            .range(start..)
            .take_while(|((g, p, _), _)| *g == granularity && p == period)
            .map(|((_, _, endpoint), bucket)| (endpoint.clone(), bucket.count))
            .collect()
    }

    /// Every bucket of a scope, ordered by granularity, period, endpoint
    pub fn list(&self, scope: &BucketScope) -> Vec<StatsBucket> {
        self.scopes
            .read()
            .get(scope)
            .map(|buckets| buckets.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.scopes.read().values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_period_labels() {
        let t = at("2024-05-01T13:45:10Z");
        assert_eq!(Granularity::Hour.period_label(t), "2024-05-01T13");
        assert_eq!(Granularity::Day.period_label(t), "2024-05-01");
        assert_eq!(Granularity::Month.period_label(t), "2024-05");
    }

    #[test]
    fn test_bounds_contain_instant() {
        let t = at("2024-12-31T23:59:59Z");
        for granularity in Granularity::ALL {
            let (start, end) = granularity.bounds(t).unwrap();
            assert!(start <= t && t < end, "{} bounds", granularity);
            assert_eq!(granularity.period_label(start), granularity.period_label(t));
            assert_ne!(granularity.period_label(end), granularity.period_label(t));
        }
        let (start, end) = Granularity::Month.bounds(t).unwrap();
        assert_eq!(start, at("2024-12-01T00:00:00Z"));
        assert_eq!(end, at("2025-01-01T00:00:00Z"));
    }

    #[test]
    fn test_increment_and_read() {
        let index = BucketIndex::new(&[Granularity::Day, Granularity::Hour]);
        let scopes = [
            BucketScope::Credential("kg_1".into()),
            BucketScope::User("user-1".into()),
        ];
        let t = at("2024-05-01T13:00:00Z");

        let updated = index.increment(&scopes, "/predict", t);
        assert_eq!(updated.len(), 4);
        index.increment(&scopes, "/predict", t);
        index.increment(&scopes[1..], "/train", t);

        let user = BucketScope::User("user-1".into());
        assert_eq!(
            index.get(&user, "/predict", Granularity::Day, t).unwrap().count,
            2
        );
        assert!(index.get(&user, "/predict", Granularity::Month, t).is_none());

        let counts = index.period_counts(&user, Granularity::Day, "2024-05-01");
        assert_eq!(counts.get("/predict"), Some(&2));
        assert_eq!(counts.get("/train"), Some(&1));
        assert_eq!(counts.len(), 2);

        assert_eq!(index.list(&scopes[0]).len(), 2);
        assert_eq!(index.len(), 6);
    }

    #[test]
    fn test_decrement_drops_empty_buckets() {
        let index = BucketIndex::new(&[Granularity::Hour, Granularity::Day]);
        let scope = [BucketScope::Credential("kg_1".into())];
        let t = at("2024-05-01T13:00:00Z");
        let later = at("2024-05-01T15:30:00Z");

        index.increment(&scope, "/predict", t);
        index.increment(&scope, "/predict", later);
        index.decrement(&scope, "/predict", t);

        assert!(index.get(&scope[0], "/predict", Granularity::Hour, t).is_none());
        assert_eq!(
            index.get(&scope[0], "/predict", Granularity::Day, t).unwrap().count,
            1
        );

        index.decrement(&scope, "/predict", later);
        assert!(index.is_empty());
        assert!(index.list(&scope[0]).is_empty());

        // Unknown buckets are ignored
        index.decrement(&scope, "/predict", later);
        assert!(index.is_empty());
    }
}
