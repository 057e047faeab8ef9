//! File-backed fact and observation sources (CSV).
//!
//! Facts arrive in long format, one metric value per line:
//!
//! ```text
//! entity_id,category,period_end,disclosure_time,metric,value
//! X,quarterly,2024-03-31,2024-04-25T16:05:00Z,revenue,1000.5
//! ```
//!
//! Lines sharing `(entity_id, category, period_end, disclosure_time)` form one
//! fact. Prices are `entity_id,timestamp,value`. Timestamps may be RFC 3339,
//! `YYYY-MM-DD HH:MM:SS` (UTC) or a bare date (midnight UTC).

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use factlab_core::domain::{Category, EntityId, Fact, Observation};
use factlab_core::source::{order_and_limit, FactSource, ObservationSource, SourceError};
use serde::Deserialize;
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
struct FactRecord {
    entity_id: String,
    category: String,
    period_end: NaiveDate,
    disclosure_time: String,
    metric: String,
    value: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ObservationRecord {
    entity_id: String,
    timestamp: String,
    value: f64,
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, SourceError> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Ok(ts.and_utc());
    }
    if let Ok(d) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        if let Some(ts) = d.and_hms_opt(0, 0, 0) {
            return Ok(ts.and_utc());
        }
    }
    Err(SourceError::Malformed(format!("unparseable timestamp '{raw}'")))
}

fn csv_error(path: &str, e: csv::Error) -> SourceError {
    SourceError::Malformed(format!("{path}: {e}"))
}

/// Facts loaded from a long-format CSV.
#[derive(Debug, Clone)]
pub struct CsvFactSource {
    label: String,
    facts: Vec<Fact>,
}

impl CsvFactSource {
    pub fn from_path(path: &Path) -> Result<Self, SourceError> {
        let file = std::fs::File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => SourceError::NotFound(path.display().to_string()),
            _ => SourceError::Other(format!("{}: {e}", path.display())),
        })?;
        let source = Self::from_reader(file, &path.display().to_string())?;
        info!(path = %path.display(), facts = source.facts.len(), "fact CSV loaded");
        Ok(source)
    }

    pub fn from_reader<R: Read>(reader: R, label: &str) -> Result<Self, SourceError> {
        let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let mut grouped: BTreeMap<(String, String, NaiveDate, DateTime<Utc>), Fact> = BTreeMap::new();
        let mut skipped = 0usize;

        for record in rdr.deserialize::<FactRecord>() {
            let rec = record.map_err(|e| csv_error(label, e))?;
            let disclosed = parse_timestamp(&rec.disclosure_time)?;
            let Some(value) = rec.value else {
                skipped += 1;
                continue;
            };
            let key = (rec.entity_id, rec.category, rec.period_end, disclosed);
            let fact = grouped.entry(key.clone()).or_insert_with(|| {
                Fact::new(key.0.as_str(), key.1.as_str(), key.2, key.3)
            });
            if let Some(prev) = fact.values.insert(rec.metric.clone(), value) {
                if prev.total_cmp(&value).is_ne() {
                    return Err(SourceError::Malformed(format!(
                        "{label}: {} {} {} disclosed {} repeats '{}' with {prev} and {value}",
                        key.0, key.1, key.2, key.3, rec.metric
                    )));
                }
                debug!(source = label, entity = %key.0, metric = %rec.metric, "identical duplicate fact line");
            }
        }
        if skipped > 0 {
            debug!(source = label, skipped, "blank fact values skipped");
        }

        Ok(Self {
            label: label.to_string(),
            facts: grouped.into_values().collect(),
        })
    }

    /// Distinct entities in the file, sorted.
    pub fn entities(&self) -> Vec<EntityId> {
        let mut out: Vec<EntityId> = self.facts.iter().map(|f| f.entity_id.clone()).collect();
        out.sort();
        out.dedup();
        out
    }

    /// Every fact in the file, ordered by `(entity_id, category, period_end,
    /// disclosure_time)`.
    pub fn facts(&self) -> &[Fact] {
        &self.facts
    }

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }
}

impl FactSource for CsvFactSource {
    fn name(&self) -> &str {
        &self.label
    }

    fn pull(
        &self,
        entity_ids: &[EntityId],
        category: &Category,
        limit: Option<usize>,
    ) -> Result<Vec<Fact>, SourceError> {
        let selected: Vec<Fact> = self
            .facts
            .iter()
            .filter(|f| &f.category == category && entity_ids.contains(&f.entity_id))
            .cloned()
            .collect();
        Ok(order_and_limit(selected, limit))
    }
}

/// Observations (daily prices) loaded from CSV.
#[derive(Debug, Clone)]
pub struct CsvObservationSource {
    label: String,
    observations: Vec<Observation>,
}

impl CsvObservationSource {
    pub fn from_path(path: &Path) -> Result<Self, SourceError> {
        let file = std::fs::File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => SourceError::NotFound(path.display().to_string()),
            _ => SourceError::Other(format!("{}: {e}", path.display())),
        })?;
        let source = Self::from_reader(file, &path.display().to_string())?;
        info!(path = %path.display(), observations = source.observations.len(), "price CSV loaded");
        Ok(source)
    }

    pub fn from_reader<R: Read>(reader: R, label: &str) -> Result<Self, SourceError> {
        let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let mut observations = Vec::new();
        for record in rdr.deserialize::<ObservationRecord>() {
            let rec = record.map_err(|e| csv_error(label, e))?;
            observations.push(Observation::new(
                rec.entity_id,
                parse_timestamp(&rec.timestamp)?,
                rec.value,
            ));
        }
        observations.sort_by(|a, b| (&a.entity_id, a.timestamp).cmp(&(&b.entity_id, b.timestamp)));
        Ok(Self {
            label: label.to_string(),
            observations,
        })
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }
}

impl ObservationSource for CsvObservationSource {
    fn name(&self) -> &str {
        &self.label
    }

    fn observations(
        &self,
        entity_ids: &[EntityId],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Observation>, SourceError> {
        Ok(self
            .observations
            .iter()
            .filter(|o| entity_ids.contains(&o.entity_id))
            .filter(|o| o.timestamp >= start && o.timestamp <= end)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const FACTS: &str = "\
entity_id,category,period_end,disclosure_time,metric,value
X,quarterly,2024-03-31,2024-04-25T16:05:00Z,revenue,100
X,quarterly,2024-03-31,2024-04-25T16:05:00Z,net_income,10
X,quarterly,2024-03-31,2024-08-01,revenue,105
X,annual,2023-12-31,2024-02-15 12:00:00,revenue,400
Y,quarterly,2024-03-31,2024-05-01,revenue,
";

    #[test]
    fn groups_long_rows_into_facts() {
        let src = CsvFactSource::from_reader(FACTS.as_bytes(), "facts.csv").unwrap();
        // Y's only value is blank, so it yields no fact.
        assert_eq!(src.len(), 3);
        assert_eq!(src.entities(), vec![EntityId::new("X")]);

        let q = src
            .pull(&[EntityId::new("X")], &Category::quarterly(), None)
            .unwrap();
        assert_eq!(q.len(), 2);
        assert_eq!(q[0].value("revenue"), Some(100.0));
        assert_eq!(q[0].value("net_income"), Some(10.0));
        assert_eq!(q[1].value("revenue"), Some(105.0));
        assert_eq!(
            q[1].disclosure_time,
            Utc.with_ymd_and_hms(2024, 8, 1, 0, 0, 0).unwrap()
        );

        let a = src.pull(&[EntityId::new("X")], &Category::annual(), None).unwrap();
        assert_eq!(
            a[0].disclosure_time,
            Utc.with_ymd_and_hms(2024, 2, 15, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn conflicting_repeat_of_a_metric_is_malformed() {
        // GIVEN two lines for the same fact and metric with different values
        let csv = "\
entity_id,category,period_end,disclosure_time,metric,value
X,quarterly,2024-03-31,2024-04-25,revenue,100
X,quarterly,2024-03-31,2024-04-25,revenue,101
";
        // WHEN the file is read
        let err = CsvFactSource::from_reader(csv.as_bytes(), "facts.csv").unwrap_err();

        // THEN the load fails instead of keeping whichever line came last
        match err {
            SourceError::Malformed(msg) => {
                assert!(msg.contains("revenue"), "{msg}");
                assert!(msg.contains("100") && msg.contains("101"), "{msg}");
            }
            other => panic!("expected Malformed, got {other:?}"),
        }
    }

    #[test]
    fn identical_repeat_of_a_metric_is_accepted() {
        let csv = "\
entity_id,category,period_end,disclosure_time,metric,value
X,quarterly,2024-03-31,2024-04-25,revenue,100
X,quarterly,2024-03-31,2024-04-25,revenue,100.0
";
        let src = CsvFactSource::from_reader(csv.as_bytes(), "facts.csv").unwrap();
        assert_eq!(src.len(), 1);
        assert_eq!(src.facts()[0].value("revenue"), Some(100.0));
    }

    #[test]
    fn bad_timestamp_is_malformed() {
        let csv = "entity_id,category,period_end,disclosure_time,metric,value\nX,quarterly,2024-03-31,yesterday,revenue,1\n";
        let err = CsvFactSource::from_reader(csv.as_bytes(), "facts.csv").unwrap_err();
        assert!(matches!(err, SourceError::Malformed(_)));
    }

    #[test]
    fn observations_filter_by_entity_and_window() {
        let csv = "entity_id,timestamp,value\nX,2024-05-02,11\nX,2024-05-01,10\nY,2024-05-01,3\n";
        let src = CsvObservationSource::from_reader(csv.as_bytes(), "prices.csv").unwrap();
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let obs = src.observations(&[EntityId::new("X")], start, start).unwrap();
        assert_eq!(obs.len(), 1);
        assert_eq!(obs[0].value, 10.0);

        let all = src
            .observations(&[EntityId::new("X"), EntityId::new("Y")], DateTime::<Utc>::MIN_UTC, DateTime::<Utc>::MAX_UTC)
            .unwrap();
        assert_eq!(all.len(), 3);
        assert!(all[0].timestamp <= all[1].timestamp);
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = CsvFactSource::from_path(Path::new("/no/such/facts.csv")).unwrap_err();
        assert!(matches!(err, SourceError::NotFound(_)));
    }
}
