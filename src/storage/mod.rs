use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use chrono_tz::Tz;
use duckdb::{Connection, params};
use serde_json::{Map, Value, json};
use std::path::Path;
use tracing::{debug, info};

use crate::models::{ReadingFields, StationFields, StationRecord, is_blank};

// ── Schema ────────────────────────────────────────────────────────────────────

const DDL: &str = r#"
CREATE SEQUENCE IF NOT EXISTS seq_station_id;
CREATE SEQUENCE IF NOT EXISTS seq_reading_id;
CREATE SEQUENCE IF NOT EXISTS seq_harvest_run_id;

CREATE TABLE IF NOT EXISTS stations (
    id            BIGINT PRIMARY KEY DEFAULT nextval('seq_station_id'),
    province      VARCHAR,
    city          VARCHAR,
    basin         VARCHAR,
    river         VARCHAR,
    station_name  VARCHAR,
    station_code  VARCHAR UNIQUE,
    created_at    TIMESTAMP NOT NULL,
    updated_at    TIMESTAMP NOT NULL,
    UNIQUE (province, city, basin, river, station_name)
);

CREATE TABLE IF NOT EXISTS readings (
    id                  BIGINT PRIMARY KEY DEFAULT nextval('seq_reading_id'),
    station_id          BIGINT NOT NULL,
    observed_at         TIMESTAMP NOT NULL,
    batch_time          TIMESTAMP NOT NULL,
    water_quality_class VARCHAR,
    station_status      VARCHAR,
    -- Full normalized row as JSON; the metric set is open-ended
    payload             VARCHAR NOT NULL,
    UNIQUE (station_id, observed_at)
);

CREATE TABLE IF NOT EXISTS harvest_runs (
    id              BIGINT PRIMARY KEY DEFAULT nextval('seq_harvest_run_id'),
    started_at      TIMESTAMP NOT NULL,
    finished_at     TIMESTAMP,
    status          VARCHAR NOT NULL DEFAULT 'running',
    pages_processed INTEGER DEFAULT 0,
    rows_seen       INTEGER DEFAULT 0,
    rows_inserted   INTEGER DEFAULT 0,
    error_msg       VARCHAR
);

CREATE TABLE IF NOT EXISTS schema_version (
    version     INTEGER PRIMARY KEY,
    applied_at  TIMESTAMP NOT NULL
);
"#;

const INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_readings_station  ON readings (station_id);
CREATE INDEX IF NOT EXISTS idx_readings_observed ON readings (observed_at);
CREATE INDEX IF NOT EXISTS idx_stations_name     ON stations (station_name);
"#;

// ── Repository ────────────────────────────────────────────────────────────────

pub struct Repository {
    conn: Connection,
}

/// Outcome of persisting one normalized row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub station_id: i64,
    /// True only when a brand-new reading row was inserted.
    pub created: bool,
}

impl Repository {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Could not create dir {:?}", parent))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open DuckDB at {:?}", path))?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
        })
    }

    pub fn run_migrations(&self) -> Result<()> {
        info!("Running migrations…");
        self.conn.execute_batch(DDL).context("DDL failed")?;
        self.conn
            .execute_batch(INDEXES)
            .context("Index creation failed")?;
        self.conn.execute(
            "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, ?)",
            params![Utc::now().naive_utc()],
        )?;
        info!("Migrations done.");
        Ok(())
    }

    // ── Run transaction ───────────────────────────────────────────────────────

    /// The whole harvest persists inside a single transaction; a failed
    /// attempt rolls back and reopens it so no partial batch survives.
    pub fn begin_run(&self) -> Result<()> {
        self.conn.execute_batch("BEGIN TRANSACTION")?;
        Ok(())
    }

    pub fn commit_run(&self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    pub fn rollback_run(&self) -> Result<()> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    // ── Stations ──────────────────────────────────────────────────────────────

    /// Find or create a station. Resolution order: `station_code` when
    /// present, then the exact composite identity, then a unique fuzzy match
    /// that tolerates a missing city (the replay endpoint omits it for some
    /// scopes). Matches are merged field-by-field, never letting a blank
    /// overwrite an existing value.
    pub fn upsert_station(&self, fields: &StationFields) -> Result<StationRecord> {
        if let Some(code) = fields.station_code.as_deref()
            && !code.trim().is_empty()
            && let Some(existing) = self.find_station_by_code(code)?
        {
            return self.merge_station(existing, fields);
        }

        if let Some(existing) = self.find_station_by_composite(fields)? {
            return self.merge_station(existing, fields);
        }

        if let Some(existing) = self.find_station_fuzzy(fields)? {
            debug!(
                station = fields.station_name.as_deref().unwrap_or("?"),
                "fuzzy-matched station, merging"
            );
            return self.merge_station(existing, fields);
        }

        self.insert_station(fields)
    }

    fn find_station_by_code(&self, code: &str) -> Result<Option<StationRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, province, city, basin, river, station_name, station_code
             FROM stations WHERE station_code = ?",
        )?;
        let mut rows = stmt.query_map(params![code], row_to_station)?;
        Ok(rows.next().transpose()?)
    }

    fn find_station_by_composite(&self, fields: &StationFields) -> Result<Option<StationRecord>> {
        // NULL-safe equality: two absent cities are the same identity.
        let mut stmt = self.conn.prepare(
            "SELECT id, province, city, basin, river, station_name, station_code
             FROM stations
             WHERE province     IS NOT DISTINCT FROM ?
               AND city         IS NOT DISTINCT FROM ?
               AND basin        IS NOT DISTINCT FROM ?
               AND river        IS NOT DISTINCT FROM ?
               AND station_name IS NOT DISTINCT FROM ?",
        )?;
        let mut rows = stmt.query_map(
            params![
                fields.province,
                fields.city,
                fields.basin,
                fields.river,
                fields.station_name,
            ],
            row_to_station,
        )?;
        Ok(rows.next().transpose()?)
    }

    /// Fuzzy candidate: same province/basin/river/name, city reconciled by
    /// hand. Ambiguity means "create a new station" rather than guess.
    fn find_station_fuzzy(&self, fields: &StationFields) -> Result<Option<StationRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, province, city, basin, river, station_name, station_code
             FROM stations
             WHERE province     IS NOT DISTINCT FROM ?
               AND basin        IS NOT DISTINCT FROM ?
               AND river        IS NOT DISTINCT FROM ?
               AND station_name IS NOT DISTINCT FROM ?",
        )?;
        let candidates: Vec<StationRecord> = stmt
            .query_map(
                params![
                    fields.province,
                    fields.basin,
                    fields.river,
                    fields.station_name,
                ],
                row_to_station,
            )?
            .collect::<std::result::Result<_, _>>()?;

        if candidates.is_empty() {
            return Ok(None);
        }
        if candidates.len() == 1 {
            return Ok(candidates.into_iter().next());
        }

        let target_city = fields.city.as_deref();
        if !is_blank(target_city) {
            let exact: Vec<&StationRecord> = candidates
                .iter()
                .filter(|c| {
                    !is_blank(c.fields.city.as_deref()) && c.fields.city.as_deref() == target_city
                })
                .collect();
            if exact.len() == 1 {
                return Ok(Some(exact[0].clone()));
            }
            let blanks: Vec<&StationRecord> = candidates
                .iter()
                .filter(|c| is_blank(c.fields.city.as_deref()))
                .collect();
            if blanks.len() == 1 && exact.is_empty() {
                return Ok(Some(blanks[0].clone()));
            }
            return Ok(None);
        }

        let non_blank: Vec<&StationRecord> = candidates
            .iter()
            .filter(|c| !is_blank(c.fields.city.as_deref()))
            .collect();
        if non_blank.len() == 1 {
            return Ok(Some(non_blank[0].clone()));
        }
        Ok(None)
    }

    fn insert_station(&self, fields: &StationFields) -> Result<StationRecord> {
        let now = Utc::now().naive_utc();
        let inserted = self.conn.query_row(
            "INSERT INTO stations
                 (province, city, basin, river, station_name, station_code, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
            params![
                fields.province,
                fields.city,
                fields.basin,
                fields.river,
                fields.station_name,
                fields.station_code,
                now,
                now,
            ],
            |r| r.get::<_, i64>(0),
        );

        match inserted {
            Ok(id) => Ok(StationRecord {
                id,
                fields: fields.clone(),
            }),
            // A concurrent batch (or a retry) may have won the insert race on
            // one of the unique constraints; resolve to the surviving row.
            Err(e) => {
                if let Some(code) = fields.station_code.as_deref()
                    && let Some(existing) = self.find_station_by_code(code)?
                {
                    return Ok(existing);
                }
                if let Some(existing) = self.find_station_by_composite(fields)? {
                    return Ok(existing);
                }
                Err(e).context("station insert failed with no resolvable duplicate")
            }
        }
    }

    /// Overlay incoming non-blank fields onto the stored record.
    fn merge_station(
        &self,
        mut existing: StationRecord,
        incoming: &StationFields,
    ) -> Result<StationRecord> {
        let mut changed = false;
        let pairs = [
            (&mut existing.fields.province, &incoming.province),
            (&mut existing.fields.city, &incoming.city),
            (&mut existing.fields.basin, &incoming.basin),
            (&mut existing.fields.river, &incoming.river),
            (&mut existing.fields.station_name, &incoming.station_name),
            (&mut existing.fields.station_code, &incoming.station_code),
        ];
        for (stored, new) in pairs {
            if !is_blank(new.as_deref()) && stored != new {
                *stored = new.clone();
                changed = true;
            }
        }

        if changed {
            self.conn.execute(
                "UPDATE stations SET
                     province = ?, city = ?, basin = ?, river = ?,
                     station_name = ?, station_code = ?, updated_at = ?
                 WHERE id = ?",
                params![
                    existing.fields.province,
                    existing.fields.city,
                    existing.fields.basin,
                    existing.fields.river,
                    existing.fields.station_name,
                    existing.fields.station_code,
                    Utc::now().naive_utc(),
                    existing.id,
                ],
            )?;
        }
        Ok(existing)
    }

    // ── Readings ──────────────────────────────────────────────────────────────

    /// Insert or refresh one reading. Identity is (station_id, observed_at);
    /// rows without an observation time are dropped here, never stored.
    /// Re-runs update `batch_time` and the payload in place.
    pub fn upsert_reading(
        &self,
        station_id: i64,
        reading: &ReadingFields,
        batch_time: DateTime<Tz>,
    ) -> Result<bool> {
        let Some(observed_at) = reading.observed_at else {
            return Ok(false);
        };
        let observed_naive = observed_at.naive_utc();
        let payload = reading_payload(reading, observed_at, batch_time);

        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM readings WHERE station_id = ? AND observed_at = ?",
                params![station_id, observed_naive],
                |r| r.get(0),
            )
            .ok();

        if let Some(id) = existing {
            self.conn.execute(
                "UPDATE readings SET batch_time = ?, water_quality_class = ?,
                     station_status = ?, payload = ?
                 WHERE id = ?",
                params![
                    batch_time.naive_utc(),
                    reading.water_quality_class,
                    reading.station_status,
                    payload,
                    id,
                ],
            )?;
            return Ok(false);
        }

        let inserted = self.conn.execute(
            "INSERT INTO readings
                 (station_id, observed_at, batch_time, water_quality_class, station_status, payload)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                station_id,
                observed_naive,
                batch_time.naive_utc(),
                reading.water_quality_class,
                reading.station_status,
                payload,
            ],
        );

        match inserted {
            Ok(_) => Ok(true),
            // Unique-constraint race: the row exists now, treat as not created.
            Err(_) => {
                let found: Option<i64> = self
                    .conn
                    .query_row(
                        "SELECT id FROM readings WHERE station_id = ? AND observed_at = ?",
                        params![station_id, observed_naive],
                        |r| r.get(0),
                    )
                    .ok();
                if found.is_some() {
                    Ok(false)
                } else {
                    anyhow::bail!("reading insert failed for station {station_id}")
                }
            }
        }
    }

    /// Persist one normalized row: resolve the station, then its reading.
    pub fn upsert_row(
        &self,
        station: &StationFields,
        reading: &ReadingFields,
        batch_time: DateTime<Tz>,
    ) -> Result<UpsertOutcome> {
        let record = self.upsert_station(station)?;
        let created = self.upsert_reading(record.id, reading, batch_time)?;
        Ok(UpsertOutcome {
            station_id: record.id,
            created,
        })
    }

    // ── Harvest run log ───────────────────────────────────────────────────────

    pub fn begin_harvest_run(&self) -> Result<i64> {
        let id = self.conn.query_row(
            "INSERT INTO harvest_runs (started_at, status) VALUES (?, 'running') RETURNING id",
            params![Utc::now().naive_utc()],
            |r| r.get(0),
        )?;
        Ok(id)
    }

    pub fn finish_harvest_run(
        &self,
        run_id: i64,
        pages: usize,
        rows_seen: usize,
        rows_inserted: usize,
        error: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            r#"UPDATE harvest_runs SET
               finished_at = ?, status = ?,
               pages_processed = ?, rows_seen = ?, rows_inserted = ?, error_msg = ?
               WHERE id = ?"#,
            params![
                Utc::now().naive_utc(),
                if error.is_none() { "success" } else { "error" },
                pages as i64,
                rows_seen as i64,
                rows_inserted as i64,
                error,
                run_id,
            ],
        )?;
        Ok(())
    }

    // ── Stats ─────────────────────────────────────────────────────────────────

    pub fn station_count(&self) -> Result<i64> {
        let mut s = self.conn.prepare("SELECT COUNT(*) FROM stations")?;
        Ok(s.query_row([], |r| r.get(0))?)
    }

    pub fn reading_count(&self) -> Result<i64> {
        let mut s = self.conn.prepare("SELECT COUNT(*) FROM readings")?;
        Ok(s.query_row([], |r| r.get(0))?)
    }

    pub fn observed_range(&self) -> Result<(Option<NaiveDateTime>, Option<NaiveDateTime>)> {
        let mut s = self
            .conn
            .prepare("SELECT MIN(observed_at), MAX(observed_at) FROM readings")?;
        Ok(s.query_row([], |r| Ok((r.get(0)?, r.get(1)?)))?)
    }

    pub fn list_stations(&self) -> Result<Vec<StationRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, province, city, basin, river, station_name, station_code
             FROM stations ORDER BY province, city, station_name",
        )?;
        let stations = stmt
            .query_map([], row_to_station)?
            .collect::<std::result::Result<_, _>>()?;
        Ok(stations)
    }
}

fn row_to_station(row: &duckdb::Row<'_>) -> duckdb::Result<StationRecord> {
    Ok(StationRecord {
        id: row.get(0)?,
        fields: StationFields {
            province: row.get(1)?,
            city: row.get(2)?,
            basin: row.get(3)?,
            river: row.get(4)?,
            station_name: row.get(5)?,
            station_code: row.get(6)?,
        },
    })
}

/// Render the reading as the JSON blob stored alongside the typed columns.
/// Timestamps keep their zone offset so the blob is self-describing.
fn reading_payload(reading: &ReadingFields, observed_at: DateTime<Tz>, batch_time: DateTime<Tz>) -> String {
    let mut map = Map::new();
    map.insert("observed_at".to_string(), json!(observed_at.to_rfc3339()));
    map.insert("batch_time".to_string(), json!(batch_time.to_rfc3339()));
    map.insert(
        "water_quality_class".to_string(),
        json!(reading.water_quality_class),
    );
    map.insert("station_status".to_string(), json!(reading.station_status));
    for (metric, value) in &reading.metrics {
        map.insert(metric.clone(), json!(value));
    }
    Value::Object(map).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::Asia::Shanghai;
    use std::collections::BTreeMap;

    fn repo() -> Repository {
        let repo = Repository::open_in_memory().unwrap();
        repo.run_migrations().unwrap();
        repo
    }

    fn station(name: &str, city: Option<&str>) -> StationFields {
        StationFields {
            province: Some("江苏省".to_string()),
            city: city.map(str::to_string),
            basin: Some("长江流域".to_string()),
            river: Some("太湖".to_string()),
            station_name: Some(name.to_string()),
            station_code: None,
        }
    }

    fn reading(hour: u32) -> ReadingFields {
        let mut metrics = BTreeMap::new();
        metrics.insert("ph".to_string(), Some(7.2146));
        metrics.insert("dissolved_oxygen".to_string(), None);
        ReadingFields {
            observed_at: Some(Shanghai.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()),
            water_quality_class: Some("Ⅱ".to_string()),
            station_status: Some("正常".to_string()),
            metrics,
        }
    }

    fn batch_time() -> DateTime<Tz> {
        Shanghai.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn migrations_are_idempotent() {
        let repo = repo();
        repo.run_migrations().unwrap();
        assert_eq!(repo.station_count().unwrap(), 0);
    }

    #[test]
    fn station_resolves_by_code_before_composite() {
        let repo = repo();
        let mut with_code = station("三江营", Some("扬州市"));
        with_code.station_code = Some("JS001".to_string());
        let first = repo.upsert_station(&with_code).unwrap();

        // Same code, different composite: still the same station.
        let mut moved = station("三江营(新)", Some("扬州市"));
        moved.station_code = Some("JS001".to_string());
        let second = repo.upsert_station(&moved).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.fields.station_name.as_deref(), Some("三江营(新)"));
        assert_eq!(repo.station_count().unwrap(), 1);
    }

    #[test]
    fn blank_fields_never_overwrite_stored_values() {
        let repo = repo();
        let full = station("新塘", Some("苏州市"));
        let first = repo.upsert_station(&full).unwrap();

        let mut sparse = full.clone();
        sparse.basin = Some("  ".to_string());
        let second = repo.upsert_station(&sparse).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.fields.basin.as_deref(), Some("长江流域"));
    }

    #[test]
    fn fuzzy_match_heals_missing_city() {
        let repo = repo();
        // First run: replay endpoint had no city column.
        let first = repo.upsert_station(&station("新塘", None)).unwrap();
        // Later run: same station, now with its city.
        let second = repo.upsert_station(&station("新塘", Some("苏州市"))).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.fields.city.as_deref(), Some("苏州市"));
        assert_eq!(repo.station_count().unwrap(), 1);

        // And the reverse direction also converges on the enriched row.
        let third = repo.upsert_station(&station("新塘", None)).unwrap();
        assert_eq!(third.id, first.id);
        assert_eq!(third.fields.city.as_deref(), Some("苏州市"));
    }

    #[test]
    fn ambiguous_fuzzy_candidates_create_a_new_station() {
        let repo = repo();
        repo.upsert_station(&station("新塘", Some("苏州市"))).unwrap();
        repo.upsert_station(&station("新塘", Some("无锡市"))).unwrap();

        // Two same-name stations in different cities: a city-less row cannot
        // be attributed to either.
        repo.upsert_station(&station("新塘", None)).unwrap();
        assert_eq!(repo.station_count().unwrap(), 3);
    }

    #[test]
    fn reading_upsert_is_idempotent() {
        let repo = repo();
        let rec = repo.upsert_station(&station("新塘", Some("苏州市"))).unwrap();

        let created = repo.upsert_reading(rec.id, &reading(8), batch_time()).unwrap();
        assert!(created);
        let created_again = repo.upsert_reading(rec.id, &reading(8), batch_time()).unwrap();
        assert!(!created_again);
        assert_eq!(repo.reading_count().unwrap(), 1);

        // A different observation hour is a different reading.
        let later = repo.upsert_reading(rec.id, &reading(12), batch_time()).unwrap();
        assert!(later);
        assert_eq!(repo.reading_count().unwrap(), 2);
    }

    #[test]
    fn reupsert_refreshes_payload_and_batch_time() {
        let repo = repo();
        let rec = repo.upsert_station(&station("新塘", Some("苏州市"))).unwrap();

        let created = repo.upsert_reading(rec.id, &reading(8), batch_time()).unwrap();
        assert!(created);

        // Same observation instant, revised value, captured by a later run.
        let mut revised = reading(8);
        revised.metrics.insert("ph".to_string(), Some(6.5));
        let later_batch = Shanghai.with_ymd_and_hms(2024, 5, 1, 13, 0, 0).unwrap();
        let created_again = repo.upsert_reading(rec.id, &revised, later_batch).unwrap();
        assert!(!created_again);
        assert_eq!(repo.reading_count().unwrap(), 1);

        let (payload, stored_batch): (String, chrono::NaiveDateTime) = repo
            .conn
            .query_row(
                "SELECT payload, batch_time FROM readings WHERE station_id = ?",
                params![rec.id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        let value: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["ph"], json!(6.5));
        assert_eq!(stored_batch, later_batch.naive_utc());
    }

    #[test]
    fn reading_without_observation_time_is_dropped() {
        let repo = repo();
        let rec = repo.upsert_station(&station("新塘", Some("苏州市"))).unwrap();

        let mut no_time = reading(8);
        no_time.observed_at = None;
        let created = repo.upsert_reading(rec.id, &no_time, batch_time()).unwrap();
        assert!(!created);
        assert_eq!(repo.reading_count().unwrap(), 0);
    }

    #[test]
    fn upsert_row_reports_station_and_creation() {
        let repo = repo();
        let outcome = repo
            .upsert_row(&station("新塘", Some("苏州市")), &reading(8), batch_time())
            .unwrap();
        assert!(outcome.created);

        let again = repo
            .upsert_row(&station("新塘", Some("苏州市")), &reading(8), batch_time())
            .unwrap();
        assert_eq!(again.station_id, outcome.station_id);
        assert!(!again.created);
    }

    #[test]
    fn payload_keeps_metrics_and_zone_aware_timestamps() {
        let r = reading(8);
        let payload = reading_payload(&r, r.observed_at.unwrap(), batch_time());
        let value: Value = serde_json::from_str(&payload).unwrap();

        assert_eq!(value["ph"], json!(7.2146));
        assert_eq!(value["dissolved_oxygen"], Value::Null);
        assert_eq!(value["water_quality_class"], json!("Ⅱ"));
        assert!(value["observed_at"].as_str().unwrap().contains("+08:00"));
    }

    #[test]
    fn rollback_discards_the_open_batch() {
        let repo = repo();
        repo.begin_run().unwrap();
        repo.upsert_row(&station("新塘", Some("苏州市")), &reading(8), batch_time())
            .unwrap();
        repo.rollback_run().unwrap();

        assert_eq!(repo.station_count().unwrap(), 0);
        assert_eq!(repo.reading_count().unwrap(), 0);
    }

    #[test]
    fn harvest_run_lifecycle_records_outcome() {
        let repo = repo();
        let run_id = repo.begin_harvest_run().unwrap();
        repo.finish_harvest_run(run_id, 1, 2500, 2400, None).unwrap();

        let status: String = repo
            .conn
            .query_row(
                "SELECT status FROM harvest_runs WHERE id = ?",
                params![run_id],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(status, "success");

        let failed = repo.begin_harvest_run().unwrap();
        repo.finish_harvest_run(failed, 0, 0, 0, Some("selector drift"))
            .unwrap();
        let (status, msg): (String, Option<String>) = repo
            .conn
            .query_row(
                "SELECT status, error_msg FROM harvest_runs WHERE id = ?",
                params![failed],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(status, "error");
        assert_eq!(msg.as_deref(), Some("selector drift"));
    }
}
