use chrono::DateTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

// ── Station ───────────────────────────────────────────────────────────────────

/// Station identity fields as parsed from one table row.
///
/// A station is identified by `station_code` when the source provides one,
/// otherwise by the composite (province, city, basin, river, station_name).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StationFields {
    pub province: Option<String>,
    pub city: Option<String>,
    pub basin: Option<String>,
    pub river: Option<String>,
    pub station_name: Option<String>,
    pub station_code: Option<String>,
}

/// A station row as stored, with its database id.
#[derive(Debug, Clone, PartialEq)]
pub struct StationRecord {
    pub id: i64,
    pub fields: StationFields,
}

/// Blank means "the source gave us nothing": None or whitespace-only.
pub fn is_blank(value: Option<&str>) -> bool {
    match value {
        None => true,
        Some(s) => s.trim().is_empty(),
    }
}

// ── Reading ───────────────────────────────────────────────────────────────────

/// One measurement snapshot for a station. `observed_at` is mandatory identity;
/// rows without it never become readings. The metric set is open (source pages
/// add columns without notice), so metrics live in a map, not fixed fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadingFields {
    pub observed_at: Option<DateTime<Tz>>,
    pub water_quality_class: Option<String>,
    pub station_status: Option<String>,
    pub metrics: BTreeMap<String, Option<f64>>,
}

// ── Parsed row ────────────────────────────────────────────────────────────────

/// Transient result of normalizing one raw table row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedRow {
    pub station: StationFields,
    pub reading: ReadingFields,
}

// ── Raw extraction types ──────────────────────────────────────────────────────

/// Side-channel values recovered outside the header-mapped cells, e.g. a city
/// injected by the traversal scope or read from a row tooltip.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowExtras {
    pub city: Option<String>,
}

/// One raw table row: cell texts aligned with the extracted headers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRow {
    pub cells: Vec<String>,
    pub extras: RowExtras,
}

/// Headers plus rows as returned by an extraction strategy. An empty result
/// signals "this strategy yielded nothing, try the next one".
#[derive(Debug, Clone, Default)]
pub struct TableData {
    pub headers: Vec<String>,
    pub rows: Vec<RawRow>,
}

impl TableData {
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty() || self.rows.is_empty()
    }
}

// ── Region hierarchy ──────────────────────────────────────────────────────────

/// One entry of the source's region selector: level 1 is a province, level 2 a
/// city keyed by its parent province id. Used only during one harvest pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AreaNode {
    pub id: String,
    pub label: String,
    pub level: u8,
    pub parent_id: String,
}

/// One query unit submitted to the replay endpoint: a region (province or
/// city) or a river/basin id. `city` is injected into every result row so
/// downstream normalization can attribute it even if the API omits the column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub area_id: String,
    pub river_id: String,
    pub label: String,
    pub city: Option<String>,
}

// ── Run summary ───────────────────────────────────────────────────────────────

/// Per-run statistics, returned to the caller and never persisted.
#[derive(Debug, Default)]
pub struct HarvestStats {
    pub pages_processed: usize,
    pub rows_seen: usize,
    pub rows_inserted: usize,
    pub database_path: String,
    pub snapshots: Vec<PathBuf>,
}
