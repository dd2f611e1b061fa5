//! Row normalization: raw header labels and cell text → typed station and
//! reading fields.
//!
//! Nothing in here returns an error. A malformed cell degrades to "absent";
//! aborting a whole harvest over one bad value would lose the rest of the page.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::models::{ParsedRow, ReadingFields, RowExtras, StationFields, is_blank};

// ── Header mapping ────────────────────────────────────────────────────────────

/// Map one raw portal header onto its stable internal field name. Unmatched
/// labels pass through unchanged and are treated as ad-hoc metric names, so
/// source pages can add columns without code changes here.
pub fn map_header(label: &str) -> &str {
    match label {
        "省份" => "province",
        "城市" => "city",
        "流域" => "basin",
        "河流" => "river",
        "断面" => "station_name",
        "断面名称" => "station_name",
        "断面编码" => "station_code",
        "监测时间" => "observed_at",
        "测站" => "station_name",
        "站点" => "station_name",
        "站点名称" => "station_name",
        "监测点" => "station_name",
        "水质类别" => "water_quality_class",
        "站点情况" => "station_status",
        "水温(℃)" => "water_temperature_c",
        "pH(无量纲)" => "ph",
        "溶解氧(mg/L)" => "dissolved_oxygen_mg_l",
        "电导率(μS/cm)" => "conductivity_us_cm",
        "浊度(NTU)" => "turbidity_ntu",
        "高锰酸盐指数(mg/L)" => "permanganate_index_mg_l",
        "氨氮(mg/L)" => "ammonia_n_mg_l",
        "总磷(mg/L)" => "total_phosphorus_mg_l",
        "总氮(mg/L)" => "total_nitrogen_mg_l",
        "叶绿素α(mg/L)" => "chlorophyll_a_mg_l",
        "藻密度(cells/L)" => "algae_density_cells_l",
        other => other,
    }
}

/// Normalize a list of raw header labels: trim, drop embedded newlines, map.
pub fn normalize_headers<S: AsRef<str>>(headers: &[S]) -> Vec<String> {
    headers
        .iter()
        .map(|h| {
            let cleaned = h.as_ref().trim().replace('\n', "");
            map_header(&cleaned).to_string()
        })
        .collect()
}

// ── Value coercion ────────────────────────────────────────────────────────────

/// Raw cell texts the portal uses for "no value", including its 9999 placeholder.
const NULL_TOKENS: &[&str] = &["", "-", "—", "--", "——", "null", "NULL", "9999", "NaN"];

pub fn is_null_token(raw: &str) -> bool {
    NULL_TOKENS.contains(&raw)
}

/// Convert raw metric strings into floats with NULL token handling.
/// "12,345.6" → 12345.6 | "abc" → None (not an error)
pub fn parse_numeric(value: &str) -> Option<f64> {
    let raw = value.trim();
    if is_null_token(raw) {
        return None;
    }
    raw.replace(',', "").parse().ok()
}

/// Parse timestamps into the requested timezone.
///
/// Zone-less values are stamped with `tz`; zoned values are converted to it.
/// The portal sometimes renders month-day only ("04-28 08:00"); those get the
/// current year in `tz`.
pub fn parse_timestamp(value: &str, tz: Tz) -> Option<DateTime<Tz>> {
    let raw = value.trim();
    if is_null_token(raw) {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&tz));
    }

    const DATETIME_FORMATS: &[&str] = &[
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
        "%Y/%m/%d %H:%M:%S",
        "%Y/%m/%d %H:%M",
        "%Y-%m-%dT%H:%M:%S",
    ];
    for format in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return tz.from_local_datetime(&naive).earliest();
        }
    }

    const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d"];
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            let naive = date.and_hms_opt(0, 0, 0)?;
            return tz.from_local_datetime(&naive).earliest();
        }
    }

    let year = Utc::now().with_timezone(&tz).year();
    const MONTH_DAY_FORMATS: &[&str] = &["%Y-%m-%d %H:%M", "%Y-%m-%d %H:%M:%S"];
    for format in MONTH_DAY_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&format!("{year}-{raw}"), format) {
            return tz.from_local_datetime(&naive).earliest();
        }
    }

    None
}

fn clean_text(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

// ── Row parsing ───────────────────────────────────────────────────────────────

/// Convert one row of raw text into structured station and reading data.
///
/// `headers` are the normalized headers from [`normalize_headers`], aligned
/// with `cells`. Side-channel `extras` merge afterwards and take precedence
/// for station/reading text fields only, never for numeric metrics.
pub fn parse_row(headers: &[String], cells: &[String], tz: Tz, extras: &RowExtras) -> ParsedRow {
    let mut station = StationFields::default();
    let mut reading = ReadingFields::default();

    for (header, value) in headers.iter().zip(cells.iter()) {
        match header.as_str() {
            "observed_at" => reading.observed_at = parse_timestamp(value, tz),
            "province" => station.province = clean_text(value),
            "city" => station.city = clean_text(value),
            "basin" => station.basin = clean_text(value),
            "river" => station.river = clean_text(value),
            "station_name" => station.station_name = clean_text(value),
            "station_code" => station.station_code = clean_text(value),
            "water_quality_class" => reading.water_quality_class = clean_text(value),
            "station_status" => reading.station_status = clean_text(value),
            metric => {
                reading
                    .metrics
                    .insert(metric.to_string(), parse_numeric(value));
            }
        }
    }

    if !is_blank(extras.city.as_deref()) {
        station.city = extras.city.clone();
    }

    ParsedRow { station, reading }
}
