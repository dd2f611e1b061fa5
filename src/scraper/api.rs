//! Publish-API replay extraction.
//!
//! The portal's front-end queries an internal paginated endpoint
//! (`action=getRealDatas`) per selected region. Replaying that endpoint
//! in-page, so session and cookie state are reused, is far more robust than
//! driving the UI, so this is the primary extraction strategy. Rows are
//! collected per scope (city, province, or river), deduplicated on their first
//! five cells, and tagged with the scope's city for downstream attribution.

use anyhow::Result;
use rand::RngExt;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::hierarchy::{build_scopes, parse_area_markup, river_scope};
use crate::browser::PageDriver;
use crate::config::ApiReplayConfig;
use crate::models::{AreaNode, RawRow, RowExtras, Scope, TableData};

/// Selector for the area dropdown menu whose anchors encode the hierarchy.
const AREA_MENU_SELECTOR: &str = "#ddm_Area + ul";

const AREA_READY_SCRIPT: &str =
    "(win, doc) => Array.isArray(win._TopAreaInfo) && win._TopAreaInfo.length > 0";

const GLOBAL_AREAS_SCRIPT: &str = r#"(win, doc) => (win._TopAreaInfo || [])
    .map(item => ({ id: String(item.AreaID || ''), label: String(item.AreaName || '') }))"#;

const RIVER_IDS_SCRIPT: &str = r#"(win, doc) => (win._TopRiverInfo || [])
    .map(item => String(item.RiverID || '')).filter(Boolean)"#;

static HTML_TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").unwrap());
static CITY_HINT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"所在地市\s*[:：]\s*([^\n\r<"]+)"#).unwrap());

// ── Text normalization ────────────────────────────────────────────────────────

/// Clean one API cell: strip HTML fragments, non-breaking spaces and newlines.
/// The `--` sentinel is a real value on this portal and survives unchanged.
pub fn normalize_api_text(value: &str) -> String {
    let mut text = value.to_string();
    if text.contains('<') && text.contains('>') {
        text = HTML_TAG_RE.replace_all(&text, "").into_owned();
    }
    let text = text
        .replace("&nbsp;", "")
        .replace('\u{a0}', " ")
        .replace('\n', "");
    text.trim().to_string()
}

fn unescape_entities(value: &str) -> String {
    value
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

/// Best-effort city recovery from HTML tooltip fragments in the API payload.
pub fn extract_city_hint(raw_cells: &[String]) -> Option<String> {
    for raw in raw_cells {
        if raw.is_empty() {
            continue;
        }
        let text = unescape_entities(raw);
        let Some(caps) = CITY_HINT_RE.captures(&text) else {
            continue;
        };
        let city = normalize_api_text(&caps[1]);
        if !city.is_empty() && city != "--" {
            return Some(city);
        }
    }
    None
}

fn api_cell_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// The endpoint reports `result: 1` on success, but has been seen returning
/// booleans and strings; anything non-empty and non-zero counts.
fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0) != 0.0,
        Some(Value::String(s)) => !s.is_empty() && s != "0",
        Some(_) => true,
    }
}

fn total_pages_of(payload: &Value) -> u32 {
    let total = match payload.get("total") {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(1) as u32,
        Some(Value::String(s)) => s.trim().parse().unwrap_or(1),
        _ => 1,
    };
    total.max(1)
}

// ── Extractor ─────────────────────────────────────────────────────────────────

struct Collected {
    headers: Vec<String>,
    rows: Vec<RawRow>,
    index: HashMap<Vec<String>, usize>,
}

pub struct ApiReplayExtractor<'a, D: PageDriver> {
    driver: &'a D,
    config: &'a ApiReplayConfig,
}

impl<'a, D: PageDriver> ApiReplayExtractor<'a, D> {
    pub fn new(driver: &'a D, config: &'a ApiReplayConfig) -> Self {
        Self { driver, config }
    }

    /// Run the full replay pass. An empty result means the endpoint is
    /// unusable and the caller should fall back to DOM extraction.
    pub async fn extract(&self) -> Result<TableData> {
        let ready = self
            .driver
            .wait_for_function(
                AREA_READY_SCRIPT,
                Duration::from_millis(self.config.metadata_wait_ms),
            )
            .await
            .unwrap_or(false);
        if !ready {
            debug!("Area metadata never became available; signalling DOM fallback");
            return Ok(TableData::default());
        }

        let nodes = self.area_nodes().await;
        if nodes.is_empty() {
            return Ok(TableData::default());
        }
        let scopes = build_scopes(&nodes);

        let river_ids: Vec<String> = match self.driver.evaluate(RIVER_IDS_SCRIPT).await {
            Ok(value) => serde_json::from_value(value).unwrap_or_default(),
            Err(_) => Vec::new(),
        };

        let mut collected = Collected {
            headers: Vec::new(),
            rows: Vec::new(),
            index: HashMap::new(),
        };

        for scope in &scopes {
            self.collect_scope(&mut collected, scope).await;
        }

        // Safety net: a second, independent coordinate system over the same
        // data. When province/city coverage looks implausibly thin, traverse
        // by river id and merge into the same dedup set.
        if collected.rows.len() < self.config.min_expected_rows && !river_ids.is_empty() {
            warn!(
                "Area pass yielded {} rows (< {}), running river fallback pass",
                collected.rows.len(),
                self.config.min_expected_rows
            );
            for river_id in &river_ids {
                self.collect_scope(&mut collected, &river_scope(river_id))
                    .await;
            }
        }

        Ok(TableData {
            headers: collected.headers,
            rows: collected.rows,
        })
    }

    /// Hierarchy from the dropdown markup, falling back to the flat page
    /// global when markup parsing yields nothing.
    async fn area_nodes(&self) -> Vec<AreaNode> {
        if let Ok(Some(markup)) = self.driver.outer_html(AREA_MENU_SELECTOR).await {
            let nodes = parse_area_markup(&markup);
            if !nodes.is_empty() {
                return nodes;
            }
        }

        let raw = match self.driver.evaluate(GLOBAL_AREAS_SCRIPT).await {
            Ok(value) => value,
            Err(_) => return Vec::new(),
        };
        let Some(items) = raw.as_array() else {
            return Vec::new();
        };

        let mut nodes = Vec::new();
        for item in items {
            let id = normalize_api_text(item.get("id").map(api_cell_string).unwrap_or_default().as_str());
            let label =
                normalize_api_text(item.get("label").map(api_cell_string).unwrap_or_default().as_str());
            if id.is_empty() {
                continue;
            }
            nodes.push(AreaNode {
                id,
                label,
                level: 1,
                parent_id: String::new(),
            });
        }
        nodes
    }

    /// Page through the endpoint for one scope, merging rows into the dedup
    /// set. Any request or parse failure ends the scope silently; partial
    /// data from one scope must not abort the run.
    async fn collect_scope(&self, collected: &mut Collected, scope: &Scope) -> usize {
        let mut page_index: u32 = 1;
        let mut total_pages: u32 = 1;
        let mut scope_rows = 0usize;

        while page_index <= total_pages && page_index <= self.config.max_pages {
            self.polite_delay().await;

            let script = match self.fetch_script(scope, page_index) {
                Ok(script) => script,
                Err(_) => break,
            };
            let payload = match self.driver.evaluate(&script).await {
                Ok(value) => value,
                Err(_) => break,
            };
            if !payload.is_object() || !truthy(payload.get("result")) {
                break;
            }

            if collected.headers.is_empty()
                && let Some(thead) = payload.get("thead").and_then(Value::as_array)
            {
                collected
                    .headers
                    .extend(thead.iter().map(|v| normalize_api_text(&api_cell_string(v))));
            }

            let Some(tbody) = payload.get("tbody").and_then(Value::as_array) else {
                break;
            };

            for row in tbody {
                let Some(items) = row.as_array() else {
                    continue;
                };
                let raw_cells: Vec<String> = items.iter().map(api_cell_string).collect();
                let cells: Vec<String> =
                    raw_cells.iter().map(|c| normalize_api_text(c)).collect();
                if cells.is_empty() {
                    continue;
                }

                let key: Vec<String> = cells.iter().take(5).cloned().collect();
                let city = scope
                    .city
                    .clone()
                    .or_else(|| extract_city_hint(&raw_cells));

                if let Some(&existing) = collected.index.get(&key) {
                    let stored = &mut collected.rows[existing];
                    if stored.extras.city.is_none() && city.is_some() {
                        stored.extras.city = city;
                    }
                    continue;
                }

                let idx = collected.rows.len();
                collected.rows.push(RawRow {
                    cells,
                    extras: RowExtras { city },
                });
                collected.index.insert(key, idx);
                scope_rows += 1;
            }

            total_pages = total_pages_of(&payload);
            page_index += 1;
        }

        info!("API {} -> rows={}", scope.label, scope_rows);
        scope_rows
    }

    fn fetch_script(&self, scope: &Scope, page_index: u32) -> Result<String> {
        let endpoint = serde_json::to_string(&self.config.endpoint)?;
        let area = serde_json::to_string(&scope.area_id)?;
        let river = serde_json::to_string(&scope.river_id)?;
        let page_size = self.config.page_size;

        Ok(format!(
            r#"async (win, doc) => {{
                const params = new win.URLSearchParams();
                params.set("action", "getRealDatas");
                params.set("AreaID", {area});
                params.set("RiverID", {river});
                params.set("MNName", "");
                params.set("PageIndex", String({page_index}));
                params.set("PageSize", String({page_size}));
                const resp = await win.fetch({endpoint}, {{
                    method: "POST",
                    headers: {{
                        "Content-Type": "application/x-www-form-urlencoded; charset=UTF-8",
                        "X-Requested-With": "XMLHttpRequest"
                    }},
                    body: params.toString(),
                    credentials: "same-origin"
                }});
                const text = await resp.text();
                try {{
                    return JSON.parse(text);
                }} catch (e) {{
                    return {{ result: 0, error: text.slice(0, 300) }};
                }}
            }}"#
        ))
    }

    /// Sequential, politely spaced requests; no fan-out across scopes.
    async fn polite_delay(&self) {
        if self.config.request_delay_ms == 0 && self.config.jitter_ms == 0 {
            return;
        }
        let jitter = rand::rng().random_range(0..=self.config.jitter_ms);
        sleep(Duration::from_millis(self.config.request_delay_ms + jitter)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::fake::FakeDriver;
    use serde_json::json;

    fn quiet_config() -> ApiReplayConfig {
        ApiReplayConfig {
            request_delay_ms: 0,
            jitter_ms: 0,
            metadata_wait_ms: 10,
            ..ApiReplayConfig::default()
        }
    }

    fn capture(script: &str, field: &str) -> Option<String> {
        let re = Regex::new(&format!(r#"params\.set\("{field}", (?:String\()?"?([^")]*)"?\)?\);"#))
            .unwrap();
        re.captures(script).map(|c| c[1].to_string())
    }

    const DROPDOWN: &str = r#"
        <ul>
            <li><a onclick="filterArea('330000','浙江省',1)">浙江省</a></li>
            <li><a data-id="330000" onclick="filterArea('330100','杭州市',2)">杭州市</a></li>
            <li><a data-id="330000" onclick="filterArea('330200','宁波市',2)">宁波市</a></li>
        </ul>
    "#;

    fn publish_response(rows: &[&[&str]]) -> Value {
        json!({
            "result": 1,
            "thead": ["省份", "断面名称", "监测时间", "pH(无量纲)", "水质类别"],
            "tbody": rows.iter().map(|r| json!(r)).collect::<Vec<_>>(),
            "total": 1,
        })
    }

    fn driver_for_two_cities() -> FakeDriver {
        let mut driver = FakeDriver::default();
        driver.wait_fn = Box::new(|_| true);
        driver.html_fn = Box::new(|sel| {
            (sel == AREA_MENU_SELECTOR).then(|| DROPDOWN.to_string())
        });
        driver.eval_fn = Box::new(|script| {
            if script.contains("_TopRiverInfo") {
                return Ok(json!([]));
            }
            match capture(script, "AreaID").as_deref() {
                Some("330100") => Ok(publish_response(&[
                    &["浙江省", "新塘", "04-28 08:00", "7.2", "II"],
                    &["浙江省", "閘口", "04-28 08:00", "7.0", "II"],
                    &["浙江省", "湖心", "04-28 08:00", "6.9", "III"],
                ])),
                Some("330200") => Ok(publish_response(&[
                    &["浙江省", "姚江", "04-28 08:00", "7.5", "II"],
                    &["浙江省", "甬江", "04-28 08:00", "7.4", "III"],
                ])),
                _ => Ok(json!({"result": 0})),
            }
        });
        driver
    }

    #[tokio::test]
    async fn two_city_province_yields_tagged_union_of_rows() {
        let driver = driver_for_two_cities();
        let config = quiet_config();
        let table = ApiReplayExtractor::new(&driver, &config)
            .extract()
            .await
            .unwrap();

        assert_eq!(table.rows.len(), 5);
        assert_eq!(table.headers[0], "省份");
        let hangzhou = table
            .rows
            .iter()
            .filter(|r| r.extras.city.as_deref() == Some("杭州市"))
            .count();
        let ningbo = table
            .rows
            .iter()
            .filter(|r| r.extras.city.as_deref() == Some("宁波市"))
            .count();
        assert_eq!((hangzhou, ningbo), (3, 2));
    }

    #[tokio::test]
    async fn missing_metadata_signals_dom_fallback() {
        let mut driver = FakeDriver::default();
        driver.wait_fn = Box::new(|_| false);
        let config = quiet_config();
        let table = ApiReplayExtractor::new(&driver, &config)
            .extract()
            .await
            .unwrap();
        assert!(table.is_empty());
        assert!(table.headers.is_empty() && table.rows.is_empty());
    }

    #[tokio::test]
    async fn empty_hierarchy_and_no_global_fallback_yields_empty() {
        let mut driver = FakeDriver::default();
        driver.wait_fn = Box::new(|_| true);
        driver.html_fn = Box::new(|_| None);
        driver.eval_fn = Box::new(|script| {
            if script.contains("_TopAreaInfo") {
                Ok(json!([]))
            } else {
                Ok(Value::Null)
            }
        });
        let config = quiet_config();
        let table = ApiReplayExtractor::new(&driver, &config)
            .extract()
            .await
            .unwrap();
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn duplicate_rows_backfill_city_instead_of_duplicating() {
        let mut driver = FakeDriver::default();
        driver.wait_fn = Box::new(|_| true);
        // One municipality-less province scope (no city tag), then a river
        // pass that resends the same row via a city-bearing tooltip.
        driver.html_fn = Box::new(|_| {
            Some(
                r#"<ul><li><a onclick="filterArea('340000','安徽省',1)">安徽省</a></li></ul>"#
                    .to_string(),
            )
        });
        driver.eval_fn = Box::new(|script| {
            if script.contains("_TopRiverInfo") {
                return Ok(json!(["CJ"]));
            }
            if capture(script, "RiverID").as_deref() == Some("CJ") {
                return Ok(json!({
                    "result": 1,
                    "thead": ["省份", "断面名称", "监测时间", "pH(无量纲)", "水质类别"],
                    "tbody": [[
                        "安徽省",
                        "<span data-original-title=\"所在地市: 合肥市\">湖心</span>",
                        "04-28 08:00", "7.2", "II"
                    ]],
                    "total": 1,
                }));
            }
            Ok(publish_response(&[&["安徽省", "湖心", "04-28 08:00", "7.2", "II"]]))
        });

        let config = quiet_config(); // area pass is tiny, river pass triggers
        let table = ApiReplayExtractor::new(&driver, &config)
            .extract()
            .await
            .unwrap();

        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.rows[0].extras.city.as_deref(), Some("合肥市"));
    }

    #[tokio::test]
    async fn scope_pagination_respects_reported_total() {
        let mut driver = FakeDriver::default();
        driver.wait_fn = Box::new(|_| true);
        driver.html_fn = Box::new(|_| {
            Some(r#"<ul><li><a onclick="filterArea('110000','北京市',1)">北京市</a></li></ul>"#.to_string())
        });
        driver.eval_fn = Box::new(|script| {
            if script.contains("_TopRiverInfo") {
                return Ok(json!([]));
            }
            let page: u32 = capture(script, "PageIndex")
                .and_then(|p| p.parse().ok())
                .unwrap_or(1);
            let name = format!("断面{page}");
            Ok(json!({
                "result": 1,
                "thead": ["省份", "断面名称", "监测时间", "pH(无量纲)", "水质类别"],
                "tbody": [["北京市", name, "04-28 08:00", "7.2", "II"]],
                "total": "3",
            }))
        });

        let config = quiet_config();
        let table = ApiReplayExtractor::new(&driver, &config)
            .extract()
            .await
            .unwrap();
        assert_eq!(table.rows.len(), 3);
        // Municipality scope tags its own label as the city.
        assert!(table.rows.iter().all(|r| r.extras.city.as_deref() == Some("北京市")));
    }

    #[test]
    fn normalize_strips_markup_but_keeps_sentinel() {
        assert_eq!(normalize_api_text("<span>7.2</span>"), "7.2");
        assert_eq!(normalize_api_text("a&nbsp;b\nc"), "abc");
        assert_eq!(normalize_api_text("  --  "), "--");
    }

    #[test]
    fn city_hint_found_in_escaped_tooltip() {
        let cells = vec![
            "7.2".to_string(),
            "<td data-original-title=&quot;所在地市: 苏州市&quot;>x</td>".to_string(),
        ];
        assert_eq!(extract_city_hint(&cells).as_deref(), Some("苏州市"));
        assert_eq!(extract_city_hint(&["plain".to_string()]), None);
    }
}
