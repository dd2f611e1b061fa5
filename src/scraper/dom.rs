//! DOM fallback extraction.
//!
//! Used only when the API replay path yields nothing: reset the page to the
//! nationwide/all-basins filter state, run the configured pagination behavior
//! (infinite scroll or load-more clicks), then read header and row cells per
//! the configured selectors. The UI renders truncated display text while the
//! full-precision value lives in a tooltip, so cell extraction prefers the
//! tooltip's 原始值 line.

use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use crate::browser::PageDriver;
use crate::config::{PageConfig, ScrollMode, ScrollSettings};
use crate::error::HarvestError;
use crate::models::{RawRow, RowExtras, TableData};

// ── Tooltip decoding ──────────────────────────────────────────────────────────

/// Pull the full-precision value out of a tooltip like
/// "原始值：7.2146\n修约值：7.2".
pub fn raw_tooltip_value(tooltip: &str) -> Option<String> {
    if !tooltip.contains("原始值") {
        return None;
    }
    for line in tooltip.lines() {
        if let Some(rest) = line.split_once("原始值").map(|(_, rest)| rest) {
            let raw = rest.replace('：', "").replace(':', "");
            let raw = raw.trim();
            if !raw.is_empty() {
                return Some(raw.to_string());
            }
        }
    }
    None
}

/// City hint from a row-level tooltip line such as "所在地市: 苏州市".
pub fn city_from_row_tooltip(tooltip: &str) -> Option<String> {
    for line in tooltip.lines() {
        let line = line.trim();
        let rest = line
            .strip_prefix("所在地市:")
            .or_else(|| line.strip_prefix("所在地市："));
        if let Some(rest) = rest {
            let city = rest.trim();
            if !city.is_empty() {
                return Some(city.to_string());
            }
            return None;
        }
    }
    None
}

#[derive(Debug, Deserialize)]
struct DomCell {
    #[serde(default)]
    text: String,
    #[serde(default)]
    tooltip: Option<String>,
    #[serde(default, rename = "innerTooltip")]
    inner_tooltip: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DomRow {
    #[serde(default)]
    cells: Vec<DomCell>,
    #[serde(default, rename = "rowTooltip")]
    row_tooltip: Option<String>,
}

fn cell_value(cell: &DomCell) -> String {
    cell.tooltip
        .as_deref()
        .and_then(raw_tooltip_value)
        .or_else(|| cell.inner_tooltip.as_deref().and_then(raw_tooltip_value))
        .unwrap_or_else(|| cell.text.trim().to_string())
}

// ── Extractor ─────────────────────────────────────────────────────────────────

pub struct DomExtractor<'a, D: PageDriver> {
    driver: &'a D,
    page: &'a PageConfig,
    timeout: Duration,
}

impl<'a, D: PageDriver> DomExtractor<'a, D> {
    pub fn new(driver: &'a D, page: &'a PageConfig, timeout: Duration) -> Self {
        Self {
            driver,
            page,
            timeout,
        }
    }

    /// Drive the live table into full view and read it. Only a missing table
    /// container is an error; empty headers/rows are the orchestrator's call.
    pub async fn extract(&self) -> Result<TableData, HarvestError> {
        self.select_national_scope().await;
        self.perform_scroll(&self.page.scroll).await;

        let container = &self.page.table.table_container;
        let found = self
            .driver
            .wait_for_selector(container, self.timeout)
            .await
            .map_err(|e| HarvestError::Automation(e.to_string()))?;
        if !found {
            return Err(HarvestError::selector(
                format!("未找到表格容器选择器: {container}"),
                "请在 Chrome DevTools 中重新确认 table_container 是否指向包含数据表的元素。",
            ));
        }

        let headers = self
            .driver
            .inner_texts(&self.page.table.header_cells)
            .await
            .map_err(|e| HarvestError::Automation(e.to_string()))?;

        let rows = self.extract_rows().await?;

        Ok(TableData { headers, rows })
    }

    async fn extract_rows(&self) -> Result<Vec<RawRow>, HarvestError> {
        let script = self.rows_script().map_err(|e| HarvestError::Automation(e.to_string()))?;
        let value = self
            .driver
            .evaluate(&script)
            .await
            .map_err(|e| HarvestError::Automation(e.to_string()))?;

        let dom_rows: Vec<DomRow> = match value {
            Value::Null => Vec::new(),
            other => serde_json::from_value(other).unwrap_or_default(),
        };

        Ok(dom_rows
            .into_iter()
            .filter(|row| !row.cells.is_empty())
            .map(|row| {
                let city = row.row_tooltip.as_deref().and_then(city_from_row_tooltip);
                RawRow {
                    cells: row.cells.iter().map(cell_value).collect(),
                    extras: RowExtras { city },
                }
            })
            .collect())
    }

    /// Build the in-page script that walks the table and returns cell text
    /// plus tooltip attributes. Row/cell selection honors `cell_selector`
    /// first, then `column_overrides`, then a plain td/th sweep.
    fn rows_script(&self) -> anyhow::Result<String> {
        let table = &self.page.table;
        let container = serde_json::to_string(&table.table_container)?;
        let data_rows = serde_json::to_string(&table.data_rows)?;
        let cell_selector = serde_json::to_string(&table.cell_selector)?;
        let overrides = serde_json::to_string(&json!(table.column_overrides))?;
        let headers = serde_json::to_string(&table.header_cells)?;

        Ok(format!(
            r#"(win, doc) => {{
                const table = doc.querySelector({container});
                if (!table) return null;
                const headerEls = table.querySelectorAll({headers});
                const headerText = Array.from(headerEls)
                    .map(el => (el.innerText || el.textContent || "").trim());
                const cellSelector = {cell_selector};
                const overrides = {overrides};
                const hasOverrides = Object.keys(overrides).length > 0;
                const readCell = (cell) => {{
                    if (!cell) return {{ text: "", tooltip: null, innerTooltip: null }};
                    const inner = cell.querySelector("[data-original-title]");
                    return {{
                        text: (cell.innerText || cell.textContent || "").trim(),
                        tooltip: cell.getAttribute("data-original-title"),
                        innerTooltip: inner ? inner.getAttribute("data-original-title") : null
                    }};
                }};
                const rows = [];
                for (const row of table.querySelectorAll({data_rows})) {{
                    let cellEls;
                    if (cellSelector) {{
                        cellEls = Array.from(row.querySelectorAll(cellSelector));
                    }} else if (hasOverrides) {{
                        cellEls = headerText.map(h => {{
                            const sel = overrides[h];
                            return sel ? row.querySelector(sel) : null;
                        }});
                    }} else {{
                        cellEls = Array.from(row.querySelectorAll("td, th"));
                    }}
                    const host = row.querySelector("td.MN [data-original-title]");
                    rows.push({{
                        cells: cellEls.map(readCell),
                        rowTooltip: host ? host.getAttribute("data-original-title") : null
                    }});
                }}
                return rows;
            }}"#
        ))
    }

    // ── Filter state ──────────────────────────────────────────────────────────

    /// Scope the grid to the nationwide view instead of the default region.
    /// Prefers the page's own filter functions over clicking; every step here
    /// is best-effort and failure leaves the current scope in place.
    async fn select_national_scope(&self) {
        let rows_before = self.row_count().await;

        let mut switched = self
            .driver
            .evaluate(
                r#"(win, doc) => (typeof win.filterArea === 'function')
                    && (win.filterArea('', '城市', 0), true)"#,
            )
            .await
            .map(|v| v.as_bool().unwrap_or(false))
            .unwrap_or(false);

        if !switched {
            switched = self.switch_via_dropdown().await;
        }
        if switched {
            self.wait_for_row_change(rows_before, "area filter").await;
        }

        self.select_all_river_scope().await;
    }

    async fn switch_via_dropdown(&self) -> bool {
        let present = self
            .driver
            .wait_for_selector("#ddm_Area", Duration::from_millis(2_000))
            .await
            .unwrap_or(false);
        if !present {
            return false;
        }
        if !self.driver.click("#ddm_Area").await.unwrap_or(false) {
            return false;
        }

        self.driver
            .evaluate(
                r#"(win, doc) => {
                    const anchors = Array.from(
                        doc.querySelectorAll("ul[aria-labelledby='ddm_Area'] a"));
                    const option = anchors.find(a => (a.textContent || "").includes("全国"))
                        || anchors.find(a =>
                            (a.getAttribute("onclick") || "").includes("filterArea('',"));
                    if (!option) return false;
                    option.click();
                    return true;
                }"#,
            )
            .await
            .map(|v| v.as_bool().unwrap_or(false))
            .unwrap_or(false)
    }

    /// Reset the basin filter to "all" so nationwide rows are not truncated.
    async fn select_all_river_scope(&self) {
        let rows_before = self.row_count().await;
        let switched = self
            .driver
            .evaluate(
                r#"(win, doc) => (typeof win.filterRiver === 'function')
                    && (win.filterRiver('', '流域'), true)"#,
            )
            .await
            .map(|v| v.as_bool().unwrap_or(false))
            .unwrap_or(false);
        if switched {
            self.wait_for_row_change(rows_before, "river filter").await;
        }
    }

    async fn row_count(&self) -> i64 {
        let Ok(sel) = serde_json::to_string(&self.page.table.data_rows) else {
            return 0;
        };
        self.driver
            .evaluate(&format!("(win, doc) => doc.querySelectorAll({sel}).length"))
            .await
            .map(|v| v.as_i64().unwrap_or(0))
            .unwrap_or(0)
    }

    async fn wait_for_row_change(&self, rows_before: i64, label: &str) {
        sleep(Duration::from_millis(1_500)).await;
        if rows_before == 0 {
            return;
        }
        let Ok(sel) = serde_json::to_string(&self.page.table.data_rows) else {
            return;
        };
        let script =
            format!("(win, doc) => doc.querySelectorAll({sel}).length !== {rows_before}");
        let changed = self
            .driver
            .wait_for_function(&script, Duration::from_millis(6_000))
            .await
            .unwrap_or(false);
        if !changed {
            debug!("{} did not change row count within timeout", label);
        }
    }

    // ── Pagination ────────────────────────────────────────────────────────────

    async fn perform_scroll(&self, scroll: &ScrollSettings) {
        match scroll.mode {
            ScrollMode::None => {}
            ScrollMode::InfiniteScroll => self.infinite_scroll(scroll).await,
            ScrollMode::LoadMore => self.load_more(scroll).await,
        }
    }

    /// Scroll the container to the bottom until the row count and scroll
    /// height stop changing for several consecutive rounds.
    async fn infinite_scroll(&self, scroll: &ScrollSettings) {
        let container = scroll.container.as_deref().unwrap_or("body");
        let Ok(sel) = serde_json::to_string(container) else {
            return;
        };

        let scroll_script = format!(
            r#"(win, doc) => {{
                const el = doc.querySelector({sel});
                if (el) {{
                    el.scrollTo(0, el.scrollHeight);
                    el.dispatchEvent(new win.Event('scroll', {{ bubbles: true }}));
                }} else {{
                    win.scrollTo(0, doc.body.scrollHeight);
                }}
            }}"#
        );
        let height_script = format!(
            r#"(win, doc) => {{
                const el = doc.querySelector({sel});
                return el ? el.scrollHeight : doc.body.scrollHeight;
            }}"#
        );

        let mut last_height = -1i64;
        let mut last_rows = -1i64;
        let mut stable_rounds = 0u32;

        for _ in 0..scroll.max_iterations {
            let _ = self.driver.evaluate(&scroll_script).await;
            sleep(Duration::from_millis(scroll.wait_for_ms)).await;

            let height = self
                .driver
                .evaluate(&height_script)
                .await
                .map(|v| v.as_i64().unwrap_or(0))
                .unwrap_or(0);
            let rows = self.row_count().await;

            if height == last_height && rows == last_rows {
                stable_rounds += 1;
            } else {
                stable_rounds = 0;
            }
            // Several stable rounds guard against early stops on slow updates.
            if stable_rounds >= 3 {
                break;
            }
            last_height = height;
            last_rows = rows;
        }
    }

    /// Click the load-more button until it disappears or disables.
    async fn load_more(&self, scroll: &ScrollSettings) {
        let Some(button) = scroll.load_more_button.as_deref() else {
            debug!("load_more mode without load_more_button selector; skipping");
            return;
        };
        let Ok(sel) = serde_json::to_string(button) else {
            return;
        };
        let enabled_script = format!(
            r#"(win, doc) => {{
                const el = doc.querySelector({sel});
                return !!el && !el.disabled;
            }}"#
        );

        for _ in 0..scroll.max_iterations {
            let present = self
                .driver
                .wait_for_selector(button, Duration::from_millis(1_000))
                .await
                .unwrap_or(false);
            if !present {
                break;
            }
            let enabled = self
                .driver
                .evaluate(&enabled_script)
                .await
                .map(|v| v.as_bool().unwrap_or(false))
                .unwrap_or(false);
            if !enabled {
                break;
            }
            if !self.driver.click(button).await.unwrap_or(false) {
                break;
            }
            sleep(Duration::from_millis(scroll.wait_for_ms)).await;
            // The button can vanish once everything is loaded.
            let still_there = self
                .driver
                .wait_for_selector(button, Duration::from_millis(500))
                .await
                .unwrap_or(false);
            if !still_there {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::fake::FakeDriver;
    use crate::config::PageConfig;
    use serde_json::json;

    fn no_scroll_page() -> PageConfig {
        let mut page = PageConfig {
            url: "https://example.test/main".to_string(),
            iframe_chain: vec![],
            table: Default::default(),
            scroll: Default::default(),
        };
        page.scroll.mode = ScrollMode::None;
        page
    }

    #[test]
    fn tooltip_raw_value_wins_over_display_text() {
        let cell = DomCell {
            text: "7.2".to_string(),
            tooltip: Some("原始值：7.2146\n修约值：7.2".to_string()),
            inner_tooltip: None,
        };
        assert_eq!(cell_value(&cell), "7.2146");
    }

    #[test]
    fn inner_tooltip_is_second_preference() {
        let cell = DomCell {
            text: "7.2".to_string(),
            tooltip: Some("no marker here".to_string()),
            inner_tooltip: Some("原始值: 7.2146".to_string()),
        };
        assert_eq!(cell_value(&cell), "7.2146");
    }

    #[test]
    fn plain_cell_falls_back_to_text() {
        let cell = DomCell {
            text: " 7.2 ".to_string(),
            tooltip: None,
            inner_tooltip: None,
        };
        assert_eq!(cell_value(&cell), "7.2");
    }

    #[test]
    fn city_recovered_from_row_tooltip() {
        assert_eq!(
            city_from_row_tooltip("断面: 新塘\n所在地市: 苏州市").as_deref(),
            Some("苏州市")
        );
        assert_eq!(city_from_row_tooltip("所在地市:"), None);
        assert_eq!(city_from_row_tooltip("unrelated"), None);
    }

    #[tokio::test]
    async fn extract_reads_rows_and_row_tooltips() {
        let mut driver = FakeDriver::default();
        driver.selector_fn = Box::new(|_| true);
        driver.texts_fn = Box::new(|_| vec!["省份".to_string(), "pH(无量纲)".to_string()]);
        driver.eval_fn = Box::new(|script| {
            if script.contains("rowTooltip") {
                Ok(json!([
                    {
                        "cells": [
                            { "text": "江苏省", "tooltip": null, "innerTooltip": null },
                            { "text": "7.2", "tooltip": "原始值：7.2146", "innerTooltip": null }
                        ],
                        "rowTooltip": "所在地市: 苏州市"
                    }
                ]))
            } else {
                Ok(json!(false))
            }
        });

        let page = no_scroll_page();
        let extractor = DomExtractor::new(&driver, &page, Duration::from_millis(10));
        let table = extractor.extract().await.unwrap();

        assert_eq!(table.headers, vec!["省份", "pH(无量纲)"]);
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.rows[0].cells, vec!["江苏省", "7.2146"]);
        assert_eq!(table.rows[0].extras.city.as_deref(), Some("苏州市"));
    }

    #[tokio::test]
    async fn missing_container_is_a_selector_validation_failure() {
        let mut driver = FakeDriver::default();
        driver.selector_fn = Box::new(|_| false);

        let page = no_scroll_page();
        let extractor = DomExtractor::new(&driver, &page, Duration::from_millis(10));
        let err = extractor.extract().await.unwrap_err();

        match err {
            HarvestError::SelectorValidation { message, suggestion } => {
                assert!(message.contains("body"));
                assert!(suggestion.contains("table_container"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn vanished_table_yields_no_rows() {
        let mut driver = FakeDriver::default();
        driver.selector_fn = Box::new(|_| true);
        driver.eval_fn = Box::new(|script| {
            if script.contains("rowTooltip") {
                Ok(Value::Null)
            } else {
                Ok(json!(false))
            }
        });

        let page = no_scroll_page();
        let extractor = DomExtractor::new(&driver, &page, Duration::from_millis(10));
        let table = extractor.extract().await.unwrap();
        assert!(table.rows.is_empty());
    }
}
