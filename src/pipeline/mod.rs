//! Pipeline orchestrator: ties browser → extraction → storage together.
//!
//! One run walks every configured page. Per page, a fresh browser session is
//! opened and the publish-API replay is tried first; only when it yields
//! nothing does the DOM fallback drive the live grid. The store transaction
//! spans the whole run: a failed attempt rolls the open batch back before the
//! bounded retry loop re-enters, and the commit happens once after every page
//! succeeded. Re-running the pipeline on the same data inserts 0 new readings.

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::browser::PageDriver;
use crate::browser::chrome::ChromeDriver;
use crate::config::{AppConfig, PageConfig};
use crate::error::HarvestError;
use crate::models::HarvestStats;
use crate::scraper::api::ApiReplayExtractor;
use crate::scraper::cleaner::{normalize_headers, parse_row};
use crate::scraper::dom::DomExtractor;
use crate::storage::Repository;

pub struct Pipeline {
    config: AppConfig,
}

/// Counters from one successful attempt. Folded into [`HarvestStats`] only
/// after the attempt succeeds, so a rolled-back attempt leaves no residue.
#[derive(Debug, Default)]
struct AttemptOutcome {
    rows_seen: usize,
    rows_inserted: usize,
    snapshot: Option<PathBuf>,
}

impl Pipeline {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    pub async fn run(&self) -> Result<HarvestStats> {
        self.run_with(|| ChromeDriver::launch(&self.config.browser))
            .await
    }

    /// Full harvest against any driver factory. A new driver is opened per
    /// attempt so a wedged session never poisons the retry.
    pub async fn run_with<D, F, Fut>(&self, open_driver: F) -> Result<HarvestStats>
    where
        D: PageDriver,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<D>>,
    {
        let repo =
            Repository::open(&self.config.storage.db_path).context("Failed to open DuckDB")?;
        if self.config.storage.run_migrations {
            repo.run_migrations()?;
        }

        let tz: Tz = self
            .config
            .harvest
            .timezone
            .parse()
            .map_err(|e| anyhow!("invalid timezone {:?}: {e}", self.config.harvest.timezone))?;
        let batch_time = Utc::now().with_timezone(&tz);

        let run_id = repo.begin_harvest_run().unwrap_or(0);
        let mut stats = HarvestStats {
            database_path: self.config.storage.db_path.display().to_string(),
            ..HarvestStats::default()
        };

        repo.begin_run()?;
        for page in &self.config.pages {
            if let Err(err) = self
                .harvest_page(&open_driver, &repo, page, tz, batch_time, &mut stats)
                .await
            {
                repo.finish_harvest_run(
                    run_id,
                    stats.pages_processed,
                    stats.rows_seen,
                    stats.rows_inserted,
                    Some(&err.to_string()),
                )
                .ok();
                return Err(err.into());
            }
        }

        repo.commit_run()?;
        repo.finish_harvest_run(
            run_id,
            stats.pages_processed,
            stats.rows_seen,
            stats.rows_inserted,
            None,
        )
        .ok();

        info!(
            "=== Done: {} pages | {} rows seen | {} new readings ===",
            stats.pages_processed, stats.rows_seen, stats.rows_inserted
        );
        Ok(stats)
    }

    /// Process one page under the bounded retry loop. Every failure shape is
    /// collapsed into a selector-validation error whose suggestion names the
    /// config field to re-check.
    async fn harvest_page<D, F, Fut>(
        &self,
        open_driver: &F,
        repo: &Repository,
        page: &PageConfig,
        tz: Tz,
        batch_time: DateTime<Tz>,
        stats: &mut HarvestStats,
    ) -> Result<(), HarvestError>
    where
        D: PageDriver,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<D>>,
    {
        let max_attempts = self.config.harvest.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            info!(
                "Processing page {} (attempt {}/{})",
                page.url, attempt, max_attempts
            );

            let mut driver = match open_driver().await {
                Ok(driver) => driver,
                Err(e) => {
                    let err = HarvestError::Automation(e.to_string()).into_selector_validation();
                    if attempt >= max_attempts {
                        return Err(err);
                    }
                    warn!("Attempt {}/{} failed: {}，retrying...", attempt, max_attempts, err);
                    sleep(Duration::from_millis(self.config.harvest.retry_backoff_ms)).await;
                    continue;
                }
            };

            let result = self
                .attempt_page(&mut driver, repo, page, tz, batch_time, stats.pages_processed)
                .await;
            let _ = driver.close().await;

            match result {
                Ok(outcome) => {
                    stats.pages_processed += 1;
                    stats.rows_seen += outcome.rows_seen;
                    stats.rows_inserted += outcome.rows_inserted;
                    stats.snapshots.extend(outcome.snapshot);
                    return Ok(());
                }
                Err(err) => {
                    let err = err.into_selector_validation();
                    repo.rollback_run().ok();
                    if attempt >= max_attempts {
                        return Err(err);
                    }
                    warn!("Attempt {}/{} failed: {}，retrying...", attempt, max_attempts, err);
                    sleep(Duration::from_millis(self.config.harvest.retry_backoff_ms)).await;
                    repo.begin_run()
                        .map_err(|e| HarvestError::Automation(format!("storage failure: {e}")))?;
                }
            }
        }

        Ok(())
    }

    /// One attempt: navigate, extract, validate, persist, snapshot.
    async fn attempt_page<D: PageDriver>(
        &self,
        driver: &mut D,
        repo: &Repository,
        page: &PageConfig,
        tz: Tz,
        batch_time: DateTime<Tz>,
        page_index: usize,
    ) -> Result<AttemptOutcome, HarvestError> {
        let mut outcome = AttemptOutcome::default();
        driver
            .navigate(&page.url)
            .await
            .map_err(|e| HarvestError::Automation(e.to_string()))?;

        for selector in &page.iframe_chain {
            driver.enter_frame(selector).await.map_err(|e| {
                HarvestError::selector(
                    format!("无法根据 iframe 选择器进入目标页面: {e}"),
                    "请检查 iframe_chain 是否完整，并确保每个选择器都能唯一定位到 iframe 元素。",
                )
            })?;
        }

        let api = ApiReplayExtractor::new(&*driver, &self.config.harvest.api);
        let mut table = api
            .extract()
            .await
            .map_err(|e| HarvestError::Automation(e.to_string()))?;

        if table.is_empty() {
            warn!("Publish API extraction returned no rows, falling back to DOM selectors.");
            let dom = DomExtractor::new(
                &*driver,
                page,
                Duration::from_millis(self.config.browser.timeout_ms),
            );
            table = dom.extract().await?;
        } else {
            info!("Using publish API extraction, rows={}", table.rows.len());
        }

        // Snapshot before validation so failed layouts are auditable too. The
        // file stays on disk either way; only a successful attempt reports it.
        match driver.content().await {
            Ok(html) => {
                if let Ok(path) = save_snapshot(
                    &self.config.storage.snapshot_dir,
                    &page.url,
                    &html,
                    batch_time,
                    page_index,
                ) {
                    outcome.snapshot = Some(path);
                }
            }
            Err(e) => warn!("Snapshot capture failed: {e}"),
        }

        let headers = normalize_headers(&table.headers);
        if headers.is_empty() {
            return Err(HarvestError::selector(
                "未能解析到任何表头文本。",
                "请确认 header_cells 选择器能够匹配到 <th> 元素，或更新 column_overrides。",
            ));
        }
        if table.rows.is_empty() {
            return Err(HarvestError::selector(
                "表格数据行未匹配到。",
                "请检查 data_rows / cell_selector 设置，确保它们指向实际的数据行与单元格。",
            ));
        }

        for row in &table.rows {
            let parsed = parse_row(&headers, &row.cells, tz, &row.extras);
            outcome.rows_seen += 1;
            let upserted = repo
                .upsert_row(&parsed.station, &parsed.reading, batch_time)
                .map_err(|e| HarvestError::Automation(format!("storage failure: {e}")))?;
            if upserted.created {
                outcome.rows_inserted += 1;
            }
        }

        Ok(outcome)
    }
}

/// Persist the frame HTML under the snapshot directory for auditing.
fn save_snapshot(
    dir: &Path,
    url: &str,
    html: &str,
    batch_time: DateTime<Tz>,
    page_index: usize,
) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("Could not create dir {:?}", dir))?;

    let timestamp = batch_time.format("%Y%m%dT%H%M%S");
    let url_fragment = match url::Url::parse(url) {
        Ok(parsed) => format!("{}{}", parsed.host_str().unwrap_or_default(), parsed.path()),
        Err(_) => url.to_string(),
    }
    .replace(['/', '?', '='], "_");
    let path = dir.join(format!("{timestamp}_{page_index:02}_{url_fragment}.html"));
    std::fs::write(&path, html).with_context(|| format!("Could not write snapshot {:?}", path))?;
    Ok(path)
}
