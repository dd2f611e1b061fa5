use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Top-level application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub harvest: HarvestConfig,
    /// Pages to harvest, processed in order. The default is the national
    /// realtime publishing page; append further configs to extend coverage.
    #[serde(default = "default_pages")]
    pub pages: Vec<PageConfig>,
}

/// Browser automation configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrowserConfig {
    #[serde(default = "default_true")]
    pub headless: bool,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: PathBuf,

    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Harvest run configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HarvestConfig {
    #[serde(default = "default_timezone")]
    pub timezone: String,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default)]
    pub api: ApiReplayConfig,
}

/// Tuning for the publish-API replay extractor
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiReplayConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Hard ceiling on page iterations per scope, whatever `total` claims.
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,

    /// Below this row count the area pass is considered implausible and the
    /// river/basin safety-net pass runs.
    #[serde(default = "default_min_expected_rows")]
    pub min_expected_rows: usize,

    #[serde(default = "default_metadata_wait_ms")]
    pub metadata_wait_ms: u64,

    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,

    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

// ── Page selectors ────────────────────────────────────────────────────────────

/// How one page is reached and where its table lives. All selectors are
/// configuration, not code: the source site changes layout without notice.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PageConfig {
    pub url: String,

    /// Selectors for nested iframes, outermost first. Empty when the table is
    /// in the top-level document.
    #[serde(default)]
    pub iframe_chain: Vec<String>,

    #[serde(default)]
    pub table: TableSelectors,

    #[serde(default)]
    pub scroll: ScrollSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TableSelectors {
    /// Wraps both headers and rows; its absence means the layout changed.
    #[serde(default = "default_table_container")]
    pub table_container: String,

    #[serde(default = "default_header_cells")]
    pub header_cells: String,

    #[serde(default = "default_data_rows")]
    pub data_rows: String,

    /// Cell selector inside a row when all columns share the same structure.
    #[serde(default = "default_cell_selector")]
    pub cell_selector: Option<String>,

    /// Per-header selector overrides for cells needing special handling.
    #[serde(default)]
    pub column_overrides: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollMode {
    None,
    InfiniteScroll,
    LoadMore,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScrollSettings {
    #[serde(default = "default_scroll_mode")]
    pub mode: ScrollMode,

    /// Scrollable element for infinite scroll; falls back to the body.
    #[serde(default)]
    pub container: Option<String>,

    /// Required when mode = load_more.
    #[serde(default)]
    pub load_more_button: Option<String>,

    #[serde(default = "default_scroll_iterations")]
    pub max_iterations: u32,

    #[serde(default = "default_scroll_wait_ms")]
    pub wait_for_ms: u64,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

fn default_true() -> bool {
    true
}
fn default_timeout_ms() -> u64 {
    15_000
}
fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
        .to_string()
}
fn default_db_path() -> PathBuf {
    PathBuf::from("data/water_quality.duckdb")
}
fn default_snapshot_dir() -> PathBuf {
    PathBuf::from("data/snapshots")
}
fn default_timezone() -> String {
    "Asia/Shanghai".to_string()
}
fn default_max_attempts() -> u32 {
    5
}
fn default_retry_backoff_ms() -> u64 {
    1_000
}
fn default_endpoint() -> String {
    "/GJZ/Ajax/Publish.ashx".to_string()
}
fn default_page_size() -> u32 {
    9_999
}
fn default_max_pages() -> u32 {
    200
}
fn default_min_expected_rows() -> usize {
    1_000
}
fn default_metadata_wait_ms() -> u64 {
    8_000
}
fn default_request_delay_ms() -> u64 {
    300
}
fn default_jitter_ms() -> u64 {
    200
}
fn default_table_container() -> String {
    "body".to_string()
}
fn default_header_cells() -> String {
    "table thead tr th".to_string()
}
fn default_data_rows() -> String {
    "table tbody tr".to_string()
}
fn default_cell_selector() -> Option<String> {
    Some("td".to_string())
}
fn default_scroll_mode() -> ScrollMode {
    ScrollMode::None
}
fn default_scroll_iterations() -> u32 {
    10
}
fn default_scroll_wait_ms() -> u64 {
    800
}

/// Selectors tuned for the national realtime water quality page. The data grid
/// sits inside the iframe `#MF`; headers render in the fixed table `#gridHd`
/// while rows stream inside `#gridDatas`, paginated by scrolling
/// `#div_gridBodys`.
fn default_pages() -> Vec<PageConfig> {
    vec![PageConfig {
        url: "https://szzdjc.cnemc.cn:8070/GJZ/Business/Publish/Main.html".to_string(),
        iframe_chain: vec!["#MF".to_string()],
        table: TableSelectors {
            table_container: "body".to_string(),
            header_cells: "#gridHd tr td".to_string(),
            data_rows: "#gridDatas li tr".to_string(),
            cell_selector: Some("td".to_string()),
            column_overrides: HashMap::new(),
        },
        scroll: ScrollSettings {
            mode: ScrollMode::InfiniteScroll,
            container: Some("#div_gridBodys".to_string()),
            load_more_button: None,
            max_iterations: 120,
            wait_for_ms: 1_200,
        },
    }]
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            timeout_ms: default_timeout_ms(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            snapshot_dir: default_snapshot_dir(),
            run_migrations: true,
        }
    }
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            api: ApiReplayConfig::default(),
        }
    }
}

impl Default for ApiReplayConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            page_size: default_page_size(),
            max_pages: default_max_pages(),
            min_expected_rows: default_min_expected_rows(),
            metadata_wait_ms: default_metadata_wait_ms(),
            request_delay_ms: default_request_delay_ms(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

impl Default for TableSelectors {
    fn default() -> Self {
        Self {
            table_container: default_table_container(),
            header_cells: default_header_cells(),
            data_rows: default_data_rows(),
            cell_selector: default_cell_selector(),
            column_overrides: HashMap::new(),
        }
    }
}

impl Default for ScrollSettings {
    fn default() -> Self {
        Self {
            mode: ScrollMode::None,
            container: None,
            load_more_button: None,
            max_iterations: default_scroll_iterations(),
            wait_for_ms: default_scroll_wait_ms(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            browser: BrowserConfig::default(),
            storage: StorageConfig::default(),
            harvest: HarvestConfig::default(),
            pages: default_pages(),
        }
    }
}

// ── Loader ───────────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from file + environment overrides
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let cfg = config::Config::builder()
            .add_source(
                config::File::with_name("config/default")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::File::with_name("config/local")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(config::Environment::with_prefix("WATERQ").separator("__"))
            .build()?;

        let app_cfg: AppConfig = cfg.try_deserialize().unwrap_or_else(|_| AppConfig::default());
        Ok(app_cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_page_targets_data_iframe() {
        let pages = default_pages();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].iframe_chain, vec!["#MF"]);
        assert_eq!(pages[0].scroll.mode, ScrollMode::InfiniteScroll);
        assert_eq!(pages[0].table.header_cells, "#gridHd tr td");
    }

    #[test]
    fn api_replay_defaults_are_bounded() {
        let api = ApiReplayConfig::default();
        assert_eq!(api.max_pages, 200);
        assert_eq!(api.page_size, 9_999);
        assert_eq!(api.min_expected_rows, 1_000);
    }
}
