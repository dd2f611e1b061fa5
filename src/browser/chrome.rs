//! Browser automation using chromiumoxide.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig as ChromeConfig};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde_json::Value;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use super::PageDriver;
use crate::config::BrowserConfig;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Chromium paths probed before falling back to chromiumoxide's own detection,
/// covering bare Linux servers without a desktop Chrome install.
const SYSTEM_CHROMIUM_PATHS: &[&str] = &[
    "/usr/bin/chromium",
    "/usr/bin/chromium-browser",
    "/usr/bin/google-chrome",
    "/usr/bin/google-chrome-stable",
];

pub struct ChromeDriver {
    browser: Browser,
    handle: tokio::task::JoinHandle<()>,
    page: Page,
    frame_chain: Vec<String>,
    nav_timeout: Duration,
}

impl ChromeDriver {
    /// Launch a headless browser instance with one blank page.
    pub async fn launch(config: &BrowserConfig) -> Result<Self> {
        let mut builder = ChromeConfig::builder()
            .no_sandbox()
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-software-rasterizer")
            .arg("--disable-blink-features=AutomationControlled")
            .arg(format!("--user-agent={}", config.user_agent))
            .window_size(1920, 1080);

        if !config.headless {
            builder = builder.with_head();
        }
        if let Some(path) = SYSTEM_CHROMIUM_PATHS
            .iter()
            .find(|p| std::path::Path::new(p).exists())
        {
            builder = builder.chrome_executable(*path);
        }

        let chrome_config = builder
            .build()
            .map_err(|e| anyhow!("Failed to build browser config: {}", e))?;

        let (browser, mut handler) = Browser::launch(chrome_config)
            .await
            .context("Failed to launch browser")?;

        // Handler task must keep running for the browser connection to work.
        let handle = tokio::spawn(async move {
            loop {
                match handler.next().await {
                    Some(Ok(_)) => continue,
                    Some(Err(_)) => continue,
                    None => break,
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .context("Failed to open page")?;

        Ok(Self {
            browser,
            handle,
            page,
            frame_chain: Vec::new(),
            nav_timeout: Duration::from_millis(config.timeout_ms),
        })
    }

    /// Wrap a `(win, doc) => …` script so it runs against the window/document
    /// reached through the current iframe chain. Cross-frame access works here
    /// because the portal serves its data frame same-origin.
    fn frame_script(&self, script: &str) -> String {
        let chain = serde_json::to_string(&self.frame_chain).unwrap_or_else(|_| "[]".to_string());
        format!(
            r#"(async () => {{
                let win = window;
                let doc = document;
                for (const sel of {chain}) {{
                    const el = doc.querySelector(sel);
                    if (!el || !el.contentWindow || !el.contentDocument) {{
                        throw new Error("iframe not reachable: " + sel);
                    }}
                    win = el.contentWindow;
                    doc = el.contentDocument;
                }}
                const __fn = {script};
                return await __fn(win, doc);
            }})()"#
        )
    }

    async fn eval_raw(&self, expression: String) -> Result<Value> {
        let params = EvaluateParams::builder()
            .expression(expression)
            .await_promise(true)
            .return_by_value(true)
            .build()
            .map_err(|e| anyhow!("evaluate params: {}", e))?;

        let result = self
            .page
            .evaluate(params)
            .await
            .context("script evaluation failed")?;

        Ok(result.into_value::<Value>().unwrap_or(Value::Null))
    }
}

#[async_trait]
impl PageDriver for ChromeDriver {
    async fn navigate(&mut self, url: &str) -> Result<()> {
        self.frame_chain.clear();
        debug!("Navigating to {}", url);

        tokio::time::timeout(self.nav_timeout, async {
            self.page.goto(url).await?;
            self.page.wait_for_navigation().await?;
            Ok::<(), anyhow::Error>(())
        })
        .await
        .map_err(|_| anyhow!("navigation timed out: {}", url))??;

        Ok(())
    }

    async fn enter_frame(&mut self, selector: &str) -> Result<()> {
        self.frame_chain.push(selector.to_string());
        // Resolving the chain throws when the new selector is unreachable.
        match self.eval_raw(self.frame_script("(win, doc) => true")).await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.frame_chain.pop();
                Err(e).with_context(|| format!("iframe selector not found: {selector}"))
            }
        }
    }

    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<bool> {
        let sel = serde_json::to_string(selector)?;
        let script = format!("(win, doc) => !!doc.querySelector({sel})");
        self.wait_for_function(&script, timeout).await
    }

    async fn wait_for_function(&self, script: &str, timeout: Duration) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let found = self
                .eval_raw(self.frame_script(script))
                .await
                .map(|v| v.as_bool().unwrap_or(false))
                .unwrap_or(false);
            if found {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn evaluate(&self, script: &str) -> Result<Value> {
        self.eval_raw(self.frame_script(script)).await
    }

    async fn inner_texts(&self, selector: &str) -> Result<Vec<String>> {
        let sel = serde_json::to_string(selector)?;
        let script = format!(
            r#"(win, doc) => Array.from(doc.querySelectorAll({sel}))
                .map(el => (el.innerText || el.textContent || "").trim())"#
        );
        let value = self.eval_raw(self.frame_script(&script)).await?;
        Ok(serde_json::from_value(value).unwrap_or_default())
    }

    async fn outer_html(&self, selector: &str) -> Result<Option<String>> {
        let sel = serde_json::to_string(selector)?;
        let script = format!(
            r#"(win, doc) => {{
                const el = doc.querySelector({sel});
                return el ? el.outerHTML : null;
            }}"#
        );
        let value = self.eval_raw(self.frame_script(&script)).await?;
        Ok(value.as_str().map(|s| s.to_string()))
    }

    async fn click(&self, selector: &str) -> Result<bool> {
        let sel = serde_json::to_string(selector)?;
        let script = format!(
            r#"(win, doc) => {{
                const el = doc.querySelector({sel});
                if (!el) return false;
                el.click();
                return true;
            }}"#
        );
        let value = self.eval_raw(self.frame_script(&script)).await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn content(&self) -> Result<String> {
        let script = r#"(win, doc) => doc.documentElement ? doc.documentElement.outerHTML : """#;
        let value = self.eval_raw(self.frame_script(script)).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn close(&mut self) -> Result<()> {
        let _ = self.browser.close().await;
        self.handle.abort();
        Ok(())
    }
}
