//! Automation-provider boundary.
//!
//! Everything above this module drives the page through [`PageDriver`], so the
//! extractors and the orchestrator can be exercised against a scripted fake.
//! Scripts passed to `evaluate`/`wait_for_function` are JS arrow functions of
//! the shape `(win, doc) => …`, bound to the window and document of the frame
//! the driver currently points at.

pub mod chrome;
#[cfg(test)]
pub mod fake;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

#[async_trait]
pub trait PageDriver: Send + Sync {
    /// Load a URL in the top-level document, resetting any frame drilling.
    async fn navigate(&mut self, url: &str) -> Result<()>;

    /// Drill into a nested iframe; subsequent calls operate inside it.
    /// Fails when the selector does not resolve to a reachable frame.
    async fn enter_frame(&mut self, selector: &str) -> Result<()>;

    /// Poll for an element; a timeout degrades to `Ok(false)`, never an error.
    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<bool>;

    /// Poll a boolean `(win, doc) => …` script until it returns true or the
    /// deadline passes; a timeout degrades to `Ok(false)`.
    async fn wait_for_function(&self, script: &str, timeout: Duration) -> Result<bool>;

    /// Evaluate a `(win, doc) => …` script in the current frame. Promises are
    /// awaited; the settled value comes back as JSON.
    async fn evaluate(&self, script: &str) -> Result<Value>;

    /// Trimmed inner text of every element matching the selector.
    async fn inner_texts(&self, selector: &str) -> Result<Vec<String>>;

    /// Outer HTML of the first matching element, if any.
    async fn outer_html(&self, selector: &str) -> Result<Option<String>>;

    /// Click the first matching element; `Ok(false)` when nothing matched.
    async fn click(&self, selector: &str) -> Result<bool>;

    /// Serialized HTML of the current frame, used for audit snapshots.
    async fn content(&self) -> Result<String>;

    /// Release the underlying automation session. Best-effort; drivers
    /// without external resources keep the default no-op.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
