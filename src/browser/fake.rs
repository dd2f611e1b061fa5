//! Scripted in-memory [`PageDriver`] used by extractor and pipeline tests.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Mutex;
use std::time::Duration;

use super::PageDriver;

type EvalFn = Box<dyn Fn(&str) -> Result<Value> + Send + Sync>;
type BoolFn = Box<dyn Fn(&str) -> bool + Send + Sync>;
type TextsFn = Box<dyn Fn(&str) -> Vec<String> + Send + Sync>;
type HtmlFn = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

pub struct FakeDriver {
    pub eval_fn: EvalFn,
    pub wait_fn: BoolFn,
    pub selector_fn: BoolFn,
    pub texts_fn: TextsFn,
    pub html_fn: HtmlFn,
    pub click_fn: BoolFn,
    pub content: String,
    pub fail_navigate: bool,
    pub fail_frame: bool,
    pub navigations: Mutex<Vec<String>>,
    pub frames: Mutex<Vec<String>>,
}

impl Default for FakeDriver {
    fn default() -> Self {
        Self {
            eval_fn: Box::new(|_| Ok(Value::Null)),
            wait_fn: Box::new(|_| false),
            selector_fn: Box::new(|_| true),
            texts_fn: Box::new(|_| Vec::new()),
            html_fn: Box::new(|_| None),
            click_fn: Box::new(|_| false),
            content: "<html></html>".to_string(),
            fail_navigate: false,
            fail_frame: false,
            navigations: Mutex::new(Vec::new()),
            frames: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl PageDriver for FakeDriver {
    async fn navigate(&mut self, url: &str) -> Result<()> {
        if self.fail_navigate {
            return Err(anyhow!("navigation refused: {url}"));
        }
        self.navigations.lock().unwrap().push(url.to_string());
        Ok(())
    }

    async fn enter_frame(&mut self, selector: &str) -> Result<()> {
        if self.fail_frame {
            return Err(anyhow!("iframe selector not found: {selector}"));
        }
        self.frames.lock().unwrap().push(selector.to_string());
        Ok(())
    }

    async fn wait_for_selector(&self, selector: &str, _timeout: Duration) -> Result<bool> {
        Ok((self.selector_fn)(selector))
    }

    async fn wait_for_function(&self, script: &str, _timeout: Duration) -> Result<bool> {
        Ok((self.wait_fn)(script))
    }

    async fn evaluate(&self, script: &str) -> Result<Value> {
        (self.eval_fn)(script)
    }

    async fn inner_texts(&self, selector: &str) -> Result<Vec<String>> {
        Ok((self.texts_fn)(selector))
    }

    async fn outer_html(&self, selector: &str) -> Result<Option<String>> {
        Ok((self.html_fn)(selector))
    }

    async fn click(&self, selector: &str) -> Result<bool> {
        Ok((self.click_fn)(selector))
    }

    async fn content(&self) -> Result<String> {
        Ok(self.content.clone())
    }
}
