use thiserror::Error;

/// Failures the orchestrator retries and, eventually, reports to the caller.
///
/// Everything that stops a page from being harvested collapses into
/// `SelectorValidation` so the retry loop has a single failure shape to act on.
/// The `suggestion` names the config field to re-check in DevTools.
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("{message}")]
    SelectorValidation { message: String, suggestion: String },

    #[error("automation layer fault: {0}")]
    Automation(String),
}

impl HarvestError {
    pub fn selector(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::SelectorValidation {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Uniform handling: automation faults are retried exactly like stale
    /// selectors, with a generic remediation hint.
    pub fn into_selector_validation(self) -> Self {
        match self {
            Self::Automation(detail) => Self::SelectorValidation {
                message: format!("页面交互过程中出现浏览器自动化错误: {detail}"),
                suggestion: "请确认页面结构是否发生变化，必要时调整选择器或增加超时时间。".to_string(),
            },
            other => other,
        }
    }

    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::SelectorValidation { suggestion, .. } => Some(suggestion),
            Self::Automation(_) => None,
        }
    }
}
