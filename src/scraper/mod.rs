//! Extraction layer.
//!
//! Two strategies produce the same [`TableData`](crate::models::TableData)
//! shape: [`api::ApiReplayExtractor`] replays the page's own publish endpoint
//! from inside the frame (complete, fast, first choice), and
//! [`dom::DomExtractor`] reads the rendered grid (partial but resilient,
//! fallback). [`cleaner`] then normalizes either output into typed rows.

pub mod api;
pub mod cleaner;
pub mod dom;
pub mod hierarchy;
