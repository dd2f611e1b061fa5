//! Region hierarchy parsing.
//!
//! The portal's area dropdown encodes the province/city tree in
//! `filterArea('id','label',level)` onclick attributes. Parsing is kept as a
//! pure function over captured markup so it stays unit-testable without a live
//! browser.

use regex::Regex;
use scraper::{Html, Selector};
use std::sync::LazyLock;

use crate::models::{AreaNode, Scope};

/// Provinces that are themselves city-level; they have no city sub-options and
/// their own label doubles as the city.
pub const MUNICIPALITY_PROVINCES: &[&str] = &["北京市", "天津市", "上海市", "重庆市"];

static FILTER_AREA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"filterArea\('([^']*)','([^']*)',(\d+)\)").unwrap());

pub fn is_municipality(label: &str) -> bool {
    MUNICIPALITY_PROVINCES.contains(&label)
}

/// Parse area nodes out of the dropdown markup. Level 1 entries are provinces,
/// level 2 entries are cities carrying their parent province id in `data-id`.
/// Malformed anchors are skipped; duplicates keep the first occurrence.
pub fn parse_area_markup(html: &str) -> Vec<AreaNode> {
    let Ok(anchor_sel) = Selector::parse("a") else {
        return Vec::new();
    };

    let fragment = Html::parse_fragment(html);
    let mut nodes: Vec<AreaNode> = Vec::new();

    for anchor in fragment.select(&anchor_sel) {
        let Some(onclick) = anchor.value().attr("onclick") else {
            continue;
        };
        let Some(caps) = FILTER_AREA_RE.captures(onclick) else {
            continue;
        };

        let id = caps[1].trim().to_string();
        let label = caps[2].trim().to_string();
        let level: u8 = caps[3].parse().unwrap_or(0);
        let parent_id = anchor
            .value()
            .attr("data-id")
            .unwrap_or_default()
            .trim()
            .to_string();

        if id.is_empty() || label.is_empty() {
            continue;
        }
        let duplicate = nodes
            .iter()
            .any(|n| n.id == id && n.level == level && n.parent_id == parent_id);
        if duplicate {
            continue;
        }

        nodes.push(AreaNode {
            id,
            label,
            level,
            parent_id,
        });
    }

    nodes
}

/// Turn area nodes into query scopes.
///
/// Provinces with child cities are traversed city by city, each scope tagged
/// with the city label so downstream normalization can attribute rows the API
/// returns without a city column. Childless provinces are queried directly,
/// tagged with their own label only for the municipality set.
pub fn build_scopes(nodes: &[AreaNode]) -> Vec<Scope> {
    let mut scopes = Vec::new();

    for province in nodes.iter().filter(|n| n.level == 1) {
        let cities: Vec<&AreaNode> = nodes
            .iter()
            .filter(|n| n.level == 2 && n.parent_id == province.id)
            .collect();

        if cities.is_empty() {
            let city = if is_municipality(&province.label) {
                Some(province.label.clone())
            } else {
                None
            };
            scopes.push(Scope {
                area_id: province.id.clone(),
                river_id: String::new(),
                label: format!("area:{}", province.id),
                city,
            });
        } else {
            for city in cities {
                scopes.push(Scope {
                    area_id: city.id.clone(),
                    river_id: String::new(),
                    label: format!("city:{}", city.label),
                    city: Some(city.label.clone()),
                });
            }
        }
    }

    scopes
}

/// Scope for one river/basin id, used by the safety-net pass.
pub fn river_scope(river_id: &str) -> Scope {
    Scope {
        area_id: String::new(),
        river_id: river_id.to_string(),
        label: format!("river:{river_id}"),
        city: None,
    }
}
