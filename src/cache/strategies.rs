//! Predictive preloading strategies.
//!
//! Each strategy is a [`CandidateProducer`]: given where the user is, who
//! they are and what time it is, it proposes assets worth loading early.
//! Strategies only propose. Everything they produce goes through the same
//! queue, dedup and version checks as an explicit preload.
//!
//! The viewport trigger is a separate path: it fires lazy loads when an
//! observed element comes within the root margin of the viewport.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::cache::asset::{AssetKind, AssetRequest, Priority};
use crate::clock::Clock;
use crate::config::PreloadConfig;

/// What the strategies know about the current moment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PredictionContext {
    pub current_page: Option<String>,
    pub role: Option<String>,
    /// Local hour of day, 0..24.
    pub hour: u8,
}

impl PredictionContext {
    /// Context for right now, with the hour derived from `clock`.
    pub fn at(clock: &dyn Clock, utc_offset_hours: i32) -> Self {
        Self {
            hour: hour_of_day(clock.now_ms(), utc_offset_hours),
            ..Self::default()
        }
    }

    pub fn on_page(mut self, page: impl Into<String>) -> Self {
        self.current_page = Some(page.into());
        self
    }

    pub fn as_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }
}

fn hour_of_day(now_ms: u64, utc_offset_hours: i32) -> u8 {
    let hours = (now_ms / 3_600_000) as i64 + i64::from(utc_offset_hours);
    hours.rem_euclid(24) as u8
}

/// A proposed asset load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub url: String,
    pub priority: Priority,
}

impl Candidate {
    fn new(url: &str, priority: Priority) -> Self {
        Self {
            url: url.to_string(),
            priority,
        }
    }

    pub fn into_request(self) -> AssetRequest {
        AssetRequest::new(self.url, self.priority)
    }
}

pub trait CandidateProducer: Send + Sync {
    fn name(&self) -> &'static str;

    fn candidates(&self, ctx: &PredictionContext) -> Vec<Candidate>;
}

/// Predicts the next page from previous → next transitions and proposes
/// the assets those pages need.
pub struct NavigationStrategy {
    transitions: RwLock<HashMap<String, HashMap<String, u32>>>,
    route_assets: HashMap<String, Vec<String>>,
    max_predictions: usize,
}

impl NavigationStrategy {
    pub fn new(route_assets: HashMap<String, Vec<String>>, max_predictions: usize) -> Self {
        Self {
            transitions: RwLock::new(HashMap::new()),
            route_assets,
            max_predictions,
        }
    }

    pub fn from_config(config: &PreloadConfig) -> Self {
        Self::new(config.route_assets.clone(), config.max_predictions)
    }

    pub fn record_navigation(&self, from: &str, to: &str) {
        *self
            .transitions
            .write()
            .entry(from.to_string())
            .or_default()
            .entry(to.to_string())
            .or_insert(0) += 1;
    }

    /// Most frequent next pages after `from`, most likely first.
    pub fn predict_next(&self, from: &str) -> Vec<String> {
        let transitions = self.transitions.read();
        let Some(next) = transitions.get(from) else {
            return Vec::new();
        };

        let mut ranked: Vec<(&String, &u32)> = next.iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        ranked
            .into_iter()
            .take(self.max_predictions)
            .map(|(page, _)| page.clone())
            .collect()
    }
}

impl CandidateProducer for NavigationStrategy {
    fn name(&self) -> &'static str {
        "navigation"
    }

    fn candidates(&self, ctx: &PredictionContext) -> Vec<Candidate> {
        let Some(page) = ctx.current_page.as_deref() else {
            return Vec::new();
        };
        self.predict_next(page)
            .iter()
            .filter_map(|next| self.route_assets.get(next))
            .flatten()
            .map(|url| Candidate::new(url, Priority::Preload))
            .collect()
    }
}

/// Proposes the assets a declared role usually needs.
pub struct RoleStrategy {
    role_assets: HashMap<String, Vec<String>>,
}

impl RoleStrategy {
    pub fn new(role_assets: HashMap<String, Vec<String>>) -> Self {
        Self { role_assets }
    }
}

impl CandidateProducer for RoleStrategy {
    fn name(&self) -> &'static str {
        "role"
    }

    fn candidates(&self, ctx: &PredictionContext) -> Vec<Candidate> {
        ctx.role
            .as_deref()
            .and_then(|role| self.role_assets.get(role))
            .map(|urls| urls.iter().map(|u| Candidate::new(u, Priority::Preload)).collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DayBand {
    /// 06:00 - 12:00
    Morning,
    /// 12:00 - 18:00
    Afternoon,
    /// 18:00 - 24:00
    Evening,
    /// 00:00 - 06:00
    Night,
}

impl DayBand {
    pub fn from_hour(hour: u8) -> Self {
        match hour % 24 {
            6..=11 => DayBand::Morning,
            12..=17 => DayBand::Afternoon,
            18..=23 => DayBand::Evening,
            _ => DayBand::Night,
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "morning" => Some(DayBand::Morning),
            "afternoon" => Some(DayBand::Afternoon),
            "evening" => Some(DayBand::Evening),
            "night" => Some(DayBand::Night),
            _ => None,
        }
    }
}

/// Proposes assets associated with the current band of the day. Lowest
/// confidence of the three, so candidates are queued as lazy.
pub struct TimeOfDayStrategy {
    bands: HashMap<DayBand, Vec<String>>,
}

impl TimeOfDayStrategy {
    pub fn new(bands: HashMap<DayBand, Vec<String>>) -> Self {
        Self { bands }
    }

    /// Band names that do not parse are ignored.
    pub fn from_config(config: &PreloadConfig) -> Self {
        let bands = config
            .time_bands
            .iter()
            .filter_map(|(name, urls)| DayBand::parse(name).map(|band| (band, urls.clone())))
            .collect();
        Self::new(bands)
    }
}

impl CandidateProducer for TimeOfDayStrategy {
    fn name(&self) -> &'static str {
        "time_of_day"
    }

    fn candidates(&self, ctx: &PredictionContext) -> Vec<Candidate> {
        self.bands
            .get(&DayBand::from_hour(ctx.hour))
            .map(|urls| urls.iter().map(|u| Candidate::new(u, Priority::Lazy)).collect())
            .unwrap_or_default()
    }
}

/// Fires lazy loads for observed assets once they come within `margin_px`
/// of the viewport. Each URL fires once, then stops being observed.
#[derive(Debug)]
pub struct ViewportTrigger {
    margin_px: f64,
    observed: HashMap<String, AssetKind>,
}

impl ViewportTrigger {
    pub fn new(margin_px: f64) -> Self {
        Self {
            margin_px,
            observed: HashMap::new(),
        }
    }

    pub fn observe(&mut self, url: impl Into<String>, kind: AssetKind) {
        self.observed.insert(url.into(), kind);
    }

    pub fn unobserve(&mut self, url: &str) -> bool {
        self.observed.remove(url).is_some()
    }

    pub fn observed_count(&self) -> usize {
        self.observed.len()
    }

    /// Feed element distances from the viewport (px, 0 or less = visible).
    pub fn update(&mut self, distances: &[(String, f64)]) -> Vec<AssetRequest> {
        distances
            .iter()
            .filter(|(_, distance)| *distance <= self.margin_px)
            .filter_map(|(url, _)| {
                self.observed
                    .remove(url)
                    .map(|kind| AssetRequest::new(url.clone(), Priority::Lazy).with_kind(kind))
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.observed.clear();
    }
}
