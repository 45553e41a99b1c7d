//! Online landing-probability and competition model.
//!
//! A logistic score over a fixed feature set, updated after every terminal
//! bundle outcome with an exponentially weighted gradient step. Memory is
//! bounded: per-feature coefficients plus one decayed rate per venue.

use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

/// Learning rate for the online update.
const LEARN_RATE: f64 = 0.05;

/// Decay applied to per-venue landing rates on each observation.
const VENUE_EW_ALPHA: f64 = 0.2;

/// Decay applied to per-venue activity on each tick.
const ACTIVITY_DECAY: f64 = 0.9;

/// Feature vector for one candidate bundle.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct BundleFeatures {
    pub bundle_size: usize,
    /// tip / gross profit, 0..1
    pub tip_profit_ratio: f64,
    /// recent landing rate of the venues involved, 0..1
    pub venue_landing_rate: f64,
    /// fraction of the slot elapsed at submission, 0..1
    pub time_of_slot: f64,
    /// advertised inclusion rate of the targeted builder, 0..1
    pub builder_inclusion_rate: f64,
}

struct ModelState {
    bias: f64,
    w_size: f64,
    w_tip: f64,
    w_venue: f64,
    w_slot: f64,
    w_builder: f64,
    /// EW landing rate per venue id.
    venue_rates: HashMap<String, f64>,
    /// EW opportunity arrival intensity per venue id (competition proxy).
    venue_activity: HashMap<String, f64>,
    observations: u64,
}

pub struct SuccessModel {
    state: Mutex<ModelState>,
}

fn logistic(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

impl SuccessModel {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ModelState {
                bias: -0.5,
                w_size: -0.3,
                w_tip: 2.0,
                w_venue: 1.5,
                w_slot: -0.2,
                w_builder: 1.0,
                venue_rates: HashMap::new(),
                venue_activity: HashMap::new(),
                observations: 0,
            }),
        }
    }

    fn raw_score(state: &ModelState, f: &BundleFeatures) -> f64 {
        state.bias
            + state.w_size * (f.bundle_size as f64 / 5.0)
            + state.w_tip * f.tip_profit_ratio
            + state.w_venue * f.venue_landing_rate
            + state.w_slot * f.time_of_slot
            + state.w_builder * f.builder_inclusion_rate
    }

    /// P(landing) for the candidate. Monotone in the tip ratio: the tip
    /// coefficient is clamped non-negative on every update.
    pub fn p_land(&self, features: &BundleFeatures) -> f64 {
        let state = self.state.lock();
        logistic(Self::raw_score(&state, features))
    }

    /// Recent landing rate of a venue, defaulting to the prior when unseen.
    pub fn venue_landing_rate(&self, venue_id: &str) -> f64 {
        self.state
            .lock()
            .venue_rates
            .get(venue_id)
            .copied()
            .unwrap_or(0.5)
    }

    /// Competition intensity 0..1 across the venues an opportunity spans.
    pub fn competition(&self, venue_ids: &[String]) -> f64 {
        if venue_ids.is_empty() {
            return 0.5;
        }
        let state = self.state.lock();
        let total: f64 = venue_ids
            .iter()
            .map(|v| state.venue_activity.get(v).copied().unwrap_or(0.0))
            .sum();
        let mean = total / venue_ids.len() as f64;
        // Arrival intensity saturates toward 1.
        1.0 - (-mean / 4.0).exp()
    }

    /// Note an emitted opportunity so contested venues read as competitive.
    pub fn record_opportunity(&self, venue_ids: &[String]) {
        let mut state = self.state.lock();
        for venue in venue_ids {
            let entry = state.venue_activity.entry(venue.clone()).or_insert(0.0);
            *entry = *entry * ACTIVITY_DECAY + 1.0;
        }
    }

    /// Online update from a terminal bundle outcome.
    pub fn record(
        &self,
        features: &BundleFeatures,
        venue_ids: &[String],
        landed: bool,
        latency_ns: Option<u64>,
    ) {
        let mut state = self.state.lock();
        let predicted = logistic(Self::raw_score(&state, features));
        let target = if landed { 1.0 } else { 0.0 };
        let err = target - predicted;

        state.bias += LEARN_RATE * err;
        state.w_size += LEARN_RATE * err * (features.bundle_size as f64 / 5.0);
        state.w_tip += LEARN_RATE * err * features.tip_profit_ratio;
        state.w_venue += LEARN_RATE * err * features.venue_landing_rate;
        state.w_slot += LEARN_RATE * err * features.time_of_slot;
        state.w_builder += LEARN_RATE * err * features.builder_inclusion_rate;
        // Predictions must stay monotone in tip.
        state.w_tip = state.w_tip.max(0.0);

        for venue in venue_ids {
            let entry = state.venue_rates.entry(venue.clone()).or_insert(0.5);
            *entry = *entry * (1.0 - VENUE_EW_ALPHA) + VENUE_EW_ALPHA * target;
        }
        state.observations += 1;

        debug!(
            "Model update: landed={} predicted={:.3} err={:+.3} latency={:?}",
            landed, predicted, err, latency_ns
        );
    }
}

impl Default for SuccessModel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(tip_ratio: f64) -> BundleFeatures {
        BundleFeatures {
            bundle_size: 3,
            tip_profit_ratio: tip_ratio,
            venue_landing_rate: 0.5,
            time_of_slot: 0.5,
            builder_inclusion_rate: 0.8,
        }
    }

    #[test]
    fn test_monotone_in_tip() {
        let model = SuccessModel::new();
        let mut last = 0.0;
        for tip in [0.0, 0.05, 0.1, 0.2, 0.25] {
            let p = model.p_land(&features(tip));
            assert!(p >= last, "p_land must not decrease as the tip grows");
            last = p;
        }
    }

    #[test]
    fn test_monotone_in_tip_survives_updates() {
        let model = SuccessModel::new();
        // Adversarial history: high tips that all failed.
        for _ in 0..200 {
            model.record(&features(0.25), &["ray".into()], false, None);
        }
        assert!(model.p_land(&features(0.2)) >= model.p_land(&features(0.05)));
    }

    #[test]
    fn test_learning_moves_toward_outcomes() {
        let model = SuccessModel::new();
        let before = model.p_land(&features(0.1));
        for _ in 0..50 {
            model.record(&features(0.1), &["ray".into()], true, Some(1_000));
        }
        assert!(model.p_land(&features(0.1)) > before);
        assert!(model.venue_landing_rate("ray") > 0.9);
    }

    #[test]
    fn test_competition_rises_with_activity() {
        let model = SuccessModel::new();
        let venues = vec!["orc".to_string()];
        let quiet = model.competition(&venues);
        for _ in 0..20 {
            model.record_opportunity(&venues);
        }
        assert!(model.competition(&venues) > quiet);
    }
}
