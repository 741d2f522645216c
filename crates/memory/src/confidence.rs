//! Confidence decay — exponential reduction toward a content-type floor.
//!
//! `current = floor + (initial − floor) · e^(−λ · age_days)`. The curve
//! starts at the initial confidence, decreases strictly with age, and
//! converges to the floor as age grows.

use chrono::{DateTime, Utc};

use cox_domain::config::{DecayConfig, DecayParams};
use cox_domain::node::MemoryNode;

/// Confidence at a given age for explicit decay parameters.
pub fn confidence_at(initial: f64, params: DecayParams, age_days: f64) -> f64 {
    params.floor + (initial - params.floor) * (-params.lambda_per_day * age_days).exp()
}

/// A node's decayed confidence as of `now`, using its content type's row
/// in the decay table.
pub fn current_confidence(node: &MemoryNode, decay: &DecayConfig, now: DateTime<Utc>) -> f64 {
    let params = decay.params_for(node.content_type.as_str());
    let age_days = (now - node.created_at).num_seconds().max(0) as f64 / 86_400.0;
    confidence_at(node.initial_confidence, params, age_days)
}
