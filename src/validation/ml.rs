//! Optional ML-assisted error prediction and anomaly detection (§4.5 step
//! 7). No model ships with the substrate; `MlPredictor` is the seam a real
//! model plugs into, and `HeuristicPredictor` is the always-available
//! fallback used when it's disabled or untrained.

/// The 12-feature vector the spec enumerates for error-probability and
/// anomaly-score inference.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureVector {
    pub tool_complexity: f64,
    pub param_count: f64,
    pub pattern_match: f64,
    pub agent_experience: f64,
    pub error_rate: f64,
    pub time_of_day: f64,
    pub day_of_week: f64,
    pub system_load: f64,
    pub concurrent_requests: f64,
    pub recent_errors: f64,
    pub recent_successes: f64,
    pub avg_latency_ms: f64,
}

impl FeatureVector {
    pub fn as_array(&self) -> [f64; 12] {
        [
            self.tool_complexity,
            self.param_count,
            self.pattern_match,
            self.agent_experience,
            self.error_rate,
            self.time_of_day,
            self.day_of_week,
            self.system_load,
            self.concurrent_requests,
            self.recent_errors,
            self.recent_successes,
            self.avg_latency_ms,
        ]
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Prediction {
    pub error_probability: f64,
    pub anomaly_score: f64,
    pub confidence: f64,
    pub fell_back_to_heuristic: bool,
}

pub trait MlPredictor: Send + Sync {
    fn is_trained(&self) -> bool;
    fn predict(&self, features: &FeatureVector) -> Prediction;
}

/// Distance-based isolation score against a fixed fallback error
/// probability, per spec §4.5 step 7's described fallback behaviour.
pub struct HeuristicPredictor;

impl MlPredictor for HeuristicPredictor {
    fn is_trained(&self) -> bool {
        false
    }

    fn predict(&self, features: &FeatureVector) -> Prediction {
        let values = features.as_array();
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
        let isolation_score = variance.sqrt().min(1.0);

        Prediction {
            error_probability: 0.3,
            anomaly_score: isolation_score,
            confidence: 0.5,
            fell_back_to_heuristic: true,
        }
    }
}

/// Dispatches to the configured predictor if present and trained;
/// otherwise falls back to the heuristic and reports that it did so.
pub fn predict_with_fallback(
    predictor: Option<&dyn MlPredictor>,
    features: &FeatureVector,
) -> Prediction {
    match predictor {
        Some(p) if p.is_trained() => p.predict(features),
        _ => HeuristicPredictor.predict(features),
    }
}
