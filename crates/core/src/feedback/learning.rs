//! Read-side aggregation over classification outcomes.
//!
//! Nothing here retrains the classifier. The aggregator turns outcome rows
//! into accuracy metrics, labelled training pairs and weak-area reports that
//! callers can export.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

use crate::domain::feedback::{ClassificationOutcome, LearningMetrics, TrainingPair, WeakArea};
use crate::domain::taxonomy::ClassificationLabel;
use crate::feedback::collector::CORRECTION_CONFIDENCE;

pub const DIMENSIONS: [&str; 3] = ["destination", "consumer", "semantics"];

#[derive(Clone, Copy, Debug, Default)]
struct Tally {
    correct: usize,
    total: usize,
}

impl Tally {
    fn record(&mut self, correct: bool) {
        self.total += 1;
        if correct {
            self.correct += 1;
        }
    }

    fn accuracy(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LearningAggregator;

impl LearningAggregator {
    pub fn new() -> Self {
        Self
    }

    /// Accuracy metrics for one user over the `window_days` ending at `now`.
    ///
    /// An outcome counts as correct unless a correction changed its label.
    pub fn compute_metrics(
        &self,
        user_id: &str,
        window_days: u32,
        outcomes: &[ClassificationOutcome],
        now: DateTime<Utc>,
    ) -> LearningMetrics {
        let window_start = now - Duration::days(i64::from(window_days));
        let in_window: Vec<&ClassificationOutcome> = outcomes
            .iter()
            .filter(|outcome| outcome.recorded_at >= window_start && outcome.recorded_at <= now)
            .collect();

        let mut overall = Tally::default();
        let mut corrections = 0usize;
        let mut ratings = Vec::new();
        let mut by_dimension: [BTreeMap<String, Tally>; 3] = Default::default();

        for outcome in &in_window {
            overall.record(!was_changed(outcome));
            if outcome.corrected.is_some() {
                corrections += 1;
            }
            if let Some(rating) = outcome.rating {
                ratings.push(f64::from(rating));
            }
            for (index, tallies) in by_dimension.iter_mut().enumerate() {
                let (category, correct) = dimension_verdict(outcome, index);
                tallies.entry(category).or_default().record(correct);
            }
        }

        let sample_size = in_window.len();
        let [destination, consumer, semantics] = by_dimension.map(accuracy_map);
        LearningMetrics {
            user_id: user_id.to_string(),
            window_start,
            window_end: now,
            window_days,
            classification_accuracy: overall.accuracy(),
            sample_size,
            accuracy_by_destination: destination,
            accuracy_by_consumer: consumer,
            accuracy_by_semantics: semantics,
            avg_rating: mean(&ratings),
            correction_rate: if sample_size == 0 { 0.0 } else { corrections as f64 / sample_size as f64 },
        }
    }

    /// Corrected outcomes as labelled pairs, most recent first.
    pub fn training_pairs(&self, outcomes: &[ClassificationOutcome], limit: usize) -> Vec<TrainingPair> {
        let mut corrected: Vec<&ClassificationOutcome> =
            outcomes.iter().filter(|outcome| outcome.corrected.is_some()).collect();
        corrected.sort_by(|left, right| right.recorded_at.cmp(&left.recorded_at));

        corrected
            .into_iter()
            .filter_map(|outcome| {
                outcome.corrected.map(|label| TrainingPair {
                    request: outcome.request.clone(),
                    system: outcome.system,
                    corrected: label,
                    confidence: CORRECTION_CONFIDENCE,
                })
            })
            .take(limit)
            .collect()
    }

    /// Categories whose accuracy falls below `threshold` with at least
    /// `min_samples` observations, weakest first.
    pub fn identify_weak_areas(
        &self,
        outcomes: &[ClassificationOutcome],
        threshold: f64,
        min_samples: usize,
    ) -> Vec<WeakArea> {
        let mut areas = Vec::new();
        for (index, dimension) in DIMENSIONS.iter().enumerate() {
            let mut tallies: BTreeMap<String, Tally> = BTreeMap::new();
            for outcome in outcomes {
                let (category, correct) = dimension_verdict(outcome, index);
                tallies.entry(category).or_default().record(correct);
            }
            areas.extend(
                tallies
                    .into_iter()
                    .filter(|(_, tally)| tally.total >= min_samples && tally.accuracy() < threshold)
                    .map(|(category, tally)| WeakArea {
                        dimension: dimension.to_string(),
                        category,
                        accuracy: tally.accuracy(),
                        samples: tally.total,
                    }),
            );
        }

        areas.sort_by(|left, right| left.accuracy.total_cmp(&right.accuracy));
        areas
    }
}

fn was_changed(outcome: &ClassificationOutcome) -> bool {
    outcome.corrected.is_some_and(|corrected| corrected != outcome.system)
}

/// Category the system chose on one dimension and whether it survived review.
fn dimension_verdict(outcome: &ClassificationOutcome, index: usize) -> (String, bool) {
    let pick = |label: &ClassificationLabel| match index {
        0 => label.destination.as_str(),
        1 => label.consumer.as_str(),
        _ => label.semantics.as_str(),
    };
    let system = pick(&outcome.system);
    let correct = outcome.corrected.as_ref().map_or(true, |corrected| pick(corrected) == system);
    (system.to_string(), correct)
}

fn accuracy_map(tallies: BTreeMap<String, Tally>) -> BTreeMap<String, f64> {
    tallies.into_iter().map(|(category, tally)| (category, tally.accuracy())).collect()
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}
