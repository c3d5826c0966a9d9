use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::operation::OperationId;
use crate::domain::taxonomy::ClassificationLabel;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeedbackId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackType {
    ExplicitRating,
    Correction,
    Approval,
    Behavioral,
    LongTerm,
}

impl FeedbackType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExplicitRating => "explicit_rating",
            Self::Correction => "correction",
            Self::Approval => "approval",
            Self::Behavioral => "behavioral",
            Self::LongTerm => "long_term",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "explicit_rating" => Some(Self::ExplicitRating),
            "correction" => Some(Self::Correction),
            "approval" => Some(Self::Approval),
            "behavioral" => Some(Self::Behavioral),
            "long_term" => Some(Self::LongTerm),
            _ => None,
        }
    }
}

/// Payload of a feedback record; each variant carries only its own fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedbackSignal {
    ExplicitRating {
        rating: u8,
        #[serde(default)]
        dimensions: BTreeMap<String, u8>,
        comment: Option<String>,
    },
    Correction {
        system: Option<ClassificationLabel>,
        corrected: ClassificationLabel,
        reasoning: Option<String>,
    },
    Approval {
        approved: bool,
        modified: bool,
        modification_extent: f64,
        modification_details: Option<serde_json::Value>,
        time_to_decision_ms: Option<i64>,
    },
    Behavioral {
        retried: bool,
        retry_count: u32,
        time_to_retry_ms: Option<i64>,
        undid: bool,
        time_to_undo_ms: Option<i64>,
        abandoned: bool,
    },
    LongTerm {
        persisted: bool,
        days_persisted: Option<u32>,
        reused_pattern: bool,
        referenced_later: bool,
    },
}

impl FeedbackSignal {
    pub fn feedback_type(&self) -> FeedbackType {
        match self {
            Self::ExplicitRating { .. } => FeedbackType::ExplicitRating,
            Self::Correction { .. } => FeedbackType::Correction,
            Self::Approval { .. } => FeedbackType::Approval,
            Self::Behavioral { .. } => FeedbackType::Behavioral,
            Self::LongTerm { .. } => FeedbackType::LongTerm,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserFeedback {
    pub id: FeedbackId,
    pub operation_id: OperationId,
    pub user_id: String,
    pub signal: FeedbackSignal,
    pub feedback_confidence: f64,
    pub created_at: DateTime<Utc>,
}

impl UserFeedback {
    pub fn new(
        operation_id: OperationId,
        user_id: impl Into<String>,
        signal: FeedbackSignal,
        feedback_confidence: f64,
    ) -> Self {
        Self {
            id: FeedbackId(Uuid::new_v4().to_string()),
            operation_id,
            user_id: user_id.into(),
            signal,
            feedback_confidence,
            created_at: Utc::now(),
        }
    }

    pub fn feedback_type(&self) -> FeedbackType {
        self.signal.feedback_type()
    }

    pub fn rating(&self) -> Option<u8> {
        match &self.signal {
            FeedbackSignal::ExplicitRating { rating, .. } => Some(*rating),
            _ => None,
        }
    }
}

/// A past correction used as a hint for future classification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CorrectionExample {
    pub request: String,
    pub system: ClassificationLabel,
    pub corrected: ClassificationLabel,
}

/// One classified operation joined with the feedback it received.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClassificationOutcome {
    pub operation_id: OperationId,
    pub request: String,
    pub system: ClassificationLabel,
    pub system_confidence: f64,
    pub corrected: Option<ClassificationLabel>,
    pub rating: Option<u8>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClassificationStats {
    pub accuracy: f64,
    pub feedback_count: usize,
    /// Label rendered as `destination/consumer/semantics` to occurrence count.
    pub distribution: BTreeMap<String, usize>,
    pub avg_rating: Option<f64>,
    pub correction_rate: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainingPair {
    pub request: String,
    pub system: ClassificationLabel,
    pub corrected: ClassificationLabel,
    pub confidence: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WeakArea {
    pub dimension: String,
    pub category: String,
    pub accuracy: f64,
    pub samples: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LearningMetrics {
    pub user_id: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub window_days: u32,
    pub classification_accuracy: f64,
    pub sample_size: usize,
    pub accuracy_by_destination: BTreeMap<String, f64>,
    pub accuracy_by_consumer: BTreeMap<String, f64>,
    pub accuracy_by_semantics: BTreeMap<String, f64>,
    pub avg_rating: Option<f64>,
    pub correction_rate: f64,
}
