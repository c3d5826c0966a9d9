use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationLayer {
    Syntax,
    Semantic,
    Behavioral,
    Safety,
    Intent,
}

impl VerificationLayer {
    /// Pipeline order.
    pub const ORDERED: [Self; 5] =
        [Self::Syntax, Self::Semantic, Self::Behavioral, Self::Safety, Self::Intent];
    /// Layers that always run and whose failure is always fatal.
    pub const MANDATORY: [Self; 2] = [Self::Syntax, Self::Safety];
    pub const DEFAULT_WEIGHT: f64 = 0.2;

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Syntax => "syntax",
            Self::Semantic => "semantic",
            Self::Behavioral => "behavioral",
            Self::Safety => "safety",
            Self::Intent => "intent",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "syntax" => Some(Self::Syntax),
            "semantic" => Some(Self::Semantic),
            "behavioral" => Some(Self::Behavioral),
            "safety" => Some(Self::Safety),
            "intent" => Some(Self::Intent),
            _ => None,
        }
    }

    /// Capitalized name used in user-facing text.
    pub fn title(&self) -> &'static str {
        match self {
            Self::Syntax => "Syntax",
            Self::Semantic => "Semantic",
            Self::Behavioral => "Behavioral",
            Self::Safety => "Safety",
            Self::Intent => "Intent",
        }
    }

    pub fn is_mandatory(&self) -> bool {
        Self::MANDATORY.contains(self)
    }
}

impl fmt::Display for VerificationLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub layer: VerificationLayer,
    pub passed: bool,
    pub confidence: f64,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub details: String,
    #[serde(default)]
    pub execution_time_ms: u64,
}

impl VerificationResult {
    pub fn new(layer: VerificationLayer, passed: bool, confidence: f64) -> Self {
        Self {
            layer,
            passed,
            confidence: confidence.clamp(0.0, 1.0),
            issues: Vec::new(),
            details: String::new(),
            execution_time_ms: 0,
        }
    }

    pub fn pass(layer: VerificationLayer, confidence: f64) -> Self {
        Self::new(layer, true, confidence)
    }

    pub fn fail(layer: VerificationLayer, issue: impl Into<String>) -> Self {
        Self::new(layer, false, 0.0).with_issue(issue)
    }

    pub fn with_issue(mut self, issue: impl Into<String>) -> Self {
        self.issues.push(issue.into());
        self
    }

    pub fn with_issues(mut self, issues: impl IntoIterator<Item = String>) -> Self {
        self.issues.extend(issues);
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }
}
