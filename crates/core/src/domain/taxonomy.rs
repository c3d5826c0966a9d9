use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

/// Confidence assigned when a classifier stands behind its answer.
pub const CONFIDENT_SCORE: f64 = 0.9;
/// Confidence assigned when a classifier reports it is unsure, and for every fallback answer.
pub const UNSURE_SCORE: f64 = 0.3;
/// Scores at or above this value count as a confident classification.
pub const CONFIDENT_THRESHOLD: f64 = 0.7;

/// Where the output of an operation lands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Destination {
    /// Ephemeral output shown once.
    Stream,
    /// Persistent storage.
    File,
    /// A spawned or controlled system process.
    Process,
}

/// Who reads the result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consumer {
    Human,
    Machine,
}

/// Whether the operation mutates state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Semantics {
    /// Retrieve existing data.
    Read,
    /// Analyze or transform data without side effects.
    Interpret,
    /// Perform a side-effecting action.
    Execute,
}

impl Destination {
    pub const ALL: [Self; 3] = [Self::Stream, Self::File, Self::Process];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::File => "file",
            Self::Process => "process",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stream" => Some(Self::Stream),
            "file" => Some(Self::File),
            "process" => Some(Self::Process),
            _ => None,
        }
    }
}

impl Consumer {
    pub const ALL: [Self; 2] = [Self::Human, Self::Machine];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Machine => "machine",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "human" => Some(Self::Human),
            "machine" => Some(Self::Machine),
            _ => None,
        }
    }
}

impl Semantics {
    pub const ALL: [Self; 3] = [Self::Read, Self::Interpret, Self::Execute];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Interpret => "interpret",
            Self::Execute => "execute",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "read" => Some(Self::Read),
            "interpret" => Some(Self::Interpret),
            "execute" => Some(Self::Execute),
            _ => None,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Semantics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The bare taxonomy triple, without confidence or reasoning.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClassificationLabel {
    pub destination: Destination,
    pub consumer: Consumer,
    pub semantics: Semantics,
}

impl ClassificationLabel {
    pub fn new(destination: Destination, consumer: Consumer, semantics: Semantics) -> Self {
        Self { destination, consumer, semantics }
    }

    /// Parses the three taxonomy fields strictly; any unknown value is an error.
    pub fn parse(destination: &str, consumer: &str, semantics: &str) -> Result<Self, DomainError> {
        let destination = Destination::parse(destination).ok_or_else(|| {
            DomainError::IllegalTaxonomyValue {
                dimension: "destination".to_owned(),
                value: destination.to_owned(),
            }
        })?;
        let consumer = Consumer::parse(consumer).ok_or_else(|| {
            DomainError::IllegalTaxonomyValue {
                dimension: "consumer".to_owned(),
                value: consumer.to_owned(),
            }
        })?;
        let semantics = Semantics::parse(semantics).ok_or_else(|| {
            DomainError::IllegalTaxonomyValue {
                dimension: "semantics".to_owned(),
                value: semantics.to_owned(),
            }
        })?;
        Ok(Self { destination, consumer, semantics })
    }

    /// File or process targets combined with execute semantics always need a human.
    pub fn is_mutating(&self) -> bool {
        self.semantics == Semantics::Execute
            && matches!(self.destination, Destination::File | Destination::Process)
    }
}

impl fmt::Display for ClassificationLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.destination, self.consumer, self.semantics)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub destination: Destination,
    pub consumer: Consumer,
    pub semantics: Semantics,
    pub confidence: f64,
    pub reasoning: String,
    #[serde(default)]
    pub alternatives: Vec<ClassificationLabel>,
}

impl Classification {
    pub fn new(label: ClassificationLabel, confidence: f64, reasoning: impl Into<String>) -> Self {
        Self {
            destination: label.destination,
            consumer: label.consumer,
            semantics: label.semantics,
            confidence: confidence.clamp(0.0, 1.0),
            reasoning: reasoning.into(),
            alternatives: Vec::new(),
        }
    }

    /// Builds a classification from a backend's self-reported confidence flag.
    pub fn from_confident_flag(
        label: ClassificationLabel,
        confident: bool,
        reasoning: impl Into<String>,
    ) -> Self {
        let score = if confident { CONFIDENT_SCORE } else { UNSURE_SCORE };
        Self::new(label, score, reasoning)
    }

    pub fn with_alternatives(mut self, alternatives: Vec<ClassificationLabel>) -> Self {
        self.alternatives = alternatives;
        self
    }

    pub fn label(&self) -> ClassificationLabel {
        ClassificationLabel::new(self.destination, self.consumer, self.semantics)
    }

    pub fn confident(&self) -> bool {
        self.confidence >= CONFIDENT_THRESHOLD
    }

    pub fn is_mutating(&self) -> bool {
        self.label().is_mutating()
    }
}

#[cfg(test)]
mod tests {
    use super::{
        Classification, ClassificationLabel, Consumer, Destination, Semantics, CONFIDENT_SCORE,
        UNSURE_SCORE,
    };
    use crate::errors::DomainError;

    #[test]
    fn taxonomy_values_use_stable_storage_encoding() {
        for destination in Destination::ALL {
            assert_eq!(Destination::parse(destination.as_str()), Some(destination));
        }
        for consumer in Consumer::ALL {
            assert_eq!(Consumer::parse(consumer.as_str()), Some(consumer));
        }
        for semantics in Semantics::ALL {
            assert_eq!(Semantics::parse(semantics.as_str()), Some(semantics));
        }
        assert_eq!(Destination::parse(" FILE "), Some(Destination::File));
    }

    #[test]
    fn illegal_taxonomy_value_is_rejected_not_coerced() {
        let error = ClassificationLabel::parse("disk", "human", "read")
            .expect_err("disk is not a destination");

        assert_eq!(
            error,
            DomainError::IllegalTaxonomyValue {
                dimension: "destination".to_owned(),
                value: "disk".to_owned(),
            }
        );
        assert!(ClassificationLabel::parse("file", "robot", "read").is_err());
        assert!(ClassificationLabel::parse("file", "human", "write").is_err());
    }

    #[test]
    fn confident_flag_maps_to_fixed_scores() {
        let label = ClassificationLabel::new(Destination::File, Consumer::Human, Semantics::Execute);

        let sure = Classification::from_confident_flag(label, true, "explicit save");
        let unsure = Classification::from_confident_flag(label, false, "guess");

        assert_eq!(sure.confidence, CONFIDENT_SCORE);
        assert!(sure.confident());
        assert_eq!(unsure.confidence, UNSURE_SCORE);
        assert!(!unsure.confident());
    }

    #[test]
    fn only_file_or_process_execute_is_mutating() {
        let cases = [
            (Destination::File, Semantics::Execute, true),
            (Destination::Process, Semantics::Execute, true),
            (Destination::Stream, Semantics::Execute, false),
            (Destination::File, Semantics::Read, false),
            (Destination::Process, Semantics::Interpret, false),
        ];

        for (destination, semantics, expected) in cases {
            let label = ClassificationLabel::new(destination, Consumer::Human, semantics);
            assert_eq!(label.is_mutating(), expected, "{label}");
        }
    }
}
