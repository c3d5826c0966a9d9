//! Domain intents from upstream assistants, mapped onto the taxonomy.

use std::fmt;

use opgate_core::domain::taxonomy::{
    Classification, ClassificationLabel, Consumer, Destination, Semantics,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DomainIntent {
    Calendar,
    Contacts,
    System,
    Tasks,
    Knowledge,
    Personal,
    Play,
    Undo,
}

impl DomainIntent {
    pub const ALL: [Self; 8] = [
        Self::Calendar,
        Self::Contacts,
        Self::System,
        Self::Tasks,
        Self::Knowledge,
        Self::Personal,
        Self::Play,
        Self::Undo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Calendar => "calendar",
            Self::Contacts => "contacts",
            Self::System => "system",
            Self::Tasks => "tasks",
            Self::Knowledge => "knowledge",
            Self::Personal => "personal",
            Self::Play => "play",
            Self::Undo => "undo",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        Self::ALL.into_iter().find(|intent| intent.as_str().eq_ignore_ascii_case(value))
    }

    fn base(&self) -> (ClassificationLabel, f64) {
        use Consumer::{Human, Machine};
        use Destination::{File, Process, Stream};
        use Semantics::{Execute, Interpret, Read};

        match self {
            Self::Calendar => (ClassificationLabel::new(Stream, Human, Read), 0.9),
            Self::Contacts => (ClassificationLabel::new(Stream, Human, Read), 0.9),
            Self::System => (ClassificationLabel::new(Process, Machine, Execute), 0.85),
            Self::Tasks => (ClassificationLabel::new(File, Human, Read), 0.85),
            Self::Knowledge => (ClassificationLabel::new(File, Human, Read), 0.85),
            Self::Personal => (ClassificationLabel::new(Stream, Human, Interpret), 0.9),
            Self::Play => (ClassificationLabel::new(File, Human, Execute), 0.85),
            Self::Undo => (ClassificationLabel::new(File, Human, Execute), 0.9),
        }
    }
}

impl fmt::Display for DomainIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IntentAction {
    View,
    Search,
    Status,
    Create,
    Update,
    Delete,
}

impl IntentAction {
    pub const ALL: [Self; 6] =
        [Self::View, Self::Search, Self::Status, Self::Create, Self::Update, Self::Delete];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::View => "view",
            Self::Search => "search",
            Self::Status => "status",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        Self::ALL.into_iter().find(|action| action.as_str().eq_ignore_ascii_case(value))
    }

    pub fn semantics(&self) -> Semantics {
        match self {
            Self::View | Self::Search | Self::Status => Semantics::Read,
            Self::Create | Self::Update | Self::Delete => Semantics::Execute,
        }
    }
}

impl fmt::Display for IntentAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification for a request an upstream assistant already understood.
pub fn seed_classification(intent: DomainIntent, action: Option<IntentAction>) -> Classification {
    let (mut label, confidence) = intent.base();
    if let Some(action) = action {
        label.semantics = action.semantics();
    }
    let reasoning = match action {
        Some(action) => format!("seeded from intent {intent}/{action}"),
        None => format!("seeded from intent {intent}"),
    };
    Classification::new(label, confidence, reasoning)
}

#[cfg(test)]
mod tests {
    use opgate_core::domain::taxonomy::{Consumer, Destination, Semantics};

    use super::{seed_classification, DomainIntent, IntentAction};

    #[test]
    fn intents_parse_case_insensitively() {
        assert_eq!(DomainIntent::parse(" Calendar "), Some(DomainIntent::Calendar));
        assert_eq!(DomainIntent::parse("weather"), None);
        assert_eq!(IntentAction::parse("DELETE"), Some(IntentAction::Delete));
    }

    #[test]
    fn actions_refine_semantics() {
        let viewed = seed_classification(DomainIntent::Tasks, Some(IntentAction::View));
        assert_eq!(viewed.destination, Destination::File);
        assert_eq!(viewed.semantics, Semantics::Read);
        assert_eq!(viewed.confidence, 0.85);

        let created = seed_classification(DomainIntent::Tasks, Some(IntentAction::Create));
        assert_eq!(created.semantics, Semantics::Execute);
        assert!(created.is_mutating());

        let status = seed_classification(DomainIntent::System, Some(IntentAction::Status));
        assert_eq!(status.consumer, Consumer::Machine);
        assert_eq!(status.semantics, Semantics::Read);
    }

    #[test]
    fn bare_intent_keeps_its_base_label() {
        let personal = seed_classification(DomainIntent::Personal, None);
        assert_eq!(personal.label().to_string(), "stream/human/interpret");
        assert!(personal.confident());
        assert_eq!(personal.reasoning, "seeded from intent personal");
    }
}
