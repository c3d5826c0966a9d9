//! Splits compound requests into atomic operations.
//!
//! Splitting is purely textual. The split plan is built first with every
//! operation id assigned, then each leaf is classified on its own.

use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use regex::Regex;

use opgate_core::config::PipelineConfig;
use opgate_core::domain::feedback::CorrectionExample;
use opgate_core::domain::operation::{AtomicOperation, OperationId};
use opgate_core::lexicon::{self, ACTION_VERBS};

use crate::classifier::AtomicClassifier;

const TRIGGER_PATTERNS: &[&str] =
    &[r"(?i)\bthen\b", r"(?i)\balso\b", r"(?i)\bafter\s+that\b", r"\d+\.\s+", r";", r"(?i)\band\s+then\b"];

fn triggers() -> &'static [Regex] {
    static TRIGGERS: OnceLock<Vec<Regex>> = OnceLock::new();
    TRIGGERS.get_or_init(|| TRIGGER_PATTERNS.iter().filter_map(|pattern| Regex::new(pattern).ok()).collect())
}

fn numbered_marker() -> Option<&'static Regex> {
    static NUMBERED_MARKER: OnceLock<Option<Regex>> = OnceLock::new();
    NUMBERED_MARKER.get_or_init(|| Regex::new(r"(?:^|\s)\d+\.\s+").ok()).as_ref()
}

fn and_conjunction() -> Option<&'static Regex> {
    static AND_CONJUNCTION: OnceLock<Option<Regex>> = OnceLock::new();
    AND_CONJUNCTION.get_or_init(|| Regex::new(r"(?i)\s+and\s+").ok()).as_ref()
}

/// Clause separators in priority order, with the name used in reasons.
const CLAUSE_SEPARATORS: [(&str, &str); 8] = [
    (", then ", "then"),
    (" then ", "then"),
    (" and then ", "and then"),
    ("; ", "semicolon"),
    (" after that ", "after that"),
    (" also ", "also"),
    (" followed by ", "followed by"),
    (" next ", "next"),
];

/// Result of textual splitting. `markers` names every separator that fired.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Split {
    pub parts: Vec<String>,
    pub markers: Vec<&'static str>,
}

impl Split {
    fn unsplit(request: &str) -> Self {
        Self { parts: vec![request.trim().to_string()], markers: Vec::new() }
    }

    pub fn is_split(&self) -> bool {
        self.parts.len() > 1
    }
}

/// Splits a request into sub-requests. Numbered lists win, then the first
/// clause separator in priority order (recursing on the remainder), then a
/// two-way split on "and" when both halves carry an action verb.
pub fn split_request(request: &str) -> Split {
    if let Some(parts) = split_numbered(request) {
        return Split { parts, markers: vec!["numbered list"] };
    }

    let lowered = request.to_ascii_lowercase();
    for (separator, marker) in CLAUSE_SEPARATORS {
        let Some(index) = lowered.find(separator) else {
            continue;
        };
        let mut split = Split { parts: Vec::new(), markers: vec![marker] };
        let before = clean_clause(&request[..index]);
        if !before.is_empty() {
            split.parts.push(before);
        }
        let after = request[index + separator.len()..].trim();
        if !after.is_empty() {
            let rest = split_request(after);
            split.parts.extend(rest.parts);
            for marker in rest.markers {
                if !split.markers.contains(&marker) {
                    split.markers.push(marker);
                }
            }
        }
        return split;
    }

    let halves: Vec<&str> = and_conjunction().map_or_else(Vec::new, |regex| regex.split(request).collect());
    if halves.len() == 2 && halves.iter().all(|half| looks_like_action(half)) {
        return Split {
            parts: halves.iter().map(|half| half.trim().to_string()).collect(),
            markers: vec!["and"],
        };
    }

    Split::unsplit(request)
}

fn split_numbered(request: &str) -> Option<Vec<String>> {
    let markers: Vec<_> = numbered_marker()?.find_iter(request).collect();
    if markers.len() < 2 {
        return None;
    }
    let parts: Vec<String> = markers
        .iter()
        .enumerate()
        .map(|(index, marker)| {
            let end = markers.get(index + 1).map_or(request.len(), |next| next.start());
            request[marker.end()..end].trim().to_string()
        })
        .filter(|part| !part.is_empty())
        .collect();
    (parts.len() >= 2).then_some(parts)
}

/// Drops separator residue such as a trailing comma or a dangling "and".
fn clean_clause(text: &str) -> String {
    let mut clause = text.trim().trim_end_matches(|c: char| c == ',' || c == ';').trim_end();
    if clause.to_ascii_lowercase().ends_with(" and") {
        clause = clause[..clause.len() - 4].trim_end();
    }
    clause.to_string()
}

fn looks_like_action(text: &str) -> bool {
    lexicon::contains_any(&lexicon::tokenize(text), ACTION_VERBS)
}

#[derive(Clone, Debug, Default)]
pub struct DecomposeContext {
    pub user_id: String,
    pub source_agent: String,
    pub force: bool,
    /// Hints passed to every leaf classification.
    pub corrections: Vec<CorrectionExample>,
}

impl DecomposeContext {
    pub fn new(user_id: impl Into<String>, source_agent: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), source_agent: source_agent.into(), ..Self::default() }
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn with_corrections(mut self, corrections: Vec<CorrectionExample>) -> Self {
        self.corrections = corrections;
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Decomposition {
    pub original_request: String,
    pub decomposed: bool,
    /// Root first, then descendants depth-first. Parents precede their children.
    pub operations: Vec<AtomicOperation>,
    /// Model id that classified each leaf.
    pub models: BTreeMap<OperationId, String>,
    pub reasoning: String,
    /// Leaf confidence, or the mean over children for a parent.
    pub confidence: f64,
}

impl Decomposition {
    pub fn root(&self) -> Option<&AtomicOperation> {
        self.operations.first()
    }

    pub fn leaves(&self) -> impl Iterator<Item = &AtomicOperation> {
        self.operations.iter().filter(|operation| operation.is_leaf())
    }

    pub fn children_of(&self, parent_id: &OperationId) -> Vec<&AtomicOperation> {
        self.operations.iter().filter(|operation| operation.parent_id.as_ref() == Some(parent_id)).collect()
    }
}

enum PlanNode {
    Leaf { request: String, reason: String },
    Split { request: String, reason: String, children: Vec<PlanNode> },
}

impl PlanNode {
    fn reason(&self) -> &str {
        match self {
            Self::Leaf { reason, .. } | Self::Split { reason, .. } => reason,
        }
    }
}

#[derive(Clone)]
pub struct AtomicDecomposer {
    classifier: AtomicClassifier,
    max_depth: usize,
    word_threshold: usize,
}

impl AtomicDecomposer {
    pub fn new(classifier: AtomicClassifier) -> Self {
        Self { classifier, max_depth: 3, word_threshold: 30 }
    }

    pub fn from_config(classifier: AtomicClassifier, config: &PipelineConfig) -> Self {
        Self {
            classifier,
            max_depth: config.max_decomposition_depth,
            word_threshold: config.decomposition_word_threshold,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn classifier(&self) -> &AtomicClassifier {
        &self.classifier
    }

    pub fn needs_decomposition(&self, request: &str) -> bool {
        triggers().iter().any(|pattern| pattern.is_match(request))
            || request.split_whitespace().count() > self.word_threshold
    }

    pub async fn decompose(&self, request: &str, context: &DecomposeContext) -> Decomposition {
        let request = request.trim();
        let plan = self.plan(request, 0, context.force);

        let mut operations = Vec::new();
        flatten(&plan, None, context, &mut operations);

        let mut models = BTreeMap::new();
        for operation in operations.iter_mut().filter(|operation| operation.is_leaf()) {
            let output = self.classifier.classify(&operation.user_request, &context.corrections).await;
            models.insert(operation.id.clone(), output.model);
            operation.classification = Some(output.classification);
        }

        let by_id: HashMap<&OperationId, &AtomicOperation> =
            operations.iter().map(|operation| (&operation.id, operation)).collect();
        let confidence = operations.first().map_or(0.0, |root| node_confidence(root, &by_id));
        let decomposed = matches!(plan, PlanNode::Split { .. });

        if decomposed {
            tracing::debug!(
                event_name = "opgate.decompose.split",
                operations = operations.len(),
                confidence,
                reason = plan.reason(),
                "request decomposed"
            );
        }

        Decomposition {
            original_request: request.to_string(),
            decomposed,
            reasoning: plan.reason().to_string(),
            operations,
            models,
            confidence,
        }
    }

    fn plan(&self, request: &str, depth: usize, force: bool) -> PlanNode {
        let leaf = |reason: &str| PlanNode::Leaf { request: request.to_string(), reason: reason.to_string() };

        if depth >= self.max_depth {
            return leaf("Maximum decomposition depth reached");
        }
        if !force && !self.needs_decomposition(request) {
            return leaf("Single atomic operation");
        }

        let split = split_request(request);
        if !split.is_split() {
            return leaf("Could not split into sub-operations");
        }

        let reason = format!(
            "Split into {} sub-operations on {}",
            split.parts.len(),
            split.markers.iter().map(|marker| format!("'{marker}'")).collect::<Vec<_>>().join(", ")
        );
        let children = split.parts.iter().map(|part| self.plan(part, depth + 1, false)).collect();
        PlanNode::Split { request: request.to_string(), reason, children }
    }
}

fn flatten(
    node: &PlanNode,
    parent_id: Option<OperationId>,
    context: &DecomposeContext,
    out: &mut Vec<AtomicOperation>,
) -> OperationId {
    match node {
        PlanNode::Leaf { request, .. } => {
            let operation =
                AtomicOperation::new(request.as_str(), context.user_id.as_str(), context.source_agent.as_str())
                    .with_parent(parent_id);
            let id = operation.id.clone();
            out.push(operation);
            id
        }
        PlanNode::Split { request, children, .. } => {
            let mut parent =
                AtomicOperation::new(request.as_str(), context.user_id.as_str(), context.source_agent.as_str())
                    .with_parent(parent_id);
            parent.is_decomposed = true;
            let id = parent.id.clone();
            let index = out.len();
            out.push(parent);

            let child_ids = children.iter().map(|child| flatten(child, Some(id.clone()), context, out)).collect();
            out[index].child_ids = child_ids;
            id
        }
    }
}

fn node_confidence(operation: &AtomicOperation, by_id: &HashMap<&OperationId, &AtomicOperation>) -> f64 {
    if operation.is_leaf() {
        return operation.confidence();
    }
    let scores: Vec<f64> = operation
        .child_ids
        .iter()
        .filter_map(|id| by_id.get(id))
        .map(|child| node_confidence(child, by_id))
        .collect();
    if scores.is_empty() {
        0.0
    } else {
        scores.iter().sum::<f64>() / scores.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use opgate_core::domain::taxonomy::{Destination, Semantics, UNSURE_SCORE};

    use super::{split_request, AtomicDecomposer, DecomposeContext};
    use crate::classifier::{AtomicClassifier, FALLBACK_MODEL};
    use crate::llm::{LlmClient, LlmError};

    fn decomposer() -> AtomicDecomposer {
        AtomicDecomposer::new(AtomicClassifier::offline())
    }

    fn context() -> DecomposeContext {
        DecomposeContext::new("user-1", "cli")
    }

    /// Confident only for requests that list something.
    struct ListingExpert;

    #[async_trait]
    impl LlmClient for ListingExpert {
        async fn chat_json(&self, _system: &str, user: &str, _t: f32, _p: f32) -> Result<String, LlmError> {
            let confident = user.contains("list");
            Ok(format!(
                "{{\"destination\": \"stream\", \"consumer\": \"human\", \"semantics\": \"read\", \"confident\": {confident}}}"
            ))
        }
    }

    #[tokio::test]
    async fn atomic_request_stays_single() {
        let decomposition = decomposer().decompose("show memory usage", &context()).await;

        assert!(!decomposition.decomposed);
        assert_eq!(decomposition.operations.len(), 1);
        assert_eq!(decomposition.reasoning, "Single atomic operation");
        assert!(decomposition.operations[0].classification.is_some());
        assert_eq!(decomposition.models.values().next().map(String::as_str), Some(FALLBACK_MODEL));
    }

    #[tokio::test]
    async fn then_splits_into_two_children() {
        let decomposition = decomposer().decompose("list files then delete temp.txt", &context()).await;

        assert!(decomposition.decomposed);
        assert!(decomposition.reasoning.contains("'then'"));
        let root = decomposition.root().expect("root");
        assert!(root.is_decomposed);
        assert!(root.classification.is_none());
        assert_eq!(root.child_ids.len(), 2);

        let children = decomposition.children_of(&root.id);
        let requests: Vec<&str> = children.iter().map(|child| child.user_request.as_str()).collect();
        assert_eq!(requests, vec!["list files", "delete temp.txt"]);
        assert_eq!(children[0].semantics(), Some(Semantics::Read));
        assert_eq!(children[1].semantics(), Some(Semantics::Execute));
        assert_eq!(decomposition.confidence, UNSURE_SCORE);
    }

    #[test]
    fn separators_recurse_on_the_remainder() {
        let split = split_request("open firefox, then check mail also play some music");
        assert_eq!(split.parts, vec!["open firefox", "check mail", "play some music"]);
        assert_eq!(split.markers, vec!["then", "also"]);

        let split = split_request("build the project and then run the tests");
        assert_eq!(split.parts, vec!["build the project", "run the tests"]);

        let split = split_request("1. list files 2. show disk usage 3. restart nginx");
        assert_eq!(split.parts, vec!["list files", "show disk usage", "restart nginx"]);
        assert_eq!(split.markers, vec!["numbered list"]);
    }

    #[test]
    fn and_splits_only_two_action_clauses() {
        assert_eq!(split_request("show disk usage and restart nginx").parts.len(), 2);
        assert_eq!(split_request("salt and pepper").parts, vec!["salt and pepper"]);
        assert_eq!(split_request("show cpu and show disk and show memory").parts.len(), 1);
    }

    #[tokio::test]
    async fn plain_and_needs_force_to_split() {
        let request = "show disk usage and restart nginx";
        assert!(!decomposer().decompose(request, &context()).await.decomposed);

        let forced = decomposer().decompose(request, &context().forced()).await;
        assert!(forced.decomposed);
        assert_eq!(forced.leaves().count(), 2);

        let unsplittable = decomposer().decompose("salt and pepper", &context().forced()).await;
        assert!(!unsplittable.decomposed);
        assert_eq!(unsplittable.reasoning, "Could not split into sub-operations");
    }

    #[test]
    fn long_requests_trigger_decomposition() {
        let decomposer = decomposer();
        let long = ["word"; 31].join(" ");
        assert!(decomposer.needs_decomposition(&long));
        assert!(!decomposer.needs_decomposition(&["word"; 30].join(" ")));
    }

    #[tokio::test]
    async fn nested_compounds_respect_depth_cap() {
        let request = "1. list files then show disk usage 2. restart nginx";

        let tree = decomposer().decompose(request, &context()).await;
        assert_eq!(tree.operations.len(), 5);
        assert_eq!(tree.operations.iter().filter(|operation| operation.is_decomposed).count(), 2);
        assert_eq!(tree.leaves().count(), 3);

        let capped = decomposer().with_max_depth(1).decompose(request, &context()).await;
        assert_eq!(capped.operations.len(), 3);
        let requests: Vec<&str> = capped.leaves().map(|leaf| leaf.user_request.as_str()).collect();
        assert_eq!(requests, vec!["list files then show disk usage", "restart nginx"]);
    }

    #[tokio::test]
    async fn parent_confidence_is_child_mean() {
        let decomposer = AtomicDecomposer::new(AtomicClassifier::new(Some(Arc::new(ListingExpert))));

        let decomposition = decomposer.decompose("list files then show uptime", &context()).await;

        assert!((decomposition.confidence - 0.6).abs() < 1e-9);
        let leaf_destinations: Vec<_> = decomposition.leaves().map(|leaf| leaf.destination()).collect();
        assert_eq!(leaf_destinations, vec![Some(Destination::Stream), Some(Destination::Stream)]);
    }
}
