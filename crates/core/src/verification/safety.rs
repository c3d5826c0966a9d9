use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;

use crate::domain::operation::AtomicOperation;
use crate::domain::taxonomy::Semantics;
use crate::domain::verification::{VerificationLayer, VerificationResult};
use crate::lexicon;
use crate::verification::{SafetyLevel, VerificationContext, Verifier};

/// Commands refused at every safety level.
const BLOCKED_COMMAND_PATTERNS: &[(&str, &str)] = &[
    (r"\brm\s+-[a-z]*(rf|fr)[a-z]*\s+(/|/\*|~/?)(\s|$)", "recursive delete of a root or home directory"),
    (r"\bmkfs(\.\w+)?\b", "filesystem formatting"),
    (r"\bdd\s+if=", "raw disk copy"),
    (r">\s*/dev/(sd|nvme|hd)", "write to a raw block device"),
    (r":\(\)\s*\{", "fork bomb"),
    (r"\bchmod\s+(-r\s+)?777\b", "world-writable permissions"),
    (r"\b(curl|wget)\b[^|]*\|\s*(sudo\s+)?(ba|z)?sh\b", "piping a download into a shell"),
];

/// Privileged or host-level commands refused when they appear as whole words.
const BLOCKED_TOKENS: &[&str] = &["sudo", "su", "shutdown", "reboot", "poweroff", "halt"];

const SYSTEM_PATHS: &[&str] = &["/etc", "/boot", "/sys", "/proc", "/dev", "/bin", "/sbin", "/usr"];

/// Shell commands that write to their arguments.
const WRITING_COMMANDS: &[&str] = &["tee", "sed", "chmod", "chown", "ln", "cp", "touch", "truncate"];

const CREDENTIAL_PATHS: &[&str] = &["~/.ssh", "~/.gnupg", "~/.aws", ".env"];

fn blocked_patterns() -> &'static [(Regex, &'static str)] {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        BLOCKED_COMMAND_PATTERNS
            .iter()
            .filter_map(|(pattern, label)| Regex::new(pattern).ok().map(|regex| (regex, *label)))
            .collect()
    })
}

/// Blocks destructive commands and writes to protected locations.
#[derive(Clone, Debug, Default)]
pub struct SafetyVerifier;

#[async_trait]
impl Verifier for SafetyVerifier {
    fn layer(&self) -> VerificationLayer {
        VerificationLayer::Safety
    }

    async fn verify(
        &self,
        operation: &AtomicOperation,
        context: &VerificationContext,
    ) -> VerificationResult {
        check_safety(operation, context)
    }
}

pub fn check_safety(operation: &AtomicOperation, context: &VerificationContext) -> VerificationResult {
    let layer = VerificationLayer::Safety;
    let lowered = operation.user_request.to_lowercase();
    let tokens = lexicon::tokenize(&operation.user_request);
    let mutating = operation.semantics().map_or(true, |semantics| semantics == Semantics::Execute)
        || request_mutates(&tokens, &lowered);

    let mut blocking = Vec::new();
    let mut warnings = Vec::new();

    for (regex, label) in blocked_patterns() {
        if regex.is_match(&lowered) {
            blocking.push(format!("blocked command: {label}"));
        }
    }
    if let Some(token) = lexicon::first_match(&tokens, BLOCKED_TOKENS) {
        blocking.push(format!("blocked command: `{token}` requires elevated or host-level control"));
    }

    for path in touched_protected_paths(&tokens, context) {
        if !mutating {
            continue;
        }
        let issue = format!("modifies protected path `{path}`");
        match context.safety_level {
            SafetyLevel::Permissive => warnings.push(issue),
            SafetyLevel::Standard | SafetyLevel::Strict => blocking.push(issue),
        }
    }
    for path in touched_credential_paths(&tokens) {
        let issue = format!("touches credential material at `{path}`");
        if mutating && context.safety_level == SafetyLevel::Strict {
            blocking.push(issue);
        } else {
            warnings.push(issue);
        }
    }

    let recursive_delete = lexicon::contains_any(&tokens, &["rm", "delete", "remove"])
        && lexicon::contains_any(&tokens, &["-rf", "-fr", "-r", "recursive", "recursively"]);
    if recursive_delete && blocking.is_empty() {
        let issue = "recursive delete".to_string();
        match context.safety_level {
            SafetyLevel::Strict => blocking.push(issue),
            SafetyLevel::Standard | SafetyLevel::Permissive => warnings.push(issue),
        }
    }

    if !blocking.is_empty() {
        return VerificationResult::new(layer, false, 0.0)
            .with_issues(blocking)
            .with_issues(warnings)
            .with_details("operation is unsafe to run");
    }

    let confidence = if warnings.is_empty() { 1.0 } else { 0.6 };
    VerificationResult::pass(layer, confidence)
        .with_issues(warnings)
        .with_details(format!("safety level {:?}", context.safety_level).to_lowercase())
}

/// Whether the request text itself asks for a write, whatever the label says.
fn request_mutates(tokens: &[String], lowered: &str) -> bool {
    lexicon::contains_any(tokens, lexicon::MUTATING_VERBS)
        || lexicon::contains_any(tokens, lexicon::DESTRUCTIVE_VERBS)
        || lexicon::contains_any(tokens, WRITING_COMMANDS)
        || lowered.contains('>')
}

fn touched_protected_paths<'a>(
    tokens: &'a [String],
    context: &'a VerificationContext,
) -> impl Iterator<Item = &'a str> + 'a {
    tokens.iter().map(String::as_str).filter(move |token| {
        SYSTEM_PATHS.iter().any(|prefix| is_under(token, prefix))
            || context.protected_paths.iter().any(|prefix| is_under(token, prefix))
    })
}

fn touched_credential_paths(tokens: &[String]) -> impl Iterator<Item = &str> {
    tokens.iter().map(String::as_str).filter(|token| {
        CREDENTIAL_PATHS
            .iter()
            .any(|prefix| is_under(token, prefix) || token.ends_with(&format!("/{prefix}")))
    })
}

fn is_under(path: &str, prefix: &str) -> bool {
    path == prefix || path.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('/'))
}
