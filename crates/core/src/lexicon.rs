//! Keyword sets shared by the keyword classifier and the deterministic
//! verification layers. Matching is on whole lowercase tokens.

pub const MUTATION_NOUNS: &[&str] = &["save", "write", "create", "update", "add", "note", "scene"];

pub const PROCESS_VERBS: &[&str] =
    &["run", "start", "stop", "kill", "restart", "install", "build", "push"];

pub const MACHINE_KEYWORDS: &[&str] = &["json", "csv", "parse", "pytest", "test", "build", "docker"];

pub const QUERY_VERBS: &[&str] = &["show", "list", "get", "what", "display", "status", "check"];

pub const MUTATING_VERBS: &[&str] = &[
    "save", "write", "create", "update", "add", "delete", "remove", "rm", "run", "start", "stop",
    "kill", "restart", "install", "uninstall", "build", "push", "move", "mv", "rename", "copy",
    "modify", "edit", "execute", "launch", "deploy", "overwrite", "append",
];

pub const DESTRUCTIVE_VERBS: &[&str] = &[
    "delete", "remove", "rm", "kill", "drop", "truncate", "overwrite", "wipe", "erase", "purge",
    "uninstall", "format", "shred", "reset",
];

pub const BROAD_SCOPE_MARKERS: &[&str] = &["all", "every", "everything", "*", "-r", "-rf", "recursive", "recursively"];

pub const INTERROGATIVES: &[&str] = &["what", "why", "how", "when", "where", "which", "who"];

/// Verbs that mark a clause as a standalone action when splitting on "and".
pub const ACTION_VERBS: &[&str] = &[
    "show", "display", "list", "get", "find", "search", "create", "make", "add", "write", "save",
    "run", "execute", "start", "stop", "kill", "delete", "remove", "update", "modify", "install",
    "open", "close", "restart",
];

/// Lowercases and splits on anything that is not part of a word, path or flag.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut sanitized = String::with_capacity(text.len());
    for character in text.chars() {
        if character.is_alphanumeric() || matches!(character, '_' | '-' | '.' | '/' | '~' | '*') {
            sanitized.extend(character.to_lowercase());
        } else {
            sanitized.push(' ');
        }
    }
    sanitized
        .split_whitespace()
        .map(|token| token.trim_end_matches('.').to_string())
        .filter(|token| !token.is_empty())
        .collect()
}

pub fn contains_any(tokens: &[String], keywords: &[&str]) -> bool {
    first_match(tokens, keywords).is_some()
}

pub fn first_match<'a>(tokens: &[String], keywords: &[&'a str]) -> Option<&'a str> {
    keywords.iter().copied().find(|keyword| tokens.iter().any(|token| token == keyword))
}

pub fn all_matches<'a>(tokens: &[String], keywords: &[&'a str]) -> Vec<&'a str> {
    keywords.iter().copied().filter(|keyword| tokens.iter().any(|token| token == keyword)).collect()
}

#[cfg(test)]
mod tests {
    use super::{all_matches, contains_any, first_match, tokenize, MUTATING_VERBS, QUERY_VERBS};

    #[test]
    fn tokenize_keeps_paths_and_flags() {
        let tokens = tokenize("Delete ~/notes/todo.txt with rm -rf, please.");

        assert_eq!(tokens, vec!["delete", "~/notes/todo.txt", "with", "rm", "-rf", "please"]);
    }

    #[test]
    fn matching_is_on_whole_tokens() {
        let tokens = tokenize("showcase the startup");

        assert!(!contains_any(&tokens, QUERY_VERBS));
        assert!(!contains_any(&tokens, MUTATING_VERBS));
        assert_eq!(first_match(&tokenize("please list it"), QUERY_VERBS), Some("list"));
    }

    #[test]
    fn all_matches_preserves_keyword_order() {
        let tokens = tokenize("kill the job then delete its logs");

        assert_eq!(all_matches(&tokens, &["delete", "kill"]), vec!["delete", "kill"]);
    }
}
