// Casetrail - core/rules/text.rs
//
// Tokenising `details` strings for the content-matching rules.

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;

/// Words that describe what happened rather than what it happened to.
/// Stripped before comparing two details strings for the same subject.
const ACTION_WORDS: &[&str] = &[
    "created", "create", "deleted", "delete", "removed", "remove", "modified", "modify",
    "installed", "install", "uninstalled", "uninstall", "added", "add", "updated", "update",
    "saved", "save", "restored", "restore", "new", "file", "the", "a", "an", "of", "to",
];

fn token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"[^\s,;:'"()\[\]{}<>|=]+"#).expect("tokens: invalid regex"))
}

/// Lowercase tokens of `details`, in order. Trailing sentence punctuation
/// is dropped so "com.app." and "com.app" compare equal.
pub(crate) fn tokens(details: &str) -> Vec<String> {
    token_regex()
        .find_iter(details)
        .map(|m| m.as_str().trim_end_matches(&['.', '!', '?', '-'][..]).to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// A token that names a concrete artifact: a file name, path, package or
/// identifier, rather than an ordinary word.
fn is_artifact(token: &str) -> bool {
    token.chars().count() >= 3
        && token.contains(|c: char| c == '.' || c == '/' || c == '_' || c == '\\')
}

/// Tokens left after dropping action words.
fn subject(details: &str) -> Vec<String> {
    tokens(details)
        .into_iter()
        .filter(|t| !ACTION_WORDS.contains(&t.as_str()))
        .collect()
}

/// What two details strings have in common, if they plausibly refer to the
/// same artifact: the whole subject when it matches after dropping action
/// words, otherwise the first artifact token of `a` that also appears in `b`.
pub(crate) fn shared_subject(a: &str, b: &str) -> Option<String> {
    let subject_a = subject(a);
    if !subject_a.is_empty() && subject_a == subject(b) {
        return Some(subject_a.join(" "));
    }
    let tokens_b: BTreeSet<String> = tokens(b).into_iter().filter(|t| is_artifact(t)).collect();
    tokens(a)
        .into_iter()
        .filter(|t| is_artifact(t))
        .find(|t| tokens_b.contains(t))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_split_on_punctuation_but_keep_artifacts() {
        assert_eq!(
            tokens("Installed com.suspicious.app, (v2)."),
            vec!["installed", "com.suspicious.app", "v2"]
        );
        assert_eq!(tokens("path=/sdcard/DCIM/a.jpg"), vec!["path", "/sdcard/dcim/a.jpg"]);
    }

    #[test]
    fn test_shared_subject() {
        assert_eq!(
            shared_subject("deleted IMG_0001.jpg", "created IMG_0001.jpg").as_deref(),
            Some("img_0001.jpg")
        );
        assert_eq!(
            shared_subject("Deleted chat history", "Created chat history").as_deref(),
            Some("chat history")
        );
        assert_eq!(
            shared_subject("removed /data/x.db from cache", "restored copy of /data/x.db").as_deref(),
            Some("/data/x.db")
        );
        assert_eq!(shared_subject("deleted photo", "created video"), None);
        assert_eq!(shared_subject("deleted", "created"), None);
    }
}
