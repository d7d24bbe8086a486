//! Error message normalization.
//!
//! Volatile details (line numbers, timestamps, UUIDs, absolute paths, memory
//! addresses, build hashes) are replaced by placeholders so that repeated
//! occurrences of the same underlying error share one cache and budget key.

use std::sync::OnceLock;

use regex::Regex;

use mend_core::sha256_hex;

/// Hex characters kept from the SHA-256 of a normalized message.
const HASH_LEN: usize = 16;

const RULES: &[(&str, &str)] = &[
    // ANSI colour codes
    (r"\x1b\[[0-9;]*[A-Za-z]", ""),
    (
        r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}",
        "<uuid>",
    ),
    (
        r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:[.,]\d+)?(?:Z|[+-]\d{2}:?\d{2})?",
        "<ts>",
    ),
    (r"\b\d{1,2}:\d{2}:\d{2}(?:[.,]\d+)?\b", "<time>"),
    // epoch seconds or milliseconds
    (r"\b1[5-9]\d{8}(?:\d{3})?\b", "<ts>"),
    (r"\b0x[0-9a-fA-F]+\b", "<hex>"),
    (
        r#"(^|[\s'"(\[=])(?:[A-Za-z]:\\|/)(?:[^\s:'"()\[\]<>\\/]+[\\/])+"#,
        "${1}<path>/",
    ),
    (r"(\.[A-Za-z]{1,5}):\d+(?::\d+)?", "${1}:<n>"),
    (r"(?i)\b(line|ln|column|col)\s*:?\s*\d+", "${1} <n>"),
    (r"\(\d+,\s*\d+\)", "(<n>,<n>)"),
    // babel and acorn
    (r"\(\d+:\d+\)", "(<n>:<n>)"),
    // webpack puts the position after the module path
    (r"(\.[A-Za-z]{1,5})\s+\d+:\d+\b", "${1} <n>:<n>"),
    (r"\b[0-9a-f]{12,}\b", "<hash>"),
    (r"\s+", " "),
];

/// Compiled normalization pipeline.
pub struct Normalizer {
    rules: Vec<(Regex, &'static str)>,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Normalizer {
    pub fn new() -> Self {
        let rules = RULES
            .iter()
            .filter_map(|(pattern, replacement)| {
                Regex::new(pattern).ok().map(|re| (re, *replacement))
            })
            .collect();
        Self { rules }
    }

    /// Shared process-wide instance.
    pub fn global() -> &'static Normalizer {
        static NORMALIZER: OnceLock<Normalizer> = OnceLock::new();
        NORMALIZER.get_or_init(Normalizer::new)
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn normalize(&self, message: &str) -> String {
        let mut text = message.to_string();
        for (re, replacement) in &self.rules {
            text = re.replace_all(&text, *replacement).into_owned();
        }
        text.trim().to_string()
    }

    pub fn hash(&self, message: &str) -> String {
        let digest = sha256_hex(self.normalize(message).as_bytes());
        digest[..HASH_LEN].to_string()
    }
}

/// Normalized form of an error message.
pub fn normalize(message: &str) -> String {
    Normalizer::global().normalize(message)
}

/// Stable key of an error message: a short hex digest of its normalized form.
pub fn error_hash(message: &str) -> String {
    Normalizer::global().hash(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_rules_compile() {
        assert_eq!(Normalizer::new().rule_count(), RULES.len());
    }

    #[test]
    fn test_line_numbers_collapse() {
        let a = "TypeError: cannot read property 'x' of undefined at line 42";
        let b = "TypeError: cannot read property 'x' of undefined at line 58";
        assert_eq!(error_hash(a), error_hash(b));
        assert_eq!(
            normalize(a),
            "TypeError: cannot read property 'x' of undefined at line <n>"
        );
    }

    #[test]
    fn test_file_positions_collapse() {
        assert_eq!(
            normalize("./src/app/page.tsx:12:5 Type error: x"),
            normalize("./src/app/page.tsx:40:1 Type error: x")
        );
        assert_eq!(
            error_hash("SyntaxError: /app/src/App.js: Unexpected token (42:13)"),
            error_hash("SyntaxError: /app/src/App.js: Unexpected token (58:13)")
        );
        assert_eq!(
            normalize("SyntaxError: /app/src/App.js: Unexpected token (42:13)"),
            "SyntaxError: <path>/App.js: Unexpected token (<n>:<n>)"
        );
        assert_eq!(
            error_hash("ERROR in ./src/App.js 42:13\nModule parse failed"),
            error_hash("ERROR in ./src/App.js 58:13\nModule parse failed")
        );
        assert_eq!(
            normalize("ERROR in ./src/App.js 42:13"),
            "ERROR in ./src/App.js <n>:<n>"
        );
    }

    #[test]
    fn test_timestamps_and_uuids_collapse() {
        let a = "[2024-03-01T10:15:00.123Z] request 6f1c2b3a-1d2e-4f5a-8b9c-0d1e2f3a4b5c failed";
        let b = "[2024-03-02 08:00:01] request 0a0b0c0d-1111-2222-3333-444455556666 failed";
        assert_eq!(error_hash(a), error_hash(b));
        assert_eq!(normalize(a), "[<ts>] request <uuid> failed");
    }

    #[test]
    fn test_absolute_paths_keep_file_name() {
        let a = "Error: Cannot find module '/home/alice/work/todo/node_modules/react/index.js'";
        let b = "Error: Cannot find module '/srv/app/node_modules/react/index.js'";
        assert_eq!(error_hash(a), error_hash(b));
        assert!(normalize(a).ends_with("'<path>/index.js'"));
    }

    #[test]
    fn test_relative_paths_are_kept() {
        assert_eq!(
            normalize("Module not found: Can't resolve 'src/lib/db'"),
            "Module not found: Can't resolve 'src/lib/db'"
        );
    }

    #[test]
    fn test_distinct_errors_differ() {
        assert_ne!(
            error_hash("Cannot find module 'react'"),
            error_hash("Cannot find module 'vue'")
        );
    }

    #[test]
    fn test_hash_shape() {
        let hash = error_hash("boom");
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
