//! Error classification.
//!
//! [`RuleClassifier`] walks an ordered rule table and returns the first
//! match. Infrastructure rules come first, then manifests, dependencies,
//! framework idioms and generic runtime failures. Anything unmatched is
//! `Unknown`, which is not fixable unless the [`UnknownPolicy`] allows a
//! single proposer-assisted attempt.

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::HealResult;

/// Coarse error family. Drives which fix strategies are allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Ports, network, disk, locks: deterministic remediation only
    Infrastructure,
    /// Broken package manifests
    Manifest,
    /// Missing or conflicting packages
    Dependency,
    /// Application code failing at build or run time
    Runtime,
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Infrastructure => "infrastructure",
            Self::Manifest => "manifest",
            Self::Dependency => "dependency",
            Self::Runtime => "runtime",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Fine-grained category, one per rule family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    PortInUse,
    NetworkUnreachable,
    DiskFull,
    StaleLock,
    ManifestSyntax,
    MissingModule,
    MissingPythonModule,
    IncompatibleDependency,
    ImportConvention,
    UndefinedProperty,
    RuntimeCrash,
    BuildFailure,
    Unknown,
}

impl ErrorCategory {
    pub fn kind(self) -> ErrorKind {
        match self {
            Self::PortInUse | Self::NetworkUnreachable | Self::DiskFull | Self::StaleLock => {
                ErrorKind::Infrastructure
            }
            Self::ManifestSyntax => ErrorKind::Manifest,
            Self::MissingModule | Self::MissingPythonModule | Self::IncompatibleDependency => {
                ErrorKind::Dependency
            }
            Self::ImportConvention
            | Self::UndefinedProperty
            | Self::RuntimeCrash
            | Self::BuildFailure => ErrorKind::Runtime,
            Self::Unknown => ErrorKind::Unknown,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PortInUse => "port_in_use",
            Self::NetworkUnreachable => "network_unreachable",
            Self::DiskFull => "disk_full",
            Self::StaleLock => "stale_lock",
            Self::ManifestSyntax => "manifest_syntax",
            Self::MissingModule => "missing_module",
            Self::MissingPythonModule => "missing_python_module",
            Self::IncompatibleDependency => "incompatible_dependency",
            Self::ImportConvention => "import_convention",
            Self::UndefinedProperty => "undefined_property",
            Self::RuntimeCrash => "runtime_crash",
            Self::BuildFailure => "build_failure",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Values pulled out of the error text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub port: Option<u16>,
    pub package: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub kind: ErrorKind,
    pub category: ErrorCategory,
    pub fixable: bool,
    pub hint: String,
    /// Id of the rule that matched, `None` for unknown errors
    pub rule_id: Option<String>,
    pub details: ErrorDetails,
}

impl Classification {
    pub fn is_unknown(&self) -> bool {
        self.kind == ErrorKind::Unknown
    }
}

/// Extra context supplied with an error report.
#[derive(Debug, Clone, Default)]
pub struct ClassifyContext {
    pub file_path: Option<String>,
    /// e.g. "nextjs", "vite", "fastapi"
    pub framework: Option<String>,
}

impl ClassifyContext {
    pub fn with_file(mut self, path: impl Into<String>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    pub fn with_framework(mut self, framework: impl Into<String>) -> Self {
        self.framework = Some(framework.into());
        self
    }
}

/// What to do with errors no rule recognises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownPolicy {
    #[default]
    Deny,
    AllowOneAttempt,
}

/// Maps raw error text to a taxonomy entry.
pub trait Classifier: Send + Sync {
    fn classify(&self, message: &str, context: &ClassifyContext) -> Classification;
}

/// Declarative description of a classification rule.
#[derive(Debug, Clone)]
pub struct RuleSpec {
    pub id: &'static str,
    pub category: ErrorCategory,
    pub pattern: &'static str,
    pub fixable: bool,
    pub hint: &'static str,
    /// Only applies when the context names one of these frameworks
    pub frameworks: &'static [&'static str],
}

const fn rule(
    id: &'static str,
    category: ErrorCategory,
    pattern: &'static str,
    fixable: bool,
    hint: &'static str,
) -> RuleSpec {
    RuleSpec {
        id,
        category,
        pattern,
        fixable,
        hint,
        frameworks: &[],
    }
}

/// Built-in rules, in match order.
pub const BUILTIN_RULES: &[RuleSpec] = &[
    rule(
        "port_in_use",
        ErrorCategory::PortInUse,
        r"(?i)EADDRINUSE|address already in use|port\s+\d+\s+(?:is\s+)?(?:already\s+)?in\s+use|bind:\s+address",
        true,
        "release the port held by a stale process",
    ),
    rule(
        "disk_full",
        ErrorCategory::DiskFull,
        r"(?i)ENOSPC|no space left on device|disk quota exceeded",
        true,
        "clean caches and temporary files in the sandbox",
    ),
    rule(
        "network_unreachable",
        ErrorCategory::NetworkUnreachable,
        r"(?i)ENOTFOUND|EAI_AGAIN|ENETUNREACH|network is unreachable|getaddrinfo|could not resolve host",
        false,
        "the sandbox cannot reach the network; check its network mode",
    ),
    rule(
        "stale_lock",
        ErrorCategory::StaleLock,
        r"(?i)unable to acquire lock|another process .*lock|lock file .*exists|\.lock\b.*(?:exists|is held|stale)|EEXIST.*\.lock",
        true,
        "remove the stale lock file",
    ),
    rule(
        "manifest_syntax",
        ErrorCategory::ManifestSyntax,
        r"(?i)EJSONPARSE|(?:package\.json|tsconfig\.json|requirements\.txt|pyproject\.toml).*(?:unexpected token|syntax error|parse error|invalid json|failed to parse)|unexpected token .* in json",
        true,
        "repair the manifest syntax",
    ),
    rule(
        "missing_python_module",
        ErrorCategory::MissingPythonModule,
        r"ModuleNotFoundError: No module named '([^'.]+)[^']*'",
        true,
        "add the missing package to requirements.txt",
    ),
    rule(
        "missing_module",
        ErrorCategory::MissingModule,
        r#"(?i)(?:cannot find module|module not found: (?:error: )?can't resolve|cannot find package|failed to resolve import)\s+['"]([^'"]+)['"]"#,
        true,
        "add the missing package to package.json dependencies",
    ),
    rule(
        "incompatible_dependency",
        ErrorCategory::IncompatibleDependency,
        r"(?i)ERESOLVE|conflicting peer dependency|requires a peer of|incompatible version|version solving failed|could not resolve dependency",
        true,
        "align the conflicting package versions",
    ),
    rule(
        "import_convention",
        ErrorCategory::ImportConvention,
        r"(?i)NextRouter was not mounted|next/router.*(?:app directory|app router)|you're importing a component that needs (?:useState|useEffect|useRouter|useContext)|only works in client components",
        true,
        "use the App Router import conventions",
    ),
    rule(
        "undefined_property",
        ErrorCategory::UndefinedProperty,
        r"(?i)cannot read propert(?:y|ies) (?:of|'[^']*' of) (?:undefined|null)|undefined is not an object|is not a function|is not defined",
        true,
        "guard the undefined value or fix the reference",
    ),
    rule(
        "build_failure",
        ErrorCategory::BuildFailure,
        r"(?i)failed to compile|build failed|compilation failed|SyntaxError|error TS\d+|type error:",
        true,
        "fix the code that fails to compile",
    ),
    rule(
        "runtime_crash",
        ErrorCategory::RuntimeCrash,
        r"(?i)unhandled(?: promise)? rejection|uncaught exception|traceback \(most recent call last\)|segmentation fault|panicked at|out of memory|exited with code [1-9]",
        true,
        "fix the crash in application code",
    ),
];

struct CompiledRule {
    spec: RuleSpec,
    pattern: Regex,
}

/// Ordered, first-match-wins rule classifier.
pub struct RuleClassifier {
    rules: Vec<CompiledRule>,
    unknown_policy: UnknownPolicy,
    port: Vec<Regex>,
    file: Regex,
    line: Regex,
}

impl RuleClassifier {
    /// Classifier over the built-in rules.
    pub fn new() -> HealResult<Self> {
        Self::with_rules(BUILTIN_RULES.to_vec())
    }

    pub fn with_rules(specs: Vec<RuleSpec>) -> HealResult<Self> {
        let rules = specs
            .into_iter()
            .map(|spec| {
                Ok(CompiledRule {
                    pattern: Regex::new(spec.pattern)?,
                    spec,
                })
            })
            .collect::<HealResult<Vec<_>>>()?;

        Ok(Self {
            rules,
            unknown_policy: UnknownPolicy::default(),
            port: vec![
                Regex::new(r"(?i)port\s+(\d+)")?,
                Regex::new(r":(\d{4,5})\b")?,
                Regex::new(r"(\d{4,5})\s+(?:is\s+)?(?:already\s+)?in\s+use")?,
            ],
            file: Regex::new(
                r"((?:[\w@.-]+/)*[\w@.-]+\.(?:tsx?|jsx?|mjs|cjs|vue|svelte|py|json|css|scss|html)\b)(?::(\d+))?",
            )?,
            line: Regex::new(r"(?i)\bline\s+(\d+)")?,
        })
    }

    pub fn with_unknown_policy(mut self, policy: UnknownPolicy) -> Self {
        self.unknown_policy = policy;
        self
    }

    pub fn unknown_policy(&self) -> UnknownPolicy {
        self.unknown_policy
    }

    pub fn rule_ids(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.spec.id).collect()
    }

    fn extract_port(&self, message: &str) -> Option<u16> {
        self.port.iter().find_map(|re| {
            re.captures(message)
                .and_then(|caps| caps[1].parse::<u16>().ok())
                .filter(|port| *port >= 1024)
        })
    }

    fn extract_file(&self, message: &str) -> (Option<String>, Option<u32>) {
        match self.file.captures(message) {
            Some(caps) => {
                let file = caps.get(1).map(|m| m.as_str().trim_start_matches("./").to_string());
                let line = caps.get(2).and_then(|m| m.as_str().parse().ok());
                (file, line)
            }
            None => (None, None),
        }
    }

    fn details(
        &self,
        message: &str,
        category: ErrorCategory,
        package: Option<String>,
        context: &ClassifyContext,
    ) -> ErrorDetails {
        let (file, line) = self.extract_file(message);
        let line = line.or_else(|| {
            self.line
                .captures(message)
                .and_then(|caps| caps[1].parse().ok())
        });
        ErrorDetails {
            port: if category == ErrorCategory::PortInUse {
                self.extract_port(message)
            } else {
                None
            },
            package,
            file: context.file_path.clone().or(file),
            line,
        }
    }
}

impl Classifier for RuleClassifier {
    fn classify(&self, message: &str, context: &ClassifyContext) -> Classification {
        let framework = context.framework.as_deref().map(str::to_lowercase);

        for rule in &self.rules {
            if !rule.spec.frameworks.is_empty() {
                match &framework {
                    Some(fw) if rule.spec.frameworks.iter().any(|f| f == fw) => {}
                    _ => continue,
                }
            }
            let Some(caps) = rule.pattern.captures(message) else {
                continue;
            };
            let package = caps.get(1).map(|m| m.as_str().to_string());
            let category = rule.spec.category;
            return Classification {
                kind: category.kind(),
                category,
                fixable: rule.spec.fixable,
                hint: rule.spec.hint.to_string(),
                rule_id: Some(rule.spec.id.to_string()),
                details: self.details(message, category, package, context),
            };
        }

        Classification {
            kind: ErrorKind::Unknown,
            category: ErrorCategory::Unknown,
            fixable: self.unknown_policy == UnknownPolicy::AllowOneAttempt,
            hint: "no rule matched this error".to_string(),
            rule_id: None,
            details: self.details(message, ErrorCategory::Unknown, None, context),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(message: &str) -> Classification {
        RuleClassifier::new()
            .unwrap()
            .classify(message, &ClassifyContext::default())
    }

    #[test]
    fn test_builtin_rules_compile() {
        let classifier = RuleClassifier::new().unwrap();
        assert_eq!(classifier.rule_ids().len(), BUILTIN_RULES.len());
    }

    #[test]
    fn test_port_in_use_extracts_port() {
        let c = classify("Error: listen EADDRINUSE: address already in use :::3000");
        assert_eq!(c.category, ErrorCategory::PortInUse);
        assert_eq!(c.kind, ErrorKind::Infrastructure);
        assert_eq!(c.details.port, Some(3000));
        assert!(c.fixable);
    }

    #[test]
    fn test_missing_node_module() {
        let c = classify("Error: Cannot find module 'express'\nRequire stack:\n- /app/server.js");
        assert_eq!(c.category, ErrorCategory::MissingModule);
        assert_eq!(c.kind, ErrorKind::Dependency);
        assert_eq!(c.details.package.as_deref(), Some("express"));
    }

    #[test]
    fn test_missing_python_module_uses_top_level_package() {
        let c = classify("ModuleNotFoundError: No module named 'sqlalchemy.orm'");
        assert_eq!(c.category, ErrorCategory::MissingPythonModule);
        assert_eq!(c.details.package.as_deref(), Some("sqlalchemy"));
    }

    #[test]
    fn test_manifest_before_generic_syntax_error() {
        let c = classify("npm ERR! code EJSONPARSE\nnpm ERR! JSON.parse Failed to parse json");
        assert_eq!(c.category, ErrorCategory::ManifestSyntax);
    }

    #[test]
    fn test_first_match_wins() {
        // matches both the disk and the crash rule; infrastructure comes first
        let c = classify("ENOSPC: no space left on device; process exited with code 1");
        assert_eq!(c.category, ErrorCategory::DiskFull);
        assert_eq!(c.rule_id.as_deref(), Some("disk_full"));
    }

    #[test]
    fn test_undefined_property_with_file_and_line() {
        let c = classify("TypeError: Cannot read properties of undefined (reading 'map')\n    at TodoList (./src/components/TodoList.tsx:42:18)");
        assert_eq!(c.category, ErrorCategory::UndefinedProperty);
        assert_eq!(c.kind, ErrorKind::Runtime);
        assert_eq!(c.details.file.as_deref(), Some("src/components/TodoList.tsx"));
        assert_eq!(c.details.line, Some(42));
    }

    #[test]
    fn test_import_convention() {
        let c = classify("Error: NextRouter was not mounted.");
        assert_eq!(c.category, ErrorCategory::ImportConvention);
    }

    #[test]
    fn test_network_errors_are_not_fixable() {
        let c = classify("npm ERR! getaddrinfo ENOTFOUND registry.npmjs.org");
        assert_eq!(c.category, ErrorCategory::NetworkUnreachable);
        assert!(!c.fixable);
    }

    #[test]
    fn test_unknown_policy() {
        let message = "the flux capacitor is misaligned";
        let deny = classify(message);
        assert!(deny.is_unknown());
        assert!(!deny.fixable);
        assert!(deny.rule_id.is_none());

        let allow = RuleClassifier::new()
            .unwrap()
            .with_unknown_policy(UnknownPolicy::AllowOneAttempt)
            .classify(message, &ClassifyContext::default());
        assert!(allow.fixable);
    }

    #[test]
    fn test_framework_scoped_rule() {
        let specs = vec![RuleSpec {
            id: "vite_only",
            category: ErrorCategory::BuildFailure,
            pattern: r"pre-transform error",
            fixable: true,
            hint: "vite",
            frameworks: &["vite"],
        }];
        let classifier = RuleClassifier::with_rules(specs).unwrap();
        let message = "[vite] Pre-transform error: x";

        assert!(classifier
            .classify(&message.to_lowercase(), &ClassifyContext::default())
            .is_unknown());
        let c = classifier.classify(
            &message.to_lowercase(),
            &ClassifyContext::default().with_framework("Vite"),
        );
        assert_eq!(c.rule_id.as_deref(), Some("vite_only"));
    }

    #[test]
    fn test_context_file_overrides_extracted() {
        let classifier = RuleClassifier::new().unwrap();
        let c = classifier.classify(
            "SyntaxError: Unexpected token '}'",
            &ClassifyContext::default().with_file("src/app/page.tsx"),
        );
        assert_eq!(c.category, ErrorCategory::BuildFailure);
        assert_eq!(c.details.file.as_deref(), Some("src/app/page.tsx"));
    }
}
