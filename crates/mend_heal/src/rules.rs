//! Deterministic fixes for well-understood error categories.
//!
//! Infrastructure categories map to sandbox remediation actions. Manifest,
//! dependency and import-convention categories map to small file edits that
//! are computed locally, without the proposer.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use mend_core::content_hash;
use mend_runner::RemediationAction;

use crate::classifier::{Classification, ErrorCategory};
use crate::error::HealResult;
use crate::patch::make_diff;
use crate::plan::{FileChangeRequest, FixPlan, FixSource};
use crate::store::{validate_relative_path, FileStore};

const PACKAGE_JSON: &str = "package.json";
const REQUIREMENTS_TXT: &str = "requirements.txt";

/// Node built-in modules never belong in package.json.
const NODE_BUILTINS: &[&str] = &[
    "assert", "buffer", "child_process", "crypto", "events", "fs", "http", "https", "net", "os",
    "path", "process", "stream", "url", "util", "zlib",
];

/// Python import names whose distribution is named differently.
const PYTHON_DISTRIBUTIONS: &[(&str, &str)] = &[
    ("yaml", "pyyaml"),
    ("PIL", "pillow"),
    ("cv2", "opencv-python"),
    ("sklearn", "scikit-learn"),
    ("bs4", "beautifulsoup4"),
    ("dotenv", "python-dotenv"),
    ("jwt", "pyjwt"),
];

const CLIENT_HOOKS: &[&str] = &["useState", "useEffect", "useRouter", "useContext", "useReducer"];

/// Drop commas that directly precede `}` or `]`, leaving string literals alone.
fn strip_trailing_commas(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in json.char_indices() {
        if in_string {
            out.push(c);
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            ',' => {
                let rest = json[i + 1..].trim_start();
                if !(rest.starts_with('}') || rest.starts_with(']')) {
                    out.push(c);
                }
            }
            _ => out.push(c),
        }
    }
    out
}

fn lock_path() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([\w./-]*[\w-]+\.lock)\b").ok()).as_ref()
}

/// Computes fixes that need no model.
#[derive(Debug, Clone)]
pub struct RuleFixer {
    preview_port: u16,
}

impl Default for RuleFixer {
    fn default() -> Self {
        Self { preview_port: 3000 }
    }
}

impl RuleFixer {
    pub fn new(preview_port: u16) -> Self {
        Self { preview_port }
    }

    /// A fix for the classified error, or `None` when no rule applies.
    pub fn fix(
        &self,
        classification: &Classification,
        message: &str,
        store: &dyn FileStore,
    ) -> HealResult<Option<FixPlan>> {
        let plan = match classification.category {
            ErrorCategory::PortInUse => {
                let port = classification.details.port.unwrap_or(self.preview_port);
                Some(
                    FixPlan::new(format!("release port {}", port), FixSource::Remediation)
                        .with_action(RemediationAction::ReleasePort { port }),
                )
            }
            ErrorCategory::DiskFull => Some(
                FixPlan::new("clean sandbox caches", FixSource::Remediation)
                    .with_action(RemediationAction::Cleanup),
            ),
            ErrorCategory::StaleLock => self.stale_lock(message, store)?,
            ErrorCategory::ManifestSyntax => self.manifest_syntax(store)?,
            ErrorCategory::MissingModule => match &classification.details.package {
                Some(package) => self.missing_node_package(package, store)?,
                None => None,
            },
            ErrorCategory::MissingPythonModule => match &classification.details.package {
                Some(module) => self.missing_python_package(module, store)?,
                None => None,
            },
            ErrorCategory::ImportConvention => match &classification.details.file {
                Some(file) => self.import_convention(file, message, store)?,
                None => None,
            },
            _ => None,
        };

        if let Some(plan) = &plan {
            debug!(
                category = %classification.category,
                description = %plan.description,
                "Deterministic fix available"
            );
        }
        Ok(plan)
    }

    fn stale_lock(&self, message: &str, store: &dyn FileStore) -> HealResult<Option<FixPlan>> {
        let mut plan = FixPlan::new("remove stale lock", FixSource::Remediation);
        let path = lock_path()
            .and_then(|re| re.captures(message))
            .map(|caps| caps[1].trim_start_matches("./").to_string());

        if let Some(path) = path {
            if validate_relative_path(&path).is_ok() {
                if let Some(content) = store.read(&path)? {
                    plan = plan.with_change(
                        FileChangeRequest::delete(path).with_base_hash(content_hash(&content)),
                    );
                }
            }
        }
        Ok(Some(plan.with_action(RemediationAction::Cleanup)))
    }

    fn manifest_syntax(&self, store: &dyn FileStore) -> HealResult<Option<FixPlan>> {
        let Some(content) = store.read(PACKAGE_JSON)? else {
            return Ok(None);
        };
        if serde_json::from_str::<Value>(&content).is_ok() {
            return Ok(None);
        }
        let repaired = strip_trailing_commas(&content);
        if serde_json::from_str::<Value>(&repaired).is_err() {
            return Ok(None);
        }
        Ok(Some(
            FixPlan::new("remove trailing commas from package.json", FixSource::Rule).with_change(
                FileChangeRequest::replace(PACKAGE_JSON, repaired)
                    .with_base_hash(content_hash(&content)),
            ),
        ))
    }

    fn missing_node_package(
        &self,
        specifier: &str,
        store: &dyn FileStore,
    ) -> HealResult<Option<FixPlan>> {
        let Some(package) = package_name(specifier) else {
            return Ok(None);
        };
        let Some(content) = store.read(PACKAGE_JSON)? else {
            return Ok(None);
        };
        let Ok(mut manifest) = serde_json::from_str::<Value>(&content) else {
            return Ok(None);
        };
        let Some(root) = manifest.as_object_mut() else {
            return Ok(None);
        };

        let declared = ["dependencies", "devDependencies", "peerDependencies"]
            .iter()
            .any(|section| root.get(*section).and_then(|deps| deps.get(&package)).is_some());
        if declared {
            // declared but not installed; a restart reinstalls
            return Ok(None);
        }

        let deps = root
            .entry("dependencies")
            .or_insert_with(|| Value::Object(Default::default()));
        let Some(deps) = deps.as_object_mut() else {
            return Ok(None);
        };
        deps.insert(package.clone(), Value::String("latest".to_string()));

        let updated = format!("{}\n", serde_json::to_string_pretty(&manifest)?);
        Ok(Some(
            FixPlan::new(format!("add {} to dependencies", package), FixSource::Rule).with_change(
                FileChangeRequest::replace(PACKAGE_JSON, updated)
                    .with_base_hash(content_hash(&content)),
            ),
        ))
    }

    fn missing_python_package(
        &self,
        module: &str,
        store: &dyn FileStore,
    ) -> HealResult<Option<FixPlan>> {
        let distribution = PYTHON_DISTRIBUTIONS
            .iter()
            .find(|(import, _)| *import == module)
            .map(|(_, dist)| *dist)
            .unwrap_or(module);

        let existing = store.read(REQUIREMENTS_TXT)?;
        let change = match &existing {
            Some(content) => {
                let listed = content.lines().any(|line| {
                    let name = line
                        .split(|c: char| "=<>~![; ".contains(c))
                        .next()
                        .unwrap_or_default();
                    name.eq_ignore_ascii_case(distribution)
                });
                if listed {
                    return Ok(None);
                }
                let mut updated = content.clone();
                if !updated.is_empty() && !updated.ends_with('\n') {
                    updated.push('\n');
                }
                updated.push_str(distribution);
                updated.push('\n');
                FileChangeRequest::replace(REQUIREMENTS_TXT, updated)
                    .with_base_hash(content_hash(content))
            }
            None => FileChangeRequest::create(REQUIREMENTS_TXT, format!("{}\n", distribution)),
        };

        Ok(Some(
            FixPlan::new(format!("add {} to requirements.txt", distribution), FixSource::Rule)
                .with_change(change),
        ))
    }

    fn import_convention(
        &self,
        file: &str,
        message: &str,
        store: &dyn FileStore,
    ) -> HealResult<Option<FixPlan>> {
        if validate_relative_path(file).is_err() {
            return Ok(None);
        }
        let Some(content) = store.read(file)? else {
            return Ok(None);
        };

        let (updated, description) = if content.contains("'next/router'")
            || content.contains("\"next/router\"")
        {
            (
                content
                    .replace("'next/router'", "'next/navigation'")
                    .replace("\"next/router\"", "\"next/navigation\""),
                "import useRouter from next/navigation",
            )
        } else if CLIENT_HOOKS.iter().any(|hook| message.contains(hook))
            && !content.trim_start().starts_with("\"use client\"")
            && !content.trim_start().starts_with("'use client'")
        {
            (
                format!("\"use client\";\n\n{}", content),
                "mark component as a client component",
            )
        } else {
            return Ok(None);
        };

        Ok(Some(
            FixPlan::new(description, FixSource::Rule).with_change(
                FileChangeRequest::diff(file, make_diff(&content, &updated))
                    .with_base_hash(content_hash(&content)),
            ),
        ))
    }
}

/// npm package name from an import specifier, `None` for relative paths
/// and built-ins.
fn package_name(specifier: &str) -> Option<String> {
    if specifier.starts_with('.') || specifier.starts_with('/') || specifier.starts_with("node:") {
        return None;
    }
    let mut parts = specifier.split('/');
    let first = parts.next()?;
    let name = if first.starts_with('@') {
        format!("{}/{}", first, parts.next()?)
    } else {
        first.to_string()
    };
    if NODE_BUILTINS.contains(&name.as_str()) {
        return None;
    }
    Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{Classifier, ClassifyContext, RuleClassifier};
    use crate::patch::PatchApplier;
    use crate::store::MemoryFileStore;
    use std::sync::Arc;

    fn fix_for(message: &str, context: ClassifyContext, store: &MemoryFileStore) -> Option<FixPlan> {
        let classification = RuleClassifier::new().unwrap().classify(message, &context);
        RuleFixer::default()
            .fix(&classification, message, store)
            .unwrap()
    }

    #[test]
    fn test_port_in_use_releases_port() {
        let plan = fix_for(
            "Error: listen EADDRINUSE: address already in use :::5173",
            ClassifyContext::default(),
            &MemoryFileStore::new(),
        )
        .unwrap();
        assert_eq!(plan.source, FixSource::Remediation);
        assert_eq!(plan.actions, vec![RemediationAction::ReleasePort { port: 5173 }]);
        assert!(plan.changes.is_empty());
    }

    #[test]
    fn test_missing_module_adds_dependency() {
        let store = MemoryFileStore::new().with_file(
            PACKAGE_JSON,
            "{\n  \"name\": \"todo\",\n  \"dependencies\": {\n    \"react\": \"^18.2.0\"\n  }\n}\n",
        );
        let plan = fix_for(
            "Module not found: Can't resolve '@tanstack/react-query/devtools'",
            ClassifyContext::default(),
            &store,
        )
        .unwrap();
        assert_eq!(plan.description, "add @tanstack/react-query to dependencies");

        let store = Arc::new(store);
        let outcome = PatchApplier::new(store.clone()).apply(&plan.changes);
        assert!(outcome.applied);
        let manifest: Value = serde_json::from_str(&store.get(PACKAGE_JSON).unwrap()).unwrap();
        assert_eq!(manifest["dependencies"]["@tanstack/react-query"], "latest");
        assert_eq!(manifest["dependencies"]["react"], "^18.2.0");
    }

    #[test]
    fn test_declared_or_relative_modules_have_no_rule() {
        let store = MemoryFileStore::new()
            .with_file(PACKAGE_JSON, r#"{"dependencies":{"express":"^4.18.0"}}"#);
        assert!(fix_for("Error: Cannot find module 'express'", ClassifyContext::default(), &store).is_none());
        assert!(fix_for("Error: Cannot find module './utils'", ClassifyContext::default(), &store).is_none());
        assert!(fix_for("Error: Cannot find module 'fs'", ClassifyContext::default(), &store).is_none());
    }

    #[test]
    fn test_python_module_uses_distribution_name() {
        let store = MemoryFileStore::new().with_file(REQUIREMENTS_TXT, "fastapi==0.110.0");
        let plan = fix_for(
            "ModuleNotFoundError: No module named 'yaml'",
            ClassifyContext::default(),
            &store,
        )
        .unwrap();
        match &plan.changes[0] {
            FileChangeRequest::Replace { content, .. } => {
                assert_eq!(content, "fastapi==0.110.0\npyyaml\n")
            }
            other => panic!("unexpected change {:?}", other),
        }

        let listed = MemoryFileStore::new().with_file(REQUIREMENTS_TXT, "PyYAML>=6\n");
        assert!(fix_for("ModuleNotFoundError: No module named 'yaml'", ClassifyContext::default(), &listed).is_none());
    }

    #[test]
    fn test_manifest_trailing_comma() {
        let broken = "{\n  \"name\": \"todo\",\n  \"scripts\": {\"dev\": \"next dev\",},\n}\n";
        let store = Arc::new(MemoryFileStore::new().with_file(PACKAGE_JSON, broken));
        let plan = fix_for(
            "npm ERR! code EJSONPARSE",
            ClassifyContext::default(),
            &store,
        )
        .unwrap();
        assert!(PatchApplier::new(store.clone()).apply(&plan.changes).applied);
        let repaired: Value = serde_json::from_str(&store.get(PACKAGE_JSON).unwrap()).unwrap();
        assert_eq!(repaired["scripts"]["dev"], "next dev");
    }

    #[test]
    fn test_trailing_commas_inside_strings_survive() {
        let broken = "{\n  \"description\": \"a,} b,] c\\\",}\",\n  \"files\": [\"x\",],\n}\n";
        let repaired: Value = serde_json::from_str(&strip_trailing_commas(broken)).unwrap();
        assert_eq!(repaired["description"], "a,} b,] c\",}");
        assert_eq!(repaired["files"], serde_json::json!(["x"]));
    }

    #[test]
    fn test_next_router_import() {
        let page = "import { useRouter } from 'next/router';\n\nexport default function Page() {\n  return null;\n}\n";
        let store = Arc::new(MemoryFileStore::new().with_file("app/page.tsx", page));
        let plan = fix_for(
            "Error: NextRouter was not mounted.",
            ClassifyContext::default().with_file("app/page.tsx"),
            &store,
        )
        .unwrap();

        assert!(PatchApplier::new(store.clone()).apply(&plan.changes).applied);
        assert!(store
            .get("app/page.tsx")
            .unwrap()
            .starts_with("import { useRouter } from 'next/navigation';"));
    }

    #[test]
    fn test_use_client_directive() {
        let component = "import { useState } from 'react';\nexport function Counter() {}\n";
        let store = Arc::new(MemoryFileStore::new().with_file("app/counter.tsx", component));
        let plan = fix_for(
            "You're importing a component that needs useState. It only works in a Client Component",
            ClassifyContext::default().with_file("app/counter.tsx"),
            &store,
        )
        .unwrap();

        assert!(PatchApplier::new(store.clone()).apply(&plan.changes).applied);
        assert!(store.get("app/counter.tsx").unwrap().starts_with("\"use client\";\n\n"));
    }

    #[test]
    fn test_stale_lock_deletes_existing_file() {
        let store = MemoryFileStore::new().with_file("yarn.lock", "# lock");
        let plan = fix_for(
            "error An unexpected error occurred: lock file yarn.lock exists and is held",
            ClassifyContext::default(),
            &store,
        )
        .unwrap();
        assert_eq!(plan.changes[0].path(), "yarn.lock");
        assert_eq!(plan.actions, vec![RemediationAction::Cleanup]);
    }

    #[test]
    fn test_runtime_errors_have_no_rule() {
        assert!(fix_for(
            "TypeError: Cannot read properties of undefined (reading 'map')",
            ClassifyContext::default(),
            &MemoryFileStore::new(),
        )
        .is_none());
    }

    #[test]
    fn test_package_name() {
        assert_eq!(package_name("lodash/merge").as_deref(), Some("lodash"));
        assert_eq!(package_name("@scope/pkg/sub").as_deref(), Some("@scope/pkg"));
        assert_eq!(package_name("node:path"), None);
        assert_eq!(package_name("../x"), None);
    }
}
