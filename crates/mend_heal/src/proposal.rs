//! The external "propose a fix" capability.
//!
//! The loop treats proposers as opaque: it hands over a [`FixRequest`] and
//! gets back file edits plus token usage. [`CommandProposer`] shells out to
//! a configured program; a [`ProposerRegistry`] picks a proposer per error
//! kind.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use mend_core::ProjectId;

use crate::classifier::ErrorKind;
use crate::error::{HealError, HealResult};
use crate::plan::FileChangeRequest;
use crate::record::ErrorRecord;

/// Content of a file relevant to the error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixRequest {
    pub project_id: ProjectId,
    pub error: ErrorRecord,
    pub files: Vec<SourceFile>,
    /// Upper bound on tokens the proposer may spend
    pub token_budget: u64,
    pub attempt: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    #[serde(default)]
    pub changes: Vec<FileChangeRequest>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl Proposal {
    pub fn new(changes: Vec<FileChangeRequest>) -> Self {
        Self {
            changes,
            ..Self::default()
        }
    }

    pub fn with_usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.input_tokens = input_tokens;
        self.output_tokens = output_tokens;
        self
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Something that can propose file edits for an error.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FixProposer: Send + Sync {
    async fn propose(&self, request: &FixRequest) -> HealResult<Proposal>;
}

/// Proposers by error kind, with an optional fallback.
#[derive(Default, Clone)]
pub struct ProposerRegistry {
    by_kind: HashMap<ErrorKind, Arc<dyn FixProposer>>,
    fallback: Option<Arc<dyn FixProposer>>,
}

impl ProposerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, kind: ErrorKind, proposer: Arc<dyn FixProposer>) -> Self {
        self.by_kind.insert(kind, proposer);
        self
    }

    pub fn with_fallback(mut self, proposer: Arc<dyn FixProposer>) -> Self {
        self.fallback = Some(proposer);
        self
    }

    /// Infrastructure errors never reach a proposer.
    pub fn resolve(&self, kind: ErrorKind) -> Option<Arc<dyn FixProposer>> {
        if kind == ErrorKind::Infrastructure {
            return None;
        }
        self.by_kind
            .get(&kind)
            .cloned()
            .or_else(|| self.fallback.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.by_kind.is_empty() && self.fallback.is_none()
    }
}

/// Rough token estimate for programs that do not report usage.
fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4)
}

/// Runs an external program with the request as JSON on stdin.
///
/// Stdout is either a JSON [`Proposal`] or text made of `### FILE:` blocks
/// and fenced diffs.
#[derive(Debug, Clone)]
pub struct CommandProposer {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandProposer {
    pub fn new(argv: Vec<String>, timeout: Duration) -> HealResult<Self> {
        if argv.is_empty() {
            return Err(HealError::Proposal("empty proposer command".to_string()));
        }
        Ok(Self { argv, timeout })
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    async fn run(&self, input: &str) -> HealResult<String> {
        let mut child = Command::new(&self.argv[0])
            .args(&self.argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HealError::Proposal(format!("failed to spawn {}: {}", self.argv[0], e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input.as_bytes()).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HealError::Proposal(format!(
                "{} exited with {}: {}",
                self.argv[0],
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl FixProposer for CommandProposer {
    async fn propose(&self, request: &FixRequest) -> HealResult<Proposal> {
        let input = serde_json::to_string(request)?;
        debug!(
            project = %request.project_id,
            error_hash = %request.error.hash,
            command = %self.argv[0],
            "Invoking proposer command"
        );

        let stdout = tokio::time::timeout(self.timeout, self.run(&input))
            .await
            .map_err(|_| HealError::Timeout {
                operation: "proposer command".to_string(),
                millis: self.timeout.as_millis() as u64,
            })??;

        let proposal = match serde_json::from_str::<Proposal>(stdout.trim()) {
            Ok(proposal) => proposal,
            Err(_) => Proposal::new(parse_fix_response(&stdout))
                .with_usage(estimate_tokens(&input), estimate_tokens(&stdout)),
        };

        if proposal.changes.is_empty() {
            warn!(project = %request.project_id, "Proposer returned no changes");
        } else {
            info!(
                project = %request.project_id,
                changes = proposal.changes.len(),
                tokens = proposal.total_tokens(),
                "Proposer returned a fix"
            );
        }
        Ok(proposal)
    }
}

enum Block {
    File(String),
    Diff,
    Other,
}

/// Parse a textual fix response into file edits.
///
/// Understands `### FILE: <path>` headings followed by a fenced block with the
/// whole new content, and fenced `diff`/`patch` blocks with `--- a/` and
/// `+++ b/` headers (several files per block are allowed).
pub fn parse_fix_response(text: &str) -> Vec<FileChangeRequest> {
    let mut changes = Vec::new();
    let mut pending_path: Option<String> = None;
    let mut block: Option<(Block, Vec<&str>)> = None;

    for line in text.lines() {
        let trimmed = line.trim_start();

        if let Some((kind, lines)) = block.take() {
            if trimmed.starts_with("```") {
                match kind {
                    Block::File(path) => {
                        let mut content = lines.join("\n");
                        content.push('\n');
                        changes.push(FileChangeRequest::replace(path, content));
                    }
                    Block::Diff => changes.extend(split_diff(&lines)),
                    Block::Other => {}
                }
            } else {
                let mut lines = lines;
                lines.push(line);
                block = Some((kind, lines));
            }
            continue;
        }

        if let Some(rest) = trimmed.strip_prefix("### FILE:") {
            let path = rest.trim().trim_matches('`').trim().trim_start_matches("./");
            pending_path = (!path.is_empty()).then(|| path.to_string());
            continue;
        }

        if let Some(lang) = trimmed.strip_prefix("```") {
            let lang = lang.trim();
            let kind = if lang == "diff" || lang == "patch" {
                Block::Diff
            } else if let Some(path) = pending_path.take() {
                Block::File(path)
            } else {
                Block::Other
            };
            block = Some((kind, Vec::new()));
        }
    }

    changes
}

/// Split a diff block into one change per file.
fn split_diff(lines: &[&str]) -> Vec<FileChangeRequest> {
    let starts: Vec<usize> = (0..lines.len())
        .filter(|&i| {
            lines[i].starts_with("--- ")
                && lines.get(i + 1).is_some_and(|next| next.starts_with("+++ "))
        })
        .collect();

    starts
        .iter()
        .enumerate()
        .filter_map(|(n, &start)| {
            let end = starts.get(n + 1).copied().unwrap_or(lines.len());
            let section = &lines[start..end];
            let old = header_path(section[0], "--- ", "a/");
            let new = header_path(section[1], "+++ ", "b/");

            match (old, new) {
                (Some(old), None) => Some(FileChangeRequest::delete(old)),
                (_, Some(new)) => {
                    let mut diff = section.join("\n");
                    diff.push('\n');
                    Some(FileChangeRequest::diff(new, diff))
                }
                (None, None) => None,
            }
        })
        .collect()
}

/// Path from a `---`/`+++` header, `None` for `/dev/null`.
fn header_path(line: &str, marker: &str, prefix: &str) -> Option<String> {
    let raw = line.strip_prefix(marker)?.split('\t').next()?.trim();
    if raw == "/dev/null" || raw.is_empty() {
        return None;
    }
    Some(raw.strip_prefix(prefix).unwrap_or(raw).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{Classifier, ClassifyContext, RuleClassifier};
    use crate::patch::make_diff;
    use mend_core::ErrorReport;

    #[test]
    fn test_parse_file_blocks() {
        let text = "Here is the fix.\n\n### FILE: src/app/page.tsx\n```tsx\nexport default function Page() {\n  return <main />;\n}\n```\n\n### FILE: `./src/lib/db.ts`\n```ts\nexport const db = {};\n```\n";
        let changes = parse_fix_response(text);

        assert_eq!(changes.len(), 2);
        assert_eq!(
            changes[0],
            FileChangeRequest::replace(
                "src/app/page.tsx",
                "export default function Page() {\n  return <main />;\n}\n"
            )
        );
        assert_eq!(changes[1].path(), "src/lib/db.ts");
    }

    #[test]
    fn test_parse_diff_block_with_two_files() {
        let first = make_diff("a\n", "b\n")
            .replace("--- original", "--- a/x.ts")
            .replace("+++ modified", "+++ b/x.ts");
        let second = make_diff("c\n", "d\n")
            .replace("--- original", "--- a/y.ts")
            .replace("+++ modified", "+++ b/y.ts");
        let text = format!("```diff\n{}{}```\n", first, second);

        let changes = parse_fix_response(&text);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].kind(), "diff");
        assert_eq!(changes[0].path(), "x.ts");
        assert_eq!(changes[1].path(), "y.ts");
        match &changes[0] {
            FileChangeRequest::Diff { diff, .. } => assert_eq!(diff, &first),
            other => panic!("unexpected change {:?}", other),
        }
    }

    #[test]
    fn test_parse_deletion() {
        let text = "```diff\n--- a/old.ts\n+++ /dev/null\n@@ -1 +0,0 @@\n-x\n```";
        assert_eq!(parse_fix_response(text), vec![FileChangeRequest::delete("old.ts")]);
    }

    #[test]
    fn test_unlabelled_blocks_are_ignored() {
        let text = "```bash\nnpm install\n```\n";
        assert!(parse_fix_response(text).is_empty());
    }

    fn request() -> FixRequest {
        let report = ErrorReport::new("todo", "TypeError: x is not a function");
        let classification = RuleClassifier::new()
            .unwrap()
            .classify(&report.message, &ClassifyContext::default());
        FixRequest {
            project_id: report.project_id.clone(),
            error: ErrorRecord::new(&report, "abc".to_string(), classification),
            files: Vec::new(),
            token_budget: 1_000,
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn test_registry_routing() {
        let mut mock = MockFixProposer::new();
        mock.expect_propose()
            .returning(|_| Ok(Proposal::new(vec![FileChangeRequest::create("a", "a")])));
        let registry = ProposerRegistry::new().register(ErrorKind::Runtime, Arc::new(mock));

        let proposer = registry.resolve(ErrorKind::Runtime).unwrap();
        let proposal = proposer.propose(&request()).await.unwrap();
        assert_eq!(proposal.changes.len(), 1);

        assert!(registry.resolve(ErrorKind::Dependency).is_none());
        assert!(registry.resolve(ErrorKind::Infrastructure).is_none());
    }

    #[test]
    fn test_registry_fallback() {
        let registry = ProposerRegistry::new().with_fallback(Arc::new(MockFixProposer::new()));
        assert!(registry.resolve(ErrorKind::Manifest).is_some());
        assert!(registry.resolve(ErrorKind::Infrastructure).is_none());
        assert!(ProposerRegistry::new().is_empty());
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(CommandProposer::new(Vec::new(), Duration::from_secs(1)).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_proposer_parses_stdout() {
        let script = "cat > /dev/null; printf '### FILE: src/a.ts\\n```ts\\nexport {};\\n```\\n'";
        let proposer = CommandProposer::new(
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            Duration::from_secs(10),
        )
        .unwrap();

        let proposal = proposer.propose(&request()).await.unwrap();
        assert_eq!(proposal.changes, vec![FileChangeRequest::replace("src/a.ts", "export {};\n")]);
        assert!(proposal.input_tokens > 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_proposer_failure() {
        let proposer = CommandProposer::new(
            vec!["sh".to_string(), "-c".to_string(), "cat > /dev/null; echo boom >&2; exit 3".to_string()],
            Duration::from_secs(10),
        )
        .unwrap();
        let err = proposer.propose(&request()).await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
