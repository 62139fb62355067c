//! Conflict resolution.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::repair::attempts;
use crate::agents::{Agent, AgentContext, AgentError, ProjectState};
use crate::fs_store::sha256_hex;
use crate::llm::decode_json;
use crate::memory::ContextOutcome;
use crate::task::{has_conflict_markers, MicroTask, MicroTaskKind, Task};

/// Merge attempts per file before the agent leaves it alone.
pub const MAX_MERGE_ATTEMPTS: usize = 2;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MergeAnswer {
    resolved_content: String,
}

/// Resolves files left with conflict markers, and adopts files whose
/// content drifted from the checksum the task last recorded.
pub struct MergeAgent;

impl MergeAgent {
    fn conflicted<'s>(task: &Task, state: &'s ProjectState) -> Vec<(&'s String, &'s String)> {
        state
            .files
            .iter()
            .filter(|(path, content)| {
                has_conflict_markers(content)
                    && attempts(task, MicroTaskKind::MergeResolve, path) < MAX_MERGE_ATTEMPTS
            })
            .collect()
    }

    fn diverged<'s>(task: &Task, state: &'s ProjectState) -> Vec<(&'s String, &'s String)> {
        state
            .files
            .iter()
            .filter(|(path, content)| {
                !has_conflict_markers(content)
                    && task
                        .checksums()
                        .get(*path)
                        .is_some_and(|expected| *expected != sha256_hex(content))
                    && attempts(task, MicroTaskKind::MergeResolve, path) < MAX_MERGE_ATTEMPTS
            })
            .collect()
    }

    async fn resolve(ctx: &AgentContext<'_>, path: &str, content: &str) -> String {
        if !ctx.llm.is_connected().await {
            return keep_ours(content);
        }
        let request = format!(
            "The file `{}` contains unresolved merge conflicts:\n\n{}\n\n\
             Merge both sides into working code. Answer with JSON only: \
             {{\"resolvedContent\": string}}",
            path, content
        );
        let decoded = match ctx.llm.generate(&request).await {
            Ok(raw) => decode_json::<MergeAnswer>(&raw),
            Err(e) => Err(e),
        };
        match decoded {
            Ok(answer) if !has_conflict_markers(&answer.resolved_content) => {
                answer.resolved_content
            }
            Ok(_) => {
                tracing::warn!(path, "Model resolution still has conflict markers, keeping ours");
                keep_ours(content)
            }
            Err(e) => {
                tracing::warn!(path, "Model resolution unusable, keeping ours: {}", e);
                keep_ours(content)
            }
        }
    }
}

#[async_trait]
impl Agent for MergeAgent {
    fn name(&self) -> &str {
        "MergeAgent"
    }

    fn priority(&self) -> u32 {
        8
    }

    fn can_handle(&self, task: &Task, state: &ProjectState) -> bool {
        !Self::conflicted(task, state).is_empty() || !Self::diverged(task, state).is_empty()
    }

    async fn execute(&self, ctx: &AgentContext<'_>) -> Result<Vec<MicroTask>, AgentError> {
        let mut micro_tasks = Vec::new();
        let mut conflicts = Vec::new();
        for (path, content) in Self::conflicted(ctx.task, ctx.project_state) {
            let resolved = Self::resolve(ctx, path, content).await;
            micro_tasks.push(MicroTask::merge_resolve(path.as_str(), resolved));
            conflicts.push(path.clone());
        }
        // An external edit wins over the recorded checksum.
        let mut adopted = Vec::new();
        for (path, content) in Self::diverged(ctx.task, ctx.project_state) {
            micro_tasks.push(MicroTask::merge_resolve(path.as_str(), content.as_str()));
            adopted.push(path.clone());
        }
        if micro_tasks.is_empty() {
            return Err(AgentError::MissingState("a conflicted or diverged file".to_string()));
        }

        tracing::info!(
            task_id = %ctx.task.id(),
            conflicts = conflicts.len(),
            adopted = adopted.len(),
            "Merging files"
        );
        ctx.memory
            .record_context(
                ctx.task.id(),
                "merge_resolve",
                ContextOutcome::Neutral,
                json!({ "conflicts": conflicts, "adopted": adopted }),
            )
            .await;
        Ok(micro_tasks)
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Side {
    Outside,
    Ours,
    Base,
    Theirs,
}

/// Resolve every conflict block by keeping our side.
///
/// Handles diff3 output (the `|||||||` base section is dropped). Stray or
/// unterminated markers are removed so the result never carries a marker
/// line.
pub fn keep_ours(content: &str) -> String {
    let mut side = Side::Outside;
    let mut out = String::with_capacity(content.len());
    for line in content.split_inclusive('\n') {
        if line.starts_with("<<<<<<<") {
            side = Side::Ours;
        } else if line.starts_with("|||||||") && side == Side::Ours {
            side = Side::Base;
        } else if line.starts_with("=======") && matches!(side, Side::Ours | Side::Base) {
            side = Side::Theirs;
        } else if line.starts_with(">>>>>>>") {
            side = Side::Outside;
        } else if matches!(side, Side::Outside | Side::Ours) {
            out.push_str(line);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::Path;

    use super::*;
    use crate::fs_store::LocalFileStore;
    use crate::llm::{LlmClient, LlmError, OfflineLlm};
    use crate::memory::InMemoryContextMemory;

    const CONFLICTED: &str = "const a = 1;\n<<<<<<< HEAD\nconst b = 2;\n=======\nconst b = 3;\n>>>>>>> feature\nexport { a, b };\n";

    struct ScriptedLlm(String);

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn generate(&self, _prompt: &str) -> Result<String, LlmError> {
            Ok(self.0.clone())
        }

        async fn is_connected(&self) -> bool {
            true
        }
    }

    fn task() -> Task {
        Task::new("todo app", Path::new("/tmp/p")).expect("task")
    }

    fn state(files: &[(&str, &str)]) -> ProjectState {
        ProjectState {
            files: files
                .iter()
                .map(|(p, c)| (p.to_string(), c.to_string()))
                .collect::<BTreeMap<_, _>>(),
            deps_installed: true,
            ..Default::default()
        }
    }

    async fn run(agent_llm: &dyn LlmClient, task: &Task, state: &ProjectState) -> Vec<MicroTask> {
        let memory = InMemoryContextMemory::new();
        let file_store = LocalFileStore::new();
        let ctx = AgentContext {
            task,
            project_state: state,
            memory: &memory,
            llm: agent_llm,
            file_store: &file_store,
        };
        MergeAgent.execute(&ctx).await.expect("merge")
    }

    #[test]
    fn keep_ours_drops_their_side() {
        assert_eq!(keep_ours(CONFLICTED), "const a = 1;\nconst b = 2;\nexport { a, b };\n");

        let diff3 = "<<<<<<< ours\nx\n||||||| base\ny\n=======\nz\n>>>>>>> theirs\n";
        assert_eq!(keep_ours(diff3), "x\n");

        assert!(!has_conflict_markers(&keep_ours("a\n<<<<<<< HEAD\nb\n")));
        assert_eq!(keep_ours("plain\n"), "plain\n");
    }

    #[tokio::test]
    async fn conflicts_fall_back_to_our_side_offline() {
        let task = task();
        let state = state(&[("src/index.ts", CONFLICTED), ("package.json", "{}")]);
        assert!(MergeAgent.can_handle(&task, &state));

        let micro = run(&OfflineLlm, &task, &state).await;
        assert_eq!(micro.len(), 1);
        assert_eq!(micro[0].kind, MicroTaskKind::MergeResolve);
        assert_eq!(micro[0].path.as_deref(), Some("src/index.ts"));
        assert_eq!(
            micro[0].new_snippet.as_deref(),
            Some("const a = 1;\nconst b = 2;\nexport { a, b };\n")
        );
    }

    #[tokio::test]
    async fn model_resolution_is_used_when_clean() {
        let task = task();
        let state = state(&[("src/index.ts", CONFLICTED)]);

        let clean = ScriptedLlm(r#"{"resolvedContent": "const b = 5;\n"}"#.to_string());
        let micro = run(&clean, &task, &state).await;
        assert_eq!(micro[0].new_snippet.as_deref(), Some("const b = 5;\n"));

        let dirty = ScriptedLlm(
            r#"{"resolvedContent": "<<<<<<< HEAD\nconst b = 5;\n"}"#.to_string(),
        );
        let micro = run(&dirty, &task, &state).await;
        assert_eq!(
            micro[0].new_snippet.as_deref(),
            Some("const a = 1;\nconst b = 2;\nexport { a, b };\n")
        );
    }

    #[tokio::test]
    async fn diverged_file_is_adopted() {
        let mut task = task();
        task.record_checksum("src/index.ts", Some(sha256_hex("old")));
        task.record_checksum("package.json", Some(sha256_hex("{}")));
        let state = state(&[("src/index.ts", "edited"), ("package.json", "{}")]);
        assert!(MergeAgent.can_handle(&task, &state));

        let micro = run(&OfflineLlm, &task, &state).await;
        assert_eq!(micro.len(), 1);
        assert_eq!(micro[0].path.as_deref(), Some("src/index.ts"));
        assert_eq!(micro[0].new_snippet.as_deref(), Some("edited"));
    }

    #[test]
    fn clean_tree_and_exhausted_files_are_ignored() {
        let mut task = task();
        task.record_checksum("package.json", Some(sha256_hex("{}")));
        assert!(!MergeAgent.can_handle(&task, &state(&[("package.json", "{}")])));

        let conflicted = state(&[("src/index.ts", CONFLICTED)]);
        task.push_micro_tasks([
            MicroTask::merge_resolve("src/index.ts", "x"),
            MicroTask::merge_resolve("src/index.ts", "x"),
        ]);
        assert!(!MergeAgent.can_handle(&task, &conflicted));
    }
}
