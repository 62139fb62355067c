//! Creates the initial project skeleton.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::agents::{Agent, AgentContext, AgentError, ProjectState};
use crate::llm::decode_json;
use crate::memory::ContextOutcome;
use crate::task::{MicroTask, Task};

/// What the scaffold should look like.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScaffoldPlan {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// `react` or `node`
    pub framework: String,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub dev_dependencies: BTreeMap<String, String>,
}

impl ScaffoldPlan {
    /// Keyword-based plan used when no model is available or its answer is unusable.
    pub fn fallback(prompt: &str) -> Self {
        let lower = prompt.to_lowercase();
        let react = lower.contains("react");
        let mut dependencies = BTreeMap::new();
        let mut dev_dependencies = BTreeMap::new();
        dev_dependencies.insert("typescript".to_string(), "^5.4.0".to_string());
        if react {
            dependencies.insert("react".to_string(), "^18.3.0".to_string());
            dependencies.insert("react-dom".to_string(), "^18.3.0".to_string());
            dev_dependencies.insert("@types/react".to_string(), "^18.3.0".to_string());
            dev_dependencies.insert("@types/react-dom".to_string(), "^18.3.0".to_string());
        }
        Self {
            name: slugify(prompt),
            description: prompt.trim().to_string(),
            framework: if react { "react" } else { "node" }.to_string(),
            dependencies,
            dev_dependencies,
        }
    }

    fn is_react(&self) -> bool {
        self.framework.eq_ignore_ascii_case("react")
    }
}

/// npm-compatible package name derived from free text.
pub fn slugify(text: &str) -> String {
    let mut slug = String::new();
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
        if slug.len() >= 40 {
            break;
        }
    }
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "forgeloop-project".to_string()
    } else {
        slug
    }
}

pub struct ScaffolderAgent;

impl ScaffolderAgent {
    async fn plan(&self, ctx: &AgentContext<'_>) -> ScaffoldPlan {
        let prompt = ctx.task.prompt();
        if !ctx.llm.is_connected().await {
            return ScaffoldPlan::fallback(prompt);
        }
        let request = format!(
            "Plan a minimal TypeScript project for this request:\n\n\"{}\"\n\n\
             Answer with JSON only: {{\"name\": string, \"description\": string, \
             \"framework\": \"react\" | \"node\", \"dependencies\": {{pkg: range}}, \
             \"devDependencies\": {{pkg: range}}}}",
            prompt
        );
        let decoded = match ctx.llm.generate(&request).await {
            Ok(raw) => decode_json::<ScaffoldPlan>(&raw),
            Err(e) => Err(e),
        };
        match decoded {
            Ok(mut plan) => {
                plan.name = slugify(&plan.name);
                plan.dev_dependencies
                    .entry("typescript".to_string())
                    .or_insert_with(|| "^5.4.0".to_string());
                plan
            }
            Err(e) => {
                tracing::warn!("Scaffold plan unusable, using template: {}", e);
                ScaffoldPlan::fallback(prompt)
            }
        }
    }

    fn files(plan: &ScaffoldPlan) -> Vec<(String, String)> {
        let manifest = json!({
            "name": plan.name,
            "version": "0.1.0",
            "private": true,
            "description": plan.description,
            "scripts": {
                "build": "tsc -p tsconfig.json",
                "test": "node --test tests/"
            },
            "dependencies": plan.dependencies,
            "devDependencies": plan.dev_dependencies,
        });
        let manifest = serde_json::to_string_pretty(&manifest).unwrap_or_default();

        let mut files = vec![
            ("package.json".to_string(), manifest),
            ("tsconfig.json".to_string(), tsconfig(plan.is_react())),
            (
                "README.md".to_string(),
                format!(
                    "# {}\n\n{}\n\n## Scripts\n\n- `npm run build`\n- `npm test`\n",
                    plan.name, plan.description
                ),
            ),
            (
                "tests/smoke.test.js".to_string(),
                "const test = require('node:test');\nconst assert = require('node:assert');\n\n\
                 test('smoke', () => {\n  assert.ok(true);\n});\n"
                    .to_string(),
            ),
        ];

        if plan.is_react() {
            files.push((
                "src/App.tsx".to_string(),
                format!(
                    "export default function App() {{\n  return <h1>{}</h1>;\n}}\n",
                    plan.name
                ),
            ));
            files.push(("src/main.tsx".to_string(), react_entry()));
        } else {
            files.push(("src/index.ts".to_string(), node_entry(&plan.name)));
        }
        files
    }
}

/// `tsconfig.json` compiling `src/` into `dist/`.
pub(super) fn tsconfig(react: bool) -> String {
    let mut compiler = json!({
        "target": "ES2020",
        "module": "ESNext",
        "moduleResolution": "node",
        "strict": true,
        "esModuleInterop": true,
        "skipLibCheck": true,
        "outDir": "dist",
        "rootDir": "src"
    });
    if react {
        compiler["jsx"] = json!("react-jsx");
    }
    serde_json::to_string_pretty(&json!({
        "compilerOptions": compiler,
        "include": ["src"]
    }))
    .unwrap_or_default()
}

/// `src/main.tsx` mounting `App` into `#root`.
pub(super) fn react_entry() -> String {
    "import { createRoot } from 'react-dom/client';\nimport App from './App';\n\n\
     const root = document.getElementById('root');\nif (root) {\n  createRoot(root).render(<App />);\n}\n"
        .to_string()
}

pub(super) fn node_entry(name: &str) -> String {
    format!(
        "export function main(): string {{\n  return '{}';\n}}\n\nconsole.log(main());\n",
        name
    )
}

#[async_trait]
impl Agent for ScaffolderAgent {
    fn name(&self) -> &str {
        "ScaffolderAgent"
    }

    fn priority(&self) -> u32 {
        1
    }

    fn can_handle(&self, _task: &Task, state: &ProjectState) -> bool {
        !state.has_package_json()
    }

    async fn execute(&self, ctx: &AgentContext<'_>) -> Result<Vec<MicroTask>, AgentError> {
        let plan = self.plan(ctx).await;
        let micro_tasks: Vec<MicroTask> = Self::files(&plan)
            .into_iter()
            .filter(|(path, _)| !ctx.project_state.has_file(path))
            .map(|(path, content)| MicroTask::file_create(path, content))
            .collect();

        ctx.memory
            .record_context(
                ctx.task.id(),
                "scaffold",
                ContextOutcome::Neutral,
                json!({
                    "framework": plan.framework,
                    "files": micro_tasks.len(),
                    "dependencies": plan.dependencies.len() + plan.dev_dependencies.len(),
                }),
            )
            .await;

        Ok(micro_tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_produces_package_names() {
        assert_eq!(slugify("Create a React Todo App!"), "create-a-react-todo-app");
        assert_eq!(slugify("***"), "forgeloop-project");
    }

    #[test]
    fn fallback_detects_react() {
        let plan = ScaffoldPlan::fallback("a React dashboard");
        assert!(plan.is_react());
        assert!(plan.dependencies.contains_key("react"));

        let plan = ScaffoldPlan::fallback("a CLI that prints primes");
        assert!(!plan.is_react());
        assert!(plan.dependencies.is_empty());
        assert!(plan.dev_dependencies.contains_key("typescript"));
    }

    #[test]
    fn node_scaffold_has_entry_point_and_manifest() {
        let files = ScaffolderAgent::files(&ScaffoldPlan::fallback("prime printer"));
        let paths: Vec<_> = files.iter().map(|(p, _)| p.as_str()).collect();
        assert!(paths.contains(&"package.json"));
        assert!(paths.contains(&"src/index.ts"));
        let manifest: serde_json::Value =
            serde_json::from_str(&files[0].1).expect("manifest is JSON");
        assert_eq!(manifest["scripts"]["build"], "tsc -p tsconfig.json");
    }
}
