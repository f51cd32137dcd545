// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::Path;
use std::sync::Arc;

use klaude_config::{Config, SubAgentModels};
use klaude_model::{create_client, LLMClient};
use klaude_protocol::{LLMConfig, ToolSchema};
use klaude_session::{Session, SessionStore};
use klaude_tools::{
    AskUserQuestionTool, BashTool, CommandSafety, EditTool, GlobTool, GrepTool, ReadTool,
    TodoWriteTool, ToolRegistry, UpdateMemoryTool, WriteTool,
};

use crate::sub_agent::{self, SubAgentTool};

/// The pairing of a session with a model binding, tool registry and config.
/// Owned by the executor; exclusively mutated by the running task.
pub struct Agent {
    pub session: Session,
    pub client: Arc<dyn LLMClient>,
    pub model_cfg: LLMConfig,
    pub registry: Arc<ToolRegistry>,
    pub config: Arc<Config>,
    pub store: Arc<SessionStore>,
    /// Runtime sub-agent model overrides (`ChangeSubAgentModel`).
    pub sub_agent_models: SubAgentModels,
    pub safety: Arc<CommandSafety>,
}

impl Agent {
    pub fn new(
        session: Session,
        model_cfg: LLMConfig,
        config: Arc<Config>,
        store: Arc<SessionStore>,
    ) -> Self {
        let client = create_client(&model_cfg);
        Self::with_client(session, client, model_cfg, config, store)
    }

    /// Construct with an explicit client (tests inject scripted mocks here).
    pub fn with_client(
        session: Session,
        client: Arc<dyn LLMClient>,
        model_cfg: LLMConfig,
        config: Arc<Config>,
        store: Arc<SessionStore>,
    ) -> Self {
        let safety = Arc::new(CommandSafety::new(
            &config.tools.allow_patterns,
            &config.tools.deny_patterns,
        ));
        let registry = Arc::new(build_registry(&config, &session.workdir, None));
        let sub_agent_models = config.models.sub_agents.clone();
        Self {
            session,
            client,
            model_cfg,
            registry,
            config,
            store,
            sub_agent_models,
            safety,
        }
    }

    /// Swap the model binding; the session history is preserved.
    pub fn set_model(&mut self, model_cfg: LLMConfig) {
        self.client = create_client(&model_cfg);
        self.model_cfg = model_cfg;
    }

    /// Replace the session (ClearSession / ResumeSession).
    pub fn replace_session(&mut self, session: Session) {
        self.session = session;
    }

    /// The tool schemas advertised to the model, with sub-agent tools the
    /// current model cannot use filtered out.
    pub fn load_agent_tools(&self) -> Vec<ToolSchema> {
        let model = self.model_cfg.model_name.clone();
        self.registry
            .schemas_filtered(|name| sub_agent::available_for_model(name, &model))
    }
}

/// Build a tool registry.  `subset` restricts to the named tools (used for
/// sub-agent profiles); `None` registers the full main-agent set including
/// the sub-agent tools themselves.
pub(crate) fn build_registry(
    config: &Config,
    workdir: &Path,
    subset: Option<&[&str]>,
) -> ToolRegistry {
    let memory_file = dirs::home_dir()
        .unwrap_or_else(|| workdir.to_path_buf())
        .join(".klaude")
        .join(klaude_session::project_key(workdir))
        .join("MEMORY.md");

    let mut registry = ToolRegistry::new();
    let keep = |name: &str| subset.map_or(true, |s| s.contains(&name));

    if keep("Bash") {
        registry.register(BashTool {
            timeout_secs: config.tools.shell_timeout_secs,
        });
    }
    if keep("Read") {
        registry.register(ReadTool);
    }
    if keep("Write") {
        registry.register(WriteTool);
    }
    if keep("Edit") {
        registry.register(EditTool);
    }
    if keep("Grep") {
        registry.register(GrepTool);
    }
    if keep("Glob") {
        registry.register(GlobTool);
    }
    if keep("TodoWrite") {
        registry.register(TodoWriteTool);
    }
    if keep("AskUserQuestion") {
        registry.register(AskUserQuestionTool);
    }
    if keep("UpdateMemory") {
        registry.register(UpdateMemoryTool { memory_file });
    }
    // Sub-agent tools are main-agent only; profiles never include them, so
    // nesting is bounded by the supervisor's depth check rather than here.
    if subset.is_none() {
        for profile in sub_agent::profiles() {
            registry.register(SubAgentTool::new(profile));
        }
    }
    registry
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn agent_with_model(model_name: &str) -> Agent {
        let workdir = PathBuf::from("/tmp");
        let store = Arc::new(SessionStore::new(
            Some(std::env::temp_dir().join("klaude-agent-tests")),
            &workdir,
        ));
        Agent::new(
            Session::new(workdir),
            LLMConfig::mock(model_name),
            Arc::new(Config::default()),
            store,
        )
    }

    #[test]
    fn main_registry_has_core_and_sub_agent_tools() {
        let agent = agent_with_model("any-model");
        let names: Vec<String> = agent
            .load_agent_tools()
            .into_iter()
            .map(|s| s.name)
            .collect();
        for expected in ["Bash", "Read", "Write", "Edit", "Grep", "Glob", "TodoWrite", "Task", "Explore"] {
            assert!(names.contains(&expected.to_string()), "missing {expected}");
        }
    }

    #[test]
    fn oracle_hidden_for_filtered_models() {
        let agent = agent_with_model("gpt-5-codex");
        let names: Vec<String> = agent
            .load_agent_tools()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert!(!names.contains(&"Oracle".to_string()));
        assert!(names.contains(&"Task".to_string()));
    }

    #[test]
    fn subset_registry_excludes_sub_agent_tools() {
        let registry = build_registry(
            &Config::default(),
            &PathBuf::from("/tmp"),
            Some(&["Read", "Grep"]),
        );
        let names = registry.names();
        assert_eq!(names, vec!["Grep", "Read"]);
    }

    #[test]
    fn set_model_rebinds_client() {
        let mut agent = agent_with_model("first");
        agent.set_model(LLMConfig::mock("second"));
        assert_eq!(agent.model_cfg.model_name, "second");
    }
}
