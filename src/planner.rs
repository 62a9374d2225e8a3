//! Launch planning: validate a batch of launch items and expand each into
//! one plan per requested instance.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::catalog::ToolCatalog;
use crate::error::ValidationError;
use crate::helpers::{resolve_command_path, shell_quote};
use crate::protocol::{LaunchItem, LaunchPlan, EXTERNAL_TOOL_ID};

pub const ENV_SESSION_ID: &str = "AGENT_FLEET_SESSION_ID";
pub const ENV_AGENT_ID: &str = "AGENT_FLEET_AGENT_ID";
pub const ENV_TOOL: &str = "AGENT_FLEET_TOOL";
pub const ENV_EVENT_LOG: &str = "AGENT_FLEET_EVENT_LOG";
pub const ENV_COMMAND_B64: &str = "AGENT_FLEET_COMMAND_B64";

type ExecutableCheck = Arc<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct LaunchPlanner {
    catalog: ToolCatalog,
    executable_exists: ExecutableCheck,
}

impl LaunchPlanner {
    pub fn new(catalog: ToolCatalog) -> Self {
        Self {
            catalog,
            executable_exists: Arc::new(|exe| resolve_command_path(exe).is_some()),
        }
    }

    /// Replace the PATH lookup used to validate tool executables.
    pub fn with_executable_check(
        mut self,
        check: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.executable_exists = Arc::new(check);
        self
    }

    /// Validate every item, then expand. Nothing is returned unless the whole
    /// batch is valid.
    pub fn plan(&self, items: &[LaunchItem]) -> Result<Vec<LaunchPlan>, ValidationError> {
        let mut total: u64 = 0;
        for (index, item) in items.iter().enumerate() {
            self.validate_item(index, item)?;
            total += u64::from(item.count);
        }
        if total == 0 {
            return Err(ValidationError::ZeroInstances);
        }

        let mut plans = Vec::with_capacity(total as usize);
        for item in items {
            plans.extend(self.expand(item));
        }
        Ok(plans)
    }

    fn validate_item(&self, index: usize, item: &LaunchItem) -> Result<(), ValidationError> {
        let tool_id = item.tool_id.trim();
        if tool_id.is_empty() {
            return Err(ValidationError::EmptyToolId { index });
        }
        if tool_id == EXTERNAL_TOOL_ID {
            return Err(ValidationError::NotLaunchable {
                tool: tool_id.to_string(),
            });
        }
        let tool = self
            .catalog
            .get(tool_id)
            .ok_or_else(|| ValidationError::UnknownTool {
                index,
                tool: tool_id.to_string(),
            })?;

        if item.count == 0 {
            return Ok(());
        }
        if !item.directory.is_dir() {
            return Err(ValidationError::DirectoryMissing {
                path: item.directory.clone(),
            });
        }
        let executable = tool.executable().unwrap_or_default();
        if executable.is_empty() || !(self.executable_exists)(&executable) {
            return Err(ValidationError::ExecutableMissing {
                tool: tool.id.clone(),
                executable,
            });
        }
        Ok(())
    }

    fn expand(&self, item: &LaunchItem) -> Vec<LaunchPlan> {
        let Some(tool) = self.catalog.get(item.tool_id.trim()) else {
            return Vec::new();
        };
        let base_name = if item.agent_name.trim().is_empty() {
            tool.display_name.clone()
        } else {
            item.agent_name.trim().to_string()
        };

        (0..item.count)
            .map(|i| {
                let name = if item.count > 1 {
                    format!("{base_name} {}", i + 1)
                } else {
                    base_name.clone()
                };
                LaunchPlan {
                    agent_id: uuid::Uuid::new_v4().to_string(),
                    tool_id: tool.id.clone(),
                    invocation: tool.invocation.clone(),
                    directory: item.directory.clone(),
                    name,
                    role: item.role.clone(),
                    objective: item.objective.clone(),
                    tone: item.tone.clone(),
                    slot: item.start_slot.map(|start| start + i),
                }
            })
            .collect()
    }
}

/// Where the launched windows find the wrapper binary and the event log.
#[derive(Debug, Clone)]
pub struct WrapperInvocation {
    pub executable: PathBuf,
    pub event_log: PathBuf,
}

impl WrapperInvocation {
    pub fn new(executable: impl Into<PathBuf>, event_log: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            event_log: event_log.into(),
        }
    }

    /// Shell command line that runs `plan` under the wrapper inside its directory.
    pub fn command_for(&self, plan: &LaunchPlan, session_id: &str) -> String {
        let exe = path_arg(&self.executable);
        let env = [
            (ENV_SESSION_ID, session_id.to_string()),
            (ENV_AGENT_ID, plan.agent_id.clone()),
            (ENV_TOOL, plan.tool_id.clone()),
            (ENV_EVENT_LOG, path_arg(&self.event_log)),
        ]
        .iter()
        .map(|(key, value)| format!("{key}={}", shell_quote(value)))
        .collect::<Vec<_>>()
        .join(" ");

        format!(
            "cd {dir} && {env} {exe} wrap --tool {tool} --session-id {sid} --agent-id {aid} --command {cmd}",
            dir = shell_quote(&path_arg(&plan.directory)),
            exe = shell_quote(&exe),
            tool = shell_quote(&plan.tool_id),
            sid = shell_quote(session_id),
            aid = shell_quote(&plan.agent_id),
            cmd = shell_quote(&plan.invocation),
        )
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::catalog::test_tool;

    fn planner() -> LaunchPlanner {
        LaunchPlanner::new(ToolCatalog::from_tools(vec![
            test_tool("claude", "claude --resume"),
            test_tool("codex", "codex"),
            test_tool("ghost", "ghost-binary"),
        ]))
        .with_executable_check(|exe| exe != "ghost-binary")
    }

    fn item(tool: &str, dir: &Path, count: u32) -> LaunchItem {
        LaunchItem {
            tool_id: tool.to_string(),
            directory: dir.to_path_buf(),
            count,
            agent_name: "X".into(),
            role: "Builder".into(),
            objective: "ship".into(),
            tone: "blue".into(),
            start_slot: Some(4),
        }
    }

    #[test]
    fn count_three_expands_names_and_slots() {
        let dir = tempfile::tempdir().unwrap();
        let plans = planner().plan(&[item("claude", dir.path(), 3)]).unwrap();
        let names: Vec<_> = plans.iter().map(|p| p.name.as_str()).collect();
        let slots: Vec<_> = plans.iter().map(|p| p.slot).collect();
        assert_eq!(names, vec!["X 1", "X 2", "X 3"]);
        assert_eq!(slots, vec![Some(4), Some(5), Some(6)]);
        let ids: HashSet<_> = plans.iter().map(|p| p.agent_id.clone()).collect();
        assert_eq!(ids.len(), 3);
        assert!(plans.iter().all(|p| p.invocation == "claude --resume"));
    }

    #[test]
    fn single_instance_keeps_plain_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut single = item("codex", dir.path(), 1);
        single.agent_name = String::new();
        single.start_slot = None;
        let plans = planner().plan(&[single]).unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].name, "codex");
        assert_eq!(plans[0].slot, None);
    }

    #[test]
    fn plans_preserve_item_order() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let plans = planner()
            .plan(&[item("claude", a.path(), 2), item("codex", b.path(), 1)])
            .unwrap();
        let tools: Vec<_> = plans.iter().map(|p| p.tool_id.as_str()).collect();
        assert_eq!(tools, vec!["claude", "claude", "codex"]);
        assert_eq!(plans[2].directory, b.path());
    }

    #[test]
    fn missing_directory_rejects_whole_batch() {
        let good = tempfile::tempdir().unwrap();
        let missing = good.path().join("nope");
        let err = planner()
            .plan(&[item("claude", good.path(), 2), item("codex", &missing, 1)])
            .unwrap_err();
        assert_eq!(err, ValidationError::DirectoryMissing { path: missing });
    }

    #[test]
    fn unknown_and_empty_tools_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            planner().plan(&[item("vim", dir.path(), 1)]).unwrap_err(),
            ValidationError::UnknownTool {
                index: 0,
                tool: "vim".into()
            }
        );
        assert_eq!(
            planner().plan(&[item("  ", dir.path(), 1)]).unwrap_err(),
            ValidationError::EmptyToolId { index: 0 }
        );
        assert!(matches!(
            planner().plan(&[item("external", dir.path(), 1)]).unwrap_err(),
            ValidationError::NotLaunchable { .. }
        ));
    }

    #[test]
    fn missing_executable_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = planner().plan(&[item("ghost", dir.path(), 1)]).unwrap_err();
        assert_eq!(
            err,
            ValidationError::ExecutableMissing {
                tool: "ghost".into(),
                executable: "ghost-binary".into()
            }
        );
    }

    #[test]
    fn zero_total_instances_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            planner().plan(&[item("claude", dir.path(), 0)]).unwrap_err(),
            ValidationError::ZeroInstances
        );
        assert_eq!(planner().plan(&[]).unwrap_err(), ValidationError::ZeroInstances);
    }

    #[test]
    fn zero_count_item_is_skipped_when_batch_has_instances() {
        let dir = tempfile::tempdir().unwrap();
        let plans = planner()
            .plan(&[item("claude", dir.path(), 0), item("codex", dir.path(), 2)])
            .unwrap();
        assert_eq!(plans.len(), 2);
    }

    #[test]
    fn wrapped_command_carries_identity() {
        let dir = tempfile::tempdir().unwrap();
        let plan = planner().plan(&[item("claude", dir.path(), 1)]).unwrap().remove(0);
        let wrapper = WrapperInvocation::new("/usr/local/bin/agent-fleet", "/tmp/events.ndjson");
        let command = wrapper.command_for(&plan, "sess-1");

        let words = shlex::split(&command).unwrap();
        assert_eq!(words[0], "cd");
        assert!(words.contains(&"wrap".to_string()));
        assert!(words.contains(&format!("{ENV_SESSION_ID}=sess-1")));
        assert!(words.contains(&format!("{ENV_AGENT_ID}={}", plan.agent_id)));
        let cmd_pos = words.iter().position(|w| w == "--command").unwrap();
        assert_eq!(words[cmd_pos + 1], "claude --resume");
    }
}
