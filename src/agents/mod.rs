//! Agent CLI invocation construction — generalizes
//! `factory::agent_executor::run_task`'s hardcoded `claude --print
//! --dangerously-skip-permissions --output-format stream-json -p <prompt>`
//! build-up to the five agents in spec.md's `selectedAgent` domain. Each
//! still reads its CLI binary name from an env var override the way the
//! teacher reads `CLAUDE_CMD`, and still takes the prompt as its one
//! variable argument; what changes per agent is the flag vocabulary each
//! CLI actually accepts non-interactively.

use crate::task::AgentKind;

/// A constructed command line, ready to become a `Vec<String>` the
/// Sandbox Provider execs in-container, or a `tokio::process::Command`
/// for local (non-sandboxed) testing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl AgentCommand {
    pub fn as_exec_vec(&self) -> Vec<String> {
        let mut out = vec![self.program.clone()];
        out.extend(self.args.iter().cloned());
        out
    }
}

fn env_override(var: &str, default: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| default.to_string())
}

/// Build the command line for `agent` given a `prompt` and optional
/// `model`. Every branch mirrors the teacher's non-interactive,
/// structured-output invocation style: print-and-exit rather than a
/// persistent REPL, streaming JSON where the CLI supports it so the
/// Executor's output parser has a stable shape to key on.
pub fn build_command(agent: AgentKind, prompt: &str, model: Option<&str>) -> AgentCommand {
    match agent {
        AgentKind::Claude => {
            let program = env_override("CLAUDE_CMD", "claude");
            let mut args = vec![
                "--print".to_string(),
                "--dangerously-skip-permissions".to_string(),
                "--output-format".to_string(),
                "stream-json".to_string(),
            ];
            if let Some(model) = model {
                args.push("--model".to_string());
                args.push(model.to_string());
            }
            args.push("-p".to_string());
            args.push(prompt.to_string());
            AgentCommand { program, args }
        }
        AgentKind::Codex => {
            let program = env_override("CODEX_CMD", "codex");
            let mut args = vec!["exec".to_string(), "--json".to_string(), "--skip-git-repo-check".to_string()];
            if let Some(model) = model {
                args.push("--model".to_string());
                args.push(model.to_string());
            }
            args.push(prompt.to_string());
            AgentCommand { program, args }
        }
        AgentKind::Cursor => {
            let program = env_override("CURSOR_AGENT_CMD", "cursor-agent");
            let mut args = vec!["--print".to_string(), "--output-format".to_string(), "stream-json".to_string()];
            if let Some(model) = model {
                args.push("--model".to_string());
                args.push(model.to_string());
            }
            args.push(prompt.to_string());
            AgentCommand { program, args }
        }
        AgentKind::Gemini => {
            let program = env_override("GEMINI_CMD", "gemini");
            let mut args = vec!["--yolo".to_string(), "--output-format".to_string(), "json".to_string()];
            if let Some(model) = model {
                args.push("--model".to_string());
                args.push(model.to_string());
            }
            args.push("--prompt".to_string());
            args.push(prompt.to_string());
            AgentCommand { program, args }
        }
        AgentKind::Opencode => {
            let program = env_override("OPENCODE_CMD", "opencode");
            let mut args = vec!["run".to_string(), "--print-logs".to_string()];
            if let Some(model) = model {
                args.push("--model".to_string());
                args.push(model.to_string());
            }
            args.push(prompt.to_string());
            AgentCommand { program, args }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_default_command_has_no_model_flag() {
        let cmd = build_command(AgentKind::Claude, "do it", None);
        assert_eq!(cmd.program, "claude");
        assert!(!cmd.args.contains(&"--model".to_string()));
        assert_eq!(cmd.args.last(), Some(&"do it".to_string()));
    }

    #[test]
    fn claude_with_model_includes_model_flag() {
        let cmd = build_command(AgentKind::Claude, "do it", Some("opus"));
        let idx = cmd.args.iter().position(|a| a == "--model").unwrap();
        assert_eq!(cmd.args[idx + 1], "opus");
    }

    #[test]
    fn codex_uses_exec_subcommand() {
        let cmd = build_command(AgentKind::Codex, "fix the bug", None);
        assert_eq!(cmd.args[0], "exec");
        assert!(cmd.args.contains(&"fix the bug".to_string()));
    }

    #[test]
    fn as_exec_vec_prepends_program() {
        let cmd = build_command(AgentKind::Gemini, "add tests", None);
        let vec = cmd.as_exec_vec();
        assert_eq!(vec[0], "gemini");
        assert_eq!(vec.len(), cmd.args.len() + 1);
    }

    #[test]
    fn every_agent_kind_produces_a_nonempty_program() {
        for kind in [AgentKind::Claude, AgentKind::Codex, AgentKind::Cursor, AgentKind::Gemini, AgentKind::Opencode] {
            let cmd = build_command(kind, "prompt", None);
            assert!(!cmd.program.is_empty());
        }
    }
}
