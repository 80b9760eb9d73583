// System prompt assembly

use crate::llm::RESPONSE_FORMAT;
use crate::sandbox::{MountSpec, Permission};
use crate::tools::ToolDefinition;

/// Interaction rules shared by every bot.
pub fn base_prompt() -> String {
    format!(
        "You have access to a shell session for executing commands.

Your task is to complete the given objective using the available shell commands.

RESPONSE FORMAT (required for every response):
{RESPONSE_FORMAT}

IMPORTANT RULES:
- \"task_done\" is MANDATORY in every response
- After each command, you will receive its exit code and output
- When the task is complete, set task_done=true, command=null and provide the result
- You cannot ask for clarification once the task begins
- Commands must be non-interactive

The system will execute your commands and return their output for the next iteration."
    )
}

fn mount_section(mount: &MountSpec) -> String {
    let access = match mount.permission {
        Permission::ReadOnly => "Read-only (changes you make are discarded and never reach the original files)",
        Permission::ReadWrite => "Read-write (changes are written to the original files)",
    };
    format!(
        "MOUNTED DIRECTORY:\n- Location: {target}\n- Access: {access}\n- Usage: Access files using {target}/<file> or cd {target}",
        target = mount.target,
    )
}

fn tools_section(tools: &[ToolDefinition]) -> Option<String> {
    let entries: Vec<String> = tools
        .iter()
        .filter(|t| !t.usage_instructions.trim().is_empty() || !t.description.trim().is_empty())
        .map(|t| {
            let mut entry = format!("## {}", t.name);
            if !t.description.trim().is_empty() {
                entry.push('\n');
                entry.push_str(t.description.trim());
            }
            if !t.usage_instructions.trim().is_empty() {
                entry.push('\n');
                entry.push_str(t.usage_instructions.trim());
            }
            entry
        })
        .collect();
    if entries.is_empty() {
        None
    } else {
        Some(format!("AVAILABLE TOOLS:\n{}", entries.join("\n\n")))
    }
}

/// Full system prompt: base rules, bot role, mount and tool instructions.
pub fn build_system_prompt(role: &str, mount: Option<&MountSpec>, tools: &[ToolDefinition]) -> String {
    let mut sections = vec![base_prompt()];
    if !role.trim().is_empty() {
        sections.push(role.trim().to_string());
    }
    if let Some(mount) = mount {
        sections.push(mount_section(mount));
    }
    if let Some(tools) = tools_section(tools) {
        sections.push(tools);
    }
    sections.join("\n\n")
}
