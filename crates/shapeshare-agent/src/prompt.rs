//! System prompt builder for the command translator.

use shapeshare_tools::{TOOLSET_VERSION, ToolRegistry};

const IDENTITY: &str = "You are the drawing assistant of a shared whiteboard. \
You turn the user's instruction into canvas edits by calling the tools provided.";

const RULES: &str = "Rules:
- Coordinates are canvas pixels; (0, 0) is the top-left corner and x, y place a shape's top-left corner.
- Colours may be CSS names such as \"blue\" or hex codes such as \"#3366ff\".
- Use createMultipleShapes for layouts of several related shapes.
- Refer to existing shapes only by the ids listed in the canvas state.
- Never change shapes marked locked.
- If the instruction is unclear or impossible, reply with a short explanation and call no tools.";

/// Build the system prompt: identity, tools, rules, then the canvas state.
pub fn build_system_prompt(tools: &ToolRegistry, canvas_state: &str) -> String {
    let mut parts = Vec::new();

    parts.push(IDENTITY.to_string());

    let now = chrono::Utc::now();
    parts.push(format!("Current time: {}", now.format("%Y-%m-%d %H:%M:%S UTC")));

    let tool_names = tools.list();
    if !tool_names.is_empty() {
        parts.push(format!(
            "Available tools ({TOOLSET_VERSION}): {}",
            tool_names.join(", ")
        ));
    }

    parts.push(RULES.to_string());
    parts.push(format!("--- Current canvas state ---\n{canvas_state}"));

    parts.join("\n\n")
}
