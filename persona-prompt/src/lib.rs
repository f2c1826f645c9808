#![deny(missing_docs)]
//! The Prompt Assembler (§4.4): a deterministic, pure function of
//! `(persona, tools, input_data?, credential_hints?)` producing the
//! prompt text handed to a worker in `assign`.
//!
//! Sections are emitted in a fixed order, each omitted when its inputs
//! are absent. The Communication Protocol paragraphs are canonical: a
//! worker's event-detection logic parses them, so their text is pinned
//! byte-for-byte by this crate's tests. Changing them is a breaking
//! change to every deployed worker.

use persona_types::{Persona, ToolDefinition, ToolImplementation};

/// Assemble the full prompt for one execution (§4.4).
pub fn assemble_prompt(
    persona: &Persona,
    tools: &[ToolDefinition],
    input_data: Option<&serde_json::Value>,
    credential_hints: &[String],
) -> String {
    let mut sections = Vec::new();

    sections.push(format!("# {}", persona.name));

    if let Some(structured) = persona
        .structured_prompt
        .as_ref()
        .and_then(|v| v.as_object())
    {
        push_structured_sections(&mut sections, structured, &persona.system_prompt);
    } else {
        sections.push(format!("## Identity\n\n{}", persona.system_prompt));
    }

    if !tools.is_empty() {
        sections.push(render_tools(tools));
    }

    sections.push(EXECUTION_ENVIRONMENT.to_string());

    if !credential_hints.is_empty() {
        sections.push(render_credentials(credential_hints));
    }

    sections.push(COMMUNICATION_PROTOCOLS.to_string());

    if let Some(data) = input_data {
        if let Some(use_case) = data.get("_use_case") {
            sections.push(format!("## Use Case\n\n{}", render_scalar_or_json(use_case)));
        }
        if let Some(time_filter) = data.get("_time_filter") {
            sections.push(format!(
                "## Time Filter\n\n{}",
                render_scalar_or_json(time_filter)
            ));
        }
        sections.push(format!(
            "## Input Data\n\n```json\n{}\n```",
            serde_json::to_string_pretty(data).unwrap_or_default()
        ));
    }

    sections.push(EXECUTE_NOW.to_string());

    sections.join("\n\n")
}

fn render_scalar_or_json(value: &serde_json::Value) -> String {
    match value.as_str() {
        Some(s) => s.to_string(),
        None => value.to_string(),
    }
}

fn push_structured_sections(
    sections: &mut Vec<String>,
    structured: &serde_json::Map<String, serde_json::Value>,
    fallback_system_prompt: &str,
) {
    const FIELDS: [(&str, &str); 7] = [
        ("identity", "Identity"),
        ("instructions", "Instructions"),
        ("tool_guidance", "Tool Guidance"),
        ("examples", "Examples"),
        ("error_handling", "Error Handling"),
        ("custom_sections", "Custom Sections"),
        ("web_search", "Web Search"),
    ];

    match structured.get("identity").and_then(|v| v.as_str()) {
        Some(identity) => sections.push(format!("## Identity\n\n{identity}")),
        None => sections.push(format!("## Identity\n\n{fallback_system_prompt}")),
    }

    for (key, heading) in FIELDS.into_iter().skip(1) {
        if let Some(value) = structured.get(key).and_then(|v| v.as_str()) {
            sections.push(format!("## {heading}\n\n{value}"));
        }
    }
}

fn render_tools(tools: &[ToolDefinition]) -> String {
    let mut out = String::from("## Available Tools\n");
    for tool in tools {
        out.push_str("\n- **");
        out.push_str(&tool.name);
        out.push_str("**");
        if let Some(category) = &tool.category {
            out.push_str(" (");
            out.push_str(category);
            out.push(')');
        }
        out.push_str(": ");
        out.push_str(&tool.description);
        match &tool.implementation {
            ToolImplementation::Guide { text } => {
                out.push_str("\n  - Usage: ");
                out.push_str(text);
            }
            ToolImplementation::Script { path } => {
                out.push_str("\n  - Script: ");
                out.push_str(path);
            }
            _ => {}
        }
        if let Some(schema) = &tool.input_schema {
            out.push_str("\n  - Input schema: ");
            out.push_str(&serde_json::to_string(schema).unwrap_or_default());
        }
        if let Some(requirement) = &tool.credential_requirement {
            out.push_str("\n  - Requires credential: ");
            out.push_str(requirement);
        }
    }
    out
}

fn render_credentials(hints: &[String]) -> String {
    let mut out = String::from("## Available Credentials\n");
    for hint in hints {
        out.push_str("\n- ");
        out.push_str(hint);
    }
    out
}

const EXECUTION_ENVIRONMENT: &str = "## Execution Environment\n\nYou are running inside a sandboxed worker with access to a POSIX shell, curl, jq, and git. Network access is limited to the credentials and connectors made available to you below.";

/// The fixed Communication Protocol paragraphs. Downstream event
/// detection in the worker parses these markers; do not reword them.
pub const COMMUNICATION_PROTOCOLS: &str = "## Communication Protocols\n\nTo send a message to the user, output a line of the form `[user_message] <text>`.\n\nTo perform a named persona action, output a line of the form `[persona_action] <name> <json-args>`.\n\nTo emit a new pending event into the system, output a line of the form `[emit_event] <event_type> <json-payload>`.\n\nTo record a durable memory for future executions, output a line of the form `[agent_memory] <text>`.\n\nTo request a human review before continuing, output a line of the form `[manual_review] <reason>`.\n\nTo mark a distinct phase of your work, output a line of the form `[execution_flow] <phase>`.\n\nTo report your final outcome assessment, output a line of the form `[outcome_assessment] <success|failure> <summary>`.";

const EXECUTE_NOW: &str = "EXECUTE NOW";

#[cfg(test)]
mod tests {
    use super::*;
    use persona_types::{PersonaId, ProjectId, ToolId};

    fn persona_with_prompt(system_prompt: &str, structured: Option<serde_json::Value>) -> Persona {
        Persona {
            id: PersonaId::new("p-1"),
            project_id: ProjectId::default_project(),
            name: "Builder".to_string(),
            system_prompt: system_prompt.to_string(),
            structured_prompt: structured,
            enabled: true,
            max_concurrent: 1,
            timeout_ms: 300_000,
            model_profile: None,
            budget_usd: None,
            max_cost_per_execution_usd: None,
            bound_credentials: vec![],
            bound_tools: vec![],
        }
    }

    #[test]
    fn communication_protocols_text_is_pinned() {
        assert!(COMMUNICATION_PROTOCOLS.starts_with("## Communication Protocols"));
        assert!(COMMUNICATION_PROTOCOLS.contains("[user_message] <text>"));
        assert!(COMMUNICATION_PROTOCOLS.contains("[persona_action] <name> <json-args>"));
        assert!(COMMUNICATION_PROTOCOLS.contains("[emit_event] <event_type> <json-payload>"));
        assert!(COMMUNICATION_PROTOCOLS.contains("[agent_memory] <text>"));
        assert!(COMMUNICATION_PROTOCOLS.contains("[manual_review] <reason>"));
        assert!(COMMUNICATION_PROTOCOLS.contains("[execution_flow] <phase>"));
        assert!(COMMUNICATION_PROTOCOLS.contains("[outcome_assessment] <success|failure> <summary>"));
    }

    #[test]
    fn falls_back_to_system_prompt_when_no_structured_prompt() {
        let persona = persona_with_prompt("be careful and concise", None);
        let prompt = assemble_prompt(&persona, &[], None, &[]);
        assert!(prompt.contains("## Identity\n\nbe careful and concise"));
    }

    #[test]
    fn uses_structured_identity_when_present() {
        let structured = serde_json::json!({"identity": "you are a senior reviewer"});
        let persona = persona_with_prompt("fallback text", Some(structured));
        let prompt = assemble_prompt(&persona, &[], None, &[]);
        assert!(prompt.contains("you are a senior reviewer"));
        assert!(!prompt.contains("fallback text"));
    }

    #[test]
    fn omits_tools_section_when_no_tools_bound() {
        let persona = persona_with_prompt("hi", None);
        let prompt = assemble_prompt(&persona, &[], None, &[]);
        assert!(!prompt.contains("## Available Tools"));
    }

    #[test]
    fn includes_tools_section_when_tools_present() {
        let persona = persona_with_prompt("hi", None);
        let tool = ToolDefinition {
            id: ToolId::new("t-1"),
            name: "grep".to_string(),
            category: Some("search".to_string()),
            description: "search files".to_string(),
            implementation: ToolImplementation::Guide {
                text: "use ripgrep".to_string(),
            },
            input_schema: None,
            credential_requirement: None,
        };
        let prompt = assemble_prompt(&persona, std::slice::from_ref(&tool), None, &[]);
        assert!(prompt.contains("## Available Tools"));
        assert!(prompt.contains("grep"));
        assert!(prompt.contains("use ripgrep"));
    }

    #[test]
    fn omits_credentials_section_when_no_hints() {
        let persona = persona_with_prompt("hi", None);
        let prompt = assemble_prompt(&persona, &[], None, &[]);
        assert!(!prompt.contains("## Available Credentials"));
    }

    #[test]
    fn includes_credentials_section_when_hints_present() {
        let persona = persona_with_prompt("hi", None);
        let prompt = assemble_prompt(&persona, &[], None, &["CONNECTOR_GITHUB".to_string()]);
        assert!(prompt.contains("## Available Credentials"));
        assert!(prompt.contains("CONNECTOR_GITHUB"));
    }

    #[test]
    fn input_data_is_pretty_printed_json() {
        let persona = persona_with_prompt("hi", None);
        let data = serde_json::json!({"foo": "bar"});
        let prompt = assemble_prompt(&persona, &[], Some(&data), &[]);
        assert!(prompt.contains("## Input Data"));
        assert!(prompt.contains("\"foo\": \"bar\""));
    }

    #[test]
    fn use_case_and_time_filter_blocks_are_optional() {
        let persona = persona_with_prompt("hi", None);
        let data = serde_json::json!({"_use_case": "weekly-report", "_time_filter": "last_7_days"});
        let prompt = assemble_prompt(&persona, &[], Some(&data), &[]);
        assert!(prompt.contains("## Use Case\n\nweekly-report"));
        assert!(prompt.contains("## Time Filter\n\nlast_7_days"));

        let persona2 = persona_with_prompt("hi", None);
        let prompt2 = assemble_prompt(&persona2, &[], None, &[]);
        assert!(!prompt2.contains("## Use Case"));
        assert!(!prompt2.contains("## Time Filter"));
    }

    #[test]
    fn ends_with_execute_now() {
        let persona = persona_with_prompt("hi", None);
        let prompt = assemble_prompt(&persona, &[], None, &[]);
        assert!(prompt.ends_with("EXECUTE NOW"));
    }

    #[test]
    fn assembly_is_deterministic() {
        let persona = persona_with_prompt("hi", None);
        let a = assemble_prompt(&persona, &[], None, &[]);
        let b = assemble_prompt(&persona, &[], None, &[]);
        assert_eq!(a, b);
    }
}
