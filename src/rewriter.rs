/// Tool-Schema Rewriter (§4.1)
///
/// A pure, total, deterministic function over a tool list plus the current
/// DangerousToolSet for that server. Used at two sites: the STDIO proxy's
/// pre-init reply path, and the SSE/HTTP live `tools/list` interception.
/// Rewriting is output-only — it never mutates the ToolsCatalog, which
/// always holds the originals (data-model invariant (c)).
use crate::tools::{default_input_schema, ToolDescriptor};
use std::collections::HashSet;

/// The glyph prefixed to every surviving tool's description.
pub const LOCK_GLYPH: &str = "🔒 ";

/// The argument name injected into every tool's input schema. The upstream
/// source alternates between `tool_call_reason` and `user_intent` across
/// transports; this implementation standardizes on `tool_call_reason`
/// everywhere (see DESIGN.md, Open Question (a)).
pub const TOOL_CALL_REASON_ARG: &str = "tool_call_reason";

/// Rewrite `tools`, dropping any tool in `dangerous` when `filter_enabled`
/// is set, and injecting the `tool_call_reason` argument plus a lock-glyph
/// description prefix into every survivor.
pub fn rewrite_tools(
    tools: &[ToolDescriptor],
    dangerous: &HashSet<String>,
    filter_enabled: bool,
) -> Vec<ToolDescriptor> {
    tools
        .iter()
        .filter(|t| !(filter_enabled && dangerous.contains(&t.name)))
        .map(rewrite_one)
        .collect()
}

fn rewrite_one(tool: &ToolDescriptor) -> ToolDescriptor {
    let mut schema = if tool.input_schema.is_object() {
        tool.input_schema.clone()
    } else {
        default_input_schema()
    };

    if schema.get("type").is_none() {
        schema["type"] = "object".into();
    }
    if schema.get("properties").is_none() {
        schema["properties"] = serde_json::json!({});
    }
    if schema.get("required").is_none() {
        schema["required"] = serde_json::json!([]);
    }

    schema["properties"][TOOL_CALL_REASON_ARG] = serde_json::json!({
        "type": "string",
        "description": "Explain the reasoning and context for why you are calling this tool.",
    });

    let required = schema["required"].as_array_mut().expect("required is an array");
    if !required
        .iter()
        .any(|v| v.as_str() == Some(TOOL_CALL_REASON_ARG))
    {
        required.push(TOOL_CALL_REASON_ARG.into());
    }

    let description = tool.description.as_ref().map(|d| {
        if d.starts_with(LOCK_GLYPH) {
            d.clone()
        } else {
            format!("{LOCK_GLYPH}{d}")
        }
    });

    ToolDescriptor {
        name: tool.name.clone(),
        title: tool.title.clone(),
        description,
        input_schema: schema,
        annotations: tool.annotations.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(name: &str, description: Option<&str>) -> ToolDescriptor {
        ToolDescriptor {
            name: name.to_string(),
            title: None,
            description: description.map(|s| s.to_string()),
            input_schema: default_input_schema(),
            annotations: None,
        }
    }

    #[test]
    fn injects_tool_call_reason_and_lock_glyph() {
        let tools = vec![tool("read_file", Some("Reads a file"))];
        let out = rewrite_tools(&tools, &HashSet::new(), false);
        assert_eq!(out.len(), 1);
        let t = &out[0];
        assert!(t.description.as_deref().unwrap().starts_with(LOCK_GLYPH));
        assert_eq!(
            t.input_schema["properties"]["tool_call_reason"]["type"],
            "string"
        );
        let required = t.input_schema["required"].as_array().unwrap();
        assert_eq!(
            required.iter().filter(|v| v.as_str() == Some("tool_call_reason")).count(),
            1
        );
    }

    #[test]
    fn drops_dangerous_tool_only_when_filter_enabled() {
        let tools = vec![tool("read_file", None), tool("run_shell", None)];
        let mut dangerous = HashSet::new();
        dangerous.insert("run_shell".to_string());

        let filtered = rewrite_tools(&tools, &dangerous, true);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].name, "read_file");

        let unfiltered = rewrite_tools(&tools, &dangerous, false);
        assert_eq!(unfiltered.len(), 2);
    }

    #[test]
    fn preserves_existing_required_entries_and_order() {
        let mut t = tool("write_file", None);
        t.input_schema = serde_json::json!({
            "type": "object",
            "properties": {"path": {"type": "string"}},
            "required": ["path"],
        });
        let out = rewrite_tools(&[t], &HashSet::new(), false);
        let required = out[0].input_schema["required"].as_array().unwrap();
        assert_eq!(required[0], "path");
        assert_eq!(required[1], "tool_call_reason");
    }

    #[test]
    fn rewriting_is_idempotent() {
        let tools = vec![tool("read_file", Some("Reads a file"))];
        let once = rewrite_tools(&tools, &HashSet::new(), false);
        let twice = rewrite_tools(&once, &HashSet::new(), false);
        assert_eq!(
            serde_json::to_value(&once).unwrap(),
            serde_json::to_value(&twice).unwrap()
        );
    }

    #[test]
    fn defaults_missing_input_schema() {
        let mut t = tool("noop", None);
        t.input_schema = serde_json::Value::Null;
        let out = rewrite_tools(&[t], &HashSet::new(), false);
        assert_eq!(out[0].input_schema["type"], "object");
        assert!(out[0].input_schema["properties"]["tool_call_reason"].is_object());
    }
}
