/// ToolDescriptor — as returned by `tools/list`.
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default = "default_input_schema")]
    pub input_schema: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Value>,
}

pub fn default_input_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {}, "required": [] })
}

impl ToolDescriptor {
    pub fn parse_list(tools_value: &Value) -> Vec<ToolDescriptor> {
        tools_value
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|t| serde_json::from_value(t.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}
