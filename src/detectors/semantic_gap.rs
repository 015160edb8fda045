/// Tools-Poisoning / Semantic-Gap Detector (§4.10)
///
/// LLM-backed judge over `tools/call` traffic. Stores the request event on
/// SEND, pairs it with the matching RECV by `(mcp_tag, id)`, and scores the
/// pair against the tool's declared schema using a fixed four-factor rubric.
use crate::bus::{Detector, Finding, Interest, Severity, SubFinding};
use crate::event::{EventType, MCPEvent, Producer, Task};
use crate::journal::Journal;
use crate::jrpc::Message;
use crate::llm::ChatClient;
use crate::notifier::{Notifier, PushEvent};
use crate::state::SharedSupervisor;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

const SYSTEM_PROMPT: &str = "\
You are a security judge evaluating whether a tool invocation matches its declared purpose.\n\
Score four factors: DomainMatch (0-40, does the call's subject matter match the tool's declared domain), \
OperationMatch (0-35, does the operation performed match what the tool claims to do), \
ArgumentSpecificity (0-15, are the arguments consistent with the tool's declared schema), \
Consistency (0-10, are the response contents consistent with the request).\n\
Hard rules: if the domain clearly does not match, cap the total at 35. If the operation verb and \
object both directly match the tool's declared name, floor the pre-penalty sum at 85. Subtract 10 \
for every hallucinated field mapping you find. Respond with either a single integer 1-100, or a JSON \
object {\"domain_match\":n,\"operation_match\":n,\"argument_specificity\":n,\"consistency\":n,\"total\":n}.";

/// Scoring mode requested of the LLM; "int" is cheaper, "detail" gives a
/// breakdown for the journal's `detail_json` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoringMode {
    Int,
    Detail,
}

#[derive(Debug, Deserialize)]
struct Rubric {
    domain_match: i64,
    operation_match: i64,
    argument_specificity: i64,
    consistency: i64,
    total: i64,
}

fn parse_score(raw: &str, mode: ScoringMode) -> Option<(i64, Vec<SubFinding>)> {
    match mode {
        ScoringMode::Int => raw.trim().parse::<i64>().ok().map(|n| (n.clamp(1, 100), vec![])),
        ScoringMode::Detail => {
            let rubric: Rubric = serde_json::from_str(raw.trim()).ok()?;
            let findings = vec![
                SubFinding {
                    category: "semantic-gap".into(),
                    matched: "domain_match".into(),
                    reason: format!("{}/40", rubric.domain_match),
                },
                SubFinding {
                    category: "semantic-gap".into(),
                    matched: "operation_match".into(),
                    reason: format!("{}/35", rubric.operation_match),
                },
                SubFinding {
                    category: "semantic-gap".into(),
                    matched: "argument_specificity".into(),
                    reason: format!("{}/15", rubric.argument_specificity),
                },
                SubFinding {
                    category: "semantic-gap".into(),
                    matched: "consistency".into(),
                    reason: format!("{}/10", rubric.consistency),
                },
            ];
            Some((rubric.total.clamp(1, 100), findings))
        }
    }
}

fn severity_for(score: i64) -> Severity {
    if score >= 80 {
        Severity::High
    } else if score >= 40 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

/// Safety tier a score derives, per the `(server_name, tool_name)`
/// materialized view the rewriter and `/tools/safety` consult.
fn safety_tier(score: i64) -> &'static str {
    if score >= 80 {
        "action-required"
    } else if score >= 40 {
        "action-recommended"
    } else {
        "safe"
    }
}

fn compose_prompt(tool_schema: Option<&Value>, request: &Message, response: &Message) -> String {
    format!(
        "Declared tool schema: {}\nObserved request: {}\nObserved response: {}",
        tool_schema.map(|v| v.to_string()).unwrap_or_else(|| "unknown".into()),
        request.to_value(),
        response.to_value(),
    )
}

type PendingKey = (String, Value);

pub struct SemanticGapDetector {
    client: Arc<dyn ChatClient>,
    supervisor: SharedSupervisor,
    journal: Journal,
    notifier: Option<Notifier>,
    mode: ScoringMode,
    pending: Mutex<HashMap<PendingKey, Message>>,
}

impl SemanticGapDetector {
    pub fn new(client: Arc<dyn ChatClient>, supervisor: SharedSupervisor, journal: Journal, mode: ScoringMode) -> Self {
        Self {
            client,
            supervisor,
            journal,
            notifier: None,
            mode,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Attach a push notifier so dangerous-tool reclassifications are also
    /// broadcast to connected `/ws` frontends.
    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = Some(notifier);
        self
    }
}

#[async_trait::async_trait]
impl Detector for SemanticGapDetector {
    fn name(&self) -> &str {
        "semantic-gap"
    }

    fn interest(&self) -> Interest {
        Interest {
            event_types: &[EventType::MCP],
            producers: &[Producer::Local, Producer::Remote],
        }
    }

    async fn inspect(&self, event: &MCPEvent) -> anyhow::Result<Option<Finding>> {
        if event.skip_analysis {
            return Ok(None);
        }

        match (&event.message, event.task) {
            (Message::Request(req), Task::Send) if req.method == "tools/call" => {
                let key = (event.mcp_tag.clone(), req.id.clone());
                self.pending.lock().unwrap().insert(key, event.message.clone());
                Ok(None)
            }
            (Message::Response(resp), Task::Recv) => {
                let key = (event.mcp_tag.clone(), resp.id.clone());
                let Some(request) = self.pending.lock().unwrap().remove(&key) else {
                    return Ok(None);
                };
                let Some(tool_name) = request.tool_name() else {
                    return Ok(None);
                };
                let tool = self.supervisor.find_tool_by_server(&event.mcp_tag, tool_name);
                let tool_schema = tool.as_ref().map(|t| &t.input_schema);

                let prompt = compose_prompt(tool_schema, &request, &event.message);
                let raw = self.client.complete(SYSTEM_PROMPT, &prompt).await?;
                let Some((score, sub_findings)) = parse_score(&raw, self.mode) else {
                    return Ok(None);
                };

                let tier = safety_tier(score);
                if score >= 80 {
                    self.supervisor.mark_dangerous(&event.mcp_tag, tool_name, true);
                }
                if let Some(notifier) = &self.notifier {
                    notifier.publish(PushEvent::ToolSafetyUpdated {
                        server_name: event.mcp_tag.clone(),
                        tool_name: tool_name.to_string(),
                        safety: tier.to_string(),
                    });
                }
                if let Some(tool) = tool {
                    let producer = format!("{:?}", Producer::Remote).to_lowercase();
                    if let Err(err) = self
                        .journal
                        .upsert_tool_safety(event.mcp_tag.clone(), producer, tool, Some(tier.to_string()))
                        .await
                    {
                        tracing::warn!(error = %err, "failed to persist derived tool safety tier");
                    }
                }

                Ok(Some(Finding {
                    detector_name: self.name().to_string(),
                    producer: format!("{:?}", Producer::Remote).to_lowercase(),
                    server_name: event.mcp_tag.clone(),
                    severity: severity_for(score),
                    score,
                    sub_findings,
                    raw_event_id: None,
                }))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jrpc::{Request, Response};
    use crate::state::Supervisor;
    use crate::tools::ToolDescriptor;
    use serde_json::json;

    struct FixedScore(&'static str);

    #[async_trait::async_trait]
    impl ChatClient for FixedScore {
        async fn complete(&self, _system_prompt: &str, _user_prompt: &str) -> Result<String, crate::error::LlmError> {
            Ok(self.0.to_string())
        }
    }

    #[tokio::test]
    async fn high_score_populates_dangerous_tool_set() {
        let journal = Journal::open_in_memory().unwrap();
        let supervisor = Supervisor::new();
        supervisor.set_catalog(
            ("app".into(), "srv1".into()),
            vec![ToolDescriptor {
                name: "run_shell".into(),
                title: None,
                description: None,
                input_schema: json!({}),
                annotations: None,
            }],
            None,
        );

        let detector = SemanticGapDetector::new(
            Arc::new(FixedScore("95")),
            supervisor.clone(),
            journal,
            ScoringMode::Int,
        );

        let request = Message::Request(Request {
            jsonrpc: "2.0".into(),
            id: json!(1),
            method: "tools/call".into(),
            params: Some(json!({"name": "run_shell", "arguments": {}})),
        });
        let send_event = MCPEvent::new(Producer::Local, EventType::MCP, "srv1", Task::Send, request);
        assert!(detector.inspect(&send_event).await.unwrap().is_none());

        let response = Message::Response(Response {
            jsonrpc: "2.0".into(),
            id: json!(1),
            result: Some(json!({"ok": true})),
            error: None,
            method: None,
        });
        let recv_event = MCPEvent::new(Producer::Remote, EventType::MCP, "srv1", Task::Recv, response);
        let finding = detector.inspect(&recv_event).await.unwrap().unwrap();

        assert_eq!(finding.severity, Severity::High);
        let dangerous = supervisor.dangerous_for("srv1");
        assert!(dangerous.tools.contains("run_shell"));
        assert!(dangerous.filter_enabled);
    }

    #[test]
    fn parse_int_mode_clamps_to_valid_range() {
        assert_eq!(parse_score("150", ScoringMode::Int).unwrap().0, 100);
        assert_eq!(parse_score("0", ScoringMode::Int).unwrap().0, 1);
        assert_eq!(parse_score("72", ScoringMode::Int).unwrap().0, 72);
    }

    #[test]
    fn parse_detail_mode_extracts_total_and_breakdown() {
        let raw = r#"{"domain_match":35,"operation_match":30,"argument_specificity":12,"consistency":8,"total":85}"#;
        let (score, findings) = parse_score(raw, ScoringMode::Detail).unwrap();
        assert_eq!(score, 85);
        assert_eq!(findings.len(), 4);
    }

    #[test]
    fn severity_tiers_match_thresholds() {
        assert_eq!(severity_for(80), Severity::High);
        assert_eq!(severity_for(79), Severity::Medium);
        assert_eq!(severity_for(39), Severity::Low);
    }

    #[test]
    fn malformed_detail_payload_is_rejected() {
        assert!(parse_score("not json", ScoringMode::Detail).is_none());
    }
}
