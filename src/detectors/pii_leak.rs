/// PII-Leak Detector (§4.9)
///
/// Compiles a built-in rule set plus whatever custom rules the journal's
/// `custom_rules` table holds for this engine, then scans both request
/// arguments and response text/structured content for `tools/call` traffic.
use crate::bus::{Detector, Finding, Interest, Severity, SubFinding};
use crate::event::{EventType, MCPEvent, Producer};
use crate::journal::Journal;
use crate::jrpc::Message;
use serde_json::Value;

const ENGINE_NAME: &str = "pii-leak";

const BUILTIN_RULES: &str = r#"
rule email_address {
    meta:
        category = "PII"
    strings:
        $email = /[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}/
    condition:
        $email
}

rule credit_card_number {
    meta:
        category = "Financial PII"
    strings:
        $visa = /4[0-9]{12}(?:[0-9]{3})?/
        $mastercard = /5[1-5][0-9]{14}/
    condition:
        any of them
}

rule us_ssn {
    meta:
        category = "PII"
    strings:
        $ssn = /[0-9]{3}-[0-9]{2}-[0-9]{4}/
    condition:
        $ssn
}

rule medical_record_number {
    meta:
        category = "Medical PII"
    strings:
        $mrn = /\bMRN[:\s]*[0-9]{6,10}\b/
    condition:
        $mrn
}
"#;

/// Extract the text this detector scans: request `arguments` serialized to a
/// string, or response `content[].text` / `structuredContent` serialized.
fn scan_surface(message: &Message) -> Option<String> {
    match message {
        Message::Request(req) if req.method == "tools/call" => {
            let params = req.params.as_ref()?;
            params.get("arguments").map(|v| v.to_string())
        }
        Message::Response(resp) => {
            let result = resp.result.as_ref()?;
            let mut parts = Vec::new();
            if let Some(content) = result.get("content").and_then(Value::as_array) {
                for c in content {
                    if let Some(text) = c.get("text").and_then(Value::as_str) {
                        parts.push(text.to_string());
                    }
                }
            }
            if let Some(structured) = result.get("structuredContent") {
                parts.push(structured.to_string());
            }
            if parts.is_empty() {
                None
            } else {
                Some(parts.join(" "))
            }
        }
        _ => None,
    }
}

fn category_severity(categories: &[String]) -> Severity {
    if categories
        .iter()
        .any(|c| c == "Financial PII" || c == "Medical PII" || c == "Custom")
    {
        Severity::High
    } else if categories.iter().any(|c| c == "PII") {
        Severity::Medium
    } else {
        Severity::Low
    }
}

fn score_for(severity: Severity, match_count: usize) -> i64 {
    let base = match severity {
        Severity::High | Severity::Critical => 85,
        Severity::Medium => 50,
        Severity::Low => 20,
        Severity::None => 0,
    };
    (base + (match_count as i64 * 5).min(15)).min(100)
}

pub struct PiiLeakDetector {
    journal: Journal,
}

impl PiiLeakDetector {
    pub fn new(journal: Journal) -> Self {
        Self { journal }
    }

    async fn compiled_rules(&self) -> anyhow::Result<yara_x::Rules> {
        let mut compiler = yara_x::Compiler::new();
        compiler.add_source(BUILTIN_RULES)?;
        for rule in self.journal.custom_rules(ENGINE_NAME).await.unwrap_or_default() {
            if let Err(err) = compiler.add_source(rule.rule_content.as_str()) {
                tracing::warn!(rule = rule.rule_name, error = %err, "skipping invalid custom YARA rule");
            }
        }
        Ok(compiler.build())
    }
}

#[async_trait::async_trait]
impl Detector for PiiLeakDetector {
    fn name(&self) -> &str {
        ENGINE_NAME
    }

    fn interest(&self) -> Interest {
        Interest {
            event_types: &[EventType::MCP],
            producers: &[Producer::Local, Producer::Remote],
        }
    }

    async fn inspect(&self, event: &MCPEvent) -> anyhow::Result<Option<Finding>> {
        let Some(text) = scan_surface(&event.message) else {
            return Ok(None);
        };

        let rules = self.compiled_rules().await?;
        let mut scanner = yara_x::Scanner::new(&rules);
        let results = scanner.scan(text.as_bytes())?;

        let mut categories = Vec::new();
        let mut sub_findings = Vec::new();
        for matching_rule in results.matching_rules() {
            let category = matching_rule
                .metadata()
                .into_iter()
                .find(|(k, _)| *k == "category")
                .map(|(_, v)| v.to_string())
                .unwrap_or_else(|| "PII".to_string());
            categories.push(category.clone());
            sub_findings.push(SubFinding {
                category,
                matched: matching_rule.identifier().to_string(),
                reason: "matched YARA rule".into(),
            });
        }

        if sub_findings.is_empty() {
            return Ok(None);
        }

        let severity = category_severity(&categories);
        Ok(Some(Finding {
            detector_name: self.name().to_string(),
            producer: format!("{:?}", event.producer).to_lowercase(),
            server_name: event.mcp_tag.clone(),
            score: score_for(severity, sub_findings.len()),
            severity,
            sub_findings,
            raw_event_id: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_severity_prioritizes_financial_and_medical() {
        assert_eq!(
            category_severity(&["PII".into(), "Financial PII".into()]),
            Severity::High
        );
        assert_eq!(category_severity(&["PII".into()]), Severity::Medium);
        assert_eq!(category_severity(&["Other".into()]), Severity::Low);
    }

    #[test]
    fn score_respects_density_bonus_cap() {
        assert_eq!(score_for(Severity::Medium, 10), 65);
        assert_eq!(score_for(Severity::High, 100), 100);
    }

    #[test]
    fn scan_surface_reads_request_arguments() {
        let req = Message::Request(crate::jrpc::Request {
            jsonrpc: "2.0".into(),
            id: Value::from(1),
            method: "tools/call".into(),
            params: Some(serde_json::json!({"name": "send_email", "arguments": {"to": "a@example.com"}})),
        });
        let text = scan_surface(&req).unwrap();
        assert!(text.contains("a@example.com"));
    }
}
