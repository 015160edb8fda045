/// Command-Injection Detector (§4.7)
use crate::bus::{Detector, Finding, Interest, Severity, SubFinding};
use crate::detectors::tool_call_text;
use crate::event::{EventType, MCPEvent, Producer};
use regex::RegexSet;
use std::sync::LazyLock;

static CRITICAL: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"(?i)rm\s+-rf\s+/",
        r"(?i)\beval\(",
        r"(?i)\bexec\(",
        r"\bos\.system\(",
        r"(?i)shell\s*=\s*true",
        r"(?i)\bsudo\s+-s\b",
        r"(?i)chmod\s+\+s\b",
        r"(?i)\bnc\s+-e\b",
        r"(?i)/dev/tcp/",
        r"(?i)curl\s+.*\|\s*sh\b",
    ])
    .expect("critical tier patterns are valid")
});

static HIGH: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"&&\s*\S+\s*&&",
        r"\|\s*\S+\s*\|",
        r"\$\{[A-Za-z_][A-Za-z0-9_]*\}",
        r"\.\./\.\./",
        r"(?i)<script[\s>]",
        r"(?i)onerror\s*=",
        r"(?i)onload\s*=",
    ])
    .expect("high tier patterns are valid")
});

static MEDIUM: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"(?i)\b(bash|sh|zsh|cmd\.exe|powershell)\b",
        r"(?i)\b(mv|cp|rm|chmod|chown|kill)\b",
    ])
    .expect("medium tier patterns are valid")
});

const DANGEROUS_WORDS: &[&str] = &["format", "del /f", "drop table", "truncate table"];

/// Scan one blob of text against all tiers, returning the highest severity
/// hit plus the total count of matches across every tier (used for the
/// score's density bonus).
fn scan(text: &str) -> (Severity, Vec<SubFinding>) {
    let mut findings = Vec::new();

    for idx in CRITICAL.matches(text).iter() {
        findings.push(SubFinding {
            category: "command-injection".into(),
            matched: CRITICAL.patterns()[idx].to_string(),
            reason: "matched critical command-injection pattern".into(),
        });
    }
    for idx in HIGH.matches(text).iter() {
        findings.push(SubFinding {
            category: "command-injection".into(),
            matched: HIGH.patterns()[idx].to_string(),
            reason: "matched high-risk command-injection pattern".into(),
        });
    }
    for idx in MEDIUM.matches(text).iter() {
        findings.push(SubFinding {
            category: "command-injection".into(),
            matched: MEDIUM.patterns()[idx].to_string(),
            reason: "matched shell-interpreter or file-op pattern".into(),
        });
    }
    let mut word_hits = 0;
    let lower = text.to_lowercase();
    for word in DANGEROUS_WORDS {
        if lower.contains(word) {
            word_hits += 1;
            findings.push(SubFinding {
                category: "command-injection".into(),
                matched: word.to_string(),
                reason: "matched dangerous command word".into(),
            });
        }
    }

    let severity = if CRITICAL.matches(text).matched_any() || HIGH.matches(text).matched_any() {
        Severity::High
    } else if MEDIUM.matches(text).matched_any() {
        Severity::Medium
    } else if word_hits > 0 {
        Severity::Low
    } else {
        Severity::None
    };

    (severity, findings)
}

fn score(severity: Severity, finding_count: usize) -> i64 {
    let base = match severity {
        Severity::None => 0,
        Severity::Low => 20,
        Severity::Medium => 50,
        Severity::High | Severity::Critical => 85,
    };
    (base + (finding_count as i64 * 3).min(15)).min(100)
}

pub struct CommandInjectionDetector;

#[async_trait::async_trait]
impl Detector for CommandInjectionDetector {
    fn name(&self) -> &str {
        "command-injection"
    }

    fn interest(&self) -> Interest {
        Interest {
            event_types: &[EventType::MCP],
            producers: &[Producer::Local, Producer::Remote],
        }
    }

    async fn inspect(&self, event: &MCPEvent) -> anyhow::Result<Option<Finding>> {
        let Some(text) = tool_call_text(&event.message) else {
            return Ok(None);
        };
        let (severity, sub_findings) = scan(&text);
        if severity == Severity::None {
            return Ok(None);
        }
        Ok(Some(Finding {
            detector_name: self.name().to_string(),
            producer: format!("{:?}", event.producer).to_lowercase(),
            server_name: event.mcp_tag.clone(),
            score: score(severity, sub_findings.len()),
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
    fn critical_pattern_collapses_to_high() {
        let (severity, findings) = scan("tools/call run_shell {\"cmd\": \"rm -rf /\"}");
        assert_eq!(severity, Severity::High);
        assert!(!findings.is_empty());
    }

    #[test]
    fn benign_text_is_none() {
        let (severity, findings) = scan("tools/call read_file {\"path\": \"notes.txt\"}");
        assert_eq!(severity, Severity::None);
        assert!(findings.is_empty());
    }

    #[test]
    fn score_caps_at_100() {
        assert_eq!(score(Severity::High, 50), 100);
    }

    #[test]
    fn medium_tier_shell_word_scores_50_plus_density() {
        let (severity, findings) = scan("tools/call run {\"cmd\": \"bash -c ls\"}");
        assert_eq!(severity, Severity::Medium);
        assert_eq!(score(severity, findings.len()), 50 + (findings.len() as i64 * 3).min(15));
    }
}
