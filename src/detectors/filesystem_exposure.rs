/// File-System-Exposure Detector (§4.8)
use crate::bus::{Detector, Finding, Interest, Severity, SubFinding};
use crate::detectors::walk_leaves;
use crate::event::{EventType, MCPEvent, Producer};
use crate::jrpc::Message;
use regex::Regex;
use std::sync::LazyLock;

const PATH_LIKE_KEYS: &[&str] = &[
    "path", "file", "filename", "dir", "directory", "folder", "location", "source",
    "destination", "target", "url", "uri", "endpoint",
];

static SYSTEM_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(/etc/|/root/|/sys/|/proc/|/boot/|[A-Z]:\\windows\\|[A-Z]:\\system32\\)")
        .expect("system path pattern is valid")
});

static SYSTEM_KEYWORD_CRITICAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(passwd|shadow|sam\b|ssh/id_|\.aws/credentials)").expect("valid"));
static SYSTEM_KEYWORD_HIGH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\.env\b|\.git/config|private[_-]?key)").expect("valid"));
static SYSTEM_KEYWORD_MEDIUM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(config\.|\.ini\b|\.conf\b)").expect("valid"));

static DANGEROUS_EXT_CRITICAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\.(pem|key|p12|pfx)$").expect("valid"));
static DANGEROUS_EXT_HIGH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\.(sh|exe|dll|so|bat|ps1)$").expect("valid"));
static DANGEROUS_EXT_MEDIUM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\.(log|bak|sqlite3?|db)$").expect("valid"));

static TRAVERSAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\.\./|%2e%2e%2f|%252e%252e%252f|\.\.%2f)").expect("valid"));

fn is_path_like_key(path: &str) -> bool {
    let leaf = path.rsplit(['.', '[']).next().unwrap_or(path);
    let leaf = leaf.trim_end_matches(']');
    PATH_LIKE_KEYS.iter().any(|k| leaf.eq_ignore_ascii_case(k))
}

fn score_candidate(value: &str) -> (i64, Vec<SubFinding>) {
    let mut score = 0i64;
    let mut findings = Vec::new();

    if SYSTEM_PATH.is_match(value) {
        score += 50;
        findings.push(SubFinding {
            category: "filesystem-exposure".into(),
            matched: value.to_string(),
            reason: "matched a critical system path prefix".into(),
        });
    }
    if SYSTEM_KEYWORD_CRITICAL.is_match(value) {
        score += 40;
        findings.push(SubFinding {
            category: "filesystem-exposure".into(),
            matched: value.to_string(),
            reason: "matched a critical system keyword".into(),
        });
    } else if SYSTEM_KEYWORD_HIGH.is_match(value) {
        score += 30;
        findings.push(SubFinding {
            category: "filesystem-exposure".into(),
            matched: value.to_string(),
            reason: "matched a high-risk system keyword".into(),
        });
    } else if SYSTEM_KEYWORD_MEDIUM.is_match(value) {
        score += 20;
    }

    if DANGEROUS_EXT_CRITICAL.is_match(value) {
        score += 55;
        findings.push(SubFinding {
            category: "filesystem-exposure".into(),
            matched: value.to_string(),
            reason: "dangerous credential-bearing extension".into(),
        });
    } else if DANGEROUS_EXT_HIGH.is_match(value) {
        score += 35;
    } else if DANGEROUS_EXT_MEDIUM.is_match(value) {
        score += 15;
    }

    if TRAVERSAL.is_match(value) {
        score += 40;
        findings.push(SubFinding {
            category: "filesystem-exposure".into(),
            matched: value.to_string(),
            reason: "path traversal sequence present".into(),
        });
    }

    let path_depth = value.matches(['/', '\\']).count();
    let depth_bonus = (2 * path_depth.saturating_sub(3) as i64).min(10);
    score += depth_bonus;

    (score, findings)
}

fn severity_for(score: i64) -> Severity {
    if score >= 70 {
        Severity::High
    } else if score >= 40 {
        Severity::Medium
    } else if score > 0 {
        Severity::Low
    } else {
        Severity::None
    }
}

pub struct FilesystemExposureDetector;

#[async_trait::async_trait]
impl Detector for FilesystemExposureDetector {
    fn name(&self) -> &str {
        "filesystem-exposure"
    }

    fn interest(&self) -> Interest {
        Interest {
            event_types: &[EventType::MCP],
            producers: &[Producer::Local, Producer::Remote],
        }
    }

    async fn inspect(&self, event: &MCPEvent) -> anyhow::Result<Option<Finding>> {
        let Message::Request(req) = &event.message else {
            return Ok(None);
        };
        if req.method != "tools/call" {
            return Ok(None);
        }
        let Some(arguments) = req.params.as_ref().and_then(|p| p.get("arguments")) else {
            return Ok(None);
        };

        let mut leaves = Vec::new();
        walk_leaves(arguments, "", 0, &mut leaves);

        let mut total_score = 0i64;
        let mut all_findings = Vec::new();
        for (key_path, value, _depth) in leaves {
            if !is_path_like_key(&key_path) {
                continue;
            }
            let (candidate_score, findings) = score_candidate(&value);
            total_score = total_score.max(candidate_score);
            all_findings.extend(findings);
        }

        let severity = severity_for(total_score);
        if severity == Severity::None {
            return Ok(None);
        }

        Ok(Some(Finding {
            detector_name: self.name().to_string(),
            producer: format!("{:?}", event.producer).to_lowercase(),
            server_name: event.mcp_tag.clone(),
            severity,
            score: total_score.min(100),
            sub_findings: all_findings,
            raw_event_id: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_path_scores_high() {
        let (score, _) = score_candidate("/etc/passwd");
        assert_eq!(severity_for(score), Severity::High);
    }

    #[test]
    fn traversal_is_flagged() {
        let (score, findings) = score_candidate("../../etc/shadow");
        assert!(score >= 70);
        assert!(findings.iter().any(|f| f.reason.contains("traversal")));
    }

    #[test]
    fn benign_filename_is_none() {
        let (score, _) = score_candidate("notes.txt");
        assert_eq!(severity_for(score), Severity::None);
    }

    #[test]
    fn depth_bonus_derives_from_path_separators_not_json_nesting() {
        let (shallow, _) = score_candidate("file.dat");
        let (deep, _) = score_candidate("/a/b/c/d/e/f/g/h/file.dat");
        assert_eq!(deep - shallow, 10);
    }

    #[test]
    fn depth_bonus_counts_path_separators_in_the_value() {
        let (score, _) = score_candidate("/a/b/c/d/e.txt");
        assert_eq!(score, 4);
    }

    #[test]
    fn non_path_key_is_ignored() {
        assert!(!is_path_like_key("count"));
        assert!(is_path_like_key("file_path".trim_start_matches("file_")));
    }
}
