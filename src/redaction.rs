use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static SECRET_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r#"(?i)(access_token|refresh_token|client_secret|id_token)["']?\s*[:=]\s*["']?([A-Za-z0-9_\-\./~\+]{6,}=*)["']?"#)
            .expect("valid regex"),
        Regex::new(r#"(?i)(api[_-]?key|token|secret|password)\s*[:=]\s*["']?([A-Za-z0-9_\-\.]{6,})["']?"#)
            .expect("valid regex"),
        Regex::new(r"(?i)\b(bearer|basic|zoho-oauthtoken)\s+([A-Za-z0-9_\-\./~\+]{8,}=*)").expect("valid regex"),
        Regex::new(r"\b([A-Fa-f0-9]{32,})\b").expect("valid regex"),
    ]
});

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RedactionResult {
    pub content: String,
    pub redaction_count: usize,
}

/// Scrubs OAuth secrets out of provider error text before it is logged or
/// stored as a model or sync error.
#[derive(Debug, Default, Clone)]
pub struct Redactor {
    aggressive: bool,
}

impl Redactor {
    pub fn new(aggressive: bool) -> Self {
        Self { aggressive }
    }

    pub fn redact(&self, input: &str) -> RedactionResult {
        if input.is_empty() {
            return RedactionResult {
                content: String::new(),
                redaction_count: 0,
            };
        }

        let mut result = input.to_string();
        let mut redaction_count = 0usize;

        if self.aggressive {
            result = result
                .split(' ')
                .map(|token| {
                    if token.len() > 48 && token.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.') {
                        redaction_count += 1;
                        "[REDACTED_LONG_TOKEN]".to_string()
                    } else {
                        token.to_string()
                    }
                })
                .collect::<Vec<_>>()
                .join(" ");
        }

        for pattern in SECRET_PATTERNS.iter() {
            let matches = pattern.find_iter(&result).count();
            if matches == 0 {
                continue;
            }

            redaction_count += matches;
            result = pattern
                .replace_all(&result, |caps: &regex::Captures<'_>| {
                    let key = caps
                        .get(1)
                        .map(|m| m.as_str())
                        .unwrap_or("secret")
                        .to_ascii_lowercase();
                    match key.as_str() {
                        "bearer" | "basic" | "zoho-oauthtoken" => format!("{} [REDACTED]", key),
                        _ if caps.get(2).is_none() => "[REDACTED]".to_string(),
                        _ => format!("{}=[REDACTED]", key),
                    }
                })
                .to_string();
        }

        RedactionResult {
            content: result,
            redaction_count,
        }
    }
}
