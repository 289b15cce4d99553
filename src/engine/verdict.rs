//! Parsing the model's final answer into a verdict.
//!
//! Expected shape, optionally inside a Markdown code fence or surrounded by
//! prose:
//!
//! ```json
//! {"verdict": "PASSED", "confidence": 0.9, "reasoning": "..."}
//! ```

use serde_json::Value;

use crate::model::Verdict;

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub verdict: Verdict,
    pub confidence: Option<f64>,
    pub reasoning: String,
}

/// Parse a final answer. The error string is shown to the model in the
/// repair prompt.
pub fn parse_verdict(text: &str) -> Result<Decision, String> {
    let json = extract_object(text).ok_or_else(|| "no JSON object found in the answer".to_string())?;
    let value: Value =
        serde_json::from_str(json).map_err(|e| format!("answer is not valid JSON: {}", e))?;

    let raw = value
        .get("verdict")
        .and_then(Value::as_str)
        .ok_or_else(|| "missing string field 'verdict'".to_string())?;
    let verdict = match raw.trim().to_ascii_uppercase().as_str() {
        "PASSED" | "PASS" => Verdict::Passed,
        "FAILED" | "FAIL" => Verdict::Failed,
        "BLOCKED" => Verdict::Blocked,
        "SKIPPED" | "SKIP" => Verdict::Skipped,
        other => {
            return Err(format!(
                "verdict '{}' is not one of PASSED, FAILED, BLOCKED, SKIPPED",
                other
            ))
        }
    };

    let confidence = match value.get("confidence") {
        None | Some(Value::Null) => None,
        Some(v) => {
            let c = v
                .as_f64()
                .ok_or_else(|| "'confidence' must be a number".to_string())?;
            if !(0.0..=1.0).contains(&c) {
                return Err(format!("confidence {} is outside [0, 1]", c));
            }
            Some(c)
        }
    };

    let reasoning = ["reasoning", "reason", "explanation"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .unwrap_or_default()
        .trim()
        .to_string();

    Ok(Decision {
        verdict,
        confidence,
        reasoning,
    })
}

/// Outermost `{ ... }` span of the text.
fn extract_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}
