//! Prompt text for the decision loop.

use crate::model::{ExecutionMode, TestCase};
use crate::transport::ToolCapability;

pub fn system_prompt(mode: ExecutionMode) -> String {
    let mode_note = match mode {
        ExecutionMode::Automatic | ExecutionMode::SemiAutomatic => {
            "Tool calls are executed against the live target system. Some calls may \
             need a human approval first; a rejected call is reported back to you."
        }
        ExecutionMode::Assisted => {
            "You do not execute tools yourself. Each tool call you propose is carried out \
             by a human operator, whose notes are returned as the observation."
        }
        ExecutionMode::DryRun => {
            "This is a dry run. Tool calls are not executed; observations are simulated. \
             Reason about what the results would be."
        }
    };

    format!(
        "You are an audit agent verifying one test case against a target system.\n\
         Work step by step: call one tool at a time, read its result, then decide the next step.\n\
         {mode_note}\n\n\
         When you have enough evidence, stop calling tools and answer with exactly one JSON object:\n\
         {{\"verdict\": \"PASSED\" | \"FAILED\" | \"BLOCKED\" | \"SKIPPED\", \
         \"confidence\": <number between 0 and 1>, \"reasoning\": \"<short justification>\"}}\n\
         Use BLOCKED when the test cannot be completed (missing access, broken precondition) \
         and SKIPPED when it does not apply to this system."
    )
}

pub fn test_case_prompt(case: &TestCase, tools: &[ToolCapability], max_steps: u32) -> String {
    let mut out = format!("Test case: {}\n", case.title);

    if !case.preconditions.is_empty() {
        out.push_str("\nPreconditions:\n");
        for p in &case.preconditions {
            out.push_str(&format!("- {}\n", p));
        }
    }
    if !case.steps.is_empty() {
        out.push_str("\nSteps:\n");
        for (i, s) in case.steps.iter().enumerate() {
            out.push_str(&format!("{}. {}\n", i + 1, s));
        }
    }
    out.push_str(&format!("\nExpected result: {}\n", case.expected_result));

    if tools.is_empty() {
        out.push_str("\nNo tools are available.\n");
    } else {
        out.push_str("\nAvailable tools:\n");
        for t in tools {
            if t.description.is_empty() {
                out.push_str(&format!("- {}\n", t.name));
            } else {
                out.push_str(&format!("- {}: {}\n", t.name, t.description));
            }
        }
    }
    out.push_str(&format!("\nYou have at most {} steps.", max_steps));
    out
}

pub fn repair_prompt(problem: &str) -> String {
    format!(
        "Your last reply could not be used: {}.\n\
         Either call one of the available tools with a JSON object as arguments, or answer \
         with the verdict JSON object described earlier.",
        problem
    )
}

pub fn parse_error_observation(problem: &str) -> String {
    format!(
        "ERROR: the previous replies could not be parsed ({}). One more unusable reply \
         ends this test case as BLOCKED.",
        problem
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_case_prompt_lists_everything() {
        let case = TestCase {
            id: "tc".into(),
            session_id: "s".into(),
            position: 1,
            title: "Admin accounts use MFA".into(),
            preconditions: vec!["directory reachable".into()],
            steps: vec!["list admins".into(), "check mfa flag".into()],
            expected_result: "every admin has MFA".into(),
            enabled: true,
        };
        let tools = vec![ToolCapability {
            name: "list_users".into(),
            description: "List directory users".into(),
            input_schema: json!({"type": "object"}),
            requires_confirmation: false,
        }];

        let prompt = test_case_prompt(&case, &tools, 12);
        assert!(prompt.contains("Admin accounts use MFA"));
        assert!(prompt.contains("- directory reachable"));
        assert!(prompt.contains("2. check mfa flag"));
        assert!(prompt.contains("- list_users: List directory users"));
        assert!(prompt.contains("at most 12 steps"));
    }

    #[test]
    fn test_system_prompt_depends_on_mode() {
        assert!(system_prompt(ExecutionMode::DryRun).contains("dry run"));
        assert!(system_prompt(ExecutionMode::Assisted).contains("human operator"));
        assert!(system_prompt(ExecutionMode::Automatic).contains("\"verdict\""));
    }
}
