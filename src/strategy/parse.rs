//! Lenient parsers from raw strategy text to decisions.
//!
//! All parsers extract the JSON object (code fence or brace matching), repair
//! common slips, and default missing fields. Unknown or missing decision
//! values produce `Unparseable`; the controller applies the fallbacks.

use serde_json::Value;

use super::decision::*;
use crate::util::{looks_like_json, parse_json_lenient};

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(|v| v.as_str())
}

fn string_or_empty(value: &Value, key: &str) -> String {
    str_field(value, key).unwrap_or_default().trim().to_string()
}

/// Array of strings; string scalars become a one-element list and non-string
/// items are rendered as JSON.
fn string_list(value: &Value, key: &str) -> Vec<String> {
    match value.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.trim().to_string(),
                other => other.to_string(),
            })
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}

fn confidence_field(value: &Value, default: f64) -> f64 {
    let raw = match value.get("confidence") {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    clamp_confidence(raw.unwrap_or(default))
}

fn bool_field(value: &Value, key: &str) -> Option<bool> {
    match value.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" => Some(true),
            "false" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn upper_field(value: &Value, key: &str) -> Option<String> {
    str_field(value, key).map(|s| s.trim().to_ascii_uppercase())
}

pub fn parse_query_analysis(raw: &str) -> QueryAnalysis {
    match parse_json_lenient(raw) {
        Some(value) => QueryAnalysis {
            topic: string_or_empty(&value, "topic"),
            intent: string_or_empty(&value, "intent"),
            keywords: string_list(&value, "keywords")
                .into_iter()
                .map(|k| k.to_lowercase())
                .collect(),
            analysis: string_or_empty(&value, "analysis"),
        },
        None => QueryAnalysis {
            analysis: raw.trim().to_string(),
            ..Default::default()
        },
    }
}

pub fn parse_gathered_context(raw: &str) -> GatheredContext {
    if looks_like_json(raw)
        && let Some(value) = parse_json_lenient(raw)
    {
        return GatheredContext {
            context: string_or_empty(&value, "context"),
            sources: string_list(&value, "sources"),
        };
    }
    GatheredContext {
        context: raw.trim().to_string(),
        sources: Vec::new(),
    }
}

pub fn parse_reflection(raw: &str) -> ReflectionDecision {
    let Some(value) = parse_json_lenient(raw) else {
        return ReflectionDecision::Unparseable { raw: raw.to_string() };
    };
    let confidence = confidence_field(&value, 0.5);
    let reasoning = string_or_empty(&value, "reasoning");
    match upper_field(&value, "decision").as_deref() {
        Some("PROCEED") => ReflectionDecision::Proceed {
            reasoning,
            confidence,
        },
        Some("CLARIFY") => {
            let question = str_field(&value, "question")
                .map(|q| q.trim().to_string())
                .filter(|q| !q.is_empty())
                .unwrap_or(reasoning);
            ReflectionDecision::Clarify {
                question,
                confidence,
            }
        }
        _ => ReflectionDecision::Unparseable { raw: raw.to_string() },
    }
}

fn tool_requests(value: &Value) -> Vec<ToolRequest> {
    let Some(Value::Array(items)) = value.get("tools") else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(name) if !name.trim().is_empty() => {
                Some(ToolRequest::new(name.trim(), ""))
            }
            Value::Object(_) => {
                let tool = str_field(item, "tool").or_else(|| str_field(item, "name"))?;
                Some(ToolRequest {
                    tool: tool.trim().to_string(),
                    instruction: string_or_empty(item, "instruction"),
                    args: item.get("args").cloned().unwrap_or(Value::Null),
                    mutating: bool_field(item, "mutating").unwrap_or(false),
                })
            }
            _ => None,
        })
        .collect()
}

pub fn parse_plan(raw: &str) -> PlanDecision {
    let Some(value) = parse_json_lenient(raw) else {
        return PlanDecision::Unparseable { raw: raw.to_string() };
    };
    let plan = Plan {
        goals: string_list(&value, "goals"),
        approach: string_or_empty(&value, "approach"),
        success_criteria: match value.get("success_criteria") {
            Some(Value::String(s)) => s.trim().to_string(),
            Some(Value::Array(_)) => string_list(&value, "success_criteria").join("; "),
            _ => String::new(),
        },
        tools: tool_requests(&value),
    };

    let route = upper_field(&value, "route_to").or_else(|| upper_field(&value, "action"));
    match route.as_deref() {
        Some("EXECUTOR" | "EXECUTE") => PlanDecision::Execute(plan),
        Some("SYNTHESIS" | "SYNTHESIZE" | "COMPLETE") => PlanDecision::Synthesize(plan),
        Some("CLARIFY") => {
            let question = string_or_empty(&value, "question");
            PlanDecision::Clarify { plan, question }
        }
        _ => PlanDecision::Unparseable { raw: raw.to_string() },
    }
}

pub fn parse_execution(raw: &str, requested_tool: &str) -> ExecutionReport {
    let Some(value) = parse_json_lenient(raw) else {
        let trimmed = raw.trim();
        let status = if trimmed.is_empty() || looks_like_json(trimmed) {
            ToolStatus::Error
        } else {
            ToolStatus::Success
        };
        return ExecutionReport {
            tool_selected: requested_tool.to_string(),
            status,
            result: trimmed.to_string(),
            claims: Vec::new(),
        };
    };

    let status = match str_field(&value, "status")
        .map(|s| s.trim().to_ascii_lowercase())
        .as_deref()
    {
        Some("success" | "ok" | "completed") => ToolStatus::Success,
        Some("empty" | "no_results" | "none") => ToolStatus::Empty,
        Some(_) => ToolStatus::Error,
        None => ToolStatus::Success,
    };
    let result = match value.get("result") {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };
    let claims = match value.get("claims") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(ClaimDraft {
                    content: s.clone(),
                    confidence: 0.5,
                    source: String::new(),
                }),
                other => serde_json::from_value::<ClaimDraft>(other.clone()).ok(),
            })
            .map(|mut c| {
                c.confidence = clamp_confidence(c.confidence);
                c
            })
            .collect(),
        _ => Vec::new(),
    };
    let tool_selected = str_field(&value, "tool_selected")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| requested_tool.to_string());

    ExecutionReport {
        tool_selected,
        status,
        result,
        claims,
    }
}

pub fn parse_synthesis(raw: &str) -> SynthesisDecision {
    if let Some(value) = parse_json_lenient(raw) {
        if bool_field(&value, "unanswerable").unwrap_or(false) {
            return SynthesisDecision::Unanswerable {
                reason: string_or_empty(&value, "reason"),
            };
        }
        if let Some(answer) = str_field(&value, "answer").map(str::trim)
            && !answer.is_empty()
        {
            return SynthesisDecision::Answer {
                answer: answer.to_string(),
            };
        }
        return SynthesisDecision::Unparseable { raw: raw.to_string() };
    }

    let trimmed = raw.trim();
    if trimmed.is_empty() || looks_like_json(trimmed) {
        SynthesisDecision::Unparseable { raw: raw.to_string() }
    } else {
        SynthesisDecision::Answer {
            answer: trimmed.to_string(),
        }
    }
}

fn validation_report(value: &Value) -> ValidationReport {
    let checks = value.get("checks").map(|c| {
        let defaults = ValidationChecks::default();
        ValidationChecks {
            query_terms_in_context: bool_field(c, "query_terms_in_context")
                .unwrap_or(defaults.query_terms_in_context),
            answer_terms_in_context: bool_field(c, "answer_terms_in_context")
                .unwrap_or(defaults.answer_terms_in_context),
            subject_substitution: bool_field(c, "subject_substitution")
                .unwrap_or(defaults.subject_substitution),
        }
    });

    let goal_statuses = match value.get("goal_statuses") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| {
                let goal = str_field(item, "goal")?.trim().to_string();
                let fulfilled = bool_field(item, "fulfilled")
                    .or_else(|| {
                        upper_field(item, "status")
                            .map(|s| matches!(s.as_str(), "FULFILLED" | "MET" | "DONE"))
                    })
                    .unwrap_or(false);
                Some(GoalStatus { goal, fulfilled })
            })
            .collect(),
        _ => Vec::new(),
    };

    ValidationReport {
        confidence: confidence_field(value, 0.5),
        issues: string_list(value, "issues"),
        checks: checks.unwrap_or_default(),
        goal_statuses,
        suggested_fixes: string_list(value, "suggested_fixes"),
        failed_claims: string_list(value, "failed_claims"),
        failed_sources: string_list(value, "failed_sources"),
        failure_reason: str_field(value, "failure_reason").and_then(FailureReason::parse),
    }
}

pub fn parse_validation(raw: &str) -> ValidatorDecision {
    let Some(value) = parse_json_lenient(raw) else {
        return ValidatorDecision::Unparseable { raw: raw.to_string() };
    };
    let report = validation_report(&value);
    match upper_field(&value, "decision").as_deref() {
        Some("APPROVE") => ValidatorDecision::Approve(report),
        Some("APPROVE_PARTIAL") => ValidatorDecision::ApprovePartial(report),
        Some("REVISE") => ValidatorDecision::Revise(report),
        Some("RETRY") => ValidatorDecision::Retry(report),
        Some("FAIL") => ValidatorDecision::Fail(report),
        _ => ValidatorDecision::Unparseable { raw: raw.to_string() },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query_analysis() {
        let a = parse_query_analysis(
            r#"{"topic": "colors", "intent": "recall", "keywords": ["Favorite", "color"], "analysis": "memory lookup"}"#,
        );
        assert_eq!(a.topic, "colors");
        assert_eq!(a.keywords, vec!["favorite", "color"]);

        let fallback = parse_query_analysis("just prose");
        assert_eq!(fallback.analysis, "just prose");
        assert!(fallback.topic.is_empty());
    }

    #[test]
    fn test_parse_gathered_context() {
        let g = parse_gathered_context(r#"{"context": "memory says blue", "sources": ["memory:1"]}"#);
        assert_eq!(g.context, "memory says blue");
        assert_eq!(g.sources, vec!["memory:1"]);
        let plain = parse_gathered_context("User said their favorite color is blue {earlier}.");
        assert!(plain.sources.is_empty());
        assert!(plain.context.contains("blue"));
    }

    #[test]
    fn test_parse_reflection() {
        let d = parse_reflection("```json\n{\"decision\": \"proceed\", \"reasoning\": \"clear\", \"confidence\": 0.9}\n```");
        assert_eq!(
            d,
            ReflectionDecision::Proceed {
                reasoning: "clear".into(),
                confidence: 0.9
            }
        );
        let c = parse_reflection(r#"{"decision": "CLARIFY", "reasoning": "Which project?"}"#);
        assert!(matches!(c, ReflectionDecision::Clarify { ref question, .. } if question == "Which project?"));
        assert!(matches!(parse_reflection("hmm"), ReflectionDecision::Unparseable { .. }));
        assert!(matches!(
            parse_reflection(r#"{"decision": "MAYBE"}"#),
            ReflectionDecision::Unparseable { .. }
        ));
    }

    #[test]
    fn test_parse_plan_route_and_legacy_action() {
        let p = parse_plan(
            r#"{"goals": ["find color"], "approach": "search memory", "route_to": "executor",
                "tools": ["memory_recall", {"tool": "web_search", "instruction": "look up", "args": {"q": "x"}}]}"#,
        );
        let PlanDecision::Execute(plan) = p else {
            panic!("expected Execute");
        };
        assert_eq!(plan.goals, vec!["find color"]);
        assert_eq!(plan.tools.len(), 2);
        assert_eq!(plan.tools[1].tool, "web_search");
        assert_eq!(plan.tools[1].args["q"], "x");

        assert!(matches!(
            parse_plan(r#"{"action": "COMPLETE", "tools": [],}"#),
            PlanDecision::Synthesize(_)
        ));
        assert!(matches!(
            parse_plan(r#"{"route_to": "clarify", "question": "which one?"}"#),
            PlanDecision::Clarify { ref question, .. } if question == "which one?"
        ));
        assert!(matches!(parse_plan("no json"), PlanDecision::Unparseable { .. }));
    }

    #[test]
    fn test_parse_execution() {
        let r = parse_execution(
            r#"{"tool_selected": "web_search", "status": "success", "result": "blue",
                "claims": [{"content": "favorite is blue", "confidence": 1.4, "source": "memory"}, "plain claim"]}"#,
            "memory_recall",
        );
        assert_eq!(r.tool_selected, "web_search");
        assert_eq!(r.status, ToolStatus::Success);
        assert_eq!(r.claims.len(), 2);
        assert_eq!(r.claims[0].confidence, 1.0);

        let empty = parse_execution(r#"{"status": "no_results"}"#, "web_search");
        assert_eq!(empty.status, ToolStatus::Empty);
        assert_eq!(empty.tool_selected, "web_search");

        let prose = parse_execution("Found three articles.", "web_search");
        assert_eq!(prose.status, ToolStatus::Success);
        assert_eq!(parse_execution("", "x").status, ToolStatus::Error);
    }

    #[test]
    fn test_parse_synthesis() {
        assert_eq!(
            parse_synthesis(r#"{"answer": "Blue."}"#),
            SynthesisDecision::Answer {
                answer: "Blue.".into()
            }
        );
        assert_eq!(
            parse_synthesis(r#"{"unanswerable": true, "reason": "no results from web_search"}"#),
            SynthesisDecision::Unanswerable {
                reason: "no results from web_search".into()
            }
        );
        assert_eq!(
            parse_synthesis("Your favorite color is blue."),
            SynthesisDecision::Answer {
                answer: "Your favorite color is blue.".into()
            }
        );
        assert!(matches!(parse_synthesis("  "), SynthesisDecision::Unparseable { .. }));
        assert!(matches!(
            parse_synthesis(r#"{"answer": null}"#),
            SynthesisDecision::Unparseable { .. }
        ));
    }

    #[test]
    fn test_parse_validation_full_report() {
        let d = parse_validation(
            r#"{"decision": "RETRY", "confidence": "0.4", "issues": ["stale"],
                "checks": {"query_terms_in_context": false},
                "goal_statuses": [{"goal": "a", "fulfilled": true}, {"goal": "b", "status": "unmet"}],
                "failed_claims": ["c1"], "failed_sources": ["src-1"],
                "failure_reason": "StaleEvidence"}"#,
        );
        let ValidatorDecision::Retry(report) = d else {
            panic!("expected Retry");
        };
        assert_eq!(report.confidence, 0.4);
        assert!(!report.checks.query_terms_in_context);
        assert!(report.checks.answer_terms_in_context);
        assert_eq!(report.goal_statuses.len(), 2);
        assert!(report.goal_statuses[0].fulfilled);
        assert!(!report.goal_statuses[1].fulfilled);
        assert_eq!(report.failed_claims, vec!["c1"]);
        assert_eq!(report.failure_reason, Some(FailureReason::StaleEvidence));
    }

    #[test]
    fn test_parse_validation_unknown_decision() {
        assert!(matches!(
            parse_validation(r#"{"decision": "SHRUG", "confidence": 0.9}"#),
            ValidatorDecision::Unparseable { .. }
        ));
        assert!(matches!(
            parse_validation("not json"),
            ValidatorDecision::Unparseable { .. }
        ));
        assert!(matches!(
            parse_validation("{'decision': 'APPROVE', 'confidence': 0.95}"),
            ValidatorDecision::Approve(_)
        ));
    }
}
