//! Task decomposition: splitting a task into subtasks, analyzing their
//! attributes, and attenuating the parent's constraints across them.
//!
//! Splitting rules, in order: an enumerated list becomes one parallel
//! group; sequential connectives ("first ..., then ...") become
//! sequential groups of one; anything else stays a single atomic
//! subtask. Attributes come from keyword lexicons, and subtasks that
//! read as subjective are pre-annotated for human handling.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{AttributeLevel, DelegationTarget, TaskAttributes, TaskConstraints};

const CRITICALITY_HIGH: &[&str] = &[
    "production",
    "deploy",
    "critical",
    "urgent",
    "payment",
    "credentials",
    "security",
];
const CRITICALITY_LOW: &[&str] = &["draft", "experiment", "sandbox", "scratch", "prototype"];

const VERIFIABILITY_HIGH: &[&str] = &[
    "test", "verify", "validate", "check", "compile", "build", "measure", "lint",
];
const VERIFIABILITY_LOW: &[&str] = &[
    "design",
    "opinion",
    "aesthetic",
    "style",
    "brainstorm",
    "judge",
    "creative",
];

const REVERSIBILITY_LOW: &[&str] = &[
    "delete", "drop", "remove", "send", "publish", "deploy", "email", "overwrite",
];
const REVERSIBILITY_HIGH: &[&str] = &["read", "list", "summarize", "analyze", "inspect", "fetch"];

const COMPLEXITY_HIGH: &[&str] = &["architecture", "refactor", "migrate", "redesign"];

/// One unit of delegatable work produced by decomposition.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SubTask {
    pub sub_task_id: String,
    pub text: String,
    pub attributes: TaskAttributes,
    pub constraints: TaskConstraints,
    /// Subtask ids that must finish before this one starts.
    pub depends_on: Vec<String>,
}

/// Groups of subtask ids; groups run sequentially, members of a group in
/// parallel.
pub type ExecutionOrder = Vec<Vec<String>>;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DecompositionPlan {
    pub sub_tasks: Vec<SubTask>,
    pub execution_order: ExecutionOrder,
    pub original_task_text: String,
}

/// Either a plan or a reasoned refusal to delegate.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum Decomposition {
    Skip { reason: String },
    Plan(DecompositionPlan),
}

#[derive(Clone, Copy, Debug)]
pub struct TaskDecomposer {
    /// Tasks under this many words are not worth delegating.
    pub complexity_floor_words: usize,
    pub max_sub_tasks: usize,
}

impl Default for TaskDecomposer {
    fn default() -> Self {
        Self {
            complexity_floor_words: 20,
            max_sub_tasks: 8,
        }
    }
}

impl TaskDecomposer {
    pub fn new(complexity_floor_words: usize, max_sub_tasks: usize) -> Self {
        Self {
            complexity_floor_words,
            max_sub_tasks: max_sub_tasks.max(1),
        }
    }

    pub fn decompose(
        &self,
        task_text: &str,
        available_peers: usize,
        constraints: &TaskConstraints,
    ) -> Decomposition {
        if available_peers == 0 {
            return Decomposition::Skip {
                reason: "no peers available to delegate to".to_string(),
            };
        }
        let words = task_text.split_whitespace().count();
        if words < self.complexity_floor_words {
            return Decomposition::Skip {
                reason: format!(
                    "task is only {words} words; simpler to execute locally"
                ),
            };
        }

        let (parts, sequential) = if let Some(items) = split_enumerated(task_text) {
            (items, false)
        } else if let Some(steps) = split_sequential(task_text) {
            (steps, true)
        } else {
            (vec![task_text.trim().to_string()], false)
        };

        let parts: Vec<String> = parts.into_iter().take(self.max_sub_tasks).collect();
        let shared = attenuate(constraints, parts.len());

        let mut sub_tasks: Vec<SubTask> = Vec::with_capacity(parts.len());
        for text in &parts {
            let attributes = analyze(text, &shared);
            let depends_on = if sequential {
                sub_tasks
                    .last()
                    .map(|prev: &SubTask| vec![prev.sub_task_id.clone()])
                    .unwrap_or_default()
            } else {
                Vec::new()
            };
            sub_tasks.push(SubTask {
                sub_task_id: Uuid::new_v4().to_string(),
                text: text.clone(),
                attributes,
                constraints: shared.clone(),
                depends_on,
            });
        }

        let execution_order: ExecutionOrder = if sequential {
            sub_tasks
                .iter()
                .map(|s| vec![s.sub_task_id.clone()])
                .collect()
        } else {
            vec![sub_tasks.iter().map(|s| s.sub_task_id.clone()).collect()]
        };

        Decomposition::Plan(DecompositionPlan {
            sub_tasks,
            execution_order,
            original_task_text: task_text.to_string(),
        })
    }
}

/// Divide the parent's caps evenly across `n` subtasks; the tool
/// allowlist propagates unchanged.
fn attenuate(constraints: &TaskConstraints, n: usize) -> TaskConstraints {
    let n = n.max(1) as u64;
    TaskConstraints {
        max_duration_ms: constraints.max_duration_ms / n,
        max_tokens: constraints.max_tokens / n,
        max_cost_usd: constraints.max_cost_usd / n as f64,
        tool_allowlist: constraints.tool_allowlist.clone(),
        min_findings: constraints.min_findings,
    }
}

/// Keyword-lexicon attribute analysis of one subtask.
pub fn analyze(text: &str, constraints: &TaskConstraints) -> TaskAttributes {
    let lower = text.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| lower.contains(w));

    let criticality = if has(CRITICALITY_HIGH) {
        AttributeLevel::High
    } else if has(CRITICALITY_LOW) {
        AttributeLevel::Low
    } else {
        AttributeLevel::Medium
    };
    let verifiability = if has(VERIFIABILITY_HIGH) {
        AttributeLevel::High
    } else if has(VERIFIABILITY_LOW) {
        AttributeLevel::Low
    } else {
        AttributeLevel::Medium
    };
    let reversibility = if has(REVERSIBILITY_LOW) {
        AttributeLevel::Low
    } else if has(REVERSIBILITY_HIGH) {
        AttributeLevel::High
    } else {
        AttributeLevel::Medium
    };
    let words = text.split_whitespace().count();
    let complexity = if has(COMPLEXITY_HIGH) || words > 30 {
        AttributeLevel::High
    } else if words < 8 {
        AttributeLevel::Low
    } else {
        AttributeLevel::Medium
    };

    let mut attributes = TaskAttributes {
        complexity,
        criticality,
        verifiability,
        reversibility,
        // Rough estimates: half of this subtask's share of the caps.
        estimated_cost_usd: constraints.max_cost_usd / 2.0,
        estimated_duration_ms: constraints.max_duration_ms / 2,
        delegation_target: None,
    };
    if attributes.subjectivity_score() > 0.7 {
        attributes.delegation_target = Some(DelegationTarget::Human);
    }
    attributes
}

/// Parse an enumerated (numbered or bulleted) list into items.
fn split_enumerated(text: &str) -> Option<Vec<String>> {
    let mut items = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(item) = strip_list_marker(trimmed) {
            if !item.is_empty() {
                items.push(item.to_string());
            }
        }
    }
    (items.len() >= 2).then_some(items)
}

fn strip_list_marker(line: &str) -> Option<&str> {
    if let Some(rest) = line
        .strip_prefix("- ")
        .or_else(|| line.strip_prefix("* "))
        .or_else(|| line.strip_prefix("• "))
    {
        return Some(rest.trim());
    }
    // "1." or "2)" style markers.
    let digits = line.chars().take_while(char::is_ascii_digit).count();
    if digits > 0 {
        let rest = &line[digits..];
        if let Some(rest) = rest.strip_prefix('.').or_else(|| rest.strip_prefix(')')) {
            return Some(rest.trim());
        }
    }
    None
}

/// Split "first ..., then ..., and then ..." into ordered steps.
fn split_sequential(text: &str) -> Option<Vec<String>> {
    let lower = text.to_lowercase();
    if !lower.contains("then ") {
        return None;
    }

    const CONNECTIVES: &[&str] = &[", and then ", ", then ", " and then ", " then "];
    let mut steps = Vec::new();
    let mut rest = text.to_string();
    loop {
        let lower_rest = rest.to_lowercase();
        let earliest = CONNECTIVES
            .iter()
            .filter_map(|c| lower_rest.find(c).map(|idx| (idx, c.len())))
            .min_by_key(|(idx, _)| *idx);
        match earliest {
            Some((idx, len)) => {
                steps.push(rest[..idx].to_string());
                rest = rest[idx + len..].to_string();
            }
            None => {
                steps.push(rest);
                break;
            }
        }
    }

    let steps: Vec<String> = steps
        .into_iter()
        .map(|s| clean_step(&s))
        .filter(|s| !s.is_empty())
        .collect();
    (steps.len() >= 2).then_some(steps)
}

fn clean_step(step: &str) -> String {
    let trimmed = step.trim().trim_end_matches(['.', ',', ';']);
    let lower = trimmed.to_lowercase();
    let without_first = if lower.starts_with("first ") {
        &trimmed[6..]
    } else {
        trimmed
    };
    without_first.trim().to_string()
}
