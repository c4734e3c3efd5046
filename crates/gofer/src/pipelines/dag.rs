//! Validation of a pipeline's task graph before registration.
//!
//! A config is accepted only when every identifier is well formed, every
//! dependency names a sibling task, and the dependency graph is acyclic.

use std::collections::{HashMap, HashSet};

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use super::PipelineDefinition;

/// Identifiers are used in container names, file paths, and URLs, so the
/// accepted alphabet is deliberately narrow.
const IDENTIFIER_PATTERN: &str = "^[A-Za-z][A-Za-z0-9_-]*$";

const MAX_IDENTIFIER_LENGTH: usize = 64;

fn identifier_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(IDENTIFIER_PATTERN).expect("identifier pattern is valid"))
}

/// A single structured validation failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationError {
    InvalidIdentifier {
        field: String,
        value: String,
        message: String,
    },
    UnknownDependency {
        task_id: String,
        depends_on: String,
    },
    SelfDependency {
        task_id: String,
    },
    Cycle {
        /// Tasks participating in the detected cycle.
        participants: Vec<String>,
    },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::InvalidIdentifier { field, value, message } => {
                write!(f, "invalid identifier '{value}' for {field}: {message}")
            }
            ValidationError::UnknownDependency { task_id, depends_on } => {
                write!(f, "task '{task_id}' depends on unknown task '{depends_on}'")
            }
            ValidationError::SelfDependency { task_id } => {
                write!(f, "task '{task_id}' depends on itself")
            }
            ValidationError::Cycle { participants } => {
                write!(f, "dependency cycle between tasks: {}", participants.join(" -> "))
            }
        }
    }
}

/// Check one identifier against the allowed alphabet and length.
pub fn validate_identifier(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.len() > MAX_IDENTIFIER_LENGTH {
        return Err(ValidationError::InvalidIdentifier {
            field: field.to_string(),
            value: value.to_string(),
            message: format!("longer than {MAX_IDENTIFIER_LENGTH} characters"),
        });
    }

    if !identifier_regex().is_match(value) {
        return Err(ValidationError::InvalidIdentifier {
            field: field.to_string(),
            value: value.to_string(),
            message: "must start with a letter and contain only letters, digits, '_' or '-'"
                .to_string(),
        });
    }

    Ok(())
}

/// Validate a submitted pipeline definition. All failures are collected so
/// the user can fix everything in one pass.
pub fn validate(definition: &PipelineDefinition) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if let Err(e) = validate_identifier("pipeline id", &definition.id) {
        errors.push(e);
    }

    let task_ids: HashSet<&str> = definition.tasks.iter().map(|t| t.id.as_str()).collect();

    for task in &definition.tasks {
        if let Err(e) = validate_identifier("task id", &task.id) {
            errors.push(e);
        }

        for parent in task.depends_on.keys() {
            if parent == &task.id {
                errors.push(ValidationError::SelfDependency {
                    task_id: task.id.clone(),
                });
            } else if !task_ids.contains(parent.as_str()) {
                errors.push(ValidationError::UnknownDependency {
                    task_id: task.id.clone(),
                    depends_on: parent.clone(),
                });
            }
        }
    }

    // Only hunt for cycles once the reference structure is sound; unknown
    // edges would produce confusing cycle reports.
    if errors.is_empty() {
        if let Some(cycle) = find_cycle(definition) {
            errors.push(ValidationError::Cycle { participants: cycle });
        }
    }

    errors
}

/// Depth-first search for a dependency cycle. Returns the participating task
/// ids in dependency order when one exists.
fn find_cycle(definition: &PipelineDefinition) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    let edges: HashMap<&str, Vec<&str>> = definition
        .tasks
        .iter()
        .map(|task| {
            (
                task.id.as_str(),
                task.depends_on.keys().map(String::as_str).collect(),
            )
        })
        .collect();

    let mut marks: HashMap<&str, Mark> =
        edges.keys().map(|id| (*id, Mark::Unvisited)).collect();

    fn visit<'a>(
        node: &'a str,
        edges: &HashMap<&'a str, Vec<&'a str>>,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        marks.insert(node, Mark::InProgress);
        stack.push(node);

        for parent in edges.get(node).into_iter().flatten() {
            match marks.get(parent) {
                Some(Mark::InProgress) => {
                    let start = stack.iter().position(|n| n == parent).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        stack[start..].iter().map(|s| s.to_string()).collect();
                    cycle.push((*parent).to_string());
                    return Some(cycle);
                }
                Some(Mark::Unvisited) => {
                    if let Some(cycle) = visit(parent, edges, marks, stack) {
                        return Some(cycle);
                    }
                }
                // Done or not a task at all; validated earlier.
                _ => {}
            }
        }

        stack.pop();
        marks.insert(node, Mark::Done);
        None
    }

    let nodes: Vec<&str> = edges.keys().copied().collect();
    for node in nodes {
        if marks.get(node) == Some(&Mark::Unvisited) {
            let mut stack = Vec::new();
            if let Some(cycle) = visit(node, &edges, &mut marks, &mut stack) {
                return Some(cycle);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipelines::{RequiredParentStatus, Task};

    fn task(id: &str, parents: &[&str]) -> Task {
        Task {
            id: id.into(),
            description: String::new(),
            image: "ubuntu:latest".into(),
            registry_auth: None,
            depends_on: parents
                .iter()
                .map(|p| (p.to_string(), RequiredParentStatus::Any))
                .collect(),
            variables: vec![],
            entrypoint: None,
            command: None,
            inject_api_token: false,
        }
    }

    fn definition(tasks: Vec<Task>) -> PipelineDefinition {
        PipelineDefinition {
            id: "build".into(),
            name: "Build".into(),
            description: String::new(),
            parallelism: 0,
            tasks,
        }
    }

    #[test]
    fn accepts_a_diamond() {
        let errors = validate(&definition(vec![
            task("a", &[]),
            task("b", &["a"]),
            task("c", &["a"]),
            task("d", &["b", "c"]),
        ]));
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");
    }

    #[test]
    fn rejects_cycles_with_participants() {
        let errors = validate(&definition(vec![
            task("a", &["c"]),
            task("b", &["a"]),
            task("c", &["b"]),
        ]));

        assert_eq!(errors.len(), 1);
        match &errors[0] {
            ValidationError::Cycle { participants } => {
                assert!(participants.len() >= 3);
                for id in ["a", "b", "c"] {
                    assert!(participants.iter().any(|p| p == id), "{id} missing");
                }
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_and_self_dependencies() {
        let errors = validate(&definition(vec![
            task("a", &["ghost"]),
            task("b", &["b"]),
        ]));

        assert!(errors.contains(&ValidationError::UnknownDependency {
            task_id: "a".into(),
            depends_on: "ghost".into(),
        }));
        assert!(errors.contains(&ValidationError::SelfDependency { task_id: "b".into() }));
    }

    #[test]
    fn rejects_bad_identifiers() {
        let mut bad = definition(vec![task("ok", &[])]);
        bad.id = "9starts-with-digit".into();
        let errors = validate(&bad);
        assert!(matches!(
            errors[0],
            ValidationError::InvalidIdentifier { .. }
        ));

        let long_id = "a".repeat(65);
        assert!(validate_identifier("task id", &long_id).is_err());
        assert!(validate_identifier("task id", "has space").is_err());
        assert!(validate_identifier("task id", "fine_id-2").is_ok());
    }

    #[test]
    fn empty_depends_on_maps_are_fine() {
        let errors = validate(&definition(vec![task("only", &[])]));
        assert!(errors.is_empty());
    }
}
