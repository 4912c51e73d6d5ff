//! Built-in decomposition templates.
//!
//! Each [`TaskType`] maps to a fixed, ordered list of step definitions
//! with name-based dependencies. [`validate_dag`] is the shared guard
//! for both built-in and stored workflow templates: dangling references
//! and cycles are rejected before anything touches the database.

use std::collections::{HashMap, HashSet, VecDeque};

use taskmesh_store::{SubtaskType, TaskType};

use crate::error::{EngineError, EngineResult};

/// One step of a decomposition template.
#[derive(Debug, Clone)]
pub struct StepDef {
    pub name: &'static str,
    pub description: &'static str,
    pub subtask_type: SubtaskType,
    pub recommended_tool: &'static str,
    /// 1–5.
    pub complexity: i32,
    /// Higher allocates earlier.
    pub priority: i32,
    /// May run alongside its siblings once dependencies complete.
    pub parallel: bool,
    pub depends_on: &'static [&'static str],
}

/// The fixed template for a task type.
pub fn builtin_template(task_type: TaskType) -> &'static [StepDef] {
    match task_type {
        TaskType::DevelopFeature => DEVELOP_FEATURE,
        TaskType::BugFix => BUG_FIX,
        TaskType::Refactor => REFACTOR,
        TaskType::CodeReview => CODE_REVIEW,
        TaskType::Documentation => DOCUMENTATION,
        TaskType::Testing => TESTING,
    }
}

static DEVELOP_FEATURE: &[StepDef] = &[
    StepDef {
        name: "Code Generation",
        description: "Generate code that implements the requested feature",
        subtask_type: SubtaskType::CodeGeneration,
        recommended_tool: "claude_code",
        complexity: 4,
        priority: 10,
        parallel: false,
        depends_on: &[],
    },
    StepDef {
        name: "Code Review",
        description: "Review the generated code for defects and style issues",
        subtask_type: SubtaskType::CodeReview,
        recommended_tool: "claude_code",
        complexity: 3,
        priority: 8,
        parallel: false,
        depends_on: &["Code Generation"],
    },
    StepDef {
        name: "Test Generation",
        description: "Write tests covering the reviewed implementation",
        subtask_type: SubtaskType::Test,
        recommended_tool: "claude_code",
        complexity: 3,
        priority: 6,
        parallel: true,
        depends_on: &["Code Review"],
    },
    StepDef {
        name: "Documentation",
        description: "Document the new feature and its public interface",
        subtask_type: SubtaskType::Documentation,
        recommended_tool: "gemini_cli",
        complexity: 2,
        priority: 4,
        parallel: true,
        depends_on: &["Code Review"],
    },
];

static BUG_FIX: &[StepDef] = &[
    StepDef {
        name: "Bug Analysis",
        description: "Reproduce the defect and locate its root cause",
        subtask_type: SubtaskType::Analysis,
        recommended_tool: "claude_code",
        complexity: 3,
        priority: 10,
        parallel: false,
        depends_on: &[],
    },
    StepDef {
        name: "Fix Implementation",
        description: "Implement the fix identified by the analysis",
        subtask_type: SubtaskType::CodeFix,
        recommended_tool: "claude_code",
        complexity: 3,
        priority: 8,
        parallel: false,
        depends_on: &["Bug Analysis"],
    },
    StepDef {
        name: "Regression Testing",
        description: "Add a regression test and verify the fix holds",
        subtask_type: SubtaskType::Test,
        recommended_tool: "claude_code",
        complexity: 2,
        priority: 6,
        parallel: false,
        depends_on: &["Fix Implementation"],
    },
];

static REFACTOR: &[StepDef] = &[
    StepDef {
        name: "Refactoring Analysis",
        description: "Map the affected code and plan the restructuring",
        subtask_type: SubtaskType::Analysis,
        recommended_tool: "claude_code",
        complexity: 3,
        priority: 10,
        parallel: false,
        depends_on: &[],
    },
    StepDef {
        name: "Refactoring",
        description: "Apply the planned restructuring without changing behavior",
        subtask_type: SubtaskType::CodeGeneration,
        recommended_tool: "claude_code",
        complexity: 4,
        priority: 8,
        parallel: false,
        depends_on: &["Refactoring Analysis"],
    },
    StepDef {
        name: "Behavior Verification",
        description: "Run and extend tests to confirm behavior is unchanged",
        subtask_type: SubtaskType::Test,
        recommended_tool: "claude_code",
        complexity: 3,
        priority: 6,
        parallel: false,
        depends_on: &["Refactoring"],
    },
];

static CODE_REVIEW: &[StepDef] = &[
    StepDef {
        name: "Code Review",
        description: "Review the target code for defects, security, and style",
        subtask_type: SubtaskType::CodeReview,
        recommended_tool: "claude_code",
        complexity: 3,
        priority: 10,
        parallel: false,
        depends_on: &[],
    },
    StepDef {
        name: "Review Report",
        description: "Summarize the findings into an actionable report",
        subtask_type: SubtaskType::Documentation,
        recommended_tool: "gemini_cli",
        complexity: 2,
        priority: 6,
        parallel: false,
        depends_on: &["Code Review"],
    },
];

static DOCUMENTATION: &[StepDef] = &[
    StepDef {
        name: "Code Analysis",
        description: "Analyze the code base to extract the documented surface",
        subtask_type: SubtaskType::Analysis,
        recommended_tool: "claude_code",
        complexity: 2,
        priority: 10,
        parallel: false,
        depends_on: &[],
    },
    StepDef {
        name: "Documentation Writing",
        description: "Write documentation from the analysis",
        subtask_type: SubtaskType::Documentation,
        recommended_tool: "gemini_cli",
        complexity: 2,
        priority: 6,
        parallel: false,
        depends_on: &["Code Analysis"],
    },
];

static TESTING: &[StepDef] = &[
    StepDef {
        name: "Test Planning",
        description: "Identify untested paths and plan the test additions",
        subtask_type: SubtaskType::Analysis,
        recommended_tool: "claude_code",
        complexity: 2,
        priority: 10,
        parallel: false,
        depends_on: &[],
    },
    StepDef {
        name: "Test Generation",
        description: "Write the planned tests",
        subtask_type: SubtaskType::Test,
        recommended_tool: "claude_code",
        complexity: 3,
        priority: 8,
        parallel: false,
        depends_on: &["Test Planning"],
    },
];

/// Validate a DAG given as `(step_name, dependency_names)` pairs.
///
/// Rejects duplicate names, dangling references, and cycles; on a
/// cycle, the error carries one offending path for the envelope.
pub fn validate_dag<'a>(
    steps: impl Iterator<Item = (&'a str, Vec<&'a str>)> + Clone,
) -> EngineResult<()> {
    let mut names = HashSet::new();
    for (name, _) in steps.clone() {
        if !names.insert(name) {
            return Err(EngineError::Validation {
                message: format!("duplicate step name: {name}"),
            });
        }
    }

    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    for (name, deps) in steps.clone() {
        in_degree.entry(name).or_insert(0);
        for dep in deps {
            if !names.contains(dep) {
                return Err(EngineError::Validation {
                    message: format!("step {name} depends on unknown step {dep}"),
                });
            }
            if dep == name {
                return Err(EngineError::CycleDetected {
                    path: vec![name.to_string(), name.to_string()],
                });
            }
            dependents.entry(dep).or_default().push(name);
            *in_degree.entry(name).or_insert(0) += 1;
        }
    }

    // Kahn's algorithm; whatever survives sits on a cycle.
    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut resolved = 0;
    while let Some(name) = queue.pop_front() {
        resolved += 1;
        for dependent in dependents.get(name).into_iter().flatten() {
            let degree = in_degree.get_mut(dependent).expect("known step");
            *degree -= 1;
            if *degree == 0 {
                queue.push_back(dependent);
            }
        }
    }

    if resolved < in_degree.len() {
        let mut path: Vec<String> = in_degree
            .iter()
            .filter(|(_, degree)| **degree > 0)
            .map(|(name, _)| name.to_string())
            .collect();
        path.sort();
        if let Some(first) = path.first().cloned() {
            path.push(first);
        }
        return Err(EngineError::CycleDetected { path });
    }

    Ok(())
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn develop_feature_shape() {
        let steps = builtin_template(TaskType::DevelopFeature);
        assert_eq!(steps.len(), 4);
        assert_eq!(steps[0].name, "Code Generation");
        assert_eq!(steps[1].name, "Code Review");
        assert_eq!(steps[2].name, "Test Generation");
        assert_eq!(steps[3].name, "Documentation");

        assert!(steps[0].depends_on.is_empty());
        assert_eq!(steps[1].depends_on, &["Code Generation"]);
        assert_eq!(steps[2].depends_on, &["Code Review"]);
        assert_eq!(steps[3].depends_on, &["Code Review"]);
    }

    #[test]
    fn bug_fix_shape() {
        let steps = builtin_template(TaskType::BugFix);
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].name, "Bug Analysis");
        assert_eq!(steps[1].name, "Fix Implementation");
        assert_eq!(steps[2].name, "Regression Testing");
    }

    #[test]
    fn all_builtin_templates_are_valid_dags() {
        for task_type in [
            TaskType::DevelopFeature,
            TaskType::BugFix,
            TaskType::Refactor,
            TaskType::CodeReview,
            TaskType::Documentation,
            TaskType::Testing,
        ] {
            let steps = builtin_template(task_type);
            assert!(!steps.is_empty());
            validate_dag(
                steps
                    .iter()
                    .map(|s| (s.name, s.depends_on.to_vec())),
            )
            .unwrap_or_else(|e| panic!("{task_type} template invalid: {e}"));

            // Dependencies always point at earlier steps.
            for (i, step) in steps.iter().enumerate() {
                for dep in step.depends_on {
                    let dep_index = steps
                        .iter()
                        .position(|s| s.name == *dep)
                        .unwrap_or_else(|| panic!("{dep} missing in {task_type}"));
                    assert!(dep_index < i, "{dep} must precede {}", step.name);
                }
            }
        }
    }

    #[test]
    fn cycle_is_rejected_with_path() {
        let steps = vec![("A", vec!["B"]), ("B", vec!["A"])];
        let err = validate_dag(steps.iter().map(|(n, d)| (*n, d.clone()))).unwrap_err();
        match err {
            EngineError::CycleDetected { path } => {
                assert!(path.contains(&"A".to_string()));
                assert!(path.contains(&"B".to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn dangling_dependency_rejected() {
        let steps = vec![("A", vec!["Ghost"])];
        let err = validate_dag(steps.iter().map(|(n, d)| (*n, d.clone()))).unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));
    }

    #[test]
    fn self_dependency_rejected() {
        let steps = vec![("A", vec!["A"])];
        let err = validate_dag(steps.iter().map(|(n, d)| (*n, d.clone()))).unwrap_err();
        assert!(matches!(err, EngineError::CycleDetected { .. }));
    }

    #[test]
    fn duplicate_names_rejected() {
        let steps: Vec<(&str, Vec<&str>)> = vec![("A", vec![]), ("A", vec![])];
        let err = validate_dag(steps.iter().map(|(n, d)| (*n, d.clone()))).unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));
    }
}
