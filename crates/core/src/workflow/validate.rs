use std::collections::HashSet;

use crate::error::{ValidationError, ValidationFailure};
use crate::scheduler::parse_schedule;
use crate::types::{InlineTask, TaskKind, TriggerType, WorkflowDefinition, WorkflowTask};

use super::graph::DependencyGraph;

/// Structurally validate a workflow, collecting every problem found rather
/// than stopping at the first.
pub fn validate(workflow: &WorkflowDefinition) -> Result<(), ValidationFailure> {
    let mut errors = Vec::new();

    if workflow.name.trim().is_empty() {
        errors.push(ValidationError::EmptyName);
    }
    if workflow.version.trim().is_empty() {
        errors.push(ValidationError::EmptyVersion);
    }
    if workflow.tasks.is_empty() {
        errors.push(ValidationError::NoTasks);
    }
    if workflow.concurrency == Some(0) {
        errors.push(ValidationError::InvalidConcurrency);
    }

    validate_trigger(workflow, &mut errors);

    // output keys are run-global, so nested and composite ids must be
    // unique against every other id in the document
    let mut seen = HashSet::new();
    for (index, task) in workflow.tasks.iter().enumerate() {
        if task.id.trim().is_empty() {
            errors.push(ValidationError::EmptyTaskId { task: index });
            continue;
        }
        collect_task_ids(task, &mut seen, &mut errors);
    }

    let known: HashSet<&str> = workflow.tasks.iter().map(|t| t.id.as_str()).collect();
    let callback_targets: HashSet<&str> = workflow
        .tasks
        .iter()
        .flat_map(|t| t.on_success.iter().chain(t.on_failure.iter()))
        .map(String::as_str)
        .collect();

    for task in &workflow.tasks {
        for dep in &task.depends_on {
            if dep == &task.id {
                errors.push(ValidationError::SelfDependency {
                    task: task.id.clone(),
                });
            } else if !known.contains(dep.as_str()) {
                errors.push(ValidationError::UnknownDependency {
                    task: task.id.clone(),
                    dependency: dep.clone(),
                });
            } else if callback_targets.contains(dep.as_str()) {
                // callback tasks run outside the DAG and can never satisfy a
                // dependency
                errors.push(ValidationError::CallbackDependency {
                    task: task.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
        for callback in task.on_success.iter().chain(task.on_failure.iter()) {
            if !known.contains(callback.as_str()) {
                errors.push(ValidationError::UnknownCallback {
                    task: task.id.clone(),
                    callback: callback.clone(),
                });
            }
        }
        validate_task(task, &mut errors);
    }

    // only meaningful once ids and deps are well formed
    if errors.is_empty() {
        if let Some(on_cycle) = DependencyGraph::new(&workflow.tasks).find_cycle() {
            errors.push(ValidationError::CircularDependency(on_cycle));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ValidationFailure {
            workflow: workflow.name.clone(),
            errors,
        })
    }
}

fn collect_task_ids(
    task: &WorkflowTask,
    seen: &mut HashSet<String>,
    errors: &mut Vec<ValidationError>,
) {
    if !seen.insert(task.id.clone()) {
        errors.push(ValidationError::DuplicateTaskId(task.id.clone()));
    }
    collect_kind_ids(&task.kind, seen, errors);
}

fn collect_inline_ids(
    inline: &InlineTask,
    seen: &mut HashSet<String>,
    errors: &mut Vec<ValidationError>,
) {
    if let Some(id) = &inline.id {
        if !seen.insert(id.clone()) {
            errors.push(ValidationError::DuplicateTaskId(id.clone()));
        }
    }
    collect_kind_ids(&inline.kind, seen, errors);
}

fn collect_kind_ids(
    kind: &TaskKind,
    seen: &mut HashSet<String>,
    errors: &mut Vec<ValidationError>,
) {
    match kind {
        TaskKind::Conditional { then, otherwise } => {
            for branch in [then, otherwise].into_iter().flatten() {
                collect_inline_ids(branch, seen, errors);
            }
        }
        TaskKind::Parallel { tasks, .. } => {
            for child in tasks {
                collect_task_ids(child, seen, errors);
            }
        }
        TaskKind::Loop { then, .. } => {
            if let Some(body) = then {
                collect_inline_ids(body, seen, errors);
            }
        }
        _ => {}
    }
}

fn validate_trigger(workflow: &WorkflowDefinition, errors: &mut Vec<ValidationError>) {
    match workflow.trigger.trigger_type {
        TriggerType::Schedule => match &workflow.trigger.config.schedule {
            None => errors.push(ValidationError::MissingSchedule),
            Some(expr) => {
                if parse_schedule(expr).is_err() {
                    errors.push(ValidationError::InvalidSchedule(expr.clone()));
                }
            }
        },
        TriggerType::FileChange => {
            if workflow.trigger.config.files.is_empty() {
                errors.push(ValidationError::MissingWatchFiles);
            }
        }
        TriggerType::Manual | TriggerType::Webhook => {}
    }
}

fn validate_task(task: &WorkflowTask, errors: &mut Vec<ValidationError>) {
    if let Some(retry) = &task.retry {
        if retry.attempts < 1 {
            errors.push(ValidationError::InvalidRetryAttempts {
                task: task.id.clone(),
            });
        }
    }
    if task.timeout_ms == Some(0) {
        errors.push(ValidationError::InvalidTimeout {
            task: task.id.clone(),
        });
    }

    validate_kind(&task.id, &task.kind, task.condition.as_deref(), errors);
}

fn validate_kind(
    id: &str,
    kind: &TaskKind,
    condition: Option<&str>,
    errors: &mut Vec<ValidationError>,
) {
    let missing = |field: &'static str| ValidationError::MissingField {
        task: id.to_string(),
        task_type: kind.type_name(),
        field,
    };

    match kind {
        TaskKind::Shell { command, .. } => {
            if command.trim().is_empty() {
                errors.push(missing("command"));
            }
        }
        TaskKind::Http { url, .. } => {
            if url.trim().is_empty() {
                errors.push(missing("url"));
            }
        }
        TaskKind::Javascript { script } | TaskKind::Python { script } => {
            if script.trim().is_empty() {
                errors.push(missing("script"));
            }
        }
        TaskKind::Docker { image, .. } => {
            if image.trim().is_empty() {
                errors.push(missing("image"));
            }
        }
        TaskKind::Conditional { then, otherwise } => {
            if condition.map(str::trim).unwrap_or("").is_empty() {
                errors.push(missing("condition"));
            }
            for branch in [then, otherwise].into_iter().flatten() {
                validate_kind(id, &branch.kind, branch.condition.as_deref(), errors);
            }
        }
        TaskKind::Parallel { tasks, .. } => {
            if tasks.is_empty() {
                errors.push(missing("tasks"));
            }
            for child in tasks {
                validate_task(child, errors);
            }
        }
        TaskKind::Loop {
            items,
            then,
            command,
            ..
        } => {
            if items.is_empty() {
                errors.push(missing("items"));
            }
            let has_command = command.as_deref().map(str::trim).is_some_and(|c| !c.is_empty());
            match then {
                Some(body) => validate_kind(id, &body.kind, body.condition.as_deref(), errors),
                None if !has_command => errors.push(ValidationError::EmptyLoopBody {
                    task: id.to_string(),
                }),
                None => {}
            }
        }
    }
}
