//! `muster template`: inspect and validate SOP templates.

use console::style;
use muster_core::workflow::{build_dependency_graph, PlanTemplate};
use muster_core::Engine;

use super::truncate;

/// List every registered template.
pub fn list(engine: &Engine) -> Result<(), String> {
    let templates = engine.templates().list();
    if templates.is_empty() {
        println!("No templates registered.");
        return Ok(());
    }

    println!("┌──────────────────────────┬──────────┬───────┬───────┐");
    println!("│ Name                     │ Version  │ Steps │ Tasks │");
    println!("├──────────────────────────┼──────────┼───────┼───────┤");
    for template in &templates {
        println!(
            "│ {:<24} │ {:<8} │ {:>5} │ {:>5} │",
            truncate(&template.name, 24),
            truncate(&template.version, 8),
            template.steps.len(),
            template.task_count()
        );
    }
    println!("└──────────────────────────┴──────────┴───────┴───────┘");
    Ok(())
}

/// Validate a template file without registering it.
pub fn validate(file: &str) -> Result<(), String> {
    let template = PlanTemplate::from_file(file).map_err(|e| e.to_string())?;
    build_dependency_graph(&template).map_err(|e| e.to_string())?;

    println!(
        "{} Template '{}' is valid",
        style("✅").green(),
        template.name
    );
    println!("   Version: {}", template.version);
    println!("   Steps: {}", template.steps.len());
    println!("   Tasks: {}", template.task_count());
    println!(
        "   Step barrier: {}",
        if template.step_barrier { "on" } else { "off" }
    );
    Ok(())
}

/// Print steps, tasks and their dependencies.
pub fn show(engine: &Engine, name: &str, version: Option<&str>) -> Result<(), String> {
    let template = match version {
        Some(v) => engine.templates().get(name, v),
        None => engine.templates().latest(name),
    }
    .map_err(|e| e.to_string())?;
    let graph = build_dependency_graph(&template).map_err(|e| e.to_string())?;

    println!(
        "📄 {} v{}",
        style(&template.name).bold(),
        template.version
    );
    if let Some(description) = &template.description {
        println!("   {}", description);
    }
    println!();

    for (i, step) in template.steps.iter().enumerate() {
        println!("{}. {} [{}]", i + 1, style(step.display_name()).cyan(), step.id);
        for task in &step.tasks {
            println!(
                "   • {} ({}) → {} [{}]{}",
                task.name,
                task.id,
                task.assignee,
                task.priority,
                if task.blocking { " blocking" } else { "" }
            );
            let upstream = graph.upstream_of(&task.id);
            if !upstream.is_empty() {
                let deps: Vec<String> = upstream
                    .iter()
                    .map(|(id, kind)| format!("{} ({:?})", id, kind).to_lowercase())
                    .collect();
                println!("     waits on: {}", deps.join(", "));
            }
            if !task.output_artifacts.is_empty() {
                println!("     produces: {}", task.output_artifacts.join(", "));
            }
        }
    }
    Ok(())
}
