//! Plan Template Registry: validated SOP templates keyed by name and version.
//!
//! Templates are loaded from YAML/JSON files or registered directly. Every
//! template is checked with [`build_dependency_graph`] before it is accepted,
//! so a registered template always instantiates.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use crate::error::{EngineError, Result};
use crate::workflow::resolver::build_dependency_graph;
use crate::workflow::schema::PlanTemplate;

/// Built-in SOP shipped with the engine.
pub const EMERGENCY_RESPONSE_TEMPLATE: &str = r#"
name: "emergency-response"
version: "1.0"
description: "Initial assessment, planning and briefing for a declared incident at ${context.location}"

steps:
  - id: assess
    name: "Situation assessment"
    tasks:
      - id: hazard_assessment
        name: "Hazard assessment"
        assignee: "hazard-analyst"
        description: "Assess the hazard extent and affected population at ${context.location}"
        priority: critical
        timeout_seconds: 300
        output_artifacts: [hazard_report]
        blocking: true

      - id: weather_outlook
        name: "Weather outlook"
        assignee: "meteorologist"
        description: "Produce a 24h weather outlook for ${context.location}"
        priority: high
        timeout_seconds: 180
        output_artifacts: [weather_report]

  - id: plan
    name: "Response planning"
    tasks:
      - id: evacuation_routes
        name: "Evacuation routes"
        assignee: "logistics-coordinator"
        description: "Plan evacuation routes avoiding hazard zones"
        priority: critical
        timeout_seconds: 300
        input_artifacts: [hazard_report, weather_report]
        output_artifacts: [evacuation_plan]

      - id: resource_allocation
        name: "Resource allocation"
        assignee: "resource-planner"
        description: "Allocate shelters, medical teams and vehicles"
        priority: high
        timeout_seconds: 300
        input_artifacts: [hazard_report]
        output_artifacts: [allocation_plan]

  - id: brief
    name: "Command briefing"
    tasks:
      - id: situation_report
        name: "Situation report"
        assignee: "incident-commander"
        description: "Compile the situation report for ${context.location}"
        priority: normal
        input_artifacts: [evacuation_plan, allocation_plan]
        output_artifacts: [situation_report]
"#;

/// Thread-safe template table; cheap to clone.
#[derive(Clone, Default)]
pub struct TemplateRegistry {
    templates: Arc<RwLock<BTreeMap<(String, String), Arc<PlanTemplate>>>>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the built-in templates.
    pub fn with_builtins() -> Result<Self> {
        let registry = Self::new();
        for template in Self::builtin_templates()? {
            registry.register(template)?;
        }
        Ok(registry)
    }

    pub fn builtin_templates() -> Result<Vec<PlanTemplate>> {
        Ok(vec![PlanTemplate::from_yaml(EMERGENCY_RESPONSE_TEMPLATE)?])
    }

    /// Validate and store a template. Re-registering the same name and
    /// version replaces the earlier definition.
    pub fn register(&self, template: PlanTemplate) -> Result<()> {
        build_dependency_graph(&template)?;
        let key = (template.name.clone(), template.version.clone());
        tracing::info!(
            "[TemplateRegistry] Registered template: {}@{} ({} tasks)",
            key.0,
            key.1,
            template.task_count()
        );
        self.templates
            .write()
            .map_err(|_| EngineError::lock_poisoned("template registry"))?
            .insert(key, Arc::new(template));
        Ok(())
    }

    pub fn get(&self, name: &str, version: &str) -> Result<Arc<PlanTemplate>> {
        self.templates
            .read()
            .map_err(|_| EngineError::lock_poisoned("template registry"))?
            .get(&(name.to_string(), version.to_string()))
            .cloned()
            .ok_or_else(|| {
                EngineError::NotFound(format!("Template not found: {}@{}", name, version))
            })
    }

    /// Highest registered version of `name`.
    pub fn latest(&self, name: &str) -> Result<Arc<PlanTemplate>> {
        self.templates
            .read()
            .map_err(|_| EngineError::lock_poisoned("template registry"))?
            .iter()
            .filter(|((n, _), _)| n == name)
            .max_by(|((_, a), _), ((_, b), _)| compare_versions(a, b))
            .map(|(_, t)| t.clone())
            .ok_or_else(|| EngineError::NotFound(format!("Template not found: {}", name)))
    }

    /// Every registered template, ordered by name then version.
    pub fn list(&self) -> Vec<Arc<PlanTemplate>> {
        self.templates
            .read()
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Load all templates from a directory (`.yaml`, `.yml`, `.json`).
    pub fn load_dir(&self, dir: &str) -> Result<usize> {
        let dir_path = Path::new(dir);
        if !dir_path.is_dir() {
            return Err(EngineError::Config(format!(
                "Template directory '{}' does not exist",
                dir
            )));
        }

        let mut entries: Vec<_> = std::fs::read_dir(dir_path)
            .map_err(|e| EngineError::Config(format!("Failed to read directory '{}': {}", dir, e)))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .collect();
        entries.sort();

        let mut count = 0;
        for path in entries {
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            if !matches!(ext, "yaml" | "yml" | "json") {
                continue;
            }
            let template = PlanTemplate::from_file(path.to_str().unwrap_or(""))?;
            self.register(template)?;
            count += 1;
        }

        Ok(count)
    }

    /// Search the usual template directories.
    /// Checks: `./templates/`, `./sop/`, `~/.muster/templates/`, plus `extra`.
    pub fn load_default_dirs(&self, extra: &[String]) -> usize {
        let mut search_paths = vec!["templates".to_string(), "sop".to_string()];
        if let Some(home) = dirs::home_dir() {
            search_paths.push(home.join(".muster").join("templates").to_string_lossy().to_string());
        }
        search_paths.extend(extra.iter().cloned());

        let mut total = 0;
        for dir in &search_paths {
            if !Path::new(dir).is_dir() {
                continue;
            }
            match self.load_dir(dir) {
                Ok(n) => {
                    tracing::info!("[TemplateRegistry] Loaded {} template(s) from '{}'", n, dir);
                    total += n;
                }
                Err(e) => {
                    tracing::warn!("[TemplateRegistry] Failed to load from '{}': {}", dir, e);
                }
            }
        }
        total
    }
}

/// Compare dotted versions numerically where possible ("1.10" > "1.9").
fn compare_versions(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (Some(x), Some(y)) => {
                let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(x), Ok(y)) => x.cmp(&y),
                    _ => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}
