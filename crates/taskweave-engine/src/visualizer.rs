//! Renderings of the task graph and execution state: Mermaid, Graphviz,
//! ASCII for terminals, and a canonical JSON document.

use serde::{Deserialize, Serialize};

use taskweave_core::{
    task_levels, TaskStatus, WeaveResult, WorkflowDefinition, WorkflowState,
};

/// Supported visualization formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VizFormat {
    Mermaid,
    Graphviz,
    Ascii,
    /// The canonical machine-readable form.
    Json,
}

/// Renders a workflow, optionally overlaying execution state.
pub struct Visualizer<'a> {
    workflow: &'a WorkflowDefinition,
    state: Option<&'a WorkflowState>,
}

impl<'a> Visualizer<'a> {
    pub fn new(workflow: &'a WorkflowDefinition) -> Self {
        Self {
            workflow,
            state: None,
        }
    }

    pub fn with_state(mut self, state: &'a WorkflowState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn render(&self, format: VizFormat, include_metrics: bool) -> WeaveResult<String> {
        match format {
            VizFormat::Mermaid => Ok(self.render_mermaid(include_metrics)),
            VizFormat::Graphviz => Ok(self.render_graphviz(include_metrics)),
            VizFormat::Ascii => Ok(self.render_ascii(include_metrics)),
            VizFormat::Json => self.render_json(include_metrics),
        }
    }

    fn task_status(&self, id: &str) -> Option<TaskStatus> {
        self.state.and_then(|s| s.task_status(id))
    }

    fn metrics_label(&self, id: &str) -> Option<String> {
        let result = self.state?.task_results.get(id)?;
        let duration = result.duration_seconds()?;
        let mut label = format!("{duration:.1}s");
        if result.retry_count() > 0 {
            label.push_str(&format!(" ({} retries)", result.retry_count()));
        }
        Some(label)
    }

    fn render_mermaid(&self, include_metrics: bool) -> String {
        let mut lines = vec!["```mermaid".to_string(), "graph TD".to_string()];

        for task in &self.workflow.tasks {
            let node_id = sanitize_id(&task.id);
            let mut label = task.id.clone();
            if include_metrics {
                if let Some(metrics) = self.metrics_label(&task.id) {
                    label = format!("{label}<br/>{metrics}");
                }
            }
            let class = match self.task_status(&task.id) {
                None => "",
                Some(TaskStatus::Completed) => ":::completed",
                Some(TaskStatus::Failed) => ":::failed",
                Some(TaskStatus::Running) => ":::running",
                Some(_) => ":::pending",
            };
            lines.push(format!("    {node_id}[{label}]{class}"));
        }

        for task in &self.workflow.tasks {
            let node_id = sanitize_id(&task.id);
            for dep in &task.depends_on {
                lines.push(format!("    {} --> {}", sanitize_id(dep), node_id));
            }
        }

        lines.extend([
            String::new(),
            "    classDef completed fill:#90EE90,stroke:#006400,stroke-width:2px".to_string(),
            "    classDef failed fill:#FFB6C1,stroke:#8B0000,stroke-width:2px".to_string(),
            "    classDef running fill:#87CEEB,stroke:#00008B,stroke-width:2px".to_string(),
            "    classDef pending fill:#F0E68C,stroke:#8B8B00,stroke-width:2px".to_string(),
            "```".to_string(),
        ]);
        lines.join("\n")
    }

    fn render_graphviz(&self, include_metrics: bool) -> String {
        let mut lines = vec![
            "digraph Workflow {".to_string(),
            "    rankdir=TB;".to_string(),
            "    node [shape=box, style=rounded];".to_string(),
            String::new(),
        ];

        for task in &self.workflow.tasks {
            let node_id = sanitize_id(&task.id);
            let mut label = task.id.clone();
            if include_metrics {
                if let Some(metrics) = self.metrics_label(&task.id) {
                    label = format!("{label}\\n{metrics}");
                }
            }
            let (color, fillcolor) = match self.task_status(&task.id) {
                None => ("black", "white"),
                Some(TaskStatus::Completed) => ("darkgreen", "lightgreen"),
                Some(TaskStatus::Failed) => ("darkred", "lightpink"),
                Some(TaskStatus::Running) => ("darkblue", "lightblue"),
                Some(_) => ("goldenrod", "lightyellow"),
            };
            lines.push(format!(
                "    {node_id} [label=\"{label}\", color=\"{color}\", \
                 fillcolor=\"{fillcolor}\", style=\"filled,rounded\"];"
            ));
        }

        lines.push(String::new());
        for task in &self.workflow.tasks {
            let node_id = sanitize_id(&task.id);
            for dep in &task.depends_on {
                lines.push(format!("    {} -> {};", sanitize_id(dep), node_id));
            }
        }
        lines.push("}".to_string());
        lines.join("\n")
    }

    fn render_ascii(&self, include_metrics: bool) -> String {
        let mut lines = vec![
            format!("Workflow: {}", self.workflow.name),
            format!("Strategy: {}", self.workflow.strategy),
            "=".repeat(70),
            String::new(),
        ];

        for (level, ids) in task_levels(self.workflow).iter().enumerate() {
            if level > 0 {
                lines.push("    ↓".to_string());
            }
            lines.push(format!("Level {level}:"));
            for id in ids {
                let symbol = match self.task_status(id) {
                    Some(TaskStatus::Completed) => "✓",
                    Some(TaskStatus::Failed) => "✗",
                    Some(TaskStatus::Running) => "⟳",
                    _ => "○",
                };
                let mut line = format!("  {symbol} {id}");
                if include_metrics {
                    if let Some(metrics) = self.metrics_label(id) {
                        line.push_str(&format!(" ({metrics})"));
                    }
                }
                if let Some(task) = self.workflow.task(id) {
                    if !task.depends_on.is_empty() {
                        line.push_str(&format!(" [depends: {}]", task.depends_on.join(", ")));
                    }
                }
                lines.push(line);
            }
        }

        lines.extend([
            String::new(),
            "Legend:".to_string(),
            "  ✓ Completed".to_string(),
            "  ✗ Failed".to_string(),
            "  ⟳ Running".to_string(),
            "  ○ Pending".to_string(),
        ]);
        lines.join("\n")
    }

    fn render_json(&self, include_metrics: bool) -> WeaveResult<String> {
        let mut nodes = Vec::new();
        let mut edges = Vec::new();

        for task in &self.workflow.tasks {
            let mut node = serde_json::Map::new();
            node.insert("id".into(), serde_json::json!(task.id));
            node.insert("description".into(), serde_json::json!(task.description));
            node.insert(
                "capabilities".into(),
                serde_json::json!(task
                    .required_capabilities
                    .iter()
                    .map(|c| c.as_str())
                    .collect::<Vec<_>>()),
            );
            node.insert("skills".into(), serde_json::json!(task.required_skills));
            node.insert("priority".into(), serde_json::json!(task.priority));

            if let Some(status) = self.task_status(&task.id) {
                node.insert("status".into(), serde_json::json!(status));
            }
            if include_metrics {
                if let Some(result) = self.state.and_then(|s| s.task_results.get(&task.id)) {
                    node.insert(
                        "metrics".into(),
                        serde_json::json!({
                            "duration_seconds": result.duration_seconds(),
                            "retry_count": result.retry_count(),
                            "worker_type": result.worker_type,
                        }),
                    );
                    if let Some(error) = &result.error {
                        node.insert("error".into(), serde_json::json!(error.message));
                    }
                }
            }
            nodes.push(serde_json::Value::Object(node));

            for dep in &task.depends_on {
                edges.push(serde_json::json!({ "from": dep, "to": task.id }));
            }
        }

        let mut workflow = serde_json::Map::new();
        workflow.insert("id".into(), serde_json::json!(self.workflow.id));
        workflow.insert("name".into(), serde_json::json!(self.workflow.name));
        workflow.insert("strategy".into(), serde_json::json!(self.workflow.strategy));
        if let Some(state) = self.state {
            workflow.insert("status".into(), serde_json::json!(state.status));
            if let Some(started) = state.started_at {
                workflow.insert("started_at".into(), serde_json::json!(started.to_rfc3339()));
            }
            if let Some(completed) = state.completed_at {
                workflow.insert(
                    "completed_at".into(),
                    serde_json::json!(completed.to_rfc3339()),
                );
            }
        }

        let document = serde_json::json!({
            "workflow": serde_json::Value::Object(workflow),
            "nodes": nodes,
            "edges": edges,
        });
        Ok(serde_json::to_string_pretty(&document)?)
    }
}

fn sanitize_id(id: &str) -> String {
    id.replace(['-', '.', ' '], "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;
    use taskweave_core::{TaskDefinition, TaskResult, WorkflowStatus};

    fn diamond() -> WorkflowDefinition {
        WorkflowDefinition::new("wf", "diamond")
            .with_task(TaskDefinition::new("a", "root"))
            .with_task(TaskDefinition::new("b", "left").with_dependencies(vec!["a"]))
            .with_task(TaskDefinition::new("c", "right").with_dependencies(vec!["a"]))
            .with_task(TaskDefinition::new("d", "join").with_dependencies(vec!["b", "c"]))
    }

    fn state_for(workflow: &WorkflowDefinition) -> WorkflowState {
        let start = Utc::now();
        let mut task_statuses = HashMap::new();
        let mut task_results = HashMap::new();
        for (i, task) in workflow.tasks.iter().enumerate() {
            let status = if i == 0 {
                TaskStatus::Completed
            } else {
                TaskStatus::Running
            };
            task_statuses.insert(task.id.clone(), status);
            if status == TaskStatus::Completed {
                task_results.insert(
                    task.id.clone(),
                    TaskResult {
                        task_id: task.id.clone(),
                        status,
                        output: Some("out".into()),
                        error: None,
                        started_at: Some(start),
                        completed_at: Some(start + chrono::Duration::milliseconds(1200)),
                        attempts: 2,
                        worker_type: Some("general-purpose".into()),
                        cache_hit: false,
                    },
                );
            }
        }
        WorkflowState {
            workflow_id: workflow.id.clone(),
            status: WorkflowStatus::Running,
            task_statuses,
            task_results,
            events: Vec::new(),
            started_at: Some(start),
            completed_at: None,
            error: None,
        }
    }

    #[test]
    fn test_mermaid_structure() {
        let wf = diamond();
        let out = Visualizer::new(&wf).render(VizFormat::Mermaid, false).unwrap();
        assert!(out.starts_with("```mermaid"));
        assert!(out.contains("graph TD"));
        assert!(out.contains("a --> b"));
        assert!(out.contains("b --> d"));
        assert!(out.contains("classDef completed"));
    }

    #[test]
    fn test_mermaid_status_classes_and_metrics() {
        let wf = diamond();
        let state = state_for(&wf);
        let out = Visualizer::new(&wf)
            .with_state(&state)
            .render(VizFormat::Mermaid, true)
            .unwrap();
        assert!(out.contains(":::completed"));
        assert!(out.contains(":::running"));
        assert!(out.contains("1.2s"));
        assert!(out.contains("(1 retries)"));
    }

    #[test]
    fn test_graphviz_structure() {
        let wf = diamond();
        let state = state_for(&wf);
        let out = Visualizer::new(&wf)
            .with_state(&state)
            .render(VizFormat::Graphviz, false)
            .unwrap();
        assert!(out.starts_with("digraph Workflow {"));
        assert!(out.contains("a -> b;"));
        assert!(out.contains("fillcolor=\"lightgreen\""));
        assert!(out.ends_with('}'));
    }

    #[test]
    fn test_ascii_levels_and_symbols() {
        let wf = diamond();
        let state = state_for(&wf);
        let out = Visualizer::new(&wf)
            .with_state(&state)
            .render(VizFormat::Ascii, false)
            .unwrap();
        assert!(out.contains("Level 0:"));
        assert!(out.contains("Level 2:"));
        assert!(out.contains("✓ a"));
        assert!(out.contains("⟳ b"));
        assert!(out.contains("[depends: b, c]"));
        assert!(out.contains("Legend:"));
    }

    #[test]
    fn test_json_nodes_and_edges() {
        let wf = diamond();
        let out = Visualizer::new(&wf).render(VizFormat::Json, false).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(doc["nodes"].as_array().unwrap().len(), 4);
        assert_eq!(doc["edges"].as_array().unwrap().len(), 4);
        assert_eq!(doc["workflow"]["id"], "wf");
    }

    #[test]
    fn test_json_rerender_is_byte_identical() {
        let wf = diamond();
        let state = state_for(&wf);
        let viz = Visualizer::new(&wf).with_state(&state);
        let first = viz.render(VizFormat::Json, true).unwrap();
        let second = viz.render(VizFormat::Json, true).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_sanitize_id() {
        assert_eq!(sanitize_id("fetch-data.step 2"), "fetch_data_step_2");
    }
}
