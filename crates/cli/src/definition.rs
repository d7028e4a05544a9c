use anyhow::{Context, Result};
use conveyor_core::{Dag, DagNode, Pipeline, PipelineId};
use serde::Deserialize;
use std::path::Path;

/// A pipeline and its DAG as written by hand, in TOML or JSON
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineDefinition {
    pub pipeline: PipelineSection,
    pub dag: DagSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSection {
    pub name: String,
    #[serde(default)]
    pub git_repo: String,
    #[serde(default = "default_branch")]
    pub branch: String,
}

fn default_branch() -> String {
    "main".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DagSection {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: String,
    pub nodes: Vec<DagNode>,
}

impl PipelineDefinition {
    /// Read a definition; `.json` files are parsed as JSON, anything else as TOML
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline definition {}", path.display()))?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            serde_json::from_str(&content).context("Failed to parse pipeline definition as JSON")
        } else {
            toml::from_str(&content).context("Failed to parse pipeline definition as TOML")
        }
    }

    pub fn to_pipeline(&self) -> Pipeline {
        Pipeline::new(
            self.pipeline.name.clone(),
            self.pipeline.git_repo.clone(),
            self.pipeline.branch.clone(),
        )
    }

    /// The DAG for `pipeline_id`, versioned on insert
    pub fn to_dag(&self, pipeline_id: PipelineId) -> Dag {
        let name = self
            .dag
            .name
            .clone()
            .unwrap_or_else(|| self.pipeline.name.clone());
        let mut dag = Dag::new(pipeline_id, name, self.dag.nodes.clone());
        dag.description = self.dag.description.clone();
        dag
    }
}
