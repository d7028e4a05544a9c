use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a pipeline run
    RunId
);
uuid_id!(
    /// Unique identifier for a pipeline
    PipelineId
);
uuid_id!(
    /// Unique identifier for one stored DAG version
    DagId
);

/// Identifier of a node inside a single DAG
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Status of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Canceled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

/// Status of a pipeline as shown to operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Inactive,
    Active,
    Running,
    Success,
    Failed,
    Canceled,
}

impl From<RunStatus> for PipelineStatus {
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Pending | RunStatus::Running => Self::Running,
            RunStatus::Success => Self::Success,
            RunStatus::Failed => Self::Failed,
            RunStatus::Canceled => Self::Canceled,
        }
    }
}

/// A pipeline definition: the repository a run builds from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: PipelineId,
    pub name: String,
    pub git_repo: String,
    pub branch: String,
    pub status: PipelineStatus,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>, git_repo: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            id: PipelineId::new(),
            name: name.into(),
            git_repo: git_repo.into(),
            branch: branch.into(),
            status: PipelineStatus::Inactive,
            last_run_at: None,
            created_at: Utc::now(),
        }
    }
}

/// One task definition inside a DAG
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagNode {
    pub id: NodeId,
    #[serde(default)]
    pub name: String,
    /// Selects the executor that runs this node
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub dependencies: Vec<NodeId>,
    /// Editor layout only
    #[serde(default)]
    pub position: serde_json::Map<String, serde_json::Value>,
}

impl DagNode {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id: NodeId(id),
            node_type: node_type.into(),
            config: serde_json::Map::new(),
            dependencies: Vec::new(),
            position: serde_json::Map::new(),
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies
            .extend(deps.into_iter().map(|d| NodeId(d.into())));
        self
    }
}

/// One stored version of a pipeline's task graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dag {
    pub id: DagId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Monotonically increasing per pipeline; 0 means "assign next"
    pub version: u32,
    pub pipeline_id: PipelineId,
    pub nodes: Vec<DagNode>,
    pub is_active: bool,
    pub creator: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Dag {
    pub fn new(pipeline_id: PipelineId, name: impl Into<String>, nodes: Vec<DagNode>) -> Self {
        let now = Utc::now();
        Self {
            id: DagId::new(),
            name: name.into(),
            description: String::new(),
            version: 0,
            pipeline_id,
            nodes,
            is_active: false,
            creator: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn active(mut self) -> Self {
        self.is_active = true;
        self
    }
}

/// The visible record of one execution of a pipeline's active DAG
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: RunId,
    pub pipeline_id: PipelineId,
    pub dag_id: DagId,
    pub dag_version: u32,
    pub status: RunStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Whole seconds between start and end
    pub duration_secs: i64,
    pub branch: String,
    pub triggered_by: String,
    pub logs: String,
}
