use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema, PartialEq, Eq)]
pub struct ContainerSummary {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Names")]
    pub names: Vec<String>,
    #[serde(rename = "Image")]
    pub image: String,
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "State", default)]
    pub state: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct CreateContainerRequest {
    #[serde(rename = "Image")]
    #[schema(example = "nginx:latest")]
    pub image: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct CreateContainerResponse {
    #[serde(rename = "Id")]
    pub id: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct LogsResponse {
    pub lines: Vec<String>,
}

/// Session output recorded for a container, decoded lossily for display.
#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct HistoryResponse {
    pub container_id: String,
    pub chunks: usize,
    pub bytes: usize,
    /// Live sessions currently attached to the container.
    pub viewers: usize,
    pub content: String,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Upgrading,
    Spawning,
    Replaying,
    Relaying,
    Closing,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Upgrading => "upgrading",
            SessionState::Spawning => "spawning",
            SessionState::Replaying => "replaying",
            SessionState::Relaying => "relaying",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct SessionSummary {
    pub id: Uuid,
    pub container_id: String,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub backend: String,
    pub sessions: usize,
    /// Containers with recorded shell output.
    pub history_containers: Vec<String>,
    /// Per-container history cap in bytes; absent when uncapped.
    pub history_limit: Option<usize>,
}
