use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Before,
    After,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Before => "before",
            Phase::After => "after",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "before" => Some(Phase::Before),
            "after" => Some(Phase::After),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    Local,
    Remote,
}

impl DeliveryMode {
    pub fn table(self) -> &'static str {
        match self {
            DeliveryMode::Local => "local_interceptor",
            DeliveryMode::Remote => "remote_interceptor",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Delivery {
    Local {
        callback: String,
    },
    Remote {
        method: String,
        url: String,
        callback: Option<String>,
    },
}

impl Delivery {
    pub fn mode(&self) -> DeliveryMode {
        match self {
            Delivery::Local { .. } => DeliveryMode::Local,
            Delivery::Remote { .. } => DeliveryMode::Remote,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterceptorDefinition {
    pub id: String,
    pub tenant_id: String,
    pub target: String,
    pub phase: Phase,
    pub action: String,
    pub criteria: String,
    pub delivery: Delivery,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    pub id: String,
    pub project_id: String,
    pub token: String,
    pub name: String,
    pub targets: String,
    pub mode: String,
    pub user_id: String,
    pub user_email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub email: String,
    pub token_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub id: String,
    pub project_key: String,
    pub name: String,
    pub data_store_name: String,
    /// Directory of the tenant database, from `data_store.path`. Empty means the default tenants dir.
    pub data_store_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRecord {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub script: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Stopped,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Stopped => "stopped",
        }
    }

    pub fn from_status(value: &str) -> Self {
        match value {
            "running" => JobStatus::Running,
            _ => JobStatus::Stopped,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub mode: String,
    pub cron: String,
    pub script: String,
    pub loop_script: Option<String>,
    pub status: JobStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Delivered,
    Failed,
}

impl NotificationStatus {
    pub fn code(self) -> i64 {
        match self {
            NotificationStatus::Pending => 0,
            NotificationStatus::Delivered => -1,
            NotificationStatus::Failed => 1,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(NotificationStatus::Pending),
            -1 => Some(NotificationStatus::Delivered),
            1 => Some(NotificationStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNotification {
    pub project_id: String,
    pub target: String,
    pub method: String,
    pub url: String,
    pub phase: Phase,
    pub action: String,
    pub data: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationRecord {
    pub id: String,
    pub project_id: String,
    pub target: String,
    pub method: String,
    pub url: String,
    pub phase: String,
    pub action: String,
    pub status: i64,
    pub data: String,
    pub claim_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageStats {
    pub project_id: String,
    pub storage_used: i64,
    pub storage_total: i64,
    pub http_requests_used: i64,
    pub http_requests_total: i64,
}

pub const DEFAULT_STORAGE_TOTAL: i64 = 10 * 1024 * 1024 * 1024;
pub const DEFAULT_HTTP_REQUESTS_TOTAL: i64 = 10_000_000;

impl UsageStats {
    pub fn with_defaults(project_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            storage_used: 0,
            storage_total: DEFAULT_STORAGE_TOTAL,
            http_requests_used: 0,
            http_requests_total: DEFAULT_HTTP_REQUESTS_TOTAL,
        }
    }

    pub fn requests_exhausted(&self) -> bool {
        self.http_requests_total > 0 && self.http_requests_used >= self.http_requests_total
    }
}
