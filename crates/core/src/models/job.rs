use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::work::{WorkItem, WorkStatus};

/// 一次Broker提交的作业描述。
/// 由Executor构建, 提交后不再变更; `id` 由Broker分配。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub name: String,
    pub cpu_count: u32,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub agenda: Vec<WorkItem>,
    pub created_at: DateTime<Utc>,
}

impl JobDescriptor {
    pub fn new(name: impl Into<String>, cpu_count: u32) -> Self {
        Self {
            id: None,
            name: name.into(),
            cpu_count,
            environment: HashMap::new(),
            agenda: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// 去掉议程的副本, 发给子进程时避免泄露无关的兄弟条目
    pub fn stripped(&self) -> Self {
        let mut job = self.clone();
        job.agenda.clear();
        job
    }
}

/// Broker对一次提交的应答
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmittedJob {
    pub id: i64,
}

/// Broker的作业状态记录; 不带议程查询时 `agenda` 为空
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobStatus {
    pub id: i64,
    pub status: WorkStatus,
    #[serde(default)]
    pub agenda: Vec<WorkItem>,
}
