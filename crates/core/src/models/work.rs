use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::envelope::Envelope;
use crate::errors::RemoteError;

/// 工作条目状态, 由Broker赋值, 使用其小写词汇表
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum WorkStatus {
    Running,
    Waiting,
    Complete,
    Failed,
    Pending,
    Blocked,
}

impl WorkStatus {
    /// 这些状态让worker循环退出并作为作业终态原样上报。
    /// complete -> 没有更多条目; pending -> 被抢占; blocked -> 依赖未满足。
    pub fn is_terminal_for_loop(&self) -> bool {
        matches!(
            self,
            WorkStatus::Complete | WorkStatus::Pending | WorkStatus::Blocked
        )
    }

    /// 条目已有最终结果, 轮询器据此解析对应的future
    pub fn is_resolved(&self) -> bool {
        matches!(self, WorkStatus::Complete | WorkStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::Running => "running",
            WorkStatus::Waiting => "waiting",
            WorkStatus::Complete => "complete",
            WorkStatus::Failed => "failed",
            WorkStatus::Pending => "pending",
            WorkStatus::Blocked => "blocked",
        }
    }
}

impl std::fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 作业议程中的一个工作条目。
/// `index` 是条目在议程中的位置, 也是future与结果关联的稳定键, 作业内不复用。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkItem {
    pub index: u32,
    pub name: String,
    pub package: Envelope,
    pub status: WorkStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_package: Option<Envelope>,
}

impl WorkItem {
    pub fn new(index: u32, name: impl Into<String>, package: Envelope) -> Self {
        Self {
            index,
            name: name.into(),
            package,
            status: WorkStatus::Pending,
            result_package: None,
        }
    }
}

/// 打包进信封之前的逻辑载荷。
///
/// `func`/`preflight` 是在worker侧函数注册表中解析的名字;
/// `interpreter` 可覆盖派发时使用的子进程程序。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct WorkPackage {
    pub func: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preflight: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<String>,
    /// 透传给worker侧的额外字段
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WorkPackage {
    pub fn new(func: impl Into<String>, args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self {
            func: func.into(),
            args,
            kwargs,
            preflight: None,
            interpreter: None,
            extra: Map::new(),
        }
    }
}

/// 子进程执行一个工作条目的结果。
///
/// `result` 字段区分"缺失"与"值为null": 函数合法地返回null时
/// 仍然算作有结果, 所以反序列化时保留键的存在性。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultPackage {
    pub status: WorkStatus,
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<RemoteError>,
}

impl ResultPackage {
    pub fn complete(result: Value) -> Self {
        Self {
            status: WorkStatus::Complete,
            result: Some(result),
            exception: None,
        }
    }

    pub fn failed(exception: RemoteError) -> Self {
        Self {
            status: WorkStatus::Failed,
            result: None,
            exception: Some(exception),
        }
    }
}

/// 键存在即为 Some, 即使值是null
fn deserialize_present<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_serde_vocabulary() {
        assert_eq!(serde_json::to_value(WorkStatus::Complete).unwrap(), "complete");
        let status: WorkStatus = serde_json::from_value(json!("blocked")).unwrap();
        assert_eq!(status, WorkStatus::Blocked);
    }

    #[test]
    fn test_status_predicates() {
        assert!(WorkStatus::Complete.is_terminal_for_loop());
        assert!(WorkStatus::Pending.is_terminal_for_loop());
        assert!(WorkStatus::Blocked.is_terminal_for_loop());
        assert!(!WorkStatus::Waiting.is_terminal_for_loop());
        assert!(!WorkStatus::Failed.is_terminal_for_loop());

        assert!(WorkStatus::Complete.is_resolved());
        assert!(WorkStatus::Failed.is_resolved());
        assert!(!WorkStatus::Running.is_resolved());
    }

    #[test]
    fn test_result_package_null_result_is_present() {
        let package: ResultPackage =
            serde_json::from_value(json!({"status": "complete", "result": null})).unwrap();
        assert_eq!(package.result, Some(Value::Null));

        let package: ResultPackage = serde_json::from_value(json!({"status": "failed"})).unwrap();
        assert_eq!(package.result, None);
        assert_eq!(package.exception, None);
    }
}
