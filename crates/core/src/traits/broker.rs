use async_trait::async_trait;

use crate::models::{JobDescriptor, JobStatus, SubmittedJob, WorkItem, WorkStatus};
use crate::Result;

/// 远端作业队列Broker的抽象接口。
///
/// Broker本体(调度、排队、资源匹配)是外部黑盒, 本系统只通过
/// 这五个操作消费它: 提交侧用 `submit`/`job_status`,
/// worker侧用 `request_work`/`report_work`/`report_job`。
#[async_trait]
pub trait Broker: Send + Sync {
    /// 提交一批作业, 返回Broker分配的作业ID
    async fn submit(&self, jobs: Vec<JobDescriptor>) -> Result<Vec<SubmittedJob>>;

    /// 查询作业状态; `want_agenda` 决定是否携带逐条目状态
    /// (议程查询在某些Broker上明显更昂贵, 见轮询器的两段式模式)
    async fn job_status(&self, ids: &[i64], want_agenda: bool) -> Result<Vec<JobStatus>>;

    /// worker侧请求下一个工作条目
    async fn request_work(&self) -> Result<WorkItem>;

    /// 上报一个工作条目的执行结果
    async fn report_work(&self, item: &WorkItem) -> Result<()>;

    /// 上报当前作业的终态
    async fn report_job(&self, state: WorkStatus) -> Result<()>;
}
