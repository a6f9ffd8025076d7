//! 一个未完成的远端工作单元。
//!
//! future由提交进程独占持有, 身份键是 `(job_id, work_id)`,
//! 在提交(或批量commit)时分配。状态只被轮询器推进一次
//! (pending -> done), 调用方唯一能做的变更是 `cancel()`。

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;

use qfarm_core::{Broker, QfarmError, RemoteError, Result, WorkStatus};

/// future的身份键
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FutureId {
    pub job_id: i64,
    pub work_id: u32,
}

#[derive(Debug, Clone)]
enum FutureState {
    Pending,
    Cancelled,
    Value(Value),
    Error(RemoteError),
    /// 结果包既无 result 也无 exception
    Malformed,
}

struct FutureInner {
    broker: Arc<dyn Broker>,
    id: OnceLock<FutureId>,
    state: Mutex<FutureState>,
    changed: watch::Sender<()>,
}

/// 对应一个工作条目的future
#[derive(Clone)]
pub struct WorkFuture {
    inner: Arc<FutureInner>,
}

impl WorkFuture {
    /// 身份已知的future(常规提交路径)
    pub fn new(broker: Arc<dyn Broker>, job_id: i64, work_id: u32) -> Self {
        let future = Self::unassigned(broker);
        let _ = future.inner.id.set(FutureId { job_id, work_id });
        future
    }

    /// 身份待定的future; Batch在commit时才分配身份
    pub(crate) fn unassigned(broker: Arc<dyn Broker>) -> Self {
        let (changed, _) = watch::channel(());
        Self {
            inner: Arc::new(FutureInner {
                broker,
                id: OnceLock::new(),
                state: Mutex::new(FutureState::Pending),
                changed,
            }),
        }
    }

    /// 分配身份, 只允许一次
    pub(crate) fn assign_id(&self, job_id: i64, work_id: u32) -> bool {
        self.inner.id.set(FutureId { job_id, work_id }).is_ok()
    }

    pub fn id(&self) -> Option<FutureId> {
        self.inner.id.get().copied()
    }

    pub fn job_id(&self) -> Option<i64> {
        self.id().map(|id| id.job_id)
    }

    pub fn work_id(&self) -> Option<u32> {
        self.id().map(|id| id.work_id)
    }

    pub(crate) fn key(&self) -> Option<(i64, u32)> {
        self.id().map(|id| (id.job_id, id.work_id))
    }

    /// 阻塞当前任务直到轮询器解析本future或超时。
    /// 解析后的调用立即返回记忆化的结果; 远端失败时重新抛出携带回来的错误。
    pub async fn result(&self, timeout: Option<Duration>) -> Result<Value> {
        match self.wait_resolved(timeout).await? {
            FutureState::Value(value) => Ok(value),
            FutureState::Error(err) => Err(QfarmError::RemoteFailure(err)),
            FutureState::Malformed => Err(QfarmError::MalformedResult),
            FutureState::Cancelled => Err(QfarmError::Cancelled),
            FutureState::Pending => Err(QfarmError::Internal("future 未解析".to_string())),
        }
    }

    /// 等待并返回远端错误(如果有); 成功完成时返回 `None`
    pub async fn exception(&self, timeout: Option<Duration>) -> Result<Option<RemoteError>> {
        match self.wait_resolved(timeout).await? {
            FutureState::Value(_) => Ok(None),
            FutureState::Error(err) => Ok(Some(err)),
            FutureState::Malformed => Ok(Some(RemoteError::new(
                "RuntimeError",
                "结果包缺少 result/exception 字段",
            ))),
            FutureState::Cancelled => Err(QfarmError::Cancelled),
            FutureState::Pending => Err(QfarmError::Internal("future 未解析".to_string())),
        }
    }

    pub fn done(&self) -> bool {
        !matches!(*self.inner.state.lock().unwrap(), FutureState::Pending)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(*self.inner.state.lock().unwrap(), FutureState::Cancelled)
    }

    /// 取消等待。只在pending期间有效; 不会通知Broker,
    /// 也不会中止远端执行, 只是与结果脱钩。
    pub fn cancel(&self) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        if matches!(*state, FutureState::Pending) {
            *state = FutureState::Cancelled;
            drop(state);
            self.inner.changed.send_replace(());
            true
        } else {
            false
        }
    }

    /// 直接向Broker查询该条目的实时状态, 与轮询器无关。
    /// 只用于诊断: 它看到的状态可能比轮询器更新,
    /// 但解析future的只能是轮询器, 避免两条解析路径竞争。
    pub async fn status(&self) -> Result<WorkStatus> {
        let id = self
            .id()
            .ok_or_else(|| QfarmError::Internal("future 尚未提交".to_string()))?;
        let statuses = self.inner.broker.job_status(&[id.job_id], true).await?;
        let job = statuses
            .iter()
            .find(|job| job.id == id.job_id)
            .ok_or_else(|| QfarmError::Broker(format!("作业不存在: {}", id.job_id)))?;
        job.agenda
            .iter()
            .find(|item| item.index == id.work_id)
            .map(|item| item.status)
            .ok_or_else(|| {
                QfarmError::Broker(format!("作业 {} 没有条目 {}", id.job_id, id.work_id))
            })
    }

    pub(crate) fn resolve_value(&self, value: Value) -> bool {
        self.transition(FutureState::Value(value))
    }

    pub(crate) fn resolve_error(&self, err: RemoteError) -> bool {
        self.transition(FutureState::Error(err))
    }

    pub(crate) fn resolve_malformed(&self) -> bool {
        self.transition(FutureState::Malformed)
    }

    /// pending -> done, 至多发生一次
    fn transition(&self, next: FutureState) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        if matches!(*state, FutureState::Pending) {
            *state = next;
            drop(state);
            self.inner.changed.send_replace(());
            true
        } else {
            false
        }
    }

    async fn wait_resolved(&self, timeout: Option<Duration>) -> Result<FutureState> {
        // 先订阅再检查状态, 避免错过解析通知
        let mut changed = self.inner.changed.subscribe();
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            {
                let state = self.inner.state.lock().unwrap();
                if !matches!(*state, FutureState::Pending) {
                    return Ok(state.clone());
                }
            }
            match deadline {
                None => {
                    if changed.changed().await.is_err() {
                        return Err(QfarmError::Internal("future 信号通道关闭".to_string()));
                    }
                }
                Some(deadline) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(QfarmError::Timeout);
                    }
                    match tokio::time::timeout_at(deadline, changed.changed()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) => {
                            return Err(QfarmError::Internal(
                                "future 信号通道关闭".to_string(),
                            ));
                        }
                        Err(_) => return Err(QfarmError::Timeout),
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for WorkFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match *self.inner.state.lock().unwrap() {
            FutureState::Pending => "pending",
            FutureState::Cancelled => "cancelled",
            FutureState::Value(_) => "value",
            FutureState::Error(_) => "error",
            FutureState::Malformed => "malformed",
        };
        f.debug_struct("WorkFuture")
            .field("id", &self.id())
            .field("state", &state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qfarm_testing_utils::MockBroker;
    use serde_json::json;

    fn pending_future() -> WorkFuture {
        WorkFuture::new(Arc::new(MockBroker::new()), 1, 0)
    }

    #[tokio::test]
    async fn test_result_is_memoized() {
        let future = pending_future();
        assert!(future.resolve_value(json!(7)));
        assert!(future.done());
        // 解析后每次调用立即返回同一个值
        assert_eq!(future.result(None).await.unwrap(), json!(7));
        assert_eq!(future.result(Some(Duration::ZERO)).await.unwrap(), json!(7));
        assert_eq!(future.exception(None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_resolution_happens_at_most_once() {
        let future = pending_future();
        assert!(future.resolve_value(json!(1)));
        assert!(!future.resolve_value(json!(2)));
        assert!(!future.resolve_error(RemoteError::new("X", "y")));
        assert_eq!(future.result(None).await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_failed_future_reraises_error() {
        let future = pending_future();
        future.resolve_error(RemoteError::new("ValueError", "boom"));
        let err = future.result(None).await.unwrap_err();
        match err {
            QfarmError::RemoteFailure(remote) => {
                assert_eq!(remote.kind, "ValueError");
                assert_eq!(remote.message, "boom");
            }
            other => panic!("意外的错误: {other}"),
        }
        // exception() 永远不会对失败的future返回 None
        assert!(future.exception(None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_result_timeout() {
        let future = pending_future();
        let err = future
            .result(Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, QfarmError::Timeout));
        // 超时是可恢复的: 结果到达后重试成功
        future.resolve_value(json!(3));
        assert_eq!(future.result(None).await.unwrap(), json!(3));
    }

    #[tokio::test]
    async fn test_cancel_only_while_pending() {
        let future = pending_future();
        assert!(future.cancel());
        assert!(!future.cancel());
        assert!(future.is_cancelled());
        assert!(matches!(
            future.result(None).await.unwrap_err(),
            QfarmError::Cancelled
        ));
        // 取消后不可再解析
        assert!(!future.resolve_value(json!(1)));

        let resolved = pending_future();
        resolved.resolve_value(json!(1));
        assert!(!resolved.cancel());
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_resolution() {
        let future = pending_future();
        let waiter = future.clone();
        let handle = tokio::spawn(async move { waiter.result(Some(Duration::from_secs(5))).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        future.resolve_value(json!("完成"));
        assert_eq!(handle.await.unwrap().unwrap(), json!("完成"));
    }

    #[tokio::test]
    async fn test_malformed_result() {
        let future = pending_future();
        future.resolve_malformed();
        assert!(matches!(
            future.result(None).await.unwrap_err(),
            QfarmError::MalformedResult
        ));
        let exception = future.exception(None).await.unwrap().unwrap();
        assert_eq!(exception.kind, "RuntimeError");
    }
}
