//! worker循环: Broker侧的取活/派发/上报状态机。
//!
//! 单线程顺序循环, 并发完全交给子进程隔离; 一次只阻塞在一个
//! 子进程上, 条目严格按Broker交付的顺序处理与上报。
//! 子进程的单次执行没有超时: 这是有意保留的行为,
//! 不在这里私自加活性预算。

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use qfarm_core::envelope::pack;
use qfarm_core::{Broker, JobDescriptor, Result, WorkStatus, WorkerSettings};

use crate::dispatch::ChildDispatcher;

/// 一个作业的worker循环
pub struct WorkerLoop {
    broker: Arc<dyn Broker>,
    dispatcher: ChildDispatcher,
    settings: WorkerSettings,
    hostname: String,
}

impl WorkerLoop {
    pub fn new(broker: Arc<dyn Broker>, dispatcher: ChildDispatcher, settings: WorkerSettings) -> Self {
        let hostname = hostname::get()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            broker,
            dispatcher,
            settings,
            hostname,
        }
    }

    /// 持续请求工作条目并派发, 直到Broker给出终态。
    /// 返回按原样上报的作业终态。
    pub async fn run(&self, job: &JobDescriptor) -> Result<WorkStatus> {
        // 子进程不需要完整议程, 也不该看到无关的兄弟条目
        let job_for_child = job.stripped();
        info!(host = %self.hostname, job = %job.name, "worker循环启动");

        loop {
            let mut item = self.broker.request_work().await?;

            // 作业结束后Broker仍会递条目过来, 只是状态表明
            // 已经无活可干: 把该状态作为作业终态原样上报并退出
            if item.status.is_terminal_for_loop() {
                info!(status = %item.status, "作业结束, 上报终态");
                self.broker.report_job(item.status).await?;
                return Ok(item.status);
            }

            // waiting是Broker的正常背压, 不是错误,
            // 不计入任何重试上限
            if item.status == WorkStatus::Waiting {
                info!(
                    job = ?job.id,
                    delay_ms = self.settings.waiting_delay_ms,
                    "作业waiting, 稍后重试"
                );
                tokio::time::sleep(self.settings.waiting_delay()).await;
                continue;
            }

            let package_summary = Value::Object(item.package.summary.clone());
            debug!(
                work = item.index,
                package = %package_summary,
                "派发工作条目"
            );
            let response = self.dispatcher.run_item(&job_for_child, &item).await;

            // 响应并进条目后上报
            item.status = response.status;
            item.result_package = Some(pack(&response)?);

            if item.status == WorkStatus::Failed && self.settings.dump_environment_on_failure {
                for (key, value) in std::env::vars() {
                    debug!("env {key}={value}");
                }
            }

            self.broker.report_work(&item).await?;
        }
    }
}
