//! 把一个工作条目派发到隔离的子进程。
//!
//! 条目的可调用对象可能需要与worker循环不同的运行时配置或
//! 应用内嵌环境, 子进程边界让循环保持为一个长寿命、稳定的监督者。
//! 交换协议: 请求管道上两条记录(去议程的作业描述、原始工作包信封),
//! 响应管道上一条记录(结果包)。管道破裂或提前EOF合成failed响应
//! 而不是让循环崩溃; 子进程无论结果如何都会被回收。

use std::process::Stdio;

use serde_json::Value;
use tokio::process::Command;
use tracing::{error, info, warn};

use qfarm_core::{
    Envelope, JobDescriptor, QfarmError, RemoteError, Result, ResultPackage, WorkItem,
    ENV_DEV_ARGS, ENV_QFARM_BIN,
};

use crate::framing::{read_frame, write_frame};

/// 子进程派发器
#[derive(Debug, Clone, Default)]
pub struct ChildDispatcher {
    /// 配置指定的子进程程序; 空则逐级回退
    program: Option<String>,
}

impl ChildDispatcher {
    pub fn new(program: Option<String>) -> Self {
        Self {
            program: program.filter(|program| !program.is_empty()),
        }
    }

    /// 执行一个条目并返回结果包。派发层自身的一切故障都折叠成
    /// failed结果包, Broker总能收到每个条目的终态。
    pub async fn run_item(&self, job: &JobDescriptor, item: &WorkItem) -> ResultPackage {
        match self.exchange(job, item).await {
            Ok(response) => response,
            Err(err) => {
                error!(work = item.index, "子进程派发失败: {err}");
                ResultPackage::failed(RemoteError::from(err))
            }
        }
    }

    async fn exchange(&self, job: &JobDescriptor, item: &WorkItem) -> Result<ResultPackage> {
        let argv = self.build_argv(job, &item.package)?;
        info!(work = item.index, cmd = %argv.join(" "), "spawn子进程");

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped());
        // 作业环境对子进程可见(引导路径、递归深度等都在里面)
        for (key, value) in &job.environment {
            command.env(key, value);
        }

        let mut child = command
            .spawn()
            .map_err(|err| QfarmError::StreamFailure(format!("启动子进程失败: {err}")))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| QfarmError::StreamFailure("拿不到子进程stdin".to_string()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| QfarmError::StreamFailure("拿不到子进程stdout".to_string()))?;

        // 两条请求记录; 随后立刻关掉我们这端的请求管道,
        // 断链会表现为子进程侧的EOF而不是挂起
        let request = async {
            write_frame(&mut stdin, job).await?;
            write_frame(&mut stdin, &item.package).await?;
            Ok::<(), QfarmError>(())
        }
        .await;
        drop(stdin);

        let response = match request {
            Ok(()) => read_frame::<_, ResultPackage>(&mut stdout).await,
            Err(err) => Err(err),
        };

        // 无论响应如何都要回收子进程, 不留僵尸
        if let Err(err) = child.wait().await {
            warn!("回收子进程失败: {err}");
        }

        match response {
            Ok(response) => Ok(response),
            Err(err) => {
                error!(work = item.index, "子进程响应读取失败: {err}");
                Ok(ResultPackage::failed(RemoteError::from(err)))
            }
        }
    }

    /// 子进程命令行: 开发包装前缀 + 程序 + child模式参数。
    /// 程序按 包内interpreter -> 配置 -> QFARM_BIN -> 当前可执行文件
    /// 的顺序决定。
    fn build_argv(&self, job: &JobDescriptor, package: &Envelope) -> Result<Vec<String>> {
        let program = self.resolve_program(job, package)?;
        let mut argv = Vec::new();
        if let Ok(dev_args) = std::env::var(ENV_DEV_ARGS) {
            argv.extend(dev_args.split_whitespace().map(String::from));
        }
        argv.push(program);
        argv.push("--mode".to_string());
        argv.push("child".to_string());
        Ok(argv)
    }

    fn resolve_program(&self, job: &JobDescriptor, package: &Envelope) -> Result<String> {
        if let Some(interpreter) = package.summary.get("interpreter").and_then(Value::as_str) {
            return Ok(interpreter.to_string());
        }
        if let Some(program) = &self.program {
            return Ok(program.clone());
        }
        if let Some(bin) = job.environment.get(ENV_QFARM_BIN) {
            if !bin.is_empty() {
                return Ok(bin.clone());
            }
        }
        if let Ok(bin) = std::env::var(ENV_QFARM_BIN) {
            if !bin.is_empty() {
                return Ok(bin);
            }
        }
        std::env::current_exe()
            .map(|exe| exe.to_string_lossy().into_owned())
            .map_err(|err| QfarmError::StreamFailure(format!("定位子进程程序失败: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qfarm_core::envelope::pack;
    use qfarm_core::WorkPackage;
    use serde_json::json;

    fn job_with_bin(bin: &str) -> JobDescriptor {
        let mut job = JobDescriptor::new("测试", 1);
        job.environment
            .insert(ENV_QFARM_BIN.to_string(), bin.to_string());
        job
    }

    fn packed(package: &WorkPackage) -> Envelope {
        pack(package).unwrap()
    }

    #[test]
    fn test_program_resolution_order() {
        let job = job_with_bin("/from/job/env");

        // 包内interpreter优先
        let mut package = WorkPackage::new("f", vec![], serde_json::Map::new());
        package.interpreter = Some("/from/package".to_string());
        let dispatcher = ChildDispatcher::new(Some("/from/config".to_string()));
        assert_eq!(
            dispatcher.resolve_program(&job, &packed(&package)).unwrap(),
            "/from/package"
        );

        // 其次是配置
        let plain = packed(&WorkPackage::new("f", vec![], serde_json::Map::new()));
        assert_eq!(
            dispatcher.resolve_program(&job, &plain).unwrap(),
            "/from/config"
        );

        // 再退到作业环境里的引导路径
        let dispatcher = ChildDispatcher::new(None);
        assert_eq!(
            dispatcher.resolve_program(&job, &plain).unwrap(),
            "/from/job/env"
        );
    }

    #[test]
    fn test_empty_config_program_is_ignored() {
        let dispatcher = ChildDispatcher::new(Some(String::new()));
        let job = job_with_bin("/from/job/env");
        let plain = packed(&WorkPackage::new("f", vec![], serde_json::Map::new()));
        assert_eq!(
            dispatcher.resolve_program(&job, &plain).unwrap(),
            "/from/job/env"
        );
    }

    #[tokio::test]
    async fn test_spawn_failure_synthesizes_failed_package() {
        let dispatcher = ChildDispatcher::new(Some("/不存在的/qfarm".to_string()));
        let job = JobDescriptor::new("测试", 1);
        let item = qfarm_testing_utils::work_item(
            0,
            "demo:double",
            vec![json!(1)],
            qfarm_core::WorkStatus::Running,
        );

        let response = dispatcher.run_item(&job, &item).await;
        assert_eq!(response.status, qfarm_core::WorkStatus::Failed);
        assert_eq!(response.exception.unwrap().kind, "StreamFailure");
    }

    #[tokio::test]
    async fn test_silent_child_synthesizes_failed_package() {
        // `false` 立即退出且不写任何响应: 读到EOF
        let dispatcher = ChildDispatcher::new(Some("false".to_string()));
        let job = JobDescriptor::new("测试", 1);
        let item = qfarm_testing_utils::work_item(
            0,
            "demo:double",
            vec![json!(1)],
            qfarm_core::WorkStatus::Running,
        );

        let response = dispatcher.run_item(&job, &item).await;
        assert_eq!(response.status, qfarm_core::WorkStatus::Failed);
        assert_eq!(response.exception.unwrap().kind, "StreamFailure");
    }
}
