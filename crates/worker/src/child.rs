//! 子执行器: 被worker循环spawn出来的子进程入口。
//!
//! 从输入流读两条请求记录(作业描述、打包的工作包), 执行后向
//! 输出流写回恰好一条响应记录。写响应在每条退出路径上都会发生,
//! 否则worker循环会在响应管道上无限期阻塞。

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info};

use qfarm_core::envelope::unpack;
use qfarm_core::{Envelope, JobDescriptor, QfarmError, RemoteError, Result, ResultPackage, WorkPackage};

use crate::framing::{read_frame, write_frame};
use crate::registry::FunctionRegistry;

/// 在给定的字节流上执行一次完整的请求/响应交换
pub async fn run_child<R, W>(
    reader: &mut R,
    writer: &mut W,
    registry: &FunctionRegistry,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let response = match execute_request(reader, registry).await {
        Ok(response) => response,
        Err(err) => {
            // 所有早期错误(读请求失败、preflight失败、函数未注册)
            // 同样作为failed响应送回
            error!("工作包执行失败: {err}");
            ResultPackage::failed(RemoteError::from(err))
        }
    };
    write_frame(writer, &response).await
}

async fn execute_request<R>(reader: &mut R, registry: &FunctionRegistry) -> Result<ResultPackage>
where
    R: AsyncRead + Unpin,
{
    let job: JobDescriptor = read_frame(reader).await?;
    let envelope: Envelope = read_frame(reader).await?;
    debug!(job = %job.name, "收到工作包");

    // preflight在解包之前运行: 它可能要先搭好解包或函数解析
    // 所依赖的环境。名字从浅层投影读取, 信封此时仍是打包状态。
    if let Some(name) = envelope.summary.get("preflight").and_then(Value::as_str) {
        info!("运行preflight: {name}");
        registry.resolve_preflight(name)?.run(&envelope).await?;
    }

    let package: WorkPackage = unpack(&envelope)?;
    let function = registry.resolve(&package.func)?;
    info!(func = %package.func, args = package.args.len(), "调用函数");

    match function.call(package.args, package.kwargs).await {
        Ok(value) => Ok(ResultPackage::complete(value)),
        Err(err) => {
            // 函数内部的错误作为数据送回, 同时留下本地诊断痕迹
            error!(func = %package.func, "函数执行失败: {err}");
            Ok(ResultPackage::failed(RemoteError::from(err)))
        }
    }
}

/// 子进程入口。stdin/stdout就是与worker循环之间的字节管道,
/// 日志必须走stderr。
pub async fn child_main(registry: &FunctionRegistry) -> Result<()> {
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let outcome = run_child(&mut stdin, &mut stdout, registry).await;
    // 退出前确保响应真正离开缓冲区
    stdout
        .flush()
        .await
        .map_err(|err| QfarmError::StreamFailure(format!("冲刷响应管道失败: {err}")))?;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use qfarm_core::envelope::pack;
    use qfarm_core::WorkStatus;
    use serde_json::{json, Map};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn test_registry() -> FunctionRegistry {
        let mut registry = FunctionRegistry::new();
        registry.register_fn("demo:double", |args, _kwargs| {
            let x = args
                .first()
                .and_then(Value::as_i64)
                .ok_or_else(|| QfarmError::Internal("需要一个整数参数".to_string()))?;
            Ok(json!(x * 2))
        });
        registry.register_fn("demo:raise", |_args, _kwargs| {
            Err(QfarmError::Internal("ValueError: 演示失败".to_string()))
        });
        registry
    }

    /// 把请求帧写给子执行器并取回它的响应
    async fn exchange(registry: &FunctionRegistry, package: &WorkPackage) -> ResultPackage {
        let (parent_io, child_io) = tokio::io::duplex(64 * 1024);
        let (mut parent_reader, mut parent_writer) = tokio::io::split(parent_io);
        let (mut child_reader, mut child_writer) = tokio::io::split(child_io);

        let job = JobDescriptor::new("测试作业", 1);
        write_frame(&mut parent_writer, &job).await.unwrap();
        write_frame(&mut parent_writer, &pack(package).unwrap())
            .await
            .unwrap();

        run_child(&mut child_reader, &mut child_writer, registry)
            .await
            .unwrap();
        read_frame(&mut parent_reader).await.unwrap()
    }

    #[tokio::test]
    async fn test_successful_invocation() {
        let registry = test_registry();
        let package = WorkPackage::new("demo:double", vec![json!(21)], Map::new());
        let response = exchange(&registry, &package).await;
        assert_eq!(response.status, WorkStatus::Complete);
        assert_eq!(response.result, Some(json!(42)));
        assert!(response.exception.is_none());
    }

    #[tokio::test]
    async fn test_function_error_becomes_failed_response() {
        let registry = test_registry();
        let package = WorkPackage::new("demo:raise", vec![], Map::new());
        let response = exchange(&registry, &package).await;
        assert_eq!(response.status, WorkStatus::Failed);
        assert!(response.result.is_none());
        let exception = response.exception.unwrap();
        assert_eq!(exception.kind, "Internal");
        assert!(exception.message.contains("ValueError"));
    }

    #[tokio::test]
    async fn test_unregistered_function() {
        let registry = test_registry();
        let package = WorkPackage::new("nowhere:missing", vec![], Map::new());
        let response = exchange(&registry, &package).await;
        assert_eq!(response.status, WorkStatus::Failed);
        assert_eq!(response.exception.unwrap().kind, "FuncNotFound");
    }

    #[tokio::test]
    async fn test_preflight_runs_before_unpack_on_packed_envelope() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran_flag = Arc::clone(&ran);

        let mut registry = test_registry();
        registry.register_preflight_fn("env:prepare", move |envelope| {
            // preflight看到的还是打包状态的信封
            assert!(envelope.blob.is_some());
            assert_eq!(
                envelope.summary.get("preflight"),
                Some(&json!("env:prepare"))
            );
            ran_flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        let mut package = WorkPackage::new("demo:double", vec![json!(5)], Map::new());
        package.preflight = Some("env:prepare".to_string());

        let response = exchange(&registry, &package).await;
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(response.result, Some(json!(10)));
    }

    #[tokio::test]
    async fn test_preflight_failure_becomes_failed_response() {
        let mut registry = test_registry();
        registry.register_preflight_fn("env:broken", |_envelope| {
            Err(QfarmError::Internal("环境搭建失败".to_string()))
        });

        let mut package = WorkPackage::new("demo:double", vec![json!(5)], Map::new());
        package.preflight = Some("env:broken".to_string());

        let response = exchange(&registry, &package).await;
        assert_eq!(response.status, WorkStatus::Failed);
        assert!(response.exception.unwrap().message.contains("环境搭建失败"));
    }

    #[tokio::test]
    async fn test_garbage_request_still_gets_a_response() {
        use tokio::io::AsyncWriteExt;

        let (parent_io, child_io) = tokio::io::duplex(4096);
        let (mut parent_reader, mut parent_writer) = tokio::io::split(parent_io);
        let (mut child_reader, mut child_writer) = tokio::io::split(child_io);

        // 第一条记录就不是合法的作业描述
        write_frame(&mut parent_writer, &json!(42)).await.unwrap();
        parent_writer.flush().await.unwrap();

        let registry = test_registry();
        run_child(&mut child_reader, &mut child_writer, &registry)
            .await
            .unwrap();

        let response: ResultPackage = read_frame(&mut parent_reader).await.unwrap();
        assert_eq!(response.status, WorkStatus::Failed);
        assert!(response.exception.is_some());
    }
}
