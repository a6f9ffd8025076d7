//! 演示模式: 在一个进程里跑通 提交 -> Broker -> worker循环 ->
//! 子进程 -> 轮询器 -> future 的完整管线。
//! 子进程就是本可执行文件的 `--mode child`。

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::info;

use qfarm_core::{AppConfig, Broker, QfarmError};
use qfarm_executor::{Executor, MapOptions, Poller, PollerConfig};
use qfarm_worker::{ChildDispatcher, FunctionRegistry, WorkerLoop};

use crate::broker::InMemoryBroker;

/// 子进程与演示共用的函数注册表
pub fn build_registry() -> FunctionRegistry {
    let mut registry = FunctionRegistry::new();

    registry.register_fn("demo:double", |args, _kwargs| {
        let x = args
            .first()
            .and_then(Value::as_i64)
            .ok_or_else(|| QfarmError::Internal("demo:double 需要一个整数参数".to_string()))?;
        Ok(json!(x * 2))
    });

    registry.register_fn("demo:echo", |args, kwargs| {
        Ok(json!({ "args": args, "kwargs": kwargs }))
    });

    registry.register_fn("demo:fail", |_args, _kwargs| {
        Err(QfarmError::Internal("演示用的失败函数".to_string()))
    });

    registry.register_preflight_fn("demo:announce", |envelope| {
        info!(fields = envelope.summary.len(), "preflight: 环境已就绪");
        Ok(())
    });

    registry
}

/// 跑一遍演示管线
pub async fn run_demo(app_config: AppConfig) -> anyhow::Result<()> {
    let broker = Arc::new(InMemoryBroker::new());
    let broker_dyn: Arc<dyn Broker> = broker.clone();

    let poller = Arc::new(Poller::new(
        Arc::clone(&broker_dyn),
        PollerConfig::from_settings(&app_config.poller),
    ));
    let executor = Executor::new(
        Arc::clone(&broker_dyn),
        Arc::clone(&poller),
        app_config.job.clone(),
    );

    info!("提交演示作业");
    let single = executor.submit("demo:double", vec![json!(21)]).await?;
    let stream = executor
        .map(
            "demo:double",
            (1..=3).map(|i| vec![json!(i)]),
            MapOptions::default(),
        )
        .await?;

    // 本进程内驱动worker循环, 真正的函数调用发生在子进程里
    let dispatcher = ChildDispatcher::new(if app_config.worker.child_program.is_empty() {
        None
    } else {
        Some(app_config.worker.child_program.clone())
    });
    let worker = WorkerLoop::new(
        Arc::clone(&broker_dyn),
        dispatcher,
        app_config.worker.clone(),
    );
    while let Some(job) = broker.next_unfinished_job() {
        let state = worker.run(&job).await?;
        info!(job = %job.name, state = %state, "作业收尾");
    }

    let value = single.result(Some(Duration::from_secs(30))).await?;
    info!("demo:double(21) = {value}");
    for value in stream.collect().await? {
        info!("map结果: {value}");
    }

    poller.shutdown().await;
    info!("演示结束");
    Ok(())
}
