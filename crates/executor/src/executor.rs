//! 作业构建与提交。
//!
//! Executor构造时的 [`JobDefaults`] 是每个提交作业的模板,
//! 单次调用的 [`SubmitExtra`] 覆盖在模板之上。提交是非阻塞的:
//! 作业交给Broker、future注册进轮询器之后立即返回。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::info;

use qfarm_core::envelope::pack;
use qfarm_core::{
    Broker, JobDefaults, JobDescriptor, QfarmError, Result, WorkItem, WorkPackage, ENV_LEVEL,
    ENV_QFARM_BIN, ENV_RECURSION_LIMIT,
};

use crate::batch::Batch;
use crate::future::WorkFuture;
use crate::poller::Poller;

/// 单次提交的覆盖参数
#[derive(Debug, Clone, Default)]
pub struct SubmitExtra {
    pub job_name: Option<String>,
    pub work_name: Option<String>,
    pub cpu_count: Option<u32>,
    /// 覆盖子进程程序
    pub interpreter: Option<String>,
    /// worker侧解包前运行的preflight函数名
    pub preflight: Option<String>,
    /// 追加进作业环境的变量
    pub environment: HashMap<String, String>,
    /// 透传进工作包的额外字段
    pub package_extra: Map<String, Value>,
}

/// `map` 的选项
#[derive(Debug, Clone, Default)]
pub struct MapOptions {
    /// 所有结果等待共享的总限期, 不是逐条超时
    pub timeout: Option<Duration>,
    pub extra: SubmitExtra,
}

/// 把可调用对象异步地提交到远端作业队列执行
#[derive(Clone)]
pub struct Executor {
    broker: Arc<dyn Broker>,
    poller: Arc<Poller>,
    defaults: JobDefaults,
}

impl Executor {
    pub fn new(broker: Arc<dyn Broker>, poller: Arc<Poller>, defaults: JobDefaults) -> Self {
        Self {
            broker,
            poller,
            defaults,
        }
    }

    /// 提交 `func(args)` 的远端执行, 立即返回对应的future
    pub async fn submit(&self, func: &str, args: Vec<Value>) -> Result<WorkFuture> {
        self.submit_ext(func, args, Map::new(), SubmitExtra::default())
            .await
    }

    /// 带关键字参数与作业级覆盖的扩展提交
    pub async fn submit_ext(
        &self,
        func: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        extra: SubmitExtra,
    ) -> Result<WorkFuture> {
        let mut job = self.base_job(Some(func), &extra)?;
        let package = build_package(&self.defaults, func, args, kwargs, &extra);
        let name = extra.work_name.clone().unwrap_or_else(|| "1".to_string());
        job.agenda.push(WorkItem::new(0, name, pack(&package)?));

        let mut futures = self.submit_job(job).await?;
        futures
            .pop()
            .ok_or_else(|| QfarmError::Internal("提交未产生future".to_string()))
    }

    /// `map(func, argsets)` 的远端版本: 一个作业, 每组参数一个
    /// 工作条目, 结果按提交顺序惰性产出。参数元组在调用侧打包
    /// (标准的zip语义: 最短的迭代器决定长度)。
    pub async fn map<I>(&self, func: &str, argsets: I, options: MapOptions) -> Result<ResultStream>
    where
        I: IntoIterator<Item = Vec<Value>>,
    {
        let mut job = self.base_job(Some(func), &options.extra)?;
        for (index, args) in argsets.into_iter().enumerate() {
            let package = build_package(&self.defaults, func, args, Map::new(), &options.extra);
            job.agenda.push(WorkItem::new(
                index as u32,
                (index + 1).to_string(),
                pack(&package)?,
            ));
        }
        let futures = self.submit_job(job).await?;
        Ok(ResultStream::new(futures, options.timeout))
    }

    /// 开始一个批次: 多次 submit/map 累积进同一个作业,
    /// `commit` 时一次性提交
    pub fn batch(&self, extra: SubmitExtra) -> Result<Batch> {
        let job = self.base_job(None, &extra)?;
        Ok(Batch::new(
            Arc::clone(&self.broker),
            Arc::clone(&self.poller),
            self.defaults.clone(),
            job,
        ))
    }

    /// 作用域批次: 闭包正常返回才提交, 出错则什么都不提交
    pub async fn with_batch<T>(
        &self,
        extra: SubmitExtra,
        scope: impl FnOnce(&mut Batch) -> Result<T>,
    ) -> Result<(T, Vec<WorkFuture>)> {
        let mut batch = self.batch(extra)?;
        let value = scope(&mut batch)?;
        let futures = batch.commit().await?;
        Ok((value, futures))
    }

    /// 提交作业并把每个条目的future注册进轮询器
    pub(crate) async fn submit_job(&self, job: JobDescriptor) -> Result<Vec<WorkFuture>> {
        let agenda_len = job.agenda.len();
        let job_name = job.name.clone();
        let submitted = self.broker.submit(vec![job]).await?;
        let job_id = submitted
            .first()
            .map(|job| job.id)
            .ok_or_else(|| QfarmError::Broker("提交未返回作业ID".to_string()))?;

        let mut futures = Vec::with_capacity(agenda_len);
        for work_id in 0..agenda_len as u32 {
            let future = WorkFuture::new(Arc::clone(&self.broker), job_id, work_id);
            self.poller.add(future.clone());
            futures.push(future);
        }
        self.poller.trigger();
        info!(job_id, name = %job_name, items = agenda_len, "作业已提交");
        Ok(futures)
    }

    /// 作业模板: 默认值 + 单次覆盖 + 引导/透传环境变量 + 递归防护
    fn base_job(&self, func: Option<&str>, extra: &SubmitExtra) -> Result<JobDescriptor> {
        let name = extra.job_name.clone().unwrap_or_else(|| match func {
            Some(func) => format!("{}: {func}", self.defaults.name_prefix),
            None => self.defaults.name_prefix.clone(),
        });
        let mut job =
            JobDescriptor::new(name, extra.cpu_count.unwrap_or(self.defaults.cpu_count));

        job.environment = self.defaults.environment.clone();
        job.environment.extend(extra.environment.clone());

        // 让未安装本库的worker主机也能引导出子进程
        if let Ok(exe) = std::env::current_exe() {
            job.environment
                .entry(ENV_QFARM_BIN.to_string())
                .or_insert_with(|| exe.to_string_lossy().into_owned());
        }

        // 透传选定的环境变量
        for name in &self.defaults.environ_passthrough {
            if let Ok(value) = std::env::var(name) {
                job.environment.insert(name.clone(), value);
            }
        }

        // 防止某个函数无限递归地继续提交作业
        let depth = self.current_depth();
        let limit = self.recursion_limit();
        if depth > limit {
            return Err(QfarmError::RecursionLimit { depth, limit });
        }
        job.environment
            .insert(ENV_LEVEL.to_string(), (depth + 1).to_string());

        Ok(job)
    }

    /// 模板环境里的深度覆盖优先于进程环境变量
    fn current_depth(&self) -> u32 {
        self.defaults
            .environment
            .get(ENV_LEVEL)
            .cloned()
            .or_else(|| std::env::var(ENV_LEVEL).ok())
            .and_then(|value| value.parse().ok())
            .unwrap_or(0)
    }

    fn recursion_limit(&self) -> u32 {
        std::env::var(ENV_RECURSION_LIMIT)
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(self.defaults.recursion_limit)
    }
}

/// 按默认值与单次覆盖构建工作包
pub(crate) fn build_package(
    defaults: &JobDefaults,
    func: &str,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
    extra: &SubmitExtra,
) -> WorkPackage {
    let mut package = WorkPackage::new(func, args, kwargs);
    package.interpreter = extra
        .interpreter
        .clone()
        .or_else(|| defaults.interpreter.clone());
    package.preflight = extra.preflight.clone();
    package.extra = extra.package_extra.clone();
    package
}

/// `map` 的结果序列: 有限、按提交顺序、不可重启。
/// 提前终止(出错、超时或丢弃)时取消所有未完成的future。
pub struct ResultStream {
    futures: std::collections::VecDeque<WorkFuture>,
    deadline: Option<tokio::time::Instant>,
}

impl ResultStream {
    pub(crate) fn new(futures: Vec<WorkFuture>, timeout: Option<Duration>) -> Self {
        Self {
            futures: futures.into(),
            deadline: timeout.map(|t| tokio::time::Instant::now() + t),
        }
    }

    /// 按提交顺序取下一个结果; 序列耗尽时返回 `None`
    pub async fn next(&mut self) -> Option<Result<Value>> {
        let future = self.futures.pop_front()?;
        let result = match self.deadline {
            None => future.result(None).await,
            Some(deadline) => {
                // 总限期随着每次等待递减
                let now = tokio::time::Instant::now();
                if now >= deadline {
                    Err(QfarmError::Timeout)
                } else {
                    future.result(Some(deadline - now)).await
                }
            }
        };
        if result.is_err() {
            future.cancel();
            self.cancel_remaining();
        }
        Some(result)
    }

    /// 顺序收集所有剩余结果, 第一个错误短路返回
    pub async fn collect(mut self) -> Result<Vec<Value>> {
        let mut values = Vec::with_capacity(self.futures.len());
        while let Some(result) = self.next().await {
            values.push(result?);
        }
        Ok(values)
    }

    pub fn cancel_remaining(&mut self) {
        for future in &self.futures {
            future.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.futures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.futures.is_empty()
    }
}

impl Drop for ResultStream {
    fn drop(&mut self) {
        self.cancel_remaining();
    }
}
