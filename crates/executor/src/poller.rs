//! 后台future解析引擎。
//!
//! 每个进程一个轮询任务, 首次 `trigger()` 时惰性启动, 显式
//! `shutdown()` 关闭。它独占待办future集合: 新提交的future
//! 经线程安全的队列移交进来, 状态查询发现终态条目后弹出
//! 对应future并解析它。等待/唤醒用电平触发的事件,
//! 唤醒前的多次 `trigger()` 合并为一次。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use qfarm_core::envelope::unpack;
use qfarm_core::{Broker, JobStatus, PollerSettings, QfarmError, Result, ResultPackage, WorkItem};

use crate::future::WorkFuture;

/// 轮询器参数
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// 间隔乘性增长因子。2倍增长对这类Broker退得太快,
    /// 默认用平缓的1.15。
    pub backoff_factor: f64,
    /// 两段式轮询: 先做廉价的作业级查询, 只对已结束的作业发
    /// 昂贵的逐条目查询。在逐条目查询明显更贵的Broker上启用。
    pub two_stage: bool,
    pub query_retries: u32,
    pub query_retry_delay: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self::from_settings(&PollerSettings::default())
    }
}

impl PollerConfig {
    pub fn from_settings(settings: &PollerSettings) -> Self {
        Self {
            min_delay: settings.min_delay(),
            max_delay: settings.max_delay(),
            backoff_factor: settings.backoff_factor,
            two_stage: settings.two_stage,
            query_retries: settings.query_retries,
            query_retry_delay: settings.query_retry_delay(),
        }
    }
}

/// future解析轮询器
pub struct Poller {
    broker: Arc<dyn Broker>,
    config: PollerConfig,
    incoming_tx: mpsc::UnboundedSender<WorkFuture>,
    incoming_rx: Mutex<Option<mpsc::UnboundedReceiver<WorkFuture>>>,
    wake: Arc<Notify>,
    fast: Arc<AtomicBool>,
    started: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Poller {
    pub fn new(broker: Arc<dyn Broker>, config: PollerConfig) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            broker,
            config,
            incoming_tx,
            incoming_rx: Mutex::new(Some(incoming_rx)),
            wake: Arc::new(Notify::new()),
            fast: Arc::new(AtomicBool::new(false)),
            started: AtomicBool::new(false),
            shutdown_tx,
            handle: Mutex::new(None),
        }
    }

    /// 注册一个新future。注册后要调用 `trigger()` 保证及时轮询。
    pub fn add(&self, future: WorkFuture) {
        if self.incoming_tx.send(future).is_err() {
            warn!("轮询循环已退出, future 不会被解析");
        }
    }

    /// 把轮询间隔拉回最小值并唤醒等待, 保证提交后的第一次轮询
    /// 立刻发生而不是等完陈旧的退避窗口。首次调用启动轮询任务。
    pub fn trigger(&self) {
        self.fast.store(true, Ordering::SeqCst);
        self.wake.notify_one();

        if !self.started.swap(true, Ordering::SeqCst) {
            let receiver = self
                .incoming_rx
                .lock()
                .unwrap()
                .take();
            if let Some(receiver) = receiver {
                let broker = Arc::clone(&self.broker);
                let config = self.config.clone();
                let wake = Arc::clone(&self.wake);
                let fast = Arc::clone(&self.fast);
                let shutdown_rx = self.shutdown_tx.subscribe();
                let task = tokio::spawn(run_loop(broker, config, receiver, wake, fast, shutdown_rx));
                *self.handle.lock().unwrap() = Some(task);
            }
        }
    }

    /// 有序关闭: 通知循环退出并等它结束
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        self.wake.notify_one();
        let task = self.handle.lock().unwrap().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!("轮询任务未正常退出: {err}");
            }
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        // 进程收尾时让后台循环自行退出
        self.shutdown_tx.send_replace(true);
        self.wake.notify_one();
    }
}

async fn run_loop(
    broker: Arc<dyn Broker>,
    config: PollerConfig,
    mut incoming: mpsc::UnboundedReceiver<WorkFuture>,
    wake: Arc<Notify>,
    fast: Arc<AtomicBool>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut pending: HashMap<(i64, u32), WorkFuture> = HashMap::new();
    let mut delay = config.max_delay;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // 间隔逐步增长, 有上限; trigger 会提前唤醒并压回最小值
        delay = grow_delay(delay, &config);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = wake.notified() => {}
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
        if fast.swap(false, Ordering::SeqCst) {
            delay = config.min_delay;
        }

        // 收取新注册的future。没有任何待办时在队列上阻塞,
        // 免得循环空转。
        loop {
            match incoming.try_recv() {
                Ok(future) => register(&mut pending, future),
                Err(TryRecvError::Empty) => {
                    if !pending.is_empty() {
                        break;
                    }
                    tokio::select! {
                        received = incoming.recv() => match received {
                            Some(future) => register(&mut pending, future),
                            None => return,
                        },
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                return;
                            }
                        }
                    }
                }
                Err(TryRecvError::Disconnected) => {
                    if pending.is_empty() {
                        return;
                    }
                    break;
                }
            }
        }

        // 被取消的future从待办集中剪掉; 剪完为空就回到空闲间隔
        pending.retain(|_, future| !future.is_cancelled());
        if pending.is_empty() {
            delay = config.max_delay;
            continue;
        }

        let mut job_ids: Vec<i64> = pending.keys().map(|(job_id, _)| *job_id).collect();
        job_ids.sort_unstable();
        job_ids.dedup();

        let jobs = match query_with_retry(&*broker, &job_ids, !config.two_stage, &config).await {
            Ok(jobs) => jobs,
            Err(err) => {
                error!("Broker状态查询失败, 放弃本周期: {err}");
                continue;
            }
        };

        // 两段式: 只对已结束的作业发逐条目查询
        let jobs = if config.two_stage {
            let finished: Vec<i64> = jobs
                .iter()
                .filter(|job| job.status.is_resolved())
                .map(|job| job.id)
                .collect();
            if finished.is_empty() {
                continue;
            }
            match query_with_retry(&*broker, &finished, true, &config).await {
                Ok(jobs) => jobs,
                Err(err) => {
                    error!("Broker议程查询失败, 放弃本周期: {err}");
                    continue;
                }
            }
        } else {
            jobs
        };

        for job in &jobs {
            for item in &job.agenda {
                if !item.status.is_resolved() {
                    continue;
                }
                let Some(future) = pending.remove(&(job.id, item.index)) else {
                    continue;
                };
                // 出现一个结果往往预示更多结果将至, 拉回全速
                delay = config.min_delay;
                resolve_future(&future, item);
            }
        }
    }

    debug!("轮询循环退出");
}

fn grow_delay(delay: Duration, config: &PollerConfig) -> Duration {
    delay.mul_f64(config.backoff_factor).min(config.max_delay)
}

fn register(pending: &mut HashMap<(i64, u32), WorkFuture>, future: WorkFuture) {
    let Some(key) = future.key() else {
        warn!("忽略尚未分配身份的future");
        return;
    };
    if future.is_cancelled() {
        return;
    }
    if pending.insert(key, future).is_some() {
        warn!(
            job_id = key.0,
            work_id = key.1,
            "同一身份的future被重复注册, 旧条目已替换"
        );
    }
}

fn resolve_future(future: &WorkFuture, item: &WorkItem) {
    let Some(envelope) = &item.result_package else {
        warn!(work_id = item.index, "终态条目没有结果包");
        future.resolve_malformed();
        return;
    };
    match unpack::<ResultPackage>(envelope) {
        Ok(result) => {
            if let Some(value) = result.result {
                future.resolve_value(value);
            } else if let Some(exception) = result.exception {
                future.resolve_error(exception);
            } else {
                warn!(work_id = item.index, "结果包缺少 result/exception 字段");
                future.resolve_malformed();
            }
        }
        Err(err) => {
            warn!(work_id = item.index, "结果包解码失败: {err}");
            future.resolve_malformed();
        }
    }
    debug!(work_id = item.index, status = %item.status, "future已解析");
}

/// 单个轮询周期内的有界重试; 用尽后由调用方放弃本周期,
/// 循环在下个周期重新尝试
async fn query_with_retry(
    broker: &dyn Broker,
    ids: &[i64],
    want_agenda: bool,
    config: &PollerConfig,
) -> Result<Vec<JobStatus>> {
    let mut last_err = None;
    for attempt in 1..=config.query_retries {
        match broker.job_status(ids, want_agenda).await {
            Ok(jobs) => return Ok(jobs),
            Err(err) => {
                warn!(attempt, "Broker查询失败: {err}");
                last_err = Some(err);
                if attempt < config.query_retries {
                    tokio::time::sleep(config.query_retry_delay).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| QfarmError::Broker("查询未执行".to_string())))
}
