//! 批量提交: 多次 submit/map 累积为一个作业的议程,
//! `commit()` 时只向Broker提交一次。
//!
//! commit之前不会有任何条目被提交, future的身份也只在commit时
//! 分配; 在那之前使用这些future的结果操作会一直等待。

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::info;

use qfarm_core::envelope::pack;
use qfarm_core::{Broker, JobDefaults, JobDescriptor, QfarmError, Result, WorkItem};

use crate::executor::{build_package, MapOptions, ResultStream, SubmitExtra};
use crate::future::WorkFuture;
use crate::poller::Poller;

/// 累积中的批次
pub struct Batch {
    broker: Arc<dyn Broker>,
    poller: Arc<Poller>,
    defaults: JobDefaults,
    job: JobDescriptor,
    futures: Vec<WorkFuture>,
}

impl Batch {
    pub(crate) fn new(
        broker: Arc<dyn Broker>,
        poller: Arc<Poller>,
        defaults: JobDefaults,
        job: JobDescriptor,
    ) -> Self {
        Self {
            broker,
            poller,
            defaults,
            job,
            futures: Vec::new(),
        }
    }

    /// 追加一个条目; 只累积, 不触发任何Broker调用
    pub fn submit(&mut self, func: &str, args: Vec<Value>) -> Result<WorkFuture> {
        self.submit_ext(func, args, Map::new(), SubmitExtra::default())
    }

    pub fn submit_ext(
        &mut self,
        func: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        extra: SubmitExtra,
    ) -> Result<WorkFuture> {
        let index = self.job.agenda.len() as u32;
        let package = build_package(&self.defaults, func, args, kwargs, &extra);
        let name = extra
            .work_name
            .clone()
            .unwrap_or_else(|| format!("{}: {func}", index + 1));
        self.job.agenda.push(WorkItem::new(index, name, pack(&package)?));

        let future = WorkFuture::unassigned(Arc::clone(&self.broker));
        self.futures.push(future.clone());
        Ok(future)
    }

    /// 批次内的 `map`; 返回的序列要等 `commit()` 之后才能消费
    pub fn map<I>(&mut self, func: &str, argsets: I, options: MapOptions) -> Result<ResultStream>
    where
        I: IntoIterator<Item = Vec<Value>>,
    {
        let mut futures = Vec::new();
        for args in argsets {
            futures.push(self.submit_ext(func, args, Map::new(), options.extra.clone())?);
        }
        Ok(ResultStream::new(futures, options.timeout))
    }

    pub fn len(&self) -> usize {
        self.job.agenda.len()
    }

    pub fn is_empty(&self) -> bool {
        self.job.agenda.is_empty()
    }

    /// 执行真正的提交: 恰好一次Broker调用, 携带累积的全部条目。
    /// future在这里获得身份并注册进轮询器。
    pub async fn commit(self) -> Result<Vec<WorkFuture>> {
        let items = self.job.agenda.len();
        let job_name = self.job.name.clone();
        let submitted = self.broker.submit(vec![self.job]).await?;
        let job_id = submitted
            .first()
            .map(|job| job.id)
            .ok_or_else(|| QfarmError::Broker("提交未返回作业ID".to_string()))?;

        for (work_id, future) in self.futures.iter().enumerate() {
            future.assign_id(job_id, work_id as u32);
            self.poller.add(future.clone());
        }
        self.poller.trigger();
        info!(job_id, name = %job_name, items, "批次已提交");
        Ok(self.futures)
    }
}
