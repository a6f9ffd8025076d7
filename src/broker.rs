//! 进程内的内存Broker。
//!
//! 演示模式与端到端测试用它把提交侧和worker侧接在同一个进程里;
//! 行为对齐真实Broker的最小语义: 提交分配作业ID, 逐条目派发,
//! 议程耗尽后用complete条目示意worker收尾。

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use qfarm_core::{
    Broker, Envelope, JobDescriptor, JobStatus, QfarmError, Result, SubmittedJob, WorkItem,
    WorkStatus,
};

#[derive(Debug)]
struct JobEntry {
    descriptor: JobDescriptor,
    items: Vec<WorkItem>,
    dispatched: Vec<bool>,
    finalized: Option<WorkStatus>,
}

#[derive(Debug, Default)]
struct BrokerState {
    next_job_id: i64,
    jobs: BTreeMap<i64, JobEntry>,
    /// worker当前正在消费的作业; report_work/report_job作用于它
    current_job: Option<i64>,
}

/// 内存Broker
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 下一个还没收尾的作业, worker宿主据此决定是否继续开循环
    pub fn next_unfinished_job(&self) -> Option<JobDescriptor> {
        let state = self.state.lock().unwrap();
        state
            .jobs
            .values()
            .find(|entry| entry.finalized.is_none())
            .map(|entry| entry.descriptor.clone())
    }
}

fn job_level_status(entry: &JobEntry) -> WorkStatus {
    if entry.items.iter().all(|item| item.status.is_resolved()) {
        if entry
            .items
            .iter()
            .any(|item| item.status == WorkStatus::Failed)
        {
            WorkStatus::Failed
        } else {
            WorkStatus::Complete
        }
    } else {
        WorkStatus::Running
    }
}

/// 议程耗尽或没有作业时递给worker的收尾条目
fn terminal_item() -> WorkItem {
    WorkItem {
        index: 0,
        name: String::new(),
        package: Envelope::default(),
        status: WorkStatus::Complete,
        result_package: None,
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn submit(&self, jobs: Vec<JobDescriptor>) -> Result<Vec<SubmittedJob>> {
        let mut state = self.state.lock().unwrap();
        let mut submitted = Vec::with_capacity(jobs.len());
        for mut job in jobs {
            state.next_job_id += 1;
            let id = state.next_job_id;
            job.id = Some(id);
            let items = job.agenda.clone();
            let dispatched = vec![false; items.len()];
            state.jobs.insert(
                id,
                JobEntry {
                    descriptor: job,
                    items,
                    dispatched,
                    finalized: None,
                },
            );
            submitted.push(SubmittedJob { id });
        }
        Ok(submitted)
    }

    async fn job_status(&self, ids: &[i64], want_agenda: bool) -> Result<Vec<JobStatus>> {
        let state = self.state.lock().unwrap();
        let mut statuses = Vec::with_capacity(ids.len());
        for id in ids {
            let entry = state
                .jobs
                .get(id)
                .ok_or_else(|| QfarmError::Broker(format!("未知作业: {id}")))?;
            statuses.push(JobStatus {
                id: *id,
                status: job_level_status(entry),
                agenda: if want_agenda {
                    entry.items.clone()
                } else {
                    Vec::new()
                },
            });
        }
        Ok(statuses)
    }

    async fn request_work(&self) -> Result<WorkItem> {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let Some((&id, entry)) = state
            .jobs
            .iter_mut()
            .find(|(_, entry)| entry.finalized.is_none())
        else {
            return Ok(terminal_item());
        };

        state.current_job = Some(id);
        match entry.dispatched.iter().position(|done| !done) {
            Some(position) => {
                entry.dispatched[position] = true;
                let mut item = entry.items[position].clone();
                item.status = WorkStatus::Running;
                Ok(item)
            }
            // 所有条目都派过了: 让worker以complete收尾
            None => Ok(terminal_item()),
        }
    }

    async fn report_work(&self, item: &WorkItem) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let current = state
            .current_job
            .ok_or_else(|| QfarmError::Broker("没有正在消费的作业".to_string()))?;
        let entry = state
            .jobs
            .get_mut(&current)
            .ok_or_else(|| QfarmError::Broker(format!("未知作业: {current}")))?;
        let slot = entry
            .items
            .iter_mut()
            .find(|slot| slot.index == item.index)
            .ok_or_else(|| {
                QfarmError::Broker(format!("作业 {current} 没有条目 {}", item.index))
            })?;
        *slot = item.clone();
        Ok(())
    }

    async fn report_job(&self, job_state: WorkStatus) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let current = state
            .current_job
            .take()
            .ok_or_else(|| QfarmError::Broker("没有正在消费的作业".to_string()))?;
        if let Some(entry) = state.jobs.get_mut(&current) {
            entry.finalized = Some(job_state);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qfarm_core::envelope::pack;
    use qfarm_core::{ResultPackage, WorkPackage};
    use serde_json::json;

    fn one_item_job() -> JobDescriptor {
        let mut job = JobDescriptor::new("测试作业", 1);
        let package = WorkPackage::new("demo:double", vec![json!(1)], serde_json::Map::new());
        job.agenda
            .push(WorkItem::new(0, "1", pack(&package).unwrap()));
        job
    }

    #[tokio::test]
    async fn test_submit_assigns_ids() {
        let broker = InMemoryBroker::new();
        let submitted = broker
            .submit(vec![one_item_job(), one_item_job()])
            .await
            .unwrap();
        assert_eq!(submitted[0].id, 1);
        assert_eq!(submitted[1].id, 2);
        assert_eq!(broker.next_unfinished_job().unwrap().id, Some(1));
    }

    #[tokio::test]
    async fn test_work_cycle() {
        let broker = InMemoryBroker::new();
        let id = broker.submit(vec![one_item_job()]).await.unwrap()[0].id;

        // 派发 -> 上报 -> 收尾
        let mut item = broker.request_work().await.unwrap();
        assert_eq!(item.status, WorkStatus::Running);
        item.status = WorkStatus::Complete;
        item.result_package = Some(pack(&ResultPackage::complete(json!(2))).unwrap());
        broker.report_work(&item).await.unwrap();

        let ending = broker.request_work().await.unwrap();
        assert_eq!(ending.status, WorkStatus::Complete);
        broker.report_job(WorkStatus::Complete).await.unwrap();

        assert!(broker.next_unfinished_job().is_none());
        let statuses = broker.job_status(&[id], true).await.unwrap();
        assert_eq!(statuses[0].status, WorkStatus::Complete);
        assert_eq!(statuses[0].agenda[0].status, WorkStatus::Complete);
    }

    #[tokio::test]
    async fn test_status_without_agenda_is_summary_only() {
        let broker = InMemoryBroker::new();
        let id = broker.submit(vec![one_item_job()]).await.unwrap()[0].id;
        let statuses = broker.job_status(&[id], false).await.unwrap();
        assert_eq!(statuses[0].status, WorkStatus::Running);
        assert!(statuses[0].agenda.is_empty());
    }
}
