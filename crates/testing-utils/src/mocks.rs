//! 脚本化的内存Broker。
//!
//! 提交侧: 记录提交的作业, 测试通过 `finish_work` 驱动条目进入终态,
//! `set_resolved_visible_after` 可以让结果直到第N次状态查询才可见,
//! 用来检验轮询行为。
//! worker侧: `push_work` 预置 `request_work` 的应答脚本,
//! 上报的条目与作业终态全部留档供断言。

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use qfarm_core::envelope::{pack, Envelope};
use qfarm_core::{
    Broker, JobDescriptor, JobStatus, QfarmError, Result, ResultPackage, SubmittedJob, WorkItem,
    WorkStatus,
};

#[derive(Debug, Default)]
struct MockState {
    next_job_id: i64,
    submitted: Vec<JobDescriptor>,
    agendas: HashMap<i64, Vec<WorkItem>>,

    status_calls: u32,
    summary_queries: u32,
    agenda_queries: u32,
    resolved_visible_after: u32,
    fail_status_calls: u32,

    work_script: VecDeque<WorkItem>,
    work_requests: u32,
    reported_work: Vec<WorkItem>,
    reported_job: Option<WorkStatus>,
}

/// 测试用Broker, 全部状态在内存中
#[derive(Debug, Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<MockState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 把某个条目置为终态并写入结果信封
    pub fn finish_work(&self, job_id: i64, index: u32, result: ResultPackage) {
        let envelope = pack(&result).expect("打包结果失败");
        let mut state = self.state.lock().unwrap();
        let agenda = state
            .agendas
            .get_mut(&job_id)
            .unwrap_or_else(|| panic!("未知作业: {job_id}"));
        let item = agenda
            .iter_mut()
            .find(|item| item.index == index)
            .unwrap_or_else(|| panic!("作业 {job_id} 没有条目 {index}"));
        item.status = result.status;
        item.result_package = Some(envelope);
    }

    /// 终态只在第 `n` 次状态查询起可见, 之前一律显示为 running
    pub fn set_resolved_visible_after(&self, n: u32) {
        self.state.lock().unwrap().resolved_visible_after = n;
    }

    /// 接下来 `n` 次状态查询直接报错, 模拟Broker瞬时故障
    pub fn fail_next_status_calls(&self, n: u32) {
        self.state.lock().unwrap().fail_status_calls = n;
    }

    /// 预置一条 `request_work` 应答; 脚本耗尽后返回 complete 条目
    pub fn push_work(&self, item: WorkItem) {
        self.state.lock().unwrap().work_script.push_back(item);
    }

    pub fn submitted_jobs(&self) -> Vec<JobDescriptor> {
        self.state.lock().unwrap().submitted.clone()
    }

    pub fn status_call_count(&self) -> u32 {
        self.state.lock().unwrap().status_calls
    }

    pub fn summary_query_count(&self) -> u32 {
        self.state.lock().unwrap().summary_queries
    }

    pub fn agenda_query_count(&self) -> u32 {
        self.state.lock().unwrap().agenda_queries
    }

    pub fn work_request_count(&self) -> u32 {
        self.state.lock().unwrap().work_requests
    }

    pub fn reported_work(&self) -> Vec<WorkItem> {
        self.state.lock().unwrap().reported_work.clone()
    }

    pub fn reported_job(&self) -> Option<WorkStatus> {
        self.state.lock().unwrap().reported_job
    }
}

fn job_level_status(agenda: &[WorkItem]) -> WorkStatus {
    if agenda.iter().all(|item| item.status.is_resolved()) {
        if agenda.iter().any(|item| item.status == WorkStatus::Failed) {
            WorkStatus::Failed
        } else {
            WorkStatus::Complete
        }
    } else {
        WorkStatus::Running
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn submit(&self, jobs: Vec<JobDescriptor>) -> Result<Vec<SubmittedJob>> {
        let mut state = self.state.lock().unwrap();
        let mut submitted = Vec::with_capacity(jobs.len());
        for mut job in jobs {
            state.next_job_id += 1;
            let id = state.next_job_id;
            job.id = Some(id);
            state.agendas.insert(id, job.agenda.clone());
            state.submitted.push(job);
            submitted.push(SubmittedJob { id });
        }
        Ok(submitted)
    }

    async fn job_status(&self, ids: &[i64], want_agenda: bool) -> Result<Vec<JobStatus>> {
        let mut state = self.state.lock().unwrap();
        state.status_calls += 1;
        if want_agenda {
            state.agenda_queries += 1;
        } else {
            state.summary_queries += 1;
        }
        if state.fail_status_calls > 0 {
            state.fail_status_calls -= 1;
            return Err(QfarmError::Broker("模拟的查询故障".to_string()));
        }

        let visible = state.status_calls >= state.resolved_visible_after;
        let mut statuses = Vec::with_capacity(ids.len());
        for id in ids {
            let agenda = state
                .agendas
                .get(id)
                .cloned()
                .ok_or_else(|| QfarmError::Broker(format!("未知作业: {id}")))?;
            // 结果尚不可见时一律伪装成 running
            let agenda: Vec<WorkItem> = if visible {
                agenda
            } else {
                agenda
                    .into_iter()
                    .map(|mut item| {
                        item.status = WorkStatus::Running;
                        item.result_package = None;
                        item
                    })
                    .collect()
            };
            statuses.push(JobStatus {
                id: *id,
                status: job_level_status(&agenda),
                agenda: if want_agenda { agenda } else { Vec::new() },
            });
        }
        Ok(statuses)
    }

    async fn request_work(&self) -> Result<WorkItem> {
        let mut state = self.state.lock().unwrap();
        state.work_requests += 1;
        Ok(state.work_script.pop_front().unwrap_or_else(|| WorkItem {
            index: 0,
            name: String::new(),
            package: Envelope::default(),
            status: WorkStatus::Complete,
            result_package: None,
        }))
    }

    async fn report_work(&self, item: &WorkItem) -> Result<()> {
        self.state.lock().unwrap().reported_work.push(item.clone());
        Ok(())
    }

    async fn report_job(&self, job_state: WorkStatus) -> Result<()> {
        self.state.lock().unwrap().reported_job = Some(job_state);
        Ok(())
    }
}
