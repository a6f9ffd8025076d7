//! 测试数据构造工具

use qfarm_core::envelope::pack;
use qfarm_core::{JobDescriptor, WorkItem, WorkPackage, WorkStatus};
use serde_json::Value;

/// 不带议程的作业描述
pub fn job(name: &str) -> JobDescriptor {
    JobDescriptor::new(name, 1)
}

/// 指定状态的工作条目, 载荷是打包好的 `{func, args}`
pub fn work_item(index: u32, func: &str, args: Vec<Value>, status: WorkStatus) -> WorkItem {
    let package = WorkPackage::new(func, args, serde_json::Map::new());
    let mut item = WorkItem::new(index, format!("{}: {func}", index + 1), pack(&package).unwrap());
    item.status = status;
    item
}
