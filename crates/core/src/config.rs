//! 配置模型与加载。
//!
//! 默认值 -> 可选的TOML文件 -> `QFARM_` 前缀环境变量, 逐层覆盖。
//! 环境变量用双下划线分隔层级, 例如 `QFARM_POLLER__MIN_DELAY_MS=50`。

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{QfarmError, Result};

/// 子进程引导用的本库可执行文件路径
pub const ENV_QFARM_BIN: &str = "QFARM_BIN";
/// 开发环境包装命令的透传变量
pub const ENV_DEV_ARGS: &str = "QFARM_DEV_ARGS";
/// 嵌套提交深度计数, 每层提交加一
pub const ENV_LEVEL: &str = "QFARM_LEVEL";
/// 嵌套提交深度上限的覆盖
pub const ENV_RECURSION_LIMIT: &str = "QFARM_RECURSION_LIMIT";

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub poller: PollerSettings,
    pub worker: WorkerSettings,
    pub job: JobDefaults,
    pub logging: LoggingSettings,
}

/// 轮询器配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PollerSettings {
    /// 最小轮询间隔(毫秒), trigger与命中结果后回到这个值
    pub min_delay_ms: u64,
    /// 最大轮询间隔(毫秒), 空闲时的上限
    pub max_delay_ms: u64,
    /// 间隔的乘性增长因子
    pub backoff_factor: f64,
    /// 两段式轮询: 先做廉价的作业级查询, 只对已结束的作业
    /// 再发昂贵的逐条目查询
    pub two_stage: bool,
    /// 单个轮询周期内Broker查询的重试次数
    pub query_retries: u32,
    /// 查询重试间隔(毫秒)
    pub query_retry_delay_ms: u64,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            min_delay_ms: 100,
            max_delay_ms: 2000,
            backoff_factor: 1.15,
            two_stage: false,
            query_retries: 3,
            query_retry_delay_ms: 250,
        }
    }
}

impl PollerSettings {
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn query_retry_delay(&self) -> Duration {
        Duration::from_millis(self.query_retry_delay_ms)
    }
}

/// worker循环配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerSettings {
    /// 收到 waiting 状态后的重试间隔(毫秒)
    pub waiting_delay_ms: u64,
    /// 子进程程序路径; 为空时依次退回 QFARM_BIN 与当前可执行文件
    pub child_program: String,
    /// 条目失败时以debug级别转储环境变量
    pub dump_environment_on_failure: bool,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            waiting_delay_ms: 10_000,
            child_program: String::new(),
            dump_environment_on_failure: true,
        }
    }
}

impl WorkerSettings {
    pub fn waiting_delay(&self) -> Duration {
        Duration::from_millis(self.waiting_delay_ms)
    }
}

/// Executor构建作业时的模板, 每次提交的额外参数覆盖在其上
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JobDefaults {
    /// 作业名前缀, 默认名为 "{前缀}: {函数名}"
    pub name_prefix: String,
    pub cpu_count: u32,
    /// 嵌套提交深度上限; 环境变量 QFARM_RECURSION_LIMIT 优先
    pub recursion_limit: u32,
    /// 提交时透传进作业环境的环境变量
    pub environ_passthrough: Vec<String>,
    /// 模板环境变量, 合并进每个作业
    pub environment: HashMap<String, String>,
    /// 默认的子进程程序, 写入每个工作包
    pub interpreter: Option<String>,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            name_prefix: "QFarm".to_string(),
            cpu_count: 1,
            recursion_limit: 4,
            environ_passthrough: vec!["QFARM_DEV_ARGS".to_string()],
            environment: HashMap::new(),
            interpreter: None,
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    /// "pretty" 或 "json"
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl AppConfig {
    /// 加载配置。显式给出的路径必须存在; 不给路径时尝试默认位置
    /// `config/qfarm.toml`, 缺失则只用默认值与环境变量。
    pub fn load(path: Option<&str>) -> Result<Self> {
        let defaults = config::Config::try_from(&AppConfig::default())?;
        let mut builder = config::Config::builder().add_source(defaults);

        match path {
            Some(p) => {
                if !Path::new(p).exists() {
                    return Err(QfarmError::Configuration(format!("配置文件不存在: {p}")));
                }
                builder = builder.add_source(config::File::new(p, config::FileFormat::Toml));
            }
            None => {
                builder = builder
                    .add_source(config::File::with_name("config/qfarm").required(false));
            }
        }

        builder = builder.add_source(
            config::Environment::with_prefix("QFARM")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let app_config: AppConfig = builder.build()?.try_deserialize()?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poller.min_delay_ms == 0 || self.poller.min_delay_ms > self.poller.max_delay_ms {
            return Err(QfarmError::Configuration(format!(
                "轮询间隔非法: min={}ms max={}ms",
                self.poller.min_delay_ms, self.poller.max_delay_ms
            )));
        }
        if self.poller.backoff_factor < 1.0 {
            return Err(QfarmError::Configuration(format!(
                "backoff_factor 必须 >= 1.0: {}",
                self.poller.backoff_factor
            )));
        }
        if self.poller.query_retries == 0 {
            return Err(QfarmError::Configuration(
                "query_retries 必须至少为 1".to_string(),
            ));
        }
        if self.job.cpu_count == 0 {
            return Err(QfarmError::Configuration(
                "cpu_count 必须至少为 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let app_config = AppConfig::default();
        assert!(app_config.validate().is_ok());
        assert_eq!(app_config.poller.min_delay_ms, 100);
        assert_eq!(app_config.poller.max_delay_ms, 2000);
        assert_eq!(app_config.job.recursion_limit, 4);
        assert_eq!(app_config.worker.waiting_delay_ms, 10_000);
    }

    #[test]
    fn test_toml_file_shape() {
        let text = r#"
            [poller]
            min_delay_ms = 50
            two_stage = true

            [worker]
            waiting_delay_ms = 500

            [job]
            name_prefix = "Farm"
            cpu_count = 4
        "#;
        let app_config: AppConfig = toml::from_str(text).unwrap();
        assert_eq!(app_config.poller.min_delay_ms, 50);
        assert!(app_config.poller.two_stage);
        // 未写的字段取默认值
        assert_eq!(app_config.poller.max_delay_ms, 2000);
        assert_eq!(app_config.worker.waiting_delay_ms, 500);
        assert_eq!(app_config.job.name_prefix, "Farm");
        assert_eq!(app_config.job.cpu_count, 4);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "[poller]\nmax_delay_ms = 5000").unwrap();
        let app_config = AppConfig::load(file.path().to_str()).unwrap();
        assert_eq!(app_config.poller.max_delay_ms, 5000);
        assert_eq!(app_config.poller.min_delay_ms, 100);
    }

    #[test]
    fn test_load_missing_file_is_error() {
        let result = AppConfig::load(Some("/没有这个/qfarm.toml"));
        assert!(matches!(result, Err(QfarmError::Configuration(_))));
    }

    #[test]
    fn test_validate_rejects_inverted_delays() {
        let mut app_config = AppConfig::default();
        app_config.poller.min_delay_ms = 5000;
        assert!(app_config.validate().is_err());
    }
}
