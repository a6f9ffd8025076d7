//! worker侧的函数注册表。
//!
//! 工作包里的 `func`/`preflight` 是名字, 在这里解析成启动时注册的
//! 函数; 未注册的名字以 [`QfarmError::FuncNotFound`] 失败。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use qfarm_core::{Envelope, QfarmError, Result};

/// 可被远端调用的函数
#[async_trait]
pub trait WorkerFunction: Send + Sync {
    async fn call(&self, args: Vec<Value>, kwargs: Map<String, Value>) -> Result<Value>;
}

/// 解包之前运行的环境准备钩子。
/// 收到的是仍处于打包状态的信封: 解包本身可能依赖它搭建的环境。
#[async_trait]
pub trait PreflightFn: Send + Sync {
    async fn run(&self, package: &Envelope) -> Result<()>;
}

struct FnAdapter<F>(F);

#[async_trait]
impl<F> WorkerFunction for FnAdapter<F>
where
    F: Fn(Vec<Value>, Map<String, Value>) -> Result<Value> + Send + Sync,
{
    async fn call(&self, args: Vec<Value>, kwargs: Map<String, Value>) -> Result<Value> {
        (self.0)(args, kwargs)
    }
}

struct PreflightAdapter<F>(F);

#[async_trait]
impl<F> PreflightFn for PreflightAdapter<F>
where
    F: Fn(&Envelope) -> Result<()> + Send + Sync,
{
    async fn run(&self, package: &Envelope) -> Result<()> {
        (self.0)(package)
    }
}

/// 名字到函数的查找表, 由嵌入方在启动时填充
#[derive(Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<dyn WorkerFunction>>,
    preflights: HashMap<String, Arc<dyn PreflightFn>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, function: Arc<dyn WorkerFunction>) {
        let name = name.into();
        debug!("注册函数: {name}");
        self.functions.insert(name, function);
    }

    /// 用普通闭包注册同步函数
    pub fn register_fn<F>(&mut self, name: impl Into<String>, function: F)
    where
        F: Fn(Vec<Value>, Map<String, Value>) -> Result<Value> + Send + Sync + 'static,
    {
        self.register(name, Arc::new(FnAdapter(function)));
    }

    pub fn register_preflight(&mut self, name: impl Into<String>, preflight: Arc<dyn PreflightFn>) {
        let name = name.into();
        debug!("注册preflight: {name}");
        self.preflights.insert(name, preflight);
    }

    pub fn register_preflight_fn<F>(&mut self, name: impl Into<String>, preflight: F)
    where
        F: Fn(&Envelope) -> Result<()> + Send + Sync + 'static,
    {
        self.register_preflight(name, Arc::new(PreflightAdapter(preflight)));
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn WorkerFunction>> {
        self.functions
            .get(name)
            .cloned()
            .ok_or_else(|| QfarmError::FuncNotFound {
                name: name.to_string(),
            })
    }

    pub fn resolve_preflight(&self, name: &str) -> Result<Arc<dyn PreflightFn>> {
        self.preflights
            .get(name)
            .cloned()
            .ok_or_else(|| QfarmError::FuncNotFound {
                name: name.to_string(),
            })
    }

    pub fn function_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_register_and_call() {
        let mut registry = FunctionRegistry::new();
        registry.register_fn("math:add", |args, _kwargs| {
            let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
            Ok(json!(sum))
        });

        let function = registry.resolve("math:add").unwrap();
        let value = function
            .call(vec![json!(1), json!(2), json!(3)], Map::new())
            .await
            .unwrap();
        assert_eq!(value, json!(6));
    }

    #[tokio::test]
    async fn test_unknown_name_is_not_found() {
        let registry = FunctionRegistry::new();
        let err = match registry.resolve("nowhere:missing") {
            Ok(_) => panic!("期望解析失败"),
            Err(err) => err,
        };
        match err {
            QfarmError::FuncNotFound { name } => assert_eq!(name, "nowhere:missing"),
            other => panic!("意外的错误: {other}"),
        }
        assert!(registry.resolve_preflight("nowhere:pf").is_err());
    }

    #[test]
    fn test_function_names_sorted() {
        let mut registry = FunctionRegistry::new();
        registry.register_fn("b:two", |_, _| Ok(json!(2)));
        registry.register_fn("a:one", |_, _| Ok(json!(1)));
        assert_eq!(registry.function_names(), vec!["a:one", "b:two"]);
    }
}
