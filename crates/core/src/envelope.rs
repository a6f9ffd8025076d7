//! 传输信封编解码。
//!
//! 一个信封同时携带两份数据: 浅层投影(JSON安全, 供被动/调试观察者
//! 以普通字典的形式查看)和完整保真的二进制blob(base64编码,
//! 可精确重建原始结构, 包括错误对象这类非原语叶子)。
//! 解包时只要blob存在就优先使用它; 缺失blob的旧式/部分信封
//! 退回到浅层投影本身。

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{QfarmError, Result};

/// 浅层投影中标记富值的键; blob键与之同一命名空间
const TYPE_TAG: &str = "__type__";

/// 传输信封。浅层字段展平在顶层, blob挂在 `__blob__` 键下,
/// 于是在线上它就是一个普通的字典。
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(flatten)]
    pub summary: Map<String, Value>,
    #[serde(rename = "__blob__", default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<String>,
}

/// 把一个载荷打包成信封。
///
/// 浅层投影对非原语叶子降级为 `"<<..>>"` 占位字符串,
/// 真实值始终完整进入blob; 对任何可作为载荷字段的值都不失败。
/// 不做I/O, 不修改调用方的数据。
pub fn pack<T: Serialize>(package: &T) -> Result<Envelope> {
    let value = serde_json::to_value(package)?;
    let Value::Object(fields) = &value else {
        return Err(QfarmError::Serialization(
            "载荷必须序列化为对象".to_string(),
        ));
    };

    let summary = fields
        .iter()
        .map(|(key, field)| (key.clone(), clean_for_pack(field)))
        .collect();
    let blob = BASE64.encode(serde_json::to_vec(&value)?);

    Ok(Envelope {
        summary,
        blob: Some(blob),
    })
}

/// 从信封还原载荷。纯函数: 有blob时返回精确重建的原始载荷,
/// 没有blob时原样返回浅层投影。
pub fn unpack<T: DeserializeOwned>(envelope: &Envelope) -> Result<T> {
    match &envelope.blob {
        Some(blob) => {
            let bytes = BASE64
                .decode(blob)
                .map_err(|e| QfarmError::Serialization(format!("blob 解码失败: {e}")))?;
            Ok(serde_json::from_slice(&bytes)?)
        }
        None => Ok(serde_json::from_value(Value::Object(
            envelope.summary.clone(),
        ))?),
    }
}

/// 浅层投影: 原语与纯数据容器原样保留, 带类型标记的富值
/// 替换为占位字符串
fn clean_for_pack(value: &Value) -> Value {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => value.clone(),
        Value::Array(items) => Value::Array(items.iter().map(clean_for_pack).collect()),
        Value::Object(map) => match opaque_placeholder(map) {
            Some(placeholder) => Value::String(placeholder),
            None => Value::Object(
                map.iter()
                    .map(|(key, field)| (key.clone(), clean_for_pack(field)))
                    .collect(),
            ),
        },
    }
}

fn opaque_placeholder(map: &Map<String, Value>) -> Option<String> {
    let tag = map.get(TYPE_TAG)?.as_str()?;
    let mut repr = tag.to_string();
    if let Some(kind) = map.get("kind").and_then(Value::as_str) {
        repr = kind.to_string();
    }
    if let Some(message) = map.get("message").and_then(Value::as_str) {
        repr = format!("{repr}: {message}");
    }
    Some(format!("<<{repr}>>"))
}
