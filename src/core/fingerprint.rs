//! 命令指纹：对 (工具名, 规范化参数, 目标) 做 SHA-256
//!
//! 相同指纹即视为同一件工作；参数对象的键序不影响结果。

use std::fmt;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// 规范化命令签名（十六进制 SHA-256）
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn compute(tool: &str, args: &Value, target: Option<&str>) -> Self {
        let mut hasher = Sha256::new();
        update_framed(&mut hasher, tool.trim().to_lowercase().as_bytes());
        update_framed(&mut hasher, canonical_json(args).as_bytes());
        match target.map(str::trim).filter(|t| !t.is_empty()) {
            Some(t) => update_framed(&mut hasher, t.as_bytes()),
            None => hasher.update([0u8]),
        }
        Self(hex::encode(hasher.finalize()))
    }

    /// 从持久化层读回
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 日志用短前缀
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 观察结果摘要（判断「是否出现新信息」）
pub fn digest(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

fn update_framed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

/// 键排序后的紧凑 JSON；不依赖 serde_json 的 Map 实现
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => {
            let _ = write!(out, "{}", other);
        }
    }
}
