//! 规范化规则
//!
//! 所有加载器无论数据来自 SQL 行、JSON 对象还是内存元组，都先转换成
//! `NormalizedRule`，再写入共享模型。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{AccessGuardError, Result};

/// 权限规则的效果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Allow,
    Deny,
}

impl Effect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }
}

impl FromStr for Effect {
    type Err = AccessGuardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "allow" => Ok(Self::Allow),
            "deny" => Ok(Self::Deny),
            other => Err(AccessGuardError::InvalidPolicy(format!(
                "unknown effect `{other}`"
            ))),
        }
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一条策略
///
/// `Permission` 的 effect 缺省时视为 allow，序列化时省略。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "ptype")]
pub enum NormalizedRule {
    #[serde(rename = "p")]
    Permission {
        subject: String,
        object: String,
        action: String,
        effect: Option<Effect>,
    },
    #[serde(rename = "g")]
    Grouping { subject: String, role: String },
}

impl NormalizedRule {
    pub fn permission(
        subject: impl Into<String>,
        object: impl Into<String>,
        action: impl Into<String>,
        effect: Option<Effect>,
    ) -> Self {
        Self::Permission {
            subject: subject.into(),
            object: object.into(),
            action: action.into(),
            effect,
        }
    }

    pub fn grouping(subject: impl Into<String>, role: impl Into<String>) -> Self {
        Self::Grouping {
            subject: subject.into(),
            role: role.into(),
        }
    }

    pub fn ptype(&self) -> &'static str {
        match self {
            Self::Permission { .. } => "p",
            Self::Grouping { .. } => "g",
        }
    }

    pub fn subject(&self) -> &str {
        match self {
            Self::Permission { subject, .. } | Self::Grouping { subject, .. } => subject,
        }
    }

    /// 缺省 effect 按 allow 处理
    pub fn effective_effect(&self) -> Option<Effect> {
        match self {
            Self::Permission { effect, .. } => Some(effect.unwrap_or(Effect::Allow)),
            Self::Grouping { .. } => None,
        }
    }

    /// 从 `[ptype, subject, object, action?, effect?]` 字段解析
    ///
    /// 空字符串等价于缺失；未知 ptype、缺少必需字段都视为畸形条目。
    pub fn from_fields<S: AsRef<str>>(fields: &[S]) -> Result<Self> {
        let field = |i: usize| {
            fields
                .get(i)
                .map(|f| f.as_ref().trim())
                .filter(|f| !f.is_empty())
        };

        let ptype = field(0).ok_or_else(|| invalid("missing ptype"))?;
        let subject = field(1).ok_or_else(|| invalid("missing subject"))?;
        let object = field(2).ok_or_else(|| invalid("missing object"))?;

        match ptype {
            "p" => {
                let action = field(3).ok_or_else(|| invalid("permission rule without action"))?;
                let effect = field(4).map(Effect::from_str).transpose()?;
                Ok(Self::permission(subject, object, action, effect))
            }
            "g" => Ok(Self::grouping(subject, object)),
            other => Err(invalid(format!("unknown policy type `{other}`"))),
        }
    }

    /// 序列化为字段元组，去掉末尾的空字段
    pub fn to_fields(&self) -> Vec<String> {
        let mut fields = match self {
            Self::Permission {
                subject,
                object,
                action,
                effect,
            } => vec![
                "p".to_string(),
                subject.clone(),
                object.clone(),
                action.clone(),
                effect.map(|e| e.to_string()).unwrap_or_default(),
            ],
            Self::Grouping { subject, role } => {
                vec!["g".to_string(), subject.clone(), role.clone()]
            }
        };

        while fields.last().is_some_and(|f| f.is_empty()) {
            fields.pop();
        }
        fields
    }

    /// 策略行格式：`p, alice, /docs, read, allow` / `g, alice, admin`
    pub fn to_line(&self) -> String {
        self.to_fields().join(", ")
    }
}

impl fmt::Display for NormalizedRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line())
    }
}

fn invalid(message: impl Into<String>) -> AccessGuardError {
    AccessGuardError::InvalidPolicy(message.into())
}

/// 单次加载的结果
///
/// 资源前缀与规则分开返回，调用方不需要反查模型。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadResult {
    pub resource_prefix: Option<String>,
    pub policies: Vec<NormalizedRule>,
}

impl LoadResult {
    pub fn new(resource_prefix: Option<String>, policies: Vec<NormalizedRule>) -> Self {
        Self {
            resource_prefix: resource_prefix.filter(|p| !p.is_empty()),
            policies,
        }
    }

    pub fn policies(policies: Vec<NormalizedRule>) -> Self {
        Self::new(None, policies)
    }

    /// 所有规则的策略行
    pub fn policy_lines(&self) -> Vec<String> {
        self.policies.iter().map(NormalizedRule::to_line).collect()
    }
}
