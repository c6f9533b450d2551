//! 模型定义来源
//!
//! 模型文本交给 casbin 解析；这里只负责定位文本，并记下策略行的字段数，
//! 规则写入模型时按它补齐。

use std::path::Path;

use casbin::DefaultModel;
use tracing::debug;

use crate::error::{AccessGuardError, Result};

const BUILTIN_MODEL: &str = include_str!("../config/rbac_model.conf");
const BUILTIN_ORIGIN: &str = "<built-in rbac_model.conf>";

/// 模型声明的策略行宽度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyShape {
    /// `p = ...` 的字段数
    pub permission_fields: usize,
    /// `g = ...` 的字段数，没有角色定义时为 0
    pub grouping_fields: usize,
}

impl PolicyShape {
    /// 权限规则是否带 eft 字段
    pub fn has_effect(&self) -> bool {
        self.permission_fields > 3
    }
}

/// 模型定义文本及其来源
#[derive(Debug, Clone)]
pub struct ModelSource {
    origin: String,
    text: String,
    shape: PolicyShape,
}

impl ModelSource {
    /// 内置默认模型
    pub fn builtin() -> Result<Self> {
        Self::from_text(BUILTIN_MODEL, BUILTIN_ORIGIN)
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            AccessGuardError::Configuration(format!(
                "failed to read model definition `{}`: {e}",
                path.display()
            ))
        })?;
        Self::from_text(&text, &path.display().to_string())
    }

    /// 配置了路径就读文件，否则用内置模型
    pub async fn resolve(path: Option<&str>) -> Result<Self> {
        match path.map(str::trim).filter(|p| !p.is_empty()) {
            Some(path) => Self::from_file(path).await,
            None => Self::builtin(),
        }
    }

    pub fn from_text(text: &str, origin: &str) -> Result<Self> {
        let permission_fields = field_count(text, "policy_definition", "p").unwrap_or_default();
        if permission_fields < 3 {
            return Err(AccessGuardError::Configuration(format!(
                "model definition `{origin}` must declare `p` with at least sub, obj, act"
            )));
        }
        let shape = PolicyShape {
            permission_fields,
            grouping_fields: field_count(text, "role_definition", "g").unwrap_or_default(),
        };
        debug!(origin, ?shape, "模型定义已读取");

        Ok(Self {
            origin: origin.to_string(),
            text: text.to_string(),
            shape,
        })
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn shape(&self) -> PolicyShape {
        self.shape
    }

    /// 解析出一个不含规则的 casbin 模型
    pub async fn build(&self) -> Result<DefaultModel> {
        DefaultModel::from_str(&self.text).await.map_err(|e| {
            AccessGuardError::Configuration(format!(
                "invalid model definition `{}`: {e}",
                self.origin
            ))
        })
    }
}

/// 某一段里 `key = a, b, c` 的字段数
fn field_count(text: &str, section: &str, key: &str) -> Option<usize> {
    let mut current = None;
    for line in text.lines() {
        let line = line.split('#').next().unwrap_or_default().trim();
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            current = Some(name.trim());
            continue;
        }
        if current != Some(section) {
            continue;
        }
        if let Some((name, fields)) = line.split_once('=') {
            if name.trim() == key {
                return Some(fields.split(',').filter(|f| !f.trim().is_empty()).count());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = "[request_definition]\nr = sub, obj, act\n\n\
        [policy_definition]\np = sub, obj, act\n\n\
        [policy_effect]\ne = some(where (p.eft == allow))\n\n\
        [matchers]\nm = r.sub == p.sub && r.obj == p.obj && r.act == p.act\n";

    #[test]
    fn test_builtin_shape() {
        let source = ModelSource::builtin().unwrap();
        assert_eq!(
            source.shape(),
            PolicyShape {
                permission_fields: 4,
                grouping_fields: 2,
            }
        );
        assert!(source.shape().has_effect());
    }

    #[test]
    fn test_shape_without_role_definition() {
        let source = ModelSource::from_text(MINIMAL, "minimal").unwrap();
        assert_eq!(source.shape().permission_fields, 3);
        assert_eq!(source.shape().grouping_fields, 0);
        assert!(!source.shape().has_effect());
    }

    #[test]
    fn test_missing_policy_definition_is_rejected() {
        let err = ModelSource::from_text("[request_definition]\nr = sub, obj, act\n", "broken")
            .unwrap_err();
        assert_eq!(err.code(), "CONFIGURATION_ERROR");
        assert!(err.to_string().contains("broken"));
    }

    #[tokio::test]
    async fn test_build_parses_model() {
        assert!(ModelSource::builtin().unwrap().build().await.is_ok());
        assert!(ModelSource::from_text(MINIMAL, "minimal").unwrap().build().await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_file_is_configuration_error() {
        let err = ModelSource::resolve(Some("/nonexistent/model.conf"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONFIGURATION_ERROR");
        assert_eq!(
            ModelSource::resolve(Some("  ")).await.unwrap().origin(),
            BUILTIN_ORIGIN
        );
    }
}
