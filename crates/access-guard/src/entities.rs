//! 加载范围：过滤条件、实体与选择器

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// 调用方透传给加载器的过滤条件
///
/// 门面和聚合器从不解释其内容，只有具体加载器按需读取。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Filter(BTreeMap<String, String>);

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl From<BTreeMap<String, String>> for Filter {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Filter {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: Option<String>,
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub role_name: String,
    pub scope: Option<String>,
    pub app_id: Option<String>,
    pub org_id: Option<String>,
}

impl Role {
    pub fn new(role_name: impl Into<String>) -> Self {
        Self {
            role_name: role_name.into(),
            scope: None,
            app_id: None,
            org_id: None,
        }
    }
}

/// 单次加载要取哪些策略
///
/// 由调用方显式给出，加载器不再检查实体的动态类型。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PolicySelector {
    /// 策略源能提供的全部策略
    #[default]
    All,
    ByFilter(Filter),
    ByUser(User),
    ByRole(Role),
}

impl PolicySelector {
    /// 没有过滤条件时等价于 `All`
    pub fn from_filter(filter: Option<Filter>) -> Self {
        match filter {
            Some(filter) if !filter.is_empty() => Self::ByFilter(filter),
            _ => Self::All,
        }
    }

    pub fn filter(&self) -> Option<&Filter> {
        match self {
            Self::ByFilter(filter) => Some(filter),
            _ => None,
        }
    }

    /// 日志用的简短描述
    pub fn describe(&self) -> String {
        match self {
            Self::All => "all".to_string(),
            Self::ByFilter(filter) => format!("filter({} keys)", filter.0.len()),
            Self::ByUser(user) => format!("user:{}", user.id),
            Self::ByRole(role) => format!("role:{}", role.role_name),
        }
    }
}
