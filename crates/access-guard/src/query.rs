//! 查询/过滤提供者
//!
//! 加载器只负责"怎么问"，"问什么"由这里的策略对象决定：
//! 数据库加载器向 [`PolicyQueryProvider`] 要 SQL，远程加载器向
//! [`RequestHeaderProvider`] 要请求头。

use crate::entities::{Filter, PolicySelector, Role, User};
use crate::error::{AccessGuardError, Result};

/// 参数化查询
///
/// `sql` 使用 `$1..$n` 占位符，`params` 按顺序绑定，`None` 绑定为 NULL。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyQuery {
    pub sql: String,
    pub params: Vec<Option<String>>,
}

impl PolicyQuery {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn bind(mut self, value: Option<impl Into<String>>) -> Self {
        self.params.push(value.map(Into::into));
        self
    }
}

/// 数据库策略查询提供者
///
/// 每条查询返回 `ptype, subject, object, action, effect` 五列。
pub trait PolicyQueryProvider: Send + Sync {
    fn all_policies_query(&self) -> PolicyQuery;

    fn filtered_policies_query(&self, filter: &Filter) -> Result<PolicyQuery>;

    fn user_policies_query(&self, user: &User) -> PolicyQuery;

    fn role_policies_query(&self, role: &Role) -> PolicyQuery;

    /// 按选择器分派到对应查询
    fn query_for(&self, selector: &PolicySelector) -> Result<PolicyQuery> {
        match selector {
            PolicySelector::All => Ok(self.all_policies_query()),
            PolicySelector::ByFilter(filter) => self.filtered_policies_query(filter),
            PolicySelector::ByUser(user) => Ok(self.user_policies_query(user)),
            PolicySelector::ByRole(role) => Ok(self.role_policies_query(role)),
        }
    }
}

/// IAM 库表结构的默认查询
///
/// 角色主体与资源对象都编码为 `scope:app_id:name`，用户主体为用户 id。
#[derive(Debug, Clone, Copy, Default)]
pub struct IamPolicyQueryProvider;

impl IamPolicyQueryProvider {
    /// 查询涉及的表
    pub const TABLES: &'static [&'static str] = &[
        "users",
        "iam_roles",
        "iam_resources",
        "iam_permissions",
        "iam_role_policies",
        "iam_user_policies",
        "user_roles",
    ];
}

const ALL_POLICIES_SQL: &str = r#"
WITH role_permissions AS (
    SELECT DISTINCT
        'p' AS ptype,
        r.scope || ':' || COALESCE(r.app_id::text, '') || ':' || r.role_name AS subject,
        res.scope || ':' || COALESCE(res.app_id::text, '') || ':' || res.resource_name AS object,
        perm.action AS action,
        COALESCE(rp.effect, 'allow') AS effect
    FROM iam_role_policies rp
    JOIN iam_roles r ON rp.role_id = r.id
    JOIN iam_permissions perm ON rp.permission_id = perm.id
    JOIN iam_resources res ON perm.resource_id = res.id
),
user_permissions AS (
    SELECT DISTINCT
        'p' AS ptype,
        u.id::text AS subject,
        res.scope || ':' || COALESCE(res.app_id::text, '') || ':' || res.resource_name AS object,
        perm.action AS action,
        COALESCE(up.effect, 'allow') AS effect
    FROM iam_user_policies up
    JOIN users u ON up.user_id = u.id
    JOIN iam_permissions perm ON up.permission_id = perm.id
    JOIN iam_resources res ON perm.resource_id = res.id
),
role_assignments AS (
    SELECT DISTINCT
        'g' AS ptype,
        u.id::text AS subject,
        r.scope || ':' || COALESCE(r.app_id::text, '') || ':' || r.role_name AS object,
        NULL::text AS action,
        NULL::text AS effect
    FROM user_roles ur
    JOIN users u ON ur.user_id = u.id
    JOIN iam_roles r ON ur.role_id = r.id
)
SELECT ptype, subject, object, action, effect FROM role_permissions
UNION ALL
SELECT ptype, subject, object, action, effect FROM user_permissions
UNION ALL
SELECT ptype, subject, object, action, effect FROM role_assignments
"#;

const FILTERED_POLICIES_SQL: &str = r#"
WITH role_permissions AS (
    SELECT DISTINCT
        'p' AS ptype,
        r.scope || ':' || COALESCE(r.app_id::text, '') || ':' || r.role_name AS subject,
        res.scope || ':' || COALESCE(res.app_id::text, '') || ':' || res.resource_name AS object,
        perm.action AS action,
        COALESCE(rp.effect, 'allow') AS effect
    FROM iam_role_policies rp
    JOIN iam_roles r ON rp.role_id = r.id
    JOIN iam_permissions perm ON rp.permission_id = perm.id
    JOIN iam_resources res ON perm.resource_id = res.id
    WHERE r.scope = $1 AND ($2::text IS NULL OR r.app_id::text = $2)
      AND res.scope = $1 AND ($2::text IS NULL OR res.app_id::text = $2)
),
user_permissions AS (
    SELECT DISTINCT
        'p' AS ptype,
        u.id::text AS subject,
        res.scope || ':' || COALESCE(res.app_id::text, '') || ':' || res.resource_name AS object,
        perm.action AS action,
        COALESCE(up.effect, 'allow') AS effect
    FROM iam_user_policies up
    JOIN users u ON up.user_id = u.id
    JOIN iam_permissions perm ON up.permission_id = perm.id
    JOIN iam_resources res ON perm.resource_id = res.id
    WHERE res.scope = $1 AND ($2::text IS NULL OR res.app_id::text = $2)
),
role_assignments AS (
    SELECT DISTINCT
        'g' AS ptype,
        u.id::text AS subject,
        r.scope || ':' || COALESCE(r.app_id::text, '') || ':' || r.role_name AS object,
        NULL::text AS action,
        NULL::text AS effect
    FROM user_roles ur
    JOIN users u ON ur.user_id = u.id
    JOIN iam_roles r ON ur.role_id = r.id
    WHERE r.scope = $1 AND ($2::text IS NULL OR r.app_id::text = $2)
)
SELECT ptype, subject, object, action, effect FROM role_permissions
UNION ALL
SELECT ptype, subject, object, action, effect FROM user_permissions
UNION ALL
SELECT ptype, subject, object, action, effect FROM role_assignments
"#;

const USER_POLICIES_SQL: &str = r#"
WITH assigned_roles AS (
    SELECT
        r.id AS role_id,
        r.scope || ':' || COALESCE(r.app_id::text, '') || ':' || r.role_name AS role_subject
    FROM user_roles ur
    JOIN iam_roles r ON ur.role_id = r.id
    WHERE ur.user_id::text = $1
),
role_permissions AS (
    SELECT DISTINCT
        'p' AS ptype,
        ar.role_subject AS subject,
        res.scope || ':' || COALESCE(res.app_id::text, '') || ':' || res.resource_name AS object,
        perm.action AS action,
        COALESCE(rp.effect, 'allow') AS effect
    FROM assigned_roles ar
    JOIN iam_role_policies rp ON ar.role_id = rp.role_id
    JOIN iam_permissions perm ON rp.permission_id = perm.id
    JOIN iam_resources res ON perm.resource_id = res.id
),
user_permissions AS (
    SELECT DISTINCT
        'p' AS ptype,
        u.id::text AS subject,
        res.scope || ':' || COALESCE(res.app_id::text, '') || ':' || res.resource_name AS object,
        perm.action AS action,
        COALESCE(up.effect, 'allow') AS effect
    FROM iam_user_policies up
    JOIN users u ON up.user_id = u.id
    JOIN iam_permissions perm ON up.permission_id = perm.id
    JOIN iam_resources res ON perm.resource_id = res.id
    WHERE u.id::text = $1
),
role_assignments AS (
    SELECT DISTINCT
        'g' AS ptype,
        $1::text AS subject,
        ar.role_subject AS object,
        NULL::text AS action,
        NULL::text AS effect
    FROM assigned_roles ar
)
SELECT ptype, subject, object, action, effect FROM role_permissions
UNION ALL
SELECT ptype, subject, object, action, effect FROM user_permissions
UNION ALL
SELECT ptype, subject, object, action, effect FROM role_assignments
"#;

const ROLE_POLICIES_SQL: &str = r#"
SELECT DISTINCT
    'p' AS ptype,
    r.scope || ':' || COALESCE(r.app_id::text, '') || ':' || r.role_name AS subject,
    res.scope || ':' || COALESCE(res.app_id::text, '') || ':' || res.resource_name AS object,
    perm.action AS action,
    COALESCE(rp.effect, 'allow') AS effect
FROM iam_roles r
JOIN iam_role_policies rp ON rp.role_id = r.id
JOIN iam_permissions perm ON rp.permission_id = perm.id
JOIN iam_resources res ON perm.resource_id = res.id
WHERE r.role_name = $1
  AND ($2::text IS NULL OR r.scope = $2)
  AND ($3::text IS NULL OR r.app_id::text = $3)
"#;

impl PolicyQueryProvider for IamPolicyQueryProvider {
    fn all_policies_query(&self) -> PolicyQuery {
        PolicyQuery::new(ALL_POLICIES_SQL)
    }

    fn filtered_policies_query(&self, filter: &Filter) -> Result<PolicyQuery> {
        let scope = filter.get("scope").ok_or_else(|| {
            AccessGuardError::Configuration("filtered policy query requires `scope`".to_string())
        })?;
        Ok(PolicyQuery::new(FILTERED_POLICIES_SQL)
            .bind(Some(scope))
            .bind(filter.get("app_id")))
    }

    fn user_policies_query(&self, user: &User) -> PolicyQuery {
        PolicyQuery::new(USER_POLICIES_SQL).bind(Some(user.id.as_str()))
    }

    fn role_policies_query(&self, role: &Role) -> PolicyQuery {
        PolicyQuery::new(ROLE_POLICIES_SQL)
            .bind(Some(role.role_name.as_str()))
            .bind(role.scope.as_deref())
            .bind(role.app_id.as_deref())
    }
}

/// 远程策略请求的上下文请求头
pub trait RequestHeaderProvider: Send + Sync {
    fn headers(&self, selector: &PolicySelector) -> Vec<(String, String)>;
}

/// 默认请求头：`app_id`、`user_id`、`scope`
///
/// 过滤条件里有就带上，没有就不发；按用户/角色加载时从实体取值。
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextHeaderProvider;

impl ContextHeaderProvider {
    pub const HEADERS: [&'static str; 3] = ["app_id", "user_id", "scope"];
}

impl RequestHeaderProvider for ContextHeaderProvider {
    fn headers(&self, selector: &PolicySelector) -> Vec<(String, String)> {
        let lookup = |name: &str| -> Option<String> {
            match selector {
                PolicySelector::All => None,
                PolicySelector::ByFilter(filter) => filter.get(name).map(str::to_string),
                PolicySelector::ByUser(user) => (name == "user_id").then(|| user.id.clone()),
                PolicySelector::ByRole(role) => match name {
                    "app_id" => role.app_id.clone(),
                    "scope" => role.scope.clone(),
                    _ => None,
                },
            }
        };

        Self::HEADERS
            .iter()
            .filter_map(|&name| lookup(name).map(|value| (name.to_string(), value)))
            .collect()
    }
}
