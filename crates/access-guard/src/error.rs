//! 鉴权门面错误类型

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AccessGuardError {
    /// 构造参数缺失或非法，构造时直接失败，不重试
    #[error("配置错误: {0}")]
    Configuration(String),

    /// 策略源不可达（网络或数据库故障），由调用方决定是否重试整个加载
    #[error("策略源不可用: {origin} - {message}")]
    SourceUnavailable { origin: String, message: String },

    /// 策略源返回的数据无法解析为规范化规则
    #[error("策略源响应格式错误: {origin} - {message}")]
    MalformedResponse { origin: String, message: String },

    /// 只读加载器上调用了写回操作
    #[error("不支持的操作: {loader} 不支持 {operation}")]
    UnsupportedOperation {
        loader: String,
        operation: &'static str,
    },

    #[error("User '{user}' does not have permission to perform '{actions}' on '{resource}'")]
    PermissionDenied {
        user: String,
        resource: String,
        actions: String,
    },

    /// 代码提供的策略记录未通过校验
    #[error("无效的策略记录: {0}")]
    InvalidPolicy(String),

    /// casbin 在加载或构造时报告的错误
    #[error("匹配引擎错误: {0}")]
    Engine(String),

    /// 合成策略生成器的错误原样透传
    #[error(transparent)]
    Generator(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AccessGuardError>;

impl AccessGuardError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::SourceUnavailable { .. } => "SOURCE_UNAVAILABLE",
            Self::MalformedResponse { .. } => "MALFORMED_RESPONSE",
            Self::UnsupportedOperation { .. } => "UNSUPPORTED_OPERATION",
            Self::PermissionDenied { .. } => "PERMISSION_DENIED",
            Self::InvalidPolicy(_) => "INVALID_POLICY",
            Self::Engine(_) => "ENGINE_ERROR",
            Self::Generator(_) => "GENERATOR_ERROR",
        }
    }

    /// 是否为可重试错误
    ///
    /// 只有传输层故障值得重试，且重试由调用方对整个加载发起。
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SourceUnavailable { .. })
    }

    pub(crate) fn unavailable(origin: impl Into<String>, message: impl ToString) -> Self {
        Self::SourceUnavailable {
            origin: origin.into(),
            message: message.to_string(),
        }
    }

    pub(crate) fn malformed(origin: impl Into<String>, message: impl ToString) -> Self {
        Self::MalformedResponse {
            origin: origin.into(),
            message: message.to_string(),
        }
    }
}

impl From<sqlx::Error> for AccessGuardError {
    fn from(err: sqlx::Error) -> Self {
        Self::unavailable("database", err)
    }
}

impl From<reqwest::Error> for AccessGuardError {
    fn from(err: reqwest::Error) -> Self {
        Self::unavailable("remote", err)
    }
}

impl From<validator::ValidationErrors> for AccessGuardError {
    fn from(err: validator::ValidationErrors) -> Self {
        Self::InvalidPolicy(err.to_string())
    }
}

impl From<casbin::Error> for AccessGuardError {
    fn from(err: casbin::Error) -> Self {
        Self::Engine(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_denied_message() {
        let err = AccessGuardError::PermissionDenied {
            user: "42".to_string(),
            resource: "/reports".to_string(),
            actions: "read, write".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "User '42' does not have permission to perform 'read, write' on '/reports'"
        );
        assert_eq!(err.code(), "PERMISSION_DENIED");
    }

    #[test]
    fn test_is_retryable() {
        let db_err = AccessGuardError::from(sqlx::Error::PoolTimedOut);
        assert!(db_err.is_retryable());
        assert_eq!(db_err.code(), "SOURCE_UNAVAILABLE");

        let unsupported = AccessGuardError::UnsupportedOperation {
            loader: "remote".to_string(),
            operation: "save_policy",
        };
        assert!(!unsupported.is_retryable());
        assert_eq!(
            unsupported.to_string(),
            "不支持的操作: remote 不支持 save_policy"
        );
    }

    #[test]
    fn test_generator_error_is_transparent() {
        let err = AccessGuardError::from(anyhow::anyhow!("platform catalog offline"));
        assert_eq!(err.to_string(), "platform catalog offline");
        assert_eq!(err.code(), "GENERATOR_ERROR");
    }
}
