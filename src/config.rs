//! 配置系统
//! 从环境变量加载所有配置，使用 Secret 包装敏感信息

use config::{Config, ConfigError, Environment};
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// 监听地址，例如 "0.0.0.0:3000"
    pub addr: String,
    /// 优雅关闭超时时间（秒）
    pub graceful_shutdown_timeout_secs: u64,
    /// 请求体大小上限（字节）
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// 存储后端: postgres, memory
    pub backend: String,
    /// 数据库连接 URL（使用 Secret 包装，防止日志泄露）
    pub url: Secret<String>,
    /// 最大连接数
    pub max_connections: u32,
    /// 最小连接数
    pub min_connections: u32,
    /// 获取连接超时时间（秒）
    pub acquire_timeout_secs: u64,
    /// 空闲连接超时时间（秒）
    pub idle_timeout_secs: u64,
    /// 连接最大生命周期（秒）
    pub max_lifetime_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别: trace, debug, info, warn, error
    pub level: String,
    /// 日志格式: json, pretty
    pub format: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    /// JWT 密钥（使用 Secret 包装，防止日志泄露）
    pub jwt_secret: Secret<String>,
    /// 访问令牌过期时间（秒）
    pub access_token_exp_secs: u64,
    /// 刷新令牌过期时间（秒）
    pub refresh_token_exp_secs: u64,
    /// 密码最小长度
    pub password_min_length: usize,
    /// 密码必须包含大写字母
    pub password_require_uppercase: bool,
    /// 密码必须包含数字
    pub password_require_digit: bool,
    /// 密码必须包含特殊字符
    pub password_require_special: bool,
    /// Argon2 内存开销（KiB）
    pub argon2_memory_kib: u32,
    /// Argon2 迭代次数
    pub argon2_iterations: u32,
    /// Argon2 并行度
    pub argon2_parallelism: u32,
    /// 是否信任 X-Forwarded-For 头
    pub trust_proxy: bool,
    /// 计数存储不可用时的令牌黑名单策略: closed, open
    pub token_blacklist_fail_mode: String,
}

impl SecurityConfig {
    /// 计数存储故障时是否按“已撤销”处理
    pub fn token_blacklist_fails_closed(&self) -> bool {
        !self.token_blacklist_fail_mode.eq_ignore_ascii_case("open")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// 全局（按 IP）窗口内最大请求数
    pub global_max_requests: u32,
    /// 全局窗口大小（秒）
    pub global_window_secs: u64,
    /// 认证端点（按端点 + IP）窗口内最大请求数
    pub auth_max_requests: u32,
    /// 认证端点窗口大小（秒）
    pub auth_window_secs: u64,
    /// 已认证用户窗口内最大请求数
    pub user_max_requests: u32,
    /// 已认证用户窗口大小（秒）
    pub user_window_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CounterStoreConfig {
    /// 计数存储后端: auto, memory, postgres
    /// auto 跟随数据库后端，多实例部署时计数器由数据库共享
    pub backend: String,
    /// 启动时连接重试次数
    pub connect_retries: u32,
    /// 重试间隔（秒）
    pub retry_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MaintenanceConfig {
    /// 后台清理间隔（秒），0 表示不启动后台清理
    pub cleanup_interval_secs: u64,
    /// 登录尝试记录保留天数
    pub login_attempt_retention_days: i64,
    /// 安全事件保留天数
    pub security_event_retention_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub security: SecurityConfig,
    pub rate_limit: RateLimitConfig,
    pub counter_store: CounterStoreConfig,
    pub maintenance: MaintenanceConfig,
}

impl AppConfig {
    /// 实际使用的计数存储后端，auto 解析为数据库后端
    pub fn counter_store_backend(&self) -> &'static str {
        let backend = match self.counter_store.backend.to_lowercase().as_str() {
            "auto" => self.database.backend.to_lowercase(),
            other => other.to_string(),
        };

        if backend == "postgres" {
            "postgres"
        } else {
            "memory"
        }
    }

    /// 数据库共享但计数器按进程隔离：限流与令牌黑名单不跨实例生效
    pub fn counter_store_is_process_local(&self) -> bool {
        self.database.backend.eq_ignore_ascii_case("postgres")
            && self.counter_store_backend() == "memory"
    }

    /// 从环境变量加载配置
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut settings = Config::builder();

        // 添加默认配置
        settings = settings
            .set_default("server.addr", "0.0.0.0:3000")?
            .set_default("server.graceful_shutdown_timeout_secs", 30)?
            .set_default("server.max_body_bytes", 64 * 1024)?
            .set_default("database.backend", "postgres")?
            .set_default("database.url", "postgresql://localhost/account_service")?
            .set_default("database.max_connections", 10)?
            .set_default("database.min_connections", 2)?
            .set_default("database.acquire_timeout_secs", 30)?
            .set_default("database.idle_timeout_secs", 600)?
            .set_default("database.max_lifetime_secs", 1800)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "json")?
            .set_default("security.jwt_secret", "change-this-secret-in-production-min-32-chars!")?
            .set_default("security.access_token_exp_secs", 3600)?
            .set_default("security.refresh_token_exp_secs", 604800)?
            .set_default("security.password_min_length", 6)?
            .set_default("security.password_require_uppercase", false)?
            .set_default("security.password_require_digit", false)?
            .set_default("security.password_require_special", false)?
            .set_default("security.argon2_memory_kib", 19456)?
            .set_default("security.argon2_iterations", 2)?
            .set_default("security.argon2_parallelism", 1)?
            .set_default("security.trust_proxy", true)?
            .set_default("security.token_blacklist_fail_mode", "closed")?
            // 速率限制默认配置
            .set_default("rate_limit.global_max_requests", 100)?
            .set_default("rate_limit.global_window_secs", 60)?
            .set_default("rate_limit.auth_max_requests", 10)?
            .set_default("rate_limit.auth_window_secs", 300)?
            .set_default("rate_limit.user_max_requests", 300)?
            .set_default("rate_limit.user_window_secs", 60)?
            // 计数存储默认配置
            .set_default("counter_store.backend", "auto")?
            .set_default("counter_store.connect_retries", 5)?
            .set_default("counter_store.retry_interval_secs", 2)?
            // 维护任务默认配置
            .set_default("maintenance.cleanup_interval_secs", 3600)?
            .set_default("maintenance.login_attempt_retention_days", 30)?
            .set_default("maintenance.security_event_retention_days", 90)?;

        // 从环境变量加载配置（前缀为 ACCOUNT_）
        settings = settings.add_source(
            Environment::with_prefix("ACCOUNT")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = settings.build()?.try_deserialize()?;

        // 验证配置
        config.validate()?;

        Ok(config)
    }

    /// 验证配置合法性
    pub fn validate(&self) -> Result<(), ConfigError> {
        // 验证端口范围（0 表示由系统分配）
        if let Some(port_str) = self.server.addr.split(':').next_back() {
            if let Ok(port) = port_str.parse::<u16>() {
                if port != 0 && port < 1024 {
                    return Err(ConfigError::Message("Server port should be >= 1024".to_string()));
                }
            }
        }

        // 验证日志级别
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ConfigError::Message(format!(
                    "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                    self.logging.level
                )))
            }
        }

        // 验证日志格式
        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" => {}
            _ => {
                return Err(ConfigError::Message(format!(
                    "Invalid log format: {}. Must be one of: json, pretty",
                    self.logging.format
                )))
            }
        }

        // 验证存储后端
        match self.database.backend.to_lowercase().as_str() {
            "postgres" | "memory" => {}
            _ => {
                return Err(ConfigError::Message(format!(
                    "Invalid database backend: {}. Must be one of: postgres, memory",
                    self.database.backend
                )))
            }
        }

        match self.counter_store.backend.to_lowercase().as_str() {
            "auto" | "memory" => {}
            "postgres" => {
                if self.database.backend.eq_ignore_ascii_case("memory") {
                    return Err(ConfigError::Message(
                        "counter_store.backend=postgres requires database.backend=postgres"
                            .to_string(),
                    ));
                }
            }
            _ => {
                return Err(ConfigError::Message(format!(
                    "Invalid counter store backend: {}. Must be one of: auto, memory, postgres",
                    self.counter_store.backend
                )))
            }
        }

        // 验证数据库连接池配置
        if self.database.max_connections < self.database.min_connections {
            return Err(ConfigError::Message(
                "max_connections must be >= min_connections".to_string(),
            ));
        }

        // 验证 JWT 密钥长度（至少 32 字符）
        if self.security.jwt_secret.expose_secret().len() < 32 {
            return Err(ConfigError::Message(
                "JWT secret must be at least 32 characters long".to_string(),
            ));
        }

        // 验证令牌过期时间
        if self.security.access_token_exp_secs < 60 || self.security.access_token_exp_secs > 86400 {
            return Err(ConfigError::Message(
                "access_token_exp_secs must be between 60 and 86400 (1 minute to 24 hours)"
                    .to_string(),
            ));
        }

        if self.security.refresh_token_exp_secs < 3600
            || self.security.refresh_token_exp_secs > 2592000
        {
            return Err(ConfigError::Message(
                "refresh_token_exp_secs must be between 3600 and 2592000 (1 hour to 30 days)"
                    .to_string(),
            ));
        }

        // 验证密码策略
        if self.security.password_min_length < 6 || self.security.password_min_length > 128 {
            return Err(ConfigError::Message(
                "password_min_length must be between 6 and 128".to_string(),
            ));
        }

        // 验证 Argon2 参数
        if self.security.argon2_iterations < 1
            || self.security.argon2_parallelism < 1
            || self.security.argon2_memory_kib < 8 * self.security.argon2_parallelism
        {
            return Err(ConfigError::Message(
                "argon2 parameters out of range (iterations >= 1, parallelism >= 1, memory_kib >= 8 * parallelism)"
                    .to_string(),
            ));
        }

        // 验证令牌黑名单策略
        match self.security.token_blacklist_fail_mode.to_lowercase().as_str() {
            "open" | "closed" => {}
            _ => {
                return Err(ConfigError::Message(format!(
                    "Invalid token_blacklist_fail_mode: {}. Must be one of: open, closed",
                    self.security.token_blacklist_fail_mode
                )))
            }
        }

        // 验证速率限制
        if self.rate_limit.global_max_requests == 0
            || self.rate_limit.auth_max_requests == 0
            || self.rate_limit.user_max_requests == 0
        {
            return Err(ConfigError::Message(
                "rate_limit max_requests values must be >= 1".to_string(),
            ));
        }

        if self.rate_limit.global_window_secs == 0
            || self.rate_limit.auth_window_secs == 0
            || self.rate_limit.user_window_secs == 0
        {
            return Err(ConfigError::Message(
                "rate_limit window values must be >= 1 second".to_string(),
            ));
        }

        if self.maintenance.login_attempt_retention_days < 1
            || self.maintenance.security_event_retention_days < 1
        {
            return Err(ConfigError::Message(
                "maintenance retention days must be >= 1".to_string(),
            ));
        }

        Ok(())
    }
}

/// 单元测试用配置：内存后端、低成本 Argon2 参数
#[cfg(test)]
pub(crate) fn test_config() -> AppConfig {
    AppConfig {
        server: ServerConfig {
            addr: "127.0.0.1:0".to_string(),
            graceful_shutdown_timeout_secs: 5,
            max_body_bytes: 64 * 1024,
        },
        database: DatabaseConfig {
            backend: "memory".to_string(),
            url: Secret::new("postgresql://localhost/test".to_string()),
            max_connections: 5,
            min_connections: 1,
            acquire_timeout_secs: 5,
            idle_timeout_secs: 600,
            max_lifetime_secs: 1800,
        },
        logging: LoggingConfig {
            level: "debug".to_string(),
            format: "pretty".to_string(),
        },
        security: SecurityConfig {
            jwt_secret: Secret::new("test_secret_key_32_characters_long!".to_string()),
            access_token_exp_secs: 3600,
            refresh_token_exp_secs: 604800,
            password_min_length: 6,
            password_require_uppercase: false,
            password_require_digit: false,
            password_require_special: false,
            argon2_memory_kib: 1024,
            argon2_iterations: 1,
            argon2_parallelism: 1,
            trust_proxy: true,
            token_blacklist_fail_mode: "closed".to_string(),
        },
        rate_limit: RateLimitConfig {
            global_max_requests: 1000,
            global_window_secs: 60,
            auth_max_requests: 100,
            auth_window_secs: 60,
            user_max_requests: 1000,
            user_window_secs: 60,
        },
        counter_store: CounterStoreConfig {
            backend: "memory".to_string(),
            connect_retries: 1,
            retry_interval_secs: 1,
        },
        maintenance: MaintenanceConfig {
            cleanup_interval_secs: 0,
            login_attempt_retention_days: 30,
            security_event_retention_days: 90,
        },
    }
}
