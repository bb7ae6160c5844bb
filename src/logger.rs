use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing_appender::{non_blocking, non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{
    fmt::{self, time::ChronoUtc},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// 日志级别枚举
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for &'static str {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("Unknown log level: {}", other)),
        }
    }
}

/// 日志配置结构体
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// 日志级别
    pub level: LogLevel,
    /// 日志文件目录
    pub log_dir: String,
    /// 日志文件名前缀
    pub file_prefix: String,
    /// 是否启用控制台输出
    pub console_output: bool,
    /// 文件日志是否使用 JSON 格式
    pub json_format: bool,
    /// 日志文件滚动策略 (daily, hourly, never)
    pub rotation: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            log_dir: "logs".to_string(),
            file_prefix: "model_arena".to_string(),
            console_output: true,
            json_format: false,
            rotation: "daily".to_string(),
        }
    }
}

/// crate 自身按配置级别输出，其余依赖只输出 warn 以上；`RUST_LOG` 优先
fn build_filter(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,{}={}",
            env!("CARGO_PKG_NAME").replace('-', "_"),
            <&str>::from(level)
        ))
    })
}

/// 初始化日志系统
///
/// 返回的 guard 需要保存到进程退出，drop 时会刷新尚未写出的日志
pub fn init_logger(config: LogConfig) -> Result<WorkerGuard> {
    std::fs::create_dir_all(&config.log_dir)?;

    let file_appender = match config.rotation.as_str() {
        "hourly" => rolling::hourly(&config.log_dir, &config.file_prefix),
        "never" => rolling::never(&config.log_dir, &config.file_prefix),
        _ => rolling::daily(&config.log_dir, &config.file_prefix),
    };
    let (non_blocking_file, guard) = non_blocking(file_appender);

    let file_layer = if config.json_format {
        fmt::layer()
            .json()
            .with_writer(non_blocking_file)
            .with_timer(ChronoUtc::rfc_3339())
            .with_current_span(true)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(non_blocking_file)
            .with_timer(ChronoUtc::rfc_3339())
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    };

    let console_layer = config.console_output.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_timer(ChronoUtc::rfc_3339())
            .with_ansi(true)
            .with_target(false)
    });

    tracing_subscriber::registry()
        .with(build_filter(config.level))
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))?;

    Ok(guard)
}

/// 快速初始化开发环境日志
pub fn init_dev_logger() -> Result<WorkerGuard> {
    init_logger(LogConfig {
        level: LogLevel::Debug,
        file_prefix: "dev".to_string(),
        ..LogConfig::default()
    })
}

/// 快速初始化生产环境日志
pub fn init_prod_logger() -> Result<WorkerGuard> {
    init_logger(LogConfig {
        level: LogLevel::Info,
        log_dir: "/var/log/model_arena".to_string(),
        console_output: false,
        json_format: true,
        ..LogConfig::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::{debug, info, warn};

    #[test]
    fn test_log_level_parse() {
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!(<&str>::from(LogLevel::Trace), "trace");
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[tokio::test]
    async fn test_logging() {
        let dir = std::env::temp_dir().join(format!("model_arena_logs_{}", uuid::Uuid::new_v4()));
        let config = LogConfig {
            level: LogLevel::Debug,
            log_dir: dir.to_string_lossy().into_owned(),
            json_format: true,
            rotation: "never".to_string(),
            ..LogConfig::default()
        };
        let _guard = init_logger(config).unwrap();

        warn!("This is a warning message");
        debug!("This is a debug message");
        info!(
            provider = "deepseek",
            model_id = "deepseek-chat",
            elapsed_ms = 42,
            "Model stream completed"
        );

        // 全局 subscriber 只能安装一次
        assert!(init_dev_logger().is_err());
    }
}
