use std::{
    fs::OpenOptions,
    io::Write,
    path::PathBuf,
    sync::RwLock,
};

use anyhow::Result;
use once_cell::sync::Lazy;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing_subscriber::EnvFilter;

const LOG_FILE: &str = "codedeck.log";

static TELEMETRY_ENABLED: Lazy<RwLock<bool>> = Lazy::new(|| RwLock::new(false));

static LOG_DIR: Lazy<RwLock<PathBuf>> = Lazy::new(|| RwLock::new(PathBuf::from("logs")));

/**
 * \brief 安装 tracing 订阅器；`RUST_LOG` 优先，其次使用传入的过滤表达式。
 * \details 重复调用是安全的，第二次起不做任何事。
 */
pub fn init(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

/**
 * \brief 更新遥测开关状态。
 */
pub fn set_enabled(enabled: bool) {
    if let Ok(mut guard) = TELEMETRY_ENABLED.write() {
        *guard = enabled;
    }
}

/**
 * \brief 查询当前遥测开关状态。
 */
pub fn is_enabled() -> bool {
    TELEMETRY_ENABLED.read().map(|g| *g).unwrap_or(false)
}

/**
 * \brief 修改遥测文件所在目录（默认 `logs`）。
 */
pub fn set_log_dir(dir: impl Into<PathBuf>) {
    if let Ok(mut guard) = LOG_DIR.write() {
        *guard = dir.into();
    }
}

pub fn log_path() -> PathBuf {
    LOG_DIR
        .read()
        .map(|d| d.join(LOG_FILE))
        .unwrap_or_else(|_| PathBuf::from("logs").join(LOG_FILE))
}

/**
 * \brief 记录常规事件。
 */
pub fn log_event(category: &str, message: &str) {
    if !is_enabled() {
        return;
    }
    if let Err(err) = write_line("INFO", category, message) {
        tracing::warn!(error = %err, "telemetry write failed");
    }
}

/**
 * \brief 记录错误事件。
 */
pub fn log_error(category: &str, message: &str) {
    if !is_enabled() {
        return;
    }
    if let Err(err) = write_line("ERROR", category, message) {
        tracing::warn!(error = %err, "telemetry write failed");
    }
}

fn write_line(level: &str, category: &str, message: &str) -> Result<()> {
    let path = log_path();
    if let Some(dir) = path.parent() {
        if !dir.exists() {
            std::fs::create_dir_all(dir)?;
        }
    }
    let timestamp = OffsetDateTime::now_utc().format(&Rfc3339)?;
    let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
    writeln!(file, "{} [{}] {} - {}", timestamp, level, category, message)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_line_appends_formatted_entries() {
        let dir = tempfile::tempdir().unwrap();
        set_log_dir(dir.path().join("logs"));

        write_line("INFO", "test.category", "visible").unwrap();
        write_line("ERROR", "test.category", "broken").unwrap();

        let text = std::fs::read_to_string(log_path()).unwrap();
        assert!(text.contains("[INFO] test.category - visible"));
        assert!(text.contains("[ERROR] test.category - broken"));
        set_log_dir("logs");
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init("debug");
        init("info");
    }
}
