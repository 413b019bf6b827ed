use std::{fs::OpenOptions, io::Write, path::PathBuf, sync::RwLock};

use anyhow::Result;
use once_cell::sync::Lazy;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::db::{KvStore, KEY_TELEMETRY};

static TELEMETRY_ENABLED: Lazy<RwLock<bool>> = Lazy::new(|| RwLock::new(false));

/** \brief 日志目录，`NIX_LOG_DIR` 可覆盖。 */
static LOG_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var_os("NIX_LOG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("logs"))
});

const LOG_FILE: &str = "nix.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Severity {
    Info,
    Error,
}

impl Severity {
    fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Error => "ERROR",
        }
    }
}

pub fn set_enabled(enabled: bool) {
    if let Ok(mut guard) = TELEMETRY_ENABLED.write() {
        *guard = enabled;
    }
}

pub fn is_enabled() -> bool {
    TELEMETRY_ENABLED.read().map(|g| *g).unwrap_or(false)
}

/**
 * \brief 从键值存储读取持久化的开关并应用到当前进程。读取失败视为关闭。
 */
pub fn init_from_store(store: &dyn KvStore) -> bool {
    let enabled = store
        .get(KEY_TELEMETRY)
        .ok()
        .flatten()
        .map(|v| v == "1")
        .unwrap_or(false);
    set_enabled(enabled);
    enabled
}

/**
 * \brief 持久化开关并立即生效。
 */
pub fn persist(store: &dyn KvStore, enabled: bool) -> Result<()> {
    store.set(KEY_TELEMETRY, if enabled { "1" } else { "0" })?;
    set_enabled(enabled);
    Ok(())
}

/**
 * \brief 记录常规事件。调用方不得传入密钥明文。
 */
pub fn log_event(category: &str, message: &str) {
    emit(Severity::Info, category, message);
}

pub fn log_error(category: &str, message: &str) {
    emit(Severity::Error, category, message);
}

fn emit(severity: Severity, category: &str, message: &str) {
    if !is_enabled() {
        return;
    }
    if let Err(err) = append_line(&format_line(severity, category, message)) {
        eprintln!("telemetry write failed: {}", err);
    }
}

fn format_line(severity: Severity, category: &str, message: &str) -> String {
    let timestamp = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "-".to_string());
    // 单条记录必须保持单行
    let message = message.replace(['\r', '\n'], " ");
    format!("{} [{}] {} - {}", timestamp, severity.as_str(), category, message)
}

fn append_line(line: &str) -> Result<()> {
    std::fs::create_dir_all(LOG_DIR.as_path())?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(LOG_DIR.join(LOG_FILE))?;
    writeln!(file, "{}", line)?;
    Ok(())
}
