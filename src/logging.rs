//! 日志模块 - 控制台输出、文件日志、按天或按大小轮转

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// 日志配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// 日志级别: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_level")]
    pub level: String,
    /// 是否同时输出到控制台
    #[serde(default = "default_stdout")]
    pub stdout: bool,
    /// 日志文件路径，为空时使用任务目录下的 `<jobId>.log`
    #[serde(default)]
    pub file: Option<PathBuf>,
    /// 按天轮转，关闭时按大小轮转
    #[serde(default)]
    pub rotate: bool,
    /// 按大小轮转时的最大日志文件大小（MB）
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u32,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_stdout() -> bool {
    true
}

fn default_max_size_mb() -> u32 {
    64
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            stdout: default_stdout(),
            file: None,
            rotate: false,
            max_size_mb: default_max_size_mb(),
        }
    }
}

impl LogConfig {
    /// 将配置的日志级别转换为 tracing Level
    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }

    /// 日志文件路径，未配置时使用 default_path
    pub fn file_path(&self, default_path: &Path) -> PathBuf {
        self.file
            .clone()
            .unwrap_or_else(|| default_path.to_path_buf())
    }
}

/// 初始化全局日志
pub fn init(config: &LogConfig, default_log_path: &Path) -> Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(config.tracing_level()).into())
        .from_env_lossy()
        .add_directive("hyper=warn".parse()?)
        .add_directive("reqwest=warn".parse()?)
        .add_directive("opendal=warn".parse()?)
        .add_directive("sqlx=warn".parse()?);

    let log_path = config.file_path(default_log_path);
    let file_writer = file_writer(config, &log_path)?;

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false);

    let console_layer = config.stdout.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .context("初始化日志失败")?;

    tracing::debug!("日志文件: {:?}", log_path);
    Ok(())
}

fn file_writer(config: &LogConfig, log_path: &Path) -> Result<BoxMakeWriter> {
    let dir = log_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).with_context(|| format!("创建日志目录失败: {:?}", dir))?;

    if config.rotate {
        let file_name = log_path
            .file_name()
            .context("日志文件路径缺少文件名")?;
        let appender = tracing_appender::rolling::daily(dir, file_name);
        return Ok(BoxMakeWriter::new(appender));
    }

    let writer = SizeRotatingWriter::new(log_path, config.max_size_mb)
        .with_context(|| format!("打开日志文件失败: {:?}", log_path))?;
    Ok(BoxMakeWriter::new(writer))
}

/// 带大小限制的日志写入器，超过限制时当前文件移动为 `.old`
#[derive(Clone)]
pub struct SizeRotatingWriter {
    file_path: PathBuf,
    max_size: u64,
    writer: Arc<Mutex<Option<BufWriter<File>>>>,
}

impl SizeRotatingWriter {
    pub fn new(file_path: &Path, max_size_mb: u32) -> io::Result<Self> {
        Self::with_limit(file_path, (max_size_mb as u64) * 1024 * 1024)
    }

    pub fn with_limit(file_path: &Path, max_size: u64) -> io::Result<Self> {
        let writer = Self::open_file(file_path, max_size)?;
        Ok(Self {
            file_path: file_path.to_path_buf(),
            max_size,
            writer: Arc::new(Mutex::new(Some(writer))),
        })
    }

    fn open_file(file_path: &Path, max_size: u64) -> io::Result<BufWriter<File>> {
        if Self::oversized(file_path, max_size) {
            Self::rotate_log(file_path)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;

        Ok(BufWriter::new(file))
    }

    fn oversized(file_path: &Path, max_size: u64) -> bool {
        fs::metadata(file_path)
            .map(|m| m.len() > max_size)
            .unwrap_or(false)
    }

    fn backup_path(file_path: &Path) -> PathBuf {
        let mut backup = file_path.as_os_str().to_os_string();
        backup.push(".old");
        PathBuf::from(backup)
    }

    /// 轮转日志文件
    fn rotate_log(file_path: &Path) -> io::Result<()> {
        let backup_path = Self::backup_path(file_path);
        if backup_path.exists() {
            fs::remove_file(&backup_path)?;
        }
        fs::rename(file_path, &backup_path)
    }

    fn lock(&self) -> MutexGuard<'_, Option<BufWriter<File>>> {
        // 锁中毒时继续使用内部数据
        self.writer.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 检查并轮转日志
    fn check_and_rotate(&self) -> io::Result<()> {
        if !Self::oversized(&self.file_path, self.max_size) {
            return Ok(());
        }

        let mut guard = self.lock();
        if let Some(mut w) = guard.take() {
            let _ = w.flush();
        }
        let result = Self::rotate_log(&self.file_path);
        *guard = Some(Self::open_file(&self.file_path, self.max_size)?);
        result
    }
}

/// 日志写入器
pub struct LogWriter {
    inner: SizeRotatingWriter,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = {
            let mut guard = self.inner.lock();
            let writer = guard
                .as_mut()
                .ok_or_else(|| io::Error::other("日志文件不可用"))?;
            let written = writer.write(buf)?;
            writer.flush()?;
            written
        };

        let _ = self.inner.check_and_rotate();
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.inner.lock().as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for SizeRotatingWriter {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter {
            inner: self.clone(),
        }
    }
}
