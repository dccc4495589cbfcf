//! External converter launching
//!
//! The conversion itself is a black box. A [`ConverterLauncher`] turns a list
//! of `(input, output_dir)` jobs into batch description files and one external
//! process per batch, and tells the caller which cache directory the
//! processes write their artifacts into. [`WctLauncher`] drives NOAA's
//! `wct-export` script.

use crate::config::ConversionConfig;
use crate::error::{Error, Result};
use crate::log_aggregator::LogHandle;
use async_trait::async_trait;
use rand::Rng;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// One input file and the directory its converted output goes to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConversionJob {
    /// Level 2 input file
    pub input: PathBuf,
    /// Output directory for the converted file
    pub output_dir: PathBuf,
}

/// Starts external conversion processes
#[async_trait]
pub trait ConverterLauncher: Send + Sync {
    /// Write batch files for `jobs` and start the processes
    async fn launch(
        &self,
        jobs: &[ConversionJob],
        log: &LogHandle,
    ) -> Result<Box<dyn RunningConversion>>;
}

/// Handle on a set of running converter processes
#[async_trait]
pub trait RunningConversion: Send {
    /// Directory the processes write cache artifacts into
    fn cache_dir(&self) -> &Path;

    /// Wait for every process; on `kill` terminate them instead
    ///
    /// Returns one flag per process, `true` when it exited cleanly.
    async fn wait(&mut self, kill: &CancellationToken) -> Vec<bool>;

    /// Remove batch files and cache directories
    async fn cleanup(&mut self);
}

/// Random lowercase hex string of `bytes` bytes
fn random_hex(bytes: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..bytes).map(|_| format!("{:02x}", rng.r#gen::<u8>())).collect()
}

/// Split `lines` into `concurrency` contiguous batches
///
/// Each batch gets `len / concurrency` lines (at least one); the last batch
/// also takes the remainder. Trailing batches may be empty when there are
/// fewer lines than processes.
pub fn split_batches(lines: &[String], concurrency: usize) -> Vec<Vec<String>> {
    let concurrency = concurrency.max(1);
    let per_batch = (lines.len() / concurrency).max(1);
    (0..concurrency)
        .map(|i| {
            let start = (i * per_batch).min(lines.len());
            let end = if i + 1 == concurrency {
                lines.len()
            } else {
                ((i + 1) * per_batch).min(lines.len())
            };
            lines[start..end].to_vec()
        })
        .collect()
}

/// Interpreter command named by the first `#!` line of a script
///
/// Leading blank lines before the shebang are tolerated.
pub fn interpreter_for(script: &str) -> Option<Vec<String>> {
    let line = script.lines().find(|line| line.contains("#!"))?;
    let command: Vec<String> = line
        .trim()
        .replace("#!", "")
        .split_whitespace()
        .map(str::to_string)
        .collect();
    (!command.is_empty()).then_some(command)
}

/// Groups a `PROCESSING ... 100%` block of converter output into one message
#[derive(Debug, Default)]
pub struct OutputGrouper {
    block: Vec<String>,
}

impl OutputGrouper {
    /// Feed one line; returns a message when one is complete
    pub fn push(&mut self, line: &str) -> Option<String> {
        let line = line.trim_end();
        if self.block.is_empty() && !line.contains("PROCESSING") {
            return Some(line.to_string());
        }
        self.block.push(line.to_string());
        if line.contains("100%") {
            return Some(std::mem::take(&mut self.block).join("\n"));
        }
        None
    }

    /// Whatever is left of an unterminated block
    pub fn finish(&mut self) -> Option<String> {
        (!self.block.is_empty()).then(|| std::mem::take(&mut self.block).join("\n"))
    }
}

fn forward_output<R>(reader: R, log: LogHandle) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        let mut grouper = OutputGrouper::default();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(message) = grouper.push(&line) {
                log.info(message);
            }
        }
        if let Some(message) = grouper.finish() {
            log.info(message);
        }
    })
}

/// Launcher for NOAA Weather and Climate Toolkit's `wct-export`
#[derive(Clone, Debug)]
pub struct WctLauncher {
    wct_export: PathBuf,
    batch_config: PathBuf,
    output_format: String,
    scratch_root: PathBuf,
    concurrency: usize,
}

impl WctLauncher {
    /// Launcher for the script at `wct_export`
    ///
    /// Without an explicit batch config, `wctBatchConfig.xml` next to the
    /// script is used.
    pub fn new(wct_export: PathBuf, batch_config: Option<PathBuf>) -> Self {
        let batch_config = batch_config.unwrap_or_else(|| {
            wct_export
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join("wctBatchConfig.xml")
        });
        Self {
            wct_export,
            batch_config,
            output_format: "rnc".to_string(),
            scratch_root: std::env::temp_dir(),
            concurrency: 1,
        }
    }

    /// Find `wct-export` in PATH
    pub fn from_path() -> Option<Self> {
        which::which("wct-export").ok().map(|p| Self::new(p, None))
    }

    /// Launcher described by `config`, searching PATH if no script is configured
    pub fn from_config(config: &ConversionConfig) -> Result<Self> {
        let wct_export = match &config.wct_export {
            Some(path) => path.clone(),
            None => which::which("wct-export").map_err(|e| {
                Error::config(
                    "conversion.wct_export",
                    format!("wct-export not configured and not found in PATH: {e}"),
                )
            })?,
        };
        Ok(Self {
            output_format: config.output_format.clone(),
            scratch_root: config.scratch_root.clone(),
            concurrency: config.concurrency.max(1),
            ..Self::new(wct_export, config.batch_config.clone())
        })
    }

    /// Script being run
    pub fn wct_export(&self) -> &Path {
        &self.wct_export
    }

    /// Batch configuration passed on every line
    pub fn batch_config(&self) -> &Path {
        &self.batch_config
    }

    fn batch_line(&self, job: &ConversionJob) -> String {
        format!(
            "{},{},{}",
            job.input.display(),
            job.output_dir.display(),
            self.batch_config.display()
        )
    }

    async fn command_prefix(&self) -> Result<Vec<String>> {
        let script = tokio::fs::read(&self.wct_export).await.map_err(|e| {
            Error::ExternalTool(format!(
                "Failed to read {}: {e}",
                self.wct_export.display()
            ))
        })?;
        let script_path = self.wct_export.display().to_string();
        Ok(match interpreter_for(&String::from_utf8_lossy(&script)) {
            Some(mut interpreter) => {
                interpreter.push(script_path);
                interpreter
            }
            None => vec![script_path],
        })
    }
}

#[async_trait]
impl ConverterLauncher for WctLauncher {
    async fn launch(
        &self,
        jobs: &[ConversionJob],
        log: &LogHandle,
    ) -> Result<Box<dyn RunningConversion>> {
        let log = log.with_source("wct-export");
        let hex = random_hex(6);
        let cache_root = self.scratch_root.join(format!("wct-cache-{hex}"));
        let batch_base = self.scratch_root.join(format!("nexrad_wct_script_{hex}"));

        log.info(format!(
            "NOAA wct-export                   : {}\nNOAA wct-export batch config file : {}",
            self.wct_export.display(),
            self.batch_config.display()
        ));

        let mut run = WctRun {
            cache_dir: cache_root.join("wct-cache").join("data"),
            cache_root,
            batch_files: Vec::new(),
            children: Vec::new(),
            forwarders: Vec::new(),
            log: log.clone(),
        };

        let prefix = self.command_prefix().await?;
        let lines: Vec<String> = jobs.iter().map(|job| self.batch_line(job)).collect();

        for (i, batch) in split_batches(&lines, self.concurrency).into_iter().enumerate() {
            if batch.is_empty() {
                continue;
            }
            let batch_file = PathBuf::from(format!("{}-{i}", batch_base.display()));
            log.info(format!(
                "NOAA wct-export batch file        : {}",
                batch_file.display()
            ));

            let mut contents = batch.join("\n");
            contents.push('\n');
            if let Err(e) = tokio::fs::write(&batch_file, contents).await {
                run.cleanup().await;
                return Err(e.into());
            }
            run.batch_files.push(batch_file.clone());

            let mut command = Command::new(&prefix[0]);
            command
                .args(&prefix[1..])
                .arg(&batch_file)
                .arg(&self.output_format)
                .env(
                    "_JAVA_OPTIONS",
                    format!("-Djava.io.tmpdir={}", run.cache_root.display()),
                )
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            tracing::debug!(command = ?command, "Starting wct-export");

            let mut child = match command.spawn() {
                Ok(child) => child,
                Err(e) => {
                    run.cleanup().await;
                    return Err(Error::ExternalTool(format!(
                        "Failed to execute wct-export: {e}"
                    )));
                }
            };
            if let Some(stdout) = child.stdout.take() {
                run.forwarders.push(forward_output(stdout, log.clone()));
            }
            if let Some(stderr) = child.stderr.take() {
                run.forwarders.push(forward_output(stderr, log.clone()));
            }
            run.children.push(child);
        }

        Ok(Box::new(run))
    }
}

/// Running `wct-export` processes and the files they were given
struct WctRun {
    cache_root: PathBuf,
    cache_dir: PathBuf,
    batch_files: Vec<PathBuf>,
    children: Vec<Child>,
    forwarders: Vec<JoinHandle<()>>,
    log: LogHandle,
}

#[async_trait]
impl RunningConversion for WctRun {
    fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    async fn wait(&mut self, kill: &CancellationToken) -> Vec<bool> {
        let mut clean = Vec::with_capacity(self.children.len());
        for child in &mut self.children {
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill.cancelled() => None,
            };
            clean.push(match exited {
                Some(Ok(status)) => status.success(),
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Failed to wait for wct-export");
                    false
                }
                None => {
                    child.start_kill().ok();
                    child.wait().await.ok();
                    false
                }
            });
        }
        futures::future::join_all(self.forwarders.drain(..)).await;
        clean
    }

    async fn cleanup(&mut self) {
        for batch in self.batch_files.drain(..) {
            match tokio::fs::remove_file(&batch).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = %batch.display(), error = %e, "Failed to remove batch file"),
            }
        }
        if tokio::fs::try_exists(&self.cache_root).await.unwrap_or(false)
            && tokio::fs::remove_dir_all(&self.cache_root).await.is_err()
        {
            self.log.warn(format!(
                "Failed to remove wct-cache directory : {}",
                self.cache_root.display()
            ));
        }
    }
}
