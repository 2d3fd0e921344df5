//! Command valuation for sensors
//!
//! Runs a sensor's command through the configured shell:
//! - bounded by a per-call timeout (the child is killed when it expires)
//! - stdout trimmed and kept as an opaque string, read through a size cap
//! - non-zero exit, spawn failure, timeout, empty or oversized output yield no reading

use crate::error::{ValuationCause, ValuationError};
use crate::model::{Sensor, SensorReading};
use chrono::Utc;
use std::io;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command as AsyncCommand;
use tracing::debug;

/// Most stdout bytes kept from one run
pub const MAX_OUTPUT: usize = 64 * 1024;
/// Most stderr bytes kept for diagnostics
const STDERR_CAPTURE: usize = 4 * 1024;
/// Longest stderr excerpt kept in an error
const STDERR_EXCERPT: usize = 256;

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

/// Keep at most `limit` bytes of a stream, discarding the rest so the child never blocks on a full pipe.
async fn read_capped<R>(reader: Option<R>, limit: usize) -> io::Result<Captured>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok(Captured::default());
    };

    let mut bytes = Vec::new();
    (&mut reader).take(limit as u64 + 1).read_to_end(&mut bytes).await?;

    let truncated = bytes.len() > limit;
    if truncated {
        bytes.truncate(limit);
        tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;
    }
    Ok(Captured { bytes, truncated })
}

/// Cross-platform command executor
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    shell: String,
}

impl Default for CommandExecutor {
    fn default() -> Self {
        let shell = if cfg!(target_os = "windows") { "cmd" } else { "sh" };
        Self::new(shell)
    }
}

impl CommandExecutor {
    pub fn new(shell: impl Into<String>) -> Self {
        Self { shell: shell.into() }
    }

    /// Run the sensor's command once and turn its output into a reading.
    pub async fn evaluate(&self, sensor: &Sensor, timeout: Duration) -> Result<SensorReading, ValuationError> {
        let start_time = Instant::now();
        debug!("Evaluating sensor {}: {} (timeout: {:?})", sensor.name, sensor.command, timeout);

        let raw_text = self
            .run(&sensor.command, timeout)
            .await
            .map_err(|cause| ValuationError {
                sensor: sensor.name.clone(),
                cause,
            })?;

        debug!("Sensor {} = {:?} in {}ms", sensor.name, raw_text, start_time.elapsed().as_millis());

        Ok(SensorReading {
            sensor_name: sensor.name.clone(),
            raw_text,
            timestamp: Utc::now(),
        })
    }

    fn command(&self, command: &str) -> AsyncCommand {
        let mut cmd = AsyncCommand::new(&self.shell);
        if self.shell.eq_ignore_ascii_case("cmd") {
            cmd.args(["/C", command]);
        } else {
            cmd.arg("-c").arg(command);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run(&self, command: &str, timeout: Duration) -> Result<String, ValuationCause> {
        // Dropping the child on timeout kills it
        let mut child = self.command(command).spawn()?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let collect = async {
            let (stdout, stderr) = tokio::try_join!(
                read_capped(stdout, MAX_OUTPUT),
                read_capped(stderr, STDERR_CAPTURE)
            )?;
            let status = child.wait().await?;
            Ok::<_, io::Error>((status, stdout, stderr))
        };

        let (status, stdout, stderr) = tokio::time::timeout(timeout, collect)
            .await
            .map_err(|_| ValuationCause::Timeout(timeout))?
            .map_err(ValuationCause::Output)?;

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr.bytes);
            return Err(ValuationCause::ExitStatus {
                code: status.code(),
                stderr: excerpt(stderr.trim()),
            });
        }
        if stdout.truncated {
            return Err(ValuationCause::OutputTooLarge(MAX_OUTPUT));
        }

        let value = String::from_utf8_lossy(&stdout.bytes).trim().to_string();
        if value.is_empty() {
            return Err(ValuationCause::EmptyOutput);
        }
        Ok(value)
    }
}

fn excerpt(text: &str) -> String {
    match text.char_indices().nth(STDERR_EXCERPT) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
