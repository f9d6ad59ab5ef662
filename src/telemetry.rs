//! External temperature telemetry.
//!
//! `nvidia-smi` runs as an independent child process on its own polling
//! cadence; a reader task turns its line output into typed samples on a
//! channel the monitor drains opportunistically. If the tool is missing
//! the run proceeds with temperatures reported as unavailable.

use std::process::Stdio;

use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, Command},
    sync::mpsc,
};

/// One temperature reading for one device slot. `None` means the
/// collaborator reported the value as not available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemperatureSample {
    pub slot: usize,
    pub celsius: Option<i64>,
}

/// Handle to the running telemetry child.
pub struct Telemetry {
    child: Child,
}

impl Telemetry {
    /// Start the collaborator and a reader task. Returns `None` (after a
    /// warning) when the tool cannot be spawned; the run degrades
    /// gracefully.
    pub fn spawn(
        device_count: usize,
    ) -> Option<(Self, mpsc::UnboundedReceiver<TemperatureSample>)> {
        let mut child = match Command::new("nvidia-smi")
            .args(["-l", "5", "-q", "-d", "TEMPERATURE"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!("couldn't start nvidia-smi for temperature monitoring: {e}");
                return None;
            }
        };
        let stdout = child.stdout.take()?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut slot = 0usize;
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(celsius) = parse_temperature(&line) {
                    if tx.send(TemperatureSample { slot, celsius }).is_err() {
                        break;
                    }
                    slot = (slot + 1) % device_count.max(1);
                }
            }
        });

        Some((Self { child }, rx))
    }

    /// Forcibly stop the child. It produces samples forever otherwise.
    pub async fn stop(mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::debug!("couldn't kill telemetry child: {e}");
        }
    }
}

/// Parse one collaborator output line. `Some(Some(c))` for a temperature,
/// `Some(None)` for an explicit N/A (which still advances the device
/// slot), `None` for every other line.
fn parse_temperature(line: &str) -> Option<Option<i64>> {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix("GPU Current Temp") {
        let value = rest.trim_start().strip_prefix(':')?.trim();
        let value = value.strip_suffix('C').map_or(value, str::trim_end);
        return value.trim().parse().ok().map(Some);
    }
    // The per-GPU "Gpu ... : N/A" line; sensorless devices must still
    // rotate the slot index.
    if line.starts_with("Gpu") && line.ends_with(": N/A") {
        return Some(None);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_temperature_line() {
        assert_eq!(
            parse_temperature("        GPU Current Temp                  : 45 C"),
            Some(Some(45))
        );
        assert_eq!(parse_temperature("GPU Current Temp : 101 C"), Some(Some(101)));
    }

    #[test]
    fn test_parse_not_available_line() {
        assert_eq!(
            parse_temperature("        Gpu                               : N/A"),
            Some(None)
        );
    }

    #[test]
    fn test_unrelated_lines_ignored() {
        for line in [
            "==============NVSMI LOG==============",
            "    Temperature",
            "        GPU Shutdown Temp                 : 93 C",
            "        GPU Slowdown Temp                 : 90 C",
            "Attached GPUs                             : 2",
            "",
        ] {
            assert_eq!(parse_temperature(line), None, "line {line:?}");
        }
    }
}
