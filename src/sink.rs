//! Per-device log files and the live log-line multiplexer.
//!
//! Each dispatched device owns exactly one [`DeviceLog`], which appends to its
//! own file, so devices never interleave inside a file. Every written line is
//! also sent on a bounded broadcast; when a subscriber falls behind, the
//! oldest lines are dropped for that subscriber and the writer never waits.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use futures::StreamExt;
use futures::stream::BoxStream;
use log::debug;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::model::{Device, LogLine};

/// Log destination of one run.
#[derive(Debug)]
pub struct LogSink {
    dir: PathBuf,
    paths: HashMap<String, PathBuf>,
    live: broadcast::Sender<LogLine>,
}

impl LogSink {
    /// Creates a sink for `devices` rooted at `dir`. Paths are fixed up front.
    pub fn new(dir: impl Into<PathBuf>, devices: &[Device], capacity: usize) -> Self {
        let dir = dir.into();
        let paths = assign_log_paths(&dir, devices);
        let (live, _) = broadcast::channel(capacity.max(1));
        Self { dir, paths, live }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Log file path assigned to `device`.
    pub fn path_for(&self, device: &Device) -> PathBuf {
        self.paths
            .get(&device.address)
            .cloned()
            .unwrap_or_else(|| self.dir.join(format!("{}.log", sanitize(device.name()))))
    }

    /// Creates the device's log file and returns its single writer.
    pub async fn open(&self, device: &Device) -> std::io::Result<DeviceLog> {
        let path = self.path_for(device);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        debug!("Opened log {} for {}", path.display(), device.address);
        Ok(DeviceLog {
            device: device.address.clone(),
            path,
            writer: BufWriter::new(file),
            live: self.live.clone(),
        })
    }

    /// Live stream of lines from all devices, starting now.
    pub fn subscribe(&self) -> BoxStream<'static, LogLine> {
        BroadcastStream::new(self.live.subscribe())
            .filter_map(|res| async move { res.ok() })
            .boxed()
    }

    /// Full text of a log file, as far as it has been flushed.
    pub async fn read_all(path: impl AsRef<Path>) -> std::io::Result<String> {
        let bytes = tokio::fs::read(path).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Append-only writer for one device's log.
#[derive(Debug)]
pub struct DeviceLog {
    device: String,
    path: PathBuf,
    writer: BufWriter<File>,
    live: broadcast::Sender<LogLine>,
}

impl DeviceLog {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one line and publishes it live.
    pub async fn write(&mut self, text: &str) -> std::io::Result<LogLine> {
        self.writer.write_all(text.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        let line = LogLine {
            device: self.device.clone(),
            timestamp: Utc::now(),
            text: text.to_string(),
        };
        let _ = self.live.send(line.clone());
        // Flush per line so mid-run reads see what has arrived.
        self.writer.flush().await?;
        Ok(line)
    }

    pub async fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush().await
    }
}

/// Maps characters unsafe in file names to `_`.
pub fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        "device".to_string()
    } else {
        cleaned
    }
}

/// Assigns each device a log path. Names that collide after sanitizing are
/// disambiguated with the device address.
pub fn assign_log_paths(dir: &Path, devices: &[Device]) -> HashMap<String, PathBuf> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for device in devices {
        *counts.entry(sanitize(device.name())).or_default() += 1;
    }
    devices
        .iter()
        .map(|device| {
            let base = sanitize(device.name());
            let file = if counts.get(&base).copied().unwrap_or(0) > 1 {
                format!("{base}_{}.log", sanitize(&device.address))
            } else {
                format!("{base}.log")
            };
            (device.address.clone(), dir.join(file))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_path_separators() {
        assert_eq!(sanitize("core/sw 1"), "core_sw_1");
        assert_eq!(sanitize(".."), "device");
        assert_eq!(sanitize("edge-01.lab"), "edge-01.lab");
    }

    #[test]
    fn repeated_names_are_disambiguated_by_address() {
        let devices = vec![
            Device::new("10.0.0.1", "access"),
            Device::new("10.0.0.2", "access"),
            Device::new("10.0.0.3", "core"),
        ];
        let paths = assign_log_paths(Path::new("logs"), &devices);

        assert_eq!(paths["10.0.0.1"], Path::new("logs/access_10.0.0.1.log"));
        assert_eq!(paths["10.0.0.2"], Path::new("logs/access_10.0.0.2.log"));
        assert_eq!(paths["10.0.0.3"], Path::new("logs/core.log"));
    }

    #[tokio::test]
    async fn lines_are_persisted_and_streamed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let device = Device::new("10.0.0.1", "r1");
        let sink = LogSink::new(dir.path(), std::slice::from_ref(&device), 16);
        let mut live = sink.subscribe();

        let mut log = sink.open(&device).await.expect("open log");
        log.write("R1#show clock").await.expect("write");
        log.write("12:00:00 UTC").await.expect("write");
        log.flush().await.expect("flush");

        let text = LogSink::read_all(log.path()).await.expect("read");
        assert_eq!(text, "R1#show clock\n12:00:00 UTC\n");

        let first = live.next().await.expect("live line");
        assert_eq!(first.device, "10.0.0.1");
        assert_eq!(first.text, "R1#show clock");
    }

    #[tokio::test]
    async fn writer_does_not_block_without_subscribers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let device = Device::new("10.0.0.1", "r1");
        let sink = LogSink::new(dir.path(), std::slice::from_ref(&device), 1);
        let _slow = sink.subscribe();

        let mut log = sink.open(&device).await.expect("open log");
        for i in 0..100 {
            log.write(&format!("line {i}")).await.expect("write");
        }
        let text = LogSink::read_all(log.path()).await.expect("read");
        assert_eq!(text.lines().count(), 100);
    }
}
