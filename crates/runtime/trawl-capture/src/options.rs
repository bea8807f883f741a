//! Capture options as sent by the UI

use crate::bpf::CaptureFilter;
use crate::{CaptureError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Zero limits mean unlimited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CaptureOptions {
    /// BPF-style capture filter
    pub filter: String,
    pub promiscuous: bool,
    #[serde(alias = "monitor")]
    pub monitor_mode: bool,
    pub max_packets: u64,
    #[serde(alias = "maxDuration")]
    pub max_duration_secs: u64,
    pub ring_buffer: bool,
    /// Bytes per ring-buffer file
    pub max_file_size: u64,
    pub max_files: usize,
    pub output_dir: Option<PathBuf>,
}

impl CaptureOptions {
    pub fn filter(mut self, filter: &str) -> Self {
        self.filter = filter.to_string();
        self
    }

    pub fn promiscuous(mut self, enabled: bool) -> Self {
        self.promiscuous = enabled;
        self
    }

    pub fn limit(mut self, packets: u64) -> Self {
        self.max_packets = packets;
        self
    }

    pub fn duration(mut self, secs: u64) -> Self {
        self.max_duration_secs = secs;
        self
    }

    pub fn ring(mut self, dir: PathBuf, max_file_size: u64, max_files: usize) -> Self {
        self.ring_buffer = true;
        self.output_dir = Some(dir);
        self.max_file_size = max_file_size;
        self.max_files = max_files;
        self
    }

    pub fn max_duration(&self) -> Option<Duration> {
        (self.max_duration_secs > 0).then(|| Duration::from_secs(self.max_duration_secs))
    }

    /// Check option consistency and compile the capture filter.
    pub fn validate(&self) -> Result<CaptureFilter> {
        let filter = CaptureFilter::parse(&self.filter)?;
        if self.ring_buffer {
            if self.output_dir.is_none() {
                return Err(CaptureError::InvalidOptions("ring buffer needs an output directory".into()));
            }
            if self.max_file_size > 0 && self.max_file_size < 1024 {
                return Err(CaptureError::InvalidOptions("ring buffer files must be at least 1 KiB".into()));
            }
        }
        Ok(filter)
    }
}
