//! Capture sources

use crate::Result;
use std::collections::VecDeque;
use trawl_core::RawFrame;

/// Outcome of one read from a source.
#[derive(Debug)]
pub enum Poll {
    Frame(RawFrame),
    /// Nothing arrived within the read timeout
    Idle,
    /// The source is exhausted
    End,
}

/// Something that yields raw frames, one read at a time.
///
/// Reads must return within a bounded time (live sources use a read
/// timeout) so the reader thread can notice a stop request.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<Poll>;

    /// Human-readable origin, for logs.
    fn describe(&self) -> String;

    /// Live sources drop frames when ingest falls behind; trace files wait.
    fn is_live(&self) -> bool {
        false
    }
}

/// Replays frames held in memory.
#[derive(Debug, Default)]
pub struct ReplaySource {
    frames: VecDeque<RawFrame>,
    label: String,
}

impl ReplaySource {
    pub fn new(frames: impl IntoIterator<Item = RawFrame>) -> Self {
        Self { frames: frames.into_iter().collect(), label: "replay".to_string() }
    }

    pub fn label(mut self, label: &str) -> Self {
        self.label = label.to_string();
        self
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl FrameSource for ReplaySource {
    fn next_frame(&mut self) -> Result<Poll> {
        Ok(match self.frames.pop_front() {
            Some(frame) => Poll::Frame(frame),
            None => Poll::End,
        })
    }

    fn describe(&self) -> String {
        format!("{} ({} frames left)", self.label, self.frames.len())
    }
}
