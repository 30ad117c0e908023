//! Per-run session state and result counters.
//!
//! A `Session` lives from the moment a control connection is expected until
//! the run reaches a terminal state. It is owned by the reactor and lent
//! (`&mut`) to whichever handler is running, so every mutation happens on the
//! reactor thread.

use crate::protocol::{ProtocolState, TestParams, TransferMode};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Counters for one data stream.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamInfo {
    pub id: u32,
    pub bytes: u64,
    /// Full payload drains on the sending side. Not part of the results payload.
    #[serde(skip)]
    pub blocks: u64,
    pub retransmits: i32,
    pub jitter: i32,
    pub errors: i32,
    pub packets: i32,
}

impl StreamInfo {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }
}

/// Aggregate results, serialized as the server's EXCHANGE_RESULTS payload.
///
/// CPU utilisation and retransmit figures are not measured and are always
/// reported as zero / -1.
#[derive(Debug, Clone, Serialize)]
pub struct TestInfo {
    pub cpu_util_total: i32,
    pub cpu_util_user: i32,
    pub cpu_util_system: i32,
    pub sender_has_retransmits: i32,
    /// In admission order.
    pub streams: Vec<StreamInfo>,
}

impl Default for TestInfo {
    fn default() -> Self {
        Self {
            cpu_util_total: 0,
            cpu_util_user: 0,
            cpu_util_system: 0,
            sender_has_retransmits: -1,
            streams: Vec::new(),
        }
    }
}

impl TestInfo {
    /// Encode as the JSON results body.
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// State of one test run.
#[derive(Debug)]
pub struct Session {
    state: ProtocolState,
    pub cookie: String,
    pub protocol: Option<String>,
    pub mode: TransferMode,
    pub target_stream_count: usize,
    pub info: TestInfo,
    running_since: Option<Instant>,
    elapsed: Option<Duration>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            state: ProtocolState::IperfStart,
            cookie: String::new(),
            protocol: None,
            mode: TransferMode::Forward,
            target_stream_count: 0,
            info: TestInfo::default(),
            running_since: None,
            elapsed: None,
        }
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    /// Record a state transition.
    pub fn set_state(&mut self, state: ProtocolState) {
        debug!(from = ?self.state, to = ?state, "State transition");

        match state {
            ProtocolState::TestRunning => self.running_since = Some(Instant::now()),
            ProtocolState::TestEnd => self.elapsed = self.running_since.map(|t| t.elapsed()),
            _ => {}
        }

        self.state = state;
    }

    /// Apply negotiated parameters.
    pub fn configure(&mut self, params: &TestParams) {
        if params.tcp.unwrap_or(false) {
            self.protocol = Some("tcp".to_string());
        }
        self.target_stream_count = params.stream_count();
        self.mode = params.mode();
    }

    /// Number of streams admitted so far.
    pub fn admitted(&self) -> usize {
        self.info.streams.len()
    }

    /// Whether another data connection may join this run.
    pub fn admission_open(&self) -> bool {
        self.state == ProtocolState::CreateStreams && self.admitted() < self.target_stream_count
    }

    /// Id for the next admitted stream.
    ///
    /// The first stream is 1 and later ones continue from 3, following the
    /// iperf3 convention that leaves id 2 to the reverse-direction sender.
    pub fn next_stream_id(&self) -> u32 {
        match self.admitted() {
            0 => 1,
            n => n as u32 + 2,
        }
    }

    /// Register a new stream and return its slot in `info.streams`.
    pub fn admit_stream(&mut self) -> usize {
        let info = StreamInfo::new(self.next_stream_id());
        self.info.streams.push(info);
        self.info.streams.len() - 1
    }

    /// Log per-stream and total throughput for the finished run.
    pub fn log_summary(&self) {
        let secs = self.elapsed.map(|d| d.as_secs_f64()).unwrap_or(0.0);
        let mbps = |bytes: u64| {
            if secs > 0.0 {
                bytes as f64 * 8.0 / secs / 1_000_000.0
            } else {
                0.0
            }
        };

        for stream in &self.info.streams {
            info!(
                cookie = %self.cookie,
                id = stream.id,
                bytes = stream.bytes,
                blocks = stream.blocks,
                mbit_per_sec = mbps(stream.bytes),
                "Stream summary"
            );
        }

        let total: u64 = self.info.streams.iter().map(|s| s.bytes).sum();
        info!(
            cookie = %self.cookie,
            streams = self.info.streams.len(),
            bytes = total,
            seconds = secs,
            mbit_per_sec = mbps(total),
            "Session summary"
        );
    }
}
