//! Per-channel traffic statistics

use serde::{Deserialize, Serialize};

/// Which counters a channel aggregates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatisticsFlags {
    pub read: bool,
    pub write: bool,
    pub ping: bool,
}

impl StatisticsFlags {
    pub fn all() -> Self {
        Self {
            read: true,
            write: true,
            ping: true,
        }
    }

    pub fn any(&self) -> bool {
        self.read || self.write || self.ping
    }
}

/// Aggregated counters for one channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStatistics {
    pub bytes_read: u64,
    pub messages_read: u64,
    pub bytes_written: u64,
    pub messages_written: u64,
    pub pings_sent: u64,
    pub pings_received: u64,
}

/// Counters plus the flags deciding which of them move
#[derive(Debug, Clone, Default)]
pub struct StatisticsRecorder {
    flags: StatisticsFlags,
    stats: ChannelStatistics,
}

impl StatisticsRecorder {
    pub fn new(flags: StatisticsFlags) -> Self {
        Self {
            flags,
            stats: ChannelStatistics::default(),
        }
    }

    pub fn flags(&self) -> StatisticsFlags {
        self.flags
    }

    pub fn record_read(&mut self, bytes: usize) {
        if self.flags.read {
            self.stats.bytes_read += bytes as u64;
            self.stats.messages_read += 1;
        }
    }

    pub fn record_write(&mut self, bytes: usize) {
        if self.flags.write {
            self.stats.bytes_written += bytes as u64;
            self.stats.messages_written += 1;
        }
    }

    pub fn record_ping_sent(&mut self) {
        if self.flags.ping {
            self.stats.pings_sent += 1;
        }
    }

    pub fn record_ping_received(&mut self) {
        if self.flags.ping {
            self.stats.pings_received += 1;
        }
    }

    pub fn snapshot(&self) -> ChannelStatistics {
        self.stats
    }

    /// Return the current counters and zero them
    pub fn take(&mut self) -> ChannelStatistics {
        std::mem::take(&mut self.stats)
    }
}
