//! Traffic accounting and negotiated tunnel metadata.

use crate::vpn::types::{ByteCountEvent, TunnelSnapshot};
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Traffic history
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One byte-count sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficSample {
    pub timestamp: DateTime<Utc>,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub in_per_sec: f64,
    pub out_per_sec: f64,
}

/// Turns cumulative engine counters into per-interval deltas.
#[derive(Debug, Clone)]
pub struct TrafficHistory {
    samples: VecDeque<TrafficSample>,
    max_samples: usize,
    last: ByteCountEvent,
    last_time_ms: i64,
}

impl Default for TrafficHistory {
    fn default() -> Self {
        Self::new(3600)
    }
}

impl TrafficHistory {
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            max_samples,
            last: ByteCountEvent::default(),
            last_time_ms: 0,
        }
    }

    /// Record cumulative counters and return them with the delta since
    /// the previous sample. A counter that went backwards (engine restart)
    /// counts from zero.
    pub fn add(&mut self, bytes_in: u64, bytes_out: u64) -> ByteCountEvent {
        let now = Utc::now();
        let now_ms = now.timestamp_millis();

        let diff_in = bytes_in.checked_sub(self.last.bytes_in).unwrap_or(bytes_in);
        let diff_out = bytes_out.checked_sub(self.last.bytes_out).unwrap_or(bytes_out);

        let elapsed_secs = if self.last_time_ms > 0 {
            (now_ms - self.last_time_ms).max(0) as f64 / 1000.0
        } else {
            1.0
        };
        let rate = |delta: u64| {
            if elapsed_secs > 0.0 {
                delta as f64 / elapsed_secs
            } else {
                0.0
            }
        };

        self.samples.push_back(TrafficSample {
            timestamp: now,
            bytes_in,
            bytes_out,
            in_per_sec: rate(diff_in),
            out_per_sec: rate(diff_out),
        });
        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }

        self.last = ByteCountEvent {
            bytes_in,
            bytes_out,
            diff_in,
            diff_out,
        };
        self.last_time_ms = now_ms;
        self.last
    }

    /// Most recent counters and delta; all zero before the first sample.
    pub fn last_diff(&self) -> ByteCountEvent {
        self.last
    }

    pub fn samples(&self) -> &VecDeque<TrafficSample> {
        &self.samples
    }

    pub fn clear(&mut self) {
        *self = Self::new(self.max_samples);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Tunnel metadata
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

lazy_static! {
    static ref PUSH_REPLY: Option<Regex> =
        Regex::new(r"PUSH:\s+Received\s+control\s+message").ok();
    static ref ROUTE_GATEWAY: Option<Regex> = Regex::new(r"route-gateway ([^,]+),").ok();
    static ref CONTROL_CHANNEL: Option<Regex> = Regex::new(r"Control\s+Channel:([^,]+)").ok();
    static ref CONTROL_CIPHER: Option<Regex> =
        Regex::new(r"Control\s+Channel:\s+[^,]+,([^,]+),").ok();
    static ref DATA_CHANNEL: Option<Regex> = Regex::new(r"Data\s+Channel").ok();
    static ref DATA_CIPHER: Option<Regex> = Regex::new(r"Cipher[ \t']+([^']+)").ok();
    static ref DATA_AUTH: Option<Regex> = Regex::new(r"message\s+hash[ \t']+([^']+)").ok();
}

fn matches(re: &Option<Regex>, line: &str) -> bool {
    re.as_ref().is_some_and(|re| re.is_match(line))
}

fn capture(re: &Option<Regex>, line: &str) -> Option<String> {
    re.as_ref()?
        .captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Accumulates tunnel metadata from engine log lines until the tunnel
/// is up.
#[derive(Debug, Clone, Default)]
pub struct TunnelInfoCollector {
    info: TunnelSnapshot,
}

impl TunnelInfoCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inspect one engine log line.
    pub fn observe(&mut self, line: &str) {
        if matches(&PUSH_REPLY, line) {
            if let Some(gw) = capture(&ROUTE_GATEWAY, line) {
                let gw = gw.trim().to_string();
                if gw.contains(':') {
                    self.info.vpn_gateway_v6 = Some(gw);
                } else {
                    self.info.vpn_gateway_v4 = Some(gw);
                }
            }
        } else if matches(&CONTROL_CHANNEL, line) {
            if let Some(version) = capture(&CONTROL_CHANNEL, line) {
                self.info.tls_version = Some(version.trim().to_string());
            }
            // `cipher TLSv1/SSLv3 DHE-RSA-AES256-SHA` keeps the last word
            if let Some(cipher) = capture(&CONTROL_CIPHER, line) {
                if let Some(last) = cipher.split(' ').last().filter(|s| !s.is_empty()) {
                    self.info.tls_cipher = Some(last.to_string());
                }
            }
        } else if matches(&DATA_CHANNEL, line) {
            if let Some(cipher) = capture(&DATA_CIPHER, line) {
                self.info.cipher = Some(cipher);
            }
            if let Some(auth) = capture(&DATA_AUTH, line) {
                self.info.auth = Some(auth);
            }
        }
    }

    /// Snapshot stamped with the establishment time.
    pub fn snapshot(&self, established: DateTime<Utc>) -> TunnelSnapshot {
        TunnelSnapshot {
            established_time: Some(established),
            ..self.info.clone()
        }
    }

    pub fn current(&self) -> &TunnelSnapshot {
        &self.info
    }

    pub fn clear(&mut self) {
        self.info = TunnelSnapshot::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── TrafficHistory ───────────────────────────────────────────

    #[test]
    fn first_sample_diff_equals_totals() {
        let mut h = TrafficHistory::new(10);
        let d = h.add(1000, 500);
        assert_eq!((d.diff_in, d.diff_out), (1000, 500));
    }

    #[test]
    fn subsequent_samples_are_deltas() {
        let mut h = TrafficHistory::new(10);
        h.add(1000, 500);
        let d = h.add(1500, 700);
        assert_eq!((d.bytes_in, d.bytes_out), (1500, 700));
        assert_eq!((d.diff_in, d.diff_out), (500, 200));
        assert_eq!(h.last_diff(), d);
    }

    #[test]
    fn counter_reset_counts_from_zero() {
        let mut h = TrafficHistory::new(10);
        h.add(5000, 5000);
        let d = h.add(100, 50);
        assert_eq!((d.diff_in, d.diff_out), (100, 50));
    }

    #[test]
    fn samples_are_bounded() {
        let mut h = TrafficHistory::new(2);
        h.add(1, 1);
        h.add(2, 2);
        h.add(3, 3);
        assert_eq!(h.samples().len(), 2);
        assert_eq!(h.samples()[0].bytes_in, 2);
        h.clear();
        assert!(h.samples().is_empty());
        assert_eq!(h.last_diff(), ByteCountEvent::default());
    }

    #[test]
    fn long_runs_keep_newest_samples_in_order() {
        let mut h = TrafficHistory::new(3);
        for i in 1..=1000 {
            h.add(i, i);
        }
        let kept: Vec<u64> = h.samples().iter().map(|s| s.bytes_in).collect();
        assert_eq!(kept, vec![998, 999, 1000]);
        assert_eq!(h.last_diff().diff_in, 1);
    }

    // ── TunnelInfoCollector ──────────────────────────────────────

    #[test]
    fn collects_gateways() {
        let mut c = TunnelInfoCollector::new();
        c.observe("PUSH: Received control message: 'PUSH_REPLY,route 10.8.0.1,route-gateway 10.8.0.1,topology subnet'");
        c.observe("PUSH: Received control message: 'PUSH_REPLY,route-gateway fd00::1,ping 10'");
        assert_eq!(c.current().vpn_gateway_v4.as_deref(), Some("10.8.0.1"));
        assert_eq!(c.current().vpn_gateway_v6.as_deref(), Some("fd00::1"));
    }

    #[test]
    fn collects_control_channel() {
        let mut c = TunnelInfoCollector::new();
        c.observe("Control Channel: TLSv1.3, cipher TLSv1.3 TLS_AES_256_GCM_SHA384, 2048 bit RSA");
        assert_eq!(c.current().tls_version.as_deref(), Some("TLSv1.3"));
        assert_eq!(c.current().tls_cipher.as_deref(), Some("TLS_AES_256_GCM_SHA384"));
    }

    #[test]
    fn collects_data_channel() {
        let mut c = TunnelInfoCollector::new();
        c.observe("Data Channel Encrypt: Cipher 'AES-128-CBC' initialized with 128 bit key");
        c.observe("Data Channel Encrypt: Using 160 bit message hash 'SHA1' for HMAC authentication");
        assert_eq!(c.current().cipher.as_deref(), Some("AES-128-CBC"));
        assert_eq!(c.current().auth.as_deref(), Some("SHA1"));
    }

    #[test]
    fn snapshot_carries_time() {
        let mut c = TunnelInfoCollector::new();
        c.observe("Data Channel: cipher 'AES-256-GCM'");
        let now = Utc::now();
        let snap = c.snapshot(now);
        assert_eq!(snap.established_time, Some(now));
        c.clear();
        assert_eq!(c.current(), &TunnelSnapshot::default());
    }
}
