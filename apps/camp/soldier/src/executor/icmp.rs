use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use camp_core::{IcmpStatistics, InstructionType, IpAddress, ReplyPayload};
use tokio::process::Command;

use super::{Executor, ExecutorError};

/// Per-reply wait handed to `ping -W`.
const REPLY_WAIT_SECS: u64 = 5;

/// Echo probe through the system `ping` binary.
pub struct IcmpExecutor {
    count: u32,
}

impl IcmpExecutor {
    pub fn new(count: u32) -> Self {
        Self { count }
    }

    fn deadline(&self) -> Duration {
        Duration::from_secs(u64::from(self.count) * (REPLY_WAIT_SECS + 1) + REPLY_WAIT_SECS)
    }
}

#[async_trait]
impl Executor for IcmpExecutor {
    fn kind(&self) -> InstructionType {
        InstructionType::Icmp
    }

    async fn execute(&self, content: &str) -> Result<ReplyPayload, ExecutorError> {
        let addr = content.trim();
        if addr.is_empty() || addr.starts_with('-') {
            return Err(ExecutorError::Failed(format!("invalid address {addr:?}")));
        }
        let child = Command::new("ping")
            .arg("-n")
            .arg("-c")
            .arg(self.count.to_string())
            .arg("-W")
            .arg(REPLY_WAIT_SECS.to_string())
            .arg(addr)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let deadline = self.deadline();
        let output = tokio::time::timeout(deadline, child.wait_with_output())
            .await
            .map_err(|_| ExecutorError::TimedOut(deadline))??;

        let stdout = String::from_utf8_lossy(&output.stdout);
        // ping exits 1 when nothing answered; the summary is still valid.
        match parse_ping_output(addr, &stdout) {
            Some(stats) => Ok(ReplyPayload::Icmp(stats)),
            None => Err(ExecutorError::Failed(format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
        }
    }
}

/// Parses iputils/busybox style `ping` output. Returns `None` when no
/// statistics summary is present.
pub fn parse_ping_output(addr: &str, output: &str) -> Option<IcmpStatistics> {
    let mut stats = IcmpStatistics {
        addr: addr.to_string(),
        ..Default::default()
    };
    let mut saw_summary = false;

    for line in output.lines() {
        let line = line.trim();
        if line.starts_with("PING ") {
            if let Some(ip) = between(line, '(', ')') {
                stats.ip_addr = Some(IpAddress {
                    ip: ip.to_string(),
                    zone: String::new(),
                });
            }
        } else if let Some(rest) = line.split("time=").nth(1) {
            if line.contains("DUP!") {
                stats.packets_recv_duplicates += 1;
                continue;
            }
            let millis = rest
                .trim_end_matches("(DUP!)")
                .trim()
                .trim_end_matches("ms")
                .trim();
            if let Ok(ms) = millis.parse::<f64>() {
                stats.rtts.push(millis_to_nanos(ms));
            }
        } else if line.contains("packets transmitted") {
            saw_summary = true;
            for part in line.split(',') {
                let part = part.trim();
                let number = part.split_whitespace().next().unwrap_or_default();
                if part.ends_with("packets transmitted") {
                    stats.packets_sent = number.parse().unwrap_or_default();
                } else if part.ends_with("received") || part.ends_with("packets received") {
                    stats.packets_recv = number.parse().unwrap_or_default();
                } else if part.ends_with("packet loss") {
                    stats.packet_loss = number.trim_end_matches('%').parse().unwrap_or_default();
                }
            }
        } else if let Some(values) = line
            .strip_prefix("rtt min/avg/max/mdev = ")
            .or_else(|| line.strip_prefix("round-trip min/avg/max = "))
            .or_else(|| line.strip_prefix("round-trip min/avg/max/stddev = "))
        {
            let numbers: Vec<f64> = values
                .trim_end_matches("ms")
                .trim()
                .split('/')
                .filter_map(|v| v.trim().parse().ok())
                .collect();
            if let [min, avg, max, rest @ ..] = numbers.as_slice() {
                stats.min_rtt = millis_to_nanos(*min);
                stats.avg_rtt = millis_to_nanos(*avg);
                stats.max_rtt = millis_to_nanos(*max);
                if let Some(dev) = rest.first() {
                    stats.std_dev_rtt = millis_to_nanos(*dev);
                }
            }
        }
    }

    saw_summary.then_some(stats)
}

fn between(line: &str, open: char, close: char) -> Option<&str> {
    let start = line.find(open)? + open.len_utf8();
    let end = line[start..].find(close)? + start;
    Some(&line[start..end])
}

fn millis_to_nanos(ms: f64) -> i64 {
    (ms * 1_000_000.0).round() as i64
}
