use super::{Probe, ProbeError, Target};
use std::time::{Duration, Instant};
use tracing::warn;

/// ICMP echo via the system `ping`, one echo per attempt.
/// Future: raw sockets (`socket2`) to avoid fork/exec per attempt.
pub struct IcmpProbe;

#[async_trait::async_trait]
impl Probe for IcmpProbe {
    async fn attempt(&self, target: &Target) -> Result<Duration, ProbeError> {
        validate_address(&target.address)?;

        // -c 1: one echo; -W: reply wait in whole seconds; -n: no reverse DNS
        let wait_secs = target.timeout.as_secs_f64().ceil().max(1.0) as u64;

        let start = Instant::now();
        let output = tokio::process::Command::new("ping")
            .arg("-n")
            .arg("-c")
            .arg("1")
            .arg("-W")
            .arg(wait_secs.to_string())
            .arg(&target.address)
            .kill_on_drop(true)
            .output()
            .await?;
        let elapsed = start.elapsed();

        if !output.status.success() {
            return Err(ProbeError::NoReply(target.address.clone()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let rtt_ms = extract_rtt(&stdout).unwrap_or_else(|| {
            warn!(target = %target.id, "ping succeeded but RTT could not be parsed; using wall clock");
            elapsed.as_secs_f64() * 1000.0
        });

        Ok(Duration::from_secs_f64(rtt_ms.max(0.0) / 1000.0))
    }
}

/// Only hostnames and IP literals reach the subprocess.
pub fn validate_address(address: &str) -> Result<(), ProbeError> {
    let ok = !address.is_empty()
        && !address.starts_with('-')
        && address
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == ':' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(ProbeError::InvalidAddress(address.to_string()))
    }
}

/// Pull the round-trip time out of `ping` output.
///
/// Handles the per-reply `time=14.2 ms` / `time<1ms` forms and the
/// `rtt min/avg/max/mdev = ...` (or `round-trip`) summary line.
pub fn extract_rtt(output: &str) -> Option<f64> {
    for marker in ["time=", "time<"] {
        if let Some(pos) = output.find(marker) {
            let rest = &output[pos + marker.len()..];
            let num: String = rest
                .chars()
                .take_while(|c| c.is_ascii_digit() || *c == '.')
                .collect();
            if let Ok(v) = num.parse::<f64>() {
                return Some(v);
            }
        }
    }

    for line in output.lines() {
        if let Some(pos) = line.find(" = ") {
            if line[..pos].contains("rtt") || line[..pos].contains("round-trip") {
                let parts: Vec<&str> = line[pos + 3..].split('/').collect();
                if parts.len() >= 2 {
                    return parts[1].trim().parse::<f64>().ok();
                }
            }
        }
    }

    None
}
