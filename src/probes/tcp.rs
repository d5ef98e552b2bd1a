//! TCP connection probe: time to complete a TCP handshake.

use super::{icmp::validate_address, Probe, ProbeError, Target};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

pub struct TcpProbe;

#[async_trait::async_trait]
impl Probe for TcpProbe {
    async fn attempt(&self, target: &Target) -> Result<Duration, ProbeError> {
        validate_address(&target.address)?;
        let port = target
            .port
            .ok_or_else(|| ProbeError::InvalidAddress(format!("{} (missing port)", target.address)))?;

        let start = Instant::now();
        let stream = TcpStream::connect((target.address.as_str(), port)).await?;
        let rtt = start.elapsed();
        drop(stream);

        tracing::trace!(target = %target.id, rtt_ms = rtt.as_secs_f64() * 1000.0, "tcp connect");
        Ok(rtt)
    }
}
