use std::time::{Duration, Instant};

use nilis_pb::FORWARDED_HEADER;
use tonic::metadata::MetadataMap;

const GRPC_TIMEOUT_HEADER: &str = "grpc-timeout";

/// What the dispatcher needs to know about an inbound call beyond its key.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestContext {
    pub deadline: Option<Instant>,
    /// Set when a peer already proxied this call once.
    pub forwarded: bool,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn forwarded(mut self) -> Self {
        self.forwarded = true;
        self
    }

    pub fn from_metadata(metadata: &MetadataMap) -> Self {
        let deadline = metadata
            .get(GRPC_TIMEOUT_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_grpc_timeout)
            .map(|timeout| Instant::now() + timeout);
        let forwarded = metadata.get(FORWARDED_HEADER).is_some();
        Self {
            deadline,
            forwarded,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| d <= Instant::now())
    }

    /// Timeout for an outbound call: the configured limit, capped by what
    /// is left of the caller's deadline.
    pub fn effective_timeout(&self, limit: Duration) -> Duration {
        match self.deadline {
            Some(deadline) => {
                limit.min(deadline.saturating_duration_since(Instant::now()))
            }
            None => limit,
        }
    }
}

/// Parse a gRPC `grpc-timeout` value: up to 8 digits and a unit.
pub fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    if value.len() < 2 || value.len() > 9 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    let amount: u64 = digits.parse().ok()?;
    let timeout = match unit {
        "H" => Duration::from_secs(amount.checked_mul(3600)?),
        "M" => Duration::from_secs(amount.checked_mul(60)?),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return None,
    };
    Some(timeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_unit() {
        assert_eq!(parse_grpc_timeout("2H"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_grpc_timeout("3M"), Some(Duration::from_secs(180)));
        assert_eq!(parse_grpc_timeout("5S"), Some(Duration::from_secs(5)));
        assert_eq!(parse_grpc_timeout("250m"), Some(Duration::from_millis(250)));
        assert_eq!(parse_grpc_timeout("10u"), Some(Duration::from_micros(10)));
        assert_eq!(parse_grpc_timeout("0n"), Some(Duration::ZERO));
    }

    #[test]
    fn rejects_garbage() {
        for bad in ["", "m", "12", "123456789S", "5x", "-5S"] {
            assert_eq!(parse_grpc_timeout(bad), None, "{bad}");
        }
    }

    #[test]
    fn reads_metadata() {
        let mut metadata = MetadataMap::new();
        metadata.insert(GRPC_TIMEOUT_HEADER, "1S".parse().unwrap());
        metadata.insert(FORWARDED_HEADER, "1".parse().unwrap());
        let ctx = RequestContext::from_metadata(&metadata);
        assert!(ctx.forwarded);
        assert!(ctx.deadline.is_some());
        assert!(!ctx.is_expired());

        let ctx = RequestContext::from_metadata(&MetadataMap::new());
        assert!(!ctx.forwarded);
        assert!(ctx.deadline.is_none());
    }

    #[test]
    fn zero_timeout_is_expired() {
        let ctx = RequestContext::new().with_timeout(Duration::ZERO);
        assert!(ctx.is_expired());
        assert_eq!(ctx.effective_timeout(Duration::from_secs(5)), Duration::ZERO);
    }

    #[test]
    fn effective_timeout_is_capped_by_deadline() {
        let limit = Duration::from_secs(5);
        assert_eq!(RequestContext::new().effective_timeout(limit), limit);
        let ctx = RequestContext::new().with_timeout(Duration::from_millis(100));
        assert!(ctx.effective_timeout(limit) <= Duration::from_millis(100));
        let ctx = RequestContext::new().with_timeout(Duration::from_secs(60));
        assert_eq!(ctx.effective_timeout(limit), limit);
    }
}
