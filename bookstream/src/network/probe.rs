//! Connection classification and byte-range support detection.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tracing::{debug, info};

use super::transport::{ByteRange, HttpRequest, HttpTransport};
use crate::error::StreamingError;

/// Coarse connection speed used for chunk sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionClass {
    Slow,
    Medium,
    Fast,
}

impl fmt::Display for ConnectionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionClass::Slow => f.write_str("slow"),
            ConnectionClass::Medium => f.write_str("medium"),
            ConnectionClass::Fast => f.write_str("fast"),
        }
    }
}

/// Effective connection type as reported by a platform quality signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectiveConnectionType {
    Slow2g,
    TwoG,
    ThreeG,
    FourG,
}

impl FromStr for EffectiveConnectionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "slow-2g" => Ok(EffectiveConnectionType::Slow2g),
            "2g" => Ok(EffectiveConnectionType::TwoG),
            "3g" => Ok(EffectiveConnectionType::ThreeG),
            "4g" => Ok(EffectiveConnectionType::FourG),
            other => Err(format!("unknown connection type: {}", other)),
        }
    }
}

impl From<EffectiveConnectionType> for ConnectionClass {
    fn from(value: EffectiveConnectionType) -> Self {
        match value {
            EffectiveConnectionType::Slow2g | EffectiveConnectionType::TwoG => ConnectionClass::Slow,
            EffectiveConnectionType::ThreeG => ConnectionClass::Medium,
            EffectiveConnectionType::FourG => ConnectionClass::Fast,
        }
    }
}

/// Source of a network-quality signal.
pub trait NetworkQuality: Send + Sync {
    /// Current effective connection type, `None` when the platform has no signal.
    fn effective_type(&self) -> Option<EffectiveConnectionType>;
}

/// No platform signal; every connection classifies as medium.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoQualitySignal;

impl NetworkQuality for NoQualitySignal {
    fn effective_type(&self) -> Option<EffectiveConnectionType> {
        None
    }
}

/// A fixed signal, for CLIs that take the type as a flag and for tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedQuality(pub EffectiveConnectionType);

impl NetworkQuality for FixedQuality {
    fn effective_type(&self) -> Option<EffectiveConnectionType> {
        Some(self.0)
    }
}

/// Outcome of a range-support probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSupport {
    pub supported: bool,
    /// Full resource size when the server disclosed it.
    pub total_bytes: Option<u64>,
}

/// Probes a server before a progressive load.
#[derive(Clone)]
pub struct ConnectionProbe {
    transport: Arc<dyn HttpTransport>,
    quality: Arc<dyn NetworkQuality>,
}

impl ConnectionProbe {
    pub fn new(transport: Arc<dyn HttpTransport>, quality: Arc<dyn NetworkQuality>) -> Self {
        Self { transport, quality }
    }

    /// Send `HEAD` with `Range: bytes=0-1`.
    ///
    /// Ranges are supported on a 206 or an `Accept-Ranges: bytes` header. The
    /// total comes from `Content-Range` when present, else `Content-Length`.
    /// Any transport failure or non-2xx status is a `range_not_supported`
    /// error, which callers answer by falling back to a full download.
    pub async fn probe_range_support(&self, url: &str) -> Result<RangeSupport, StreamingError> {
        let request = HttpRequest::head(url).with_range(ByteRange::new(0, 1));
        let response = self.transport.send(request, None).await.map_err(|e| {
            StreamingError::range_not_supported(format!("range probe failed: {}", e))
        })?;

        if !response.is_success() {
            return Err(StreamingError::range_not_supported(format!(
                "range probe got HTTP {} from {}",
                response.status, url
            )));
        }

        let supported = response.status == 206 || response.accepts_byte_ranges();
        let total_bytes = response
            .content_range_total()
            .or_else(|| response.content_length())
            .filter(|&total| total > 0);

        info!(url, supported, total_bytes, "Range support probed");
        Ok(RangeSupport {
            supported,
            total_bytes,
        })
    }

    /// Classify the current connection, `Medium` without a signal.
    pub fn classify(&self) -> ConnectionClass {
        let class = self
            .quality
            .effective_type()
            .map(ConnectionClass::from)
            .unwrap_or(ConnectionClass::Medium);
        debug!(class = %class, "Connection classified");
        class
    }
}
