//! Network layer: transport seam, connection probe and chunk planning.

mod http;
mod planner;
mod probe;
mod transport;

pub use http::ReqwestTransport;
pub use planner::{ChunkPlanner, MAX_CHUNK_BYTES, MIN_CHUNK_BYTES};
pub use probe::{
    ConnectionClass, ConnectionProbe, EffectiveConnectionType, FixedQuality, NetworkQuality,
    NoQualitySignal, RangeSupport,
};
pub use transport::{
    ensure_success, ByteRange, HttpMethod, HttpRequest, HttpResponse, HttpTransport, ProgressFn,
    TransportError,
};
