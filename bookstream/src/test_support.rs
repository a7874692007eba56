//! Shared fakes for unit tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::cache::BoxFuture;
use crate::network::{
    HttpMethod, HttpRequest, HttpResponse, HttpTransport, ProgressFn, TransportError,
};
use crate::telemetry::MetricsSink;

struct Resource {
    body: Bytes,
    range_support: bool,
    status: u16,
    delay: Option<Duration>,
    failures: Vec<TransportError>,
}

#[derive(Default)]
struct MockState {
    resources: HashMap<String, Resource>,
    requests: Vec<HttpRequest>,
}

/// In-memory HTTP server.
///
/// Unknown URLs answer 404. Range requests against a resource with range
/// support answer 206 with the slice; otherwise the full body with 200.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_resource(&self, url: &str, body: impl Into<Bytes>) {
        self.state.lock().resources.insert(
            url.to_string(),
            Resource {
                body: body.into(),
                range_support: true,
                status: 200,
                delay: None,
                failures: Vec::new(),
            },
        );
    }

    fn update(&self, url: &str, f: impl FnOnce(&mut Resource)) {
        if let Some(resource) = self.state.lock().resources.get_mut(url) {
            f(resource);
        }
    }

    pub fn set_range_support(&self, url: &str, supported: bool) {
        self.update(url, |r| r.range_support = supported);
    }

    pub fn set_status(&self, url: &str, status: u16) {
        self.update(url, |r| r.status = status);
    }

    pub fn set_delay(&self, url: &str, delay: Duration) {
        self.update(url, |r| r.delay = Some(delay));
    }

    /// Fail the next `times` requests to `url` with `error`.
    pub fn fail_next(&self, url: &str, times: usize, error: TransportError) {
        self.update(url, |r| r.failures = vec![error; times]);
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.state.lock().requests.clone()
    }

    /// Number of GET requests sent to `url`.
    pub fn fetch_count(&self, url: &str) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|r| r.method == HttpMethod::Get && r.url == url)
            .count()
    }

    fn respond(&self, request: &HttpRequest) -> Result<(HttpResponse, Option<Duration>), TransportError> {
        let mut state = self.state.lock();
        state.requests.push(request.clone());

        let Some(resource) = state.resources.get_mut(&request.url) else {
            return Ok((HttpResponse::new(404, Bytes::new()), None));
        };
        let delay = resource.delay;
        if let Some(error) = resource.failures.pop() {
            return Err(error);
        }
        if resource.status != 200 {
            return Ok((HttpResponse::new(resource.status, Bytes::new()), delay));
        }

        let total = resource.body.len() as u64;
        let response = match (request.method, request.range, resource.range_support) {
            (HttpMethod::Head, Some(range), true) => HttpResponse::new(206, Bytes::new())
                .with_header("accept-ranges", "bytes")
                .with_header("content-length", range.len().min(total).to_string())
                .with_header(
                    "content-range",
                    format!("bytes {}-{}/{}", range.start, range.end.min(total.saturating_sub(1)), total),
                ),
            (HttpMethod::Head, _, supported) => {
                let response = HttpResponse::new(200, Bytes::new())
                    .with_header("content-length", total.to_string());
                if supported {
                    response.with_header("accept-ranges", "bytes")
                } else {
                    response
                }
            }
            (HttpMethod::Get, Some(range), true) => {
                let end = range.end.min(total.saturating_sub(1));
                let body = resource.body.slice(range.start as usize..=end as usize);
                HttpResponse::new(206, body)
                    .with_header("content-range", format!("bytes {}-{}/{}", range.start, end, total))
            }
            (HttpMethod::Get, _, _) => HttpResponse::new(200, resource.body.clone())
                .with_header("content-length", total.to_string()),
        };
        Ok((response, delay))
    }
}

impl HttpTransport for MockTransport {
    fn send<'a>(
        &'a self,
        request: HttpRequest,
        progress: Option<&'a ProgressFn>,
    ) -> BoxFuture<'a, Result<HttpResponse, TransportError>> {
        Box::pin(async move {
            let (response, delay) = self.respond(&request)?;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(report) = progress {
                let total = response.body.len() as u64;
                for quarter in 1..=4u64 {
                    report(total * quarter / 4, response.content_length());
                }
            }
            Ok(response)
        })
    }
}

/// Metrics sink remembering everything it was given.
#[derive(Clone, Default)]
pub struct RecordingMetrics {
    records: Arc<Mutex<Vec<(&'static str, f64)>>>,
}

impl RecordingMetrics {
    pub fn names(&self) -> Vec<&'static str> {
        self.records.lock().iter().map(|(n, _)| *n).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.records.lock().iter().filter(|(n, _)| *n == name).count()
    }
}

impl MetricsSink for RecordingMetrics {
    fn record(&self, name: &'static str, value: f64) {
        self.records.lock().push((name, value));
    }
}

/// Manifest JSON for an exploded EPUB with `chapters` spine items
/// `ch0.xhtml`, `ch1.xhtml`, ...
pub fn epub_manifest(title: &str, identifier: &str, chapters: usize) -> serde_json::Value {
    let spine: Vec<_> = (0..chapters)
        .map(|i| serde_json::json!({ "href": format!("ch{}.xhtml", i) }))
        .collect();
    let toc: Vec<_> = (0..chapters)
        .map(|i| serde_json::json!({ "label": format!("Chapter {}", i + 1), "href": format!("ch{}.xhtml", i) }))
        .collect();
    serde_json::json!({
        "title": title,
        "author": "Test Author",
        "identifier": identifier,
        "language": "en",
        "toc": toc,
        "spine": spine,
    })
}

/// Serve an exploded EPUB at `base`: manifest plus one body per chapter.
pub fn serve_epub(transport: &MockTransport, base: &str, identifier: &str, chapters: usize) {
    let manifest = epub_manifest("Test Book", identifier, chapters);
    transport.add_resource(
        &format!("{}/manifest.json", base),
        serde_json::to_vec(&manifest).unwrap_or_default(),
    );
    for i in 0..chapters {
        transport.add_resource(
            &format!("{}/ch{}.xhtml", base, i),
            format!("<html><body><p>Chapter {}</p></body></html>", i + 1).into_bytes(),
        );
    }
}

/// Synthetic PDF of exactly `size` bytes with `pages` page objects spread
/// evenly through the file. With `linearized` the first bytes carry a
/// linearization dictionary announcing the page count; otherwise only the
/// page tree near the end does.
pub fn sample_pdf(pages: u32, size: usize, linearized: bool) -> Vec<u8> {
    let mut data = vec![b' '; size];
    let put = |data: &mut Vec<u8>, at: usize, text: &str| {
        let bytes = text.as_bytes();
        data[at..at + bytes.len()].copy_from_slice(bytes);
    };

    put(&mut data, 0, "%PDF-1.7\n");
    if linearized {
        put(
            &mut data,
            16,
            &format!("1 0 obj\n<< /Linearized 1 /L {} /N {} >>\nendobj\n", size, pages),
        );
    }

    let region = size / pages as usize;
    for page in 0..pages as usize {
        let at = if page == 0 { 128 } else { page * region };
        put(
            &mut data,
            at,
            &format!("{} 0 obj\n<< /Type /Page /MediaBox [0 0 595 842] >>\nendobj\n", page + 3),
        );
    }

    let trailer = format!("2 0 obj\n<< /Type /Pages /Count {} >>\nendobj\n%%EOF\n", pages);
    put(&mut data, size - trailer.len(), &trailer);
    data
}
