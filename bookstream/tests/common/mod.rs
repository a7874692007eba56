//! Shared fixtures for the integration tests.
//!
//! `BookServer` is an in-memory HTTP origin implementing the public
//! [`HttpTransport`] seam, so the tests drive the loader exactly as an
//! application would.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use bookstream::cache::BoxFuture;
use bookstream::network::{
    HttpMethod, HttpRequest, HttpResponse, HttpTransport, ProgressFn, TransportError,
};

#[derive(Default)]
struct ServerState {
    files: HashMap<String, Bytes>,
    no_ranges: Vec<String>,
    log: Vec<HttpRequest>,
}

#[derive(Clone, Default)]
pub struct BookServer {
    state: Arc<Mutex<ServerState>>,
}

impl BookServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, url: &str, body: impl Into<Bytes>) {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(url.to_string(), body.into());
    }

    /// Serve `url` without byte-range support.
    pub fn disable_ranges(&self, url: &str) {
        self.state.lock().unwrap().no_ranges.push(url.to_string());
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.state.lock().unwrap().log.clone()
    }

    /// GET requests for `url`.
    pub fn gets(&self, url: &str) -> Vec<HttpRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == HttpMethod::Get && r.url == url)
            .collect()
    }

    /// GET requests for any URL starting with `prefix`.
    pub fn gets_under(&self, prefix: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.method == HttpMethod::Get && r.url.starts_with(prefix))
            .count()
    }

    fn answer(&self, request: &HttpRequest) -> HttpResponse {
        let mut state = self.state.lock().unwrap();
        state.log.push(request.clone());

        let Some(body) = state.files.get(&request.url).cloned() else {
            return HttpResponse::new(404, Bytes::new());
        };
        let ranges = !state.no_ranges.contains(&request.url);
        let total = body.len() as u64;

        match (request.method, request.range) {
            (HttpMethod::Head, Some(range)) if ranges => HttpResponse::new(206, Bytes::new())
                .with_header("accept-ranges", "bytes")
                .with_header("content-range", format!("bytes {}-{}/{}", range.start, range.end, total)),
            (HttpMethod::Head, _) => {
                HttpResponse::new(200, Bytes::new()).with_header("content-length", total.to_string())
            }
            (HttpMethod::Get, Some(range)) if ranges => {
                let end = range.end.min(total - 1);
                HttpResponse::new(206, body.slice(range.start as usize..=end as usize))
            }
            (HttpMethod::Get, _) => {
                HttpResponse::new(200, body).with_header("content-length", total.to_string())
            }
        }
    }
}

impl HttpTransport for BookServer {
    fn send<'a>(
        &'a self,
        request: HttpRequest,
        progress: Option<&'a ProgressFn>,
    ) -> BoxFuture<'a, Result<HttpResponse, TransportError>> {
        Box::pin(async move {
            let response = self.answer(&request);
            if let Some(report) = progress {
                let total = response.body.len() as u64;
                report(total / 2, Some(total));
                report(total, Some(total));
            }
            Ok(response)
        })
    }
}

/// Publish an exploded EPUB with `chapters` chapters under `base`.
pub fn publish_book(server: &BookServer, base: &str, identifier: &str, chapters: usize) {
    let spine: Vec<_> = (0..chapters)
        .map(|i| serde_json::json!({ "href": format!("text/ch{:02}.xhtml", i) }))
        .collect();
    let manifest = serde_json::json!({
        "title": "Middlemarch",
        "creator": "George Eliot",
        "identifier": identifier,
        "language": "en",
        "spine": spine,
    });
    server.add(&format!("{}/manifest.json", base), manifest.to_string());
    for i in 0..chapters {
        server.add(
            &format!("{}/text/ch{:02}.xhtml", base, i),
            format!("<html><body><h1>Chapter {}</h1></body></html>", i + 1),
        );
    }
}

pub fn chapter_href(index: usize) -> String {
    format!("text/ch{:02}.xhtml", index)
}

/// A synthetic linearized PDF of `size` bytes with `pages` pages.
pub fn linearized_pdf(pages: u32, size: usize) -> Vec<u8> {
    let mut data = vec![b' '; size];
    let mut put = |at: usize, text: String| {
        data[at..at + text.len()].copy_from_slice(text.as_bytes());
    };
    put(0, "%PDF-1.6\n".to_string());
    put(
        16,
        format!("1 0 obj\n<< /Linearized 1 /L {} /N {} >>\nendobj\n", size, pages),
    );
    let region = size / pages as usize;
    for page in 0..pages as usize {
        let at = if page == 0 { 128 } else { page * region };
        put(
            at,
            format!("{} 0 obj\n<< /Type /Page /MediaBox [0 0 420 595] >>\nendobj\n", page + 3),
        );
    }
    let trailer = format!("2 0 obj\n<< /Type /Pages /Count {} >>\nendobj\n%%EOF\n", pages);
    put(size - trailer.len(), trailer);
    data
}
