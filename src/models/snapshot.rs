//! Request/response snapshots
//!
//! Plain-data images of an HTTP exchange that cross the hub channel inside
//! breakpoint hits and resume commands. Body bytes travel base64-encoded.

use crate::models::b64;
use crate::models::{HttpMethod, HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSnapshot {
    pub method: HttpMethod,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, with = "b64::optional")]
    pub body: Option<Vec<u8>>,
}

impl RequestSnapshot {
    pub fn of(req: &HttpRequest) -> Self {
        Self {
            method: req.method,
            url: req.url.clone(),
            headers: req.headers.clone(),
            body: req.body.clone(),
        }
    }

    /// Overlay this snapshot onto a live request, keeping its id and timing.
    pub fn apply_to(&self, req: &mut HttpRequest) {
        req.method = self.method;
        req.url = self.url.clone();
        req.headers = self.headers.clone();
        req.body = self.body.clone();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseSnapshot {
    pub status: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, with = "b64::optional")]
    pub body: Option<Vec<u8>>,
}

impl ResponseSnapshot {
    pub fn of(resp: &HttpResponse) -> Self {
        Self {
            status: resp.status,
            headers: resp.headers.clone(),
            body: resp.body.clone(),
        }
    }

    pub fn into_response(self) -> HttpResponse {
        HttpResponse::new(self.status, self.headers, self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_keeps_request_identity() {
        let mut req = HttpRequest::new(HttpMethod::Post, "https://shop.example.com/checkout", HashMap::new());
        req.body = Some(b"{\"qty\":1}".to_vec());
        let id = req.id.clone();
        let started = req.started_at;

        let mut snap = RequestSnapshot::of(&req);
        snap.body = Some(b"{\"qty\":42}".to_vec());
        snap.apply_to(&mut req);

        assert_eq!(req.id, id);
        assert_eq!(req.started_at, started);
        assert_eq!(req.body.as_deref(), Some(&b"{\"qty\":42}"[..]));
    }

    #[test]
    fn response_snapshot_round_trips() {
        let snap = ResponseSnapshot {
            status: 503,
            headers: HashMap::from([("Retry-After".to_string(), "1".to_string())]),
            body: Some(vec![1, 2, 3]),
        };
        let json = serde_json::to_string(&snap).expect("encode");
        let back: ResponseSnapshot = serde_json::from_str(&json).expect("decode");
        assert_eq!(back, snap);
    }
}
