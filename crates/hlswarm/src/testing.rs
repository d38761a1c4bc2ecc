// Scripted transport for driving clients and the fleet under a paused clock.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::StatusCode;
use url::Url;

use crate::error::TransportError;
use crate::transport::{FetchOptions, FetchResponse, Transport};

#[derive(Debug, Clone)]
pub enum Reply {
    Status(u16, String),
    Fail,
    Hang,
}

impl Reply {
    pub fn ok(body: impl Into<String>) -> Self {
        Self::Status(200, body.into())
    }

    pub fn status(code: u16) -> Self {
        Self::Status(code, String::new())
    }
}

#[derive(Debug)]
struct Route {
    queued: VecDeque<Reply>,
    fallback: Reply,
}

/// Answers requests by exact URL. Unknown URLs get a 404.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    routes: Mutex<HashMap<String, Route>>,
    requests: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers every request for `url` with `reply` once queued replies run out.
    pub fn route(&self, url: &str, reply: Reply) -> &Self {
        let mut routes = self.routes.lock();
        let route = routes.entry(url.to_owned()).or_insert_with(|| Route {
            queued: VecDeque::new(),
            fallback: reply.clone(),
        });
        route.fallback = reply;
        self
    }

    /// Queues a one-shot reply for `url`.
    pub fn push(&self, url: &str, reply: Reply) -> &Self {
        let mut routes = self.routes.lock();
        routes
            .entry(url.to_owned())
            .or_insert_with(|| Route {
                queued: VecDeque::new(),
                fallback: Reply::status(404),
            })
            .queued
            .push_back(reply);
        self
    }

    pub fn count(&self, url: &str) -> usize {
        self.requests.lock().iter().filter(|u| *u == url).count()
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }

    fn next_reply(&self, url: &str) -> Reply {
        let mut routes = self.routes.lock();
        match routes.get_mut(url) {
            Some(route) => route
                .queued
                .pop_front()
                .unwrap_or_else(|| route.fallback.clone()),
            None => Reply::status(404),
        }
    }
}

fn respond(code: u16, body: String) -> Result<FetchResponse, TransportError> {
    let status = StatusCode::from_u16(code).unwrap();
    Ok(FetchResponse::new(status, body))
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn fetch(
        &self,
        url: &Url,
        _options: FetchOptions,
    ) -> Result<FetchResponse, TransportError> {
        self.requests.lock().push(url.to_string());
        match self.next_reply(url.as_str()) {
            Reply::Status(code, body) => respond(code, body),
            Reply::Fail => Err(TransportError::request(url.as_str(), "connection reset")),
            Reply::Hang => std::future::pending().await,
        }
    }
}

/// Media playlist with `count` segments of `duration` seconds starting at `first`.
pub fn media_playlist(first: u64, count: u64, duration: u64, vod: bool) -> String {
    let mut text = format!(
        "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:{duration}\n#EXT-X-MEDIA-SEQUENCE:{first}\n"
    );
    if vod {
        text.push_str("#EXT-X-PLAYLIST-TYPE:VOD\n");
    }
    for seq in first..first + count {
        text.push_str(&format!("#EXTINF:{duration}.000,\nseg{seq}.ts\n"));
    }
    if vod {
        text.push_str("#EXT-X-ENDLIST\n");
    }
    text
}

pub fn master_playlist(variants: &[(u64, &str)]) -> String {
    let mut text = String::from("#EXTM3U\n");
    for (bandwidth, uri) in variants {
        text.push_str(&format!("#EXT-X-STREAM-INF:BANDWIDTH={bandwidth}\n{uri}\n"));
    }
    text
}
