//! Boundary with the network layer.
//!
//! The engine never touches sockets. It consumes a connection through
//! [`HttpExchange`] and hands the finished [`Response`] back through it.

pub mod loopback;

use std::time::Instant;

use thiserror::Error;

pub use loopback::{LoopbackExchange, Outcome};

/// The request body exceeded the configured limit.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("request body exceeds {limit} bytes")]
pub struct RequestTooLarge {
    pub limit: usize,
}

/// A fully assembled response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub cookies: Vec<String>,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn status(status: u16) -> Self {
        Self { status, ..Default::default() }
    }
}

/// One client connection/request as seen by the engine.
pub trait HttpExchange: Send + Sync {
    /// Read the full request body, failing if it is larger than `max_size`.
    fn receive_request_bytes(&self, max_size: usize) -> Result<Vec<u8>, RequestTooLarge>;

    /// When the network layer started reading the request. Queueing delay
    /// counts against the deadline from this instant.
    fn request_start(&self) -> Instant;

    fn is_gzipped(&self) -> bool {
        false
    }

    fn uri(&self) -> String;

    fn client_ip(&self) -> Option<String> {
        None
    }

    fn user_agent(&self) -> Option<String> {
        None
    }

    fn referrer(&self) -> Option<String> {
        None
    }

    fn query_parameter(&self, name: &str) -> Option<String>;

    fn send(&self, response: Response);

    fn end_exchange_no_body(&self, status: u16);

    fn close_connection(&self);
}
