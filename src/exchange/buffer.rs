//! Fixed-capacity response buffer.

use crate::error::HandlerError;

/// Response body and metadata written by workflow steps.
///
/// The body never grows past `capacity`. A write that would exceed it fails
/// with [`HandlerError::ResponseOverflow`] and leaves the buffer unchanged.
#[derive(Debug)]
pub struct ResponseBuffer {
    body: Vec<u8>,
    capacity: usize,
    status: Option<u16>,
    content_type: Option<String>,
    headers: Vec<(String, String)>,
    cookies: Vec<String>,
}

impl ResponseBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            body: Vec::new(),
            capacity,
            status: None,
            content_type: None,
            headers: Vec::new(),
            cookies: Vec::new(),
        }
    }

    /// Append bytes to the body.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), HandlerError> {
        let attempted = self.body.len() + bytes.len();
        if attempted > self.capacity {
            return Err(HandlerError::ResponseOverflow { capacity: self.capacity, attempted });
        }
        self.body.extend_from_slice(bytes);
        Ok(())
    }

    /// Replace the body.
    pub fn set_body(&mut self, bytes: &[u8]) -> Result<(), HandlerError> {
        if bytes.len() > self.capacity {
            return Err(HandlerError::ResponseOverflow {
                capacity: self.capacity,
                attempted: bytes.len(),
            });
        }
        self.body.clear();
        self.body.extend_from_slice(bytes);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.body.clear();
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.body.len()
    }

    /// Status the handler wants on success. Listeners decide whether to honor it.
    pub fn set_status(&mut self, status: u16) {
        self.status = Some(status);
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn set_content_type(&mut self, content_type: impl Into<String>) {
        self.content_type = Some(content_type.into());
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn add_cookie(&mut self, cookie: impl Into<String>) {
        self.cookies.push(cookie.into());
    }

    pub fn cookies(&self) -> &[String] {
        &self.cookies
    }

    /// Move the body out, leaving an empty buffer with the same capacity.
    pub fn take_body(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.body)
    }
}
