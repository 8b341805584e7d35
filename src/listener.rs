//! Terminal-state dispatch and standard response strategies.

use crate::exchange::{Exchange, ProcessState};
use crate::network::{HttpExchange, Response};

/// What a listener wants written back to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Full(Response),
    NoBody(u16),
}

impl Reply {
    pub fn status(&self) -> u16 {
        match self {
            Self::Full(r) => r.status,
            Self::NoBody(s) => *s,
        }
    }

    pub(crate) fn write_to(self, conn: &dyn HttpExchange) {
        match self {
            Self::Full(response) => conn.send(response),
            Self::NoBody(status) => conn.end_exchange_no_body(status),
        }
    }
}

/// Produces the response for each terminal state.
///
/// `ConnectionClosed` never reaches a listener: the dispatcher only closes
/// the socket.
pub trait ExchangeListener<S>: Send + Sync {
    fn on_done(&self, exchange: &Exchange<S>) -> Reply;

    fn on_timeout(&self, exchange: &Exchange<S>) -> Reply;

    fn on_exception(&self, exchange: &Exchange<S>) -> Reply;

    fn on_request_buffer_overflow(&self, exchange: &Exchange<S>) -> Reply;

    fn on_response_buffer_overflow(&self, exchange: &Exchange<S>) -> Reply;

    fn on_rejected(&self, exchange: &Exchange<S>) -> Reply;

    fn on_interrupted(&self, exchange: &Exchange<S>) -> Reply {
        self.on_exception(exchange)
    }

    fn on_unknown(&self, _exchange: &Exchange<S>) -> Reply {
        Reply::NoBody(500)
    }
}

/// Route `state` to exactly one listener method. `None` means close the
/// connection without writing.
pub(crate) fn dispatch<S>(
    listener: &dyn ExchangeListener<S>,
    exchange: &Exchange<S>,
    state: ProcessState,
) -> Option<Reply> {
    let reply = match state {
        ProcessState::Done => listener.on_done(exchange),
        ProcessState::Timeout => listener.on_timeout(exchange),
        ProcessState::Interrupted => listener.on_interrupted(exchange),
        ProcessState::Exception => {
            if let Some(cause) = exchange.failure() {
                tracing::warn!(exchange_id = exchange.id(), %cause, "exchange failed");
            }
            listener.on_exception(exchange)
        }
        ProcessState::Rejected => listener.on_rejected(exchange),
        ProcessState::RequestBufferOverflow => listener.on_request_buffer_overflow(exchange),
        ProcessState::ResponseBufferOverflow => listener.on_response_buffer_overflow(exchange),
        ProcessState::ConnectionClosed => return None,
        ProcessState::Running | ProcessState::Unknown => {
            tracing::warn!(exchange_id = exchange.id(), state = %state, "unexpected state at dispatch");
            listener.on_unknown(exchange)
        }
    };
    Some(reply)
}

/// Pass the handler-written response through.
///
/// Status defaults to 200, or 204 when the body is empty and no status was set.
pub fn success_reply<S>(exchange: &Exchange<S>) -> Reply {
    let mut buf = exchange.response();
    let body = buf.take_body();
    let status = buf.status().unwrap_or(if body.is_empty() { 204 } else { 200 });
    Reply::Full(Response {
        status,
        headers: buf.headers().to_vec(),
        cookies: buf.cookies().to_vec(),
        content_type: buf.content_type().map(str::to_owned),
        body,
    })
}

/// Maps every non-success state to a fixed status code with no body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusCodeListener {
    pub timeout: u16,
    pub exception: u16,
    pub interrupted: u16,
    pub request_overflow: u16,
    pub response_overflow: u16,
    pub rejected: u16,
    pub unknown: u16,
}

impl Default for StatusCodeListener {
    fn default() -> Self {
        Self {
            timeout: 504,
            exception: 500,
            interrupted: 503,
            request_overflow: 413,
            response_overflow: 500,
            rejected: 503,
            unknown: 500,
        }
    }
}

impl<S> ExchangeListener<S> for StatusCodeListener {
    fn on_done(&self, exchange: &Exchange<S>) -> Reply {
        success_reply(exchange)
    }

    fn on_timeout(&self, _: &Exchange<S>) -> Reply {
        Reply::NoBody(self.timeout)
    }

    fn on_exception(&self, _: &Exchange<S>) -> Reply {
        Reply::NoBody(self.exception)
    }

    fn on_request_buffer_overflow(&self, _: &Exchange<S>) -> Reply {
        Reply::NoBody(self.request_overflow)
    }

    fn on_response_buffer_overflow(&self, _: &Exchange<S>) -> Reply {
        Reply::NoBody(self.response_overflow)
    }

    fn on_rejected(&self, _: &Exchange<S>) -> Reply {
        Reply::NoBody(self.rejected)
    }

    fn on_interrupted(&self, _: &Exchange<S>) -> Reply {
        Reply::NoBody(self.interrupted)
    }

    fn on_unknown(&self, _: &Exchange<S>) -> Reply {
        Reply::NoBody(self.unknown)
    }
}

/// 204 for every non-success state; the handler body on success.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoContentListener;

impl NoContentListener {
    const NO_CONTENT: u16 = 204;
}

impl<S> ExchangeListener<S> for NoContentListener {
    fn on_done(&self, exchange: &Exchange<S>) -> Reply {
        success_reply(exchange)
    }

    fn on_timeout(&self, _: &Exchange<S>) -> Reply {
        Reply::NoBody(Self::NO_CONTENT)
    }

    fn on_exception(&self, _: &Exchange<S>) -> Reply {
        Reply::NoBody(Self::NO_CONTENT)
    }

    fn on_request_buffer_overflow(&self, _: &Exchange<S>) -> Reply {
        Reply::NoBody(Self::NO_CONTENT)
    }

    fn on_response_buffer_overflow(&self, _: &Exchange<S>) -> Reply {
        Reply::NoBody(Self::NO_CONTENT)
    }

    fn on_rejected(&self, _: &Exchange<S>) -> Reply {
        Reply::NoBody(Self::NO_CONTENT)
    }

    fn on_unknown(&self, _: &Exchange<S>) -> Reply {
        Reply::NoBody(Self::NO_CONTENT)
    }
}
