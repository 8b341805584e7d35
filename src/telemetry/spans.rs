//! Span factory for exchange execution.

use tracing::{info_span, Span};

/// Standardized span around one pass of an exchange through a worker.
///
/// Fields:
/// - `exchange_id`, `uri`: identity of the exchange
/// - `cursor`: index of the first step run in this pass
/// - `state`: filled in with the process state when the pass ends
pub struct ExchangeSpan;

impl ExchangeSpan {
    #[allow(clippy::new_ret_no_self)]
    pub fn new(exchange_id: u64, uri: &str, cursor: usize) -> Span {
        info_span!(
            "exchange",
            exchange_id,
            uri = %uri,
            cursor,
            state = tracing::field::Empty,
        )
    }
}
