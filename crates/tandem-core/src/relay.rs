//! Stream relay: re-emit a provider's chunk stream as envelopes with exactly
//! one terminal envelope.
//!
//! The relay is pull-based. It asks the upstream for the next chunk only when
//! its own consumer asks, so there is no buffer between them. Dropping the relay
//! drops the upstream; cancelling the token stops the pull loop. An upstream
//! that goes quiet for longer than the idle timeout ends with an `error`.

use std::time::Duration;

use futures_util::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ProviderError;
use crate::providers::ChunkStream;
use crate::wire::Envelope;

/// Wrap `upstream` in envelopes.
///
/// Emits `token` per chunk in arrival order, then either one `end` (upstream
/// exhausted) or one `error` (upstream failed or sent nothing for `idle_timeout`).
/// If `cancel` fires first, the relay stops without a terminal envelope because
/// nobody is listening.
pub fn relay(
    upstream: ChunkStream,
    cancel: CancellationToken,
    idle_timeout: Duration,
) -> impl Stream<Item = Envelope> + Send {
    async_stream::stream! {
        let mut upstream = upstream;
        let mut chunks = 0usize;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Relay cancelled after {} chunk(s)", chunks);
                    break;
                }
                next = tokio::time::timeout(idle_timeout, upstream.next()) => {
                    next.unwrap_or(Some(Err(ProviderError::Timeout(idle_timeout))))
                }
            };

            match next {
                Some(Ok(chunk)) => {
                    chunks += 1;
                    yield Envelope::token(chunk);
                }
                Some(Err(e)) => {
                    let raw = e.to_string();
                    warn!("Stream failed after {} chunk(s): {}", chunks, raw);
                    yield Envelope::error(e.class().user_message(&raw));
                    break;
                }
                None => {
                    debug!("Stream finished after {} chunk(s)", chunks);
                    yield Envelope::end();
                    break;
                }
            }
        }
    }
}
