//! Request/response correlation over a fire-and-forget message channel.
//!
//! The underlying channel only knows how to deliver one message in one
//! direction. To give callers a synchronous-looking request/response model,
//! a sender registers a waiter under an opaque token before putting the
//! request on the wire; the inbound side feeds every reply through
//! [`Correlator::resolve`], which settles the matching waiter exactly once.
//!
//! Flow:
//! 1. Caller issues a token, stamps the outgoing request with it
//! 2. Caller suspends on [`PendingResponse::wait`]
//! 3. Remote handles the request and replies with the same token
//! 4. `resolve` looks the token up, cancels the expiry timer, and settles
//!    the waiter with the payload (or a reconstructed remote error)

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::bridge::protocol::{CorrelationToken, ErrorPayload, TaggedMessage};

#[derive(Debug, thiserror::Error)]
pub enum CorrelationError {
    /// Caller reused a token that still has a waiter. Tokens are
    /// collision-resistant by construction, so this is a programmer error.
    #[error("a request is already pending for correlation token {0}")]
    DuplicateToken(CorrelationToken),

    #[error("timed out waiting for a response")]
    Timeout,

    /// Failure reported by the remote process, rebuilt from its structured
    /// error payload.
    #[error("{name}: {message}")]
    Remote {
        name: String,
        message: String,
        stack: Option<String>,
    },

    #[error("correlator dropped while the request was pending")]
    Dropped,
}

impl From<ErrorPayload> for CorrelationError {
    fn from(payload: ErrorPayload) -> Self {
        Self::Remote {
            name: payload.name,
            message: payload.message,
            stack: payload.stack,
        }
    }
}

struct Pending {
    tx: oneshot::Sender<Result<Value, CorrelationError>>,
    expiry: Option<JoinHandle<()>>,
}

/// Handle to one outstanding request.
#[derive(Debug)]
pub struct PendingResponse {
    token: CorrelationToken,
    rx: oneshot::Receiver<Result<Value, CorrelationError>>,
}

impl PendingResponse {
    pub fn token(&self) -> &CorrelationToken {
        &self.token
    }

    /// Suspend until the request settles. Exactly one of: the response
    /// payload, a remote error, a timeout, or `Dropped` if the correlator
    /// went away first.
    pub async fn wait(self) -> Result<Value, CorrelationError> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(CorrelationError::Dropped),
        }
    }
}

/// Maps in-flight correlation tokens to their waiters.
///
/// Entries are removed eagerly on every terminal transition (resolve,
/// remote error, expiry) so abandoned requests without a timeout are the
/// only way the map can grow.
pub struct Correlator {
    pending: DashMap<CorrelationToken, Pending>,
}

impl Correlator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: DashMap::new(),
        })
    }

    /// Register a waiter under `token`. A strictly positive `timeout` arms
    /// an expiry timer that rejects the waiter and removes the entry if no
    /// response arrives first; `None` or zero means wait indefinitely.
    pub fn issue(
        self: &Arc<Self>,
        token: CorrelationToken,
        timeout: Option<Duration>,
    ) -> Result<PendingResponse, CorrelationError> {
        let (tx, rx) = oneshot::channel();

        match self.pending.entry(token.clone()) {
            Entry::Occupied(_) => {
                return Err(CorrelationError::DuplicateToken(token));
            }
            Entry::Vacant(slot) => {
                slot.insert(Pending { tx, expiry: None });
            }
        }

        if let Some(timeout) = timeout.filter(|t| !t.is_zero()) {
            // Weak so an armed timer never keeps a discarded correlator alive.
            let correlator = Arc::downgrade(self);
            let expire_token = token.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(correlator) = correlator.upgrade() {
                    correlator.expire(&expire_token);
                }
            });

            match self.pending.get_mut(&token) {
                Some(mut entry) => entry.expiry = Some(handle),
                // Already resolved before the timer could be attached.
                None => handle.abort(),
            }
        }

        tracing::trace!(%token, "Registered pending request");
        Ok(PendingResponse { token, rx })
    }

    /// Settle the waiter matching the token carried by `message`.
    ///
    /// A token with no pending entry is the normal outcome of a late or
    /// duplicate arrival racing the expiry timer; it is logged and dropped,
    /// never surfaced to any caller.
    pub fn resolve(&self, message: TaggedMessage) {
        let TaggedMessage {
            tag,
            data,
            correlation_token,
        } = message;

        let Some(token) = correlation_token else {
            tracing::warn!(?tag, "Response message carried no correlation token");
            return;
        };

        let Some((_, pending)) = self.pending.remove(&token) else {
            tracing::debug!(%token, "No pending request for response token (late or duplicate)");
            return;
        };

        if let Some(expiry) = pending.expiry {
            expiry.abort();
        }

        let outcome = if tag.is_error_response() {
            let payload = serde_json::from_value::<ErrorPayload>(data.clone())
                .unwrap_or_else(|_| ErrorPayload::new("RemoteError", data.to_string()));
            Err(payload.into())
        } else {
            Ok(data)
        };

        if pending.tx.send(outcome).is_err() {
            tracing::debug!(%token, "Response waiter dropped before settlement");
        }
    }

    /// Number of requests still awaiting a response.
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, token: &CorrelationToken) -> bool {
        self.pending.contains_key(token)
    }

    fn expire(&self, token: &CorrelationToken) {
        let Some((_, pending)) = self.pending.remove(token) else {
            return;
        };
        tracing::debug!(%token, "Pending request timed out");
        let _ = pending.tx.send(Err(CorrelationError::Timeout));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::MessageTag;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn issued_request_stays_pending_until_resolved() {
        let correlator = Correlator::new();
        let token = CorrelationToken::new();

        let pending = correlator.issue(token.clone(), None).unwrap();
        assert_eq!(correlator.outstanding(), 1);
        assert!(correlator.is_pending(&token));

        let still_waiting =
            tokio::time::timeout(Duration::from_millis(200), pending.wait()).await;
        assert!(still_waiting.is_err());
        assert_eq!(correlator.outstanding(), 1);
    }

    #[tokio::test]
    async fn resolve_settles_waiter_with_payload() {
        let correlator = Correlator::new();
        let token = CorrelationToken::new();

        let pending = correlator.issue(token.clone(), None).unwrap();
        correlator.resolve(TaggedMessage::response(
            MessageTag::BroadcastResponse,
            json!({"workers": 4}),
            token.clone(),
        ));

        assert_eq!(pending.wait().await.unwrap(), json!({"workers": 4}));
        assert_eq!(correlator.outstanding(), 0);
    }

    #[tokio::test]
    async fn duplicate_resolve_is_a_no_op() {
        let correlator = Correlator::new();
        let token = CorrelationToken::new();

        let pending = correlator.issue(token.clone(), None).unwrap();
        correlator.resolve(TaggedMessage::response(
            MessageTag::WorkerEvalResponse,
            json!(1),
            token.clone(),
        ));
        // Second arrival for the same token: logged, dropped, no panic.
        correlator.resolve(TaggedMessage::response(
            MessageTag::WorkerEvalResponse,
            json!(2),
            token,
        ));

        assert_eq!(pending.wait().await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn duplicate_token_fails_fast() {
        let correlator = Correlator::new();
        let token = CorrelationToken::from_string("reused");

        let _first = correlator.issue(token.clone(), None).unwrap();
        let err = correlator.issue(token, None).unwrap_err();
        assert!(matches!(err, CorrelationError::DuplicateToken(_)));
        assert_eq!(correlator.outstanding(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_rejects_waiter_and_removes_entry() {
        let correlator = Correlator::new();
        let token = CorrelationToken::new();

        let pending = correlator
            .issue(token.clone(), Some(Duration::from_millis(50)))
            .unwrap();

        let err = pending.wait().await.unwrap_err();
        assert!(matches!(err, CorrelationError::Timeout));
        assert_eq!(correlator.outstanding(), 0);

        // Late arrival after the timer already fired: no effect.
        correlator.resolve(TaggedMessage::response(
            MessageTag::WorkerEvalResponse,
            json!("late"),
            token,
        ));
        assert_eq!(correlator.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn resolve_cancels_armed_expiry_timer() {
        let correlator = Correlator::new();
        let token = CorrelationToken::new();

        let pending = correlator
            .issue(token.clone(), Some(Duration::from_secs(5)))
            .unwrap();
        correlator.resolve(TaggedMessage::response(
            MessageTag::CustomReply,
            json!("pong"),
            token,
        ));

        assert_eq!(pending.wait().await.unwrap(), json!("pong"));

        // Long after the timer would have fired, nothing is left to expire.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(correlator.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_timeout_means_no_expiry() {
        let correlator = Correlator::new();
        let token = CorrelationToken::new();

        let pending = correlator
            .issue(token.clone(), Some(Duration::ZERO))
            .unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(correlator.is_pending(&token));

        correlator.resolve(TaggedMessage::response(
            MessageTag::HeartbeatAck,
            json!(null),
            token,
        ));
        assert_eq!(pending.wait().await.unwrap(), json!(null));
    }

    #[tokio::test]
    async fn error_response_rebuilds_remote_error() {
        let correlator = Correlator::new();
        let token = CorrelationToken::new();

        let pending = correlator.issue(token.clone(), None).unwrap();
        let payload = ErrorPayload::new("RangeError", "shard 9 out of range")
            .with_stack("RangeError: shard 9 out of range\n    at eval");
        correlator.resolve(TaggedMessage::error_response(
            MessageTag::ClusterEvalResponseError,
            payload,
            token,
        ));

        match pending.wait().await.unwrap_err() {
            CorrelationError::Remote {
                name,
                message,
                stack,
            } => {
                assert_eq!(name, "RangeError");
                assert_eq!(message, "shard 9 out of range");
                assert!(stack.unwrap().contains("at eval"));
            }
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_error_payload_falls_back_to_generic_remote() {
        let correlator = Correlator::new();
        let token = CorrelationToken::new();

        let pending = correlator.issue(token.clone(), None).unwrap();
        // Error tag but the data is not an ErrorPayload shape.
        correlator.resolve(TaggedMessage::request(
            MessageTag::BroadcastResponseError,
            json!("worker exploded"),
            token,
        ));

        match pending.wait().await.unwrap_err() {
            CorrelationError::Remote { name, message, .. } => {
                assert_eq!(name, "RemoteError");
                assert!(message.contains("worker exploded"));
            }
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn resolve_without_token_or_for_unknown_token_is_harmless() {
        let correlator = Correlator::new();

        correlator.resolve(TaggedMessage::new(MessageTag::BroadcastResponse, json!(1)));
        correlator.resolve(TaggedMessage::response(
            MessageTag::BroadcastResponse,
            json!(2),
            CorrelationToken::from_string("never-issued"),
        ));
        assert_eq!(correlator.outstanding(), 0);
    }

    #[tokio::test]
    async fn dropped_correlator_fails_waiters() {
        let correlator = Correlator::new();
        let token = CorrelationToken::new();

        let pending = correlator.issue(token, None).unwrap();
        drop(correlator);

        let err = pending.wait().await.unwrap_err();
        assert!(matches!(err, CorrelationError::Dropped));
    }
}
