//! In-flight query tracking.
//!
//! Every outstanding query is registered under a correlation key of
//! transaction ID plus normalized name. A response is matched by
//! removing that key; a query that never gets a response is eventually
//! swept out by [`ExchangeTable::remove_expired`] and resolved with the
//! sentinel response code instead of a real answer.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::RecordType;
use std::time::{Duration, Instant};
use stub_resolve_domain::{trim_trailing_dot, ResolveError};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Response code delivered to a caller whose query never got an answer.
/// Never produced by a real DNS server. Kept as the full 16-bit value
/// (`ResponseCode::Unknown(50)`) so it cannot collapse into a 4-bit
/// standard code like ServFail.
pub const NO_RESPONSE_RCODE: u16 = 50;

/// Default duration waited until a query expires.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(1);

/// One outstanding query.
///
/// The delivery slot is a oneshot sender consumed on send, so a record
/// resolves exactly once: by a correlated response, by the expiry
/// sweep, or by the shutdown drain.
pub struct PendingRequest {
    pub cancel: CancellationToken,
    pub id: u16,
    /// `None` means the query is not yet eligible for timeout tracking.
    pub timestamp: Option<Instant>,
    pub name: String,
    pub qtype: RecordType,
    pub message: Message,
    result: oneshot::Sender<Message>,
}

impl PendingRequest {
    /// Creates the record and the receiver the caller waits on. The
    /// timestamp starts at "now"; retries refresh it through
    /// [`ExchangeTable::update_timestamp`].
    pub fn new(
        id: u16,
        name: impl Into<String>,
        qtype: RecordType,
        message: Message,
    ) -> (Self, oneshot::Receiver<Message>) {
        let (result, rx) = oneshot::channel();
        (
            Self {
                cancel: CancellationToken::new(),
                id,
                timestamp: Some(Instant::now()),
                name: name.into(),
                qtype,
                message,
                result,
            },
            rx,
        )
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Delivers a real answer to the waiting caller.
    pub fn deliver(self, message: Message) {
        let _ = self.result.send(message);
    }

    /// Resolves the record without a real answer: the stored message is
    /// marked with [`NO_RESPONSE_RCODE`] and delivered as the terminal
    /// outcome.
    pub fn fail_no_response(mut self) {
        self.message
            .set_response_code(<ResponseCode as From<u16>>::from(NO_RESPONSE_RCODE));
        let _ = self.result.send(self.message);
    }
}

fn exchange_key(id: u16, name: &str) -> String {
    format!("{}:{}", id, trim_trailing_dot(name).to_lowercase())
}

/// Concurrency-safe map of in-flight queries by correlation key.
pub struct ExchangeTable {
    pending: DashMap<String, PendingRequest>,
    query_timeout: Duration,
}

impl ExchangeTable {
    pub fn new(query_timeout: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            query_timeout,
        }
    }

    /// Registers a record. A key already in flight is rejected, never
    /// silently overwritten; the caller must pick a fresh transaction
    /// ID or wait.
    pub fn add(&self, request: PendingRequest) -> Result<(), ResolveError> {
        let key = exchange_key(request.id, &request.name);
        match self.pending.entry(key) {
            Entry::Occupied(entry) => Err(ResolveError::DuplicateExchange(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(request);
                Ok(())
            }
        }
    }

    /// Refreshes the record's timestamp to "now". Silent no-op when the
    /// key is absent, so a retried query can be resent under the same
    /// key without re-registering.
    pub fn update_timestamp(&self, id: u16, name: &str) {
        if let Some(mut entry) = self.pending.get_mut(&exchange_key(id, name)) {
            entry.timestamp = Some(Instant::now());
        }
    }

    /// Removes and returns the record for (id, name), or `None`.
    pub fn remove(&self, id: u16, name: &str) -> Option<PendingRequest> {
        self.pending
            .remove(&exchange_key(id, name))
            .map(|(_, request)| request)
    }

    /// Removes and returns every record whose timestamp lies further in
    /// the past than the query timeout. Records with an unset timestamp
    /// are never swept. The caller resolves each as no-response.
    pub fn remove_expired(&self) -> Vec<PendingRequest> {
        let now = Instant::now();
        let timeout = self.query_timeout;
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| entry.timestamp.is_some_and(|ts| now > ts + timeout))
            .map(|entry| entry.key().clone())
            .collect();

        // Re-check expiry under the shard lock: a record refreshed by
        // update_timestamp between the scan and the removal must not be
        // swept.
        expired
            .iter()
            .filter_map(|key| {
                self.pending.remove_if(key, |_, request| {
                    request.timestamp.is_some_and(|ts| now > ts + timeout)
                })
            })
            .map(|(_, request)| request)
            .collect()
    }

    /// Removes and returns everything, regardless of timestamp state.
    /// Used on shutdown so no caller blocks forever.
    pub fn remove_all(&self) -> Vec<PendingRequest> {
        let keys: Vec<String> = self.pending.iter().map(|entry| entry.key().clone()).collect();
        keys.iter()
            .filter_map(|key| self.pending.remove(key))
            .map(|(_, request)| request)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Default for ExchangeTable {
    fn default() -> Self {
        Self::new(DEFAULT_QUERY_TIMEOUT)
    }
}
