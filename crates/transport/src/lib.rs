//! Transport core of a DNS stub resolver.
//!
//! Two independent pieces compose this crate. [`ConnectionPool`] owns a
//! set of UDP sockets, round-robins outbound writes across them, runs
//! one read loop per socket, and periodically rotates the whole socket
//! set to refresh source ports. [`ExchangeTable`] correlates outstanding
//! queries with their eventual answers, or detects that no answer ever
//! arrived. The two never reference each other; a higher-level
//! dispatcher drives both.

pub mod exchange;
pub mod pool;

pub use exchange::{ExchangeTable, PendingRequest, DEFAULT_QUERY_TIMEOUT, NO_RESPONSE_RCODE};
pub use pool::{ConnectionPool, ResponseEnvelope};
