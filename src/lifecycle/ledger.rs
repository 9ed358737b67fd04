use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::{SystemTime, UNIX_EPOCH},
};

use tracing::{debug, info};

use crate::{
    config::Config,
    lifecycle::{Address, EventKind, Request, RequestId, Status, Timestamp, Transition},
    Error,
};

/// Transition submitted to the ledger on behalf of `sender`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub request: RequestId,
    pub sender: Address,
    pub transition: Transition,
}

impl Transaction {
    pub fn new(request: RequestId, sender: &Address, transition: Transition) -> Self {
        Self {
            request,
            sender: sender.clone(),
            transition,
        }
    }
}

/// Proof of inclusion of a committed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxReceipt {
    /// Sequence number of the event emitted by the transaction.
    pub seq: u64,
    pub request: RequestId,
    pub status: Status,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEvent {
    pub seq: u64,
    pub request: RequestId,
    pub at: Timestamp,
    pub kind: EventKind,
}

/// Shared, strongly ordered record of the ride requests.
///
/// A transaction either commits entirely, emitting exactly one event, or
/// leaves the ledger untouched. Failures to reach the ledger are reported as
/// [`Error::Unavailable`] or [`Error::Timeout`], in which case the caller
/// cannot tell whether the transaction was committed.
pub trait Ledger: Send + Sync {
    fn submit(&self, tx: Transaction) -> Result<TxReceipt, Error>;

    fn read(&self, id: RequestId) -> Result<Request, Error>;

    /// Events with a sequence number greater or equal to `seq`, in order.
    fn events_since(&self, seq: u64) -> Result<Vec<LedgerEvent>, Error>;
}

impl<T: Ledger + ?Sized> Ledger for Arc<T> {
    fn submit(&self, tx: Transaction) -> Result<TxReceipt, Error> {
        (**self).submit(tx)
    }

    fn read(&self, id: RequestId) -> Result<Request, Error> {
        (**self).read(id)
    }

    fn events_since(&self, seq: u64) -> Result<Vec<LedgerEvent>, Error> {
        (**self).events_since(seq)
    }
}

/// Source of ledger time.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs())
    }
}

/// Clock only moving when told to.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    #[must_use]
    pub fn new(now: Timestamp) -> Self {
        Self(AtomicU64::new(now))
    }

    pub fn set(&self, now: Timestamp) {
        self.0.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: u64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    requests: HashMap<RequestId, Request>,
    events: Vec<LedgerEvent>,
}

/// In-memory ledger, serializing transactions behind a single lock.
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
    config: Config,
    clock: Arc<dyn Clock>,
}

impl MemoryLedger {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(config: Config, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            config,
            clock,
        }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn state(&self) -> Result<MutexGuard<'_, LedgerState>, Error> {
        self.state
            .lock()
            .map_err(|e| Error::Other(format!("poisoned ledger: {e}")))
    }
}

impl Ledger for MemoryLedger {
    fn submit(&self, tx: Transaction) -> Result<TxReceipt, Error> {
        let now = self.clock.now();
        let mut state = self.state()?;

        let (request, kind) = match state.requests.get(&tx.request) {
            Some(current) => {
                let mut next = current.clone();
                let kind = next.apply(&tx.sender, &tx.transition, &self.config, now)?;
                (next, kind)
            }
            None if matches!(tx.transition, Transition::Create { .. }) => {
                Request::create(tx.request, &tx.sender, &tx.transition, &self.config, now)?
            }
            None => return Err(Error::UnknownRequest(tx.request)),
        };

        let seq = state.events.len() as u64;
        let receipt = TxReceipt {
            seq,
            request: tx.request,
            status: request.status,
        };
        info!(
            seq,
            request = %tx.request,
            sender = %tx.sender,
            transition = tx.transition.name(),
            status = %request.status,
            "committed"
        );
        debug!(event = ?kind, "ledger event");
        state.requests.insert(tx.request, request);
        state.events.push(LedgerEvent {
            seq,
            request: tx.request,
            at: now,
            kind,
        });
        Ok(receipt)
    }

    fn read(&self, id: RequestId) -> Result<Request, Error> {
        self.state()?
            .requests
            .get(&id)
            .cloned()
            .ok_or(Error::UnknownRequest(id))
    }

    fn events_since(&self, seq: u64) -> Result<Vec<LedgerEvent>, Error> {
        let state = self.state()?;
        let start = usize::try_from(seq)?.min(state.events.len());
        Ok(state.events[start..].to_vec())
    }
}
