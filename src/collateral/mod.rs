//! Collateral custody.
//!
//! Deposits are moved by replaying the ledger events in order: the
//! [`CollateralManager`] keeps a checkpoint of the last applied sequence
//! number, and of the rail operations already done within the next event,
//! so that replaying the same events twice never moves funds twice.

use std::{
    collections::HashMap,
    fmt::{self, Display},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    lifecycle::{Address, Amount, EventKind, Ledger, LedgerEvent, RequestId},
    Error,
};

/// Why a deposit was forfeited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlashReason {
    /// The arbiter held the party at fault in a dispute.
    DisputeLost,
}

impl Display for SlashReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DisputeLost => f.write_str("dispute lost"),
        }
    }
}

/// Payment rail holding the deposits.
pub trait CollateralRail: Send {
    fn lock(&mut self, request: RequestId, party: &Address, amount: Amount) -> Result<(), Error>;

    /// Returns the deposit of `party` to it, returning the refunded amount.
    fn refund(&mut self, request: RequestId, party: &Address) -> Result<Amount, Error>;

    /// Forfeits the deposit of `party`, returning the slashed amount.
    fn slash(
        &mut self,
        request: RequestId,
        party: &Address,
        reason: SlashReason,
    ) -> Result<Amount, Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepositState {
    Locked,
    Refunded,
    Slashed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deposit {
    pub amount: Amount,
    pub state: DepositState,
}

/// In-memory escrow.
///
/// Refunds are credited to a withdrawable balance; slashed deposits go to
/// the forfeit pool.
#[derive(Debug, Default)]
pub struct Escrow {
    deposits: HashMap<(RequestId, Address), Deposit>,
    balances: HashMap<Address, Amount>,
    forfeited: Amount,
}

impl Escrow {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn deposit(&self, request: RequestId, party: &Address) -> Option<Deposit> {
        self.deposits.get(&(request, party.clone())).copied()
    }

    /// Sum of the deposits of `party` still locked.
    #[must_use]
    pub fn locked(&self, party: &Address) -> Amount {
        self.deposits
            .iter()
            .filter(|((_, p), d)| p == party && d.state == DepositState::Locked)
            .map(|(_, d)| d.amount)
            .sum()
    }

    #[must_use]
    pub fn withdrawable(&self, party: &Address) -> Amount {
        self.balances.get(party).copied().unwrap_or_default()
    }

    #[must_use]
    pub const fn forfeited(&self) -> Amount {
        self.forfeited
    }

    /// Pays out the whole balance of `party`.
    pub fn withdraw(&mut self, party: &Address) -> Amount {
        let amount = self.balances.remove(party).unwrap_or_default();
        if amount > 0 {
            info!(party = %party, amount, "withdrawal");
        }
        amount
    }

    fn release(
        &mut self,
        request: RequestId,
        party: &Address,
        state: DepositState,
    ) -> Result<Amount, Error> {
        let deposit = self
            .deposits
            .get_mut(&(request, party.clone()))
            .ok_or_else(|| {
                Error::Reverted(format!("{party} has no deposit on request {request}"))
            })?;
        if deposit.state != DepositState::Locked {
            return Err(Error::Reverted(format!(
                "deposit of {party} on request {request} is already {:?}",
                deposit.state
            )));
        }
        deposit.state = state;
        Ok(deposit.amount)
    }
}

impl CollateralRail for Escrow {
    fn lock(&mut self, request: RequestId, party: &Address, amount: Amount) -> Result<(), Error> {
        let key = (request, party.clone());
        if self.deposits.contains_key(&key) {
            return Err(Error::Reverted(format!(
                "{party} already has a deposit on request {request}"
            )));
        }
        self.deposits.insert(
            key,
            Deposit {
                amount,
                state: DepositState::Locked,
            },
        );
        debug!(request = %request, party = %party, amount, "locked");
        Ok(())
    }

    fn refund(&mut self, request: RequestId, party: &Address) -> Result<Amount, Error> {
        let amount = self.release(request, party, DepositState::Refunded)?;
        let balance = self.balances.entry(party.clone()).or_default();
        *balance = balance
            .checked_add(amount)
            .ok_or_else(|| Error::Other(format!("balance overflow for {party}")))?;
        debug!(request = %request, party = %party, amount, "refunded");
        Ok(amount)
    }

    fn slash(
        &mut self,
        request: RequestId,
        party: &Address,
        reason: SlashReason,
    ) -> Result<Amount, Error> {
        let amount = self.release(request, party, DepositState::Slashed)?;
        self.forfeited = self
            .forfeited
            .checked_add(amount)
            .ok_or_else(|| Error::Other("forfeit pool overflow".to_string()))?;
        warn!(request = %request, party = %party, amount, %reason, "slashed");
        Ok(amount)
    }
}

/// One rail call caused by a ledger event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RailOp<'a> {
    Lock(&'a Address, Amount),
    Refund(&'a Address),
    Slash(&'a Address),
}

/// Rail calls of an event, in the order they are applied.
fn rail_ops(kind: &EventKind) -> Vec<RailOp<'_>> {
    match kind {
        EventKind::Created {
            requester: party,
            collateral,
        }
        | EventKind::Proposed {
            provider: party,
            collateral,
            ..
        } => vec![RailOp::Lock(party, *collateral)],
        EventKind::Matched { refunded, .. }
        | EventKind::Cancelled { refunded }
        | EventKind::Completed {
            released: refunded,
        } => refunded.iter().map(RailOp::Refund).collect(),
        EventKind::Resolved { slashed, refunded } => slashed
            .iter()
            .map(RailOp::Slash)
            .chain(refunded.iter().map(RailOp::Refund))
            .collect(),
        EventKind::ReencryptionSubmitted { .. }
        | EventKind::Started
        | EventKind::Disputed { .. }
        | EventKind::Rated { .. } => Vec::new(),
    }
}

/// Applies the collateral effects of ledger events to a rail.
#[derive(Debug)]
pub struct CollateralManager<R> {
    rail: R,
    next_seq: u64,
    /// Rail calls of event `next_seq` already done.
    done_ops: usize,
}

impl<R: CollateralRail> CollateralManager<R> {
    pub const fn new(rail: R) -> Self {
        Self {
            rail,
            next_seq: 0,
            done_ops: 0,
        }
    }

    pub const fn rail(&self) -> &R {
        &self.rail
    }

    pub fn rail_mut(&mut self) -> &mut R {
        &mut self.rail
    }

    /// Sequence number of the next event to apply.
    pub const fn checkpoint(&self) -> u64 {
        self.next_seq
    }

    /// Applies an event, returning `false` if it was already applied.
    ///
    /// Events must be applied in ledger order. When a rail call fails, the
    /// calls already done for the event are remembered and applying the same
    /// event again resumes with the failed one.
    pub fn apply(&mut self, event: &LedgerEvent) -> Result<bool, Error> {
        if event.seq < self.next_seq {
            return Ok(false);
        }
        if event.seq > self.next_seq {
            return Err(Error::Other(format!(
                "missing ledger events {} to {}",
                self.next_seq,
                event.seq - 1
            )));
        }

        let request = event.request;
        for op in rail_ops(&event.kind).into_iter().skip(self.done_ops) {
            match op {
                RailOp::Lock(party, amount) => self.rail.lock(request, party, amount)?,
                RailOp::Refund(party) => {
                    self.rail.refund(request, party)?;
                }
                RailOp::Slash(party) => {
                    self.rail.slash(request, party, SlashReason::DisputeLost)?;
                }
            }
            self.done_ops += 1;
        }
        self.next_seq += 1;
        self.done_ops = 0;
        Ok(true)
    }

    /// Applies every ledger event past the checkpoint, returning how many
    /// were applied.
    pub fn sync<L: Ledger + ?Sized>(&mut self, ledger: &L) -> Result<usize, Error> {
        let mut applied = 0;
        for event in ledger.events_since(self.next_seq)? {
            if self.apply(&event)? {
                applied += 1;
            }
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        abe_policy::{gen_policy, premium_driver},
        config::Config,
        core::{Digest, PartyHandle},
        lifecycle::{MemoryLedger, Party, Transaction, Transition, TripTerms},
    };

    fn ledger() -> MemoryLedger {
        let mut config = Config::default()
            .with_matcher("0xmatcher")
            .with_arbiter("0xarbiter");
        config.min_requester_collateral = 10;
        config.min_provider_collateral = 5;
        MemoryLedger::new(config)
    }

    fn create(ledger: &MemoryLedger, requester: &Address) -> RequestId {
        let ct_hash = Digest::of(b"ct");
        let id = RequestId::derive(requester, &ct_hash);
        ledger
            .submit(Transaction::new(
                id,
                requester,
                Transition::Create {
                    requester_handle: PartyHandle::from_bytes([1; 32]),
                    ct_hash,
                    policy: gen_policy().unwrap(),
                    collateral: 10,
                },
            ))
            .unwrap();
        id
    }

    fn propose(ledger: &MemoryLedger, id: RequestId, provider: &Address) {
        ledger
            .submit(Transaction::new(
                id,
                provider,
                Transition::Propose {
                    provider_handle: PartyHandle::from_bytes([2; 32]),
                    terms: TripTerms {
                        fare: 20,
                        pickup_eta_secs: 300,
                    },
                    attributes: premium_driver().unwrap(),
                    collateral: 5,
                },
            ))
            .unwrap();
    }

    #[test]
    fn test_escrow() {
        let mut escrow = Escrow::new();
        let alice = Address::from("0xalice");
        let id = RequestId::from(1);
        escrow.lock(id, &alice, 10).unwrap();
        assert!(escrow.lock(id, &alice, 10).is_err());
        assert_eq!(escrow.locked(&alice), 10);
        assert_eq!(escrow.refund(id, &alice).unwrap(), 10);
        assert!(escrow.refund(id, &alice).is_err());
        assert!(escrow.slash(id, &alice, SlashReason::DisputeLost).is_err());
        assert_eq!(escrow.locked(&alice), 0);
        assert_eq!(escrow.withdraw(&alice), 10);
        assert_eq!(escrow.withdraw(&alice), 0);
        assert!(escrow.refund(RequestId::from(2), &alice).is_err());
    }

    #[test]
    fn test_match_then_complete() {
        let ledger = ledger();
        let requester = Address::from("0xrequester");
        let (p1, p2) = (Address::from("0xp1"), Address::from("0xp2"));
        let id = create(&ledger, &requester);
        propose(&ledger, id, &p1);
        propose(&ledger, id, &p2);

        let mut manager = CollateralManager::new(Escrow::new());
        assert_eq!(manager.sync(&ledger).unwrap(), 3);
        assert_eq!(manager.rail().locked(&requester), 10);
        assert_eq!(manager.rail().locked(&p1), 5);
        assert_eq!(manager.rail().locked(&p2), 5);

        let matcher = Address::from("0xmatcher");
        ledger
            .submit(Transaction::new(id, &matcher, Transition::Match { proposal: 0 }))
            .unwrap();
        assert_eq!(manager.sync(&ledger).unwrap(), 1);
        // replaying is a no-op
        assert_eq!(manager.sync(&ledger).unwrap(), 0);
        for event in ledger.events_since(0).unwrap() {
            assert!(!manager.apply(&event).unwrap());
        }
        assert_eq!(manager.rail().locked(&p1), 5);
        assert_eq!(manager.rail().locked(&p2), 0);
        assert_eq!(manager.rail().withdrawable(&p2), 5);

        ledger
            .submit(Transaction::new(
                id,
                &matcher,
                Transition::SubmitReencryption {
                    ct_prime_hash: Digest::of(b"ctprime"),
                },
            ))
            .unwrap();
        ledger
            .submit(Transaction::new(id, &p1, Transition::Start))
            .unwrap();
        ledger
            .submit(Transaction::new(id, &requester, Transition::Complete))
            .unwrap();
        manager.sync(&ledger).unwrap();
        assert_eq!(manager.rail().locked(&requester), 0);
        assert_eq!(manager.rail().withdrawable(&requester), 10);
        assert_eq!(manager.rail().withdrawable(&p1), 5);
        assert_eq!(manager.rail().forfeited(), 0);
    }

    #[test]
    fn test_dispute_slashes() {
        let ledger = ledger();
        let requester = Address::from("0xrequester");
        let provider = Address::from("0xp1");
        let id = create(&ledger, &requester);
        propose(&ledger, id, &provider);
        ledger
            .submit(Transaction::new(
                id,
                &Address::from("0xmatcher"),
                Transition::Match { proposal: 0 },
            ))
            .unwrap();
        ledger
            .submit(Transaction::new(id, &requester, Transition::Dispute))
            .unwrap();
        ledger
            .submit(Transaction::new(
                id,
                &Address::from("0xarbiter"),
                Transition::Resolve {
                    at_fault: Some(Party::Provider),
                },
            ))
            .unwrap();

        let mut manager = CollateralManager::new(Escrow::new());
        manager.sync(&ledger).unwrap();
        assert_eq!(manager.rail().forfeited(), 5);
        assert_eq!(manager.rail().withdrawable(&provider), 0);
        assert_eq!(manager.rail().withdrawable(&requester), 10);
        assert_eq!(
            manager.rail().deposit(id, &provider).map(|d| d.state),
            Some(DepositState::Slashed)
        );
    }

    /// Escrow whose next refund of `party` fails as unavailable.
    struct FlakyRail {
        escrow: Escrow,
        failing: Option<Address>,
    }

    impl CollateralRail for FlakyRail {
        fn lock(
            &mut self,
            request: RequestId,
            party: &Address,
            amount: Amount,
        ) -> Result<(), Error> {
            self.escrow.lock(request, party, amount)
        }

        fn refund(&mut self, request: RequestId, party: &Address) -> Result<Amount, Error> {
            if self.failing.as_ref() == Some(party) {
                self.failing = None;
                return Err(Error::Unavailable("rail".to_string()));
            }
            self.escrow.refund(request, party)
        }

        fn slash(
            &mut self,
            request: RequestId,
            party: &Address,
            reason: SlashReason,
        ) -> Result<Amount, Error> {
            self.escrow.slash(request, party, reason)
        }
    }

    #[test]
    fn test_resume_after_rail_failure() {
        let ledger = ledger();
        let requester = Address::from("0xrequester");
        let (p1, p2, p3) = (
            Address::from("0xp1"),
            Address::from("0xp2"),
            Address::from("0xp3"),
        );
        let id = create(&ledger, &requester);
        for provider in [&p1, &p2, &p3] {
            propose(&ledger, id, provider);
        }
        // refunds p2 then p3
        ledger
            .submit(Transaction::new(
                id,
                &Address::from("0xmatcher"),
                Transition::Match { proposal: 0 },
            ))
            .unwrap();

        let mut manager = CollateralManager::new(FlakyRail {
            escrow: Escrow::new(),
            failing: Some(p3.clone()),
        });
        assert!(matches!(
            manager.sync(&ledger),
            Err(Error::Unavailable(_))
        ));
        assert_eq!(manager.checkpoint(), 4);
        assert_eq!(manager.rail().escrow.withdrawable(&p2), 5);
        assert_eq!(manager.rail().escrow.locked(&p3), 5);

        assert_eq!(manager.sync(&ledger).unwrap(), 1);
        assert_eq!(manager.checkpoint(), 5);
        assert_eq!(manager.rail().escrow.withdrawable(&p2), 5);
        assert_eq!(manager.rail().escrow.withdrawable(&p3), 5);
        assert_eq!(manager.rail().escrow.locked(&p1), 5);
        assert_eq!(manager.sync(&ledger).unwrap(), 0);
    }

    #[test]
    fn test_gap_is_rejected() {
        let ledger = ledger();
        let requester = Address::from("0xrequester");
        let id = create(&ledger, &requester);
        propose(&ledger, id, &Address::from("0xp1"));

        let mut manager = CollateralManager::new(Escrow::new());
        let events = ledger.events_since(0).unwrap();
        assert!(manager.apply(&events[1]).is_err());
        assert!(manager.apply(&events[0]).unwrap());
        assert!(manager.apply(&events[1]).unwrap());
        assert_eq!(manager.checkpoint(), 2);
    }
}
