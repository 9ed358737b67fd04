use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use cosmian_crypto_core::bytes_ser_de::Serializable;
use tracing::{debug, info, warn};

use crate::{
    abe_policy::AttributeSet,
    collateral::{CollateralManager, CollateralRail, Escrow},
    config::Config,
    core::{
        service::{CryptoBoundary, CryptoRequest, CryptoResponse},
        Ciphertext, Digest, PartyHandle, ReKey, ReencryptedCiphertext,
    },
    lifecycle::{
        Address, Amount, Ledger, Party, Request, RequestId, Status, Transaction, Transition,
        TripTerms,
    },
    store::{OpaqueStore, StoreKey},
    Error,
};

/// Result of a successful match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchOutcome {
    /// Hash of the stored re-encrypted ciphertext.
    pub ct_prime_hash: Digest,
    pub provider: Address,
    pub provider_handle: PartyHandle,
}

/// Calls `f` until it succeeds, fails with a non-transient error or runs out
/// of attempts.
fn with_retries<T>(
    attempts: u32,
    what: &str,
    mut f: impl FnMut() -> Result<T, Error>,
) -> Result<T, Error> {
    let mut attempt = 1;
    loop {
        match f() {
            Err(e) if e.is_retryable() && attempt < attempts => {
                warn!(what, attempt, error = %e, "transient failure, retrying");
                attempt += 1;
            }
            res => return res,
        }
    }
}

/// Orchestrates the ledger, the opaque store, the crypto engine and the
/// collateral manager.
///
/// Transitions touching the crypto engine are serialized per request; every
/// other transition only relies on the ledger preconditions.
pub struct Lifecycle<L, S, B, R> {
    config: Config,
    ledger: L,
    store: S,
    crypto: B,
    collateral: Mutex<CollateralManager<R>>,
    guards: Mutex<HashMap<RequestId, Arc<Mutex<()>>>>,
}

impl<L, S, B, R> Lifecycle<L, S, B, R>
where
    L: Ledger,
    S: OpaqueStore,
    B: CryptoBoundary,
    R: CollateralRail,
{
    pub fn new(config: Config, ledger: L, store: S, crypto: B, rail: R) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            config,
            ledger,
            store,
            crypto,
            collateral: Mutex::new(CollateralManager::new(rail)),
            guards: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Reads the ledger record of a request.
    pub fn request(&self, id: RequestId) -> Result<Request, Error> {
        with_retries(self.config.max_commit_attempts, "ledger read", || {
            self.ledger.read(id)
        })
    }

    /// Stores the ciphertext and its policy, then commits the request.
    ///
    /// The request id is derived from the requester and the ciphertext hash,
    /// so creating the same request twice is harmless.
    pub fn create(
        &self,
        requester: &Address,
        requester_handle: PartyHandle,
        ct: &Ciphertext,
        collateral: Amount,
    ) -> Result<RequestId, Error> {
        let blob = ct.serialize()?;
        let ct_hash = Digest::of(&blob);
        let id = RequestId::derive(requester, &ct_hash);
        if collateral < self.config.min_requester_collateral {
            return Err(Error::InsufficientCollateral {
                given: collateral,
                required: self.config.min_requester_collateral,
            });
        }

        self.put_once(StoreKey::ciphertext(id), &blob)?;
        self.put_once(StoreKey::policy(id), &ct.policy().serialize()?)?;

        let transition = Transition::Create {
            requester_handle,
            ct_hash,
            policy: ct.policy().clone(),
            collateral,
        };
        self.commit(Transaction::new(id, requester, transition), |r| {
            r.requester == *requester && r.ct_hash == ct_hash
        })?;
        info!(request = %id, ct_hash = %ct_hash, "request created");
        Ok(id)
    }

    /// Appends a proposal, returning its index.
    pub fn propose(
        &self,
        provider: &Address,
        id: RequestId,
        provider_handle: PartyHandle,
        terms: TripTerms,
        attributes: AttributeSet,
        collateral: Amount,
    ) -> Result<usize, Error> {
        let transition = Transition::Propose {
            provider_handle,
            terms,
            attributes,
            collateral,
        };
        self.commit(Transaction::new(id, provider, transition), |r| {
            r.proposals
                .iter()
                .any(|p| p.active && p.provider == *provider)
        })?;
        self.request(id)?
            .proposals
            .iter()
            .rposition(|p| p.active && p.provider == *provider)
            .ok_or_else(|| Error::Other(format!("committed proposal of {provider} is missing")))
    }

    /// Matches the request with one of its proposals.
    ///
    /// The re-encrypted ciphertext is computed before the ledger commit, so a
    /// crypto failure leaves no trace, and stored once the match is
    /// committed. A failed commit leaves nothing behind: the matcher may
    /// retry with the same proposal or choose another one.
    pub fn match_request(
        &self,
        matcher: &Address,
        id: RequestId,
        proposal: usize,
    ) -> Result<MatchOutcome, Error> {
        if !self.config.is_matcher(matcher) {
            return Err(Error::NotAuthorizedMatcher(matcher.to_string()));
        }
        self.serialized(id, || {
            let request = self.request(id)?;
            if request.status != Status::Proposed {
                return Err(Error::InvalidTransition {
                    from: request.status,
                    transition: "match",
                });
            }
            let chosen = request
                .proposals
                .get(proposal)
                .filter(|p| p.active)
                .ok_or(Error::InvalidProposal {
                    request: id,
                    index: proposal,
                })?;
            let ct = self.load_ciphertext(&request)?;

            let ctp =
                self.reencrypt_for(&request, ct, &chosen.attributes, chosen.provider_handle)?;
            let blob = ctp.serialize()?;
            let ct_prime_hash = Digest::of(&blob);
            // nothing may sit under the key of an unmatched request
            let key = StoreKey::reencrypted(id);
            match self.get(key) {
                Ok(stored) if stored != *blob => return Err(Error::StoreConflict(key.to_string())),
                Ok(_) | Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }

            self.commit(
                Transaction::new(id, matcher, Transition::Match { proposal }),
                |r| r.status != Status::Proposed && r.chosen == Some(proposal),
            )?;
            match self.put_once(key, &blob) {
                Ok(()) => {}
                Err(e) if e.is_retryable() => {
                    warn!(request = %id, error = %e, "re-encrypted ciphertext not stored yet");
                }
                Err(e) => return Err(e),
            }
            info!(
                request = %id,
                proposal,
                provider = %chosen.provider,
                ct_prime_hash = %ct_prime_hash,
                "matched"
            );
            Ok(MatchOutcome {
                ct_prime_hash,
                provider: chosen.provider.clone(),
                provider_handle: chosen.provider_handle,
            })
        })
    }

    /// Records the hash of the stored re-encrypted ciphertext on the ledger.
    ///
    /// If the match committed without storing its re-encrypted ciphertext,
    /// the ciphertext is re-encrypted again for the chosen proposal, which
    /// yields the same bytes.
    pub fn submit_reencryption(&self, matcher: &Address, id: RequestId) -> Result<Digest, Error> {
        if !self.config.is_matcher(matcher) {
            return Err(Error::NotAuthorizedMatcher(matcher.to_string()));
        }
        self.serialized(id, || {
            let request = self.request(id)?;
            if request.status != Status::Matched {
                return Err(Error::InvalidTransition {
                    from: request.status,
                    transition: "submit_reencryption",
                });
            }
            let recipient = request.provider_handle.ok_or_else(|| {
                Error::Other(format!("matched request {id} has no provider handle"))
            })?;
            let blob = match self.get(StoreKey::reencrypted(id)) {
                Ok(blob) => blob,
                Err(Error::NotFound(_)) => self.restore_reencrypted(&request, recipient)?,
                Err(e) => return Err(e),
            };
            let ctp = ReencryptedCiphertext::deserialize(&blob)?;
            if !self.verify(&ctp, request.ct_hash, recipient)? {
                return Err(Error::VerificationFailed(format!(
                    "stored re-encrypted ciphertext of request {id}"
                )));
            }

            let ct_prime_hash = Digest::of(&blob);
            self.commit(
                Transaction::new(id, matcher, Transition::SubmitReencryption { ct_prime_hash }),
                |r| r.ct_prime_hash == Some(ct_prime_hash),
            )?;
            info!(request = %id, ct_prime_hash = %ct_prime_hash, "re-encryption submitted");
            Ok(ct_prime_hash)
        })
    }

    pub fn start(&self, provider: &Address, id: RequestId) -> Result<Status, Error> {
        self.transition(provider, id, Transition::Start, |r| {
            r.status == Status::InProgress
        })
    }

    pub fn complete(&self, party: &Address, id: RequestId) -> Result<Status, Error> {
        self.transition(party, id, Transition::Complete, |r| {
            r.completed_at.is_some()
        })
    }

    pub fn dispute(&self, party: &Address, id: RequestId) -> Result<Status, Error> {
        self.transition(party, id, Transition::Dispute, |r| {
            matches!(r.status, Status::Disputed | Status::Resolved)
        })
    }

    pub fn cancel(&self, requester: &Address, id: RequestId) -> Result<Status, Error> {
        self.transition(requester, id, Transition::Cancel, |r| {
            r.status == Status::Cancelled
        })
    }

    pub fn resolve(
        &self,
        arbiter: &Address,
        id: RequestId,
        at_fault: Option<Party>,
    ) -> Result<Status, Error> {
        self.transition(arbiter, id, Transition::Resolve { at_fault }, |r| {
            r.status == Status::Resolved
        })
    }

    pub fn rate(&self, party: &Address, id: RequestId, score: u8) -> Result<Status, Error> {
        self.transition(party, id, Transition::Rate { score }, |r| {
            r.ratings
                .iter()
                .any(|rating| Some(rating.by) == r.party_of(party) && rating.score == score)
        })
    }

    /// Returns the re-encrypted ciphertext recorded on the ledger, checking
    /// it against the recorded hashes.
    pub fn fetch_reencrypted(&self, id: RequestId) -> Result<ReencryptedCiphertext, Error> {
        let request = self.request(id)?;
        let ct_prime_hash = request.ct_prime_hash.ok_or_else(|| {
            Error::NotFound(format!("re-encryption of request {id} is not recorded yet"))
        })?;
        let blob = self.get(StoreKey::reencrypted(id))?;
        if Digest::of(&blob) != ct_prime_hash {
            return Err(Error::VerificationFailed(format!(
                "{} does not match the recorded hash",
                StoreKey::reencrypted(id)
            )));
        }
        let ctp = ReencryptedCiphertext::deserialize(&blob)?;
        if *ctp.source() != request.ct_hash {
            return Err(Error::KeyMismatch(format!(
                "re-encrypted ciphertext of request {id} comes from another ciphertext"
            )));
        }
        Ok(ctp)
    }

    /// Applies the pending ledger events to the rail and gives access to it.
    pub fn with_collateral<T>(
        &self,
        f: impl FnOnce(&mut CollateralManager<R>) -> T,
    ) -> Result<T, Error> {
        let mut manager = self.collateral()?;
        manager.sync(&self.ledger)?;
        Ok(f(&mut manager))
    }

    fn collateral(&self) -> Result<MutexGuard<'_, CollateralManager<R>>, Error> {
        self.collateral
            .lock()
            .map_err(|e| Error::Other(format!("poisoned collateral manager: {e}")))
    }

    fn guards(&self) -> Result<MutexGuard<'_, HashMap<RequestId, Arc<Mutex<()>>>>, Error> {
        self.guards
            .lock()
            .map_err(|e| Error::Other(format!("poisoned request guards: {e}")))
    }

    /// Runs `f` while holding the guard of the request, and drops the guard
    /// once no other caller waits on it.
    fn serialized<T>(
        &self,
        id: RequestId,
        f: impl FnOnce() -> Result<T, Error>,
    ) -> Result<T, Error> {
        let guard = self.guards()?.entry(id).or_default().clone();
        let res = match guard.lock() {
            Ok(_lock) => f(),
            Err(e) => Err(Error::Other(format!("poisoned request guard: {e}"))),
        };
        // clones are only taken and dropped under the map lock
        let mut guards = self.guards()?;
        if Arc::strong_count(&guard) == 2 {
            guards.remove(&id);
        }
        drop(guard);
        drop(guards);
        res
    }

    #[cfg(test)]
    pub(crate) fn guard_count(&self) -> usize {
        self.guards().map_or(0, |guards| guards.len())
    }

    fn transition(
        &self,
        sender: &Address,
        id: RequestId,
        transition: Transition,
        confirm: impl Fn(&Request) -> bool,
    ) -> Result<Status, Error> {
        let name = transition.name();
        let status = self.commit(Transaction::new(id, sender, transition), confirm)?;
        info!(request = %id, transition = name, status = %status, "transition");
        Ok(status)
    }

    /// Submits the transaction, retrying transient failures, then brings the
    /// collateral up to date.
    ///
    /// A transient failure does not tell whether the transaction was
    /// committed: if a retry is then rejected, `confirm` decides from the
    /// ledger record whether an earlier attempt went through.
    fn commit(
        &self,
        tx: Transaction,
        confirm: impl Fn(&Request) -> bool,
    ) -> Result<Status, Error> {
        let mut attempt = 1;
        let mut uncertain = false;
        let status = loop {
            match self.ledger.submit(tx.clone()) {
                Ok(receipt) => {
                    debug!(seq = receipt.seq, request = %receipt.request, "receipt");
                    break receipt.status;
                }
                Err(e) if e.is_retryable() && attempt < self.config.max_commit_attempts => {
                    warn!(
                        request = %tx.request,
                        transition = tx.transition.name(),
                        attempt,
                        error = %e,
                        "ledger commit failed, retrying"
                    );
                    uncertain = true;
                    attempt += 1;
                }
                Err(e) if uncertain && !e.is_retryable() => match self.ledger.read(tx.request) {
                    Ok(request) if confirm(&request) => {
                        info!(
                            request = %tx.request,
                            transition = tx.transition.name(),
                            "earlier attempt was committed"
                        );
                        break request.status;
                    }
                    _ => return Err(e),
                },
                Err(e) => return Err(e),
            }
        };
        self.sync_collateral();
        Ok(status)
    }

    /// Failures are only logged: the next sync resumes from the checkpoint.
    fn sync_collateral(&self) {
        let res = self
            .collateral()
            .and_then(|mut manager| manager.sync(&self.ledger));
        match res {
            Ok(applied) => debug!(applied, "collateral synced"),
            Err(e) => warn!(error = %e, "collateral sync deferred"),
        }
    }

    fn get(&self, key: StoreKey) -> Result<Vec<u8>, Error> {
        with_retries(self.config.max_commit_attempts, "store get", || {
            self.store.get(key)
        })
    }

    /// Stores the blob, accepting an identical blob already stored under the
    /// key.
    fn put_once(&self, key: StoreKey, blob: &[u8]) -> Result<(), Error> {
        let res = with_retries(self.config.max_commit_attempts, "store put", || {
            self.store.put(key, blob)
        });
        match res {
            Err(Error::StoreConflict(conflict)) => {
                if self.get(key)? != blob {
                    return Err(Error::StoreConflict(conflict));
                }
                debug!(key = %key, "blob already stored");
                Ok(())
            }
            res => res,
        }
    }

    /// Re-encrypts the ciphertext for the chosen proposal of a matched
    /// request and stores the result.
    fn restore_reencrypted(
        &self,
        request: &Request,
        recipient: PartyHandle,
    ) -> Result<Vec<u8>, Error> {
        let chosen = request
            .chosen
            .and_then(|index| request.proposals.get(index))
            .ok_or_else(|| {
                Error::Other(format!("matched request {} has no proposal", request.id))
            })?;
        let ct = self.load_ciphertext(request)?;
        let blob = self
            .reencrypt_for(request, ct, &chosen.attributes, recipient)?
            .serialize()?
            .to_vec();
        self.put_once(StoreKey::reencrypted(request.id), &blob)?;
        info!(request = %request.id, "re-encrypted ciphertext restored");
        Ok(blob)
    }

    fn load_ciphertext(&self, request: &Request) -> Result<Ciphertext, Error> {
        let blob = self.get(StoreKey::ciphertext(request.id))?;
        if Digest::of(&blob) != request.ct_hash {
            return Err(Error::VerificationFailed(format!(
                "{} does not match the committed hash",
                StoreKey::ciphertext(request.id)
            )));
        }
        Ciphertext::deserialize(&blob)
    }

    fn call(&self, request: impl Fn() -> CryptoRequest) -> Result<CryptoResponse, Error> {
        let name = request().name();
        with_retries(self.config.max_crypto_attempts, name, || {
            self.crypto.call(request())
        })
    }

    fn verify(
        &self,
        ctp: &ReencryptedCiphertext,
        source: Digest,
        recipient: PartyHandle,
    ) -> Result<bool, Error> {
        match self.call(|| CryptoRequest::Verify {
            ctp: Box::new(ctp.clone()),
            expected: Some((source, recipient)),
        })? {
            CryptoResponse::Verified(verified) => Ok(verified),
            other => Err(other.unexpected("verify")),
        }
    }

    /// Match, ReKey, ReEncrypt and Verify through the crypto boundary.
    fn reencrypt_for(
        &self,
        request: &Request,
        ct: Ciphertext,
        attributes: &AttributeSet,
        recipient: PartyHandle,
    ) -> Result<ReencryptedCiphertext, Error> {
        match self.call(|| CryptoRequest::Match {
            attributes: attributes.clone(),
            policy: request.policy.clone(),
        })? {
            CryptoResponse::Matched(true) => {}
            CryptoResponse::Matched(false) => return Err(Error::PolicyNotSatisfied),
            other => return Err(other.unexpected("match")),
        }

        let ct = Box::new(ct);
        let rk: Box<ReKey> = match self.call(|| CryptoRequest::ReKey {
            ct: ct.clone(),
            recipient,
            attributes: attributes.clone(),
        })? {
            CryptoResponse::ReKey(rk) => rk,
            other => return Err(other.unexpected("rekey")),
        };
        let ctp = match self.call(|| CryptoRequest::ReEncrypt {
            ct: ct.clone(),
            rk: rk.clone(),
        })? {
            CryptoResponse::Reencrypted(ctp) => ctp,
            other => return Err(other.unexpected("reencrypt")),
        };

        if !self.verify(&ctp, request.ct_hash, recipient)? {
            return Err(Error::VerificationFailed(format!(
                "re-encrypted ciphertext of request {}",
                request.id
            )));
        }
        Ok(*ctp)
    }
}

impl<L, S, B> Lifecycle<L, S, B, Escrow>
where
    L: Ledger,
    S: OpaqueStore,
    B: CryptoBoundary,
{
    /// Balance of refunded collateral `party` may withdraw.
    pub fn withdrawable(&self, party: &Address) -> Result<Amount, Error> {
        self.with_collateral(|manager| manager.rail().withdrawable(party))
    }

    pub fn withdraw(&self, party: &Address) -> Result<Amount, Error> {
        self.with_collateral(|manager| manager.rail_mut().withdraw(party))
    }
}
