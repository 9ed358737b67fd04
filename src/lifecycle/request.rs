use crate::{
    abe_policy::{AccessPolicy, AttributeSet},
    config::Config,
    core::{Digest, PartyHandle},
    lifecycle::{Address, Amount, Party, RequestId, Status, Timestamp},
    Error,
};

/// Terms offered by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TripTerms {
    pub fare: Amount,
    pub pickup_eta_secs: u32,
}

/// Offer of a provider to serve a request. Only `active` ever changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    pub provider: Address,
    pub provider_handle: PartyHandle,
    pub terms: TripTerms,
    pub attributes: AttributeSet,
    pub collateral: Amount,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rating {
    pub by: Party,
    pub score: u8,
}

/// Ledger record of a ride request.
///
/// Only hashes of the ciphertexts are recorded; the blobs themselves live in
/// the opaque store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub id: RequestId,
    pub requester: Address,
    pub requester_handle: PartyHandle,
    pub provider: Option<Address>,
    pub provider_handle: Option<PartyHandle>,
    pub ct_hash: Digest,
    pub ct_prime_hash: Option<Digest>,
    pub policy: AccessPolicy,
    pub requester_collateral: Amount,
    pub proposals: Vec<Proposal>,
    /// Index of the matched proposal.
    pub chosen: Option<usize>,
    pub status: Status,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub completed_at: Option<Timestamp>,
    pub rating_deadline: Option<Timestamp>,
    pub ratings: Vec<Rating>,
    /// Set once every deposit of the request was refunded or slashed.
    pub collateral_released: bool,
}

/// Ledger transition submitted by a party.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Create {
        requester_handle: PartyHandle,
        ct_hash: Digest,
        policy: AccessPolicy,
        collateral: Amount,
    },
    Propose {
        provider_handle: PartyHandle,
        terms: TripTerms,
        attributes: AttributeSet,
        collateral: Amount,
    },
    Match {
        proposal: usize,
    },
    SubmitReencryption {
        ct_prime_hash: Digest,
    },
    Start,
    Complete,
    Dispute,
    Cancel,
    /// Closes a dispute, slashing the deposit of the party at fault if any.
    Resolve {
        at_fault: Option<Party>,
    },
    Rate {
        score: u8,
    },
}

impl Transition {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Propose { .. } => "propose",
            Self::Match { .. } => "match",
            Self::SubmitReencryption { .. } => "submit_reencryption",
            Self::Start => "start",
            Self::Complete => "complete",
            Self::Dispute => "dispute",
            Self::Cancel => "cancel",
            Self::Resolve { .. } => "resolve",
            Self::Rate { .. } => "rate",
        }
    }
}

/// Effect of a committed transition, as emitted by the ledger.
///
/// Variants moving collateral name the parties whose deposit moves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Created {
        requester: Address,
        collateral: Amount,
    },
    Proposed {
        index: usize,
        provider: Address,
        collateral: Amount,
    },
    Matched {
        index: usize,
        provider: Address,
        provider_handle: PartyHandle,
        refunded: Vec<Address>,
    },
    ReencryptionSubmitted {
        ct_prime_hash: Digest,
    },
    Started,
    Completed {
        released: Vec<Address>,
    },
    Disputed {
        by: Party,
    },
    Cancelled {
        refunded: Vec<Address>,
    },
    Resolved {
        slashed: Option<Address>,
        refunded: Vec<Address>,
    },
    Rated {
        by: Party,
        score: u8,
    },
}

impl Request {
    /// Creates the record of a new request.
    pub fn create(
        id: RequestId,
        requester: &Address,
        transition: &Transition,
        config: &Config,
        now: Timestamp,
    ) -> Result<(Self, EventKind), Error> {
        let Transition::Create {
            requester_handle,
            ct_hash,
            policy,
            collateral,
        } = transition
        else {
            return Err(Error::Reverted(format!(
                "request {id} does not exist, `{}` needs an existing request",
                transition.name()
            )));
        };
        if id != RequestId::derive(requester, ct_hash) {
            return Err(Error::Reverted(format!(
                "request id {id} does not match the ciphertext commitment"
            )));
        }
        if *collateral < config.min_requester_collateral {
            return Err(Error::InsufficientCollateral {
                given: *collateral,
                required: config.min_requester_collateral,
            });
        }
        let request = Self {
            id,
            requester: requester.clone(),
            requester_handle: *requester_handle,
            provider: None,
            provider_handle: None,
            ct_hash: *ct_hash,
            ct_prime_hash: None,
            policy: policy.clone(),
            requester_collateral: *collateral,
            proposals: Vec::new(),
            chosen: None,
            status: Status::Requested,
            created_at: now,
            updated_at: now,
            completed_at: None,
            rating_deadline: None,
            ratings: Vec::new(),
            collateral_released: false,
        };
        let event = EventKind::Created {
            requester: requester.clone(),
            collateral: *collateral,
        };
        Ok((request, event))
    }

    fn illegal(&self, transition: &Transition) -> Error {
        Error::InvalidTransition {
            from: self.status,
            transition: transition.name(),
        }
    }

    /// Side of `sender` in this request, if any.
    #[must_use]
    pub fn party_of(&self, sender: &Address) -> Option<Party> {
        if *sender == self.requester {
            Some(Party::Requester)
        } else if self.provider.as_ref() == Some(sender) {
            Some(Party::Provider)
        } else {
            None
        }
    }

    /// Parties whose deposit is still locked, requester first.
    #[must_use]
    pub fn locked_parties(&self) -> Vec<Address> {
        if self.collateral_released {
            return Vec::new();
        }
        std::iter::once(self.requester.clone())
            .chain(
                self.proposals
                    .iter()
                    .filter(|p| p.active)
                    .map(|p| p.provider.clone()),
            )
            .collect()
    }

    /// The matched proposal.
    #[must_use]
    pub fn chosen_proposal(&self) -> Option<&Proposal> {
        self.chosen.and_then(|index| self.proposals.get(index))
    }

    /// Applies the transition sent by `sender`.
    ///
    /// On error the record is left untouched.
    pub fn apply(
        &mut self,
        sender: &Address,
        transition: &Transition,
        config: &Config,
        now: Timestamp,
    ) -> Result<EventKind, Error> {
        let event = match transition {
            Transition::Create { .. } => {
                return Err(Error::Reverted(format!("request {} already exists", self.id)))
            }

            Transition::Propose {
                provider_handle,
                terms,
                attributes,
                collateral,
            } => {
                if !matches!(self.status, Status::Requested | Status::Proposed) {
                    return Err(self.illegal(transition));
                }
                if *sender == self.requester {
                    return Err(Error::NotAuthorized(sender.to_string()));
                }
                if attributes.is_empty() {
                    return Err(Error::InvalidAttributes(
                        "a proposal needs at least one attribute".to_string(),
                    ));
                }
                if *collateral < config.min_provider_collateral {
                    return Err(Error::InsufficientCollateral {
                        given: *collateral,
                        required: config.min_provider_collateral,
                    });
                }
                if self
                    .proposals
                    .iter()
                    .any(|p| p.active && p.provider == *sender)
                {
                    return Err(Error::Reverted(format!(
                        "{sender} already has an active proposal on request {}",
                        self.id
                    )));
                }
                self.proposals.push(Proposal {
                    provider: sender.clone(),
                    provider_handle: *provider_handle,
                    terms: *terms,
                    attributes: attributes.clone(),
                    collateral: *collateral,
                    active: true,
                });
                self.status = Status::Proposed;
                EventKind::Proposed {
                    index: self.proposals.len() - 1,
                    provider: sender.clone(),
                    collateral: *collateral,
                }
            }

            Transition::Match { proposal } => {
                if !config.is_matcher(sender) {
                    return Err(Error::NotAuthorizedMatcher(sender.to_string()));
                }
                if self.status != Status::Proposed {
                    return Err(self.illegal(transition));
                }
                let chosen = self
                    .proposals
                    .get(*proposal)
                    .filter(|p| p.active)
                    .ok_or(Error::InvalidProposal {
                        request: self.id,
                        index: *proposal,
                    })?;
                if !self.policy.is_satisfied_by(&chosen.attributes) {
                    return Err(Error::PolicyNotSatisfied);
                }
                let provider = chosen.provider.clone();
                let provider_handle = chosen.provider_handle;
                let mut refunded = Vec::new();
                for (index, p) in self.proposals.iter_mut().enumerate() {
                    if index != *proposal && p.active {
                        p.active = false;
                        refunded.push(p.provider.clone());
                    }
                }
                self.provider = Some(provider.clone());
                self.provider_handle = Some(provider_handle);
                self.chosen = Some(*proposal);
                self.status = Status::Matched;
                EventKind::Matched {
                    index: *proposal,
                    provider,
                    provider_handle,
                    refunded,
                }
            }

            Transition::SubmitReencryption { ct_prime_hash } => {
                if !config.is_matcher(sender) {
                    return Err(Error::NotAuthorizedMatcher(sender.to_string()));
                }
                if self.status != Status::Matched {
                    return Err(self.illegal(transition));
                }
                if ct_prime_hash.to_bytes() == [0; 32] || *ct_prime_hash == self.ct_hash {
                    return Err(Error::Reverted(format!(
                        "{ct_prime_hash} is not a re-encrypted ciphertext hash"
                    )));
                }
                self.ct_prime_hash = Some(*ct_prime_hash);
                self.status = Status::Reencrypted;
                EventKind::ReencryptionSubmitted {
                    ct_prime_hash: *ct_prime_hash,
                }
            }

            Transition::Start => {
                if self.status != Status::Reencrypted {
                    return Err(self.illegal(transition));
                }
                if self.party_of(sender) != Some(Party::Provider) {
                    return Err(Error::NotAuthorized(sender.to_string()));
                }
                self.status = Status::InProgress;
                EventKind::Started
            }

            Transition::Complete => {
                if !matches!(self.status, Status::InProgress | Status::Reencrypted) {
                    return Err(self.illegal(transition));
                }
                if self.party_of(sender).is_none() {
                    return Err(Error::NotAuthorized(sender.to_string()));
                }
                let released = self.locked_parties();
                self.collateral_released = true;
                self.completed_at = Some(now);
                self.rating_deadline = Some(now.saturating_add(config.rating_window_secs));
                self.status = Status::Completed;
                EventKind::Completed { released }
            }

            Transition::Dispute => {
                if matches!(
                    self.status,
                    Status::Cancelled | Status::Disputed | Status::Resolved
                ) {
                    return Err(self.illegal(transition));
                }
                let by = self
                    .party_of(sender)
                    .ok_or_else(|| Error::NotAuthorized(sender.to_string()))?;
                self.status = Status::Disputed;
                EventKind::Disputed { by }
            }

            Transition::Cancel => {
                if !matches!(self.status, Status::Requested | Status::Proposed) {
                    return Err(self.illegal(transition));
                }
                if *sender != self.requester {
                    return Err(Error::NotAuthorized(sender.to_string()));
                }
                let refunded = self.locked_parties();
                for p in &mut self.proposals {
                    p.active = false;
                }
                self.collateral_released = true;
                self.status = Status::Cancelled;
                EventKind::Cancelled { refunded }
            }

            Transition::Resolve { at_fault } => {
                if !config.is_arbiter(sender) {
                    return Err(Error::NotAuthorized(sender.to_string()));
                }
                if self.status != Status::Disputed {
                    return Err(self.illegal(transition));
                }
                let at_fault = match at_fault {
                    None => None,
                    Some(Party::Requester) => Some(self.requester.clone()),
                    Some(Party::Provider) => {
                        Some(self.provider.clone().ok_or_else(|| {
                            Error::Reverted(format!(
                                "request {} has no provider to hold at fault",
                                self.id
                            ))
                        })?)
                    }
                };
                let mut refunded = self.locked_parties();
                // collateral already released at completion cannot be slashed
                let slashed = at_fault.filter(|party| refunded.contains(party));
                refunded.retain(|party| Some(party) != slashed.as_ref());
                self.collateral_released = true;
                self.status = Status::Resolved;
                EventKind::Resolved { slashed, refunded }
            }

            Transition::Rate { score } => {
                if self.status != Status::Completed {
                    return Err(self.illegal(transition));
                }
                let by = self
                    .party_of(sender)
                    .ok_or_else(|| Error::NotAuthorized(sender.to_string()))?;
                if !(1..=5).contains(score) {
                    return Err(Error::InvalidRating(format!(
                        "score {score} is outside 1..=5"
                    )));
                }
                if self.rating_deadline.map_or(true, |deadline| now > deadline) {
                    return Err(Error::Reverted(format!(
                        "rating window of request {} is closed",
                        self.id
                    )));
                }
                if self.ratings.iter().any(|r| r.by == by) {
                    return Err(Error::Reverted(format!(
                        "{by:?} already rated request {}",
                        self.id
                    )));
                }
                self.ratings.push(Rating { by, score: *score });
                EventKind::Rated { by, score: *score }
            }
        };
        self.updated_at = now;
        Ok(event)
    }
}
