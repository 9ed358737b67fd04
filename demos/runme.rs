//! This is the demo given in `lib.rs`

use std::sync::Arc;

use ride_crypt::{
    abe_policy::{AccessPolicy, AttributeSet},
    collateral::Escrow,
    config::Config,
    lifecycle::{Address, Lifecycle, MemoryLedger, TripTerms},
    store::MemoryStore,
    CryptoBoundary, CryptoRequest, CryptoResponse, CryptoService, RideCrypt,
};

fn main() {
    // The deployment authorizes one matcher and requires collateral from
    // both sides of a ride.
    let config = Config::from_json(
        r#"{
            "authorized_matchers": ["0xmatcher"],
            "arbiters": ["0xarbiter"],
            "min_requester_collateral": 10,
            "min_provider_collateral": 5
        }"#,
    )
    .unwrap();

    // The crypto engine runs the setup once and keeps the master secret key.
    let crypto = Arc::new(CryptoService::setup(RideCrypt::default()).unwrap());

    let lifecycle = Lifecycle::new(
        config.clone(),
        MemoryLedger::new(config),
        MemoryStore::new(),
        crypto.clone(),
        Escrow::new(),
    )
    .unwrap();

    let rider = Address::from("0xrider");
    let driver = Address::from("0xdriver");
    let matcher = Address::from("0xmatcher");

    // Parties are known to the engine by pseudonymous handles, never by
    // their ledger address.
    let handle = |identity: &[u8]| match crypto
        .call(CryptoRequest::DerivePtid {
            identity: identity.to_vec(),
            context: b"2026-10-17".to_vec(),
        })
        .unwrap()
    {
        CryptoResponse::Ptid(ptid) => ptid,
        _ => unreachable!(),
    };
    let rider_handle = handle(b"rider");
    let driver_handle = handle(b"driver");

    // The driver is verified and drives a premium car.
    let driver_attributes = AttributeSet::from_names(["verified", "premium", "licensed"]).unwrap();
    let usk = match crypto
        .call(CryptoRequest::KeyGen {
            attributes: driver_attributes.clone(),
            ptid: driver_handle,
        })
        .unwrap()
    {
        CryptoResponse::UserKeys(usk) => usk,
        _ => unreachable!(),
    };

    // The rider only wants verified premium drivers to read the request.
    let policy = AccessPolicy::parse("verified && premium").unwrap();
    let ct = crypto
        .engine()
        .encrypt(crypto.params(), &policy, b"pickup=A,dest=B")
        .unwrap();
    let id = lifecycle.create(&rider, rider_handle, &ct, 10).unwrap();

    // The driver proposes without seeing the destination.
    let proposal = lifecycle
        .propose(
            &driver,
            id,
            driver_handle,
            TripTerms {
                fare: 18,
                pickup_eta_secs: 240,
            },
            driver_attributes,
            5,
        )
        .unwrap();

    // The matcher re-encrypts the request for the driver and records it.
    let outcome = lifecycle.match_request(&matcher, id, proposal).unwrap();
    lifecycle.submit_reencryption(&matcher, id).unwrap();
    println!("request {id} matched, CT' hash {}", outcome.ct_prime_hash);

    // Only the driver can decrypt the re-encrypted request.
    let ctp = lifecycle.fetch_reencrypted(id).unwrap();
    let plaintext = crypto
        .engine()
        .decrypt(crypto.params(), &ctp, &usk)
        .unwrap();
    println!("driver reads: {}", String::from_utf8_lossy(&plaintext));

    // The ride happens, and both deposits are released.
    lifecycle.start(&driver, id).unwrap();
    lifecycle.complete(&rider, id).unwrap();
    lifecycle.rate(&rider, id, 5).unwrap();
    println!(
        "rider may withdraw {}, driver may withdraw {}",
        lifecycle.withdrawable(&rider).unwrap(),
        lifecycle.withdrawable(&driver).unwrap()
    );
}
