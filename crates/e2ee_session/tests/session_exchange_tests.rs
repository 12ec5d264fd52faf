//! End-to-end tests against a real (temp-file) SQLite store and the
//! in-memory `MockDirectory`, covering the basic exchange, reordering,
//! replay, ratchet-step, recovery, and skip-bound scenarios.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use e2ee_crypto::identity::IdentityKeyPair;
use e2ee_session::clock::SystemClock;
use e2ee_session::config::SessionConfig;
use e2ee_session::directory::{DirectoryClient, MockDirectory};
use e2ee_session::error::SessionError;
use e2ee_session::fanout::FanoutCoordinator;
use e2ee_session::prekey_store::PrekeyStore;
use e2ee_session::sync_transport::NullSyncTransport;
use e2ee_session::telemetry::{TelemetryEvent, TelemetryHook};
use e2ee_session::SessionManager;
use e2ee_store::{Store, Vault};

struct RecordingTelemetry {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl RecordingTelemetry {
    fn new() -> Self {
        Self { events: Mutex::new(Vec::new()) }
    }

    fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl TelemetryHook for RecordingTelemetry {
    fn record(&self, event: TelemetryEvent) {
        self.events.lock().unwrap().push(event);
    }
}

struct Party {
    store: Store,
    manager: Arc<SessionManager>,
    prekeys: Arc<PrekeyStore>,
    telemetry: Arc<RecordingTelemetry>,
}

async fn new_store(tag: &str) -> (Store, PathBuf) {
    let db_path = PathBuf::from(format!(
        "/tmp/e2ee-session-test-{tag}-{}.db",
        uuid::Uuid::new_v4()
    ));
    let vault = Vault::new();
    vault.unlock_with_key([9u8; 32]).await.unwrap();
    let store = Store::open(&db_path, vault).await.unwrap();
    (store, db_path)
}

fn cleanup(paths: &[PathBuf]) {
    for p in paths {
        let _ = std::fs::remove_file(p);
        let _ = std::fs::remove_file(p.with_extension("db-wal"));
        let _ = std::fs::remove_file(p.with_extension("db-shm"));
    }
}

async fn build_party(
    user_id: &str,
    directory: Arc<MockDirectory>,
    config: SessionConfig,
) -> (Party, PathBuf) {
    let (store, db_path) = new_store(user_id).await;
    let identity = IdentityKeyPair::generate().unwrap();
    let prekeys = Arc::new(PrekeyStore::new(
        store.clone(),
        directory,
        identity,
        user_id.to_string(),
        1,
    ));
    let telemetry = Arc::new(RecordingTelemetry::new());
    let manager = Arc::new(SessionManager::new(
        store.clone(),
        prekeys.clone(),
        config,
        Arc::new(SystemClock),
        telemetry.clone(),
    ));
    (Party { store, manager, prekeys, telemetry }, db_path)
}

/// S1: basic exchange — B initiates against A's 5-OPK bundle, A accepts and
/// replies, B decrypts. A's unconsumed OPK pool drops from 5 to 4.
#[tokio::test]
async fn basic_exchange() {
    let directory = Arc::new(MockDirectory::new());
    let (alice, alice_db) = build_party("alice", directory.clone(), SessionConfig::default()).await;
    alice.prekeys.rotate_signed_prekey().await.unwrap();
    alice.prekeys.top_up_one_time_prekeys(0, 5).await.unwrap();
    alice.prekeys.publish_bundle().await.unwrap();

    let (bob, bob_db) = build_party("bob", directory.clone(), SessionConfig::default()).await;

    let bob_session = bob.manager.start_session("alice").await.unwrap();
    let hello = bob.manager.encrypt(&bob_session, b"hello").await.unwrap();

    let (alice_session, plaintext) = alice
        .manager
        .accept_prekey_message(&hello, None)
        .await
        .unwrap();
    assert_eq!(plaintext, b"hello");

    let hi = alice.manager.encrypt(&alice_session, b"hi").await.unwrap();
    let got = bob.manager.decrypt(&bob_session, &hi).await.unwrap();
    assert_eq!(got, b"hi");

    let remaining: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM one_time_prekeys WHERE consumed = 0")
            .fetch_one(&alice.store.pool)
            .await
            .unwrap();
    assert_eq!(remaining, 4);

    cleanup(&[alice_db, bob_db]);
}

/// S2: out-of-order delivery within one sending chain is tolerated and the
/// recovered plaintexts still correspond to the original send order.
#[tokio::test]
async fn out_of_order_delivery() {
    let directory = Arc::new(MockDirectory::new());
    let (alice, alice_db) = build_party("alice", directory.clone(), SessionConfig::default()).await;
    alice.prekeys.initialize().await.unwrap();
    let (bob, bob_db) = build_party("bob", directory.clone(), SessionConfig::default()).await;

    let bob_session = bob.manager.start_session("alice").await.unwrap();
    let hello = bob.manager.encrypt(&bob_session, b"hello").await.unwrap();
    let (alice_session, _) = alice.manager.accept_prekey_message(&hello, None).await.unwrap();

    let messages = [b"m0".to_vec(), b"m1".to_vec(), b"m2".to_vec(), b"m3".to_vec()];
    let mut envelopes = Vec::new();
    for m in &messages {
        envelopes.push(alice.manager.encrypt(&alice_session, m).await.unwrap());
    }

    // Deliver m2, m0, m3, m1.
    let order = [2usize, 0, 3, 1];
    let mut decoded = Vec::new();
    for &i in &order {
        let plaintext = bob.manager.decrypt(&bob_session, &envelopes[i]).await.unwrap();
        decoded.push((envelopes[i].ratchet_header.n, plaintext));
    }
    decoded.sort_by_key(|(n, _)| *n);

    let ordered: Vec<Vec<u8>> = decoded.into_iter().map(|(_, p)| p).collect();
    assert_eq!(ordered, messages);

    cleanup(&[alice_db, bob_db]);
}

/// S3: replaying the same envelope a second time is rejected and leaves the
/// session able to continue (it doesn't re-derive or re-advance anything).
#[tokio::test]
async fn replay_is_rejected() {
    let directory = Arc::new(MockDirectory::new());
    let (alice, alice_db) = build_party("alice", directory.clone(), SessionConfig::default()).await;
    alice.prekeys.initialize().await.unwrap();
    let (bob, bob_db) = build_party("bob", directory.clone(), SessionConfig::default()).await;

    let bob_session = bob.manager.start_session("alice").await.unwrap();
    let m0 = bob.manager.encrypt(&bob_session, b"m0").await.unwrap();
    let (alice_session, plaintext) = alice.manager.accept_prekey_message(&m0, None).await.unwrap();
    assert_eq!(plaintext, b"m0");

    let replayed = alice.manager.decrypt(&alice_session, &m0).await;
    assert!(matches!(
        replayed,
        Err(SessionError::Crypto(e2ee_crypto::CryptoError::Replay))
    ));

    // Session is still usable afterwards.
    let m1 = bob.manager.encrypt(&bob_session, b"m1").await.unwrap();
    let got = alice.manager.decrypt(&alice_session, &m1).await.unwrap();
    assert_eq!(got, b"m1");

    cleanup(&[alice_db, bob_db]);
}

/// S4: each side's DH ratchet public key rotates once the other side's new
/// key has been consumed.
#[tokio::test]
async fn ratchet_steps_on_reply() {
    let directory = Arc::new(MockDirectory::new());
    let (alice, alice_db) = build_party("alice", directory.clone(), SessionConfig::default()).await;
    alice.prekeys.initialize().await.unwrap();
    let (bob, bob_db) = build_party("bob", directory.clone(), SessionConfig::default()).await;

    let bob_session = bob.manager.start_session("alice").await.unwrap();
    let a0 = bob.manager.encrypt(&bob_session, b"a0").await.unwrap();
    let (alice_session, _) = alice.manager.accept_prekey_message(&a0, None).await.unwrap();
    let a1 = bob.manager.encrypt(&bob_session, b"a1").await.unwrap();
    alice.manager.decrypt(&alice_session, &a1).await.unwrap();

    let b0 = alice.manager.encrypt(&alice_session, b"b0").await.unwrap();
    assert_ne!(b0.ratchet_header.dh_pub, a0.ratchet_header.dh_pub);
    bob.manager.decrypt(&bob_session, &b0).await.unwrap();

    let a2 = bob.manager.encrypt(&bob_session, b"a2").await.unwrap();
    assert_ne!(a2.ratchet_header.dh_pub, a0.ratchet_header.dh_pub);
    let got = alice.manager.decrypt(&alice_session, &a2).await.unwrap();
    assert_eq!(got, b"a2");

    cleanup(&[alice_db, bob_db]);
}

/// S5: a remote identity-key rotation is detected automatically on the next
/// `setup_conversation_encryption` call (no caller-supplied guess), and
/// `recover_from_key_mismatch` rebuilds the binding against the new key and
/// succeeds on the retried send, recording exactly one recovery event.
#[tokio::test]
async fn key_mismatch_recovery() {
    let directory = Arc::new(MockDirectory::new());
    let (alice, alice_db) = build_party("alice", directory.clone(), SessionConfig::default()).await;
    alice.prekeys.initialize().await.unwrap();
    let (bob, bob_db) = build_party("bob", directory.clone(), SessionConfig::default()).await;

    let alice_ik = alice.prekeys.identity().public_b64();
    directory.register_device("alice", "device-f1", &alice_ik).await.unwrap();

    let fanout = FanoutCoordinator::new(
        bob.store.clone(),
        bob.manager.clone(),
        directory.clone(),
        Arc::new(NullSyncTransport),
        SessionConfig::default(),
        bob.telemetry.clone(),
        Arc::new(SystemClock),
    );

    let bindings = fanout
        .setup_conversation_encryption("conv-1", "alice", &["device-f1".to_string()])
        .await
        .unwrap();
    assert_eq!(bindings.len(), 1);
    assert_eq!(bindings[0].key_version, 1);

    // Alice's device is swapped/reinstalled: a new identity key is on file
    // for "device-f1" under the same user, with Bob's binding never told.
    let rotated_identity = IdentityKeyPair::generate().unwrap();
    directory
        .register_device("alice", "device-f1", &rotated_identity.public.to_b64())
        .await
        .unwrap();

    // The very first send attempt against the stale binding must fail with
    // KeyMismatch on its own, without any caller supplying which device.
    let mismatch = fanout
        .setup_conversation_encryption("conv-1", "alice", &["device-f1".to_string()])
        .await;
    assert!(matches!(mismatch, Err(SessionError::KeyMismatch)));

    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_clone = attempts.clone();
    let result = fanout
        .recover_from_key_mismatch(
            "conv-1",
            "alice",
            &["device-f1".to_string()],
            "device-f1",
            move |_session_id| {
                let attempts = attempts_clone.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        )
        .await;

    assert!(result.is_ok());
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    let recovery_events: Vec<_> = bob
        .telemetry
        .events()
        .into_iter()
        .filter(|e| matches!(e, TelemetryEvent::RecoveryAttempted { .. }))
        .collect();
    assert_eq!(recovery_events.len(), 1);

    // Recovery rebuilt the binding under a later generation, against the
    // identity key now on file.
    let rebound = fanout.session_for_device("conv-1", "device-f1").await;
    assert!(rebound.is_some());

    cleanup(&[alice_db, bob_db]);
}

/// A `SessionManager` rebuilt over the same store (simulating a process
/// restart) picks its sessions back up via `restore_sessions` and can keep
/// decrypting/encrypting on them.
#[tokio::test]
async fn session_survives_restart() {
    let directory = Arc::new(MockDirectory::new());
    let (alice, alice_db) = build_party("alice", directory.clone(), SessionConfig::default()).await;
    alice.prekeys.initialize().await.unwrap();
    let (bob, bob_db) = build_party("bob", directory.clone(), SessionConfig::default()).await;

    let bob_session = bob.manager.start_session("alice").await.unwrap();
    let m0 = bob.manager.encrypt(&bob_session, b"m0").await.unwrap();
    let (alice_session, plaintext) = alice.manager.accept_prekey_message(&m0, None).await.unwrap();
    assert_eq!(plaintext, b"m0");

    let reply = alice.manager.encrypt(&alice_session, b"reply").await.unwrap();
    let got = bob.manager.decrypt(&bob_session, &reply).await.unwrap();
    assert_eq!(got, b"reply");

    // Simulate Bob's process restarting: a fresh SessionManager over the
    // same store, with nothing in its in-memory session table yet.
    let telemetry = Arc::new(RecordingTelemetry::new());
    let bob_manager_2 = Arc::new(SessionManager::new(
        bob.store.clone(),
        bob.prekeys.clone(),
        SessionConfig::default(),
        Arc::new(SystemClock),
        telemetry,
    ));
    assert!(bob_manager_2.session_state(&bob_session).await.is_none());

    let restored = bob_manager_2.restore_sessions().await.unwrap();
    assert_eq!(restored, 1);

    let m1 = alice.manager.encrypt(&alice_session, b"m1").await.unwrap();
    let got = bob_manager_2.decrypt(&bob_session, &m1).await.unwrap();
    assert_eq!(got, b"m1");

    let m2 = bob_manager_2.encrypt(&bob_session, b"m2").await.unwrap();
    let got = alice.manager.decrypt(&alice_session, &m2).await.unwrap();
    assert_eq!(got, b"m2");

    cleanup(&[alice_db, bob_db]);
}

/// S6: a header claiming an enormous skip count is rejected without
/// mutating the receiving chain's counters.
#[tokio::test]
async fn skip_bound_denies_dos_header() {
    let directory = Arc::new(MockDirectory::new());
    let (alice, alice_db) = build_party("alice", directory.clone(), SessionConfig::default()).await;
    alice.prekeys.initialize().await.unwrap();
    let (bob, bob_db) = build_party("bob", directory.clone(), SessionConfig::default()).await;

    let bob_session = bob.manager.start_session("alice").await.unwrap();
    let m0 = bob.manager.encrypt(&bob_session, b"m0").await.unwrap();
    let (alice_session, _) = alice.manager.accept_prekey_message(&m0, None).await.unwrap();

    let mut forged = m0.clone();
    forged.envelope_id = uuid::Uuid::new_v4().to_string();
    forged.ratchet_header.n = 10_000_000;

    let err = alice.manager.decrypt(&alice_session, &forged).await;
    assert!(matches!(err, Err(SessionError::TooManySkipped)));

    // The chain is still healthy: the next legitimate message still decrypts.
    let m1 = bob.manager.encrypt(&bob_session, b"m1").await.unwrap();
    let got = alice.manager.decrypt(&alice_session, &m1).await.unwrap();
    assert_eq!(got, b"m1");

    cleanup(&[alice_db, bob_db]);
}
