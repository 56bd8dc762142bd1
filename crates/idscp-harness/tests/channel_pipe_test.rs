//! Threaded end-to-end handshake over the secure-channel adapter.
//!
//! Unlike the scenario tests, these run the real delivery path: loopback
//! transports, pump threads, the attach gate, and driver callbacks
//! re-entering the connection lock through `ChannelListener`.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use idscp_core::{
    AttestationResult, ChannelListener, Connection, ConnectionConfig, Role, SecureChannel,
    StaticDaps,
};
use idscp_harness::loopback;
use idscp_rat::{dummy, RatProverRegistry, RatVerifierRegistry};

fn connection(role: Role, channel: &Arc<SecureChannel>) -> Arc<Mutex<Connection>> {
    let provers = RatProverRegistry::new();
    dummy::register_prover(&provers);
    let verifiers = RatVerifierRegistry::new();
    dummy::register_verifier(&verifiers);

    let mut conn = Connection::new(
        role,
        ConnectionConfig::default(),
        Arc::new(StaticDaps::accepting()),
        provers,
        verifiers,
    )
    .expect("connection builds");
    conn.set_listener(Arc::new(ChannelListener::new(Arc::clone(channel))));
    Arc::new(Mutex::new(conn))
}

fn wait_finished(connections: &[&Arc<Mutex<Connection>>], bound: Duration) -> bool {
    let deadline = Instant::now() + bound;
    loop {
        if connections.iter().all(|conn| conn.lock().is_finished()) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn threaded_handshake_over_loopback() {
    let (channel_c, channel_p) = loopback::channel_pair();
    let consumer = connection(Role::Consumer, &channel_c);
    let provider = connection(Role::Provider, &channel_p);
    channel_c.attach(Arc::clone(&consumer));
    channel_p.attach(Arc::clone(&provider));

    let actions = consumer.lock().start(Instant::now());
    channel_c.dispatch(actions);

    assert!(
        wait_finished(&[&consumer, &provider], Duration::from_secs(5)),
        "handshake did not finish: consumer in {}, provider in {}",
        consumer.lock().state_name(),
        provider.lock().state_name()
    );
    assert_eq!(consumer.lock().verdict(), Some(AttestationResult::Success));
    assert_eq!(provider.lock().verdict(), Some(AttestationResult::Success));
    assert!(consumer.lock().peer_description().is_some());
}

#[test]
fn late_attach_holds_early_frames() {
    let (channel_c, channel_p) = loopback::channel_pair();
    let consumer = connection(Role::Consumer, &channel_c);
    channel_c.attach(Arc::clone(&consumer));

    // The consumer starts before the provider's connection is attached;
    // its RatStart blocks on the provider channel's gate.
    let actions = consumer.lock().start(Instant::now());
    channel_c.dispatch(actions);
    thread::sleep(Duration::from_millis(100));

    let provider = connection(Role::Provider, &channel_p);
    channel_p.attach(Arc::clone(&provider));

    assert!(
        wait_finished(&[&consumer, &provider], Duration::from_secs(5)),
        "handshake did not finish after late attach"
    );
    assert_eq!(consumer.lock().verdict(), Some(AttestationResult::Success));
    assert_eq!(provider.lock().verdict(), Some(AttestationResult::Success));
}
