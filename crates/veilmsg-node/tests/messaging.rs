//! End-to-end messaging between nodes sharing an in-process SAM bridge

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use veilmsg_crypto::{encrypt_for, SessionKeyStore};
use veilmsg_network::testing::FakeSamBridge;
use veilmsg_network::{parse_qr_content, SamClient};
use veilmsg_node::config::{Config, MessagingConfig, QueueConfig};
use veilmsg_node::contacts::{Contact, ContactDirectory};
use veilmsg_node::identity::onboard;
use veilmsg_node::messenger::write_frame;
use veilmsg_node::{
    DeliveryQueue, DeliveryStatus, IncomingMessage, LocalIdentity, MessageFrame, MessageManager,
    Node, SendOutcome, SqliteStore,
};

struct Peer {
    store: Arc<SqliteStore>,
    sam: Arc<SamClient>,
    identity: LocalIdentity,
    queue: Arc<DeliveryQueue>,
    messenger: Arc<MessageManager>,
}

impl Peer {
    async fn new(bridge: &FakeSamBridge) -> Self {
        Self::with_messaging(bridge, MessagingConfig::default()).await
    }

    async fn with_messaging(bridge: &FakeSamBridge, messaging: MessagingConfig) -> Self {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let sam = Arc::new(SamClient::new(bridge.sam_config()));
        sam.connect().await.unwrap();
        let identity = onboard(&store, &sam).await.unwrap();
        let queue = Arc::new(DeliveryQueue::new(store.clone(), QueueConfig::default()));
        let messenger = Arc::new(MessageManager::new(
            sam.clone(),
            None,
            identity.clone(),
            store.clone(),
            store.clone(),
            queue.clone(),
            messaging,
        ));
        Peer {
            store,
            sam,
            identity,
            queue,
            messenger,
        }
    }

    fn address(&self) -> String {
        self.identity.b32_address().to_string()
    }

    async fn add_contact(&self, other: &Peer) {
        let descriptor = parse_qr_content(&other.identity.qr_content()).unwrap();
        let contact = Contact::from_descriptor(&descriptor, None).unwrap();
        self.messenger.add_contact(&contact).await.unwrap();
    }

    /// Start receiving; waits until the accept is parked on the bridge
    async fn go_online(&self, cancel: &CancellationToken) -> broadcast::Receiver<IncomingMessage> {
        let incoming = self.messenger.subscribe();
        self.messenger.clone().spawn_receiver(cancel.clone());
        tokio::time::sleep(Duration::from_millis(200)).await;
        incoming
    }
}

async fn next_message(incoming: &mut broadcast::Receiver<IncomingMessage>) -> IncomingMessage {
    tokio::time::timeout(Duration::from_secs(5), incoming.recv())
        .await
        .expect("no message within 5s")
        .unwrap()
}

#[tokio::test]
async fn test_message_delivered_end_to_end() {
    let bridge = FakeSamBridge::start().await.unwrap();
    let alice = Peer::new(&bridge).await;
    let bob = Peer::new(&bridge).await;
    alice.add_contact(&bob).await;
    bob.add_contact(&alice).await;

    let cancel = CancellationToken::new();
    let mut incoming = bob.go_online(&cancel).await;

    let outcome = alice
        .messenger
        .send_message(&bob.address(), "hello bob", None)
        .await
        .unwrap();
    let id = match outcome {
        SendOutcome::Delivered { id } => id,
        other => panic!("expected delivery, got {:?}", other),
    };

    let message = next_message(&mut incoming).await;
    assert_eq!(message.id, id);
    assert_eq!(message.text, "hello bob");
    assert_eq!(message.sender, alice.address());

    let record = alice.queue.get(id).await.unwrap().unwrap();
    assert_eq!(record.status, DeliveryStatus::Delivered);
    assert_eq!(record.retry_count, 0);

    cancel.cancel();
}

#[tokio::test]
async fn test_messages_to_one_contact_arrive_in_order() {
    let bridge = FakeSamBridge::start().await.unwrap();
    let alice = Peer::new(&bridge).await;
    let bob = Peer::new(&bridge).await;
    alice.add_contact(&bob).await;

    let cancel = CancellationToken::new();
    let mut incoming = bob.go_online(&cancel).await;

    let first = alice
        .messenger
        .send_message(&bob.address(), "one", None)
        .await
        .unwrap();
    for text in ["two", "three"] {
        let outcome = alice
            .messenger
            .send_message(&bob.address(), text, first.id())
            .await
            .unwrap();
        assert!(matches!(outcome, SendOutcome::Delivered { .. }));
    }

    let received: Vec<IncomingMessage> = vec![
        next_message(&mut incoming).await,
        next_message(&mut incoming).await,
        next_message(&mut incoming).await,
    ];
    let texts: Vec<&str> = received.iter().map(|m| m.text.as_str()).collect();
    assert_eq!(texts, ["one", "two", "three"]);
    assert_eq!(received[2].reply_to, first.id());

    cancel.cancel();
}

#[tokio::test]
async fn test_offline_recipient_is_retried() {
    let bridge = FakeSamBridge::start().await.unwrap();
    bridge.set_connect_wait(Duration::from_millis(100));
    let alice = Peer::new(&bridge).await;
    let bob = Peer::new(&bridge).await;
    alice.add_contact(&bob).await;

    let outcome = alice
        .messenger
        .send_message(&bob.address(), "are you there?", None)
        .await
        .unwrap();
    let id = match outcome {
        SendOutcome::Queued { id, reason } => {
            assert!(reason.contains("CANT_REACH_PEER"), "reason: {}", reason);
            id
        }
        other => panic!("expected queued, got {:?}", other),
    };

    // Not due yet
    let report = alice.queue.run_tick(alice.messenger.as_ref()).await.unwrap();
    assert_eq!(report.attempted, 0);

    bridge.set_connect_wait(Duration::from_secs(2));
    let cancel = CancellationToken::new();
    let mut incoming = bob.go_online(&cancel).await;

    let later = Utc::now() + chrono::Duration::seconds(31);
    let report = alice
        .queue
        .run_tick_at(alice.messenger.as_ref(), later)
        .await
        .unwrap();
    assert_eq!(report.delivered, 1);

    let message = next_message(&mut incoming).await;
    assert_eq!(message.id, id);
    assert_eq!(message.text, "are you there?");

    let record = alice.queue.get(id).await.unwrap().unwrap();
    assert_eq!(record.status, DeliveryStatus::Delivered);
    assert_eq!(record.retry_count, 1);

    cancel.cancel();
}

#[tokio::test]
async fn test_removing_contact_cancels_pending() {
    let bridge = FakeSamBridge::start().await.unwrap();
    bridge.set_connect_wait(Duration::from_millis(100));
    let alice = Peer::new(&bridge).await;
    let bob = Peer::new(&bridge).await;
    alice.add_contact(&bob).await;

    let outcome = alice
        .messenger
        .send_message(&bob.address(), "never mind", None)
        .await
        .unwrap();
    let id = outcome.id().unwrap();

    assert_eq!(alice.messenger.remove_contact(&bob.address()).await.unwrap(), 1);
    assert!(ContactDirectory::get(alice.store.as_ref(), &bob.address())
        .await
        .unwrap()
        .is_none());

    let record = alice.queue.get(id).await.unwrap().unwrap();
    assert_eq!(record.status, DeliveryStatus::Canceled);

    let later = Utc::now() + chrono::Duration::hours(1);
    let report = alice
        .queue
        .run_tick_at(alice.messenger.as_ref(), later)
        .await
        .unwrap();
    assert_eq!(report.attempted, 0);
}

#[tokio::test]
async fn test_unknown_or_invalid_recipient_fails_without_queueing() {
    let bridge = FakeSamBridge::start().await.unwrap();
    let alice = Peer::new(&bridge).await;
    let bob = Peer::new(&bridge).await;

    let outcome = alice
        .messenger
        .send_message(&bob.address(), "who are you", None)
        .await
        .unwrap();
    assert!(matches!(outcome, SendOutcome::Failed { id: None, .. }));

    let outcome = alice
        .messenger
        .send_message("not-an-address", "hi", None)
        .await
        .unwrap();
    assert!(matches!(outcome, SendOutcome::Failed { id: None, .. }));

    assert!(alice.queue.list(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_spoofed_and_tampered_frames_are_discarded() {
    let bridge = FakeSamBridge::start().await.unwrap();
    let alice = Peer::new(&bridge).await;
    let bob = Peer::new(&bridge).await;
    let mallory = Peer::new(&bridge).await;

    let cancel = CancellationToken::new();
    let mut incoming = bob.go_online(&cancel).await;

    let session = mallory.messenger.ensure_session().await.unwrap();
    let mut stream = mallory
        .sam
        .connect_to_peer(&session.session_id, &bob.address())
        .await
        .unwrap();
    let bob_key = bob.identity.app_keys.public_key();

    // Claims to be alice
    let spoofed = MessageFrame {
        id: uuid::Uuid::new_v4(),
        reply_to: None,
        sender: alice.address(),
        sent_at: Utc::now().timestamp_millis(),
        envelope: encrypt_for(bob_key, b"trust me, I'm alice").unwrap(),
    };
    write_frame(&mut stream, &spoofed.to_bytes().unwrap())
        .await
        .unwrap();

    // Ciphertext flipped in transit
    let mut tampered = MessageFrame {
        id: uuid::Uuid::new_v4(),
        reply_to: None,
        sender: mallory.address(),
        sent_at: Utc::now().timestamp_millis(),
        envelope: encrypt_for(bob_key, b"original").unwrap(),
    };
    tampered.envelope.ciphertext[0] ^= 0x01;
    write_frame(&mut stream, &tampered.to_bytes().unwrap())
        .await
        .unwrap();

    let honest = MessageFrame {
        id: uuid::Uuid::new_v4(),
        reply_to: None,
        sender: mallory.address(),
        sent_at: Utc::now().timestamp_millis(),
        envelope: encrypt_for(bob_key, b"just mallory").unwrap(),
    };
    write_frame(&mut stream, &honest.to_bytes().unwrap())
        .await
        .unwrap();

    let message = next_message(&mut incoming).await;
    assert_eq!(message.id, honest.id);
    assert_eq!(message.text, "just mallory");
    assert_eq!(message.sender, mallory.address());

    cancel.cancel();
}

#[tokio::test]
async fn test_session_keys_are_reused_when_rotation_enabled() {
    let bridge = FakeSamBridge::start().await.unwrap();
    let alice = Peer::with_messaging(
        &bridge,
        MessagingConfig {
            session_key_rotation_secs: 3600,
            ..MessagingConfig::default()
        },
    )
    .await;
    let bob = Peer::new(&bridge).await;
    alice.add_contact(&bob).await;

    let cancel = CancellationToken::new();
    let mut incoming = bob.go_online(&cancel).await;

    for text in ["first", "second"] {
        alice
            .messenger
            .send_message(&bob.address(), text, None)
            .await
            .unwrap();
    }
    assert_eq!(next_message(&mut incoming).await.text, "first");
    assert_eq!(next_message(&mut incoming).await.text, "second");

    let stored = SessionKeyStore::load(alice.store.as_ref(), &bob.address())
        .await
        .unwrap();
    assert!(stored.is_some());

    cancel.cancel();
}

#[tokio::test]
async fn test_node_uses_existing_router_and_keeps_identity() {
    let bridge = FakeSamBridge::start().await.unwrap();
    let dir = tempfile::tempdir().unwrap();

    let mut config = Config::with_data_dir(dir.path().to_path_buf());
    config.sam = bridge.sam_config();

    let mut node = Node::new(config.clone()).await.unwrap();
    assert!(node.daemon().is_none());
    let address = node.identity().b32_address().to_string();
    node.shutdown().await;

    // The bridge drops the session once our control socket is gone
    for _ in 0..50 {
        if bridge.session_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let mut node = Node::new(config).await.unwrap();
    assert_eq!(node.identity().b32_address(), address);
    node.shutdown().await;
}

#[tokio::test]
async fn test_idle_inbound_stream_is_closed() {
    let bridge = FakeSamBridge::start().await.unwrap();
    let bob = Peer::with_messaging(
        &bridge,
        MessagingConfig {
            connection_staleness_secs: 1,
            ..MessagingConfig::default()
        },
    )
    .await;
    let mallory = Peer::new(&bridge).await;

    let cancel = CancellationToken::new();
    let _incoming = bob.go_online(&cancel).await;

    let session = mallory.messenger.ensure_session().await.unwrap();
    let mut stream = mallory
        .sam
        .connect_to_peer(&session.session_id, &bob.address())
        .await
        .unwrap();

    // Never write anything; bob hangs up after the idle window
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("idle stream was kept open");
    assert!(matches!(read, Ok(0) | Err(_)));

    cancel.cancel();
}

#[tokio::test]
async fn test_send_while_node_running_is_handed_off() {
    let bridge = FakeSamBridge::start().await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let bob = Peer::new(&bridge).await;

    let mut config = Config::with_data_dir(dir.path().to_path_buf());
    config.sam = bridge.sam_config();
    config.queue.poll_interval_secs = 1;

    let mut running = Node::new(config.clone()).await.unwrap();
    let descriptor = parse_qr_content(&bob.identity.qr_content()).unwrap();
    let contact = Contact::from_descriptor(&descriptor, None).unwrap();
    ContactDirectory::upsert(running.storage().as_ref(), &contact)
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let mut incoming = bob.go_online(&cancel).await;
    running.spawn_workers();

    // Same data directory and destination as the running node
    let outcome = Node::send_once(config.clone(), &bob.address(), "from another shell", None)
        .await
        .unwrap();
    let id = match outcome {
        SendOutcome::Queued { id, .. } => id,
        other => panic!("expected hand-off, got {:?}", other),
    };

    let message = next_message(&mut incoming).await;
    assert_eq!(message.id, id);
    assert_eq!(message.text, "from another shell");
    assert_eq!(message.sender, running.identity().b32_address());

    let mut status = DeliveryStatus::Pending;
    for _ in 0..50 {
        status = running.queue().get(id).await.unwrap().unwrap().status;
        if status == DeliveryStatus::Delivered {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(status, DeliveryStatus::Delivered);

    // Unknown recipients are still rejected without a record
    let outcome = Node::send_once(config, "nobody.b32.i2p", "hi", None)
        .await
        .unwrap();
    assert!(matches!(outcome, SendOutcome::Failed { id: None, .. }));

    running.shutdown().await;
    cancel.cancel();
}
