//! Integration Tests for the RelayMQ broker
//!
//! These tests start a real broker on a loopback listener, connect raw MQTT
//! clients over TCP and check the packet flows end to end.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use relaymq::broker::Broker;
use relaymq::codec::{Decoder, Encoder};
use relaymq::config::{AuthConfig, Config, UserConfig};
use relaymq::protocol::{
    ConnAck, Connect, ConnectReturnCode, Packet, ProtocolVersion, PubAck, PubComp, PubRec,
    PubRel, Publish, QoS, SubAck, SubAckReturnCode, Subscribe, Subscription, UnsubAck,
    Unsubscribe, Will,
};

fn test_config() -> Config {
    let mut config = Config::default();
    config.server.connect_timeout = Duration::from_secs(2);
    config.limits.max_connections = 100;
    config
}

async fn start_broker(config: Config) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let broker = Broker::new(config).await.expect("broker");
    let handle = tokio::spawn(async move {
        let _ = broker.serve(listener).await;
    });
    (addr, handle)
}

/// Helper struct for MQTT client operations in tests
struct TestClient {
    stream: TcpStream,
    encoder: Encoder,
    decoder: Decoder,
    read_buf: BytesMut,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("Failed to connect");
        Self {
            stream,
            encoder: Encoder::new(),
            decoder: Decoder::new(),
            read_buf: BytesMut::with_capacity(4096),
        }
    }

    async fn send(&mut self, packet: &Packet) {
        let mut buf = BytesMut::new();
        self.encoder
            .encode(packet, &mut buf)
            .expect("Failed to encode");
        self.stream.write_all(&buf).await.expect("Failed to write");
    }

    async fn send_raw(&mut self, data: &[u8]) {
        self.stream.write_all(data).await.expect("Failed to write");
    }

    /// Next packet from the broker, or `None` if nothing arrives in time
    async fn recv_within(&mut self, wait: Duration) -> Option<Packet> {
        loop {
            if let Ok(Some((packet, consumed))) = self.decoder.decode(&self.read_buf) {
                let _ = self.read_buf.split_to(consumed);
                return Some(packet);
            }
            match timeout(wait, self.stream.read_buf(&mut self.read_buf)).await {
                Ok(Ok(n)) if n > 0 => continue,
                _ => return None,
            }
        }
    }

    async fn recv(&mut self) -> Option<Packet> {
        self.recv_within(Duration::from_secs(5)).await
    }

    async fn expect_publish(&mut self) -> Publish {
        match self.recv().await {
            Some(Packet::Publish(publish)) => publish,
            other => panic!("Expected PUBLISH, got {:?}", other),
        }
    }

    async fn expect_disconnect(&mut self, wait: Duration) -> bool {
        let mut buf = [0u8; 64];
        loop {
            match timeout(wait, self.stream.read(&mut buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) => return true,
                // Drain anything queued before the close
                Ok(Ok(_)) => continue,
                Err(_) => return false,
            }
        }
    }

    async fn mqtt_connect_with(&mut self, connect: Connect) -> ConnAck {
        self.send(&Packet::Connect(Box::new(connect))).await;
        match self.recv().await {
            Some(Packet::ConnAck(ack)) => ack,
            other => panic!("Expected CONNACK, got {:?}", other),
        }
    }

    async fn mqtt_connect(&mut self, client_id: &str, clean_session: bool) -> ConnAck {
        self.mqtt_connect_with(Connect {
            client_id: client_id.to_string(),
            clean_session,
            ..Default::default()
        })
        .await
    }

    async fn subscribe(&mut self, packet_id: u16, filter: &str, qos: QoS) -> SubAck {
        self.send(&Packet::Subscribe(Subscribe {
            packet_id,
            subscriptions: vec![Subscription {
                filter: filter.to_string(),
                qos,
            }],
        }))
        .await;

        match self.recv().await {
            Some(Packet::SubAck(ack)) => ack,
            other => panic!("Expected SUBACK, got {:?}", other),
        }
    }

    async fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS, retain: bool) {
        let packet_id = (qos != QoS::AtMostOnce).then_some(1);
        self.send(&Packet::Publish(Publish {
            dup: false,
            qos,
            retain,
            topic: topic.into(),
            packet_id,
            payload: Bytes::copy_from_slice(payload),
        }))
        .await;
    }
}

// ============================================================================
// CONNECT/CONNACK
// ============================================================================

#[tokio::test]
async fn test_connect_v311_success() {
    let (addr, broker) = start_broker(test_config()).await;

    let mut client = TestClient::connect(addr).await;
    let connack = client.mqtt_connect("test-client", true).await;
    assert_eq!(connack.return_code, ConnectReturnCode::Accepted);
    assert!(!connack.session_present);

    broker.abort();
}

#[tokio::test]
async fn test_connect_v31_success() {
    let (addr, broker) = start_broker(test_config()).await;

    let mut client = TestClient::connect(addr).await;
    let connack = client
        .mqtt_connect_with(Connect {
            protocol_version: ProtocolVersion::V31,
            client_id: "legacy".to_string(),
            ..Default::default()
        })
        .await;
    assert_eq!(connack.return_code, ConnectReturnCode::Accepted);

    broker.abort();
}

#[tokio::test]
async fn test_connect_empty_client_id_generated() {
    let (addr, broker) = start_broker(test_config()).await;

    let mut client = TestClient::connect(addr).await;
    let connack = client.mqtt_connect("", true).await;
    assert_eq!(connack.return_code, ConnectReturnCode::Accepted);

    broker.abort();
}

#[tokio::test]
async fn test_connect_empty_client_id_persistent_rejected() {
    let (addr, broker) = start_broker(test_config()).await;

    let mut client = TestClient::connect(addr).await;
    let connack = client.mqtt_connect("", false).await;
    assert_eq!(connack.return_code, ConnectReturnCode::IdentifierRejected);
    assert!(client.expect_disconnect(Duration::from_secs(2)).await);

    broker.abort();
}

#[tokio::test]
async fn test_unsupported_protocol_level_refused() {
    let (addr, broker) = start_broker(test_config()).await;

    let mut client = TestClient::connect(addr).await;
    client
        .send_raw(&[
            0x10, 0x0D, // CONNECT, remaining length
            0x00, 0x04, b'M', b'Q', b'T', b'T', // Protocol name
            0x05, // Protocol level 5
            0x02, // Clean session
            0x00, 0x3C, // Keep alive 60
            0x00, 0x01, b'a', // Client ID "a"
        ])
        .await;

    match client.recv().await {
        Some(Packet::ConnAck(ack)) => {
            assert_eq!(
                ack.return_code,
                ConnectReturnCode::UnacceptableProtocolVersion
            );
        }
        other => panic!("Expected CONNACK, got {:?}", other),
    }
    assert!(client.expect_disconnect(Duration::from_secs(2)).await);

    broker.abort();
}

#[tokio::test]
async fn test_first_packet_must_be_connect() {
    let (addr, broker) = start_broker(test_config()).await;

    let mut client = TestClient::connect(addr).await;
    client.send(&Packet::PingReq).await;
    assert!(client.expect_disconnect(Duration::from_secs(2)).await);

    broker.abort();
}

#[tokio::test]
async fn test_bad_credentials_refused() {
    let mut config = test_config();
    config.auth = AuthConfig {
        enabled: true,
        allow_anonymous: false,
        users: vec![UserConfig {
            username: "gateway".to_string(),
            password: Some("s3cret".to_string()),
            password_hash: None,
        }],
    };
    let (addr, broker) = start_broker(config).await;

    let mut rejected = TestClient::connect(addr).await;
    let connack = rejected
        .mqtt_connect_with(Connect {
            client_id: "gw-1".to_string(),
            username: Some("gateway".to_string()),
            password: Some(Bytes::from_static(b"wrong")),
            ..Default::default()
        })
        .await;
    assert_eq!(connack.return_code, ConnectReturnCode::BadUserNameOrPassword);

    let mut accepted = TestClient::connect(addr).await;
    let connack = accepted
        .mqtt_connect_with(Connect {
            client_id: "gw-1".to_string(),
            username: Some("gateway".to_string()),
            password: Some(Bytes::from_static(b"s3cret")),
            ..Default::default()
        })
        .await;
    assert_eq!(connack.return_code, ConnectReturnCode::Accepted);

    broker.abort();
}

#[tokio::test]
async fn test_takeover_closes_previous_connection() {
    let (addr, broker) = start_broker(test_config()).await;

    let mut first = TestClient::connect(addr).await;
    first.mqtt_connect("duplicate-id", true).await;

    let mut second = TestClient::connect(addr).await;
    let connack = second.mqtt_connect("duplicate-id", true).await;
    assert_eq!(connack.return_code, ConnectReturnCode::Accepted);

    assert!(first.expect_disconnect(Duration::from_secs(2)).await);

    broker.abort();
}

// ============================================================================
// PUBLISH / SUBSCRIBE
// ============================================================================

#[tokio::test]
async fn test_publish_qos0_flow() {
    let (addr, broker) = start_broker(test_config()).await;

    let mut subscriber = TestClient::connect(addr).await;
    subscriber.mqtt_connect("subscriber", true).await;
    let suback = subscriber.subscribe(1, "test/topic", QoS::AtMostOnce).await;
    assert_eq!(
        suback.return_codes,
        vec![SubAckReturnCode::Granted(QoS::AtMostOnce)]
    );

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("publisher", true).await;
    publisher
        .publish("test/topic", b"hello", QoS::AtMostOnce, false)
        .await;

    let publish = subscriber.expect_publish().await;
    assert_eq!(publish.topic.as_ref(), "test/topic");
    assert_eq!(&publish.payload[..], b"hello");
    assert_eq!(publish.qos, QoS::AtMostOnce);
    assert_eq!(publish.packet_id, None);

    // No acknowledgment for QoS 0
    assert!(publisher
        .recv_within(Duration::from_millis(200))
        .await
        .is_none());

    broker.abort();
}

#[tokio::test]
async fn test_publish_qos1_downgraded_to_subscription() {
    let (addr, broker) = start_broker(test_config()).await;

    let mut subscriber = TestClient::connect(addr).await;
    subscriber.mqtt_connect("dev-B", true).await;
    subscriber
        .subscribe(1, "sensors/+/temp", QoS::AtMostOnce)
        .await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("dev-A", true).await;
    publisher
        .publish("sensors/kitchen/temp", b"21.5", QoS::AtLeastOnce, false)
        .await;

    assert_eq!(
        publisher.recv().await,
        Some(Packet::PubAck(PubAck::new(1)))
    );

    let publish = subscriber.expect_publish().await;
    assert_eq!(publish.qos, QoS::AtMostOnce);
    assert_eq!(publish.packet_id, None);
    assert!(!publish.retain);
    assert!(!publish.dup);

    broker.abort();
}

#[tokio::test]
async fn test_publish_qos2_flow() {
    let (addr, broker) = start_broker(test_config()).await;

    let mut subscriber = TestClient::connect(addr).await;
    subscriber.mqtt_connect("qos2-sub", true).await;
    subscriber.subscribe(1, "cmd/#", QoS::ExactlyOnce).await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("qos2-pub", true).await;
    publisher
        .publish("cmd/reboot", b"now", QoS::ExactlyOnce, false)
        .await;

    // Publisher side: PUBREC, then PUBREL -> PUBCOMP
    assert_eq!(
        publisher.recv().await,
        Some(Packet::PubRec(PubRec::new(1)))
    );
    publisher.send(&Packet::PubRel(PubRel::new(1))).await;
    assert_eq!(
        publisher.recv().await,
        Some(Packet::PubComp(PubComp::new(1)))
    );

    // Subscriber side: PUBLISH, PUBREC -> PUBREL, PUBCOMP
    let publish = subscriber.expect_publish().await;
    assert_eq!(publish.qos, QoS::ExactlyOnce);
    let packet_id = publish.packet_id.expect("QoS 2 delivery carries a packet id");
    assert_ne!(packet_id, 0);

    subscriber.send(&Packet::PubRec(PubRec::new(packet_id))).await;
    assert_eq!(
        subscriber.recv().await,
        Some(Packet::PubRel(PubRel::new(packet_id)))
    );
    subscriber
        .send(&Packet::PubComp(PubComp::new(packet_id)))
        .await;

    broker.abort();
}

#[tokio::test]
async fn test_overlapping_filters_deliver_per_filter() {
    let (addr, broker) = start_broker(test_config()).await;

    let mut subscriber = TestClient::connect(addr).await;
    subscriber.mqtt_connect("overlap", true).await;
    subscriber.subscribe(1, "home/#", QoS::AtMostOnce).await;
    subscriber.subscribe(2, "home/+/light", QoS::AtMostOnce).await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("overlap-pub", true).await;
    publisher
        .publish("home/hall/light", b"on", QoS::AtMostOnce, false)
        .await;

    subscriber.expect_publish().await;
    subscriber.expect_publish().await;

    broker.abort();
}

#[tokio::test]
async fn test_invalid_filter_gets_failure_code() {
    let (addr, broker) = start_broker(test_config()).await;

    let mut client = TestClient::connect(addr).await;
    client.mqtt_connect("bad-filter", true).await;
    client
        .send(&Packet::Subscribe(Subscribe {
            packet_id: 7,
            subscriptions: vec![
                Subscription {
                    filter: "a/#/b".to_string(),
                    qos: QoS::AtLeastOnce,
                },
                Subscription {
                    filter: "a/b".to_string(),
                    qos: QoS::AtLeastOnce,
                },
            ],
        }))
        .await;

    match client.recv().await {
        Some(Packet::SubAck(ack)) => {
            assert_eq!(ack.packet_id, 7);
            assert_eq!(
                ack.return_codes,
                vec![
                    SubAckReturnCode::Failure,
                    SubAckReturnCode::Granted(QoS::AtLeastOnce)
                ]
            );
        }
        other => panic!("Expected SUBACK, got {:?}", other),
    }

    broker.abort();
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let (addr, broker) = start_broker(test_config()).await;

    let mut subscriber = TestClient::connect(addr).await;
    subscriber.mqtt_connect("unsub", true).await;
    subscriber.subscribe(1, "news", QoS::AtMostOnce).await;
    subscriber
        .send(&Packet::Unsubscribe(Unsubscribe {
            packet_id: 2,
            filters: vec!["news".to_string()],
        }))
        .await;
    assert_eq!(
        subscriber.recv().await,
        Some(Packet::UnsubAck(UnsubAck { packet_id: 2 }))
    );

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("unsub-pub", true).await;
    publisher.publish("news", b"x", QoS::AtMostOnce, false).await;

    assert!(subscriber
        .recv_within(Duration::from_millis(300))
        .await
        .is_none());

    broker.abort();
}

#[tokio::test]
async fn test_ping_pong() {
    let (addr, broker) = start_broker(test_config()).await;

    let mut client = TestClient::connect(addr).await;
    client.mqtt_connect("pinger", true).await;
    client.send(&Packet::PingReq).await;
    assert_eq!(client.recv().await, Some(Packet::PingResp));

    broker.abort();
}

#[tokio::test]
async fn test_publish_above_max_qos_closes_connection() {
    let mut config = test_config();
    config.mqtt.max_qos = 1;
    let (addr, broker) = start_broker(config).await;

    let mut client = TestClient::connect(addr).await;
    client.mqtt_connect("limited", true).await;
    let suback = client.subscribe(1, "x", QoS::ExactlyOnce).await;
    assert_eq!(
        suback.return_codes,
        vec![SubAckReturnCode::Granted(QoS::AtLeastOnce)]
    );

    client.publish("x", b"too much", QoS::ExactlyOnce, false).await;
    assert!(client.expect_disconnect(Duration::from_secs(2)).await);

    broker.abort();
}

// ============================================================================
// Retained messages
// ============================================================================

#[tokio::test]
async fn test_retained_message_replayed_on_subscribe() {
    let (addr, broker) = start_broker(test_config()).await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("retain-pub", true).await;
    publisher
        .publish("status/door", b"closed", QoS::AtLeastOnce, true)
        .await;
    assert_eq!(
        publisher.recv().await,
        Some(Packet::PubAck(PubAck::new(1)))
    );

    let mut subscriber = TestClient::connect(addr).await;
    subscriber.mqtt_connect("retain-sub", true).await;
    subscriber.subscribe(1, "status/+", QoS::AtMostOnce).await;

    let publish = subscriber.expect_publish().await;
    assert_eq!(publish.topic.as_ref(), "status/door");
    assert_eq!(&publish.payload[..], b"closed");
    assert!(publish.retain);
    assert_eq!(publish.qos, QoS::AtMostOnce);

    broker.abort();
}

#[tokio::test]
async fn test_empty_retained_payload_clears_topic() {
    let (addr, broker) = start_broker(test_config()).await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("clear-pub", true).await;
    publisher
        .publish("status/window", b"open", QoS::AtLeastOnce, true)
        .await;
    publisher.recv().await;
    publisher
        .publish("status/window", b"", QoS::AtLeastOnce, true)
        .await;
    publisher.recv().await;

    let mut subscriber = TestClient::connect(addr).await;
    subscriber.mqtt_connect("clear-sub", true).await;
    subscriber.subscribe(1, "status/#", QoS::AtLeastOnce).await;

    assert!(subscriber
        .recv_within(Duration::from_millis(300))
        .await
        .is_none());

    broker.abort();
}

// ============================================================================
// Will messages
// ============================================================================

fn connect_with_will(client_id: &str) -> Connect {
    Connect {
        client_id: client_id.to_string(),
        will: Some(Will {
            topic: format!("lwt/{}", client_id),
            payload: Bytes::from_static(b"offline"),
            qos: QoS::AtMostOnce,
            retain: false,
        }),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_will_published_on_abnormal_close() {
    let (addr, broker) = start_broker(test_config()).await;

    let mut watcher = TestClient::connect(addr).await;
    watcher.mqtt_connect("watcher", true).await;
    watcher.subscribe(1, "lwt/#", QoS::AtMostOnce).await;

    let mut device = TestClient::connect(addr).await;
    device.mqtt_connect_with(connect_with_will("dev-W")).await;
    drop(device);

    let publish = watcher.expect_publish().await;
    assert_eq!(publish.topic.as_ref(), "lwt/dev-W");
    assert_eq!(&publish.payload[..], b"offline");

    broker.abort();
}

#[tokio::test]
async fn test_will_discarded_on_disconnect() {
    let (addr, broker) = start_broker(test_config()).await;

    let mut watcher = TestClient::connect(addr).await;
    watcher.mqtt_connect("watcher-2", true).await;
    watcher.subscribe(1, "lwt/#", QoS::AtMostOnce).await;

    let mut device = TestClient::connect(addr).await;
    device.mqtt_connect_with(connect_with_will("dev-G")).await;
    device.send(&Packet::Disconnect).await;
    assert!(device.expect_disconnect(Duration::from_secs(2)).await);

    assert!(watcher
        .recv_within(Duration::from_millis(300))
        .await
        .is_none());

    broker.abort();
}

// ============================================================================
// Sessions
// ============================================================================

#[tokio::test]
async fn test_persistent_session_keeps_subscriptions() {
    let (addr, broker) = start_broker(test_config()).await;

    let mut client = TestClient::connect(addr).await;
    let connack = client.mqtt_connect("persistent", false).await;
    assert!(!connack.session_present);
    client.subscribe(1, "jobs/#", QoS::AtMostOnce).await;
    client.send(&Packet::Disconnect).await;
    assert!(client.expect_disconnect(Duration::from_secs(2)).await);

    let mut client = TestClient::connect(addr).await;
    let connack = client.mqtt_connect("persistent", false).await;
    assert!(connack.session_present);

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("jobs-pub", true).await;
    publisher.publish("jobs/1", b"run", QoS::AtMostOnce, false).await;

    let publish = client.expect_publish().await;
    assert_eq!(publish.topic.as_ref(), "jobs/1");

    broker.abort();
}

#[tokio::test]
async fn test_clean_session_discards_subscriptions() {
    let (addr, broker) = start_broker(test_config()).await;

    let mut client = TestClient::connect(addr).await;
    client.mqtt_connect("transient", false).await;
    client.subscribe(1, "jobs/#", QoS::AtMostOnce).await;
    client.send(&Packet::Disconnect).await;
    assert!(client.expect_disconnect(Duration::from_secs(2)).await);

    let mut client = TestClient::connect(addr).await;
    let connack = client.mqtt_connect("transient", true).await;
    assert!(!connack.session_present);

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("transient-pub", true).await;
    publisher.publish("jobs/2", b"run", QoS::AtMostOnce, false).await;

    assert!(client
        .recv_within(Duration::from_millis(300))
        .await
        .is_none());

    broker.abort();
}

#[tokio::test]
async fn test_unacknowledged_delivery_resent_on_reconnect() {
    let (addr, broker) = start_broker(test_config()).await;

    let mut subscriber = TestClient::connect(addr).await;
    subscriber.mqtt_connect("slow-sub", false).await;
    subscriber.subscribe(1, "orders", QoS::AtLeastOnce).await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("orders-pub", true).await;
    publisher
        .publish("orders", b"order-42", QoS::AtLeastOnce, false)
        .await;

    let first = subscriber.expect_publish().await;
    assert_eq!(first.qos, QoS::AtLeastOnce);
    assert!(!first.dup);
    let first_id = first.packet_id.expect("packet id");

    // Leave without acknowledging
    subscriber.send(&Packet::Disconnect).await;
    assert!(subscriber.expect_disconnect(Duration::from_secs(2)).await);

    let mut subscriber = TestClient::connect(addr).await;
    let connack = subscriber.mqtt_connect("slow-sub", false).await;
    assert!(connack.session_present);

    let resent = subscriber.expect_publish().await;
    assert!(resent.dup);
    assert_eq!(resent.qos, QoS::AtLeastOnce);
    assert_eq!(&resent.payload[..], b"order-42");
    let resent_id = resent.packet_id.expect("packet id");
    assert_ne!(resent_id, first_id);

    subscriber.send(&Packet::PubAck(PubAck::new(resent_id))).await;

    broker.abort();
}

// ============================================================================
// Cluster relay
// ============================================================================

/// Loopback address with a port that was free a moment ago
fn free_local_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("local addr")
}

async fn start_cluster_node(
    node_id: &str,
    relay_addr: SocketAddr,
    peer: SocketAddr,
) -> (SocketAddr, Arc<Broker>) {
    let mut config = test_config();
    config.cluster.enabled = true;
    config.cluster.node_id = Some(node_id.to_string());
    config.cluster.peer_addr = Some(relay_addr);
    config.cluster.peers = vec![peer.to_string()];

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let broker = Arc::new(Broker::new(config).await.expect("broker"));
    let serving = broker.clone();
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });
    (addr, broker)
}

async fn wait_for_peers(nodes: &[&Arc<Broker>]) {
    let linked = async {
        while nodes.iter().any(|node| node.connected_peer_count() == 0) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    };
    timeout(Duration::from_secs(10), linked)
        .await
        .expect("cluster peers never connected");
}

#[tokio::test]
async fn test_cluster_publish_reaches_remote_subscriber_once() {
    let relay_a = free_local_addr();
    let relay_b = free_local_addr();
    let (addr_a, node_a) = start_cluster_node("node-a", relay_a, relay_b).await;
    let (addr_b, node_b) = start_cluster_node("node-b", relay_b, relay_a).await;
    wait_for_peers(&[&node_a, &node_b]).await;

    let mut remote = TestClient::connect(addr_b).await;
    remote.mqtt_connect("remote-sub", true).await;
    remote.subscribe(1, "plant/#", QoS::AtLeastOnce).await;

    let mut local = TestClient::connect(addr_a).await;
    local.mqtt_connect("local-sub", true).await;
    local.subscribe(1, "plant/#", QoS::AtMostOnce).await;

    let mut publisher = TestClient::connect(addr_a).await;
    publisher.mqtt_connect("boiler", true).await;
    publisher
        .publish("plant/boiler", b"90C", QoS::AtLeastOnce, true)
        .await;
    match publisher.recv().await {
        Some(Packet::PubAck(ack)) => assert_eq!(ack.packet_id, 1),
        other => panic!("Expected PUBACK, got {:?}", other),
    }

    let relayed = remote.expect_publish().await;
    assert_eq!(&*relayed.topic, "plant/boiler");
    assert_eq!(&relayed.payload[..], b"90C");
    assert_eq!(relayed.qos, QoS::AtLeastOnce);
    assert!(!relayed.retain);
    assert!(!relayed.dup);
    assert!(relayed.packet_id.is_some());

    let delivered = local.expect_publish().await;
    assert_eq!(delivered.qos, QoS::AtMostOnce);
    assert!(!delivered.retain);

    // node-b must not send the message back to node-a
    assert!(local.recv_within(Duration::from_millis(500)).await.is_none());
    assert!(remote.recv_within(Duration::from_millis(200)).await.is_none());

    // Only the ingesting node keeps the retained copy
    assert_eq!(node_a.retained_count(), 1);
    assert_eq!(node_b.retained_count(), 0);

    node_a.shutdown().await;
    node_b.shutdown().await;
}
