use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RecordType};
use hickory_proto::serialize::binary::{BinEncodable, BinEncoder};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use stub_resolve_domain::{ResolveError, ResolverConfig};
use stub_resolve_transport::{ConnectionPool, ExchangeTable, PendingRequest, NO_RESPONSE_RCODE};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

fn config(pool_size: usize) -> ResolverConfig {
    ResolverConfig {
        pool_size,
        ..ResolverConfig::default()
    }
}

fn query_message(id: u16, name: &str, qtype: RecordType) -> Message {
    let mut query = Query::new();
    query.set_name(Name::from_str(name).unwrap());
    query.set_query_type(qtype);
    let mut message = Message::new(id, MessageType::Query, OpCode::Query);
    message.set_recursion_desired(true);
    message.add_query(query);
    message
}

fn encode(message: &Message) -> Vec<u8> {
    let mut buf = Vec::with_capacity(512);
    let mut encoder = BinEncoder::new(&mut buf);
    message.emit(&mut encoder).unwrap();
    buf
}

// Message only derefs immutably to its header, so the QR flip goes
// through an explicit header swap.
fn as_response(mut message: Message) -> Message {
    let mut header = *message.header();
    header.set_message_type(MessageType::Response);
    message.set_header(header);
    message
}

#[tokio::test]
async fn next_round_robins_across_sockets() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let pool = ConnectionPool::new(&config(3), tx).await.unwrap();

    let first: Vec<_> = (0..3).map(|_| pool.next().unwrap()).collect();
    let second: Vec<_> = (0..3).map(|_| pool.next().unwrap()).collect();

    // Each socket comes back exactly once per cycle, in the same order.
    for (a, b) in first.iter().zip(&second) {
        assert!(Arc::ptr_eq(a, b));
    }
    assert!(!Arc::ptr_eq(&first[0], &first[1]));
    assert!(!Arc::ptr_eq(&first[1], &first[2]));
    assert!(!Arc::ptr_eq(&first[0], &first[2]));

    pool.close();
}

#[tokio::test]
async fn closed_pool_refuses_all_traffic() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let pool = ConnectionPool::new(&config(2), tx).await.unwrap();

    pool.close();
    // A second close is a no-op.
    pool.close();

    assert!(pool.next().is_none());
    let query = query_message(1, "example.com.", RecordType::A);
    let err = pool
        .write_msg(&query, "127.0.0.1:53".parse().unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, ResolveError::NoConnectionAvailable));
}

#[tokio::test]
async fn pool_receives_echoed_response() {
    let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let listener_addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        let (len, from) = listener.recv_from(&mut buf).await.unwrap();
        let message = as_response(Message::from_vec(&buf[..len]).unwrap());
        listener.send_to(&encode(&message), from).await.unwrap();
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let pool = ConnectionPool::new(&config(2), tx).await.unwrap();

    let id = fastrand::u16(..);
    let query = query_message(id, "example.com.", RecordType::A);
    pool.write_msg(&query, listener_addr).await.unwrap();

    let envelope = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("no response within the query timeout")
        .expect("response queue closed");
    assert_eq!(envelope.message.id(), id);
    assert_eq!(envelope.source, listener_addr);

    pool.close();
}

#[tokio::test]
async fn read_loop_discards_malformed_datagrams() {
    let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let listener_addr = listener.local_addr().unwrap();

    // First reply is shorter than a DNS header, second decodes but has
    // no question section, third is a well-formed response.
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        let (_, from) = listener.recv_from(&mut buf).await.unwrap();
        listener.send_to(&[0u8; 3], from).await.unwrap();

        let (_, from) = listener.recv_from(&mut buf).await.unwrap();
        listener.send_to(&[0u8; 12], from).await.unwrap();

        let (len, from) = listener.recv_from(&mut buf).await.unwrap();
        let message = as_response(Message::from_vec(&buf[..len]).unwrap());
        listener.send_to(&encode(&message), from).await.unwrap();
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let pool = ConnectionPool::new(&config(1), tx).await.unwrap();

    let query = query_message(fastrand::u16(..), "junk.example.", RecordType::A);
    pool.write_msg(&query, listener_addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err(), "garbage must not be enqueued");

    let query = query_message(fastrand::u16(..), "empty.example.", RecordType::A);
    pool.write_msg(&query, listener_addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err(), "questionless reply must not be enqueued");

    // The same (sole) socket still reads: its loop survived the noise.
    let id = fastrand::u16(..);
    let query = query_message(id, "alive.example.", RecordType::A);
    pool.write_msg(&query, listener_addr).await.unwrap();
    let envelope = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("read loop died on malformed input")
        .expect("response queue closed");
    assert_eq!(envelope.message.id(), id);

    pool.close();
}

#[tokio::test]
async fn expiry_sweep_resolves_no_response() {
    let table = ExchangeTable::new(Duration::from_millis(10));

    let id = fastrand::u16(..);
    let (mut request, mut rx) = PendingRequest::new(
        id,
        "timeout.example",
        RecordType::A,
        query_message(id, "timeout.example.", RecordType::A),
    );
    request.timestamp = Some(Instant::now() - Duration::from_secs(1));
    table.add(request).unwrap();

    let expired = table.remove_expired();
    assert_eq!(expired.len(), 1);
    for request in expired {
        request.fail_no_response();
    }

    let message = rx.try_recv().unwrap();
    assert_eq!(u16::from(message.response_code()), NO_RESPONSE_RCODE);
    assert_eq!(message.id(), id);
}

#[tokio::test]
async fn shutdown_drain_unblocks_every_caller() {
    let table = ExchangeTable::default();
    let mut receivers = Vec::new();

    for id in 0..4u16 {
        let (request, rx) = PendingRequest::new(
            id,
            "shutdown.example",
            RecordType::A,
            query_message(id, "shutdown.example.", RecordType::A),
        );
        table.add(request).unwrap();
        receivers.push(rx);
    }

    for request in table.remove_all() {
        request.fail_no_response();
    }
    assert!(table.is_empty());

    for mut rx in receivers {
        let message = rx.try_recv().expect("caller left waiting after drain");
        assert_eq!(u16::from(message.response_code()), NO_RESPONSE_RCODE);
    }
}
