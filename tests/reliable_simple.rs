use std::{
    net::SocketAddr,
    time::Duration,
};

use reliable_transport::{
    connection::Event,
    Config,
    Connection,
};

/// Drains events until a non-empty `DataReceived` arrives, ignoring
/// `PeerAdded` and the empty handshake payload along the way.
async fn recv_payload(conn: &mut Connection) -> Vec<u8> {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), conn.receive())
            .await
            .expect("event within timeout")
            .expect("connection alive")
        {
            Event::DataReceived { bytes, .. } if !bytes.is_empty() => return bytes,
            _ => continue,
        }
    }
}

#[tokio::test]
async fn tiny_reliable_echo() {
    let _ = env_logger::try_init();

    let protocol_id = 0x1000_0001;
    let mut server = Connection::new(Config::new(protocol_id), false, None);
    server.serve(30500);
    tokio::time::sleep(Duration::from_millis(30)).await;

    let mut client = Connection::new(Config::new(protocol_id), false, None);
    let server_addr: SocketAddr = ([127, 0, 0, 1], 30500).into();
    client.connect(server_addr);
    tokio::time::sleep(Duration::from_millis(30)).await;

    client
        .send(reliable_transport::PEER_ID_SERVER, 0, vec![0x41, 0x42], true)
        .expect("client knows its server peer");

    let payload = recv_payload(&mut server).await;
    assert_eq!(payload, vec![0x41, 0x42]);
}

#[tokio::test]
async fn fragmented_payload_reassembles() {
    let _ = env_logger::try_init();

    let protocol_id = 0x1000_0002;
    let mut server = Connection::new(Config::new(protocol_id), false, None);
    server.serve(30501);
    tokio::time::sleep(Duration::from_millis(30)).await;

    let mut client = Connection::new(Config::new(protocol_id), false, None);
    let server_addr: SocketAddr = ([127, 0, 0, 1], 30501).into();
    client.connect(server_addr);
    tokio::time::sleep(Duration::from_millis(30)).await;

    let payload: Vec<u8> = (0 .. 2000u32).map(|i| (i % 251) as u8).collect();
    client
        .send(reliable_transport::PEER_ID_SERVER, 1, payload.clone(), true)
        .unwrap();

    let received = recv_payload(&mut server).await;
    assert_eq!(received, payload);
}

#[tokio::test]
async fn unreliable_message_delivered() {
    let _ = env_logger::try_init();

    let protocol_id = 0x1000_0003;
    let mut server = Connection::new(Config::new(protocol_id), false, None);
    server.serve(30502);
    tokio::time::sleep(Duration::from_millis(30)).await;

    let mut client = Connection::new(Config::new(protocol_id), false, None);
    let server_addr: SocketAddr = ([127, 0, 0, 1], 30502).into();
    client.connect(server_addr);
    tokio::time::sleep(Duration::from_millis(30)).await;

    client
        .send(reliable_transport::PEER_ID_SERVER, 2, b"ping".to_vec(), false)
        .unwrap();

    let payload = recv_payload(&mut server).await;
    assert_eq!(payload, b"ping");
}
