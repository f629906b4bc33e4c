use std::{
    net::{SocketAddr, UdpSocket},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
        Mutex,
    },
    thread,
    time::Duration,
};

use reliable_transport::{connection::Event, Config, Connection, PEER_ID_SERVER};

/// Forwards datagrams between `server_addr` and whichever other address it
/// first sees traffic from (the client's ephemeral port, unknown ahead of
/// bind time), dropping the first datagram it sees travelling client ->
/// server for which `drop_first` is still armed. A plain
/// `std::net::UdpSocket` + `std::thread::spawn` proxy, not an async task,
/// since it needs to run independently of either `Connection`'s own
/// background workers.
fn spawn_drop_once_proxy(proxy_port: u16, server_addr: SocketAddr, drop_first: Arc<AtomicUsize>) {
    let socket = UdpSocket::bind(("127.0.0.1", proxy_port)).unwrap();
    let client_addr: Arc<Mutex<Option<SocketAddr>>> = Arc::new(Mutex::new(None));
    thread::spawn(move || {
        let mut buf = [0u8; 65535];
        while let Ok((len, from)) = socket.recv_from(&mut buf) {
            let to = if from == server_addr {
                match *client_addr.lock().unwrap() {
                    Some(addr) => addr,
                    None => continue,
                }
            } else {
                *client_addr.lock().unwrap() = Some(from);
                if drop_first.load(Ordering::SeqCst) > 0 {
                    drop_first.fetch_sub(1, Ordering::SeqCst);
                    continue;
                }
                server_addr
            };
            let _ = socket.send_to(&buf[.. len], to);
        }
    });
}

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

/// Exercises spec scenario 5 (loss-driven retransmit and RTT inflation): a
/// reliable frame's first transmission is dropped in flight, the frame must
/// still arrive via resend, and the forced retransmit must feed
/// `resend_timeout` back into `avg_rtt` (`peer.rs`'s `report_rtt` call on a
/// collected timeout, `connection.rs:404`), pushing it above the client's
/// starting `RESEND_TIMEOUT_MIN` floor.
#[tokio::test]
async fn dropped_reliable_frame_is_retransmitted_and_inflates_rtt() {
    let _ = env_logger::try_init();

    let protocol_id = 0x2000_0001;
    let server_port = 30600;
    let proxy_port = 30601;

    let mut server = Connection::new(Config::new(protocol_id), false, None);
    server.serve(server_port);
    tokio::time::sleep(Duration::from_millis(30)).await;

    let server_addr: SocketAddr = ([127, 0, 0, 1], server_port).into();
    let proxy_addr: SocketAddr = ([127, 0, 0, 1], proxy_port).into();

    let drop_first = Arc::new(AtomicUsize::new(0));
    spawn_drop_once_proxy(proxy_port, server_addr, drop_first.clone());

    let mut client = Connection::new(Config::new(protocol_id), false, None);
    client.connect(proxy_addr);
    tokio::time::sleep(Duration::from_millis(30)).await;

    // Let the handshake complete through the proxy before arming the drop,
    // so only the payload frame (not SET_PEER_ID) is lost.
    client
        .send(PEER_ID_SERVER, 0, b"warmup".to_vec(), false)
        .expect("client knows its server peer");
    let _ = recv_payload(&mut server).await;

    drop_first.store(1, Ordering::SeqCst);
    client
        .send(PEER_ID_SERVER, 0, b"after-drop".to_vec(), true)
        .expect("client still knows its server peer");

    let received = recv_payload(&mut server).await;
    assert_eq!(received, b"after-drop");

    let rtt = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(rtt) = client.peer_avg_rtt(PEER_ID_SERVER) {
                return rtt;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("an RTT sample was recorded after the forced retransmit");

    assert!(
        rtt >= reliable_transport::RESEND_TIMEOUT_MIN,
        "expected the forced-retransmit RTT sample to be at least the resend \
         timeout that produced it, got {rtt:?}"
    );
}
