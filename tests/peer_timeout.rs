use std::{
    net::SocketAddr,
    time::Duration,
};

use reliable_transport::{
    connection::Event,
    Config,
    Connection,
};

/// A client that connects and then falls silent should be dropped by the
/// server once its idle timer crosses `peer_timeout`, with `timed_out: true`
/// on the `PeerRemoved` event.
#[tokio::test]
async fn idle_peer_is_removed_after_timeout() {
    let _ = env_logger::try_init();

    let protocol_id = 0x2000_0001;
    let config = Config {
        peer_timeout: Duration::from_millis(150),
        ..Config::new(protocol_id)
    };

    let mut server = Connection::new(config, false, None);
    server.serve(30600);
    tokio::time::sleep(Duration::from_millis(30)).await;

    let client = Connection::new(Config::new(protocol_id), false, None);
    let server_addr: SocketAddr = ([127, 0, 0, 1], 30600).into();
    client.connect(server_addr);

    let mut saw_added = false;
    let mut saw_removed_timed_out = false;
    let deadline = Duration::from_secs(3);

    let outcome = tokio::time::timeout(deadline, async {
        loop {
            match server.receive().await.unwrap() {
                Event::PeerAdded { .. } => saw_added = true,
                Event::PeerRemoved { timed_out, .. } => {
                    saw_removed_timed_out = timed_out;
                    break;
                },
                _ => {},
            }
        }
    })
    .await;

    assert!(outcome.is_ok(), "peer removal event did not arrive in time");
    assert!(saw_added);
    assert!(saw_removed_timed_out);

    // keep the client connection alive for the duration of the test
    drop(client);
}
