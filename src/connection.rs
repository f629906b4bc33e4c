//! Connection and worker loops (`spec.md` §4.6, §6): owns the socket, the
//! peer table, the command inbox and event outbox, and runs the cooperating
//! sender/receiver background workers.

use std::{
    collections::{
        HashMap,
        VecDeque,
    },
    net::SocketAddr,
    sync::{
        atomic::{
            AtomicBool,
            AtomicU16,
            Ordering,
        },
        Arc,
        Mutex,
    },
    time::Duration,
};

use tokio::{
    net::UdpSocket,
    sync::{
        mpsc,
        watch,
        Notify,
    },
    task::JoinHandle,
    time::Instant,
};

use crate::{
    codec::{
        BaseHeader,
        ControlType,
        Frame,
    },
    config::Config,
    peer::Peer,
    reliable::BufferedFrame,
    ChannelNum,
    Error,
    PeerId,
    Sequence,
    CHANNEL_COUNT,
    CONGESTION_SAMPLE_INTERVAL,
    PEER_ID_FIRST_ASSIGNED,
    PEER_ID_INEXISTENT,
    PEER_ID_SERVER,
    THROUGHPUT_SAMPLE_INTERVAL,
};

const SENDER_WAIT: Duration = Duration::from_millis(50);
const RECEIVER_SOCKET_TIMEOUT: Duration = Duration::from_millis(5);
const MAX_DATAGRAM_SIZE: usize = 65535;

/// Commands the public API enqueues for the sender worker to act on.
pub enum Command {
    Serve { port: u16 },
    Connect { addr: SocketAddr },
    Disconnect,
    Send {
        peer_id: PeerId,
        channel: ChannelNum,
        bytes: Vec<u8>,
        reliable: bool,
    },
    SendToAll {
        channel: ChannelNum,
        bytes: Vec<u8>,
        reliable: bool,
    },
    SendAck {
        peer_id: PeerId,
        channel: ChannelNum,
        seqnum: Sequence,
    },
    DeletePeer {
        peer_id: PeerId,
    },
}

/// Events the workers produce for the public API to consume.
#[derive(Debug, Clone)]
pub enum Event {
    DataReceived { peer_id: PeerId, bytes: Vec<u8> },
    PeerAdded { peer_id: PeerId, address: SocketAddr },
    PeerRemoved {
        peer_id: PeerId,
        timed_out: bool,
        address: SocketAddr,
    },
    BindFailed,
}

/// Optional observer notified inline as `Connection::receive` drains
/// `PeerAdded`/`PeerRemoved` events, mirroring the constructor's optional
/// handler argument (`spec.md` §6 `Construct`).
pub trait PeerHandler: Send + Sync {
    fn peer_added(&self, _peer_id: PeerId, _address: SocketAddr) {}
    fn peer_removed(&self, _peer_id: PeerId, _timed_out: bool, _address: SocketAddr) {}
}

struct PeerTable {
    peers: Mutex<HashMap<PeerId, Arc<Peer>>>,
}

impl PeerTable {
    fn new() -> Self {
        PeerTable {
            peers: Mutex::new(HashMap::new()),
        }
    }

    fn insert(&self, peer: Arc<Peer>) {
        self.peers.lock().unwrap().insert(peer.id(), peer);
    }

    fn get(&self, id: PeerId) -> Option<Arc<Peer>> {
        self.peers.lock().unwrap().get(&id).cloned()
    }

    fn remove(&self, id: PeerId) -> Option<Arc<Peer>> {
        self.peers.lock().unwrap().remove(&id)
    }

    fn values(&self) -> Vec<Arc<Peer>> {
        self.peers.lock().unwrap().values().cloned().collect()
    }

    fn next_free_id(&self) -> Option<PeerId> {
        let peers = self.peers.lock().unwrap();
        (PEER_ID_FIRST_ASSIGNED ..= PeerId::MAX).find(|id| !peers.contains_key(id))
    }
}

struct OutgoingUnreliable {
    peer_id: PeerId,
    addr: SocketAddr,
    bytes: Vec<u8>,
    bypass_pacing: bool,
}

/// Reliable, ordered, channel-multiplexed connection over a UDP socket. The
/// externally visible object: construction spawns the sender and receiver
/// workers immediately, before any socket is bound.
pub struct Connection {
    own_id: Arc<AtomicU16>,
    peers: Arc<PeerTable>,
    config: Arc<Config>,
    command_tx: mpsc::UnboundedSender<Command>,
    event_rx: mpsc::UnboundedReceiver<Event>,
    notify: Arc<Notify>,
    handler: Option<Arc<dyn PeerHandler>>,
    stop: Arc<AtomicBool>,
    sender_task: JoinHandle<()>,
    receiver_task: JoinHandle<()>,
}

impl Connection {
    pub fn new(config: Config, ipv6: bool, handler: Option<Arc<dyn PeerHandler>>) -> Self {
        let own_id = Arc::new(AtomicU16::new(PEER_ID_INEXISTENT));
        let peers = Arc::new(PeerTable::new());
        let config = Arc::new(config);
        let notify = Arc::new(Notify::new());
        let stop = Arc::new(AtomicBool::new(false));

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (socket_tx, socket_rx) = watch::channel(None);

        let sender_task = tokio::spawn(sender_loop(
            own_id.clone(),
            peers.clone(),
            config.clone(),
            notify.clone(),
            stop.clone(),
            command_rx,
            event_tx.clone(),
            socket_tx,
            socket_rx.clone(),
            ipv6,
        ));

        let receiver_task = tokio::spawn(receiver_loop(
            own_id.clone(),
            peers.clone(),
            config.clone(),
            stop.clone(),
            command_tx.clone(),
            event_tx,
            socket_rx,
        ));

        Connection {
            own_id,
            peers,
            config,
            command_tx,
            event_rx,
            notify,
            handler,
            stop,
            sender_task,
            receiver_task,
        }
    }

    fn send_command(&self, command: Command) {
        let _ = self.command_tx.send(command);
        self.notify.notify_one();
    }

    pub fn serve(&self, port: u16) {
        self.send_command(Command::Serve { port });
    }

    pub fn connect(&self, addr: SocketAddr) {
        self.send_command(Command::Connect { addr });
    }

    pub fn connected(&self) -> bool {
        self.own_id.load(Ordering::SeqCst) != PEER_ID_INEXISTENT
            && self.peers.get(PEER_ID_SERVER).is_some()
    }

    pub fn disconnect(&self) {
        self.send_command(Command::Disconnect);
    }

    pub fn send(&self, peer_id: PeerId, channel: ChannelNum, bytes: Vec<u8>, reliable: bool) -> Result<(), Error> {
        if self.peers.get(peer_id).is_none() {
            return Err(Error::PeerNotFound);
        }
        self.send_command(Command::Send {
            peer_id,
            channel,
            bytes,
            reliable,
        });
        Ok(())
    }

    pub fn send_to_all(&self, channel: ChannelNum, bytes: Vec<u8>, reliable: bool) {
        self.send_command(Command::SendToAll {
            channel,
            bytes,
            reliable,
        });
    }

    pub fn delete_peer(&self, peer_id: PeerId) -> Result<(), Error> {
        if self.peers.get(peer_id).is_none() {
            return Err(Error::PeerNotFound);
        }
        self.send_command(Command::DeletePeer { peer_id });
        Ok(())
    }

    pub fn peer_address(&self, peer_id: PeerId) -> Option<SocketAddr> {
        self.peers.get(peer_id).map(|p| p.addr())
    }

    pub fn peer_avg_rtt(&self, peer_id: PeerId) -> Option<Duration> {
        self.peers.get(peer_id).and_then(|p| p.avg_rtt())
    }

    /// Waits for the next event. `PeerAdded`/`PeerRemoved` are dispatched to
    /// the configured handler (if any) and do not surface to the caller;
    /// everything else, including `DataReceived`, is returned directly.
    pub async fn receive(&mut self) -> Result<Event, Error> {
        loop {
            let event = self.event_rx.recv().await.ok_or(Error::PeerNotFound)?;
            match (&event, &self.handler) {
                (Event::PeerAdded { peer_id, address }, Some(handler)) => {
                    handler.peer_added(*peer_id, *address);
                },
                (
                    Event::PeerRemoved {
                        peer_id,
                        timed_out,
                        address,
                    },
                    Some(handler),
                ) => {
                    handler.peer_removed(*peer_id, *timed_out, *address);
                },
                _ => return Ok(event),
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.sender_task.abort();
        self.receiver_task.abort();
    }
}

/// Packets/second to pace a peer at: the floor before any RTT sample
/// exists, scaled up toward the ceiling as the measured RTT approaches
/// `congestion_control_aim_rtt` and back down as it exceeds it.
fn pacing_rate(config: &Config, avg_rtt: Option<Duration>) -> u32 {
    let Some(rtt) = avg_rtt else {
        return config.congestion_control_min_rate;
    };
    let aim = config.congestion_control_aim_rtt.as_secs_f64();
    let actual = rtt.as_secs_f64().max(0.001);
    let scaled = (config.congestion_control_max_rate as f64 * (aim / actual)).round();
    (scaled as u32).clamp(config.congestion_control_min_rate, config.congestion_control_max_rate)
}

fn peer_header(config: &Config, own_id: &AtomicU16, channel: ChannelNum) -> BaseHeader {
    BaseHeader {
        protocol_id: config.protocol_id,
        sender_peer_id: own_id.load(Ordering::SeqCst),
        channel,
    }
}

#[allow(clippy::too_many_arguments)]
async fn sender_loop(
    own_id: Arc<AtomicU16>,
    peers: Arc<PeerTable>,
    config: Arc<Config>,
    notify: Arc<Notify>,
    stop: Arc<AtomicBool>,
    mut command_rx: mpsc::UnboundedReceiver<Command>,
    event_tx: mpsc::UnboundedSender<Event>,
    socket_tx: watch::Sender<Option<Arc<UdpSocket>>>,
    socket_rx: watch::Receiver<Option<Arc<UdpSocket>>>,
    ipv6: bool,
) {
    let mut last_tick = Instant::now();
    let mut congestion_timer = Duration::ZERO;
    let mut throughput_timer = Duration::ZERO;
    let mut outgoing_unreliable: VecDeque<OutgoingUnreliable> = VecDeque::new();

    while !stop.load(Ordering::SeqCst) {
        // 1. coalesced wakeup wait
        let _ = tokio::time::timeout(SENDER_WAIT, notify.notified()).await;

        // 2. elapsed wall-clock time
        let now = Instant::now();
        let dt = now.duration_since(last_tick);
        last_tick = now;

        congestion_timer += dt;
        throughput_timer += dt;
        let sample_congestion = congestion_timer >= CONGESTION_SAMPLE_INTERVAL;
        if sample_congestion {
            congestion_timer = Duration::ZERO;
        }
        let sample_throughput = throughput_timer >= THROUGHPUT_SAMPLE_INTERVAL;
        if sample_throughput {
            throughput_timer = Duration::ZERO;
        }

        let socket = socket_rx.borrow().clone();

        // 3. timeouts pass
        for peer in peers.values() {
            peer.set_max_packets_per_second(pacing_rate(&config, peer.avg_rtt()));

            if peer.tick_timers(dt) {
                let header = peer_header(&config, &own_id, 0);
                if let Ok(bytes) = crate::codec::encode_datagram(&header, &Frame::Control(ControlType::Ping)) {
                    outgoing_unreliable.push_back(OutgoingUnreliable {
                        peer_id: peer.id(),
                        addr: peer.addr(),
                        bytes,
                        bypass_pacing: false,
                    });
                }
            }

            if peer.idle_timer() >= config.peer_timeout {
                peer.mark_for_removal(true);
            }

            for channel in &peer.channels {
                channel.age_split(dt, config.peer_timeout);
                channel.outgoing_unacked.increment_timers(dt);

                if channel.outgoing_unacked.any_totaltime_reached(config.peer_timeout) {
                    peer.mark_for_removal(true);
                }

                let resend_timeout = peer.resend_timeout();
                let timed_out = channel.outgoing_unacked.collect_timed_out(resend_timeout);
                if !timed_out.is_empty() {
                    if let Some(socket) = socket.as_ref() {
                        for frame in &timed_out {
                            let _ = socket.send_to(&frame.bytes, frame.addr).await;
                        }
                    }
                    channel.record_loss(timed_out.len() as u32);
                    channel.outgoing_unacked.reset_retransmit_timers(resend_timeout);
                    for _ in &timed_out {
                        peer.report_rtt(resend_timeout);
                    }
                }

                if sample_congestion {
                    channel.sample_congestion();
                }
                if sample_throughput {
                    channel.sample_throughput();
                }

                let header = peer_header(&config, &own_id, channel.num);
                channel.drain_commands(
                    &header,
                    peer.addr(),
                    config.max_original_payload(),
                    config.max_split_chunk(),
                );
            }
        }

        // 4. drain the public command queue
        while let Ok(command) = command_rx.try_recv() {
            handle_command(
                command,
                &own_id,
                &peers,
                &config,
                &event_tx,
                &socket_tx,
                &mut outgoing_unreliable,
                ipv6,
            )
            .await;
        }

        // 5. send pass
        for peer in peers.values() {
            peer.charge_accumulator(dt);

            for channel in &peer.channels {
                let shifted = channel.shift_ready_into_window();
                if let Some(socket) = socket.as_ref() {
                    for frame in &shifted {
                        let _ = socket.send_to(&frame.bytes, frame.addr).await;
                    }
                }
            }
        }

        if let Some(socket) = socket.as_ref() {
            let mut remaining = VecDeque::new();
            while let Some(item) = outgoing_unreliable.pop_front() {
                let peer = peers.get(item.peer_id);
                let can_send = item.bypass_pacing
                    || peer.as_ref().map(|p| p.try_spend_one()).unwrap_or(true);
                if can_send {
                    let _ = socket.send_to(&item.bytes, item.addr).await;
                } else {
                    remaining.push_back(item);
                }
            }
            outgoing_unreliable = remaining;
        }

        // 6. remove peers marked for removal
        for peer in peers.values() {
            if peer.is_removed() {
                peers.remove(peer.id());
                let _ = event_tx.send(Event::PeerRemoved {
                    peer_id: peer.id(),
                    timed_out: peer.is_timed_out(),
                    address: peer.addr(),
                });
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_command(
    command: Command,
    own_id: &AtomicU16,
    peers: &PeerTable,
    config: &Config,
    event_tx: &mpsc::UnboundedSender<Event>,
    socket_tx: &watch::Sender<Option<Arc<UdpSocket>>>,
    outgoing_unreliable: &mut VecDeque<OutgoingUnreliable>,
    ipv6: bool,
) {
    match command {
        Command::Serve { port } => {
            let bind_addr: SocketAddr = if ipv6 {
                (std::net::Ipv6Addr::UNSPECIFIED, port).into()
            } else {
                (std::net::Ipv4Addr::UNSPECIFIED, port).into()
            };
            match UdpSocket::bind(bind_addr).await {
                Ok(socket) => {
                    own_id.store(PEER_ID_SERVER, Ordering::SeqCst);
                    let _ = socket_tx.send(Some(Arc::new(socket)));
                },
                Err(e) => {
                    log::warn!("bind failed on port {port}: {e}");
                    let _ = event_tx.send(Event::BindFailed);
                },
            }
        },
        Command::Connect { addr } => {
            let bind_addr: SocketAddr = if matches!(addr, SocketAddr::V6(_)) {
                (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
            } else {
                (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
            };
            match UdpSocket::bind(bind_addr).await {
                Ok(socket) => {
                    let _ = socket_tx.send(Some(Arc::new(socket)));
                    own_id.store(PEER_ID_INEXISTENT, Ordering::SeqCst);

                    let peer = Arc::new(Peer::new(PEER_ID_SERVER, addr));
                    peers.insert(peer.clone());
                    let _ = event_tx.send(Event::PeerAdded {
                        peer_id: PEER_ID_SERVER,
                        address: addr,
                    });
                    // An empty reliable message on channel 0 bootstraps the
                    // handshake; the server's reply carries SET_PEER_ID.
                    peer.channels[0].queue_command(Vec::new());
                },
                Err(e) => {
                    log::warn!("failed to bind client socket: {e}");
                    let _ = event_tx.send(Event::BindFailed);
                },
            }
        },
        Command::Disconnect => {
            for peer in peers.values() {
                let header = peer_header(config, own_id, 0);
                if let Ok(bytes) = crate::codec::encode_datagram(&header, &Frame::Control(ControlType::Disco)) {
                    outgoing_unreliable.push_back(OutgoingUnreliable {
                        peer_id: peer.id(),
                        addr: peer.addr(),
                        bytes,
                        bypass_pacing: false,
                    });
                }
            }
        },
        Command::Send {
            peer_id,
            channel,
            bytes,
            reliable,
        } => {
            send_to_peer(peer_id, channel, &bytes, reliable, own_id, peers, config, outgoing_unreliable);
        },
        Command::SendToAll {
            channel,
            bytes,
            reliable,
        } => {
            for peer_id in peers.values().iter().map(|p| p.id()).collect::<Vec<_>>() {
                send_to_peer(peer_id, channel, &bytes, reliable, own_id, peers, config, outgoing_unreliable);
            }
        },
        Command::SendAck {
            peer_id,
            channel,
            seqnum,
        } => {
            if let Some(peer) = peers.get(peer_id) {
                let header = peer_header(config, own_id, channel);
                if let Ok(bytes) =
                    crate::codec::encode_datagram(&header, &Frame::Control(ControlType::Ack(seqnum)))
                {
                    outgoing_unreliable.push_back(OutgoingUnreliable {
                        peer_id,
                        addr: peer.addr(),
                        bytes,
                        bypass_pacing: true,
                    });
                }
            }
        },
        Command::DeletePeer { peer_id } => {
            if let Some(peer) = peers.remove(peer_id) {
                let _ = event_tx.send(Event::PeerRemoved {
                    peer_id,
                    timed_out: false,
                    address: peer.addr(),
                });
            }
        },
    }
}

#[allow(clippy::too_many_arguments)]
fn send_to_peer(
    peer_id: PeerId,
    channel_num: ChannelNum,
    bytes: &[u8],
    reliable: bool,
    own_id: &AtomicU16,
    peers: &PeerTable,
    config: &Config,
    outgoing_unreliable: &mut VecDeque<OutgoingUnreliable>,
) {
    let Some(peer) = peers.get(peer_id) else {
        log::debug!("dropping send to vanished peer {peer_id}");
        return;
    };
    let Some(channel) = peer.channels.get(channel_num as usize) else {
        log::warn!("dropping send to out-of-range channel {channel_num}");
        return;
    };

    if reliable {
        let header = peer_header(config, own_id, channel_num);
        if channel.has_window_space() {
            channel.fragment_and_queue(
                bytes,
                &header,
                peer.addr(),
                config.max_original_payload(),
                config.max_split_chunk(),
            );
        } else {
            channel.queue_command(bytes.to_vec());
        }
    } else {
        let header = peer_header(config, own_id, channel_num);
        let mut split_seqnum = 0u16;
        for frame in crate::codec::auto_split(
            bytes,
            config.max_original_payload(),
            config.max_split_chunk(),
            &mut split_seqnum,
        ) {
            if let Ok(encoded) = crate::codec::encode_datagram(&header, &frame) {
                outgoing_unreliable.push_back(OutgoingUnreliable {
                    peer_id,
                    addr: peer.addr(),
                    bytes: encoded,
                    bypass_pacing: false,
                });
            }
        }
    }
}

async fn receiver_loop(
    own_id: Arc<AtomicU16>,
    peers: Arc<PeerTable>,
    config: Arc<Config>,
    stop: Arc<AtomicBool>,
    command_tx: mpsc::UnboundedSender<Command>,
    event_tx: mpsc::UnboundedSender<Event>,
    socket_rx: watch::Receiver<Option<Arc<UdpSocket>>>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    while !stop.load(Ordering::SeqCst) {
        for _ in 0 .. crate::MAX_RECEIVER_ITERATIONS {
            if stop.load(Ordering::SeqCst) {
                return;
            }

            // 1. try to deliver a ready in-order reliable message
            let mut delivered = false;
            'peer_scan: for peer in peers.values() {
                for channel in &peer.channels {
                    if let Some(payload) =
                        channel.pump_reorder_buffer(peer.addr(), &peer, &own_id, &command_tx)
                    {
                        let _ = event_tx.send(Event::DataReceived {
                            peer_id: peer.id(),
                            bytes: payload,
                        });
                        delivered = true;
                        break 'peer_scan;
                    }
                }
            }
            if delivered {
                continue;
            }

            // 2./3. poll the socket with a short timeout
            let socket = socket_rx.borrow().clone();
            let Some(socket) = socket else {
                tokio::time::sleep(RECEIVER_SOCKET_TIMEOUT).await;
                continue;
            };

            match tokio::time::timeout(RECEIVER_SOCKET_TIMEOUT, socket.recv_from(&mut buf)).await {
                Ok(Ok((len, addr))) => {
                    handle_datagram(&buf[.. len], addr, &own_id, &peers, &config, &event_tx, &command_tx);
                },
                Ok(Err(e)) => {
                    log::warn!("socket recv error: {e}");
                },
                Err(_elapsed) => {},
            }
        }

        tokio::task::yield_now().await;
    }
}

fn handle_datagram(
    bytes: &[u8],
    addr: SocketAddr,
    own_id: &AtomicU16,
    peers: &PeerTable,
    config: &Config,
    event_tx: &mpsc::UnboundedSender<Event>,
    command_tx: &mpsc::UnboundedSender<Command>,
) {
    let (header, frame) = match crate::codec::decode_datagram(bytes) {
        Ok(v) => v,
        Err(e) => {
            log::warn!("dropping malformed datagram ({} bytes) from {addr}: {e}", bytes.len());
            return;
        },
    };

    if header.protocol_id != config.protocol_id {
        log::debug!("dropping datagram with mismatched protocol_id from {addr}");
        return;
    }

    if header.channel as usize >= CHANNEL_COUNT {
        log::warn!("dropping datagram with out-of-range channel {} from {addr}", header.channel);
        return;
    }

    let resolved_id = header.sender_peer_id;

    let peer = if resolved_id == PEER_ID_INEXISTENT {
        match peers
            .values()
            .into_iter()
            .find(|p| p.addr() == addr && !p.has_sent_with_id())
        {
            Some(p) => p,
            None => match peers.next_free_id() {
                Some(new_id) => {
                    let peer = Arc::new(Peer::new(new_id, addr));
                    peers.insert(peer.clone());
                    let _ = event_tx.send(Event::PeerAdded {
                        peer_id: new_id,
                        address: addr,
                    });

                    let header = peer_header(config, own_id, 0);
                    let seqnum = peer.channels[0].next_sequence_number();
                    if let Ok(wrapped) =
                        crate::codec::make_reliable(Frame::Control(ControlType::SetPeerId(new_id)), seqnum)
                    {
                        if let Ok(bytes) = crate::codec::encode_datagram(&header, &wrapped) {
                            peer.channels[0].push_ready(BufferedFrame::new(seqnum, bytes, addr));
                        }
                    }
                    peer
                },
                None => {
                    log::warn!("peer id space exhausted, dropping datagram from {addr}");
                    return;
                },
            },
        }
    } else {
        match peers.get(resolved_id) {
            Some(p) => p,
            None => {
                log::debug!("dropping datagram from unknown peer id {resolved_id}");
                return;
            },
        }
    };

    if peer.addr() != addr {
        log::warn!("dropping datagram: source address mismatch for peer {}", peer.id());
        return;
    }

    if resolved_id == peer.id() {
        peer.set_has_sent_with_id();
    }

    peer.reset_idle_timer();

    let channel = &peer.channels[header.channel as usize];
    match channel.process(frame, false, addr, &peer, own_id, command_tx) {
        Ok(Some(payload)) => {
            let _ = event_tx.send(Event::DataReceived {
                peer_id: peer.id(),
                bytes: payload,
            });
        },
        Ok(None) => {},
        Err(e) => {
            log::warn!("dropping invalid frame from {addr}: {e}");
        },
    }
}
