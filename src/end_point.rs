use crate::config::AirhookConfig;
use crate::connection::{AirhookConnection, Connection};
use crate::connection_table::{ConnectionTable, PeerState, PendingTimer};
use crate::data_handler::DataHandler;
use crate::error::ReceiveError;
use crate::send_socket::SendSocket;
use crate::stream::StreamConnection;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Mutex, RwLock};
use tokio::time::{self, Instant};
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};

/// Create an end point where each write is delivered as a separate message
pub async fn listen_airhook(config: Arc<AirhookConfig>, data_handler: Arc<dyn DataHandler>) -> anyhow::Result<EndPoint<Connection>> {
    EndPoint::new(config, data_handler).await
}

/// Create an end point that presents each peer connection as a byte stream
pub async fn listen_airhook_stream(config: Arc<AirhookConfig>, data_handler: Arc<dyn DataHandler>) -> anyhow::Result<EndPoint<StreamConnection>> {
    EndPoint::new(config, data_handler).await
}

/// EndPoint is where the protocol meets the network: It listens on a UdpSocket, dispatching
///  incoming datagrams to per-peer connections, drives each connection's send timer, and has an
///  API for application code to send data.
///
/// The application must run [EndPoint::recv_loop] and [EndPoint::sweep_loop], e.g. by spawning
///  them.
pub struct EndPoint<C: AirhookConnection> {
    receive_socket: Arc<UdpSocket>,
    dispatcher: Arc<Dispatcher<C>>,
    timer_receiver: Mutex<UnboundedReceiver<(SocketAddr, u64)>>,
}

impl<C: AirhookConnection> EndPoint<C> {
    pub async fn new(config: Arc<AirhookConfig>, data_handler: Arc<dyn DataHandler>) -> anyhow::Result<EndPoint<C>> {
        config.validate()?;

        let receive_socket = Arc::new(UdpSocket::bind(config.self_addr).await?);
        info!("bound receive socket to {:?}", receive_socket.local_addr()?);

        let (timer_sender, timer_receiver) = mpsc::unbounded_channel();
        Ok(EndPoint {
            dispatcher: Arc::new(Dispatcher::new(
                config,
                Arc::new(receive_socket.clone()),
                data_handler,
                timer_sender,
            )),
            receive_socket,
            timer_receiver: Mutex::new(timer_receiver),
        })
    }

    pub fn self_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.receive_socket.local_addr()?)
    }

    pub async fn write(&self, to: SocketAddr, data: Bytes) -> anyhow::Result<()> {
        self.dispatcher.write(to, data).await
    }

    pub async fn num_connections(&self) -> usize {
        self.dispatcher.connections.read().await.len()
    }

    /// Processes received datagrams and expired send timers - this function never returns
    pub async fn recv_loop(&self) {
        info!("starting receive loop");

        let mut timer_receiver = self.timer_receiver.lock().await;
        let mut buf = vec![0u8; AirhookConfig::MAX_UDP_PAYLOAD + 1];
        loop {
            select! {
                received = self.receive_socket.recv_from(&mut buf) => {
                    let (num_read, from) = match received {
                        Ok(x) => x,
                        Err(e) => {
                            error!("socket error: {}", e);
                            continue;
                        }
                    };

                    let span = span!(Level::TRACE, "datagram_received", %from);
                    self.dispatcher.on_datagram(from, &buf[..num_read])
                        .instrument(span)
                        .await;
                }
                Some((peer_addr, timer_id)) = timer_receiver.recv() => {
                    self.dispatcher.on_timer(peer_addr, timer_id).await;
                }
            }
        }
    }

    /// Periodically discards idle connections - this function never returns
    pub async fn sweep_loop(&self) {
        let mut sweep_interval = time::interval(self.dispatcher.config.sweep_interval);
        loop {
            sweep_interval.tick().await;
            self.dispatcher.sweep().await;
        }
    }
}

/// The socket independent part of an end point
struct Dispatcher<C: AirhookConnection> {
    config: Arc<AirhookConfig>,
    send_socket: Arc<dyn SendSocket>,
    data_handler: Arc<dyn DataHandler>,
    connections: RwLock<ConnectionTable<C>>,
    timer_sender: UnboundedSender<(SocketAddr, u64)>,
    next_timer_id: AtomicU64,
}

impl<C: AirhookConnection> Dispatcher<C> {
    fn new(
        config: Arc<AirhookConfig>,
        send_socket: Arc<dyn SendSocket>,
        data_handler: Arc<dyn DataHandler>,
        timer_sender: UnboundedSender<(SocketAddr, u64)>,
    ) -> Dispatcher<C> {
        Dispatcher {
            connections: RwLock::new(ConnectionTable::new(config.max_connections, config.connection_idle_timeout)),
            config,
            send_socket,
            data_handler,
            timer_sender,
            next_timer_id: AtomicU64::new(0),
        }
    }

    fn now() -> std::time::Instant {
        Instant::now().into_std()
    }

    async fn on_datagram(&self, from: SocketAddr, datagram: &[u8]) {
        trace!("received datagram from {:?}: {:?}", from, datagram);

        let delivered = {
            let now = Self::now();
            let mut connections = self.connections.write().await;
            match connections.get_mut(&from) {
                Some(peer) => match peer.connection.datagram_received(datagram, now) {
                    Ok(delivered) => {
                        self.send_due(from, peer).await;
                        delivered
                    }
                    Err(e) => return Self::rejected(from, e),
                },
                None => {
                    // an unknown peer only gets a table entry (possibly evicting another one) once
                    //  its first datagram was accepted
                    let mut connection = C::create(&self.config);
                    match connection.datagram_received(datagram, now) {
                        Ok(delivered) => {
                            let peer = connections.insert(from, connection, now);
                            self.send_due(from, peer).await;
                            delivered
                        }
                        Err(e) => return Self::rejected(from, e),
                    }
                }
            }
        };

        for data in delivered {
            self.data_handler.on_data(from, data).await;
        }
    }

    fn rejected(from: SocketAddr, e: ReceiveError) {
        match e {
            ReceiveError::Decode(e) => debug!("unparsable datagram from {:?}: {} - dropping", from, e),
            ReceiveError::Violation(e) => debug!("datagram from {:?} rejected: {} - dropping", from, e),
        }
    }

    async fn write(&self, to: SocketAddr, data: Bytes) -> anyhow::Result<()> {
        let mut connections = self.connections.write().await;
        let peer = connections.get_or_create(to, Self::now(), || C::create(&self.config));
        peer.connection.write(data)?;
        self.send_due(to, peer).await;
        Ok(())
    }

    async fn on_timer(&self, peer_addr: SocketAddr, timer_id: u64) {
        let mut connections = self.connections.write().await;
        let Some(peer) = connections.get_mut(&peer_addr) else {
            trace!("timer for discarded connection {:?} - ignoring", peer_addr);
            return;
        };
        if !peer.timer.as_ref().is_some_and(|t| t.id == timer_id) {
            trace!("stale timer for {:?} - ignoring", peer_addr);
            return;
        }
        peer.timer = None;

        let datagram = peer.connection.send_next(Self::now());
        self.send_socket.send_datagram(peer_addr, &datagram).await;
        self.send_due(peer_addr, peer).await;
    }

    /// Send everything the connection wants sent right now, and start a timer if it wants to
    ///  send something later
    async fn send_due(&self, peer_addr: SocketAddr, peer: &mut PeerState<C>) {
        loop {
            let now = Self::now();
            match peer.connection.poll_schedule(now) {
                None => break,
                Some(delay) if delay.is_zero() => {
                    let datagram = peer.connection.send_next(now);
                    self.send_socket.send_datagram(peer_addr, &datagram).await;
                }
                Some(delay) => {
                    let id = self.next_timer_id.fetch_add(1, Ordering::Relaxed);
                    let timer_sender = self.timer_sender.clone();
                    trace!("scheduling send to {:?} in {:?}", peer_addr, delay);

                    let handle = tokio::spawn(async move {
                        time::sleep(delay).await;
                        if timer_sender.send((peer_addr, id)).is_err() {
                            warn!("end point was shut down - timer for {:?} discarded", peer_addr);
                        }
                    });
                    if let Some(previous) = peer.timer.replace(PendingTimer { id, handle }) {
                        previous.handle.abort();
                    }
                    break;
                }
            }
        }
    }

    async fn sweep(&self) {
        let evicted = self.connections.write().await
            .sweep(Self::now());
        if !evicted.is_empty() {
            debug!("discarded idle connections: {:?}", evicted);
        }
    }
}
