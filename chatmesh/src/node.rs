use crate::config::ProtocolConfig;
use crate::dispatcher::{Event, PacketDispatcher};
use crate::error::ProtocolError;
use crate::packet::{FinPayload, MsgType};
use crate::reconstruction::Reconstructors;
use crate::routing::{LsaEntry, Router};
use crate::sequencing::{IncomingTracker, OutgoingTracker, SequenceBlockers};
use crate::send_pipeline::SendPipeline;
use crate::socket::{Socket, UdpSocketAdapter};
use anyhow::Context;
use bytes::BytesMut;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A running overlay node: owns the socket, the router, both sequencing
/// trackers, the reconstructor registries and the dispatcher, and exposes the
/// operations the application shell drives.
pub struct Node {
    config: Arc<ProtocolConfig>,
    socket: Arc<dyn Socket>,
    udp: Option<Arc<UdpSocketAdapter>>,
    router: Arc<Router>,
    outgoing: Arc<OutgoingTracker>,
    blockers: Arc<SequenceBlockers>,
    send: Arc<SendPipeline>,
    dispatcher: Arc<PacketDispatcher>,
    events: mpsc::Sender<Event>,
    dispatcher_task: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    /// Bind a UDP socket on `local_ip` and start the node. Returns the node
    /// and the channel its events arrive on.
    pub async fn bind(
        local_ip: Ipv4Addr,
        config: ProtocolConfig,
    ) -> anyhow::Result<(Node, mpsc::Receiver<Event>)> {
        let udp = UdpSocketAdapter::open(
            local_ip,
            config.udp_buffer_size,
            config.socket_channel_capacity,
        )
        .await
        .context("failed to open UDP socket")?;

        let (mut node, events) = Node::with_socket(config, udp.clone())?;
        node.udp = Some(udp);
        Ok((node, events))
    }

    /// Assemble a node on top of an already opened socket. Tests use this with
    /// an in-memory network.
    pub fn with_socket(
        config: ProtocolConfig,
        socket: Arc<dyn Socket>,
    ) -> anyhow::Result<(Node, mpsc::Receiver<Event>)> {
        config.validate()?;
        let config = Arc::new(config);

        let local_addr = *socket
            .local_address()
            .context("socket must be open before the node starts")?
            .ip();

        let router = Arc::new(Router::new(local_addr));
        let incoming = Arc::new(IncomingTracker::new(local_addr, config.receiver_window));
        let outgoing = Arc::new(OutgoingTracker::new(
            config.ack_timeout,
            config.retries_per_packet,
            config.initial_cwnd,
        ));
        let reconstructors = Arc::new(Reconstructors::new(&config.received_files_dir));
        let blockers = Arc::new(SequenceBlockers::new());
        let send = Arc::new(SendPipeline::new(
            socket.clone(),
            router.clone(),
            outgoing.clone(),
            config.initial_ttl,
            config.team_id,
            config.cwnd_full_retry_delay,
        ));

        let (events_tx, events_rx) = mpsc::channel(config.event_channel_capacity);
        let dispatcher = Arc::new(PacketDispatcher::new(
            local_addr,
            router.clone(),
            incoming,
            outgoing.clone(),
            reconstructors,
            blockers.clone(),
            send.clone(),
            events_tx.clone(),
            config.max_concurrent_handlers,
        ));

        let datagrams = socket.subscribe();
        let dispatcher_task = tokio::spawn(dispatcher.clone().run(datagrams));

        info!("node up at {}", local_addr);

        Ok((
            Node {
                config,
                socket,
                udp: None,
                router,
                outgoing,
                blockers,
                send,
                dispatcher,
                events: events_tx,
                dispatcher_task: Mutex::new(Some(dispatcher_task)),
            },
            events_rx,
        ))
    }

    pub fn local_address(&self) -> Option<SocketAddrV4> {
        self.socket.local_address()
    }

    /// Initiate the CONN handshake with a new neighbor. On a positive ACK the
    /// neighbor is added, the updated local LSA flooded, and a Database
    /// Description sent, mirroring what the responder does. A second connect
    /// to an existing neighbor is a warned no-op.
    pub async fn connect(&self, peer: SocketAddrV4) -> Result<(), ProtocolError> {
        if self.router.is_neighbor(*peer.ip()).is_some() {
            warn!("already connected to {}", peer.ip());
            return Ok(());
        }

        let packet = self
            .send
            .build_sequenced_packet(MsgType::Connect, Vec::new(), *peer.ip());
        let ack = self.send.send_reliable_to(peer, packet).await?;

        if !Self::acked(ack).await {
            return Err(ProtocolError::PeerGone);
        }

        // the peer's own CONN may have raced us through the dispatcher
        if self.router.is_neighbor(*peer.ip()).is_none() {
            self.router.add_neighbor(peer);
            let local_lsa = self.local_lsa();
            self.send
                .flood_lsa(self.router.local_address(), &local_lsa, &[])
                .await;
            if let Err(e) = self.send.send_dd(peer).await {
                warn!("failed to send database description to {}: {}", peer, e);
            }
        }

        self.emit(Event::Connected { peer });
        info!("connected to {}", peer);
        Ok(())
    }

    /// Tell `peer` we are leaving and tear down everything behind it. The
    /// local teardown happens only once the DIS is acknowledged; a peer that
    /// never answers yields `PeerGone` and keeps the state intact.
    pub async fn disconnect(&self, peer: Ipv4Addr) -> Result<(), ProtocolError> {
        if self.router.is_neighbor(peer).is_none() {
            return Err(ProtocolError::UnreachableDestination(peer));
        }

        let packet = self
            .send
            .build_sequenced_packet(MsgType::Disconnect, Vec::new(), peer);
        let ack = self.send.send_reliable_routed(packet).await?;

        if !Self::acked(ack).await {
            return Err(ProtocolError::PeerGone);
        }

        let unreachable = self.router.remove_neighbor(peer);
        self.dispatcher.clear_unreachable_hosts(&unreachable);

        let local_lsa = self.local_lsa();
        self.send
            .flood_lsa(self.router.local_address(), &local_lsa, &[])
            .await;

        self.emit(Event::Disconnected { peer });
        info!("disconnected from {}", peer);
        Ok(())
    }

    /// Send a chat message, chunked to the configured payload size, and commit
    /// it with a FIN once every chunk went out. Only one message stream per
    /// destination may be in flight.
    pub async fn send_message(&self, dest: Ipv4Addr, text: &str) -> Result<(), ProtocolError> {
        let blocker = self.blockers.get(dest, MsgType::ChatMessage);
        if !blocker.block() {
            return Err(ProtocolError::StreamBusy {
                dest,
                msg_type: MsgType::ChatMessage,
            });
        }

        let result = self.send_message_chunks(dest, text).await;
        blocker.unblock();
        result
    }

    async fn send_message_chunks(&self, dest: Ipv4Addr, text: &str) -> Result<(), ProtocolError> {
        let mut waiters = Vec::new();
        let mut last_chunk_pkt_num = None;

        for chunk in text.as_bytes().chunks(self.config.max_payload) {
            let packet = self
                .send
                .build_sequenced_packet(MsgType::ChatMessage, chunk.to_vec(), dest);
            last_chunk_pkt_num = Some(packet.header.pkt_num);
            waiters.push(self.send.send_reliable_routed(packet).await?);
        }

        let Some(last_pkt_num) = last_chunk_pkt_num else {
            debug!("empty message to {}, nothing to send", dest);
            return Ok(());
        };

        // chunk outcomes are not inspected: a receiver that lost chunks will
        // simply never see a matching FIN
        for waiter in waiters {
            let _ = waiter.await;
        }

        self.send_fin(dest, last_pkt_num).await?;
        info!("message to {} sent", dest);
        Ok(())
    }

    /// Send a file: first the metadata packet carrying the file name, then the
    /// contents in payload-sized chunks, then the FIN commit. Only one file
    /// stream per destination may be in flight.
    pub async fn send_file(&self, dest: Ipv4Addr, path: &Path) -> Result<(), ProtocolError> {
        let blocker = self.blockers.get(dest, MsgType::FileTransfer);
        if !blocker.block() {
            return Err(ProtocolError::StreamBusy {
                dest,
                msg_type: MsgType::FileTransfer,
            });
        }

        let result = self.send_file_chunks(dest, path).await;
        blocker.unblock();
        result
    }

    async fn send_file_chunks(&self, dest: Ipv4Addr, path: &Path) -> Result<(), ProtocolError> {
        let file_name = path
            .file_name()
            .ok_or_else(|| {
                ProtocolError::Io(std::io::Error::other("path has no file name component"))
            })?
            .to_string_lossy()
            .into_owned();
        let mut file = tokio::fs::File::open(path).await?;

        let mut waiters = Vec::new();

        let metadata = self
            .send
            .build_sequenced_packet(MsgType::FileTransfer, file_name.into_bytes(), dest);
        // an empty file commits on the metadata packet itself
        let mut last_chunk_pkt_num = metadata.header.pkt_num;
        waiters.push(self.send.send_reliable_routed(metadata).await?);

        let mut buf = vec![0u8; self.config.max_payload];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }

            let packet =
                self.send
                    .build_sequenced_packet(MsgType::FileTransfer, buf[..n].to_vec(), dest);
            last_chunk_pkt_num = packet.header.pkt_num;
            waiters.push(self.send.send_reliable_routed(packet).await?);
        }

        for waiter in waiters {
            let _ = waiter.await;
        }

        self.send_fin(dest, last_chunk_pkt_num).await?;
        info!("file sent to {}", dest);
        Ok(())
    }

    async fn send_fin(&self, dest: Ipv4Addr, last_pkt_num: u32) -> Result<(), ProtocolError> {
        let mut payload = BytesMut::new();
        FinPayload { last_pkt_num }.ser(&mut payload);

        let packet = self
            .send
            .build_sequenced_packet(MsgType::Finish, payload.to_vec(), dest);
        let ack = self.send.send_reliable_routed(packet).await?;
        // the receiver may not be ready for a new stream; its problem, not ours
        let _ = ack.await;
        Ok(())
    }

    async fn acked(ack: oneshot::Receiver<bool>) -> bool {
        matches!(ack.await, Ok(true))
    }

    fn local_lsa(&self) -> LsaEntry {
        self.router
            .get_lsa(self.router.local_address())
            .expect("local LSA exists after a neighbor change")
    }

    fn emit(&self, event: Event) {
        if self.events.try_send(event).is_err() {
            warn!("event channel full or closed, dropping event");
        }
    }

    // introspection for the shell

    pub fn neighbors(&self) -> Vec<(Ipv4Addr, SocketAddrV4)> {
        self.router.get_neighbors()
    }

    pub fn routing_table(&self) -> Vec<(Ipv4Addr, SocketAddrV4)> {
        self.router.get_routing_table()
    }

    pub fn lsdb(&self) -> Vec<(Ipv4Addr, LsaEntry)> {
        self.router.get_lsdb()
    }

    pub fn next_hop(&self, dest: Ipv4Addr) -> Option<SocketAddrV4> {
        self.router.get_next_hop(dest)
    }

    pub fn open_acks(&self) -> Vec<(Ipv4Addr, Vec<u32>)> {
        self.outgoing.get_open_acks()
    }

    pub fn congestion_windows(&self) -> Vec<(Ipv4Addr, i64)> {
        self.outgoing.get_congestion_windows()
    }

    pub fn slow_start_thresholds(&self) -> Vec<(Ipv4Addr, i64)> {
        self.outgoing.get_slow_start_thresholds()
    }

    /// Stop the dispatcher and the receive loop. Pending transfers are
    /// abandoned.
    pub fn shutdown(&self) {
        if let Some(task) = self.dispatcher_task.lock().unwrap().take() {
            task.abort();
        }
        if let Some(udp) = &self.udp {
            udp.close();
        }
        info!("node shut down");
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown();
    }
}
