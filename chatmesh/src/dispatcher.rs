use crate::error::ProtocolError;
use crate::packet::{DdPayload, FinPayload, LsaPayload, MsgType, Packet};
use crate::reconstruction::Reconstructors;
use crate::routing::Router;
use crate::sequencing::{IncomingTracker, OutgoingTracker, SequenceBlockers};
use crate::send_pipeline::SendPipeline;
use crate::socket::Datagram;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, trace, warn};

/// What the overlay reports to the application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// A new direct neighbor completed the CONN handshake.
    Connected { peer: SocketAddrV4 },
    /// A direct neighbor disconnected.
    Disconnected { peer: Ipv4Addr },
    /// A complete chat message was reassembled and committed.
    MessageReceived { from: Ipv4Addr, text: String },
    /// A complete file was reassembled and written to disk.
    FileReceived { from: Ipv4Addr, path: PathBuf },
}

/// Parses, validates and dispatches every received datagram to its per-type
/// handler. A bounded semaphore caps the number of concurrently running
/// handlers; datagrams arriving beyond that are dropped.
pub struct PacketDispatcher {
    local_addr: Ipv4Addr,
    router: Arc<Router>,
    incoming: Arc<IncomingTracker>,
    outgoing: Arc<OutgoingTracker>,
    reconstructors: Arc<Reconstructors>,
    blockers: Arc<SequenceBlockers>,
    send: Arc<SendPipeline>,
    events: mpsc::Sender<Event>,
    handler_permits: Arc<Semaphore>,
}

impl PacketDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_addr: Ipv4Addr,
        router: Arc<Router>,
        incoming: Arc<IncomingTracker>,
        outgoing: Arc<OutgoingTracker>,
        reconstructors: Arc<Reconstructors>,
        blockers: Arc<SequenceBlockers>,
        send: Arc<SendPipeline>,
        events: mpsc::Sender<Event>,
        max_concurrent_handlers: usize,
    ) -> PacketDispatcher {
        PacketDispatcher {
            local_addr,
            router,
            incoming,
            outgoing,
            reconstructors,
            blockers,
            send,
            events,
            handler_permits: Arc::new(Semaphore::new(max_concurrent_handlers)),
        }
    }

    /// Consume the socket subscription until it closes. Each datagram is
    /// handled on its own task, bounded by the handler semaphore.
    pub async fn run(self: Arc<Self>, mut datagrams: mpsc::Receiver<Datagram>) {
        info!("packet dispatcher running");

        while let Some(datagram) = datagrams.recv().await {
            let permit = match self.handler_permits.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(
                        "all handlers busy, dropping datagram from {}",
                        datagram.from
                    );
                    continue;
                }
            };

            let dispatcher = self.clone();
            tokio::spawn(async move {
                dispatcher.process_datagram(datagram).await;
                drop(permit);
            });
        }

        debug!("socket subscription closed, dispatcher stopping");
    }

    /// Entry point for a single datagram: parse, checksum, TTL, dispatch.
    pub async fn process_datagram(&self, datagram: Datagram) {
        let packet = match Packet::parse(&datagram.data) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("failed to parse datagram from {}: {}", datagram.from, e);
                return;
            }
        };

        if let Err(e) = packet.check_integrity() {
            warn!(
                "{} on packet from {} to {}, dropping",
                e, packet.header.source, packet.header.dest
            );
            return;
        }

        if packet.header.ttl == 0 {
            info!("dropping packet from {} with expired TTL", packet.header.source);
            return;
        }

        let msg_type = match packet.msg_type() {
            Ok(msg_type) => msg_type,
            Err(e) => {
                warn!("{} from {}", e, datagram.from);
                return;
            }
        };

        trace!(
            "received {:?} packet {} from {}",
            msg_type,
            packet.header.pkt_num,
            datagram.from
        );

        match msg_type {
            MsgType::Connect => self.handle_connect(packet, datagram.from).await,
            MsgType::Disconnect => self.handle_disconnect(packet, datagram.from).await,
            MsgType::DatabaseDescription => self.handle_dd(packet, datagram.from).await,
            MsgType::LinkState => self.handle_lsa(packet, datagram.from).await,
            MsgType::ChatMessage => self.handle_msg(packet).await,
            MsgType::FileTransfer => self.handle_file(packet).await,
            MsgType::Ack => self.handle_ack(packet).await,
            MsgType::Finish => self.handle_finish(packet).await,
        }
    }

    /// Judge a packet destined for the local host. `Some(true)` means new,
    /// `Some(false)` duplicate (already handled, caller just returns), `None`
    /// means the packet was invalid and dropped.
    async fn record_or_handle_duplicate(
        &self,
        packet: &Packet,
        ack: AckPath,
    ) -> Option<bool> {
        match self.incoming.record(packet) {
            Ok(()) => Some(true),
            Err(ProtocolError::DuplicatePacket) => {
                trace!(
                    "duplicate packet {} from {}",
                    packet.header.pkt_num,
                    packet.header.source
                );
                self.acknowledge(packet, ack).await;
                Some(false)
            }
            Err(e) => {
                warn!("{}", e);
                None
            }
        }
    }

    async fn acknowledge(&self, packet: &Packet, ack: AckPath) {
        let result = match ack {
            AckPath::Direct(addr_port) => {
                self.send.send_ack_to(addr_port, packet.header.pkt_num).await
            }
            AckPath::Routed => {
                self.send
                    .send_routed_ack(packet.header.source, packet.header.pkt_num)
                    .await
            }
        };
        if let Err(e) = result {
            warn!("failed to acknowledge packet from {}: {}", packet.header.source, e);
        }
    }

    /// CONN: direct neighbor handshake, never routed. ACKs go straight back
    /// to the UDP sender since no route exists yet.
    async fn handle_connect(&self, packet: Packet, from: SocketAddrV4) {
        match self.record_or_handle_duplicate(&packet, AckPath::Direct(from)).await {
            Some(true) => {}
            _ => return,
        }

        debug!("CONN from {} packet {}", from, packet.header.pkt_num);

        if packet.header.source != *from.ip() {
            warn!(
                "malformed CONN: header source {} does not match sender {}",
                packet.header.source, from
            );
            return;
        }

        if self.router.is_neighbor(packet.header.source).is_some() {
            warn!("connection request from already known neighbor {}", from.ip());
            return;
        }

        self.acknowledge(&packet, AckPath::Direct(from)).await;

        self.router.add_neighbor(from);

        let local_lsa = self
            .router
            .get_lsa(self.local_addr)
            .expect("local LSA exists after a neighbor change");
        self.send.flood_lsa(self.local_addr, &local_lsa, &[]).await;

        if let Err(e) = self.send.send_dd(from).await {
            warn!("failed to send database description to {}: {}", from, e);
        }

        self.emit(Event::Connected { peer: from });
    }

    /// DIS: a direct neighbor is leaving. Tears down everything that was
    /// reachable only through it.
    async fn handle_disconnect(&self, packet: Packet, from: SocketAddrV4) {
        match self.record_or_handle_duplicate(&packet, AckPath::Routed).await {
            Some(true) => {}
            _ => return,
        }

        debug!("DIS from {} packet {}", from, packet.header.pkt_num);

        if packet.header.source != *from.ip() {
            warn!(
                "malformed DIS: header source {} does not match sender {}",
                packet.header.source, from
            );
            return;
        }

        let source = packet.header.source;
        if self.router.is_neighbor(source).is_none() {
            warn!("disconnect from non-neighbor {}", source);
            return;
        }

        self.acknowledge(&packet, AckPath::Routed).await;

        let unreachable = self.router.remove_neighbor(source);
        self.clear_unreachable_hosts(&unreachable);

        let local_lsa = self
            .router
            .get_lsa(self.local_addr)
            .expect("local LSA exists after a neighbor change");
        self.send.flood_lsa(self.local_addr, &local_lsa, &[]).await;

        self.emit(Event::Disconnected { peer: source });
    }

    /// LSA: store if newer, then re-flood to everyone except the neighbor it
    /// came from (split horizon).
    async fn handle_lsa(&self, packet: Packet, from: SocketAddrV4) {
        match self.record_or_handle_duplicate(&packet, AckPath::Direct(from)).await {
            Some(true) => {}
            _ => return,
        }

        if packet.header.source != *from.ip() {
            warn!(
                "malformed LSA: header source {} does not match sender {}",
                packet.header.source, from
            );
            return;
        }

        let lsa = match LsaPayload::deser(&packet.payload) {
            Ok(lsa) => lsa,
            Err(e) => {
                warn!("failed to parse LSA payload from {}: {}", from, e);
                return;
            }
        };

        self.acknowledge(&packet, AckPath::Direct(from)).await;

        info!(
            "LSA of {} seq {} neighbors {:?}",
            lsa.owner, lsa.seq_num, lsa.neighbors
        );

        if let Some(stored) = self.router.get_lsa(lsa.owner) {
            if stored.seq_num >= lsa.seq_num {
                debug!(
                    "already have LSA of {} with seq {} >= {}",
                    lsa.owner, stored.seq_num, lsa.seq_num
                );
                return;
            }
        }

        let unreachable = self
            .router
            .update_lsa(lsa.owner, lsa.seq_num, lsa.neighbors);
        self.clear_unreachable_hosts(&unreachable);

        let Some(updated) = self.router.get_lsa(lsa.owner) else {
            warn!("LSA of {} vanished right after the update", lsa.owner);
            return;
        };
        self.send
            .flood_lsa(lsa.owner, &updated, &[packet.header.source])
            .await;
    }

    /// DD: the peer lists the LSAs it has; flood it everything it is missing.
    async fn handle_dd(&self, packet: Packet, from: SocketAddrV4) {
        match self.record_or_handle_duplicate(&packet, AckPath::Routed).await {
            Some(true) => {}
            _ => return,
        }

        debug!("DD from {} packet {}", from, packet.header.pkt_num);

        if packet.header.source != *from.ip() {
            warn!(
                "malformed DD: header source {} does not match sender {}",
                packet.header.source, from
            );
            return;
        }

        self.acknowledge(&packet, AckPath::Routed).await;

        let dd = match DdPayload::deser(&packet.payload) {
            Ok(dd) => dd,
            Err(e) => {
                warn!("failed to parse DD payload from {}: {}", from, e);
                return;
            }
        };

        for owner in self.router.get_available_lsas() {
            if dd.addrs.contains(&owner) {
                continue;
            }
            // LSDB may shift between listing and lookup
            let Some(lsa) = self.router.get_lsa(owner) else {
                continue;
            };
            self.send.flood_lsa(owner, &lsa, &[]).await;
        }
    }

    /// MSG: transit packets are forwarded; local ones are acknowledged and
    /// buffered for reassembly until the FIN commits the stream.
    async fn handle_msg(&self, packet: Packet) {
        if packet.header.dest != self.local_addr {
            if let Err(e) = self.send.forward_routed(packet).await {
                warn!("failed to forward chat message: {}", e);
            }
            return;
        }

        match self.record_or_handle_duplicate(&packet, AckPath::Routed).await {
            Some(true) => {}
            _ => return,
        }

        info!(
            "MSG chunk {} from {}",
            packet.header.pkt_num, packet.header.source
        );

        self.acknowledge(&packet, AckPath::Routed).await;
        self.reconstructors.handle_msg_packet(&packet);
    }

    /// FILE: like MSG but reassembled on disk.
    async fn handle_file(&self, packet: Packet) {
        if packet.header.dest != self.local_addr {
            if let Err(e) = self.send.forward_routed(packet).await {
                warn!("failed to forward file chunk: {}", e);
            }
            return;
        }

        match self.record_or_handle_duplicate(&packet, AckPath::Routed).await {
            Some(true) => {}
            _ => return,
        }

        debug!(
            "FILE chunk {} from {}",
            packet.header.pkt_num, packet.header.source
        );

        self.acknowledge(&packet, AckPath::Routed).await;
        if let Err(e) = self.reconstructors.handle_file_packet(&packet) {
            warn!(
                "failed to buffer file chunk from {}: {}",
                packet.header.source, e
            );
        }
    }

    /// FIN: commits the stream whose last chunk carries the advertised packet
    /// number. A FIN that matches no reconstructor is a late or misrouted
    /// commit and is dropped with a warning.
    async fn handle_finish(&self, packet: Packet) {
        if packet.header.dest != self.local_addr {
            if let Err(e) = self.send.forward_routed(packet).await {
                warn!("failed to forward FIN: {}", e);
            }
            return;
        }

        let fin = match FinPayload::deser(&packet.payload) {
            Ok(fin) => fin,
            Err(e) => {
                warn!("bad FIN from {}: {}", packet.header.source, e);
                return;
            }
        };

        match self.record_or_handle_duplicate(&packet, AckPath::Routed).await {
            Some(true) => {}
            _ => return,
        }

        let source = packet.header.source;
        self.acknowledge(&packet, AckPath::Routed).await;

        if self.reconstructors.file_highest_pkt_num(source) == Some(fin.last_pkt_num) {
            info!("file transfer from {} complete", source);
            match self.reconstructors.finish_file(source) {
                Some(Ok(path)) => self.emit(Event::FileReceived { from: source, path }),
                Some(Err(e)) => warn!("failed to finish file from {}: {}", source, e),
                None => {}
            }
            return;
        }

        if self.reconstructors.msg_highest_pkt_num(source) == Some(fin.last_pkt_num) {
            info!("message from {} complete", source);
            if let Some(message) = self.reconstructors.finish_msg(source) {
                self.emit(Event::MessageReceived {
                    from: source,
                    text: String::from_utf8_lossy(&message).into_owned(),
                });
            }
            return;
        }

        warn!(
            "FIN from {} names last packet {}, but no stream matches",
            source, fin.last_pkt_num
        );
    }

    /// ACK: transit ACKs are forwarded, local ones close the open ack.
    async fn handle_ack(&self, packet: Packet) {
        if packet.header.dest != self.local_addr {
            if let Err(e) = self.send.forward_routed(packet).await {
                warn!("failed to forward ACK: {}", e);
            }
            return;
        }

        trace!(
            "ACK for packet {} from {}",
            packet.header.pkt_num, packet.header.source
        );
        self.outgoing
            .remove_open_ack(packet.header.source, packet.header.pkt_num);
    }

    /// Drop every piece of per-host state for hosts that a routing change cut
    /// off: LSDB entry, both sequencing directions (pending waiters complete
    /// with `false`), reconstructors, and stream blockers.
    pub fn clear_unreachable_hosts(&self, hosts: &[Ipv4Addr]) {
        for host in hosts {
            info!("{} became unreachable, clearing its state", host);
            self.router.remove_lsa(*host);
            self.outgoing.clear(*host);
            self.incoming.clear(*host);
            self.reconstructors.clear(*host);
            self.blockers.clear(*host);
        }
    }

    fn emit(&self, event: Event) {
        if self.events.try_send(event).is_err() {
            warn!("event channel full or closed, dropping event");
        }
    }
}

/// Where an acknowledgment travels: straight back to the UDP sender (routes
/// may not exist yet) or along the routing table.
#[derive(Clone, Copy)]
enum AckPath {
    Direct(SocketAddrV4),
    Routed,
}
