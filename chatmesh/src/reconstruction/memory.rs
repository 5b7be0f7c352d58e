use crate::packet::Packet;
use std::collections::BTreeMap;

/// Collects the chunks of one in-flight text message from a single source.
/// The dispatcher has already filtered duplicates, so every handed-in packet
/// number is unique.
#[derive(Debug, Default)]
pub struct InMemoryReconstructor {
    payloads: BTreeMap<u32, Vec<u8>>,
}

impl InMemoryReconstructor {
    pub fn new() -> InMemoryReconstructor {
        InMemoryReconstructor::default()
    }

    pub fn handle(&mut self, packet: &Packet) {
        self.payloads
            .insert(packet.header.pkt_num, packet.payload.clone());
    }

    /// Highest packet number buffered so far; the FIN commit compares against
    /// this.
    pub fn highest_pkt_num(&self) -> Option<u32> {
        self.payloads.keys().next_back().copied()
    }

    /// Concatenation of all payloads in ascending packet-number order. Clears
    /// the buffer.
    pub fn finish(&mut self) -> Vec<u8> {
        let mut message = Vec::new();
        for payload in std::mem::take(&mut self.payloads).into_values() {
            message.extend_from_slice(&payload);
        }
        message
    }
}
