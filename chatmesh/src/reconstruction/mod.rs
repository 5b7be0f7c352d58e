//! Reassembly of multi-chunk payloads: text messages in memory, file
//! transfers on disk. One reconstructor per source host and kind, created
//! lazily on the first packet and destroyed on commit or unreachability.

pub mod disk;
pub mod memory;

pub use disk::OnDiskReconstructor;
pub use memory::InMemoryReconstructor;

use crate::packet::Packet;
use rustc_hash::FxHashMap;
use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Per-kind registries of in-flight reconstructions, keyed by source address.
pub struct Reconstructors {
    received_files_dir: PathBuf,
    messages: Mutex<FxHashMap<Ipv4Addr, InMemoryReconstructor>>,
    files: Mutex<FxHashMap<Ipv4Addr, OnDiskReconstructor>>,
}

impl Reconstructors {
    pub fn new(received_files_dir: &Path) -> Reconstructors {
        Reconstructors {
            received_files_dir: received_files_dir.to_path_buf(),
            messages: Mutex::new(FxHashMap::default()),
            files: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn handle_msg_packet(&self, packet: &Packet) {
        self.messages
            .lock()
            .unwrap()
            .entry(packet.header.source)
            .or_default()
            .handle(packet);
    }

    pub fn handle_file_packet(&self, packet: &Packet) -> io::Result<()> {
        self.files
            .lock()
            .unwrap()
            .entry(packet.header.source)
            .or_default()
            .handle(packet)
    }

    pub fn msg_highest_pkt_num(&self, source: Ipv4Addr) -> Option<u32> {
        self.messages
            .lock()
            .unwrap()
            .get(&source)
            .and_then(|r| r.highest_pkt_num())
    }

    pub fn file_highest_pkt_num(&self, source: Ipv4Addr) -> Option<u32> {
        self.files
            .lock()
            .unwrap()
            .get(&source)
            .and_then(|r| r.highest_pkt_num())
    }

    /// Commit the message stream from `source`: the reconstructor is removed
    /// and the chunks are returned concatenated in ascending order.
    pub fn finish_msg(&self, source: Ipv4Addr) -> Option<Vec<u8>> {
        self.messages
            .lock()
            .unwrap()
            .remove(&source)
            .map(|mut r| r.finish())
    }

    /// Commit the file stream from `source`: the reconstructor is removed and
    /// the reassembled file lands in the received-files directory.
    pub fn finish_file(&self, source: Ipv4Addr) -> Option<io::Result<PathBuf>> {
        self.files
            .lock()
            .unwrap()
            .remove(&source)
            .map(|r| r.finish(&self.received_files_dir))
    }

    /// Drop all partial state from `source`. An unfinished temp file is
    /// deleted with its reconstructor.
    pub fn clear(&self, source: Ipv4Addr) {
        let dropped_msg = self.messages.lock().unwrap().remove(&source).is_some();
        let dropped_file = self.files.lock().unwrap().remove(&source).is_some();
        if dropped_msg || dropped_file {
            debug!("cleared reconstruction state for {}", source);
        }
    }
}
