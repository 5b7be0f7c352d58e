use crate::packet::Packet;
use std::collections::BTreeMap;
use std::fs::DirBuilder;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// The sender-supplied filename is cut off here.
const MAX_FILE_NAME_BYTES: usize = 1024;

/// Reassembles one file transfer from a single source directly on disk.
///
/// Chunks land in a temp file as soon as they are contiguous with what was
/// already written; only the out-of-order remainder is buffered in memory.
/// The lowest packet number of the stream is the metadata packet carrying the
/// filename; its payload is never written into the data file.
pub struct OnDiskReconstructor {
    buffer: BTreeMap<i64, Vec<u8>>,
    /// Packet number of the metadata packet, `-1` until the first packet.
    lowest_pkt_num: i64,
    /// Data up to and including this packet number is in the file.
    highest_written: i64,
    /// Highest packet number seen so far.
    highest_buffered: i64,
    file: Option<NamedTempFile>,
}

impl OnDiskReconstructor {
    pub fn new() -> OnDiskReconstructor {
        OnDiskReconstructor {
            buffer: BTreeMap::new(),
            lowest_pkt_num: -1,
            highest_written: -1,
            highest_buffered: -1,
            file: None,
        }
    }

    pub fn handle(&mut self, packet: &Packet) -> io::Result<()> {
        let pkt_num = i64::from(packet.header.pkt_num);

        self.buffer.insert(pkt_num, packet.payload.clone());

        if self.file.is_none() {
            debug!("creating reassembly temp file");
            self.file = Some(NamedTempFile::new()?);
        }

        if pkt_num > self.highest_buffered {
            self.highest_buffered = pkt_num;
        }

        if self.lowest_pkt_num < 0 {
            // first packet of the stream, presumed to be the metadata packet
            self.lowest_pkt_num = pkt_num;
            self.highest_written = pkt_num;
            return Ok(());
        }

        if pkt_num < self.lowest_pkt_num {
            // the real metadata packet arrived late; nothing has been written
            // yet in that case, so the write mark moves down with it
            self.lowest_pkt_num = pkt_num;
            self.highest_written = pkt_num;
        }

        self.flush_contiguous()
    }

    /// Write buffered payloads to the file as long as they directly follow
    /// the already-written prefix.
    fn flush_contiguous(&mut self) -> io::Result<()> {
        let file = self.file.as_mut().expect("file exists once packets arrived");

        let mut next = self.highest_written + 1;
        while next <= self.highest_buffered {
            let Some(payload) = self.buffer.get(&next) else {
                break;
            };
            file.write_all(payload)?;
            self.buffer.remove(&next);
            self.highest_written = next;
            next += 1;
        }
        Ok(())
    }

    /// Highest packet number handled, for the FIN commit check. `None` before
    /// any packet arrived.
    pub fn highest_pkt_num(&self) -> Option<u32> {
        if self.highest_buffered < 0 {
            None
        } else {
            Some(self.highest_buffered as u32)
        }
    }

    /// Complete the transfer: flush the buffered remainder in ascending order
    /// (the metadata packet is the one allowed gap and is not written), create
    /// `received_files_dir` with owner-only permissions if needed, and move
    /// the temp file there under the sender-supplied name.
    pub fn finish(mut self, received_files_dir: &Path) -> io::Result<PathBuf> {
        self.flush_remaining()?;

        let mut file = self
            .file
            .take()
            .ok_or_else(|| io::Error::other("no packets were handled"))?;
        file.flush()?;

        let metadata = self.buffer.get(&self.lowest_pkt_num).ok_or_else(|| {
            io::Error::other("metadata packet with the filename never arrived")
        })?;

        let cutoff = metadata.len().min(MAX_FILE_NAME_BYTES);
        let file_name = String::from_utf8_lossy(&metadata[..cutoff]).into_owned();

        let mut dir_builder = DirBuilder::new();
        dir_builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            dir_builder.mode(0o700);
        }
        dir_builder.create(received_files_dir)?;

        let target = received_files_dir.join(&file_name);
        match file.persist(&target) {
            Ok(_) => Ok(target),
            Err(e) => {
                warn!("failed to move reassembled file to {:?}: {}", target, e.error);
                Err(e.error)
            }
        }
    }

    /// Final flush: everything still buffered above the write mark goes to
    /// disk in ascending order, skipping over holes.
    fn flush_remaining(&mut self) -> io::Result<()> {
        let file = match self.file.as_mut() {
            Some(file) => file,
            None => return Ok(()),
        };

        for next in (self.highest_written + 1)..=self.highest_buffered {
            let Some(payload) = self.buffer.get(&next) else {
                continue;
            };
            file.write_all(payload)?;
            self.buffer.remove(&next);
        }
        Ok(())
    }
}

impl Default for OnDiskReconstructor {
    fn default() -> OnDiskReconstructor {
        OnDiskReconstructor::new()
    }
}
