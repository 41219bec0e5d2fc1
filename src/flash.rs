//! SPI flash reads
//!
//! A read is a [`SubcommandId::ReadSpiFlash`] request whose arguments are the
//! little-endian address and a length byte. The acknowledged reply echoes
//! both before the data, which is how replies are routed back to the reader
//! that asked for that address.

use std::collections::{HashMap, VecDeque};

use tracing::trace;

use crate::protocol::SubcommandId;
use crate::subcommand::Request;

/// Largest payload a single read may return
pub const MAX_READ_LEN: u8 = 0x1D;

pub fn encode_read(address: u32, length: u8) -> [u8; 5] {
    let a = address.to_le_bytes();
    [a[0], a[1], a[2], a[3], length]
}

/// Build the subcommand request for a read, filtered on the echoed address
pub fn read_request<R>(address: u32, length: u8, responder: R) -> Request<R> {
    Request::new(SubcommandId::ReadSpiFlash, encode_read(address, length).to_vec(), responder)
        .with_echo(address.to_le_bytes().to_vec())
}

/// Data returned by an acknowledged flash read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashChunk {
    pub address: u32,
    pub data: Vec<u8>,
}

impl FlashChunk {
    /// Decode reply data laid out as `[addr LE x4, len, data...]`
    ///
    /// The data is truncated to the echoed length.
    pub fn decode(reply_data: &[u8]) -> Option<Self> {
        if reply_data.len() < 5 {
            return None;
        }
        let address = u32::from_le_bytes([reply_data[0], reply_data[1], reply_data[2], reply_data[3]]);
        let length = reply_data[4] as usize;
        let data = &reply_data[5..];
        Some(Self {
            address,
            data: data[..length.min(data.len())].to_vec(),
        })
    }
}

/// Readers waiting on each flash address, oldest first
#[derive(Debug)]
pub struct PendingReads<T> {
    pending: HashMap<u32, VecDeque<T>>,
}

impl<T> Default for PendingReads<T> {
    fn default() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }
}

impl<T> PendingReads<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, address: u32, target: T) {
        self.pending.entry(address).or_default().push_back(target);
    }

    /// Remove the oldest reader of `address`
    ///
    /// Used both to deliver a chunk and to abandon a read that timed out.
    pub fn take(&mut self, address: u32) -> Option<T> {
        let queue = self.pending.get_mut(&address)?;
        let target = queue.pop_front();
        if queue.is_empty() {
            self.pending.remove(&address);
        }
        if target.is_none() {
            trace!("No pending flash read for {:#06x}", address);
        }
        target
    }

    pub fn len(&self) -> usize {
        self.pending.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_read() {
        assert_eq!(encode_read(0x6050, 12), [0x50, 0x60, 0x00, 0x00, 12]);
        let request = read_request(0x8026, 26, ());
        assert_eq!(request.id, SubcommandId::ReadSpiFlash);
        assert_eq!(request.echo, Some(vec![0x26, 0x80, 0x00, 0x00]));
    }

    #[test]
    fn test_chunk_decode() {
        let chunk = FlashChunk::decode(&[0x1B, 0x60, 0, 0, 1, 0x01, 0xFF, 0xFF]).unwrap();
        assert_eq!(chunk.address, 0x601B);
        assert_eq!(chunk.data, vec![0x01]);
        assert!(FlashChunk::decode(&[0x1B, 0x60]).is_none());
    }

    #[test]
    fn test_pending_reads_fifo_per_address() {
        let mut pending = PendingReads::new();
        pending.register(0x6012, "first");
        pending.register(0x6012, "second");
        pending.register(0x6050, "colors");
        assert_eq!(pending.len(), 3);
        assert_eq!(pending.take(0x6012), Some("first"));
        assert_eq!(pending.take(0x6012), Some("second"));
        assert_eq!(pending.take(0x6012), None);
        assert_eq!(pending.take(0x6050), Some("colors"));
        assert!(pending.is_empty());
    }
}
