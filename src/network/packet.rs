//! Packets exchanged by the multiplexer.
//!
//! Each packet is one length-prefixed bincode message on the secret connection.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Bincode overhead of a `Msg` packet beyond its payload bytes.
const PACKET_OVERHEAD: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Packet {
    Ping,
    Pong,
    Msg {
        channel_id: u8,
        /// Set on the last packet of a message.
        eof: bool,
        data: Bytes,
    },
}

impl Packet {
    pub fn msg(channel_id: u8, eof: bool, data: Bytes) -> Self {
        Packet::Msg {
            channel_id,
            eof,
            data,
        }
    }
}

/// Largest encoded packet a peer may send for a given payload limit.
pub fn max_packet_size(max_payload: usize) -> usize {
    max_payload + PACKET_OVERHEAD
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_packet_fits_limit() {
        let payload = 1024;
        let packet = Packet::msg(0xff, true, Bytes::from(vec![0xab; payload]));
        let encoded = bincode::serialize(&packet).unwrap();
        assert!(encoded.len() <= max_packet_size(payload));

        let decoded: Packet = bincode::deserialize(&encoded).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_control_packets_are_small() {
        assert!(bincode::serialize(&Packet::Ping).unwrap().len() <= 4);
        assert!(bincode::serialize(&Packet::Pong).unwrap().len() <= 4);
    }
}
