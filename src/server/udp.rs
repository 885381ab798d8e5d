//! UDP fast path to the MLAT server (spec §4.D), offered by the server
//! during handshake as an alternative to streaming sync/mlat messages
//! over the TCP control channel.
//!
//! Grounded in `examples/original_source/mlat/client/jsonclient.py`'s
//! `UdpServerConnection`: a fixed-size 1500-byte packet is built up
//! submessage by submessage and flushed opportunistically, never
//! growing past the path MTU.

use tokio::net::UdpSocket;
use tracing::warn;

use crate::decoder::Message;

const TYPE_SYNC: u8 = 1;
const TYPE_MLAT_SHORT: u8 = 2;
const TYPE_MLAT_LONG: u8 = 3;
const TYPE_SSYNC: u8 = 4;
const TYPE_REBASE: u8 = 5;
const TYPE_ABS_SYNC: u8 = 6;

const PACKET_CAP: usize = 1500;
const FLUSH_THRESHOLD: usize = 1400;
const REBASE_THRESHOLD: i64 = 0x7FFF_FFF0;
const ABS_SYNC_THRESHOLD: i64 = 0xFFFF_FFF0;

fn frame_bytes(message: &Message) -> &[u8] {
    message.frame.as_slice()
}

pub struct UdpServerConnection {
    host: String,
    port: u16,
    key: u32,
    socket: UdpSocket,
    base_timestamp: Option<u64>,
    buf: Vec<u8>,
    seq: u16,
    bytes_sent: u64,
}

impl UdpServerConnection {
    pub async fn connect(host: String, port: u16, key: u32) -> std::io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect((host.as_str(), port)).await?;
        Ok(UdpServerConnection {
            host,
            port,
            key,
            socket,
            base_timestamp: None,
            buf: Vec::with_capacity(PACKET_CAP),
            seq: 0,
            bytes_sent: 0,
        })
    }

    fn prepare_header(&mut self, timestamp: u64) {
        self.base_timestamp = Some(timestamp);
        self.buf.clear();
        self.buf.extend_from_slice(&self.key.to_be_bytes());
        self.buf.extend_from_slice(&self.seq.to_be_bytes());
        self.buf.extend_from_slice(&timestamp.to_be_bytes());
    }

    fn rebase(&mut self, timestamp: u64) {
        self.base_timestamp = Some(timestamp);
        self.buf.push(TYPE_REBASE);
        self.buf.extend_from_slice(&timestamp.to_be_bytes());
    }

    fn base(&self) -> u64 {
        self.base_timestamp.expect("prepare_header called before base() is read")
    }

    pub async fn send_mlat(&mut self, message: &Message) {
        if self.base_timestamp.is_none() {
            self.prepare_header(message.timestamp);
        }

        let mut delta = message.timestamp as i64 - self.base() as i64;
        if delta.abs() > REBASE_THRESHOLD {
            self.rebase(message.timestamp);
            delta = 0;
        }

        let frame = frame_bytes(message);
        self.buf.push(if frame.len() == 7 { TYPE_MLAT_SHORT } else { TYPE_MLAT_LONG });
        self.buf.extend_from_slice(&(delta as i32).to_be_bytes());
        self.buf.extend_from_slice(frame);

        if self.buf.len() > FLUSH_THRESHOLD {
            self.flush().await;
        }
    }

    pub async fn send_sync(&mut self, even: &Message, odd: &Message) {
        if self.base_timestamp.is_none() {
            self.prepare_header(((even.timestamp as i128 + odd.timestamp as i128) / 2) as u64);
        }

        if (even.timestamp as i64 - odd.timestamp as i64).abs() > ABS_SYNC_THRESHOLD {
            self.buf.push(TYPE_ABS_SYNC);
            self.buf.extend_from_slice(&even.timestamp.to_be_bytes());
            self.buf.extend_from_slice(&odd.timestamp.to_be_bytes());
            self.buf.extend_from_slice(frame_bytes(even));
            self.buf.extend_from_slice(frame_bytes(odd));
        } else {
            let mut edelta = even.timestamp as i64 - self.base() as i64;
            let mut odelta = odd.timestamp as i64 - self.base() as i64;
            if edelta.abs() > REBASE_THRESHOLD || odelta.abs() > REBASE_THRESHOLD {
                self.rebase(((even.timestamp as i128 + odd.timestamp as i128) / 2) as u64);
                edelta = even.timestamp as i64 - self.base() as i64;
                odelta = odd.timestamp as i64 - self.base() as i64;
            }

            self.buf.push(TYPE_SYNC);
            self.buf.extend_from_slice(&(edelta as i32).to_be_bytes());
            self.buf.extend_from_slice(&(odelta as i32).to_be_bytes());
            self.buf.extend_from_slice(frame_bytes(even));
            self.buf.extend_from_slice(frame_bytes(odd));
        }

        if self.buf.len() > FLUSH_THRESHOLD {
            self.flush().await;
        }
    }

    pub async fn send_split_sync(&mut self, message: &Message) {
        if self.base_timestamp.is_none() {
            self.prepare_header(message.timestamp);
        }

        let mut delta = message.timestamp as i64 - self.base() as i64;
        if delta.abs() > REBASE_THRESHOLD {
            self.rebase(message.timestamp);
            delta = 0;
        }

        self.buf.push(TYPE_SSYNC);
        self.buf.extend_from_slice(&(delta as i32).to_be_bytes());
        self.buf.extend_from_slice(frame_bytes(message));

        if self.buf.len() > FLUSH_THRESHOLD {
            self.flush().await;
        }
    }

    /// Send whatever is pending and reset the packet, swallowing socket
    /// errors (a dropped UDP datagram is not worth tearing down the
    /// control channel over).
    pub async fn flush(&mut self) -> usize {
        if self.buf.is_empty() {
            return 0;
        }

        let sent = self.buf.len();
        if let Err(e) = self.socket.send(&self.buf).await {
            warn!(error = %e, "udp: send failed, dropping packet");
        } else {
            self.bytes_sent += sent as u64;
        }

        self.buf.clear();
        self.base_timestamp = None;
        self.seq = self.seq.wrapping_add(1);
        sent
    }

    /// Drains the cumulative bytes actually handed to the socket since
    /// the last call (spec §4.B's `server_udp_bytes` counter).
    pub fn take_bytes_sent(&mut self) -> u64 {
        std::mem::take(&mut self.bytes_sent)
    }
}

impl std::fmt::Display for UdpServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{Frame, MessageKind};

    fn msg(timestamp: u64, len: usize) -> Message {
        Message {
            kind: MessageKind::ModeS {
                df: 17,
                address: Some(0xABCDEF),
                even_cpr: false,
                odd_cpr: false,
                altitude: None,
                nuc: 0,
                valid: true,
            },
            timestamp,
            frame: Frame::new(&vec![0u8; len]),
        }
    }

    #[tokio::test]
    async fn send_mlat_short_frame_flushes_past_threshold() {
        let mut conn = UdpServerConnection::connect("127.0.0.1".to_string(), 65500, 42)
            .await
            .unwrap();
        for i in 0..200u64 {
            conn.send_mlat(&msg(1000 + i, 7)).await;
        }
        assert!(conn.buf.len() <= FLUSH_THRESHOLD + 32);
    }

    #[tokio::test]
    async fn rebase_triggers_on_large_delta() {
        let mut conn = UdpServerConnection::connect("127.0.0.1".to_string(), 65501, 1)
            .await
            .unwrap();
        conn.send_mlat(&msg(0, 7)).await;
        let before = conn.buf.len();
        conn.send_mlat(&msg(0x7FFF_FFFF_0000, 7)).await;
        assert!(conn.buf.len() > before);
    }
}
