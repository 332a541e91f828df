//! BEP-9/10 `ut_metadata` exchange with a single peer.

use anyhow::Context;
use bytes::Bytes;
use rbit::peer::{
    ExtensionHandshake, ExtensionMessage, METADATA_PIECE_SIZE, Message, MetadataMessage,
    MetadataMessageType, PeerConnection, PeerId, metadata_piece_size,
};
use std::net::SocketAddr;
use tokio::time::{Duration, Instant, timeout};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(6);

/// A connected peer that has agreed to speak `ut_metadata`.
pub struct MetadataPeer {
    addr: SocketAddr,
    conn: PeerConnection,
    ut_metadata_id: u8,
    total_size: Option<u32>,
}

impl MetadataPeer {
    pub async fn connect(
        addr: SocketAddr,
        info_hash: [u8; 20],
        connect_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let peer_id = *PeerId::generate().as_bytes();
        let mut conn = timeout(connect_timeout, PeerConnection::connect(addr, info_hash, peer_id))
            .await
            .context("peer connect timed out")??;

        if !conn.supports_extension {
            anyhow::bail!("peer does not support BEP-10");
        }

        let mut hs = ExtensionHandshake::with_extensions(&[("ut_metadata", 1)]);
        hs.client = Some("lodestone".to_string());
        let payload = hs.encode()?;
        conn.send(Message::Extended { id: 0, payload }).await?;

        let (ut_metadata_id, total_size) = wait_for_peer_handshake(&mut conn).await?;
        Ok(Self {
            addr,
            conn,
            ut_metadata_id,
            total_size,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Size the peer declared in its extension handshake, if any.
    pub fn metadata_size(&self) -> Option<u64> {
        self.total_size.map(u64::from).filter(|&n| n > 0)
    }

    /// Pulls every metadata piece. Sizes above `max_size` are refused.
    pub async fn fetch(mut self, max_size: u64, within: Duration) -> anyhow::Result<Vec<u8>> {
        let deadline = Instant::now() + within;

        if self.total_size.is_none() {
            // Piece 0 carries the total size.
            request_piece(&mut self.conn, self.ut_metadata_id, 0).await?;
            let msg = recv_metadata_msg(&mut self.conn, self.ut_metadata_id, deadline).await?;
            if msg.msg_type != MetadataMessageType::Data {
                anyhow::bail!("peer did not send metadata data for piece 0");
            }
            self.total_size = msg.total_size;
        }

        let total_size = self.total_size.context("missing metadata total_size")? as usize;
        if total_size as u64 > max_size {
            anyhow::bail!("metadata size {total_size} exceeds limit {max_size}");
        }
        let count = piece_count(total_size);
        if count == 0 {
            anyhow::bail!("metadata has zero pieces");
        }

        for piece in 0..count {
            request_piece(&mut self.conn, self.ut_metadata_id, piece as u32).await?;
        }

        let mut pieces: Vec<Option<Bytes>> = vec![None; count];
        while pieces.iter().any(Option::is_none) {
            let msg = recv_metadata_msg(&mut self.conn, self.ut_metadata_id, deadline).await?;
            if msg.msg_type == MetadataMessageType::Reject {
                anyhow::bail!("peer rejected metadata piece {}", msg.piece);
            }
            if msg.msg_type != MetadataMessageType::Data {
                continue;
            }
            let Some(data) = msg.data else {
                continue;
            };
            if let Some(slot) = pieces.get_mut(msg.piece as usize) {
                *slot = Some(data);
            }
        }

        assemble(pieces, total_size)
    }
}

/// Connects to `addr` and fetches the full metadata for `info_hash`.
pub async fn fetch_ut_metadata(
    addr: SocketAddr,
    info_hash: [u8; 20],
    connect_timeout: Duration,
    max_size: u64,
    within: Duration,
) -> anyhow::Result<Vec<u8>> {
    let started = Instant::now();
    let peer = MetadataPeer::connect(addr, info_hash, connect_timeout).await?;
    let left = within.saturating_sub(started.elapsed());
    peer.fetch(max_size, left).await
}

fn piece_count(total_size: usize) -> usize {
    total_size.div_ceil(METADATA_PIECE_SIZE)
}

fn assemble(pieces: Vec<Option<Bytes>>, total_size: usize) -> anyhow::Result<Vec<u8>> {
    let mut out = vec![0u8; total_size];
    for (piece, maybe_data) in pieces.into_iter().enumerate() {
        let data = maybe_data.context("missing piece data")?;
        let expected = metadata_piece_size(piece as u32, total_size);
        if data.len() < expected {
            anyhow::bail!("metadata piece {piece} short: {} < {expected}", data.len());
        }
        let offset = piece * METADATA_PIECE_SIZE;
        let to_copy = expected.min(out.len().saturating_sub(offset));
        out[offset..offset + to_copy].copy_from_slice(&data[..to_copy]);
    }
    Ok(out)
}

async fn wait_for_peer_handshake(conn: &mut PeerConnection) -> anyhow::Result<(u8, Option<u32>)> {
    let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
    loop {
        let now = Instant::now();
        if now >= deadline {
            anyhow::bail!("timed out waiting for extension handshake");
        }
        let msg = timeout(deadline - now, conn.receive()).await??;
        let Message::Extended { id, payload } = msg else {
            continue;
        };
        let ExtensionMessage::Handshake(peer_hs) = ExtensionMessage::decode(id, payload.as_ref())? else {
            continue;
        };
        let Some(ut_id) = peer_hs.get_extension_id("ut_metadata") else {
            anyhow::bail!("peer did not advertise ut_metadata");
        };
        let total = peer_hs.metadata_size.and_then(|v| u32::try_from(v).ok());
        return Ok((ut_id, total));
    }
}

async fn request_piece(conn: &mut PeerConnection, ut_metadata_id: u8, piece: u32) -> anyhow::Result<()> {
    let payload = MetadataMessage::request(piece).encode()?;
    conn.send(Message::Extended {
        id: ut_metadata_id,
        payload,
    })
    .await?;
    Ok(())
}

// Other messages (bitfield, have, keep-alive) may arrive in between.
async fn recv_metadata_msg(
    conn: &mut PeerConnection,
    ut_metadata_id: u8,
    deadline: Instant,
) -> anyhow::Result<MetadataMessage> {
    loop {
        let now = Instant::now();
        if now >= deadline {
            anyhow::bail!("timed out waiting for ut_metadata message");
        }
        let msg = timeout(deadline - now, conn.receive()).await??;
        let Message::Extended { id, payload } = msg else {
            continue;
        };
        if id != ut_metadata_id {
            continue;
        }
        return Ok(MetadataMessage::decode(payload.as_ref())?);
    }
}
