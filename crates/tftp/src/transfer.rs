//! Per-connection transfer engine.
//!
//! One [`Conn`] binds one remote transfer id. On top of it sit the two
//! state machines: [`Outbound`] pushes DATA windows and consumes ACKs
//! (RRQ on the server, WRQ on the client), [`Inbound`] consumes DATA in
//! block order and produces ACKs (WRQ on the server, RRQ on the client).
//!
//! Both machines are strictly sequential: one outstanding window, one
//! deadline. Waits use absolute deadlines so that a duplicate packet does
//! not reset the timer, and the per-packet retry budget is replenished only
//! by real progress (an advancing ACK or the expected DATA block).

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::netascii;
use crate::options::{self, TransferOptions};
use crate::protocol::{DATA_HEADER_LEN, ErrorCode, MAX_BLOCK_SIZE, Mode, Opcode, Packet, error_packet};
use crate::window::{AckOutcome, SendWindow};

/// Largest datagram a transfer can legally receive.
pub(crate) const MAX_DATAGRAM: usize = DATA_HEADER_LEN + MAX_BLOCK_SIZE as usize;

/// Datagram source/sink for one transfer.
pub(crate) enum Transport {
    /// Dedicated (usually ephemeral) socket owned by this transfer.
    Socket(UdpSocket),
    /// Single-port mode: the listener socket is shared and the dispatcher
    /// routes this peer's datagrams through `queue`.
    Shared {
        socket: Arc<UdpSocket>,
        queue: mpsc::Receiver<(SocketAddr, Vec<u8>)>,
    },
}

impl Transport {
    async fn send_to(&self, buf: &[u8], peer: SocketAddr) -> io::Result<()> {
        match self {
            Self::Socket(socket) => {
                socket.send_to(buf, peer).await?;
            }
            Self::Shared { socket, .. } => {
                socket.send_to(buf, peer).await?;
            }
        }
        Ok(())
    }

    async fn recv_from(&mut self, cap: usize) -> io::Result<(SocketAddr, Vec<u8>)> {
        match self {
            Self::Socket(socket) => {
                let mut buf = vec![0u8; cap];
                let (len, src) = socket.recv_from(&mut buf).await?;
                buf.truncate(len);
                Ok((src, buf))
            }
            Self::Shared { queue, .. } => queue
                .recv()
                .await
                .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "server dispatcher closed")),
        }
    }
}

/// One bound peer plus the agreed transfer parameters.
pub(crate) struct Conn {
    transport: Transport,
    remote: SocketAddr,
    latched: bool,
    options: TransferOptions,
}

impl Conn {
    /// Connection to a known peer TID (server side).
    pub(crate) fn new(transport: Transport, remote: SocketAddr, options: TransferOptions) -> Self {
        Self {
            transport,
            remote,
            latched: true,
            options,
        }
    }

    /// Connection whose peer TID is learned from the first valid reply:
    /// a client talks to port 69 but the server answers from a fresh
    /// ephemeral port.
    pub(crate) fn to_server(transport: Transport, server: SocketAddr, options: TransferOptions) -> Self {
        Self {
            transport,
            remote: server,
            latched: false,
            options,
        }
    }

    pub(crate) fn options(&self) -> &TransferOptions {
        &self.options
    }

    pub(crate) fn set_options(&mut self, options: TransferOptions) {
        self.options = options;
    }

    pub(crate) async fn send(&self, packet: &Packet) -> Result<()> {
        trace!(peer = %self.remote, packet = %packet.opcode(), "send");
        self.transport.send_to(&packet.encode(), self.remote).await?;
        Ok(())
    }

    /// Best-effort ERROR to the bound peer; failures are only logged since
    /// the transfer is being torn down anyway.
    pub(crate) async fn send_error(&self, code: ErrorCode, message: &str) {
        let packet = Packet::Error {
            code,
            message: message.to_string(),
        };
        if let Err(err) = self.transport.send_to(&packet.encode(), self.remote).await {
            debug!(peer = %self.remote, "failed to send error packet: {}", err);
        }
    }

    /// Receive the next packet from the bound peer.
    ///
    /// Datagrams from any other source are answered with ERROR 5 (unknown
    /// transfer id) and skipped; datagrams that fail to decode are dropped
    /// without a reply.
    pub(crate) async fn recv(&mut self) -> Result<Packet> {
        // A legal datagram is at most one DATA header plus the negotiated
        // block size; the 512 floor leaves room for OACK and ERROR packets.
        let cap = DATA_HEADER_LEN + usize::from(self.options.blksize).max(512);
        loop {
            let (src, datagram) = self.transport.recv_from(cap).await?;
            if src != self.remote && (self.latched || src.ip() != self.remote.ip()) {
                debug!(%src, "datagram from unknown transfer id");
                let reply = error_packet(ErrorCode::UnknownTransferId);
                if let Err(err) = self.transport.send_to(&reply.encode(), src).await {
                    debug!("failed to answer unknown transfer id: {}", err);
                }
                continue;
            }
            match Packet::decode(&datagram) {
                Ok(packet) => {
                    if !self.latched {
                        self.remote = src;
                        self.latched = true;
                    }
                    trace!(peer = %src, packet = %packet.opcode(), "recv");
                    return Ok(packet);
                }
                Err(err) => {
                    debug!(peer = %src, "dropping malformed datagram: {}", err);
                }
            }
        }
    }

    /// Receive until `deadline`; `Ok(None)` means the deadline passed.
    pub(crate) async fn recv_until(&mut self, deadline: Instant) -> Result<Option<Packet>> {
        match timeout_at(deadline, self.recv()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.options.interval()
    }
}

/// Send side of a transfer: windowed DATA out, ACKs in.
pub(crate) struct Outbound {
    conn: Conn,
    window: SendWindow,
    /// Bytes accepted from the caller but not yet assigned to a block.
    staged: BytesMut,
    /// Server side: OACK body owed to the peer before any DATA.
    oack: Option<Vec<(String, String)>>,
    /// The request asked for `tsize`; append the handler-supplied size to
    /// the OACK when it was set before the transfer started.
    tsize_requested: bool,
    tsize: Option<u64>,
    started: bool,
    finished: bool,
    retries_left: u32,
}

impl Outbound {
    pub(crate) fn new(conn: Conn, oack: Option<Vec<(String, String)>>, tsize_requested: bool) -> Self {
        let retransmit = conn.options().retransmit;
        let windowsize = conn.options().windowsize as usize;
        Self {
            window: SendWindow::new(1, windowsize),
            conn,
            staged: BytesMut::new(),
            oack,
            tsize_requested,
            tsize: None,
            started: false,
            finished: false,
            retries_left: retransmit,
        }
    }

    pub(crate) fn options(&self) -> &TransferOptions {
        self.conn.options()
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished
    }

    /// Record the transfer size for `tsize` advertisement. Only honored
    /// before the first write starts the transfer.
    pub(crate) fn set_size(&mut self, size: u64) {
        if !self.started {
            self.tsize = Some(size);
        }
    }

    /// Stage payload bytes and send every full block they complete,
    /// blocking on ACKs whenever the window fills up.
    pub(crate) async fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.finished {
            return Err(Error::Cancelled("write after transfer completed".to_string()));
        }
        self.begin().await?;
        match self.conn.options().mode {
            Mode::Netascii => netascii::encode_into(data, &mut self.staged),
            Mode::Octet => self.staged.extend_from_slice(data),
        }
        let blksize = usize::from(self.conn.options().blksize);
        while self.staged.len() >= blksize {
            if self.window.is_full() {
                self.await_acks(false).await?;
                continue;
            }
            let payload = self.staged.split_to(blksize).freeze();
            self.send_block(payload).await?;
        }
        Ok(())
    }

    /// Flush the remainder as the final short block (empty when the payload
    /// is an exact multiple of the block size) and wait for the last ACK.
    pub(crate) async fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.begin().await?;
        let blksize = usize::from(self.conn.options().blksize);
        loop {
            if self.window.is_full() {
                self.await_acks(false).await?;
                continue;
            }
            if self.staged.len() >= blksize {
                let payload = self.staged.split_to(blksize).freeze();
                self.send_block(payload).await?;
            } else {
                let payload = self.staged.split().freeze();
                self.send_block(payload).await?;
                break;
            }
        }
        while !self.window.is_empty() {
            self.await_acks(true).await?;
        }
        self.finished = true;
        Ok(())
    }

    /// Abandon the transfer, telling the peer why.
    pub(crate) async fn abort(&mut self, code: ErrorCode, message: &str) {
        if !self.finished {
            self.conn.send_error(code, message).await;
            self.finished = true;
        }
    }

    async fn begin(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        self.started = true;
        if let Some(mut reply) = self.oack.take() {
            if self.tsize_requested
                && let Some(size) = self.tsize
            {
                reply.push((options::OPT_TSIZE.to_string(), size.to_string()));
            }
            if !reply.is_empty() {
                self.send_oack(reply).await?;
            }
        }
        Ok(())
    }

    /// Send the OACK and wait for the peer's ACK(0).
    async fn send_oack(&mut self, reply: Vec<(String, String)>) -> Result<()> {
        let oack = Packet::Oack { options: reply };
        self.conn.send(&oack).await?;
        let mut deadline = self.conn.deadline();
        loop {
            match self.conn.recv_until(deadline).await? {
                None => {
                    if self.retries_left == 0 {
                        self.conn.send_error(ErrorCode::NotDefined, "retransmit exceeded").await;
                        return Err(Error::RetransmitExceeded);
                    }
                    self.retries_left -= 1;
                    self.conn.send(&oack).await?;
                    deadline = self.conn.deadline();
                }
                Some(Packet::Ack { block: 0 }) => {
                    self.retries_left = self.conn.options().retransmit;
                    return Ok(());
                }
                Some(Packet::Ack { .. }) => {}
                Some(Packet::Rrq(_)) | Some(Packet::Wrq(_)) => {
                    // The request was retransmitted while we were answering it.
                }
                Some(Packet::Error { code, message }) => return Err(Error::Peer { code, message }),
                Some(other) => {
                    self.conn
                        .send_error(ErrorCode::IllegalOperation, "unexpected packet")
                        .await;
                    return Err(Error::Protocol {
                        opcode: other.opcode(),
                        state: "awaiting option acknowledgment",
                    });
                }
            }
        }
    }

    /// Wait for ACKs. Returns once the window is empty, or, when
    /// `until_empty` is false, as soon as it has room again.
    async fn await_acks(&mut self, until_empty: bool) -> Result<()> {
        let mut deadline = self.conn.deadline();
        loop {
            match self.conn.recv_until(deadline).await? {
                None => {
                    if self.retries_left == 0 {
                        self.conn.send_error(ErrorCode::NotDefined, "retransmit exceeded").await;
                        return Err(Error::RetransmitExceeded);
                    }
                    self.retries_left -= 1;
                    debug!(
                        base = self.window.base(),
                        in_flight = self.window.len(),
                        "ack timeout, resending window"
                    );
                    self.resend_window().await?;
                    deadline = self.conn.deadline();
                }
                Some(Packet::Ack { block }) => match self.window.on_ack(block) {
                    AckOutcome::Complete => {
                        self.retries_left = self.conn.options().retransmit;
                        return Ok(());
                    }
                    AckOutcome::Partial => {
                        // The peer missed a block: everything above the
                        // acknowledged one goes out again.
                        self.retries_left = self.conn.options().retransmit;
                        debug!(acked = block, resend_from = self.window.base(), "partial ack, rolling back");
                        self.resend_window().await?;
                        deadline = self.conn.deadline();
                        if !until_empty && !self.window.is_full() {
                            return Ok(());
                        }
                    }
                    AckOutcome::Stale => {
                        trace!(block, "stale ack");
                    }
                },
                Some(Packet::Oack { .. }) => {
                    // The peer repeated its OACK: our first window never
                    // arrived. Counts against the budget like a timeout.
                    if self.retries_left == 0 {
                        self.conn.send_error(ErrorCode::NotDefined, "retransmit exceeded").await;
                        return Err(Error::RetransmitExceeded);
                    }
                    self.retries_left -= 1;
                    self.resend_window().await?;
                    deadline = self.conn.deadline();
                }
                Some(Packet::Rrq(_)) | Some(Packet::Wrq(_)) => {}
                Some(Packet::Error { code, message }) => return Err(Error::Peer { code, message }),
                Some(other) => {
                    self.conn
                        .send_error(ErrorCode::IllegalOperation, "unexpected packet")
                        .await;
                    return Err(Error::Protocol {
                        opcode: other.opcode(),
                        state: "awaiting acknowledgment",
                    });
                }
            }
        }
    }

    async fn resend_window(&mut self) -> Result<()> {
        let conn = &self.conn;
        for (block, payload) in self.window.unacked() {
            conn.send(&Packet::Data {
                block,
                payload: payload.clone(),
            })
            .await?;
        }
        Ok(())
    }

    async fn send_block(&mut self, payload: Bytes) -> Result<()> {
        let block = self.window.push(payload.clone());
        self.conn.send(&Packet::Data { block, payload }).await
    }
}

/// Receive side of a transfer: DATA in block order in, ACKs out.
pub(crate) struct Inbound {
    conn: Conn,
    /// Packet to repeat while no DATA has arrived yet: the OACK (server
    /// side) or ACK(0).
    opening: Packet,
    next_block: u16,
    /// In-order blocks accepted since the last ACK went out.
    since_ack: u16,
    /// Decoded bytes not yet handed to the reader.
    ready: BytesMut,
    decoder: Option<netascii::Decoder>,
    got_data: bool,
    finished: bool,
    retries_left: u32,
}

impl Inbound {
    pub(crate) fn new(conn: Conn, opening: Packet) -> Self {
        let retransmit = conn.options().retransmit;
        let decoder = (conn.options().mode == Mode::Netascii).then(netascii::Decoder::new);
        Self {
            conn,
            opening,
            next_block: 1,
            since_ack: 0,
            ready: BytesMut::new(),
            decoder,
            got_data: false,
            finished: false,
            retries_left: retransmit,
        }
    }

    pub(crate) fn options(&self) -> &TransferOptions {
        self.conn.options()
    }

    /// Whether the wire-level transfer has ended (final block acknowledged
    /// or the transfer was aborted).
    pub(crate) fn is_finished(&self) -> bool {
        self.finished
    }

    /// Read received payload bytes in block order. Returns `Ok(0)` at end
    /// of transfer.
    pub(crate) async fn read(&mut self, out: &mut [u8]) -> Result<usize> {
        while self.ready.is_empty() {
            if self.finished {
                return Ok(0);
            }
            self.fill().await?;
        }
        let n = out.len().min(self.ready.len());
        out[..n].copy_from_slice(&self.ready[..n]);
        self.ready.advance(n);
        Ok(n)
    }

    /// Abandon the transfer, telling the peer why.
    pub(crate) async fn abort(&mut self, code: ErrorCode, message: &str) {
        if !self.finished {
            self.conn.send_error(code, message).await;
            self.finished = true;
            self.ready.clear();
        }
    }

    /// Wait for the next block worth of progress.
    async fn fill(&mut self) -> Result<()> {
        let mut deadline = self.conn.deadline();
        loop {
            match self.conn.recv_until(deadline).await? {
                None => {
                    if self.retries_left == 0 {
                        self.conn.send_error(ErrorCode::NotDefined, "retransmit exceeded").await;
                        return Err(Error::RetransmitExceeded);
                    }
                    self.retries_left -= 1;
                    if self.got_data {
                        // Re-ACK the newest in-order block; the sender rolls
                        // its window back to the block after it.
                        let last = self.next_block.wrapping_sub(1);
                        debug!(block = last, "data timeout, re-acknowledging");
                        self.since_ack = 0;
                        self.conn.send(&Packet::Ack { block: last }).await?;
                    } else {
                        self.conn.send(&self.opening).await?;
                    }
                    deadline = self.conn.deadline();
                }
                Some(Packet::Data { block, payload }) => {
                    if self.accept_data(block, payload).await? {
                        return Ok(());
                    }
                    // Duplicate or gap: the deadline deliberately stands.
                }
                Some(Packet::Ack { block: 0 }) if !self.got_data => {
                    // Some peers answer an OACK with ACK(0); tolerated.
                }
                Some(Packet::Oack { .. }) if !self.got_data => {
                    // Our ACK(0) was lost and the server repeated its OACK.
                    self.conn.send(&self.opening).await?;
                }
                Some(Packet::Error { code, message }) => return Err(Error::Peer { code, message }),
                Some(Packet::Rrq(_)) | Some(Packet::Wrq(_)) => {
                    // Retransmitted request routed to a live transfer; drop.
                }
                Some(other) => {
                    self.conn
                        .send_error(ErrorCode::IllegalOperation, "unexpected packet")
                        .await;
                    return Err(Error::Protocol {
                        opcode: other.opcode(),
                        state: "awaiting data",
                    });
                }
            }
        }
    }

    /// Apply a DATA packet. Returns true when it was the expected block.
    pub(crate) async fn accept_data(&mut self, block: u16, payload: Bytes) -> Result<bool> {
        let blksize = self.conn.options().blksize;
        if payload.len() > usize::from(blksize) {
            self.conn
                .send_error(ErrorCode::IllegalOperation, "data block exceeds negotiated size")
                .await;
            return Err(Error::Protocol {
                opcode: Opcode::Data,
                state: "awaiting data",
            });
        }

        let offset = block.wrapping_sub(self.next_block);
        if offset == 0 {
            match &mut self.decoder {
                Some(decoder) => decoder.decode_into(&payload, &mut self.ready),
                None => self.ready.extend_from_slice(&payload),
            }
            self.got_data = true;
            self.next_block = self.next_block.wrapping_add(1);
            self.since_ack += 1;
            let short = payload.len() < usize::from(blksize);
            if short {
                if let Some(decoder) = &mut self.decoder {
                    decoder.finish(&mut self.ready);
                }
                self.send_ack(block).await?;
                self.finished = true;
            } else if self.since_ack >= self.conn.options().windowsize {
                self.send_ack(block).await?;
            }
            self.retries_left = self.conn.options().retransmit;
            Ok(true)
        } else if offset < 0x8000 {
            // A block went missing inside the window; ACK the newest
            // in-order block to make the sender roll back.
            debug!(block, expected = self.next_block, "gap in window, forcing rollback");
            let last = self.next_block.wrapping_sub(1);
            self.send_ack(last).await?;
            Ok(false)
        } else {
            // Duplicate of an already-delivered block. Re-ACK it so a
            // sender stuck on a lost ACK can make progress, but never
            // deliver it again.
            trace!(block, "duplicate data block");
            self.conn.send(&Packet::Ack { block }).await?;
            Ok(false)
        }
    }

    async fn send_ack(&mut self, block: u16) -> Result<()> {
        self.since_ack = 0;
        self.conn.send(&Packet::Ack { block }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pair() -> (UdpSocket, UdpSocket, SocketAddr, SocketAddr) {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let a_addr = a.local_addr().unwrap();
        let b_addr = b.local_addr().unwrap();
        (a, b, a_addr, b_addr)
    }

    async fn recv_packet(socket: &UdpSocket) -> (Packet, SocketAddr) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (len, src) = socket.recv_from(&mut buf).await.unwrap();
        (Packet::decode(&buf[..len]).unwrap(), src)
    }

    #[tokio::test]
    async fn outbound_ends_on_short_block() {
        let (peer, local, peer_addr, _) = pair().await;
        let conn = Conn::new(Transport::Socket(local), peer_addr, TransferOptions::default());
        let mut outbound = Outbound::new(conn, None, false);

        let driver = tokio::spawn(async move {
            outbound.write(&[7u8; 700]).await.unwrap();
            outbound.finish().await.unwrap();
        });

        let (packet, from) = recv_packet(&peer).await;
        match packet {
            Packet::Data { block: 1, payload } => assert_eq!(payload.len(), 512),
            other => panic!("expected DATA(1), got {:?}", other),
        }
        peer.send_to(&Packet::Ack { block: 1 }.encode(), from).await.unwrap();

        let (packet, _) = recv_packet(&peer).await;
        match packet {
            Packet::Data { block: 2, payload } => assert_eq!(payload.len(), 188),
            other => panic!("expected short DATA(2), got {:?}", other),
        }
        peer.send_to(&Packet::Ack { block: 2 }.encode(), from).await.unwrap();

        driver.await.unwrap();
    }

    #[tokio::test]
    async fn outbound_rolls_back_on_partial_ack() {
        let (peer, local, peer_addr, _) = pair().await;
        let options = TransferOptions {
            windowsize: 4,
            ..Default::default()
        };
        let conn = Conn::new(Transport::Socket(local), peer_addr, options);
        let mut outbound = Outbound::new(conn, None, false);

        let driver = tokio::spawn(async move {
            outbound.write(&[3u8; 6 * 512 + 100]).await.unwrap();
            outbound.finish().await.unwrap();
        });

        // First window: blocks 1..=4.
        let mut from = None;
        for expect in 1u16..=4 {
            let (packet, src) = recv_packet(&peer).await;
            from = Some(src);
            assert!(matches!(packet, Packet::Data { block, .. } if block == expect));
        }
        let from = from.unwrap();

        // Pretend block 3 was lost: a partial ACK for 2 forces the sender
        // to resend 3 and 4 before it may send anything new.
        peer.send_to(&Packet::Ack { block: 2 }.encode(), from).await.unwrap();
        for expect in [3u16, 4, 5, 6] {
            let (packet, _) = recv_packet(&peer).await;
            assert!(matches!(packet, Packet::Data { block, .. } if block == expect));
        }
        peer.send_to(&Packet::Ack { block: 6 }.encode(), from).await.unwrap();

        let (packet, _) = recv_packet(&peer).await;
        match packet {
            Packet::Data { block: 7, payload } => assert_eq!(payload.len(), 100),
            other => panic!("expected short DATA(7), got {:?}", other),
        }
        peer.send_to(&Packet::Ack { block: 7 }.encode(), from).await.unwrap();

        driver.await.unwrap();
    }

    #[tokio::test]
    async fn inbound_delivers_duplicate_block_once() {
        let (peer, local, peer_addr, local_addr) = pair().await;
        let conn = Conn::new(Transport::Socket(local), peer_addr, TransferOptions::default());
        let mut inbound = Inbound::new(conn, Packet::Ack { block: 0 });

        let reader = tokio::spawn(async move {
            let mut received = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = inbound.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
            }
            received
        });

        let full = Packet::Data {
            block: 1,
            payload: Bytes::from(vec![b'a'; 512]),
        };
        peer.send_to(&full.encode(), local_addr).await.unwrap();
        let (packet, _) = recv_packet(&peer).await;
        assert_eq!(packet, Packet::Ack { block: 1 });

        // Back-to-back duplicate: re-ACKed, not re-delivered.
        peer.send_to(&full.encode(), local_addr).await.unwrap();
        let (packet, _) = recv_packet(&peer).await;
        assert_eq!(packet, Packet::Ack { block: 1 });

        let short = Packet::Data {
            block: 2,
            payload: Bytes::from_static(b"end"),
        };
        peer.send_to(&short.encode(), local_addr).await.unwrap();
        let (packet, _) = recv_packet(&peer).await;
        assert_eq!(packet, Packet::Ack { block: 2 });

        let received = reader.await.unwrap();
        assert_eq!(received.len(), 512 + 3);
        assert_eq!(&received[512..], b"end");
    }

    #[tokio::test]
    async fn inbound_answers_unknown_tid_with_error() {
        let (peer, local, peer_addr, local_addr) = pair().await;
        let conn = Conn::new(Transport::Socket(local), peer_addr, TransferOptions::default());
        let mut inbound = Inbound::new(conn, Packet::Ack { block: 0 });

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let mut total = 0;
            loop {
                let n = inbound.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                total += n;
            }
            total
        });

        let intruder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        intruder
            .send_to(&Packet::Ack { block: 9 }.encode(), local_addr)
            .await
            .unwrap();
        let (packet, _) = recv_packet(&intruder).await;
        assert!(matches!(
            packet,
            Packet::Error {
                code: ErrorCode::UnknownTransferId,
                ..
            }
        ));

        // The bound transfer is unaffected.
        let short = Packet::Data {
            block: 1,
            payload: Bytes::from_static(b"done"),
        };
        peer.send_to(&short.encode(), local_addr).await.unwrap();
        let (packet, _) = recv_packet(&peer).await;
        assert_eq!(packet, Packet::Ack { block: 1 });

        assert_eq!(reader.await.unwrap(), 4);
    }

    #[tokio::test]
    async fn inbound_forces_rollback_on_gap() {
        let (peer, local, peer_addr, local_addr) = pair().await;
        let options = TransferOptions {
            windowsize: 4,
            ..Default::default()
        };
        let conn = Conn::new(Transport::Socket(local), peer_addr, options);
        let mut inbound = Inbound::new(conn, Packet::Ack { block: 0 });

        let reader = tokio::spawn(async move {
            let mut received = Vec::new();
            let mut buf = [0u8; 2048];
            loop {
                let n = inbound.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
            }
            received
        });

        let block = |n: u16, fill: u8| Packet::Data {
            block: n,
            payload: Bytes::from(vec![fill; 512]),
        };

        peer.send_to(&block(1, b'1').encode(), local_addr).await.unwrap();
        peer.send_to(&block(2, b'2').encode(), local_addr).await.unwrap();
        // Block 3 "lost"; 4 arrives out of order.
        peer.send_to(&block(4, b'4').encode(), local_addr).await.unwrap();
        let (packet, _) = recv_packet(&peer).await;
        assert_eq!(packet, Packet::Ack { block: 2 });

        // Rolled-back window: 3, 4, then the short end in 5.
        peer.send_to(&block(3, b'3').encode(), local_addr).await.unwrap();
        peer.send_to(&block(4, b'4').encode(), local_addr).await.unwrap();
        let tail = Packet::Data {
            block: 5,
            payload: Bytes::from_static(b"tail"),
        };
        peer.send_to(&tail.encode(), local_addr).await.unwrap();
        let (packet, _) = recv_packet(&peer).await;
        assert_eq!(packet, Packet::Ack { block: 5 });

        let received = reader.await.unwrap();
        assert_eq!(received.len(), 4 * 512 + 4);
        assert_eq!(received[0], b'1');
        assert_eq!(received[512], b'2');
        assert_eq!(received[1024], b'3');
        assert_eq!(received[1536], b'4');
        assert_eq!(&received[2048..], b"tail");
    }
}
