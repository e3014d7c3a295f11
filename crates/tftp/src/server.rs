//! Server dispatcher.
//!
//! A [`Server`] owns the well-known request socket. Its receive loop copies
//! every datagram out of the shared buffer and hands it to a fresh task;
//! each valid RRQ/WRQ then runs on its own ephemeral socket, which becomes
//! the transfer id the peer talks to. A stalled transfer therefore never
//! blocks the listener or other transfers.
//!
//! Read and write capability are registered independently. A request for an
//! unregistered capability is answered with wire error 4; a request with
//! unsatisfiable options with wire error 8; malformed datagrams are dropped
//! without a reply.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::options::{self, TransferOptions};
use crate::protocol::{ErrorCode, Mode, Packet, Request};
use crate::transfer::{Conn, Inbound, MAX_DATAGRAM, Outbound, Transport};

/// Default bind address: all interfaces, the well-known TFTP port.
pub const DEFAULT_BIND: &str = "0.0.0.0:69";

/// Datagrams buffered per transfer in single-port mode before the
/// dispatcher starts shedding (sheds like packet loss, so transfers recover).
const ROUTE_QUEUE: usize = 64;

/// Serves read requests: the handler writes the file's bytes into the
/// request, which drives DATA packets to the peer.
///
/// Handlers are shared across concurrent transfers and must be reentrant.
#[async_trait]
pub trait ReadHandler: Send + Sync {
    async fn serve(&self, request: &mut ReadRequest) -> Result<()>;
}

/// Receives write requests: the handler reads the peer's bytes out of the
/// request until it returns 0 at end of transfer.
///
/// Handlers are shared across concurrent transfers and must be reentrant.
#[async_trait]
pub trait WriteHandler: Send + Sync {
    async fn receive(&self, request: &mut WriteRequest) -> Result<()>;
}

/// An accepted RRQ, handed to the [`ReadHandler`].
pub struct ReadRequest {
    name: String,
    mode: Mode,
    remote: SocketAddr,
    outbound: Outbound,
}

impl ReadRequest {
    /// Requested file name, exactly as sent by the peer.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Options agreed with the peer.
    pub fn options(&self) -> &TransferOptions {
        self.outbound.options()
    }

    /// Advertise the transfer size for `tsize`. Must be called before the
    /// first write to make it into the option acknowledgment.
    pub fn set_size(&mut self, size: u64) {
        self.outbound.set_size(size);
    }

    /// Write payload bytes toward the peer.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.outbound.write(data).await
    }
}

/// An accepted WRQ, handed to the [`WriteHandler`].
pub struct WriteRequest {
    name: String,
    mode: Mode,
    remote: SocketAddr,
    tsize: Option<u64>,
    inbound: Inbound,
}

impl WriteRequest {
    /// Target file name, exactly as sent by the peer.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Options agreed with the peer.
    pub fn options(&self) -> &TransferOptions {
        self.inbound.options()
    }

    /// Transfer size the peer advertised, if it sent `tsize`.
    pub fn size(&self) -> Option<u64> {
        self.tsize
    }

    /// Read received payload bytes in block order. Returns `Ok(0)` at end
    /// of transfer.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.inbound.read(buf).await
    }
}

#[derive(Clone)]
struct Handlers {
    read: Option<Arc<dyn ReadHandler>>,
    write: Option<Arc<dyn WriteHandler>>,
    retransmit: u32,
}

/// Handle for stopping a running [`Server`] from another task.
#[derive(Clone)]
pub struct Shutdown {
    closed: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Shutdown {
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

/// A TFTP server.
pub struct Server {
    bind_addr: String,
    retransmit: u32,
    single_port: bool,
    read_handler: Option<Arc<dyn ReadHandler>>,
    write_handler: Option<Arc<dyn WriteHandler>>,
    socket: Option<Arc<UdpSocket>>,
    closed: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl Server {
    /// Create a server that will listen on `bind_addr` (see
    /// [`DEFAULT_BIND`]).
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            retransmit: options::DEFAULT_RETRANSMIT,
            single_port: false,
            read_handler: None,
            write_handler: None,
            socket: None,
            closed: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Register the read (RRQ) handler.
    pub fn read_handler(&mut self, handler: impl ReadHandler + 'static) {
        self.read_handler = Some(Arc::new(handler));
    }

    /// Register the write (WRQ) handler.
    pub fn write_handler(&mut self, handler: impl WriteHandler + 'static) {
        self.write_handler = Some(Arc::new(handler));
    }

    /// Per-packet retransmission budget applied to every transfer.
    pub fn retransmit(&mut self, budget: u32) {
        self.retransmit = budget;
    }

    /// Run every transfer through the listener socket instead of an
    /// ephemeral socket per transfer, demultiplexing by peer address.
    /// Experimental.
    pub fn single_port(&mut self, enabled: bool) {
        self.single_port = enabled;
    }

    /// Bind the request socket without starting the receive loop.
    pub async fn listen(&mut self) -> Result<()> {
        let socket = UdpSocket::bind(&self.bind_addr).await?;
        info!("listening on {}", socket.local_addr()?);
        self.socket = Some(Arc::new(socket));
        Ok(())
    }

    /// Address of the bound request socket.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|socket| socket.local_addr().ok())
    }

    /// Handle for stopping the receive loop from another task.
    pub fn shutdown_handle(&self) -> Shutdown {
        Shutdown {
            closed: self.closed.clone(),
            notify: self.shutdown.clone(),
        }
    }

    /// Run the receive loop until [`Shutdown::close`] is called.
    pub async fn serve(&mut self) -> Result<()> {
        if self.read_handler.is_none() && self.write_handler.is_none() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no read or write handler registered",
            )
            .into());
        }
        if self.socket.is_none() {
            self.listen().await?;
        }
        let socket = self.socket.clone().expect("socket bound above");
        let handlers = Handlers {
            read: self.read_handler.clone(),
            write: self.write_handler.clone(),
            retransmit: self.retransmit,
        };
        if self.single_port {
            self.serve_single_port(socket, handlers).await
        } else {
            self.serve_spawning(socket, handlers).await
        }
    }

    async fn serve_spawning(&self, socket: Arc<UdpSocket>, handlers: Handlers) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let Some((len, src)) = self.recv_request(&socket, &mut buf).await? else {
                return Ok(());
            };
            // The shared receive buffer is reused; each request gets a copy.
            let datagram = buf[..len].to_vec();
            let handlers = handlers.clone();
            tokio::spawn(async move {
                let transfer_socket = match ephemeral_socket(src).await {
                    Ok(socket) => socket,
                    Err(err) => {
                        warn!(%src, "failed to bind transfer socket: {}", err);
                        return;
                    }
                };
                dispatch(handlers, Transport::Socket(transfer_socket), src, datagram).await;
            });
        }
    }

    async fn serve_single_port(&self, socket: Arc<UdpSocket>, handlers: Handlers) -> Result<()> {
        let mut routes: HashMap<SocketAddr, mpsc::Sender<(SocketAddr, Vec<u8>)>> = HashMap::new();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<SocketAddr>();
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            while let Ok(finished) = done_rx.try_recv() {
                routes.remove(&finished);
            }
            let Some((len, src)) = self.recv_request(&socket, &mut buf).await? else {
                return Ok(());
            };
            let datagram = buf[..len].to_vec();
            if let Some(route) = routes.get(&src) {
                if !route.is_closed() {
                    // Live transfer for this peer; also swallows the peer's
                    // retransmitted request instead of spawning a twin.
                    if route.try_send((src, datagram)).is_err() {
                        debug!(%src, "transfer queue full, dropping datagram");
                    }
                    continue;
                }
                routes.remove(&src);
            }
            let (route, queue) = mpsc::channel(ROUTE_QUEUE);
            routes.insert(src, route);
            let handlers = handlers.clone();
            let socket = socket.clone();
            let done = done_tx.clone();
            tokio::spawn(async move {
                dispatch(handlers, Transport::Shared { socket, queue }, src, datagram).await;
                let _ = done.send(src);
            });
        }
    }

    /// One iteration of the receive loop. `Ok(None)` means the server was
    /// closed; socket errors after close are swallowed.
    async fn recv_request(
        &self,
        socket: &UdpSocket,
        buf: &mut [u8],
    ) -> Result<Option<(usize, SocketAddr)>> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(None);
        }
        tokio::select! {
            _ = self.shutdown.notified() => Ok(None),
            received = socket.recv_from(buf) => match received {
                Ok(pair) => Ok(Some(pair)),
                Err(err) => {
                    if self.closed.load(Ordering::SeqCst) {
                        Ok(None)
                    } else {
                        Err(err.into())
                    }
                }
            },
        }
    }
}

async fn ephemeral_socket(peer: SocketAddr) -> io::Result<UdpSocket> {
    let bind_addr = match peer {
        SocketAddr::V4(_) => "0.0.0.0:0",
        SocketAddr::V6(_) => "[::]:0",
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    debug!("transfer socket bound to {}", socket.local_addr()?);
    Ok(socket)
}

async fn dispatch(handlers: Handlers, transport: Transport, src: SocketAddr, datagram: Vec<u8>) {
    let packet = match Packet::decode(&datagram) {
        Ok(packet) => packet,
        Err(err) => {
            debug!(%src, "dropping malformed request: {}", err);
            return;
        }
    };
    match packet {
        Packet::Rrq(request) => {
            info!(%src, file = %request.filename, mode = %request.mode, "read request");
            if let Err(err) = serve_read(handlers, transport, src, request).await {
                warn!(%src, "read transfer failed: {}", err);
            }
        }
        Packet::Wrq(request) => {
            info!(%src, file = %request.filename, mode = %request.mode, "write request");
            if let Err(err) = serve_write(handlers, transport, src, request).await {
                warn!(%src, "write transfer failed: {}", err);
            }
        }
        other => {
            debug!(%src, "ignoring {} on the request port", other.opcode());
        }
    }
}

async fn serve_read(
    handlers: Handlers,
    transport: Transport,
    src: SocketAddr,
    request: Request,
) -> Result<()> {
    let Some(handler) = handlers.read else {
        debug!("no read handler registered");
        let conn = Conn::new(transport, src, TransferOptions::default());
        conn.send_error(ErrorCode::IllegalOperation, "Server does not support read requests.")
            .await;
        return Ok(());
    };

    let negotiated = match options::negotiate(&request.options, false) {
        Ok(negotiated) => negotiated,
        Err(err) => {
            let conn = Conn::new(transport, src, TransferOptions::default());
            conn.send_error(ErrorCode::OptionNegotiation, &err.reason).await;
            return Err(err.into());
        }
    };

    let mut transfer_options = negotiated.options;
    transfer_options.mode = request.mode;
    transfer_options.retransmit = handlers.retransmit;
    let conn = Conn::new(transport, src, transfer_options);
    let outbound = Outbound::new(conn, Some(negotiated.reply), negotiated.tsize_requested);
    let mut read_request = ReadRequest {
        name: request.filename,
        mode: request.mode,
        remote: src,
        outbound,
    };

    match handler.serve(&mut read_request).await {
        Ok(()) => {
            read_request.outbound.finish().await?;
            info!(%src, file = %read_request.name, "read transfer complete");
            Ok(())
        }
        Err(err) => {
            if let Some((code, message)) = wire_error(&err) {
                read_request.outbound.abort(code, &message).await;
            }
            Err(err)
        }
    }
}

async fn serve_write(
    handlers: Handlers,
    transport: Transport,
    src: SocketAddr,
    request: Request,
) -> Result<()> {
    let Some(handler) = handlers.write else {
        debug!("no write handler registered");
        let conn = Conn::new(transport, src, TransferOptions::default());
        conn.send_error(ErrorCode::IllegalOperation, "Server does not support write requests.")
            .await;
        return Ok(());
    };

    let negotiated = match options::negotiate(&request.options, true) {
        Ok(negotiated) => negotiated,
        Err(err) => {
            let conn = Conn::new(transport, src, TransferOptions::default());
            conn.send_error(ErrorCode::OptionNegotiation, &err.reason).await;
            return Err(err.into());
        }
    };

    let mut transfer_options = negotiated.options;
    transfer_options.mode = request.mode;
    transfer_options.retransmit = handlers.retransmit;
    let tsize = transfer_options.tsize;
    let conn = Conn::new(transport, src, transfer_options);

    // The OACK (or plain ACK 0) both accepts the request and arms the
    // receiver: the peer's DATA(1) acknowledges it.
    let opening = if negotiated.reply.is_empty() {
        Packet::Ack { block: 0 }
    } else {
        Packet::Oack {
            options: negotiated.reply,
        }
    };
    conn.send(&opening).await?;
    let inbound = Inbound::new(conn, opening);
    let mut write_request = WriteRequest {
        name: request.filename,
        mode: request.mode,
        remote: src,
        tsize,
        inbound,
    };

    match handler.receive(&mut write_request).await {
        Ok(()) => {
            if !write_request.inbound.is_finished() {
                // Handler stopped reading before the final block.
                write_request
                    .inbound
                    .abort(ErrorCode::NotDefined, "user cancelled")
                    .await;
            } else {
                info!(%src, file = %write_request.name, "write transfer complete");
            }
            Ok(())
        }
        Err(err) => {
            if let Some((code, message)) = wire_error(&err) {
                write_request.inbound.abort(code, &message).await;
            }
            Err(err)
        }
    }
}

/// Translate a handler failure into the ERROR packet owed to the peer.
/// `None` means the transfer already ended on the wire.
fn wire_error(err: &Error) -> Option<(ErrorCode, String)> {
    match err {
        Error::Io(io_err) => Some(match io_err.kind() {
            io::ErrorKind::NotFound => (ErrorCode::FileNotFound, "File not found".to_string()),
            io::ErrorKind::PermissionDenied => {
                (ErrorCode::AccessViolation, "Access violation".to_string())
            }
            _ => (ErrorCode::NotDefined, format!("internal error: {}", io_err)),
        }),
        Error::Cancelled(reason) => Some((ErrorCode::NotDefined, reason.clone())),
        Error::Negotiation(err) => Some((ErrorCode::OptionNegotiation, err.reason.clone())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serve_requires_a_handler() {
        let mut server = Server::new("127.0.0.1:0");
        let err = server.serve().await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[tokio::test]
    async fn listen_reports_local_addr() {
        let mut server = Server::new("127.0.0.1:0");
        assert!(server.local_addr().is_none());
        server.listen().await.unwrap();
        let addr = server.local_addr().unwrap();
        assert_eq!(addr.ip(), "127.0.0.1".parse::<std::net::IpAddr>().unwrap());
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn close_stops_the_receive_loop() {
        struct Nop;

        #[async_trait]
        impl ReadHandler for Nop {
            async fn serve(&self, _request: &mut ReadRequest) -> Result<()> {
                Ok(())
            }
        }

        let mut server = Server::new("127.0.0.1:0");
        server.read_handler(Nop);
        server.listen().await.unwrap();
        let shutdown = server.shutdown_handle();

        let task = tokio::spawn(async move { server.serve().await });
        shutdown.close();
        let result = tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .expect("serve did not observe close")
            .unwrap();
        assert!(result.is_ok());
    }
}
