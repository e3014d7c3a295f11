//! TFTP client.
//!
//! [`Client::get`] and [`Client::put`] drive the receive and send halves of
//! the transfer engine against a server addressed as `host:port/path`. The
//! client talks to the server's request port first; the first valid reply
//! latches the ephemeral transfer id the server picked for this transfer.

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{UdpSocket, lookup_host};
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::options::{self, TransferOptions};
use crate::protocol::{
    DEFAULT_BLOCK_SIZE, ErrorCode, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, Mode, Packet, Request,
};
use crate::transfer::{Conn, Inbound, Outbound, Transport};

/// A reusable, cheaply clonable TFTP client configuration.
#[derive(Debug, Clone)]
pub struct Client {
    options: TransferOptions,
    send_tsize: bool,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    /// Client with protocol defaults: 512-byte blocks, window of one,
    /// 10 second interval, transfer-size option enabled, binary mode.
    pub fn new() -> Self {
        Self {
            options: TransferOptions::default(),
            send_tsize: true,
        }
    }

    /// DATA payload size to request, 8..=65464 bytes.
    pub fn blocksize(mut self, blksize: u16) -> Result<Self> {
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&blksize) {
            return Err(Error::InvalidOption(format!("blocksize {} out of range", blksize)));
        }
        self.options.blksize = blksize;
        Ok(self)
    }

    /// Number of DATA packets sent before an acknowledgement is required.
    pub fn windowsize(mut self, windowsize: u16) -> Result<Self> {
        if windowsize == 0 {
            return Err(Error::InvalidOption("windowsize must be at least 1".to_string()));
        }
        self.options.windowsize = windowsize;
        Ok(self)
    }

    /// Per-packet retransmit interval in seconds, 1..=255.
    pub fn timeout(mut self, seconds: u8) -> Result<Self> {
        if seconds == 0 {
            return Err(Error::InvalidOption("timeout must be at least 1 second".to_string()));
        }
        self.options.timeout = seconds;
        Ok(self)
    }

    /// Per-packet retransmission budget.
    pub fn retransmit(mut self, budget: u32) -> Self {
        self.options.retransmit = budget;
        self
    }

    /// Whether to negotiate the transfer-size option. On by default.
    pub fn transfer_size(mut self, enabled: bool) -> Self {
        self.send_tsize = enabled;
        self
    }

    /// Transfer mode. Binary (octet) by default.
    pub fn mode(mut self, mode: Mode) -> Self {
        self.options.mode = mode;
        self
    }

    /// Download `url`, returning the response byte stream.
    pub async fn get(&self, url: &str) -> Result<Response> {
        let (server, path) = parse_url(url)?;
        let mut conn = connect(server, self.options.clone()).await?;
        let sent = options::request_options(&self.options, self.send_tsize.then_some(0));
        let request = Packet::Rrq(Request {
            filename: path,
            mode: self.options.mode,
            options: sent.clone(),
        });
        conn.send(&request).await?;

        let mut retries = self.options.retransmit;
        loop {
            let deadline = Instant::now() + self.options.interval();
            match conn.recv_until(deadline).await? {
                None => {
                    if retries == 0 {
                        return Err(Error::RetransmitExceeded);
                    }
                    retries -= 1;
                    conn.send(&request).await?;
                }
                Some(Packet::Oack { options: oack }) => {
                    let agreed = match options::apply_oack(&self.options, &sent, &oack) {
                        Ok(agreed) => agreed,
                        Err(err) => {
                            conn.send_error(ErrorCode::OptionNegotiation, &err.reason).await;
                            return Err(err.into());
                        }
                    };
                    let size = agreed.tsize;
                    conn.set_options(agreed);
                    let opening = Packet::Ack { block: 0 };
                    conn.send(&opening).await?;
                    return Ok(Response {
                        size,
                        inbound: Inbound::new(conn, opening),
                    });
                }
                Some(Packet::Data { block, payload }) => {
                    // The server skipped negotiation: wire options revert to
                    // protocol defaults, local policy stays as configured.
                    conn.set_options(TransferOptions {
                        blksize: DEFAULT_BLOCK_SIZE,
                        windowsize: options::DEFAULT_WINDOW_SIZE,
                        tsize: None,
                        ..self.options.clone()
                    });
                    let mut inbound = Inbound::new(conn, Packet::Ack { block: 0 });
                    inbound.accept_data(block, payload).await?;
                    return Ok(Response { size: None, inbound });
                }
                Some(Packet::Error { code, message }) => return Err(Error::Peer { code, message }),
                Some(other) => {
                    conn.send_error(ErrorCode::IllegalOperation, "unexpected packet").await;
                    return Err(Error::Protocol {
                        opcode: other.opcode(),
                        state: "awaiting read response",
                    });
                }
            }
        }
    }

    /// Upload the bytes of `reader` to `url`. `tsize` is advertised when
    /// nonzero and the transfer-size option is enabled.
    pub async fn put<R>(&self, url: &str, mut reader: R, tsize: u64) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let (server, path) = parse_url(url)?;
        let mut conn = connect(server, self.options.clone()).await?;
        let advertised = (self.send_tsize && tsize > 0).then_some(tsize);
        let sent = options::request_options(&self.options, advertised);
        let request = Packet::Wrq(Request {
            filename: path,
            mode: self.options.mode,
            options: sent.clone(),
        });
        conn.send(&request).await?;

        let mut retries = self.options.retransmit;
        let mut outbound = loop {
            let deadline = Instant::now() + self.options.interval();
            match conn.recv_until(deadline).await? {
                None => {
                    if retries == 0 {
                        return Err(Error::RetransmitExceeded);
                    }
                    retries -= 1;
                    conn.send(&request).await?;
                }
                Some(Packet::Oack { options: oack }) => {
                    let agreed = match options::apply_oack(&self.options, &sent, &oack) {
                        Ok(agreed) => agreed,
                        Err(err) => {
                            conn.send_error(ErrorCode::OptionNegotiation, &err.reason).await;
                            return Err(err.into());
                        }
                    };
                    conn.set_options(agreed);
                    break Outbound::new(conn, None, false);
                }
                Some(Packet::Ack { block: 0 }) => {
                    conn.set_options(TransferOptions {
                        blksize: DEFAULT_BLOCK_SIZE,
                        windowsize: options::DEFAULT_WINDOW_SIZE,
                        tsize: None,
                        ..self.options.clone()
                    });
                    break Outbound::new(conn, None, false);
                }
                Some(Packet::Error { code, message }) => return Err(Error::Peer { code, message }),
                Some(other) => {
                    conn.send_error(ErrorCode::IllegalOperation, "unexpected packet").await;
                    return Err(Error::Protocol {
                        opcode: other.opcode(),
                        state: "awaiting write response",
                    });
                }
            }
        };

        let mut buf = vec![0u8; 32 * 1024];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            outbound.write(&buf[..n]).await?;
        }
        outbound.finish().await
    }
}

/// The byte stream and negotiated parameters of a successful [`Client::get`].
pub struct Response {
    size: Option<u64>,
    inbound: Inbound,
}

impl Response {
    /// Transfer size the server advertised, when `tsize` was negotiated.
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    /// Options agreed with the server.
    pub fn options(&self) -> &TransferOptions {
        self.inbound.options()
    }

    /// Read payload bytes in block order. Returns `Ok(0)` at end of
    /// transfer.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.inbound.read(buf).await
    }

    /// Abandon the transfer early, telling the server why it will see no
    /// more acknowledgments.
    pub async fn cancel(mut self) {
        self.inbound.abort(ErrorCode::NotDefined, "user cancelled").await;
    }

    /// Drain the remaining transfer into `out`, returning the byte count.
    pub async fn read_to_end(&mut self, out: &mut Vec<u8>) -> Result<usize> {
        let mut buf = vec![0u8; 32 * 1024];
        let mut total = 0;
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(total);
            }
            out.extend_from_slice(&buf[..n]);
            total += n;
        }
    }
}

async fn connect(server: String, options: TransferOptions) -> Result<Conn> {
    let server_addr = lookup_host(&server)
        .await?
        .next()
        .ok_or_else(|| Error::InvalidUrl(server.clone()))?;
    let bind_addr = match server_addr {
        SocketAddr::V4(_) => "0.0.0.0:0",
        SocketAddr::V6(_) => "[::]:0",
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    Ok(Conn::to_server(Transport::Socket(socket), server_addr, options))
}

/// Split `host:port/path` (the port defaults to 69 when omitted).
fn parse_url(url: &str) -> Result<(String, String)> {
    let (host, path) = url
        .split_once('/')
        .ok_or_else(|| Error::InvalidUrl(url.to_string()))?;
    if host.is_empty() || path.is_empty() {
        return Err(Error::InvalidUrl(url.to_string()));
    }
    let server = if host.ends_with(']') || !host.contains(':') {
        format!("{}:69", host)
    } else {
        host.to_string()
    };
    Ok((server, path.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_parsing() {
        assert_eq!(
            parse_url("example.com:6969/boot.img").unwrap(),
            ("example.com:6969".to_string(), "boot.img".to_string())
        );
        assert_eq!(
            parse_url("example.com/dir/boot.img").unwrap(),
            ("example.com:69".to_string(), "dir/boot.img".to_string())
        );
        assert_eq!(
            parse_url("[::1]/f").unwrap(),
            ("[::1]:69".to_string(), "f".to_string())
        );
        assert!(parse_url("no-path").is_err());
        assert!(parse_url("/no-host").is_err());
        assert!(parse_url("host/").is_err());
    }

    #[test]
    fn option_validation() {
        assert!(Client::new().blocksize(7).is_err());
        assert!(Client::new().blocksize(65465).is_err());
        assert!(Client::new().blocksize(8).is_ok());
        assert!(Client::new().windowsize(0).is_err());
        assert!(Client::new().timeout(0).is_err());
        let client = Client::new()
            .blocksize(1468)
            .unwrap()
            .windowsize(16)
            .unwrap()
            .timeout(2)
            .unwrap()
            .retransmit(5)
            .mode(Mode::Netascii);
        assert_eq!(client.options.blksize, 1468);
        assert_eq!(client.options.windowsize, 16);
        assert_eq!(client.options.timeout, 2);
        assert_eq!(client.options.retransmit, 5);
        assert_eq!(client.options.mode, Mode::Netascii);
    }
}
