//! Option negotiation (RFC 2347/2348/2349/7440).
//!
//! Option keys are matched case-insensitively. Unknown options are dropped
//! from the reply; an option with an unsatisfiable value fails the whole
//! negotiation with wire error 8.

use std::time::Duration;

use thiserror::Error;

use crate::protocol::{DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, Mode};

pub(crate) const OPT_BLKSIZE: &str = "blksize";
pub(crate) const OPT_TIMEOUT: &str = "timeout";
pub(crate) const OPT_TSIZE: &str = "tsize";
pub(crate) const OPT_WINDOWSIZE: &str = "windowsize";

/// Default retransmit interval in seconds.
pub const DEFAULT_TIMEOUT_SECS: u8 = 10;

/// Default window: one DATA packet per ACK, plain RFC 1350 behavior.
pub const DEFAULT_WINDOW_SIZE: u16 = 1;

/// Default per-packet retransmission budget. Local policy, never on the wire.
pub const DEFAULT_RETRANSMIT: u32 = 10;

/// Agreed per-transfer parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOptions {
    /// DATA payload size in bytes, 8..=65464.
    pub blksize: u16,
    /// Retransmit interval in seconds, 1..=255.
    pub timeout: u8,
    /// Advertised transfer size, when known.
    pub tsize: Option<u64>,
    /// DATA packets per ACK, 1..=65535.
    pub windowsize: u16,
    /// Per-packet retransmission budget.
    pub retransmit: u32,
    /// Transfer mode.
    pub mode: Mode,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            blksize: DEFAULT_BLOCK_SIZE,
            timeout: DEFAULT_TIMEOUT_SECS,
            tsize: None,
            windowsize: DEFAULT_WINDOW_SIZE,
            retransmit: DEFAULT_RETRANSMIT,
            mode: Mode::Octet,
        }
    }
}

impl TransferOptions {
    /// Retransmit interval as a [`Duration`].
    pub fn interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.timeout))
    }
}

/// A request carried an option the server cannot satisfy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("option negotiation failed: {reason}")]
pub struct NegotiationError {
    pub reason: String,
}

impl NegotiationError {
    fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

/// Result of negotiating a request's options on the server side.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct Negotiated {
    /// Agreed wire-visible parameters (mode and local policy still unset).
    pub options: TransferOptions,
    /// OACK body, in request order. Empty means no OACK is owed.
    pub reply: Vec<(String, String)>,
    /// RRQ asked for `tsize`; the reply value is the file size the read
    /// handler supplies before the first DATA, appended to the OACK then.
    pub tsize_requested: bool,
}

/// Negotiate the options of an incoming RRQ (`write == false`) or WRQ
/// (`write == true`).
pub(crate) fn negotiate(
    requested: &[(String, String)],
    write: bool,
) -> Result<Negotiated, NegotiationError> {
    let mut negotiated = Negotiated::default();

    for (key, value) in requested {
        if key.eq_ignore_ascii_case(OPT_BLKSIZE) {
            let n = parse_value(key, value)?;
            if n < u64::from(MIN_BLOCK_SIZE) {
                return Err(NegotiationError::new(format!(
                    "blksize {} below minimum {}",
                    n, MIN_BLOCK_SIZE
                )));
            }
            // The server may reduce the requested size, never increase it.
            let agreed = n.min(u64::from(MAX_BLOCK_SIZE)) as u16;
            negotiated.options.blksize = agreed;
            negotiated.reply.push((OPT_BLKSIZE.to_string(), agreed.to_string()));
        } else if key.eq_ignore_ascii_case(OPT_TIMEOUT) {
            let n = parse_value(key, value)?;
            if !(1..=255).contains(&n) {
                return Err(NegotiationError::new(format!("timeout {} out of range", n)));
            }
            negotiated.options.timeout = n as u8;
            negotiated.reply.push((OPT_TIMEOUT.to_string(), n.to_string()));
        } else if key.eq_ignore_ascii_case(OPT_WINDOWSIZE) {
            let n = parse_value(key, value)?;
            if !(1..=u64::from(u16::MAX)).contains(&n) {
                return Err(NegotiationError::new(format!("windowsize {} out of range", n)));
            }
            negotiated.options.windowsize = n as u16;
            negotiated.reply.push((OPT_WINDOWSIZE.to_string(), n.to_string()));
        } else if key.eq_ignore_ascii_case(OPT_TSIZE) {
            let n = parse_value(key, value)?;
            if write {
                // The client advertises how much it is about to send; echo
                // the value and let the handler decide whether it fits.
                negotiated.options.tsize = Some(n);
                negotiated.reply.push((OPT_TSIZE.to_string(), n.to_string()));
            } else {
                negotiated.tsize_requested = true;
            }
        }
        // Anything else is dropped from the reply per RFC 2347.
    }

    Ok(negotiated)
}

/// Build the option list for an outgoing request from the client's
/// configuration. Defaults are omitted; `tsize` is included when the caller
/// enables the transfer-size option (0 on RRQ, the local size on WRQ).
pub(crate) fn request_options(config: &TransferOptions, tsize: Option<u64>) -> Vec<(String, String)> {
    let mut options = Vec::new();
    if config.blksize != DEFAULT_BLOCK_SIZE {
        options.push((OPT_BLKSIZE.to_string(), config.blksize.to_string()));
    }
    if config.timeout != DEFAULT_TIMEOUT_SECS {
        options.push((OPT_TIMEOUT.to_string(), config.timeout.to_string()));
    }
    if config.windowsize != DEFAULT_WINDOW_SIZE {
        options.push((OPT_WINDOWSIZE.to_string(), config.windowsize.to_string()));
    }
    if let Some(n) = tsize {
        options.push((OPT_TSIZE.to_string(), n.to_string()));
    }
    options
}

/// Apply a server's OACK against the request we sent.
///
/// Wire-visible options the server did not echo fall back to their protocol
/// defaults; local policy (retransmit budget, mode, configured interval)
/// carries over. An option the server answered without being asked, or a
/// value it "increased", fails negotiation.
pub(crate) fn apply_oack(
    config: &TransferOptions,
    sent: &[(String, String)],
    oack: &[(String, String)],
) -> Result<TransferOptions, NegotiationError> {
    let mut agreed = TransferOptions {
        blksize: DEFAULT_BLOCK_SIZE,
        windowsize: DEFAULT_WINDOW_SIZE,
        tsize: None,
        ..config.clone()
    };

    for (key, value) in oack {
        if !sent.iter().any(|(k, _)| k.eq_ignore_ascii_case(key)) {
            return Err(NegotiationError::new(format!(
                "server acknowledged unrequested option {:?}",
                key
            )));
        }
        let n = parse_value(key, value)?;
        if key.eq_ignore_ascii_case(OPT_BLKSIZE) {
            if n < u64::from(MIN_BLOCK_SIZE) || n > u64::from(config.blksize) {
                return Err(NegotiationError::new(format!(
                    "server replied blksize {} to a request for {}",
                    n, config.blksize
                )));
            }
            agreed.blksize = n as u16;
        } else if key.eq_ignore_ascii_case(OPT_TIMEOUT) {
            if !(1..=255).contains(&n) {
                return Err(NegotiationError::new(format!("timeout {} out of range", n)));
            }
            agreed.timeout = n as u8;
        } else if key.eq_ignore_ascii_case(OPT_WINDOWSIZE) {
            if n < 1 || n > u64::from(config.windowsize) {
                return Err(NegotiationError::new(format!(
                    "server replied windowsize {} to a request for {}",
                    n, config.windowsize
                )));
            }
            agreed.windowsize = n as u16;
        } else if key.eq_ignore_ascii_case(OPT_TSIZE) {
            agreed.tsize = Some(n);
        }
    }

    Ok(agreed)
}

fn parse_value(key: &str, value: &str) -> Result<u64, NegotiationError> {
    value
        .parse::<u64>()
        .map_err(|_| NegotiationError::new(format!("unparsable {} value {:?}", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_request_needs_no_oack() {
        let negotiated = negotiate(&[], false).unwrap();
        assert!(negotiated.reply.is_empty());
        assert_eq!(negotiated.options, TransferOptions::default());
    }

    #[test]
    fn accepts_in_range_options() {
        let requested = opts(&[("blksize", "1024"), ("windowsize", "2"), ("timeout", "3")]);
        let negotiated = negotiate(&requested, false).unwrap();
        assert_eq!(negotiated.options.blksize, 1024);
        assert_eq!(negotiated.options.windowsize, 2);
        assert_eq!(negotiated.options.timeout, 3);
        assert_eq!(
            negotiated.reply,
            opts(&[("blksize", "1024"), ("windowsize", "2"), ("timeout", "3")])
        );
    }

    #[test]
    fn blksize_is_reduced_never_increased() {
        let negotiated = negotiate(&opts(&[("blksize", "70000")]), false).unwrap();
        assert_eq!(negotiated.options.blksize, MAX_BLOCK_SIZE);
        assert_eq!(negotiated.reply, opts(&[("blksize", "65464")]));
    }

    #[test]
    fn blksize_below_minimum_fails() {
        // A 7-byte block request is unsatisfiable, not clampable.
        let err = negotiate(&opts(&[("blksize", "7")]), false).unwrap_err();
        assert!(err.reason.contains("blksize"));
    }

    #[test]
    fn timeout_out_of_range_fails() {
        assert!(negotiate(&opts(&[("timeout", "0")]), false).is_err());
        assert!(negotiate(&opts(&[("timeout", "256")]), false).is_err());
    }

    #[test]
    fn windowsize_zero_fails() {
        assert!(negotiate(&opts(&[("windowsize", "0")]), false).is_err());
    }

    #[test]
    fn unparsable_value_fails() {
        assert!(negotiate(&opts(&[("blksize", "lots")]), false).is_err());
    }

    #[test]
    fn unknown_options_are_dropped() {
        let negotiated = negotiate(&opts(&[("multicast", "1"), ("blksize", "1024")]), false).unwrap();
        assert_eq!(negotiated.reply, opts(&[("blksize", "1024")]));
    }

    #[test]
    fn keys_match_case_insensitively() {
        let negotiated = negotiate(&opts(&[("BlkSize", "1024")]), false).unwrap();
        assert_eq!(negotiated.options.blksize, 1024);
    }

    #[test]
    fn rrq_tsize_is_deferred_to_the_handler() {
        let negotiated = negotiate(&opts(&[("tsize", "0")]), false).unwrap();
        assert!(negotiated.tsize_requested);
        assert!(negotiated.reply.is_empty());
        assert_eq!(negotiated.options.tsize, None);
    }

    #[test]
    fn wrq_tsize_is_echoed() {
        let negotiated = negotiate(&opts(&[("tsize", "4096")]), true).unwrap();
        assert_eq!(negotiated.options.tsize, Some(4096));
        assert_eq!(negotiated.reply, opts(&[("tsize", "4096")]));
    }

    #[test]
    fn request_options_skip_defaults() {
        let config = TransferOptions::default();
        assert!(request_options(&config, None).is_empty());
        assert_eq!(request_options(&config, Some(0)), opts(&[("tsize", "0")]));

        let config = TransferOptions {
            blksize: 1468,
            windowsize: 16,
            ..Default::default()
        };
        assert_eq!(
            request_options(&config, None),
            opts(&[("blksize", "1468"), ("windowsize", "16")])
        );
    }

    #[test]
    fn oack_subset_falls_back_to_defaults() {
        let config = TransferOptions {
            blksize: 1468,
            windowsize: 16,
            ..Default::default()
        };
        let sent = request_options(&config, Some(0));
        // Server only agreed to blksize; windowsize reverts to 1.
        let agreed = apply_oack(&config, &sent, &opts(&[("blksize", "1468")])).unwrap();
        assert_eq!(agreed.blksize, 1468);
        assert_eq!(agreed.windowsize, DEFAULT_WINDOW_SIZE);
        assert_eq!(agreed.tsize, None);
    }

    #[test]
    fn oack_may_reduce_blksize() {
        let config = TransferOptions {
            blksize: 8192.min(MAX_BLOCK_SIZE),
            ..Default::default()
        };
        let sent = request_options(&config, None);
        let agreed = apply_oack(&config, &sent, &opts(&[("blksize", "512")])).unwrap();
        assert_eq!(agreed.blksize, 512);
    }

    #[test]
    fn oack_rejects_increased_values() {
        let config = TransferOptions {
            blksize: 1024,
            windowsize: 4,
            ..Default::default()
        };
        let sent = request_options(&config, None);
        assert!(apply_oack(&config, &sent, &opts(&[("blksize", "2048")])).is_err());
        assert!(apply_oack(&config, &sent, &opts(&[("windowsize", "8")])).is_err());
    }

    #[test]
    fn oack_rejects_unrequested_options() {
        let config = TransferOptions::default();
        let err = apply_oack(&config, &[], &opts(&[("blksize", "512")])).unwrap_err();
        assert!(err.reason.contains("unrequested"));
    }

    #[test]
    fn oack_tsize_is_recorded() {
        let config = TransferOptions::default();
        let sent = request_options(&config, Some(0));
        let agreed = apply_oack(&config, &sent, &opts(&[("tsize", "2048")])).unwrap();
        assert_eq!(agreed.tsize, Some(2048));
    }
}
