// Option negotiation for read requests (RFC 2347 framework, RFC 2348 blksize, RFC 2349 timeout
// and tsize).
//
// An OACK is advisory. Nothing in here fails a transfer: a rejected or unexpected option falls
// back to the protocol default and the session carries on.

use crate::tftp::{OptionList, DEFAULT_BLOCK_SIZE};

/// Smallest block size RFC 2348 allows.
pub const MIN_BLOCK_SIZE: u16 = 8;

/// Largest block size RFC 2348 allows.
pub const MAX_BLOCK_SIZE: u16 = 65464;

/// Picks the block size to offer: the requested size capped by the caller's MTU ceiling, or the
/// default block size when nothing was requested.
pub fn cap_block_size(requested: Option<u16>, mtu_ceiling: u16) -> u16 {
    match requested {
        Some(size) => size.min(mtu_ceiling).clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE),
        None => DEFAULT_BLOCK_SIZE,
    }
}

/// The options a client knows how to negotiate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionName {
    BlockSize,
    Timeout,
    TransferSize,
    Unrecognized(String),
}

impl OptionName {
    /// Option names are case-insensitive on the wire.
    pub fn parse(name: &str) -> OptionName {
        match name.to_ascii_lowercase().as_str() {
            "blksize" => OptionName::BlockSize,
            "timeout" => OptionName::Timeout,
            "tsize" => OptionName::TransferSize,
            _ => OptionName::Unrecognized(name.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            OptionName::BlockSize => "blksize",
            OptionName::Timeout => "timeout",
            OptionName::TransferSize => "tsize",
            OptionName::Unrecognized(name) => name,
        }
    }
}

/// Outcome of checking one option returned in an OACK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionVerdict {
    /// The server agreed to the offered value.
    Accepted { option: OptionName, value: String },

    /// The server answered with a value that was never offered; the default applies.
    Rejected { option: OptionName, value: String },

    /// The server acknowledged an option the client did not send.
    Unsolicited { option: OptionName, value: String },

    /// Not an option this client knows about.
    Unrecognized { name: String, value: String },
}

/// Offered and negotiated values for one transfer.
///
/// A timeout of 0 means no timeout; a transfer size of None means unknown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOptions {
    pub block_size_offered: u16,
    pub block_size_negotiated: u16,
    pub timeout_offered: u8,
    pub timeout_negotiated: u8,
    pub transfer_size_offered: u64,
    pub transfer_size_negotiated: Option<u64>,
}

impl TransferOptions {
    /// Creates the offer for a read request. The tsize offer is always the 0 probe.
    pub fn offer(block_size: u16, timeout: u8) -> TransferOptions {
        TransferOptions {
            block_size_offered: block_size,
            block_size_negotiated: DEFAULT_BLOCK_SIZE,
            timeout_offered: timeout,
            timeout_negotiated: 0,
            transfer_size_offered: 0,
            transfer_size_negotiated: None,
        }
    }

    /// The option pairs to append to the read request, in wire order.
    pub fn request_options(&self) -> OptionList {
        let mut options = vec![(
            OptionName::BlockSize.as_str().to_string(),
            self.block_size_offered.to_string(),
        )];
        if self.timeout_offered != 0 {
            options.push((OptionName::Timeout.as_str().to_string(), self.timeout_offered.to_string()));
        }
        options.push((
            OptionName::TransferSize.as_str().to_string(),
            self.transfer_size_offered.to_string(),
        ));
        options
    }

    fn reset_negotiated(&mut self) {
        self.block_size_negotiated = DEFAULT_BLOCK_SIZE;
        self.timeout_negotiated = 0;
        self.transfer_size_negotiated = None;
    }

    /// Applies the options a server acknowledged, in the order it sent them.
    ///
    /// Any option the server leaves out stays at its protocol default.
    pub fn negotiate(&mut self, acknowledged: &[(String, String)]) -> Vec<OptionVerdict> {
        self.reset_negotiated();

        let mut verdicts = Vec::with_capacity(acknowledged.len());
        for (name, value) in acknowledged {
            let verdict = match OptionName::parse(name) {
                OptionName::BlockSize => {
                    if *value == self.block_size_offered.to_string() {
                        self.block_size_negotiated = self.block_size_offered;
                        OptionVerdict::Accepted { option: OptionName::BlockSize, value: value.clone() }
                    } else {
                        log::warn!(
                            "Server answered blksize={} to an offer of {}, falling back to {}",
                            value, self.block_size_offered, DEFAULT_BLOCK_SIZE
                        );
                        self.block_size_negotiated = DEFAULT_BLOCK_SIZE;
                        OptionVerdict::Rejected { option: OptionName::BlockSize, value: value.clone() }
                    }
                }
                OptionName::Timeout if self.timeout_offered == 0 => {
                    log::warn!("Server acknowledged timeout={} which was never offered, ignoring it", value);
                    OptionVerdict::Unsolicited { option: OptionName::Timeout, value: value.clone() }
                }
                OptionName::Timeout => {
                    if *value == self.timeout_offered.to_string() {
                        self.timeout_negotiated = self.timeout_offered;
                        OptionVerdict::Accepted { option: OptionName::Timeout, value: value.clone() }
                    } else {
                        log::warn!(
                            "Server answered timeout={} to an offer of {}, continuing without a negotiated timeout",
                            value, self.timeout_offered
                        );
                        self.timeout_negotiated = 0;
                        OptionVerdict::Rejected { option: OptionName::Timeout, value: value.clone() }
                    }
                }
                OptionName::TransferSize => match value.parse::<u64>() {
                    Ok(size) => {
                        self.transfer_size_negotiated = Some(size);
                        OptionVerdict::Accepted { option: OptionName::TransferSize, value: value.clone() }
                    }
                    Err(_) => {
                        log::warn!("Server sent an unreadable tsize '{}', transfer size stays unknown", value);
                        OptionVerdict::Rejected { option: OptionName::TransferSize, value: value.clone() }
                    }
                },
                OptionName::Unrecognized(name) => {
                    log::warn!("Server acknowledged unrecognized option '{}'={}", name, value);
                    OptionVerdict::Unrecognized { name, value: value.clone() }
                }
            };
            verdicts.push(verdict);
        }
        verdicts
    }
}
