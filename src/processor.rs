use crate::netascii;
use crate::options::{OptionVerdict, TransferOptions};
use crate::tftp::{self, DecodeError, FileMode, OpCode, Packet};
use crate::transport::TransportError;
use std::error;
use std::fmt;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Reasons a read session ends without completing.
#[derive(Debug)]
pub enum TransferError {
    /// A datagram could not be framed as a TFTP packet.
    Malformed(String),

    /// The server sent an Error packet.
    ServerError { code: tftp::ErrorCode, message: String },

    /// A block arrived that is neither the next one nor a retransmission of the last one.
    ProtocolDesync { expected: u16, received: u16 },

    /// A block carried more data than the negotiated block size.
    OversizedBlock { limit: u16, received: usize },

    /// Nothing arrived within the receive bound.
    Timeout(Duration),

    /// Sending or receiving on the transport failed.
    Transport(io::Error),

    /// The announced transfer size does not fit in the space the caller reported.
    InsufficientStorage { required: u64, available: u64 },

    /// Writing the received data locally failed.
    Output(io::Error),
}

impl error::Error for TransferError {}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Malformed(msg) => write!(f, "Malformed packet: {}", msg),
            Self::ServerError { code, message } => {
                write!(f, "Server sent error packet: code: {:?}, message: '{}'", code, message)
            }
            Self::ProtocolDesync { expected, received } => write!(
                f,
                "Block number out of sync: expected {} but got {}",
                expected, received
            ),
            Self::OversizedBlock { limit, received } => write!(
                f,
                "Received a block of {} bytes but the negotiated block size is {}",
                received, limit
            ),
            Self::Timeout(d) => write!(f, "Timed out after {:?} waiting for the server", d),
            Self::Transport(e) => write!(f, "Transport failure: {}", e),
            Self::InsufficientStorage { required, available } => write!(
                f,
                "Transfer of {} bytes does not fit in the {} bytes available",
                required, available
            ),
            Self::Output(e) => write!(f, "Error writing received data: {}", e),
        }
    }
}

impl From<TransportError> for TransferError {
    fn from(e: TransportError) -> TransferError {
        match e {
            TransportError::IO(e) => TransferError::Transport(e),
            TransportError::Timeout(d) => TransferError::Timeout(d),
        }
    }
}

/// Where a read session stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    RequestSent,
    AwaitingData,
    Complete,
    Aborted,
    ErrorReceived,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferState::Complete | TransferState::Aborted | TransferState::ErrorReceived)
    }
}

/// What the caller asks for when starting a read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequestConfig {
    /// Name of the file on the server.
    pub filename: String,

    pub mode: FileMode,

    /// Block size to offer, already capped by the MTU ceiling.
    pub block_size: u16,

    /// Timeout in seconds to offer; 0 means the option is not sent.
    pub timeout: u8,

    /// Free local space, when the caller knows it.
    pub available_space: Option<u64>,
}

/// Per-session bookkeeping. Created for one read and dropped with it.
#[derive(Debug, Default)]
pub struct SessionState {
    pub last_acked_block: u16,

    /// The last ACK sent, kept to answer retransmissions.
    pub last_sent_ack: Option<Vec<u8>>,

    /// The last DATA datagram accepted, byte for byte.
    pub last_received: Option<Vec<u8>>,

    pub ascii: bool,

    /// Netascii carriage return carried across packet boundaries.
    pub pending_cr: bool,

    /// Set once the first DATA block has been accepted.
    pub data_started: bool,
}

/// Represents an action that the caller of ReadProcessor should take in
/// response to processing a datagram.
#[derive(Debug, PartialEq)]
pub enum ResultAction {
    /// Caller should send the packet and await a response.
    SendPacketAndAwait(Packet),

    /// Caller should send these exact bytes again and await a response.
    RetransmitAndAwait(Vec<u8>),

    /// Caller should ignore the datagram and keep waiting.
    RetryRecv,

    /// Caller should send the packet and then end the session successfully.
    TerminateWithPacket(Packet),

    /// Caller should end the session without sending anything.
    CloseConnection(TransferError),
}

impl PartialEq for TransferError {
    fn eq(&self, other: &TransferError) -> bool {
        match (self, other) {
            (Self::Malformed(a), Self::Malformed(b)) => a == b,
            (
                Self::ServerError { code: c1, message: m1 },
                Self::ServerError { code: c2, message: m2 },
            ) => c1 == c2 && m1 == m2,
            (
                Self::ProtocolDesync { expected: e1, received: r1 },
                Self::ProtocolDesync { expected: e2, received: r2 },
            ) => e1 == e2 && r1 == r2,
            (
                Self::OversizedBlock { limit: l1, received: r1 },
                Self::OversizedBlock { limit: l2, received: r2 },
            ) => l1 == l2 && r1 == r2,
            (Self::Timeout(a), Self::Timeout(b)) => a == b,
            (Self::Transport(a), Self::Transport(b)) => a.kind() == b.kind(),
            (
                Self::InsufficientStorage { required: q1, available: a1 },
                Self::InsufficientStorage { required: q2, available: a2 },
            ) => q1 == q2 && a1 == a2,
            (Self::Output(a), Self::Output(b)) => a.kind() == b.kind(),
            _ => false,
        }
    }
}

/// Drives one read transfer: produces the request, then turns every datagram from the server
/// into the next action while writing received data to `sink`.
#[derive(Debug)]
pub struct ReadProcessor<W> {
    sink: W,
    config: ReadRequestConfig,
    options: TransferOptions,
    session: SessionState,
    state: TransferState,
    bytes_written: u64,
    blocks_received: u64,
}

impl<W: AsyncWrite + Unpin> ReadProcessor<W> {
    pub fn new(config: ReadRequestConfig, sink: W) -> ReadProcessor<W> {
        ReadProcessor {
            sink,
            options: TransferOptions::offer(config.block_size, config.timeout),
            session: SessionState { ascii: config.mode == FileMode::NetAscii, ..Default::default() },
            config,
            state: TransferState::Idle,
            bytes_written: 0,
            blocks_received: 0,
        }
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn options(&self) -> &TransferOptions {
        &self.options
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn blocks_received(&self) -> u64 {
        self.blocks_received
    }

    pub fn into_sink(self) -> W {
        self.sink
    }

    /// Builds the read request that opens the session.
    pub fn first_packet(&mut self) -> ResultAction {
        self.state = TransferState::RequestSent;
        ResultAction::SendPacketAndAwait(Packet::ReadReq {
            path: self.config.filename.clone(),
            mode: self.config.mode,
            options: self.options.request_options(),
        })
    }

    /// Marks the request as on its way; from now on the session waits for data.
    pub fn request_sent(&mut self) {
        if self.state == TransferState::RequestSent {
            self.state = TransferState::AwaitingData;
        }
    }

    /// How long to wait for the next datagram, if at all.
    pub fn recv_timeout(&self) -> Option<Duration> {
        [self.options.timeout_negotiated, self.options.timeout_offered]
            .into_iter()
            .find(|&t| t != 0)
            .map(|t| Duration::from_secs(u64::from(t)))
    }

    /// Ends the session because of a failure outside the processor, such as a transport error.
    pub fn abort(&mut self) {
        if !self.state.is_terminal() {
            self.state = TransferState::Aborted;
        }
    }

    fn close(&mut self, state: TransferState, e: TransferError) -> ResultAction {
        self.state = state;
        ResultAction::CloseConnection(e)
    }

    /// Given a raw datagram from the server, processes it and describes the action the caller
    /// should take.
    pub async fn process_datagram(&mut self, buf: &[u8]) -> ResultAction {
        self.request_sent();

        // Only DATA, ERROR and OACK are parsed by their own layout; anything else a server sends
        // here is read as DATA, whether or not its own body would parse.
        match tftp::retrieve_op_code(buf) {
            Ok(op @ (OpCode::Rrq | OpCode::Wrq | OpCode::Ack)) => {
                return self.process_unusual(buf, format!("{:?}", op)).await
            }
            Err(DecodeError::UnknownOpcode(op)) => return self.process_unusual(buf, op.to_string()).await,
            Err(e) => return self.close(TransferState::Aborted, TransferError::Malformed(e.to_string())),
            Ok(OpCode::Data | OpCode::Error | OpCode::OAck) => {}
        }

        match Packet::parse_from_buf(buf) {
            Ok(Packet::OptionAck { options }) => self.process_oack(&options),
            Ok(Packet::Error { code, message }) => {
                log::warn!("Server sent an error packet: code: {:?}, message: '{}'", code, message);
                self.close(TransferState::ErrorReceived, TransferError::ServerError { code, message })
            }
            Ok(Packet::Data { block, data }) => self.process_data(buf, block, data).await,
            Ok(other) => self.process_unusual(buf, format!("{:?}", other.op_code())).await,
            Err(e) => self.close(TransferState::Aborted, TransferError::Malformed(e.to_string())),
        }
    }

    async fn process_unusual(&mut self, buf: &[u8], op: String) -> ResultAction {
        if buf.len() < tftp::HEADER_SIZE {
            return self.close(
                TransferState::Aborted,
                TransferError::Malformed(format!("{op} packet too short!")),
            );
        }
        log::warn!("Received packet with unusual opcode {} where DATA was expected, treating it as DATA", op);
        let (block, data) = reinterpret_as_data(buf);
        self.process_data(buf, block, data).await
    }

    fn process_oack(&mut self, acknowledged: &[(String, String)]) -> ResultAction {
        if self.session.data_started {
            log::warn!("Ignoring option acknowledgement received after data started");
            return ResultAction::RetryRecv;
        }

        for verdict in self.options.negotiate(acknowledged) {
            if let OptionVerdict::Accepted { option, value } = verdict {
                log::info!("Server accepted option {}={}", option.as_str(), value);
            }
        }

        if let (Some(required), Some(available)) =
            (self.options.transfer_size_negotiated, self.config.available_space)
        {
            if required > available {
                return self.close(
                    TransferState::Aborted,
                    TransferError::InsufficientStorage { required, available },
                );
            }
        }

        let ack = Packet::Ack { block: 0 };
        self.session.last_sent_ack = Some(ack.to_bytes());
        ResultAction::SendPacketAndAwait(ack)
    }

    async fn process_data(&mut self, buf: &[u8], block: u16, mut data: Vec<u8>) -> ResultAction {
        let expected = self.session.last_acked_block.wrapping_add(1);
        log::info!("Received {} bytes packet with block number {}", buf.len(), block);

        if block != expected {
            let duplicate = self.session.last_received.as_deref() == Some(buf);
            if let (true, Some(ack)) = (duplicate, self.session.last_sent_ack.as_ref()) {
                log::info!("Sending ACK for {} again", self.session.last_acked_block);
                return ResultAction::RetransmitAndAwait(ack.clone());
            }
            return self.close(
                TransferState::Aborted,
                TransferError::ProtocolDesync { expected, received: block },
            );
        }

        let limit = self.options.block_size_negotiated;
        if data.len() > usize::from(limit) {
            return self.close(
                TransferState::Aborted,
                TransferError::OversizedBlock { limit, received: data.len() },
            );
        }
        let last_block = data.len() < usize::from(limit);

        if self.session.ascii {
            let (len, pending_cr) = netascii::to_octet(&mut data, self.session.pending_cr);
            self.session.pending_cr = pending_cr;
            data.truncate(len);
        }

        if let Err(e) = self.sink.write_all(&data).await {
            return self.close(TransferState::Aborted, TransferError::Output(e));
        }
        if last_block {
            if let Err(e) = self.sink.flush().await {
                return self.close(TransferState::Aborted, TransferError::Output(e));
            }
        }
        self.bytes_written += data.len() as u64;
        self.blocks_received += 1;

        let ack = Packet::Ack { block };
        self.session.last_sent_ack = Some(ack.to_bytes());
        self.session.last_received = Some(buf.to_vec());
        self.session.last_acked_block = block;
        self.session.data_started = true;

        if last_block {
            self.state = TransferState::Complete;
            ResultAction::TerminateWithPacket(ack)
        } else {
            ResultAction::SendPacketAndAwait(ack)
        }
    }
}

/// Reads any datagram of at least four bytes with the DATA layout.
fn reinterpret_as_data(buf: &[u8]) -> (u16, Vec<u8>) {
    (tftp::u16_from_buffer(&buf[2..4]), Vec::from(&buf[4..]))
}
