// This module contains the client-side read session driver.
//
// A read session works in roughly the following stages:
//
// 1. Send the read request, carrying the blksize, timeout and tsize offers.
// 2. Enter a phase of wait and work cycles. The wait cycles block on the transport for the next
//    datagram, bounded by the session timeout. The work cycles hand the datagram to the
//    ReadProcessor, which writes any new data to the output and says what to send back.
// 3. The session ends after the ACK for a short final block has been sent, or as soon as the
//    processor, the transport or the timeout says it cannot continue. Nothing is ever re-requested:
//    the only retransmission is the last ACK, in answer to a duplicated DATA block.

use crate::processor::{ReadProcessor, ResultAction, TransferError};
use crate::transport::Transport;
use tokio::io::AsyncWrite;

/// What a completed read produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSummary {
    pub bytes_written: u64,
    pub blocks: u64,
    pub transfer_size: Option<u64>,
}

/// An object responsible for running one read request to completion.
pub struct ClientRequestHandler<T, W> {
    /// The transport used to talk to the server.
    transport: T,

    /// The packet processor.
    processor: ReadProcessor<W>,
}

impl<T: Transport, W: AsyncWrite + Unpin> ClientRequestHandler<T, W> {
    pub fn new(transport: T, processor: ReadProcessor<W>) -> ClientRequestHandler<T, W> {
        ClientRequestHandler { transport, processor }
    }

    pub fn processor(&self) -> &ReadProcessor<W> {
        &self.processor
    }

    pub fn into_parts(self) -> (T, ReadProcessor<W>) {
        (self.transport, self.processor)
    }

    async fn send(&mut self, buf: &[u8]) -> Result<(), TransferError> {
        match self.transport.send(buf).await {
            Ok(sent) => {
                log::debug!("Sent {} bytes", sent);
                Ok(())
            }
            Err(e) => {
                log::warn!("Unable to send packet: {e}");
                self.processor.abort();
                Err(e.into())
            }
        }
    }

    /// Does the work of sending and receiving data over the transport until the session ends.
    pub async fn handle(&mut self) -> Result<TransferSummary, TransferError> {
        let request = match self.processor.first_packet() {
            ResultAction::SendPacketAndAwait(p) => p,
            other => {
                log::error!("Packet processor did not open the session with a request: {:?}", other);
                self.processor.abort();
                return Err(TransferError::Malformed("no read request to send".to_string()));
            }
        };
        log::info!("Sending read file request: {:?}", request);
        self.send(&request.to_bytes()).await?;
        self.processor.request_sent();

        loop {
            let datagram = match self
                .transport
                .recv(self.processor.recv_timeout())
                .await
            {
                Ok(datagram) => datagram,
                Err(e) => {
                    log::warn!("Giving up on the transfer: {e}");
                    self.processor.abort();
                    return Err(e.into());
                }
            };

            match self.processor.process_datagram(&datagram).await {
                ResultAction::SendPacketAndAwait(p) => {
                    log::info!("Sending {:?}", p);
                    self.send(&p.to_bytes()).await?;
                }
                ResultAction::RetransmitAndAwait(bytes) => {
                    self.send(&bytes).await?;
                }
                ResultAction::RetryRecv => continue,
                ResultAction::TerminateWithPacket(p) => {
                    log::info!("Sending final {:?}", p);
                    self.send(&p.to_bytes()).await?;
                    return Ok(TransferSummary {
                        bytes_written: self.processor.bytes_written(),
                        blocks: self.processor.blocks_received(),
                        transfer_size: self.processor.options().transfer_size_negotiated,
                    });
                }
                ResultAction::CloseConnection(e) => {
                    log::warn!("Closing transfer: {e}");
                    return Err(e);
                }
            }
        }
    }
}
