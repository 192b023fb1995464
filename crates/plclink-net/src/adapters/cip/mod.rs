//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Direct EtherNet/IP explicit messaging transport."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Every operation opens its own TCP connection, registers a session, sends
//! one unconnected request routed to the CPU slot, and tears everything down
//! again. Controllers cap concurrent peer sessions, so nothing is pooled.
use std::future::Future;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use bytes::Bytes;
use plclink_common::ControllerConfig;
use plclink_core::{LinkError, Result, TransportAdapter, WireRead, WireValue, WireWrite};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

pub mod frame;
pub mod path;

use frame::{CipReply, EncapHeader};
pub use path::{PathSegment, TagPath};

/// EtherNet/IP client for Logix-family controllers.
#[derive(Debug, Clone)]
pub struct CipTransport {
    host: String,
    port: u16,
    slot: u8,
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl CipTransport {
    pub fn new(config: &ControllerConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            slot: config.slot,
            connect_timeout: config.connect_timeout,
            io_timeout: config.io_timeout,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn call(&self, address: &str, embedded: Bytes) -> Result<Bytes> {
        self.transact(&embedded)
            .await
            .map_err(|err| LinkError::transport(address, format!("{err:#}")))
    }

    async fn transact(&self, embedded: &[u8]) -> anyhow::Result<Bytes> {
        let mut session = self.open().await?;
        let result = session.request(self.slot, embedded).await;
        session.close().await;
        result
    }

    async fn open(&self) -> anyhow::Result<Session> {
        let endpoint = self.endpoint();
        let connecting = TcpStream::connect(&endpoint);
        let stream = match tokio::time::timeout(self.connect_timeout, connecting).await {
            Ok(result) => result.with_context(|| format!("connect to {endpoint}"))?,
            Err(_) => bail!(
                "connect to {endpoint} timed out after {} ms",
                self.connect_timeout.as_millis()
            ),
        };
        stream.set_nodelay(true).ok();

        let mut session = Session {
            stream,
            handle: 0,
            io_timeout: self.io_timeout,
        };
        session.send(&frame::register_session()).await?;
        let (header, _) = session.receive().await?;
        session.handle = frame::check_header(&header, frame::REGISTER_SESSION)
            .context("register session")?;
        trace!(endpoint = %endpoint, session = session.handle, "session registered");
        Ok(session)
    }

    /// Read the containing word to learn its width, then send a masked
    /// Read-Modify-Write sized to it. Both requests share one session.
    async fn write_bit(&self, address: &str, word: &[u8], bit: u8, value: bool) -> Result<()> {
        let wire = |err: anyhow::Error| LinkError::transport(address, format!("{err:#}"));
        let mut session = self.open().await.map_err(wire)?;
        let result = async {
            let data = session
                .request(self.slot, &frame::read_tag(word))
                .await
                .map_err(wire)?;
            let current = frame::decode_read_data(&data)
                .map_err(|err| LinkError::transport(address, err))?;
            let width = check_bit(address, current.code, bit)?;
            session
                .request(self.slot, &frame::set_bit(word, width, bit, value))
                .await
                .map_err(wire)?;
            Ok::<(), LinkError>(())
        }
        .await;
        session.close().await;
        result
    }
}

/// Width of the word behind a bit address, rejecting non-integer words and
/// bits past the word's end.
fn check_bit(address: &str, code: u16, bit: u8) -> Result<u8> {
    let width = frame::word_width(code).ok_or_else(|| {
        LinkError::InvalidAddressFormat(format!(
            "{address}: bit selector on a non-integer tag (type 0x{code:04X})"
        ))
    })?;
    if bit >= width {
        return Err(LinkError::InvalidAddressFormat(format!(
            "{address}: bit {bit} outside a {width}-bit word"
        )));
    }
    Ok(width)
}

#[async_trait]
impl TransportAdapter for CipTransport {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn read(&self, op: &WireRead) -> Result<WireValue> {
        let path = TagPath::parse(&op.address)?;
        let Some(bit) = path.bit else {
            let data = self.call(&op.address, frame::read_tag(&path.encode())).await?;
            return frame::decode_read_data(&data)
                .map(|read| read.value)
                .map_err(|err| LinkError::transport(&op.address, err));
        };

        let data = self
            .call(&op.address, frame::read_tag(&path.word().encode()))
            .await?;
        let word = frame::decode_read_data(&data)
            .map_err(|err| LinkError::transport(&op.address, err))?;
        check_bit(&op.address, word.code, bit)?;
        let bits = word.word_bits().unwrap_or_default();
        Ok(WireValue::Bool((bits >> bit) & 1 == 1))
    }

    async fn write(&self, op: &WireWrite) -> Result<()> {
        let path = TagPath::parse(&op.address)?;
        match (path.bit, op.value) {
            (Some(bit), WireValue::Bool(value)) => {
                self.write_bit(&op.address, &path.word().encode(), bit, value)
                    .await?;
            }
            (Some(_), other) => {
                return Err(LinkError::InvalidAddressFormat(format!(
                    "{}: bit addresses take BOOL values, not {}",
                    op.address,
                    other.wire_type()
                )))
            }
            (None, value) => {
                self.call(&op.address, frame::write_tag(&path.encode(), value))
                    .await?;
            }
        }
        debug!(address = %op.address, value = %op.value, "cip write acknowledged");
        Ok(())
    }

    async fn probe(&self) -> Result<()> {
        let endpoint = self.endpoint();
        let session = self
            .open()
            .await
            .map_err(|err| LinkError::transport(&endpoint, format!("{err:#}")))?;
        session.close().await;
        Ok(())
    }
}

/// One registered encapsulation session over a fresh TCP connection.
struct Session {
    stream: TcpStream,
    handle: u32,
    io_timeout: Duration,
}

impl Session {
    async fn request(&mut self, slot: u8, embedded: &[u8]) -> anyhow::Result<Bytes> {
        let routed = frame::unconnected_send(slot, embedded);
        self.send(&frame::send_rr_data(self.handle, &routed)).await?;
        let (header, payload) = self.receive().await?;
        frame::check_header(&header, frame::SEND_RR_DATA)?;
        let cip = frame::parse_send_rr_data(&payload)?;
        let reply = CipReply::parse(&cip)?;
        Ok(reply.into_success(frame::service_of(embedded))?)
    }

    async fn send(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        bounded(self.io_timeout, "send request", self.stream.write_all(bytes)).await
    }

    async fn receive(&mut self) -> anyhow::Result<(EncapHeader, Vec<u8>)> {
        let mut head = [0u8; frame::HEADER_LEN];
        bounded(self.io_timeout, "read reply header", self.stream.read_exact(&mut head)).await?;
        let header = EncapHeader::decode(&head)?;
        let mut payload = vec![0u8; header.length as usize];
        bounded(self.io_timeout, "read reply body", self.stream.read_exact(&mut payload)).await?;
        Ok((header, payload))
    }

    /// Best effort: the controller drops the session with the socket anyway.
    async fn close(mut self) {
        let goodbye = frame::unregister_session(self.handle);
        let _ = tokio::time::timeout(self.io_timeout, self.stream.write_all(&goodbye)).await;
        let _ = self.stream.shutdown().await;
    }
}

async fn bounded<T>(
    limit: Duration,
    what: &'static str,
    operation: impl Future<Output = std::io::Result<T>>,
) -> anyhow::Result<T> {
    match tokio::time::timeout(limit, operation).await {
        Ok(result) => result.context(what),
        Err(_) => Err(anyhow!("{what} timed out after {} ms", limit.as_millis())),
    }
}
