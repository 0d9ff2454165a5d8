//! Session-management packets.
//!
//! Connect/disconnect handshakes travel out of band, relayed between hosts
//! by each host's broker over a TCP control plane. The wire format is a
//! small hand-rolled codec; these packets are rare and never on the
//! datapath.

use crate::error::{Error, Result};

/// Session-management packet kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SmPktType {
    ConnectReq = 0,
    ConnectResp = 1,
    DisconnectReq = 2,
    DisconnectResp = 3,
    /// Side-channel fault: the receiving endpoint tears the session down as
    /// if its peer had vanished.
    FaultResetPeer = 4,
    /// Side-channel fault: the receiving endpoint arms its local TX-drop
    /// countdown.
    FaultDropTxRemote = 5,
}

impl TryFrom<u8> for SmPktType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(SmPktType::ConnectReq),
            1 => Ok(SmPktType::ConnectResp),
            2 => Ok(SmPktType::DisconnectReq),
            3 => Ok(SmPktType::DisconnectResp),
            4 => Ok(SmPktType::FaultResetPeer),
            5 => Ok(SmPktType::FaultDropTxRemote),
            _ => Err(Error::BadArg("unknown SM packet kind")),
        }
    }
}

/// Typed reason carried by SM responses and surfaced through the SM
/// callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SmErrType {
    NoError = 0,
    TooManySessions = 1,
    RoutingResolutionFailed = 2,
    InvalidRemoteEndpoint = 3,
    /// Local-only: no SM response arrived within the connect timeout.
    ConnectTimeout = 4,
}

impl TryFrom<u8> for SmErrType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(SmErrType::NoError),
            1 => Ok(SmErrType::TooManySessions),
            2 => Ok(SmErrType::RoutingResolutionFailed),
            3 => Ok(SmErrType::InvalidRemoteEndpoint),
            4 => Ok(SmErrType::ConnectTimeout),
            _ => Err(Error::BadArg("unknown SM error code")),
        }
    }
}

/// Events delivered to the user's session-management callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmEventType {
    Connected,
    ConnectFailed,
    Disconnected,
}

/// A session-management event.
#[derive(Debug, Clone, Copy)]
pub struct SmEvent {
    /// Local session number the event concerns.
    pub session_num: u16,
    pub event: SmEventType,
    pub err: SmErrType,
}

/// One side of a session: where it lives and how to reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEndpoint {
    /// Broker URI of the owning host (`host:sm_port`).
    pub hostname: String,
    /// Endpoint id on that host.
    pub endpoint_id: u8,
    /// Physical port of the endpoint's transport.
    pub phy_port: u8,
    /// Session number local to that endpoint.
    pub session_num: u16,
    /// Serialized transport routing info.
    pub routing: Vec<u8>,
}

impl SessionEndpoint {
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.endpoint_id);
        out.push(self.phy_port);
        out.extend_from_slice(&self.session_num.to_le_bytes());
        out.extend_from_slice(&(self.hostname.len() as u16).to_le_bytes());
        out.extend_from_slice(self.hostname.as_bytes());
        out.extend_from_slice(&(self.routing.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.routing);
    }

    fn decode_from(cur: &mut Cursor<'_>) -> Result<Self> {
        let endpoint_id = cur.u8()?;
        let phy_port = cur.u8()?;
        let session_num = cur.u16()?;
        let hostname_len = cur.u16()? as usize;
        let hostname = String::from_utf8(cur.bytes(hostname_len)?.to_vec())
            .map_err(|_| Error::BadArg("non-utf8 hostname in SM packet"))?;
        let routing_len = cur.u16()? as usize;
        let routing = cur.bytes(routing_len)?.to_vec();
        Ok(Self {
            hostname,
            endpoint_id,
            phy_port,
            session_num,
            routing,
        })
    }
}

/// A session-management packet.
#[derive(Debug, Clone)]
pub struct SmPkt {
    pub kind: SmPktType,
    pub err: SmErrType,
    /// Generation token distinguishing handshake incarnations.
    pub token: u64,
    /// Argument for fault packets (drop countdown).
    pub fault_arg: u64,
    /// Client-side identity (the session initiator).
    pub client: SessionEndpoint,
    /// Server-side identity.
    pub server: SessionEndpoint,
}

impl SmPkt {
    /// Endpoint id this packet should be delivered to.
    pub fn dest_endpoint_id(&self) -> u8 {
        match self.kind {
            SmPktType::ConnectReq
            | SmPktType::DisconnectReq
            | SmPktType::FaultResetPeer
            | SmPktType::FaultDropTxRemote => self.server.endpoint_id,
            SmPktType::ConnectResp | SmPktType::DisconnectResp => self.client.endpoint_id,
        }
    }

    /// Broker URI of the host this packet should be delivered to.
    pub fn dest_hostname(&self) -> &str {
        match self.kind {
            SmPktType::ConnectReq
            | SmPktType::DisconnectReq
            | SmPktType::FaultResetPeer
            | SmPktType::FaultDropTxRemote => &self.server.hostname,
            SmPktType::ConnectResp | SmPktType::DisconnectResp => &self.client.hostname,
        }
    }

    /// Build the response to this request packet.
    pub fn response(&self, kind: SmPktType, err: SmErrType) -> SmPkt {
        SmPkt {
            kind,
            err,
            token: self.token,
            fault_arg: 0,
            client: self.client.clone(),
            server: self.server.clone(),
        }
    }

    /// Serialize to the control-plane wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.push(self.kind as u8);
        out.push(self.err as u8);
        out.extend_from_slice(&self.token.to_le_bytes());
        out.extend_from_slice(&self.fault_arg.to_le_bytes());
        self.client.encode_into(&mut out);
        self.server.encode_into(&mut out);
        out
    }

    /// Deserialize from the control-plane wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cur = Cursor { buf: bytes, pos: 0 };
        let kind = SmPktType::try_from(cur.u8()?)?;
        let err = SmErrType::try_from(cur.u8()?)?;
        let token = cur.u64()?;
        let fault_arg = cur.u64()?;
        let client = SessionEndpoint::decode_from(&mut cur)?;
        let server = SessionEndpoint::decode_from(&mut cur)?;
        Ok(Self {
            kind,
            err,
            token,
            fault_arg,
            client,
            server,
        })
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(Error::BufferTooSmall {
                required: self.pos + n,
                available: self.buf.len(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.bytes(2)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.bytes(8)?.try_into().unwrap()))
    }
}
