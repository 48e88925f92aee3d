//! Synthesis of spoofed replies into an observed flow.
//!
//! The forged packet travels against the observed direction: it is sent
//! from the observed destination to the observed source, with addressing
//! and sequence numbers recovered from the context ancestry. Delivery is
//! left to a [`PacketInjector`].

use std::io;
use std::net::IpAddr;
use std::sync::Arc;

use etherparse::PacketBuilder;
use tracing::debug;

use crate::address::Address;
use crate::context::{ContextKind, ContextNode, ContextState};
use crate::decoders::dns::DnsMessage;
use crate::error::{Error, Result};

const FORGED_TTL: u8 = 64;
const FORGED_WINDOW: u16 = 8192;

/// Delivers raw IP packets to the network.
pub trait PacketInjector: Send + Sync {
    /// Send `packet` (starting at the IP header) towards `destination`.
    fn inject(&self, destination: IpAddr, packet: &[u8]) -> io::Result<()>;
}

/// Addresses of the IP layer above a context, reversed for the reply.
struct Reply {
    src: IpAddr,
    dest: IpAddr,
}

impl Reply {
    fn from_ancestry(context: &Arc<ContextNode>) -> Result<Self> {
        let ip = context
            .ancestor_where(|k| matches!(k, ContextKind::Ip4 | ContextKind::Ip6))
            .ok_or(Error::MissingAncestor { kind: ContextKind::Ip4 })?;
        let addr = ip.addr();
        Ok(Self {
            src: ip_of(&addr.dest, ip.kind())?,
            dest: ip_of(&addr.src, ip.kind())?,
        })
    }

    fn builder(&self) -> Result<etherparse::PacketBuilderStep<etherparse::IpHeaders>> {
        match (self.src, self.dest) {
            (IpAddr::V4(src), IpAddr::V4(dest)) => Ok(PacketBuilder::ipv4(src.octets(), dest.octets(), FORGED_TTL)),
            (IpAddr::V6(src), IpAddr::V6(dest)) => Ok(PacketBuilder::ipv6(src.octets(), dest.octets(), FORGED_TTL)),
            _ => Err(Error::MissingAncestor { kind: ContextKind::Ip4 }),
        }
    }
}

fn ip_of(address: &Address, kind: ContextKind) -> Result<IpAddr> {
    address.as_ip().ok_or(Error::MissingAncestor { kind })
}

fn port_of(address: &Address) -> Result<u16> {
    address.as_u16().ok_or(Error::MissingAncestor { kind: ContextKind::Tcp })
}

/// Ports and sequence numbers of the TCP layer above a context.
struct TcpReply {
    src_port: u16,
    dest_port: u16,
    seq: u32,
    ack: u32,
}

impl TcpReply {
    fn from_ancestry(context: &Arc<ContextNode>) -> Result<Self> {
        let tcp = context
            .ancestor(ContextKind::Tcp)
            .ok_or(Error::MissingAncestor { kind: ContextKind::Tcp })?;
        let (seq_expected, ack_received) = match &*tcp.state() {
            ContextState::Tcp(state) => (
                state.stream.seq_expected(),
                state.stream.ack_received().unwrap_or_default(),
            ),
            _ => return Err(Error::MissingAncestor { kind: ContextKind::Tcp }),
        };
        let addr = tcp.addr();
        Ok(Self {
            src_port: port_of(&addr.dest)?,
            dest_port: port_of(&addr.src)?,
            // The peer expects what it last acknowledged, and we acknowledge
            // everything seen so far.
            seq: ack_received,
            ack: seq_expected,
        })
    }
}

fn build_error(e: etherparse::err::packet::BuildWriteError) -> Error {
    Error::Io(io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))
}

/// Reset the TCP connection `context` belongs to.
pub fn forge_tcp_reset(context: &Arc<ContextNode>, injector: &dyn PacketInjector) -> Result<()> {
    let tcp = TcpReply::from_ancestry(context)?;
    let ip = Reply::from_ancestry(context)?;
    let builder = ip
        .builder()?
        .tcp(tcp.src_port, tcp.dest_port, tcp.seq, FORGED_WINDOW)
        .ack(tcp.ack)
        .rst();
    let mut packet = Vec::with_capacity(builder.size(0));
    builder.write(&mut packet, &[]).map_err(build_error)?;

    debug!(context = context.id(), dest = %ip.dest, seq = tcp.seq, ack = tcp.ack, "forged tcp reset");
    injector.inject(ip.dest, &packet)?;
    Ok(())
}

/// Inject `data` into the TCP connection `context` belongs to, as if sent by
/// the observed destination.
pub fn forge_tcp_data(context: &Arc<ContextNode>, data: &[u8], injector: &dyn PacketInjector) -> Result<()> {
    let tcp = TcpReply::from_ancestry(context)?;
    let ip = Reply::from_ancestry(context)?;
    let builder = ip
        .builder()?
        .tcp(tcp.src_port, tcp.dest_port, tcp.seq, FORGED_WINDOW)
        .ack(tcp.ack);
    let mut packet = Vec::with_capacity(builder.size(data.len()));
    builder.write(&mut packet, data).map_err(build_error)?;

    debug!(context = context.id(), dest = %ip.dest, len = data.len(), "forged tcp data");
    injector.inject(ip.dest, &packet)?;
    Ok(())
}

/// Answer the DNS query carried by `context`, a DNS context directly under
/// a UDP context.
pub fn forge_dns_response(context: &Arc<ContextNode>, response: &DnsMessage, injector: &dyn PacketInjector) -> Result<()> {
    if context.kind() != ContextKind::Dns {
        return Err(Error::MissingAncestor { kind: ContextKind::Dns });
    }
    let udp = context
        .parent()
        .filter(|p| p.kind() == ContextKind::Udp)
        .ok_or(Error::MissingAncestor { kind: ContextKind::Udp })?;
    let src_port = udp.addr().dest.as_u16().ok_or(Error::MissingAncestor { kind: ContextKind::Udp })?;
    let dest_port = udp.addr().src.as_u16().ok_or(Error::MissingAncestor { kind: ContextKind::Udp })?;
    let ip = Reply::from_ancestry(&udp)?;

    let payload = response.encode();
    let builder = ip.builder()?.udp(src_port, dest_port);
    let mut packet = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut packet, &payload).map_err(build_error)?;

    debug!(context = context.id(), dest = %ip.dest, id = response.header.id, "forged dns response");
    injector.inject(ip.dest, &packet)?;
    Ok(())
}
