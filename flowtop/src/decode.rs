use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use flowtop_common::{
    DecodedFrame, Direction, NetworkLayer, NetworkProtocol, TransportLayer, TransportProtocol,
};

use crate::model::LocalNetworks;

const ETH_P_IPV4: u16 = 0x0800;
const ETH_P_IPV6: u16 = 0x86DD;
const ETH_P_8021Q: u16 = 0x8100;
const ETH_P_8021AD: u16 = 0x88A8;
const ETH_HEADER_LEN: usize = 14;
const VLAN_TAG_LEN: usize = 4;
const SLL_HEADER_LEN: usize = 16;
const NULL_HEADER_LEN: usize = 4;
const IPV4_MIN_HEADER: usize = 20;
const IPV6_HEADER_LEN: usize = 40;
const TCP_MIN_HEADER: usize = 20;
const UDP_HEADER_LEN: usize = 8;

const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;
const IPV6_EXT_HOP_BY_HOP: u8 = 0;
const IPV6_EXT_ROUTING: u8 = 43;
const IPV6_EXT_FRAGMENT: u8 = 44;
const IPV6_EXT_DEST_OPTS: u8 = 60;

/// Link-layer framing of a capture handle (libpcap DLT values).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LinkKind {
    Ethernet,
    LinuxSll,
    RawIp,
    /// BSD loopback, address family in host byte order.
    Null,
    /// OpenBSD loopback, address family in network byte order.
    Loop,
}

impl LinkKind {
    pub fn from_dlt(dlt: i32) -> Option<Self> {
        match dlt {
            0 => Some(LinkKind::Null),
            1 => Some(LinkKind::Ethernet),
            12 | 101 | 228 | 229 => Some(LinkKind::RawIp),
            108 => Some(LinkKind::Loop),
            113 => Some(LinkKind::LinuxSll),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Layers {
    network: NetworkLayer,
    transport: Option<TransportLayer>,
}

/// Decodes one captured frame. A frame without a recognisable network layer
/// still yields a `DecodedFrame`, with `network` left empty.
pub fn decode_frame(
    link: LinkKind,
    data: &[u8],
    wire_len: u64,
    timestamp_ms: i64,
    local: &LocalNetworks,
) -> DecodedFrame {
    let layers =
        parse_link(link, data).and_then(|(ether_type, payload)| parse_ip(ether_type, payload));
    let direction = match layers {
        Some(layers) => resolve_direction(&layers, local),
        None => Direction::Upload,
    };
    DecodedFrame {
        timestamp_ms,
        wire_len,
        network: layers.map(|l| l.network),
        transport: layers.and_then(|l| l.transport),
        direction,
    }
}

fn resolve_direction(layers: &Layers, local: &LocalNetworks) -> Direction {
    let net = &layers.network;
    let src_local = local.contains(&net.src);
    let dst_local = local.contains(&net.dst);
    match (src_local, dst_local) {
        (true, false) => Direction::Upload,
        (false, true) => Direction::Download,
        _ => {
            let (src_port, dst_port) = layers
                .transport
                .map(|t| (t.src_port, t.dst_port))
                .unwrap_or((0, 0));
            Direction::canonical((net.src, src_port), (net.dst, dst_port))
        }
    }
}

fn parse_link(link: LinkKind, frame: &[u8]) -> Option<(u16, &[u8])> {
    match link {
        LinkKind::Ethernet => parse_ethernet(frame),
        LinkKind::LinuxSll => {
            if frame.len() < SLL_HEADER_LEN {
                return None;
            }
            let proto = u16::from_be_bytes([frame[14], frame[15]]);
            Some((proto, &frame[SLL_HEADER_LEN..]))
        }
        LinkKind::RawIp => {
            let version = *frame.first()? >> 4;
            match version {
                4 => Some((ETH_P_IPV4, frame)),
                6 => Some((ETH_P_IPV6, frame)),
                _ => None,
            }
        }
        LinkKind::Null | LinkKind::Loop => {
            if frame.len() < NULL_HEADER_LEN {
                return None;
            }
            let raw: [u8; 4] = frame[..NULL_HEADER_LEN].try_into().ok()?;
            let family = if link == LinkKind::Null {
                u32::from_ne_bytes(raw)
            } else {
                u32::from_be_bytes(raw)
            };
            let ether_type = match family {
                2 => ETH_P_IPV4,
                24 | 28 | 30 => ETH_P_IPV6,
                _ => return None,
            };
            Some((ether_type, &frame[NULL_HEADER_LEN..]))
        }
    }
}

fn parse_ethernet(frame: &[u8]) -> Option<(u16, &[u8])> {
    if frame.len() < ETH_HEADER_LEN {
        return None;
    }
    let mut ether_type = u16::from_be_bytes([frame[12], frame[13]]);
    let mut offset = ETH_HEADER_LEN;
    while ether_type == ETH_P_8021Q || ether_type == ETH_P_8021AD {
        if frame.len() < offset + VLAN_TAG_LEN {
            return None;
        }
        ether_type = u16::from_be_bytes([frame[offset + 2], frame[offset + 3]]);
        offset += VLAN_TAG_LEN;
    }
    Some((ether_type, &frame[offset..]))
}

fn parse_ip(ether_type: u16, payload: &[u8]) -> Option<Layers> {
    match ether_type {
        ETH_P_IPV4 => parse_ipv4(payload),
        ETH_P_IPV6 => parse_ipv6(payload),
        _ => None,
    }
}

fn parse_ipv4(payload: &[u8]) -> Option<Layers> {
    if payload.len() < IPV4_MIN_HEADER {
        return None;
    }
    let version_ihl = payload[0];
    if version_ihl >> 4 != 4 {
        return None;
    }
    let ihl_bytes = ((version_ihl & 0x0f) as usize) * 4;
    if payload.len() < ihl_bytes || ihl_bytes < IPV4_MIN_HEADER {
        return None;
    }
    let src: [u8; 4] = payload[12..16].try_into().ok()?;
    let dst: [u8; 4] = payload[16..20].try_into().ok()?;
    let network = NetworkLayer {
        protocol: NetworkProtocol::Ipv4,
        src: IpAddr::V4(Ipv4Addr::from(src)),
        dst: IpAddr::V4(Ipv4Addr::from(dst)),
    };
    // only the first fragment carries the transport header
    let fragment_offset = u16::from_be_bytes([payload[6], payload[7]]) & 0x1fff;
    let transport = if fragment_offset == 0 {
        parse_transport(payload[9], &payload[ihl_bytes..])
    } else {
        None
    };
    Some(Layers { network, transport })
}

fn parse_ipv6(payload: &[u8]) -> Option<Layers> {
    if payload.len() < IPV6_HEADER_LEN {
        return None;
    }
    if payload[0] >> 4 != 6 {
        return None;
    }
    let src: [u8; 16] = payload[8..24].try_into().ok()?;
    let dst: [u8; 16] = payload[24..40].try_into().ok()?;
    let network = NetworkLayer {
        protocol: NetworkProtocol::Ipv6,
        src: IpAddr::V6(Ipv6Addr::from(src)),
        dst: IpAddr::V6(Ipv6Addr::from(dst)),
    };

    let mut next_header = payload[6];
    let mut rest = &payload[IPV6_HEADER_LEN..];
    let transport = loop {
        match next_header {
            IPV6_EXT_HOP_BY_HOP | IPV6_EXT_ROUTING | IPV6_EXT_DEST_OPTS => {
                if rest.len() < 2 {
                    break None;
                }
                let ext_len = (rest[1] as usize + 1) * 8;
                if rest.len() < ext_len {
                    break None;
                }
                next_header = rest[0];
                rest = &rest[ext_len..];
            }
            IPV6_EXT_FRAGMENT => {
                if rest.len() < 8 {
                    break None;
                }
                let fragment_offset = u16::from_be_bytes([rest[2], rest[3]]) >> 3;
                if fragment_offset != 0 {
                    break None;
                }
                next_header = rest[0];
                rest = &rest[8..];
            }
            proto => break parse_transport(proto, rest),
        }
    };
    Some(Layers { network, transport })
}

fn parse_transport(proto: u8, segment: &[u8]) -> Option<TransportLayer> {
    let (protocol, min_len) = match proto {
        IPPROTO_TCP => (TransportProtocol::Tcp, TCP_MIN_HEADER),
        IPPROTO_UDP => (TransportProtocol::Udp, UDP_HEADER_LEN),
        _ => return None,
    };
    if segment.len() < min_len {
        return None;
    }
    Some(TransportLayer {
        protocol,
        src_port: u16::from_be_bytes([segment[0], segment[1]]),
        dst_port: u16::from_be_bytes([segment[2], segment[3]]),
    })
}
