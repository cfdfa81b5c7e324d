// Flow identity types shared between the capture path and the statistics engine.
// Everything here is a plain value: deriving keys must not touch shared state so
// any ingestion worker can call it without synchronisation.

use std::{
    fmt,
    hash::Hash,
    net::{IpAddr, SocketAddr},
};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum NetworkProtocol {
    Ipv4,
    Ipv6,
}

impl NetworkProtocol {
    pub fn name(self) -> &'static str {
        match self {
            NetworkProtocol::Ipv4 => "IPv4",
            NetworkProtocol::Ipv6 => "IPv6",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum TransportProtocol {
    Tcp,
    Udp,
}

impl TransportProtocol {
    pub fn name(self) -> &'static str {
        match self {
            TransportProtocol::Tcp => "TCP",
            TransportProtocol::Udp => "UDP",
        }
    }
}

/// Traffic direction relative to the monitored (local) endpoint.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Direction {
    /// local -> remote
    Upload,
    /// remote -> local
    Download,
}

impl Direction {
    /// Fallback used when neither or both endpoints are known to be local: the
    /// smaller endpoint plays the local role, so A->B and B->A agree on a key.
    pub fn canonical(src: (IpAddr, u16), dst: (IpAddr, u16)) -> Self {
        if src <= dst {
            Direction::Upload
        } else {
            Direction::Download
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct NetworkLayer {
    pub protocol: NetworkProtocol,
    pub src: IpAddr,
    pub dst: IpAddr,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TransportLayer {
    pub protocol: TransportProtocol,
    pub src_port: u16,
    pub dst_port: u16,
}

/// One captured frame after link/network/transport parsing.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DecodedFrame {
    /// Capture timestamp, milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    /// Length of the frame on the wire, not the captured slice.
    pub wire_len: u64,
    pub network: Option<NetworkLayer>,
    pub transport: Option<TransportLayer>,
    pub direction: Direction,
}

/// Behaviour the flow table and snapshot builder need from a key.
pub trait FlowKey: Clone + Eq + Hash + Send + Sync + 'static {
    fn protocol(&self) -> &'static str;
    /// Human-readable local endpoint.
    fn source(&self) -> String;
    /// Human-readable remote endpoint.
    fn destination(&self) -> String;
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct L3Key {
    pub protocol: NetworkProtocol,
    pub local_ip: IpAddr,
    pub remote_ip: IpAddr,
}

impl FlowKey for L3Key {
    fn protocol(&self) -> &'static str {
        self.protocol.name()
    }

    fn source(&self) -> String {
        self.local_ip.to_string()
    }

    fn destination(&self) -> String {
        self.remote_ip.to_string()
    }
}

impl fmt::Display for L3Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} <-> {} proto:{}",
            self.local_ip,
            self.remote_ip,
            self.protocol.name()
        )
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct L4Key {
    pub protocol: TransportProtocol,
    pub local_ip: IpAddr,
    pub local_port: u16,
    pub remote_ip: IpAddr,
    pub remote_port: u16,
}

impl FlowKey for L4Key {
    fn protocol(&self) -> &'static str {
        self.protocol.name()
    }

    fn source(&self) -> String {
        SocketAddr::new(self.local_ip, self.local_port).to_string()
    }

    fn destination(&self) -> String {
        SocketAddr::new(self.remote_ip, self.remote_port).to_string()
    }
}

impl fmt::Display for L4Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} <-> {} proto:{}",
            self.source(),
            self.destination(),
            self.protocol.name()
        )
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FlowKeys {
    pub l3: L3Key,
    /// Present only when the frame carried a transport header.
    pub l4: Option<L4Key>,
    pub direction: Direction,
}

/// Maps a decoded frame to its direction-normalised keys. Returns `None` when
/// the frame has no network layer.
pub fn derive_keys(frame: &DecodedFrame) -> Option<FlowKeys> {
    let net = frame.network?;
    let (local_ip, remote_ip) = match frame.direction {
        Direction::Upload => (net.src, net.dst),
        Direction::Download => (net.dst, net.src),
    };
    let l3 = L3Key {
        protocol: net.protocol,
        local_ip,
        remote_ip,
    };
    let l4 = frame.transport.map(|t| {
        let (local_port, remote_port) = match frame.direction {
            Direction::Upload => (t.src_port, t.dst_port),
            Direction::Download => (t.dst_port, t.src_port),
        };
        L4Key {
            protocol: t.protocol,
            local_ip,
            local_port,
            remote_ip,
            remote_port,
        }
    });
    Some(FlowKeys {
        l3,
        l4,
        direction: frame.direction,
    })
}
