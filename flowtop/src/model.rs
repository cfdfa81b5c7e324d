use std::{fmt, fs, net::IpAddr, path::Path};

use anyhow::{Context, Result};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use prefix_trie::PrefixMap;

/// Set of networks considered "local" when deciding whether a frame is an
/// upload or a download.
#[derive(Clone)]
pub struct LocalNetworks {
    ipv4: PrefixMap<Ipv4Net, ()>,
    ipv6: PrefixMap<Ipv6Net, ()>,
    len: usize,
}

impl Default for LocalNetworks {
    fn default() -> Self {
        Self {
            ipv4: PrefixMap::new(),
            ipv6: PrefixMap::new(),
            len: 0,
        }
    }
}

impl fmt::Debug for LocalNetworks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalNetworks")
            .field("len", &self.len)
            .finish()
    }
}

impl LocalNetworks {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_option(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_path(path),
            None => Ok(Self::empty()),
        }
    }

    fn from_path(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read local networks at {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("in {}", path.display()))
    }

    /// One CIDR per line; `#` starts a comment.
    pub fn parse(contents: &str) -> Result<Self> {
        let mut nets = Self::empty();
        for (line_no, line) in contents.lines().enumerate() {
            let trimmed = line.split('#').next().unwrap_or("").trim();
            if trimmed.is_empty() {
                continue;
            }
            let net: IpNet = trimmed.parse().with_context(|| {
                format!("line {} must be CIDR notation, got '{trimmed}'", line_no + 1)
            })?;
            nets.insert(net);
        }
        Ok(nets)
    }

    pub fn insert(&mut self, net: IpNet) {
        let added = match net.trunc() {
            IpNet::V4(net) => self.ipv4.insert(net, ()).is_none(),
            IpNet::V6(net) => self.ipv6.insert(net, ()).is_none(),
        };
        if added {
            self.len += 1;
        }
    }

    /// Adds a single host address (interface-owned address).
    pub fn insert_host(&mut self, addr: IpAddr) {
        self.insert(IpNet::from(addr));
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        match IpNet::from(*addr) {
            IpNet::V4(host) => self.ipv4.get_lpm(&host).is_some(),
            IpNet::V6(host) => self.ipv6.get_lpm(&host).is_some(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len
    }
}
