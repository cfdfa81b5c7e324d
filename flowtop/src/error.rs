use thiserror::Error;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("failed to open capture on {iface}: {source}")]
    CaptureOpen {
        iface: String,
        #[source]
        source: pcap::Error,
    },

    #[error("failed to install capture filter {filter:?} on {iface}: {source}")]
    CaptureFilter {
        iface: String,
        filter: String,
        #[source]
        source: pcap::Error,
    },

    #[error("interface {0} is not monitored")]
    UnknownInterface(String),

    #[error("failed to encode snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MonitorError>;
