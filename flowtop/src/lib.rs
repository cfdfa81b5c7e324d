pub mod decode;
pub mod error;
pub mod http;
pub mod model;
pub mod node;
pub mod rate;
pub mod snapshot;
pub mod stats;
pub mod store;

pub use error::MonitorError;
pub use stats::{Iface, IfaceOptions, Stats};
