//! Proxy reachability checking and ranking
//!
//! - Probe strategies routed through local SOCKS tunnels
//! - Generation-gated batch checking
//! - Hysteretic top-K selection for the meta-subscription

pub mod health;
pub mod probe;
pub mod ranking;
pub mod state;

pub use health::{BatchReport, ProxyChecker};
pub use probe::{CheckMethod, HttpProber, ProbeSuccess, Prober};
pub use ranking::StableSelector;
