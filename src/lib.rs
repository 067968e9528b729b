pub mod congestion;
pub mod packet;
pub mod queue;
pub mod sched;
pub mod tunnel;

// The endpoint most users construct.
pub use tunnel::{Tunnel, TunnelConfig};
