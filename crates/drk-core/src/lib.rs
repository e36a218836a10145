#![doc = "Fault-suppressed timing probes built on Intel TSX."]

pub mod calibrate;
pub mod fixture;
pub mod hwcaps;
pub mod ops;
pub mod realtime;
pub mod rtm;
pub mod sampler;
pub mod scan;
pub mod timing;

pub use calibrate::*;
pub use fixture::*;
pub use hwcaps::*;
pub use realtime::*;
pub use rtm::*;
pub use sampler::*;
pub use scan::*;
