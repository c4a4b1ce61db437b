pub mod config;
pub mod error;
pub mod sstable;
pub mod xrp;

pub use config::{OffloadConfig, SamplerConfig};
pub use error::{Error, Result};
pub use xrp::{AdaptiveSampler, FileRequest, Lookup, Mode, ReadContext};
