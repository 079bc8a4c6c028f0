mod conversion_log;
mod idempotency;
mod job;
mod receipt;
mod tenant;
mod usage;
mod verification;

pub use conversion_log::*;
pub use idempotency::*;
pub use job::*;
pub use receipt::*;
pub use tenant::*;
pub use usage::*;
pub use verification::*;
