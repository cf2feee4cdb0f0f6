pub mod backoff;
pub mod clock;
pub mod serde;
pub mod telemetry;

pub use backoff::*;
pub use clock::*;
pub use self::serde::*;
pub use telemetry::*;
