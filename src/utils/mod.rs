pub mod clock;
pub mod serde;

pub use clock::{epoch_to_datetime, Clock, FixedClock, SystemClock};
