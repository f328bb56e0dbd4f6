pub mod clock;

pub use clock::{now_ms, Clock, ManualClock, SystemClock};
