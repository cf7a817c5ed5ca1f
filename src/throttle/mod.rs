//! Fixed-window request throttling.

mod category;
mod clock;
mod decision;
mod limiter;
mod record;

pub use category::{Category, CategoryRule, CategoryTable};
pub use clock::{Clock, ManualClock, SystemClock};
pub use decision::{decide, Decision, StoreWrite, FAIL_OPEN_REMAINING};
pub use limiter::{Consistency, RequestThrottle};
pub use record::{ThrottleKey, ThrottleRecord};
