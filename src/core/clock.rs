// Time source abstraction so state-machine timers are testable.
use chrono::{DateTime, Utc};

/// Single clock injected into every component that stamps or compares
/// timestamps. Tests substitute a manually advanced implementation.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
