use std::time::Duration;

/// How long a driver call may block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Timeout {
    /// Block until a packet arrives or the call is interrupted.
    Infinite,
    Millis(u32),
}

impl Timeout {
    /// Negative values mean infinite.
    pub fn from_millis(ms: i64) -> Self {
        if ms < 0 {
            Timeout::Infinite
        } else {
            Timeout::Millis(ms.min(i32::MAX as i64) as u32)
        }
    }

    /// Value in driver units: -1 for infinite, otherwise at least 1 ms.
    ///
    /// A zero timeout is raised to 1 ms: under load a non-blocking poll makes
    /// other applications sharing the port see EINVAL.
    pub fn as_millis(self) -> i32 {
        match self {
            Timeout::Infinite => -1,
            Timeout::Millis(ms) => ms.clamp(1, i32::MAX as u32) as i32,
        }
    }

    /// `None` for infinite.
    pub fn as_duration(self) -> Option<Duration> {
        match self {
            Timeout::Infinite => None,
            Timeout::Millis(_) => Some(Duration::from_millis(self.as_millis() as u64)),
        }
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Timeout::Millis(d.as_millis().min(i32::MAX as u128) as u32)
    }
}

impl From<Option<Duration>> for Timeout {
    fn from(d: Option<Duration>) -> Self {
        d.map_or(Timeout::Infinite, Timeout::from)
    }
}
