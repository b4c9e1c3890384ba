use serde::{Deserialize, Serialize};
use std::time::{self, Duration, SystemTime, UNIX_EPOCH};
/// represent current time with seconds and fraction of a second in nanoseconds
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TimeDurationStruct {
    /// seconds
    pub sec: u64,
    /// fraction of a second in nanoseconds
    pub nsec: u32,
}

/// calculate what time is it since `1970-1-1 00:00:00`,named as [UNIX_EPOCH]
///
/// a clock set before the epoch reads as the epoch itself
pub fn now() -> TimeDurationStruct {
    let now = SystemTime::now()
        .duration_since(time::UNIX_EPOCH)
        .unwrap_or_default();
    TimeDurationStruct {
        sec: now.as_secs(),
        nsec: now.subsec_nanos(),
    }
}

impl From<TimeDurationStruct> for SystemTime {
    fn from(value: TimeDurationStruct) -> Self {
        let duration = Duration::new(value.sec, value.nsec);
        UNIX_EPOCH + duration
    }
}

impl From<SystemTime> for TimeDurationStruct {
    fn from(value: SystemTime) -> Self {
        let duration = value.duration_since(UNIX_EPOCH).unwrap_or_default();
        TimeDurationStruct {
            sec: duration.as_secs(),
            nsec: duration.subsec_nanos(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_time_conversion() {
        let t = TimeDurationStruct { sec: 12, nsec: 34 };
        let system: SystemTime = t.into();
        assert_eq!(TimeDurationStruct::from(system), t);
        assert_eq!(
            TimeDurationStruct::from(UNIX_EPOCH - Duration::from_secs(1)),
            TimeDurationStruct::default()
        );
    }
}
