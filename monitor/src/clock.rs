//! Wall-clock and local time source.
//!
//! Payload timestamps are epoch seconds. The "local" variant is the UTC value
//! shifted by the host's UTC offset, i.e. what the local wall clock reads if it
//! is interpreted as UTC.

use std::env;
use std::path::Path;

use chrono::{Local, Utc};
use chrono_tz::Tz;

/// Zoneinfo path used on Unix hosts to select the local timezone.
const LOCALTIME_LINK: &str = "/etc/localtime";

/// Timezone name used when the host zone cannot be resolved.
const FALLBACK_TIMEZONE: &str = "UTC";

/// Current time as UTC and local epoch seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NowTimes {
    pub now_in_sec: i64,
    pub local_now_in_sec: i64,
}

/// Source of the current time and the local timezone name.
pub trait Clock: Send + Sync {
    fn now(&self) -> NowTimes;

    /// IANA timezone name of the host, e.g. `Europe/Berlin`.
    fn timezone(&self) -> String;
}

/// Clock backed by the system time.
#[derive(Debug, Clone)]
pub struct SystemClock {
    timezone: String,
}

impl SystemClock {
    /// Creates a system clock, resolving the timezone name once.
    #[must_use]
    pub fn new() -> Self {
        Self {
            timezone: resolve_timezone(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> NowTimes {
        let local = Local::now();
        let now_in_sec = local.with_timezone(&Utc).timestamp();
        let offset = i64::from(local.offset().local_minus_utc());
        NowTimes {
            now_in_sec,
            local_now_in_sec: now_in_sec + offset,
        }
    }

    fn timezone(&self) -> String {
        self.timezone.clone()
    }
}

/// Clock that always returns the same instant.
#[derive(Debug, Clone)]
pub struct FixedClock {
    pub times: NowTimes,
    pub timezone: String,
}

impl FixedClock {
    #[must_use]
    pub fn new(now_in_sec: i64, local_now_in_sec: i64, timezone: impl Into<String>) -> Self {
        Self {
            times: NowTimes {
                now_in_sec,
                local_now_in_sec,
            },
            timezone: timezone.into(),
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> NowTimes {
        self.times
    }

    fn timezone(&self) -> String {
        self.timezone.clone()
    }
}

/// Resolves the host timezone from `TZ`, then `/etc/localtime`.
fn resolve_timezone() -> String {
    if let Ok(tz) = env::var("TZ") {
        if let Some(name) = valid_zone_name(tz.trim_start_matches(':')) {
            return name;
        }
    }

    zone_name_from_link(Path::new(LOCALTIME_LINK))
        .unwrap_or_else(|| FALLBACK_TIMEZONE.to_string())
}

/// Extracts the zone name from a `.../zoneinfo/<Area>/<City>` symlink target.
fn zone_name_from_link(link: &Path) -> Option<String> {
    let target = std::fs::read_link(link).ok()?;
    zone_name_from_target(&target.to_string_lossy())
}

fn zone_name_from_target(target: &str) -> Option<String> {
    let (_, name) = target.split_once("zoneinfo/")?;
    valid_zone_name(name)
}

fn valid_zone_name(name: &str) -> Option<String> {
    name.parse::<Tz>().ok().map(|_| name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_returns_fixed_values() {
        let clock = FixedClock::new(1_700_000_000, 1_700_003_600, "Europe/Paris");
        assert_eq!(clock.now().now_in_sec, 1_700_000_000);
        assert_eq!(clock.now().local_now_in_sec, 1_700_003_600);
        assert_eq!(clock.timezone(), "Europe/Paris");
    }

    #[test]
    fn system_clock_local_differs_by_offset_only() {
        let clock = SystemClock::new();
        let times = clock.now();
        let diff = times.local_now_in_sec - times.now_in_sec;
        // Real offsets lie within -12h..=+14h.
        assert!((-12 * 3600..=14 * 3600).contains(&diff));
        assert!(times.now_in_sec > 1_600_000_000);
    }

    #[test]
    fn system_clock_timezone_is_valid_zone() {
        let tz = SystemClock::new().timezone();
        assert!(tz.parse::<Tz>().is_ok(), "unexpected zone {tz}");
    }

    #[test]
    fn zone_name_from_zoneinfo_target() {
        assert_eq!(
            zone_name_from_target("/usr/share/zoneinfo/America/New_York"),
            Some("America/New_York".to_string())
        );
        assert_eq!(
            zone_name_from_target("../usr/share/zoneinfo/Etc/UTC"),
            Some("Etc/UTC".to_string())
        );
    }

    #[test]
    fn zone_name_rejects_unknown_targets() {
        assert_eq!(zone_name_from_target("/usr/share/zoneinfo/Mars/Base"), None);
        assert_eq!(zone_name_from_target("/etc/something-else"), None);
    }

    #[test]
    fn missing_link_yields_none() {
        let dir = tempfile::TempDir::new().unwrap();
        assert_eq!(zone_name_from_link(&dir.path().join("localtime")), None);
    }
}
