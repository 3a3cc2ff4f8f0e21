use std::sync::Arc;

use axum::http::HeaderMap;
use rearch::CapsuleHandle;
use time::OffsetDateTime;
use tracing::warn;

use crate::config::test_mode_capsule;

/// Header carrying the current time, in milliseconds since the Unix epoch,
/// that requests may supply while test mode is enabled.
pub const TEST_NOW_HEADER: &str = "x-test-now-ms";

pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Resolves the current time for a request.
#[derive(Clone)]
pub struct RequestClock {
    clock: Arc<dyn Clock>,
    test_mode: bool,
}

pub fn request_clock_capsule(CapsuleHandle { mut get, .. }: CapsuleHandle) -> RequestClock {
    RequestClock::new(Arc::new(SystemClock), *get.as_ref(test_mode_capsule))
}

impl RequestClock {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, test_mode: bool) -> Self {
        Self { clock, test_mode }
    }

    /// Outside of test mode, and whenever the header is absent or malformed,
    /// this is just the underlying clock.
    #[must_use]
    pub fn now(&self, headers: &HeaderMap) -> OffsetDateTime {
        if self.test_mode
            && let Some(value) = headers.get(TEST_NOW_HEADER)
        {
            match parse_millis(value.as_bytes()) {
                Some(now) => return now,
                None => warn!(?value, "Ignoring malformed {TEST_NOW_HEADER} header"),
            }
        }
        self.clock.now()
    }
}

fn parse_millis(value: &[u8]) -> Option<OffsetDateTime> {
    let millis: i64 = std::str::from_utf8(value).ok()?.trim().parse().ok()?;
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000).ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use axum::http::HeaderValue;
    use time::macros::datetime;

    use super::*;

    struct FixedClock(OffsetDateTime);

    impl Clock for FixedClock {
        fn now(&self) -> OffsetDateTime {
            self.0
        }
    }

    const FIXED: OffsetDateTime = datetime!(2030-01-01 00:00:00 UTC);

    fn headers_with_now(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(TEST_NOW_HEADER, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn test_header_used_in_test_mode() {
        let clock = RequestClock::new(Arc::new(FixedClock(FIXED)), true);
        let now = clock.now(&headers_with_now("1500"));
        assert_eq!(now, OffsetDateTime::UNIX_EPOCH + time::Duration::milliseconds(1500));
    }

    #[test]
    fn test_header_ignored_outside_test_mode() {
        let clock = RequestClock::new(Arc::new(FixedClock(FIXED)), false);
        assert_eq!(clock.now(&headers_with_now("1500")), FIXED);
    }

    #[test]
    fn test_malformed_or_missing_header_falls_back() {
        let clock = RequestClock::new(Arc::new(FixedClock(FIXED)), true);
        assert_eq!(clock.now(&headers_with_now("soon")), FIXED);
        assert_eq!(clock.now(&headers_with_now("")), FIXED);
        assert_eq!(clock.now(&HeaderMap::new()), FIXED);
    }

    #[test]
    fn test_system_clock_is_utc() {
        assert!(SystemClock.now().offset().is_utc());
    }
}
