use std::time::{Duration, Instant, SystemTime};

use once_cell::sync::Lazy;

// RTP "wallclock" is NTP time, which starts at 1900-01-01.
//
// https://tools.ietf.org/html/rfc868
//
// 365 days * 70 years + 17 leap year days
// (365 * 70 + 17) * 86400 = 2208988800
const SECS_1900: u64 = 2_208_988_800;

/// 2^32 as float.
const F32: f64 = 4_294_967_296.0;

// A frozen pairing of Instant and SystemTime from process start. Instant
// cannot represent absolute time, so all wallclock derivations (NTP for
// sender reports, unix millis for notifications) go via this anchor.
static BEGINNING_OF_TIME: Lazy<(Instant, SystemTime)> = Lazy::new(|| {
    let now = Instant::now();
    let now_sys = SystemTime::now();

    // Find an Instant up to an hour in the past. Might be less if the
    // machine hasn't been up that long.
    let beginning_of_time = {
        let mut secs = 3600;
        loop {
            let dur = Duration::from_secs(secs);
            if let Some(v) = now.checked_sub(dur) {
                break v;
            }
            secs -= 1;
            if secs == 0 {
                panic!("Failed to find a beginning of time instant");
            }
        }
    };

    let since_beginning_of_time = Instant::now() - beginning_of_time;
    let beginning_of_time_sys = now_sys - since_beginning_of_time;

    (beginning_of_time, beginning_of_time_sys)
});

/// An `Instant` that predates anything the event loop will ever observe.
///
/// Used to initialize "last time X happened" fields so the first check
/// always considers X overdue.
pub(crate) fn already_happened() -> Instant {
    BEGINNING_OF_TIME.0
}

/// Milliseconds since the unix epoch for a loop `Instant`.
pub(crate) fn unix_ms(now: Instant) -> u64 {
    let since_beginning = now.saturating_duration_since(BEGINNING_OF_TIME.0);
    let sys = BEGINNING_OF_TIME.1 + since_beginning;

    sys.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub(crate) trait InstantExt {
    /// The 64 bit NTP timestamp for this instant, integer seconds in the
    /// top 32 bits and fraction in the bottom 32.
    fn as_ntp_64(&self) -> u64;

    /// The middle 32 bits of the NTP timestamp, as echoed in receiver
    /// report LSR/DLSR fields (units of 1/65536 seconds).
    fn as_compact_ntp(&self) -> u32 {
        (self.as_ntp_64() >> 16) as u32
    }
}

impl InstantExt for Instant {
    fn as_ntp_64(&self) -> u64 {
        let since_beginning = self.saturating_duration_since(BEGINNING_OF_TIME.0);
        let sys = BEGINNING_OF_TIME.1 + since_beginning;

        let secs_epoch = sys
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        let secs_ntp = secs_epoch + SECS_1900 as f64;

        (secs_ntp * F32) as u64
    }
}
