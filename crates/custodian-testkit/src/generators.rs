//! Proptest generators for property-based testing.

use proptest::prelude::*;

use custodian_core::{Fingerprint, JobPriority, Platform};

/// Generate a fingerprint inside the accepted length range.
pub fn fingerprint() -> impl Strategy<Value = Fingerprint> {
    "[0-9a-f]{32,128}".prop_map(|s: String| Fingerprint::from_raw(s))
}

/// Generate a fingerprint that is too short or too long.
pub fn invalid_fingerprint() -> impl Strategy<Value = Fingerprint> {
    prop_oneof!["[0-9a-f]{0,31}", "[0-9a-f]{513,600}"].prop_map(|s: String| Fingerprint::from_raw(s))
}

/// Generate a platform.
pub fn platform() -> impl Strategy<Value = Platform> {
    prop_oneof![
        Just(Platform::Ios),
        Just(Platform::Android),
        Just(Platform::Desktop),
    ]
}

/// Generate a job priority.
pub fn priority() -> impl Strategy<Value = JobPriority> {
    prop_oneof![
        Just(JobPriority::High),
        Just(JobPriority::Normal),
        Just(JobPriority::Low),
    ]
}

/// Generate a reasonable timestamp in milliseconds.
pub fn timestamp() -> impl Strategy<Value = i64> {
    0i64..=4_000_000_000_000i64
}

/// Generate a device display name.
pub fn device_name() -> impl Strategy<Value = String> {
    "[A-Za-z][A-Za-z0-9 ]{0,40}".prop_map(String::from)
}

/// A point in a license's life, as an offset from issue time.
#[derive(Debug, Clone, Copy)]
pub struct LicenseTimeline {
    pub issued_at: i64,
    pub duration_ms: i64,
    pub grace_ms: i64,
    /// Milliseconds after `issued_at` at which the license is checked.
    pub elapsed_ms: i64,
}

impl Arbitrary for LicenseTimeline {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        (
            timestamp(),
            1i64..=60 * 86_400_000,
            1i64..=10 * 86_400_000,
            0i64..=90 * 86_400_000,
        )
            .prop_map(|(issued_at, duration_ms, grace_ms, elapsed_ms)| LicenseTimeline {
                issued_at,
                duration_ms,
                grace_ms,
                elapsed_ms,
            })
            .boxed()
    }
}
