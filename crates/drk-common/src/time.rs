/// Raw timestamp-counter value or difference.
///
/// Counts are monotonic per core; differences use wrapping arithmetic since a
/// wrap of the 64-bit counter is not expected within one run.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct CycleCount(pub u64);

impl CycleCount {
    /// Largest representable count, used as the identity for minimum folds.
    pub const MAX: Self = Self(u64::MAX);

    /// Cycles elapsed from `start` to `self`.
    #[must_use]
    pub fn since(self, start: Self) -> Self {
        Self(self.0.wrapping_sub(start.0))
    }

    /// Raw count.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for CycleCount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
