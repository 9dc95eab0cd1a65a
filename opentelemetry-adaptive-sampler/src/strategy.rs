//! Sampling strategies and the decision lattice used to merge stage results.
use opentelemetry::trace::SamplingDecision;
use std::fmt;
use std::str::FromStr;

/// The reason a span was (or was not) sampled.
///
/// Strategies are totally ordered by their numeric value. Every strategy at or
/// above [`Strategy::Match`] means the span is kept, so callers compare with
/// [`Strategy::is_sampled`] or the `Ord` impl, never by variant.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(i8)]
pub enum Strategy {
    /// The upstream hop speaks an older protocol and carried no strategy.
    NotExist = -1,
    /// No strategy matched.
    #[default]
    NotMatch = 0,
    /// Generic "kept" marker used when the original reason is unknown.
    Match = 1,
    /// Forced capture from a dyeing rule.
    Dyeing = 2,
    /// Kept to satisfy the per-interface sampling floor.
    MinCount = 3,
    /// Kept by fraction based random sampling.
    Random = 4,
    /// Inherited from a sampled parent.
    Follow = 5,
    /// Kept because the span finished with an error status.
    Error = 6,
    /// Kept because the span took longer than the slow threshold.
    Slow = 7,
    /// Kept by a user supplied sampler.
    User = 8,
}

impl Strategy {
    const ALL: [Strategy; 10] = [
        Strategy::NotExist,
        Strategy::NotMatch,
        Strategy::Match,
        Strategy::Dyeing,
        Strategy::MinCount,
        Strategy::Random,
        Strategy::Follow,
        Strategy::Error,
        Strategy::Slow,
        Strategy::User,
    ];

    /// Returns `true` if this strategy means the span is kept.
    pub fn is_sampled(self) -> bool {
        self >= Strategy::Match
    }

    /// The numeric wire value of this strategy.
    pub fn as_i8(self) -> i8 {
        self as i8
    }

    /// Looks up a strategy by its numeric wire value.
    pub fn from_i8(value: i8) -> Option<Strategy> {
        Strategy::ALL.iter().copied().find(|s| s.as_i8() == value)
    }

    /// The configuration name of this strategy, as used for rate limit buckets.
    pub fn name(self) -> &'static str {
        match self {
            Strategy::NotExist => "not_exist",
            Strategy::NotMatch => "not_match",
            Strategy::Match => "match",
            Strategy::Dyeing => "dyeing",
            Strategy::MinCount => "min_count",
            Strategy::Random => "random",
            Strategy::Follow => "follow",
            Strategy::Error => "error",
            Strategy::Slow => "slow",
            Strategy::User => "user",
        }
    }

    pub(crate) fn decision(self) -> SamplingDecision {
        if self.is_sampled() {
            SamplingDecision::RecordAndSample
        } else {
            SamplingDecision::Drop
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error returned when a strategy name is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown sampling strategy {0:?}")]
pub struct UnknownStrategy(pub String);

impl FromStr for Strategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Strategy::ALL
            .iter()
            .copied()
            .find(|strategy| strategy.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownStrategy(s.to_string()))
    }
}

fn rank(decision: &SamplingDecision) -> u8 {
    match decision {
        SamplingDecision::Drop => 0,
        SamplingDecision::RecordOnly => 1,
        SamplingDecision::RecordAndSample => 2,
    }
}

/// Merges two stage decisions. Keep wins: any `RecordAndSample` yields
/// `RecordAndSample`, otherwise any `RecordOnly` yields `RecordOnly`.
pub fn merge_decision(a: SamplingDecision, b: SamplingDecision) -> SamplingDecision {
    if rank(&a) >= rank(&b) {
        a
    } else {
        b
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use SamplingDecision as D;

    #[test]
    fn order_follows_numeric_value() {
        for pair in Strategy::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
            assert!(pair[0].as_i8() < pair[1].as_i8());
        }
    }

    #[rstest]
    #[case(Strategy::NotExist, false)]
    #[case(Strategy::NotMatch, false)]
    #[case(Strategy::Match, true)]
    #[case(Strategy::Random, true)]
    #[case(Strategy::User, true)]
    fn sampled_threshold(#[case] strategy: Strategy, #[case] sampled: bool) {
        assert_eq!(strategy.is_sampled(), sampled);
        assert_eq!(
            strategy.decision() == SamplingDecision::RecordAndSample,
            sampled
        );
    }

    #[test]
    fn names_round_trip() {
        for strategy in Strategy::ALL {
            assert_eq!(strategy.name().parse::<Strategy>(), Ok(strategy));
            assert_eq!(Strategy::from_i8(strategy.as_i8()), Some(strategy));
        }
        assert_eq!("DYEING".parse::<Strategy>(), Ok(Strategy::Dyeing));
        assert!("sometimes".parse::<Strategy>().is_err());
        assert_eq!(Strategy::from_i8(9), None);
    }

    #[rstest]
    #[case(D::Drop, D::Drop, D::Drop)]
    #[case(D::Drop, D::RecordOnly, D::RecordOnly)]
    #[case(D::RecordOnly, D::Drop, D::RecordOnly)]
    #[case(D::RecordOnly, D::RecordAndSample, D::RecordAndSample)]
    #[case(D::RecordAndSample, D::Drop, D::RecordAndSample)]
    fn decision_lattice(
        #[case] a: D,
        #[case] b: D,
        #[case] expected: D,
    ) {
        assert_eq!(merge_decision(a, b), expected);
    }
}
