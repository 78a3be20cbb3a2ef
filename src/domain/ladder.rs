//! Bitrate steps used to synthesize lower adaptive renditions.

/// `(threshold, delta)` pairs in ascending threshold order.
const LADDER: [(u64, u64); 7] = [
    (400_000, 100_000),
    (600_000, 200_000),
    (1_000_000, 300_000),
    (2_000_000, 500_000),
    (3_000_000, 1_000_000),
    (5_000_000, 1_500_000),
    (10_000_000, 2_000_000),
];

/// Delta for bitrates below every threshold.
const DEFAULT_STEP: u64 = 50_000;

/// The two step-down deltas for `nominal`. The second is twice the first.
pub fn steps(nominal: u64) -> [u64; 2] {
    let step = LADDER
        .iter()
        .rev()
        .find(|(threshold, _)| nominal >= *threshold)
        .map(|(_, delta)| *delta)
        .unwrap_or(DEFAULT_STEP);
    [step, step * 2]
}

/// A lower rendition derived from a nominal bitrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rendition {
    pub step: u64,
    pub bitrate: u64,
}

/// Lower renditions for `nominal`, highest first. Steps that would leave no
/// bitrate at all are dropped.
pub fn renditions(nominal: u64) -> Vec<Rendition> {
    steps(nominal)
        .into_iter()
        .map(|step| Rendition {
            step,
            bitrate: nominal.saturating_sub(step),
        })
        .filter(|rendition| rendition.bitrate > 0 && rendition.bitrate < nominal)
        .collect()
}
