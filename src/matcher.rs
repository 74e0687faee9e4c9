use fprint_vision::Descriptor;
use serde::Serialize;

/// Distance reported for a descriptor whose length differs from the query,
/// e.g. one enrolled under another model version.
pub const MISMATCH_DISTANCE: f32 = f32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Ranked {
    pub identity: usize,
    pub distance: f32,
}

/// One entry per stored descriptor, nearest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct DistanceReport(pub Vec<Ranked>);

impl DistanceReport {
    pub fn entries(&self) -> &[Ranked] {
        &self.0
    }

    pub fn nearest(&self) -> Option<Ranked> {
        self.0.first().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for DistanceReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Distance Report:")?;
        for r in &self.0 {
            writeln!(f, "Fingerprint {}: {}", r.identity, r.distance)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoMatchReason {
    NoEnrollments,
    AboveThreshold,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Match {
        identity: usize,
        distance: f32,
        report: DistanceReport,
    },
    NoMatch {
        reason: NoMatchReason,
        report: DistanceReport,
    },
}

impl Decision {
    pub fn is_match(&self) -> bool {
        matches!(self, Decision::Match { .. })
    }

    pub fn report(&self) -> &DistanceReport {
        match self {
            Decision::Match { report, .. } | Decision::NoMatch { report, .. } => report,
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Match {
                identity, report, ..
            } => write!(
                f,
                "Fingerprint verified successfully! (Matched ID: {})\n\n{}",
                identity, report
            ),
            Decision::NoMatch {
                reason: NoMatchReason::NoEnrollments,
                ..
            } => write!(f, "No stored fingerprints found."),
            Decision::NoMatch { report, .. } => {
                write!(f, "No matching fingerprint found.\n\n{}", report)
            }
        }
    }
}

/// Euclidean distance, or [`MISMATCH_DISTANCE`] when the lengths differ.
pub fn distance(a: &Descriptor, b: &Descriptor) -> f32 {
    if a.len() != b.len() {
        log::warn!("mismatched descriptor lengths: {} vs {}", a.len(), b.len());
        return MISMATCH_DISTANCE;
    }
    a.as_slice()
        .iter()
        .zip(b.as_slice())
        .map(|(x, y)| {
            let d = (x - y) as f64;
            d * d
        })
        .sum::<f64>()
        .sqrt() as f32
}

/// Ranks `stored` by distance to `probe` and accepts the nearest one when it
/// is strictly closer than `threshold`. Equal distances keep store order, so
/// the lowest identity wins a tie.
pub fn decide(probe: &Descriptor, stored: &[Descriptor], threshold: f32) -> Decision {
    if stored.is_empty() {
        return Decision::NoMatch {
            reason: NoMatchReason::NoEnrollments,
            report: DistanceReport::default(),
        };
    }

    let mut ranked: Vec<Ranked> = stored
        .iter()
        .enumerate()
        .map(|(i, d)| Ranked {
            identity: i + 1,
            distance: distance(probe, d),
        })
        .collect();
    // Stable sort keeps ties in identity order.
    ranked.sort_by(|a, b| a.distance.total_cmp(&b.distance));
    let report = DistanceReport(ranked);

    let nearest = report.0[0];
    log::debug!(
        "nearest fingerprint {} at {} (threshold {})",
        nearest.identity,
        nearest.distance,
        threshold
    );

    if nearest.distance < threshold {
        Decision::Match {
            identity: nearest.identity,
            distance: nearest.distance,
            report,
        }
    } else {
        Decision::NoMatch {
            reason: NoMatchReason::AboveThreshold,
            report,
        }
    }
}
