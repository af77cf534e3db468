//! Rules that turn per-detector results into one violation decision.

use std::collections::BTreeSet;

use anyhow::{anyhow, Result};

use crate::detect::DetectionResult;

pub const DEFAULT_NEGATIVE_MARKER: &str = "NO-";

/// A label that counted against the image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Finding {
    pub detector: String,
    pub label: String,
}

impl Finding {
    pub fn tag(&self) -> String {
        format!("{}:{}", self.detector, self.label)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Verdict {
    pub violation: bool,
    pub findings: Vec<Finding>,
}

pub trait AggregationPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// True when `label` reports that required equipment is absent.
    fn is_negative(&self, label: &str) -> bool;

    fn evaluate(&self, results: &[DetectionResult]) -> Verdict;
}

/// Flags a violation when any detector reports any negative-finding label.
#[derive(Clone, Debug)]
pub struct NegativeMarkerPolicy {
    marker: String,
}

impl NegativeMarkerPolicy {
    pub fn new(marker: &str) -> Result<Self> {
        if marker.trim().is_empty() {
            return Err(anyhow!("negative marker must not be empty"));
        }
        Ok(Self {
            marker: marker.to_string(),
        })
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    fn findings(&self, results: &[DetectionResult]) -> Vec<Finding> {
        results
            .iter()
            .flat_map(|result| {
                result
                    .detections
                    .iter()
                    .filter(|detection| self.is_negative(&detection.label))
                    .map(|detection| Finding {
                        detector: result.detector.clone(),
                        label: detection.label.clone(),
                    })
            })
            .collect()
    }
}

impl Default for NegativeMarkerPolicy {
    fn default() -> Self {
        Self {
            marker: DEFAULT_NEGATIVE_MARKER.to_string(),
        }
    }
}

impl AggregationPolicy for NegativeMarkerPolicy {
    fn name(&self) -> &'static str {
        "any_negative"
    }

    // ASCII case-insensitive prefix: vocabularies spell it "NO-Hardhat" and "No-Gloves".
    fn is_negative(&self, label: &str) -> bool {
        label
            .get(..self.marker.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(&self.marker))
    }

    fn evaluate(&self, results: &[DetectionResult]) -> Verdict {
        let findings = self.findings(results);
        Verdict {
            violation: !findings.is_empty(),
            findings,
        }
    }
}

/// Flags a violation only when at least `min_detectors` distinct detectors report a
/// negative finding.
#[derive(Clone, Debug)]
pub struct QuorumPolicy {
    markers: NegativeMarkerPolicy,
    min_detectors: usize,
}

impl QuorumPolicy {
    pub fn new(markers: NegativeMarkerPolicy, min_detectors: usize) -> Result<Self> {
        if min_detectors == 0 {
            return Err(anyhow!("quorum must be at least 1"));
        }
        Ok(Self {
            markers,
            min_detectors,
        })
    }
}

impl AggregationPolicy for QuorumPolicy {
    fn name(&self) -> &'static str {
        "quorum"
    }

    fn is_negative(&self, label: &str) -> bool {
        self.markers.is_negative(label)
    }

    fn evaluate(&self, results: &[DetectionResult]) -> Verdict {
        let findings = self.markers.findings(results);
        let detectors: BTreeSet<&str> = findings.iter().map(|f| f.detector.as_str()).collect();
        Verdict {
            violation: detectors.len() >= self.min_detectors,
            findings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clean_results() -> Vec<DetectionResult> {
        vec![
            DetectionResult::from_labels("gloves", &["Gloves"]),
            DetectionResult::from_labels("glasses", &["Glasses"]),
            DetectionResult::from_labels("ppe", &["Hardhat", "Safety Vest"]),
        ]
    }

    #[test]
    fn clean_results_are_not_a_violation() {
        let verdict = NegativeMarkerPolicy::default().evaluate(&clean_results());
        assert!(!verdict.violation);
        assert!(verdict.findings.is_empty());
    }

    #[test]
    fn any_negative_label_flags_violation() {
        let mut results = clean_results();
        results[2] = DetectionResult::from_labels("ppe", &["NO-Hardhat", "Safety Vest"]);
        let verdict = NegativeMarkerPolicy::default().evaluate(&results);
        assert!(verdict.violation);
        assert_eq!(verdict.findings.len(), 1);
        assert_eq!(verdict.findings[0].tag(), "ppe:NO-Hardhat");
    }

    #[test]
    fn adding_a_negative_label_never_clears_a_violation() {
        let policy = NegativeMarkerPolicy::default();
        for index in 0..3 {
            let mut results = clean_results();
            results[index]
                .detections
                .extend(DetectionResult::from_labels("x", &["NO-Mask"]).detections);
            assert!(policy.evaluate(&results).violation, "detector {}", index);

            // Already flagged input stays flagged when more negatives arrive.
            results[(index + 1) % 3]
                .detections
                .extend(DetectionResult::from_labels("x", &["No-Gloves"]).detections);
            assert!(policy.evaluate(&results).violation);
        }
    }

    #[test]
    fn marker_match_is_a_case_insensitive_prefix() {
        let policy = NegativeMarkerPolicy::default();
        assert!(policy.is_negative("NO-Safety Vest"));
        // Wider than a case-sensitive "NO-" substring test: the mixed-case
        // gloves and glasses vocabularies are flagged too.
        assert!(policy.is_negative("No-Gloves"));
        assert!(policy.is_negative("no-glasses"));
        assert!(!policy.is_negative("Gloves"));
        // Narrower on the other side: a marker inside the label does not count.
        assert!(!policy.is_negative("Safety NO-Vest"));
        assert!(!policy.is_negative("NO"));
        assert!(!policy.is_negative(""));
        assert!(NegativeMarkerPolicy::new(" ").is_err());
    }

    #[test]
    fn quorum_requires_distinct_detectors() {
        let policy = QuorumPolicy::new(NegativeMarkerPolicy::default(), 2).unwrap();
        let one = vec![
            DetectionResult::from_labels("ppe", &["NO-Hardhat", "NO-Mask"]),
            DetectionResult::from_labels("gloves", &["Gloves"]),
        ];
        let verdict = policy.evaluate(&one);
        assert!(!verdict.violation);
        assert_eq!(verdict.findings.len(), 2);

        let two = vec![
            DetectionResult::from_labels("ppe", &["NO-Hardhat"]),
            DetectionResult::from_labels("gloves", &["No-Gloves"]),
        ];
        assert!(policy.evaluate(&two).violation);
        assert!(QuorumPolicy::new(NegativeMarkerPolicy::default(), 0).is_err());
    }
}
