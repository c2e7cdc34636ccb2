use std::collections::{HashMap, HashSet};

use qc_proto::{
    ChecklistItemResult, ChecklistResult, DetectedObject, ExpectedItem, VisionDetectedObject,
};

/// Canonical form used for every label comparison.
pub fn normalize_label(label: &str) -> String {
    label.trim().to_lowercase()
}

/// Anything carrying a label and a confidence.
pub trait Scored {
    fn label(&self) -> &str;
    fn confidence(&self) -> f64;
}

impl Scored for DetectedObject {
    fn label(&self) -> &str {
        &self.label
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }
}

impl Scored for VisionDetectedObject {
    fn label(&self) -> &str {
        &self.label
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }
}

/// Best confidence per normalized label.
pub fn best_confidences<D: Scored>(detections: &[D]) -> HashMap<String, f64> {
    let mut best: HashMap<String, f64> = HashMap::new();
    for d in detections {
        let conf = d.confidence();
        if conf.is_nan() {
            continue;
        }
        best.entry(normalize_label(d.label()))
            .and_modify(|c| *c = c.max(conf))
            .or_insert(conf);
    }
    best
}

fn reconcile<D: Scored>(
    expected: &[ExpectedItem],
    detections: &[D],
    threshold: f64,
    per_item_threshold: bool,
) -> ChecklistResult {
    let best = best_confidences(detections);
    let mut result = ChecklistResult {
        pass: true,
        ..Default::default()
    };

    for item in expected {
        let confidence = best.get(&normalize_label(&item.label)).copied();
        let effective = match item.min_confidence {
            Some(min) if per_item_threshold => min,
            _ => threshold,
        };
        let found = confidence.map(|c| c >= effective).unwrap_or(false);

        if found {
            result.found.push(item.label.clone());
        } else {
            result.missing.push(item.label.clone());
            if item.required {
                result.pass = false;
            }
        }
        result.items.push(ChecklistItemResult {
            label: item.label.clone(),
            required: item.required,
            found,
            confidence,
        });
    }
    result
}

/// Legacy check: pixel-box detections, call-level threshold only.
pub fn check_legacy(
    expected: &[ExpectedItem],
    detections: &[DetectedObject],
    threshold: f64,
) -> ChecklistResult {
    reconcile(expected, detections, threshold, false)
}

/// Vision check: an item's `min_confidence`, when set, replaces `threshold`.
pub fn check_vision(
    expected: &[ExpectedItem],
    detections: &[VisionDetectedObject],
    threshold: f64,
) -> ChecklistResult {
    reconcile(expected, detections, threshold, true)
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct LabelComparison {
    pub found: Vec<String>,
    pub missing: Vec<String>,
}

/// Presence-only comparison; no confidences involved.
pub fn compare_labels<E: AsRef<str>, D: AsRef<str>>(
    expected: &[E],
    detected: &[D],
) -> LabelComparison {
    let seen: HashSet<String> = detected.iter().map(|d| normalize_label(d.as_ref())).collect();
    let mut out = LabelComparison::default();
    for label in expected {
        let label = label.as_ref();
        if seen.contains(&normalize_label(label)) {
            out.found.push(label.to_string());
        } else {
            out.missing.push(label.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use qc_proto::BoundingBox;

    fn item(label: &str, required: bool) -> ExpectedItem {
        ExpectedItem {
            label: label.into(),
            required,
            min_confidence: None,
        }
    }

    fn vis(label: &str, confidence: f64) -> VisionDetectedObject {
        VisionDetectedObject {
            label: label.into(),
            confidence,
            bbox: BoundingBox {
                x: 0.0,
                y: 0.0,
                width: 0.1,
                height: 0.1,
            },
        }
    }

    fn legacy(label: &str, confidence: f64) -> DetectedObject {
        DetectedObject {
            label: label.into(),
            confidence,
            bbox: [0, 0, 10, 10],
        }
    }

    fn assert_partition(expected: &[ExpectedItem], r: &ChecklistResult) {
        assert_eq!(r.found.len() + r.missing.len(), expected.len());
        assert_eq!(r.items.len(), expected.len());
        for (it, res) in expected.iter().zip(&r.items) {
            assert_eq!(it.label, res.label);
            let in_found = r.found.contains(&it.label);
            let in_missing = r.missing.contains(&it.label);
            assert!(in_found != in_missing, "{} must be in exactly one list", it.label);
            assert_eq!(res.found, in_found);
        }
    }

    #[test]
    fn required_missing_fails() {
        let expected = vec![item("lettuce", true)];
        let r = check_vision(&expected, &[], 0.5);
        assert!(!r.pass);
        assert_eq!(r.missing, vec!["lettuce"]);
        assert_eq!(r.items[0].confidence, None);
    }

    #[test]
    fn optional_missing_passes() {
        let expected = vec![item("lettuce", false)];
        let r = check_vision(&expected, &[], 0.5);
        assert!(r.pass);
        assert_eq!(r.missing, vec!["lettuce"]);
    }

    #[test]
    fn empty_expectations_pass_trivially() {
        let r = check_legacy(&[], &[legacy("bun", 0.9)], 0.5);
        assert!(r.pass);
        assert!(r.items.is_empty() && r.found.is_empty() && r.missing.is_empty());
    }

    #[test]
    fn labels_match_case_and_whitespace_insensitively() {
        let expected = vec![item("  Tomato ", true), item("BUN", true)];
        let r = check_vision(&expected, &[vis("tomato", 0.8), vis(" bun\t", 0.7)], 0.5);
        assert!(r.pass);
        assert_eq!(r.found, vec!["  Tomato ", "BUN"]);
        assert_partition(&expected, &r);
    }

    #[test]
    fn threshold_is_inclusive_and_best_confidence_wins() {
        let expected = vec![item("patty", true)];
        let dets = [vis("patty", 0.3), vis("Patty", 0.5), vis("patty", 0.4)];
        let r = check_vision(&expected, &dets, 0.5);
        assert!(r.pass);
        assert_eq!(r.items[0].confidence, Some(0.5));

        let r = check_vision(&expected, &[vis("patty", 0.49)], 0.5);
        assert!(!r.pass);
        assert_eq!(r.items[0].confidence, Some(0.49));
        assert!(!r.items[0].found);
    }

    #[test]
    fn per_item_threshold_only_applies_to_vision() {
        let expected = vec![ExpectedItem {
            label: "sauce".into(),
            required: true,
            min_confidence: Some(0.9),
        }];

        let v = check_vision(&expected, &[vis("sauce", 0.8)], 0.5);
        assert!(!v.pass);

        let l = check_legacy(&expected, &[legacy("sauce", 0.8)], 0.5);
        assert!(l.pass);

        let lenient = vec![ExpectedItem {
            label: "sauce".into(),
            required: true,
            min_confidence: Some(0.2),
        }];
        assert!(check_vision(&lenient, &[vis("sauce", 0.25)], 0.5).pass);
        assert!(!check_legacy(&lenient, &[legacy("sauce", 0.25)], 0.5).pass);
    }

    #[test]
    fn mixed_required_and_optional() {
        let expected = vec![
            item("bun", true),
            item("pickle", false),
            item("cheese", true),
            item("onion", false),
        ];
        let dets = [vis("bun", 0.9), vis("onion", 0.95), vis("ketchup", 0.99)];
        let r = check_vision(&expected, &dets, 0.5);
        assert!(!r.pass);
        assert_eq!(r.found, vec!["bun", "onion"]);
        assert_eq!(r.missing, vec!["pickle", "cheese"]);
        assert_partition(&expected, &r);

        let r = check_vision(&expected, &[vis("bun", 0.9), vis("cheese", 0.6)], 0.5);
        assert!(r.pass);
        assert_partition(&expected, &r);
    }

    #[test]
    fn exhaustive_small_grid_matches_definition() {
        let labels = ["a", "b", "c"];
        let confs = [0.0, 0.49, 0.5, 0.51, 1.0];
        for mask in 0u32..8 {
            let expected: Vec<_> = labels
                .iter()
                .enumerate()
                .map(|(i, l)| item(l, mask & (1 << i) != 0))
                .collect();
            for (i, c) in confs.iter().enumerate() {
                let dets = vec![vis(labels[i % 3], *c), vis("z", 0.9)];
                let r = check_vision(&expected, &dets, 0.5);
                for res in &r.items {
                    let should = dets.iter().any(|d| d.label == res.label && d.confidence >= 0.5);
                    assert_eq!(res.found, should);
                }
                let expect_pass = expected
                    .iter()
                    .all(|e| !e.required || r.found.contains(&e.label));
                assert_eq!(r.pass, expect_pass);
                assert_partition(&expected, &r);
            }
        }
    }

    #[test]
    fn compare_labels_ignores_confidence() {
        let cmp = compare_labels(&["Bun", "Patty", "lettuce"], &["bun ", "LETTUCE", "mayo"]);
        assert_eq!(cmp.found, vec!["Bun", "lettuce"]);
        assert_eq!(cmp.missing, vec!["Patty"]);

        let none: [&str; 0] = [];
        let cmp = compare_labels(&["x"], &none);
        assert_eq!(cmp.missing, vec!["x"]);
    }
}
