use qc_proto::{ExpectedItem, VisionDetectedObject};

use crate::checklist::normalize_label;

/// Tie-break when a raw label contains, or is contained in, more than one expected label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LabelMatch {
    /// First candidate in expected-label order.
    #[default]
    First,
    /// Longest candidate; order decides between equal lengths.
    Longest,
}

/// Resolve `raw` against `expected`: exact normalized match, then substring
/// containment in either direction, else `raw` unchanged.
pub fn map_label<S: AsRef<str>>(raw: &str, expected: &[S], strategy: LabelMatch) -> String {
    let needle = normalize_label(raw);
    if needle.is_empty() {
        return raw.to_string();
    }

    let normalized: Vec<(String, &str)> = expected
        .iter()
        .map(|e| (normalize_label(e.as_ref()), e.as_ref()))
        .filter(|(n, _)| !n.is_empty())
        .collect();

    if let Some((_, label)) = normalized.iter().find(|(n, _)| *n == needle) {
        return label.to_string();
    }

    let mut candidates = normalized
        .iter()
        .filter(|(n, _)| needle.contains(n.as_str()) || n.contains(needle.as_str()));

    let chosen = match strategy {
        LabelMatch::First => candidates.next(),
        LabelMatch::Longest => candidates.fold(None, |best: Option<&(String, &str)>, c| match best {
            Some(b) if b.0.len() >= c.0.len() => Some(b),
            _ => Some(c),
        }),
    };
    chosen.map(|(_, label)| label.to_string()).unwrap_or_else(|| raw.to_string())
}

/// Relabel detections onto the station's expected labels.
pub fn map_detections(
    objects: Vec<VisionDetectedObject>,
    expected: &[ExpectedItem],
    strategy: LabelMatch,
) -> Vec<VisionDetectedObject> {
    let labels: Vec<&str> = expected.iter().map(|e| e.label.as_str()).collect();
    objects
        .into_iter()
        .map(|mut o| {
            o.label = map_label(&o.label, &labels, strategy);
            o
        })
        .collect()
}
