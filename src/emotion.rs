// Emotion aggregation: per-face expression vectors into ranked snapshots

use crate::models::{Emotion, ExpressionVector};
use serde::{Deserialize, Serialize};

/// Label reported when a snapshot has no dominant emotion
pub const UNKNOWN_LABEL: &str = "Unknown";

/// One label's aggregated score, rounded to two decimals
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregatedEmotionEntry {
    pub label: Emotion,
    pub score: f32,
}

/// Ranked summary holding exactly one entry per label, sorted by descending
/// score with ties in enumeration order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(
    from = "Vec<AggregatedEmotionEntry>",
    into = "Vec<AggregatedEmotionEntry>"
)]
pub struct EmotionSnapshot {
    entries: Vec<AggregatedEmotionEntry>,
}

impl EmotionSnapshot {
    /// Normalizes arbitrary entries into a valid snapshot.
    ///
    /// Missing labels become 0, duplicates keep the last score, negative or NaN
    /// scores become 0.
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = AggregatedEmotionEntry>,
    {
        let mut scores = [0.0f32; Emotion::COUNT];
        for entry in entries {
            scores[entry.label.index()] = if entry.score.is_nan() {
                0.0
            } else {
                entry.score.max(0.0)
            };
        }
        Self::ranked(scores)
    }

    fn ranked(scores: [f32; Emotion::COUNT]) -> Self {
        let mut entries: Vec<AggregatedEmotionEntry> = Emotion::ALL
            .iter()
            .map(|&label| AggregatedEmotionEntry {
                label,
                score: scores[label.index()],
            })
            .collect();
        // stable: equal scores stay in enumeration order
        entries.sort_by(|a, b| b.score.total_cmp(&a.score));
        Self { entries }
    }

    pub fn entries(&self) -> &[AggregatedEmotionEntry] {
        &self.entries
    }

    /// Highest-ranked entry
    pub fn top(&self) -> AggregatedEmotionEntry {
        self.entries[0]
    }

    /// The top label, or `None` when every score is zero
    pub fn dominant(&self) -> Option<Emotion> {
        let top = self.top();
        (top.score > 0.0).then_some(top.label)
    }

    /// Display name of the dominant label, or "Unknown"
    pub fn dominant_label(&self) -> String {
        self.dominant()
            .map(|e| e.to_string())
            .unwrap_or_else(|| UNKNOWN_LABEL.to_string())
    }

    pub fn score(&self, label: Emotion) -> f32 {
        self.entries
            .iter()
            .find(|entry| entry.label == label)
            .map(|entry| entry.score)
            .unwrap_or(0.0)
    }

    /// Whether `label` contributed a nonzero score
    pub fn has_signal(&self, label: Emotion) -> bool {
        self.score(label) > 0.0
    }
}

impl From<Vec<AggregatedEmotionEntry>> for EmotionSnapshot {
    fn from(entries: Vec<AggregatedEmotionEntry>) -> Self {
        Self::from_entries(entries)
    }
}

impl From<EmotionSnapshot> for Vec<AggregatedEmotionEntry> {
    fn from(snapshot: EmotionSnapshot) -> Self {
        snapshot.entries
    }
}

impl std::fmt::Display for EmotionSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {:.2}", entry.label, entry.score)?;
        }
        Ok(())
    }
}

/// Unrounded per-label sums. Totals of concatenated inputs equal the
/// element-wise sum of the parts.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct EmotionTotals {
    sums: [f64; Emotion::COUNT],
}

impl EmotionTotals {
    pub fn from_vectors(vectors: &[ExpressionVector]) -> Self {
        let mut totals = Self::default();
        for vector in vectors {
            for (label, probability) in vector.iter() {
                totals.sums[label.index()] += f64::from(probability);
            }
        }
        totals
    }

    pub fn merge(&self, other: &EmotionTotals) -> Self {
        let mut merged = *self;
        for (sum, extra) in merged.sums.iter_mut().zip(other.sums.iter()) {
            *sum += extra;
        }
        merged
    }

    pub fn get(&self, label: Emotion) -> f64 {
        self.sums[label.index()]
    }

    /// Rounds every sum to two decimals and ranks the result
    pub fn to_snapshot(&self) -> EmotionSnapshot {
        let mut scores = [0.0f32; Emotion::COUNT];
        for label in Emotion::ALL {
            scores[label.index()] = round2(self.sums[label.index()]);
        }
        EmotionSnapshot::ranked(scores)
    }
}

/// Sums every vector per label, rounds to two decimals and ranks descending
pub fn aggregate(vectors: &[ExpressionVector]) -> EmotionSnapshot {
    EmotionTotals::from_vectors(vectors).to_snapshot()
}

/// One snapshot per face, for the live analysis panel
pub fn per_face(vectors: &[ExpressionVector]) -> Vec<EmotionSnapshot> {
    vectors
        .iter()
        .map(|vector| aggregate(std::slice::from_ref(vector)))
        .collect()
}

fn round2(value: f64) -> f32 {
    ((value * 100.0).round() / 100.0) as f32
}
