//! Fixed-bin histograms, one per entity.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum ShapeError {
    #[error("histogram needs at least one bin")]
    NoBins,
    #[error("histogram range {start}..{end} is empty")]
    EmptyRange { start: f64, end: f64 },
}

/// Bin layout shared by every histogram in a collection.
///
/// Always has at least one bin over a non-empty range, including when
/// deserialized.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ShapeFields")]
pub struct HistogramShape {
    bins: usize,
    start: f64,
    end: f64,
}

#[derive(Deserialize)]
struct ShapeFields {
    bins: usize,
    start: f64,
    end: f64,
}

impl TryFrom<ShapeFields> for HistogramShape {
    type Error = ShapeError;

    fn try_from(f: ShapeFields) -> Result<Self, Self::Error> {
        Self::new(f.bins, f.start, f.end)
    }
}

impl Default for HistogramShape {
    fn default() -> Self {
        Self {
            bins: 36,
            start: -8.0,
            end: 7.5,
        }
    }
}

impl HistogramShape {
    pub fn new(bins: usize, start: f64, end: f64) -> Result<Self, ShapeError> {
        if bins == 0 {
            return Err(ShapeError::NoBins);
        }
        if start.is_nan() || end.is_nan() || end <= start {
            return Err(ShapeError::EmptyRange { start, end });
        }
        Ok(Self { bins, start, end })
    }

    pub fn bins(&self) -> usize {
        self.bins
    }

    pub fn start(&self) -> f64 {
        self.start
    }

    pub fn end(&self) -> f64 {
        self.end
    }

    /// Bin for `value`; out-of-range values land in the first or last bin.
    pub fn bin_of(&self, value: f64) -> usize {
        let scaled = (value - self.start) / (self.end - self.start) * self.bins as f64;
        if scaled.is_nan() || scaled < 0.0 {
            0
        } else {
            (scaled as usize).min(self.bins - 1)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    shape: HistogramShape,
    counts: Vec<u64>,
    total: u64,
    sum: f64,
}

impl Histogram {
    pub fn new(shape: HistogramShape) -> Self {
        Self {
            shape,
            counts: vec![0; shape.bins],
            total: 0,
            sum: 0.0,
        }
    }

    pub fn update(&mut self, value: f64) {
        self.counts[self.shape.bin_of(value)] += 1;
        self.total += 1;
        self.sum += value;
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn mean(&self) -> Option<f64> {
        (self.total > 0).then(|| self.sum / self.total as f64)
    }

    pub fn shape(&self) -> HistogramShape {
        self.shape
    }
}

/// Histograms keyed by entity id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramCollection {
    histograms: BTreeMap<i32, Histogram>,
}

impl HistogramCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collection with an empty histogram for each of `entities`.
    pub fn for_entities(entities: impl IntoIterator<Item = i32>, shape: HistogramShape) -> Self {
        let histograms = entities
            .into_iter()
            .map(|id| (id, Histogram::new(shape)))
            .collect();
        Self { histograms }
    }

    /// Record `value` for `entity`. Returns false for an unknown entity.
    pub fn update(&mut self, entity: i32, value: f64) -> bool {
        match self.histograms.get_mut(&entity) {
            Some(h) => {
                h.update(value);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, entity: i32) -> Option<&Histogram> {
        self.histograms.get(&entity)
    }

    pub fn len(&self) -> usize {
        self.histograms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histograms.is_empty()
    }

    /// Samples recorded across all entities.
    pub fn total(&self) -> u64 {
        self.histograms.values().map(Histogram::total).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (i32, &Histogram)> {
        self.histograms.iter().map(|(id, h)| (*id, h))
    }
}

impl fmt::Display for HistogramCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:>6} {:>8} | bins", "entity", "total")?;
        for (id, h) in self.iter() {
            write!(f, "{id:>6} {:>8} |", h.total())?;
            for count in h.counts() {
                write!(f, " {count}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bins_clamp_at_edges() {
        let shape = HistogramShape::new(4, 0.0, 4.0).unwrap();
        assert_eq!(shape.bin_of(-10.0), 0);
        assert_eq!(shape.bin_of(0.0), 0);
        assert_eq!(shape.bin_of(1.0), 1);
        assert_eq!(shape.bin_of(3.99), 3);
        assert_eq!(shape.bin_of(4.0), 3);
        assert_eq!(shape.bin_of(100.0), 3);
        assert_eq!(shape.bin_of(f64::NAN), 0);
    }

    #[test]
    fn default_shape_matches_ecg_range() {
        let shape = HistogramShape::default();
        assert_eq!(shape.bins(), 36);
        assert_eq!(shape.bin_of(-8.0), 0);
        assert_eq!(shape.bin_of(7.49), 35);
    }

    #[test]
    fn degenerate_shapes_are_rejected() {
        assert_eq!(HistogramShape::new(0, 0.0, 1.0), Err(ShapeError::NoBins));
        assert!(matches!(
            HistogramShape::new(2, 1.0, 1.0),
            Err(ShapeError::EmptyRange { .. })
        ));
        assert!(HistogramShape::new(2, f64::NAN, 1.0).is_err());

        let err = serde_json::from_str::<HistogramShape>(r#"{"bins":0,"start":0.0,"end":1.0}"#)
            .unwrap_err();
        assert!(err.to_string().contains("at least one bin"), "{err}");
        let shape: HistogramShape =
            serde_json::from_str(r#"{"bins":3,"start":0.0,"end":3.0}"#).unwrap();
        assert_eq!(shape.bin_of(2.5), 2);
    }

    #[test]
    fn unknown_entity_is_reported() {
        let mut c = HistogramCollection::for_entities([1, 2], HistogramShape::default());
        assert!(c.update(1, 0.5));
        assert!(!c.update(3, 0.5));
        assert_eq!(c.total(), 1);
        assert_eq!(c.get(1).unwrap().mean(), Some(0.5));
        assert_eq!(c.get(2).unwrap().mean(), None);
    }

    #[test]
    fn renders_one_row_per_entity() {
        let mut c = HistogramCollection::for_entities([1, 2], HistogramShape::new(4, 0.0, 4.0).unwrap());
        c.update(1, 1.0);
        c.update(1, 1.1);
        c.update(2, 2.0);
        c.update(2, 3.5);
        insta::assert_snapshot!(c.to_string(), @r"
        entity    total | bins
             1        2 | 0 2 0 0
             2        2 | 0 0 1 1
        ");
    }
}
