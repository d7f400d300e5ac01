//! Named accumulators filled by the analyses.
//!
//! Four shapes cover everything an analysis records:
//!
//! - [`CategoryBucket`]: label to weight, e.g. steps per module.
//! - [`Histogram1D`] / [`Histogram2D`]: uniform numeric bins with
//!   under/overflow, e.g. energy spectra and occupancy maps.
//! - [`CoOccurrenceBucket`]: label pair to weight, e.g. module vs particle.
//! - [`CategoryHistogram`]: one numeric histogram per label, e.g. terminal
//!   energy per module.
//!
//! Buckets accumulate across all events of a run. At finalize time the
//! categorical ones are compressed (zero-weight labels removed) and the
//! whole collection is packaged as a [`BucketSet`] for the output sink.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Axes
// ---------------------------------------------------------------------------

/// Where a value falls on a [`UniformAxis`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisSlot {
    /// Below the lower edge, or not a number.
    Underflow,
    /// Inside the axis, in the given bin.
    Bin(usize),
    /// At or above the upper edge.
    Overflow,
}

/// Equal-width bins over `[low, high)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UniformAxis {
    /// Number of bins.
    pub bins: usize,
    /// Lower edge, inclusive.
    pub low: f64,
    /// Upper edge, exclusive.
    pub high: f64,
}

impl UniformAxis {
    /// Create an axis. At least one bin is always present.
    pub const fn new(bins: usize, low: f64, high: f64) -> Self {
        Self {
            bins: if bins == 0 { 1 } else { bins },
            low,
            high,
        }
    }

    /// Width of one bin.
    #[allow(clippy::cast_precision_loss)]
    pub fn width(&self) -> f64 {
        (self.high - self.low) / self.bins as f64
    }

    /// Locate a value on the axis.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn locate(&self, value: f64) -> AxisSlot {
        if value.is_nan() || value < self.low {
            return AxisSlot::Underflow;
        }
        if value >= self.high {
            return AxisSlot::Overflow;
        }
        let offset = ((value - self.low) / self.width()).floor();
        // Rounding at the upper edge can land exactly on `bins`.
        let bin = (offset as usize).min(self.bins.saturating_sub(1));
        AxisSlot::Bin(bin)
    }

    /// Lower edge of a bin.
    #[allow(clippy::cast_precision_loss)]
    pub fn bin_low_edge(&self, bin: usize) -> f64 {
        self.width().mul_add(bin as f64, self.low)
    }
}

// ---------------------------------------------------------------------------
// Categorical
// ---------------------------------------------------------------------------

/// Label to weight accumulator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryBucket {
    entries: BTreeMap<String, f64>,
    fills: u64,
}

impl CategoryBucket {
    /// Create an empty bucket.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `weight` to `label`. A zero weight still creates the label.
    pub fn fill(&mut self, label: &str, weight: f64) {
        self.fills = self.fills.saturating_add(1);
        if let Some(value) = self.entries.get_mut(label) {
            *value += weight;
        } else {
            self.entries.insert(label.to_owned(), weight);
        }
    }

    /// Weight accumulated for `label`, zero if never filled.
    pub fn get(&self, label: &str) -> f64 {
        self.entries.get(label).copied().unwrap_or(0.0)
    }

    /// Whether `label` has an entry (possibly of zero weight).
    pub fn contains(&self, label: &str) -> bool {
        self.entries.contains_key(label)
    }

    /// Sum of all weights.
    pub fn total(&self) -> f64 {
        self.entries.values().sum()
    }

    /// Number of fill calls.
    pub const fn fills(&self) -> u64 {
        self.fills
    }

    /// Number of labels.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no labels.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over `(label, weight)` in label order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.entries.iter().map(|(label, value)| (label.as_str(), *value))
    }

    /// Drop labels whose accumulated weight is zero.
    pub fn compress(&mut self) {
        self.entries.retain(|_, value| *value != 0.0);
    }

    /// The `n` heaviest labels, heaviest first; ties ordered by label.
    pub fn top(&self, n: usize) -> RankedBucket {
        let mut entries: Vec<(String, f64)> = self
            .entries
            .iter()
            .filter(|(_, value)| **value != 0.0)
            .map(|(label, value)| (label.clone(), *value))
            .collect();
        entries.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        entries.truncate(n);
        RankedBucket { entries }
    }
}

/// Labels ranked by weight, heaviest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RankedBucket {
    entries: Vec<(String, f64)>,
}

impl RankedBucket {
    /// Ranked entries.
    pub fn entries(&self) -> &[(String, f64)] {
        &self.entries
    }

    /// Labels in rank order.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(label, _)| label.as_str())
    }
}

// ---------------------------------------------------------------------------
// Numeric
// ---------------------------------------------------------------------------

/// One-dimensional histogram with uniform bins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram1D {
    axis: UniformAxis,
    counts: Vec<f64>,
    underflow: f64,
    overflow: f64,
    entries: u64,
}

impl Histogram1D {
    /// Create an empty histogram over `axis`.
    pub fn new(axis: UniformAxis) -> Self {
        Self {
            axis,
            counts: vec![0.0; axis.bins],
            underflow: 0.0,
            overflow: 0.0,
            entries: 0,
        }
    }

    /// Add one entry of weight 1.
    pub fn fill(&mut self, value: f64) {
        self.fill_weighted(value, 1.0);
    }

    /// Add one entry with the given weight.
    pub fn fill_weighted(&mut self, value: f64, weight: f64) {
        self.entries = self.entries.saturating_add(1);
        match self.axis.locate(value) {
            AxisSlot::Underflow => self.underflow += weight,
            AxisSlot::Overflow => self.overflow += weight,
            AxisSlot::Bin(bin) => {
                if let Some(count) = self.counts.get_mut(bin) {
                    *count += weight;
                }
            }
        }
    }

    /// The binning.
    pub const fn axis(&self) -> &UniformAxis {
        &self.axis
    }

    /// Content of one bin.
    pub fn bin(&self, bin: usize) -> f64 {
        self.counts.get(bin).copied().unwrap_or(0.0)
    }

    /// Content below the axis.
    pub const fn underflow(&self) -> f64 {
        self.underflow
    }

    /// Content above the axis.
    pub const fn overflow(&self) -> f64 {
        self.overflow
    }

    /// Number of fill calls.
    pub const fn entries(&self) -> u64 {
        self.entries
    }

    /// Sum of the in-range bins.
    pub fn integral(&self) -> f64 {
        self.counts.iter().sum()
    }
}

/// Two-dimensional histogram with uniform bins on both axes.
///
/// Entries outside either axis are summed into a single `outside` count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram2D {
    x: UniformAxis,
    y: UniformAxis,
    counts: Vec<f64>,
    outside: f64,
    entries: u64,
}

impl Histogram2D {
    /// Create an empty histogram.
    pub fn new(x: UniformAxis, y: UniformAxis) -> Self {
        Self {
            x,
            y,
            counts: vec![0.0; x.bins.saturating_mul(y.bins)],
            outside: 0.0,
            entries: 0,
        }
    }

    /// Add one entry of weight 1 at `(x, y)`.
    pub fn fill(&mut self, x: f64, y: f64) {
        self.entries = self.entries.saturating_add(1);
        match self.cell(x, y).and_then(|idx| self.counts.get_mut(idx)) {
            Some(count) => *count += 1.0,
            None => self.outside += 1.0,
        }
    }

    /// Content of the bin containing `(x, y)`, zero outside the axes.
    pub fn content_at(&self, x: f64, y: f64) -> f64 {
        self.cell(x, y)
            .and_then(|idx| self.counts.get(idx))
            .copied()
            .unwrap_or(0.0)
    }

    /// Content that fell outside the axes.
    pub const fn outside(&self) -> f64 {
        self.outside
    }

    /// Number of fill calls.
    pub const fn entries(&self) -> u64 {
        self.entries
    }

    /// Sum of the in-range bins.
    pub fn integral(&self) -> f64 {
        self.counts.iter().sum()
    }

    fn cell(&self, x: f64, y: f64) -> Option<usize> {
        match (self.x.locate(x), self.y.locate(y)) {
            (AxisSlot::Bin(bx), AxisSlot::Bin(by)) => {
                by.checked_mul(self.x.bins).and_then(|row| row.checked_add(bx))
            }
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Two-label buckets
// ---------------------------------------------------------------------------

/// `(x label, y label)` to weight accumulator with axis titles.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoOccurrenceBucket {
    x_title: String,
    y_title: String,
    cells: BTreeMap<String, BTreeMap<String, f64>>,
}

impl CoOccurrenceBucket {
    /// Create an empty bucket with axis titles.
    pub fn new(x_title: &str, y_title: &str) -> Self {
        Self {
            x_title: x_title.to_owned(),
            y_title: y_title.to_owned(),
            cells: BTreeMap::new(),
        }
    }

    /// Add `weight` to the `(x, y)` cell.
    pub fn fill(&mut self, x: &str, y: &str, weight: f64) {
        if !self.cells.contains_key(x) {
            self.cells.insert(x.to_owned(), BTreeMap::new());
        }
        let Some(row) = self.cells.get_mut(x) else {
            return;
        };
        if let Some(value) = row.get_mut(y) {
            *value += weight;
        } else {
            row.insert(y.to_owned(), weight);
        }
    }

    /// Weight of the `(x, y)` cell, zero if never filled.
    pub fn get(&self, x: &str, y: &str) -> f64 {
        self.cells
            .get(x)
            .and_then(|row| row.get(y))
            .copied()
            .unwrap_or(0.0)
    }

    /// Whether the `(x, y)` cell has an entry.
    pub fn contains(&self, x: &str, y: &str) -> bool {
        self.cells.get(x).is_some_and(|row| row.contains_key(y))
    }

    /// X axis title.
    pub fn x_title(&self) -> &str {
        &self.x_title
    }

    /// Y axis title.
    pub fn y_title(&self) -> &str {
        &self.y_title
    }

    /// Sum of all cells.
    pub fn total(&self) -> f64 {
        self.cells.values().flat_map(BTreeMap::values).sum()
    }

    /// Iterate over `(x, y, weight)`.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, f64)> {
        self.cells.iter().flat_map(|(x, row)| {
            row.iter()
                .map(move |(y, value)| (x.as_str(), y.as_str(), *value))
        })
    }

    /// Drop zero-weight cells and rows left empty.
    pub fn compress(&mut self) {
        for row in self.cells.values_mut() {
            row.retain(|_, value| *value != 0.0);
        }
        self.cells.retain(|_, row| !row.is_empty());
    }
}

/// One numeric histogram per label, all sharing an axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryHistogram {
    axis: UniformAxis,
    rows: BTreeMap<String, Histogram1D>,
}

impl CategoryHistogram {
    /// Create an empty bucket.
    pub const fn new(axis: UniformAxis) -> Self {
        Self {
            axis,
            rows: BTreeMap::new(),
        }
    }

    /// Add one entry at `value` under `label`.
    pub fn fill(&mut self, label: &str, value: f64) {
        if let Some(row) = self.rows.get_mut(label) {
            row.fill(value);
        } else {
            let mut row = Histogram1D::new(self.axis);
            row.fill(value);
            self.rows.insert(label.to_owned(), row);
        }
    }

    /// Histogram for `label`.
    pub fn row(&self, label: &str) -> Option<&Histogram1D> {
        self.rows.get(label)
    }

    /// Labels with at least one entry.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.rows.keys().map(String::as_str)
    }

    /// Drop labels that never received an entry.
    pub fn compress(&mut self) {
        self.rows.retain(|_, row| row.entries() > 0);
    }
}

// ---------------------------------------------------------------------------
// Bucket collections
// ---------------------------------------------------------------------------

/// Any bucket, tagged by shape for serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum Bucket {
    /// Label to weight.
    Category(CategoryBucket),
    /// Top-N labels.
    Ranked(RankedBucket),
    /// 1-D numeric histogram.
    Numeric(Histogram1D),
    /// 2-D numeric histogram.
    Grid(Histogram2D),
    /// Label pair to weight.
    CoOccurrence(CoOccurrenceBucket),
    /// Numeric histogram per label.
    CategoryNumeric(CategoryHistogram),
}

/// All buckets produced by one analysis, keyed by bucket name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BucketSet {
    /// Name of the analysis that produced the buckets.
    pub analysis: String,
    /// Number of events folded into the buckets.
    pub events: u64,
    /// Buckets by name.
    pub buckets: BTreeMap<String, Bucket>,
}

impl BucketSet {
    /// Create an empty set for an analysis.
    pub fn new(analysis: &str) -> Self {
        Self {
            analysis: analysis.to_owned(),
            events: 0,
            buckets: BTreeMap::new(),
        }
    }

    /// Add or replace a bucket.
    pub fn insert(&mut self, name: &str, bucket: Bucket) {
        self.buckets.insert(name.to_owned(), bucket);
    }

    /// Number of buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether the set holds no buckets.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Any bucket by name.
    pub fn get(&self, name: &str) -> Option<&Bucket> {
        self.buckets.get(name)
    }

    /// A categorical bucket by name.
    pub fn category(&self, name: &str) -> Option<&CategoryBucket> {
        match self.buckets.get(name) {
            Some(Bucket::Category(bucket)) => Some(bucket),
            _ => None,
        }
    }

    /// A ranked bucket by name.
    pub fn ranked(&self, name: &str) -> Option<&RankedBucket> {
        match self.buckets.get(name) {
            Some(Bucket::Ranked(bucket)) => Some(bucket),
            _ => None,
        }
    }

    /// A 1-D histogram by name.
    pub fn numeric(&self, name: &str) -> Option<&Histogram1D> {
        match self.buckets.get(name) {
            Some(Bucket::Numeric(bucket)) => Some(bucket),
            _ => None,
        }
    }

    /// A 2-D histogram by name.
    pub fn grid(&self, name: &str) -> Option<&Histogram2D> {
        match self.buckets.get(name) {
            Some(Bucket::Grid(bucket)) => Some(bucket),
            _ => None,
        }
    }

    /// A co-occurrence bucket by name.
    pub fn co_occurrence(&self, name: &str) -> Option<&CoOccurrenceBucket> {
        match self.buckets.get(name) {
            Some(Bucket::CoOccurrence(bucket)) => Some(bucket),
            _ => None,
        }
    }

    /// A per-label histogram bucket by name.
    pub fn category_numeric(&self, name: &str) -> Option<&CategoryHistogram> {
        match self.buckets.get(name) {
            Some(Bucket::CategoryNumeric(bucket)) => Some(bucket),
            _ => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn axis_locates_edges() {
        let axis = UniformAxis::new(30, -3000.0, 3000.0);
        assert_eq!(axis.locate(-3000.0), AxisSlot::Bin(0));
        assert_eq!(axis.locate(2999.9), AxisSlot::Bin(29));
        assert_eq!(axis.locate(3000.0), AxisSlot::Overflow);
        assert_eq!(axis.locate(-3000.1), AxisSlot::Underflow);
        assert_eq!(axis.locate(f64::NAN), AxisSlot::Underflow);
        assert_eq!(axis.locate(f64::NEG_INFINITY), AxisSlot::Underflow);
        assert_eq!(axis.bin_low_edge(1), -2800.0);
    }

    #[test]
    fn compress_drops_only_zero_labels() {
        let mut bucket = CategoryBucket::new();
        bucket.fill("ITS", 3.0);
        bucket.fill("TPC", 0.0);
        bucket.fill("TRD", 1.0);
        assert_eq!(bucket.len(), 3);
        bucket.compress();
        assert_eq!(bucket.len(), 2);
        assert!(!bucket.contains("TPC"));
        assert_eq!(bucket.get("ITS"), 3.0);
        assert_eq!(bucket.fills(), 3);
    }

    #[test]
    fn top_ranks_heaviest_first() {
        let mut bucket = CategoryBucket::new();
        for (label, weight) in [("a", 1.0), ("b", 5.0), ("c", 3.0), ("d", 3.0), ("e", 0.0)] {
            bucket.fill(label, weight);
        }
        let ranked = bucket.top(3);
        assert_eq!(ranked.labels().collect::<Vec<_>>(), vec!["b", "c", "d"]);
        assert_eq!(bucket.top(10).entries().len(), 4);
    }

    #[test]
    fn histogram_tracks_under_and_overflow() {
        let mut hist = Histogram1D::new(UniformAxis::new(400, -10.0, 4.0));
        hist.fill(0.0_f64.log10());
        hist.fill(0.5);
        hist.fill(9.0);
        assert_eq!(hist.underflow(), 1.0);
        assert_eq!(hist.overflow(), 1.0);
        assert_eq!(hist.integral(), 1.0);
        assert_eq!(hist.entries(), 3);
    }

    #[test]
    fn grid_fills_cells() {
        let mut grid = Histogram2D::new(
            UniformAxis::new(200, -3000.0, 3000.0),
            UniformAxis::new(200, 0.0, 3000.0),
        );
        grid.fill(10.0, 20.0);
        grid.fill(10.0, 20.0);
        grid.fill(10.0, -5.0);
        assert_eq!(grid.content_at(10.0, 20.0), 2.0);
        assert_eq!(grid.outside(), 1.0);
        assert_eq!(grid.integral(), 2.0);
    }

    #[test]
    fn co_occurrence_compress_removes_empty_rows() {
        let mut bucket = CoOccurrenceBucket::new("origins", "traversed before");
        bucket.fill("ITS", "TPC", 2.0);
        bucket.fill("TRD", "TOF", 0.0);
        bucket.compress();
        assert_eq!(bucket.get("ITS", "TPC"), 2.0);
        assert!(!bucket.contains("TRD", "TOF"));
        assert_eq!(bucket.iter().count(), 1);
        assert_eq!(bucket.x_title(), "origins");
    }

    #[test]
    fn bucket_set_typed_access() {
        let mut set = BucketSet::new("stats");
        let mut cat = CategoryBucket::new();
        cat.fill("x", 1.0);
        set.insert("cat", Bucket::Category(cat));
        assert!(set.category("cat").is_some());
        assert!(set.numeric("cat").is_none());

        let json = serde_json::to_string(&set).unwrap();
        let back: BucketSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, set);
    }
}
