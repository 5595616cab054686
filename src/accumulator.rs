//! Per-electrode sample accumulation and impedance computation.
//!
//! Every measurement frame contributes narrow and wide pulse samples to a
//! *live* buffer per electrode.  When a live buffer holds `repetition_count`
//! samples it is moved into the *completed* map for that electrode and the
//! live buffer starts over.  Narrow and wide buffers are flushed
//! independently.
//!
//! The session finishes the moment the completed narrow map holds all 32
//! electrodes.  The wide map is never checked for completeness; in
//! well-formed traffic narrow and wide samples arrive in the same frames.

use std::collections::{BTreeMap, HashMap};

use log::{debug, info};

use crate::parse::{MeasurementFrame, SamplePair};
use crate::protocol::{DEFAULT_REPETITION_COUNT, ELECTRODE_COUNT, IMPEDANCE_OFFSET};
use crate::types::{ElectrodeId, MeasurementResults};

/// Completed sample sequences, exactly `repetition_count` long each.
type CompletedMap = BTreeMap<ElectrodeId, Vec<u16>>;

/// Accumulates one measurement session.
#[derive(Debug, Clone)]
pub struct MeasurementAccumulator {
    repetition_count: usize,
    offset: f64,
    live_narrow: HashMap<ElectrodeId, Vec<u16>>,
    live_wide: HashMap<ElectrodeId, Vec<u16>>,
    completed_narrow: CompletedMap,
    completed_wide: CompletedMap,
    results: MeasurementResults,
    finished: bool,
}

impl Default for MeasurementAccumulator {
    fn default() -> Self {
        Self::new(DEFAULT_REPETITION_COUNT as usize, IMPEDANCE_OFFSET)
    }
}

impl MeasurementAccumulator {
    /// Create an empty accumulator.  A `repetition_count` of zero is treated as one.
    pub fn new(repetition_count: usize, offset: f64) -> Self {
        Self {
            repetition_count: repetition_count.max(1),
            offset,
            live_narrow: HashMap::new(),
            live_wide: HashMap::new(),
            completed_narrow: BTreeMap::new(),
            completed_wide: BTreeMap::new(),
            results: BTreeMap::new(),
            finished: false,
        }
    }

    /// Start a new measurement session: drop all buffers and results.
    pub fn reset(&mut self, repetition_count: usize) {
        self.repetition_count = repetition_count.max(1);
        self.clear();
    }

    /// Drop all buffers and results, keeping the repetition count.
    pub fn clear(&mut self) {
        self.live_narrow.clear();
        self.live_wide.clear();
        self.completed_narrow.clear();
        self.completed_wide.clear();
        self.results.clear();
        self.finished = false;
    }

    pub fn repetition_count(&self) -> usize {
        self.repetition_count
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// `true` when no sample is buffered and no result is held.
    pub fn is_empty(&self) -> bool {
        self.live_narrow.is_empty()
            && self.live_wide.is_empty()
            && self.completed_narrow.is_empty()
            && self.completed_wide.is_empty()
            && self.results.is_empty()
    }

    /// Results of the last finished session (empty until finished).
    pub fn results(&self) -> &MeasurementResults {
        &self.results
    }

    /// Number of electrodes with a completed narrow sequence.
    pub fn completed_narrow_count(&self) -> usize {
        self.completed_narrow.len()
    }

    /// Number of electrodes with a completed wide sequence.
    pub fn completed_wide_count(&self) -> usize {
        self.completed_wide.len()
    }

    /// Feed one decoded measurement frame.
    ///
    /// Returns the result map when this frame finishes the session.  Frames
    /// received after the session finished are ignored.
    pub fn push_frame(&mut self, frame: &MeasurementFrame) -> Option<MeasurementResults> {
        for pair in &frame.pairs {
            if self.finished {
                debug!("accumulator: session finished, dropping sample for {}", frame.electrode);
                return None;
            }
            self.push_pair(frame.electrode, *pair);
            if self.completed_narrow.len() == ELECTRODE_COUNT {
                return Some(self.finalize());
            }
        }
        None
    }

    fn push_pair(&mut self, electrode: ElectrodeId, pair: SamplePair) {
        let rep = self.repetition_count;
        push_sample(&mut self.live_narrow, &mut self.completed_narrow, electrode, pair.narrow, rep);
        push_sample(&mut self.live_wide, &mut self.completed_wide, electrode, pair.wide, rep);
    }

    fn finalize(&mut self) -> MeasurementResults {
        self.results = compute_impedances(&self.completed_narrow, &self.completed_wide, self.offset);
        self.completed_narrow.clear();
        self.completed_wide.clear();
        self.finished = true;
        info!(
            "accumulator: measurement finished, {} electrode result(s)",
            self.results.len()
        );
        self.results.clone()
    }
}

/// Append `sample` to the live buffer and flush it into `completed` once full.
fn push_sample(
    live: &mut HashMap<ElectrodeId, Vec<u16>>,
    completed: &mut CompletedMap,
    electrode: ElectrodeId,
    sample: u16,
    repetition_count: usize,
) {
    let buffer = live.entry(electrode).or_default();
    buffer.push(sample);
    if buffer.len() >= repetition_count {
        completed.insert(electrode, std::mem::take(buffer));
    }
}

/// Mean of `samples` minus `offset`, or `None` if `samples` is empty.
fn offset_mean(samples: &[u16], offset: f64) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let sum: f64 = samples.iter().map(|&s| s as f64).sum();
    Some(sum / samples.len() as f64 - offset)
}

/// Compute the final impedance per electrode.
///
/// For every electrode in `narrow`, the first sample of the narrow sequence
/// and of the matching wide sequence (if any) is dropped as a settling
/// transient.  The impedance is `(narrow_avg + wide_avg) / 2` where each
/// average is the mean of the remaining samples minus `offset`.  Electrodes
/// whose remaining narrow or wide sequence is empty produce no result.
pub fn compute_impedances(
    narrow: &BTreeMap<ElectrodeId, Vec<u16>>,
    wide: &BTreeMap<ElectrodeId, Vec<u16>>,
    offset: f64,
) -> MeasurementResults {
    narrow
        .iter()
        .filter_map(|(&electrode, narrow_samples)| {
            let narrow_rest = narrow_samples.get(1..).unwrap_or_default();
            let wide_rest = wide
                .get(&electrode)
                .and_then(|w| w.get(1..))
                .unwrap_or_default();
            let narrow_avg = offset_mean(narrow_rest, offset)?;
            let wide_avg = offset_mean(wide_rest, offset)?;
            Some((electrode, (narrow_avg + wide_avg) / 2.0))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn electrode(n: u8) -> ElectrodeId {
        ElectrodeId::new(n).unwrap()
    }

    fn frame(n: u8, pairs: &[(u16, u16)]) -> MeasurementFrame {
        MeasurementFrame {
            electrode: electrode(n),
            pairs: pairs
                .iter()
                .map(|&(narrow, wide)| SamplePair { narrow, wide })
                .collect(),
        }
    }

    /// Feed `rep` pairs for every electrode in `electrodes`, one pair per frame.
    fn fill(acc: &mut MeasurementAccumulator, electrodes: impl Iterator<Item = u8>, rep: u16) -> Vec<MeasurementResults> {
        let mut finished = Vec::new();
        for n in electrodes {
            for i in 0..rep {
                if let Some(results) = acc.push_frame(&frame(n, &[(100 + i, 200 + i)])) {
                    finished.push(results);
                }
            }
        }
        finished
    }

    #[test]
    fn test_drop_first_sample_average() {
        let mut narrow = BTreeMap::new();
        let mut wide = BTreeMap::new();
        narrow.insert(electrode(3), vec![10, 20, 30, 40]);
        wide.insert(electrode(3), vec![12, 22, 32, 42]);

        let offset = IMPEDANCE_OFFSET;
        let results = compute_impedances(&narrow, &wide, offset);

        let narrow_avg = (20.0 + 30.0 + 40.0) / 3.0 - offset;
        let wide_avg = (22.0 + 32.0 + 42.0) / 3.0 - offset;
        assert_eq!(results.len(), 1);
        assert_eq!(results[&electrode(3)], (narrow_avg + wide_avg) / 2.0);
    }

    #[test]
    fn test_electrode_without_wide_is_skipped() {
        let mut narrow = BTreeMap::new();
        narrow.insert(electrode(1), vec![10, 20]);
        narrow.insert(electrode(2), vec![10]);
        let mut wide = BTreeMap::new();
        wide.insert(electrode(2), vec![10, 20]);

        let results = compute_impedances(&narrow, &wide, 0.0);
        assert!(results.is_empty());
    }

    #[test]
    fn test_buffers_flush_at_repetition_count() {
        let mut acc = MeasurementAccumulator::new(4, 0.0);
        acc.push_frame(&frame(1, &[(10, 12), (20, 22), (30, 32)]));
        assert_eq!(acc.completed_narrow_count(), 0);

        acc.push_frame(&frame(1, &[(40, 42), (50, 52)]));
        assert_eq!(acc.completed_narrow_count(), 1);
        assert_eq!(acc.completed_wide_count(), 1);
        assert_eq!(acc.completed_narrow[&electrode(1)], vec![10, 20, 30, 40]);
        // The fifth sample starts a fresh live buffer.
        assert_eq!(acc.live_narrow[&electrode(1)], vec![50]);
    }

    #[test]
    fn test_overwrites_previous_completed_entry() {
        let mut acc = MeasurementAccumulator::new(2, 0.0);
        acc.push_frame(&frame(9, &[(1, 1), (2, 2), (3, 3), (4, 4)]));
        assert_eq!(acc.completed_narrow_count(), 1);
        assert_eq!(acc.completed_narrow[&electrode(9)], vec![3, 4]);
    }

    #[test]
    fn test_finishes_exactly_once_at_32_electrodes() {
        let mut acc = MeasurementAccumulator::new(3, 0.0);
        let finished = fill(&mut acc, 1..=31, 3);
        assert!(finished.is_empty());
        assert!(!acc.is_finished());

        let finished = fill(&mut acc, 32..=32, 3);
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].len(), 32);
        assert!(acc.is_finished());
        assert_eq!(acc.completed_narrow_count(), 0);
        assert_eq!(acc.completed_wide_count(), 0);

        // Further traffic cannot finish the session again.
        let finished = fill(&mut acc, 1..=32, 3);
        assert!(finished.is_empty());
        assert_eq!(acc.results().len(), 32);
    }

    #[test]
    fn test_reset_starts_empty() {
        let mut acc = MeasurementAccumulator::new(3, 0.0);
        fill(&mut acc, 1..=5, 2);
        assert!(!acc.is_empty());
        acc.reset(5);
        assert!(acc.is_empty());
        assert_eq!(acc.repetition_count(), 5);
        assert!(!acc.is_finished());
    }
}
