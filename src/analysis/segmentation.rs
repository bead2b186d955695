//! Tracks HPCP peaks across frames and turns them into discrete note events.

use strum::{EnumCount, IntoEnumIterator};

use super::{
    hpcp::HarmonicProfile,
    peaks::{find_circular_peaks, Peak},
    pitch::PitchDetectorConfig,
    task::{CancellationToken, Progress},
};
use crate::pitch::{Pitch, PitchClass, PitchMap};

// -------------------------------------------------------------------------------------------------

/// Tracking state of a single pitch candidate.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Segment {
    active: bool,
    bin: f32,
    salience: f32,
    start_frame: usize,
    /// First frame in which no continuation was found, if any.
    idle_frame: Option<usize>,
}

/// A finished segment, before its confidence got normalized.
#[derive(Debug, Clone, Copy)]
struct Note {
    pitch_class: PitchClass,
    start_frame: usize,
    frame_count: usize,
    confidence: f32,
}

// -------------------------------------------------------------------------------------------------

/// Greedy multi-candidate pitch tracker over [`HarmonicProfile`] frames.
///
/// Up to `num_active_segments` segments follow the strongest HPCP peaks. A segment continues
/// with the nearest peak within `max_deviation_bins`, turns idle when no peak matches, and gets
/// finalized into a [`Pitch`] when it stayed idle for longer than `max_idle_frames`. Notes
/// shorter than `min_note_frames` are dropped.
#[derive(Debug, Clone)]
pub struct PitchSegmenter {
    num_bins: usize,
    num_segments: usize,
    peak_threshold: f32,
    max_deviation_bins: f32,
    max_idle_frames: usize,
    min_note_frames: usize,
    lookahead_frames: usize,
}

impl PitchSegmenter {
    /// Create a segmenter for HPCP frames which were computed at the given sample rate, converting
    /// the config's time limits into frames.
    pub fn new(config: &PitchDetectorConfig, sample_rate: u32) -> Self {
        let ms_to_frames =
            |ms: f32| (sample_rate as f32 * ms / 1000.0 / config.hop_size as f32) as usize;
        Self::with_frame_limits(
            config,
            ms_to_frames(config.max_idle_ms),
            ms_to_frames(config.min_note_ms),
            ms_to_frames(config.lookahead_ms),
        )
    }

    /// Create a segmenter with explicit frame based time limits.
    pub fn with_frame_limits(
        config: &PitchDetectorConfig,
        max_idle_frames: usize,
        min_note_frames: usize,
        lookahead_frames: usize,
    ) -> Self {
        Self {
            num_bins: config.num_hpcp_bins,
            num_segments: config.num_active_segments,
            peak_threshold: config.segment_peak_threshold,
            max_deviation_bins: config.max_deviation_bins,
            max_idle_frames,
            min_note_frames,
            lookahead_frames,
        }
    }

    /// Pitch class of a (fractional) HPCP bin.
    pub fn pitch_class(&self, bin: f32) -> PitchClass {
        let bins_per_class = (self.num_bins / PitchClass::COUNT).max(1) as f32;
        PitchClass::from_index((bin / bins_per_class).round().max(0.0) as usize)
    }

    /// Distance of two HPCP bins along the pitch class circle.
    fn bin_distance(&self, a: f32, b: f32) -> f32 {
        let num_bins = self.num_bins as f32;
        let distance = (a - b).abs() % num_bins;
        distance.min(num_bins - distance)
    }

    /// Run the tracker over the whole profile. Returns `None` when cancelled.
    ///
    /// Confidences of the resulting pitches are normalized by the most confident pitch, and each
    /// pitch class group is sorted by descending confidence.
    pub fn segment(
        &self,
        profile: &HarmonicProfile,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> Option<PitchMap> {
        let frame_count = profile.len();

        let mut frame_peaks = Vec::with_capacity(frame_count);
        for frame in profile {
            if cancel.is_cancelled() {
                return None;
            }
            frame_peaks.push(find_circular_peaks(
                frame,
                self.num_segments,
                self.peak_threshold,
            ));
        }

        let mut notes = Vec::new();
        let mut segments = vec![Segment::default(); self.num_segments];
        for (frame, peaks) in frame_peaks.iter().enumerate() {
            if cancel.is_cancelled() {
                return None;
            }
            progress.update(frame as f64 / frame_count as f64);

            let mut claimed = vec![false; peaks.len()];

            // continue running segments first, so they get the first pick
            for segment in segments.iter_mut().filter(|s| s.active) {
                match self.closest_peak(segment.bin, peaks, &claimed) {
                    Some(index) => {
                        let peak = peaks[index];
                        let deviation = self.bin_distance(segment.bin, peak.bin);
                        let ahead = frame + 1;
                        if !self.has_closer_peak_ahead(&frame_peaks, ahead, segment.bin, deviation) {
                            segment.bin = peak.bin;
                        }
                        segment.salience += peak.gain;
                        segment.idle_frame = None;
                        claimed[index] = true;
                    }
                    None => {
                        if segment.idle_frame.is_none() {
                            segment.idle_frame = Some(frame);
                        }
                    }
                }
                if let Some(idle_frame) = segment.idle_frame {
                    if frame - idle_frame > self.max_idle_frames {
                        notes.extend(self.finish(segment, idle_frame));
                        segment.active = false;
                    }
                }
            }

            // then let free segments pick up the strongest unclaimed peaks
            let mut unclaimed = (0..peaks.len()).filter(|index| !claimed[*index]);
            for segment in segments.iter_mut().filter(|s| !s.active) {
                let Some(index) = unclaimed.next() else {
                    break;
                };
                *segment = Segment {
                    active: true,
                    bin: peaks[index].bin,
                    salience: peaks[index].gain,
                    start_frame: frame,
                    idle_frame: None,
                };
            }
        }

        // flush segments which are still running at the end of the profile
        for segment in segments.iter().filter(|s| s.active) {
            notes.extend(self.finish(segment, segment.idle_frame.unwrap_or(frame_count)));
        }
        progress.update(1.0);

        let max_confidence = notes.iter().map(|n| n.confidence).fold(0.0, f32::max);
        let mut pitches = PitchMap::new();
        for note in notes {
            let gain = if max_confidence > 0.0 {
                note.confidence / max_confidence
            } else {
                0.0
            };
            pitches.push(Pitch::new(
                note.pitch_class,
                note.start_frame as f32 / frame_count as f32,
                note.frame_count as f32 / frame_count as f32,
                gain,
            ));
        }
        for pitch_class in PitchClass::iter() {
            pitches
                .get_mut(pitch_class)
                .sort_by(|a, b| b.gain.total_cmp(&a.gain));
        }
        Some(pitches)
    }

    /// Index of the unclaimed peak nearest to `bin` within the max deviation. Equally distant
    /// peaks are resolved in favor of the stronger one.
    fn closest_peak(&self, bin: f32, peaks: &[Peak], claimed: &[bool]) -> Option<usize> {
        let mut closest: Option<(usize, f32)> = None;
        for (index, peak) in peaks.iter().enumerate() {
            if claimed[index] {
                continue;
            }
            let deviation = self.bin_distance(bin, peak.bin);
            if deviation > self.max_deviation_bins {
                continue;
            }
            let replace = match closest {
                None => true,
                Some((best, best_deviation)) => {
                    deviation < best_deviation
                        || (deviation == best_deviation && peak.gain > peaks[best].gain)
                }
            };
            if replace {
                closest = Some((index, deviation));
            }
        }
        closest.map(|(index, _)| index)
    }

    /// True when a peak closer than `deviation` to `target` shows up within the lookahead window,
    /// starting at frame `start`.
    fn has_closer_peak_ahead(
        &self,
        frame_peaks: &[Vec<Peak>],
        start: usize,
        target: f32,
        deviation: f32,
    ) -> bool {
        frame_peaks
            .iter()
            .skip(start)
            .take(self.lookahead_frames)
            .flatten()
            .any(|peak| self.bin_distance(target, peak.bin) < deviation)
    }

    /// Turn a segment which ended at `end_frame` into a note, if it's long enough.
    fn finish(&self, segment: &Segment, end_frame: usize) -> Option<Note> {
        let frame_count = end_frame.saturating_sub(segment.start_frame);
        if frame_count > self.min_note_frames {
            Some(Note {
                pitch_class: self.pitch_class(segment.bin),
                start_frame: segment.start_frame,
                frame_count,
                confidence: segment.salience / frame_count as f32,
            })
        } else {
            None
        }
    }
}

// -------------------------------------------------------------------------------------------------

/// Render finalized pitches into a profile shaped buffer for visualization: each pitch sets the
/// first bin of its pitch class to its confidence over the frames it spans.
pub fn segmented_pitch_buffer(
    pitches: &PitchMap,
    frame_count: usize,
    num_bins: usize,
) -> HarmonicProfile {
    let mut buffer = vec![vec![0.0f32; num_bins]; frame_count];
    let bins_per_class = num_bins / PitchClass::COUNT;
    for pitch in pitches.iter() {
        let bin = pitch.pitch_class.index() * bins_per_class;
        let start = (pitch.pos_ratio * frame_count as f32).round() as usize;
        let length = (pitch.duration * frame_count as f32).round() as usize;
        for frame in buffer.iter_mut().skip(start).take(length) {
            frame[bin] = pitch.gain;
        }
    }
    buffer
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with_peaks(peaks: &[(usize, f32)]) -> Vec<f32> {
        let mut frame = vec![0.0f32; 36];
        for &(bin, gain) in peaks {
            frame[bin] = gain;
            frame[(bin + 35) % 36] = gain * 0.25;
            frame[(bin + 1) % 36] = gain * 0.25;
        }
        frame
    }

    fn segmenter() -> PitchSegmenter {
        PitchSegmenter::with_frame_limits(&PitchDetectorConfig::default(), 2, 5, 2)
    }

    fn run(profile: &HarmonicProfile) -> PitchMap {
        segmenter()
            .segment(profile, &Progress::none(), &CancellationToken::new())
            .unwrap()
    }

    #[test]
    fn empty_profile() {
        assert!(run(&Vec::new()).is_empty());
        assert!(run(&vec![vec![0.0; 36]; 20]).is_empty());
    }

    #[test]
    fn consecutive_notes() {
        // A for 20 frames, 2 silent frames, then E until the end
        let mut profile = Vec::new();
        profile.extend((0..20).map(|_| frame_with_peaks(&[(27, 1.0)])));
        profile.extend((0..2).map(|_| frame_with_peaks(&[])));
        profile.extend((0..18).map(|_| frame_with_peaks(&[(12, 0.8)])));

        let pitches = run(&profile);
        assert_eq!(pitches.len(), 2);

        let a = pitches.get(PitchClass::A)[0];
        assert_eq!(a.pos_ratio, 0.0);
        assert!((a.duration - 0.5).abs() < 1e-6);
        assert!((a.gain - 1.0).abs() < 1e-6);

        // reaches the end of the profile, so gets flushed
        let e = pitches.get(PitchClass::E)[0];
        assert!((e.pos_ratio - 22.0 / 40.0).abs() < 1e-6);
        assert!((e.duration - 18.0 / 40.0).abs() < 1e-6);
        assert!((e.gain - 0.8).abs() < 1e-6);
    }

    #[test]
    fn simultaneous_notes_and_short_notes() {
        let mut profile = Vec::new();
        // C only for 3 frames: too short
        profile.extend((0..3).map(|_| frame_with_peaks(&[(27, 1.0), (12, 0.5), (0, 0.6)])));
        profile.extend((0..27).map(|_| frame_with_peaks(&[(27, 1.0), (12, 0.5)])));

        let pitches = run(&profile);
        assert_eq!(pitches.len(), 2);
        assert!(pitches.get(PitchClass::C).is_empty());
        assert_eq!(pitches.get(PitchClass::A)[0].duration, 1.0);
        assert!((pitches.get(PitchClass::E)[0].gain - 0.5).abs() < 1e-6);
        for pitch in pitches.iter() {
            assert!((0.0..1.0).contains(&pitch.pos_ratio));
            assert!(pitch.duration > 0.0 && pitch.pos_ratio + pitch.duration <= 1.0);
            assert!((0.0..=1.0).contains(&pitch.gain));
        }
    }

    #[test]
    fn groups_are_sorted_by_confidence() {
        let mut profile = Vec::new();
        profile.extend((0..10).map(|_| frame_with_peaks(&[(27, 0.5)])));
        profile.extend((0..4).map(|_| frame_with_peaks(&[])));
        profile.extend((0..10).map(|_| frame_with_peaks(&[(27, 1.0)])));
        let pitches = run(&profile);
        let group = pitches.get(PitchClass::A);
        assert_eq!(group.len(), 2);
        assert_eq!(group[0].gain, 1.0);
        assert_eq!(group[1].gain, 0.5);
        assert!(group[0].pos_ratio > group[1].pos_ratio);
    }

    #[test]
    fn lookahead() {
        let segmenter = segmenter();
        let peaks = vec![
            vec![Peak::new(27.0, 1.0)],
            vec![Peak::new(28.5, 1.0)],
            vec![Peak::new(27.2, 1.0)],
        ];
        // a peak closer to the current bin follows: keep the current bin
        assert!(segmenter.has_closer_peak_ahead(&peaks, 2, 27.0, 1.5));
        assert!(!segmenter.has_closer_peak_ahead(&peaks, 2, 27.0, 0.1));
        // past the end of the profile
        assert!(!segmenter.has_closer_peak_ahead(&peaks, 3, 27.0, 1.5));
    }

    #[test]
    fn segments_wrap_around_the_last_bin() {
        let mut profile = Vec::new();
        // a C whose lobe spreads into the last bin
        profile.extend((0..20).map(|_| frame_with_peaks(&[(0, 1.0)])));
        let pitches = run(&profile);
        assert_eq!(pitches.len(), 1);
        assert_eq!(pitches.get(PitchClass::C).len(), 1);

        // drifting from bin 35 to bin 0 continues the same segment
        let mut profile = Vec::new();
        profile.extend((0..10).map(|_| frame_with_peaks(&[(35, 1.0)])));
        profile.extend((0..10).map(|_| frame_with_peaks(&[(0, 1.0)])));
        let pitches = run(&profile);
        assert_eq!(pitches.len(), 1);
        assert_eq!(pitches.get(PitchClass::C)[0].duration, 1.0);

        let segmenter = segmenter();
        assert_eq!(segmenter.bin_distance(35.5, 0.5), 1.0);
        assert_eq!(segmenter.bin_distance(27.0, 25.0), 2.0);
    }

    #[test]
    fn pitch_classes_of_bins() {
        let segmenter = segmenter();
        assert_eq!(segmenter.pitch_class(0.0), PitchClass::C);
        assert_eq!(segmenter.pitch_class(26.9), PitchClass::A);
        assert_eq!(segmenter.pitch_class(27.4), PitchClass::A);
        assert_eq!(segmenter.pitch_class(35.0), PitchClass::C);
    }

    #[test]
    fn segmented_buffer() {
        let mut pitches = PitchMap::new();
        pitches.push(Pitch::new(PitchClass::D, 0.25, 0.5, 0.7));
        let buffer = segmented_pitch_buffer(&pitches, 8, 36);
        assert_eq!(buffer.len(), 8);
        for (frame, values) in buffer.iter().enumerate() {
            let expected = if (2..6).contains(&frame) { 0.7 } else { 0.0 };
            assert_eq!(values[6], expected);
            assert_eq!(values.iter().filter(|v| **v != 0.0).count(), (expected != 0.0) as usize);
        }
    }
}
