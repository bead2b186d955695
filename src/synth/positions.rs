//! Playable grain positions for a requested pitch class.

use strum::EnumCount;

use super::params::{MAX_CANDIDATES, NUM_COLOURS};
use crate::{Error, Pitch, PitchClass, PitchMap};

// -------------------------------------------------------------------------------------------------

/// A detected pitch segment, played back at a rate which transposes it to the requested pitch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GrainPosition {
    pub pitch: Pitch,
    pub playback_rate: f32,
    pub enabled: bool,
}

impl GrainPosition {
    pub fn new(pitch: Pitch, playback_rate: f32) -> Self {
        Self {
            pitch,
            playback_rate,
            enabled: false,
        }
    }

    /// Placeholder for a colour without a playable candidate.
    pub fn inactive() -> Self {
        Self::new(Pitch::new(PitchClass::C, 0.0, 0.0, 0.0), 1.0)
    }
}

impl Default for GrainPosition {
    fn default() -> Self {
        Self::inactive()
    }
}

// -------------------------------------------------------------------------------------------------

/// Maps a requested pitch class to ranked candidate positions in the analyzed sample.
pub trait PositionFinder: Send {
    /// Find up to `max_positions` candidates, best ones first. Returns an empty list when there
    /// are no usable pitches.
    fn find_positions(
        &self,
        pitches: &PitchMap,
        pitch_class: PitchClass,
        max_positions: usize,
    ) -> Vec<GrainPosition>;
}

// -------------------------------------------------------------------------------------------------

/// Default [`PositionFinder`].
///
/// Candidates are pitches of the requested class, played at their original rate, and pitches of
/// neighbouring classes, transposed by `2^(semitones/12)`. They are ranked by their confidence,
/// penalized by the transposition distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PitchPositionFinder {
    max_transposition: i32,
}

impl Default for PitchPositionFinder {
    fn default() -> Self {
        Self {
            max_transposition: 2,
        }
    }
}

impl PitchPositionFinder {
    /// Create a finder which transposes neighbouring pitches up to the given number of semitones.
    pub fn new(max_transposition: u32) -> Self {
        Self {
            max_transposition: (max_transposition as i32).min(PitchClass::COUNT as i32 / 2),
        }
    }

    fn score(pitch: &Pitch, semitones: i32) -> f32 {
        pitch.gain / (1.0 + semitones.abs() as f32)
    }
}

impl PositionFinder for PitchPositionFinder {
    fn find_positions(
        &self,
        pitches: &PitchMap,
        pitch_class: PitchClass,
        max_positions: usize,
    ) -> Vec<GrainPosition> {
        let mut candidates = Vec::new();
        // unshifted pitches first, so equal scores prefer smaller transpositions
        let mut transpositions = vec![0];
        for distance in 1..=self.max_transposition {
            transpositions.push(distance);
            transpositions.push(-distance);
        }
        for semitones in transpositions {
            let source_class = pitch_class.transposed(-semitones);
            let playback_rate = 2.0f32.powf(semitones as f32 / 12.0);
            for pitch in pitches.get(source_class) {
                if pitch.duration > 0.0 {
                    candidates.push((
                        Self::score(pitch, semitones),
                        GrainPosition::new(*pitch, playback_rate),
                    ));
                }
            }
        }
        candidates.sort_by(|a, b| b.0.total_cmp(&a.0));
        candidates
            .into_iter()
            .take(max_positions)
            .map(|(_, position)| position)
            .collect()
    }
}

// -------------------------------------------------------------------------------------------------

/// Pins a candidate index for each (pitch class, colour) slot.
///
/// By default colour `n` plays candidate `n`.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionLocks {
    indices: [[usize; NUM_COLOURS]; PitchClass::COUNT],
}

impl Default for PositionLocks {
    fn default() -> Self {
        let mut indices = [[0; NUM_COLOURS]; PitchClass::COUNT];
        for colours in &mut indices {
            for (colour, index) in colours.iter_mut().enumerate() {
                *index = colour;
            }
        }
        Self { indices }
    }
}

impl PositionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Candidate indices of all colours for the given pitch class.
    pub fn position_indices(&self, pitch_class: PitchClass) -> [usize; NUM_COLOURS] {
        self.indices[pitch_class.index()]
    }

    /// Pin a candidate index for a single slot.
    pub fn set_position(
        &mut self,
        pitch_class: PitchClass,
        colour: usize,
        index: usize,
    ) -> Result<(), Error> {
        if colour >= NUM_COLOURS || index >= MAX_CANDIDATES {
            return Err(Error::ParameterError(format!(
                "invalid position slot: colour {colour}, candidate {index}"
            )));
        }
        self.indices[pitch_class.index()][colour] = index;
        Ok(())
    }

    /// Move a colour's candidate index to the next index, which is not used by any other colour
    /// of the same pitch class. Indices wrap around at `candidate_count`. Returns the new index,
    /// which is the old one if there is no free candidate.
    pub fn increment_position(
        &mut self,
        pitch_class: PitchClass,
        colour: usize,
        look_right: bool,
        candidate_count: usize,
    ) -> Result<usize, Error> {
        if colour >= NUM_COLOURS {
            return Err(Error::ParameterError(format!("invalid colour: {colour}")));
        }
        let slots = &mut self.indices[pitch_class.index()];
        let current = slots[colour];
        if candidate_count == 0 {
            return Ok(current);
        }
        let is_taken =
            |index: usize| (0..NUM_COLOURS).any(|other| other != colour && slots[other] == index);
        let next = (1..=candidate_count)
            .map(|step| {
                let step = step as i64;
                let index = if look_right {
                    current as i64 + step
                } else {
                    current as i64 - step
                };
                index.rem_euclid(candidate_count as i64) as usize
            })
            .find(|index| !is_taken(*index))
            .unwrap_or(current);
        slots[colour] = next;
        Ok(next)
    }

    /// Restore the default colour to candidate assignment.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

// -------------------------------------------------------------------------------------------------
