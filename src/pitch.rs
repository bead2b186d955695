//! Musical pitch classes and the note events produced by the analyzers.

use strum::{EnumCount, IntoEnumIterator};

// -------------------------------------------------------------------------------------------------

/// One of the twelve chromatic pitch classes, starting at C.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumCount,
    strum::EnumIter,
    strum::FromRepr,
)]
#[repr(u8)]
pub enum PitchClass {
    C = 0,
    #[strum(to_string = "C#")]
    Cs,
    D,
    #[strum(to_string = "D#")]
    Ds,
    E,
    F,
    #[strum(to_string = "F#")]
    Fs,
    G,
    #[strum(to_string = "G#")]
    Gs,
    A,
    #[strum(to_string = "A#")]
    As,
    B,
}

impl PitchClass {
    /// Pitch class of the given MIDI note number.
    pub fn from_midi_note(note: u8) -> Self {
        Self::from_index(note as usize)
    }

    /// Pitch class for the given chromatic index, wrapped into a single octave.
    pub fn from_index(index: usize) -> Self {
        Self::from_repr((index % Self::COUNT) as u8).unwrap_or(PitchClass::C)
    }

    /// Chromatic index of the pitch class: C = 0, B = 11.
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Pitch class `semitones` steps above (or below, when negative) this one.
    pub fn transposed(self, semitones: i32) -> Self {
        Self::from_index((self.index() as i32 + semitones).rem_euclid(Self::COUNT as i32) as usize)
    }
}

// -------------------------------------------------------------------------------------------------

/// A finalized note event, found by the pitch detector.
///
/// Positions and durations are relative to the analyzed buffer's length, so they can be applied
/// to the buffer independently of the analysis resolution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pitch {
    /// Detected pitch class.
    pub pitch_class: PitchClass,
    /// Start position in range `0.0..1.0`.
    pub pos_ratio: f32,
    /// Duration, relative to the whole buffer. `pos_ratio + duration <= 1.0`.
    pub duration: f32,
    /// Confidence, normalized against the most confident pitch of the analysis run.
    pub gain: f32,
}

impl Pitch {
    pub fn new(pitch_class: PitchClass, pos_ratio: f32, duration: f32, gain: f32) -> Self {
        Self {
            pitch_class,
            pos_ratio,
            duration,
            gain,
        }
    }
}

// -------------------------------------------------------------------------------------------------

/// Finalized [`Pitch`] events, grouped by pitch class.
///
/// Each group is sorted by descending confidence after an analysis run. Pitches are addressed
/// by `(PitchClass, index)` rather than by reference across the analysis, synth and UI layers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PitchMap {
    pitches: [Vec<Pitch>; PitchClass::COUNT],
}

impl PitchMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// All pitches of the given class.
    #[inline]
    pub fn get(&self, pitch_class: PitchClass) -> &[Pitch] {
        &self.pitches[pitch_class.index()]
    }

    /// Mutable access to the pitches of the given class.
    #[inline]
    pub fn get_mut(&mut self, pitch_class: PitchClass) -> &mut Vec<Pitch> {
        &mut self.pitches[pitch_class.index()]
    }

    /// Add a new pitch to its class group.
    pub fn push(&mut self, pitch: Pitch) {
        self.pitches[pitch.pitch_class.index()].push(pitch);
    }

    /// Total number of pitches in all classes.
    pub fn len(&self) -> usize {
        self.pitches.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.pitches.iter().all(Vec::is_empty)
    }

    pub fn clear(&mut self) {
        for group in &mut self.pitches {
            group.clear();
        }
    }

    /// Iterate over all pitches, ordered by pitch class.
    pub fn iter(&self) -> impl Iterator<Item = &Pitch> {
        self.pitches.iter().flatten()
    }

    /// Iterate over `(pitch class, pitches)` groups.
    pub fn groups(&self) -> impl Iterator<Item = (PitchClass, &[Pitch])> {
        PitchClass::iter().map(|pc| (pc, self.get(pc)))
    }
}

// -------------------------------------------------------------------------------------------------

/// A detected onset/attack in the analyzed buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transient {
    /// Position in range `0.0..1.0`, relative to the analyzed buffer's length.
    pub pos_ratio: f32,
    /// Detection confidence in range `0.0..=1.0`.
    pub confidence: f32,
}

impl Transient {
    pub fn new(pos_ratio: f32, confidence: f32) -> Self {
        Self {
            pos_ratio,
            confidence,
        }
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pitch_classes() {
        assert_eq!(PitchClass::from_midi_note(60), PitchClass::C);
        assert_eq!(PitchClass::from_midi_note(69), PitchClass::A);
        assert_eq!(PitchClass::A.transposed(3), PitchClass::C);
        assert_eq!(PitchClass::C.transposed(-1), PitchClass::B);
        assert_eq!(PitchClass::Fs.to_string(), "F#");
        assert_eq!(PitchClass::iter().count(), 12);
    }

    #[test]
    fn pitch_map_groups() {
        let mut map = PitchMap::new();
        assert!(map.is_empty());
        map.push(Pitch::new(PitchClass::A, 0.0, 0.5, 1.0));
        map.push(Pitch::new(PitchClass::A, 0.5, 0.25, 0.5));
        map.push(Pitch::new(PitchClass::D, 0.1, 0.1, 0.2));
        assert_eq!(map.len(), 3);
        assert_eq!(map.get(PitchClass::A).len(), 2);
        assert_eq!(map.get(PitchClass::D)[0].gain, 0.2);
        assert!(map.get(PitchClass::C).is_empty());
        assert_eq!(map.groups().filter(|(_, p)| !p.is_empty()).count(), 2);
        map.clear();
        assert!(map.is_empty());
    }
}
