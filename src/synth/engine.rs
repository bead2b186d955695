//! Single threaded core of the granular synth: notes, envelopes, grain triggering and mixing.

use std::sync::Arc;

use four_cc::FourCC;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use strum::EnumCount;

use super::{
    envelope::{AdsrEnvelope, AdsrStage, AdsrTimes},
    grain::{mix_grains, Grain, GrainEnvelope},
    params::{PositionParameters, SynthConfig, NUM_COLOURS},
    positions::{GrainPosition, PitchPositionFinder, PositionFinder, PositionLocks},
};
use crate::{parameter::ParameterValueUpdate, Error, PitchClass, PitchMap, SampleBuffer};

// -------------------------------------------------------------------------------------------------

/// A held or releasing note with one grain position per colour.
#[derive(Debug, Clone, PartialEq)]
pub struct GrainNote {
    pitch_class: PitchClass,
    positions: [GrainPosition; NUM_COLOURS],
    envelopes: [AdsrEnvelope; NUM_COLOURS],
    note_on_time: u64,
    note_off_time: Option<u64>,
}

impl GrainNote {
    fn new(pitch_class: PitchClass, positions: [GrainPosition; NUM_COLOURS], time: u64) -> Self {
        Self {
            pitch_class,
            positions,
            envelopes: [AdsrEnvelope::new(); NUM_COLOURS],
            note_on_time: time,
            note_off_time: None,
        }
    }

    pub fn pitch_class(&self) -> PitchClass {
        self.pitch_class
    }

    pub fn positions(&self) -> &[GrainPosition; NUM_COLOURS] {
        &self.positions
    }

    pub fn envelopes(&self) -> &[AdsrEnvelope; NUM_COLOURS] {
        &self.envelopes
    }

    pub fn note_on_time(&self) -> u64 {
        self.note_on_time
    }

    /// Sample time of the note-off, `None` while the note is held.
    pub fn note_off_time(&self) -> Option<u64> {
        self.note_off_time
    }

    fn retrigger(&mut self, positions: [GrainPosition; NUM_COLOURS], time: u64) {
        *self = Self::new(self.pitch_class, positions, time);
    }

    fn release(&mut self, time: u64) {
        self.note_off_time = Some(time);
        for envelope in &mut self.envelopes {
            envelope.note_off();
        }
    }
}

// -------------------------------------------------------------------------------------------------

/// Granular synthesis engine.
///
/// Owns all synth state and mutates it from a single thread. [`GranularSynth`](crate::GranularSynth)
/// drives it from its scheduler thread; tests and offline bounces use [`Self::render`], which
/// runs the trigger, mixing and pruning steps in place.
///
/// Time is measured in output samples at the loaded sample buffer's rate.
pub struct GrainEngine {
    config: SynthConfig,
    sample_buffer: Option<Arc<SampleBuffer>>,
    pitches: PitchMap,
    position_finder: Box<dyn PositionFinder>,
    position_locks: PositionLocks,
    parameters: [PositionParameters; NUM_COLOURS],
    grain_envelopes: [GrainEnvelope; NUM_COLOURS],
    trigger_countdowns_ms: [f32; NUM_COLOURS],
    notes: Vec<GrainNote>,
    grains: Vec<Grain>,
    time: u64,
    rng: SmallRng,
}

impl GrainEngine {
    /// Sample rate used for time conversions while no sample buffer is loaded.
    pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

    pub fn new(config: SynthConfig) -> Result<Self, Error> {
        Self::with_position_finder(config, Box::new(PitchPositionFinder::default()))
    }

    pub fn with_position_finder(
        config: SynthConfig,
        position_finder: Box<dyn PositionFinder>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let parameters: [PositionParameters; NUM_COLOURS] =
            std::array::from_fn(PositionParameters::for_colour);
        let grain_envelopes = parameters.map(|p| GrainEnvelope::new(p.shape, p.tilt));
        let trigger_countdowns_ms = parameters.map(|p| p.trigger_interval_ms());
        let rng = match config.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_os_rng(),
        };
        Ok(Self {
            config,
            sample_buffer: None,
            pitches: PitchMap::new(),
            position_finder,
            position_locks: PositionLocks::new(),
            parameters,
            grain_envelopes,
            trigger_countdowns_ms,
            notes: Vec::with_capacity(PitchClass::COUNT),
            grains: Vec::with_capacity(config.max_grains),
            time: 0,
            rng,
        })
    }

    pub fn config(&self) -> &SynthConfig {
        &self.config
    }

    /// Set the normalized diversity control, which defines the number of candidate positions.
    pub fn set_diversity(&mut self, diversity: f32) {
        self.config.diversity = SynthConfig::DIVERSITY.clamp_value(diversity);
    }

    // ---------------------------------------------------------------------------------------------

    pub fn sample_buffer(&self) -> Option<&Arc<SampleBuffer>> {
        self.sample_buffer.as_ref()
    }

    /// Set or clear the sample buffer grains are played from. Stops all notes and grains.
    pub fn set_sample_buffer(&mut self, sample_buffer: Option<Arc<SampleBuffer>>) {
        self.sample_buffer = sample_buffer;
        self.notes.clear();
        self.grains.clear();
        self.time = 0;
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_buffer
            .as_ref()
            .map_or(Self::DEFAULT_SAMPLE_RATE, |buffer| buffer.sample_rate())
    }

    pub fn pitches(&self) -> &PitchMap {
        &self.pitches
    }

    /// Set the pitches which are used to find grain positions for new notes.
    pub fn set_pitches(&mut self, pitches: PitchMap) {
        self.pitches = pitches;
    }

    // ---------------------------------------------------------------------------------------------

    /// Ranked candidate positions for the given pitch class.
    pub fn find_positions(&self, pitch_class: PitchClass) -> Vec<GrainPosition> {
        self.position_finder
            .find_positions(&self.pitches, pitch_class, self.config.candidate_count())
    }

    /// Positions which a new note of the given pitch class plays, one per colour. Colours which
    /// are disabled or have no candidate get an inactive position.
    pub fn current_positions(&self, pitch_class: PitchClass) -> [GrainPosition; NUM_COLOURS] {
        let candidates = self.find_positions(pitch_class);
        let indices = self.position_locks.position_indices(pitch_class);
        std::array::from_fn(|colour| match candidates.get(indices[colour]) {
            Some(candidate) if self.parameters[colour].enabled => GrainPosition {
                enabled: true,
                ..*candidate
            },
            _ => GrainPosition::inactive(),
        })
    }

    pub fn position_indices(&self, pitch_class: PitchClass) -> [usize; NUM_COLOURS] {
        self.position_locks.position_indices(pitch_class)
    }

    pub fn set_position(
        &mut self,
        pitch_class: PitchClass,
        colour: usize,
        index: usize,
    ) -> Result<(), Error> {
        self.position_locks.set_position(pitch_class, colour, index)
    }

    /// Move a colour to the next candidate position which no other colour uses.
    pub fn increment_position(
        &mut self,
        pitch_class: PitchClass,
        colour: usize,
        look_right: bool,
    ) -> Result<usize, Error> {
        let candidate_count = self.find_positions(pitch_class).len();
        self.position_locks
            .increment_position(pitch_class, colour, look_right, candidate_count)
    }

    pub fn reset_positions(&mut self) {
        self.position_locks.reset();
    }

    // ---------------------------------------------------------------------------------------------

    pub fn parameters(&self, colour: usize) -> Option<&PositionParameters> {
        self.parameters.get(colour)
    }

    /// Replace all parameters of a colour. Re-seeds the trigger countdowns of all colours.
    pub fn set_position_parameters(
        &mut self,
        colour: usize,
        parameters: PositionParameters,
    ) -> Result<(), Error> {
        Self::check_colour(colour)?;
        parameters.validate()?;
        self.parameters[colour] = parameters;
        self.grain_envelopes[colour] = GrainEnvelope::new(parameters.shape, parameters.tilt);
        self.reset_trigger_countdowns();
        Ok(())
    }

    /// Apply a single parameter update to a colour. Returns the new plain value.
    pub fn set_parameter(
        &mut self,
        colour: usize,
        id: FourCC,
        update: &ParameterValueUpdate,
    ) -> Result<f32, Error> {
        Self::check_colour(colour)?;
        let mut parameters = self.parameters[colour];
        let value = parameters.set_parameter(id, update)?;
        self.set_position_parameters(colour, parameters)?;
        Ok(value)
    }

    /// Enable or disable colours for notes which start from now on.
    pub fn set_position_states(&mut self, states: [bool; NUM_COLOURS]) {
        for (parameters, enabled) in self.parameters.iter_mut().zip(states) {
            parameters.enabled = enabled;
        }
    }

    fn check_colour(colour: usize) -> Result<(), Error> {
        if colour < NUM_COLOURS {
            Ok(())
        } else {
            Err(Error::ParameterError(format!(
                "invalid position colour: {colour}"
            )))
        }
    }

    fn reset_trigger_countdowns(&mut self) {
        for (countdown, parameters) in self.trigger_countdowns_ms.iter_mut().zip(&self.parameters) {
            *countdown = parameters.trigger_interval_ms();
        }
    }

    // ---------------------------------------------------------------------------------------------

    /// Start a note, or restart it when it's already playing or releasing.
    pub fn note_on(&mut self, pitch_class: PitchClass) {
        let positions = self.current_positions(pitch_class);
        if let Some(note) = self
            .notes
            .iter_mut()
            .find(|note| note.pitch_class == pitch_class)
        {
            note.retrigger(positions, self.time);
        } else {
            self.notes
                .push(GrainNote::new(pitch_class, positions, self.time));
        }
    }

    /// Move all positions of the note into their release stage.
    pub fn note_off(&mut self, pitch_class: PitchClass) {
        if let Some(note) = self
            .notes
            .iter_mut()
            .find(|note| note.pitch_class == pitch_class && note.note_off_time.is_none())
        {
            note.release(self.time);
        }
    }

    pub fn notes(&self) -> &[GrainNote] {
        &self.notes
    }

    pub fn grains(&self) -> &[Grain] {
        &self.grains
    }

    /// Current sample time.
    pub fn time(&self) -> u64 {
        self.time
    }

    /// Sync the sample time with an external clock.
    pub fn set_time(&mut self, time: u64) {
        self.time = time;
    }

    /// True when no notes and no grains are playing.
    pub fn is_idle(&self) -> bool {
        self.notes.is_empty() && self.grains.is_empty()
    }

    /// Longest release time of all colours in samples. Releasing notes are removed after it.
    pub fn max_release_samples(&self) -> u64 {
        let sample_rate = self.sample_rate();
        self.parameters
            .iter()
            .map(|parameters| parameters.release_samples(sample_rate))
            .max()
            .unwrap_or(0)
    }

    // ---------------------------------------------------------------------------------------------

    /// Time until the next colour is due to trigger, in milliseconds.
    pub fn next_trigger_wait_ms(&self) -> f32 {
        self.trigger_countdowns_ms
            .iter()
            .copied()
            .fold(f32::MAX, f32::min)
            .max(0.0)
    }

    /// Advance the trigger countdowns by the given time, update all envelopes and trigger one
    /// grain per note for every colour which got due.
    pub fn advance(&mut self, elapsed_ms: f32) {
        for countdown in &mut self.trigger_countdowns_ms {
            *countdown -= elapsed_ms;
        }
        self.update_envelopes();
        for colour in 0..NUM_COLOURS {
            if self.trigger_countdowns_ms[colour] <= 0.0 {
                self.trigger_grains(colour);
                self.trigger_countdowns_ms[colour] = self.parameters[colour].trigger_interval_ms();
            }
        }
    }

    fn update_envelopes(&mut self) {
        let sample_rate = self.sample_rate();
        let times: [AdsrTimes; NUM_COLOURS] = std::array::from_fn(|colour| {
            AdsrTimes::from_parameters(&self.parameters[colour], sample_rate)
        });
        let time = self.time;
        for note in &mut self.notes {
            let since_note_on = time.saturating_sub(note.note_on_time);
            let since_note_off = note
                .note_off_time
                .map_or(0, |note_off| time.saturating_sub(note_off));
            for (envelope, times) in note.envelopes.iter_mut().zip(&times) {
                envelope.update(since_note_on, since_note_off, times);
            }
        }
    }

    fn trigger_grains(&mut self, colour: usize) {
        let Some(sample_buffer) = &self.sample_buffer else {
            return;
        };
        let sample_rate = sample_buffer.sample_rate();
        let frame_count = sample_buffer.frame_count() as f32;
        let parameters = &self.parameters[colour];
        for note in &self.notes {
            if self.grains.len() >= self.config.max_grains {
                log::debug!("Grain pool is full, skipping triggers");
                break;
            }
            let position = &note.positions[colour];
            if !position.enabled {
                continue;
            }
            let playback_rate = position.playback_rate.max(0.1);
            let source_length = parameters.duration_samples(sample_rate);
            let duration = (source_length / playback_rate) as u64;
            let segment_start = position.pitch.pos_ratio * frame_count;
            let segment_length = position.pitch.duration * frame_count;
            let jitter = (segment_length - source_length).max(0.0) * self.rng.random::<f32>();
            let gain = note.envelopes[colour].level() * parameters.gain;
            self.grains.push(Grain::new(
                self.grain_envelopes[colour].clone(),
                duration,
                playback_rate,
                segment_start + jitter,
                self.time,
                gain,
            ));
        }
    }

    /// Remove expired grains and notes whose release elapsed. Resets the sample time when
    /// nothing is playing anymore and returns true in that case.
    pub fn prune(&mut self) -> bool {
        let time = self.time;
        self.grains.retain(|grain| !grain.is_expired(time));
        let max_release = self.max_release_samples();
        self.notes.retain(|note| {
            note.note_off_time
                .is_none_or(|note_off| time.saturating_sub(note_off) <= max_release)
        });
        if self.is_idle() && self.time != 0 {
            self.time = 0;
            return true;
        }
        false
    }

    // ---------------------------------------------------------------------------------------------

    /// Render the given interleaved output block, triggering grains as they get due and pruning
    /// expired grains and notes after each trigger step.
    ///
    /// The output is added to, not overwritten.
    pub fn render(&mut self, output: &mut [f32], channel_count: usize) {
        if channel_count == 0 {
            return;
        }
        let samples_per_ms = self.sample_rate() as f32 / 1000.0;
        let frame_count = output.len() / channel_count;
        let mut frame = 0;
        while frame < frame_count {
            let wait = (self.next_trigger_wait_ms() * samples_per_ms).ceil() as usize;
            let chunk = wait.clamp(1, frame_count - frame);
            if let Some(sample_buffer) = &self.sample_buffer {
                mix_grains(
                    &self.grains,
                    sample_buffer,
                    &mut output[frame * channel_count..(frame + chunk) * channel_count],
                    channel_count,
                    self.time,
                );
            }
            self.time += chunk as u64;
            frame += chunk;
            self.advance(chunk as f32 / samples_per_ms);
            self.prune();
        }
    }

    /// True when the note of the given pitch class is playing and in the given stage in all of
    /// its enabled positions.
    pub fn is_note_in_stage(&self, pitch_class: PitchClass, stage: AdsrStage) -> bool {
        self.notes
            .iter()
            .find(|note| note.pitch_class == pitch_class)
            .is_some_and(|note| {
                note.positions
                    .iter()
                    .zip(&note.envelopes)
                    .filter(|(position, _)| position.enabled)
                    .all(|(_, envelope)| envelope.stage() == stage)
            })
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;
    use crate::Pitch;

    const SAMPLE_RATE: u32 = 1000;

    fn engine_with_pitches(config: SynthConfig) -> GrainEngine {
        let samples = (0..SAMPLE_RATE * 4)
            .map(|i| (i as f32 * 0.05).sin())
            .collect();
        let buffer = SampleBuffer::from_mono(samples, SAMPLE_RATE).unwrap();
        let mut pitches = PitchMap::new();
        for pitch_class in PitchClass::iter() {
            let pos_ratio = pitch_class.index() as f32 / 12.0;
            pitches.push(Pitch::new(pitch_class, pos_ratio, 1.0 / 12.0, 1.0));
        }
        let mut engine = GrainEngine::new(SynthConfig {
            rng_seed: Some(1234),
            ..config
        })
        .unwrap();
        engine.set_sample_buffer(Some(Arc::new(buffer)));
        engine.set_pitches(pitches);
        engine
    }

    #[test]
    fn grain_count_is_bounded() {
        let mut engine = engine_with_pitches(SynthConfig {
            max_grains: 20,
            diversity: 1.0,
            ..Default::default()
        });
        engine.set_position_states([true; NUM_COLOURS]);
        for colour in 0..NUM_COLOURS {
            let parameters = PositionParameters {
                enabled: true,
                rate: 1.0,
                duration: PositionParameters::MAX_DURATION_MS,
                ..PositionParameters::default()
            };
            engine.set_position_parameters(colour, parameters).unwrap();
        }
        for pitch_class in PitchClass::iter() {
            engine.note_on(pitch_class);
        }
        let mut output = vec![0.0; 64];
        let mut max_grains = 0;
        for _ in 0..100 {
            engine.render(&mut output, 1);
            max_grains = max_grains.max(engine.grains().len());
            assert!(engine.grains().len() <= 20);
        }
        assert_eq!(max_grains, 20);
    }

    #[test]
    fn note_off_releases_and_removes_note() {
        let mut engine = engine_with_pitches(SynthConfig::default());
        engine.note_on(PitchClass::C);
        assert_eq!(engine.notes().len(), 1);
        let note = &engine.notes()[0];
        assert!(note.positions()[0].enabled);
        assert!(!note.positions()[1].enabled);
        assert_eq!(note.positions()[0].pitch.pitch_class, PitchClass::C);

        engine.note_off(PitchClass::C);
        assert!(engine.is_note_in_stage(PitchClass::C, AdsrStage::Release));
        assert_eq!(engine.notes()[0].note_off_time(), Some(0));

        let max_release = engine.max_release_samples();
        assert_eq!(max_release, 500);
        let mut output = vec![0.0; 100];
        let mut rendered = 0;
        while rendered <= max_release {
            assert_eq!(engine.notes().len(), 1);
            engine.render(&mut output, 1);
            rendered += output.len() as u64;
        }
        assert!(engine.notes().is_empty());
        assert!(engine.is_idle() || !engine.grains().is_empty());
    }

    #[test]
    fn held_note_renders_audio() {
        let mut engine = engine_with_pitches(SynthConfig::default());
        engine.note_on(PitchClass::A);
        let mut output = vec![0.0; 2 * SAMPLE_RATE as usize];
        engine.render(&mut output, 2);
        assert!(!engine.grains().is_empty());
        assert!(output.iter().any(|s| s.abs() > 0.01));
        assert!(engine.is_note_in_stage(PitchClass::A, AdsrStage::Sustain));

        // grains stay within the matched pitch segment
        let segment_start = 9.0 / 12.0 * engine.sample_buffer().unwrap().frame_count() as f32;
        assert!(engine
            .grains()
            .iter()
            .all(|grain| grain.offset() >= segment_start));

        // releasing everything and waiting for the release resets the clock
        engine.note_off(PitchClass::A);
        let mut output = vec![0.0; 2 * SAMPLE_RATE as usize];
        engine.render(&mut output, 2);
        assert!(engine.is_idle());
        assert_eq!(engine.time(), 0);
    }

    #[test]
    fn retrigger_and_missing_positions() {
        let mut engine = GrainEngine::new(SynthConfig::default()).unwrap();
        // no pitches: note plays inactive positions
        engine.note_on(PitchClass::D);
        assert!(engine.notes()[0]
            .positions()
            .iter()
            .all(|position| !position.enabled));
        let mut output = vec![0.0; 256];
        engine.render(&mut output, 1);
        assert!(engine.grains().is_empty());
        assert!(output.iter().all(|s| *s == 0.0));

        engine.note_off(PitchClass::D);
        engine.set_time(100);
        engine.note_on(PitchClass::D);
        assert_eq!(engine.notes().len(), 1);
        assert_eq!(engine.notes()[0].note_off_time(), None);
        assert_eq!(engine.notes()[0].note_on_time(), 100);
        assert!(engine.is_note_in_stage(PitchClass::D, AdsrStage::Attack));
    }

    #[test]
    fn parameter_changes() {
        let mut engine = GrainEngine::new(SynthConfig::default()).unwrap();
        let value = engine
            .set_parameter(
                1,
                PositionParameters::RATE.id(),
                &ParameterValueUpdate::Normalized(1.0),
            )
            .unwrap();
        assert_eq!(value, 1.0);
        assert_eq!(engine.parameters(1).unwrap().rate, 1.0);
        assert_eq!(
            engine.next_trigger_wait_ms(),
            PositionParameters::DURATION.default_value() / 8.0
        );
        assert!(engine
            .set_parameter(
                NUM_COLOURS,
                PositionParameters::RATE.id(),
                &ParameterValueUpdate::Normalized(1.0)
            )
            .is_err());
        assert!(engine
            .set_position_parameters(
                0,
                PositionParameters {
                    duration: 1.0,
                    ..Default::default()
                }
            )
            .is_err());
    }
}
