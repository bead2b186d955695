//! Real-time granular synth, driven by detected pitches.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use audio_thread_priority::promote_current_thread_to_real_time;
use basedrop::{Collector, Shared, SharedCell};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use four_cc::FourCC;

use crate::{
    parameter::{ListenerId, ParameterChange, ParameterListeners, ParameterValueUpdate},
    Error, PitchClass, PitchMap, SampleBuffer,
};

// -------------------------------------------------------------------------------------------------

pub mod envelope;
pub mod grain;
pub mod params;
pub mod positions;

mod engine;
pub use engine::{GrainEngine, GrainNote};

use grain::{mix_grains, Grain};
use params::{PositionParameters, SynthConfig, NUM_COLOURS};
use positions::{GrainPosition, PitchPositionFinder, PositionFinder};

// -------------------------------------------------------------------------------------------------

/// Immutable view of the synth state, published by the scheduler after each tick.
#[derive(Debug, Default)]
pub struct GrainSnapshot {
    sample_buffer: Option<Arc<SampleBuffer>>,
    grains: Vec<Grain>,
    notes: Vec<GrainNote>,
}

impl GrainSnapshot {
    fn from_engine(engine: &GrainEngine) -> Self {
        Self {
            sample_buffer: engine.sample_buffer().cloned(),
            grains: engine.grains().to_vec(),
            notes: engine.notes().to_vec(),
        }
    }

    /// Grains which were playing at the time of the snapshot.
    pub fn grains(&self) -> &[Grain] {
        &self.grains
    }

    /// Held and releasing notes at the time of the snapshot.
    pub fn notes(&self) -> &[GrainNote] {
        &self.notes
    }
}

// -------------------------------------------------------------------------------------------------

/// Audio thread side of a [`GranularSynth`].
///
/// Mixes the latest published [`GrainSnapshot`] into the output without locking or allocating,
/// and advances the synth's sample clock. Snapshots which get released here are not freed on
/// the audio thread, but handed back to the scheduler's collector.
#[derive(Clone)]
pub struct GrainProcessor {
    snapshot: Arc<SharedCell<GrainSnapshot>>,
    clock: Arc<AtomicU64>,
}

impl GrainProcessor {
    /// Add all playing grains to the given interleaved output buffer.
    pub fn process(&self, output: &mut [f32], channel_count: usize) {
        if channel_count == 0 {
            return;
        }
        let frame_count = (output.len() / channel_count) as u64;
        let start_time = self.clock.fetch_add(frame_count, Ordering::Relaxed);
        let snapshot = self.snapshot.get();
        if let Some(sample_buffer) = &snapshot.sample_buffer {
            mix_grains(
                &snapshot.grains,
                sample_buffer,
                output,
                channel_count,
                start_time,
            );
        }
    }

    /// Current sample time.
    pub fn time(&self) -> u64 {
        self.clock.load(Ordering::Relaxed)
    }

    /// Latest published synth state.
    pub fn snapshot(&self) -> Shared<GrainSnapshot> {
        self.snapshot.get()
    }
}

// -------------------------------------------------------------------------------------------------

enum SynthMessage {
    SetSampleBuffer(Option<Arc<SampleBuffer>>),
    SetPitches(PitchMap),
    NoteOn(PitchClass),
    NoteOff(PitchClass),
    SetPositionParameters(usize, PositionParameters),
    SetPositionStates([bool; NUM_COLOURS]),
    SetDiversity(f32),
    SetPosition {
        pitch_class: PitchClass,
        colour: usize,
        index: usize,
        reply: Sender<Result<(), Error>>,
    },
    IncrementPosition {
        pitch_class: PitchClass,
        colour: usize,
        look_right: bool,
        reply: Sender<Result<usize, Error>>,
    },
    PositionIndices {
        pitch_class: PitchClass,
        reply: Sender<[usize; NUM_COLOURS]>,
    },
    FindPositions {
        pitch_class: PitchClass,
        reply: Sender<Vec<GrainPosition>>,
    },
    ResetPositions,
    Shutdown,
}

// -------------------------------------------------------------------------------------------------

/// Granular synth which resynthesizes detected pitches of a sample buffer.
///
/// A scheduler thread owns the [`GrainEngine`]: it triggers grains at each position colour's rate,
/// updates envelopes, prunes finished grains and notes and then publishes a [`GrainSnapshot`].
/// The audio callback only reads snapshots via a [`GrainProcessor`].
///
/// Parameter values are mirrored in the synth, so updates are validated on the caller's thread
/// and change listeners get notified there.
pub struct GranularSynth {
    config: SynthConfig,
    parameters: [PositionParameters; NUM_COLOURS],
    listeners: ParameterListeners,
    sender: Sender<SynthMessage>,
    processor: GrainProcessor,
    thread: Option<thread::JoinHandle<()>>,
}

impl GranularSynth {
    /// Lower bound of the scheduler's sleep time.
    const MIN_WAIT: Duration = Duration::from_millis(1);

    /// Create a new synth with the default [`PitchPositionFinder`] and start its scheduler.
    pub fn new(config: SynthConfig) -> Result<Self, Error> {
        Self::with_position_finder(config, Box::new(PitchPositionFinder::default()))
    }

    /// Create a new synth with a custom position finder and start its scheduler.
    pub fn with_position_finder(
        config: SynthConfig,
        position_finder: Box<dyn PositionFinder>,
    ) -> Result<Self, Error> {
        let engine = GrainEngine::with_position_finder(config, position_finder)?;
        let parameters = std::array::from_fn(PositionParameters::for_colour);
        let collector = Collector::new();
        let processor = GrainProcessor {
            snapshot: Arc::new(SharedCell::new(Shared::new(
                &collector.handle(),
                GrainSnapshot::default(),
            ))),
            clock: Arc::new(AtomicU64::new(0)),
        };
        let (sender, receiver) = crossbeam_channel::unbounded();
        let thread = thread::Builder::new()
            .name("grainbow_scheduler".to_string())
            .spawn({
                let processor = processor.clone();
                move || Self::run(engine, collector, receiver, processor)
            })
            .map_err(|err| Error::ThreadError(err.to_string()))?;
        Ok(Self {
            config,
            parameters,
            listeners: ParameterListeners::new(),
            sender,
            processor,
            thread: Some(thread),
        })
    }

    pub fn config(&self) -> &SynthConfig {
        &self.config
    }

    /// A handle to mix the synth into an audio callback.
    pub fn processor(&self) -> GrainProcessor {
        self.processor.clone()
    }

    /// Add all playing grains to the given interleaved output buffer. See [`GrainProcessor`].
    pub fn process(&self, output: &mut [f32], channel_count: usize) {
        self.processor.process(output, channel_count);
    }

    // ---------------------------------------------------------------------------------------------

    /// Set or clear the sample buffer. Stops all playing notes.
    pub fn set_sample_buffer(&self, sample_buffer: Option<Arc<SampleBuffer>>) -> Result<(), Error> {
        self.send(SynthMessage::SetSampleBuffer(sample_buffer))
    }

    /// Set pitches of the loaded sample buffer, usually the result of a pitch analysis.
    pub fn set_pitches(&self, pitches: PitchMap) -> Result<(), Error> {
        self.send(SynthMessage::SetPitches(pitches))
    }

    pub fn note_on(&self, pitch_class: PitchClass) -> Result<(), Error> {
        self.send(SynthMessage::NoteOn(pitch_class))
    }

    pub fn note_off(&self, pitch_class: PitchClass) -> Result<(), Error> {
        self.send(SynthMessage::NoteOff(pitch_class))
    }

    // ---------------------------------------------------------------------------------------------

    /// Current parameters of a position colour.
    pub fn parameters(&self, colour: usize) -> Option<&PositionParameters> {
        self.parameters.get(colour)
    }

    /// Replace all parameters of a colour. Listeners get notified about each changed value.
    pub fn set_position_parameters(
        &mut self,
        colour: usize,
        parameters: PositionParameters,
    ) -> Result<(), Error> {
        let old_parameters = *self.parameters.get(colour).ok_or_else(|| {
            Error::ParameterError(format!("invalid position colour: {colour}"))
        })?;
        parameters.validate()?;
        self.send(SynthMessage::SetPositionParameters(colour, parameters))?;
        self.parameters[colour] = parameters;
        let changes = old_parameters.values().into_iter().zip(parameters.values());
        for ((id, old_value), (_, value)) in changes {
            if old_value != value {
                self.notify(id, Some(colour), value);
            }
        }
        Ok(())
    }

    /// Apply a single parameter update to a colour. Returns the new plain value.
    pub fn set_parameter(
        &mut self,
        colour: usize,
        id: FourCC,
        update: &ParameterValueUpdate,
    ) -> Result<f32, Error> {
        let mut parameters = *self.parameters.get(colour).ok_or_else(|| {
            Error::ParameterError(format!("invalid position colour: {colour}"))
        })?;
        let value = parameters.set_parameter(id, update)?;
        self.send(SynthMessage::SetPositionParameters(colour, parameters))?;
        self.parameters[colour] = parameters;
        self.notify(id, Some(colour), value);
        Ok(value)
    }

    /// Enable or disable colours for notes which start from now on.
    pub fn set_position_states(&mut self, states: [bool; NUM_COLOURS]) -> Result<(), Error> {
        self.send(SynthMessage::SetPositionStates(states))?;
        for (colour, enabled) in states.into_iter().enumerate() {
            if self.parameters[colour].enabled != enabled {
                self.parameters[colour].enabled = enabled;
                let value = PositionParameters::ENABLED.normalize_value(enabled);
                self.notify(PositionParameters::ENABLED.id(), Some(colour), value);
            }
        }
        Ok(())
    }

    /// Set the normalized diversity control, which defines the number of candidate positions.
    pub fn set_diversity(&mut self, update: &ParameterValueUpdate) -> Result<f32, Error> {
        let diversity = SynthConfig::DIVERSITY.update_value(update)?;
        self.send(SynthMessage::SetDiversity(diversity))?;
        self.config.diversity = diversity;
        self.notify(SynthConfig::DIVERSITY.id(), None, diversity);
        Ok(diversity)
    }

    /// Register a parameter change listener. Listeners are called on the thread which changes
    /// the parameter.
    pub fn subscribe<F>(&mut self, listener: F) -> ListenerId
    where
        F: Fn(&ParameterChange) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }

    fn notify(&self, id: FourCC, colour: Option<usize>, value: f32) {
        self.listeners.notify(&ParameterChange { id, colour, value });
    }

    // ---------------------------------------------------------------------------------------------

    /// Ranked candidate positions for the given pitch class.
    pub fn find_positions(&self, pitch_class: PitchClass) -> Result<Vec<GrainPosition>, Error> {
        self.request(|reply| SynthMessage::FindPositions { pitch_class, reply })
    }

    /// Candidate indices of all colours for the given pitch class.
    pub fn position_indices(&self, pitch_class: PitchClass) -> Result<[usize; NUM_COLOURS], Error> {
        self.request(|reply| SynthMessage::PositionIndices { pitch_class, reply })
    }

    /// Pin a candidate index for a (pitch class, colour) slot.
    pub fn set_position(
        &self,
        pitch_class: PitchClass,
        colour: usize,
        index: usize,
    ) -> Result<(), Error> {
        self.request(|reply| SynthMessage::SetPosition {
            pitch_class,
            colour,
            index,
            reply,
        })?
    }

    /// Move a colour to the next candidate position which no other colour uses.
    pub fn increment_position(
        &self,
        pitch_class: PitchClass,
        colour: usize,
        look_right: bool,
    ) -> Result<usize, Error> {
        self.request(|reply| SynthMessage::IncrementPosition {
            pitch_class,
            colour,
            look_right,
            reply,
        })?
    }

    pub fn reset_positions(&self) -> Result<(), Error> {
        self.send(SynthMessage::ResetPositions)
    }

    // ---------------------------------------------------------------------------------------------

    fn send(&self, message: SynthMessage) -> Result<(), Error> {
        self.sender
            .send(message)
            .map_err(|_| Error::SendError("synth scheduler is not running".to_string()))
    }

    fn request<T>(&self, message: impl FnOnce(Sender<T>) -> SynthMessage) -> Result<T, Error> {
        let (reply, response) = crossbeam_channel::bounded(1);
        self.send(message(reply))?;
        response
            .recv()
            .map_err(|_| Error::ThreadError("synth scheduler did not reply".to_string()))
    }

    fn run(
        mut engine: GrainEngine,
        mut collector: Collector,
        receiver: Receiver<SynthMessage>,
        processor: GrainProcessor,
    ) {
        let handle = collector.handle();
        if let Err(err) = promote_current_thread_to_real_time(0, engine.sample_rate()) {
            log::warn!("Failed to set synth scheduler thread's priority to real-time: {err}");
        }
        log::info!("Synth scheduler started");
        let mut last_tick = Instant::now();
        loop {
            let wait = Duration::from_secs_f32(engine.next_trigger_wait_ms() / 1000.0);
            match receiver.recv_timeout(wait.max(Self::MIN_WAIT)) {
                Ok(SynthMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(message) => {
                    engine.set_time(processor.time());
                    Self::handle_message(&mut engine, message, &processor);
                }
                Err(RecvTimeoutError::Timeout) => {}
            }
            engine.set_time(processor.time());
            let now = Instant::now();
            engine.advance(now.duration_since(last_tick).as_secs_f32() * 1000.0);
            last_tick = now;
            if engine.prune() {
                processor.clock.store(0, Ordering::Relaxed);
            }
            processor.snapshot.set(Shared::new(
                &handle,
                GrainSnapshot::from_engine(&engine),
            ));
            // free snapshots which were released by the audio thread
            collector.collect();
        }
        collector.collect();
        log::info!("Synth scheduler stopped");
    }

    fn handle_message(engine: &mut GrainEngine, message: SynthMessage, processor: &GrainProcessor) {
        // replies can only fail when the requesting thread gave up waiting
        match message {
            SynthMessage::SetSampleBuffer(sample_buffer) => {
                engine.set_sample_buffer(sample_buffer);
                processor.clock.store(0, Ordering::Relaxed);
            }
            SynthMessage::SetPitches(pitches) => engine.set_pitches(pitches),
            SynthMessage::NoteOn(pitch_class) => engine.note_on(pitch_class),
            SynthMessage::NoteOff(pitch_class) => engine.note_off(pitch_class),
            SynthMessage::SetPositionParameters(colour, parameters) => {
                if let Err(err) = engine.set_position_parameters(colour, parameters) {
                    log::error!("Failed to apply position parameters: {err}");
                }
            }
            SynthMessage::SetPositionStates(states) => engine.set_position_states(states),
            SynthMessage::SetDiversity(diversity) => engine.set_diversity(diversity),
            SynthMessage::SetPosition {
                pitch_class,
                colour,
                index,
                reply,
            } => {
                let _ = reply.send(engine.set_position(pitch_class, colour, index));
            }
            SynthMessage::IncrementPosition {
                pitch_class,
                colour,
                look_right,
                reply,
            } => {
                let _ = reply.send(engine.increment_position(pitch_class, colour, look_right));
            }
            SynthMessage::PositionIndices { pitch_class, reply } => {
                let _ = reply.send(engine.position_indices(pitch_class));
            }
            SynthMessage::FindPositions { pitch_class, reply } => {
                let _ = reply.send(engine.find_positions(pitch_class));
            }
            SynthMessage::ResetPositions => engine.reset_positions(),
            SynthMessage::Shutdown => {}
        }
    }
}

impl Drop for GranularSynth {
    fn drop(&mut self) {
        if self.sender.send(SynthMessage::Shutdown).is_err() {
            log::warn!("Synth scheduler already stopped");
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Synth scheduler thread panicked");
            }
        }
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{synth::envelope::AdsrStage, Pitch};

    const SAMPLE_RATE: u32 = 1000;

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    fn synth() -> GranularSynth {
        let synth = GranularSynth::new(SynthConfig {
            rng_seed: Some(42),
            ..Default::default()
        })
        .unwrap();
        let samples = (0..SAMPLE_RATE * 2).map(|i| (i as f32 * 0.1).sin()).collect();
        let buffer = SampleBuffer::from_mono(samples, SAMPLE_RATE).unwrap();
        let mut pitches = PitchMap::new();
        pitches.push(Pitch::new(PitchClass::C, 0.0, 0.5, 1.0));
        pitches.push(Pitch::new(PitchClass::C, 0.5, 0.25, 0.8));
        pitches.push(Pitch::new(PitchClass::D, 0.75, 0.25, 0.5));
        synth.set_sample_buffer(Some(Arc::new(buffer))).unwrap();
        synth.set_pitches(pitches).unwrap();
        synth
    }

    #[test]
    fn note_lifecycle() {
        let synth = synth();
        let processor = synth.processor();
        synth.note_on(PitchClass::C).unwrap();

        let mut output = vec![0.0; 64];
        assert!(wait_for(|| {
            processor.process(&mut output, 1);
            !processor.snapshot().grains().is_empty()
        }));

        synth.note_off(PitchClass::C).unwrap();
        assert!(wait_for(|| {
            processor.snapshot().notes().iter().all(|note| {
                note.envelopes()[0].stage() == AdsrStage::Release && note.note_off_time().is_some()
            })
        }));

        // keep the clock running until the release elapsed
        assert!(wait_for(|| {
            processor.process(&mut output, 1);
            let snapshot = processor.snapshot();
            snapshot.notes().is_empty() && snapshot.grains().is_empty()
        }));
        // an idle scheduler rewinds the clock
        assert!(wait_for(|| processor.time() == 0));
    }

    #[test]
    fn released_snapshots_are_freed_by_the_collector() {
        let mut collector = Collector::new();
        let handle = collector.handle();
        let buffer = Arc::new(SampleBuffer::from_mono(vec![0.0; 16], SAMPLE_RATE).unwrap());
        let snapshot = |sample_buffer: Option<Arc<SampleBuffer>>| GrainSnapshot {
            sample_buffer,
            ..Default::default()
        };
        let processor = GrainProcessor {
            snapshot: Arc::new(SharedCell::new(Shared::new(
                &handle,
                snapshot(Some(Arc::clone(&buffer))),
            ))),
            clock: Arc::new(AtomicU64::new(0)),
        };

        // the audio thread still holds the old snapshot while a new one gets published
        let held = processor.snapshot();
        processor.snapshot.set(Shared::new(&handle, snapshot(None)));
        assert_eq!(Arc::strong_count(&buffer), 2);

        // releasing the last reference there only queues it
        thread::spawn(move || drop(held)).join().unwrap();
        assert_eq!(Arc::strong_count(&buffer), 2);
        collector.collect();
        assert_eq!(Arc::strong_count(&buffer), 1);

        let mut output = vec![0.0; 8];
        processor.process(&mut output, 1);
        assert_eq!(processor.time(), 8);
    }

    #[test]
    fn nothing_loaded() {
        let synth = GranularSynth::new(SynthConfig::default()).unwrap();
        synth.note_on(PitchClass::A).unwrap();
        let mut output = vec![0.0; 128];
        for _ in 0..10 {
            synth.process(&mut output, 2);
            thread::sleep(Duration::from_millis(1));
        }
        assert!(output.iter().all(|s| *s == 0.0));
        assert!(synth.find_positions(PitchClass::A).unwrap().is_empty());
    }

    #[test]
    fn parameter_listeners() {
        let mut synth = synth();
        let changes = Arc::new(Mutex::new(Vec::new()));
        let id = synth.subscribe({
            let changes = Arc::clone(&changes);
            move |change| changes.lock().unwrap().push(*change)
        });

        let value = synth
            .set_parameter(
                2,
                PositionParameters::DURATION.id(),
                &ParameterValueUpdate::Normalized(0.0),
            )
            .unwrap();
        assert_eq!(value, PositionParameters::MIN_DURATION_MS);
        assert_eq!(synth.parameters(2).unwrap().duration, value);

        let parameters = PositionParameters {
            gain: 0.5,
            ..*synth.parameters(0).unwrap()
        };
        synth.set_position_parameters(0, parameters).unwrap();
        synth.set_position_states([true, false, true, false]).unwrap();
        synth
            .set_diversity(&ParameterValueUpdate::Normalized(1.0))
            .unwrap();
        assert!(synth
            .set_parameter(0, FourCC(*b"NOPE"), &ParameterValueUpdate::Normalized(0.0))
            .is_err());

        assert_eq!(
            *changes.lock().unwrap(),
            vec![
                ParameterChange {
                    id: PositionParameters::DURATION.id(),
                    colour: Some(2),
                    value: PositionParameters::MIN_DURATION_MS,
                },
                ParameterChange {
                    id: PositionParameters::GAIN.id(),
                    colour: Some(0),
                    value: 0.5,
                },
                ParameterChange {
                    id: PositionParameters::ENABLED.id(),
                    colour: Some(2),
                    value: 1.0,
                },
                ParameterChange {
                    id: SynthConfig::DIVERSITY.id(),
                    colour: None,
                    value: 1.0,
                },
            ]
        );
        assert!(synth.unsubscribe(id));
    }

    #[test]
    fn position_selection() {
        let synth = synth();
        let positions = synth.find_positions(PitchClass::C).unwrap();
        // default diversity requests 2 candidates
        assert_eq!(positions.len(), 2);
        assert_eq!(positions[0].pitch.gain, 1.0);

        synth.set_position(PitchClass::C, 2, 0).unwrap();
        assert_eq!(synth.position_indices(PitchClass::C).unwrap(), [0, 1, 0, 3]);
        // C has 2 candidates and both are used by colours 0 and 1
        assert_eq!(synth.increment_position(PitchClass::C, 2, true).unwrap(), 0);
        assert!(synth.set_position(PitchClass::C, 7, 0).is_err());

        synth.reset_positions().unwrap();
        assert_eq!(synth.position_indices(PitchClass::C).unwrap(), [0, 1, 2, 3]);
    }
}
