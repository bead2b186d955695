//! Offline analysis of loaded sample buffers: spectrogram, transients and pitches.

use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use crossbeam_channel::Sender;

use crate::{
    pitch::{PitchMap, Transient},
    Error, SampleBuffer,
};

// -------------------------------------------------------------------------------------------------

pub mod fft;
pub mod hpcp;
pub mod peaks;
pub mod pitch;
pub mod segmentation;
pub mod task;
pub mod transient;

use fft::{FramerConfig, SpectralFramer, Spectrogram};
use hpcp::HarmonicProfile;
use pitch::{PitchDetector, PitchDetectorConfig};
use task::{AnalysisTask, Progress};
use transient::{TransientConfig, TransientDetector};

// -------------------------------------------------------------------------------------------------

/// Events which get published by the [`Analyzer`] while analyzing a sample buffer.
///
/// Events are sent from the analysis threads. Results of cancelled runs are never published.
#[derive(Debug, Clone)]
pub enum AnalysisEvent {
    /// Overall progress of all analysis stages in range `0.0..=1.0`.
    Progress(f64),
    /// Spectrogram of the whole buffer, for visualization.
    SpectrogramReady(Spectrogram),
    TransientsReady(Vec<Transient>),
    /// HPCP frames of the pitch detector's first phase.
    HarmonicProfileReady(HarmonicProfile),
    /// Finalized pitches, together with their visualization buffer.
    PitchesReady {
        pitches: PitchMap,
        segmented_pitches: HarmonicProfile,
    },
}

// -------------------------------------------------------------------------------------------------

/// Configuration of all [`Analyzer`] stages.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AnalyzerConfig {
    pub spectrogram: FramerConfig,
    pub transients: TransientConfig,
    pub pitch: PitchDetectorConfig,
}

impl AnalyzerConfig {
    pub fn validate(&self) -> Result<(), Error> {
        self.spectrogram.validate()?;
        self.transients.validate()?;
        self.pitch.validate()
    }
}

// -------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Spectrogram,
    Transients,
    Pitches,
}

impl Stage {
    const COUNT: usize = 3;

    /// Part of the overall progress the stage covers.
    fn progress_range(self) -> (f64, f64) {
        match self {
            Stage::Spectrogram => (0.0, 0.2),
            Stage::Transients => (0.2, 0.4),
            Stage::Pitches => (0.4, 1.0),
        }
    }
}

/// Sums up the progress of the concurrently running analysis stages and publishes it.
struct ProgressTracker {
    stages: [AtomicU32; Stage::COUNT],
    last_sent: AtomicU32,
    events: Sender<AnalysisEvent>,
}

impl ProgressTracker {
    /// Minimum progress change which gets published.
    const MIN_STEP: f32 = 0.01;
    /// Summed up stage progress above which the analysis counts as complete.
    const DONE: f32 = 0.999;

    fn new(events: Sender<AnalysisEvent>) -> Self {
        Self {
            stages: Default::default(),
            last_sent: AtomicU32::new(0.0f32.to_bits()),
            events,
        }
    }

    /// Report the global progress value of the given stage, as mapped by a stage's [`Progress`].
    fn report(&self, stage: Stage, value: f64) {
        let (start, _) = stage.progress_range();
        self.stages[stage as usize].store(((value - start) as f32).to_bits(), Ordering::Relaxed);
        let total = self
            .stages
            .iter()
            .map(|s| f32::from_bits(s.load(Ordering::Relaxed)))
            .sum::<f32>();
        let done = total >= Self::DONE;
        let total = if done { 1.0 } else { total };
        let last_sent = f32::from_bits(self.last_sent.load(Ordering::Relaxed));
        if total - last_sent >= Self::MIN_STEP || (done && last_sent < 1.0) {
            self.last_sent.store(total.to_bits(), Ordering::Relaxed);
            if let Err(err) = self.events.send(AnalysisEvent::Progress(total as f64)) {
                log::warn!("failed to send analysis progress: {}", err);
            }
        }
    }

    /// Run `f` with a [`Progress`] which reports into the given stage.
    fn with_progress<R>(&self, stage: Stage, f: impl FnOnce(&Progress) -> R) -> R {
        let report = |value: f64| self.report(stage, value);
        let (start, end) = stage.progress_range();
        f(&Progress::new(start, end, &report))
    }
}

// -------------------------------------------------------------------------------------------------

/// Runs spectrogram, transient and pitch analysis of loaded sample buffers in background
/// threads, publishing results as [`AnalysisEvent`]s.
///
/// Each stage runs in its own [`AnalysisTask`]: analyzing a new buffer cancels and joins all
/// runs of the previous buffer first.
pub struct Analyzer {
    config: AnalyzerConfig,
    events: Sender<AnalysisEvent>,
    spectrogram_task: AnalysisTask,
    transient_task: AnalysisTask,
    pitch_task: AnalysisTask,
}

impl Analyzer {
    pub fn new(config: AnalyzerConfig, events: Sender<AnalysisEvent>) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            config,
            events,
            spectrogram_task: AnalysisTask::new("spectrogram"),
            transient_task: AnalysisTask::new("transients"),
            pitch_task: AnalysisTask::new("pitch"),
        })
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// True while any of the analysis stages is still running.
    pub fn is_running(&self) -> bool {
        self.spectrogram_task.is_running()
            || self.transient_task.is_running()
            || self.pitch_task.is_running()
    }

    /// Cancel running analysis, then start analyzing the given buffer.
    ///
    /// Passing `None` (nothing loaded) only cancels the running analysis.
    pub fn process(&mut self, buffer: Option<Arc<SampleBuffer>>) -> Result<(), Error> {
        self.cancel();
        let Some(buffer) = buffer else {
            return Ok(());
        };

        let sample_rate = buffer.sample_rate();
        let samples: Arc<[f32]> = buffer.to_mono().into();
        let tracker = Arc::new(ProgressTracker::new(self.events.clone()));
        log::info!("Analyzing {} frames at {} Hz", samples.len(), sample_rate);

        self.spectrogram_task.spawn({
            let (samples, tracker, config) = (samples.clone(), tracker.clone(), self.config);
            move |cancel| {
                let spectrogram = SpectralFramer::new(config.spectrogram).map(|mut framer| {
                    tracker.with_progress(Stage::Spectrogram, |progress| {
                        framer.process(&samples, progress, &cancel)
                    })
                });
                match spectrogram {
                    Ok(Some(spectrogram)) => {
                        publish(&tracker.events, AnalysisEvent::SpectrogramReady(spectrogram))
                    }
                    Ok(None) => log::info!("Spectrogram analysis got cancelled"),
                    Err(err) => log::error!("Failed to create spectrogram: {}", err),
                }
            }
        })?;

        self.transient_task.spawn({
            let (samples, tracker, config) = (samples.clone(), tracker.clone(), self.config);
            move |cancel| {
                let transients = TransientDetector::new(config.transients).map(|mut detector| {
                    tracker.with_progress(Stage::Transients, |progress| {
                        detector.process(&samples, progress, &cancel)
                    })
                });
                match transients {
                    Ok(Some(transients)) => {
                        publish(&tracker.events, AnalysisEvent::TransientsReady(transients))
                    }
                    Ok(None) => log::info!("Transient analysis got cancelled"),
                    Err(err) => log::error!("Failed to detect transients: {}", err),
                }
            }
        })?;

        self.pitch_task.spawn({
            let config = self.config;
            move |cancel| {
                let mut detector = match PitchDetector::new(config.pitch) {
                    Ok(detector) => detector,
                    Err(err) => {
                        log::error!("Failed to detect pitches: {}", err);
                        return;
                    }
                };
                let result = tracker.with_progress(Stage::Pitches, |progress| {
                    let profile = detector.harmonic_profile(
                        &samples,
                        sample_rate,
                        &progress.sub_range(0.0, 0.8),
                        &cancel,
                    )?;
                    publish(
                        &tracker.events,
                        AnalysisEvent::HarmonicProfileReady(profile.clone()),
                    );
                    detector.pitches(
                        &profile,
                        sample_rate,
                        &progress.sub_range(0.8, 1.0),
                        &cancel,
                    )
                });
                match result {
                    Some((pitches, segmented_pitches)) => {
                        log::info!("Pitch analysis finished: found {} pitches", pitches.len());
                        publish(
                            &tracker.events,
                            AnalysisEvent::PitchesReady {
                                pitches,
                                segmented_pitches,
                            },
                        );
                    }
                    None => log::info!("Pitch analysis got cancelled"),
                }
            }
        })?;

        Ok(())
    }

    /// Cancel all running analysis stages, waiting for their threads to finish.
    pub fn cancel(&mut self) {
        self.spectrogram_task.cancel();
        self.transient_task.cancel();
        self.pitch_task.cancel();
    }

    /// Wait until all running analysis stages finished or the timeout elapsed, without
    /// cancelling them.
    pub fn wait(&mut self, timeout: Duration) {
        self.spectrogram_task.wait(timeout);
        self.transient_task.wait(timeout);
        self.pitch_task.wait(timeout);
    }
}

fn publish(events: &Sender<AnalysisEvent>, event: AnalysisEvent) {
    if let Err(err) = events.send(event) {
        log::warn!("failed to send analysis event: {}", err);
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    use crate::PitchClass;

    fn sine_buffer(freq: f32, seconds: f32) -> Arc<SampleBuffer> {
        let sample_rate = 44100;
        let len = (sample_rate as f32 * seconds) as usize;
        let samples = (0..len)
            .map(|i| 0.5 * (2.0 * std::f32::consts::PI * freq * i as f32 / sample_rate as f32).sin())
            .collect::<Vec<_>>();
        // same signal on both channels
        let buffer = SampleBuffer::new(vec![samples.clone(), samples], sample_rate).unwrap();
        Arc::new(buffer)
    }

    #[test]
    fn analyze_buffer() -> Result<(), Error> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let mut analyzer = Analyzer::new(AnalyzerConfig::default(), sender)?;
        analyzer.process(Some(sine_buffer(440.0, 2.0)))?;
        analyzer.wait(AnalysisTask::JOIN_TIMEOUT);
        assert!(!analyzer.is_running());

        let events = receiver.try_iter().collect::<Vec<_>>();
        let mut max_progress = 0.0f64;
        let (mut spectrogram, mut transients, mut profile, mut pitches) = (None, None, None, None);
        for event in events {
            match event {
                AnalysisEvent::Progress(value) => {
                    assert!((0.0..=1.0).contains(&value));
                    max_progress = max_progress.max(value);
                }
                AnalysisEvent::SpectrogramReady(s) => spectrogram = Some(s),
                AnalysisEvent::TransientsReady(t) => transients = Some(t),
                AnalysisEvent::HarmonicProfileReady(p) => profile = Some(p),
                AnalysisEvent::PitchesReady { pitches: p, .. } => pitches = Some(p),
            }
        }
        assert_eq!(max_progress, 1.0);
        assert!(!spectrogram.unwrap().is_empty());
        assert_eq!(transients.unwrap().len(), 1);
        assert!(!profile.unwrap().is_empty());
        let pitches = pitches.unwrap();
        assert_eq!(pitches.get(PitchClass::A).len(), 1);
        Ok(())
    }

    #[test]
    fn nothing_loaded() -> Result<(), Error> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let mut analyzer = Analyzer::new(AnalyzerConfig::default(), sender)?;
        analyzer.process(None)?;
        assert!(!analyzer.is_running());
        assert!(receiver.try_recv().is_err());
        Ok(())
    }

    #[test]
    fn reanalysis_cancels_previous_run() -> Result<(), Error> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let mut analyzer = Analyzer::new(AnalyzerConfig::default(), sender)?;
        analyzer.process(Some(sine_buffer(440.0, 20.0)))?;
        analyzer.process(Some(sine_buffer(440.0, 1.0)))?;
        analyzer.wait(AnalysisTask::JOIN_TIMEOUT);
        assert!(!analyzer.is_running());

        // only results of the one second buffer get published
        let config = analyzer.config();
        let spectrogram_frames = config.spectrogram.frame_count(44100);
        let pitch_frames = config.pitch.framer_config().frame_count(44100);
        assert_ne!(pitch_frames, config.pitch.framer_config().frame_count(20 * 44100));

        let mut pitch_results = 0;
        for event in receiver.try_iter() {
            match event {
                AnalysisEvent::SpectrogramReady(spectrogram) => {
                    assert_eq!(spectrogram.len(), spectrogram_frames);
                }
                AnalysisEvent::HarmonicProfileReady(profile) => {
                    assert_eq!(profile.len(), pitch_frames);
                }
                AnalysisEvent::PitchesReady {
                    segmented_pitches, ..
                } => {
                    assert_eq!(segmented_pitches.len(), pitch_frames);
                    pitch_results += 1;
                }
                _ => {}
            }
        }
        assert_eq!(pitch_results, 1);
        Ok(())
    }
}
