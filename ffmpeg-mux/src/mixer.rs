//! Mixing several transcode sessions into one output session.
//!
//! Every source is decoded to the [`TranscodeOptions::raw`] profile. The
//! mixing task pulls one sample from each source per round, averages them
//! and appends the result to the mixed buffer, which is piped into the
//! output session as raw PCM:
//!
//! ```text
//! source session ─┐
//! source session ─┼─► [mixing task] ─► mixed buffer ─► output session ─► read
//! source session ─┘
//! ```

use std::{
    io,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use bytes::Bytes;
use tokio::{io::AsyncRead, sync::Notify, task::JoinHandle};
use tokio_util::{io::StreamReader, sync::CancellationToken};

use crate::{
    buffer::FrameBuffer,
    config::EncoderProgram,
    error::{MuxError, Result},
    options::{RawPcmFormat, SAMPLE_BYTES, TranscodeOptions},
    session::TranscodeSession,
    source::{CompletionCallback, MuxSource, SourceId, SourceInput},
    stats::TranscodeStats,
};

/// Bytes handed to the output encoder per read of the mixed buffer.
const MIXED_CHUNK: usize = 8192;

pub struct MuxEngine {
    inner: Arc<EngineInner>,
    output_options: TranscodeOptions,
    program: EncoderProgram,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct EngineInner {
    state: Mutex<EngineState>,
    error: Mutex<Option<MuxError>>,
    /// wakes the output pump when mixed samples arrive or the buffer closes
    notify: Notify,
    /// wakes the mixing task when the output pump takes mixed bytes
    drained: Notify,
    /// mixed bytes held before the mixing task waits for the output pump
    mixed_limit: usize,
    cancel: CancellationToken,
}

#[derive(Default)]
struct EngineState {
    sources: Vec<MuxSource>,
    mixed: FrameBuffer,
    mixed_closed: bool,
    output: Option<Arc<TranscodeSession>>,
    closed: bool,
}

impl EngineState {
    fn accepts_sources(&self) -> bool {
        !self.closed && !self.mixed_closed
    }
}

impl MuxEngine {
    /// Engine whose mixed stream is encoded with `output_options`.
    pub fn new(output_options: TranscodeOptions) -> Result<Self> {
        Self::with_program(output_options, EncoderProgram::default())
    }

    /// Like [`MuxEngine::new`], launching `program` for every session.
    pub fn with_program(output_options: TranscodeOptions, program: EncoderProgram) -> Result<Self> {
        output_options.validate()?;
        // as much PCM as a full output queue holds
        let mixed_limit = TranscodeOptions::raw()
            .frame_bytes()
            .saturating_mul(output_options.buffered_frames)
            .max(MIXED_CHUNK);
        Ok(Self {
            inner: Arc::new(EngineInner {
                state: Mutex::new(EngineState::default()),
                error: Mutex::new(None),
                notify: Notify::new(),
                drained: Notify::new(),
                mixed_limit,
                cancel: CancellationToken::new(),
            }),
            output_options,
            program,
            task: Mutex::new(None),
        })
    }

    pub fn add_source(&self, input: impl Into<SourceInput>) -> Result<SourceId> {
        self.add_source_with(input, 1.0, None)
    }

    /// Starts decoding `input` and queues it for mixing.
    pub fn add_source_with(
        &self,
        input: impl Into<SourceInput>,
        volume: f32,
        callback: Option<CompletionCallback>,
    ) -> Result<SourceId> {
        let input = input.into();
        if let SourceInput::File(path) = &input {
            if path.as_os_str().is_empty() {
                return Err(MuxError::InvalidSourceType);
            }
        }

        if !self.inner.accepts_sources() {
            return Err(MuxError::Closed);
        }

        let kind = input.kind();
        let session = TranscodeSession::builder(input, TranscodeOptions::raw())
            .program(self.program.clone())
            .start()?;
        let source = MuxSource::new(session, volume, callback);
        let id = source.id;

        let mut state = self.inner.state();
        if !state.accepts_sources() {
            drop(state);
            let session = source.session;
            tokio::spawn(async move { session.cleanup().await });
            return Err(MuxError::Closed);
        }
        state.sources.push(source);
        log::info!("add {} source {}, {} sources", kind, id, state.sources.len());
        Ok(id)
    }

    /// Removes a source and tears down its session.
    pub async fn remove_source(&self, id: SourceId) -> Result<()> {
        let source = {
            let mut state = self.inner.state();
            let pos = state
                .sources
                .iter()
                .position(|s| s.id == id)
                .ok_or(MuxError::SourceNotFound(id))?;
            state.sources.remove(pos)
        };
        log::info!("remove source {}", id);
        source.session.cleanup().await;
        Ok(())
    }

    pub fn set_volume(&self, id: SourceId, volume: f32) -> Result<()> {
        let mut state = self.inner.state();
        let source = state
            .sources
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(MuxError::SourceNotFound(id))?;
        source.volume = volume;
        Ok(())
    }

    pub fn volume(&self, id: SourceId) -> Result<f32> {
        let state = self.inner.state();
        state
            .sources
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.volume)
            .ok_or(MuxError::SourceNotFound(id))
    }

    /// Replaces the callback run when the source ends without error.
    pub fn set_callback<F>(&self, id: SourceId, callback: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.state();
        let source = state
            .sources
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(MuxError::SourceNotFound(id))?;
        source.callback = Some(Box::new(callback));
        Ok(())
    }

    /// Current sources in insertion order.
    pub fn sources(&self) -> Vec<SourceId> {
        self.inner.state().sources.iter().map(|s| s.id).collect()
    }

    /// Launches the output session and the mixing task. Calling it again is
    /// a no-op.
    pub fn start(&self) -> Result<()> {
        // held for the whole call so concurrent starts launch one output
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        {
            let state = self.inner.state();
            if state.closed {
                return Err(MuxError::Closed);
            }
            if state.output.is_some() {
                return Ok(());
            }
        }

        let input = SourceInput::stream(mixed_stream(Arc::downgrade(&self.inner)));
        let output = TranscodeSession::builder(input, self.output_options.clone())
            .program(self.program.clone())
            .raw_input(RawPcmFormat::from(&TranscodeOptions::raw()))
            .start()?;
        let output = Arc::new(output);

        {
            let mut state = self.inner.state();
            if state.closed {
                drop(state);
                tokio::spawn(async move { output.cleanup().await });
                return Err(MuxError::Closed);
            }
            state.output = Some(Arc::clone(&output));
        }

        log::info!("mux engine started");
        let inner = Arc::clone(&self.inner);
        *task = Some(tokio::spawn(async move { inner.mix(output).await }));
        Ok(())
    }

    /// Reads encoded output. Same contract as [`TranscodeSession::read`].
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let output = {
            let state = self.inner.state();
            if state.closed {
                return Err(MuxError::Closed);
            }
            state.output.clone().ok_or(MuxError::NotStarted)?
        };
        let n = output.read(buf).await?;
        if n == 0 {
            // settle the exit status so error() reflects how the output ended
            output.wait().await;
        }
        Ok(n)
    }

    /// First error recorded while mixing, or the output session's failure.
    pub fn error(&self) -> Option<MuxError> {
        self.inner.error().or_else(|| {
            self.inner
                .state()
                .output
                .as_ref()
                .and_then(|output| output.error())
        })
    }

    /// Progress of the output encoder.
    pub fn stats(&self) -> TranscodeStats {
        self.inner
            .state()
            .output
            .as_ref()
            .map(|output| output.stats())
            .unwrap_or_default()
    }

    /// Stops every session and the mixing task. Safe to call repeatedly.
    pub async fn cleanup(&self) {
        let (output, sources) = {
            let mut state = self.inner.state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.mixed_closed = true;
            state.mixed.clear();
            (state.output.take(), std::mem::take(&mut state.sources))
        };
        if let Some(error) = output.as_ref().and_then(|output| output.error()) {
            self.inner.record(error);
        }
        log::info!("mux engine cleanup, {} sources left", sources.len());

        self.inner.cancel.cancel();
        self.inner.notify.notify_one();

        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::error!("mixing task failed: {}", e);
            }
        }

        if let Some(output) = output {
            output.cleanup().await;
        }
        for source in sources {
            source.session.cleanup().await;
        }
    }
}

#[cfg(test)]
impl MuxEngine {
    /// Output session first, then sources in insertion order.
    pub(crate) fn sessions(&self) -> Vec<Arc<TranscodeSession>> {
        let state = self.inner.state();
        state
            .output
            .iter()
            .cloned()
            .chain(state.sources.iter().map(|s| Arc::clone(&s.session)))
            .collect()
    }

    pub(crate) fn mixed_len(&self) -> usize {
        self.inner.state().mixed.len()
    }

    pub(crate) fn mixed_limit(&self) -> usize {
        self.inner.mixed_limit
    }
}

impl Drop for MuxEngine {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

/// Outcome of pulling one sample from a source.
enum Pull {
    Sample(i16),
    /// end of stream, with the session error if it failed
    Ended(Option<MuxError>),
}

impl EngineInner {
    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn accepts_sources(&self) -> bool {
        self.state().accepts_sources()
    }

    fn error(&self) -> Option<MuxError> {
        self.error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, error: MuxError) {
        let mut slot = self.error.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    async fn mix(&self, output: Arc<TranscodeSession>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = self.wait_for_room(&output) => {}
            }

            if output.phase().is_terminal() {
                match output.error() {
                    Some(error) => {
                        log::error!("output session failed: {}", error);
                        self.record(error);
                    }
                    None => log::warn!("output session ended before the mixed stream"),
                }
                break;
            }

            let snapshot: Vec<(SourceId, Arc<TranscodeSession>, f32)> = self
                .state()
                .sources
                .iter()
                .map(|s| (s.id, Arc::clone(&s.session), s.volume))
                .collect();
            if snapshot.is_empty() {
                log::info!("no sources left, closing mixed stream");
                break;
            }

            let mut samples = Vec::with_capacity(snapshot.len());
            let mut ended = Vec::new();
            for (id, session, volume) in &snapshot {
                let pulled = tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    pulled = pull(session) => pulled,
                };
                match pulled {
                    Pull::Sample(sample) => samples.push((sample, *volume)),
                    Pull::Ended(error) => ended.push((*id, error)),
                }
            }
            drop(snapshot);

            if !ended.is_empty() {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = self.retire(ended) => {}
                }
            }

            if let Some(mixed) = mix_samples(&samples) {
                self.push(mixed);
            }
        }

        self.close_mixed();
    }

    /// Drops ended sources still present, running callbacks and cleanup
    /// without the lock held.
    async fn retire(&self, ended: Vec<(SourceId, Option<MuxError>)>) {
        let removed: Vec<(MuxSource, Option<MuxError>)> = {
            let mut state = self.state();
            ended
                .into_iter()
                .filter_map(|(id, error)| {
                    let pos = state.sources.iter().position(|s| s.id == id)?;
                    Some((state.sources.remove(pos), error))
                })
                .collect()
        };

        for (mut source, error) in removed {
            match error {
                Some(error) => {
                    log::warn!("source {} failed: {}", source.id, error);
                    self.record(MuxError::Source {
                        id: source.id,
                        error: Box::new(error),
                    });
                }
                None => {
                    log::info!("source {} finished", source.id);
                    if let Some(callback) = source.callback.take() {
                        callback();
                    }
                }
            }
            source.session.cleanup().await;
        }
    }

    /// Waits until the mixed buffer is below its limit or the output
    /// session has ended.
    async fn wait_for_room(&self, output: &TranscodeSession) {
        loop {
            let drained = self.drained.notified();
            if self.state().mixed.len() < self.mixed_limit {
                return;
            }
            tokio::select! {
                _ = drained => {}
                _ = output.wait() => return,
            }
        }
    }

    fn push(&self, sample: i16) {
        {
            let mut state = self.state();
            if state.mixed_closed {
                return;
            }
            if let Err(e) = state.mixed.write(&sample.to_le_bytes()) {
                log::warn!("write mixed sample: {}", e);
                return;
            }
        }
        self.notify.notify_one();
    }

    fn close_mixed(&self) {
        self.state().mixed_closed = true;
        self.notify.notify_one();
    }
}

async fn pull(session: &TranscodeSession) -> Pull {
    let mut sample = [0u8; SAMPLE_BYTES];
    match session.read(&mut sample).await {
        Ok(SAMPLE_BYTES) => Pull::Sample(i16::from_le_bytes(sample)),
        // a dangling half sample counts as end of stream
        Ok(_) => {
            session.wait().await;
            Pull::Ended(session.error())
        }
        Err(e) => Pull::Ended(Some(e)),
    }
}

/// Mean of the volume-scaled samples, truncated and saturated to `i16`.
/// `None` when there is nothing to mix.
///
/// This averages rather than sums, so two sources at full volume come out
/// at the level of one.
pub fn mix_samples(samples: &[(i16, f32)]) -> Option<i16> {
    if samples.is_empty() {
        return None;
    }
    let total: f64 = samples
        .iter()
        .map(|(sample, volume)| *sample as f64 * *volume as f64)
        .sum();
    Some((total / samples.len() as f64) as i16)
}

/// Input of the output session: mixed bytes as they are produced, ending
/// once the mixed buffer is closed and drained.
fn mixed_stream(engine: Weak<EngineInner>) -> impl AsyncRead + Send + Unpin + 'static {
    let chunks = futures::stream::unfold(engine, |engine| async move {
        loop {
            let inner = engine.upgrade()?;
            let notified = inner.notify.notified();
            {
                let mut state = inner.state();
                if !state.mixed.is_empty() {
                    let chunk = state.mixed.split_to(MIXED_CHUNK);
                    drop(state);
                    inner.drained.notify_one();
                    return Some((Ok::<Bytes, io::Error>(chunk), engine));
                }
                if state.mixed_closed {
                    return None;
                }
            }
            tokio::select! {
                _ = notified => {}
                _ = inner.cancel.cancelled() => return None,
            }
        }
    });
    StreamReader::new(Box::pin(chunks))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mix_single_sample() {
        assert_eq!(mix_samples(&[(1200, 1.0)]), Some(1200));
        assert_eq!(mix_samples(&[]), None);
    }

    #[test]
    fn test_mix_is_mean_of_scaled_samples() {
        assert_eq!(mix_samples(&[(100, 1.0), (300, 1.0)]), Some(200));
        assert_eq!(mix_samples(&[(100, 1.0), (200, 1.0), (600, 1.0)]), Some(300));
        assert_eq!(mix_samples(&[(1000, 0.5), (0, 1.0)]), Some(250));
    }

    #[test]
    fn test_mix_truncates_toward_zero() {
        assert_eq!(mix_samples(&[(1, 1.0), (2, 1.0)]), Some(1));
        assert_eq!(mix_samples(&[(-1, 1.0), (-2, 1.0)]), Some(-1));
    }

    #[test]
    fn test_mix_saturates() {
        assert_eq!(mix_samples(&[(i16::MAX, 4.0)]), Some(i16::MAX));
        assert_eq!(mix_samples(&[(i16::MIN, 4.0), (i16::MIN, 4.0)]), Some(i16::MIN));
    }

    #[test]
    fn test_new_rejects_invalid_output_options() {
        let options = TranscodeOptions {
            volume: 600,
            ..TranscodeOptions::raw()
        };
        assert!(matches!(
            MuxEngine::new(options),
            Err(MuxError::InvalidOption { field: "volume", .. })
        ));
    }
}

#[cfg(all(test, unix))]
#[path = "mixer_test.rs"]
mod mixer_test;
