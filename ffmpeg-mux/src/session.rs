//! One encoder process and the frames it produces.
//!
//! ```text
//!  input (file / stream) ──► [input pump] ──► ffmpeg stdin
//!                                                │
//!             ffmpeg stderr ◄────────────────────┤
//!                  │                             ▼
//!      [diagnostic reader]               ffmpeg stdout
//!        stats, messages                       │
//!                                     [frame assembly] ──► bounded queue ──► read_frame / read
//! ```
//!
//! The frame queue is the only backpressure point: when it is full the
//! assembly task stops draining stdout, which stalls the encoder on its
//! pipe.

use std::{
    collections::VecDeque,
    process::Stdio,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::StreamExt;
use tokio::{
    process::{Child, ChildStderr, ChildStdin, ChildStdout, Command},
    sync::watch,
    task::JoinHandle,
};
use tokio_util::{codec::FramedRead, sync::CancellationToken};

use crate::{
    buffer::FrameBuffer,
    config::EncoderProgram,
    error::{MuxError, Result},
    frame::{Frame, FrameCodec, FrameReceiver, FrameSender},
    options::{InputArg, RawPcmFormat, TranscodeOptions},
    source::{BoxedReader, SourceInput},
    stats::{DiagnosticCodec, TranscodeStats, parse_progress},
};

const MAX_DIAGNOSTIC_LINES: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionPhase {
    Idle,
    Running,
    /// encoder output exhausted, waiting for the process to exit
    Draining,
    Stopped,
    Failed,
}

impl SessionPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionPhase::Stopped | SessionPhase::Failed)
    }
}

pub struct SessionBuilder {
    input: SourceInput,
    options: TranscodeOptions,
    program: EncoderProgram,
    raw_input: Option<RawPcmFormat>,
}

impl SessionBuilder {
    /// Encoder to launch instead of the configured ffmpeg.
    pub fn program(mut self, program: EncoderProgram) -> Self {
        self.program = program;
        self
    }

    /// Declares a stream input as headerless s16le PCM.
    pub fn raw_input(mut self, format: RawPcmFormat) -> Self {
        self.raw_input = Some(format);
        self
    }

    /// Validates the options and launches the encoder.
    ///
    /// Option and input errors are returned here and nothing is spawned.
    /// A failed spawn instead yields a session already in
    /// [`SessionPhase::Failed`] whose queue is closed.
    pub fn start(self) -> Result<TranscodeSession> {
        self.options.validate()?;
        if let SourceInput::File(path) = &self.input {
            if path.as_os_str().is_empty() {
                return Err(MuxError::InvalidSourceType);
            }
        }

        let (frame_tx, frame_rx) = tokio::sync::mpsc::channel(self.options.buffered_frames);
        let shared = Arc::new(SessionShared::new());

        let (args, reader) = match self.input {
            SourceInput::File(path) => (self.options.to_args(&InputArg::File(&path)), None),
            SourceInput::Stream(reader) => (
                self.options.to_args(&InputArg::Pipe(self.raw_input)),
                Some(reader),
            ),
        };

        let mut command = Command::new(self.program.program());
        command
            .args(self.program.leading_args())
            .args(&args)
            .stdin(if reader.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        log::debug!(
            "spawn encoder: {} {}",
            self.program.program().display(),
            args.join(" ")
        );

        let task = match command.spawn() {
            Ok(child) => {
                log::info!("encoder started, pid {:?}", child.id());
                shared.set_phase(SessionPhase::Running);
                let frame_bytes = self.options.frame_bytes();
                let shared_clone = Arc::clone(&shared);
                Some(tokio::spawn(async move {
                    run(child, reader, frame_tx, shared_clone, frame_bytes).await
                }))
            }
            Err(e) => {
                log::error!(
                    "failed to spawn {}: {}",
                    self.program.program().display(),
                    e
                );
                shared.fail(MuxError::Spawn {
                    program: self.program.program().display().to_string(),
                    source: Arc::new(e),
                });
                drop(frame_tx);
                None
            }
        };

        Ok(TranscodeSession {
            options: self.options,
            shared,
            frames: tokio::sync::Mutex::new(frame_rx),
            unread: tokio::sync::Mutex::new(FrameBuffer::new()),
            task: Mutex::new(task),
            closed: AtomicBool::new(false),
        })
    }
}

/// A running encoder process exposed as a pull-based frame and byte
/// reader. Must be created inside a tokio runtime.
pub struct TranscodeSession {
    options: TranscodeOptions,
    shared: Arc<SessionShared>,
    frames: tokio::sync::Mutex<FrameReceiver>,
    unread: tokio::sync::Mutex<FrameBuffer>,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl TranscodeSession {
    pub fn new(input: SourceInput, options: TranscodeOptions) -> Result<Self> {
        Self::builder(input, options).start()
    }

    pub fn builder(input: SourceInput, options: TranscodeOptions) -> SessionBuilder {
        SessionBuilder {
            input,
            options,
            program: EncoderProgram::default(),
            raw_input: None,
        }
    }

    pub fn options(&self) -> &TranscodeOptions {
        &self.options
    }

    pub fn frame_duration(&self) -> Duration {
        self.options.frame_duration()
    }

    pub fn phase(&self) -> SessionPhase {
        *self.shared.phase.borrow()
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self.phase(),
            SessionPhase::Running | SessionPhase::Draining
        )
    }

    /// Waits for the session to reach `Stopped` or `Failed`.
    pub async fn wait(&self) -> SessionPhase {
        let mut rx = self.shared.phase.subscribe();
        let phase = match rx.wait_for(SessionPhase::is_terminal).await {
            Ok(phase) => *phase,
            Err(_) => self.phase(),
        };
        phase
    }

    /// Kills the encoder. No-op unless it is running.
    pub fn stop(&self) {
        if !self.is_running() {
            return;
        }
        if !self.shared.stop_requested.swap(true, Ordering::AcqRel) {
            log::info!("stopping encoder");
        }
        self.shared.cancel.cancel();
    }

    /// Next frame in production order, `None` once the queue is closed and
    /// empty.
    pub async fn read_frame(&self) -> Option<Frame> {
        let mut frames = self.frames.lock().await;
        frames.recv().await
    }

    /// Fills `buf` from buffered bytes and whole frames. Short only at end
    /// of stream; `Ok(0)` once everything has been read.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Err(MuxError::EmptyReadBuffer);
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(MuxError::Closed);
        }

        let mut unread = self.unread.lock().await;
        while unread.len() < buf.len() {
            match self.read_frame().await {
                Some(frame) => {
                    unread.write(frame.data())?;
                }
                None => break,
            }
        }
        unread.read(buf)
    }

    pub fn stats(&self) -> TranscodeStats {
        self.shared.state().stats.unwrap_or_default()
    }

    pub fn error(&self) -> Option<MuxError> {
        self.shared.state().error.clone()
    }

    /// Recent non-progress lines the encoder wrote to stderr.
    pub fn diagnostics(&self) -> Vec<String> {
        self.shared.state().diagnostics.iter().cloned().collect()
    }

    pub fn frames_produced(&self) -> u64 {
        self.shared.frames_produced.load(Ordering::Relaxed)
    }

    /// Stops the encoder, drains the queue and joins the session tasks.
    /// Safe to call repeatedly; later reads fail with `Closed`.
    pub async fn cleanup(&self) {
        self.stop();

        {
            let mut frames = self.frames.lock().await;
            while frames.recv().await.is_some() {}
        }

        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::error!("session task failed: {}", e);
            }
        }

        self.unread.lock().await.clear();
        self.closed.store(true, Ordering::Release);
    }
}

impl Drop for TranscodeSession {
    fn drop(&mut self) {
        self.shared.stop_requested.store(true, Ordering::Release);
        self.shared.cancel.cancel();
    }
}

struct SessionShared {
    phase: watch::Sender<SessionPhase>,
    cancel: CancellationToken,
    stop_requested: AtomicBool,
    frames_produced: AtomicU64,
    state: Mutex<SessionState>,
}

#[derive(Default)]
struct SessionState {
    error: Option<MuxError>,
    stats: Option<TranscodeStats>,
    diagnostics: VecDeque<String>,
}

impl SessionShared {
    fn new() -> Self {
        let (phase, _) = watch::channel(SessionPhase::Idle);
        Self {
            phase,
            cancel: CancellationToken::new(),
            stop_requested: AtomicBool::new(false),
            frames_produced: AtomicU64::new(0),
            state: Mutex::new(SessionState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Terminal phases are final.
    fn set_phase(&self, next: SessionPhase) {
        self.phase.send_if_modified(|phase| {
            if phase.is_terminal() || *phase == next {
                return false;
            }
            log::debug!("session phase {:?} -> {:?}", phase, next);
            *phase = next;
            true
        });
    }

    fn fail(&self, error: MuxError) {
        {
            let mut state = self.state();
            if state.error.is_none() {
                state.error = Some(error);
            }
        }
        self.set_phase(SessionPhase::Failed);
    }

    fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    fn set_stats(&self, stats: TranscodeStats) {
        self.state().stats = Some(stats);
    }

    fn push_diagnostic(&self, line: String) {
        let mut state = self.state();
        if state.diagnostics.len() == MAX_DIAGNOSTIC_LINES {
            state.diagnostics.pop_front();
        }
        state.diagnostics.push_back(line);
    }
}

/// Supervises one encoder process until it exits.
async fn run(
    mut child: Child,
    input: Option<BoxedReader>,
    frames: FrameSender,
    shared: Arc<SessionShared>,
    frame_bytes: usize,
) {
    let pid = child.id();

    let pump = match (input, child.stdin.take()) {
        (Some(reader), Some(stdin)) => Some(tokio::spawn(pump_input(reader, stdin))),
        _ => None,
    };
    let diagnostics = child
        .stderr
        .take()
        .map(|stderr| tokio::spawn(read_diagnostics(stderr, Arc::clone(&shared))));

    match child.stdout.take() {
        Some(stdout) => assemble_frames(stdout, frames, frame_bytes, &shared).await,
        None => drop(frames),
    }
    shared.set_phase(SessionPhase::Draining);

    let status = tokio::select! {
        status = child.wait() => status,
        _ = shared.cancel.cancelled() => {
            if let Err(e) = child.start_kill() {
                log::debug!("kill encoder {:?}: {}", pid, e);
            }
            child.wait().await
        }
    };

    if let Some(pump) = pump {
        pump.abort();
        let _ = pump.await;
    }
    if let Some(diagnostics) = diagnostics {
        if shared.stop_requested() {
            diagnostics.abort();
        }
        let _ = diagnostics.await;
    }

    match status {
        Ok(status) if status.success() => {
            log::info!("encoder {:?} finished", pid);
            shared.set_phase(SessionPhase::Stopped);
        }
        Ok(status) if shared.stop_requested() => {
            log::info!("encoder {:?} stopped ({})", pid, status);
            shared.set_phase(SessionPhase::Stopped);
        }
        Ok(status) => {
            log::error!("encoder {:?} exited with {}", pid, status);
            shared.fail(MuxError::ProcessFailed(status));
        }
        Err(e) => {
            log::error!("wait for encoder {:?}: {}", pid, e);
            shared.fail(e.into());
        }
    }
}

async fn assemble_frames(
    stdout: ChildStdout,
    frames: FrameSender,
    frame_bytes: usize,
    shared: &SessionShared,
) {
    let mut reader = FramedRead::new(stdout, FrameCodec::new(frame_bytes));
    loop {
        let frame = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            next = reader.next() => match next {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    log::warn!("read encoder output: {}", e);
                    break;
                }
                None => break,
            },
        };

        log::trace!("assembled {}", frame);
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            sent = frames.send(frame) => {
                if sent.is_err() {
                    break;
                }
            }
        }
        shared.frames_produced.fetch_add(1, Ordering::Relaxed);
    }
}

async fn read_diagnostics(stderr: ChildStderr, shared: Arc<SessionShared>) {
    let mut lines = FramedRead::new(stderr, DiagnosticCodec);
    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                log::debug!("read encoder stderr: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match parse_progress(&line) {
            Some(stats) => shared.set_stats(stats),
            None => {
                log::trace!("encoder: {}", line);
                shared.push_diagnostic(line);
            }
        }
    }
}

async fn pump_input(mut reader: BoxedReader, mut stdin: ChildStdin) {
    match tokio::io::copy(&mut reader, &mut stdin).await {
        Ok(n) => log::debug!("input pump finished after {} bytes", n),
        // the encoder may exit before consuming all of its input
        Err(e) => log::debug!("input pump stopped: {}", e),
    }
}

#[cfg(all(test, unix))]
#[path = "session_test.rs"]
mod session_test;
