//! Session lifecycle and event routing.
//!
//! `SessionController` owns everything a live session needs: the output scheduler,
//! the input stream, the transport handle and an in-flight handshake. All of it is
//! driven from one event loop: capture windows, inbound server events, playback
//! completions, meter ticks and UI commands are turned into [`Event`]s and handled
//! one at a time, so no two handlers ever interleave.
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──handshake ok──▶ Connected
//!      ▲                        │                           │
//!      │                        └──── failure ───▶ Error ◀──┘ (transport error)
//!      └──────── teardown ─────────────────────────┘  (close notice, mode switch)
//! ```

use std::time::Duration;

use anyhow::Context;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::capture_loop::CaptureLoop;
use super::state::{AppMode, Command, ConnectionState, UiSnapshot};
use crate::audio::encoder::{DEFAULT_PLAYBACK_RATE, decode_payload, parse_pcm_rate};
use crate::audio::{AudioBackend, InputHandle, PlaybackScheduler, PlaybackSink, SpectrumAnalyser, UnitId, VolumeMeter};
use crate::error::{SessionError, TransportError};
use crate::live::{Connector, ServerEvent, SessionHandle, Setup};

/// Capture windows buffered between the drain thread and the event loop.
const WINDOW_QUEUE_SIZE: usize = 8;

/// Timing parameters of a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub sample_rate: u32,
    pub window: usize,
    /// Rate requested from the output device, also assumed for inbound audio whose
    /// MIME type declares none.
    pub playback_rate: u32,
    pub meter_interval: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            window: 4096,
            playback_rate: DEFAULT_PLAYBACK_RATE,
            meter_interval: Duration::from_millis(50),
        }
    }
}

/// Per-session resources, created in `connect()` and dropped only by `release()`.
struct LiveSession<B: AudioBackend> {
    input: B::Input,
    scheduler: PlaybackScheduler<B::Output>,
    windows: Option<mpsc::Receiver<Vec<f32>>>,
    completions: Option<mpsc::UnboundedReceiver<UnitId>>,
    session: Option<SessionHandle>, // Set once the handshake succeeds
    capture: CaptureLoop,
    output_analyser: SpectrumAnalyser,
    tap: Vec<f32>,
}

enum Event {
    Command(Option<Command>),
    Handshake(Result<SessionHandle, TransportError>),
    Server(ServerEvent),
    Window(Option<Vec<f32>>),
    Finished(Option<UnitId>),
    MeterTick,
}

pub struct SessionController<B: AudioBackend, C: Connector> {
    backend: B,
    connector: C,
    setup: Setup,
    options: SessionOptions,
    state: ConnectionState,
    mode: AppMode,
    error: Option<&'static str>,
    live: Option<LiveSession<B>>,
    pending: Option<JoinHandle<Result<SessionHandle, TransportError>>>,
    input_volume: f32,
    output_meter: VolumeMeter,
    meter_tick: Option<Interval>,
    ui: watch::Sender<UiSnapshot>,
}

impl<B: AudioBackend, C: Connector> SessionController<B, C> {
    pub fn new(backend: B, connector: C, setup: Setup, options: SessionOptions, mode: AppMode) -> Self {
        let (ui, _) = watch::channel(UiSnapshot { mode, ..UiSnapshot::default() });
        Self {
            backend,
            connector,
            setup,
            options,
            state: ConnectionState::Disconnected,
            mode,
            error: None,
            live: None,
            pending: None,
            input_volume: 0.0,
            output_meter: VolumeMeter::new(),
            meter_tick: None,
            ui,
        }
    }

    /// Receiver for UI snapshots; always holds the latest one.
    pub fn subscribe(&self) -> watch::Receiver<UiSnapshot> {
        self.ui.subscribe()
    }

    pub fn snapshot(&self) -> UiSnapshot {
        UiSnapshot {
            state: self.state,
            mode: self.mode,
            input_volume: self.input_volume,
            output_volume: self.output_meter.level(),
            error: self.error,
        }
    }

    /// Process commands and session events until the command channel closes.
    pub async fn run(&mut self, mut commands: mpsc::Receiver<Command>) {
        while self.step(&mut commands).await {}
        self.teardown();
    }

    /// Wait for and handle exactly one event. Returns `false` once commands are closed.
    pub async fn step(&mut self, commands: &mut mpsc::Receiver<Command>) -> bool {
        let event = self.next_event(commands).await;
        self.handle(event)
    }

    async fn next_event(&mut self, commands: &mut mpsc::Receiver<Command>) -> Event {
        let Self { pending, live, meter_tick, .. } = self;
        let (session, windows, completions) = match live.as_mut() {
            Some(live) => (live.session.as_mut(), live.windows.as_mut(), live.completions.as_mut()),
            None => (None, None, None),
        };

        tokio::select! {
            biased;
            command = commands.recv() => Event::Command(command),
            result = join_handshake(pending) => Event::Handshake(result),
            event = recv_server(session) => Event::Server(event),
            unit = recv_completion(completions) => Event::Finished(unit),
            window = recv_window(windows) => Event::Window(window),
            _ = tick(meter_tick) => Event::MeterTick,
        }
    }

    fn handle(&mut self, event: Event) -> bool {
        match event {
            Event::Command(None) => return false,
            Event::Command(Some(command)) => self.on_command(command),
            Event::Handshake(result) => self.on_handshake(result),
            Event::Server(event) => self.on_server_event(event),
            Event::Window(Some(window)) => self.on_window(&window),
            Event::Window(None) => {
                if let Some(live) = self.live.as_mut() {
                    live.windows = None;
                }
            }
            Event::Finished(Some(id)) => {
                if let Some(live) = self.live.as_mut() {
                    live.scheduler.complete(id);
                }
            }
            Event::Finished(None) => {
                if let Some(live) = self.live.as_mut() {
                    live.completions = None;
                }
            }
            Event::MeterTick => self.on_meter_tick(),
        }
        true
    }

    pub fn on_command(&mut self, command: Command) {
        debug!("Command: {:?}", command);
        match command {
            Command::Connect => self.connect(),
            Command::Teardown => self.teardown(),
            Command::SwitchMode(mode) => self.switch_mode(mode),
        }
    }

    /// Start a session: credentials, output device, input device, then the handshake.
    ///
    /// Only valid in voice mode from `Disconnected` or `Error`; ignored otherwise.
    pub fn connect(&mut self) {
        if self.mode != AppMode::Voice {
            debug!("Connect ignored in {} mode", self.mode);
            return;
        }
        if !self.state.can_connect() {
            debug!("Connect ignored while {}", self.state);
            return;
        }

        // Leftovers from a failed attempt must be gone before new devices are opened
        self.release();
        self.error = None;
        self.set_state(ConnectionState::Connecting);

        if let Err(e) = self.connector.preflight() {
            self.fail(e.into());
            return;
        }

        match self.acquire() {
            Ok(live) => self.live = Some(live),
            Err(e) => {
                self.fail(SessionError::Acquisition(e));
                return;
            }
        }

        info!("Connecting to live session ({})", self.setup.model);
        self.pending = Some(tokio::spawn(self.connector.connect(self.setup.clone())));
    }

    fn acquire(&mut self) -> anyhow::Result<LiveSession<B>> {
        let (completions_tx, completions) = mpsc::unbounded_channel();
        let output = self
            .backend
            .open_output(self.options.playback_rate, completions_tx)
            .context("Failed to acquire output device")?;
        let mut scheduler = PlaybackScheduler::new(output);

        let (windows_tx, windows) = mpsc::channel(WINDOW_QUEUE_SIZE);
        let input = match self.backend.open_input(self.options.sample_rate, self.options.window, windows_tx) {
            Ok(input) => input,
            Err(e) => {
                scheduler.teardown();
                return Err(e.context("Failed to acquire input device"));
            }
        };

        Ok(LiveSession {
            input,
            scheduler,
            windows: Some(windows),
            completions: Some(completions),
            session: None,
            capture: CaptureLoop::new(self.options.sample_rate),
            output_analyser: SpectrumAnalyser::new(),
            tap: Vec::with_capacity(4096),
        })
    }

    fn on_handshake(&mut self, result: Result<SessionHandle, TransportError>) {
        let session = match result {
            Ok(session) => session,
            Err(e) if self.state == ConnectionState::Connecting => {
                self.fail(e.into());
                return;
            }
            Err(e) => {
                debug!("Stale handshake failure ignored: {}", e);
                return;
            }
        };

        if self.state != ConnectionState::Connecting {
            debug!("Handshake completed after teardown, closing session {}", session.id());
            session.close();
            return;
        }
        let Some(live) = self.live.as_mut() else {
            session.close();
            return;
        };

        if let Err(e) = live.input.start() {
            session.close();
            self.fail(SessionError::Acquisition(e));
            return;
        }

        info!("Live session {} ready, streaming microphone", session.id());
        live.session = Some(session);

        let period = self.options.meter_interval;
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.meter_tick = Some(interval);

        self.set_state(ConnectionState::Connected);
    }

    fn on_server_event(&mut self, event: ServerEvent) {
        if self.state != ConnectionState::Connected {
            debug!("Server event ignored while {}: {:?}", self.state, event);
            return;
        }
        let Some(live) = self.live.as_mut() else {
            return;
        };

        match event {
            ServerEvent::Interrupted => {
                info!("Interrupted, flushing {} queued unit(s)", live.scheduler.active().len());
                live.scheduler.flush();
            }
            ServerEvent::Audio { mime_type, data } => {
                let rate = parse_pcm_rate(&mime_type).unwrap_or(self.options.playback_rate);
                match decode_payload(&data, rate) {
                    Ok(buffer) => {
                        live.scheduler.schedule(&buffer);
                    }
                    Err(e) => warn!("Dropping undecodable audio payload ({}): {}", mime_type, e),
                }
            }
            ServerEvent::TurnComplete => debug!("Turn complete"),
            ServerEvent::GoAway { time_left } => {
                warn!("Server is going away (time left: {})", time_left.as_deref().unwrap_or("unknown"));
            }
            ServerEvent::SetupComplete => debug!("Duplicate setupComplete ignored"),
            ServerEvent::Closed { reason } => {
                info!("Session closed by server{}", reason.map(|r| format!(": {r}")).unwrap_or_default());
                self.teardown();
            }
            ServerEvent::Error(message) => self.fail(TransportError::Remote(message).into()),
        }
    }

    fn on_window(&mut self, window: &[f32]) {
        let Some(live) = self.live.as_mut() else {
            return;
        };
        if let Some(volume) = live.capture.tick(window, live.session.as_ref()) {
            self.input_volume = volume;
        }
    }

    fn on_meter_tick(&mut self) {
        let Some(live) = self.live.as_mut() else {
            return;
        };
        if let Some(sink) = live.scheduler.sink_mut() {
            sink.drain_tap(&mut live.tap);
        }
        live.output_analyser.push(&live.tap);
        live.tap.clear();
        self.output_meter.sample(&live.output_analyser.snapshot());
        self.publish();
    }

    /// Leaving voice mode ends any live or pending session; entering it never connects.
    pub fn switch_mode(&mut self, mode: AppMode) {
        if mode == self.mode {
            return;
        }
        info!("Switching to {} mode", mode);
        if mode != AppMode::Voice && matches!(self.state, ConnectionState::Connected | ConnectionState::Connecting) {
            self.teardown();
        }
        self.mode = mode;
        self.publish();
    }

    /// End the session from any state. Safe to call repeatedly.
    pub fn teardown(&mut self) {
        self.release();
        self.error = None;
        self.set_state(ConnectionState::Disconnected);
    }

    fn fail(&mut self, err: SessionError) {
        error!("Session failed: {}", err);
        self.release();
        self.error = Some(err.user_message());
        self.set_state(ConnectionState::Error);
    }

    /// Cancel the handshake and release every per-session resource.
    fn release(&mut self) {
        if let Some(pending) = self.pending.take() {
            debug!("Cancelling in-flight handshake");
            pending.abort();
        }
        if let Some(mut live) = self.live.take() {
            live.scheduler.teardown();
            live.input.stop();
            if let Some(session) = live.session.take() {
                session.close();
            }
            debug!("Session resources released");
        }
        self.meter_tick = None;
        self.input_volume = 0.0;
        self.output_meter.reset();
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            info!("Connection state: {} -> {}", self.state, state);
            self.state = state;
        }
        self.publish();
    }

    fn publish(&self) {
        self.ui.send_replace(self.snapshot());
    }
}

#[cfg(test)]
impl<B: AudioBackend, C: Connector> SessionController<B, C> {
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn mode(&self) -> AppMode {
        self.mode
    }

    pub fn error(&self) -> Option<&'static str> {
        self.error
    }

    /// Playback cursor of the current session (0 when there is none).
    pub fn cursor(&self) -> f64 {
        self.live.as_ref().map_or(0.0, |live| live.scheduler.cursor())
    }

    pub fn active_units(&self) -> &[crate::audio::PlaybackUnit] {
        match &self.live {
            Some(live) => live.scheduler.active(),
            None => &[],
        }
    }
}

async fn join_handshake(
    pending: &mut Option<JoinHandle<Result<SessionHandle, TransportError>>>,
) -> Result<SessionHandle, TransportError> {
    let Some(handle) = pending.as_mut() else {
        return std::future::pending().await;
    };
    let joined = handle.await;
    *pending = None;
    match joined {
        Ok(result) => result,
        Err(e) => {
            debug!("Handshake task ended: {}", e);
            Err(TransportError::Aborted)
        }
    }
}

async fn recv_server(session: Option<&mut SessionHandle>) -> ServerEvent {
    match session {
        Some(session) => session.recv().await.unwrap_or(ServerEvent::Closed { reason: None }),
        None => std::future::pending().await,
    }
}

async fn recv_window(windows: Option<&mut mpsc::Receiver<Vec<f32>>>) -> Option<Vec<f32>> {
    match windows {
        Some(windows) => windows.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_completion(completions: Option<&mut mpsc::UnboundedReceiver<UnitId>>) -> Option<UnitId> {
    match completions {
        Some(completions) => completions.recv().await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval.as_mut() {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Arc;

    use futures_util::FutureExt;
    use futures_util::future::BoxFuture;
    use parking_lot::Mutex;
    use tokio::sync::oneshot;
    use tokio_util::sync::CancellationToken;

    use crate::audio::AudioBuffer;
    use crate::audio::encoder::encode_chunk;
    use crate::live::MediaInput;

    #[derive(Default)]
    struct FakeState {
        now: f64,
        started: Vec<(UnitId, f64)>,
        stopped: Vec<UnitId>,
        output_released: usize,
        input_started: usize,
        input_stopped: usize,
        fail_input: bool,
        output_rate: Option<u32>,
        windows: Option<mpsc::Sender<Vec<f32>>>,
        completions: Option<mpsc::UnboundedSender<UnitId>>,
    }

    type Shared = Arc<Mutex<FakeState>>;

    struct FakeSink(Shared);

    impl PlaybackSink for FakeSink {
        fn current_time(&self) -> f64 {
            self.0.lock().now
        }

        fn start(&mut self, id: UnitId, _buffer: &AudioBuffer, start: f64) {
            self.0.lock().started.push((id, start));
        }

        fn stop(&mut self, id: UnitId) {
            self.0.lock().stopped.push(id);
        }

        fn release(&mut self) {
            self.0.lock().output_released += 1;
        }
    }

    struct FakeInput {
        state: Shared,
        stopped: bool,
    }

    impl InputHandle for FakeInput {
        fn start(&mut self) -> anyhow::Result<()> {
            self.state.lock().input_started += 1;
            Ok(())
        }

        fn stop(&mut self) {
            if !self.stopped {
                self.stopped = true;
                self.state.lock().input_stopped += 1;
            }
        }
    }

    struct FakeBackend(Shared);

    impl AudioBackend for FakeBackend {
        type Input = FakeInput;
        type Output = FakeSink;

        fn open_output(&mut self, sample_rate: u32, completions: mpsc::UnboundedSender<UnitId>) -> anyhow::Result<FakeSink> {
            let mut state = self.0.lock();
            state.output_rate = Some(sample_rate);
            state.completions = Some(completions);
            Ok(FakeSink(self.0.clone()))
        }

        fn open_input(&mut self, _rate: u32, _window: usize, windows: mpsc::Sender<Vec<f32>>) -> anyhow::Result<FakeInput> {
            let mut state = self.0.lock();
            if state.fail_input {
                anyhow::bail!("microphone permission denied");
            }
            state.windows = Some(windows);
            Ok(FakeInput { state: self.0.clone(), stopped: false })
        }
    }

    type Attempt = oneshot::Sender<Result<SessionHandle, TransportError>>;

    /// Connector whose handshakes are completed by the test.
    #[derive(Clone, Default)]
    struct MockConnector {
        attempts: Arc<Mutex<VecDeque<oneshot::Receiver<Result<SessionHandle, TransportError>>>>>,
        missing_key: bool,
    }

    impl MockConnector {
        fn expect(&self) -> Attempt {
            let (tx, rx) = oneshot::channel();
            self.attempts.lock().push_back(rx);
            tx
        }
    }

    impl Connector for MockConnector {
        fn preflight(&self) -> Result<(), TransportError> {
            if self.missing_key { Err(TransportError::MissingApiKey) } else { Ok(()) }
        }

        fn connect(&self, _setup: Setup) -> BoxFuture<'static, Result<SessionHandle, TransportError>> {
            let attempt = self.attempts.lock().pop_front();
            async move {
                match attempt {
                    Some(rx) => rx.await.unwrap_or(Err(TransportError::Aborted)),
                    None => Err(TransportError::Handshake("unexpected connect".into())),
                }
            }
            .boxed()
        }
    }

    struct Remote {
        events: mpsc::Sender<ServerEvent>,
        sent: mpsc::Receiver<MediaInput>,
        cancel: CancellationToken,
    }

    fn fake_session() -> (SessionHandle, Remote) {
        let (out_tx, sent) = mpsc::channel(16);
        let (events, in_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        (SessionHandle::new(1, out_tx, in_rx, cancel.clone()), Remote { events, sent, cancel })
    }

    type Controller = SessionController<FakeBackend, MockConnector>;

    fn controller() -> (Controller, Shared, MockConnector) {
        let state = Shared::default();
        let connector = MockConnector::default();
        let setup = Setup::audio("test-model", "persona", "Kore");
        let controller = SessionController::new(
            FakeBackend(state.clone()),
            connector.clone(),
            setup,
            SessionOptions::default(),
            AppMode::Voice,
        );
        (controller, state, connector)
    }

    async fn connected() -> (Controller, Shared, Remote, mpsc::Sender<Command>, mpsc::Receiver<Command>) {
        let (mut controller, state, connector) = controller();
        let (commands_tx, mut commands) = mpsc::channel(4);
        let attempt = connector.expect();
        controller.connect();
        let (session, remote) = fake_session();
        assert!(attempt.send(Ok(session)).is_ok());
        assert!(controller.step(&mut commands).await);
        assert_eq!(controller.state(), ConnectionState::Connected);
        (controller, state, remote, commands_tx, commands)
    }

    fn audio(seconds: f64) -> ServerEvent {
        let samples = vec![0.0f32; (seconds * 24000.0) as usize];
        ServerEvent::Audio { mime_type: "audio/pcm;rate=24000".into(), data: encode_chunk(&samples) }
    }

    #[tokio::test]
    async fn test_connect_state_sequence() {
        let (mut controller, state, connector) = controller();
        let (_tx, mut commands) = mpsc::channel(4);
        let ui = controller.subscribe();
        assert_eq!(controller.state(), ConnectionState::Disconnected);

        let attempt = connector.expect();
        controller.connect();
        assert_eq!(controller.state(), ConnectionState::Connecting);
        assert_eq!(ui.borrow().state, ConnectionState::Connecting);
        assert_eq!(state.lock().input_started, 0);

        // A second connect while one is in flight is ignored
        controller.connect();
        assert_eq!(connector.attempts.lock().len(), 0);

        let (session, _remote) = fake_session();
        assert!(attempt.send(Ok(session)).is_ok());
        assert!(controller.step(&mut commands).await);
        assert_eq!(controller.state(), ConnectionState::Connected);
        assert_eq!(ui.borrow().state, ConnectionState::Connected);
        assert_eq!(state.lock().input_started, 1);
        assert!(controller.error().is_none());
    }

    #[tokio::test]
    async fn test_interruption_then_audio_schedules_back_to_back() {
        let (mut controller, state, remote, _tx, mut commands) = connected().await;
        state.lock().now = 5.0;

        remote.events.send(ServerEvent::Interrupted).await.unwrap();
        remote.events.send(audio(1.0)).await.unwrap();
        remote.events.send(audio(0.5)).await.unwrap();
        for _ in 0..3 {
            assert!(controller.step(&mut commands).await);
        }

        let starts: Vec<f64> = state.lock().started.iter().map(|(_, start)| *start).collect();
        assert_eq!(starts, vec![5.0, 6.0]);
        assert!((controller.cursor() - 6.5).abs() < 1e-9);
        assert_eq!(controller.active_units().len(), 2);
    }

    #[tokio::test]
    async fn test_interruption_flushes_playing_units() {
        let (mut controller, state, remote, _tx, mut commands) = connected().await;
        remote.events.send(audio(1.0)).await.unwrap();
        remote.events.send(audio(1.0)).await.unwrap();
        controller.step(&mut commands).await;
        controller.step(&mut commands).await;

        state.lock().now = 0.4;
        remote.events.send(ServerEvent::Interrupted).await.unwrap();
        controller.step(&mut commands).await;

        assert_eq!(state.lock().stopped, vec![0, 1]);
        assert!(controller.active_units().is_empty());
        assert_eq!(controller.cursor(), 0.4);
        assert_eq!(controller.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_corrupt_payload_is_dropped() {
        let (mut controller, state, remote, _tx, mut commands) = connected().await;

        remote.events.send(audio(0.5)).await.unwrap();
        remote
            .events
            .send(ServerEvent::Audio { mime_type: "audio/pcm;rate=24000".into(), data: "%%not base64%%".into() })
            .await
            .unwrap();
        remote.events.send(audio(0.5)).await.unwrap();
        for _ in 0..3 {
            controller.step(&mut commands).await;
        }

        let starts: Vec<f64> = state.lock().started.iter().map(|(_, start)| *start).collect();
        assert_eq!(starts, vec![0.0, 0.5]);
        assert_eq!(controller.state(), ConnectionState::Connected);
        assert!(controller.error().is_none());
    }

    #[tokio::test]
    async fn test_payload_rate_comes_from_mime_type() {
        let (mut controller, _state, remote, _tx, mut commands) = connected().await;
        let samples = vec![0.0f32; 16000];
        remote
            .events
            .send(ServerEvent::Audio { mime_type: "audio/pcm;rate=16000".into(), data: encode_chunk(&samples) })
            .await
            .unwrap();
        remote.events.send(ServerEvent::Audio { mime_type: "audio/pcm".into(), data: encode_chunk(&samples) }).await.unwrap();
        controller.step(&mut commands).await;
        controller.step(&mut commands).await;

        let units = controller.active_units();
        assert!((units[0].duration - 1.0).abs() < 1e-9);
        assert!((units[1].duration - 16000.0 / 24000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_close_notice_stops_everything() {
        let (mut controller, state, remote, _tx, mut commands) = connected().await;
        remote.events.send(audio(1.0)).await.unwrap();
        remote.events.send(audio(1.0)).await.unwrap();
        controller.step(&mut commands).await;
        controller.step(&mut commands).await;
        assert_eq!(controller.active_units().len(), 2);

        remote.events.send(ServerEvent::Closed { reason: Some("bye".into()) }).await.unwrap();
        controller.step(&mut commands).await;

        let fake = state.lock();
        assert_eq!(fake.stopped, vec![0, 1]);
        assert_eq!(fake.output_released, 1);
        assert_eq!(fake.input_stopped, 1);
        drop(fake);
        assert!(controller.active_units().is_empty());
        assert_eq!(controller.cursor(), 0.0);
        assert_eq!(controller.state(), ConnectionState::Disconnected);
        assert!(remote.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_reader_gone_counts_as_close() {
        let (mut controller, _state, remote, _tx, mut commands) = connected().await;
        drop(remote.events);
        controller.step(&mut commands).await;
        assert_eq!(controller.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_remote_error_ends_in_error_state() {
        let (mut controller, state, remote, _tx, mut commands) = connected().await;
        remote.events.send(ServerEvent::Error("connection reset".into())).await.unwrap();
        controller.step(&mut commands).await;

        assert_eq!(controller.state(), ConnectionState::Error);
        assert_eq!(controller.error(), Some("Erro de conexão com o servidor."));
        assert_eq!(state.lock().output_released, 1);
        assert_eq!(state.lock().input_stopped, 1);

        // Only an explicit teardown leaves Error
        controller.teardown();
        assert_eq!(controller.state(), ConnectionState::Disconnected);
        assert!(controller.error().is_none());
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let (mut controller, state, _remote, _tx, _commands) = connected().await;
        controller.teardown();
        controller.teardown();

        let fake = state.lock();
        assert_eq!(fake.output_released, 1);
        assert_eq!(fake.input_stopped, 1);
        drop(fake);
        let snapshot = controller.snapshot();
        assert_eq!(snapshot.state, ConnectionState::Disconnected);
        assert_eq!(snapshot.input_volume, 0.0);
        assert_eq!(snapshot.output_volume, 0.0);
        assert_eq!(controller.cursor(), 0.0);
    }

    #[tokio::test]
    async fn test_teardown_during_handshake_cancels_it() {
        let (mut controller, state, connector) = controller();
        let mut attempt = connector.expect();
        controller.connect();
        assert_eq!(controller.state(), ConnectionState::Connecting);

        controller.teardown();
        assert_eq!(controller.state(), ConnectionState::Disconnected);
        assert_eq!(state.lock().output_released, 1);
        assert_eq!(state.lock().input_stopped, 1);
        assert_eq!(state.lock().input_started, 0);

        let cancelled = tokio::time::timeout(Duration::from_secs(1), attempt.closed()).await;
        assert!(cancelled.is_ok());
    }

    #[tokio::test]
    async fn test_late_handshake_is_closed() {
        let (mut controller, _state, _connector) = controller();
        controller.teardown();

        let (session, remote) = fake_session();
        controller.on_handshake(Ok(session));
        assert!(remote.cancel.is_cancelled());
        assert_eq!(controller.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_input_failure_releases_output() {
        let (mut controller, state, _connector) = controller();
        state.lock().fail_input = true;

        controller.connect();
        assert_eq!(controller.state(), ConnectionState::Error);
        assert_eq!(controller.error(), Some("Falha ao iniciar o áudio."));
        assert_eq!(state.lock().output_released, 1);
        assert_eq!(controller.cursor(), 0.0);
    }

    #[tokio::test]
    async fn test_output_opens_at_configured_rate() {
        let (mut controller, state, connector) = controller();
        controller.options.playback_rate = 22050;
        let _attempt = connector.expect();

        controller.connect();
        assert_eq!(controller.state(), ConnectionState::Connecting);
        assert_eq!(state.lock().output_rate, Some(22050));
        controller.teardown();
    }

    #[tokio::test]
    async fn test_missing_key_fails_before_devices() {
        let (mut controller, state, _connector) = controller();
        controller.connector.missing_key = true;

        controller.connect();
        assert_eq!(controller.state(), ConnectionState::Error);
        assert_eq!(controller.error(), Some("Chave de API não encontrada nas variáveis de ambiente."));
        assert!(state.lock().completions.is_none());
    }

    #[tokio::test]
    async fn test_handshake_failure_releases_devices() {
        let (mut controller, state, connector) = controller();
        let (_tx, mut commands) = mpsc::channel(4);
        let attempt = connector.expect();
        controller.connect();

        assert!(attempt.send(Err(TransportError::Handshake("bad model".into()))).is_ok());
        controller.step(&mut commands).await;

        assert_eq!(controller.state(), ConnectionState::Error);
        assert_eq!(controller.error(), Some("Erro de conexão com o servidor."));
        assert_eq!(state.lock().output_released, 1);
        assert_eq!(state.lock().input_stopped, 1);

        // Reconnecting from Error is allowed
        let attempt = connector.expect();
        controller.connect();
        assert_eq!(controller.state(), ConnectionState::Connecting);
        drop(attempt);
    }

    #[tokio::test]
    async fn test_leaving_voice_mode_tears_down() {
        let (mut controller, state, _remote, tx, mut commands) = connected().await;

        tx.send(Command::SwitchMode(AppMode::Chat)).await.unwrap();
        controller.step(&mut commands).await;
        assert_eq!(controller.mode(), AppMode::Chat);
        assert_eq!(controller.state(), ConnectionState::Disconnected);
        assert_eq!(state.lock().output_released, 1);

        // Connect is a voice-mode action
        tx.send(Command::Connect).await.unwrap();
        controller.step(&mut commands).await;
        assert_eq!(controller.state(), ConnectionState::Disconnected);

        // Entering voice mode does not auto-connect
        tx.send(Command::SwitchMode(AppMode::Voice)).await.unwrap();
        controller.step(&mut commands).await;
        assert_eq!(controller.mode(), AppMode::Voice);
        assert_eq!(controller.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_capture_window_sent_only_when_connected() {
        let (mut controller, state, connector) = controller();
        let (_tx, mut commands) = mpsc::channel(4);
        let attempt = connector.expect();
        controller.connect();

        // Still connecting: the window is dropped
        let windows = state.lock().windows.clone().unwrap();
        windows.send(vec![0.2; 4096]).await.unwrap();
        controller.step(&mut commands).await;

        let (session, mut remote) = fake_session();
        assert!(attempt.send(Ok(session)).is_ok());
        controller.step(&mut commands).await;
        assert!(remote.sent.try_recv().is_err());

        windows.send(vec![0.2; 4096]).await.unwrap();
        controller.step(&mut commands).await;
        let chunk = remote.sent.try_recv().unwrap();
        assert_eq!(chunk.media.mime_type, "audio/pcm;rate=16000");
        assert_eq!(chunk.media.data, encode_chunk(&[0.2; 4096]));
    }

    #[tokio::test]
    async fn test_completion_removes_unit() {
        let (mut controller, state, remote, _tx, mut commands) = connected().await;
        remote.events.send(audio(0.25)).await.unwrap();
        controller.step(&mut commands).await;
        assert_eq!(controller.active_units().len(), 1);

        let completions = state.lock().completions.clone().unwrap();
        completions.send(0).unwrap();
        controller.step(&mut commands).await;
        assert!(controller.active_units().is_empty());
    }

    #[tokio::test]
    async fn test_closed_command_channel_stops_run() {
        let (mut controller, state, _remote, tx, commands) = connected().await;
        drop(tx);
        controller.run(commands).await;
        assert_eq!(controller.state(), ConnectionState::Disconnected);
        assert_eq!(state.lock().output_released, 1);
    }
}
