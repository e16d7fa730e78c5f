//! Per-connection session: lifecycle, dispatch, and the worker thread.
//!
//! Each accepted WebSocket runs three cooperating pieces:
//!
//! - the async **dispatch loop** (this task) reads inbound envelopes, applies
//!   frame admission, and forwards work items;
//! - a dedicated **worker thread** owns the session's engine and renderer and
//!   processes work items strictly in order, so replies stay FIFO;
//! - an async **writer task** drains outbound messages into the socket and
//!   treats a closed peer as a normal outcome, never an error.
//!
//! Because every reply (success or error) flows through the same fallible
//! writer, an error-while-sending-error cannot exist by construction.

use std::str::FromStr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use actix_ws::{Message, MessageStream, Session};
use crossbeam_channel::{Receiver, Sender};
use seg_core::{EngineError, Frame, InferenceEngine, ModelMode};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn, Instrument};

use crate::gateway::codec;
use crate::gateway::pipeline::{FramePipeline, PipelineStats};
use crate::gateway::protocol::{
    ClientMessage, ErrorCode, SegmentationMetadata, ServerMessage, VizSettings, VizSettingsPatch,
};
use crate::gateway::render::{Renderer, VizMode};
use crate::gateway::server::AppState;
use crate::gateway::telemetry;

/// Lifecycle of one connection, used for structured logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionPhase {
    Connecting,
    Initializing,
    Ready,
    Closing,
    Closed,
}

impl SessionPhase {
    fn label(self) -> &'static str {
        match self {
            SessionPhase::Connecting => "connecting",
            SessionPhase::Initializing => "initializing",
            SessionPhase::Ready => "ready",
            SessionPhase::Closing => "closing",
            SessionPhase::Closed => "closed",
        }
    }
}

/// Unit of work consumed by the session worker, in arrival order.
enum WorkItem {
    Frame { data: String, timestamp: i64 },
    ChangeMode { requested: String },
    UpdateViz { patch: VizSettingsPatch },
    GetStats,
}

/// Payload handed to the writer task.
enum Outbound {
    Message(String),
    Pong(Vec<u8>),
    Close,
}

/// Entry point spawned by the server for every upgraded connection.
pub(crate) async fn run_session(session: Session, msg_stream: MessageStream, state: Arc<AppState>) {
    let session_id = state.next_session_id();
    let span = tracing::info_span!("session", id = session_id);
    drive_session(session_id, session, msg_stream, state)
        .instrument(span)
        .await;
}

async fn drive_session(
    session_id: u64,
    session: Session,
    mut msg_stream: MessageStream,
    state: Arc<AppState>,
) {
    let mut phase = SessionPhase::Connecting;
    let active = state.active_sessions.fetch_add(1, Ordering::SeqCst) + 1;
    metrics::gauge!("gateway_active_sessions").set(active as f64);
    info!("client connected ({active} active)");

    let (out_tx, out_rx) = mpsc::unbounded_channel::<Outbound>();
    let (work_tx, work_rx) = crossbeam_channel::unbounded::<WorkItem>();
    let (ready_tx, mut ready_rx) = oneshot::channel::<()>();

    actix_web::rt::spawn(run_writer(session, out_rx).instrument(tracing::Span::current()));

    let mut pipeline = FramePipeline::new(
        state.config.max_in_flight,
        state.config.min_frame_interval,
    );
    // The worker is never joined from async context: a join would park the
    // executor behind a predict that may run for hundreds of milliseconds.
    // Closing the work channel is its shutdown signal.
    let worker = SessionWorker::new(state.clone(), out_tx.clone(), pipeline.stats());
    let spawned = telemetry::spawn_thread(format!("session-{session_id}"), move || {
        worker.run(work_rx, ready_tx)
    });
    if let Err(err) = spawned {
        warn!("failed to spawn session worker: {err}");
        let _ = out_tx.send(Outbound::Close);
        finish_session(&state, phase);
        return;
    }

    transition(&mut phase, SessionPhase::Initializing);

    // Inbound messages are consumed from the start; frames admitted during
    // initialization simply queue behind the worker's init step.
    let mut saw_ready = false;
    let mut saw_first_message = false;
    loop {
        if !saw_ready {
            tokio::select! {
                outcome = &mut ready_rx => {
                    match outcome {
                        Ok(()) => {
                            saw_ready = true;
                            transition(&mut phase, SessionPhase::Ready);
                        }
                        // Worker dropped the channel: init failed, close
                        // quietly without a client-visible error.
                        Err(_) => break,
                    }
                }
                inbound = msg_stream.recv() => {
                    if !handle_inbound(inbound, &mut pipeline, &work_tx, &out_tx, state.config.verbose) {
                        break;
                    }
                    saw_first_message = true;
                }
            }
        } else if !saw_first_message {
            // Initial-inactivity window: a ready session whose client never
            // speaks gets torn down.
            match tokio::time::timeout(state.config.init_timeout, msg_stream.recv()).await {
                Ok(inbound) => {
                    if !handle_inbound(inbound, &mut pipeline, &work_tx, &out_tx, state.config.verbose) {
                        break;
                    }
                    saw_first_message = true;
                }
                Err(_) => {
                    debug!(
                        "no client activity within {:?} of ready; closing",
                        state.config.init_timeout
                    );
                    let _ = out_tx.send(Outbound::Close);
                    break;
                }
            }
        } else {
            let inbound = msg_stream.recv().await;
            if !handle_inbound(inbound, &mut pipeline, &work_tx, &out_tx, state.config.verbose) {
                break;
            }
        }
    }

    transition(&mut phase, SessionPhase::Closing);

    // Dropping the work channel lets the worker finish whatever is in flight,
    // attempt its reply sends, and exit on its own.
    drop(work_tx);
    drop(out_tx);

    finish_session(&state, phase);
}

fn transition(phase: &mut SessionPhase, next: SessionPhase) {
    debug!("session {} -> {}", phase.label(), next.label());
    *phase = next;
}

fn finish_session(state: &AppState, mut phase: SessionPhase) {
    transition(&mut phase, SessionPhase::Closed);
    let active = state.active_sessions.fetch_sub(1, Ordering::SeqCst) - 1;
    metrics::gauge!("gateway_active_sessions").set(active as f64);
    info!("client disconnected ({active} active)");
}

/// Route one inbound socket event. Returns `false` when the session should
/// close.
fn handle_inbound(
    inbound: Option<Result<Message, actix_ws::ProtocolError>>,
    pipeline: &mut FramePipeline,
    work_tx: &Sender<WorkItem>,
    out_tx: &mpsc::UnboundedSender<Outbound>,
    verbose: bool,
) -> bool {
    match inbound {
        Some(Ok(Message::Text(text))) => {
            dispatch_text(&text, pipeline, work_tx, verbose);
            true
        }
        Some(Ok(Message::Ping(payload))) => {
            let _ = out_tx.send(Outbound::Pong(payload.to_vec()));
            true
        }
        Some(Ok(Message::Close(reason))) => {
            debug!("client closed the connection: {reason:?}");
            false
        }
        // Binary, pong, continuation frames carry nothing for us.
        Some(Ok(_)) => true,
        Some(Err(err)) => {
            debug!("websocket protocol error: {err}");
            false
        }
        None => false,
    }
}

/// Parse and dispatch one text envelope.
///
/// Unknown or malformed envelopes are logged and ignored; they never
/// terminate the session. Frames pass through the admission gate before any
/// decoding work is spent on them.
fn dispatch_text(
    text: &str,
    pipeline: &mut FramePipeline,
    work_tx: &Sender<WorkItem>,
    verbose: bool,
) {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(err) => {
            debug!("ignoring unrecognized message: {err}");
            return;
        }
    };

    let item = match message {
        ClientMessage::Frame { data, timestamp } => {
            if !pipeline.admit(Instant::now()) {
                if verbose {
                    debug!("frame at {timestamp} dropped by admission");
                }
                return;
            }
            WorkItem::Frame { data, timestamp }
        }
        ClientMessage::ChangeMode { model_mode } => WorkItem::ChangeMode {
            requested: model_mode,
        },
        ClientMessage::UpdateViz { settings } => WorkItem::UpdateViz { patch: settings },
        ClientMessage::GetStats => WorkItem::GetStats,
    };
    let _ = work_tx.send(item);
}

/// Drain outbound messages into the socket.
///
/// A send observing the peer's departure ends the task; the failure is the
/// close signal, not an error to propagate.
async fn run_writer(mut session: Session, mut out_rx: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(item) = out_rx.recv().await {
        match item {
            Outbound::Message(text) => {
                if session.text(text).await.is_err() {
                    debug!("peer gone while sending; dropping remaining output");
                    return;
                }
            }
            Outbound::Pong(payload) => {
                if session.pong(&payload).await.is_err() {
                    return;
                }
            }
            Outbound::Close => {
                let _ = session.close(None).await;
                return;
            }
        }
    }
    let _ = session.close(None).await;
}

/// Mutable visualization state owned by the worker.
struct VizState {
    mode: VizMode,
    opacity: f64,
    class_filter: Option<Vec<u32>>,
}

impl VizState {
    fn new() -> Self {
        Self {
            mode: VizMode::Filled,
            opacity: 0.6,
            class_filter: None,
        }
    }

    /// Apply a partial update, returning the settings now in effect.
    ///
    /// Opacity is clamped rather than rejected; filter entries outside the
    /// active vocabulary are silently dropped. Unknown visualization names
    /// and non-finite opacities are the only rejections.
    fn apply(&mut self, patch: &VizSettingsPatch, num_classes: usize) -> Result<VizSettings, String> {
        let mode = match &patch.visualization_mode {
            Some(name) => Some(VizMode::from_str(name).map_err(|err| err.to_string())?),
            None => None,
        };
        if let Some(opacity) = patch.overlay_opacity {
            if !opacity.is_finite() {
                return Err(format!("overlay_opacity must be a number, got {opacity}"));
            }
        }

        if let Some(mode) = mode {
            self.mode = mode;
        }
        if let Some(opacity) = patch.overlay_opacity {
            self.opacity = opacity.clamp(0.0, 1.0);
        }
        if let Some(filter) = &patch.class_filter {
            self.class_filter = filter.as_ref().map(|classes| {
                classes
                    .iter()
                    .filter(|&&class| class >= 0 && (class as usize) < num_classes)
                    .map(|&class| class as u32)
                    .collect()
            });
        }
        Ok(self.settings())
    }

    fn settings(&self) -> VizSettings {
        VizSettings {
            visualization_mode: self.mode.as_str(),
            overlay_opacity: self.opacity,
            class_filter: self.class_filter.clone(),
        }
    }
}

/// The blocking half of a session: owns the engine and renderer, processes
/// work items strictly in order.
struct SessionWorker {
    state: Arc<AppState>,
    engine: InferenceEngine,
    renderer: Renderer,
    viz: VizState,
    out_tx: mpsc::UnboundedSender<Outbound>,
    pipeline_stats: Arc<PipelineStats>,
}

impl SessionWorker {
    fn new(
        state: Arc<AppState>,
        out_tx: mpsc::UnboundedSender<Outbound>,
        pipeline_stats: Arc<PipelineStats>,
    ) -> Self {
        let engine = InferenceEngine::new(state.pool.clone(), state.config.warmup_iterations);
        let renderer = Renderer::for_mode(state.config.default_mode);
        Self {
            state,
            engine,
            renderer,
            viz: VizState::new(),
            out_tx,
            pipeline_stats,
        }
    }

    fn run(mut self, work_rx: Receiver<WorkItem>, ready_tx: oneshot::Sender<()>) {
        if let Err(err) = self.initialize() {
            // Init failures close the socket without a client-visible error;
            // the connection may be half-open already.
            warn!("session initialization failed: {err:#}");
            let _ = self.out_tx.send(Outbound::Close);
            return;
        }
        let _ = ready_tx.send(());

        for item in work_rx {
            match item {
                WorkItem::Frame { data, timestamp } => self.handle_frame(&data, timestamp),
                WorkItem::ChangeMode { requested } => self.handle_change_mode(&requested),
                WorkItem::UpdateViz { patch } => self.handle_update_viz(&patch),
                WorkItem::GetStats => self.handle_get_stats(),
            }
        }
    }

    fn initialize(&mut self) -> Result<(), EngineError> {
        let mode = self.state.config.default_mode;
        self.engine.set_mode(mode)?;
        let ran = self.engine.warm_up(false)?;
        if !ran {
            debug!("{mode} already warm, skipping warm-up");
        }

        self.try_send(&ServerMessage::Connected {
            status: "ready",
            available_models: ModelMode::ALL.iter().map(|m| m.as_str()).collect(),
            class_labels: mode.vocabulary().labels().to_vec(),
            current_model: mode.as_str(),
        });
        Ok(())
    }

    /// Send an envelope, swallowing a closed peer. The boolean result exists
    /// so callers can stop doing pointless work, not to raise.
    fn try_send(&self, message: &ServerMessage) -> bool {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(err) => {
                warn!("failed to serialize outbound message: {err}");
                return false;
            }
        };
        self.out_tx.send(Outbound::Message(text)).is_ok()
    }

    fn send_error(&self, code: ErrorCode, message: impl Into<String>) {
        let message = message.into();
        metrics::counter!("gateway_errors_total", "code" => error_code_label(code)).increment(1);
        self.try_send(&ServerMessage::error(code, message));
    }

    fn handle_frame(&mut self, data: &str, timestamp: i64) {
        let started = Instant::now();
        match self.process_frame(data, timestamp) {
            Ok(reply) => {
                self.try_send(&reply);
                metrics::histogram!("gateway_frame_seconds")
                    .record(started.elapsed().as_secs_f64());
            }
            Err((code, message)) => self.send_error(code, message),
        }
        // The reply (either kind) releases the in-flight slot.
        self.pipeline_stats.complete();
    }

    fn process_frame(
        &mut self,
        data: &str,
        timestamp: i64,
    ) -> Result<ServerMessage, (ErrorCode, String)> {
        let image = codec::decode_frame(data)
            .map_err(|err| (ErrorCode::MalformedFrame, err.to_string()))?;

        let frame = Frame::new(image.as_raw(), image.width(), image.height(), timestamp);
        let (map, meta) = self.engine.predict(&frame).map_err(|err| {
            let code = match &err {
                EngineError::OutOfMemory(_) => ErrorCode::OutOfMemory,
                _ => ErrorCode::InferenceFailed,
            };
            (code, err.to_string())
        })?;
        metrics::histogram!("gateway_inference_seconds").record(meta.inference_time_ms / 1000.0);

        let labels = self.engine.mode().vocabulary().labels();
        let detected_classes: Vec<&'static str> = map
            .present_classes()
            .into_iter()
            .filter_map(|class| labels.get(class).copied())
            .collect();

        let rendered = self.renderer.render(
            &image,
            &map,
            self.viz.mode,
            self.viz.opacity,
            self.viz.class_filter.as_deref(),
        );
        let config = &self.state.config;
        let rendered =
            codec::resize_if_needed(rendered, config.max_reply_width, config.max_reply_height);
        let encoded = codec::encode_frame(
            &rendered,
            config.reply_format,
            config.reply_quality,
            config.png_compression,
        )
        .map_err(|err| (ErrorCode::EncodeFailed, err.to_string()))?;

        Ok(ServerMessage::Segmentation {
            timestamp,
            data: encoded,
            metadata: SegmentationMetadata {
                inference_time_ms: meta.inference_time_ms,
                fps: meta.fps,
                model_mode: self.engine.mode().as_str(),
                detected_classes,
            },
        })
    }

    fn handle_change_mode(&mut self, requested: &str) {
        let mode = match ModelMode::from_str(requested) {
            Ok(mode) => mode,
            Err(err) => {
                self.send_error(ErrorCode::ModeChangeFailed, err.to_string());
                return;
            }
        };

        if let Err(err) = self.engine.set_mode(mode) {
            self.send_error(ErrorCode::ModeChangeFailed, err.to_string());
            return;
        }
        if let Err(err) = self.engine.warm_up(false) {
            self.send_error(ErrorCode::ModeChangeFailed, err.to_string());
            return;
        }

        self.renderer = Renderer::for_mode(mode);
        // A switch to the already-active mode still confirms, so clients can
        // treat mode_changed as an acknowledgement.
        self.try_send(&ServerMessage::ModeChanged {
            model_mode: mode.as_str(),
            class_labels: mode.vocabulary().labels().to_vec(),
        });
    }

    fn handle_update_viz(&mut self, patch: &VizSettingsPatch) {
        match self.viz.apply(patch, self.renderer.num_classes()) {
            Ok(settings) => {
                self.try_send(&ServerMessage::VizUpdated { settings });
            }
            Err(message) => self.send_error(ErrorCode::VizUpdateFailed, message),
        }
    }

    fn handle_get_stats(&mut self) {
        let snapshot = self.engine.stats();
        self.try_send(&ServerMessage::Stats {
            fps: snapshot.avg_fps,
            avg_inference_ms: snapshot.avg_inference_ms,
            frames_in_flight: self.pipeline_stats.in_flight(),
            frames_dropped: self.pipeline_stats.dropped(),
        });
    }
}

fn error_code_label(code: ErrorCode) -> &'static str {
    match code {
        ErrorCode::MalformedFrame => "malformed_frame",
        ErrorCode::InferenceFailed => "inference_failed",
        ErrorCode::OutOfMemory => "out_of_memory",
        ErrorCode::ModeChangeFailed => "mode_change_failed",
        ErrorCode::VizUpdateFailed => "viz_update_failed",
        ErrorCode::StatsFailed => "stats_failed",
        ErrorCode::EncodeFailed => "encode_failed",
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn patch(json: &str) -> VizSettingsPatch {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn viz_defaults() {
        let viz = VizState::new();
        let settings = viz.settings();
        assert_eq!(settings.visualization_mode, "filled");
        assert_eq!(settings.overlay_opacity, 0.6);
        assert_eq!(settings.class_filter, None);
    }

    #[test]
    fn viz_update_is_idempotent() {
        let mut viz = VizState::new();
        let update = patch(
            r#"{"visualization_mode":"blend","overlay_opacity":0.25,"class_filter":[1,3]}"#,
        );
        let first = viz.apply(&update, 21).unwrap();
        let second = viz.apply(&update, 21).unwrap();
        assert_eq!(first, second);
        assert_eq!(viz.mode, VizMode::Blend);
        assert_eq!(viz.opacity, 0.25);
        assert_eq!(viz.class_filter, Some(vec![1, 3]));
    }

    #[test]
    fn viz_opacity_is_clamped_not_rejected() {
        let mut viz = VizState::new();
        viz.apply(&patch(r#"{"overlay_opacity":1.7}"#), 21).unwrap();
        assert_eq!(viz.opacity, 1.0);
        viz.apply(&patch(r#"{"overlay_opacity":-0.4}"#), 21).unwrap();
        assert_eq!(viz.opacity, 0.0);
    }

    #[test]
    fn viz_filter_drops_out_of_range_entries() {
        let mut viz = VizState::new();
        let applied = viz
            .apply(&patch(r#"{"class_filter":[-3,2,20,21,400]}"#), 21)
            .unwrap();
        assert_eq!(applied.class_filter, Some(vec![2, 20]));
    }

    #[test]
    fn viz_null_filter_clears_a_previous_one() {
        let mut viz = VizState::new();
        viz.apply(&patch(r#"{"class_filter":[5]}"#), 21).unwrap();
        assert_eq!(viz.class_filter, Some(vec![5]));
        viz.apply(&patch(r#"{"class_filter":null}"#), 21).unwrap();
        assert_eq!(viz.class_filter, None);
    }

    #[test]
    fn viz_absent_fields_stay_unchanged() {
        let mut viz = VizState::new();
        viz.apply(
            &patch(r#"{"visualization_mode":"contour","overlay_opacity":0.9,"class_filter":[2]}"#),
            21,
        )
        .unwrap();
        viz.apply(&patch(r#"{"overlay_opacity":0.5}"#), 21).unwrap();
        assert_eq!(viz.mode, VizMode::Contour);
        assert_eq!(viz.opacity, 0.5);
        assert_eq!(viz.class_filter, Some(vec![2]));
    }

    #[test]
    fn viz_unknown_mode_is_rejected_without_side_effects() {
        let mut viz = VizState::new();
        let err = viz
            .apply(&patch(r#"{"visualization_mode":"sparkle","overlay_opacity":0.1}"#), 21)
            .unwrap_err();
        assert!(err.contains("sparkle"));
        // The rejected update must not have half-applied.
        assert_eq!(viz.opacity, 0.6);
        assert_eq!(viz.mode, VizMode::Filled);
    }

    #[test]
    fn dispatch_ignores_unknown_message_types() {
        let mut pipeline = FramePipeline::new(2, Duration::from_millis(33));
        let stats = pipeline.stats();
        let (work_tx, work_rx) = crossbeam_channel::unbounded::<WorkItem>();

        dispatch_text(r#"{"type":"reboot"}"#, &mut pipeline, &work_tx, false);
        dispatch_text("not json at all", &mut pipeline, &work_tx, false);
        dispatch_text(r#"{"type":"frame"}"#, &mut pipeline, &work_tx, false);

        assert!(work_rx.try_recv().is_err());
        assert_eq!(stats.in_flight(), 0);
        assert_eq!(stats.dropped(), 0);
    }

    #[test]
    fn dispatch_admits_frames_and_forwards_controls() {
        let mut pipeline = FramePipeline::new(1, Duration::from_millis(0));
        let stats = pipeline.stats();
        let (work_tx, work_rx) = crossbeam_channel::unbounded::<WorkItem>();

        dispatch_text(
            r#"{"type":"frame","data":"aGk=","timestamp":7}"#,
            &mut pipeline,
            &work_tx,
            false,
        );
        // Cap of one: the second frame is dropped before any work is queued.
        dispatch_text(
            r#"{"type":"frame","data":"aGk=","timestamp":8}"#,
            &mut pipeline,
            &work_tx,
            false,
        );
        dispatch_text(r#"{"type":"get_stats"}"#, &mut pipeline, &work_tx, false);
        dispatch_text(
            r#"{"type":"change_mode","model_mode":"turbo"}"#,
            &mut pipeline,
            &work_tx,
            false,
        );

        assert!(matches!(
            work_rx.try_recv().unwrap(),
            WorkItem::Frame { timestamp: 7, .. }
        ));
        assert!(matches!(work_rx.try_recv().unwrap(), WorkItem::GetStats));
        // Unknown mode names reach the worker for a structured error reply.
        match work_rx.try_recv().unwrap() {
            WorkItem::ChangeMode { requested } => assert_eq!(requested, "turbo"),
            _ => panic!("expected the mode change to be forwarded"),
        }
        assert!(work_rx.try_recv().is_err());
        assert_eq!(stats.dropped(), 1);
        assert_eq!(stats.in_flight(), 1);
    }
}
