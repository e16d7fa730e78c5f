//! Wire envelopes and the gateway error taxonomy.
//!
//! Every message in either direction is a JSON document tagged by `type`.
//! Inbound envelopes keep mode and visualization names as plain strings so a
//! bad value becomes a structured error reply instead of an ignored parse
//! failure; outbound envelopes are fully typed.

use serde::{Deserialize, Deserializer, Serialize};

/// Messages sent by clients to the gateway.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// One webcam frame: base64 JPEG plus the client capture timestamp.
    Frame {
        data: String,
        #[serde(default)]
        timestamp: i64,
    },
    /// Switch the session to a different model preset.
    ChangeMode { model_mode: String },
    /// Adjust visualization settings; absent fields stay unchanged.
    UpdateViz {
        #[serde(default)]
        settings: VizSettingsPatch,
    },
    /// Request the session's rolling performance statistics.
    GetStats,
}

/// Partial visualization update.
///
/// `class_filter` distinguishes "absent" (leave as is) from an explicit
/// `null` (clear the filter), hence the doubled `Option`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VizSettingsPatch {
    pub visualization_mode: Option<String>,
    pub overlay_opacity: Option<f64>,
    #[serde(default, deserialize_with = "some_if_present")]
    pub class_filter: Option<Option<Vec<i64>>>,
}

fn some_if_present<'de, D>(deserializer: D) -> Result<Option<Option<Vec<i64>>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<Vec<i64>>::deserialize(deserializer).map(Some)
}

/// The settings actually in effect, echoed after an update.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VizSettings {
    pub visualization_mode: &'static str,
    pub overlay_opacity: f64,
    pub class_filter: Option<Vec<u32>>,
}

/// Messages sent by the gateway to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        status: &'static str,
        available_models: Vec<&'static str>,
        class_labels: Vec<&'static str>,
        current_model: &'static str,
    },
    Segmentation {
        timestamp: i64,
        data: String,
        metadata: SegmentationMetadata,
    },
    ModeChanged {
        model_mode: &'static str,
        class_labels: Vec<&'static str>,
    },
    VizUpdated {
        settings: VizSettings,
    },
    Stats {
        fps: f64,
        avg_inference_ms: f64,
        frames_in_flight: u32,
        frames_dropped: u64,
    },
    Error {
        code: ErrorCode,
        message: String,
        recoverable: bool,
    },
}

/// Timing and content metadata attached to every segmentation reply.
#[derive(Debug, Clone, Serialize)]
pub struct SegmentationMetadata {
    pub inference_time_ms: f64,
    pub fps: f64,
    pub model_mode: &'static str,
    pub detected_classes: Vec<&'static str>,
}

/// Every failure a client can observe, by wire code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    MalformedFrame,
    InferenceFailed,
    OutOfMemory,
    ModeChangeFailed,
    VizUpdateFailed,
    StatsFailed,
    EncodeFailed,
}

impl ErrorCode {
    /// Whether the session can keep going after reporting this error. The
    /// whole taxonomy is recoverable today; fatal conditions close the
    /// socket without an envelope instead.
    pub fn recoverable(self) -> bool {
        true
    }
}

impl ServerMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
            recoverable: code.recoverable(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_message_parses() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"frame","data":"aGVsbG8=","timestamp":1712000000123}"#)
                .unwrap();
        match msg {
            ClientMessage::Frame { data, timestamp } => {
                assert_eq!(data, "aGVsbG8=");
                assert_eq!(timestamp, 1712000000123);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn frame_timestamp_defaults_to_zero() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"frame","data":""}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Frame { timestamp: 0, .. }));
    }

    #[test]
    fn change_mode_keeps_unknown_names_for_validation() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"change_mode","model_mode":"turbo"}"#).unwrap();
        match msg {
            ClientMessage::ChangeMode { model_mode } => assert_eq!(model_mode, "turbo"),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_fails_to_parse() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"reboot"}"#).is_err());
    }

    #[test]
    fn viz_patch_distinguishes_null_from_absent() {
        let cleared: ClientMessage = serde_json::from_str(
            r#"{"type":"update_viz","settings":{"class_filter":null}}"#,
        )
        .unwrap();
        match cleared {
            ClientMessage::UpdateViz { settings } => {
                assert_eq!(settings.class_filter, Some(None));
                assert!(settings.visualization_mode.is_none());
            }
            other => panic!("wrong variant: {other:?}"),
        }

        let untouched: ClientMessage = serde_json::from_str(
            r#"{"type":"update_viz","settings":{"overlay_opacity":0.4}}"#,
        )
        .unwrap();
        match untouched {
            ClientMessage::UpdateViz { settings } => {
                assert_eq!(settings.class_filter, None);
                assert_eq!(settings.overlay_opacity, Some(0.4));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn viz_patch_accepts_explicit_filter() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"update_viz","settings":{"visualization_mode":"blend","class_filter":[1,5,9]}}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::UpdateViz { settings } => {
                assert_eq!(settings.visualization_mode.as_deref(), Some("blend"));
                assert_eq!(settings.class_filter, Some(Some(vec![1, 5, 9])));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn server_messages_carry_snake_case_tags() {
        let connected = ServerMessage::Connected {
            status: "ready",
            available_models: vec!["fast", "balanced"],
            class_labels: vec!["background", "person"],
            current_model: "balanced",
        };
        let json = serde_json::to_value(&connected).unwrap();
        assert_eq!(json["type"], "connected");
        assert_eq!(json["status"], "ready");
        assert_eq!(json["current_model"], "balanced");

        let stats = ServerMessage::Stats {
            fps: 24.0,
            avg_inference_ms: 41.5,
            frames_in_flight: 1,
            frames_dropped: 7,
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["type"], "stats");
        assert_eq!(json["frames_dropped"], 7);
    }

    #[test]
    fn error_codes_serialize_screaming() {
        let err = ServerMessage::error(ErrorCode::MalformedFrame, "empty frame data received");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "MALFORMED_FRAME");
        assert_eq!(json["recoverable"], true);

        for (code, name) in [
            (ErrorCode::InferenceFailed, "INFERENCE_FAILED"),
            (ErrorCode::OutOfMemory, "OUT_OF_MEMORY"),
            (ErrorCode::ModeChangeFailed, "MODE_CHANGE_FAILED"),
            (ErrorCode::VizUpdateFailed, "VIZ_UPDATE_FAILED"),
            (ErrorCode::StatsFailed, "STATS_FAILED"),
            (ErrorCode::EncodeFailed, "ENCODE_FAILED"),
        ] {
            assert_eq!(serde_json::to_value(code).unwrap(), name);
        }
    }

    #[test]
    fn segmentation_reply_shape() {
        let msg = ServerMessage::Segmentation {
            timestamp: 42,
            data: "anBlZw==".to_string(),
            metadata: SegmentationMetadata {
                inference_time_ms: 18.4,
                fps: 27.1,
                model_mode: "fast",
                detected_classes: vec!["person", "dog"],
            },
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "segmentation");
        assert_eq!(json["metadata"]["model_mode"], "fast");
        assert_eq!(json["metadata"]["detected_classes"][1], "dog");
    }
}
