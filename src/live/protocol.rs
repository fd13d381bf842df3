//! JSON messages exchanged with the live conversational endpoint.

use serde::{Deserialize, Serialize};

/// Inline binary data (base64) with its MIME type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

/// One outbound realtime chunk: `{ "media": { "mimeType": ..., "data": ... } }`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaInput {
    pub media: Blob,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Self { parts: vec![Part { text: Some(text.into()), inline_data: None }] }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Modality {
    Audio,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<Modality>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

/// Session parameters sent once, before any audio.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
}

impl Setup {
    /// Audio-only session with a prebuilt voice.
    pub fn audio(model: &str, system_instruction: &str, voice: &str) -> Self {
        let model = if model.starts_with("models/") { model.to_string() } else { format!("models/{model}") };
        Self {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec![Modality::Audio],
                speech_config: Some(SpeechConfig {
                    voice_config: VoiceConfig { prebuilt_voice_config: PrebuiltVoiceConfig { voice_name: voice.to_string() } },
                }),
            },
            system_instruction: Content::text(system_instruction),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<Blob>,
}

/// Client → server frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
}

impl From<MediaInput> for ClientMessage {
    fn from(input: MediaInput) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput { media_chunks: vec![input.media] })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub turn_complete: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

/// Server → client frame. Unknown members are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
}

/// What the session controller reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    SetupComplete,
    /// User speech detected over assistant playback.
    Interrupted,
    /// One base64 audio payload.
    Audio { mime_type: String, data: String },
    TurnComplete,
    /// The server announced it will close the connection soon.
    GoAway { time_left: Option<String> },
    Closed { reason: Option<String> },
    Error(String),
}

impl ServerMessage {
    /// Flatten a frame into events.
    ///
    /// An interrupted frame yields `Interrupted` in place of its audio parts: speech
    /// cut off by the user is never scheduled.
    pub fn into_events(self) -> Vec<ServerEvent> {
        let mut events = Vec::new();

        if self.setup_complete.is_some() {
            events.push(ServerEvent::SetupComplete);
        }

        if let Some(content) = self.server_content {
            if content.interrupted {
                events.push(ServerEvent::Interrupted);
            } else {
                let parts = content.model_turn.map(|turn| turn.parts).unwrap_or_default();
                for blob in parts.into_iter().filter_map(|part| part.inline_data) {
                    if blob.mime_type.starts_with("audio/") {
                        events.push(ServerEvent::Audio { mime_type: blob.mime_type, data: blob.data });
                    }
                }
            }
            if content.turn_complete {
                events.push(ServerEvent::TurnComplete);
            }
        }

        if let Some(go_away) = self.go_away {
            events.push(ServerEvent::GoAway { time_left: go_away.time_left });
        }

        events
    }
}

/// Parse a text or binary frame payload.
pub fn parse_server_frame(payload: &[u8]) -> Result<Vec<ServerEvent>, serde_json::Error> {
    let message: ServerMessage = serde_json::from_slice(payload)?;
    Ok(message.into_events())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_setup_wire_shape() {
        let setup = ClientMessage::Setup(Setup::audio("gemini-live", "Be brief.", "Kore"));
        let value = serde_json::to_value(&setup).unwrap();
        assert_eq!(
            value,
            json!({
                "setup": {
                    "model": "models/gemini-live",
                    "generationConfig": {
                        "responseModalities": ["AUDIO"],
                        "speechConfig": { "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": "Kore" } } }
                    },
                    "systemInstruction": { "parts": [{ "text": "Be brief." }] }
                }
            })
        );
    }

    #[test]
    fn test_media_input_shapes() {
        let input = MediaInput { media: Blob { mime_type: "audio/pcm;rate=16000".into(), data: "AAA=".into() } };
        assert_eq!(
            serde_json::to_value(&input).unwrap(),
            json!({ "media": { "mimeType": "audio/pcm;rate=16000", "data": "AAA=" } })
        );
        assert_eq!(
            serde_json::to_value(ClientMessage::from(input)).unwrap(),
            json!({ "realtimeInput": { "mediaChunks": [{ "mimeType": "audio/pcm;rate=16000", "data": "AAA=" }] } })
        );
    }

    #[test]
    fn test_interrupted_frame_drops_its_audio() {
        let frame = json!({
            "serverContent": {
                "interrupted": true,
                "modelTurn": { "parts": [
                    { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": "AAAA" } },
                    { "text": "ignored" },
                    { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": "BBBB" } }
                ] },
                "turnComplete": true
            }
        });
        let events = parse_server_frame(frame.to_string().as_bytes()).unwrap();
        assert_eq!(
            events,
            vec![ServerEvent::Interrupted, ServerEvent::TurnComplete]
        );
        assert!(!events.iter().any(|event| matches!(event, ServerEvent::Audio { .. })));
    }

    #[test]
    fn test_audio_parts_keep_their_order() {
        let frame = json!({
            "serverContent": {
                "modelTurn": { "parts": [
                    { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": "AAAA" } },
                    { "text": "ignored" },
                    { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": "BBBB" } }
                ] },
                "turnComplete": true
            }
        });
        let events = parse_server_frame(frame.to_string().as_bytes()).unwrap();
        assert_eq!(
            events,
            vec![
                ServerEvent::Audio { mime_type: "audio/pcm;rate=24000".into(), data: "AAAA".into() },
                ServerEvent::Audio { mime_type: "audio/pcm;rate=24000".into(), data: "BBBB".into() },
                ServerEvent::TurnComplete,
            ]
        );
    }

    #[test]
    fn test_setup_complete_and_unknown_fields() {
        let events = parse_server_frame(br#"{"setupComplete":{},"usageMetadata":{"totalTokenCount":3}}"#).unwrap();
        assert_eq!(events, vec![ServerEvent::SetupComplete]);

        let events = parse_server_frame(br#"{"goAway":{"timeLeft":"10s"}}"#).unwrap();
        assert_eq!(events, vec![ServerEvent::GoAway { time_left: Some("10s".into()) }]);
    }

    #[test]
    fn test_rejects_non_json() {
        assert!(parse_server_frame(b"\x00\x01").is_err());
    }
}
