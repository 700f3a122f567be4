//! Hub wire messages.
//!
//! The hub speaks a framed typed-message protocol over TCP: a 4-byte
//! little-endian length prefix followed by a JSON body. The satellite only
//! deals in the typed messages below; framing details never leak past this
//! module.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::entity::EntityDef;
use lva_ipc::IpcError;

/// Upper bound for one hub frame.
const MAX_HUB_FRAME: usize = 1024 * 1024;

/// Voice pipeline phases reported by the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoicePhase {
    RunStart,
    VadStart,
    SttEnd,
    IntentStart,
    TtsStart,
    RunEnd,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubMessage {
    Hello {
        name: String,
        mac: String,
    },
    HelloAck {
        server: String,
    },
    HelloNack {
        reason: String,
    },
    Ping,
    Pong,
    ListEntities {
        entities: Vec<EntityDef>,
    },
    EntityState {
        key: String,
        value: Value,
    },
    EntityCommand {
        key: String,
        value: Value,
    },
    VoiceStart {
        use_vad: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        wake_word_phrase: Option<String>,
    },
    VoiceStop,
    VoiceAudio {
        #[serde(with = "pcm_bytes")]
        data: Vec<i16>,
    },
    VoiceEvent {
        event: VoicePhase,
        #[serde(default)]
        data: Value,
    },
}

/// PCM samples travel as raw little-endian bytes inside the JSON string
/// field, not as a number array.
mod pcm_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    const HEX: &[u8; 16] = b"0123456789abcdef";

    pub fn serialize<S: Serializer>(samples: &[i16], serializer: S) -> Result<S::Ok, S::Error> {
        let mut out = String::with_capacity(samples.len() * 4);
        for sample in samples {
            for byte in sample.to_le_bytes() {
                out.push(HEX[(byte >> 4) as usize] as char);
                out.push(HEX[(byte & 0x0f) as usize] as char);
            }
        }
        serializer.serialize_str(&out)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<i16>, D::Error> {
        let text = String::deserialize(deserializer)?;
        if text.len() % 4 != 0 {
            return Err(serde::de::Error::custom("truncated pcm payload"));
        }
        let bytes: Vec<u8> = (0..text.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&text[i..i + 2], 16))
            .collect::<Result<_, _>>()
            .map_err(serde::de::Error::custom)?;
        Ok(bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect())
    }
}

/// Read one length-prefixed message. `Ok(None)` on clean end of stream.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<HubMessage>, IpcError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_HUB_FRAME {
        return Err(IpcError::OversizeFrame { len });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    let message = serde_json::from_slice(&body)?;
    Ok(Some(message))
}

/// Write one length-prefixed message.
pub async fn write_message<W>(writer: &mut W, message: &HubMessage) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_HUB_FRAME {
        return Err(IpcError::OversizeFrame { len: body.len() });
    }
    writer.write_all(&(body.len() as u32).to_le_bytes()).await?;
    writer.write_all(&body).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn framed_round_trip() {
        let (mut a, mut b) = duplex(64 * 1024);

        let sent = HubMessage::VoiceStart {
            use_vad: true,
            wake_word_phrase: None,
        };
        write_message(&mut a, &sent).await.unwrap();
        drop(a);

        let received = read_message(&mut b).await.unwrap().unwrap();
        assert_eq!(received, sent);
        assert!(read_message(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn audio_frames_carry_pcm() {
        let (mut a, mut b) = duplex(64 * 1024);

        let samples: Vec<i16> = vec![-32768, -1, 0, 1, 32767];
        write_message(&mut a, &HubMessage::VoiceAudio { data: samples.clone() })
            .await
            .unwrap();

        match read_message(&mut b).await.unwrap().unwrap() {
            HubMessage::VoiceAudio { data } => assert_eq!(data, samples),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversize_frame_is_rejected() {
        let (mut a, mut b) = duplex(64);
        tokio::spawn(async move {
            let _ = a.write_all(&(u32::MAX).to_le_bytes()).await;
        });
        assert!(matches!(
            read_message(&mut b).await,
            Err(IpcError::OversizeFrame { .. })
        ));
    }

    #[test]
    fn voice_event_phases_use_snake_case() {
        let json = serde_json::to_string(&HubMessage::VoiceEvent {
            event: VoicePhase::TtsStart,
            data: serde_json::json!({"url": "http://hub/tts.mp3"}),
        })
        .unwrap();
        assert!(json.contains("voice_event"));
        assert!(json.contains("tts_start"));
    }
}
