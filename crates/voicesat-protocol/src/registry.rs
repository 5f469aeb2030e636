//! Message registry: type id <-> payload schema.
//!
//! The table is the single source of truth for which numeric id carries
//! which schema. Ids not in the table decode to [`Message::Unknown`] so a
//! newer hub can talk to an older satellite.

use bytes::{Bytes, BytesMut};
use prost::Message as _;

use crate::error::{ProtocolError, ProtocolResult};
use crate::framing::{Frame, encode_frame};
use crate::messages::*;

macro_rules! message_table {
    ($($id:literal => $name:ident),+ $(,)?) => {
        /// A decoded device API message.
        #[derive(Debug, Clone, PartialEq)]
        pub enum Message {
            $(
                #[doc = concat!("Type id ", stringify!($id), ".")]
                $name($name),
            )+
            /// A message this build does not know about, kept opaque.
            Unknown { type_id: u32, payload: Bytes },
        }

        impl Message {
            /// Numeric type identifier on the wire.
            pub fn type_id(&self) -> u32 {
                match self {
                    $(Self::$name(_) => $id,)+
                    Self::Unknown { type_id, .. } => *type_id,
                }
            }

            /// Schema name, for logs.
            pub fn name(&self) -> &'static str {
                match self {
                    $(Self::$name(_) => stringify!($name),)+
                    Self::Unknown { .. } => "Unknown",
                }
            }

            /// Encodes the payload without framing.
            pub fn encode_payload(&self) -> Bytes {
                match self {
                    $(Self::$name(m) => Bytes::from(m.encode_to_vec()),)+
                    Self::Unknown { payload, .. } => payload.clone(),
                }
            }

            /// Decodes a frame; unknown ids never fail.
            pub fn decode(frame: Frame) -> ProtocolResult<Self> {
                match frame.type_id {
                    $(
                        $id => $name::decode(frame.payload)
                            .map(Self::$name)
                            .map_err(|source| ProtocolError::Decode {
                                message: stringify!($name),
                                source,
                            }),
                    )+
                    type_id => Ok(Self::Unknown {
                        type_id,
                        payload: frame.payload,
                    }),
                }
            }
        }

        $(
            impl From<$name> for Message {
                fn from(message: $name) -> Self {
                    Self::$name(message)
                }
            }
        )+
    };
}

message_table! {
    1 => HelloRequest,
    2 => HelloResponse,
    3 => ConnectRequest,
    4 => ConnectResponse,
    5 => DisconnectRequest,
    6 => DisconnectResponse,
    7 => PingRequest,
    8 => PingResponse,
    9 => DeviceInfoRequest,
    10 => DeviceInfoResponse,
    11 => ListEntitiesRequest,
    17 => ListEntitiesSwitchResponse,
    18 => ListEntitiesTextSensorResponse,
    19 => ListEntitiesDoneResponse,
    20 => SubscribeStatesRequest,
    26 => SwitchStateResponse,
    27 => TextSensorStateResponse,
    33 => SwitchCommandRequest,
    34 => SubscribeHomeassistantServicesRequest,
    38 => SubscribeHomeAssistantStatesRequest,
    63 => ListEntitiesMediaPlayerResponse,
    64 => MediaPlayerStateResponse,
    65 => MediaPlayerCommandRequest,
    89 => SubscribeVoiceAssistantRequest,
    90 => VoiceAssistantRequest,
    91 => VoiceAssistantResponse,
    92 => VoiceAssistantEventResponse,
    106 => VoiceAssistantAudio,
    115 => VoiceAssistantTimerEventResponse,
    119 => VoiceAssistantAnnounceRequest,
    120 => VoiceAssistantAnnounceFinished,
    121 => VoiceAssistantConfigurationRequest,
    122 => VoiceAssistantConfigurationResponse,
    123 => VoiceAssistantSetConfiguration,
}

impl Message {
    /// Wraps this message in a frame.
    pub fn to_frame(&self) -> Frame {
        Frame::new(self.type_id(), self.encode_payload())
    }

    /// Encodes this message as framed bytes ready for the socket.
    pub fn to_bytes(&self) -> ProtocolResult<BytesMut> {
        encode_frame(self.type_id(), &self.encode_payload())
    }

    /// Returns true for messages that are only valid from the hub side of
    /// the voice pipeline.
    pub fn is_voice_event(&self) -> bool {
        matches!(
            self,
            Self::VoiceAssistantResponse(_)
                | Self::VoiceAssistantEventResponse(_)
                | Self::VoiceAssistantTimerEventResponse(_)
                | Self::VoiceAssistantAnnounceRequest(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode_frame;

    fn roundtrip(message: Message) -> Message {
        let bytes = message.to_bytes().unwrap();
        let (frame, used) = decode_frame(&bytes).unwrap().unwrap();
        assert_eq!(used, bytes.len());
        Message::decode(frame).unwrap()
    }

    #[test]
    fn hello_roundtrip() {
        let hello = Message::from(HelloRequest {
            client_info: "hub".into(),
            api_version_major: 1,
            api_version_minor: 10,
        });
        assert_eq!(hello.type_id(), 1);
        assert_eq!(roundtrip(hello.clone()), hello);
    }

    #[test]
    fn audio_chunk_roundtrip() {
        let audio = Message::from(VoiceAssistantAudio {
            data: Bytes::from_static(&[1, 2, 3, 4]),
            end: false,
        });
        assert_eq!(audio.type_id(), 106);
        assert_eq!(roundtrip(audio.clone()), audio);
    }

    #[test]
    fn unknown_type_is_opaque_not_an_error() {
        let frame = Frame::new(4000, Bytes::from_static(b"\x08\x01"));
        let message = Message::decode(frame).unwrap();
        assert_eq!(
            message,
            Message::Unknown {
                type_id: 4000,
                payload: Bytes::from_static(b"\x08\x01"),
            }
        );
        assert_eq!(message.name(), "Unknown");
        // Re-encoding an opaque message reproduces the original frame.
        assert_eq!(message.to_frame(), Frame::new(4000, Bytes::from_static(b"\x08\x01")));
    }

    #[test]
    fn malformed_known_payload_is_recoverable() {
        // Field 1 declared as length-delimited with a length past the end.
        let frame = Frame::new(3, Bytes::from_static(&[0x0A, 0x10, b'x']));
        let err = Message::decode(frame).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Decode {
                message: "ConnectRequest",
                ..
            }
        ));
        assert!(!err.is_fatal());
    }

    #[test]
    fn names_and_ids_follow_the_table() {
        let cases: Vec<(Message, u32, &str)> = vec![
            (PingRequest {}.into(), 7, "PingRequest"),
            (ListEntitiesDoneResponse {}.into(), 19, "ListEntitiesDoneResponse"),
            (MediaPlayerCommandRequest::default().into(), 65, "MediaPlayerCommandRequest"),
            (VoiceAssistantSetConfiguration::default().into(), 123, "VoiceAssistantSetConfiguration"),
        ];
        for (message, id, name) in cases {
            assert_eq!(message.type_id(), id);
            assert_eq!(message.name(), name);
        }
    }

    #[test]
    fn voice_events_are_classified() {
        assert!(Message::from(VoiceAssistantResponse::default()).is_voice_event());
        assert!(!Message::from(PingRequest {}).is_voice_event());
    }
}
