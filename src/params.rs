//! The negotiated RTP description a consumer is created with.
//!
//! Mirrors the JSON the control plane sends: codecs, encodings, header
//! extensions and RTCP parameters, camelCase on the wire. Validation of
//! the invariants (non-zero SSRCs, non-empty encodings) happens in
//! [`validate`][RtpParameters::validate]; failures are type errors
//! surfaced as request rejections, never panics.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::de;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::channel::RequestError;
use crate::rtp::{Pt, RtpHeaderExtensionUri, Ssrc};

/// Media kind of a producer or consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// A `kind/subtype` MIME pair, e.g. `audio/opus` or `video/rtx`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MimeType {
    pub kind: MediaKind,
    pub subtype: String,
}

impl MimeType {
    pub fn new(kind: MediaKind, subtype: &str) -> MimeType {
        MimeType {
            kind,
            subtype: subtype.to_string(),
        }
    }

    /// Whether this is an actual media codec, as opposed to a
    /// retransmission (RTX), forward-error-correction or comfort-noise
    /// entry. Only media codecs contribute forwardable payload types.
    pub fn is_media_codec(&self) -> bool {
        !matches!(
            self.subtype.to_ascii_lowercase().as_str(),
            "rtx" | "ulpfec" | "flexfec" | "flexfec-03" | "red" | "cn" | "telephone-event"
        )
    }

    /// Whether frames of this codec have a keyframe notion worth gating
    /// resyncs on. True for video media codecs only.
    pub fn can_be_keyframe(&self) -> bool {
        self.kind == MediaKind::Video && self.is_media_codec()
    }

    pub fn is_rtx(&self) -> bool {
        self.subtype.eq_ignore_ascii_case("rtx")
    }
}

impl fmt::Display for MimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.subtype)
    }
}

impl FromStr for MimeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, subtype) = s
            .split_once('/')
            .ok_or_else(|| format!("invalid mime type: {s}"))?;

        let kind = match kind {
            "audio" => MediaKind::Audio,
            "video" => MediaKind::Video,
            _ => return Err(format!("invalid mime kind: {kind}")),
        };

        if subtype.is_empty() {
            return Err(format!("invalid mime type: {s}"));
        }

        Ok(MimeType {
            kind,
            subtype: subtype.to_string(),
        })
    }
}

impl Serialize for MimeType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MimeType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// An `a=rtcp-fb` entry for a codec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcpFeedback {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub parameter: String,
}

/// One negotiated codec.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: MimeType,
    pub payload_type: Pt,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

impl RtpCodecParameters {
    /// Integer codec parameter, e.g. `useinbandfec` or `apt`.
    pub fn parameter_i64(&self, key: &str) -> Option<i64> {
        self.parameters.get(key).and_then(|v| v.as_i64())
    }
}

/// RTX SSRC attached to an encoding.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RtxParameters {
    pub ssrc: Ssrc,
}

/// One encoding (a stream, or one simulcast layer).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpEncodingParameters {
    #[serde(default)]
    pub ssrc: Ssrc,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codec_payload_type: Option<Pt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtx: Option<RtxParameters>,
    #[serde(default)]
    pub dtx: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scalability_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bitrate: Option<u32>,
}

/// One negotiated header extension.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpHeaderExtensionParameters {
    pub uri: RtpHeaderExtensionUri,
    pub id: u8,
    #[serde(default)]
    pub encrypt: bool,
}

/// RTCP session parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcpParameters {
    #[serde(default)]
    pub cname: String,
    #[serde(default = "default_true")]
    pub reduced_size: bool,
}

fn default_true() -> bool {
    true
}

impl Default for RtcpParameters {
    fn default() -> Self {
        RtcpParameters {
            cname: String::new(),
            reduced_size: true,
        }
    }
}

/// The full outgoing RTP description of a consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default)]
    pub header_extensions: Vec<RtpHeaderExtensionParameters>,
    #[serde(default)]
    pub encodings: Vec<RtpEncodingParameters>,
    #[serde(default)]
    pub rtcp: RtcpParameters,
}

impl RtpParameters {
    /// Enforce the construction invariants. Violations reject the
    /// creating request with a type error.
    pub fn validate(&self) -> Result<(), RequestError> {
        if self.encodings.is_empty() {
            return Err(RequestError::type_error("empty rtpParameters.encodings"));
        }

        for encoding in &self.encodings {
            if *encoding.ssrc == 0 {
                return Err(RequestError::type_error(
                    "invalid encoding in rtpParameters (missing ssrc)",
                ));
            }
            if let Some(rtx) = &encoding.rtx {
                if *rtx.ssrc == 0 {
                    return Err(RequestError::type_error(
                        "invalid encoding in rtpParameters (missing rtx.ssrc)",
                    ));
                }
            }
        }

        for exten in &self.header_extensions {
            if exten.id == 0 {
                return Err(RequestError::type_error("RTP extension id cannot be 0"));
            }
        }

        Ok(())
    }

    /// The media codec an encoding uses: its declared `codecPayloadType`
    /// if present, otherwise the first media codec.
    pub fn codec_for_encoding(
        &self,
        encoding: &RtpEncodingParameters,
    ) -> Option<&RtpCodecParameters> {
        if let Some(pt) = encoding.codec_payload_type {
            return self.codecs.iter().find(|c| c.payload_type == pt);
        }

        self.codecs.iter().find(|c| c.mime_type.is_media_codec())
    }

    /// The RTX codec associated with an encoding's media codec, matched
    /// via the `apt` parameter.
    pub fn rtx_codec_for_encoding(
        &self,
        encoding: &RtpEncodingParameters,
    ) -> Option<&RtpCodecParameters> {
        let media = self.codec_for_encoding(encoding)?;

        self.codecs.iter().find(|c| {
            c.mime_type.is_rtx() && c.parameter_i64("apt") == Some(*media.payload_type as i64)
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn parameters() -> RtpParameters {
        serde_json::from_value(json!({
            "codecs": [
                {
                    "mimeType": "video/VP8",
                    "payloadType": 101,
                    "clockRate": 90000,
                    "rtcpFeedback": [
                        { "type": "nack" },
                        { "type": "nack", "parameter": "pli" },
                        { "type": "ccm", "parameter": "fir" }
                    ]
                },
                {
                    "mimeType": "video/rtx",
                    "payloadType": 102,
                    "clockRate": 90000,
                    "parameters": { "apt": 101 }
                }
            ],
            "headerExtensions": [
                { "uri": "urn:ietf:params:rtp-hdrext:sdes:mid", "id": 4 }
            ],
            "encodings": [
                { "ssrc": 1111, "rtx": { "ssrc": 1112 } }
            ],
            "rtcp": { "cname": "cname-x" }
        }))
        .unwrap()
    }

    #[test]
    fn parse_and_validate() {
        let p = parameters();
        p.validate().unwrap();
        assert_eq!(p.codecs.len(), 2);
        assert_eq!(*p.encodings[0].ssrc, 1111);
        assert_eq!(p.rtcp.cname, "cname-x");
    }

    #[test]
    fn media_and_rtx_codec_resolution() {
        let p = parameters();
        let media = p.codec_for_encoding(&p.encodings[0]).unwrap();
        assert_eq!(*media.payload_type, 101);

        let rtx = p.rtx_codec_for_encoding(&p.encodings[0]).unwrap();
        assert_eq!(*rtx.payload_type, 102);
    }

    #[test]
    fn zero_ssrc_rejected() {
        let mut p = parameters();
        p.encodings[0].ssrc = 0.into();
        assert!(p.validate().is_err());
    }

    #[test]
    fn media_codec_classification() {
        assert!("audio/opus".parse::<MimeType>().unwrap().is_media_codec());
        assert!(!"video/rtx".parse::<MimeType>().unwrap().is_media_codec());
        assert!(!"audio/CN".parse::<MimeType>().unwrap().is_media_codec());
        assert!("video/VP8".parse::<MimeType>().unwrap().can_be_keyframe());
        assert!(!"audio/opus".parse::<MimeType>().unwrap().can_be_keyframe());
    }

    #[test]
    fn mime_roundtrip() {
        let m: MimeType = "video/VP8".parse().unwrap();
        assert_eq!(m.to_string(), "video/VP8");
        assert_eq!(serde_json::to_string(&m).unwrap(), "\"video/VP8\"");
    }
}
