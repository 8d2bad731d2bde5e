//! Media collaborators attached to the peer connection: codec selection,
//! file-fed local tracks for the publisher and per-track recorders for the
//! viewer. Negotiation never looks inside any of this.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_VP8, MIME_TYPE_VP9};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

pub mod sink;
pub mod source;

pub const VIDEO_CLOCK_RATE: u32 = 90_000;
pub const OPUS_CLOCK_RATE: u32 = 48_000;
pub const OPUS_CHANNELS: u16 = 2;

const H264_FMTP: &str = "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";
const OPUS_FMTP: &str = "minptime=10;useinbandfec=1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum VideoCodec {
    H264,
    /// H.264 produced by an x264 encoder; identical on the wire.
    X264,
    Vp8,
    Vp9,
}

impl VideoCodec {
    /// Name passed to the relay in the `vcodec` query parameter.
    pub fn as_str(self) -> &'static str {
        match self {
            VideoCodec::H264 => "h264",
            VideoCodec::X264 => "x264",
            VideoCodec::Vp8 => "vp8",
            VideoCodec::Vp9 => "vp9",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            VideoCodec::H264 | VideoCodec::X264 => MIME_TYPE_H264,
            VideoCodec::Vp8 => MIME_TYPE_VP8,
            VideoCodec::Vp9 => MIME_TYPE_VP9,
        }
    }

    pub fn capability(self) -> RTCRtpCodecCapability {
        let sdp_fmtp_line = match self {
            VideoCodec::H264 | VideoCodec::X264 => H264_FMTP.to_string(),
            VideoCodec::Vp8 | VideoCodec::Vp9 => String::new(),
        };
        RTCRtpCodecCapability {
            mime_type: self.mime_type().to_string(),
            clock_rate: VIDEO_CLOCK_RATE,
            channels: 0,
            sdp_fmtp_line,
            rtcp_feedback: vec![],
        }
    }

    /// Container a source file must use for this codec.
    pub fn file_format(self) -> FileFormat {
        match self {
            VideoCodec::H264 | VideoCodec::X264 => FileFormat::AnnexB,
            VideoCodec::Vp8 | VideoCodec::Vp9 => FileFormat::Ivf,
        }
    }
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum AudioCodec {
    Opus,
}

impl AudioCodec {
    pub fn as_str(self) -> &'static str {
        match self {
            AudioCodec::Opus => "opus",
        }
    }

    pub fn capability(self) -> RTCRtpCodecCapability {
        match self {
            AudioCodec::Opus => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: OPUS_CLOCK_RATE,
                channels: OPUS_CHANNELS,
                sdp_fmtp_line: OPUS_FMTP.to_string(),
                rtcp_feedback: vec![],
            },
        }
    }

    pub fn file_format(self) -> FileFormat {
        match self {
            AudioCodec::Opus => FileFormat::Ogg,
        }
    }
}

impl fmt::Display for AudioCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// On-disk containers understood by the file sources and recorders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    /// Raw H.264 Annex-B byte stream.
    AnnexB,
    Ivf,
    Ogg,
}

impl FileFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "h264" | "264" => Some(FileFormat::AnnexB),
            "ivf" => Some(FileFormat::Ivf),
            "ogg" | "opus" => Some(FileFormat::Ogg),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            FileFormat::AnnexB => "h264",
            FileFormat::Ivf => "ivf",
            FileFormat::Ogg => "ogg",
        }
    }

    /// Recorder container for an inbound track's negotiated mime type.
    pub fn for_mime(mime: &str) -> Option<Self> {
        if mime.eq_ignore_ascii_case(MIME_TYPE_H264) {
            Some(FileFormat::AnnexB)
        } else if mime.eq_ignore_ascii_case(MIME_TYPE_VP8) || mime.eq_ignore_ascii_case(MIME_TYPE_VP9) {
            Some(FileFormat::Ivf)
        } else if mime.eq_ignore_ascii_case(MIME_TYPE_OPUS) {
            Some(FileFormat::Ogg)
        } else {
            None
        }
    }
}

/// Local media for the publisher. A track without a file is negotiated but
/// stays silent.
#[derive(Debug, Clone)]
pub struct PublishPlan {
    pub video: Option<VideoCodec>,
    pub audio: Option<AudioCodec>,
    pub video_file: Option<PathBuf>,
    pub audio_file: Option<PathBuf>,
    pub frame_interval: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct ReceivePlan {
    pub record_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub enum MediaPlan {
    Publish(PublishPlan),
    Receive(ReceivePlan),
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("cannot open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot read {path}: {reason}")]
    Source { path: PathBuf, reason: String },
    #[error("cannot record to {path}: {reason}")]
    Record { path: PathBuf, reason: String },
}
