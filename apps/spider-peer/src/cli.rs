use std::path::PathBuf;

use clap::{Args, Parser};

use crate::config::{DEFAULT_CHANNEL, DEFAULT_ICE_SERVER, DEFAULT_SERVER, Mode};
use crate::media::{AudioCodec, VideoCodec};
use crate::session::Role;
use crate::telemetry::logging::{LogConfig, LogLevel};
use crate::transport::webrtc::IcePolicy;

#[derive(Parser, Debug, Clone)]
#[command(name = "spider-peer")]
#[command(about = "Publish or view a live stream through a spider relay")]
pub struct Cli {
    #[arg(long, value_enum, env = "SPIDER_MODE", default_value_t = Mode::Publisher)]
    pub mode: Mode,

    /// Override which side sends the first offer
    #[arg(long, value_enum, env = "SPIDER_ROLE")]
    pub role: Option<Role>,

    /// Relay host[:port]
    #[arg(long = "spider", env = "SPIDER_SERVER", default_value = DEFAULT_SERVER)]
    pub server: String,

    #[arg(long, env = "SPIDER_CHANNEL", default_value = DEFAULT_CHANNEL)]
    pub channel: String,

    /// Full relay websocket URL; replaces the one derived from --spider/--channel
    #[arg(long, env = "SPIDER_URL")]
    pub url: Option<String>,

    /// Accept self-signed relay certificates
    #[arg(long, env = "SPIDER_INSECURE")]
    pub insecure: bool,

    /// STUN/TURN host[:port]; empty for host candidates only
    #[arg(long = "ice", env = "SPIDER_ICE_SERVER", default_value = DEFAULT_ICE_SERVER)]
    pub ice: String,

    #[arg(long, env = "SPIDER_TURN_USER")]
    pub turn_user: Option<String>,

    #[arg(long, env = "SPIDER_TURN_CREDENTIAL", hide_env_values = true)]
    pub turn_credential: Option<String>,

    #[arg(long, value_enum, default_value_t = IcePolicy::All)]
    pub ice_policy: IcePolicy,

    #[arg(long, value_enum, default_value_t = VideoCodec::H264)]
    pub vcodec: VideoCodec,

    #[arg(long, value_enum, default_value_t = AudioCodec::Opus)]
    pub acodec: AudioCodec,

    /// Publish without video
    #[arg(long)]
    pub vnouse: bool,

    /// Publish without audio
    #[arg(long)]
    pub anouse: bool,

    /// H.264 Annex-B (.h264) or IVF (.ivf) file to publish
    #[arg(long, value_name = "PATH")]
    pub video_file: Option<PathBuf>,

    /// Ogg/Opus file to publish
    #[arg(long, value_name = "PATH")]
    pub audio_file: Option<PathBuf>,

    #[arg(long, default_value_t = 33)]
    pub frame_interval_ms: u64,

    /// Viewer: write each inbound track to this directory
    #[arg(long, value_name = "DIR")]
    pub record_dir: Option<PathBuf>,

    /// Send candidates as bare `candidate` lines instead of `candidate2` records
    #[arg(long)]
    pub legacy_candidates: bool,

    #[arg(long, default_value_t = 30)]
    pub keepalive_secs: u64,

    #[arg(long, default_value_t = 4)]
    pub queue_capacity: usize,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "SPIDER_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "SPIDER_LOG_FILE",
        help = "Append logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}
