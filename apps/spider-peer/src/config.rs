use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::cli::Cli;
use crate::media::{FileFormat, MediaPlan, PublishPlan, ReceivePlan, VideoCodec};
use crate::session::{CandidateEncoding, Role, SessionConfig};
use crate::signaling::websocket::ConnectOptions;
use crate::telemetry::logging::LogConfig;
use crate::transport::webrtc::{PeerConfig, TurnCredentials};

pub const DEFAULT_SERVER: &str = "localhost:8267";
pub const DEFAULT_CHANNEL: &str = "bq5ame6g10l3jia3h0ng";
pub const DEFAULT_ICE_SERVER: &str = "cobot.center:3478";

/// Whether this process sends or receives media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Mode {
    Publisher,
    Viewer,
}

impl Mode {
    /// Relay endpoint path segment.
    pub fn path_segment(self) -> &'static str {
        match self {
            Mode::Publisher => "pub",
            Mode::Viewer => "sub",
        }
    }

    pub fn default_role(self) -> Role {
        match self {
            Mode::Publisher => Role::Initiator,
            Mode::Viewer => Role::Responder,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Publisher => "publisher",
            Mode::Viewer => "viewer",
        })
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid relay url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("publisher has neither video nor audio enabled")]
    NoMedia,
    #[error("{path} is not a {expected} file")]
    SourceFormat { path: PathBuf, expected: &'static str },
    #[error("TURN {missing} is required when {given} is set")]
    TurnIncomplete {
        missing: &'static str,
        given: &'static str,
    },
}

/// Everything the process needs, resolved once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub mode: Mode,
    pub role: Role,
    pub url: Url,
    pub insecure: bool,
    pub peer: PeerConfig,
    pub media: MediaPlan,
    pub session: SessionConfig,
    pub logging: LogConfig,
}

impl AppConfig {
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        let role = cli.role.unwrap_or_else(|| cli.mode.default_role());

        let url = match &cli.url {
            Some(raw) => Url::parse(raw).map_err(|err| ConfigError::InvalidUrl {
                url: raw.clone(),
                reason: err.to_string(),
            })?,
            None => relay_url(&cli.server, cli.mode, &cli.channel, cli.vcodec)?,
        };
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ConfigError::InvalidUrl {
                url: url.to_string(),
                reason: format!("unsupported scheme {}", url.scheme()),
            });
        }

        let turn = match (&cli.turn_user, &cli.turn_credential) {
            (Some(username), Some(credential)) => Some(TurnCredentials {
                username: username.clone(),
                credential: credential.clone(),
            }),
            (None, None) => None,
            (Some(_), None) => {
                return Err(ConfigError::TurnIncomplete {
                    missing: "credential",
                    given: "user",
                });
            }
            (None, Some(_)) => {
                return Err(ConfigError::TurnIncomplete {
                    missing: "user",
                    given: "credential",
                });
            }
        };
        let peer = PeerConfig::builder()
            .ice_host(&cli.ice, turn.as_ref())
            .ice_policy(cli.ice_policy)
            .build();

        let media = match cli.mode {
            Mode::Publisher => MediaPlan::Publish(publish_plan(cli)?),
            Mode::Viewer => MediaPlan::Receive(ReceivePlan {
                record_dir: cli.record_dir.clone(),
            }),
        };

        let session = SessionConfig {
            role,
            keepalive_interval: Duration::from_secs(cli.keepalive_secs),
            queue_capacity: cli.queue_capacity,
            candidate_encoding: if cli.legacy_candidates {
                CandidateEncoding::Legacy
            } else {
                CandidateEncoding::Structured
            },
        };

        Ok(Self {
            mode: cli.mode,
            role,
            url,
            insecure: cli.insecure,
            peer,
            media,
            session,
            logging: cli.logging.to_config(),
        })
    }

    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions::new(self.url.clone()).accept_invalid_certs(self.insecure)
    }
}

/// `wss://{server}/live/ws/{pub|sub}?channel=..&vcodec=..`
pub fn relay_url(
    server: &str,
    mode: Mode,
    channel: &str,
    vcodec: VideoCodec,
) -> Result<Url, ConfigError> {
    let base = format!("wss://{}/live/ws/{}", server.trim(), mode.path_segment());
    let mut url = Url::parse(&base).map_err(|err| ConfigError::InvalidUrl {
        url: base.clone(),
        reason: err.to_string(),
    })?;
    url.query_pairs_mut()
        .append_pair("channel", channel)
        .append_pair("vcodec", vcodec.as_str());
    Ok(url)
}

fn publish_plan(cli: &Cli) -> Result<PublishPlan, ConfigError> {
    if cli.vnouse && cli.anouse {
        return Err(ConfigError::NoMedia);
    }
    let video = (!cli.vnouse).then_some(cli.vcodec);
    let audio = (!cli.anouse).then_some(cli.acodec);

    if let (Some(codec), Some(path)) = (video, &cli.video_file) {
        check_format(path, codec.file_format())?;
    }
    if let (Some(codec), Some(path)) = (audio, &cli.audio_file) {
        check_format(path, codec.file_format())?;
    }

    Ok(PublishPlan {
        video,
        audio,
        video_file: video.and(cli.video_file.clone()),
        audio_file: audio.and(cli.audio_file.clone()),
        frame_interval: Duration::from_millis(cli.frame_interval_ms.max(1)),
    })
}

fn check_format(path: &Path, expected: FileFormat) -> Result<(), ConfigError> {
    if FileFormat::from_path(path) == Some(expected) {
        Ok(())
    } else {
        Err(ConfigError::SourceFormat {
            path: path.to_path_buf(),
            expected: expected.extension(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::AudioCodec;
    use crate::telemetry::logging::LogLevel;
    use clap::Parser;
    use std::env;
    use std::sync::{LazyLock, Mutex};

    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    const ENV_KEYS: &[&str] = &[
        "SPIDER_MODE",
        "SPIDER_ROLE",
        "SPIDER_SERVER",
        "SPIDER_CHANNEL",
        "SPIDER_URL",
        "SPIDER_INSECURE",
        "SPIDER_ICE_SERVER",
        "SPIDER_TURN_USER",
        "SPIDER_TURN_CREDENTIAL",
        "SPIDER_LOG_LEVEL",
        "SPIDER_LOG_FILE",
    ];

    fn parse(args: &[&str]) -> Cli {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let saved: Vec<_> = ENV_KEYS.iter().map(|key| (*key, env::var(key).ok())).collect();
        for key in ENV_KEYS {
            unsafe { env::remove_var(key) };
        }
        let cli = Cli::try_parse_from(std::iter::once("spider-peer").chain(args.iter().copied()))
            .unwrap();
        restore(saved);
        cli
    }

    fn restore(saved: Vec<(&str, Option<String>)>) {
        for (key, value) in saved {
            match value {
                Some(v) => unsafe { env::set_var(key, v) },
                None => unsafe { env::remove_var(key) },
            }
        }
    }

    #[test]
    fn defaults_describe_a_publisher() {
        let config = AppConfig::from_cli(&parse(&[])).unwrap();
        assert_eq!(config.mode, Mode::Publisher);
        assert_eq!(config.role, Role::Initiator);
        assert_eq!(
            config.url.as_str(),
            "wss://localhost:8267/live/ws/pub?channel=bq5ame6g10l3jia3h0ng&vcodec=h264"
        );
        assert!(!config.insecure);
        assert_eq!(config.peer.ice_servers.len(), 1);
        assert_eq!(config.peer.ice_servers[0].urls, vec!["stun:cobot.center:3478"]);
        assert_eq!(config.session.keepalive_interval, Duration::from_secs(30));
        assert_eq!(config.session.queue_capacity, 4);
        assert_eq!(config.session.candidate_encoding, CandidateEncoding::Structured);
        match config.media {
            MediaPlan::Publish(plan) => {
                assert_eq!(plan.video, Some(VideoCodec::H264));
                assert_eq!(plan.audio, Some(AudioCodec::Opus));
                assert_eq!(plan.frame_interval, Duration::from_millis(33));
            }
            other => panic!("unexpected plan {other:?}"),
        }
    }

    #[test]
    fn viewer_uses_sub_path_and_responds() {
        let cli = parse(&[
            "--mode",
            "viewer",
            "--spider",
            "relay.example:443",
            "--channel",
            "a b&c",
            "--vcodec",
            "vp8",
            "--record-dir",
            "/tmp/rec",
        ]);
        let config = AppConfig::from_cli(&cli).unwrap();
        assert_eq!(config.role, Role::Responder);
        assert_eq!(config.url.path(), "/live/ws/sub");
        let query: Vec<_> = config.url.query_pairs().into_owned().collect();
        assert_eq!(
            query,
            vec![
                ("channel".to_string(), "a b&c".to_string()),
                ("vcodec".to_string(), "vp8".to_string())
            ]
        );
        assert!(matches!(
            config.media,
            MediaPlan::Receive(ReceivePlan { record_dir: Some(ref dir) }) if dir == Path::new("/tmp/rec")
        ));
    }

    #[test]
    fn role_override_and_legacy_candidates() {
        let cli = parse(&["--mode", "viewer", "--role", "initiator", "--legacy-candidates"]);
        let config = AppConfig::from_cli(&cli).unwrap();
        assert_eq!(config.role, Role::Initiator);
        assert_eq!(config.session.role, Role::Initiator);
        assert_eq!(config.session.candidate_encoding, CandidateEncoding::Legacy);
    }

    #[test]
    fn explicit_url_wins_and_is_validated() {
        let config = AppConfig::from_cli(&parse(&["--url", "ws://127.0.0.1:9000/live/ws/pub"])).unwrap();
        assert_eq!(config.url.as_str(), "ws://127.0.0.1:9000/live/ws/pub");

        let err = AppConfig::from_cli(&parse(&["--url", "not a url"])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidUrl { .. }));

        let err = AppConfig::from_cli(&parse(&["--url", "https://relay.example/"])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidUrl { .. }));
    }

    #[test]
    fn publisher_needs_some_media() {
        let err = AppConfig::from_cli(&parse(&["--vnouse", "--anouse"])).unwrap_err();
        assert!(matches!(err, ConfigError::NoMedia));

        let config = AppConfig::from_cli(&parse(&["--vnouse", "--anouse", "--mode", "viewer"]));
        assert!(config.is_ok());
    }

    #[test]
    fn source_files_must_match_codec() {
        let err = AppConfig::from_cli(&parse(&["--vcodec", "vp8", "--video-file", "clip.h264"]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::SourceFormat { expected: "ivf", .. }));

        let config = AppConfig::from_cli(&parse(&[
            "--vcodec",
            "vp9",
            "--video-file",
            "clip.ivf",
            "--audio-file",
            "voice.ogg",
        ]))
        .unwrap();
        let MediaPlan::Publish(plan) = config.media else {
            panic!("publisher expected");
        };
        assert_eq!(plan.video_file.as_deref(), Some(Path::new("clip.ivf")));
        assert_eq!(plan.audio_file.as_deref(), Some(Path::new("voice.ogg")));
    }

    #[test]
    fn turn_needs_both_halves() {
        let err = AppConfig::from_cli(&parse(&["--turn-user", "spider"])).unwrap_err();
        assert!(matches!(err, ConfigError::TurnIncomplete { missing: "credential", .. }));

        let config = AppConfig::from_cli(&parse(&[
            "--turn-user",
            "spider",
            "--turn-credential",
            "secret",
        ]))
        .unwrap();
        assert_eq!(config.peer.ice_servers.len(), 2);

        let config = AppConfig::from_cli(&parse(&["--ice", ""])).unwrap();
        assert!(config.peer.ice_servers.is_empty());
    }

    #[test]
    fn environment_fills_unset_flags() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let saved: Vec<_> = ENV_KEYS.iter().map(|key| (*key, env::var(key).ok())).collect();
        for key in ENV_KEYS {
            unsafe { env::remove_var(key) };
        }
        unsafe {
            env::set_var("SPIDER_MODE", "viewer");
            env::set_var("SPIDER_SERVER", "env.example:8443");
            env::set_var("SPIDER_CHANNEL", "from-env");
            env::set_var("SPIDER_INSECURE", "true");
        }

        let cli = Cli::try_parse_from(["spider-peer", "--channel", "from-flag"]).unwrap();
        restore(saved);

        let config = AppConfig::from_cli(&cli).unwrap();
        assert_eq!(config.mode, Mode::Viewer);
        assert!(config.insecure);
        assert!(config.connect_options().accept_invalid_certs);
        assert_eq!(
            config.url.as_str(),
            "wss://env.example:8443/live/ws/sub?channel=from-flag&vcodec=h264"
        );
    }

    #[test]
    fn logging_flags_reach_the_app_config() {
        let config = AppConfig::from_cli(&parse(&[])).unwrap();
        assert_eq!(config.logging.level, LogLevel::Warn);
        assert!(config.logging.file.is_none());

        let config = AppConfig::from_cli(&parse(&[
            "--log-level",
            "debug",
            "--log-file",
            "/tmp/spider.log",
        ]))
        .unwrap();
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.logging.file.as_deref(), Some(std::path::Path::new("/tmp/spider.log")));
    }
}
