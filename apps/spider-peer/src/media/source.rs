use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use webrtc::media::Sample;
use webrtc::media::io::h264_reader::H264Reader;
use webrtc::media::io::ivf_reader::IVFReader;
use webrtc::media::io::ogg_reader::OggReader;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::{FileFormat, MediaError, OPUS_CLOCK_RATE, PublishPlan};
use crate::transport::MediaKind;

const H264_READ_BUFFER: usize = 1_048_576;
const OGG_PAGE_DURATION: Duration = Duration::from_millis(20);
const SAMPLE_BUFFER: usize = 8;

/// One send-only track plus the file that feeds it, if any.
pub struct LocalTrack {
    pub kind: MediaKind,
    pub track: Arc<TrackLocalStaticSample>,
    pub feed: Option<PathBuf>,
}

pub fn local_tracks(plan: &PublishPlan, stream_id: &str) -> Vec<LocalTrack> {
    let mut tracks = Vec::new();
    if let Some(codec) = plan.video {
        tracks.push(LocalTrack {
            kind: MediaKind::Video,
            track: Arc::new(TrackLocalStaticSample::new(
                codec.capability(),
                "video".to_string(),
                stream_id.to_string(),
            )),
            feed: plan.video_file.clone(),
        });
    }
    if let Some(codec) = plan.audio {
        tracks.push(LocalTrack {
            kind: MediaKind::Audio,
            track: Arc::new(TrackLocalStaticSample::new(
                codec.capability(),
                "audio".to_string(),
                stream_id.to_string(),
            )),
            feed: plan.audio_file.clone(),
        });
    }
    tracks
}

/// Streams `path` into `track` once the transport reports connected, until
/// the file ends or `stop` fires.
pub fn spawn_feed(
    track: Arc<TrackLocalStaticSample>,
    path: PathBuf,
    frame_interval: Duration,
    mut connected: watch::Receiver<bool>,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = stop.cancelled() => return,
            ready = connected.wait_for(|up| *up) => {
                if ready.is_err() {
                    return;
                }
            }
        }
        tracing::info!(target = "media", path = %path.display(), track = %track.id(), "feeding local track");
        match feed(&track, &path, frame_interval, &stop).await {
            Ok(samples) => {
                tracing::info!(target = "media", path = %path.display(), samples, "local track source ended")
            }
            Err(err) => tracing::error!(target = "media", error = %err, "local track source failed"),
        }
    })
}

async fn feed(
    track: &TrackLocalStaticSample,
    path: &Path,
    frame_interval: Duration,
    stop: &CancellationToken,
) -> Result<u64, MediaError> {
    let format = FileFormat::from_path(path).ok_or_else(|| MediaError::Source {
        path: path.to_path_buf(),
        reason: "unrecognised container".into(),
    })?;
    let pace = match format {
        FileFormat::Ogg => OGG_PAGE_DURATION,
        FileFormat::AnnexB | FileFormat::Ivf => frame_interval,
    };

    // The readers are synchronous; keep them off the runtime workers.
    let (tx, mut rx) = mpsc::channel(SAMPLE_BUFFER);
    let reader = {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || read_samples(&path, format, frame_interval, tx))
    };

    let mut samples = 0u64;
    let mut ticker = tokio::time::interval(pace);
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let next = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            next = rx.recv() => next,
        };
        let Some((data, duration)) = next else {
            break;
        };
        write(track, data, duration).await;
        samples += 1;
    }
    drop(rx);

    match reader.await {
        Ok(result) => result.map(|()| samples),
        Err(err) => Err(MediaError::Source {
            path: path.to_path_buf(),
            reason: format!("reader task failed: {err}"),
        }),
    }
}

/// Parses `path` on the calling thread and hands each sample to `tx`. Stops
/// quietly once the receiving side goes away.
fn read_samples(
    path: &Path,
    format: FileFormat,
    frame_interval: Duration,
    tx: mpsc::Sender<(Bytes, Duration)>,
) -> Result<(), MediaError> {
    let file = File::open(path).map_err(|source| MediaError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let reader = BufReader::new(file);
    let source_err = |reason: String| MediaError::Source {
        path: path.to_path_buf(),
        reason,
    };

    match format {
        FileFormat::AnnexB => {
            let mut h264 = H264Reader::new(reader, H264_READ_BUFFER);
            loop {
                let nal = match h264.next_nal() {
                    Ok(nal) => nal,
                    Err(err) => {
                        tracing::debug!(target = "media", error = %err, "h264 stream ended");
                        break;
                    }
                };
                if tx.blocking_send((nal.data.freeze(), frame_interval)).is_err() {
                    break;
                }
            }
        }
        FileFormat::Ivf => {
            let (mut ivf, header) = IVFReader::new(reader).map_err(|err| source_err(err.to_string()))?;
            tracing::debug!(
                target = "media",
                width = header.width,
                height = header.height,
                "ivf header"
            );
            loop {
                let frame = match ivf.parse_next_frame() {
                    Ok((frame, _)) => frame,
                    Err(err) => {
                        tracing::debug!(target = "media", error = %err, "ivf stream ended");
                        break;
                    }
                };
                if tx.blocking_send((frame.freeze(), frame_interval)).is_err() {
                    break;
                }
            }
        }
        FileFormat::Ogg => {
            let (mut ogg, _) = OggReader::new(reader, true).map_err(|err| source_err(err.to_string()))?;
            let mut last_granule = 0u64;
            loop {
                let (page, header) = match ogg.parse_next_page() {
                    Ok(page) => page,
                    Err(err) => {
                        tracing::debug!(target = "media", error = %err, "ogg stream ended");
                        break;
                    }
                };
                let sample_count = header.granule_position.saturating_sub(last_granule);
                last_granule = header.granule_position;
                let duration = Duration::from_millis(sample_count * 1000 / u64::from(OPUS_CLOCK_RATE));
                if tx.blocking_send((page.freeze(), duration)).is_err() {
                    break;
                }
            }
        }
    }
    Ok(())
}

async fn write(track: &TrackLocalStaticSample, data: Bytes, duration: Duration) {
    let sample = Sample {
        data,
        duration,
        ..Default::default()
    };
    if let Err(err) = track.write_sample(&sample).await {
        tracing::trace!(target = "media", error = %err, "sample write failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{AudioCodec, VideoCodec};

    #[test]
    fn builds_one_track_per_enabled_kind() {
        let plan = PublishPlan {
            video: Some(VideoCodec::Vp8),
            audio: None,
            video_file: Some(PathBuf::from("clip.ivf")),
            audio_file: None,
            frame_interval: Duration::from_millis(33),
        };
        let tracks = local_tracks(&plan, "spider");
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].kind, MediaKind::Video);
        assert_eq!(tracks[0].feed.as_deref(), Some(Path::new("clip.ivf")));

        let both = PublishPlan {
            audio: Some(AudioCodec::Opus),
            ..plan
        };
        let kinds: Vec<_> = local_tracks(&both, "spider").iter().map(|t| t.kind).collect();
        assert_eq!(kinds, vec![MediaKind::Video, MediaKind::Audio]);
    }

    #[tokio::test]
    async fn missing_file_is_reported() {
        let track = TrackLocalStaticSample::new(
            VideoCodec::H264.capability(),
            "video".into(),
            "spider".into(),
        );
        let err = feed(
            &track,
            Path::new("/nonexistent/clip.h264"),
            Duration::from_millis(1),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, MediaError::Open { .. }));
    }

    #[tokio::test]
    async fn truncated_ivf_header_is_a_source_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.ivf");
        std::fs::write(&path, b"DKIF").unwrap();
        let track = TrackLocalStaticSample::new(
            VideoCodec::Vp8.capability(),
            "video".into(),
            "spider".into(),
        );
        let err = feed(&track, &path, Duration::from_millis(1), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::Source { .. }));
    }

    #[tokio::test]
    async fn annex_b_file_is_fed_nal_by_nal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.h264");
        std::fs::write(
            &path,
            [
                0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x1f, // sps
                0x00, 0x00, 0x00, 0x01, 0x68, 0xce, 0x3c, 0x80, // pps
                0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x84, 0x21, // idr
            ],
        )
        .unwrap();
        let track = TrackLocalStaticSample::new(
            VideoCodec::H264.capability(),
            "video".into(),
            "spider".into(),
        );
        let samples = tokio::time::timeout(
            Duration::from_secs(5),
            feed(&track, &path, Duration::from_millis(1), &CancellationToken::new()),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(samples >= 2, "only {samples} samples fed");
    }

    #[tokio::test]
    async fn stop_ends_the_feed_early() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.h264");
        let nal = [0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x84, 0x21];
        std::fs::write(&path, nal.repeat(64)).unwrap();
        let track = TrackLocalStaticSample::new(
            VideoCodec::H264.capability(),
            "video".into(),
            "spider".into(),
        );
        let stop = CancellationToken::new();
        stop.cancel();
        let samples = tokio::time::timeout(
            Duration::from_secs(5),
            feed(&track, &path, Duration::from_millis(1), &stop),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(samples, 0);
    }
}
