use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use webrtc::media::io::Writer;
use webrtc::media::io::h264_writer::H264Writer;
use webrtc::media::io::ivf_reader::IVFFileHeader;
use webrtc::media::io::ivf_writer::IVFWriter;
use webrtc::media::io::ogg_writer::OggWriter;
use webrtc::track::track_remote::TrackRemote;

use super::{FileFormat, MediaError, OPUS_CHANNELS, OPUS_CLOCK_RATE};

/// Writes one inbound track's RTP payloads to disk.
pub struct TrackRecorder {
    writer: Box<dyn Writer + Send + Sync>,
    path: PathBuf,
    packets: u64,
}

impl TrackRecorder {
    /// `None` when the codec has no matching container.
    pub fn create(dir: &Path, track_id: &str, mime: &str) -> Result<Option<Self>, MediaError> {
        let Some(format) = FileFormat::for_mime(mime) else {
            return Ok(None);
        };
        let path = dir.join(format!("{}.{}", file_stem(track_id), format.extension()));
        let file = File::create(&path).map_err(|source| MediaError::Open {
            path: path.clone(),
            source,
        })?;
        let record_err = |reason: String| MediaError::Record {
            path: path.clone(),
            reason,
        };
        let writer: Box<dyn Writer + Send + Sync> = match format {
            FileFormat::AnnexB => Box::new(H264Writer::new(file)),
            FileFormat::Ivf => {
                let four_cc = if mime.eq_ignore_ascii_case(webrtc::api::media_engine::MIME_TYPE_VP9) {
                    *b"VP90"
                } else {
                    *b"VP80"
                };
                let header = IVFFileHeader {
                    signature: *b"DKIF",
                    version: 0,
                    header_size: 32,
                    four_cc,
                    width: 640,
                    height: 480,
                    timebase_denominator: 30,
                    timebase_numerator: 1,
                    num_frames: 900,
                    unused: 0,
                };
                Box::new(IVFWriter::new(file, &header).map_err(|err| record_err(err.to_string()))?)
            }
            FileFormat::Ogg => Box::new(
                OggWriter::new(file, OPUS_CLOCK_RATE, OPUS_CHANNELS as u8)
                    .map_err(|err| record_err(err.to_string()))?,
            ),
        };
        Ok(Some(Self {
            writer,
            path,
            packets: 0,
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn packets(&self) -> u64 {
        self.packets
    }

    pub fn write(&mut self, packet: &webrtc::rtp::packet::Packet) -> Result<(), MediaError> {
        self.writer.write_rtp(packet).map_err(|err| MediaError::Record {
            path: self.path.clone(),
            reason: err.to_string(),
        })?;
        self.packets += 1;
        Ok(())
    }

    pub fn finish(mut self) -> Result<u64, MediaError> {
        self.writer.close().map_err(|err| MediaError::Record {
            path: self.path.clone(),
            reason: err.to_string(),
        })?;
        Ok(self.packets)
    }
}

fn file_stem(track_id: &str) -> String {
    let stem: String = track_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    if stem.is_empty() { "track".to_string() } else { stem }
}

/// Drains `track` until it ends or `stop` fires, recording when a recorder
/// is supplied. Reading continues without one so the receiver keeps flowing.
pub fn spawn_drain(
    track: Arc<TrackRemote>,
    mut recorder: Option<TrackRecorder>,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let id = track.id();
        let mut received = 0u64;
        loop {
            let read = tokio::select! {
                _ = stop.cancelled() => break,
                read = track.read_rtp() => read,
            };
            let (packet, _) = match read {
                Ok(read) => read,
                Err(err) => {
                    tracing::debug!(target = "media", track = %id, error = %err, "remote track ended");
                    break;
                }
            };
            received += 1;
            if let Some(active) = recorder.as_mut() {
                if let Err(err) = active.write(&packet) {
                    tracing::warn!(target = "media", track = %id, error = %err, "recording stopped");
                    recorder = None;
                }
            }
        }
        if let Some(active) = recorder {
            let path = active.path().to_path_buf();
            match active.finish() {
                Ok(packets) => {
                    tracing::info!(target = "media", track = %id, path = %path.display(), packets, "recording closed")
                }
                Err(err) => tracing::warn!(target = "media", track = %id, error = %err, "recording close failed"),
            }
        }
        tracing::debug!(target = "media", track = %id, received, "remote track drained");
    })
}
