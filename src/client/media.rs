//! Local media: acquisition seam, outgoing tracks and feed switching.
//!
//! Device capture sits behind [`MediaDevices`]/[`MediaSource`] so the crate
//! has no camera/microphone dependencies and tests inject synthetic sources.
//! Each local track is one [`TrackLocalStaticSample`] shared by every peer
//! connection; a pump task copies frames from the current source into it.
//! Screen share swaps the pump's source in place, so the track object the
//! peer connections negotiated never changes and no renegotiation happens.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::config::{AudioConstraints, QualityPreset, VideoConstraints};
use crate::error::{GreenroomError, Result};

/// One encoded media frame ready for a local track.
#[derive(Debug, Clone)]
pub struct MediaFrame {
    pub data: Bytes,
    pub duration: Duration,
}

/// A stream of encoded frames. `None` means the source ended: device
/// unplugged, or the user stopped a screen share from the OS picker.
#[async_trait]
pub trait MediaSource: Send {
    async fn next_frame(&mut self) -> Option<MediaFrame>;
}

/// Capture-device seam, implemented outside this crate (or by tests).
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn open_microphone(&self, constraints: &AudioConstraints) -> Result<Box<dyn MediaSource>>;
    async fn open_camera(&self, constraints: &VideoConstraints) -> Result<Box<dyn MediaSource>>;
    async fn open_display(&self) -> Result<Box<dyn MediaSource>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedKind {
    Camera,
    Screen,
}

/// Out-of-band notifications from the video pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedEvent {
    /// The display source ended on its own; the pump reverted to camera.
    ScreenShareEnded,
}

struct FeedSwitch {
    source: Box<dyn MediaSource>,
    kind: FeedKind,
}

/// Locally acquired media and its pump tasks.
pub struct LocalMedia {
    devices: Arc<dyn MediaDevices>,
    preset: QualityPreset,
    audio_track: Arc<TrackLocalStaticSample>,
    video_track: Option<Arc<TrackLocalStaticSample>>,
    audio_enabled: Arc<AtomicBool>,
    video_enabled: Arc<AtomicBool>,
    feed_tx: Option<mpsc::UnboundedSender<FeedSwitch>>,
    pumps: Vec<JoinHandle<()>>,
}

impl LocalMedia {
    /// Acquire microphone and camera at the given preset. A failing camera
    /// degrades to audio-only (the second return value); a failing
    /// microphone is a hard [`GreenroomError::MediaAcquisition`].
    pub async fn acquire(
        devices: Arc<dyn MediaDevices>,
        preset: QualityPreset,
        feed_events: mpsc::UnboundedSender<FeedEvent>,
    ) -> Result<(Self, bool)> {
        let microphone = devices
            .open_microphone(&preset.audio())
            .await
            .map_err(|e| GreenroomError::MediaAcquisition(format!("microphone: {e}")))?;

        let camera = match devices.open_camera(&preset.video()).await {
            Ok(source) => Some(source),
            Err(err) => {
                warn!(error = %err, "camera unavailable, degrading to audio-only");
                None
            }
        };
        let degraded = camera.is_none();

        let audio_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            "greenroom".to_owned(),
        ));
        let audio_enabled = Arc::new(AtomicBool::new(true));
        let video_enabled = Arc::new(AtomicBool::new(true));

        let mut pumps = Vec::new();
        pumps.push(tokio::spawn(audio_pump(
            microphone,
            audio_track.clone(),
            audio_enabled.clone(),
        )));

        let mut video_track = None;
        let mut feed_tx = None;
        if let Some(camera) = camera {
            let track = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    ..Default::default()
                },
                "video".to_owned(),
                "greenroom".to_owned(),
            ));
            let (tx, rx) = mpsc::unbounded_channel();
            pumps.push(tokio::spawn(video_pump(
                camera,
                track.clone(),
                video_enabled.clone(),
                rx,
                devices.clone(),
                preset.video(),
                feed_events,
            )));
            video_track = Some(track);
            feed_tx = Some(tx);
        }

        Ok((
            Self {
                devices,
                preset,
                audio_track,
                video_track,
                audio_enabled,
                video_enabled,
                feed_tx,
                pumps,
            },
            degraded,
        ))
    }

    /// Tracks to add to each new peer connection.
    pub fn tracks(&self) -> Vec<Arc<TrackLocalStaticSample>> {
        let mut tracks = vec![self.audio_track.clone()];
        if let Some(video) = &self.video_track {
            tracks.push(video.clone());
        }
        tracks
    }

    pub fn video_track(&self) -> Option<Arc<TrackLocalStaticSample>> {
        self.video_track.clone()
    }

    pub fn is_audio_only(&self) -> bool {
        self.video_track.is_none()
    }

    /// Mute/unmute without renegotiation: the pump simply stops writing.
    pub fn set_audio_enabled(&self, enabled: bool) {
        self.audio_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        self.video_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled.load(Ordering::Relaxed)
    }

    pub fn video_enabled(&self) -> bool {
        self.video_enabled.load(Ordering::Relaxed)
    }

    /// Replace the video feed with display capture. The outgoing track is
    /// untouched; only its payload source changes.
    pub async fn start_screen_share(&self) -> Result<()> {
        let feed_tx = self.feed_tx.as_ref().ok_or_else(|| {
            GreenroomError::MediaAcquisition("no video track (audio-only session)".into())
        })?;
        let display = self.devices.open_display().await?;
        feed_tx
            .send(FeedSwitch { source: display, kind: FeedKind::Screen })
            .map_err(|_| GreenroomError::MediaAcquisition("video pump stopped".into()))?;
        Ok(())
    }

    /// Revert the video feed to the camera.
    pub async fn stop_screen_share(&self) -> Result<()> {
        let feed_tx = self.feed_tx.as_ref().ok_or_else(|| {
            GreenroomError::MediaAcquisition("no video track (audio-only session)".into())
        })?;
        let camera = self.devices.open_camera(&self.preset.video()).await?;
        feed_tx
            .send(FeedSwitch { source: camera, kind: FeedKind::Camera })
            .map_err(|_| GreenroomError::MediaAcquisition("video pump stopped".into()))?;
        Ok(())
    }

    /// Stop all local capture.
    pub fn close(&mut self) {
        self.feed_tx = None;
        for pump in self.pumps.drain(..) {
            pump.abort();
        }
    }
}

impl std::fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMedia")
            .field("preset", &self.preset)
            .field("audio_enabled", &self.audio_enabled)
            .field("video_enabled", &self.video_enabled)
            .finish_non_exhaustive()
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        self.close();
    }
}

async fn audio_pump(
    mut source: Box<dyn MediaSource>,
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
) {
    while let Some(frame) = source.next_frame().await {
        if !enabled.load(Ordering::Relaxed) {
            continue;
        }
        let sample = Sample {
            data: frame.data,
            duration: frame.duration,
            ..Default::default()
        };
        if track.write_sample(&sample).await.is_err() {
            break;
        }
    }
    debug!("audio source ended");
}

async fn video_pump(
    camera: Box<dyn MediaSource>,
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
    mut switches: mpsc::UnboundedReceiver<FeedSwitch>,
    devices: Arc<dyn MediaDevices>,
    constraints: VideoConstraints,
    feed_events: mpsc::UnboundedSender<FeedEvent>,
) {
    let mut source = camera;
    let mut kind = FeedKind::Camera;
    loop {
        // Apply pending feed switches between frames.
        while let Ok(switch) = switches.try_recv() {
            source = switch.source;
            kind = switch.kind;
        }
        match source.next_frame().await {
            Some(frame) => {
                if !enabled.load(Ordering::Relaxed) {
                    continue;
                }
                let sample = Sample {
                    data: frame.data,
                    duration: frame.duration,
                    ..Default::default()
                };
                if track.write_sample(&sample).await.is_err() {
                    break;
                }
            }
            None => match kind {
                FeedKind::Screen => {
                    // The browser/OS ended the share out-of-band: revert to
                    // camera and tell the manager so it can broadcast the
                    // toggle.
                    let _ = feed_events.send(FeedEvent::ScreenShareEnded);
                    match devices.open_camera(&constraints).await {
                        Ok(camera) => {
                            source = camera;
                            kind = FeedKind::Camera;
                        }
                        Err(err) => {
                            warn!(error = %err, "camera reacquisition failed after screen share");
                            match switches.recv().await {
                                Some(switch) => {
                                    source = switch.source;
                                    kind = switch.kind;
                                }
                                None => break,
                            }
                        }
                    }
                }
                FeedKind::Camera => {
                    debug!("camera source ended, waiting for a replacement feed");
                    match switches.recv().await {
                        Some(switch) => {
                            source = switch.source;
                            kind = switch.kind;
                        }
                        None => break,
                    }
                }
            },
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::TestDevices;
    use super::*;
    use std::sync::atomic::Ordering::SeqCst;

    #[tokio::test]
    async fn camera_failure_degrades_to_audio_only() {
        let devices = Arc::new(TestDevices { fail_camera: true, ..Default::default() });
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (media, degraded) = LocalMedia::acquire(devices, QualityPreset::Medium, events_tx)
            .await
            .unwrap();
        assert!(degraded);
        assert!(media.is_audio_only());
        assert_eq!(media.tracks().len(), 1);
    }

    #[tokio::test]
    async fn microphone_failure_is_fatal() {
        let devices = Arc::new(TestDevices { fail_microphone: true, ..Default::default() });
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let err = LocalMedia::acquire(devices, QualityPreset::Medium, events_tx)
            .await
            .unwrap_err();
        assert!(matches!(err, GreenroomError::MediaAcquisition(_)));
    }

    #[tokio::test]
    async fn screen_share_end_reverts_to_camera_without_replacing_the_track() {
        let devices = Arc::new(TestDevices { display_frames: 2, ..Default::default() });
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (media, degraded) =
            LocalMedia::acquire(devices.clone(), QualityPreset::Medium, events_tx)
                .await
                .unwrap();
        assert!(!degraded);
        let track_before = media.video_track().unwrap();
        assert_eq!(devices.camera_opens.load(SeqCst), 1);

        media.start_screen_share().await.unwrap();
        assert_eq!(devices.display_opens.load(SeqCst), 1);

        // The two display frames drain, then the pump reverts on its own.
        let event = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .expect("pump never reported the share ending")
            .unwrap();
        assert_eq!(event, FeedEvent::ScreenShareEnded);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(devices.camera_opens.load(SeqCst), 2);

        // Same track object throughout: nothing to renegotiate.
        let track_after = media.video_track().unwrap();
        assert!(Arc::ptr_eq(&track_before, &track_after));
    }

    #[tokio::test]
    async fn explicit_stop_reopens_the_camera() {
        let devices = Arc::new(TestDevices { display_frames: 10_000, ..Default::default() });
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (media, _) = LocalMedia::acquire(devices.clone(), QualityPreset::Medium, events_tx)
            .await
            .unwrap();

        media.start_screen_share().await.unwrap();
        media.stop_screen_share().await.unwrap();
        assert_eq!(devices.camera_opens.load(SeqCst), 2);
    }

    #[tokio::test]
    async fn toggles_flip_flags_without_touching_tracks() {
        let devices = Arc::new(TestDevices::default());
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (media, _) = LocalMedia::acquire(devices, QualityPreset::Medium, events_tx)
            .await
            .unwrap();

        let track = media.video_track().unwrap();
        media.set_video_enabled(false);
        media.set_audio_enabled(false);
        assert!(!media.video_enabled());
        assert!(!media.audio_enabled());
        assert!(Arc::ptr_eq(&track, &media.video_track().unwrap()));
    }
}
