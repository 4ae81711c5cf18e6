//! Local media acquisition.
//!
//! The camera and microphone belong to the platform media stack; this module
//! only describes what is asked of it ([`MediaDevices`]) and what comes back
//! ([`MediaStream`] of [`MediaTrack`]s). A stream holds hardware locks until
//! every track is stopped.

use async_trait::async_trait;
use callcore::FacingMode;
use log::{info, warn};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

/// One local capture track.
pub trait MediaTrack: Send + Sync + std::fmt::Debug {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    /// Releases the underlying device. Stopping twice is harmless.
    fn stop(&self);
    fn is_live(&self) -> bool;
    /// Mute (audio) or blank (video) without releasing the device.
    fn set_enabled(&self, enabled: bool);
    fn is_enabled(&self) -> bool;
}

/// What to request from the media stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    /// `None` requests no video.
    pub video: Option<FacingMode>,
}

impl MediaConstraints {
    pub fn audio_video(facing: FacingMode) -> Self {
        Self {
            audio: true,
            video: Some(facing),
        }
    }

    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: None,
        }
    }

    pub fn video_only(facing: FacingMode) -> Self {
        Self {
            audio: false,
            video: Some(facing),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("permission denied for {0}")]
    PermissionDenied(&'static str),
    #[error("device busy: {0}")]
    DeviceBusy(String),
    #[error("no matching device: {0}")]
    NotFound(String),
    #[error("media acquisition failed: {0}")]
    Other(String),
}

/// The platform's `getUserMedia`.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(&self, constraints: MediaConstraints)
    -> Result<MediaStream, MediaError>;
}

/// A set of local tracks.
#[derive(Debug, Clone, Default)]
pub struct MediaStream {
    tracks: Vec<Arc<dyn MediaTrack>>,
}

impl MediaStream {
    pub fn new(tracks: Vec<Arc<dyn MediaTrack>>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[Arc<dyn MediaTrack>] {
        &self.tracks
    }

    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &Arc<dyn MediaTrack>> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    pub fn has_video(&self) -> bool {
        self.tracks_of(TrackKind::Video).next().is_some()
    }

    pub fn live_track_count(&self) -> usize {
        self.tracks.iter().filter(|t| t.is_live()).count()
    }

    pub fn add_track(&mut self, track: Arc<dyn MediaTrack>) {
        self.tracks.push(track);
    }

    /// Stops and removes every track of `kind`.
    pub fn stop_kind(&mut self, kind: TrackKind) {
        self.tracks.retain(|t| {
            if t.kind() == kind {
                t.stop();
                false
            } else {
                true
            }
        });
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        for track in self.tracks_of(kind) {
            track.set_enabled(enabled);
        }
    }
}

/// Result of [`acquire_media`].
#[derive(Debug, Clone)]
pub struct AcquiredMedia {
    pub stream: MediaStream,
    /// Set when the camera was refused and the call degrades to audio.
    pub fallback: Option<MediaError>,
}

/// Request camera and microphone, falling back to microphone only.
///
/// Fails only when not even audio can be captured; a call never proceeds
/// without a stream.
pub async fn acquire_media(
    devices: &dyn MediaDevices,
    facing: FacingMode,
) -> Result<AcquiredMedia, MediaError> {
    match devices
        .get_user_media(MediaConstraints::audio_video(facing))
        .await
    {
        Ok(stream) => Ok(AcquiredMedia {
            stream,
            fallback: None,
        }),
        Err(video_err) => {
            warn!(
                "Camera+microphone request failed ({}), retrying audio-only",
                video_err
            );
            let stream = devices
                .get_user_media(MediaConstraints::audio_only())
                .await?;
            info!("Continuing with audio-only media");
            Ok(AcquiredMedia {
                stream,
                fallback: Some(video_err),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackMediaDevices, LoopbackTrack};

    #[tokio::test]
    async fn test_acquire_full_media() {
        let devices = LoopbackMediaDevices::new();
        let acquired = acquire_media(&devices, FacingMode::User).await.unwrap();
        assert!(acquired.fallback.is_none());
        assert!(acquired.stream.has_video());
        assert_eq!(acquired.stream.live_track_count(), 2);
    }

    #[tokio::test]
    async fn test_video_denied_falls_back_to_audio() {
        let devices = LoopbackMediaDevices::new().deny_video();
        let acquired = acquire_media(&devices, FacingMode::User).await.unwrap();
        assert_eq!(
            acquired.fallback,
            Some(MediaError::PermissionDenied("camera"))
        );
        assert!(!acquired.stream.has_video());
        assert_eq!(acquired.stream.live_track_count(), 1);
        assert_eq!(devices.request_count(), 2);
    }

    #[tokio::test]
    async fn test_total_denial_fails() {
        let devices = LoopbackMediaDevices::new().deny_all();
        let err = acquire_media(&devices, FacingMode::User).await.unwrap_err();
        assert_eq!(err, MediaError::PermissionDenied("microphone"));
    }

    #[test]
    fn test_stop_kind_removes_and_stops() {
        let audio = LoopbackTrack::new(TrackKind::Audio);
        let video = LoopbackTrack::new(TrackKind::Video);
        let mut stream = MediaStream::new(vec![
            audio.clone() as Arc<dyn MediaTrack>,
            video.clone() as Arc<dyn MediaTrack>,
        ]);

        stream.stop_kind(TrackKind::Video);

        assert!(!video.is_live());
        assert!(audio.is_live());
        assert!(!stream.has_video());
        assert_eq!(stream.tracks().len(), 1);
    }
}
