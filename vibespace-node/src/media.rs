//! Local capture handles and the device seam.
//!
//! Media payloads never pass through the mesh; a stream here is an identity
//! plus shared enabled flags, which is all call signaling and mute gating need.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use futures::future::BoxFuture;
use thiserror::Error;
use vibespace_core::PeerId;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("capture permission denied")]
    PermissionDenied,
    #[error("no capture device available")]
    NoDevice,
}

/// A captured track. Clones share the same enabled flag.
#[derive(Debug, Clone)]
pub struct Track {
    enabled: Arc<AtomicBool>,
}

impl Track {
    fn new() -> Self {
        Self {
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaSource {
    /// Microphone, optionally with camera.
    Devices,
    /// Screen capture with its audio.
    Display,
}

#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    source: MediaSource,
    audio: Track,
    video: Option<Track>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>, with_video: bool) -> Self {
        Self {
            id: id.into(),
            source: MediaSource::Devices,
            audio: Track::new(),
            video: with_video.then(Track::new),
        }
    }

    pub fn display(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: MediaSource::Display,
            audio: Track::new(),
            video: Some(Track::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source(&self) -> MediaSource {
        self.source
    }

    pub fn audio(&self) -> &Track {
        &self.audio
    }

    pub fn video(&self) -> Option<&Track> {
        self.video.as_ref()
    }
}

/// A negotiated inbound stream from one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub peer: PeerId,
    pub stream_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    pub fn audio_video() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// Asynchronous, fallible access to capture hardware.
pub trait MediaDevices: Send + Sync {
    fn acquire(
        &self,
        constraints: MediaConstraints,
    ) -> BoxFuture<'static, Result<MediaStream, MediaError>>;

    /// Ask for a screen capture. Always carries a video track.
    fn acquire_display(&self) -> BoxFuture<'static, Result<MediaStream, MediaError>>;
}

/// Device stand-in: either grants every request or refuses with a fixed error.
#[derive(Debug, Clone)]
pub struct SyntheticMedia {
    refusal: Option<MediaError>,
}

impl SyntheticMedia {
    pub fn granted() -> Self {
        Self { refusal: None }
    }

    pub fn refusing(error: MediaError) -> Self {
        Self {
            refusal: Some(error),
        }
    }
}

impl MediaDevices for SyntheticMedia {
    fn acquire(
        &self,
        constraints: MediaConstraints,
    ) -> BoxFuture<'static, Result<MediaStream, MediaError>> {
        let refusal = self.refusal.clone();
        Box::pin(async move {
            if let Some(err) = refusal {
                return Err(err);
            }
            if !constraints.audio {
                return Err(MediaError::NoDevice);
            }
            let id = format!("capture-{:08x}", rand::random::<u32>());
            Ok(MediaStream::new(id, constraints.video))
        })
    }

    fn acquire_display(&self) -> BoxFuture<'static, Result<MediaStream, MediaError>> {
        let refusal = self.refusal.clone();
        Box::pin(async move {
            match refusal {
                Some(err) => Err(err),
                None => Ok(MediaStream::display(format!(
                    "display-{:08x}",
                    rand::random::<u32>()
                ))),
            }
        })
    }
}
