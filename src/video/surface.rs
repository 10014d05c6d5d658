//! Render targets shared between the camera, the encoder and the preview view

use std::fmt;

/// Encoder input surface
///
/// Created by a surface-fed encoder session; frames rendered into it are
/// encoded. The handle is opaque outside the codec that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Surface {
    id: u64,
    label: String,
}

impl Surface {
    pub fn new(id: u64, label: impl Into<String>) -> Self {
        Self {
            id,
            label: label.into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Display for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.label, self.id)
    }
}

/// Texture the camera renders its preview into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PreviewTarget {
    pub id: u64,
}

/// On-screen preview view consumed by the pipeline
///
/// The view owns the preview texture and composites it, optionally into an
/// attached encoder surface. Rendering itself happens outside this crate.
pub trait SurfaceProvider: Send + Sync {
    /// Whether the view has finished creating its preview texture
    fn is_ready(&self) -> bool;

    /// The preview texture, once ready
    fn preview_target(&self) -> Option<PreviewTarget>;

    /// Start mirroring preview frames into an encoder surface
    fn attach(&self, surface: Surface);

    /// Stop mirroring into the attached encoder surface, if any
    fn detach(&self);

    /// Resize the view to the aspect ratio of the chosen preview size
    fn request_aspect_ratio(&self, ratio: f64);
}
