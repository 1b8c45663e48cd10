//! Point-in-time view of the engine's images and containers.
//!
//! A [`Snapshot`] is captured once per top-level operation and passed
//! explicitly to resolution and correlation. It is never refreshed behind the
//! caller's back; capture a new one to observe later engine state.

use serde::Serialize;

use crate::engine::{Engine, ObjectRef};
use crate::error::Result;

/// Images and containers listed at one point in time.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Snapshot {
    /// Tagged images, in engine order.
    pub images: Vec<ObjectRef>,
    /// All containers including stopped ones, in engine order.
    pub containers: Vec<ObjectRef>,
}

impl Snapshot {
    /// Build a snapshot from already-listed objects.
    pub fn new(images: Vec<ObjectRef>, containers: Vec<ObjectRef>) -> Self {
        Self { images, containers }
    }

    /// Capture the engine's current state.
    ///
    /// Checks reachability first, so an unreachable engine fails with
    /// `EngineUnavailable` before any listing is attempted.
    pub fn capture(engine: &dyn Engine) -> Result<Self> {
        engine.ping()?;
        let images = engine.list_images(false)?;
        let containers = engine.list_containers(true)?;
        tracing::debug!(
            "captured {} images and {} containers",
            images.len(),
            containers.len()
        );
        Ok(Self { images, containers })
    }

    /// Find an image or container by full ID.
    pub fn find(&self, id: &str) -> Option<&ObjectRef> {
        self.images
            .iter()
            .chain(self.containers.iter())
            .find(|object| object.id == id)
    }

    /// Containers first, then images.
    pub fn all(&self) -> impl Iterator<Item = &ObjectRef> {
        self.containers.iter().chain(self.images.iter())
    }
}
