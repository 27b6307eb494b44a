use async_trait::async_trait;
use gordon_common::models::ImagePushedEvent;

/// Callbacks out of the registry into the rest of the platform.
///
/// Hook failures must never fail the push that triggered them; the
/// registry logs and moves on.
#[async_trait]
pub trait RegistryHooks: Send + Sync {
    async fn on_image_pushed(&self, event: ImagePushedEvent);
}

/// No-op hooks for tests and registry-only operation.
pub struct NoHooks;

#[async_trait]
impl RegistryHooks for NoHooks {
    async fn on_image_pushed(&self, _event: ImagePushedEvent) {}
}
