//! Debug text overlay hook.

use lumen_rhi::{Context, RhiResult};

/// Something that draws text over the frame, such as a debug console.
///
/// Registered with [`Renderer::add_overlay`](crate::Renderer::add_overlay),
/// it runs as an ordinary pass after the passes added before it.
pub trait TextOverlay {
    /// Records the overlay's draws into `ctx`.
    fn render_text(&mut self, ctx: &mut Context<'_>) -> RhiResult<()>;
}

impl<F> TextOverlay for F
where
    F: FnMut(&mut Context<'_>) -> RhiResult<()>,
{
    fn render_text(&mut self, ctx: &mut Context<'_>) -> RhiResult<()> {
        self(ctx)
    }
}
