//! Pass orchestration and the present loop.
//!
//! A [`Renderer`] owns the [`Device`], one command context per frame in
//! flight, and every resource the frame's passes were built from. Passes
//! run strictly in registration order; that order is the frame's
//! dependency graph.

use tracing::{debug, debug_span, info, warn};

use lumen_rhi::{
    ContextHandle, Context, Device, Filter, FramebufferHandle, FramebufferSettings,
    PipelineHandle, PipelineSettings, RhiResult, TextureHandle, TextureSettings,
};

use crate::overlay::TextOverlay;

/// Closure recording one pass of a frame for a view of type `V`.
pub type PassFn<V> = Box<dyn FnMut(&mut Context<'_>, &V) -> RhiResult<()>>;

struct Pass<V> {
    label: String,
    run: PassFn<V>,
}

/// Runs `passes` in order, stopping at the first failure.
fn run_passes<V>(passes: &mut [Pass<V>], ctx: &mut Context<'_>, view: &V) -> RhiResult<()> {
    for pass in passes {
        let _span = debug_span!("pass", label = %pass.label).entered();
        (pass.run)(ctx, view)?;
    }
    Ok(())
}

/// Ordered render passes plus the resources they use.
///
/// # Resource Ownership
///
/// Render targets, framebuffers and pipelines created through the `add_*`
/// factories are tracked and destroyed together by [`Renderer::clear`].
/// Anything created directly on the [`Device`] stays alive until the caller
/// destroys it.
pub struct Renderer<V> {
    device: Device,
    contexts: Vec<ContextHandle>,
    passes: Vec<Pass<V>>,
    render_targets: Vec<TextureHandle>,
    framebuffers: Vec<FramebufferHandle>,
    pipelines: Vec<PipelineHandle>,
    present_source: Option<TextureHandle>,
}

impl<V> Renderer<V> {
    /// Creates a renderer with one context per frame in flight.
    ///
    /// # Arguments
    ///
    /// * `device` - The device to render with; the renderer takes ownership
    ///
    /// # Errors
    ///
    /// Returns an error if a context cannot be created.
    pub fn new(mut device: Device) -> RhiResult<Self> {
        let count = device.frames_in_flight();
        let contexts = (0..count)
            .map(|_| device.create_context())
            .collect::<RhiResult<Vec<_>>>()?;

        info!(
            "Renderer created on {} backend with {} frames in flight",
            device.backend_name(),
            count
        );
        Ok(Self {
            device,
            contexts,
            passes: Vec::new(),
            render_targets: Vec::new(),
            framebuffers: Vec::new(),
            pipelines: Vec::new(),
            present_source: None,
        })
    }

    #[inline]
    pub fn device(&self) -> &Device {
        &self.device
    }

    #[inline]
    pub fn device_mut(&mut self) -> &mut Device {
        &mut self.device
    }

    /// Extent of the swapchain, or zero without one.
    pub fn viewport(&self) -> (u32, u32) {
        self.device.swapchain_extent().unwrap_or((0, 0))
    }

    /// Creates a tracked texture.
    pub fn add_render_target(&mut self, settings: TextureSettings) -> RhiResult<TextureHandle> {
        let texture = self.device.create_texture(settings)?;
        self.render_targets.push(texture);
        Ok(texture)
    }

    /// Creates a tracked framebuffer.
    pub fn add_framebuffer(&mut self, settings: FramebufferSettings) -> RhiResult<FramebufferHandle> {
        let framebuffer = self.device.create_framebuffer(settings)?;
        self.framebuffers.push(framebuffer);
        Ok(framebuffer)
    }

    /// Creates a tracked pipeline. Returns `Ok(None)` if its shader failed to
    /// compile; the diagnostics have already been logged.
    pub fn add_pipeline(&mut self, settings: PipelineSettings) -> RhiResult<Option<PipelineHandle>> {
        let pipeline = self.device.create_pipeline(settings)?;
        if let Some(pipeline) = pipeline {
            self.pipelines.push(pipeline);
        }
        Ok(pipeline)
    }

    /// Appends a pass. Passes run every frame in the order they were added.
    ///
    /// # Arguments
    ///
    /// * `label` - Name used for the pass's tracing span
    /// * `pass` - Records the pass into the frame's context
    pub fn add_pass<F>(&mut self, label: impl Into<String>, pass: F)
    where
        F: FnMut(&mut Context<'_>, &V) -> RhiResult<()> + 'static,
    {
        let label = label.into();
        debug!("Pass '{}' added at position {}", label, self.passes.len());
        self.passes.push(Pass {
            label,
            run: Box::new(pass),
        });
    }

    /// Appends a pass that draws a text overlay.
    pub fn add_overlay<O>(&mut self, label: impl Into<String>, mut overlay: O)
    where
        O: TextOverlay + 'static,
    {
        self.add_pass(label, move |ctx, _view| overlay.render_text(ctx));
    }

    /// Texture blitted onto the swapchain image at the end of each frame.
    /// Without one, passes are expected to render into the acquired image
    /// themselves.
    pub fn set_present_source(&mut self, texture: TextureHandle) {
        self.present_source = Some(texture);
    }

    pub fn present_source(&self) -> Option<TextureHandle> {
        self.present_source
    }

    pub fn pass_labels(&self) -> impl Iterator<Item = &str> {
        self.passes.iter().map(|pass| pass.label.as_str())
    }

    #[inline]
    pub fn pass_count(&self) -> usize {
        self.passes.len()
    }

    /// Renders and presents one frame.
    ///
    /// Returns `Ok(false)` if the swapchain is stale, either at acquire or
    /// at present. The caller must then [`clear`](Self::clear), rebuild the
    /// swapchain and register its passes again before the next frame.
    ///
    /// # Errors
    ///
    /// Returns an error if a pass or a native operation fails. A failing
    /// pass stops the remaining passes, but the acquired image is still
    /// submitted and presented so the next frame can acquire again.
    pub fn render(&mut self, view: &V) -> RhiResult<bool> {
        let slot = (self.device.frame_index() % self.contexts.len() as u64) as usize;
        let handle = self.contexts[slot];

        let Some(image) = self.device.acquire_swapchain_image()? else {
            return Ok(false);
        };

        let mut ctx = self.device.context(handle);
        ctx.begin()?;
        let recorded = run_passes(&mut self.passes, &mut ctx, view);
        match (&recorded, self.present_source) {
            (Ok(()), Some(source)) => ctx.blit_texture(source, image, Filter::Linear),
            (Ok(()), None) => ctx.prepare_present(image),
            (Err(err), _) => {
                warn!("Frame {} abandoned: {}", ctx.device().frame_index(), err);
                if ctx.in_render_pass() {
                    ctx.end_render_pass();
                }
                ctx.prepare_present(image);
            }
        }
        ctx.end()?;
        ctx.submit()?;
        drop(ctx);

        let presented = self.device.present()?;
        recorded.map(|()| presented)
    }

    /// Waits for the GPU, then destroys every tracked pipeline, framebuffer
    /// and render target and forgets all passes.
    pub fn clear(&mut self) -> RhiResult<()> {
        self.device.wait_idle()?;
        for pipeline in self.pipelines.drain(..) {
            self.device.destroy_pipeline(pipeline);
        }
        for framebuffer in self.framebuffers.drain(..) {
            self.device.destroy_framebuffer(framebuffer);
        }
        for texture in self.render_targets.drain(..) {
            self.device.destroy_texture(texture);
        }
        self.passes.clear();
        self.present_source = None;
        debug!("Renderer cleared");
        Ok(())
    }

    /// Recreates the swapchain for a surface of `width` x `height`.
    pub fn rebuild_swapchain(&mut self, width: u32, height: u32) -> RhiResult<()> {
        self.device.rebuild_swapchain(width, height)
    }
}
