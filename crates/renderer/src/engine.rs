//! Frame loop with swapchain recovery.

use tracing::{debug, info, warn};

use lumen_core::FrameTimer;
use lumen_rhi::{Device, RhiResult};

use crate::defaults::EngineDefaults;
use crate::renderer::Renderer;

/// Registers a frame's resources and passes on a renderer.
pub type BuildFn<V> = Box<dyn FnMut(&mut Renderer<V>, &EngineDefaults) -> RhiResult<()>>;

/// Owns a [`Renderer`] and the callback that builds its passes.
///
/// When the swapchain goes stale, the whole pass set is torn down and built
/// again at the new viewport size instead of being resized in place.
pub struct Engine<V> {
    renderer: Renderer<V>,
    defaults: EngineDefaults,
    build: BuildFn<V>,
    timer: FrameTimer,
    surface_extent: (u32, u32),
    rebuild_pending: bool,
    rebuilds: u64,
}

impl<V> Engine<V> {
    /// Creates the renderer and default resources, then builds the passes.
    ///
    /// # Arguments
    ///
    /// * `device` - The device to render with
    /// * `build` - Called now and after every swapchain rebuild
    ///
    /// # Errors
    ///
    /// Returns an error if resource creation or the build callback fails.
    pub fn new<F>(mut device: Device, build: F) -> RhiResult<Self>
    where
        F: FnMut(&mut Renderer<V>, &EngineDefaults) -> RhiResult<()> + 'static,
    {
        let defaults = EngineDefaults::new(&mut device)?;
        let renderer = Renderer::new(device)?;
        let surface_extent = renderer.viewport();

        let mut engine = Self {
            renderer,
            defaults,
            build: Box::new(build),
            timer: FrameTimer::default(),
            surface_extent,
            rebuild_pending: false,
            rebuilds: 0,
        };
        (engine.build)(&mut engine.renderer, &engine.defaults)?;
        info!(
            "Engine ready with {} passes at {}x{}",
            engine.renderer.pass_count(),
            surface_extent.0,
            surface_extent.1
        );
        Ok(engine)
    }

    /// Renders one frame. Returns false if the swapchain was stale; the
    /// passes have been rebuilt by the time this returns.
    ///
    /// # Errors
    ///
    /// Returns an error if rendering or the rebuild fails.
    pub fn frame(&mut self, view: &V) -> RhiResult<bool> {
        if self.rebuild_pending {
            self.rebuild()?;
        }

        let presented = self.renderer.render(view)?;
        if !presented {
            debug!("Swapchain stale, rebuilding passes");
            self.rebuild()?;
            return Ok(false);
        }

        self.timer.tick();
        if let Some(fps) = self.timer.report() {
            info!("{:.1} fps ({:.2} ms/frame)", fps, 1000.0 / fps);
        }
        Ok(true)
    }

    /// Records a new surface size. The rebuild happens before the next frame.
    pub fn resize(&mut self, width: u32, height: u32) {
        if (width, height) != self.surface_extent {
            self.surface_extent = (width, height);
            self.rebuild_pending = true;
        }
    }

    /// Clears the renderer, recreates the swapchain and builds the passes
    /// again.
    pub fn rebuild(&mut self) -> RhiResult<()> {
        let (width, height) = self.surface_extent;
        self.renderer.clear()?;
        self.renderer.rebuild_swapchain(width, height)?;
        self.surface_extent = self.renderer.viewport();
        (self.build)(&mut self.renderer, &self.defaults)?;
        self.rebuild_pending = false;
        self.rebuilds += 1;
        info!(
            "Rebuilt {} passes at {}x{}",
            self.renderer.pass_count(),
            self.surface_extent.0,
            self.surface_extent.1
        );
        Ok(())
    }

    /// Recompiles changed shaders and rebuilds their pipelines in place.
    /// Returns how many pipelines changed.
    pub fn reload_shaders(&mut self) -> RhiResult<usize> {
        let reloaded = self.renderer.device_mut().reload_pipelines()?;
        if reloaded == 0 {
            warn!("Shader reload found no changed pipelines");
        } else {
            info!("Reloaded {} pipelines", reloaded);
        }
        Ok(reloaded)
    }

    #[inline]
    pub fn renderer(&self) -> &Renderer<V> {
        &self.renderer
    }

    #[inline]
    pub fn renderer_mut(&mut self) -> &mut Renderer<V> {
        &mut self.renderer
    }

    #[inline]
    pub fn defaults(&self) -> &EngineDefaults {
        &self.defaults
    }

    /// Number of rebuilds since the engine was created.
    #[inline]
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }

    /// Time since the engine was created.
    pub fn elapsed(&self) -> std::time::Duration {
        self.timer.elapsed()
    }
}
