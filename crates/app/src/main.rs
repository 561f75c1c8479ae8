//! lumen demo: a cleared target with an animated, tinted full-screen
//! triangle drawn over it.
//!
//! Usage: `lumen [config.toml]`. Press F5 to reload shaders, Escape to quit.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use glam::Vec4;
use tracing::{error, info, warn};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{ElementState, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::window::{Window, WindowId};

use lumen_core::{ConsoleLog, EngineConfig};
use lumen_renderer::{Engine, EngineDefaults, Renderer};
use lumen_rhi::{
    ClearValues, Device, DeviceConfig, FileResolver, Format, FramebufferSettings,
    PipelineSettings, RhiResult, TextureSettings, VulkanBackend,
};

/// Per-frame input to the passes.
struct FrameView {
    time: f32,
}

fn build_frame(renderer: &mut Renderer<FrameView>, defaults: &EngineDefaults) -> RhiResult<()> {
    let (width, height) = renderer.viewport();
    let target =
        renderer.add_render_target(TextureSettings::render_target(width, height, Format::Rgba8Unorm))?;
    let framebuffer = renderer.add_framebuffer(FramebufferSettings::default().color(target))?;

    renderer.add_pass("clear", move |ctx, _view| {
        ctx.begin_render_pass(framebuffer, Some(ClearValues::color([0.02, 0.02, 0.04, 1.0])));
        ctx.end_render_pass();
        Ok(())
    });

    let tint = renderer.add_pipeline(
        PipelineSettings::graphics("tint", framebuffer).vertex_layout(EngineDefaults::fullscreen_layout()),
    )?;
    match tint {
        Some(pipeline) => {
            let defaults = *defaults;
            renderer.add_pass("tint", move |ctx, view: &FrameView| {
                ctx.begin_render_pass(framebuffer, None);
                ctx.bind_pipeline(pipeline);
                ctx.bind_vertex_buffer(defaults.fullscreen_triangle, 0);
                ctx.bind_texture("u_Texture", defaults.white);
                ctx.uniform_value("u_Tint", &Vec4::new(0.9, 0.5, 0.2, 1.0))?;
                ctx.uniform_value("u_Time", &view.time)?;
                ctx.draw(3)?;
                ctx.end_render_pass();
                Ok(())
            });
        }
        None => warn!("Tint shader unavailable, rendering the clear pass only"),
    }

    renderer.set_present_source(target);
    Ok(())
}

struct App {
    config: EngineConfig,
    console: ConsoleLog,
    // Dropped before the window its surface was created from.
    engine: Option<Engine<FrameView>>,
    window: Option<Arc<Window>>,
    minimized: bool,
}

impl App {
    fn new(config: EngineConfig, console: ConsoleLog) -> Self {
        Self {
            config,
            console,
            engine: None,
            window: None,
            minimized: false,
        }
    }

    fn create_engine(&self, window: &Window) -> RhiResult<Engine<FrameView>> {
        let size = window.inner_size();
        let backend = VulkanBackend::new(window, size.width, size.height, &self.config)?;
        let resolver = FileResolver::new(self.config.shader_root());
        info!("Resolving shaders from {}", resolver.root().display());
        let device = Device::new(
            Box::new(backend),
            DeviceConfig::from(&self.config),
            Box::new(resolver),
        )?;
        Engine::new(device, build_frame)
    }

    fn reload_shaders(&mut self) {
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        self.console.clear();
        match engine.reload_shaders() {
            Ok(reloaded) => {
                let diagnostics = self.console.lines();
                info!(
                    "F5: {} pipelines reloaded, {} diagnostics",
                    reloaded,
                    diagnostics.len()
                );
                for line in diagnostics {
                    info!("  {}", line);
                }
            }
            Err(e) => error!("Shader reload failed: {}", e),
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let attributes = Window::default_attributes()
            .with_title("lumen")
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height))
            .with_resizable(true);
        let window = match event_loop.create_window(attributes) {
            Ok(window) => Arc::new(window),
            Err(e) => {
                error!("Failed to create window: {}", e);
                event_loop.exit();
                return;
            }
        };

        match self.create_engine(&window) {
            Ok(engine) => {
                info!("Initialization complete, entering main loop");
                self.engine = Some(engine);
                self.window = Some(window);
            }
            Err(e) => {
                error!("Failed to create engine: {}", e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested, shutting down");
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                self.minimized = size.width == 0 || size.height == 0;
                if let Some(engine) = self.engine.as_mut()
                    && !self.minimized
                {
                    engine.resize(size.width, size.height);
                }
            }
            WindowEvent::KeyboardInput { event, .. } if event.state == ElementState::Pressed && !event.repeat => {
                match event.physical_key {
                    PhysicalKey::Code(KeyCode::F5) => self.reload_shaders(),
                    PhysicalKey::Code(KeyCode::Escape) => event_loop.exit(),
                    _ => {}
                }
            }
            WindowEvent::RedrawRequested => {
                if self.minimized {
                    return;
                }
                if let Some(engine) = self.engine.as_mut() {
                    let view = FrameView {
                        time: engine.elapsed().as_secs_f32(),
                    };
                    if let Err(e) = engine.frame(&view) {
                        error!("Render error: {}", e);
                        event_loop.exit();
                    }
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = self.window.as_ref() {
            window.request_redraw();
        }
    }
}

fn main() -> Result<()> {
    let console = lumen_core::init_logging_with_console(64);

    let config = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => {
            info!("Loading config from {}", path.display());
            EngineConfig::load(&path)?
        }
        None => EngineConfig::default(),
    };

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = App::new(config, console);
    event_loop.run_app(&mut app)?;
    Ok(())
}
