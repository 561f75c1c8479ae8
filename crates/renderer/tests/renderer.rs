//! Renderer and engine frames against the headless backend.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use lumen_renderer::{Engine, EngineDefaults, Renderer, TextOverlay};
use lumen_rhi::backend::{HeadlessBackend, HeadlessEvent, HeadlessProbe};
use lumen_rhi::{
    ClearValues, Context, Device, DeviceConfig, Format, FramebufferSettings, MemoryResolver,
    PipelineSettings, RhiError, RhiResult, TextureSettings,
};

const PASSTHROUGH: &str = "\
layout(location = 0) attribute vec2 a_Position;
layout(location = 0) out vec4 o_Color;

void vertex() {
    gl_Position = vec4(a_Position, 0.0, 1.0);
}

void fragment() {
    o_Color = vec4(1.0, 0.0, 0.0, 1.0);
}
";

fn device(width: u32, height: u32, frames_in_flight: u32, resolver: MemoryResolver) -> (Device, HeadlessProbe) {
    let backend = HeadlessBackend::new().with_swapchain(width, height, 3);
    let probe = backend.probe();
    let config = DeviceConfig {
        frames_in_flight,
        ..DeviceConfig::default()
    };
    let device = Device::new(Box::new(backend), config, Box::new(resolver)).unwrap();
    (device, probe)
}

/// One viewport-sized target cleared to red, drawn over with the
/// pass-through shader and blitted to the swapchain.
fn build_red_frame(renderer: &mut Renderer<()>, defaults: &EngineDefaults) -> RhiResult<()> {
    let (width, height) = renderer.viewport();
    let target =
        renderer.add_render_target(TextureSettings::render_target(width, height, Format::Rgba8Unorm))?;
    let framebuffer = renderer.add_framebuffer(FramebufferSettings::default().color(target))?;
    let pipeline = renderer
        .add_pipeline(
            PipelineSettings::graphics("passthrough", framebuffer)
                .vertex_layout(EngineDefaults::fullscreen_layout()),
        )?
        .expect("pass-through shader compiles");

    let triangle = defaults.fullscreen_triangle;
    renderer.add_pass("clear", move |ctx, _view| {
        ctx.begin_render_pass(framebuffer, Some(ClearValues::color([1.0, 0.0, 0.0, 1.0])));
        ctx.bind_pipeline(pipeline);
        ctx.bind_vertex_buffer(triangle, 0);
        ctx.draw(3)?;
        ctx.end_render_pass();
        Ok(())
    });
    renderer.set_present_source(target);
    Ok(())
}

#[test]
fn test_cleared_target_reaches_the_presented_image() {
    let resolver = MemoryResolver::new().with("passthrough", PASSTHROUGH);
    let (device, probe) = device(800, 600, 3, resolver);
    let mut engine = Engine::new(device, build_red_frame).unwrap();

    assert!(engine.frame(&()).unwrap());

    let presented = probe.presented().unwrap();
    assert_eq!((presented.width, presented.height), (800, 600));
    assert_eq!(probe.presented_pixel(0, 0), Some([255, 0, 0, 255]));
    assert_eq!(probe.stats().draws, 1);
    assert!(probe.layout_mismatches().is_empty());
}

#[test]
fn test_context_reset_waits_for_its_previous_submission() {
    let resolver = MemoryResolver::new().with("passthrough", PASSTHROUGH);
    let (device, probe) = device(16, 16, 2, resolver);
    let mut engine = Engine::new(device, build_red_frame).unwrap();
    probe.clear_events();

    for _ in 0..6 {
        assert!(engine.frame(&()).unwrap());
    }

    let mut submitted = HashMap::new();
    let mut waited = HashMap::new();
    let mut streams = Vec::new();
    for event in probe.events() {
        match event {
            HeadlessEvent::Submit { stream, serial, .. } => {
                submitted.insert(stream, serial);
                if !streams.contains(&stream) {
                    streams.push(stream);
                }
            }
            HeadlessEvent::FenceWait { stream, serial } => {
                waited.insert(stream, serial);
            }
            HeadlessEvent::Reset { stream } => {
                let last = submitted.get(&stream).copied().unwrap_or(0);
                assert_eq!(waited.get(&stream).copied().unwrap_or(0), last);
            }
            _ => {}
        }
    }
    // Frames alternate between the two contexts.
    assert_eq!(streams.len(), 2);
    assert_eq!(engine.renderer().device().frame_index(), 6);
}

#[test]
fn test_stale_swapchain_rebuilds_passes_at_the_new_size() {
    let resolver = MemoryResolver::new().with("passthrough", PASSTHROUGH);
    let (device, probe) = device(8, 8, 2, resolver);
    let builds = Rc::new(RefCell::new(0));
    let counter = builds.clone();
    let mut engine = Engine::new(device, move |renderer, defaults| {
        *counter.borrow_mut() += 1;
        build_red_frame(renderer, defaults)
    })
    .unwrap();

    assert!(engine.frame(&()).unwrap());
    probe.resize_surface(32, 16);

    assert!(!engine.frame(&()).unwrap());
    assert_eq!(engine.rebuilds(), 1);
    assert_eq!(*builds.borrow(), 2);
    assert_eq!(engine.renderer().viewport(), (32, 16));
    let source = engine.renderer().present_source().unwrap();
    assert_eq!(engine.renderer().device().texture_settings(source).width, 32);

    assert!(engine.frame(&()).unwrap());
    let presented = probe.presented().unwrap();
    assert_eq!((presented.width, presented.height), (32, 16));
    assert_eq!(probe.presented_pixel(31, 15), Some([255, 0, 0, 255]));
}

#[test]
fn test_resize_rebuilds_before_the_next_frame() {
    let resolver = MemoryResolver::new().with("passthrough", PASSTHROUGH);
    let (device, _probe) = device(8, 8, 2, resolver);
    let mut engine = Engine::new(device, build_red_frame).unwrap();

    engine.resize(8, 8);
    assert!(engine.frame(&()).unwrap());
    assert_eq!(engine.rebuilds(), 0);

    engine.resize(12, 10);
    assert!(engine.frame(&()).unwrap());
    assert_eq!(engine.rebuilds(), 1);
    assert_eq!(engine.renderer().viewport(), (12, 10));
}

#[test]
fn test_failed_pass_still_releases_the_swapchain_image() {
    let (device, probe) = device(8, 8, 2, MemoryResolver::new());
    let mut renderer: Renderer<()> = Renderer::new(device).unwrap();
    let target = renderer
        .add_render_target(TextureSettings::render_target(8, 8, Format::Rgba8Unorm))
        .unwrap();
    let framebuffer = renderer
        .add_framebuffer(FramebufferSettings::default().color(target))
        .unwrap();

    let mut fail_next = true;
    renderer.add_pass("flaky", move |ctx, _view| {
        ctx.begin_render_pass(framebuffer, Some(ClearValues::color([0.0, 1.0, 0.0, 1.0])));
        if std::mem::take(&mut fail_next) {
            return Err(RhiError::PipelineError("lost a pipeline".to_string()));
        }
        ctx.end_render_pass();
        Ok(())
    });
    let after = Rc::new(RefCell::new(0));
    let counter = after.clone();
    renderer.add_pass("after", move |_ctx, _view| {
        *counter.borrow_mut() += 1;
        Ok(())
    });
    renderer.set_present_source(target);

    let err = renderer.render(&()).unwrap_err();
    assert!(matches!(err, RhiError::PipelineError(_)));
    assert_eq!(*after.borrow(), 0);
    assert_eq!(renderer.device().frame_index(), 1);

    assert!(renderer.render(&()).unwrap());
    assert_eq!(*after.borrow(), 1);
    assert_eq!(probe.stats().presents, 2);
    assert_eq!(probe.presented_pixel(0, 0), Some([0, 255, 0, 255]));
    assert!(probe.layout_mismatches().is_empty());
}

struct Console {
    log: Rc<RefCell<Vec<String>>>,
}

impl TextOverlay for Console {
    fn render_text(&mut self, _ctx: &mut Context<'_>) -> RhiResult<()> {
        self.log.borrow_mut().push("console".to_string());
        Ok(())
    }
}

#[test]
fn test_passes_run_in_registration_order() {
    let (device, _probe) = device(4, 4, 2, MemoryResolver::new());
    let mut renderer = Renderer::new(device).unwrap();
    let order = Rc::new(RefCell::new(Vec::new()));

    for label in ["shadow", "geometry", "lighting"] {
        let order = order.clone();
        renderer.add_pass(label, move |_ctx, frame: &u32| {
            order.borrow_mut().push(format!("{}:{}", label, frame));
            Ok(())
        });
    }
    renderer.add_overlay("console", Console { log: order.clone() });

    assert_eq!(
        renderer.pass_labels().collect::<Vec<_>>(),
        ["shadow", "geometry", "lighting", "console"]
    );
    assert!(renderer.render(&7).unwrap());
    assert_eq!(
        *order.borrow(),
        ["shadow:7", "geometry:7", "lighting:7", "console"]
    );
}

#[test]
fn test_clear_destroys_tracked_resources() {
    let resolver = MemoryResolver::new().with("passthrough", PASSTHROUGH);
    let (mut device, probe) = device(8, 8, 2, resolver);
    let defaults = EngineDefaults::new(&mut device).unwrap();
    let mut renderer = Renderer::new(device).unwrap();
    let baseline = probe.stats();

    build_red_frame(&mut renderer, &defaults).unwrap();
    let built = probe.stats();
    assert_eq!(built.live_textures, baseline.live_textures + 1);
    assert_eq!(built.live_pipelines, baseline.live_pipelines + 1);

    renderer.clear().unwrap();
    let cleared = probe.stats();
    assert_eq!(cleared.live_textures, baseline.live_textures);
    assert_eq!(cleared.live_views, baseline.live_views);
    assert_eq!(cleared.live_pipelines, baseline.live_pipelines);
    assert_eq!(renderer.pass_count(), 0);
    assert!(renderer.present_source().is_none());

    defaults.destroy(renderer.device_mut());
}

#[test]
fn test_failed_pipeline_is_not_tracked() {
    let resolver = MemoryResolver::new().with("broken", "void vertex() { }\n");
    let (device, _probe) = device(8, 8, 2, resolver);
    let mut renderer: Renderer<()> = Renderer::new(device).unwrap();
    let target = renderer
        .add_render_target(TextureSettings::render_target(8, 8, Format::Rgba8Unorm))
        .unwrap();
    let framebuffer = renderer
        .add_framebuffer(FramebufferSettings::default().color(target))
        .unwrap();

    let pipeline = renderer
        .add_pipeline(PipelineSettings::graphics("broken", framebuffer))
        .unwrap();
    assert!(pipeline.is_none());
    assert_eq!(renderer.device().shader_count(), 0);
}

#[test]
fn test_shader_reload_goes_through_the_engine() {
    let resolver = MemoryResolver::new().with("passthrough", PASSTHROUGH);
    let (device, _probe) = device(8, 8, 2, resolver.clone());
    let mut engine = Engine::new(device, build_red_frame).unwrap();

    assert_eq!(engine.reload_shaders().unwrap(), 0);
    resolver.insert("passthrough", PASSTHROUGH.replace("1.0, 0.0, 0.0", "0.0, 1.0, 0.0"));
    assert_eq!(engine.reload_shaders().unwrap(), 1);
    assert!(engine.frame(&()).unwrap());
}
