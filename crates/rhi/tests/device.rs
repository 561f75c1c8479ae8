//! Device-level behavior: shader sharing, pipeline reload, swapchain pacing
//! and resource lifetimes.

use lumen_core::{ConsoleLayer, ConsoleLog};
use lumen_rhi::backend::{HeadlessBackend, HeadlessEvent, HeadlessProbe, SubmitSync};
use lumen_rhi::{
    BufferKind, ClearValues, Device, DeviceConfig, FileResolver, Format, FramebufferSettings,
    MemoryResolver, PipelineSettings, SamplerSettings, TextureSettings,
};
use tracing::Level;
use tracing_subscriber::prelude::*;

const DOUBLE: &str = "\
layout(local_size_x = 64) in;
layout(set = 0, binding = 0) buffer Data { float values[]; };
void compute() { values[gl_GlobalInvocationID.x] *= 2.0; }
";

const TRIPLE: &str = "\
layout(local_size_x = 64) in;
layout(set = 0, binding = 0) buffer Data { float values[]; };
void compute() { values[gl_GlobalInvocationID.x] *= 3.0; }
";

const BROKEN: &str = "\
layout(local_size_x = 64) in;
void compute() { values[gl_GlobalInvocationID.x] = undeclared; }
";

const NO_DEFINES: &[&str] = &[];

fn device_with(resolver: MemoryResolver) -> (Device, HeadlessProbe) {
    let backend = HeadlessBackend::new();
    let probe = backend.probe();
    let device = Device::new(Box::new(backend), DeviceConfig::default(), Box::new(resolver)).unwrap();
    (device, probe)
}

fn device_with_swapchain(width: u32, height: u32) -> (Device, HeadlessProbe) {
    let backend = HeadlessBackend::new().with_swapchain(width, height, 2);
    let probe = backend.probe();
    let device = Device::new(
        Box::new(backend),
        DeviceConfig::default(),
        Box::new(MemoryResolver::new()),
    )
    .unwrap();
    (device, probe)
}

#[test]
fn test_shader_programs_are_shared_by_source_and_defines() {
    let (mut device, _probe) = device_with(MemoryResolver::new().with("double", DOUBLE));

    let first = device.compile_shader("double", NO_DEFINES).unwrap().unwrap();
    let second = device.compile_shader("double", NO_DEFINES).unwrap().unwrap();
    let defined = device.compile_shader("double", &["FAST"]).unwrap().unwrap();

    assert_eq!(first, second);
    assert_ne!(first, defined);
    assert_eq!(device.shader_uses(first), 2);
    assert_eq!(device.shader_count(), 2);

    assert!(!device.release_shader(first));
    assert!(device.release_shader(second));
    assert!(!device.shader_alive(first));
    assert!(device.shader_alive(defined));
}

#[test]
fn test_missing_shader_yields_no_pipeline() {
    let (mut device, _probe) = device_with(MemoryResolver::new());
    assert!(device.compile_shader("missing", NO_DEFINES).unwrap().is_none());
    assert!(
        device
            .create_pipeline(PipelineSettings::compute("missing"))
            .unwrap()
            .is_none()
    );
    assert_eq!(device.shader_count(), 0);
}

#[test]
fn test_pipelines_hold_a_use_of_their_shader() {
    let (mut device, _probe) = device_with(MemoryResolver::new().with("double", DOUBLE));
    let shader = device.compile_shader("double", NO_DEFINES).unwrap().unwrap();
    let pipeline = device
        .create_pipeline(PipelineSettings::compute("double"))
        .unwrap()
        .unwrap();

    assert_eq!(device.pipeline_shader(pipeline), shader);
    assert_eq!(device.shader_uses(shader), 2);

    device.destroy_pipeline(pipeline);
    assert_eq!(device.shader_uses(shader), 1);
}

#[test]
fn test_reload_rebuilds_changed_pipelines_in_place() {
    let resolver = MemoryResolver::new().with("double", DOUBLE);
    let (mut device, _probe) = device_with(resolver.clone());
    let pipeline = device
        .create_pipeline(PipelineSettings::compute("double"))
        .unwrap()
        .unwrap();
    let before = device.pipeline_shader(pipeline);

    assert_eq!(device.reload_pipelines().unwrap(), 0);
    assert_eq!(device.pipeline_shader(pipeline), before);

    resolver.insert("double", TRIPLE);
    assert_eq!(device.reload_pipelines().unwrap(), 1);
    let after = device.pipeline_shader(pipeline);
    assert_ne!(after, before);
    assert!(!device.shader_alive(before));
    assert_eq!(device.shader_count(), 1);

    // The rebuilt pipeline is still usable through the old handle.
    let data = device.create_buffer(BufferKind::Storage, 256).unwrap();
    device
        .one_shot(|ctx| {
            ctx.bind_pipeline(pipeline);
            ctx.bind_buffer("Data", data);
            ctx.dispatch(1, 1, 1)
        })
        .unwrap();
}

#[test]
fn test_reload_keeps_the_previous_program_on_compile_failure() {
    let resolver = MemoryResolver::new().with("double", DOUBLE);
    let (mut device, _probe) = device_with(resolver.clone());
    let pipeline = device
        .create_pipeline(PipelineSettings::compute("double"))
        .unwrap()
        .unwrap();
    let before = device.pipeline_shader(pipeline);

    resolver.insert("double", BROKEN);
    assert_eq!(device.reload_pipelines().unwrap(), 0);
    assert_eq!(device.pipeline_shader(pipeline), before);
    assert!(device.shader_alive(before));

    resolver.remove("double");
    assert_eq!(device.reload_pipelines().unwrap(), 0);
    assert_eq!(device.pipeline_shader(pipeline), before);
}

#[test]
fn test_file_resolver_expands_includes_and_reloads() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("common.glsl"),
        "layout(local_size_x = 64) in;\nlayout(set = 0, binding = 0) buffer Data { float values[]; };\n",
    )
    .unwrap();
    std::fs::write(
        dir.path().join("scale.glsl"),
        "#include \"common\"\nvoid compute() { values[gl_GlobalInvocationID.x] *= 2.0; }\n",
    )
    .unwrap();

    let mut device = Device::new(
        Box::new(HeadlessBackend::new()),
        DeviceConfig::default(),
        Box::new(FileResolver::new(dir.path())),
    )
    .unwrap();
    let pipeline = device
        .create_pipeline(PipelineSettings::compute("scale"))
        .unwrap()
        .expect("included source compiles");
    let shader = device.pipeline_shader(pipeline);
    assert!(device.shader(shader).table.find_name("Data").is_some());

    std::fs::write(
        dir.path().join("scale.glsl"),
        "#include \"common\"\nvoid compute() { values[gl_GlobalInvocationID.x] *= 4.0; }\n",
    )
    .unwrap();
    assert_eq!(device.reload_pipelines().unwrap(), 1);
}

#[test]
fn test_buffer_upload_and_readback() {
    let (mut device, _probe) = device_with(MemoryResolver::new());
    let buffer = device.create_buffer(BufferKind::Uniform, 64).unwrap();
    assert_eq!(device.buffer_size(buffer), 64);
    assert_eq!(device.buffer_kind(buffer), BufferKind::Uniform);

    device.upload_slice(buffer, 16, &[1.0f32, 2.0]).unwrap();
    let bytes = device.read_buffer(buffer, 16, 8).unwrap();
    let values: Vec<f32> = bytemuck::pod_collect_to_vec(&bytes);
    assert_eq!(values, vec![1.0, 2.0]);

    device.clear(buffer, 16, 8).unwrap();
    assert_eq!(device.read_buffer(buffer, 16, 8).unwrap(), vec![0; 8]);
}

#[test]
fn test_destroyed_resources_release_backend_objects() {
    let (mut device, probe) = device_with(MemoryResolver::new().with("double", DOUBLE));
    let baseline = probe.stats();

    let buffer = device.create_buffer(BufferKind::Vertex, 1024).unwrap();
    let texture = device
        .create_texture(TextureSettings::render_target(16, 16, Format::Rgba8Unorm))
        .unwrap();
    let framebuffer = device
        .create_framebuffer(FramebufferSettings::default().color(texture))
        .unwrap();
    let sampler = device.create_sampler(SamplerSettings::default()).unwrap();
    let pipeline = device
        .create_pipeline(PipelineSettings::compute("double"))
        .unwrap()
        .unwrap();

    let live = probe.stats();
    assert_eq!(live.live_buffers, baseline.live_buffers + 1);
    assert_eq!(live.live_textures, baseline.live_textures + 1);
    assert_eq!(live.live_samplers, baseline.live_samplers + 1);
    assert_eq!(live.live_pipelines, baseline.live_pipelines + 1);

    device.destroy_pipeline(pipeline);
    device.destroy_sampler(sampler);
    device.destroy_framebuffer(framebuffer);
    device.destroy_texture(texture);
    device.destroy_buffer(buffer);

    let after = probe.stats();
    assert_eq!(after.live_buffers, baseline.live_buffers);
    assert_eq!(after.live_textures, baseline.live_textures);
    assert_eq!(after.live_views, baseline.live_views);
    assert_eq!(after.live_samplers, baseline.live_samplers);
    assert_eq!(after.live_pipelines, baseline.live_pipelines);
    assert_eq!(after.live_shader_modules, baseline.live_shader_modules);
}

#[test]
fn test_acquire_render_present() {
    let (mut device, probe) = device_with_swapchain(8, 8);
    assert_eq!(device.swapchain_extent(), Some((8, 8)));
    assert_eq!(device.swapchain_image_count(), 2);
    let context = device.create_context().unwrap();

    for frame in 0..3u64 {
        assert_eq!(device.frame_index(), frame);
        let image = device.acquire_swapchain_image().unwrap().unwrap();
        let framebuffer = device
            .create_framebuffer(FramebufferSettings::default().color(image))
            .unwrap();

        let mut ctx = device.context(context);
        ctx.begin().unwrap();
        ctx.begin_render_pass(framebuffer, Some(ClearValues::color([0.0, 0.0, 1.0, 1.0])));
        ctx.end_render_pass();
        ctx.end().unwrap();
        ctx.submit().unwrap();
        drop(ctx);

        assert!(device.present().unwrap());
        device.destroy_framebuffer(framebuffer);
    }

    assert_eq!(device.frame_index(), 3);
    assert_eq!(probe.presented_pixel(3, 3), Some([0, 0, 255, 255]));
    assert_eq!(probe.stats().presents, 3);
    assert!(probe.layout_mismatches().is_empty());
    assert!(probe.events().iter().any(|event| matches!(
        event,
        HeadlessEvent::Submit {
            sync: SubmitSync::Swapchain { slot: 1 },
            ..
        }
    )));
}

#[test]
fn test_stale_swapchain_is_rebuilt_at_the_new_extent() {
    let (mut device, probe) = device_with_swapchain(8, 8);

    probe.resize_surface(16, 4);
    assert!(device.acquire_swapchain_image().unwrap().is_none());

    device.rebuild_swapchain(16, 4).unwrap();
    assert_eq!(device.swapchain_extent(), Some((16, 4)));
    assert_eq!(device.swapchain_format(), Some(Format::Rgba8Unorm));

    let image = device.acquire_swapchain_image().unwrap().unwrap();
    assert_eq!(device.texture_settings(image).width, 16);
    assert!(
        probe
            .events()
            .contains(&HeadlessEvent::SwapchainRebuilt { width: 16, height: 4 })
    );
}

#[test]
fn test_present_reports_a_stale_swapchain() {
    let (mut device, probe) = device_with_swapchain(4, 4);
    let image = device.acquire_swapchain_image().unwrap().unwrap();

    let context = device.create_context().unwrap();
    let mut ctx = device.context(context);
    ctx.begin().unwrap();
    ctx.prepare_present(image);
    ctx.end().unwrap();
    ctx.submit().unwrap();
    drop(ctx);

    probe.mark_stale();
    assert!(!device.present().unwrap());
    assert_eq!(device.frame_index(), 1);
    assert_eq!(probe.stats().presents, 0);
}

#[test]
fn test_shader_without_entry_points_logs_the_reason() {
    let resolver = MemoryResolver::new().with(
        "vertex_only",
        "void vertex() { gl_Position = vec4(0.0, 0.0, 0.0, 1.0); }\n",
    );
    let (mut device, _probe) = device_with(resolver);
    let console = ConsoleLog::new(16);
    let subscriber =
        tracing_subscriber::registry().with(ConsoleLayer::new(console.clone(), Level::WARN));

    let shader = tracing::subscriber::with_default(subscriber, || {
        device.compile_shader("vertex_only", NO_DEFINES).unwrap()
    });

    assert!(shader.is_none());
    assert_eq!(device.shader_count(), 0);
    assert!(console.contains("No suitable entrypoint combination found."));
    assert!(console.lines().iter().any(|line| line.level == Level::ERROR));
}
