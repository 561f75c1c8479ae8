//! Command contexts recorded against the headless backend.

use lumen_rhi::backend::{HeadlessBackend, HeadlessProbe};
use lumen_rhi::{
    BufferKind, ClearValues, Device, DeviceConfig, Filter, Format, FramebufferSettings,
    ImageLayout, MemoryResolver, PipelineSettings, TextureSettings,
};

const TEXTURED: &str = "\
layout(location = 0) attribute vec2 a_Position;
layout(location = 0) varying vec2 v_Uv;
layout(location = 0) out vec4 o_Color;

layout(set = 0, binding = 0) uniform Globals {
    vec4 u_Tint;
    float u_Scale;
};
layout(set = 0, binding = 1) uniform texture2D u_Texture;
layout(set = 0, binding = 2) uniform sampler u_Sampler;

void vertex() {
    v_Uv = a_Position * 0.5 + 0.5;
    gl_Position = vec4(a_Position * u_Scale, 0.0, 1.0);
}

void fragment() {
    o_Color = texture(sampler2D(u_Texture, u_Sampler), v_Uv) * u_Tint;
}
";

const DOUBLE: &str = "\
layout(local_size_x = 64) in;
layout(set = 0, binding = 0) buffer Data {
    float values[];
};

void compute() {
    values[gl_GlobalInvocationID.x] *= 2.0;
}
";

fn setup() -> (Device, HeadlessProbe) {
    let backend = HeadlessBackend::new();
    let probe = backend.probe();
    let resolver = MemoryResolver::new()
        .with("textured", TEXTURED)
        .with("double", DOUBLE);
    let device = Device::new(
        Box::new(backend),
        DeviceConfig::default(),
        Box::new(resolver),
    )
    .unwrap();
    (device, probe)
}

#[test]
fn test_identical_bindings_reuse_one_descriptor_set() {
    let (mut device, probe) = setup();
    let target = device
        .create_texture(TextureSettings::render_target(8, 8, Format::Rgba8Unorm))
        .unwrap();
    let albedo = device
        .create_texture(TextureSettings::render_target(4, 4, Format::Rgba8Unorm))
        .unwrap();
    let framebuffer = device
        .create_framebuffer(FramebufferSettings::default().color(target))
        .unwrap();
    let pipeline = device
        .create_pipeline(PipelineSettings::graphics("textured", framebuffer))
        .unwrap()
        .expect("textured shader compiles");
    let context = device.create_context().unwrap();

    let mut ctx = device.context(context);
    ctx.begin().unwrap();
    ctx.begin_render_pass(framebuffer, Some(ClearValues::color([0.0, 0.0, 0.0, 1.0])));
    ctx.bind_pipeline(pipeline);
    ctx.bind_texture("u_Texture", albedo);
    for scale in [1.0f32, 0.5, 0.25] {
        ctx.uniform_value("u_Scale", &scale).unwrap();
        ctx.draw(3).unwrap();
    }
    ctx.end_render_pass();
    ctx.end().unwrap();

    let stats = ctx.stats();
    assert_eq!(stats.draws, 3);
    assert_eq!(stats.descriptor_sets_allocated, 1);
    assert_eq!(stats.descriptor_cache_hits, 2);
    // Uniform block, texture and the default sampler.
    assert_eq!(stats.descriptor_writes, 3);

    ctx.submit_and_wait().unwrap();
    drop(ctx);

    assert_eq!(probe.stats().draws, 3);
    assert!(probe.layout_mismatches().is_empty());
}

#[test]
fn test_render_pass_clear_reaches_the_target() {
    let (mut device, probe) = setup();
    let target = device
        .create_texture(TextureSettings::render_target(4, 4, Format::Rgba8Unorm))
        .unwrap();
    let framebuffer = device
        .create_framebuffer(FramebufferSettings::default().color(target))
        .unwrap();

    device
        .one_shot(|ctx| {
            ctx.begin_render_pass(framebuffer, Some(ClearValues::color([1.0, 0.0, 0.0, 1.0])));
            ctx.end_render_pass();
            Ok(())
        })
        .unwrap();

    let pixels = device.read_pixels(target, 0, 0).unwrap();
    assert_eq!(pixels.len(), 4 * 4 * 4);
    assert_eq!(&pixels[..4], &[255, 0, 0, 255]);
    assert!(probe.layout_mismatches().is_empty());
}

#[test]
fn test_compute_dispatch_binds_storage_and_fences_writes() {
    let (mut device, probe) = setup();
    let data = device.create_buffer(BufferKind::Storage, 256).unwrap();
    let pipeline = device
        .create_pipeline(PipelineSettings::compute("double"))
        .unwrap()
        .expect("compute shader compiles");

    device
        .one_shot(|ctx| {
            ctx.bind_pipeline(pipeline);
            ctx.bind_buffer("Data", data);
            ctx.dispatch(1, 1, 1)?;
            ctx.dispatch(1, 1, 1)?;
            let stats = ctx.stats();
            assert_eq!(stats.dispatches, 2);
            assert_eq!(stats.descriptor_sets_allocated, 1);
            Ok(())
        })
        .unwrap();

    assert_eq!(probe.stats().dispatches, 2);
}

#[test]
fn test_scratch_ring_grows_past_its_first_buffer() {
    let backend = HeadlessBackend::new();
    let resolver = MemoryResolver::new().with("textured", TEXTURED);
    let config = DeviceConfig {
        scratch_ring_size: 4096,
        ..DeviceConfig::default()
    };
    let mut device = Device::new(Box::new(backend), config, Box::new(resolver)).unwrap();

    let target = device
        .create_texture(TextureSettings::render_target(4, 4, Format::Rgba8Unorm))
        .unwrap();
    let albedo = device
        .create_texture(TextureSettings::render_target(4, 4, Format::Rgba8Unorm))
        .unwrap();
    let framebuffer = device
        .create_framebuffer(FramebufferSettings::default().color(target))
        .unwrap();
    let pipeline = device
        .create_pipeline(PipelineSettings::graphics("textured", framebuffer))
        .unwrap()
        .unwrap();

    device
        .one_shot(|ctx| {
            ctx.begin_render_pass(framebuffer, None);
            ctx.bind_pipeline(pipeline);
            ctx.bind_texture("u_Texture", albedo);
            // Each draw takes one aligned block; 4096 bytes hold 16 of them.
            for _ in 0..40 {
                ctx.uniform_value("u_Tint", &[1.0f32, 1.0, 1.0, 1.0])?;
                ctx.draw(3)?;
            }
            ctx.end_render_pass();
            assert!(ctx.scratch_buffers_created() >= 2);
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_depth_and_storage_textures_are_sampled_in_their_resting_layouts() {
    let (mut device, probe) = setup();
    let target = device
        .create_texture(TextureSettings::render_target(8, 8, Format::Rgba8Unorm))
        .unwrap();
    let shadow = device.create_texture(TextureSettings::depth(8, 8)).unwrap();
    let field = device
        .create_texture(TextureSettings::storage(8, 8, Format::Rgba8Unorm))
        .unwrap();
    let depth_pass = device
        .create_framebuffer(FramebufferSettings::default().color(target).depth(shadow))
        .unwrap();
    let color_pass = device
        .create_framebuffer(FramebufferSettings::default().color(target))
        .unwrap();
    let pipeline = device
        .create_pipeline(PipelineSettings::graphics("textured", color_pass))
        .unwrap()
        .expect("textured shader compiles");

    device
        .one_shot(|ctx| {
            ctx.begin_render_pass(depth_pass, Some(ClearValues::color([0.0, 0.0, 0.0, 1.0])));
            ctx.end_render_pass();

            ctx.begin_render_pass(color_pass, None);
            ctx.bind_pipeline(pipeline);
            ctx.bind_texture("u_Texture", shadow);
            ctx.draw(3)?;
            ctx.bind_texture("u_Texture", field);
            ctx.draw(3)?;
            ctx.end_render_pass();
            Ok(())
        })
        .unwrap();

    assert_eq!(probe.stats().draws, 2);
    assert!(probe.layout_mismatches().is_empty());
}

#[test]
fn test_sampling_the_pass_attachment_is_reported() {
    let (mut device, probe) = setup();
    let target = device
        .create_texture(TextureSettings::render_target(8, 8, Format::Rgba8Unorm))
        .unwrap();
    let framebuffer = device
        .create_framebuffer(FramebufferSettings::default().color(target))
        .unwrap();
    let pipeline = device
        .create_pipeline(PipelineSettings::graphics("textured", framebuffer))
        .unwrap()
        .expect("textured shader compiles");

    device
        .one_shot(|ctx| {
            ctx.begin_render_pass(framebuffer, None);
            ctx.bind_pipeline(pipeline);
            ctx.bind_texture("u_Texture", target);
            ctx.draw(3)?;
            ctx.end_render_pass();
            Ok(())
        })
        .unwrap();

    let mismatches = probe.layout_mismatches();
    assert_eq!(mismatches.len(), 1);
    assert_eq!(mismatches[0].command, "Draw");
    assert_eq!(mismatches[0].expected, ImageLayout::ShaderReadOnly);
    assert_eq!(mismatches[0].actual, ImageLayout::ColorAttachment);
}

#[test]
fn test_blit_and_copy_keep_layouts_consistent() {
    let (mut device, probe) = setup();
    let source = device
        .create_texture(TextureSettings::render_target(8, 8, Format::Rgba8Unorm))
        .unwrap();
    let half = device
        .create_texture(TextureSettings::render_target(4, 4, Format::Rgba8Unorm))
        .unwrap();
    let copy = device
        .create_texture(TextureSettings::render_target(8, 8, Format::Rgba8Unorm))
        .unwrap();

    device
        .one_shot(|ctx| {
            ctx.clear_texture(source, [0.0, 1.0, 0.0, 1.0]);
            ctx.blit_texture(source, half, Filter::Linear);
            ctx.copy_texture(source, copy);
            Ok(())
        })
        .unwrap();

    assert_eq!(&device.read_pixels(half, 0, 0).unwrap()[..4], &[0, 255, 0, 255]);
    assert_eq!(&device.read_pixels(copy, 0, 0).unwrap()[..4], &[0, 255, 0, 255]);
    assert!(probe.layout_mismatches().is_empty());
}

#[test]
fn test_generated_mips_average_the_base_level() {
    let (mut device, probe) = setup();
    let settings = TextureSettings::render_target(4, 4, Format::Rgba8Unorm).with_mip_chain();
    let texture = device.create_texture(settings).unwrap();

    let mut texels = Vec::with_capacity(4 * 4 * 4);
    for y in 0..4 {
        for _ in 0..4 {
            let value = if y < 2 { 255 } else { 0 };
            texels.extend_from_slice(&[value, value, value, 255]);
        }
    }
    device.upload_texture(texture, &texels).unwrap();

    let smallest = device.read_pixels(texture, 2, 0).unwrap();
    assert_eq!(smallest.len(), 4);
    assert!((126..=129).contains(&smallest[0]));
    assert!(probe.layout_mismatches().is_empty());
}

#[test]
#[should_panic(expected = "has nothing bound")]
fn test_draw_with_unbound_texture_panics() {
    let (mut device, _probe) = setup();
    let target = device
        .create_texture(TextureSettings::render_target(4, 4, Format::Rgba8Unorm))
        .unwrap();
    let framebuffer = device
        .create_framebuffer(FramebufferSettings::default().color(target))
        .unwrap();
    let pipeline = device
        .create_pipeline(PipelineSettings::graphics("textured", framebuffer))
        .unwrap()
        .unwrap();

    let _ = device.one_shot(|ctx| {
        ctx.begin_render_pass(framebuffer, None);
        ctx.bind_pipeline(pipeline);
        ctx.draw(3)?;
        ctx.end_render_pass();
        Ok(())
    });
}

#[test]
#[should_panic(expected = "outside a render pass")]
fn test_draw_outside_a_pass_panics() {
    let (mut device, _probe) = setup();
    let target = device
        .create_texture(TextureSettings::render_target(4, 4, Format::Rgba8Unorm))
        .unwrap();
    let framebuffer = device
        .create_framebuffer(FramebufferSettings::default().color(target))
        .unwrap();
    let pipeline = device
        .create_pipeline(PipelineSettings::graphics("textured", framebuffer))
        .unwrap()
        .unwrap();

    let _ = device.one_shot(|ctx| {
        ctx.bind_pipeline(pipeline);
        ctx.draw(3)
    });
}
