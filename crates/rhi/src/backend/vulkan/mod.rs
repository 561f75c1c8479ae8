//! Vulkan 1.3 backend on ash and gpu-allocator.
//!
//! Backend ids are the raw Vulkan handles (`vk::Handle::as_raw`), so command
//! translation needs no lookup tables. Only objects that own memory or need
//! per-object state (buffers, images, streams) are tracked in maps.
//!
//! Buffers live in host-visible memory and stay mapped for their whole
//! life; images live in device-local memory. Rendering uses dynamic
//! rendering, so there are no render pass or framebuffer objects.

mod convert;
mod instance;
mod physical_device;
mod pipeline;
mod stream;
mod swapchain;

use std::collections::HashMap;

use ash::vk;
use ash::vk::Handle;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tracing::{debug, error, info, warn};

use self::instance::Instance;
use self::physical_device::{PhysicalDeviceInfo, select_physical_device};
use self::stream::Stream;
use self::swapchain::{Swapchain, SwapchainTarget};
use super::{
    Acquire, Command, ComputePipelineDesc, DescriptorResource, DescriptorWrite, DeviceLimits,
    GpuBackend, GraphicsPipelineDesc, RawBuffer, RawDescriptorSet, RawPipeline,
    RawPipelineLayout, RawSampler, RawSetLayout, RawShaderModule, RawStream, RawTexture, RawView,
    SubmitSync, SwapchainDesc,
};
use crate::buffer::BufferKind;
use crate::descriptor::SetLayoutDesc;
use crate::error::{RhiError, RhiResult};
use crate::sampler::SamplerSettings;
use crate::shader::ShaderStage;
use crate::texture::{TextureSettings, TextureShape, TextureUsage, ViewDesc};
use lumen_core::{DescriptorPoolConfig, EngineConfig};

const DEVICE_EXTENSIONS: &[&std::ffi::CStr] = &[ash::khr::swapchain::NAME];

struct BufferEntry {
    buffer: vk::Buffer,
    allocation: Allocation,
    size: u64,
}

struct ImageEntry {
    image: vk::Image,
    allocation: Allocation,
}

/// Format features an image of `usage` needs with optimal tiling.
fn required_features(usage: TextureUsage) -> vk::FormatFeatureFlags {
    use vk::FormatFeatureFlags as F;
    let transfer = F::TRANSFER_SRC | F::TRANSFER_DST;
    match usage {
        TextureUsage::Sampled => F::SAMPLED_IMAGE | F::COLOR_ATTACHMENT | transfer,
        TextureUsage::Storage => F::STORAGE_IMAGE | F::SAMPLED_IMAGE | transfer,
        TextureUsage::Depth => F::DEPTH_STENCIL_ATTACHMENT | F::SAMPLED_IMAGE | transfer,
        TextureUsage::Present => F::COLOR_ATTACHMENT | transfer,
    }
}

/// Expands `offset..offset + size` to whole non-coherent atoms. An empty
/// range stays empty; there is nothing to flush.
fn atom_range(offset: u64, size: u64, atom: u64) -> (u64, u64) {
    let atom = atom.max(1);
    let start = offset / atom * atom;
    if size == 0 {
        return (start, 0);
    }
    let end = (offset + size).div_ceil(atom) * atom;
    (start, end - start)
}

/// The Vulkan implementation of [`GpuBackend`].
pub struct VulkanBackend {
    surface_loader: ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
    physical: PhysicalDeviceInfo,
    device: ash::Device,
    swapchain_loader: ash::khr::swapchain::Device,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    allocator: Option<Allocator>,
    swapchain: Swapchain,
    vsync: bool,
    limits: DeviceLimits,
    buffers: HashMap<RawBuffer, BufferEntry>,
    images: HashMap<RawTexture, ImageEntry>,
    streams: HashMap<RawStream, Stream>,
    // Dropped last: everything above is created from it.
    instance: Instance,
}

impl VulkanBackend {
    /// Brings up Vulkan for `window`: instance, surface, logical device,
    /// memory allocator and a swapchain of `width` x `height`.
    ///
    /// # Arguments
    ///
    /// * `window` - Window to present to
    /// * `width`, `height` - Initial surface size in pixels
    /// * `config` - Engine configuration; `validation` and `vsync` are used
    ///
    /// # Errors
    ///
    /// Returns an error if Vulkan cannot be loaded, no GPU qualifies, or any
    /// object fails to be created.
    pub fn new<W>(window: &W, width: u32, height: u32, config: &EngineConfig) -> RhiResult<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window.display_handle()?.as_raw();
        let window_handle = window.window_handle()?.as_raw();

        let instance = Instance::new(display, config.validation)?;
        if config.validation && !instance.has_validation() {
            warn!("Running without validation output");
        }
        let surface_loader = ash::khr::surface::Instance::new(instance.entry(), instance.handle());
        let surface = unsafe {
            ash_window::create_surface(
                instance.entry(),
                instance.handle(),
                display,
                window_handle,
                None,
            )
            .map_err(|e| RhiError::SurfaceError(e.to_string()))?
        };
        debug!("Surface created");

        match Self::with_surface(instance, surface_loader.clone(), surface, width, height, config) {
            Ok(backend) => Ok(backend),
            Err((instance, err)) => {
                unsafe { surface_loader.destroy_surface(surface, None) };
                drop(instance);
                Err(err)
            }
        }
    }

    fn with_surface(
        instance: Instance,
        surface_loader: ash::khr::surface::Instance,
        surface: vk::SurfaceKHR,
        width: u32,
        height: u32,
        config: &EngineConfig,
    ) -> Result<Self, (Instance, RhiError)> {
        let physical = match select_physical_device(instance.handle(), surface, &surface_loader) {
            Ok(physical) => physical,
            Err(err) => return Err((instance, err)),
        };
        let device = match Self::create_logical_device(&instance, &physical) {
            Ok(device) => device,
            Err(err) => return Err((instance, err)),
        };

        let finish = || -> RhiResult<(Allocator, Swapchain, ash::khr::swapchain::Device)> {
            let allocator = Allocator::new(&AllocatorCreateDesc {
                instance: instance.handle().clone(),
                device: device.clone(),
                physical_device: physical.device,
                debug_settings: Default::default(),
                buffer_device_address: false,
                allocation_sizes: Default::default(),
            })?;
            info!("GPU memory allocator initialized");

            let swapchain_loader = ash::khr::swapchain::Device::new(instance.handle(), &device);
            let target = SwapchainTarget {
                device: &device,
                loader: &swapchain_loader,
                physical_device: physical.device,
                surface,
                surface_loader: &surface_loader,
                queue_families: physical.queue_families,
                vsync: config.vsync,
            };
            let swapchain = Swapchain::new(&target, width, height, vk::SwapchainKHR::null())?;
            Ok((allocator, swapchain, swapchain_loader))
        };

        let (allocator, swapchain, swapchain_loader) = match finish() {
            Ok(parts) => parts,
            Err(err) => {
                unsafe { device.destroy_device(None) };
                return Err((instance, err));
            }
        };

        // Both indices are present once selection succeeded.
        let graphics_family = physical.queue_families.graphics.unwrap_or_default();
        let present_family = physical.queue_families.present.unwrap_or_default();
        let graphics_queue = unsafe { device.get_device_queue(graphics_family, 0) };
        let present_queue = unsafe { device.get_device_queue(present_family, 0) };

        let device_limits = &physical.properties.limits;
        let limits = DeviceLimits {
            min_uniform_alignment: device_limits.min_uniform_buffer_offset_alignment,
            min_storage_alignment: device_limits.min_storage_buffer_offset_alignment,
            max_color_attachments: device_limits.max_color_attachments,
        };

        Ok(Self {
            surface_loader,
            surface,
            physical,
            device,
            swapchain_loader,
            graphics_queue,
            present_queue,
            allocator: Some(allocator),
            swapchain,
            vsync: config.vsync,
            limits,
            buffers: HashMap::new(),
            images: HashMap::new(),
            streams: HashMap::new(),
            instance,
        })
    }

    fn create_logical_device(
        instance: &Instance,
        physical: &PhysicalDeviceInfo,
    ) -> RhiResult<ash::Device> {
        let priorities = [1.0f32];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = physical
            .queue_families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
            })
            .collect();

        let supported = unsafe {
            instance
                .handle()
                .get_physical_device_features(physical.device)
        };
        let features = vk::PhysicalDeviceFeatures::default()
            .sampler_anisotropy(true)
            .fill_mode_non_solid(supported.fill_mode_non_solid == vk::TRUE);
        let mut features_1_3 = vk::PhysicalDeviceVulkan13Features::default()
            .dynamic_rendering(true)
            .synchronization2(true);

        let extension_names: Vec<*const std::ffi::c_char> =
            DEVICE_EXTENSIONS.iter().map(|ext| ext.as_ptr()).collect();
        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_names)
            .enabled_features(&features)
            .push_next(&mut features_1_3);

        let device = unsafe {
            instance
                .handle()
                .create_device(physical.device, &create_info, None)?
        };
        info!(
            "Logical device created on '{}' with {} queue family(ies)",
            physical.device_name(),
            queue_infos.len()
        );
        Ok(device)
    }

    fn allocator(&mut self) -> &mut Allocator {
        // Only taken in Drop.
        match self.allocator.as_mut() {
            Some(allocator) => allocator,
            None => unreachable!("allocator used after teardown"),
        }
    }

    fn stream(&self, stream: RawStream) -> &Stream {
        match self.streams.get(&stream) {
            Some(stream) => stream,
            None => panic!("unknown stream {stream:?}"),
        }
    }

    fn check_format(&self, settings: &TextureSettings) -> RhiResult<()> {
        let properties = unsafe {
            self.instance
                .handle()
                .get_physical_device_format_properties(
                    self.physical.device,
                    convert::format(settings.format),
                )
        };
        let required = required_features(settings.usage);
        if !properties.optimal_tiling_features.contains(required) {
            return Err(RhiError::UnsupportedFormat {
                format: settings.format,
                usage: match settings.usage {
                    TextureUsage::Sampled => "sampled render targets",
                    TextureUsage::Storage => "storage images",
                    TextureUsage::Depth => "depth attachments",
                    TextureUsage::Present => "presentation",
                },
            });
        }
        Ok(())
    }

    fn free_buffer(&mut self, entry: BufferEntry) {
        if let Err(e) = self.allocator().free(entry.allocation) {
            error!("Failed to free buffer allocation: {:?}", e);
        }
        unsafe { self.device.destroy_buffer(entry.buffer, None) };
    }

    fn free_image(&mut self, entry: ImageEntry) {
        if let Err(e) = self.allocator().free(entry.allocation) {
            error!("Failed to free image allocation: {:?}", e);
        }
        unsafe { self.device.destroy_image(entry.image, None) };
    }

    /// Range to flush or invalidate, or `None` when the memory is coherent.
    fn memory_range(
        &self,
        buffer: RawBuffer,
        offset: u64,
        size: u64,
    ) -> Option<vk::MappedMemoryRange<'static>> {
        let entry = self.buffers.get(&buffer)?;
        let properties = entry.allocation.memory_properties();
        if properties.contains(vk::MemoryPropertyFlags::HOST_COHERENT) {
            return None;
        }
        let size = size.min(entry.size.saturating_sub(offset));
        let atom = self.physical.properties.limits.non_coherent_atom_size;
        let (start, len) = atom_range(entry.allocation.offset() + offset, size, atom);
        if len == 0 {
            return None;
        }
        Some(
            vk::MappedMemoryRange::default()
                .memory(unsafe { entry.allocation.memory() })
                .offset(start)
                .size(len),
        )
    }
}

impl GpuBackend for VulkanBackend {
    fn name(&self) -> &str {
        "vulkan"
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn create_buffer(&mut self, kind: BufferKind, size: u64) -> RhiResult<RawBuffer> {
        let info = vk::BufferCreateInfo::default()
            .size(size.max(1))
            .usage(convert::buffer_usage(kind))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = match self.allocator().allocate(&AllocationCreateDesc {
            name: "buffer",
            requirements,
            location: MemoryLocation::CpuToGpu,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(err.into());
            }
        };
        if let Err(err) = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            self.free_buffer(BufferEntry {
                buffer,
                allocation,
                size,
            });
            return Err(err.into());
        }

        let raw = RawBuffer(buffer.as_raw());
        debug!("Created {:?} buffer of {} bytes", kind, size);
        self.buffers.insert(
            raw,
            BufferEntry {
                buffer,
                allocation,
                size,
            },
        );
        Ok(raw)
    }

    fn destroy_buffer(&mut self, buffer: RawBuffer) {
        if let Some(entry) = self.buffers.remove(&buffer) {
            self.free_buffer(entry);
        }
    }

    fn mapped(&mut self, buffer: RawBuffer) -> RhiResult<&mut [u8]> {
        let Some(entry) = self.buffers.get_mut(&buffer) else {
            panic!("unknown buffer {buffer:?}");
        };
        let size = entry.size as usize;
        match entry.allocation.mapped_slice_mut() {
            Some(bytes) => Ok(&mut bytes[..size]),
            None => Err(RhiError::VulkanError(vk::Result::ERROR_MEMORY_MAP_FAILED)),
        }
    }

    fn flush_buffer(&mut self, buffer: RawBuffer, offset: u64, size: u64) -> RhiResult<()> {
        if let Some(range) = self.memory_range(buffer, offset, size) {
            unsafe { self.device.flush_mapped_memory_ranges(&[range])? };
        }
        Ok(())
    }

    fn invalidate_buffer(&mut self, buffer: RawBuffer, offset: u64, size: u64) -> RhiResult<()> {
        if let Some(range) = self.memory_range(buffer, offset, size) {
            unsafe { self.device.invalidate_mapped_memory_ranges(&[range])? };
        }
        Ok(())
    }

    fn create_texture(&mut self, settings: &TextureSettings) -> RhiResult<RawTexture> {
        self.check_format(settings)?;

        let flags = if settings.shape == TextureShape::Cube {
            vk::ImageCreateFlags::CUBE_COMPATIBLE
        } else {
            vk::ImageCreateFlags::empty()
        };
        let info = vk::ImageCreateInfo::default()
            .flags(flags)
            .image_type(vk::ImageType::TYPE_2D)
            .format(convert::format(settings.format))
            .extent(vk::Extent3D {
                width: settings.width,
                height: settings.height,
                depth: 1,
            })
            .mip_levels(settings.levels)
            .array_layers(settings.layers)
            .samples(convert::samples(settings.samples))
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(convert::image_usage(settings.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.device.create_image(&info, None)? };
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = match self.allocator().allocate(&AllocationCreateDesc {
            name: "texture",
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(err.into());
            }
        };
        if let Err(err) = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        } {
            self.free_image(ImageEntry { image, allocation });
            return Err(err.into());
        }

        let raw = RawTexture(image.as_raw());
        self.images.insert(raw, ImageEntry { image, allocation });
        Ok(raw)
    }

    fn destroy_texture(&mut self, texture: RawTexture) {
        if let Some(entry) = self.images.remove(&texture) {
            self.free_image(entry);
        }
    }

    fn create_view(&mut self, texture: RawTexture, desc: &ViewDesc) -> RhiResult<RawView> {
        let info = vk::ImageViewCreateInfo::default()
            .image(vk::Image::from_raw(texture.0))
            .view_type(convert::view_type(desc.dimension))
            .format(convert::format(desc.format))
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: convert::aspect(desc.format.aspect()),
                base_mip_level: desc.base_mip,
                level_count: desc.mip_count,
                base_array_layer: desc.base_layer,
                layer_count: desc.layer_count,
            });
        let view = unsafe { self.device.create_image_view(&info, None)? };
        Ok(RawView(view.as_raw()))
    }

    fn destroy_view(&mut self, view: RawView) {
        unsafe {
            self.device
                .destroy_image_view(vk::ImageView::from_raw(view.0), None)
        };
    }

    fn create_sampler(&mut self, settings: &SamplerSettings) -> RhiResult<RawSampler> {
        let address = convert::address_mode(settings.address_mode);
        let max_anisotropy = self.physical.properties.limits.max_sampler_anisotropy;
        let mut info = vk::SamplerCreateInfo::default()
            .mag_filter(convert::filter(settings.mag_filter))
            .min_filter(convert::filter(settings.min_filter))
            .mipmap_mode(convert::mipmap_mode(settings.mip_filter))
            .address_mode_u(address)
            .address_mode_v(address)
            .address_mode_w(address)
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE)
            .border_color(vk::BorderColor::FLOAT_OPAQUE_BLACK);
        if let Some(anisotropy) = settings.anisotropy {
            info = info
                .anisotropy_enable(true)
                .max_anisotropy(f32::from(anisotropy).min(max_anisotropy));
        }
        if let Some(compare) = settings.compare {
            info = info
                .compare_enable(true)
                .compare_op(convert::compare_op(compare));
        }
        let sampler = unsafe { self.device.create_sampler(&info, None)? };
        Ok(RawSampler(sampler.as_raw()))
    }

    fn destroy_sampler(&mut self, sampler: RawSampler) {
        unsafe {
            self.device
                .destroy_sampler(vk::Sampler::from_raw(sampler.0), None)
        };
    }

    fn create_shader_module(
        &mut self,
        stage: ShaderStage,
        spirv: &[u32],
    ) -> RhiResult<RawShaderModule> {
        let info = vk::ShaderModuleCreateInfo::default().code(spirv);
        let module = unsafe { self.device.create_shader_module(&info, None)? };
        debug!("{:?} shader module created ({} words)", stage, spirv.len());
        Ok(RawShaderModule(module.as_raw()))
    }

    fn destroy_shader_module(&mut self, module: RawShaderModule) {
        unsafe {
            self.device
                .destroy_shader_module(vk::ShaderModule::from_raw(module.0), None)
        };
    }

    fn create_set_layout(&mut self, desc: &SetLayoutDesc) -> RhiResult<RawSetLayout> {
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = desc
            .bindings
            .iter()
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding.binding)
                    .descriptor_type(convert::descriptor_type(binding.kind))
                    .descriptor_count(1)
                    .stage_flags(convert::stage_mask(binding.stages))
            })
            .collect();
        let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        let layout = unsafe { self.device.create_descriptor_set_layout(&info, None)? };
        Ok(RawSetLayout(layout.as_raw()))
    }

    fn destroy_set_layout(&mut self, layout: RawSetLayout) {
        unsafe {
            self.device
                .destroy_descriptor_set_layout(vk::DescriptorSetLayout::from_raw(layout.0), None)
        };
    }

    fn create_pipeline_layout(&mut self, sets: &[RawSetLayout]) -> RhiResult<RawPipelineLayout> {
        let set_layouts: Vec<vk::DescriptorSetLayout> = sets
            .iter()
            .map(|set| vk::DescriptorSetLayout::from_raw(set.0))
            .collect();
        let info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
        let layout = unsafe { self.device.create_pipeline_layout(&info, None)? };
        Ok(RawPipelineLayout(layout.as_raw()))
    }

    fn destroy_pipeline_layout(&mut self, layout: RawPipelineLayout) {
        unsafe {
            self.device
                .destroy_pipeline_layout(vk::PipelineLayout::from_raw(layout.0), None)
        };
    }

    fn create_graphics_pipeline(
        &mut self,
        desc: &GraphicsPipelineDesc<'_>,
    ) -> RhiResult<RawPipeline> {
        let pipeline = pipeline::create_graphics(&self.device, desc)?;
        Ok(RawPipeline(pipeline.as_raw()))
    }

    fn create_compute_pipeline(&mut self, desc: &ComputePipelineDesc<'_>) -> RhiResult<RawPipeline> {
        let pipeline = pipeline::create_compute(&self.device, desc)?;
        Ok(RawPipeline(pipeline.as_raw()))
    }

    fn destroy_pipeline(&mut self, pipeline: RawPipeline) {
        unsafe {
            self.device
                .destroy_pipeline(vk::Pipeline::from_raw(pipeline.0), None)
        };
    }

    fn create_stream(&mut self, pool: &DescriptorPoolConfig) -> RhiResult<RawStream> {
        let family = self.physical.queue_families.graphics.unwrap_or_default();
        let stream = Stream::new(&self.device, family, pool)?;
        let raw = RawStream(stream.buffer.as_raw());
        self.streams.insert(raw, stream);
        Ok(raw)
    }

    fn destroy_stream(&mut self, stream: RawStream) {
        if let Some(mut entry) = self.streams.remove(&stream) {
            entry.destroy(&self.device);
        }
    }

    fn wait_stream(&mut self, stream: RawStream) -> RhiResult<()> {
        self.stream(stream).wait(&self.device)
    }

    fn begin_stream(&mut self, stream: RawStream) -> RhiResult<()> {
        self.stream(stream).begin(&self.device)
    }

    fn allocate_descriptor_set(
        &mut self,
        stream: RawStream,
        layout: RawSetLayout,
    ) -> RhiResult<RawDescriptorSet> {
        let layouts = [vk::DescriptorSetLayout::from_raw(layout.0)];
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.stream(stream).descriptor_pool)
            .set_layouts(&layouts);
        let sets = unsafe { self.device.allocate_descriptor_sets(&info)? };
        Ok(RawDescriptorSet(sets[0].as_raw()))
    }

    fn write_descriptor_set(&mut self, set: RawDescriptorSet, writes: &[DescriptorWrite]) {
        let mut buffer_infos = Vec::with_capacity(writes.len());
        let mut image_infos = Vec::with_capacity(writes.len());
        for write in writes {
            match write.resource {
                DescriptorResource::Uniform { buffer, range } => {
                    buffer_infos.push(vk::DescriptorBufferInfo {
                        buffer: vk::Buffer::from_raw(buffer.0),
                        offset: 0,
                        range,
                    });
                }
                DescriptorResource::Storage {
                    buffer,
                    offset,
                    range,
                } => {
                    buffer_infos.push(vk::DescriptorBufferInfo {
                        buffer: vk::Buffer::from_raw(buffer.0),
                        offset,
                        range,
                    });
                }
                DescriptorResource::SampledTexture { view, layout } => {
                    image_infos.push(vk::DescriptorImageInfo {
                        sampler: vk::Sampler::null(),
                        image_view: vk::ImageView::from_raw(view.0),
                        image_layout: convert::layout(layout).0,
                    });
                }
                DescriptorResource::StorageImage { view } => {
                    image_infos.push(vk::DescriptorImageInfo {
                        sampler: vk::Sampler::null(),
                        image_view: vk::ImageView::from_raw(view.0),
                        image_layout: vk::ImageLayout::GENERAL,
                    });
                }
                DescriptorResource::Sampler { sampler } => {
                    image_infos.push(vk::DescriptorImageInfo {
                        sampler: vk::Sampler::from_raw(sampler.0),
                        image_view: vk::ImageView::null(),
                        image_layout: vk::ImageLayout::UNDEFINED,
                    });
                }
            }
        }

        let dst_set = vk::DescriptorSet::from_raw(set.0);
        let (mut next_buffer, mut next_image) = (0, 0);
        let native: Vec<vk::WriteDescriptorSet<'_>> = writes
            .iter()
            .map(|write| {
                let base = vk::WriteDescriptorSet::default()
                    .dst_set(dst_set)
                    .dst_binding(write.binding);
                match write.resource {
                    DescriptorResource::Uniform { .. } | DescriptorResource::Storage { .. } => {
                        let ty = if matches!(write.resource, DescriptorResource::Uniform { .. }) {
                            vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
                        } else {
                            vk::DescriptorType::STORAGE_BUFFER
                        };
                        next_buffer += 1;
                        base.descriptor_type(ty)
                            .buffer_info(std::slice::from_ref(&buffer_infos[next_buffer - 1]))
                    }
                    DescriptorResource::SampledTexture { .. }
                    | DescriptorResource::StorageImage { .. }
                    | DescriptorResource::Sampler { .. } => {
                        let ty = match write.resource {
                            DescriptorResource::SampledTexture { .. } => {
                                vk::DescriptorType::SAMPLED_IMAGE
                            }
                            DescriptorResource::StorageImage { .. } => {
                                vk::DescriptorType::STORAGE_IMAGE
                            }
                            _ => vk::DescriptorType::SAMPLER,
                        };
                        next_image += 1;
                        base.descriptor_type(ty)
                            .image_info(std::slice::from_ref(&image_infos[next_image - 1]))
                    }
                }
            })
            .collect();
        unsafe { self.device.update_descriptor_sets(&native, &[]) };
    }

    fn record(&mut self, stream: RawStream, command: &Command) {
        stream::record(&self.device, vk::CommandBuffer::from_raw(stream.0), command);
    }

    fn end_stream(&mut self, stream: RawStream) -> RhiResult<()> {
        unsafe {
            self.device
                .end_command_buffer(vk::CommandBuffer::from_raw(stream.0))?
        };
        Ok(())
    }

    fn submit(&mut self, stream: RawStream, sync: SubmitSync) -> RhiResult<()> {
        let fence = self.stream(stream).fence;
        let command_buffers = [vk::CommandBuffer::from_raw(stream.0)];
        let (wait, signal) = match sync {
            SubmitSync::None => (Vec::new(), Vec::new()),
            SubmitSync::Swapchain { slot } => (
                vec![self.swapchain.acquired_semaphore(slot)],
                vec![self.swapchain.ready_semaphore(slot)],
            ),
        };
        let wait_stages: Vec<vk::PipelineStageFlags> = wait
            .iter()
            .map(|_| {
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::TRANSFER
            })
            .collect();
        let submit = vk::SubmitInfo::default()
            .wait_semaphores(&wait)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal);

        unsafe {
            self.device.reset_fences(&[fence])?;
            self.device
                .queue_submit(self.graphics_queue, &[submit], fence)?;
        }
        Ok(())
    }

    fn wait_idle(&mut self) -> RhiResult<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }

    fn swapchain(&self) -> Option<SwapchainDesc> {
        Some(SwapchainDesc {
            format: self.swapchain.format(),
            extent: self.swapchain.extent(),
            images: self
                .swapchain
                .images()
                .iter()
                .map(|image| RawTexture(image.as_raw()))
                .collect(),
        })
    }

    fn acquire_image(&mut self, slot: u32) -> RhiResult<Acquire> {
        Ok(match self.swapchain.acquire(&self.swapchain_loader, slot)? {
            Some(index) => Acquire::Image(index),
            None => Acquire::Stale,
        })
    }

    fn present(&mut self, image: u32, slot: u32) -> RhiResult<bool> {
        self.swapchain
            .present(&self.swapchain_loader, self.present_queue, image, slot)
    }

    fn rebuild_swapchain(&mut self, width: u32, height: u32) -> RhiResult<()> {
        unsafe { self.device.device_wait_idle()? };
        let target = SwapchainTarget {
            device: &self.device,
            loader: &self.swapchain_loader,
            physical_device: self.physical.device,
            surface: self.surface,
            surface_loader: &self.surface_loader,
            queue_families: self.physical.queue_families,
            vsync: self.vsync,
        };
        let rebuilt = Swapchain::new(&target, width, height, self.swapchain.handle())?;
        let mut old = std::mem::replace(&mut self.swapchain, rebuilt);
        old.destroy(&self.device, &self.swapchain_loader);
        Ok(())
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                error!("Failed to wait for device idle during shutdown: {:?}", e);
            }
        }

        for (_, mut stream) in std::mem::take(&mut self.streams) {
            stream.destroy(&self.device);
        }
        for (_, buffer) in std::mem::take(&mut self.buffers) {
            self.free_buffer(buffer);
        }
        for (_, image) in std::mem::take(&mut self.images) {
            self.free_image(image);
        }
        self.swapchain.destroy(&self.device, &self.swapchain_loader);
        drop(self.allocator.take());

        unsafe {
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
        }
        info!("Vulkan backend destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atom_range_covers_request() {
        assert_eq!(atom_range(0, 64, 64), (0, 64));
        assert_eq!(atom_range(10, 4, 64), (0, 64));
        assert_eq!(atom_range(60, 10, 64), (0, 128));
    }

    #[test]
    fn test_empty_range_flushes_nothing() {
        assert_eq!(atom_range(130, 0, 64), (128, 0));
        assert_eq!(atom_range(128, 0, 64), (128, 0));
    }

    #[test]
    fn test_atom_of_zero_is_treated_as_one() {
        assert_eq!(atom_range(5, 3, 0), (5, 3));
    }

    #[test]
    fn test_depth_usage_needs_depth_attachment_support() {
        assert!(
            required_features(TextureUsage::Depth)
                .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        );
        assert!(
            !required_features(TextureUsage::Sampled)
                .contains(vk::FormatFeatureFlags::STORAGE_IMAGE)
        );
    }
}
