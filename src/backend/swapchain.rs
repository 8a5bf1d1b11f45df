// Swapchain lifecycle management
//
// The bundle owns everything whose lifetime is tied to the presentable
// image chain: images, views, render pass, framebuffers, descriptor
// machinery, per-image uniform buffers, the graphics pipeline and the
// statically recorded command buffers. Created together, destroyed in
// exact reverse order, fully rebuilt on resize. The command pool is the
// one exception: it survives rebuilds, only its buffers are freed.

use ash::extensions::khr;
use ash::vk;

use super::buffer::{BufferManager, UniformSet};
use super::device::RenderDevice;
use super::error::RenderResult;
use super::pipeline;
use super::shader::{ShaderRegistry, ShaderSource};

/// Result of acquiring the next presentable image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireStatus {
    Ready(u32),
    /// The image is usable but the chain should be rebuilt after this frame.
    Suboptimal(u32),
    /// The chain no longer matches the surface; rebuild before rendering.
    OutOfDate,
}

pub struct SwapchainBundle {
    loader: khr::Swapchain,
    swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    render_pass: vk::RenderPass,
    framebuffers: Vec<vk::Framebuffer>,
    descriptor_set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    pub uniforms: UniformSet,
    descriptor_pool: vk::DescriptorPool,
    descriptor_sets: Vec<vk::DescriptorSet>,
    command_buffers: Vec<vk::CommandBuffer>,
}

impl SwapchainBundle {
    /// Build the full chain for the given pixel size. Every stage depends
    /// strictly on the previous one; any failure propagates immediately.
    pub fn build(
        device: &RenderDevice,
        pixel_size: (u32, u32),
        clear_color: [f32; 4],
        shader_manifest: &[ShaderSource],
        registry: &mut ShaderRegistry,
        buffers: &BufferManager,
        pool: vk::CommandPool,
    ) -> RenderResult<Self> {
        let support = &device.profile().swapchain_support;

        let surface_format = select_surface_format(&support.formats);
        let present_mode = select_present_mode(&support.present_modes);
        let extent = select_extent(pixel_size.0, pixel_size.1, &support.capabilities);
        let image_count = desired_image_count(&support.capabilities);

        log::info!(
            "building swapchain: {}x{}, {:?}, {:?}, {} images requested",
            extent.width,
            extent.height,
            surface_format.format,
            present_mode,
            image_count
        );

        let loader = khr::Swapchain::new(&device.instance, &device.device);

        let queue_families = device.profile().queue_families;
        let family_indices = [
            queue_families.graphics.unwrap_or_default(),
            queue_families.present.unwrap_or_default(),
        ];
        let concurrent = family_indices[0] != family_indices[1];

        let mut create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(device.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(support.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);

        create_info = if concurrent {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&family_indices)
        } else {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        let swapchain = unsafe { loader.create_swapchain(&create_info, None)? };
        let images = unsafe { loader.get_swapchain_images(swapchain)? };

        let image_views = create_image_views(&device.device, &images, surface_format.format)?;

        let render_pass = pipeline::create_render_pass(&device.device, surface_format.format)?;

        let framebuffers =
            pipeline::create_framebuffers(&device.device, &image_views, render_pass, extent)?;

        // Modules live exactly as long as this bundle; re-register on
        // every build.
        for source in shader_manifest {
            registry.register(
                &source.label,
                &source.path,
                &source.entry_point,
                source.stage,
            )?;
        }

        let descriptor_set_layout = pipeline::create_descriptor_set_layout(&device.device)?;
        let pipeline_layout =
            pipeline::create_pipeline_layout(&device.device, descriptor_set_layout)?;

        let stage_infos = registry.stage_infos();
        let graphics_pipeline = pipeline::create_graphics_pipeline(
            &device.device,
            render_pass,
            extent,
            &stage_infos,
            pipeline_layout,
        )?;

        let uniforms = UniformSet::create(device, images.len())?;
        let descriptor_pool =
            pipeline::create_descriptor_pool(&device.device, images.len() as u32)?;
        let descriptor_sets = pipeline::create_descriptor_sets(
            &device.device,
            descriptor_pool,
            descriptor_set_layout,
            &uniforms,
        )?;

        let command_buffers = allocate_command_buffers(&device.device, pool, framebuffers.len())?;

        let bundle = Self {
            loader,
            swapchain,
            images,
            image_views,
            format: surface_format.format,
            extent,
            render_pass,
            framebuffers,
            descriptor_set_layout,
            pipeline_layout,
            pipeline: graphics_pipeline,
            uniforms,
            descriptor_pool,
            descriptor_sets,
            command_buffers,
        };

        bundle.record_command_buffers(&device.device, clear_color, buffers)?;

        log::info!("swapchain ready with {} images", bundle.images.len());
        Ok(bundle)
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn command_buffer(&self, image: usize) -> vk::CommandBuffer {
        self.command_buffers[image]
    }

    /// Static command recording: one buffer per framebuffer, written once.
    /// When both buffer labels are bound and resident the draw is indexed;
    /// otherwise a fixed three-vertex draw keeps the pipeline exercised.
    fn record_command_buffers(
        &self,
        device: &ash::Device,
        clear_color: [f32; 4],
        buffers: &BufferManager,
    ) -> RenderResult<()> {
        let clear_values = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: clear_color,
            },
        }];
        let draw = buffers.draw_config();

        for (i, &cmd) in self.command_buffers.iter().enumerate() {
            unsafe {
                let begin_info = vk::CommandBufferBeginInfo::builder();
                device.begin_command_buffer(cmd, &begin_info)?;

                let pass_info = vk::RenderPassBeginInfo::builder()
                    .render_pass(self.render_pass)
                    .framebuffer(self.framebuffers[i])
                    .render_area(vk::Rect2D {
                        offset: vk::Offset2D { x: 0, y: 0 },
                        extent: self.extent,
                    })
                    .clear_values(&clear_values);

                device.cmd_begin_render_pass(cmd, &pass_info, vk::SubpassContents::INLINE);
                device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline);
                device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    self.pipeline_layout,
                    0,
                    &[self.descriptor_sets[i]],
                    &[],
                );

                match draw {
                    Some(config) => {
                        device.cmd_bind_vertex_buffers(cmd, 0, &[config.vertex_buffer], &[0]);
                        device.cmd_bind_index_buffer(
                            cmd,
                            config.index_buffer,
                            0,
                            vk::IndexType::UINT32,
                        );
                        device.cmd_draw_indexed(cmd, config.index_count, 1, 0, 0, 0);
                    }
                    None => device.cmd_draw(cmd, 3, 1, 0, 0),
                }

                device.cmd_end_render_pass(cmd);
                device.end_command_buffer(cmd)?;
            }
        }

        Ok(())
    }

    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> RenderResult<AcquireStatus> {
        let result = unsafe {
            self.loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((index, false)) => Ok(AcquireStatus::Ready(index)),
            Ok((index, true)) => Ok(AcquireStatus::Suboptimal(index)),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireStatus::OutOfDate),
            Err(e) => Err(e.into()),
        }
    }

    /// Present `image` on the present queue. Returns whether the chain has
    /// gone stale and needs a rebuild.
    pub fn present(
        &self,
        queue: vk::Queue,
        image: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> RenderResult<bool> {
        let swapchains = [self.swapchain];
        let image_indices = [image];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.loader.queue_present(queue, &present_info) };

        match result {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    /// Tear down in exact reverse build order. Command buffers are freed
    /// back into the surviving pool rather than destroyed with it. Must be
    /// called with the device idle.
    pub fn destroy(
        &mut self,
        device: &RenderDevice,
        pool: vk::CommandPool,
        registry: &mut ShaderRegistry,
    ) {
        registry.release_all();

        unsafe {
            if !self.command_buffers.is_empty() {
                device.device.free_command_buffers(pool, &self.command_buffers);
                self.command_buffers.clear();
            }

            device
                .device
                .destroy_descriptor_pool(self.descriptor_pool, None);
            self.descriptor_sets.clear();
        }

        self.uniforms.destroy(device);

        unsafe {
            device
                .device
                .destroy_pipeline_layout(self.pipeline_layout, None);
            device
                .device
                .destroy_descriptor_set_layout(self.descriptor_set_layout, None);
            device.device.destroy_pipeline(self.pipeline, None);

            for framebuffer in self.framebuffers.drain(..) {
                device.device.destroy_framebuffer(framebuffer, None);
            }

            device.device.destroy_render_pass(self.render_pass, None);

            for view in self.image_views.drain(..) {
                device.device.destroy_image_view(view, None);
            }

            // Images are owned by the chain and go with it.
            self.loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

fn create_image_views(
    device: &ash::Device,
    images: &[vk::Image],
    format: vk::Format,
) -> RenderResult<Vec<vk::ImageView>> {
    images
        .iter()
        .map(|&image| {
            let create_info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format)
                .components(vk::ComponentMapping {
                    r: vk::ComponentSwizzle::IDENTITY,
                    g: vk::ComponentSwizzle::IDENTITY,
                    b: vk::ComponentSwizzle::IDENTITY,
                    a: vk::ComponentSwizzle::IDENTITY,
                })
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });

            let view = unsafe { device.create_image_view(&create_info, None)? };
            Ok(view)
        })
        .collect()
}

fn allocate_command_buffers(
    device: &ash::Device,
    pool: vk::CommandPool,
    count: usize,
) -> RenderResult<Vec<vk::CommandBuffer>> {
    let alloc_info = vk::CommandBufferAllocateInfo::builder()
        .command_pool(pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(count as u32);

    let buffers = unsafe { device.allocate_command_buffers(&alloc_info)? };
    Ok(buffers)
}

/// Prefer B8G8R8A8_SRGB in the extended linear color space; otherwise the
/// first supported format. Adequacy guarantees the list is non-empty.
pub fn select_surface_format(formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT
        })
        .or_else(|| formats.first())
        .copied()
        .unwrap_or_default()
}

/// Prefer low-latency mailbox; FIFO is the universally supported fallback.
pub fn select_present_mode(modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    modes
        .iter()
        .copied()
        .find(|&m| m == vk::PresentModeKHR::MAILBOX)
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// The surface's own current extent can go stale across resizes under the
/// host windowing system, so the extent is always derived from the pixel
/// size reported by the windowing collaborator, clamped to the device
/// limits from the capability snapshot.
pub fn select_extent(
    pixel_width: u32,
    pixel_height: u32,
    capabilities: &vk::SurfaceCapabilitiesKHR,
) -> vk::Extent2D {
    vk::Extent2D {
        width: pixel_width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: pixel_height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// One image above the minimum, capped by the maximum when the device
/// declares one (zero means unbounded).
pub fn desired_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let mut count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 && count > capabilities.max_image_count {
        count = capabilities.max_image_count;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capabilities(min: (u32, u32), max: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_extent: vk::Extent2D {
                width: min.0,
                height: min.1,
            },
            max_image_extent: vk::Extent2D {
                width: max.0,
                height: max.1,
            },
            ..Default::default()
        }
    }

    #[test]
    fn extent_is_clamped_componentwise() {
        let caps = capabilities((200, 100), (4096, 2160));

        let exact = select_extent(1280, 720, &caps);
        assert_eq!((exact.width, exact.height), (1280, 720));

        let clamped_low = select_extent(1, 1, &caps);
        assert_eq!((clamped_low.width, clamped_low.height), (200, 100));

        let clamped_high = select_extent(10_000, 10_000, &caps);
        assert_eq!((clamped_high.width, clamped_high.height), (4096, 2160));

        let mixed = select_extent(10_000, 1, &caps);
        assert_eq!((mixed.width, mixed.height), (4096, 100));
    }

    #[test]
    fn preferred_surface_format_wins_when_present() {
        let preferred = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
        };
        let other = vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };

        assert_eq!(select_surface_format(&[other, preferred]), preferred);
    }

    #[test]
    fn surface_format_falls_back_to_the_first_supported() {
        let first = vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let second = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };

        assert_eq!(select_surface_format(&[first, second]), first);
    }

    #[test]
    fn present_mode_prefers_mailbox_and_falls_back_to_fifo() {
        assert_eq!(
            select_present_mode(&[
                vk::PresentModeKHR::FIFO,
                vk::PresentModeKHR::MAILBOX,
                vk::PresentModeKHR::IMMEDIATE,
            ]),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            select_present_mode(&[vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::FIFO]),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn image_count_respects_the_declared_maximum() {
        let mut caps = capabilities((1, 1), (100, 100));
        caps.min_image_count = 2;
        caps.max_image_count = 0;
        assert_eq!(desired_image_count(&caps), 3);

        caps.max_image_count = 2;
        assert_eq!(desired_image_count(&caps), 2);
    }
}
