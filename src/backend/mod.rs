// Render backend - Vulkan engine core
//
// The Engine owns every GPU handle it creates and orchestrates the
// lifecycle: negotiate device -> declare resources -> materialize ->
// build swapchain bundle -> per-frame submit/present loop, with full
// bundle rebuilds on resize or stale-surface signals. The windowing
// collaborator owns the native window and only injects raw handles and
// geometry.

pub mod buffer;
pub mod device;
pub mod error;
pub mod pipeline;
pub mod shader;
pub mod swapchain;
pub mod sync;

pub use buffer::{BufferManager, UniformBlock, Vertex};
pub use device::RenderDevice;
pub use error::{RenderError, RenderResult};
pub use shader::{ShaderRegistry, ShaderSource, ShaderStage};
pub use swapchain::SwapchainBundle;
pub use sync::FrameSync;

use ash::vk;
use glam::Mat4;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::sync::Arc;

use crate::camera::Camera;
use swapchain::AcquireStatus;

/// Raw platform handles injected by the windowing collaborator.
#[derive(Clone, Copy)]
pub struct SurfaceSource {
    pub display: RawDisplayHandle,
    pub window: RawWindowHandle,
}

/// Surface size in screen coordinates plus the derived pixel size.
/// Mutated only by an explicit resize notification.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SurfaceGeometry {
    pub screen_width: u32,
    pub screen_height: u32,
    pub dpr: f64,
    pub pixel_width: u32,
    pub pixel_height: u32,
}

impl SurfaceGeometry {
    pub fn new(screen_width: u32, screen_height: u32, dpr: f64) -> Self {
        let mut geometry = Self {
            screen_width,
            screen_height,
            dpr,
            pixel_width: 0,
            pixel_height: 0,
        };
        geometry.derive_pixels();
        geometry
    }

    pub fn resize(&mut self, screen_width: u32, screen_height: u32) {
        self.screen_width = screen_width;
        self.screen_height = screen_height;
        self.derive_pixels();
    }

    fn derive_pixels(&mut self) {
        self.pixel_width = (self.screen_width as f64 * self.dpr).round() as u32;
        self.pixel_height = (self.screen_height as f64 * self.dpr).round() as u32;
    }
}

/// Everything the engine needs from the application besides the surface:
/// validation toggle, frame depth, clear color, shader manifest, camera FOV.
#[derive(Clone, Debug)]
pub struct EngineOptions {
    pub app_name: String,
    pub enable_validation: bool,
    pub frames_in_flight: usize,
    pub clear_color: [f32; 4],
    pub shaders: Vec<ShaderSource>,
    pub vertical_fov: f32,
}

enum FrameOutcome {
    Skipped,
    Rendered { stale: bool },
    RebuildNeeded,
}

pub struct Engine {
    options: EngineOptions,
    geometry: SurfaceGeometry,
    camera: Camera,
    buffers: BufferManager,
    registry: ShaderRegistry,
    frames: Option<FrameSync>,
    bundle: Option<SwapchainBundle>,
    command_pool: vk::CommandPool,
    render_enable: bool,
    device: Arc<RenderDevice>,
}

impl Engine {
    /// Negotiate the device and create the long-lived command pool. Buffer
    /// and shader declarations follow; `complete_bring_up` finishes the job.
    pub fn new(
        source: SurfaceSource,
        geometry: SurfaceGeometry,
        options: EngineOptions,
    ) -> RenderResult<Self> {
        let device = RenderDevice::negotiate(
            source.display,
            source.window,
            &options.app_name,
            options.enable_validation,
        )?;

        // The pool outlives every rebuild; only its buffers are recycled.
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.profile().queue_families.graphics.unwrap_or_default());
        let command_pool = unsafe { device.device.create_command_pool(&pool_info, None)? };

        let mut registry = ShaderRegistry::default();
        registry.set_device(device.device.clone());

        let camera = Camera::new(
            geometry.pixel_width,
            geometry.pixel_height,
            options.vertical_fov,
        );

        Ok(Self {
            options,
            geometry,
            camera,
            buffers: BufferManager::default(),
            registry,
            frames: None,
            bundle: None,
            command_pool,
            render_enable: false,
            device,
        })
    }

    pub fn is_inited(&self) -> bool {
        self.bundle.is_some()
    }

    pub fn set_render_enable(&mut self, value: bool) {
        self.render_enable = value;
    }

    pub fn geometry(&self) -> &SurfaceGeometry {
        &self.geometry
    }

    pub fn buffers(&self) -> &BufferManager {
        &self.buffers
    }

    /// Register vertex data for later materialization.
    pub fn declare_vertices(&mut self, label: &str, staged: bool, vertices: Vec<Vertex>) {
        self.buffers.declare_vertices(label, staged, vertices);
    }

    /// Register index data for later materialization.
    pub fn declare_indices(&mut self, label: &str, indices: Vec<u32>) {
        self.buffers.declare_indices(label, indices);
    }

    pub fn bind_vertex_buffer(&mut self, label: &str) {
        self.buffers.bind_vertex_label(label);
    }

    pub fn bind_index_buffer(&mut self, label: &str) {
        self.buffers.bind_index_label(label);
    }

    /// Materialize every declared buffer and build the first swapchain
    /// bundle and frame-sync set. Idempotent once complete.
    pub fn complete_bring_up(&mut self) -> RenderResult<()> {
        if self.bundle.is_some() {
            return Ok(());
        }

        self.buffers
            .materialize_all(&self.device, self.command_pool)?;

        let bundle = self.build_bundle()?;
        let frames = FrameSync::new(
            &self.device.device,
            self.options.frames_in_flight,
            bundle.image_count(),
        )?;

        self.frames = Some(frames);
        self.bundle = Some(bundle);
        self.render_enable = true;

        log::info!("engine bring-up complete");
        Ok(())
    }

    /// Drive one submit+present cycle. Returns `Ok(false)` when nothing was
    /// rendered (disabled, not brought up, or the chain had to be rebuilt).
    pub fn render_frame(&mut self) -> RenderResult<bool> {
        if !self.render_enable {
            return Ok(false);
        }

        match self.drive_frame()? {
            FrameOutcome::Skipped => Ok(false),
            FrameOutcome::RebuildNeeded => {
                self.rebuild_swapchain()?;
                Ok(false)
            }
            FrameOutcome::Rendered { stale } => {
                if stale {
                    self.rebuild_swapchain()?;
                }
                Ok(true)
            }
        }
    }

    fn drive_frame(&mut self) -> RenderResult<FrameOutcome> {
        let uniform = UniformBlock {
            model: Mat4::IDENTITY,
            view: self.camera.view_matrix(),
            proj: self.camera.proj_matrix(),
        };

        let Some(bundle) = self.bundle.as_ref() else {
            return Ok(FrameOutcome::Skipped);
        };
        let Some(frames) = self.frames.as_mut() else {
            return Ok(FrameOutcome::Skipped);
        };
        let device = &self.device;

        let slot_index = frames.current();
        let (fence, image_available, render_finished) = {
            let slot = frames.current_slot();
            (slot.in_flight, slot.image_available, slot.render_finished)
        };

        // Block until the GPU has finished the previous use of this slot.
        unsafe { device.device.wait_for_fences(&[fence], true, u64::MAX)? };

        let (image, mut stale) = match bundle.acquire_next_image(image_available)? {
            AcquireStatus::Ready(index) => (index, false),
            AcquireStatus::Suboptimal(index) => (index, true),
            AcquireStatus::OutOfDate => return Ok(FrameOutcome::RebuildNeeded),
        };

        // A second slot may still be consuming this image when the frame
        // depth differs from the image count.
        if let Some(image_fence) = frames.image_fence(image as usize) {
            unsafe { device.device.wait_for_fences(&[image_fence], true, u64::MAX)? };
        }
        frames.assign_image(image as usize, slot_index);

        // Uniforms target the acquired image, before submission.
        bundle.uniforms.update(device, image as usize, &uniform)?;

        let wait_semaphores = [image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [bundle.command_buffer(image as usize)];
        let signal_semaphores = [render_finished];

        let submit = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();

        unsafe {
            device.device.reset_fences(&[fence])?;
            device
                .device
                .queue_submit(device.graphics_queue, &[submit], fence)
                .map_err(RenderError::QueueSubmit)?;
        }

        stale |= bundle.present(device.present_queue, image, &signal_semaphores)?;

        frames.advance();

        Ok(FrameOutcome::Rendered { stale })
    }

    /// Resize notification from the windowing collaborator. A no-op before
    /// bring-up completes; otherwise always a full rebuild, including when
    /// the size is unchanged.
    pub fn resize(&mut self, screen_width: u32, screen_height: u32) -> RenderResult<()> {
        if self.bundle.is_none() {
            return Ok(());
        }

        self.geometry.resize(screen_width, screen_height);
        self.camera
            .set_view_size(self.geometry.pixel_width, self.geometry.pixel_height);
        self.rebuild_swapchain()
    }

    /// Tear down and rebuild the bundle under device quiescence, then
    /// invalidate the frame-sync image table for the new image count.
    fn rebuild_swapchain(&mut self) -> RenderResult<()> {
        self.render_enable = false;
        self.device.wait_idle()?;

        if let Some(mut old) = self.bundle.take() {
            old.destroy(&self.device, self.command_pool, &mut self.registry);
        }

        let bundle = self.build_bundle()?;
        if let Some(frames) = self.frames.as_mut() {
            frames.reset_image_table(bundle.image_count());
        }

        log::debug!(
            "swapchain rebuilt at {}x{} px",
            bundle.extent.width,
            bundle.extent.height
        );

        self.bundle = Some(bundle);
        self.render_enable = true;
        Ok(())
    }

    fn build_bundle(&mut self) -> RenderResult<SwapchainBundle> {
        SwapchainBundle::build(
            &self.device,
            (self.geometry.pixel_width, self.geometry.pixel_height),
            self.options.clear_color,
            &self.options.shaders,
            &mut self.registry,
            &self.buffers,
            self.command_pool,
        )
    }

    pub fn translate_camera(&mut self, dx: f32, dy: f32, dz: f32) {
        self.camera.translate(dx, dy, dz);
    }

    pub fn rotate_camera(&mut self, dx: f32, dy: f32) {
        self.camera.rotate(dy, dx);
    }

    pub fn zoom_camera(&mut self, delta: f32) {
        self.camera.zoom(delta);
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        log::info!("shutting down engine");
        self.render_enable = false;
        let _ = self.device.wait_idle();

        if let Some(mut bundle) = self.bundle.take() {
            bundle.destroy(&self.device, self.command_pool, &mut self.registry);
        }
        self.registry.release_all();

        if let Some(mut frames) = self.frames.take() {
            frames.destroy(&self.device.device);
        }

        self.buffers.destroy_all(&self.device);

        unsafe {
            self.device
                .device
                .destroy_command_pool(self.command_pool, None);
        }
        // The device Arc drops last: logical device, surface, debug
        // messenger, instance, in that order.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_size_derives_from_screen_size_and_dpr() {
        let geometry = SurfaceGeometry::new(800, 600, 2.0);
        assert_eq!(geometry.pixel_width, 1600);
        assert_eq!(geometry.pixel_height, 1200);

        let unity = SurfaceGeometry::new(800, 600, 1.0);
        assert_eq!(unity.pixel_width, 800);
        assert_eq!(unity.pixel_height, 600);
    }

    #[test]
    fn fractional_scale_factors_round_to_the_nearest_pixel() {
        let geometry = SurfaceGeometry::new(1001, 601, 1.5);
        assert_eq!(geometry.pixel_width, 1502);
        assert_eq!(geometry.pixel_height, 902);
    }

    #[test]
    fn resize_recomputes_the_pixel_size() {
        let mut geometry = SurfaceGeometry::new(800, 600, 2.0);
        geometry.resize(1024, 768);
        assert_eq!(geometry.screen_width, 1024);
        assert_eq!(geometry.pixel_width, 2048);
        assert_eq!(geometry.pixel_height, 1536);

        // Resizing to the same size is not short-circuited anywhere; the
        // geometry stays well-defined either way.
        let before = geometry;
        geometry.resize(1024, 768);
        assert_eq!(geometry, before);
    }
}
