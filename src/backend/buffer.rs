// Buffer resource management
//
// Vertex and index data is declared up front as plain CPU data, then
// materialized into GPU buffers in one pass. Two residency strategies:
// a host-coherent *client* buffer used directly, or a staged pair where
// the client buffer is copied once into a device-local *server* buffer
// through a transient command buffer. Index buffers always stage.

use ash::vk;
use glam::Mat4;

use super::device::RenderDevice;
use super::error::{RenderError, RenderResult};

/// Interleaved position + color vertex, matching the pipeline's input
/// binding and the vertex shader's input locations.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Vertex {
    pub position: [f32; 3],
    pub color: [f32; 3],
}

impl Vertex {
    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription::builder()
            .binding(0)
            .stride(std::mem::size_of::<Vertex>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)
            .build()
    }

    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 2] {
        [
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(0)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(0)
                .build(),
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(1)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(12)
                .build(),
        ]
    }
}

/// Per-frame model/view/projection block consumed by the vertex shader.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct UniformBlock {
    pub model: Mat4,
    pub view: Mat4,
    pub proj: Mat4,
}

/// One GPU allocation: buffer handle, backing memory and the requirements
/// it was allocated against.
pub struct BufferBlock {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub requirements: vk::MemoryRequirements,
}

struct VertexEntry {
    data: Vec<Vertex>,
    staged: bool,
    client: Option<BufferBlock>,
    server: Option<BufferBlock>,
}

struct IndexEntry {
    data: Vec<u32>,
    client: Option<BufferBlock>,
    server: Option<BufferBlock>,
}

/// Draw parameters derived from the currently bound labels.
#[derive(Clone, Copy, Debug)]
pub struct DrawConfig {
    pub vertex_buffer: vk::Buffer,
    pub index_buffer: vk::Buffer,
    pub index_count: u32,
}

/// Label-keyed vertex/index registries plus the pair of bound labels the
/// next pipeline build will draw from.
#[derive(Default)]
pub struct BufferManager {
    vertex_buffers: Vec<(String, VertexEntry)>,
    index_buffers: Vec<(String, IndexEntry)>,
    bound_vertex_label: Option<String>,
    bound_index_label: Option<String>,
}

impl BufferManager {
    /// Register vertex data. No GPU work happens until `materialize_all`.
    pub fn declare_vertices(&mut self, label: &str, staged: bool, data: Vec<Vertex>) {
        let entry = VertexEntry {
            data,
            staged,
            client: None,
            server: None,
        };
        if let Some(slot) = self.vertex_buffers.iter_mut().find(|(l, _)| l == label) {
            slot.1 = entry;
        } else {
            self.vertex_buffers.push((label.to_owned(), entry));
        }
    }

    /// Register index data. Indices always take the staged path.
    pub fn declare_indices(&mut self, label: &str, data: Vec<u32>) {
        let entry = IndexEntry {
            data,
            client: None,
            server: None,
        };
        if let Some(slot) = self.index_buffers.iter_mut().find(|(l, _)| l == label) {
            slot.1 = entry;
        } else {
            self.index_buffers.push((label.to_owned(), entry));
        }
    }

    pub fn bind_vertex_label(&mut self, label: &str) {
        self.bound_vertex_label = Some(label.to_owned());
    }

    pub fn bind_index_label(&mut self, label: &str) {
        self.bound_index_label = Some(label.to_owned());
    }

    pub fn bound_vertex_label(&self) -> Option<&str> {
        self.bound_vertex_label.as_deref()
    }

    pub fn bound_index_label(&self) -> Option<&str> {
        self.bound_index_label.as_deref()
    }

    /// Index count of the bound index declaration, available before any
    /// materialization.
    pub fn bound_index_count(&self) -> Option<u32> {
        let label = self.bound_index_label.as_deref()?;
        self.index_buffers
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, e)| e.data.len() as u32)
    }

    pub fn vertex_data(&self, label: &str) -> Option<&[Vertex]> {
        self.vertex_buffers
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, e)| e.data.as_slice())
    }

    pub fn is_staged(&self, label: &str) -> Option<bool> {
        self.vertex_buffers
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, e)| e.staged)
    }

    /// Allocate every declared buffer that is not resident yet. Staged
    /// entries get a client upload followed by a synchronous client→server
    /// copy on the graphics queue.
    pub fn materialize_all(
        &mut self,
        device: &RenderDevice,
        pool: vk::CommandPool,
    ) -> RenderResult<()> {
        for (label, entry) in &mut self.vertex_buffers {
            if entry.client.is_some() || entry.data.is_empty() {
                continue;
            }
            let size = (std::mem::size_of::<Vertex>() * entry.data.len()) as vk::DeviceSize;

            if entry.staged {
                let client = create_buffer(
                    device,
                    size,
                    vk::BufferUsageFlags::TRANSFER_SRC,
                    vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                )?;
                upload(&device.device, &client, &entry.data)?;

                let server = create_buffer(
                    device,
                    size,
                    vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::VERTEX_BUFFER,
                    vk::MemoryPropertyFlags::DEVICE_LOCAL,
                )?;
                copy_buffer(device, pool, client.buffer, server.buffer, size)?;

                entry.client = Some(client);
                entry.server = Some(server);
            } else {
                let client = create_buffer(
                    device,
                    size,
                    vk::BufferUsageFlags::VERTEX_BUFFER,
                    vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                )?;
                upload(&device.device, &client, &entry.data)?;
                entry.client = Some(client);
            }
            log::debug!(
                "materialized vertex buffer {:?} ({} vertices, staged: {})",
                label,
                entry.data.len(),
                entry.staged
            );
        }

        for (label, entry) in &mut self.index_buffers {
            if entry.client.is_some() || entry.data.is_empty() {
                continue;
            }
            let size = (std::mem::size_of::<u32>() * entry.data.len()) as vk::DeviceSize;

            let client = create_buffer(
                device,
                size,
                vk::BufferUsageFlags::TRANSFER_SRC,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            )?;
            upload(&device.device, &client, &entry.data)?;

            let server = create_buffer(
                device,
                size,
                vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::INDEX_BUFFER,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )?;
            copy_buffer(device, pool, client.buffer, server.buffer, size)?;

            entry.client = Some(client);
            entry.server = Some(server);
            log::debug!("materialized index buffer {:?} ({} indices)", label, entry.data.len());
        }

        Ok(())
    }

    /// Draw parameters for the bound labels; `None` until both labels are
    /// bound and their buffers are resident.
    pub fn draw_config(&self) -> Option<DrawConfig> {
        let vertex_label = self.bound_vertex_label.as_deref()?;
        let index_label = self.bound_index_label.as_deref()?;

        let (_, vertex) = self.vertex_buffers.iter().find(|(l, _)| l == vertex_label)?;
        let (_, index) = self.index_buffers.iter().find(|(l, _)| l == index_label)?;

        let vertex_buffer = if vertex.staged {
            vertex.server.as_ref()?.buffer
        } else {
            vertex.client.as_ref()?.buffer
        };

        Some(DrawConfig {
            vertex_buffer,
            index_buffer: index.server.as_ref()?.buffer,
            index_count: index.data.len() as u32,
        })
    }

    /// Release every GPU allocation. Declarations are retained, so a later
    /// materialization pass can rebuild the buffers from the CPU copies.
    pub fn destroy_all(&mut self, device: &RenderDevice) {
        for (_, entry) in &mut self.vertex_buffers {
            destroy_block(&device.device, entry.server.take());
            destroy_block(&device.device, entry.client.take());
        }
        for (_, entry) in &mut self.index_buffers {
            destroy_block(&device.device, entry.server.take());
            destroy_block(&device.device, entry.client.take());
        }
    }
}

/// One host-coherent uniform buffer per swapchain image; images in flight
/// never share an instance. Rebuilt with the swapchain since the image
/// count may change.
#[derive(Default)]
pub struct UniformSet {
    blocks: Vec<BufferBlock>,
}

impl UniformSet {
    pub fn create(device: &RenderDevice, image_count: usize) -> RenderResult<Self> {
        let size = std::mem::size_of::<UniformBlock>() as vk::DeviceSize;
        let blocks = (0..image_count)
            .map(|_| {
                create_buffer(
                    device,
                    size,
                    vk::BufferUsageFlags::UNIFORM_BUFFER,
                    vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                )
            })
            .collect::<RenderResult<Vec<_>>>()?;

        Ok(Self { blocks })
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn buffer(&self, image: usize) -> vk::Buffer {
        self.blocks
            .get(image)
            .map(|b| b.buffer)
            .unwrap_or_else(vk::Buffer::null)
    }

    /// Write the block for one image; called after acquiring that image
    /// and before submission.
    pub fn update(
        &self,
        device: &RenderDevice,
        image: usize,
        block: &UniformBlock,
    ) -> RenderResult<()> {
        if let Some(target) = self.blocks.get(image) {
            upload(&device.device, target, std::slice::from_ref(block))?;
        }
        Ok(())
    }

    pub fn destroy(&mut self, device: &RenderDevice) {
        for block in self.blocks.drain(..) {
            destroy_block(&device.device, Some(block));
        }
    }
}

/// Create a buffer with exclusive sharing and memory matching the
/// requested property flags.
pub fn create_buffer(
    device: &RenderDevice,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    properties: vk::MemoryPropertyFlags,
) -> RenderResult<BufferBlock> {
    let buffer_info = vk::BufferCreateInfo::builder()
        .size(size)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let buffer = unsafe { device.device.create_buffer(&buffer_info, None)? };

    let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

    let memory_type_index = find_memory_type(
        requirements.memory_type_bits,
        properties,
        &device.profile().memory_properties,
    )?;

    let alloc_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type_index);

    let memory = unsafe { device.device.allocate_memory(&alloc_info, None)? };
    unsafe { device.device.bind_buffer_memory(buffer, memory, 0)? };

    Ok(BufferBlock {
        buffer,
        memory,
        requirements,
    })
}

/// Lowest-numbered memory type inside the filter mask that carries all the
/// requested property flags.
pub fn find_memory_type(
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
) -> RenderResult<u32> {
    for i in 0..memory_properties.memory_type_count {
        let in_filter = (type_filter & (1 << i)) != 0;
        let has_properties = memory_properties.memory_types[i as usize]
            .property_flags
            .contains(properties);

        if in_filter && has_properties {
            return Ok(i);
        }
    }

    Err(RenderError::NoSuitableMemoryType {
        type_filter,
        flags: properties,
    })
}

fn upload<T: Copy>(device: &ash::Device, block: &BufferBlock, data: &[T]) -> RenderResult<()> {
    let size = (std::mem::size_of::<T>() * data.len()) as vk::DeviceSize;
    unsafe {
        let ptr =
            device.map_memory(block.memory, 0, size, vk::MemoryMapFlags::empty())? as *mut T;
        ptr.copy_from_nonoverlapping(data.as_ptr(), data.len());
        device.unmap_memory(block.memory);
    }
    Ok(())
}

/// One-shot client→server copy: records a transient command buffer, submits
/// it to the graphics queue, waits for completion and frees it.
fn copy_buffer(
    device: &RenderDevice,
    pool: vk::CommandPool,
    src: vk::Buffer,
    dst: vk::Buffer,
    size: vk::DeviceSize,
) -> RenderResult<()> {
    let alloc_info = vk::CommandBufferAllocateInfo::builder()
        .command_pool(pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);

    let command_buffers = unsafe { device.device.allocate_command_buffers(&alloc_info)? };
    let cmd = command_buffers[0];

    let begin_info = vk::CommandBufferBeginInfo::builder()
        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

    let result = (|| -> RenderResult<()> {
        unsafe {
            device.device.begin_command_buffer(cmd, &begin_info)?;
            let region = vk::BufferCopy::builder().size(size).build();
            device.device.cmd_copy_buffer(cmd, src, dst, &[region]);
            device.device.end_command_buffer(cmd)?;

            let submit = vk::SubmitInfo::builder()
                .command_buffers(&command_buffers)
                .build();
            device
                .device
                .queue_submit(device.graphics_queue, &[submit], vk::Fence::null())
                .map_err(RenderError::QueueSubmit)?;
            device.device.queue_wait_idle(device.graphics_queue)?;
        }
        Ok(())
    })();

    unsafe { device.device.free_command_buffers(pool, &command_buffers) };
    result
}

fn destroy_block(device: &ash::Device, block: Option<BufferBlock>) {
    if let Some(block) = block {
        unsafe {
            device.destroy_buffer(block.buffer, None);
            device.free_memory(block.memory, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (i, &flags) in types.iter().enumerate() {
            props.memory_types[i].property_flags = flags;
        }
        props
    }

    #[test]
    fn memory_type_lookup_picks_the_lowest_matching_index() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ]);

        // Both 1 and 2 match; the lowest wins.
        let index = find_memory_type(
            0b110,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            &props,
        )
        .unwrap();
        assert_eq!(index, 1);
    }

    #[test]
    fn memory_type_lookup_honors_the_filter_mask() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ]);

        let index =
            find_memory_type(0b10, vk::MemoryPropertyFlags::DEVICE_LOCAL, &props).unwrap();
        assert_eq!(index, 1);
    }

    #[test]
    fn memory_type_lookup_fails_without_a_match() {
        let props = memory_properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);

        let err = find_memory_type(0b1, vk::MemoryPropertyFlags::HOST_VISIBLE, &props)
            .unwrap_err();
        assert!(matches!(
            err,
            RenderError::NoSuitableMemoryType { type_filter: 0b1, .. }
        ));
    }

    #[test]
    fn declarations_are_retained_verbatim() {
        let vertices = vec![
            Vertex { position: [0.0, 0.5, 0.0], color: [1.0, 0.0, 0.0] },
            Vertex { position: [-0.5, -0.5, 0.0], color: [0.0, 1.0, 0.0] },
            Vertex { position: [0.5, -0.5, 0.0], color: [0.0, 0.0, 1.0] },
        ];

        let mut buffers = BufferManager::default();
        buffers.declare_vertices("tri", true, vertices.clone());
        buffers.declare_indices("tri", vec![0, 1, 2]);

        assert_eq!(buffers.vertex_data("tri"), Some(vertices.as_slice()));
        assert_eq!(buffers.is_staged("tri"), Some(true));
    }

    #[test]
    fn bound_labels_select_the_draw_source() {
        let mut buffers = BufferManager::default();
        buffers.declare_vertices("a", false, vec![Vertex {
            position: [0.0; 3],
            color: [0.0; 3],
        }]);
        buffers.declare_indices("a", vec![0, 0, 0]);

        assert!(buffers.bound_index_count().is_none());

        buffers.bind_vertex_label("a");
        buffers.bind_index_label("a");
        assert_eq!(buffers.bound_vertex_label(), Some("a"));
        assert_eq!(buffers.bound_index_label(), Some("a"));
        assert_eq!(buffers.bound_index_count(), Some(3));

        // Nothing is resident yet, so there is no draw configuration.
        assert!(buffers.draw_config().is_none());
    }

    #[test]
    fn redeclaring_a_label_replaces_the_data() {
        let mut buffers = BufferManager::default();
        buffers.declare_indices("mesh", vec![0, 1, 2]);
        buffers.declare_indices("mesh", vec![0, 1, 2, 2, 3, 0]);
        buffers.bind_index_label("mesh");

        assert_eq!(buffers.bound_index_count(), Some(6));
    }

    #[test]
    fn vertex_layout_matches_the_shader_interface() {
        let binding = Vertex::binding_description();
        assert_eq!(binding.stride, 24);

        let attributes = Vertex::attribute_descriptions();
        assert_eq!(attributes[0].offset, 0);
        assert_eq!(attributes[1].offset, 12);
    }
}
