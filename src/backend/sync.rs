// Frame synchronization primitives
//
// N reusable frame slots, each with an in-flight fence and a pair of
// semaphores, plus a table mapping swapchain image index to the frame slot
// currently consuming it. The table borrows slot fences by index; it never
// owns a second copy of them, and it is reset whenever the swapchain is
// rebuilt because the image count may change.

use ash::vk;

use super::error::RenderResult;

/// Synchronization context for one frame slot.
pub struct FrameSlot {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight: vk::Fence,
}

impl FrameSlot {
    fn new(device: &ash::Device) -> RenderResult<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        // Signaled at birth so the first wait on each slot passes through.
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        unsafe {
            Ok(Self {
                image_available: device.create_semaphore(&semaphore_info, None)?,
                render_finished: device.create_semaphore(&semaphore_info, None)?,
                in_flight: device.create_fence(&fence_info, None)?,
            })
        }
    }
}

pub struct FrameSync {
    slots: Vec<FrameSlot>,
    image_in_flight: Vec<Option<usize>>,
    current: usize,
}

impl FrameSync {
    pub fn new(
        device: &ash::Device,
        frames_in_flight: usize,
        image_count: usize,
    ) -> RenderResult<Self> {
        let slots = (0..frames_in_flight.max(1))
            .map(|_| FrameSlot::new(device))
            .collect::<RenderResult<Vec<_>>>()?;

        Ok(Self {
            slots,
            image_in_flight: vec![None; image_count],
            current: 0,
        })
    }

    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn current_slot(&self) -> &FrameSlot {
        &self.slots[self.current]
    }

    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.slots.len();
    }

    /// Fence of the frame slot still consuming `image`, if any.
    pub fn image_fence(&self, image: usize) -> Option<vk::Fence> {
        self.image_in_flight
            .get(image)
            .copied()
            .flatten()
            .map(|slot| self.slots[slot].in_flight)
    }

    pub fn assign_image(&mut self, image: usize, slot: usize) {
        if let Some(entry) = self.image_in_flight.get_mut(image) {
            *entry = Some(slot);
        }
    }

    /// Forget stale image associations after a swapchain rebuild.
    pub fn reset_image_table(&mut self, image_count: usize) {
        self.image_in_flight.clear();
        self.image_in_flight.resize(image_count, None);
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        for slot in self.slots.drain(..) {
            unsafe {
                device.destroy_semaphore(slot.image_available, None);
                device.destroy_semaphore(slot.render_finished, None);
                device.destroy_fence(slot.in_flight, None);
            }
        }
        self.image_in_flight.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn null_sync(frames: usize, images: usize) -> FrameSync {
        let slots = (0..frames)
            .map(|_| FrameSlot {
                image_available: vk::Semaphore::null(),
                render_finished: vk::Semaphore::null(),
                in_flight: vk::Fence::null(),
            })
            .collect();
        FrameSync {
            slots,
            image_in_flight: vec![None; images],
            current: 0,
        }
    }

    #[test]
    fn slot_cycling_is_periodic() {
        for frames in 1..=4 {
            let mut sync = null_sync(frames, 3);
            assert_eq!(sync.current(), 0);
            for _ in 0..frames {
                sync.advance();
            }
            assert_eq!(sync.current(), 0, "period {frames} should wrap to the start");
        }
    }

    #[test]
    fn image_table_tracks_borrowed_slots() {
        let mut sync = null_sync(2, 3);
        assert!(sync.image_fence(1).is_none());

        sync.assign_image(1, 0);
        assert!(sync.image_fence(1).is_some());
        assert!(sync.image_fence(0).is_none());

        // Out-of-range images are ignored rather than tracked.
        sync.assign_image(9, 0);
        assert!(sync.image_fence(9).is_none());
    }

    #[test]
    fn rebuild_resets_the_image_table() {
        let mut sync = null_sync(2, 3);
        sync.assign_image(0, 1);
        sync.assign_image(2, 0);

        sync.reset_image_table(4);
        for image in 0..4 {
            assert!(sync.image_fence(image).is_none());
        }
    }
}
