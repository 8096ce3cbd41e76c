use ash::vk::{self, AccessFlags2, ImageLayout, PipelineStageFlags2};

use crate::error::{RendererError, Result};

use super::context::Context;

/// Access and stage masks of a single image layout transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LayoutTransition {
    pub src_access_mask: AccessFlags2,
    pub dst_access_mask: AccessFlags2,
    pub src_stage_mask: PipelineStageFlags2,
    pub dst_stage_mask: PipelineStageFlags2,
}

/// Derives the barrier masks from a layout pair. Pairs that nothing in the renderer performs are
/// rejected instead of being turned into an empty barrier.
pub fn layout_transition(old: ImageLayout, new: ImageLayout) -> Result<LayoutTransition> {
    let (src_access_mask, src_stage_mask, dst_access_mask, dst_stage_mask) = match (old, new) {
        // Swapchain images start here. The source stage matches the stage the acquire semaphore
        // is waited on, so the copy cannot start before the image is available.
        (ImageLayout::UNDEFINED, ImageLayout::TRANSFER_DST_OPTIMAL) => (
            AccessFlags2::NONE,
            PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            AccessFlags2::TRANSFER_WRITE,
            PipelineStageFlags2::TRANSFER,
        ),
        (ImageLayout::TRANSFER_DST_OPTIMAL, ImageLayout::SHADER_READ_ONLY_OPTIMAL) => (
            AccessFlags2::TRANSFER_WRITE,
            PipelineStageFlags2::TRANSFER,
            AccessFlags2::SHADER_READ,
            PipelineStageFlags2::FRAGMENT_SHADER,
        ),
        (ImageLayout::UNDEFINED, ImageLayout::GENERAL) => (
            AccessFlags2::NONE,
            PipelineStageFlags2::NONE,
            AccessFlags2::SHADER_WRITE,
            PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
        ),
        (ImageLayout::GENERAL, ImageLayout::TRANSFER_SRC_OPTIMAL) => (
            AccessFlags2::SHADER_WRITE,
            PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
            AccessFlags2::TRANSFER_READ,
            PipelineStageFlags2::TRANSFER,
        ),
        (ImageLayout::TRANSFER_SRC_OPTIMAL, ImageLayout::GENERAL) => (
            AccessFlags2::TRANSFER_READ,
            PipelineStageFlags2::TRANSFER,
            AccessFlags2::SHADER_WRITE,
            PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
        ),
        // Presentation waits on a semaphore, which already makes the writes available
        (ImageLayout::TRANSFER_DST_OPTIMAL, ImageLayout::PRESENT_SRC_KHR) => (
            AccessFlags2::TRANSFER_WRITE,
            PipelineStageFlags2::TRANSFER,
            AccessFlags2::NONE,
            PipelineStageFlags2::NONE,
        ),
        (old, new) => return Err(RendererError::UnsupportedLayoutTransition { old, new }),
    };

    Ok(LayoutTransition {
        src_access_mask,
        dst_access_mask,
        src_stage_mask,
        dst_stage_mask,
    })
}

/// Records one image barrier that moves `image` from `old_layout` to `new_layout`.
pub fn record_layout_transition(
    context: &Context,
    command_buffer: vk::CommandBuffer,
    image: vk::Image,
    old_layout: ImageLayout,
    new_layout: ImageLayout,
    subresource_range: vk::ImageSubresourceRange,
) -> Result<()> {
    let transition = layout_transition(old_layout, new_layout)?;

    let barrier = vk::ImageMemoryBarrier2 {
        old_layout,
        new_layout,
        src_stage_mask: transition.src_stage_mask,
        dst_stage_mask: transition.dst_stage_mask,
        src_access_mask: transition.src_access_mask,
        dst_access_mask: transition.dst_access_mask,
        src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        image,
        subresource_range,
        ..vk::ImageMemoryBarrier2::default()
    };

    let dependency_info =
        vk::DependencyInfo::builder().image_memory_barriers(std::slice::from_ref(&barrier));

    unsafe {
        context
            .synchronisation2_loader
            .cmd_pipeline_barrier2(command_buffer, &dependency_info)
    };
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undefined_to_transfer_dst_only_waits_for_nothing() {
        let transition =
            layout_transition(ImageLayout::UNDEFINED, ImageLayout::TRANSFER_DST_OPTIMAL).unwrap();

        assert_eq!(transition.src_access_mask, AccessFlags2::empty());
        assert_eq!(transition.dst_access_mask, AccessFlags2::TRANSFER_WRITE);
        assert_eq!(transition.dst_stage_mask, PipelineStageFlags2::TRANSFER);
    }

    #[test]
    fn transfer_dst_to_shader_read() {
        let transition = layout_transition(
            ImageLayout::TRANSFER_DST_OPTIMAL,
            ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
        .unwrap();

        assert_eq!(transition.src_access_mask, AccessFlags2::TRANSFER_WRITE);
        assert_eq!(transition.dst_access_mask, AccessFlags2::SHADER_READ);
        assert_eq!(transition.src_stage_mask, PipelineStageFlags2::TRANSFER);
        assert_eq!(transition.dst_stage_mask, PipelineStageFlags2::FRAGMENT_SHADER);
    }

    #[test]
    fn storage_image_round_trip_is_symmetric() {
        let to_source =
            layout_transition(ImageLayout::GENERAL, ImageLayout::TRANSFER_SRC_OPTIMAL).unwrap();
        let back =
            layout_transition(ImageLayout::TRANSFER_SRC_OPTIMAL, ImageLayout::GENERAL).unwrap();

        assert_eq!(to_source.src_access_mask, back.dst_access_mask);
        assert_eq!(to_source.dst_access_mask, back.src_access_mask);
        assert_eq!(to_source.src_stage_mask, back.dst_stage_mask);
        assert_eq!(to_source.dst_stage_mask, back.src_stage_mask);
    }

    #[test]
    fn every_copy_transition_is_known() {
        let pairs = [
            (ImageLayout::UNDEFINED, ImageLayout::GENERAL),
            (ImageLayout::UNDEFINED, ImageLayout::TRANSFER_DST_OPTIMAL),
            (ImageLayout::GENERAL, ImageLayout::TRANSFER_SRC_OPTIMAL),
            (ImageLayout::TRANSFER_DST_OPTIMAL, ImageLayout::PRESENT_SRC_KHR),
            (ImageLayout::TRANSFER_SRC_OPTIMAL, ImageLayout::GENERAL),
        ];
        for (old, new) in pairs {
            assert!(layout_transition(old, new).is_ok(), "{:?} -> {:?}", old, new);
        }
    }

    #[test]
    fn unknown_pairs_are_rejected() {
        let result = layout_transition(
            ImageLayout::PRESENT_SRC_KHR,
            ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        );
        assert!(matches!(
            result,
            Err(RendererError::UnsupportedLayoutTransition {
                old: ImageLayout::PRESENT_SRC_KHR,
                new: ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            })
        ));

        assert!(layout_transition(ImageLayout::GENERAL, ImageLayout::GENERAL).is_err());
    }
}
