use std::ptr::NonNull;

use ffmpeg_next::ffi;

/// A reference-counted handle on a decoded frame.
///
/// Cloning only bumps the reference count of the underlying buffers, so a
/// frame can be queued by one sink while another keeps decoding into its
/// own scratch frame.
pub struct SharedFrame(NonNull<ffi::AVFrame>);

// AVFrame buffers are refcounted with atomic counters; a SharedFrame is an
// exclusive owner of its AVFrame wrapper.
unsafe impl Send for SharedFrame {}
unsafe impl Sync for SharedFrame {}

impl SharedFrame {
    /// Take a new reference on `frame`. Fails only on allocation failure.
    ///
    /// # Safety
    /// `frame` must point to a valid AVFrame with refcounted buffers.
    pub unsafe fn from_av(frame: *const ffi::AVFrame) -> Option<SharedFrame> {
        let ptr = unsafe { ffi::av_frame_clone(frame) };
        NonNull::new(ptr).map(SharedFrame)
    }

    pub fn as_ptr(&self) -> *const ffi::AVFrame {
        self.0.as_ptr()
    }

    pub fn pts(&self) -> Option<i64> {
        let pts = unsafe { (*self.0.as_ptr()).pts };
        if pts == ffi::AV_NOPTS_VALUE {
            return None;
        }

        Some(pts)
    }

    /// Number of audio sample-frames (per channel), 0 for video frames.
    pub fn samples(&self) -> u32 {
        unsafe { (*self.0.as_ptr()).nb_samples as u32 }
    }

    pub fn width(&self) -> u32 {
        unsafe { (*self.0.as_ptr()).width as u32 }
    }

    pub fn height(&self) -> u32 {
        unsafe { (*self.0.as_ptr()).height as u32 }
    }

    /// Data planes, in the layout expected by `swr_convert`.
    pub(crate) fn plane_ptrs(&self) -> *const *const u8 {
        unsafe { (*self.0.as_ptr()).extended_data as *const *const u8 }
    }
}

impl Clone for SharedFrame {
    fn clone(&self) -> Self {
        unsafe { SharedFrame::from_av(self.0.as_ptr()) }.expect("av_frame_clone failed")
    }
}

impl Drop for SharedFrame {
    fn drop(&mut self) {
        let mut ptr = self.0.as_ptr();
        unsafe { ffi::av_frame_free(&mut ptr) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ffmpeg_next::util::channel_layout::ChannelLayout;
    use ffmpeg_next::util::format;
    use ffmpeg_next::util::frame;

    fn audio_frame(samples: usize, pts: i64) -> frame::Audio {
        let mut frame = frame::Audio::new(
            format::Sample::F32(format::sample::Type::Packed),
            samples,
            ChannelLayout::STEREO,
        );
        frame.set_pts(Some(pts));
        frame
    }

    #[test]
    fn test_shared_frame_keeps_properties() {
        let frame = audio_frame(480, 123_456);
        let shared = unsafe { SharedFrame::from_av(frame.as_ptr()) }.unwrap();

        assert_eq!(shared.pts(), Some(123_456));
        assert_eq!(shared.samples(), 480);
    }

    #[test]
    fn test_clone_is_independent() {
        let frame = audio_frame(120, 7);
        let shared = unsafe { SharedFrame::from_av(frame.as_ptr()) }.unwrap();
        let cloned = shared.clone();
        drop(shared);

        assert_eq!(cloned.pts(), Some(7));
        assert_eq!(cloned.samples(), 120);
    }
}
