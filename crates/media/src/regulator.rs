use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use ffmpeg_next::ffi;
use ffmpeg_next::software::resampling;
use ffmpeg_next::util::channel_layout::ChannelLayout;
use ffmpeg_next::util::format;
use thiserror::Error;

use mirror_common::RollingAverage;

use crate::audiobuf::AudioBuffer;
use crate::frame::SharedFrame;

/// Samples are handed to the output device as packed f32.
pub const OUTPUT_FORMAT: format::Sample = format::Sample::F32(format::sample::Type::Packed);

const BYTES_PER_CHANNEL: usize = 4;

/// Window of the buffering-level average. Samples are produced and
/// consumed by blocks, so the level must be smoothed to mean anything.
const AVERAGE_RANGE: u32 = 128;

#[derive(Error, Debug)]
pub enum RegulatorError {
    #[error("could not initialize the resampler")]
    ResamplerInit(#[from] ffmpeg_next::Error),
}

/// Feeds a pull-based audio output from a push-based decoded stream.
///
/// The producer delivers samples at the device capture rate, the consumer
/// drains them at the local output rate; both are real-time and neither
/// can be slowed down. The regulator keeps the average buffered level
/// near `target_buffering` by applying a small, clamped resampling
/// compensation, and inserts silence on underflow rather than dropping
/// samples later (dropping would only deepen the underflow and produce
/// audible glitches; the compensation absorbs the inserted silence over
/// a few seconds).
pub struct AudioRegulator {
    buf: AudioBuffer,
    /// Target buffering, in samples.
    target_buffering: u32,
    sample_rate: u32,
    /// Bytes per sample-frame (all channels).
    sample_size: usize,
    /// Serialises the consumer against the rare producer paths that
    /// advance the read cursor (dropping old samples when the ring is
    /// full or over the buffering cap).
    mutex: Mutex<()>,
    push_state: Mutex<PushState>,
    received: AtomicBool,
    played: AtomicBool,
    /// Samples of silence inserted since the last push.
    underflow: AtomicU32,
}

struct Resampler(resampling::Context);

// SwrContext has no thread affinity; it is only ever used under the
// push-state lock.
unsafe impl Send for Resampler {}

struct PushState {
    swr: Resampler,
    swr_buf: Vec<u8>,
    avg_buffering: RollingAverage,
    samples_since_resync: u32,
    compensation_active: bool,
}

impl AudioRegulator {
    pub fn new(
        sample_rate: u32,
        channel_layout: ChannelLayout,
        input_format: format::Sample,
        target_buffering: u32,
    ) -> Result<Self, RegulatorError> {
        let swr = resampling::Context::get(
            input_format,
            channel_layout,
            sample_rate,
            OUTPUT_FORMAT,
            channel_layout,
            sample_rate,
        )?;

        let channels = channel_layout.channels().max(1) as usize;
        let sample_size = channels * BYTES_PER_CHANNEL;

        // One second on top of the target so that producer and consumer
        // can run in parallel without locking in the common case.
        let capacity = target_buffering + sample_rate;
        let buf = AudioBuffer::new(sample_size, capacity.max(1));

        let swr_buf = vec![0u8; 4096 * sample_size];

        Ok(Self {
            buf,
            target_buffering,
            sample_rate,
            sample_size,
            mutex: Mutex::new(()),
            push_state: Mutex::new(PushState {
                swr: Resampler(swr),
                swr_buf,
                avg_buffering: RollingAverage::new(AVERAGE_RANGE),
                samples_since_resync: 0,
                compensation_active: false,
            }),
            received: AtomicBool::new(false),
            played: AtomicBool::new(false),
            underflow: AtomicU32::new(0),
        })
    }

    pub fn sample_size(&self) -> usize {
        self.sample_size
    }

    pub fn target_buffering(&self) -> u32 {
        self.target_buffering
    }

    pub fn buffered_samples(&self) -> u32 {
        self.buf.can_read()
    }

    #[cfg(test)]
    fn underflow_samples(&self) -> u32 {
        self.underflow.load(Ordering::Relaxed)
    }

    fn to_bytes(&self, samples: u32) -> usize {
        samples as usize * self.sample_size
    }

    /// Consumer side, called from the audio output callback (a
    /// platform-owned realtime thread). Fills `out` entirely, padding
    /// with silence whatever the ring cannot provide.
    pub fn pull(&self, out: &mut [u8]) {
        debug_assert!(out.len() % self.sample_size == 0);
        let out_samples = (out.len() / self.sample_size) as u32;

        let guard = self.mutex.lock().unwrap();

        if !self.played.load(Ordering::Relaxed) {
            let buffered = self.buf.can_read();
            if buffered < self.target_buffering {
                // Delay the playback start until the target buffering is
                // reached, otherwise it would start with an underflow.
                log::trace!("[Audio] Inserting initial buffering silence: {out_samples} samples");
                out.fill(0);
                return;
            }
        }

        let read = self.buf.read(out);

        drop(guard);

        if read < out_samples {
            let silence = out_samples - read;
            log::debug!("[Audio] Buffer underflow, inserting silence: {silence} samples");
            out[self.to_bytes(read)..].fill(0);

            if self.received.load(Ordering::Relaxed) {
                // Inserting samples immediately increases buffering
                self.underflow.fetch_add(silence, Ordering::Relaxed);
            }
        }

        self.played.store(true, Ordering::Relaxed);
    }

    /// Same as [`pull`](Self::pull) for an f32 output buffer.
    pub fn pull_f32(&self, out: &mut [f32]) {
        let bytes = unsafe {
            std::slice::from_raw_parts_mut(out.as_mut_ptr() as *mut u8, std::mem::size_of_val(out))
        };
        self.pull(bytes);
    }

    /// Producer side: resample the frame and store the result in the
    /// ring, dropping the oldest samples if the consumer fell too far
    /// behind.
    pub fn push(&self, frame: &SharedFrame) -> bool {
        let mut state = self.push_state.lock().unwrap();
        let PushState { swr, swr_buf, .. } = &mut *state;

        let in_samples = frame.samples();
        let swr_ptr = unsafe { swr.0.as_mut_ptr() };

        // Input and output rates are identical, no rescaling needed. The
        // extra 256 samples give the compensation some headroom.
        let swr_delay = unsafe { ffi::swr_get_delay(swr_ptr, self.sample_rate as i64) };
        let dst_nb_samples = swr_delay as usize + in_samples as usize + 256;

        let needed = dst_nb_samples * self.sample_size;
        if swr_buf.len() < needed {
            swr_buf.resize(needed + 4096, 0);
        }

        let ret = unsafe {
            let mut out_planes = [swr_buf.as_mut_ptr()];
            ffi::swr_convert(
                swr_ptr,
                out_planes.as_mut_ptr() as _,
                dst_nb_samples as i32,
                frame.plane_ptrs() as _,
                in_samples as i32,
            )
        };
        if ret < 0 {
            log::error!("Resampling failed: {ret}");
            return false;
        }

        let mut samples = (ret as u32).min(dst_nb_samples as u32);

        let capacity = self.buf.capacity();
        let mut src = &swr_buf[..self.to_bytes(samples)];
        if samples > capacity {
            // A single resampled frame larger than the whole ring would
            // mean something went very wrong upstream; keep only the
            // newest samples.
            src = &src[self.to_bytes(samples - capacity)..];
            samples = capacity;
        }

        let mut skipped_samples: u32 = 0;

        let mut written = self.buf.write(src);
        if written < samples {
            // The lock-free write path is exhausted, old samples must be
            // dropped to make room.
            let guard = self.mutex.lock().unwrap();

            written += self.buf.write(&src[self.to_bytes(written)..]);
            if written < samples {
                let remaining = samples - written;
                skipped_samples = self.buf.skip(remaining);
                debug_assert_eq!(skipped_samples, remaining);
            }

            drop(guard);

            if written < samples {
                // Now there is enough space
                let w = self.buf.write(&src[self.to_bytes(written)..]);
                debug_assert_eq!(w, samples - written);
                written += w;
            }
        }

        let played = self.played.load(Ordering::Relaxed);
        let underflow;
        let max_buffered_samples;
        if played {
            underflow = self.underflow.swap(0, Ordering::Relaxed);
            max_buffered_samples =
                self.target_buffering * 11 / 10 + 60 * self.sample_rate / 1000;
        } else {
            // Playback has not started: keeping more than a few ms over
            // the target would only add startup latency and glitches to
            // compensate later.
            underflow = 0;
            max_buffered_samples = self.target_buffering + 10 * self.sample_rate / 1000;
        }

        let mut can_read = self.buf.can_read();
        if can_read > max_buffered_samples {
            let mut skip = 0;

            let guard = self.mutex.lock().unwrap();
            can_read = self.buf.can_read();
            if can_read > max_buffered_samples {
                skip = self.buf.skip(can_read - max_buffered_samples);
                skipped_samples += skip;
            }
            drop(guard);

            if skip > 0 && played {
                log::debug!("[Audio] Buffering threshold exceeded, skipping {skip} samples");
            }
        }

        self.received.store(true, Ordering::Relaxed);
        if !played {
            return true;
        }

        // Samples added (or removed) by the resampler compensation
        let instant_compensation = written as i32 - in_samples as i32;
        // Inserted silence instantly increases buffering, dropped samples
        // instantly decrease it; neither must be smoothed.
        let instant = instant_compensation + underflow as i32 - skipped_samples as i32;
        state.avg_buffering.adjust(instant as f32);
        state.avg_buffering.push(can_read as f32);

        state.samples_since_resync += written;
        if state.samples_since_resync >= self.sample_rate {
            // Recompute the compensation every second
            state.samples_since_resync = 0;
            self.update_compensation(&mut state, can_read);
        }

        true
    }

    fn update_compensation(&self, state: &mut PushState, can_read: u32) {
        let avg = state.avg_buffering.get();
        let diff = compensation_diff(
            self.target_buffering,
            avg,
            can_read,
            state.compensation_active,
            self.sample_rate,
        );

        // Compensate over 4 seconds (recomputed after 1 anyway)
        let distance = 4 * self.sample_rate as i32;

        log::trace!(
            "[Audio] Buffering: target={} avg={avg} cur={can_read} compensation={diff}",
            self.target_buffering
        );

        let swr_ptr = unsafe { state.swr.0.as_mut_ptr() };
        let ret = unsafe { ffi::swr_set_compensation(swr_ptr, diff, distance) };
        if ret < 0 {
            // Not fatal
            log::warn!("Resampling compensation failed: {ret}");
        } else {
            state.compensation_active = diff != 0;
        }
    }
}

/// Number of samples to add (or remove, if negative) over a 4-second
/// distance to bring the average buffering back to the target.
fn compensation_diff(target: u32, avg: f32, can_read: u32, active: bool, sample_rate: u32) -> i32 {
    let mut diff = target as i32 - avg as i32;

    // Hysteresis: enable compensation over +/- 4 ms of error, disable it
    // again under +/- 1 ms, so it cannot oscillate around the threshold.
    let threshold = if active {
        sample_rate as i32 / 1000
    } else {
        sample_rate as i32 * 4 / 1000
    };

    if diff.abs() < threshold {
        // The remaining error is just noise
        diff = 0;
    } else if diff < 0 && can_read < target {
        // Do not accelerate while instantaneously below the target, this
        // would increase underflow
        diff = 0;
    }

    // Limit the compensation rate to 2%
    let abs_max_diff = 4 * sample_rate as i32 / 50;
    diff.clamp(-abs_max_diff, abs_max_diff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ffmpeg_next::util::frame;

    const RATE: u32 = 48_000;

    fn regulator(target: u32) -> AudioRegulator {
        ffmpeg_next::init().unwrap();
        AudioRegulator::new(
            RATE,
            ChannelLayout::STEREO,
            format::Sample::F32(format::sample::Type::Packed),
            target,
        )
        .unwrap()
    }

    fn stereo_frame(samples: usize, value: f32) -> SharedFrame {
        let mut frame = frame::Audio::new(
            format::Sample::F32(format::sample::Type::Packed),
            samples,
            ChannelLayout::STEREO,
        );
        frame.set_pts(Some(0));

        // plane() does not account for packed channels, go through the
        // raw frame instead
        unsafe {
            let data = std::slice::from_raw_parts_mut(
                (*frame.as_mut_ptr()).data[0] as *mut f32,
                samples * 2,
            );
            data.fill(value);
        }

        unsafe { SharedFrame::from_av(frame.as_ptr()) }.unwrap()
    }

    #[test]
    fn test_identity_passthrough() {
        let regulator = regulator(0);
        assert!(regulator.push(&stereo_frame(480, 0.25)));
        assert_eq!(regulator.buffered_samples(), 480);

        let mut out = vec![0f32; 480 * 2];
        regulator.pull_f32(&mut out);
        assert!(out.iter().all(|&v| v == 0.25));
        assert_eq!(regulator.underflow_samples(), 0);
    }

    #[test]
    fn test_underflow_is_counted_after_first_receive() {
        let regulator = regulator(0);

        // Nothing received yet: silence, but no underflow accounting
        let mut out = vec![1f32; 100 * 2];
        regulator.pull_f32(&mut out);
        assert!(out.iter().all(|&v| v == 0.0));
        assert_eq!(regulator.underflow_samples(), 0);

        assert!(regulator.push(&stereo_frame(480, 0.5)));
        let mut out = vec![0f32; 480 * 2];
        regulator.pull_f32(&mut out);

        // The ring is now empty and frames have been received: pulling
        // 1000 more samples inserts 1000 samples of silence
        let mut out = vec![1f32; 1000 * 2];
        regulator.pull_f32(&mut out);
        assert!(out.iter().all(|&v| v == 0.0));
        assert_eq!(regulator.underflow_samples(), 1000);
    }

    #[test]
    fn test_playback_waits_for_target_buffering() {
        let regulator = regulator(1000);

        assert!(regulator.push(&stereo_frame(480, 0.5)));

        // Below target: silence only, and the buffered samples are kept
        let mut out = vec![1f32; 100 * 2];
        regulator.pull_f32(&mut out);
        assert!(out.iter().all(|&v| v == 0.0));
        assert_eq!(regulator.buffered_samples(), 480);
        assert_eq!(regulator.underflow_samples(), 0);

        assert!(regulator.push(&stereo_frame(600, 0.5)));
        assert!(regulator.buffered_samples() >= 1000);

        // Target reached: real samples flow
        let mut out = vec![0f32; 100 * 2];
        regulator.pull_f32(&mut out);
        assert!(out.iter().all(|&v| v == 0.5));
    }

    #[test]
    fn test_initial_buffering_is_capped() {
        let regulator = regulator(1000);

        // Playback not started: the buffer must not accumulate much more
        // than the target (10 ms at 48 kHz = 480 samples of margin)
        for _ in 0..10 {
            assert!(regulator.push(&stereo_frame(480, 0.5)));
        }

        assert!(regulator.buffered_samples() <= 1000 + 480);
    }

    #[test]
    fn test_compensation_hysteresis() {
        // 4800 samples of error at 48 kHz is 100 ms, well over 4 ms
        assert!(compensation_diff(9600, 4800.0, 9600, false, RATE) > 0);

        // 100 samples (~2 ms) is below the 4 ms enabling threshold
        assert_eq!(compensation_diff(9600, 9500.0, 9600, false, RATE), 0);

        // but once active, compensation keeps going down to 1 ms
        assert!(compensation_diff(9600, 9500.0, 9600, true, RATE) > 0);
        assert_eq!(compensation_diff(9600, 9580.0, 9600, true, RATE), 0);
    }

    #[test]
    fn test_compensation_never_accelerates_below_target() {
        // avg says we are over the target, but the instantaneous level is
        // below it: accelerating would deepen the underflow
        assert_eq!(compensation_diff(9600, 15_000.0, 9000, false, RATE), 0);

        // with the instantaneous level over the target, it may accelerate
        assert!(compensation_diff(9600, 15_000.0, 12_000, false, RATE) < 0);
    }

    #[test]
    fn test_compensation_is_clamped_to_two_percent() {
        let max = 4 * RATE as i32 / 50;
        assert_eq!(compensation_diff(96_000, 0.0, 96_000, false, RATE), max);
        assert_eq!(
            compensation_diff(0, 96_000.0, 96_000, false, RATE),
            -max
        );
    }

    #[test]
    fn test_sample_conservation() {
        // Over any prefix: pushed = pulled - silence + dropped
        let regulator = regulator(0);

        let mut pulled_real = 0u32;
        let mut silence = 0u32;

        for _ in 0..20 {
            assert!(regulator.push(&stereo_frame(480, 1.0)));

            let mut out = vec![0f32; 500 * 2];
            regulator.pull_f32(&mut out);
            let real = out.chunks(2).filter(|c| c[0] != 0.0).count() as u32;
            pulled_real += real;
            silence += 500 - real;
        }

        // Every pushed sample is eventually pulled or still buffered, and
        // everything else the consumer received was accounted silence.
        let remaining = regulator.buffered_samples();
        assert_eq!(20 * 480, pulled_real + remaining);
        assert_eq!(20 * 500, pulled_real + silence);
    }
}
