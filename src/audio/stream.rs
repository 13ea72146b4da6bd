//! Persistent duplex audio stream
//!
//! One paired input/output cpal session that stays open across many
//! measurements. Rapid stream creation/destruction is known to corrupt
//! DMA state in some embedded audio drivers, so the stream is opened
//! once, paced between jobs, and closed with settle delays.
//!
//! A stream instance moves Closed → Opening → Running → Closed; while
//! Running, each [`DuplexAudioStream::play_and_record`] call arms exactly
//! one job (Idle → Armed → Done | TimedOut). The job slot is the single
//! producer/consumer boundary between the real-time callbacks and the
//! calling thread: callbacks only ever `try_lock` it, never block, never
//! allocate, and report driver trouble through an atomic flag for the
//! waiting caller to observe.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, Device, Host, SampleRate, Stream};
use crossbeam_channel::Sender;

use crate::config::StreamConfig;
use crate::error::{RangingError, StreamError, ValidationError};

/// Settle delay around stream creation and teardown.
const SETTLE: Duration = Duration::from_millis(50);

/// Pacing cooldown recorded after each successful job.
const COOLDOWN: Duration = Duration::from_millis(5);

/// Pause before retrying a job after an xrun.
const RETRY_PAUSE: Duration = Duration::from_millis(20);

/// Silent priming blocks prepended to the first job after (re)opening.
const FIRST_PRIMING_BLOCKS: usize = 3;

/// Silent priming blocks prepended to every later job.
const STEADY_PRIMING_BLOCKS: usize = 1;

/// Lifecycle state of a stream instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Closed,
    Opening,
    Running,
}

/// One in-flight play+record job.
///
/// Shared between the calling thread and both real-time callbacks via
/// `Arc`. The playback buffer is read-only once armed; the record buffer
/// is written only by the input callback until completion is signalled,
/// after which only the caller touches it.
struct JobState {
    /// Playback samples (priming silence + signal + tail silence)
    play: Vec<f32>,
    /// Total frames to play and record
    total: usize,
    /// Next playback frame
    play_pos: AtomicUsize,
    /// Set by the output callback once it has emitted the job's first
    /// frame. The input callback discards everything before this point,
    /// anchoring the record cursor to playback start; otherwise the
    /// measured lag would depend on where in its block cycle the input
    /// stream happened to be when the job was armed.
    play_started: AtomicBool,
    /// Next record frame
    rec_pos: AtomicUsize,
    /// Captured samples, same frame axis as `play`
    record: Mutex<Vec<f32>>,
    /// Driver reported an under/overrun during this job
    xrun: AtomicBool,
    /// Completion signal to the waiting caller
    done_tx: Sender<()>,
}

/// Single-slot job exchange between caller and callbacks.
type JobSlot = Arc<Mutex<Option<Arc<JobState>>>>;

fn current_job(slot: &JobSlot) -> Option<Arc<JobState>> {
    // Callbacks must not block: skip the block if the slot is contended.
    slot.try_lock().ok().and_then(|guard| guard.clone())
}

/// Clear `slot` if it still holds `job`.
///
/// The input callback only clears the slot opportunistically (it must
/// not block), so the caller retires its own job after completion. A
/// different job already in the slot is left alone.
fn retire_job(slot: &JobSlot, job: &Arc<JobState>) {
    let mut guard = slot.lock().unwrap_or_else(|e| e.into_inner());
    if guard.as_ref().is_some_and(|j| Arc::ptr_eq(j, job)) {
        *guard = None;
    }
}

/// Copy playback samples into one driver output block, duplicating the
/// mono job signal across all output channels and zero-filling past the
/// end of the job.
fn write_output_block(job: &JobState, data: &mut [f32], channels: usize) {
    let mut pos = job.play_pos.load(Ordering::Acquire);
    if pos == 0 && !data.is_empty() {
        job.play_started.store(true, Ordering::Release);
    }
    for frame in data.chunks_mut(channels) {
        let sample = if pos < job.total {
            let s = job.play[pos];
            pos += 1;
            s
        } else {
            0.0
        };
        for out in frame.iter_mut() {
            *out = sample;
        }
    }
    job.play_pos.store(pos, Ordering::Release);
}

/// Copy one driver input block (channel 0) into the job record buffer.
/// Returns true when the job just reached its final frame.
fn read_input_block(job: &JobState, data: &[f32], channels: usize) -> bool {
    if !job.play_started.load(Ordering::Acquire) {
        return false;
    }
    let mut pos = job.rec_pos.load(Ordering::Acquire);
    if pos >= job.total {
        return false;
    }
    let Ok(mut record) = job.record.try_lock() else {
        return false;
    };
    for frame in data.chunks(channels) {
        if pos >= job.total {
            break;
        }
        record[pos] = frame[0];
        pos += 1;
    }
    job.rec_pos.store(pos, Ordering::Release);
    pos >= job.total
}

/// Persistent, paced duplex playback+capture session.
pub struct DuplexAudioStream {
    config: StreamConfig,
    state: StreamState,
    slot: JobSlot,
    input_stream: Option<Stream>,
    output_stream: Option<Stream>,
    next_allowed: Option<Instant>,
    jobs_run: u64,
}

impl DuplexAudioStream {
    /// Open a duplex session for `config`.
    ///
    /// Resolves both devices, verifies the sample rate, and starts paired
    /// input/output streams with a fixed block size. Settle delays before
    /// and after creation give the driver time to stabilize.
    pub fn open(config: &StreamConfig) -> Result<Self, StreamError> {
        tracing::info!(
            sample_rate = config.sample_rate_hz,
            frames_per_block = config.frames_per_block,
            "opening duplex stream"
        );
        thread::sleep(SETTLE);

        let host = cpal::default_host();
        let input_device = resolve_input(&host, config.rec_device.as_deref())?;
        let output_device = resolve_output(&host, config.play_device.as_deref())?;

        check_input_rate(&input_device, config.sample_rate_hz)?;
        check_output_rate(&output_device, config.sample_rate_hz)?;

        let slot: JobSlot = Arc::new(Mutex::new(None));

        let rec_channels = config.rec_channels.max(1);
        let play_channels = config.play_channels.max(1);
        let buffer_size = BufferSize::Fixed(config.frames_per_block as u32);

        let input_config = cpal::StreamConfig {
            channels: rec_channels,
            sample_rate: SampleRate(config.sample_rate_hz),
            buffer_size,
        };
        let output_config = cpal::StreamConfig {
            channels: play_channels,
            sample_rate: SampleRate(config.sample_rate_hz),
            buffer_size,
        };

        let out_slot = Arc::clone(&slot);
        let out_channels = play_channels as usize;
        let out_err_slot = Arc::clone(&slot);
        let output_stream = output_device.build_output_stream(
            &output_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                match current_job(&out_slot) {
                    Some(job) => write_output_block(&job, data, out_channels),
                    None => data.fill(0.0),
                }
            },
            move |err| {
                tracing::warn!("output stream error: {err}");
                if let Some(job) = current_job(&out_err_slot) {
                    job.xrun.store(true, Ordering::Relaxed);
                }
            },
            None,
        )?;

        let in_slot = Arc::clone(&slot);
        let in_channels = rec_channels as usize;
        let in_err_slot = Arc::clone(&slot);
        let input_stream = input_device.build_input_stream(
            &input_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let Some(job) = current_job(&in_slot) else {
                    return;
                };
                if read_input_block(&job, data, in_channels) {
                    if let Ok(mut guard) = in_slot.try_lock() {
                        *guard = None;
                    }
                    let _ = job.done_tx.try_send(());
                }
            },
            move |err| {
                tracing::warn!("input stream error: {err}");
                if let Some(job) = current_job(&in_err_slot) {
                    job.xrun.store(true, Ordering::Relaxed);
                }
            },
            None,
        )?;

        let mut stream = Self {
            config: config.clone(),
            state: StreamState::Opening,
            slot,
            input_stream: Some(input_stream),
            output_stream: Some(output_stream),
            next_allowed: None,
            jobs_run: 0,
        };
        if let Some(s) = &stream.output_stream {
            s.play()?;
        }
        if let Some(s) = &stream.input_stream {
            s.play()?;
        }
        thread::sleep(SETTLE);
        stream.state = StreamState::Running;

        tracing::info!("duplex stream running");
        Ok(stream)
    }

    /// Session identity this stream was opened with.
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Play `signal` while recording, returning the capture aligned to
    /// the first sample of `signal` plus `extra_record_s` of tail.
    ///
    /// Contract (in order): rejects a negative tail; sleeps out the
    /// pacing cooldown from the previous call; prepends priming silence
    /// (more on the first job after opening) that is stripped from the
    /// returned recording; arms the single job slot and fails with
    /// [`StreamError::Busy`] if occupied; waits for completion with a
    /// timeout of buffer duration + 1 s; retries exactly once on an xrun.
    pub fn play_and_record(
        &mut self,
        signal: &[f32],
        extra_record_s: f64,
    ) -> Result<Vec<f32>, RangingError> {
        if self.state != StreamState::Running {
            return Err(StreamError::Closed.into());
        }
        if extra_record_s < 0.0 {
            return Err(ValidationError::NegativeExtraRecord(extra_record_s).into());
        }

        if let Some(deadline) = self.next_allowed {
            let now = Instant::now();
            if now < deadline {
                thread::sleep(deadline - now);
            }
        }

        let sr = self.config.sample_rate_hz as f64;
        let extra_frames = (extra_record_s * sr) as usize;
        let total_frames = signal.len() + extra_frames;

        let priming_blocks = if self.jobs_run == 0 {
            FIRST_PRIMING_BLOCKS
        } else {
            STEADY_PRIMING_BLOCKS
        };
        let priming_frames = self.config.frames_per_block * priming_blocks;
        let total_with_priming = priming_frames + total_frames;

        let mut play = vec![0.0f32; total_with_priming];
        play[priming_frames..priming_frames + signal.len()].copy_from_slice(signal);

        for attempt in 0..2 {
            let (done_tx, done_rx) = crossbeam_channel::bounded(1);
            let job = Arc::new(JobState {
                play: play.clone(),
                total: total_with_priming,
                play_pos: AtomicUsize::new(0),
                play_started: AtomicBool::new(false),
                rec_pos: AtomicUsize::new(0),
                record: Mutex::new(vec![0.0f32; total_with_priming]),
                xrun: AtomicBool::new(false),
                done_tx,
            });

            {
                let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
                if slot.is_some() {
                    return Err(StreamError::Busy.into());
                }
                *slot = Some(Arc::clone(&job));
            }

            let timeout = Duration::from_secs_f64(total_with_priming as f64 / sr + 1.0);
            if done_rx.recv_timeout(timeout).is_err() {
                let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
                *slot = None;
                tracing::warn!(
                    frames = total_with_priming,
                    "audio job timed out, slot cleared"
                );
                return Err(StreamError::Timeout.into());
            }

            self.jobs_run += 1;
            retire_job(&self.slot, &job);

            if job.xrun.load(Ordering::Relaxed) {
                if attempt == 0 {
                    tracing::warn!("xrun during audio job, retrying once");
                    thread::sleep(RETRY_PAUSE);
                    continue;
                }
                return Err(StreamError::Xrun.into());
            }

            let record = job.record.lock().unwrap_or_else(|e| e.into_inner());
            let recording = record[priming_frames..priming_frames + total_frames].to_vec();
            self.next_allowed = Some(Instant::now() + COOLDOWN);
            tracing::debug!(
                frames = total_frames,
                priming = priming_frames,
                attempt,
                "audio job complete"
            );
            return Ok(recording);
        }

        Err(StreamError::Xrun.into())
    }

    /// Close the session, letting the driver settle between stop and
    /// release. Idempotent; also invoked on drop.
    pub fn close(&mut self) {
        if self.state == StreamState::Closed {
            return;
        }
        if let Some(stream) = &self.output_stream {
            let _ = stream.pause();
        }
        if let Some(stream) = &self.input_stream {
            let _ = stream.pause();
        }
        thread::sleep(SETTLE);
        self.input_stream = None;
        self.output_stream = None;
        thread::sleep(SETTLE);

        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        *slot = None;
        drop(slot);

        self.state = StreamState::Closed;
        tracing::info!("duplex stream closed");
    }
}

impl Drop for DuplexAudioStream {
    fn drop(&mut self) {
        self.close();
    }
}

fn resolve_input(host: &Host, name: Option<&str>) -> Result<Device, StreamError> {
    match name {
        Some(wanted) => host
            .input_devices()?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
            .ok_or_else(|| StreamError::DeviceNotFound(wanted.to_string())),
        None => host
            .default_input_device()
            .ok_or_else(|| StreamError::DeviceNotFound("default input device".to_string())),
    }
}

fn resolve_output(host: &Host, name: Option<&str>) -> Result<Device, StreamError> {
    match name {
        Some(wanted) => host
            .output_devices()?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
            .ok_or_else(|| StreamError::DeviceNotFound(wanted.to_string())),
        None => host
            .default_output_device()
            .ok_or_else(|| StreamError::DeviceNotFound("default output device".to_string())),
    }
}

fn check_input_rate(device: &Device, rate: u32) -> Result<(), StreamError> {
    match device.supported_input_configs() {
        Ok(mut configs) => {
            if configs.any(|c| (c.min_sample_rate().0..=c.max_sample_rate().0).contains(&rate)) {
                Ok(())
            } else {
                Err(StreamError::UnsupportedSampleRate {
                    device: device.name().unwrap_or_else(|_| "unknown".to_string()),
                    rate,
                })
            }
        }
        Err(e) => {
            // Some backends cannot enumerate configs; let the build fail
            // instead if the rate is genuinely unsupported.
            tracing::warn!("could not query input configs: {e}");
            Ok(())
        }
    }
}

fn check_output_rate(device: &Device, rate: u32) -> Result<(), StreamError> {
    match device.supported_output_configs() {
        Ok(mut configs) => {
            if configs.any(|c| (c.min_sample_rate().0..=c.max_sample_rate().0).contains(&rate)) {
                Ok(())
            } else {
                Err(StreamError::UnsupportedSampleRate {
                    device: device.name().unwrap_or_else(|_| "unknown".to_string()),
                    rate,
                })
            }
        }
        Err(e) => {
            tracing::warn!("could not query output configs: {e}");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_job(play: Vec<f32>) -> (Arc<JobState>, crossbeam_channel::Receiver<()>) {
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let total = play.len();
        let job = Arc::new(JobState {
            play,
            total,
            play_pos: AtomicUsize::new(0),
            play_started: AtomicBool::new(false),
            rec_pos: AtomicUsize::new(0),
            record: Mutex::new(vec![0.0f32; total]),
            xrun: AtomicBool::new(false),
            done_tx,
        });
        (job, done_rx)
    }

    #[test]
    fn test_output_block_mono() {
        let (job, _rx) = test_job(vec![0.1, 0.2, 0.3, 0.4]);
        let mut block = [0.0f32; 3];

        write_output_block(&job, &mut block, 1);
        assert_eq!(block, [0.1, 0.2, 0.3]);
        assert_eq!(job.play_pos.load(Ordering::Relaxed), 3);

        write_output_block(&job, &mut block, 1);
        // Past the end of the job the output is silence.
        assert_eq!(block, [0.4, 0.0, 0.0]);
        assert_eq!(job.play_pos.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn test_output_block_duplicates_across_channels() {
        let (job, _rx) = test_job(vec![0.5, -0.5]);
        let mut block = [0.0f32; 4];

        write_output_block(&job, &mut block, 2);
        assert_eq!(block, [0.5, 0.5, -0.5, -0.5]);
    }

    #[test]
    fn test_input_block_takes_channel_zero() {
        let (job, _rx) = test_job(vec![0.0; 3]);
        job.play_started.store(true, Ordering::Release);
        // Stereo input: channel 0 = signal, channel 1 = junk.
        let data = [0.1, 9.0, 0.2, 9.0, 0.3, 9.0];

        let completed = read_input_block(&job, &data, 2);
        assert!(completed);
        let record = job.record.lock().unwrap();
        assert_eq!(&record[..], &[0.1, 0.2, 0.3]);
    }

    #[test]
    fn test_input_completion_on_exact_boundary() {
        let (job, _rx) = test_job(vec![0.0; 4]);
        job.play_started.store(true, Ordering::Release);

        assert!(!read_input_block(&job, &[0.1, 0.2], 1));
        assert!(read_input_block(&job, &[0.3, 0.4], 1));
        // Further input past completion is ignored.
        assert!(!read_input_block(&job, &[0.9, 0.9], 1));
        let record = job.record.lock().unwrap();
        assert_eq!(&record[..], &[0.1, 0.2, 0.3, 0.4]);
    }

    #[test]
    fn test_play_and_record_frame_alignment() {
        // Played samples and recorded samples advance on the same frame
        // axis, so a loopback of the output reproduces the input offsets.
        let (job, _rx) = test_job(vec![1.0, 2.0, 3.0, 4.0]);
        let mut out = [0.0f32; 2];

        write_output_block(&job, &mut out, 1);
        read_input_block(&job, &out, 1);
        write_output_block(&job, &mut out, 1);
        read_input_block(&job, &out, 1);

        let record = job.record.lock().unwrap();
        assert_eq!(&record[..], &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_capture_waits_for_playback_start() {
        let (job, _rx) = test_job(vec![0.5; 4]);

        // Input callbacks before the output side has serviced the job
        // must not consume any frames.
        assert!(!read_input_block(&job, &[0.9, 0.9], 1));
        assert_eq!(job.rec_pos.load(Ordering::Relaxed), 0);

        let mut out = [0.0f32; 2];
        write_output_block(&job, &mut out, 1);
        assert!(!read_input_block(&job, &out, 1));
        assert_eq!(job.rec_pos.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_loopback_lag_independent_of_arming_phase() {
        // However many input callback cycles fire before playback of the
        // job begins, the captured signal lands at the same offset.
        let signal = [1.0f32, 2.0, 3.0, 4.0];
        for pre_blocks in [0usize, 1, 3] {
            let (job, _rx) = test_job(signal.to_vec());
            for _ in 0..pre_blocks {
                read_input_block(&job, &[0.0, 0.0], 1);
            }

            let mut out = [0.0f32; 2];
            write_output_block(&job, &mut out, 1);
            read_input_block(&job, &out, 1);
            write_output_block(&job, &mut out, 1);
            read_input_block(&job, &out, 1);

            let record = job.record.lock().unwrap();
            assert_eq!(&record[..], &signal, "pre_blocks = {pre_blocks}");
        }
    }

    #[test]
    fn test_retire_clears_only_own_job() {
        let slot: JobSlot = Arc::new(Mutex::new(None));
        let (job, _rx) = test_job(vec![0.0; 2]);
        *slot.lock().unwrap() = Some(Arc::clone(&job));

        retire_job(&slot, &job);
        assert!(slot.lock().unwrap().is_none());

        // A different in-flight job is not disturbed.
        let (other, _rx2) = test_job(vec![0.0; 2]);
        *slot.lock().unwrap() = Some(Arc::clone(&other));
        retire_job(&slot, &job);
        assert!(slot.lock().unwrap().is_some());
    }

    #[test]
    fn test_completed_job_is_retired_even_if_callback_could_not() {
        // The input callback clears the slot with try_lock only; if that
        // fails the job would otherwise sit in the slot forever and every
        // later call would report Busy.
        let slot: JobSlot = Arc::new(Mutex::new(None));
        let (job, _rx) = test_job(vec![0.0; 2]);
        job.rec_pos.store(2, Ordering::Release); // already complete
        *slot.lock().unwrap() = Some(Arc::clone(&job));

        retire_job(&slot, &job);
        assert!(slot.lock().unwrap().is_none());
    }

    #[test]
    fn test_job_slot_exchange() {
        let slot: JobSlot = Arc::new(Mutex::new(None));
        assert!(current_job(&slot).is_none());

        let (job, _rx) = test_job(vec![0.0; 8]);
        *slot.lock().unwrap() = Some(Arc::clone(&job));
        assert!(current_job(&slot).is_some());

        *slot.lock().unwrap() = None;
        assert!(current_job(&slot).is_none());
    }
}
