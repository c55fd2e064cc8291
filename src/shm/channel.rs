//! Single-slot frame mailbox in a named POSIX shared-memory segment.
//!
//! Layout: `[SharedFrameHeader][width * height * channels pixel bytes]`.
//! The creator (producer) owns the name and unlinks it; openers only map it.

use std::fs::File;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use memmap2::{MmapOptions, MmapRaw};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::media::{convert, Frame};
use crate::shm::header::{
    frame_len, segment_len, FrameInfo, HeaderSnapshot, SharedFrameHeader, HEADER_SIZE,
};

/// Back-off while a writer is mid-copy
const CONTENDED_BACKOFF: Duration = Duration::from_micros(200);
/// Give up on a writer that stays mid-copy for about a second
const STALL_LIMIT: u32 = 5_000;
/// Write sequences are even once complete, so this never matches one
const NOTHING_DELIVERED: u64 = u64::MAX;

/// How a waiting reader polls for the new-frame flag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(50),
            max_attempts: 100,
        }
    }
}

impl PollPolicy {
    /// Upper bound on how long a waiting read can sleep before timing out
    pub fn budget(&self) -> Duration {
        self.interval * self.max_attempts
    }
}

/// Result of a read that did not fail
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReadOutcome {
    /// Pixels were copied out; the snapshot describes them
    Frame(HeaderSnapshot),
    /// No new frame within the poll budget
    Timeout,
    /// The producer signalled end of video
    EndOfStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    Creator,
    Opener,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub frames_written: u64,
    pub frames_read: u64,
    pub timeouts: u64,
}

#[derive(Default)]
struct Counters {
    frames_written: AtomicU64,
    frames_read: AtomicU64,
    timeouts: AtomicU64,
}

struct Segment {
    map: MmapRaw,
    _file: File,
    pixel_capacity: usize,
}

impl Segment {
    fn map(file: File, len: usize) -> Result<Self> {
        let map = MmapOptions::new()
            .len(len)
            .map_raw(&file)
            .map_err(|e| TransportError::io("Failed to map shared memory", e))?;
        Ok(Self {
            map,
            _file: file,
            pixel_capacity: len - HEADER_SIZE,
        })
    }

    fn header(&self) -> &SharedFrameHeader {
        // SAFETY: the mapping is page aligned, at least HEADER_SIZE long, lives as
        // long as `self`, and every header field is an atomic.
        unsafe { &*(self.map.as_ptr() as *const SharedFrameHeader) }
    }

    fn pixels(&self) -> *mut u8 {
        // SAFETY: HEADER_SIZE is within the mapping.
        unsafe { self.map.as_mut_ptr().add(HEADER_SIZE) }
    }

    /// Copy the pixel region into `out` inside a sequence section, returning the
    /// sequence the copy belongs to. `Ok(None)` means a write overlapped the copy
    /// and it must be retried.
    fn copy_frame(&self, out: &mut Vec<u8>) -> Result<Option<(u64, HeaderSnapshot)>> {
        let header = self.header();
        let Some(seq) = header.read_begin() else {
            return Ok(None);
        };

        let snapshot = header.snapshot();
        let len = frame_len(snapshot.width, snapshot.height, snapshot.channels)?;
        if len > self.pixel_capacity {
            return Err(TransportError::SegmentTooSmall {
                required: len + HEADER_SIZE,
                actual: self.map.len(),
            });
        }

        out.resize(len, 0);
        // SAFETY: source holds `len` bytes (checked above), `out` was resized to `len`.
        unsafe { ptr::copy_nonoverlapping(self.pixels(), out.as_mut_ptr(), len) };

        Ok(header.read_validate(seq).then_some((seq, snapshot)))
    }
}

pub struct ShmFrameChannel {
    name: String,
    role: ChannelRole,
    policy: PollPolicy,
    segment: Mutex<Option<Segment>>,
    /// Sequence of the last frame this handle returned; odd sentinel before the first
    delivered: AtomicU64,
    counters: CachePadded<Counters>,
}

impl ShmFrameChannel {
    /// Create (or truncate) the named segment and initialise its header.
    pub fn create(name: &str, width: u32, height: u32, channels: u32) -> Result<Self> {
        let name = normalize_name(name)?;
        if !matches!(channels, 1 | 3 | 4) {
            return Err(TransportError::InvalidGeometry {
                width,
                height,
                channels,
            });
        }
        let size = segment_len(width, height, channels)?;

        let os_name = os_name(&name);
        let fd = shm_open(
            os_name.as_str(),
            OFlag::O_CREAT | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| TransportError::os(format!("Failed to create shared memory {name}"), e))?;

        let mapped = ftruncate(&fd, size as nix::libc::off_t)
            .map_err(|e| TransportError::os(format!("Failed to size shared memory {name}"), e))
            .and_then(|_| Segment::map(File::from(fd), size));
        let segment = match mapped {
            Ok(segment) => segment,
            Err(e) => {
                let _ = shm_unlink(os_name.as_str());
                return Err(e);
            }
        };
        segment.header().initialize(width, height, channels);

        info!(
            "Created shared memory {} ({} bytes, {}x{}x{})",
            name, size, width, height, channels
        );

        Ok(Self::with_segment(name, ChannelRole::Creator, segment))
    }

    /// Map an existing segment read-write; geometry comes from its header.
    pub fn open(name: &str) -> Result<Self> {
        let name = normalize_name(name)?;
        let fd = shm_open(os_name(&name).as_str(), OFlag::O_RDWR, Mode::empty())
            .map_err(|e| TransportError::os(format!("Failed to open shared memory {name}"), e))?;
        let file = File::from(fd);

        let len = file
            .metadata()
            .map_err(|e| TransportError::io(format!("Failed to stat shared memory {name}"), e))?
            .len() as usize;
        if len < HEADER_SIZE {
            debug!("Shared memory {} is {} bytes, creator still sizing it", name, len);
            return Err(TransportError::NotReady { name });
        }

        let segment = Segment::map(file, len)?;
        let (width, height, channels) = segment.header().dimensions();
        if width == 0 || height == 0 || channels == 0 {
            debug!("Shared memory {} has no geometry yet", name);
            return Err(TransportError::NotReady { name });
        }
        let required = segment_len(width, height, channels)?;
        if required > len {
            return Err(TransportError::SegmentTooSmall {
                required,
                actual: len,
            });
        }

        info!(
            "Opened shared memory {} ({} bytes, {}x{}x{})",
            name, len, width, height, channels
        );

        Ok(Self::with_segment(name, ChannelRole::Opener, segment))
    }

    fn with_segment(name: String, role: ChannelRole, segment: Segment) -> Self {
        Self {
            name,
            role,
            policy: PollPolicy::default(),
            segment: Mutex::new(Some(segment)),
            delivered: AtomicU64::new(NOTHING_DELIVERED),
            counters: CachePadded::new(Counters::default()),
        }
    }

    pub fn with_poll_policy(mut self, policy: PollPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    pub fn poll_policy(&self) -> PollPolicy {
        self.policy
    }

    pub fn is_open(&self) -> bool {
        self.lock().is_some()
    }

    /// Copy of the header; all zero when the channel is closed.
    pub fn frame_metadata(&self) -> HeaderSnapshot {
        self.lock()
            .as_ref()
            .map(|segment| segment.header().snapshot())
            .unwrap_or_default()
    }

    /// Publish `frame`, converting 3 <-> 4 channels if the segment declares otherwise.
    /// The new-frame flag is raised only after every pixel is in place.
    pub fn write_frame(&self, frame: &Frame, info: FrameInfo) -> Result<()> {
        let guard = self.lock();
        let segment = guard.as_ref().ok_or(TransportError::NotOpen)?;
        let header = segment.header();

        let (width, height, channels) = header.dimensions();
        if (frame.width(), frame.height()) != (width, height) {
            return Err(TransportError::DimensionMismatch {
                expected: (width, height),
                actual: (frame.width(), frame.height()),
            });
        }
        if !convert::is_supported(frame.channels(), channels) {
            return Err(TransportError::UnsupportedConversion {
                from: frame.channels(),
                to: channels,
            });
        }
        let len = frame_len(width, height, channels)?;
        if len > segment.pixel_capacity {
            return Err(TransportError::SegmentTooSmall {
                required: len + HEADER_SIZE,
                actual: segment.map.len(),
            });
        }

        let started = Instant::now();
        // SAFETY: the pixel region holds at least `len` bytes; writers in this
        // process are serialised by the lock, readers detect overlap via write_seq.
        let dst = unsafe { std::slice::from_raw_parts_mut(segment.pixels(), len) };

        let seq = header.begin_write();
        let copied = convert::pack_into(frame, dst, channels);
        header.record(&info);
        header.end_write(seq);
        copied?;
        header.publish_new_frame();

        self.counters.frames_written.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("vst_frames_written").increment(1);
        metrics::histogram!("vst_write_time_us").record(started.elapsed().as_micros() as f64);
        debug!("Wrote frame {} to {}", info.frame_index, self.name);
        Ok(())
    }

    /// Copy the current frame into `out`.
    ///
    /// With `wait` the call polls for the new-frame flag, releasing the lock
    /// between polls, and returns [`ReadOutcome::Timeout`] once the poll budget is
    /// spent or [`ReadOutcome::EndOfStream`] once the producer has finished and
    /// no unread frame remains. A waiting read never returns the same frame twice.
    /// Without `wait` whatever is in the segment is copied, see [`Self::read_current`].
    pub fn read_frame(&self, out: &mut Vec<u8>, wait: bool) -> Result<ReadOutcome> {
        if !wait {
            return self.read_current(out).map(ReadOutcome::Frame);
        }

        let mut guard = self.lock();
        let mut attempts = 0u32;
        let mut contended = 0u32;

        loop {
            let segment = guard.as_ref().ok_or(TransportError::NotOpen)?;
            let header = segment.header();

            if !header.is_new_frame() {
                if header.is_end_of_video() {
                    info!("End of video on {}", self.name);
                    return Ok(ReadOutcome::EndOfStream);
                }
                if attempts >= self.policy.max_attempts {
                    self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("vst_read_timeouts").increment(1);
                    debug!(
                        "No new frame on {} after {} polls",
                        self.name, attempts
                    );
                    return Ok(ReadOutcome::Timeout);
                }
                attempts += 1;
                drop(guard);
                std::thread::sleep(self.policy.interval);
                guard = self.lock();
                continue;
            }

            let started = Instant::now();
            match segment.copy_frame(out)? {
                Some((seq, snapshot)) => {
                    header.consume_frame(seq);
                    // Flag raised for a frame an overlapped copy already returned
                    if seq == self.delivered.load(Ordering::Relaxed) {
                        debug!(
                            "Frame {} on {} already delivered",
                            snapshot.frame_index, self.name
                        );
                        continue;
                    }
                    let snapshot = self.record_read(seq, snapshot, started);
                    return Ok(ReadOutcome::Frame(snapshot));
                }
                None => {
                    contended += 1;
                    if contended > STALL_LIMIT {
                        warn!("Writer on {} never finished a frame", self.name);
                        return Err(TransportError::WriterStalled);
                    }
                    drop(guard);
                    std::thread::sleep(CONTENDED_BACKOFF);
                    guard = self.lock();
                }
            }
        }
    }

    /// Copy whatever frame the segment holds without waiting, clearing the
    /// new-frame flag for it.
    pub fn read_current(&self, out: &mut Vec<u8>) -> Result<HeaderSnapshot> {
        let mut guard = self.lock();
        let mut contended = 0u32;

        loop {
            let segment = guard.as_ref().ok_or(TransportError::NotOpen)?;
            let started = Instant::now();
            if let Some((seq, snapshot)) = segment.copy_frame(out)? {
                segment.header().consume_frame(seq);
                return Ok(self.record_read(seq, snapshot, started));
            }
            contended += 1;
            if contended > STALL_LIMIT {
                warn!("Writer on {} never finished a frame", self.name);
                return Err(TransportError::WriterStalled);
            }
            drop(guard);
            std::thread::sleep(CONTENDED_BACKOFF);
            guard = self.lock();
        }
    }

    fn record_read(&self, seq: u64, snapshot: HeaderSnapshot, started: Instant) -> HeaderSnapshot {
        self.delivered.store(seq, Ordering::Relaxed);
        self.counters.frames_read.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("vst_frames_read").increment(1);
        metrics::histogram!("vst_read_time_us").record(started.elapsed().as_micros() as f64);
        snapshot
    }

    /// Tell readers no more frames follow. Idempotent.
    pub fn signal_end_of_video(&self) -> Result<()> {
        let guard = self.lock();
        let segment = guard.as_ref().ok_or(TransportError::NotOpen)?;
        if !segment.header().is_end_of_video() {
            info!("Signalling end of video on {}", self.name);
        }
        segment.header().mark_end_of_video();
        Ok(())
    }

    /// Unmap and close. Safe to call repeatedly; leaves the name in place.
    pub fn close(&self) {
        if self.lock().take().is_some() {
            info!("Closed shared memory {}", self.name);
        }
    }

    /// Remove the name from the shared-memory namespace. Already gone is not an error.
    pub fn unlink(&self) -> Result<()> {
        unlink_segment(&self.name)
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            frames_written: self.counters.frames_written.load(Ordering::Relaxed),
            frames_read: self.counters.frames_read.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Segment>> {
        self.segment.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ShmFrameChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Unlink a segment by name without opening it.
pub fn unlink_segment(name: &str) -> Result<()> {
    let name = normalize_name(name)?;
    match shm_unlink(os_name(&name).as_str()) {
        Ok(()) => {
            info!("Unlinked shared memory {}", name);
            Ok(())
        }
        Err(Errno::ENOENT) => {
            debug!("Shared memory {} already unlinked", name);
            Ok(())
        }
        Err(e) => Err(TransportError::os(
            format!("Failed to unlink shared memory {name}"),
            e,
        )),
    }
}

/// Strip a leading `/`; the rest must be a single path component.
fn normalize_name(name: &str) -> Result<String> {
    let bare = name.strip_prefix('/').unwrap_or(name);
    if bare.is_empty() || bare.contains('/') {
        return Err(TransportError::InvalidName {
            name: name.to_string(),
            reason: "shared memory names are a single non-empty component",
        });
    }
    Ok(bare.to_string())
}

fn os_name(name: &str) -> String {
    format!("/{name}")
}
