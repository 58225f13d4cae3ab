//! RTX Sender - Retains outgoing packets and answers retransmission requests
//! from a dedicated dispatch task.

use super::association::{ClockRateMap, PayloadTypeMap, RtxAssociation, SsrcMap};
use super::packet_store::StoreLimits;
use super::stats::RtxStatistics;
use super::stream::{DEFAULT_MAX_SIZE_PACKETS, RequestOutcome, SenderState};
use super::RequestDisposition;
use crate::{Packet, TaggedPacket, TaggedRequest};
use crossbeam_channel::{Receiver, Sender};
use log::{debug, trace, warn};
use shared::error::{Error, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const DISPATCH_THREAD_NAME: &str = "rtx-dispatch";

/// Downstream of an [`RtxSend`].
///
/// Normal packets are pushed from the thread calling
/// [`RtxSend::on_master_packet`], retransmissions from the dispatch task, so
/// implementations must accept calls from both.
pub trait PacketSink: Send + Sync + 'static {
    fn push(&self, msg: TaggedPacket);
}

impl<F> PacketSink for F
where
    F: Fn(TaggedPacket) + Send + Sync + 'static,
{
    fn push(&self, msg: TaggedPacket) {
        self(msg)
    }
}

/// Builder for [`RtxSend`].
///
/// # Example
///
/// ```ignore
/// use rtx_interceptor::{RtxSendBuilder, TaggedPacket};
///
/// let (tx, rx) = crossbeam_channel::unbounded();
/// let sender = RtxSendBuilder::new()
///     .with_ssrc_map([(1234567, 7654321)].into())
///     .with_payload_type_map([(96, 106)].into())
///     .build(move |msg: TaggedPacket| {
///         let _ = tx.send(msg);
///     });
/// sender.start()?;
/// ```
pub struct RtxSendBuilder {
    ssrc_map: SsrcMap,
    payload_type_map: PayloadTypeMap,
    clock_rate_map: ClockRateMap,
    max_size_packets: usize,
    max_size_time: Duration,
    rtx_seqnum_offset: Option<u16>,
}

impl Default for RtxSendBuilder {
    fn default() -> Self {
        Self {
            ssrc_map: SsrcMap::new(),
            payload_type_map: PayloadTypeMap::new(),
            clock_rate_map: ClockRateMap::new(),
            max_size_packets: DEFAULT_MAX_SIZE_PACKETS,
            max_size_time: Duration::ZERO,
            rtx_seqnum_offset: None,
        }
    }
}

impl RtxSendBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Map of master SSRC to RTX SSRC.
    pub fn with_ssrc_map(mut self, ssrc_map: SsrcMap) -> Self {
        self.ssrc_map = ssrc_map;
        self
    }

    /// Map of master payload type to RTX payload type. An empty map disables
    /// retransmission.
    pub fn with_payload_type_map(mut self, payload_type_map: PayloadTypeMap) -> Self {
        self.payload_type_map = payload_type_map;
        self
    }

    /// Map of master payload type to clock rate, used for time based eviction.
    pub fn with_clock_rate_map(mut self, clock_rate_map: ClockRateMap) -> Self {
        self.clock_rate_map = clock_rate_map;
        self
    }

    /// Maximum number of packets retained per SSRC, 0 for unlimited.
    pub fn with_max_size_packets(mut self, max_size_packets: usize) -> Self {
        self.max_size_packets = max_size_packets;
        self
    }

    /// Maximum age of retained packets, zero for unlimited.
    pub fn with_max_size_time(mut self, max_size_time: Duration) -> Self {
        self.max_size_time = max_size_time;
        self
    }

    /// First sequence number of every RTX stream. Random when unset.
    pub fn with_rtx_seqnum_offset(mut self, offset: u16) -> Self {
        self.rtx_seqnum_offset = Some(offset);
        self
    }

    /// Build the sender pushing into `sink`. The dispatch task is not
    /// running until [`RtxSend::start`] is called.
    pub fn build<S: PacketSink>(self, sink: S) -> RtxSend {
        let mut association = RtxAssociation::new(self.ssrc_map, self.payload_type_map);
        association.set_clock_rate_map(self.clock_rate_map);

        let stats = RtxStatistics::new();
        let state = SenderState::new(
            association,
            StoreLimits::new(self.max_size_packets, self.max_size_time),
            self.rtx_seqnum_offset,
            Arc::clone(&stats),
        );

        RtxSend {
            state: Arc::new(Mutex::new(state)),
            stats,
            sink: Arc::new(sink),
            task: Mutex::new(None),
            active: AtomicBool::new(false),
            epoch: Arc::new(AtomicU64::new(0)),
        }
    }
}

enum Dispatch {
    Retransmit { epoch: u64, msg: TaggedPacket },
    Stop,
}

struct DispatchTask {
    tx: Sender<Dispatch>,
    handle: JoinHandle<()>,
    running: Arc<AtomicBool>,
}

impl DispatchTask {
    fn spawn(
        sink: Arc<dyn PacketSink>,
        stats: Arc<RtxStatistics>,
        epoch: Arc<AtomicU64>,
    ) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let running = Arc::new(AtomicBool::new(true));

        let task_running = Arc::clone(&running);
        let handle = thread::Builder::new()
            .name(DISPATCH_THREAD_NAME.to_string())
            .spawn(move || dispatch_loop(rx, sink, stats, task_running, epoch))
            .map_err(|err| Error::ErrDispatchTaskSpawn(err.to_string()))?;

        debug!("rtx dispatch task started");
        Ok(Self {
            tx,
            handle,
            running,
        })
    }

    /// Wake the task, discard whatever it still has queued and wait for it
    /// to exit.
    fn stop(self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        // the task may already be gone, join tells
        let _ = self.tx.send(Dispatch::Stop);
        self.handle
            .join()
            .map_err(|_| Error::ErrDispatchTaskPanicked)?;
        debug!("rtx dispatch task stopped");
        Ok(())
    }
}

fn dispatch_loop(
    rx: Receiver<Dispatch>,
    sink: Arc<dyn PacketSink>,
    stats: Arc<RtxStatistics>,
    running: Arc<AtomicBool>,
    epoch: Arc<AtomicU64>,
) {
    while let Ok(item) = rx.recv() {
        match item {
            Dispatch::Stop => break,
            Dispatch::Retransmit { epoch: queued_at, msg } => {
                if !running.load(Ordering::Acquire) || queued_at != epoch.load(Ordering::Acquire)
                {
                    trace!("discarding retransmission queued before flush or stop");
                    continue;
                }
                stats.inc_rtx_packets();
                sink.push(msg);
            }
        }
    }
}

/// Sender side of RTP retransmission.
///
/// Every outgoing master packet goes through [`on_master_packet`](Self::on_master_packet):
/// it is pushed to the sink unchanged, and a copy is retained when its
/// SSRC and payload type have an RTX association. Retransmission requests go
/// through [`on_retransmission_request`](Self::on_retransmission_request);
/// the answering RTX packet is pushed to the sink from the dispatch task, so
/// a burst of requests never blocks the streaming thread.
///
/// All methods take `&self`; an `RtxSend` is meant to be shared between the
/// streaming thread and the thread delivering requests.
pub struct RtxSend {
    state: Arc<Mutex<SenderState>>,
    stats: Arc<RtxStatistics>,
    sink: Arc<dyn PacketSink>,

    task: Mutex<Option<DispatchTask>>,
    /// Set between `start` and `stop`
    active: AtomicBool,
    /// Bumped on flush, retransmissions queued before are discarded
    epoch: Arc<AtomicU64>,
}

impl RtxSend {
    /// Enter the active state, starting the dispatch task if retransmission
    /// is enabled.
    pub fn start(&self) -> Result<()> {
        self.active.store(true, Ordering::Release);
        self.reconcile_task()
    }

    /// Leave the active state. Returns once the dispatch task has exited;
    /// retained packets and queued retransmissions are dropped.
    pub fn stop(&self) -> Result<()> {
        self.active.store(false, Ordering::Release);
        let result = self.reconcile_task();
        self.flush()?;
        result
    }

    /// Drop retained packets and queued retransmissions. Statistics are kept.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.lock()?;
        self.epoch.fetch_add(1, Ordering::AcqRel);
        state.flush();
        Ok(())
    }

    /// Push an outgoing master packet to the sink, retaining a copy if it
    /// belongs to an associated stream.
    pub fn on_master_packet(&self, msg: TaggedPacket) -> Result<()> {
        {
            let mut state = self.state.lock()?;
            if state.is_enabled() {
                if let Packet::Rtp(ref rtp_packet) = msg.message {
                    state.retain(msg.now, rtp_packet);
                }
            }
        }

        self.sink.push(msg);
        Ok(())
    }

    /// Handle a retransmission request.
    ///
    /// Requests for streams without an RTX association come back as
    /// [`RequestDisposition::Forward`] and must be sent further upstream.
    /// Everything else is consumed: answered from the dispatch task, or
    /// dropped when the packet is no longer retained.
    pub fn on_retransmission_request(&self, req: TaggedRequest) -> Result<RequestDisposition> {
        match self.match_request(&req)? {
            (RequestOutcome::Unknown, _) => Ok(RequestDisposition::Forward(req)),
            (RequestOutcome::Missing, _) => Ok(RequestDisposition::Consumed),
            (RequestOutcome::Retransmit(rtx), epoch) => {
                self.dispatch(req, rtx, epoch)?;
                Ok(RequestDisposition::Consumed)
            }
        }
    }

    /// Match a request against the retained packets, together with the flush
    /// epoch the match was made in. Both are read under the state lock.
    fn match_request(&self, req: &TaggedRequest) -> Result<(RequestOutcome, u64)> {
        let mut state = self.state.lock()?;
        let epoch = self.epoch.load(Ordering::Acquire);
        let outcome = if state.is_enabled() {
            state.handle_request(&req.message)
        } else {
            RequestOutcome::Unknown
        };
        Ok((outcome, epoch))
    }

    fn dispatch(&self, req: TaggedRequest, rtx: rtp::Packet, epoch: u64) -> Result<()> {
        let task = self.task.lock()?;
        match task.as_ref() {
            Some(task) => {
                let item = Dispatch::Retransmit {
                    epoch,
                    msg: req.map(|_| Packet::Rtx(rtx)),
                };
                if task.tx.send(item).is_err() {
                    warn!("rtx dispatch task gone, dropping retransmission");
                }
            }
            None => debug!(
                "dispatch task not running, dropping retransmission of {} for ssrc {}",
                req.message.seqnum, req.message.ssrc
            ),
        }
        Ok(())
    }

    /// Retransmission counters of this sender.
    pub fn stats(&self) -> Arc<RtxStatistics> {
        Arc::clone(&self.stats)
    }

    pub fn is_task_running(&self) -> bool {
        self.task.lock().is_ok_and(|task| task.is_some())
    }

    pub fn is_enabled(&self) -> Result<bool> {
        Ok(self.state.lock()?.is_enabled())
    }

    /// Number of packets currently retained for `ssrc`.
    pub fn retained(&self, ssrc: u32) -> Result<usize> {
        Ok(self.state.lock()?.retained(ssrc))
    }

    pub fn set_ssrc_map(&self, ssrc_map: SsrcMap) -> Result<()> {
        self.state.lock()?.set_ssrc_map(ssrc_map);
        Ok(())
    }

    /// Replace the payload type map. Clearing it disables retransmission and
    /// stops the dispatch task; making it non-empty while active starts it.
    pub fn set_payload_type_map(&self, payload_type_map: PayloadTypeMap) -> Result<()> {
        self.state.lock()?.set_payload_type_map(payload_type_map);
        self.reconcile_task()
    }

    pub fn set_clock_rate_map(&self, clock_rate_map: ClockRateMap) -> Result<()> {
        self.state.lock()?.set_clock_rate_map(clock_rate_map);
        Ok(())
    }

    pub fn set_max_size_packets(&self, max_size_packets: usize) -> Result<()> {
        let mut state = self.state.lock()?;
        let limits = state.limits();
        state.set_limits(StoreLimits::new(max_size_packets, limits.max_time));
        Ok(())
    }

    pub fn set_max_size_time(&self, max_size_time: Duration) -> Result<()> {
        let mut state = self.state.lock()?;
        let limits = state.limits();
        state.set_limits(StoreLimits::new(limits.max_packets, max_size_time));
        Ok(())
    }

    /// Start or stop the dispatch task to match the active flag and the
    /// association state.
    fn reconcile_task(&self) -> Result<()> {
        let wanted = self.active.load(Ordering::Acquire) && self.state.lock()?.is_enabled();

        let stopped = {
            let mut task = self.task.lock()?;
            match (wanted, task.is_some()) {
                (true, false) => {
                    *task = Some(DispatchTask::spawn(
                        Arc::clone(&self.sink),
                        Arc::clone(&self.stats),
                        Arc::clone(&self.epoch),
                    )?);
                    None
                }
                (false, true) => task.take(),
                _ => None,
            }
        };

        match stopped {
            Some(task) => task.stop(),
            None => Ok(()),
        }
    }
}

impl Drop for RtxSend {
    fn drop(&mut self) {
        let task = match self.task.get_mut() {
            Ok(task) => task.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            if let Err(err) = task.stop() {
                warn!("failed to stop rtx dispatch task: {err}");
            }
        }
    }
}
