use crate::driver::FrameSink;
use crate::types::{Frame, FrameType, FrameTypes};
use crate::{Kinect2Error, Result};
use crossbeam_channel::{Receiver, Sender};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Frames of one synchronized acquisition, keyed by type.
pub type FrameMap = BTreeMap<FrameType, Frame>;

/// Collects frames pushed by the driver into synchronized sets.
///
/// The driver calls [`FrameSink::on_new_frame`] from its capture thread(s).
/// Once every subscribed type has arrived, the set is published into a
/// one-slot channel where the consumer picks it up with
/// [`wait_for_new_frame`](Self::wait_for_new_frame). If the consumer is
/// slower than the sensor, an unconsumed set is replaced by the newer one.
pub struct FrameListener {
    types: FrameTypes,
    pending: Mutex<FrameMap>,
    ready_tx: Sender<FrameMap>,
    ready_rx: Receiver<FrameMap>,
    in_flight: AtomicUsize,
    dropped: AtomicU64,
}

impl FrameListener {
    pub fn new(types: FrameTypes) -> Self {
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        Self {
            types,
            pending: Mutex::new(FrameMap::new()),
            ready_tx,
            ready_rx,
            in_flight: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn frame_types(&self) -> FrameTypes {
        self.types
    }

    /// True when a complete set is waiting to be picked up.
    pub fn has_new_frame(&self) -> bool {
        !self.ready_rx.is_empty()
    }

    /// Take the next complete set.
    ///
    /// `None` blocks until one is published; `Some(t)` fails with
    /// [`Kinect2Error::AcquireTimeout`] after `t`.
    pub fn wait_for_new_frame(&self, timeout: Option<Duration>) -> Result<FrameMap> {
        let set = match timeout {
            Some(t) => self.ready_rx.recv_timeout(t).map_err(|e| match e {
                crossbeam_channel::RecvTimeoutError::Timeout => Kinect2Error::AcquireTimeout,
                crossbeam_channel::RecvTimeoutError::Disconnected => {
                    Kinect2Error::Driver("frame channel disconnected".into())
                }
            })?,
            None => self
                .ready_rx
                .recv()
                .map_err(|_| Kinect2Error::Driver("frame channel disconnected".into()))?,
        };
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(set)
    }

    /// Give an acquired set back to the driver.
    pub fn release(&self, set: FrameMap) {
        let released = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !released {
            log::warn!("Released a frame set that was never acquired; ignoring");
        }
        drop(set);
    }

    /// Sets handed out by `wait_for_new_frame` and not yet released.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Complete sets replaced before the consumer picked them up.
    pub fn dropped_sets(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn is_complete(&self, pending: &FrameMap) -> bool {
        [FrameType::Color, FrameType::Ir, FrameType::Depth]
            .into_iter()
            .filter(|t| t.listener_flag().is_some_and(|f| self.types.contains(f)))
            .all(|t| pending.contains_key(&t))
    }
}

impl FrameSink for FrameListener {
    fn on_new_frame(&self, frame_type: FrameType, frame: Frame) -> bool {
        match frame_type.listener_flag() {
            Some(flag) if self.types.contains(flag) => {}
            _ => return false,
        }

        // Publishing happens under the lock so color and IR/depth threads
        // cannot interleave around the one-slot channel.
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.insert(frame_type, frame);
        if !self.is_complete(&pending) {
            return true;
        }

        let set = std::mem::take(&mut *pending);
        if let Err(crossbeam_channel::TrySendError::Full(set)) = self.ready_tx.try_send(set) {
            if self.ready_rx.try_recv().is_ok() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log::trace!("Consumer behind, replacing unconsumed frame set");
            }
            let _ = self.ready_tx.try_send(set);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PixelFormat;
    use std::sync::Arc;
    use std::time::Instant;

    fn frame(seq: u32) -> Frame {
        let mut f = Frame::new(4, 2, 4, PixelFormat::Float);
        f.sequence = seq;
        f
    }

    fn push_set(listener: &FrameListener, seq: u32) {
        listener.on_new_frame(FrameType::Color, frame(seq));
        listener.on_new_frame(FrameType::Ir, frame(seq));
        listener.on_new_frame(FrameType::Depth, frame(seq));
    }

    #[test]
    fn test_set_published_only_when_complete() {
        let listener = FrameListener::new(FrameTypes::default());
        listener.on_new_frame(FrameType::Color, frame(0));
        listener.on_new_frame(FrameType::Ir, frame(0));
        assert!(!listener.has_new_frame());

        listener.on_new_frame(FrameType::Depth, frame(0));
        assert!(listener.has_new_frame());

        let set = listener.wait_for_new_frame(Some(Duration::from_millis(10))).unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(listener.in_flight(), 1);
        listener.release(set);
        assert_eq!(listener.in_flight(), 0);
    }

    #[test]
    fn test_unsubscribed_types_are_ignored() {
        let listener = FrameListener::new(FrameTypes::DEPTH);
        assert!(!listener.on_new_frame(FrameType::Color, frame(0)));
        assert!(!listener.on_new_frame(FrameType::Registered, frame(0)));
        assert!(listener.on_new_frame(FrameType::Depth, frame(0)));

        let set = listener.wait_for_new_frame(Some(Duration::from_millis(10))).unwrap();
        assert_eq!(set.keys().copied().collect::<Vec<_>>(), vec![FrameType::Depth]);
    }

    #[test]
    fn test_newest_set_wins() {
        let listener = FrameListener::new(FrameTypes::default());
        push_set(&listener, 1);
        push_set(&listener, 2);
        assert_eq!(listener.dropped_sets(), 1);

        let set = listener.wait_for_new_frame(None).unwrap();
        assert_eq!(set[&FrameType::Depth].sequence, 2);
        assert!(!listener.has_new_frame());
    }

    #[test]
    fn test_wait_times_out_within_bound() {
        let listener = FrameListener::new(FrameTypes::default());
        let bound = Duration::from_millis(50);
        let start = Instant::now();
        let err = listener.wait_for_new_frame(Some(bound)).unwrap_err();
        let elapsed = start.elapsed();

        assert!(matches!(err, Kinect2Error::AcquireTimeout));
        assert!(elapsed >= bound);
        assert!(elapsed < bound + Duration::from_millis(500));
        assert_eq!(listener.in_flight(), 0);
    }

    #[test]
    fn test_blocking_wait_receives_from_producer_thread() {
        let listener = Arc::new(FrameListener::new(FrameTypes::default()));
        let producer = {
            let listener = listener.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                push_set(&listener, 7);
            })
        };

        let set = listener.wait_for_new_frame(None).unwrap();
        producer.join().unwrap();
        assert_eq!(set[&FrameType::Color].sequence, 7);
    }

    #[test]
    fn test_release_without_acquire_keeps_accounting() {
        let listener = FrameListener::new(FrameTypes::default());
        listener.release(FrameMap::new());
        assert_eq!(listener.in_flight(), 0);
    }
}
