// Copyright the tern-quic project authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Byte-window flow control for one stream or for the whole connection.
//!
//! The receive side advertises `receive_window_offset`; a WINDOW_UPDATE is
//! due when less than half the window remains. Auto-tuning doubles the
//! window when two successive updates land within two RTTs, a sign the
//! window itself is the bottleneck. The send side tracks the peer's
//! advertised offset and reports BLOCKED at most once per offset.
//!
//! The controller never writes frames; every operation returns what (if
//! anything) the session should send.

use crate::{
    recovery::rtt::RttStats,
    time::Timestamp,
    transport::error::{Code, Error},
};

/// The session-level window is kept at least this multiple (3/2) of the
/// largest stream window
const SESSION_FLOW_CONTROL_MULTIPLIER_NUM: u64 = 3;
const SESSION_FLOW_CONTROL_MULTIPLIER_DEN: u64 = 2;

/// Frames the session should transmit after a receive-side operation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WindowUpdates {
    /// Send a WINDOW_UPDATE advertising this offset
    pub window_update_offset: Option<u64>,
    /// Raise the connection-level controller's window limit to at least
    /// this size (streams only)
    pub session_window_at_least: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct FlowController {
    /// `None` for the connection-level controller
    stream_id: Option<u64>,

    // Send side
    bytes_sent: u64,
    send_window_offset: u64,
    /// Offset the last BLOCKED frame reported, to send only one per offset
    last_blocked_send_window_offset: u64,

    // Receive side
    bytes_consumed: u64,
    highest_received_byte_offset: u64,
    receive_window_offset: u64,
    receive_window_size: u64,
    receive_window_size_limit: u64,
    auto_tune_receive_window: bool,
    prev_window_update_time: Option<Timestamp>,
}

impl FlowController {
    pub fn new(
        stream_id: Option<u64>,
        send_window_offset: u64,
        receive_window_offset: u64,
        receive_window_size_limit: u64,
        should_auto_tune_receive_window: bool,
    ) -> Self {
        debug_assert!(receive_window_offset <= receive_window_size_limit);
        Self {
            stream_id,
            bytes_sent: 0,
            send_window_offset,
            last_blocked_send_window_offset: 0,
            bytes_consumed: 0,
            highest_received_byte_offset: 0,
            receive_window_offset,
            receive_window_size: receive_window_offset,
            receive_window_size_limit,
            auto_tune_receive_window: should_auto_tune_receive_window,
            prev_window_update_time: None,
        }
    }

    #[inline]
    pub fn stream_id(&self) -> Option<u64> {
        self.stream_id
    }

    #[inline]
    pub fn is_connection_flow_controller(&self) -> bool {
        self.stream_id.is_none()
    }

    #[inline]
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    #[inline]
    pub fn bytes_consumed(&self) -> u64 {
        self.bytes_consumed
    }

    #[inline]
    pub fn send_window_offset(&self) -> u64 {
        self.send_window_offset
    }

    #[inline]
    pub fn receive_window_offset(&self) -> u64 {
        self.receive_window_offset
    }

    #[inline]
    pub fn receive_window_size(&self) -> u64 {
        self.receive_window_size
    }

    #[inline]
    pub fn highest_received_byte_offset(&self) -> u64 {
        self.highest_received_byte_offset
    }

    /// Bytes the peer still allows us to send
    pub fn send_window_size(&self) -> u64 {
        self.send_window_offset.saturating_sub(self.bytes_sent)
    }

    #[inline]
    pub fn is_blocked(&self) -> bool {
        self.send_window_size() == 0
    }

    /// Accounts for consumed bytes and possibly produces a WINDOW_UPDATE
    pub fn add_bytes_consumed(
        &mut self,
        bytes_consumed: u64,
        rtt_stats: &RttStats,
        now: Timestamp,
    ) -> WindowUpdates {
        self.bytes_consumed += bytes_consumed;
        self.maybe_send_window_update(rtt_stats, now)
    }

    /// Records the highest received byte. Returns true if the offset
    /// advanced. The caller must check [`Self::flow_control_violation`]
    /// afterwards.
    pub fn update_highest_received_offset(&mut self, new_offset: u64) -> bool {
        if new_offset <= self.highest_received_byte_offset {
            return false;
        }
        self.highest_received_byte_offset = new_offset;
        true
    }

    /// True when the peer sent beyond the advertised window; the session
    /// must close with `FlowControlReceivedTooMuchData`
    pub fn flow_control_violation(&self) -> bool {
        self.highest_received_byte_offset > self.receive_window_offset
    }

    /// Accounts for sent bytes. Sending beyond the peer's window is a local
    /// bug surfaced as a connection close.
    pub fn add_bytes_sent(&mut self, bytes_sent: u64) -> Result<(), Error> {
        if self.bytes_sent + bytes_sent > self.send_window_offset {
            self.bytes_sent = self.send_window_offset;
            return Err(Error::new(Code::FlowControlSentTooMuchData)
                .with_reason("bytes over send window offset"));
        }
        self.bytes_sent += bytes_sent;
        Ok(())
    }

    /// True exactly once per exhausted send window: the caller should send
    /// a BLOCKED frame
    pub fn should_send_blocked(&mut self) -> bool {
        if self.send_window_size() != 0
            || self.last_blocked_send_window_offset >= self.send_window_offset
        {
            return false;
        }
        // The entire send window is consumed. Remember the offset so only
        // one BLOCKED frame goes out per offset.
        self.last_blocked_send_window_offset = self.send_window_offset;
        true
    }

    /// Processes a WINDOW_UPDATE from the peer. Returns true iff this
    /// update changed the state from blocked to unblocked.
    pub fn update_send_window_offset(&mut self, new_send_window_offset: u64) -> bool {
        // Only update if the window moved forward.
        if new_send_window_offset <= self.send_window_offset {
            return false;
        }
        let was_previously_blocked = self.is_blocked();
        self.send_window_offset = new_send_window_offset;
        was_previously_blocked
    }

    /// Raises the window size limit (never lowers it) and advertises the
    /// grown window. Used by the session controller when a stream window
    /// outgrows it.
    pub fn ensure_window_at_least(&mut self, window_size: u64) -> WindowUpdates {
        if self.receive_window_size_limit >= window_size {
            return WindowUpdates::default();
        }
        self.receive_window_size_limit = window_size;
        let available_window = self.receive_window_offset - self.bytes_consumed;
        self.increase_window_size();
        self.update_receive_window_offset(available_window)
    }

    /// Replaces the receive window before any data has moved, e.g. when
    /// the handshake negotiates a different initial window
    pub fn update_receive_window_size(&mut self, size: u64) -> Result<(), Error> {
        debug_assert!(size <= self.receive_window_size_limit);
        if self.receive_window_size != self.receive_window_offset {
            return Err(Error::new(Code::InternalError)
                .with_reason("window resized after flow control has been used"));
        }
        self.receive_window_size = size;
        self.receive_window_offset = size;
        Ok(())
    }

    fn window_update_threshold(&self) -> u64 {
        self.receive_window_size / 2
    }

    fn maybe_send_window_update(&mut self, rtt_stats: &RttStats, now: Timestamp) -> WindowUpdates {
        debug_assert!(self.bytes_consumed <= self.receive_window_offset);
        // Send a WINDOW_UPDATE when less than half the window remains.
        let available_window = self.receive_window_offset - self.bytes_consumed;
        if available_window >= self.window_update_threshold() {
            return WindowUpdates::default();
        }
        let session_window_at_least = self.maybe_increase_max_window_size(rtt_stats, now);
        let mut updates = self.update_receive_window_offset(available_window);
        updates.session_window_at_least = session_window_at_least;
        updates
    }

    /// Receive-window auto-tuning. Window updates should arrive about once
    /// per RTT; two updates within 2 RTTs mean the window is a bottleneck,
    /// so it doubles (bounded by the limit). Deliberately asymmetric: the
    /// window never shrinks.
    fn maybe_increase_max_window_size(
        &mut self,
        rtt_stats: &RttStats,
        now: Timestamp,
    ) -> Option<u64> {
        let prev = self.prev_window_update_time.replace(now);
        let Some(prev) = prev else {
            // First window update; nothing to compare against.
            return None;
        };
        if !self.auto_tune_receive_window {
            return None;
        }
        let rtt = rtt_stats.smoothed_rtt();
        if rtt.is_zero() {
            return None;
        }

        let since_last = now - prev;
        if since_last >= 2 * rtt {
            return None;
        }

        let old_window = self.receive_window_size;
        self.increase_window_size();

        if self.receive_window_size > old_window && !self.is_connection_flow_controller() {
            // Keep the session window comfortably above the stream window.
            return Some(
                self.receive_window_size * SESSION_FLOW_CONTROL_MULTIPLIER_NUM
                    / SESSION_FLOW_CONTROL_MULTIPLIER_DEN,
            );
        }
        None
    }

    fn increase_window_size(&mut self) {
        self.receive_window_size =
            (self.receive_window_size * 2).min(self.receive_window_size_limit);
    }

    fn update_receive_window_offset(&mut self, available_window: u64) -> WindowUpdates {
        self.receive_window_offset += self.receive_window_size - available_window;
        WindowUpdates {
            window_update_offset: Some(self.receive_window_offset),
            session_window_at_least: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::{Clock, NoopClock};
    use core::time::Duration;

    const KB: u64 = 1024;

    fn rtt_with_srtt(srtt: Duration) -> RttStats {
        let mut rtt_stats = RttStats::new(srtt);
        rtt_stats.update_rtt(srtt, Duration::ZERO, NoopClock.get_time());
        rtt_stats
    }

    fn stream_controller(window: u64, limit: u64) -> FlowController {
        FlowController::new(Some(4), window, window, limit, true)
    }

    #[test]
    fn send_accounting_and_blocked_dedup() {
        let mut controller = stream_controller(64 * KB, 1024 * KB);
        assert_eq!(controller.send_window_size(), 64 * KB);

        controller.add_bytes_sent(64 * KB).unwrap();
        assert!(controller.is_blocked());

        // BLOCKED is reported once per offset
        assert!(controller.should_send_blocked());
        assert!(!controller.should_send_blocked());

        // an update unblocks; a stale update does not
        assert!(!controller.update_send_window_offset(64 * KB));
        assert!(controller.update_send_window_offset(128 * KB));
        assert_eq!(controller.send_window_size(), 64 * KB);
        assert!(!controller.is_blocked());
    }

    #[test]
    fn sending_beyond_window_is_fatal() {
        let mut controller = stream_controller(1000, 64 * KB);
        let error = controller.add_bytes_sent(1001).unwrap_err();
        assert_eq!(error.code, Code::FlowControlSentTooMuchData);
        // the counter saturates at the window edge
        assert_eq!(controller.send_window_size(), 0);
    }

    #[test]
    fn receive_violation_detection() {
        let mut controller = stream_controller(1000, 64 * KB);
        assert!(controller.update_highest_received_offset(999));
        assert!(!controller.flow_control_violation());

        // lower offsets do not regress the watermark
        assert!(!controller.update_highest_received_offset(500));
        assert_eq!(controller.highest_received_byte_offset(), 999);

        assert!(controller.update_highest_received_offset(1001));
        assert!(controller.flow_control_violation());
    }

    #[test]
    fn window_update_at_half_window() {
        let mut controller = stream_controller(64 * KB, 1024 * KB);
        let rtt_stats = rtt_with_srtt(Duration::from_millis(50));
        let now = NoopClock.get_time();

        // under half consumed: no update
        let updates = controller.add_bytes_consumed(31 * KB, &rtt_stats, now);
        assert_eq!(updates.window_update_offset, None);

        // crossing half: advertise a full window beyond what was consumed
        let updates = controller.add_bytes_consumed(2 * KB, &rtt_stats, now);
        assert_eq!(updates.window_update_offset, Some(33 * KB + 64 * KB));
    }

    /// Two window updates within 2 RTTs double the window and ask the
    /// session to stay at 1.5x the stream window
    #[test]
    fn auto_tune_doubles_window_under_pressure() {
        let mut controller = stream_controller(64 * KB, 1024 * KB);
        let rtt_stats = rtt_with_srtt(Duration::from_millis(50));
        let start = NoopClock.get_time();

        // first update at 30ms establishes the baseline
        let updates =
            controller.add_bytes_consumed(33 * KB, &rtt_stats, start + Duration::from_millis(30));
        assert!(updates.window_update_offset.is_some());
        assert_eq!(updates.session_window_at_least, None);
        assert_eq!(controller.receive_window_size(), 64 * KB);

        // second update 30ms later is within 2 RTTs (100ms): double
        let updates =
            controller.add_bytes_consumed(33 * KB, &rtt_stats, start + Duration::from_millis(60));
        assert!(updates.window_update_offset.is_some());
        assert_eq!(controller.receive_window_size(), 128 * KB);
        assert_eq!(updates.session_window_at_least, Some(192 * KB));
    }

    #[test]
    fn auto_tune_respects_the_limit() {
        let mut controller = stream_controller(64 * KB, 96 * KB);
        let rtt_stats = rtt_with_srtt(Duration::from_millis(50));
        let start = NoopClock.get_time();

        controller.add_bytes_consumed(33 * KB, &rtt_stats, start + Duration::from_millis(30));
        let updates =
            controller.add_bytes_consumed(33 * KB, &rtt_stats, start + Duration::from_millis(60));
        // doubled, but clamped at the limit; the clamped growth still
        // nudges the session window
        assert_eq!(controller.receive_window_size(), 96 * KB);
        assert_eq!(updates.session_window_at_least, Some(144 * KB));
    }

    #[test]
    fn slow_updates_do_not_tune() {
        let mut controller = stream_controller(64 * KB, 1024 * KB);
        let rtt_stats = rtt_with_srtt(Duration::from_millis(10));
        let start = NoopClock.get_time();

        controller.add_bytes_consumed(33 * KB, &rtt_stats, start + Duration::from_millis(30));
        // 30ms later with a 10ms RTT: not a bottleneck
        let updates =
            controller.add_bytes_consumed(33 * KB, &rtt_stats, start + Duration::from_millis(60));
        assert!(updates.window_update_offset.is_some());
        assert_eq!(controller.receive_window_size(), 64 * KB);
    }

    #[test]
    fn ensure_window_at_least_raises_the_limit() {
        let mut controller = FlowController::new(None, 64 * KB, 64 * KB, 96 * KB, true);

        // already satisfied: nothing to do
        assert_eq!(
            controller.ensure_window_at_least(96 * KB),
            WindowUpdates::default()
        );

        let updates = controller.ensure_window_at_least(192 * KB);
        assert!(updates.window_update_offset.is_some());
        assert_eq!(controller.receive_window_size(), 128 * KB);
    }

    #[test]
    fn window_resize_only_before_use() {
        let mut controller = stream_controller(64 * KB, 1024 * KB);
        assert!(controller.update_receive_window_size(128 * KB).is_ok());
        assert_eq!(controller.receive_window_offset(), 128 * KB);

        // after an update moved the offset, resizing is an error
        let rtt_stats = rtt_with_srtt(Duration::from_millis(50));
        controller.add_bytes_consumed(65 * KB, &rtt_stats, NoopClock.get_time());
        assert!(controller.update_receive_window_size(256 * KB).is_err());
    }
}
