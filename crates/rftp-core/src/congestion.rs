//! AIMD rate control for the sending side.
//!
//! The controller counts packets sent in the current one-second window and
//! gates the writer on two limits: the congestion window, adjusted from
//! incoming ACKs, and the flow rate the receiver advertises. ACKs carrying
//! resend entries grow the window by half; ACKs without them halve it,
//! throttled by a cool-off measured in ACK numbers so one loss event is not
//! punished repeatedly within the same round trip.

use std::pin::pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::shutdown::Shutdown;
use crate::wire::Ack;

/// ACKs to wait after a decrease before decreasing again.
///
/// A new ACK sent before resent packets had a chance to arrive still
/// reflects the old loss; six ACKs is roughly 1.5 round trips.
const DECREASE_COOL_OFF: u8 = 6;

#[derive(Debug)]
struct Window {
    cong_rate: u32,
    flow_rate: u32,
    last_ack: u8,
    cool_off: u8,
}

/// Packet-count AIMD window with a one-second reset tick
#[derive(Debug)]
pub struct RateController {
    sent: AtomicU32,
    window: Mutex<Window>,
    available: Notify,
}

impl RateController {
    /// Create a controller with the given initial congestion window
    /// (packets per second).
    #[must_use]
    pub fn new(initial_window: u32) -> Arc<Self> {
        Arc::new(Self {
            sent: AtomicU32::new(0),
            window: Mutex::new(Window {
                cong_rate: initial_window.max(1),
                flow_rate: 0,
                last_ack: 0,
                cool_off: 0,
            }),
            available: Notify::new(),
        })
    }

    /// Spawn the one-second tick that resets the sent counter and wakes
    /// the writer. The task ends when `shutdown` triggers.
    pub fn start(self: Arc<Self>, shutdown: Shutdown) -> JoinHandle<()> {
        let controller = self;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                controller.sent.store(0, Ordering::Relaxed);
                controller.available.notify_one();
                tokio::select! {
                    _ = tick.tick() => {}
                    () = shutdown.wait() => return,
                }
            }
        })
    }

    /// Whether both congestion and flow control allow sending one packet
    /// right now.
    #[must_use]
    pub fn is_available(&self) -> bool {
        let sent = self.sent.load(Ordering::Relaxed);
        let window = self.window.lock().unwrap();
        sent < window.cong_rate && (window.flow_rate == 0 || sent < window.flow_rate)
    }

    /// Record one sent packet.
    pub fn on_send(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Feed a freshly received ACK into the window.
    pub fn on_ack(&self, ack: &Ack) {
        {
            let mut window = self.window.lock().unwrap();

            if ack.ack_number < window.last_ack {
                // reordered; newer ACKs were already processed
                window.last_ack = ack.ack_number;
                return;
            }

            if window.cool_off > 0 {
                let elapsed = ack.ack_number - window.last_ack;
                window.cool_off = window.cool_off.saturating_sub(elapsed);
            }

            window.flow_rate = ack.max_transmission_rate;

            if !ack.resend_entries.is_empty() {
                window.cong_rate = window.cong_rate.saturating_add(window.cong_rate / 2);
            } else if window.cool_off == 0 {
                window.cong_rate = (window.cong_rate / 2).max(1);
                window.cool_off = DECREASE_COOL_OFF;
            }

            window.last_ack = ack.ack_number;
        }

        if self.is_available() {
            self.available.notify_one();
        }
    }

    /// Wait until the controller becomes available. Returns immediately
    /// when it already is.
    pub async fn available(&self) {
        let mut notified = pin!(self.available.notified());
        notified.as_mut().enable();
        if self.is_available() {
            return;
        }
        notified.await;
    }

    /// Current congestion window in packets per second.
    #[must_use]
    pub fn congestion_window(&self) -> u32 {
        self.window.lock().unwrap().cong_rate
    }

    /// Last flow rate the receiver advertised.
    #[must_use]
    pub fn flow_rate(&self) -> u32 {
        self.window.lock().unwrap().flow_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::ResendEntry;

    fn ack(number: u8, resends: usize) -> Ack {
        Ack {
            ack_number: number,
            resend_entries: (0..resends)
                .map(|i| ResendEntry {
                    file_index: 0,
                    offset: i as u64,
                    length: 1,
                })
                .collect(),
            ..Ack::default()
        }
    }

    #[test]
    fn window_shrinks_without_resend_entries() {
        let controller = RateController::new(1000);
        let mut previous = controller.congestion_window();

        // ack numbers spaced wider than the cool-off so every ACK may
        // decrease again
        for number in (7..100).step_by(7) {
            controller.on_ack(&ack(number, 0));
            let current = controller.congestion_window();
            assert!(current <= previous, "window grew from {previous} to {current}");
            previous = current;
        }
        assert!(previous < 1000);
    }

    #[test]
    fn window_grows_with_resend_entries() {
        let controller = RateController::new(1000);
        let mut previous = controller.congestion_window();

        for number in 1..40 {
            controller.on_ack(&ack(number, 3));
            let current = controller.congestion_window();
            assert!(current >= previous, "window shrank from {previous} to {current}");
            previous = current;
        }
        assert!(previous > 1000);
    }

    #[test]
    fn cool_off_suppresses_consecutive_decreases() {
        let controller = RateController::new(1000);
        controller.on_ack(&ack(1, 0));
        assert_eq!(controller.congestion_window(), 500);
        // the next few ACKs land inside the cool-off
        controller.on_ack(&ack(2, 0));
        controller.on_ack(&ack(3, 0));
        assert_eq!(controller.congestion_window(), 500);
        // six ACK numbers later the cool-off has expired
        controller.on_ack(&ack(9, 0));
        assert_eq!(controller.congestion_window(), 250);
    }

    #[test]
    fn stale_ack_only_updates_last_ack() {
        let controller = RateController::new(1000);
        controller.on_ack(&ack(10, 3));
        let grown = controller.congestion_window();
        controller.on_ack(&ack(4, 0));
        assert_eq!(controller.congestion_window(), grown);
        // last_ack was rewound, so 5 is processed normally
        controller.on_ack(&ack(5, 3));
        assert!(controller.congestion_window() > grown);
    }

    #[test]
    fn flow_rate_caps_availability() {
        let controller = RateController::new(1000);
        controller.on_ack(&Ack {
            ack_number: 1,
            max_transmission_rate: 2,
            resend_entries: vec![ResendEntry {
                file_index: 0,
                offset: 0,
                length: 1,
            }],
            ..Ack::default()
        });
        assert_eq!(controller.flow_rate(), 2);
        assert!(controller.is_available());
        controller.on_send();
        controller.on_send();
        assert!(!controller.is_available());
    }

    #[tokio::test(start_paused = true)]
    async fn tick_resets_the_sent_counter() {
        let controller = RateController::new(2);
        let shutdown = Shutdown::new();
        let tick = Arc::clone(&controller).start(shutdown.clone());

        controller.on_send();
        controller.on_send();
        assert!(!controller.is_available());

        tokio::time::advance(Duration::from_millis(1100)).await;
        tokio::task::yield_now().await;
        assert!(controller.is_available());

        shutdown.trigger();
        let _ = tick.await;
    }

    #[tokio::test]
    async fn available_returns_immediately_when_open() {
        let controller = RateController::new(10);
        tokio::time::timeout(Duration::from_millis(50), controller.available())
            .await
            .expect("controller should be available");
    }
}
