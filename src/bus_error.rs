//! Per-interface bus-health handling.
//!
//! SocketCAN has no microcontroller-style error counters; the kernel driver
//! reports bus problems as special error frames on the same socket. This
//! module turns those frames into a small health state machine with a
//! listen-only degradation policy: after a streak of missing ACKs (nobody
//! else on the bus) or a bus-off condition, the interface stops transmitting
//! and probes the bus again after a dwell time.

use std::io;
use std::process::Command;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::socketcan::{
    CANFrame, ERR_CLASS_ACK, ERR_CLASS_BUSOFF, ERR_CLASS_CRTL, ERR_CRTL_RX_OVERFLOW,
    ERR_CRTL_RX_PASSIVE, ERR_CRTL_RX_WARNING, ERR_CRTL_TX_OVERFLOW, ERR_CRTL_TX_PASSIVE,
    ERR_CRTL_TX_WARNING,
};

/// Missing ACKs in a row before the bus is assumed empty and the interface
/// drops to listen-only.
pub const NOACK_LIMIT: u32 = 16;

/// How long transmission stays blocked once listen-only is entered.
pub const LISTEN_ONLY_DWELL: Duration = Duration::from_secs(10);

bitflags::bitflags! {
    /// Accumulated CAN error status, reported to the protocol stack.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CanErrorStatus: u16 {
        const TX_WARNING = 0x0001;
        const TX_PASSIVE = 0x0002;
        const TX_BUS_OFF = 0x0004;
        const TX_OVERFLOW = 0x0008;
        const RX_WARNING = 0x0100;
        const RX_PASSIVE = 0x0200;
        const RX_OVERFLOW = 0x0800;
    }
}

/// Health of one CAN interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceState {
    /// Error active/passive, transmission permitted.
    Active,
    /// Observing the bus, transmission suppressed.
    ListenOnly,
    /// No influence on the bus.
    BusOff,
}

/// Strategy for restarting a CAN interface after bus-off.
///
/// Restarting is the only way to clear the kernel and hardware tx queues
/// once the controller went bus-off.
pub trait RestartInterface: Send {
    fn restart(&self, ifname: &str) -> io::Result<()>;
}

/// Restart via the `ip` tool, detached so the error path never blocks.
pub struct IpLinkRestart;

impl RestartInterface for IpLinkRestart {
    fn restart(&self, ifname: &str) -> io::Result<()> {
        // the shell backgrounds the actual work and exits right away, so
        // waiting here cannot stall the receive path
        let mut shell = Command::new("sh")
            .arg("-c")
            .arg(format!(
                "ip link set {} down && ip link set {} up &",
                ifname, ifname
            ))
            .spawn()?;
        shell.wait().map(|_| ())
    }
}

/// Error handler state for one interface.
pub struct InterfaceErrorHandler {
    ifname: String,
    noack_counter: u32,
    listen_only: bool,
    listen_only_since: Option<Instant>,
    status: CanErrorStatus,
    restart: Box<dyn RestartInterface>,
}

impl InterfaceErrorHandler {
    pub fn new(ifname: &str, restart: Box<dyn RestartInterface>) -> Self {
        Self {
            ifname: ifname.to_string(),
            noack_counter: 0,
            listen_only: false,
            listen_only_since: None,
            status: CanErrorStatus::empty(),
            restart,
        }
    }

    pub fn status(&self) -> CanErrorStatus {
        self.status
    }

    pub(crate) fn note_status(&mut self, flags: CanErrorStatus) {
        self.status.insert(flags);
    }

    pub fn is_listen_only(&self) -> bool {
        self.listen_only
    }

    /// A data frame arrived: someone else is active on the bus, so
    /// listen-only can be left immediately and the ACK streak is over.
    pub fn rx_data_frame(&mut self) {
        if self.listen_only {
            self.clear_listen_only();
        }
        self.noack_counter = 0;
    }

    /// Classify a kernel error frame and advance the state machine.
    ///
    /// Classes are handled from the most unambiguous one down: bus-off,
    /// then controller status, then missing ACK. Never a hard error.
    pub fn rx_error_frame(&mut self, frame: &CANFrame) -> InterfaceState {
        let class = frame.err();
        let data = frame.raw_data();
        debug!(
            "{}: error frame class {:#x} data {:02x?}",
            self.ifname, class, data
        );

        if class & ERR_CLASS_BUSOFF != 0 {
            // The controller silenced itself, e.g. because of a short on
            // the wires. Restarting the interface is the only way to clear
            // kernel and hardware tx queues.
            warn!("{}: CAN bus-off", self.ifname);
            self.status.insert(CanErrorStatus::TX_BUS_OFF);
            return self.set_listen_only(true);
        }

        if class & ERR_CLASS_CRTL != 0 {
            // Error counters live in the CAN hardware; all that is left to
            // do here is mirror the reported level into the status word.
            // There is no notification for leaving warning level, so
            // warning bits are never set, only passive bits cleared.
            self.status.remove(CanErrorStatus::TX_BUS_OFF);
            let detail = data[1];
            if detail & ERR_CRTL_RX_PASSIVE != 0 {
                warn!("{}: rx error passive", self.ifname);
                self.status.insert(CanErrorStatus::RX_PASSIVE);
            } else if detail & ERR_CRTL_TX_PASSIVE != 0 {
                warn!("{}: tx error passive", self.ifname);
                self.status.insert(CanErrorStatus::TX_PASSIVE);
            } else if detail & ERR_CRTL_RX_OVERFLOW != 0 {
                warn!("{}: rx buffer overflow", self.ifname);
                self.status.insert(CanErrorStatus::RX_OVERFLOW);
            } else if detail & ERR_CRTL_TX_OVERFLOW != 0 {
                warn!("{}: tx buffer overflow", self.ifname);
                self.status.insert(CanErrorStatus::TX_OVERFLOW);
            } else if detail & ERR_CRTL_RX_WARNING != 0 {
                info!("{}: rx warning level", self.ifname);
                self.status.remove(CanErrorStatus::RX_PASSIVE);
            } else if detail & ERR_CRTL_TX_WARNING != 0 {
                info!("{}: tx warning level", self.ifname);
                self.status.remove(CanErrorStatus::TX_PASSIVE);
            }
        }

        if self.listen_only {
            return InterfaceState::ListenOnly;
        }
        if class & ERR_CLASS_ACK != 0 {
            // Continuous NO-ACK means no other active node on the bus
            // (error counting exception 1 in the CAN spec).
            self.noack_counter += 1;
            if self.noack_counter >= NOACK_LIMIT {
                info!("{}: no ACK on transmission, bus assumed empty", self.ifname);
                return self.set_listen_only(true);
            }
        } else {
            self.noack_counter = 0;
        }

        InterfaceState::Active
    }

    /// Gate for the transmit path. While listen-only, transmission stays
    /// blocked until the dwell elapses; then one probe is allowed. All
    /// messages are ACKed, so any successful probe ends the degradation.
    pub fn before_tx(&mut self) -> InterfaceState {
        self.before_tx_at(Instant::now())
    }

    fn before_tx_at(&mut self, now: Instant) -> InterfaceState {
        if self.listen_only {
            if let Some(since) = self.listen_only_since {
                if now.duration_since(since) > LISTEN_ONLY_DWELL {
                    self.clear_listen_only();
                    return InterfaceState::Active;
                }
            }
            return InterfaceState::ListenOnly;
        }
        InterfaceState::Active
    }

    fn set_listen_only(&mut self, reset_interface: bool) -> InterfaceState {
        debug!("{}: entering listen-only", self.ifname);
        self.listen_only = true;
        self.listen_only_since = Some(Instant::now());

        if reset_interface {
            if let Err(e) = self.restart.restart(&self.ifname) {
                warn!("{}: interface restart failed: {}", self.ifname, e);
            }
        }
        InterfaceState::ListenOnly
    }

    fn clear_listen_only(&mut self) {
        debug!("{}: leaving listen-only", self.ifname);
        self.listen_only = false;
        self.listen_only_since = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socketcan::ERR_CLASS_BUSERROR;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct RecordingRestart(Arc<AtomicUsize>);

    impl RestartInterface for RecordingRestart {
        fn restart(&self, _ifname: &str) -> io::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn handler() -> (InterfaceErrorHandler, Arc<AtomicUsize>) {
        let restarts = Arc::new(AtomicUsize::new(0));
        let h = InterfaceErrorHandler::new(
            "can0",
            Box::new(RecordingRestart(Arc::clone(&restarts))),
        );
        (h, restarts)
    }

    fn err_frame(class: u32, data: &[u8]) -> CANFrame {
        CANFrame::new(class, data, false, true).unwrap()
    }

    #[test]
    fn noack_streak_enters_listen_only() {
        let (mut h, restarts) = handler();

        for _ in 0..NOACK_LIMIT - 1 {
            assert_eq!(
                h.rx_error_frame(&err_frame(ERR_CLASS_ACK, &[0; 8])),
                InterfaceState::Active
            );
        }
        assert_eq!(
            h.rx_error_frame(&err_frame(ERR_CLASS_ACK, &[0; 8])),
            InterfaceState::ListenOnly
        );
        assert_eq!(restarts.load(Ordering::SeqCst), 1);
        assert_eq!(h.before_tx(), InterfaceState::ListenOnly);
    }

    #[test]
    fn data_frame_resets_streak_and_listen_only() {
        let (mut h, _) = handler();

        for _ in 0..NOACK_LIMIT - 1 {
            h.rx_error_frame(&err_frame(ERR_CLASS_ACK, &[0; 8]));
        }
        h.rx_data_frame();
        for _ in 0..NOACK_LIMIT - 1 {
            assert_eq!(
                h.rx_error_frame(&err_frame(ERR_CLASS_ACK, &[0; 8])),
                InterfaceState::Active
            );
        }

        // push it over the limit, then observe traffic
        h.rx_error_frame(&err_frame(ERR_CLASS_ACK, &[0; 8]));
        assert!(h.is_listen_only());
        h.rx_data_frame();
        assert!(!h.is_listen_only());
        assert_eq!(h.before_tx(), InterfaceState::Active);
    }

    #[test]
    fn non_ack_error_frame_resets_streak() {
        let (mut h, _) = handler();

        for _ in 0..NOACK_LIMIT - 1 {
            h.rx_error_frame(&err_frame(ERR_CLASS_ACK, &[0; 8]));
        }
        h.rx_error_frame(&err_frame(ERR_CLASS_BUSERROR, &[0; 8]));
        for _ in 0..NOACK_LIMIT - 1 {
            assert_eq!(
                h.rx_error_frame(&err_frame(ERR_CLASS_ACK, &[0; 8])),
                InterfaceState::Active
            );
        }
    }

    #[test]
    fn bus_off_restarts_and_recovers_after_dwell() {
        let (mut h, restarts) = handler();

        assert_eq!(
            h.rx_error_frame(&err_frame(ERR_CLASS_BUSOFF, &[0; 8])),
            InterfaceState::ListenOnly
        );
        assert!(h.status().contains(CanErrorStatus::TX_BUS_OFF));
        assert_eq!(restarts.load(Ordering::SeqCst), 1);

        // dwell not yet elapsed
        assert_eq!(h.before_tx(), InterfaceState::ListenOnly);

        // probe after the dwell
        let later = Instant::now() + LISTEN_ONLY_DWELL + Duration::from_secs(1);
        assert_eq!(h.before_tx_at(later), InterfaceState::Active);
        assert!(!h.is_listen_only());
    }

    #[test]
    fn bus_off_wins_over_ack_classification() {
        let (mut h, restarts) = handler();

        h.rx_error_frame(&err_frame(ERR_CLASS_BUSOFF | ERR_CLASS_ACK, &[0; 8]));
        assert_eq!(restarts.load(Ordering::SeqCst), 1);
        // the ACK bit must not have been counted
        h.rx_data_frame();
        for _ in 0..NOACK_LIMIT - 1 {
            assert_eq!(
                h.rx_error_frame(&err_frame(ERR_CLASS_ACK, &[0; 8])),
                InterfaceState::Active
            );
        }
    }

    #[test]
    fn controller_frame_updates_status() {
        let (mut h, _) = handler();

        let mut data = [0u8; 8];
        data[1] = ERR_CRTL_RX_PASSIVE;
        h.rx_error_frame(&err_frame(ERR_CLASS_CRTL, &data));
        assert!(h.status().contains(CanErrorStatus::RX_PASSIVE));

        // warning level clears the passive bit again
        data[1] = ERR_CRTL_RX_WARNING;
        h.rx_error_frame(&err_frame(ERR_CLASS_CRTL, &data));
        assert!(!h.status().contains(CanErrorStatus::RX_PASSIVE));
    }

    #[test]
    fn controller_frame_clears_bus_off_bit() {
        let (mut h, _) = handler();

        h.rx_error_frame(&err_frame(ERR_CLASS_BUSOFF, &[0; 8]));
        assert!(h.status().contains(CanErrorStatus::TX_BUS_OFF));

        let mut data = [0u8; 8];
        data[1] = ERR_CRTL_TX_PASSIVE;
        h.rx_error_frame(&err_frame(ERR_CLASS_CRTL, &data));
        assert!(!h.status().contains(CanErrorStatus::TX_BUS_OFF));
    }
}
