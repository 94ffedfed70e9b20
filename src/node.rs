//! Surface of the protocol stack the runtime drives.
//!
//! The CANopen state machines (NMT, SDO, PDO, heartbeat, emergency, LSS)
//! live outside this crate; the runtime only needs the callable seam
//! defined here: wire the stack to the driver on a communication reset,
//! run its slow and time-critical halves once per tick, and hand it
//! emergency conditions found by the ambient machinery.

use crate::can::CANModule;
use crate::err::DriverError;
use crate::event_loop::Notifier;
use crate::gateway::AsciiEngine;

/// Node-id placeholder while the node waits for LSS configuration.
pub const NODE_ID_LSS_UNCONFIGURED: u8 = 0xFF;

/// What the stack asked the runtime to do after mainline processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetCommand {
    /// Keep running.
    None,
    /// Re-initialize CANopen communication.
    Communication,
    /// Application reset; the process exits (and optionally reboots the
    /// host).
    App,
    /// Orderly exit.
    Quit,
}

/// Emergency conditions the runtime reports into the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmergencyKind {
    /// Persistent storage failed to load at init.
    NonVolatileMemory,
    /// A periodic auto-save failed.
    NonVolatileAutoSave,
    /// Inconsistent object-dictionary entry found during setup.
    InconsistentDictionary,
}

/// The protocol stack as the runtime sees it.
pub trait ProtocolStack: Send {
    /// Communication reset: register receive and transmit buffers on the
    /// (freshly configured) CAN module and bring the protocol objects up
    /// for `node_id`. Called once per pass of the outer runtime loop,
    /// while the module is still in configuration mode.
    fn communication_reset(
        &mut self,
        can: &mut CANModule,
        node_id: u8,
    ) -> Result<(), DriverError>;

    /// True while the node runs without a configured node-id.
    fn node_id_unconfigured(&self) -> bool;

    /// Install the handle the stack uses to wake the mainline thread from
    /// realtime context.
    fn install_wakeup(&mut self, notifier: Notifier);

    /// Slow protocol work, run on the mainline thread. `dt_us` is the
    /// time since the previous mainline tick; the stack may lower
    /// `timer_next_us` to be called again sooner.
    fn process_main(
        &mut self,
        can: &mut CANModule,
        enable_gateway: bool,
        dt_us: u32,
        timer_next_us: &mut u32,
    ) -> ResetCommand;

    /// Time-critical work: synchronization objects and process data.
    /// `timer_next_us` is `None` when called from the realtime thread,
    /// whose cadence is fixed.
    fn process_rt(&mut self, can: &mut CANModule, dt_us: u32, timer_next_us: Option<&mut u32>);

    /// The stack's ASCII command engine, if it has one.
    fn gateway_engine(&mut self) -> Option<&mut dyn AsciiEngine> {
        None
    }

    fn emergency_report(&mut self, _kind: EmergencyKind, _info: u32) {}

    fn emergency_reset(&mut self, _kind: EmergencyKind) {}
}

/// Command engine that accepts and discards everything. Keeps the gateway
/// transport exercisable before a real engine is wired in.
#[derive(Default)]
pub struct SinkEngine {
    log_lines: Vec<String>,
}

impl SinkEngine {
    pub fn log_lines(&self) -> &[String] {
        &self.log_lines
    }
}

impl AsciiEngine for SinkEngine {
    fn write_space(&self) -> usize {
        1024
    }

    fn feed(&mut self, _data: &[u8]) {}

    fn take_output(&mut self) -> Vec<u8> {
        Vec::new()
    }

    fn log_line(&mut self, line: &str) {
        if self.log_lines.len() >= 64 {
            self.log_lines.remove(0);
        }
        self.log_lines.push(line.to_string());
    }
}

/// Inert stack: registers nothing and never requests a reset. Used by the
/// shipped binary until a protocol stack is linked in, and by tests that
/// exercise the runtime plumbing.
pub struct NullStack {
    node_id: u8,
    engine: SinkEngine,
    notifier: Option<Notifier>,
}

impl NullStack {
    pub fn new(node_id: u8) -> Self {
        NullStack {
            node_id,
            engine: SinkEngine::default(),
            notifier: None,
        }
    }
}

impl ProtocolStack for NullStack {
    fn communication_reset(
        &mut self,
        _can: &mut CANModule,
        node_id: u8,
    ) -> Result<(), DriverError> {
        self.node_id = node_id;
        Ok(())
    }

    fn node_id_unconfigured(&self) -> bool {
        self.node_id == NODE_ID_LSS_UNCONFIGURED
    }

    fn install_wakeup(&mut self, notifier: Notifier) {
        self.notifier = Some(notifier);
    }

    fn process_main(
        &mut self,
        _can: &mut CANModule,
        _enable_gateway: bool,
        _dt_us: u32,
        _timer_next_us: &mut u32,
    ) -> ResetCommand {
        ResetCommand::None
    }

    fn process_rt(&mut self, _can: &mut CANModule, _dt_us: u32, _timer_next_us: Option<&mut u32>) {
    }

    fn gateway_engine(&mut self) -> Option<&mut dyn AsciiEngine> {
        Some(&mut self.engine)
    }
}
