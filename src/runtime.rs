//! Runtime orchestrator: wires driver, event loops, gateway and storage to
//! the protocol stack and runs the outer reset loop.
//!
//! Two cooperating threads, each on its own event loop. The realtime
//! thread (default period 1 ms) receives CAN frames and progresses
//! synchronization and process-data objects; the mainline thread (default
//! period 100 ms) does slow protocol work, gateway traffic, transmit
//! retries and auto-save. A single-threaded mode folds the realtime work
//! into the mainline tick for constrained deployments.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use log::{error, info, warn};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::can::CANModule;
use crate::err::DriverError;
use crate::event_loop::EventLoop;
use crate::gateway::{CommandInterface, GatewayTransport};
use crate::logging::GatewayMirror;
use crate::node::{EmergencyKind, ProtocolStack, ResetCommand, NODE_ID_LSS_UNCONFIGURED};
use crate::storage::Storage;

/// Fast-path deadline when a transmit buffer waits for retransmission.
const CANSEND_DELAY_US: u32 = 100;

/// Everything configurable about a runtime instance.
pub struct RuntimeConfig {
    /// CAN device name, e.g. `can0`.
    pub device: String,
    /// Active node-id: 1..=127, or [`NODE_ID_LSS_UNCONFIGURED`].
    pub node_id: u8,
    /// SCHED_FIFO priority for the realtime thread; `None` keeps the
    /// default scheduler.
    pub rt_priority: Option<i32>,
    /// Reboot the host when the stack requests an application reset.
    pub reboot_on_app_reset: bool,
    pub command_interface: CommandInterface,
    /// Gateway socket idle timeout in milliseconds, 0 = off.
    pub gateway_timeout_ms: u32,
    pub enable_gateway: bool,
    /// Run everything on the mainline thread.
    pub single_thread: bool,
    pub main_interval_us: u32,
    pub rt_interval_us: u32,
    /// Auto-save no more often than this.
    pub storage_auto_interval_us: u32,
    pub rx_buffer_count: usize,
    pub tx_buffer_count: usize,
    /// Log mirror to feed into the gateway engine, if logging was set up
    /// with one.
    pub log_mirror: Option<GatewayMirror>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            device: "can0".to_string(),
            node_id: NODE_ID_LSS_UNCONFIGURED,
            rt_priority: None,
            reboot_on_app_reset: false,
            command_interface: CommandInterface::Disabled,
            gateway_timeout_ms: 0,
            enable_gateway: true,
            single_thread: false,
            main_interval_us: 100_000,
            rt_interval_us: 1_000,
            storage_auto_interval_us: 60_000_000,
            rx_buffer_count: 32,
            tx_buffer_count: 32,
            log_mirror: None,
        }
    }
}

/// Optional application hooks, run once per tick of their thread with the
/// tick's microsecond delta, plus a teardown hook on exit.
pub struct AppHooks {
    pub mainline: Option<Box<dyn FnMut(u32) + Send>>,
    pub realtime: Option<Box<dyn FnMut(u32) + Send>>,
    pub teardown: Option<Box<dyn FnOnce() + Send>>,
}

impl Default for AppHooks {
    fn default() -> Self {
        AppHooks {
            mainline: None,
            realtime: None,
            teardown: None,
        }
    }
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

/// Ask a running [`run`] to exit at its next tick.
pub fn request_shutdown() {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::Relaxed)
}

fn install_signal_handlers() -> Result<(), DriverError> {
    // no SA_RESTART: the mainline must fall out of its multiplexer wait
    let action = SigAction::new(SigHandler::Handler(on_signal), SaFlags::empty(), SigSet::empty());
    unsafe {
        sigaction(Signal::SIGINT, &action)?;
        sigaction(Signal::SIGTERM, &action)?;
    }
    Ok(())
}

/// Shared node state: the driver module and the protocol stack behind one
/// lock. Locking this is the object-dictionary discipline between the two
/// threads.
struct Core<S: ProtocolStack> {
    can: CANModule,
    stack: S,
}

fn lock_core<S: ProtocolStack>(core: &Mutex<Core<S>>) -> MutexGuard<Core<S>> {
    core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn set_fifo_priority(priority: i32) -> std::io::Result<()> {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    let ret =
        unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) };
    if ret != 0 {
        return Err(std::io::Error::from_raw_os_error(ret));
    }
    Ok(())
}

/// One pass of realtime work: dispatch a received frame if this tick was
/// caused by a CAN socket, then progress sync/process-data on timer ticks.
fn rt_tick<S: ProtocolStack>(ep: &mut EventLoop, core: &mut Core<S>, realtime: bool) {
    if let Some((fd, flags)) = ep.pending_event() {
        if core.can.rx_from_event(fd, flags) {
            ep.consume_event();
        }
    }

    if !realtime || ep.timer_event {
        let Core { can, stack } = core;
        if !stack.node_id_unconfigured() && can.is_normal() {
            let dt = ep.time_difference_us;
            // on the realtime thread the cadence is fixed; deadline
            // requests only make sense on the mainline loop
            let timer_next = if realtime {
                None
            } else {
                Some(&mut ep.timer_next_us)
            };
            stack.process_rt(can, dt, timer_next);
        }
    }
}

fn rt_thread_loop<S: ProtocolStack>(
    mut ep: EventLoop,
    core: &Mutex<Core<S>>,
    priority: Option<i32>,
    mut hook: Option<Box<dyn FnMut(u32) + Send>>,
) {
    if let Some(priority) = priority {
        if let Err(e) = set_fifo_priority(priority) {
            error!("setting realtime priority {} failed: {}", priority, e);
        }
    }

    while !shutdown_requested() {
        ep.wait();
        {
            let mut core = lock_core(core);
            rt_tick(&mut ep, &mut core, true);
        }
        ep.process_last();
        if let Some(hook) = hook.as_mut() {
            hook(ep.time_difference_us);
        }
    }
}

/// Run the node until the stack requests an application reset or quit, or
/// a termination signal arrives. `storage` must already be loaded;
/// `storage_init_error` is its degraded bitmap, reported as an emergency
/// once communication is up.
pub fn run<S: ProtocolStack>(
    config: RuntimeConfig,
    stack: S,
    mut storage: Storage,
    storage_init_error: u32,
    mut hooks: AppHooks,
) -> Result<(), DriverError> {
    SHUTDOWN.store(false, Ordering::Relaxed);
    install_signal_handlers()?;

    if let Some(priority) = config.rt_priority {
        let min = unsafe { libc::sched_get_priority_min(libc::SCHED_FIFO) };
        let max = unsafe { libc::sched_get_priority_max(libc::SCHED_FIFO) };
        if priority < min || priority > max {
            error!("realtime priority {} outside {}..{}", priority, min, max);
            return Err(DriverError::IllegalArgument);
        }
    }

    let ifindex =
        nix::net::if_::if_nametoindex(config.device.as_str()).map_err(DriverError::Lookup)?;

    let mut node_id = config.node_id;
    if node_id < 1 || node_id > 127 {
        node_id = NODE_ID_LSS_UNCONFIGURED;
    }

    let mut ep_main = EventLoop::new(config.main_interval_us)?;
    let mut ep_rt_opt = if config.single_thread {
        None
    } else {
        Some(EventLoop::new(config.rt_interval_us)?)
    };
    let can_epoll_fd = ep_rt_opt
        .as_ref()
        .map(|ep| ep.epoll_fd())
        .unwrap_or_else(|| ep_main.epoll_fd());

    let mut gateway = GatewayTransport::new(
        ep_main.epoll_fd(),
        config.command_interface.clone(),
        config.gateway_timeout_ms,
    )?;

    let core = Mutex::new(Core {
        can: CANModule::new(config.rx_buffer_count, config.tx_buffer_count, can_epoll_fd),
        stack,
    });

    info!("{}: node-id {:#04x}, starting", config.device, node_id);

    let scope_result = crossbeam::thread::scope(|scope| {
        let core = &core;
        let mut rt_handle = None;
        let mut first_run = true;
        let mut reset = ResetCommand::None;
        let mut storage_interval_timer: u32 = 0;
        let mut storage_error_prev: u32 = 0;

        let loop_result = (|| -> Result<ResetCommand, DriverError> {
            while !matches!(reset, ResetCommand::App | ResetCommand::Quit)
                && !shutdown_requested()
            {
                // communication reset: bring the driver and the stack up
                {
                    let mut core = lock_core(core);
                    core.can.disable();
                    core.can = CANModule::new(
                        config.rx_buffer_count,
                        config.tx_buffer_count,
                        can_epoll_fd,
                    );
                    core.can.add_interface(ifindex)?;

                    let Core { can, stack } = &mut *core;
                    stack.communication_reset(can, node_id)?;
                    stack.install_wakeup(ep_main.notifier()?);
                    gateway.reset_session();

                    if !stack.node_id_unconfigured() {
                        if storage_init_error != 0 {
                            stack.emergency_report(
                                EmergencyKind::NonVolatileMemory,
                                storage_init_error,
                            );
                        }
                        info!("{}: communication reset", config.device);
                    } else {
                        info!("{}: node-id not initialized", config.device);
                    }

                    can.set_normal()?;
                }

                if first_run {
                    first_run = false;
                    if let Some(ep_rt) = ep_rt_opt.take() {
                        let priority = config.rt_priority;
                        let rt_hook = hooks.realtime.take();
                        rt_handle = Some(scope.spawn(move |_| {
                            rt_thread_loop(ep_rt, core, priority, rt_hook)
                        }));
                    }
                }

                reset = ResetCommand::None;
                info!("{}: running ...", config.device);

                while matches!(reset, ResetCommand::None) && !shutdown_requested() {
                    ep_main.wait();
                    {
                        let mut core = lock_core(core);

                        if config.single_thread {
                            rt_tick(&mut ep_main, &mut core, false);
                        }

                        {
                            let Core { stack, .. } = &mut *core;
                            if let Some(engine) = stack.gateway_engine() {
                                gateway.process(&mut ep_main, engine);
                            }
                        }

                        core.can.process();

                        let dt = ep_main.time_difference_us;
                        let Core { can, stack } = &mut *core;
                        reset = stack.process_main(
                            can,
                            config.enable_gateway && gateway.is_enabled(),
                            dt,
                            &mut ep_main.timer_next_us,
                        );

                        // pending retransmissions should not wait a whole
                        // period
                        if can.tx_pending() > 0 && ep_main.timer_next_us > CANSEND_DELAY_US {
                            ep_main.timer_next_us = CANSEND_DELAY_US;
                        }

                        if let Some(engine) = stack.gateway_engine() {
                            if let Some(mirror) = config.log_mirror.as_ref() {
                                mirror.drain_into(engine);
                            }
                            gateway.flush(engine);
                        }
                    }
                    ep_main.process_last();

                    if let Some(hook) = hooks.mainline.as_mut() {
                        hook(ep_main.time_difference_us);
                    }

                    // auto-save, but not more often than the interval
                    if storage_interval_timer < config.storage_auto_interval_us {
                        storage_interval_timer += ep_main.time_difference_us;
                    } else {
                        storage_interval_timer = 0;
                        let mask = storage.auto_process(false);
                        let mut core = lock_core(core);
                        if mask != storage_error_prev && !core.stack.node_id_unconfigured() {
                            if mask != 0 {
                                core.stack
                                    .emergency_report(EmergencyKind::NonVolatileAutoSave, mask);
                            } else {
                                core.stack.emergency_reset(EmergencyKind::NonVolatileAutoSave);
                            }
                        }
                        storage_error_prev = mask;
                    }
                }
            }
            Ok(reset)
        })();

        // orderly shutdown, also on error paths: stop the realtime
        // thread before anything it uses goes away
        SHUTDOWN.store(true, Ordering::Relaxed);
        if let Some(handle) = rt_handle {
            if handle.join().is_err() {
                error!("realtime thread panicked");
            }
        }
        loop_result
    });

    let reset = match scope_result {
        Ok(result) => result?,
        Err(_) => {
            return Err(DriverError::Syscall(std::io::Error::new(
                std::io::ErrorKind::Other,
                "realtime thread panicked",
            )))
        }
    };

    if let Some(teardown) = hooks.teardown.take() {
        teardown();
    }

    let flush_errors = storage.auto_process(true);
    if flush_errors != 0 {
        warn!("final auto-save failed, bitmap {:#x}", flush_errors);
    }

    lock_core(&core).can.disable();
    drop(gateway);

    info!("{}: finished", config.device);

    if config.reboot_on_app_reset && reset == ResetCommand::App {
        unsafe {
            libc::sync();
        }
        let ret = unsafe { libc::reboot(libc::LINUX_REBOOT_CMD_RESTART) };
        if ret != 0 {
            error!("reboot failed");
            return Err(DriverError::Syscall(std::io::Error::last_os_error()));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_thread_model() {
        let config = RuntimeConfig::default();
        assert_eq!(config.main_interval_us, 100_000);
        assert_eq!(config.rt_interval_us, 1_000);
        assert_eq!(config.storage_auto_interval_us, 60_000_000);
        assert!(!config.single_thread);
        assert_eq!(config.node_id, NODE_ID_LSS_UNCONFIGURED);
    }

    #[test]
    fn unknown_device_fails_lookup() {
        let config = RuntimeConfig {
            device: "does-not-exist0".to_string(),
            ..Default::default()
        };
        let storage = crate::storage::Storage::new(Vec::new());
        let result = run(
            config,
            crate::node::NullStack::new(4),
            storage,
            0,
            AppHooks::default(),
        );
        assert!(matches!(result, Err(DriverError::Lookup(_))));
    }
}

#[cfg(all(test, feature = "vcan_tests"))]
mod vcan_tests {
    use super::*;
    use crate::node::NullStack;
    use crate::storage::{region, Storage, StorageAttr, StorageEntry};
    use serial_test::serial;
    use std::time::Duration;

    #[test]
    #[serial]
    fn runs_and_shuts_down() {
        let file = std::env::temp_dir().join(format!("canopend-rt-{}", std::process::id()));
        let entry = StorageEntry::new(
            &file.to_string_lossy(),
            region(vec![0u8; 4]),
            4,
            StorageAttr::AUTO,
        );
        let mut storage = Storage::new(vec![entry]);
        let degraded = storage.load().unwrap();

        let config = RuntimeConfig {
            device: "vcan0".to_string(),
            node_id: 4,
            ..Default::default()
        };

        let stopper = std::thread::spawn(|| {
            std::thread::sleep(Duration::from_millis(300));
            request_shutdown();
        });

        let result = run(config, NullStack::new(4), storage, degraded, AppHooks::default());
        stopper.join().unwrap();
        result.unwrap();
    }
}
