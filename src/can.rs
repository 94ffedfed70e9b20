//! CAN driver module: sockets, receive dispatch, non-blocking transmit.
//!
//! One [`CANModule`] owns raw CAN sockets (one per interface), a dense set
//! of receive buffers with kernel-mirrored filters, and a set of transmit
//! buffers. Reads happen from multiplexer events only, one frame per
//! event. Sends never block; a rejected frame is flagged on its buffer and
//! re-sent from the mainline tick via [`CANModule::process`].

use std::ffi::CStr;
use std::io;
use std::mem::size_of;
use std::os::unix::io::RawFd;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, error, info, warn};
use nix::sys::epoll::{epoll_ctl, EpollEvent, EpollFlags, EpollOp};

use crate::bus_error::{
    CanErrorStatus, InterfaceErrorHandler, InterfaceState, IpLinkRestart, RestartInterface,
};
use crate::err::DriverError;
use crate::socketcan::{
    CANAddr, CANFilter, CANFrame, CAN_RAW, CAN_RAW_ERR_FILTER, CAN_RAW_FILTER, EFF_FLAG,
    ERR_CLASS_ACK, ERR_CLASS_BUSERROR, ERR_CLASS_BUSOFF, ERR_CLASS_CRTL, ERR_MASK, PF_CAN,
    RTR_FLAG, SCM_TIMESTAMPING, SFF_MASK, SOF_TIMESTAMPING_RX_SOFTWARE, SOF_TIMESTAMPING_SOFTWARE,
    SOL_CAN_RAW, SO_RXQ_OVFL, SO_TIMESTAMPING,
};
use crate::util;

/// Handler invoked when a matching frame arrives. The closure captures
/// whatever protocol object the registration belongs to.
pub type RxCallback = Box<dyn FnMut(&CANFrame) + Send>;

/// A registered receive slot: filter, handler and metadata of the last
/// matched frame.
pub struct RxBuffer {
    filter: CANFilter,
    callback: Option<RxCallback>,
    timestamp: Option<SystemTime>,
    ifindex: u32,
}

impl RxBuffer {
    fn unconfigured() -> Self {
        RxBuffer {
            // matches nothing until configured
            filter: CANFilter::new(0, 0xFFFF_FFFF),
            callback: None,
            timestamp: None,
            ifindex: 0,
        }
    }

    /// Software receive timestamp of the last matched frame.
    pub fn timestamp(&self) -> Option<SystemTime> {
        self.timestamp
    }

    /// Interface the last matched frame arrived on, 0 if none yet.
    pub fn ifindex(&self) -> u32 {
        self.ifindex
    }
}

/// A transmit slot: a frame template plus its pending/sync markers.
pub struct TxBuffer {
    frame: CANFrame,
    buffer_full: bool,
    sync_flag: bool,
    ifindex: u32,
}

impl TxBuffer {
    pub fn frame(&self) -> &CANFrame {
        &self.frame
    }

    /// Payload bytes are written here right before sending.
    pub fn frame_mut(&mut self) -> &mut CANFrame {
        &mut self.frame
    }

    /// Send rejected by the kernel; the frame waits for retransmission.
    pub fn is_pending(&self) -> bool {
        self.buffer_full
    }

    pub fn sync_flag(&self) -> bool {
        self.sync_flag
    }

    /// Target interface for this buffer, 0 = all bound interfaces.
    pub fn set_interface(&mut self, ifindex: u32) {
        self.ifindex = ifindex;
    }
}

struct CANInterface {
    fd: RawFd,
    ifindex: u32,
    name: String,
    errorhandler: InterfaceErrorHandler,
}

/// The CAN driver module.
pub struct CANModule {
    epoll_fd: RawFd,
    interfaces: Vec<CANInterface>,
    rx: Vec<RxBuffer>,
    tx: Vec<TxBuffer>,
    filters: Vec<CANFilter>,
    normal: bool,
    tx_pending: u16,
    rx_drop_count: u32,
    status: CanErrorStatus,
    err_mask_all: bool,
}

impl CANModule {
    /// A module in configuration mode with `rx_count`/`tx_count` zeroed
    /// buffer slots. Sockets are added with [`add_interface`] and register
    /// for read events on `epoll_fd`.
    ///
    /// [`add_interface`]: Self::add_interface
    pub fn new(rx_count: usize, tx_count: usize, epoll_fd: RawFd) -> Self {
        let mut rx = Vec::with_capacity(rx_count);
        rx.resize_with(rx_count, RxBuffer::unconfigured);
        let mut tx = Vec::with_capacity(tx_count);
        tx.resize_with(tx_count, || TxBuffer {
            frame: CANFrame::default(),
            buffer_full: false,
            sync_flag: false,
            ifindex: 0,
        });

        CANModule {
            epoll_fd,
            interfaces: Vec::new(),
            rx,
            tx,
            filters: vec![CANFilter::default(); rx_count],
            normal: false,
            tx_pending: 0,
            rx_drop_count: 0,
            status: CanErrorStatus::empty(),
            err_mask_all: false,
        }
    }

    /// Request all kernel error-frame classes instead of the default
    /// ACK/controller/bus-off/bus-error set. Configuration mode only.
    pub fn set_error_mask_all(&mut self, all: bool) {
        self.err_mask_all = all;
    }

    pub fn is_normal(&self) -> bool {
        self.normal
    }

    pub fn interface_count(&self) -> usize {
        self.interfaces.len()
    }

    /// Number of transmit buffers waiting for retransmission.
    pub fn tx_pending(&self) -> u16 {
        self.tx_pending
    }

    /// Accumulated error status, copied from the first interface by
    /// [`process`](Self::process).
    pub fn status(&self) -> CanErrorStatus {
        self.status
    }

    pub fn rx_buffer(&self, index: usize) -> Option<&RxBuffer> {
        self.rx.get(index)
    }

    pub fn tx_buffer_mut(&mut self, index: usize) -> Option<&mut TxBuffer> {
        self.tx.get_mut(index)
    }

    /// Open a raw CAN socket on the device with kernel interface index
    /// `ifindex` and register it with the multiplexer. Only allowed in
    /// configuration mode.
    pub fn add_interface(&mut self, ifindex: u32) -> Result<(), DriverError> {
        self.add_interface_with_restart(ifindex, Box::new(IpLinkRestart))
    }

    pub fn add_interface_with_restart(
        &mut self,
        ifindex: u32,
        restart: Box<dyn RestartInterface>,
    ) -> Result<(), DriverError> {
        if self.normal {
            return Err(DriverError::InvalidState);
        }

        let mut name_buf = [0 as libc::c_char; libc::IF_NAMESIZE];
        let ret = unsafe { libc::if_indextoname(ifindex, name_buf.as_mut_ptr()) };
        if ret.is_null() {
            return Err(DriverError::IllegalArgument);
        }
        let name = unsafe { CStr::from_ptr(name_buf.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        let fd = unsafe { libc::socket(PF_CAN, libc::SOCK_RAW, CAN_RAW) };
        if fd < 0 {
            return Err(DriverError::Syscall(io::Error::last_os_error()));
        }

        if let Err(e) = Self::configure_socket(fd, ifindex, &name, self.err_mask_all) {
            unsafe {
                libc::close(fd);
            }
            return Err(e);
        }

        let mut ev = EpollEvent::new(EpollFlags::EPOLLIN, fd as u64);
        if let Err(e) = epoll_ctl(self.epoll_fd, EpollOp::EpollCtlAdd, fd, &mut ev) {
            unsafe {
                libc::close(fd);
            }
            return Err(e.into());
        }

        self.interfaces.push(CANInterface {
            fd,
            ifindex,
            name: name.clone(),
            errorhandler: InterfaceErrorHandler::new(&name, restart),
        });

        // reception starts with set_normal()
        self.disable_rx()
    }

    fn configure_socket(
        fd: RawFd,
        ifindex: u32,
        name: &str,
        err_mask_all: bool,
    ) -> Result<(), DriverError> {
        // socket rx queue overflow detection
        let on: libc::c_int = 1;
        util::set_socket_option(fd, libc::SOL_SOCKET, SO_RXQ_OVFL, &on)?;

        // software timestamps; hardware timestamping does not work
        // properly on all devices
        let flags: libc::c_int = SOF_TIMESTAMPING_SOFTWARE | SOF_TIMESTAMPING_RX_SOFTWARE;
        util::set_socket_option(fd, libc::SOL_SOCKET, SO_TIMESTAMPING, &flags)?;

        // the kernel reserves around 450 bytes per queued CAN message
        let mut bytes: libc::c_int = 0;
        let mut slen = size_of::<libc::c_int>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &mut bytes as *mut libc::c_int as *mut libc::c_void,
                &mut slen,
            )
        };
        if ret == 0 && slen == size_of::<libc::c_int>() as libc::socklen_t {
            info!(
                "{}: socket rx buffer {} bytes, ~{} frames",
                name,
                bytes,
                bytes / 446
            );
        }

        let addr = CANAddr::new(ifindex);
        let bind_result = unsafe {
            libc::bind(
                fd,
                &addr as *const CANAddr as *const libc::sockaddr,
                size_of::<CANAddr>() as u32,
            )
        };
        if bind_result == -1 {
            error!("{}: binding CAN socket failed", name);
            return Err(DriverError::Syscall(io::Error::last_os_error()));
        }

        // error frame generation; what is actually delivered depends on
        // the CAN kernel driver
        let err_mask: u32 = if err_mask_all {
            ERR_MASK
        } else {
            ERR_CLASS_ACK | ERR_CLASS_CRTL | ERR_CLASS_BUSOFF | ERR_CLASS_BUSERROR
        };
        util::set_socket_option(fd, SOL_CAN_RAW, CAN_RAW_ERR_FILTER, &err_mask)?;

        Ok(())
    }

    /// Install the configured filters and permit traffic.
    pub fn set_normal(&mut self) -> Result<(), DriverError> {
        self.normal = false;
        self.apply_filters()?;
        self.normal = true;
        Ok(())
    }

    /// Deregister and close all sockets; back to an inert module.
    pub fn disable(&mut self) {
        self.normal = false;
        for iface in self.interfaces.drain(..) {
            let _ = epoll_ctl(self.epoll_fd, EpollOp::EpollCtlDel, iface.fd, None);
            unsafe {
                libc::close(iface.fd);
            }
        }
    }

    /// Configure receive slot `index`: standard-frame `ident`/`mask` plus
    /// the RTR class bit, and the handler to run on a match. When the
    /// module is already in normal mode the kernel filters are re-applied
    /// immediately.
    pub fn rx_buffer_init(
        &mut self,
        index: usize,
        ident: u16,
        mask: u16,
        rtr: bool,
        callback: RxCallback,
    ) -> Result<(), DriverError> {
        if index >= self.rx.len() {
            return Err(DriverError::IllegalArgument);
        }

        let mut id = ident as u32 & SFF_MASK;
        if rtr {
            id |= RTR_FLAG;
        }
        // the mask always covers the frame-class bits so an unintended
        // class is never delivered
        let mask = (mask as u32 & SFF_MASK) | EFF_FLAG | RTR_FLAG;

        let buffer = &mut self.rx[index];
        buffer.filter = CANFilter::new(id, mask);
        buffer.callback = Some(callback);
        buffer.timestamp = None;
        buffer.ifindex = 0;

        self.filters[index] = CANFilter::new(id, mask);
        if self.normal {
            self.apply_filters()?;
        }
        Ok(())
    }

    /// Configure transmit slot `index` with its frame template.
    pub fn tx_buffer_init(
        &mut self,
        index: usize,
        ident: u16,
        rtr: bool,
        len: u8,
        sync_flag: bool,
    ) -> Result<(), DriverError> {
        if index >= self.tx.len() || len > 8 {
            return Err(DriverError::IllegalArgument);
        }

        let zeros = [0u8; 8];
        let frame = CANFrame::new(ident as u32 & SFF_MASK, &zeros[..len as usize], rtr, false)
            .map_err(|_| DriverError::IllegalArgument)?;

        // a pending frame in this slot is abandoned along with its flag
        if self.tx[index].buffer_full && self.tx_pending > 0 {
            self.tx_pending -= 1;
        }
        self.tx[index] = TxBuffer {
            frame,
            buffer_full: false,
            sync_flag,
            ifindex: 0,
        };
        Ok(())
    }

    /// The filters as they go to the kernel: unconfigured slots removed.
    fn active_filters(&self) -> Vec<CANFilter> {
        self.filters
            .iter()
            .filter(|f| !f.is_unconfigured())
            .cloned()
            .collect()
    }

    fn apply_filters(&mut self) -> Result<(), DriverError> {
        let active = self.active_filters();
        if active.is_empty() {
            return self.disable_rx();
        }

        let mut result = Ok(());
        for iface in &self.interfaces {
            let ret = unsafe {
                libc::setsockopt(
                    iface.fd,
                    SOL_CAN_RAW,
                    CAN_RAW_FILTER,
                    active.as_ptr() as *const libc::c_void,
                    (size_of::<CANFilter>() * active.len()) as libc::socklen_t,
                )
            };
            if ret < 0 {
                error!("{}: applying rx filters failed", iface.name);
                result = Err(DriverError::Syscall(io::Error::last_os_error()));
            }
        }
        result
    }

    /// A zero-length filter list makes the kernel deliver nothing.
    fn disable_rx(&mut self) -> Result<(), DriverError> {
        let mut result = Ok(());
        for iface in &self.interfaces {
            let ret = unsafe {
                libc::setsockopt(iface.fd, SOL_CAN_RAW, CAN_RAW_FILTER, std::ptr::null(), 0)
            };
            if ret < 0 {
                error!("{}: disabling rx failed", iface.name);
                result = Err(DriverError::Syscall(io::Error::last_os_error()));
            }
        }
        result
    }

    /// Send the frame of transmit slot `index`, non-blocking. Transient
    /// kernel rejection flags the buffer and returns [`DriverError::TxBusy`];
    /// the mainline tick retries via [`process`](Self::process). Interfaces
    /// in listen-only drop the frame silently.
    pub fn send(&mut self, index: usize) -> Result<(), DriverError> {
        if self.interfaces.is_empty() || index >= self.tx.len() {
            return Err(DriverError::IllegalArgument);
        }

        let overflowed = self.tx[index].buffer_full;
        let target = self.tx[index].ifindex;
        let frame = self.tx[index].frame;
        if overflowed {
            warn!("tx buffer {} still pending, frame {:#x} delayed", index, frame.id());
        }

        let mut result = Ok(());
        let mut busy = false;
        for iface in &mut self.interfaces {
            if target != 0 && target != iface.ifindex {
                continue;
            }

            match iface.errorhandler.before_tx() {
                InterfaceState::Active => {}
                InterfaceState::ListenOnly => continue,
                InterfaceState::BusOff => {
                    result = Err(DriverError::InvalidState);
                    continue;
                }
            }

            let n = unsafe {
                libc::send(
                    iface.fd,
                    &frame as *const CANFrame as *const libc::c_void,
                    size_of::<CANFrame>(),
                    libc::MSG_DONTWAIT,
                )
            };
            if n == size_of::<CANFrame>() as isize {
                continue;
            }

            let e = io::Error::last_os_error();
            match e.raw_os_error() {
                Some(libc::EINTR) | Some(libc::EAGAIN) | Some(libc::ENOBUFS) => busy = true,
                _ => {
                    warn!("{}: send of {:#x} failed: {}", iface.name, frame.id(), e);
                    iface.errorhandler.note_status(CanErrorStatus::TX_OVERFLOW);
                    result = Err(DriverError::Syscall(e));
                }
            }
        }

        let tx = &mut self.tx[index];
        if busy {
            if !tx.buffer_full {
                tx.buffer_full = true;
                self.tx_pending += 1;
            }
            result = Err(DriverError::TxBusy);
        } else if tx.buffer_full {
            tx.buffer_full = false;
            self.tx_pending -= 1;
        }

        // a pre-existing pending flag is an overflow, but only when this
        // attempt produced no verdict of its own
        if overflowed && result.is_ok() {
            return Err(DriverError::TxOverflow);
        }
        result
    }

    /// Mainline housekeeping: publish the error status of the first
    /// interface and retry one pending transmit buffer. At most one
    /// retransmission per call keeps the tick bounded; the retransmit
    /// fast-path deadline brings the next one forward.
    pub fn process(&mut self) {
        if self.interfaces.is_empty() {
            return;
        }

        self.status = self.interfaces[0].errorhandler.status();

        if self.tx_pending > 0 {
            let pending = self.tx.iter().position(|t| t.buffer_full);
            match pending {
                Some(index) => {
                    self.tx[index].buffer_full = false;
                    self.tx_pending -= 1;
                    let _ = self.send(index);
                }
                None => {
                    self.tx_pending = 0;
                }
            }
        }
    }

    /// Handle a multiplexer event that may belong to one of the module's
    /// sockets. Returns false when the descriptor is not ours. At most one
    /// frame is read; the multiplexer re-fires while more are queued.
    pub fn rx_from_event(&mut self, fd: RawFd, events: EpollFlags) -> bool {
        let pos = match self.interfaces.iter().position(|i| i.fd == fd) {
            Some(pos) => pos,
            None => return false,
        };

        if events.intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP) {
            // try to pull whatever made epoll flag the socket
            let mut frame = CANFrame::default();
            let n = unsafe {
                libc::recv(
                    fd,
                    &mut frame as *mut CANFrame as *mut libc::c_void,
                    size_of::<CANFrame>(),
                    libc::MSG_DONTWAIT,
                )
            };
            debug!(
                "{}: socket error/hangup event {:?}, recv {}",
                self.interfaces[pos].name, events, n
            );
            return true;
        }

        if !events.contains(EpollFlags::EPOLLIN) {
            debug!("{}: unexpected event {:?}", self.interfaces[pos].name, events);
            return true;
        }

        let mut frame = CANFrame::default();
        let (timestamp, dropped) = match Self::read_frame(fd, &mut frame) {
            Ok(meta) => meta,
            Err(e) => {
                self.interfaces[pos]
                    .errorhandler
                    .note_status(CanErrorStatus::RX_OVERFLOW);
                debug!("{}: recvmsg failed: {}", self.interfaces[pos].name, e);
                return true;
            }
        };

        if let Some(total) = dropped {
            if total > self.rx_drop_count {
                self.interfaces[pos]
                    .errorhandler
                    .note_status(CanErrorStatus::RX_OVERFLOW);
                warn!(
                    "{}: socket rx queue overflowed, {} frames dropped",
                    self.interfaces[pos].name, total
                );
            }
            self.rx_drop_count = total;
        }

        if !self.normal {
            return true;
        }

        if frame.is_error() {
            self.interfaces[pos].errorhandler.rx_error_frame(&frame);
        } else {
            self.interfaces[pos].errorhandler.rx_data_frame();
            let ifindex = self.interfaces[pos].ifindex;
            self.dispatch(&frame, timestamp, ifindex);
        }
        true
    }

    /// First matching receive buffer wins; a frame nobody wants is
    /// silently dropped. The linear scan is deliberate: the buffer count
    /// is small and cache resident.
    fn dispatch(
        &mut self,
        frame: &CANFrame,
        timestamp: Option<SystemTime>,
        ifindex: u32,
    ) -> Option<usize> {
        let ident = frame.ident_word();
        for (index, buffer) in self.rx.iter_mut().enumerate() {
            if buffer.filter.matches(ident) {
                if let Some(callback) = buffer.callback.as_mut() {
                    callback(frame);
                }
                buffer.timestamp = timestamp;
                buffer.ifindex = ifindex;
                return Some(index);
            }
        }
        None
    }

    /// Read one frame plus its ancillary data: the software receive
    /// timestamp and the kernel's cumulative drop counter.
    fn read_frame(
        fd: RawFd,
        frame: &mut CANFrame,
    ) -> io::Result<(Option<SystemTime>, Option<u32>)> {
        let mut iov = libc::iovec {
            iov_base: frame as *mut CANFrame as *mut libc::c_void,
            iov_len: size_of::<CANFrame>(),
        };
        let mut ctrl = [0u8; 128];
        let mut msgh: libc::msghdr = unsafe { std::mem::zeroed() };
        msgh.msg_iov = &mut iov;
        msgh.msg_iovlen = 1;
        msgh.msg_control = ctrl.as_mut_ptr() as *mut libc::c_void;
        msgh.msg_controllen = ctrl.len() as _;

        let n = unsafe { libc::recvmsg(fd, &mut msgh, 0) };
        if n != size_of::<CANFrame>() as isize {
            return Err(io::Error::last_os_error());
        }

        let mut timestamp = None;
        let mut dropped = None;
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msgh);
            while !cmsg.is_null() {
                if (*cmsg).cmsg_level == libc::SOL_SOCKET {
                    if (*cmsg).cmsg_type == SCM_TIMESTAMPING {
                        // [0] is the software stamp; system time, not monotonic
                        let ts: libc::timespec =
                            std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::timespec);
                        timestamp = Some(
                            UNIX_EPOCH + Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32),
                        );
                    } else if (*cmsg).cmsg_type == SO_RXQ_OVFL {
                        let total: u32 =
                            std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const u32);
                        dropped = Some(total);
                    }
                }
                cmsg = libc::CMSG_NXTHDR(&msgh, cmsg);
            }
        }

        Ok((timestamp, dropped))
    }
}

impl Drop for CANModule {
    fn drop(&mut self) {
        self.disable();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn module(rx: usize, tx: usize) -> CANModule {
        // no sockets involved; the epoll descriptor is never touched
        CANModule::new(rx, tx, -1)
    }

    fn recording_callback() -> (RxCallback, Arc<Mutex<Vec<(u32, Vec<u8>)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let cb: RxCallback = Box::new(move |frame: &CANFrame| {
            sink.lock().unwrap().push((frame.id(), frame.data().to_vec()));
        });
        (cb, seen)
    }

    #[test]
    fn dispatch_first_match_wins() {
        let mut m = module(3, 0);
        let (cb0, seen0) = recording_callback();
        let (cb1, seen1) = recording_callback();
        m.rx_buffer_init(0, 0x181, 0x7FF, false, cb0).unwrap();
        // overlapping, looser filter at a later index
        m.rx_buffer_init(1, 0x180, 0x780, false, cb1).unwrap();

        let frame = CANFrame::new(0x181, &[0xAA, 0xBB], false, false).unwrap();
        let hit = m.dispatch(&frame, Some(UNIX_EPOCH), 5);
        assert_eq!(hit, Some(0));
        assert_eq!(*seen0.lock().unwrap(), vec![(0x181, vec![0xAA, 0xBB])]);
        assert!(seen1.lock().unwrap().is_empty());

        assert_eq!(m.rx_buffer(0).unwrap().ifindex(), 5);
        assert_eq!(m.rx_buffer(0).unwrap().timestamp(), Some(UNIX_EPOCH));
    }

    #[test]
    fn dispatch_drops_unmatched_frames() {
        let mut m = module(2, 0);
        let (cb, seen) = recording_callback();
        m.rx_buffer_init(0, 0x181, 0x7FF, false, cb).unwrap();

        let frame = CANFrame::new(0x7FF, &[], false, false).unwrap();
        assert_eq!(m.dispatch(&frame, None, 1), None);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn rtr_class_is_not_crossed() {
        let mut m = module(1, 0);
        let (cb, seen) = recording_callback();
        // data-frame registration must not catch the RTR of the same id
        m.rx_buffer_init(0, 0x181, 0x7FF, false, cb).unwrap();

        let rtr = CANFrame::new(0x181, &[], true, false).unwrap();
        assert_eq!(m.dispatch(&rtr, None, 1), None);
        assert!(seen.lock().unwrap().is_empty());

        let data = CANFrame::new(0x181, &[1], false, false).unwrap();
        assert_eq!(m.dispatch(&data, None, 1), Some(0));
    }

    #[test]
    fn unconfigured_slots_are_suppressed_from_kernel_filters() {
        let mut m = module(4, 0);
        let (cb, _) = recording_callback();
        m.rx_buffer_init(2, 0x181, 0x7FF, false, cb).unwrap();

        let active = m.active_filters();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id(), 0x181);
        assert_eq!(active[0].mask(), 0x7FF | EFF_FLAG | RTR_FLAG);
    }

    #[test]
    fn no_filters_at_all_means_match_none() {
        let m = module(4, 0);
        assert!(m.active_filters().is_empty());
    }

    #[test]
    fn buffer_init_validates_index() {
        let mut m = module(1, 1);
        let (cb, _) = recording_callback();
        assert!(matches!(
            m.rx_buffer_init(1, 0x80, 0x7FF, false, cb),
            Err(DriverError::IllegalArgument)
        ));
        assert!(matches!(
            m.tx_buffer_init(1, 0x80, false, 2, false),
            Err(DriverError::IllegalArgument)
        ));
        assert!(matches!(
            m.tx_buffer_init(0, 0x80, false, 9, false),
            Err(DriverError::IllegalArgument)
        ));
    }

    #[test]
    fn tx_buffer_template() {
        let mut m = module(0, 2);
        m.tx_buffer_init(0, 0x201, false, 4, true).unwrap();
        {
            let tx = m.tx_buffer_mut(0).unwrap();
            assert!(tx.sync_flag());
            assert!(!tx.is_pending());
            tx.frame_mut().set_data(&[9, 8, 7, 6]).unwrap();
        }
        assert_eq!(m.tx_buffer_mut(0).unwrap().frame().data(), &[9, 8, 7, 6]);
        assert_eq!(m.tx_pending(), 0);
    }

    #[test]
    fn send_without_interfaces_is_an_argument_error() {
        let mut m = module(0, 1);
        m.tx_buffer_init(0, 0x80, false, 0, false).unwrap();
        assert!(matches!(m.send(0), Err(DriverError::IllegalArgument)));
    }
}
