//! The reactor: one thread owning the listen socket, the epoll instance,
//! the timer heap and the connection registry.
//!
//! Readiness events are dispatched to the worker pool; workers re-arm the
//! one-shot fd themselves through `Epoller::modify` when their task ends,
//! so a connection never has two outstanding tasks.

use std::collections::HashMap;
use std::mem;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nocturne_mysql::{MysqlConfig, SqlPool};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::conn::{ConnContext, HttpConn};
use crate::epoll::{Epoller, Event, EV_ERR, EV_ET, EV_HUP, EV_IN, EV_ONESHOT, EV_OUT, EV_RDHUP};
use crate::error::{ServerError, ServerResult};
use crate::pool::ThreadPool;
use crate::timer::HeapTimer;

/// Hard cap on concurrently served connections.
pub const MAX_FD: usize = 65536;

const MAX_EVENTS: usize = 1024;
const LISTEN_BACKLOG: libc::c_int = libc::SOMAXCONN;

pub struct WebServer {
    listen_fd: RawFd,
    timeout: Duration,
    listen_event: u32,
    conn_event: u32,
    timer: HeapTimer,
    pool: ThreadPool,
    epoller: Arc<Epoller>,
    users: HashMap<RawFd, Arc<Mutex<HttpConn>>>,
    ctx: Arc<ConnContext>,
    events: Vec<Event>,
}

impl WebServer {
    pub fn new(config: &Config) -> ServerResult<Self> {
        let src_dir = std::env::current_dir()?.join("resources");

        let sql_config = MysqlConfig::new(
            &config.sql_host,
            config.sql_port,
            &config.sql_user,
            &config.sql_password,
            &config.db_name,
        );
        let db = match SqlPool::connect(&sql_config, config.conn_pool_size) {
            Ok(pool) => pool,
            Err(e) => {
                // Static files keep working; authentication will fail closed.
                warn!("database pool init failed, auth disabled: {}", e);
                SqlPool::empty()
            }
        };

        let (listen_event, conn_event) = event_mode(config.trig_mode);
        let ctx = Arc::new(ConnContext::new(
            src_dir.clone(),
            conn_event & EV_ET != 0,
            db,
        ));

        let epoller = Arc::new(Epoller::new().map_err(ServerError::Poller)?);
        let listen_fd = init_socket(config.port, config.open_linger)?;
        epoller
            .add(listen_fd, listen_event | EV_IN)
            .map_err(ServerError::Poller)?;
        set_fd_nonblock(listen_fd)?;

        info!(
            "server init: port {}, linger {}, listen {}, conn {}, src dir {}, sql pool {}, {} workers",
            config.port,
            config.open_linger,
            if listen_event & EV_ET != 0 { "ET" } else { "LT" },
            if conn_event & EV_ET != 0 { "ET" } else { "LT" },
            src_dir.display(),
            ctx.db.free_count(),
            config.thread_num,
        );

        Ok(Self {
            listen_fd,
            timeout: config.timeout(),
            listen_event,
            conn_event,
            timer: HeapTimer::new(),
            pool: ThreadPool::new(config.thread_num),
            epoller,
            users: HashMap::new(),
            ctx,
            events: vec![Event::zeroed(); MAX_EVENTS],
        })
    }

    /// The reactor loop. Runs until the process is killed.
    pub fn run(&mut self) {
        info!("server start");
        loop {
            let timeout_ms = if self.timeout.is_zero() {
                -1
            } else {
                let next = self.timer.next_tick_ms();
                next.min(i32::MAX as i64) as i32
            };

            let n = match self.epoller.wait(&mut self.events, timeout_ms) {
                Ok(n) => n,
                Err(e) => {
                    error!("epoll wait failed: {}", e);
                    continue;
                }
            };

            for i in 0..n {
                let fd = self.events[i].fd();
                let mask = self.events[i].mask();

                if fd == self.listen_fd {
                    self.deal_listen();
                } else if mask & (EV_RDHUP | EV_HUP | EV_ERR) != 0 {
                    if let Some(conn) = self.users.get(&fd) {
                        let mut c = conn.lock().unwrap();
                        self.epoller.remove(c.fd()).ok();
                        c.close();
                    }
                } else if mask & EV_IN != 0 {
                    self.deal_read(fd);
                } else if mask & EV_OUT != 0 {
                    self.deal_write(fd);
                } else {
                    error!("unexpected event 0x{:x} on fd {}", mask, fd);
                }
            }
        }
    }

    fn deal_listen(&mut self) {
        loop {
            let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
            let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
            let fd = unsafe {
                libc::accept(
                    self.listen_fd,
                    &mut addr as *mut _ as *mut libc::sockaddr,
                    &mut len,
                )
            };
            if fd <= 0 {
                return;
            }
            if self.ctx.user_count.load(std::sync::atomic::Ordering::Relaxed) >= MAX_FD {
                send_error(fd, b"Server busy!");
                warn!("clients are full, rejecting fd {}", fd);
                return;
            }
            self.add_client(fd, sockaddr_to_peer(&addr));
            if self.listen_event & EV_ET == 0 {
                return;
            }
        }
    }

    fn add_client(&mut self, fd: RawFd, addr: SocketAddr) {
        let conn = Arc::new(Mutex::new(HttpConn::new(Arc::clone(&self.ctx))));
        conn.lock().unwrap().init(fd, addr);
        // A reused fd replaces the stale registry entry for it.
        self.users.insert(fd, Arc::clone(&conn));

        if !self.timeout.is_zero() {
            let cb_conn = Arc::clone(&conn);
            let cb_epoller = Arc::clone(&self.epoller);
            self.timer.add(
                fd,
                self.timeout,
                Box::new(move || {
                    let mut c = cb_conn.lock().unwrap();
                    if !c.is_closed() {
                        cb_epoller.remove(c.fd()).ok();
                        c.close();
                    }
                }),
            );
        }

        if let Err(e) = self.epoller.add(fd, EV_IN | self.conn_event) {
            warn!("failed to register client fd {}: {}", fd, e);
            conn.lock().unwrap().close();
            return;
        }
        if let Err(e) = set_fd_nonblock(fd) {
            warn!("failed to set fd {} non-blocking: {}", fd, e);
        }
    }

    fn deal_read(&mut self, fd: RawFd) {
        let conn = match self.users.get(&fd) {
            Some(conn) => Arc::clone(conn),
            None => return,
        };
        self.extent_time(fd);
        let epoller = Arc::clone(&self.epoller);
        let conn_event = self.conn_event;
        self.pool.submit(move || on_read(conn, epoller, conn_event));
    }

    fn deal_write(&mut self, fd: RawFd) {
        let conn = match self.users.get(&fd) {
            Some(conn) => Arc::clone(conn),
            None => return,
        };
        self.extent_time(fd);
        let epoller = Arc::clone(&self.epoller);
        let conn_event = self.conn_event;
        self.pool.submit(move || on_write(conn, epoller, conn_event));
    }

    fn extent_time(&mut self, fd: RawFd) {
        if !self.timeout.is_zero() {
            self.timer.adjust(fd, self.timeout);
        }
    }
}

impl Drop for WebServer {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.listen_fd);
        }
    }
}

/// Worker task for a read-ready connection.
fn on_read(conn: Arc<Mutex<HttpConn>>, epoller: Arc<Epoller>, conn_event: u32) {
    let mut c = conn.lock().unwrap();
    if c.is_closed() {
        return;
    }
    match c.read() {
        // EOF: the peer is done sending.
        Ok(0) => {
            epoller.remove(c.fd()).ok();
            c.close();
            return;
        }
        Ok(_) => {}
        // Spurious wakeup; re-arm via the process path below.
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
        Err(_) => {
            epoller.remove(c.fd()).ok();
            c.close();
            return;
        }
    }
    on_process(&mut c, &epoller, conn_event);
}

/// Parse + build, then re-arm for whichever direction comes next.
fn on_process(c: &mut HttpConn, epoller: &Epoller, conn_event: u32) {
    let interest = if c.process() { EV_OUT } else { EV_IN };
    if epoller.modify(c.fd(), conn_event | interest).is_err() {
        epoller.remove(c.fd()).ok();
        c.close();
    }
}

/// Worker task for a write-ready connection.
fn on_write(conn: Arc<Mutex<HttpConn>>, epoller: Arc<Epoller>, conn_event: u32) {
    let mut c = conn.lock().unwrap();
    if c.is_closed() {
        return;
    }
    let ret = c.write();
    if c.to_write_bytes() == 0 {
        // Response fully drained.
        if c.is_keep_alive() {
            on_process(&mut c, &epoller, conn_event);
            return;
        }
    } else {
        // Partial transfer (short write or EAGAIN): keep the write
        // interest armed. Only a hard error falls through to close.
        let fatal = matches!(&ret, Err(e) if e.kind() != std::io::ErrorKind::WouldBlock);
        if !fatal && epoller.modify(c.fd(), conn_event | EV_OUT).is_ok() {
            return;
        }
    }
    epoller.remove(c.fd()).ok();
    c.close();
}

/// Trigger-mode table: listen always watches peer-shutdown, connections are
/// always one-shot; mode selects edge-triggering per side (3 = both, default).
fn event_mode(trig_mode: u8) -> (u32, u32) {
    let mut listen_event = EV_RDHUP;
    let mut conn_event = EV_ONESHOT | EV_RDHUP;
    match trig_mode {
        0 => {}
        1 => conn_event |= EV_ET,
        2 => listen_event |= EV_ET,
        _ => {
            listen_event |= EV_ET;
            conn_event |= EV_ET;
        }
    }
    (listen_event, conn_event)
}

fn init_socket(port: u16, open_linger: bool) -> ServerResult<RawFd> {
    if port < 1024 {
        return Err(ServerError::InvalidPort(port));
    }

    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(ServerError::Socket(std::io::Error::last_os_error()));
        }

        // Graceful close: block up to 1s on close to flush pending data.
        let linger = libc::linger {
            l_onoff: if open_linger { 1 } else { 0 },
            l_linger: if open_linger { 1 } else { 0 },
        };
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &linger as *const _ as *const libc::c_void,
            mem::size_of_val(&linger) as libc::socklen_t,
        ) < 0
        {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(ServerError::Socket(err));
        }

        let optval: libc::c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &optval as *const _ as *const libc::c_void,
            mem::size_of_val(&optval) as libc::socklen_t,
        ) < 0
        {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(ServerError::Socket(err));
        }

        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: libc::INADDR_ANY.to_be(),
            },
            sin_zero: [0; 8],
        };
        if libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            mem::size_of_val(&addr) as libc::socklen_t,
        ) < 0
        {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(ServerError::Socket(err));
        }

        if libc::listen(fd, LISTEN_BACKLOG) < 0 {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(ServerError::Socket(err));
        }

        Ok(fd)
    }
}

fn set_fd_nonblock(fd: RawFd) -> std::io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Send a short plaintext refusal and close the socket.
fn send_error(fd: RawFd, msg: &[u8]) {
    unsafe {
        let n = libc::send(fd, msg.as_ptr() as *const libc::c_void, msg.len(), 0);
        if n < 0 {
            warn!("failed to send refusal to client fd {}", fd);
        }
        libc::close(fd);
    }
}

fn sockaddr_to_peer(addr: &libc::sockaddr_in) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)),
        u16::from_be(addr.sin_port),
    ))
}
