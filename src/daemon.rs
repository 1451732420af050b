//! Single-threaded readiness-driven server loop
//!
//! One `poll(2)` set covers the listener plus every open connection. Each
//! iteration blocks until something is readable, accepts pending
//! connections, and drives each readable connection's state machine exactly
//! once. No connection can starve another beyond the cost of one field-read.
//! The connection map is only touched from this thread, so there is nothing
//! to lock.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::TcpListener;
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::Arc;

use crate::logger::Logger;
use crate::server::{Connection, Event};

/// Bind and serve forever. Setup failures are fatal; everything after that
/// is isolated to the connection it happened on.
pub fn serve(bind: &str, root: &Path, log: Arc<dyn Logger>) -> Result<()> {
    let listener = TcpListener::bind(bind).with_context(|| format!("bind {}", bind))?;
    serve_on(listener, root, log)
}

/// Serve on an already-bound listener; used by tests that need the port
/// before the loop starts.
pub fn serve_on(listener: TcpListener, root: &Path, log: Arc<dyn Logger>) -> Result<()> {
    listener.set_nonblocking(true).context("set listener non-blocking")?;
    let listen_fd = listener.as_raw_fd();
    let mut conns: HashMap<RawFd, Connection> = HashMap::new();

    loop {
        let mut fds: Vec<libc::pollfd> = Vec::with_capacity(1 + conns.len());
        fds.push(libc::pollfd {
            fd: listen_fd,
            events: libc::POLLIN,
            revents: 0,
        });
        for &fd in conns.keys() {
            fds.push(libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            });
        }

        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
        if rc < 0 {
            let e = std::io::Error::last_os_error();
            if e.kind() == ErrorKind::Interrupted {
                continue;
            }
            return Err(e).context("poll");
        }

        for pfd in &fds {
            if pfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) == 0 {
                continue;
            }
            if pfd.fd == listen_fd {
                accept_pending(&listener, &mut conns, log.as_ref());
            } else {
                drive_connection(pfd.fd, &mut conns, root, log.as_ref());
            }
        }
    }
}

fn accept_pending(
    listener: &TcpListener,
    conns: &mut HashMap<RawFd, Connection>,
    log: &dyn Logger,
) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nonblocking(true) {
                    log.error("accept", &peer.to_string(), &e.to_string());
                    continue;
                }
                let peer = peer.to_string();
                log.connect(&peer);
                conns.insert(stream.as_raw_fd(), Connection::new(stream, peer));
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                log.error("accept", "-", &e.to_string());
                break;
            }
        }
    }
}

fn drive_connection(
    fd: RawFd,
    conns: &mut HashMap<RawFd, Connection>,
    root: &Path,
    log: &dyn Logger,
) {
    let conn = match conns.get_mut(&fd) {
        Some(c) => c,
        None => return,
    };
    match conn.handle_readable(root, log) {
        Ok(Event::Continue) => {}
        Ok(Event::Reply(verdict)) => {
            if let Err(e) = conn.send_verdict(verdict) {
                let peer = conn.peer().to_string();
                log.error("reply", &peer, &e.to_string());
                log.close(&peer);
                conns.remove(&fd);
            }
        }
        Ok(Event::Closed) => {
            let peer = conn.peer().to_string();
            log.close(&peer);
            conns.remove(&fd);
        }
        Err(e) => {
            let peer = conn.peer().to_string();
            log.error("connection", &peer, &e.to_string());
            log.close(&peer);
            conns.remove(&fd);
        }
    }
}
