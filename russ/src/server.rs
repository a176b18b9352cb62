//! The service tree's runtime half: the per-request [`Session`], the [`Server`] that owns the
//! listening socket and root node, and the accept/dispatch loop (spec.md §4.5).

use std::os::fd::AsRawFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;
use std::os::unix::net::UnixListener;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;

use log::error;
use log::warn;

use russ_base::creds::Creds;
use russ_base::deadline::Deadline;

use crate::config::RussConfig;
use crate::connection::sconn::ServerConn;
use crate::error::Error;
use crate::error::Result;
use crate::svcnode::ServiceNode;
use crate::wire::exit::EXIT_CALL_FAILURE;
use crate::wire::exit::EXIT_FAILURE;
use crate::wire::exit::EXIT_SUCCESS;
use crate::wire::exit::EXIT_SYSTEM_FAILURE;
use crate::wire::sarray::SArray;
use crate::wire::ExitRecord;
use crate::wire::OpNum;
use crate::wire::Request;

/// Per-request, per-connection bundle passed to handlers (spec.md §3 "Session"): the accepted
/// connection, the decoded request, the matched node's spath prefix/remainder, and the last
/// path component's options.
pub struct Session {
    sconn: ServerConn,
    request: Request,
    spath_prefix: String,
    spath_remainder: String,
    component_options: SArray,
    exit_write: Option<OwnedFd>,
    answered: bool,
    deadline: Deadline,
}

impl Session {
    fn new(
        sconn: ServerConn,
        request: Request,
        spath_prefix: String,
        spath_remainder: String,
        component_options: SArray,
        deadline: Deadline,
    ) -> Session {
        Session {
            sconn,
            request,
            spath_prefix,
            spath_remainder,
            component_options,
            exit_write: None,
            answered: false,
            deadline,
        }
    }

    /// Builds a bare session for tests outside this module, with an empty spath prefix/remainder
    /// and no component options.
    #[cfg(test)]
    pub fn for_test(sconn: ServerConn, request: Request) -> Session {
        Session::new(
            sconn,
            request,
            String::from("/"),
            String::from("/"),
            SArray::new(),
            Deadline::from_timeout(None),
        )
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn spath_prefix(&self) -> &str {
        &self.spath_prefix
    }

    /// The portion of the dialed spath left unconsumed by the service-tree walk, always
    /// starting with `/` (spec.md §4.5 "Lookup").
    pub fn spath_remainder(&self) -> &str {
        &self.spath_remainder
    }

    pub fn component_options(&self) -> &SArray {
        &self.component_options
    }

    pub fn creds(&self) -> Creds {
        self.sconn.creds()
    }

    /// Stores `fd` as user descriptor `index` for the eventual answer.
    pub fn set_user_fd(&mut self, index: usize, fd: OwnedFd) {
        self.sconn.set_user_fd(index, fd);
    }

    fn exit_pipe() -> Result<(OwnedFd, OwnedFd)> {
        let mut fds = [-1; 2];
        // SAFETY: `fds` is a 2-element stack array and `pipe` only writes into it.
        let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if ret != 0 {
            return Err(Error::RussBase(russ_base::Error::Sys(
                std::io::Error::last_os_error(),
            )));
        }
        // SAFETY: both fds were just created by a successful `pipe(2)` call.
        Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
    }

    /// Sends the accumulated user descriptors plus a fresh exit pipe back to the client,
    /// retaining the pipe's write end for [`Self::exit`]/[`Self::fatal`] (spec.md §4.5 step 4).
    /// A second call is a no-op: this is what lets the dispatcher auto-answer before invoking a
    /// handler that may also answer explicitly.
    pub fn answer(&mut self) -> Result<()> {
        if self.answered {
            return Ok(());
        }
        let (exit_read, exit_write) = Self::exit_pipe()?;
        self.sconn.answer(exit_read, self.deadline)?;
        self.exit_write = Some(exit_write);
        self.answered = true;
        Ok(())
    }

    /// Like [`Self::answer`], but sends `exit_fd` (received from an inner dial) in place of a
    /// freshly created pipe, so the exit record this session eventually reports is whatever the
    /// inner connection's server writes — not one this process produces itself (spec.md §4.7
    /// "sconn_splice": "exit status is forwarded verbatim"). No local write end is retained.
    pub fn answer_with_exit_fd(&mut self, exit_fd: OwnedFd) -> Result<()> {
        if self.answered {
            return Ok(());
        }
        self.sconn.answer(exit_fd, self.deadline)?;
        self.answered = true;
        Ok(())
    }

    /// Auto-answers if not already done, writes an exit record, and closes the exit fd, which
    /// is the client's termination signal (spec.md §4.4).
    pub fn exit(&mut self, status: i32, message: impl Into<String>) -> Result<()> {
        self.answer()?;
        if let Some(fd) = self.exit_write.take() {
            ExitRecord::new(status, message).write_deadline(&fd, self.deadline)?;
        }
        Ok(())
    }

    /// Convenience for the common "something went wrong, tell the client and stop" case (spec.md
    /// §7 "sconn_fatal"): exits with [`EXIT_SYSTEM_FAILURE`] and `message`.
    pub fn fatal(&mut self, message: impl Into<String>) -> Result<()> {
        self.exit(EXIT_SYSTEM_FAILURE, message)
    }
}

/// Which admission policy governs a [`Server`]'s accept loop (spec.md §4.5 "Server loop").
pub enum ServerLoop {
    /// Accept in the parent; fork twice so the grandchild runs the handler and the parent never
    /// waits on it directly.
    Fork,
    /// Accept, then spawn a `std::thread` per connection, sharing the immutable service tree.
    Thread,
}

/// The root service node, the listening socket, and the policy knobs that govern a running
/// server (spec.md §3 "Server").
pub struct Server {
    root: Arc<ServiceNode>,
    listener: UnixListener,
    saddr: PathBuf,
    config: RussConfig,
    discipline: ServerLoop,
    master_pid: libc::pid_t,
    created_at: SystemTime,
    help_text: Option<String>,
    allowrootuser: bool,
    autoswitchuser: bool,
    matchclientuser: bool,
    closeonaccept: bool,
}

impl Server {
    /// Binds `saddr` via [`russ_base::socket::announce`] and builds a server bound to it with
    /// the library's default policy (no root, no user switching, no peer-matching, not
    /// close-on-accept).
    pub fn announce(
        saddr: PathBuf,
        mode: u32,
        root: ServiceNode,
        discipline: ServerLoop,
        config: RussConfig,
    ) -> Result<Server> {
        let listener = russ_base::socket::announce(&saddr, mode, None, None)?;
        Ok(Server {
            root: Arc::new(root),
            listener,
            saddr,
            config,
            discipline,
            // SAFETY: getpid never fails.
            master_pid: unsafe { libc::getpid() },
            created_at: SystemTime::now(),
            help_text: None,
            allowrootuser: false,
            autoswitchuser: false,
            matchclientuser: false,
            closeonaccept: false,
        })
    }

    /// Wraps an already-listening socket, e.g. one inherited as fd 3 by supervisor convention
    /// (spec.md §6 "Listening socket inheritance").
    pub fn from_listener(
        listener: UnixListener,
        saddr: PathBuf,
        root: ServiceNode,
        discipline: ServerLoop,
        config: RussConfig,
    ) -> Server {
        Server {
            root: Arc::new(root),
            listener,
            saddr,
            config,
            discipline,
            // SAFETY: getpid never fails.
            master_pid: unsafe { libc::getpid() },
            created_at: SystemTime::now(),
            help_text: None,
            allowrootuser: false,
            autoswitchuser: false,
            matchclientuser: false,
            closeonaccept: false,
        }
    }

    pub fn help(mut self, text: impl Into<String>) -> Server {
        self.help_text = Some(text.into());
        self
    }

    pub fn allowrootuser(mut self, v: bool) -> Server {
        self.allowrootuser = v;
        self
    }

    pub fn autoswitchuser(mut self, v: bool) -> Server {
        self.autoswitchuser = v;
        self
    }

    pub fn matchclientuser(mut self, v: bool) -> Server {
        self.matchclientuser = v;
        self
    }

    pub fn closeonaccept(mut self, v: bool) -> Server {
        self.closeonaccept = v;
        self
    }

    /// Runs the accept loop until `shutdown` (checked between accepts) returns `true`, or
    /// forever if it never does. Respects `accept_timeout` from the server's [`RussConfig`]
    /// between accepts so the loop can poll `shutdown` periodically.
    pub fn serve(&self, shutdown: impl Fn() -> bool) -> Result<()> {
        loop {
            if shutdown() {
                return Ok(());
            }
            let accept_deadline = Deadline::from_timeout(Some(self.config.accept_timeout));
            let sock = match self.accept(accept_deadline) {
                Ok(sock) => sock,
                Err(Error::RussBase(russ_base::Error::DeadlineExpired)) => continue,
                Err(e) => return Err(e),
            };

            match self.discipline {
                ServerLoop::Fork => self.handle_forked(sock),
                ServerLoop::Thread => self.handle_threaded(sock),
            }

            if self.closeonaccept {
                return Ok(());
            }
        }
    }

    fn accept(&self, deadline: Deadline) -> Result<UnixStream> {
        russ_base::fd::poll_status(&self.listener, libc::POLLIN, deadline)?;
        let (sock, _addr) = self.listener.accept().map_err(russ_base::Error::Sys)?;
        Ok(sock)
    }

    fn handle_forked(&self, sock: UnixStream) {
        let root = Arc::clone(&self.root);
        let config = self.config.clone();
        let policy = self.policy();
        let listener_fd = self.listener.as_raw_fd();
        // SAFETY: the parent process is not known to be multi-threaded by this crate; callers
        // embedding this in a multi-threaded process must pick `ServerLoop::Thread` instead.
        let middle = unsafe {
            russ_base::process::fork_process(move || {
                // SAFETY: same contract as the outer fork; the middle process is freshly forked
                // and single-threaded.
                let grandchild = unsafe {
                    russ_base::process::fork_process(move || {
                        close_listener_copy(listener_fd);
                        if let Err(e) = russ_base::process::detach_session() {
                            warn!("failed to detach worker session: {e}");
                        }
                        run_worker_dispatch(root, sock, config, policy);
                    })
                };
                match grandchild {
                    Ok(child) => {
                        child.into_pid();
                    }
                    Err(e) => error!("failed to fork worker: {e}"),
                }
            })
        };
        match middle {
            Ok(child) => {
                if let Err(e) = child.wait() {
                    warn!("failed to reap middle fork: {e}");
                }
            }
            Err(e) => error!("failed to fork dispatch middleman: {e}"),
        }
    }

    fn handle_threaded(&self, sock: UnixStream) {
        let root = Arc::clone(&self.root);
        let config = self.config.clone();
        let policy = self.policy();
        std::thread::spawn(move || {
            dispatch(&root, sock, &config, &policy);
        });
    }

    fn policy(&self) -> DispatchPolicy {
        DispatchPolicy {
            allowrootuser: self.allowrootuser,
            autoswitchuser: self.autoswitchuser,
            matchclientuser: self.matchclientuser,
            help_text: self.help_text.clone(),
            saddr: self.saddr.clone(),
            master_pid: self.master_pid,
            created_at: self.created_at,
        }
    }
}

#[derive(Clone)]
struct DispatchPolicy {
    allowrootuser: bool,
    autoswitchuser: bool,
    matchclientuser: bool,
    help_text: Option<String>,
    saddr: PathBuf,
    master_pid: libc::pid_t,
    created_at: SystemTime,
}

/// Closes this process's copy of the listening socket's fd: a forked worker must not hold the
/// listener open, or accept-able connections pile up behind a descriptor nobody is polling
/// (spec.md §5 "explicit close of the listening socket in the worker is mandatory").
fn close_listener_copy(fd: RawFd) {
    // SAFETY: `fd` names this (forked, single-threaded at this point) process's own copy of the
    // listener descriptor; closing it does not affect the parent's distinct fd table entry.
    unsafe {
        libc::close(fd);
    }
}

fn run_worker_dispatch(
    root: Arc<ServiceNode>,
    sock: UnixStream,
    config: RussConfig,
    policy: DispatchPolicy,
) {
    dispatch(&root, sock, &config, &policy);
}

/// Runs the full dispatch sequence for one accepted connection (spec.md §4.5 "Dispatch",
/// steps 1-7). Errors detected before a handler runs are reported as a fatal exit record when
/// possible; I/O failures that prevent even that are only logged.
fn dispatch(root: &ServiceNode, sock: UnixStream, config: &RussConfig, policy: &DispatchPolicy) {
    let sconn = match ServerConn::accept(sock) {
        Ok(sconn) => sconn,
        Err(e) => {
            warn!("failed to accept connection: {e}");
            return;
        }
    };
    let deadline = Deadline::from_timeout(Some(config.await_timeout));
    let request = match sconn.await_request(deadline) {
        Ok(r) => r,
        Err(e) => {
            warn!("failed to read request: {e}");
            return;
        }
    };

    if let Err(e) = dispatch_request(root, sconn, request, config, policy, deadline) {
        warn!("dispatch failed: {e}");
    }
}

fn dispatch_request(
    root: &ServiceNode,
    sconn: ServerConn,
    request: Request,
    config: &RussConfig,
    policy: &DispatchPolicy,
    deadline: Deadline,
) -> Result<()> {
    // Step 1: reject an unrecognized operation.
    if request.opnum() == OpNum::NotSet {
        let err = Error::BadOp(request.op.clone());
        return fatal_before_answer(sconn, deadline, EXIT_FAILURE, &err.to_string());
    }

    // Step 2: reject a non-absolute spath.
    if !request.spath.starts_with('/') {
        let err = Error::BadSpath(request.spath.clone());
        return fatal_before_answer(sconn, deadline, EXIT_FAILURE, &err.to_string());
    }

    // Step 5 (policy half): root is denied unless explicitly allowed, before the node's handler
    // ever runs.
    let creds = sconn.creds();
    if creds.uid == 0 && !policy.allowrootuser {
        let err = Error::PolicyDenied(String::from("root is not allowed"));
        return fatal_before_answer(sconn, deadline, EXIT_CALL_FAILURE, &err.to_string());
    }

    // Step 3: look up the node.
    let (node, prefix, remainder) = root.find(&request.spath);
    let last_component = prefix.rsplit('/').next().unwrap_or("");
    let (_name, options) = crate::spath::split_component_options(last_component);

    let mut session = Session::new(sconn, request, prefix, remainder, options, deadline);

    // Step 4: auto-answer before the handler runs, unless it opted out.
    if node.autoanswer_enabled() {
        session.answer()?;
    }

    // Step 5 (switch half): adopt the peer's uid/gid before running the handler.
    if policy.autoswitchuser {
        if let Err(e) = russ_base::user::switch_user(creds.uid, creds.gid, None) {
            return session.fatal(format!("cannot switch user: {e}"));
        }
    }

    // Step 6: invoke the handler, if any.
    let had_handler = node.handler().is_some();
    if let Some(handler) = node.handler() {
        handler(&mut session);
    }

    // Step 7: default fallback when the handler (or lack of one) did not exit.
    if session.exit_write.is_some() || !session.answered {
        default_fallback(node, &mut session, policy, had_handler)?;
    }
    Ok(())
}

fn fatal_before_answer(
    mut sconn: ServerConn,
    deadline: Deadline,
    status: i32,
    message: &str,
) -> Result<()> {
    let (exit_read, exit_write) = Session::exit_pipe()?;
    sconn.answer(exit_read, deadline)?;
    ExitRecord::new(status, message).write_deadline(&exit_write, deadline)?;
    Ok(())
}

fn default_fallback(
    node: &ServiceNode,
    session: &mut Session,
    policy: &DispatchPolicy,
    had_handler: bool,
) -> Result<()> {
    if node.is_virtual() {
        return session.exit(EXIT_FAILURE, "no handler for virtual node");
    }

    match session.request().opnum() {
        OpNum::List if !node.is_wildcard() => {
            let names: Vec<&str> = node.children().iter().map(ServiceNode::name).collect();
            session.exit(EXIT_SUCCESS, names.join("\n"))
        }
        OpNum::Help => {
            let text = policy.help_text.clone().unwrap_or_default();
            session.exit(EXIT_SUCCESS, text)
        }
        OpNum::Info if !policy.matchclientuser || session.creds().uid == unsafe { libc::getuid() } => {
            let hostname = hostname();
            let uptime = policy
                .created_at
                .elapsed()
                .unwrap_or(Duration::ZERO)
                .as_secs();
            let info = format!(
                "host={hostname}\naddr={}\nmasterpid={}\nuptimesecs={uptime}\npid={}",
                policy.saddr.display(),
                policy.master_pid,
                unsafe { libc::getpid() },
            );
            session.exit(EXIT_SUCCESS, info)
        }
        OpNum::Info => session.exit(EXIT_CALL_FAILURE, "info is restricted to the same uid"),
        _ if had_handler => session.exit(EXIT_SYSTEM_FAILURE, Error::NoExit.to_string()),
        _ => {
            let err = Error::BadOp(session.request().op.clone());
            session.exit(EXIT_FAILURE, err.to_string())
        }
    }
}

fn hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: `buf` is a correctly-sized stack buffer and the return value is checked.
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if ret != 0 {
        return String::from("unknown");
    }
    let nul = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..nul]).into_owned()
}
