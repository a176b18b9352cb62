//! A handful of tiny services exercising the library end to end, used by `russ`'s integration
//! tests and as runnable illustrations of building a service tree (spec.md §8 "Concrete
//! scenarios").

use std::os::fd::AsRawFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::path::PathBuf;

use russ::config::RussConfig;
use russ::server::Server;
use russ::server::ServerLoop;
use russ::server::Session;
use russ::svcnode::ServiceNode;
use russ::wire::exit::EXIT_SUCCESS;

fn pipe() -> (OwnedFd, OwnedFd) {
    let mut fds = [-1; 2];
    // SAFETY: `fds` is a 2-element stack array and `pipe` only writes into it.
    unsafe { libc::pipe(fds.as_mut_ptr()) };
    // SAFETY: both fds were just created by a successful `pipe(2)` call.
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}

/// Writes all of `data` to `fd`, looping over short writes. Returns `false` on the first error
/// (e.g. the peer closed its read end), matching how a pipe write surfaces `EPIPE`.
fn write_all_raw(fd: i32, data: &[u8]) -> bool {
    let mut off = 0usize;
    while off < data.len() {
        // SAFETY: `data[off..]` is a valid slice for the duration of the call; `write` only
        // reads it.
        let n = unsafe {
            libc::write(
                fd,
                data[off..].as_ptr() as *const libc::c_void,
                data.len() - off,
            )
        };
        if n <= 0 {
            return false;
        }
        off += n as usize;
    }
    true
}

/// `/echo`: hands the dialer a connected stdin/stdout pipe pair and echoes every byte written to
/// stdin back out stdout until the dialer closes its end, then exits success (spec.md §8 scenario
/// 1).
fn echo_handler(session: &mut Session) {
    let (stdin_read, stdin_write) = pipe();
    let (stdout_read, stdout_write) = pipe();
    session.set_user_fd(0, stdin_write);
    session.set_user_fd(1, stdout_read);
    if let Err(e) = session.answer() {
        log::warn!("echo: failed to answer: {e}");
        return;
    }

    let mut buf = [0u8; 65536];
    loop {
        // SAFETY: `buf` is a correctly-sized, exclusively-owned stack buffer.
        let n = unsafe {
            libc::read(
                stdin_read.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n <= 0 {
            break;
        }
        if !write_all_raw(stdout_write.as_raw_fd(), &buf[..n as usize]) {
            break;
        }
    }
    drop(stdin_read);
    drop(stdout_write);

    if let Err(e) = session.exit(EXIT_SUCCESS, "") {
        log::warn!("echo: failed to send exit record: {e}");
    }
}

/// `/exit`: exits immediately with the status named by the request's first argument (defaulting
/// to `0` if absent or unparseable), ignoring every other field (spec.md §8 scenario 2: "Dial
/// `/exit` with arg `7` ... client wait returns status 7").
fn exit_handler(session: &mut Session) {
    let status: i32 = session
        .request()
        .args
        .as_slice()
        .first()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    if let Err(e) = session.exit(status, format!("exit {status}")) {
        log::warn!("exit: failed to send exit record: {e}");
    }
}

/// `/discard`: reads stdin to EOF and discards it, reporting the total megabytes read on stderr
/// when the `--perf` attribute was supplied (spec.md §8 scenario 3).
fn discard_handler(session: &mut Session) {
    let (stdin_read, stdin_write) = pipe();
    let (stderr_read, stderr_write) = pipe();
    session.set_user_fd(0, stdin_write);
    session.set_user_fd(2, stderr_read);
    if let Err(e) = session.answer() {
        log::warn!("discard: failed to answer: {e}");
        return;
    }

    let report_perf = session
        .request()
        .attrs
        .as_slice()
        .iter()
        .any(|a| a == "--perf");

    let mut total: u64 = 0;
    let mut buf = [0u8; 65536];
    loop {
        // SAFETY: `buf` is a correctly-sized, exclusively-owned stack buffer.
        let n = unsafe {
            libc::read(
                stdin_read.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n <= 0 {
            break;
        }
        total += n as u64;
    }
    drop(stdin_read);

    if report_perf {
        let mb = total as f64 / (1024.0 * 1024.0);
        let message = format!("total (MB): {mb:.1}");
        write_all_raw(stderr_write.as_raw_fd(), message.as_bytes());
    }
    drop(stderr_write);

    if let Err(e) = session.exit(EXIT_SUCCESS, "") {
        log::warn!("discard: failed to send exit record: {e}");
    }
}

/// `/chargen`: streams the printable ASCII range `33..=126` cycling in 72-character lines until
/// the dialer closes its read end (spec.md §8 scenario 4).
fn chargen_handler(session: &mut Session) {
    let (stdout_read, stdout_write) = pipe();
    session.set_user_fd(1, stdout_read);
    if let Err(e) = session.answer() {
        log::warn!("chargen: failed to answer: {e}");
        return;
    }

    let mut next: u8 = 33;
    let mut line = Vec::with_capacity(73);
    loop {
        line.clear();
        for _ in 0..72 {
            line.push(next);
            next = if next >= 126 { 33 } else { next + 1 };
        }
        line.push(b'\n');
        if !write_all_raw(stdout_write.as_raw_fd(), &line) {
            break;
        }
    }
    drop(stdout_write);

    if let Err(e) = session.exit(EXIT_SUCCESS, "") {
        log::warn!("chargen: failed to send exit record: {e}");
    }
}

/// `/tree/a/*`: reports the wildcard-matched component name and the spath prefix the service
/// tree walk consumed (spec.md §8 scenario 5).
fn wildcard_handler(session: &mut Session) {
    let name = session
        .spath_prefix()
        .rsplit('/')
        .next()
        .unwrap_or("")
        .to_string();
    let message = format!("name={name}\nspath={}", session.spath_prefix());
    if let Err(e) = session.exit(EXIT_SUCCESS, message) {
        log::warn!("wildcard: failed to send exit record: {e}");
    }
}

/// Builds the service tree exposing `/echo`, `/exit`, `/discard`, `/chargen`, and a
/// `/tree/a/*` wildcard, matching spec.md §8's concrete scenarios.
pub fn demo_tree() -> ServiceNode {
    let mut root = ServiceNode::root();
    root.add_child(ServiceNode::new("echo").with_handler(echo_handler))
        .unwrap();
    root.add_child(ServiceNode::new("exit").with_handler(exit_handler))
        .unwrap();
    root.add_child(ServiceNode::new("discard").with_handler(discard_handler))
        .unwrap();
    root.add_child(ServiceNode::new("chargen").with_handler(chargen_handler))
        .unwrap();

    let mut tree = ServiceNode::new("tree");
    let mut a = ServiceNode::new("a");
    a.add_child(
        ServiceNode::new("*")
            .wildcard()
            .with_handler(wildcard_handler),
    )
    .unwrap();
    tree.add_child(a).unwrap();
    root.add_child(tree).unwrap();
    root
}

/// Announces [`demo_tree`] at `saddr` with [`ServerLoop::Thread`] and runs the accept loop on a
/// background thread, for tests that want a live server without a separate process. The server
/// runs until the process exits; the returned handle is for `join()` if the caller wants to
/// detect a crash.
pub fn spawn_demo_server(saddr: PathBuf) -> std::thread::JoinHandle<()> {
    let root = demo_tree();
    let server = Server::announce(saddr, 0o600, root, ServerLoop::Thread, RussConfig::default())
        .expect("failed to announce demo server");
    std::thread::spawn(move || {
        let _ = server.serve(|| false);
    })
}
