//! End-to-end coverage of spec.md §8's concrete scenarios, dialing a live [`Server`] built from
//! `russ-demos`'s service tree rather than driving individual modules in isolation.

use std::os::unix::net::UnixListener;

use russ::connection::ClientConn;
use russ::server::Server;
use russ::server::ServerLoop;
use russ::wire::Request;
use russ::wire::WaitOutcome;
use russ_base::deadline::Deadline;
use russ_base::deadline::NEVER;

fn socket_path(dir: &tempfile::TempDir, name: &str) -> std::path::PathBuf {
    dir.path().join(name)
}

#[test]
fn echo_dial_round_trips_a_line() {
    let dir = tempfile::tempdir().unwrap();
    let saddr = socket_path(&dir, "echo.sock");
    let _server = russ_demos::spawn_demo_server(saddr.clone());
    // Give the accept loop's background thread a moment to start listening.
    std::thread::sleep(std::time::Duration::from_millis(50));

    let req = Request::new("execute", "/echo");
    let mut conn = ClientConn::dial(&saddr, &req, NEVER).unwrap();
    let stdin = conn.user_fd(0).unwrap();
    let stdout = conn.user_fd(1).unwrap();

    let msg = b"hello\n";
    // SAFETY: `msg` is a valid slice for the duration of the call; `write` only reads it.
    let n = unsafe { libc::write(stdin, msg.as_ptr() as *const libc::c_void, msg.len()) };
    assert_eq!(n as usize, msg.len());
    conn.take_user_fd(0); // closes stdin, signaling EOF to the echo handler

    let mut buf = [0u8; 64];
    let mut total = Vec::new();
    loop {
        // SAFETY: `buf` is a correctly-sized stack buffer.
        let n = unsafe { libc::read(stdout, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n <= 0 {
            break;
        }
        total.extend_from_slice(&buf[..n as usize]);
        if total.len() >= msg.len() {
            break;
        }
    }
    assert_eq!(total, msg);

    let (outcome, record) = conn.wait(NEVER).unwrap();
    assert_eq!(outcome, WaitOutcome::Ok);
    assert_eq!(record.unwrap().status, 0);
}

#[test]
fn exit_reports_requested_status() {
    let dir = tempfile::tempdir().unwrap();
    let saddr = socket_path(&dir, "exit.sock");
    let _server = russ_demos::spawn_demo_server(saddr.clone());
    std::thread::sleep(std::time::Duration::from_millis(50));

    let mut req = Request::new("execute", "/exit");
    req.args.append("7".to_string());
    let mut conn = ClientConn::dial(&saddr, &req, NEVER).unwrap();
    let (outcome, record) = conn.wait(NEVER).unwrap();
    assert_eq!(outcome, WaitOutcome::Ok);
    assert_eq!(record.unwrap().status, 7);
}

#[test]
fn discard_reports_total_megabytes_with_perf_attribute() {
    let dir = tempfile::tempdir().unwrap();
    let saddr = socket_path(&dir, "discard.sock");
    let _server = russ_demos::spawn_demo_server(saddr.clone());
    std::thread::sleep(std::time::Duration::from_millis(50));

    let mut req = Request::new("execute", "/discard");
    req.attrs.append("--perf".to_string());
    let mut conn = ClientConn::dial(&saddr, &req, NEVER).unwrap();
    let stdin = conn.user_fd(0).unwrap();
    let stderr = conn.user_fd(2).unwrap();

    let chunk = vec![0u8; 65536];
    let mut written: u64 = 0;
    while written < 8 * 1024 * 1024 {
        // SAFETY: `chunk` is a valid slice for the duration of the call.
        let n = unsafe { libc::write(stdin, chunk.as_ptr() as *const libc::c_void, chunk.len()) };
        assert!(n > 0);
        written += n as u64;
    }
    conn.take_user_fd(0);

    let mut out = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        // SAFETY: `buf` is a correctly-sized stack buffer.
        let n = unsafe { libc::read(stderr, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n <= 0 {
            break;
        }
        out.extend_from_slice(&buf[..n as usize]);
    }
    let message = String::from_utf8(out).unwrap();
    assert!(message.contains("total (MB): 8.0"), "got {message:?}");
}

#[test]
fn chargen_first_line_starts_with_bang_under_deadline() {
    let dir = tempfile::tempdir().unwrap();
    let saddr = socket_path(&dir, "chargen.sock");
    let _server = russ_demos::spawn_demo_server(saddr.clone());
    std::thread::sleep(std::time::Duration::from_millis(50));

    let req = Request::new("execute", "/chargen");
    let deadline = Deadline::from_timeout(Some(std::time::Duration::from_secs(1)));
    let mut conn = ClientConn::dial(&saddr, &req, deadline).unwrap();
    let stdout = conn.user_fd(1).unwrap();

    let mut buf = [0u8; 128];
    let mut total = Vec::new();
    while total.len() < 128 {
        // SAFETY: `buf` is a correctly-sized stack buffer.
        let n = unsafe { libc::read(stdout, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n <= 0 {
            break;
        }
        total.extend_from_slice(&buf[..n as usize]);
    }
    assert_eq!(total[0], b'!');
    conn.take_user_fd(1); // closing here is what lets the server's chargen loop eventually stop
}

#[test]
fn wildcard_dial_reports_matched_component() {
    let dir = tempfile::tempdir().unwrap();
    let saddr = socket_path(&dir, "tree.sock");
    let _server = russ_demos::spawn_demo_server(saddr.clone());
    std::thread::sleep(std::time::Duration::from_millis(50));

    let req = Request::new("execute", "/tree/a/foo/bar");
    let mut conn = ClientConn::dial(&saddr, &req, NEVER).unwrap();
    let (outcome, record) = conn.wait(NEVER).unwrap();
    assert_eq!(outcome, WaitOutcome::Ok);
    let message = record.unwrap().message;
    assert!(message.contains("foo"));
    assert!(message.contains("/tree/a/foo"));
}

#[test]
fn fork_mode_server_serves_two_concurrent_dials_independently() {
    let dir = tempfile::tempdir().unwrap();
    let saddr = socket_path(&dir, "fork.sock");
    let listener = UnixListener::bind(&saddr).unwrap();
    let root = russ_demos::demo_tree();
    let server = Server::from_listener(
        listener,
        saddr.clone(),
        root,
        ServerLoop::Fork,
        russ::config::RussConfig {
            accept_timeout: std::time::Duration::from_millis(250),
            ..russ::config::RussConfig::default()
        },
    );
    let handle = std::thread::spawn(move || {
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(3);
        let _ = server.serve(move || std::time::Instant::now() >= deadline);
    });

    let saddr_a = saddr.clone();
    let saddr_b = saddr.clone();
    let t1 = std::thread::spawn(move || {
        let mut req = Request::new("execute", "/exit");
        req.args.append("3".to_string());
        let mut conn = ClientConn::dial(&saddr_a, &req, NEVER).unwrap();
        conn.wait(NEVER).unwrap().1.unwrap().status
    });
    let t2 = std::thread::spawn(move || {
        let mut req = Request::new("execute", "/exit");
        req.args.append("4".to_string());
        let mut conn = ClientConn::dial(&saddr_b, &req, NEVER).unwrap();
        conn.wait(NEVER).unwrap().1.unwrap().status
    });
    let status_a = t1.join().unwrap();
    let status_b = t2.join().unwrap();
    assert_eq!(status_a, 3);
    assert_eq!(status_b, 4);

    handle.join().unwrap();
}
