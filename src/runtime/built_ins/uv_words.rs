use crate::{
    add_native_word,
    runtime::{
        data_structures::value::Value,
        error::{self, script_error_str},
        handle::{ConnCommand, HandleId, HandleKind, HandleRegistry},
        interpreter::{EventLoopManagement, Interpreter, LoopEvent},
    },
};
use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    str::FromStr,
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
};

/// Require that `handle` exists, is of the expected kind, and hasn't been closed. Every
/// event-loop binding but `uv:close` itself goes through this before touching a handle.
fn require_open(
    interpreter: &mut dyn Interpreter,
    handle: HandleId,
    kind: HandleKind,
) -> error::Result<()> {
    match interpreter.handles().kind(handle) {
        None => script_error_str(&*interpreter, "Unknown handle."),

        Some(actual) if actual != kind => {
            script_error_str(&*interpreter, "Handle is the wrong kind for this word.")
        }

        Some(_) => match interpreter.handles().is_closed(handle) {
            Some(true) => script_error_str(&*interpreter, "Handle is closed."),
            _ => Ok(()),
        },
    }
}

/// Pop a millisecond duration. Negative values are a fatal type error -- durations are unsigned.
fn pop_millis(interpreter: &mut dyn Interpreter) -> error::Result<u64> {
    let value = interpreter.pop_as_int()?;

    if value < 0 {
        return script_error_str(&*interpreter, "Expected a non-negative millisecond duration.");
    }

    Ok(value as u64)
}

/// Pop a 16-bit port number. Out of range values are a fatal type error.
fn pop_port(interpreter: &mut dyn Interpreter) -> error::Result<u16> {
    let value = interpreter.pop_as_int()?;

    if !(0..=65535).contains(&value) {
        return script_error_str(&*interpreter, "Expected a port number in 0..=65535.");
    }

    Ok(value as u16)
}

/// Pop a string and decode it as UTF-8 text, for the handful of words (`uv:tcp-bind`,
/// `uv:tcp-connect`) that need an actual IP address rather than raw bytes. Invalid UTF-8 is
/// reported the same way a bind/connect failure is -- non-fatal, via `context` -- rather than
/// lossily substituted, since there is no valid IP address to recover from mangled text anyway.
fn pop_ip_text(interpreter: &mut dyn Interpreter, context: &str) -> error::Result<Option<String>> {
    let bytes = interpreter.pop_as_string()?;

    match String::from_utf8(bytes) {
        Ok(text) => Ok(Some(text)),
        Err(err) => {
            report_event_loop_error(context, err);
            Ok(None)
        }
    }
}

/// Report a non-fatal event-loop failure (bind, listen, connect, write) to standard error and
/// continue. Unlike `ScriptError`, these never unwind -- the word they occurred in simply leaves
/// its handle unarmed.
fn report_event_loop_error(context: &str, error: impl std::fmt::Display) {
    eprintln!("Error: {}: {}", context, error);
}

/// `uv:timer ( -- h)`: allocate a fresh, unarmed timer handle.
fn word_uv_timer(interpreter: &mut dyn Interpreter) -> error::Result<()> {
    let handle = interpreter.handles().allocate(HandleKind::Timer);
    interpreter.push(Value::Handle(handle));

    Ok(())
}

/// `uv:timer-start (h timeout-ms repeat-ms q -- )`: arm the timer, replacing any previous
/// callback, and spawn the task that sleeps `timeout-ms` before the first tick and then (unless
/// `repeat-ms` is zero) ticks every `repeat-ms` thereafter.
fn word_uv_timer_start(interpreter: &mut dyn Interpreter) -> error::Result<()> {
    let callback = interpreter.pop_as_quote()?;
    let repeat_ms = pop_millis(interpreter)?;
    let timeout_ms = pop_millis(interpreter)?;
    let handle = interpreter.pop_as_handle()?;

    require_open(interpreter, handle, HandleKind::Timer)?;

    let _ = interpreter.handles().set_callback(handle, callback);

    let sender = interpreter.event_sender();
    let task = interpreter.spawn_local(Box::pin(run_timer(handle, timeout_ms, repeat_ms, sender)));
    let _ = interpreter.handles().set_task(handle, task);

    Ok(())
}

/// `uv:timer-stop (h -- )`: abort the running task. The callback quotation id is left in place so
/// a later `uv:timer-start` can re-arm the same handle.
fn word_uv_timer_stop(interpreter: &mut dyn Interpreter) -> error::Result<()> {
    let handle = interpreter.pop_as_handle()?;

    require_open(interpreter, handle, HandleKind::Timer)?;
    interpreter.handles().stop_task(handle);

    Ok(())
}

async fn run_timer(
    handle: HandleId,
    timeout_ms: u64,
    repeat_ms: u64,
    sender: mpsc::UnboundedSender<LoopEvent>,
) {
    tokio::time::sleep(Duration::from_millis(timeout_ms)).await;

    if sender.send(LoopEvent::Timer { handle }).is_err() {
        return;
    }

    if repeat_ms == 0 {
        return;
    }

    let mut ticker = tokio::time::interval(Duration::from_millis(repeat_ms));
    ticker.tick().await; // The first tick fires immediately; the timeout sleep already covered it.

    loop {
        ticker.tick().await;

        if sender.send(LoopEvent::Timer { handle }).is_err() {
            return;
        }
    }
}

/// `uv:tcp ( -- h)`: allocate a fresh, unbound TCP handle.
fn word_uv_tcp(interpreter: &mut dyn Interpreter) -> error::Result<()> {
    let handle = interpreter.handles().allocate(HandleKind::Tcp);
    interpreter.push(Value::Handle(handle));

    Ok(())
}

/// `uv:tcp-bind (h ip port -- )`: bind synchronously, so a failure is visible to the word that
/// caused it rather than surfacing later out of `uv:run`.
fn word_uv_tcp_bind(interpreter: &mut dyn Interpreter) -> error::Result<()> {
    let port = pop_port(interpreter)?;
    let ip_text = pop_ip_text(interpreter, "uv:tcp-bind")?;
    let handle = interpreter.pop_as_handle()?;

    require_open(interpreter, handle, HandleKind::Tcp)?;

    let Some(ip_text) = ip_text else {
        return Ok(());
    };

    let ip = match Ipv4Addr::from_str(&ip_text) {
        Ok(ip) => ip,
        Err(err) => {
            report_event_loop_error("uv:tcp-bind", err);
            return Ok(());
        }
    };

    match std::net::TcpListener::bind(SocketAddrV4::new(ip, port)) {
        Ok(listener) => {
            let _ = interpreter.handles().set_bound(handle, listener);
        }

        Err(err) => report_event_loop_error("uv:tcp-bind", err),
    }

    Ok(())
}

/// `uv:listen (h backlog q -- )`: promote the synchronously bound listener to `tokio` and spawn
/// the accept loop. `backlog` is accepted for interface compatibility only -- `TcpListener`
/// exposes no user-tunable backlog once bound, so it has no further effect here.
fn word_uv_listen(interpreter: &mut dyn Interpreter) -> error::Result<()> {
    let callback = interpreter.pop_as_quote()?;
    let _backlog = interpreter.pop_as_int()?;
    let handle = interpreter.pop_as_handle()?;

    require_open(interpreter, handle, HandleKind::Tcp)?;

    let Some(bound) = interpreter.handles().take_bound(handle) else {
        return script_error_str(&*interpreter, "uv:listen called before uv:tcp-bind.");
    };

    let _ = interpreter.handles().set_callback(handle, callback);

    if let Err(err) = bound.set_nonblocking(true) {
        report_event_loop_error("uv:listen", err);
        return Ok(());
    }

    let listener = match TcpListener::from_std(bound) {
        Ok(listener) => listener,
        Err(err) => {
            report_event_loop_error("uv:listen", err);
            return Ok(());
        }
    };

    let handles = interpreter.handles().clone();
    let sender = interpreter.event_sender();

    let task = interpreter.spawn_local(Box::pin(accept_loop(listener, handle, handles, sender)));
    let _ = interpreter.handles().set_task(handle, task);

    Ok(())
}

async fn accept_loop(
    listener: TcpListener,
    listener_handle: HandleId,
    handles: HandleRegistry,
    sender: mpsc::UnboundedSender<LoopEvent>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let client = handles.allocate(HandleKind::Tcp);
                let (tx, rx) = mpsc::unbounded_channel();
                let _ = handles.set_conn(client, tx);

                let client_task =
                    tokio::task::spawn_local(run_connection(stream, client, sender.clone(), rx));
                let _ = handles.set_task(client, client_task);

                if sender.send(LoopEvent::Accepted { listener: listener_handle, client }).is_err()
                {
                    return;
                }
            }

            Err(err) => eprintln!("Error: uv:listen: accept failed: {}", err),
        }
    }
}

/// `uv:read-start (h q -- )`: arm the read callback and tell the connection's owning task to
/// start forwarding `Data`/`Eof` events.
fn word_uv_read_start(interpreter: &mut dyn Interpreter) -> error::Result<()> {
    let callback = interpreter.pop_as_quote()?;
    let handle = interpreter.pop_as_handle()?;

    require_open(interpreter, handle, HandleKind::Tcp)?;

    let Some(conn) = interpreter.handles().conn(handle) else {
        return script_error_str(&*interpreter, "uv:read-start requires a connected handle.");
    };

    let _ = interpreter.handles().set_callback(handle, callback);
    let _ = conn.send(ConnCommand::StartRead);

    Ok(())
}

/// `uv:tcp-connect (h ip port q -- )`: initiate an outbound connection, arming `q` as the
/// callback invoked once (with `h`) on success. On failure the callback is simply never invoked.
fn word_uv_tcp_connect(interpreter: &mut dyn Interpreter) -> error::Result<()> {
    let callback = interpreter.pop_as_quote()?;
    let port = pop_port(interpreter)?;
    let ip_text = pop_ip_text(interpreter, "uv:tcp-connect")?;
    let handle = interpreter.pop_as_handle()?;

    require_open(interpreter, handle, HandleKind::Tcp)?;

    let Some(ip_text) = ip_text else {
        return Ok(());
    };

    let ip = match Ipv4Addr::from_str(&ip_text) {
        Ok(ip) => ip,
        Err(err) => {
            report_event_loop_error("uv:tcp-connect", err);
            return Ok(());
        }
    };

    let _ = interpreter.handles().set_callback(handle, callback);

    let handles = interpreter.handles().clone();
    let sender = interpreter.event_sender();
    let addr = SocketAddr::V4(SocketAddrV4::new(ip, port));

    let task = interpreter.spawn_local(Box::pin(run_connect(addr, handle, handles, sender)));
    let _ = interpreter.handles().set_task(handle, task);

    Ok(())
}

async fn run_connect(
    addr: SocketAddr,
    handle: HandleId,
    handles: HandleRegistry,
    sender: mpsc::UnboundedSender<LoopEvent>,
) {
    match TcpStream::connect(addr).await {
        Ok(stream) => {
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = handles.set_conn(handle, tx);

            if sender.send(LoopEvent::Connected { handle }).is_err() {
                return;
            }

            run_connection(stream, handle, sender, rx).await;
        }

        Err(err) => report_event_loop_error("uv:tcp-connect", err),
    }
}

/// `uv:write (h str -- )`: send the string's bytes to the connection's owning task. The string is
/// consumed regardless of whether the connection is still alive to receive it.
fn word_uv_write(interpreter: &mut dyn Interpreter) -> error::Result<()> {
    let bytes = interpreter.pop_as_string()?;
    let handle = interpreter.pop_as_handle()?;

    require_open(interpreter, handle, HandleKind::Tcp)?;

    let Some(conn) = interpreter.handles().conn(handle) else {
        return script_error_str(&*interpreter, "uv:write requires a connected handle.");
    };

    if conn.send(ConnCommand::Write(bytes)).is_err() {
        report_event_loop_error("uv:write", "the connection is no longer active");
    }

    Ok(())
}

/// Drive one connected stream's reads and writes for as long as its owning handle stays open.
/// Both directions share a single task so neither needs to split the stream: a write arrives as a
/// command, a read only starts forwarding once `uv:read-start` sends `StartRead`.
async fn run_connection(
    mut stream: TcpStream,
    handle: HandleId,
    sender: mpsc::UnboundedSender<LoopEvent>,
    mut commands: mpsc::UnboundedReceiver<ConnCommand>,
) {
    let mut reading = false;
    let mut buffer = [0u8; 4096];

    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(ConnCommand::Write(bytes)) => {
                        if stream.write_all(&bytes).await.is_err() {
                            return;
                        }
                    }

                    Some(ConnCommand::StartRead) => reading = true,

                    None => return,
                }
            }

            result = stream.read(&mut buffer), if reading => {
                match result {
                    Ok(0) => {
                        if sender.send(LoopEvent::Eof { handle }).is_err() {
                            return;
                        }

                        reading = false;
                    }

                    Ok(n) => {
                        let data = buffer[..n].to_vec();

                        if sender.send(LoopEvent::Data { handle, data }).is_err() {
                            return;
                        }
                    }

                    Err(_) => reading = false,
                }
            }
        }
    }
}

/// `uv:close (h -- )`: abort the handle's background task and mark it closed. A handle that's
/// already unknown or already closed is a fatal error -- see SPEC_FULL.md's tightening of the
/// upstream's "undefined" wording.
fn word_uv_close(interpreter: &mut dyn Interpreter) -> error::Result<()> {
    let handle = interpreter.pop_as_handle()?;

    match interpreter.handles().close(handle) {
        Some(()) => Ok(()),
        None => script_error_str(&*interpreter, "Handle is unknown or already closed."),
    }
}

/// `uv:run ( -- )`: drive the event loop until no handle is active.
fn word_uv_run(interpreter: &mut dyn Interpreter) -> error::Result<()> {
    interpreter.run_event_loop()
}

/// Register the event-loop binding words.
pub fn register_uv_words(interpreter: &mut dyn Interpreter) {
    add_native_word!(interpreter, "uv:timer", word_uv_timer, "Allocate a timer handle.", " -- h");

    add_native_word!(
        interpreter,
        "uv:timer-start",
        word_uv_timer_start,
        "Arm a timer: fire once after timeout-ms, then every repeat-ms unless repeat-ms is 0.",
        "h timeout-ms repeat-ms q -- "
    );

    add_native_word!(
        interpreter,
        "uv:timer-stop",
        word_uv_timer_stop,
        "Disarm a timer without forgetting its callback.",
        "h -- "
    );

    add_native_word!(interpreter, "uv:tcp", word_uv_tcp, "Allocate an unbound TCP handle.", " -- h");

    add_native_word!(
        interpreter,
        "uv:tcp-bind",
        word_uv_tcp_bind,
        "Bind a TCP handle to an IPv4 address and port.",
        "h ip port -- "
    );

    add_native_word!(
        interpreter,
        "uv:listen",
        word_uv_listen,
        "Start accepting connections on a bound TCP handle.",
        "h backlog q -- "
    );

    add_native_word!(
        interpreter,
        "uv:read-start",
        word_uv_read_start,
        "Begin delivering data/eof events for a connected TCP handle.",
        "h q -- "
    );

    add_native_word!(
        interpreter,
        "uv:tcp-connect",
        word_uv_tcp_connect,
        "Connect a TCP handle to a remote IPv4 address and port.",
        "h ip port q -- "
    );

    add_native_word!(
        interpreter,
        "uv:write",
        word_uv_write,
        "Write a string's bytes to a connected TCP handle.",
        "h str -- "
    );

    add_native_word!(
        interpreter,
        "uv:close",
        word_uv_close,
        "Close a handle, aborting its background task.",
        "h -- "
    );

    add_native_word!(
        interpreter,
        "uv:run",
        word_uv_run,
        "Drive the event loop until every handle is idle.",
        " -- "
    );
}
