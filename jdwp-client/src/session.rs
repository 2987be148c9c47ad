// Debug session: connection ownership, breakpoint registry, event dispatch
//
// One session per attach. After a successful attach exactly one background
// task pulls event sets off the connection and dispatches method-entry
// events to registered listeners in registration order, stopping at the
// first listener that consumes the event. Listeners run on the dispatch
// task, while the hitting thread is still suspended; the event set is
// resumed exactly once per set, after the listeners return.

use crate::breakpoint::Breakpoint;
use crate::connection::JdwpConnection;
use crate::evaluate::EvaluateContext;
use crate::eventrequest::SuspendPolicy;
use crate::events::EventKind;
use crate::protocol::{JdwpError, JdwpResult};
use crate::reftype::MethodInfo;
use crate::types::{Location, ReferenceTypeId, ThreadId};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time;
use tracing::{debug, info, warn};

/// A breakpoint hit, delivered to listeners while the thread is suspended.
#[derive(Debug, Clone)]
pub struct BreakpointEvent {
    pub context: EvaluateContext,
    pub class_name: String,
    pub method_name: String,
    pub thread_name: String,
    pub request_id: i32,
}

pub type ListenerFuture = Pin<Box<dyn Future<Output = bool> + Send>>;

/// Listener callback. Returns true when it consumed the event.
pub type EventListener = Arc<dyn Fn(BreakpointEvent) -> ListenerFuture + Send + Sync>;

#[derive(Default)]
struct SessionInner {
    conn: Mutex<Option<JdwpConnection>>,
    breakpoints: Mutex<HashMap<i32, Breakpoint>>,
    listeners: Mutex<Vec<(u64, EventListener)>>,
    next_listener_id: AtomicU64,
    running: AtomicBool,
    attached: AtomicBool,
}

/// Debug session for one target VM.
#[derive(Clone, Default)]
pub struct DebugSession {
    inner: Arc<SessionInner>,
}

impl DebugSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach to the VM's debug port.
    ///
    /// Returns `Ok(false)` when the remote end refuses or times out — the
    /// device may simply not be ready yet, so callers retry. Attaching while
    /// a previous attach is live is an error.
    pub async fn attach(&self, host: &str, port: u16, timeout: Duration) -> JdwpResult<bool> {
        if self.inner.attached.load(Ordering::Acquire) {
            return Err(JdwpError::AlreadyAttached);
        }

        let conn = match JdwpConnection::connect(host, port, timeout).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("attach to {}:{} failed: {}", host, port, e);
                return Ok(false);
            }
        };

        *self.inner.conn.lock().unwrap() = Some(conn.clone());
        self.inner.running.store(true, Ordering::Release);
        self.inner.attached.store(true, Ordering::Release);

        tokio::spawn(dispatch_loop(self.inner.clone(), conn));

        info!("attached to VM at {}:{}", host, port);
        Ok(true)
    }

    pub fn is_attached(&self) -> bool {
        self.inner.attached.load(Ordering::Acquire)
    }

    /// The connection behind this session, for evaluation during dispatch.
    pub fn connection(&self) -> JdwpResult<JdwpConnection> {
        self.inner
            .conn
            .lock()
            .unwrap()
            .clone()
            .ok_or(JdwpError::NotAttached)
    }

    /// Arm a breakpoint.
    ///
    /// Returns `Ok(false)` without arming when the target class is not
    /// loaded in the VM yet. On success the breakpoint carries its request
    /// id and a copy is recorded in the registry.
    pub async fn add_breakpoint(&self, breakpoint: &mut Breakpoint) -> JdwpResult<bool> {
        let conn = self.connection()?;

        let Some(request_id) = breakpoint.enable(&conn).await? else {
            return Ok(false);
        };

        self.inner
            .breakpoints
            .lock()
            .unwrap()
            .insert(request_id, breakpoint.clone());
        Ok(true)
    }

    /// Disarm a breakpoint and forget it. Idempotent.
    pub async fn remove_breakpoint(&self, breakpoint: &mut Breakpoint) -> JdwpResult<()> {
        let conn = self.connection()?;

        if let Some(request_id) = breakpoint.request_id() {
            self.inner.breakpoints.lock().unwrap().remove(&request_id);
        }
        breakpoint.disable(&conn).await
    }

    /// Disarm and forget every registered breakpoint. Idempotent.
    pub async fn clear_breakpoints(&self) -> JdwpResult<()> {
        let conn = self.connection()?;

        let drained: Vec<Breakpoint> = {
            let mut map = self.inner.breakpoints.lock().unwrap();
            map.drain().map(|(_, bp)| bp).collect()
        };
        for mut bp in drained {
            if let Err(e) = bp.disable(&conn).await {
                warn!("failed to clear breakpoint {}: {}", bp, e);
            }
        }
        Ok(())
    }

    /// Snapshot of the currently registered breakpoints.
    pub fn breakpoints(&self) -> Vec<Breakpoint> {
        self.inner
            .breakpoints
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect()
    }

    /// Register a listener; returns a token for `unregister_event_listener`.
    pub fn register_event_listener(&self, listener: EventListener) -> u64 {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.inner.listeners.lock().unwrap().push((id, listener));
        id
    }

    pub fn unregister_event_listener(&self, token: u64) {
        self.inner
            .listeners
            .lock()
            .unwrap()
            .retain(|(id, _)| *id != token);
    }

    /// Tear the session down: stop the dispatch loop and detach.
    ///
    /// Never blocks indefinitely on a stuck VM; the wire-level dispose is
    /// bounded and the dispatch task is signalled, not joined. Safe to call
    /// concurrently with dispatch and more than once.
    pub async fn dispose(&self) {
        self.inner.running.store(false, Ordering::Release);
        self.inner.attached.store(false, Ordering::Release);

        let conn = self.inner.conn.lock().unwrap().take();
        if let Some(conn) = conn {
            match time::timeout(Duration::from_secs(1), conn.vm_dispose()).await {
                Ok(Ok(())) => debug!("VM dispose acknowledged"),
                Ok(Err(e)) => debug!("VM dispose failed: {}", e),
                Err(_) => debug!("VM dispose timed out"),
            }
            conn.shutdown();
        }
        info!("debug session disposed");
    }
}

/// Background dispatch: one instance per attach.
async fn dispatch_loop(inner: Arc<SessionInner>, conn: JdwpConnection) {
    debug!("event dispatch loop started");
    let mut method_cache: HashMap<ReferenceTypeId, Vec<MethodInfo>> = HashMap::new();
    let mut vm_alive = true;

    while vm_alive && inner.running.load(Ordering::Acquire) {
        let Some(set) = conn.recv_event().await else {
            break;
        };

        let mut suspended_threads: Vec<ThreadId> = Vec::new();

        for event in &set.events {
            match &event.details {
                EventKind::VmDeath => {
                    info!("remote VM died");
                    vm_alive = false;
                }
                EventKind::MethodEntry { thread, location } => {
                    suspended_threads.push(*thread);
                    if let Err(e) = handle_method_entry(
                        &inner,
                        &conn,
                        &mut method_cache,
                        event.request_id,
                        *thread,
                        location,
                    )
                    .await
                    {
                        // steady-state dispatch errors must not kill the session
                        warn!("method entry dispatch failed: {}", e);
                    }
                }
                _ => {}
            }
        }

        // The protocol requires releasing the event set's suspension exactly
        // once, after the listeners have seen the suspended state.
        let resumed = if set.suspend_policy == SuspendPolicy::All as u8 {
            conn.vm_resume().await
        } else if set.suspend_policy == SuspendPolicy::EventThread as u8 {
            suspended_threads.dedup();
            let mut result = Ok(());
            for thread in suspended_threads {
                if let Err(e) = conn.thread_resume(thread).await {
                    result = Err(e);
                }
            }
            result
        } else {
            Ok(())
        };
        if let Err(e) = resumed {
            warn!("failed to resume event set: {}", e);
        }
    }

    inner.running.store(false, Ordering::Release);
    inner.attached.store(false, Ordering::Release);
    debug!("event dispatch loop exited");
}

async fn handle_method_entry(
    inner: &Arc<SessionInner>,
    conn: &JdwpConnection,
    method_cache: &mut HashMap<ReferenceTypeId, Vec<MethodInfo>>,
    request_id: i32,
    thread: ThreadId,
    location: &Location,
) -> JdwpResult<()> {
    let breakpoint = {
        let map = inner.breakpoints.lock().unwrap();
        map.get(&request_id).cloned()
    };
    let Some(breakpoint) = breakpoint else {
        return Ok(());
    };

    // The request filters by class only; match the method here.
    if !method_cache.contains_key(&location.class_id) {
        let methods = conn.get_methods(location.class_id).await?;
        method_cache.insert(location.class_id, methods);
    }
    let methods = &method_cache[&location.class_id];
    let Some(method) = methods.iter().find(|m| m.method_id == location.method_id) else {
        return Ok(());
    };
    if !breakpoint.matches(&method.name) {
        return Ok(());
    }

    let thread_name = conn.thread_name(thread).await.unwrap_or_default();
    debug!(
        "hit breakpoint {} on thread {:?}",
        breakpoint, thread_name
    );

    let event = BreakpointEvent {
        context: EvaluateContext {
            thread,
            class_id: location.class_id,
            method_id: location.method_id,
        },
        class_name: breakpoint.class_name().to_string(),
        method_name: breakpoint.method_name().to_string(),
        thread_name,
        request_id,
    };

    // snapshot under the lock, invoke outside it
    let listeners: Vec<EventListener> = inner
        .listeners
        .lock()
        .unwrap()
        .iter()
        .map(|(_, l)| l.clone())
        .collect();

    for listener in listeners {
        if listener(event.clone()).await {
            break;
        }
    }

    Ok(())
}
