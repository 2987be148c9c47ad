// Session-level integration tests against the in-process fake VM.

use jdwp_client::testvm::FakeVmBuilder;
use jdwp_client::{
    Breakpoint, BreakpointEvent, CallArg, DebugSession, Evaluator, JdwpError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const ATTACH_TIMEOUT: Duration = Duration::from_secs(2);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn attach(session: &DebugSession, port: u16) {
    init_tracing();
    let attached = session
        .attach("127.0.0.1", port, ATTACH_TIMEOUT)
        .await
        .unwrap();
    assert!(attached);
}

#[tokio::test]
async fn add_and_remove_breakpoint() {
    let vm = FakeVmBuilder::new()
        .class("android.app.Activity", &[("onCreate", "(Landroid/os/Bundle;)V")])
        .start()
        .await;

    let session = DebugSession::new();
    attach(&session, vm.port).await;

    let mut bp = Breakpoint::method_entry("android.app.Activity", "onCreate");
    assert!(session.add_breakpoint(&mut bp).await.unwrap());
    assert!(bp.is_enabled());
    let request_id = bp.request_id().unwrap();
    assert_eq!(vm.armed_request_ids(), vec![request_id]);
    assert_eq!(session.breakpoints().len(), 1);

    session.remove_breakpoint(&mut bp).await.unwrap();
    assert!(!bp.is_enabled());
    assert!(bp.request_id().is_none());
    assert!(session.breakpoints().is_empty());
    assert_eq!(vm.cleared_request_ids(), vec![request_id]);

    session.dispose().await;
}

#[tokio::test]
async fn breakpoint_on_unloaded_class_is_not_armed() {
    let vm = FakeVmBuilder::new().start().await;

    let session = DebugSession::new();
    attach(&session, vm.port).await;

    let mut bp = Breakpoint::method_entry("com.unity3d.player.UnityPlayer", "executeGLThreadJobs");
    assert!(!session.add_breakpoint(&mut bp).await.unwrap());
    assert!(!bp.is_enabled());
    assert!(session.breakpoints().is_empty());
    assert!(vm.armed_request_ids().is_empty());

    session.dispose().await;
}

#[tokio::test]
async fn double_attach_is_rejected() {
    let vm = FakeVmBuilder::new().start().await;

    let session = DebugSession::new();
    attach(&session, vm.port).await;

    let second = session.attach("127.0.0.1", vm.port, ATTACH_TIMEOUT).await;
    assert!(matches!(second, Err(JdwpError::AlreadyAttached)));

    session.dispose().await;
}

#[tokio::test]
async fn refused_connection_reports_not_attached() {
    let session = DebugSession::new();
    // port 1 is never listening
    let attached = session
        .attach("127.0.0.1", 1, Duration::from_millis(500))
        .await
        .unwrap();
    assert!(!attached);
    assert!(!session.is_attached());
    assert!(matches!(session.connection(), Err(JdwpError::NotAttached)));
}

#[tokio::test]
async fn dispose_detaches_and_notifies_vm() {
    let vm = FakeVmBuilder::new().start().await;

    let session = DebugSession::new();
    attach(&session, vm.port).await;
    assert!(session.is_attached());

    session.dispose().await;
    assert!(!session.is_attached());
    assert!(matches!(session.connection(), Err(JdwpError::NotAttached)));
    assert!(vm.disposed());

    // a second dispose is a no-op
    session.dispose().await;
}

#[tokio::test]
async fn method_entry_event_reaches_listener() {
    let vm = FakeVmBuilder::new()
        .class(
            "android.content.ContextWrapper",
            &[("attachBaseContext", "(Landroid/content/Context;)V")],
        )
        .fire_on(
            "android.content.ContextWrapper",
            "attachBaseContext",
            Duration::from_millis(50),
            1,
        )
        .start()
        .await;

    let session = DebugSession::new();
    attach(&session, vm.port).await;

    let (tx, mut rx) = mpsc::channel::<BreakpointEvent>(4);
    session.register_event_listener(Arc::new(move |event| {
        let tx = tx.clone();
        Box::pin(async move {
            tx.send(event).await.ok();
            true
        })
    }));

    let mut bp = Breakpoint::method_entry("android.content.ContextWrapper", "attachBaseContext");
    assert!(session.add_breakpoint(&mut bp).await.unwrap());

    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("breakpoint did not fire")
        .expect("listener channel closed");

    assert_eq!(event.class_name, "android.content.ContextWrapper");
    assert_eq!(event.method_name, "attachBaseContext");
    assert_eq!(event.thread_name, "main");
    assert_eq!(event.request_id, bp.request_id().unwrap());

    // the event thread is released once the listeners have run
    tokio::time::timeout(Duration::from_secs(2), async {
        while vm.thread_resumes() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("suspended thread was never resumed");

    session.dispose().await;
}

#[tokio::test]
async fn remote_invocation_during_breakpoint() {
    let vm = FakeVmBuilder::new()
        .class(
            "android.content.ContextWrapper",
            &[("attachBaseContext", "(Landroid/content/Context;)V")],
        )
        .fire_on(
            "android.content.ContextWrapper",
            "attachBaseContext",
            Duration::from_millis(50),
            1,
        )
        .start()
        .await;

    let session = DebugSession::new();
    attach(&session, vm.port).await;

    let evaluator = Evaluator::new(session.connection().unwrap());
    let (tx, mut rx) = mpsc::channel::<String>(1);
    session.register_event_listener(Arc::new(move |event: BreakpointEvent| {
        let evaluator = evaluator.clone();
        let tx = tx.clone();
        Box::pin(async move {
            let result = evaluator
                .evaluate_static(
                    &event.context,
                    "java.lang.System",
                    "load",
                    "(Ljava/lang/String;)V",
                    &[CallArg::from("/data/data/com.example.app/libnative.so")],
                )
                .await;
            let outcome = match result {
                Ok(r) if !r.has_error() => "ok".to_string(),
                Ok(r) => r.error().unwrap_or_default().to_string(),
                Err(e) => e.to_string(),
            };
            tx.send(outcome).await.ok();
            true
        })
    }));

    let mut bp = Breakpoint::method_entry("android.content.ContextWrapper", "attachBaseContext");
    assert!(session.add_breakpoint(&mut bp).await.unwrap());

    let outcome = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("breakpoint did not fire")
        .expect("listener channel closed");

    assert_eq!(outcome, "ok");
    assert_eq!(
        vm.loads(),
        vec!["/data/data/com.example.app/libnative.so".to_string()]
    );

    session.dispose().await;
}

#[tokio::test]
async fn string_argument_round_trips_unchanged() {
    let vm = FakeVmBuilder::new()
        .class("android.os.Looper", &[("myLooper", "()Landroid/os/Looper;")])
        .fire_on("android.os.Looper", "myLooper", Duration::from_millis(50), 1)
        .start()
        .await;

    let session = DebugSession::new();
    attach(&session, vm.port).await;

    let conn = session.connection().unwrap();
    let evaluator = Evaluator::new(conn.clone());
    let (tx, mut rx) = mpsc::channel::<String>(1);
    session.register_event_listener(Arc::new(move |event: BreakpointEvent| {
        let conn = conn.clone();
        let evaluator = evaluator.clone();
        let tx = tx.clone();
        Box::pin(async move {
            // the fake VM's echo method returns its argument unchanged
            let result = evaluator
                .evaluate_static(
                    &event.context,
                    "java.lang.System",
                    "echo",
                    "(Ljava/lang/String;)Ljava/lang/String;",
                    &[CallArg::from("/data/local/tmp/payload £ ± ✓.so")],
                )
                .await
                .unwrap();
            let string_id = result.object_id().expect("echo returned null");
            let text = conn.get_string_value(string_id).await.unwrap();
            tx.send(text).await.ok();
            true
        })
    }));

    let mut bp = Breakpoint::method_entry("android.os.Looper", "myLooper");
    assert!(session.add_breakpoint(&mut bp).await.unwrap());

    let text = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("breakpoint did not fire")
        .expect("listener channel closed");
    assert_eq!(text, "/data/local/tmp/payload £ ± ✓.so");

    session.dispose().await;
}

#[tokio::test]
async fn remote_exception_is_described() {
    let vm = FakeVmBuilder::new()
        .class(
            "android.content.ContextWrapper",
            &[("attachBaseContext", "(Landroid/content/Context;)V")],
        )
        .fire_on(
            "android.content.ContextWrapper",
            "attachBaseContext",
            Duration::from_millis(50),
            1,
        )
        .fail_load("dlopen failed: \"/data/data/com.example.app/libnative.so\" is 32-bit instead of 64-bit")
        .start()
        .await;

    let session = DebugSession::new();
    attach(&session, vm.port).await;

    let evaluator = Evaluator::new(session.connection().unwrap());
    let (tx, mut rx) = mpsc::channel::<String>(1);
    session.register_event_listener(Arc::new(move |event: BreakpointEvent| {
        let evaluator = evaluator.clone();
        let tx = tx.clone();
        Box::pin(async move {
            let result = evaluator
                .evaluate_static(
                    &event.context,
                    "java.lang.System",
                    "load",
                    "(Ljava/lang/String;)V",
                    &[CallArg::from("/data/data/com.example.app/libnative.so")],
                )
                .await
                .unwrap();
            tx.send(result.error().unwrap_or_default().to_string())
                .await
                .ok();
            true
        })
    }));

    let mut bp = Breakpoint::method_entry("android.content.ContextWrapper", "attachBaseContext");
    assert!(session.add_breakpoint(&mut bp).await.unwrap());

    let error = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("breakpoint did not fire")
        .expect("listener channel closed");

    assert!(error.contains("java.lang.UnsatisfiedLinkError"), "{}", error);
    assert!(error.contains("32-bit instead of 64-bit"), "{}", error);
    assert!(vm.loads().is_empty());

    session.dispose().await;
}

#[tokio::test]
async fn first_listener_to_consume_wins() {
    let vm = FakeVmBuilder::new()
        .class("android.os.Looper", &[("myLooper", "()Landroid/os/Looper;")])
        .fire_on("android.os.Looper", "myLooper", Duration::from_millis(50), 1)
        .start()
        .await;

    let session = DebugSession::new();
    attach(&session, vm.port).await;

    let (first_tx, mut first_rx) = mpsc::channel::<i32>(1);
    let (second_tx, mut second_rx) = mpsc::channel::<i32>(1);

    session.register_event_listener(Arc::new(move |event: BreakpointEvent| {
        let tx = first_tx.clone();
        Box::pin(async move {
            tx.send(event.request_id).await.ok();
            true
        })
    }));
    session.register_event_listener(Arc::new(move |event: BreakpointEvent| {
        let tx = second_tx.clone();
        Box::pin(async move {
            tx.send(event.request_id).await.ok();
            true
        })
    }));

    let mut bp = Breakpoint::method_entry("android.os.Looper", "myLooper");
    assert!(session.add_breakpoint(&mut bp).await.unwrap());

    tokio::time::timeout(Duration::from_secs(2), first_rx.recv())
        .await
        .expect("breakpoint did not fire")
        .expect("listener channel closed");

    // the second listener never sees the consumed event
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(second_rx.try_recv().is_err());

    session.dispose().await;
}

#[tokio::test]
async fn duplicate_hits_are_delivered_separately() {
    let vm = FakeVmBuilder::new()
        .class("android.os.Looper", &[("myLooper", "()Landroid/os/Looper;")])
        .fire_on("android.os.Looper", "myLooper", Duration::from_millis(30), 2)
        .start()
        .await;

    let session = DebugSession::new();
    attach(&session, vm.port).await;

    let (tx, mut rx) = mpsc::channel::<i32>(4);
    session.register_event_listener(Arc::new(move |event: BreakpointEvent| {
        let tx = tx.clone();
        Box::pin(async move {
            tx.send(event.request_id).await.ok();
            true
        })
    }));

    let mut bp = Breakpoint::method_entry("android.os.Looper", "myLooper");
    assert!(session.add_breakpoint(&mut bp).await.unwrap());

    for _ in 0..2 {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("breakpoint did not fire")
            .expect("listener channel closed");
    }

    // both event threads released
    tokio::time::timeout(Duration::from_secs(2), async {
        while vm.thread_resumes() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("suspended threads were never resumed");

    session.dispose().await;
}
