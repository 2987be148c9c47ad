// Injection orchestrator
//
// Drives one injection end to end: resolve the device and the debuggable
// process, stage the payloads into the app's data directory, attach over
// JDWP, arm method-entry breakpoints, and on the first main-thread hit load
// the payloads inside the target VM. The session is always disposed, whether
// the run succeeds, fails, or times out.

use crate::apk::extract_native_libraries;
use crate::error::InjectError;
use crate::transport::{Device, ProcessInfo, Transport};
use jdwp_client::{
    Breakpoint, BreakpointEvent, CallArg, DebugSession, EvaluateContext, EvaluateResult, Evaluator,
    JdwpConnection,
};
use jdwp_client::types::tags;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{self, Instant};
use tracing::{info, warn};

const DEVICE_POLL_INTERVAL: Duration = Duration::from_millis(100);
const PROCESS_POLL_INTERVAL: Duration = Duration::from_millis(200);

// The entry point a payload apk must carry:
//   public class EntryPoint {
//       public static void entry(Application app, ClassLoader dexClassLoader, ClassLoader originClassLoader) { ... }
//   }
const APK_ENTRY_CLASS: &str = "com.artinjector.EntryPoint";
const APK_ENTRY_METHOD: &str = "entry";

const DEFAULT_BREAKPOINTS: [(&str, &str); 4] = [
    // for android.app.Application.attachBaseContext()
    ("android.content.ContextWrapper", "attachBaseContext"),
    ("android.app.Activity", "onCreate"),
    ("android.os.Looper", "myLooper"),
    ("com.unity3d.player.UnityPlayer", "executeGLThreadJobs"),
];

#[derive(Debug, Clone)]
pub struct InjectOptions {
    pub serial: Option<String>,
    pub package: String,
    pub payloads: Vec<PathBuf>,
    /// Comma-separated `Class.method` overrides for the default set.
    pub breakpoints: Option<String>,
    pub timeout: Duration,
}

/// Parse one `Class.method` breakpoint, splitting at the last dot.
pub fn parse_breakpoint(spec: &str) -> Result<(String, String), InjectError> {
    match spec.rfind('.') {
        Some(index) if index > 0 && index + 1 < spec.len() => Ok((
            spec[..index].to_string(),
            spec[index + 1..].to_string(),
        )),
        _ => Err(InjectError::BreakpointFormat(spec.to_string())),
    }
}

/// The breakpoint set for a run. Apk payloads need the application context,
/// which only the attachBaseContext hook can provide, so they override any
/// custom set.
pub fn select_breakpoints(
    has_apk: bool,
    spec: Option<&str>,
) -> Result<Vec<(String, String)>, InjectError> {
    if has_apk {
        if spec.is_some() {
            warn!(
                "custom breakpoints disabled: apk injection needs the \
                 Application.attachBaseContext hook for the application context"
            );
        }
        return Ok(vec![(
            "android.content.ContextWrapper".to_string(),
            "attachBaseContext".to_string(),
        )]);
    }

    match spec {
        None => Ok(DEFAULT_BREAKPOINTS
            .iter()
            .map(|(c, m)| (c.to_string(), m.to_string()))
            .collect()),
        Some(spec) => spec.split(',').map(parse_breakpoint).collect(),
    }
}

pub struct ArtInjector<T: Transport> {
    transport: T,
}

impl<T: Transport> ArtInjector<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    /// Inject the payloads into the target application.
    pub async fn inject(&self, opts: &InjectOptions) -> Result<(), InjectError> {
        // global watchdog, slightly behind the per-phase deadlines so those
        // report their more specific errors first
        let watchdog = opts.timeout + Duration::from_secs(2);
        match time::timeout(watchdog, self.run(opts)).await {
            Ok(result) => result,
            Err(_) => Err(InjectError::Timeout),
        }
    }

    async fn run(&self, opts: &InjectOptions) -> Result<(), InjectError> {
        for payload in &opts.payloads {
            if !payload.exists() {
                return Err(InjectError::PayloadNotFound(payload.clone()));
            }
        }

        let deadline = Instant::now() + opts.timeout;
        let device = self.wait_for_device(opts.serial.as_deref(), deadline).await?;
        let process = self
            .wait_for_process(&device, &opts.package, deadline)
            .await?;

        // Stage payloads into /data/data/<package>/. Apk payloads are pushed
        // whole, together with their abi-matching native libraries.
        let mut so_remote_paths = Vec::new();
        let mut apk_remote_paths = Vec::new();
        for payload in &opts.payloads {
            let is_apk = payload.extension().is_some_and(|e| e == "apk");
            let remote = self.stage_payload(&device, &opts.package, payload)?;
            if is_apk {
                let (_extract_dir, libraries) =
                    extract_native_libraries(payload, &process.abi)?;
                for library in &libraries {
                    self.stage_payload(&device, &opts.package, library)?;
                }
                apk_remote_paths.push(remote);
            } else {
                so_remote_paths.push(remote);
            }
        }

        self.check_abi(&device, &process.abi, &so_remote_paths)?;

        let breakpoints = select_breakpoints(
            !apk_remote_paths.is_empty(),
            opts.breakpoints.as_deref(),
        )?;

        let session = DebugSession::new();
        let remaining = deadline.saturating_duration_since(Instant::now());
        let attached = session
            .attach("127.0.0.1", process.debug_port, remaining)
            .await?;
        if !attached {
            return Err(InjectError::AttachFailed {
                host: "127.0.0.1".to_string(),
                port: process.debug_port,
            });
        }
        if let Ok(version) = session.connection()?.get_version().await {
            info!(
                "attached as jdwp debugger, port={}, vm={}, jdwp version={}.{}",
                process.debug_port, version.vm_name, version.jdwp_major, version.jdwp_minor
            );
        }

        let result = self
            .run_attached(
                &session,
                &opts.package,
                &breakpoints,
                so_remote_paths,
                apk_remote_paths,
                deadline,
            )
            .await;

        session.dispose().await;
        result
    }

    async fn run_attached(
        &self,
        session: &DebugSession,
        package: &str,
        breakpoints: &[(String, String)],
        so_remote_paths: Vec<String>,
        apk_remote_paths: Vec<String>,
        deadline: Instant,
    ) -> Result<(), InjectError> {
        let mut armed = Vec::new();
        for (class_name, method_name) in breakpoints {
            let mut bp = Breakpoint::method_entry(class_name, method_name);
            if session.add_breakpoint(&mut bp).await? {
                info!("added breakpoint: {}", bp);
                armed.push(bp);
            }
        }

        let conn = session.connection()?;
        let evaluator = Evaluator::new(conn.clone());

        // One result slot for the whole run: the first consuming main-thread
        // hit fills it, later hits are ignored.
        let slot: Arc<Mutex<Option<Result<(), String>>>> = Arc::new(Mutex::new(None));
        let done = Arc::new(Notify::new());

        let listener_slot = slot.clone();
        let listener_done = done.clone();
        let package = package.to_string();
        session.register_event_listener(Arc::new(move |event: BreakpointEvent| {
            let conn = conn.clone();
            let evaluator = evaluator.clone();
            let slot = listener_slot.clone();
            let done = listener_done.clone();
            let package = package.clone();
            let so_remote_paths = so_remote_paths.clone();
            let apk_remote_paths = apk_remote_paths.clone();
            Box::pin(async move {
                if event.thread_name != "main" {
                    return false;
                }
                if slot.lock().unwrap().is_some() {
                    return false;
                }
                info!("hit breakpoint: {}.{}", event.class_name, event.method_name);

                let mut outcome: Result<(), String> = Ok(());
                for so_remote_path in &so_remote_paths {
                    match load_library(&evaluator, &event.context, so_remote_path).await {
                        Ok(()) => info!("loaded {}", so_remote_path),
                        Err(message) => {
                            outcome = Err(message);
                            break;
                        }
                    }
                }
                if outcome.is_ok() {
                    for apk_remote_path in &apk_remote_paths {
                        if let Err(message) =
                            inject_apk(&conn, &evaluator, &event, &package, apk_remote_path).await
                        {
                            outcome = Err(message);
                            break;
                        }
                    }
                }

                *slot.lock().unwrap() = Some(outcome);
                done.notify_one();
                true
            })
        }));

        info!("waiting for breakpoints");
        let remaining = deadline.saturating_duration_since(Instant::now());
        let hit = time::timeout(remaining, done.notified()).await.is_ok();

        let outcome = slot.lock().unwrap().take();
        match outcome {
            Some(Ok(())) => Ok(()),
            Some(Err(message)) => Err(InjectError::RemoteInvocation(message)),
            None => {
                debug_assert!(!hit);
                let description = armed
                    .iter()
                    .map(|bp| bp.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                Err(InjectError::BreakpointTimeout(description))
            }
        }
    }

    /// Launch the application with the debugger gate held, so the process
    /// waits for us before running application code.
    pub async fn launch_application(
        &self,
        serial: Option<&str>,
        package: &str,
        activity: Option<&str>,
        timeout: Duration,
    ) -> Result<(), InjectError> {
        let deadline = Instant::now() + timeout;
        let device = self.wait_for_device(serial, deadline).await?;

        self.transport
            .shell(&device, &["am", "set-debug-app", "-w", package])?;

        match activity {
            Some(activity) => {
                let path = format!("{}/.{}", package, activity.replace('$', "\\$"));
                self.transport.shell(
                    &device,
                    &[
                        "am",
                        "start",
                        "-n",
                        &path,
                        "-a",
                        "android.intent.action.MAIN",
                        "-c",
                        "android.intent.category.LAUNCHER",
                    ],
                )?;
            }
            None => {
                self.transport.shell(
                    &device,
                    &[
                        "monkey",
                        "-p",
                        package,
                        "-c",
                        "android.intent.category.LAUNCHER",
                        "--wait-dbg",
                        "1",
                    ],
                )?;
            }
        }
        info!("launched {} with the debugger gate held", package);
        Ok(())
    }

    /// The abi tag of the running application, e.g. "64-bit (arm64)".
    pub async fn get_app_abi(
        &self,
        serial: Option<&str>,
        package: &str,
        timeout: Duration,
    ) -> Result<String, InjectError> {
        let deadline = Instant::now() + timeout;
        let device = self.wait_for_device(serial, deadline).await?;
        let process = self.wait_for_process(&device, package, deadline).await?;
        Ok(process.abi)
    }

    async fn wait_for_device(
        &self,
        serial: Option<&str>,
        deadline: Instant,
    ) -> Result<Device, InjectError> {
        loop {
            let devices = self.transport.list_devices()?;
            let found = devices
                .into_iter()
                .find(|device| serial.map_or(true, |serial| device.serial == serial));
            if let Some(device) = found {
                info!("found device, serial={}", device.serial);
                return Ok(device);
            }
            if Instant::now() >= deadline {
                return Err(InjectError::DeviceNotFound(serial.map(str::to_string)));
            }
            time::sleep(DEVICE_POLL_INTERVAL).await;
        }
    }

    async fn wait_for_process(
        &self,
        device: &Device,
        package: &str,
        deadline: Instant,
    ) -> Result<ProcessInfo, InjectError> {
        loop {
            if let Some(process) = self.transport.find_debuggable_process(device, package)? {
                return Ok(process);
            }
            if Instant::now() >= deadline {
                return Err(InjectError::ProcessNotDebuggable(package.to_string()));
            }
            time::sleep(PROCESS_POLL_INTERVAL).await;
        }
    }

    /// Two-hop staging: adb can not write into the app's data directory, so
    /// the file goes to /data/local/tmp first, then a run-as copy (or a root
    /// copy on rooted devices) moves it into /data/data/<package>/.
    fn stage_payload(
        &self,
        device: &Device,
        package: &str,
        local: &Path,
    ) -> Result<String, InjectError> {
        let file_name = local
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| InjectError::PayloadNotFound(local.to_path_buf()))?;
        let tmp_path = format!("/data/local/tmp/{}", file_name);
        let remote_path = format!("/data/data/{}/{}", package, file_name);

        let push_failed = |reason: String| InjectError::PushFailed {
            payload: file_name.to_string(),
            reason,
        };

        self.transport
            .push(device, local, &tmp_path)
            .map_err(|e| push_failed(e.to_string()))?;

        let output = self
            .transport
            .shell(device, &["run-as", package, "cp", &tmp_path, &remote_path])?;
        if !output.trim().is_empty() {
            // run-as refused; retry with root
            let rooted =
                self.transport.is_rooted(device) || self.transport.elevate_to_root(device);
            if !rooted {
                return Err(push_failed(output.trim().to_string()));
            }
            self.transport.shell(device, &["setenforce", "0"])?;
            let output = self
                .transport
                .shell(device, &["cp", &tmp_path, &remote_path])?;
            if !output.trim().is_empty() {
                return Err(push_failed(output.trim().to_string()));
            }
            self.transport
                .shell(device, &["chmod", "777", &remote_path])?;
        }

        info!(
            "pushed file into device, local={}, remote={}",
            local.display(),
            remote_path
        );
        Ok(remote_path)
    }

    /// Compare each staged library's bit width (from the device's `file`
    /// output) against the application's, before any attach.
    fn check_abi(
        &self,
        device: &Device,
        app_abi: &str,
        so_remote_paths: &[String],
    ) -> Result<(), InjectError> {
        let app_bits: u8 = app_abi
            .get(..2)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| InjectError::UnsupportedAbi(app_abi.to_string()))?;

        for so_remote_path in so_remote_paths {
            let output = self.transport.shell(device, &["file", so_remote_path])?;
            let Some(index) = output.find("bit") else {
                continue;
            };
            let Some(payload_bits) = output
                .get(index.saturating_sub(3)..index.saturating_sub(1))
                .and_then(|s| s.parse::<u8>().ok())
            else {
                continue;
            };
            if payload_bits != app_bits {
                let file_name = so_remote_path
                    .rsplit('/')
                    .next()
                    .unwrap_or(so_remote_path)
                    .to_string();
                return Err(InjectError::AbiMismatch {
                    payload: file_name,
                    payload_bits,
                    app_bits,
                });
            }
        }
        Ok(())
    }
}

/// `System.load(path)` inside the target VM.
async fn load_library(
    evaluator: &Evaluator,
    ctx: &EvaluateContext,
    remote_path: &str,
) -> Result<(), String> {
    let result = evaluator
        .evaluate_static(
            ctx,
            "java.lang.System",
            "load",
            "(Ljava/lang/String;)V",
            &[CallArg::from(remote_path)],
        )
        .await
        .map_err(|e| e.to_string())?;
    match result {
        EvaluateResult::Error(message) => Err(message),
        EvaluateResult::Value(_) => Ok(()),
    }
}

fn require_object(result: EvaluateResult, what: &str) -> Result<u64, String> {
    match result {
        EvaluateResult::Error(message) => Err(message),
        EvaluateResult::Value(value) => value
            .object_id()
            .ok_or_else(|| format!("{} evaluated to null", what)),
    }
}

/// Load a payload apk through a DexClassLoader and call its entry point.
///
/// Runs at the attachBaseContext hook: frame 0 holds the application
/// `Context` argument and `this`. The sequence mirrors
///   ClassLoader classLoader = baseContext.getClassLoader();
///   DexClassLoader dexClassLoader = new DexClassLoader(apkPath, codeCachePath, librarySearchPath, classLoader);
///   Class<?> entryClass = Class.forName(ENTRY, true, dexClassLoader);
///   Method entry = entryClass.getDeclaredMethod("entry", Application.class, ClassLoader.class, ClassLoader.class);
///   entry.invoke(null, this, dexClassLoader, classLoader);
async fn inject_apk(
    conn: &JdwpConnection,
    evaluator: &Evaluator,
    event: &BreakpointEvent,
    package: &str,
    apk_remote_path: &str,
) -> Result<(), String> {
    let ctx = &event.context;
    let code_cache_path = format!("/data/data/{}/cache", package);
    let library_search_path = format!("/data/data/{}", package);

    let frames = conn
        .get_frames(ctx.thread, 0, 1)
        .await
        .map_err(|e| e.to_string())?;
    let frame = frames
        .first()
        .ok_or_else(|| "can not get the current stack frame".to_string())?;

    let variables = conn
        .get_variable_table(ctx.class_id, ctx.method_id)
        .await
        .map_err(|e| e.to_string())?;
    let context_var = variables
        .iter()
        .find(|v| v.signature == "Landroid/content/Context;")
        .ok_or_else(|| {
            "can not find the android.content.Context argument of attachBaseContext".to_string()
        })?;

    let values = conn
        .get_frame_values(ctx.thread, frame.frame_id, &[(context_var.slot, tags::OBJECT)])
        .await
        .map_err(|e| e.to_string())?;
    let context_ref = values
        .first()
        .and_then(|v| v.object_id())
        .ok_or_else(|| "the Context argument is null".to_string())?;

    let this_ref = conn
        .get_frame_this_object(ctx.thread, frame.frame_id)
        .await
        .map_err(|e| e.to_string())?;
    if this_ref == 0 {
        return Err("can not get `this` from the current stack frame".to_string());
    }

    info!("evaluating: classLoader = baseContext.getClassLoader()");
    let class_loader = require_object(
        evaluator
            .evaluate_instance(
                ctx,
                context_ref,
                "getClassLoader",
                "()Ljava/lang/ClassLoader;",
                &[],
            )
            .await
            .map_err(|e| e.to_string())?,
        "getClassLoader()",
    )?;

    info!("evaluating: dexClassLoader = new DexClassLoader(...)");
    let dex_class_loader = require_object(
        evaluator
            .evaluate_static(
                ctx,
                "dalvik.system.DexClassLoader",
                "<init>",
                "(Ljava/lang/String;Ljava/lang/String;Ljava/lang/String;Ljava/lang/ClassLoader;)V",
                &[
                    CallArg::from(apk_remote_path),
                    CallArg::Str(code_cache_path),
                    CallArg::Str(library_search_path),
                    CallArg::Object(class_loader),
                ],
            )
            .await
            .map_err(|e| e.to_string())?,
        "new DexClassLoader(...)",
    )?;

    const FOR_NAME_SIG: &str = "(Ljava/lang/String;ZLjava/lang/ClassLoader;)Ljava/lang/Class;";

    info!("evaluating: entryClass = Class.forName(entry, true, dexClassLoader)");
    let entry_class = require_object(
        evaluator
            .evaluate_static(
                ctx,
                "java.lang.Class",
                "forName",
                FOR_NAME_SIG,
                &[
                    CallArg::from(APK_ENTRY_CLASS),
                    CallArg::Bool(true),
                    CallArg::Object(dex_class_loader),
                ],
            )
            .await
            .map_err(|e| e.to_string())?,
        "Class.forName(entry class)",
    )?;

    let class_loader_class = require_object(
        evaluator
            .evaluate_static(
                ctx,
                "java.lang.Class",
                "forName",
                FOR_NAME_SIG,
                &[
                    CallArg::from("java.lang.ClassLoader"),
                    CallArg::Bool(true),
                    CallArg::Object(dex_class_loader),
                ],
            )
            .await
            .map_err(|e| e.to_string())?,
        "Class.forName(java.lang.ClassLoader)",
    )?;

    let application_class = require_object(
        evaluator
            .evaluate_static(
                ctx,
                "java.lang.Class",
                "forName",
                FOR_NAME_SIG,
                &[
                    CallArg::from("android.app.Application"),
                    CallArg::Bool(true),
                    CallArg::Object(class_loader),
                ],
            )
            .await
            .map_err(|e| e.to_string())?,
        "Class.forName(android.app.Application)",
    )?;

    info!("evaluating: entryMethod = entryClass.getDeclaredMethod(...)");
    let entry_method = require_object(
        evaluator
            .evaluate_instance(
                ctx,
                entry_class,
                "getDeclaredMethod",
                "(Ljava/lang/String;[Ljava/lang/Class;)Ljava/lang/reflect/Method;",
                &[
                    CallArg::from(APK_ENTRY_METHOD),
                    CallArg::Object(application_class),
                    CallArg::Object(class_loader_class),
                    CallArg::Object(class_loader_class),
                ],
            )
            .await
            .map_err(|e| e.to_string())?,
        "getDeclaredMethod(entry)",
    )?;

    info!("evaluating: entryMethod.invoke(null, this, dexClassLoader, classLoader)");
    let result = evaluator
        .evaluate_instance(
            ctx,
            entry_method,
            "invoke",
            "(Ljava/lang/Object;[Ljava/lang/Object;)Ljava/lang/Object;",
            &[
                CallArg::Null,
                CallArg::Object(this_ref),
                CallArg::Object(dex_class_loader),
                CallArg::Object(class_loader),
            ],
        )
        .await
        .map_err(|e| e.to_string())?;
    match result {
        EvaluateResult::Error(message) => Err(message),
        EvaluateResult::Value(_) => {
            info!("injected apk {}", apk_remote_path);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_breakpoint() {
        assert_eq!(
            parse_breakpoint("android.app.Activity.onCreate").unwrap(),
            ("android.app.Activity".to_string(), "onCreate".to_string())
        );
        assert!(matches!(
            parse_breakpoint("onCreate"),
            Err(InjectError::BreakpointFormat(_))
        ));
        assert!(matches!(
            parse_breakpoint("trailing."),
            Err(InjectError::BreakpointFormat(_))
        ));
    }

    #[test]
    fn test_default_breakpoint_set() {
        let set = select_breakpoints(false, None).unwrap();
        assert_eq!(set.len(), 4);
        assert_eq!(
            set[0],
            (
                "android.content.ContextWrapper".to_string(),
                "attachBaseContext".to_string()
            )
        );
        assert_eq!(
            set[3],
            (
                "com.unity3d.player.UnityPlayer".to_string(),
                "executeGLThreadJobs".to_string()
            )
        );
    }

    #[test]
    fn test_apk_narrows_breakpoint_set() {
        let set = select_breakpoints(true, Some("android.app.Activity.onCreate")).unwrap();
        assert_eq!(
            set,
            vec![(
                "android.content.ContextWrapper".to_string(),
                "attachBaseContext".to_string()
            )]
        );
    }

    #[test]
    fn test_custom_breakpoint_set() {
        let set = select_breakpoints(
            false,
            Some("android.app.Activity.onCreate,android.os.Looper.myLooper"),
        )
        .unwrap();
        assert_eq!(
            set,
            vec![
                ("android.app.Activity".to_string(), "onCreate".to_string()),
                ("android.os.Looper".to_string(), "myLooper".to_string()),
            ]
        );

        assert!(select_breakpoints(false, Some("bad")).is_err());
    }
}
