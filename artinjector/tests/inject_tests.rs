// End-to-end orchestrator tests: a scripted transport stands in for adb and
// the in-process fake VM stands in for the target application.

use artinjector::error::codes;
use artinjector::{ArtInjector, Device, InjectError, InjectOptions, ProcessInfo, Transport};
use jdwp_client::testvm::FakeVmBuilder;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

#[derive(Clone)]
struct MockTransport {
    devices: Vec<Device>,
    process: Option<ProcessInfo>,
    file_output: String,
    shell_log: Arc<Mutex<Vec<String>>>,
    pushes: Arc<Mutex<Vec<(PathBuf, String)>>>,
}

impl MockTransport {
    fn new(debug_port: u16, abi: &str, file_output: &str) -> Self {
        Self {
            devices: vec![Device {
                serial: "emulator-5554".to_string(),
            }],
            process: Some(ProcessInfo {
                pid: 4242,
                debug_port,
                abi: abi.to_string(),
            }),
            file_output: file_output.to_string(),
            shell_log: Arc::new(Mutex::new(Vec::new())),
            pushes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn shell_log(&self) -> Vec<String> {
        self.shell_log.lock().unwrap().clone()
    }

    fn pushes(&self) -> Vec<(PathBuf, String)> {
        self.pushes.lock().unwrap().clone()
    }
}

impl Transport for MockTransport {
    fn list_devices(&self) -> Result<Vec<Device>, InjectError> {
        Ok(self.devices.clone())
    }

    fn find_debuggable_process(
        &self,
        _device: &Device,
        _package: &str,
    ) -> Result<Option<ProcessInfo>, InjectError> {
        Ok(self.process.clone())
    }

    fn push(&self, _device: &Device, local: &Path, remote: &str) -> Result<(), InjectError> {
        self.pushes
            .lock()
            .unwrap()
            .push((local.to_path_buf(), remote.to_string()));
        Ok(())
    }

    fn shell(&self, _device: &Device, args: &[&str]) -> Result<String, InjectError> {
        let command = args.join(" ");
        self.shell_log.lock().unwrap().push(command);
        if args.first() == Some(&"file") {
            return Ok(self.file_output.clone());
        }
        Ok(String::new())
    }

    fn is_rooted(&self, _device: &Device) -> bool {
        false
    }

    fn elevate_to_root(&self, _device: &Device) -> bool {
        false
    }
}

fn write_payload(dir: &TempDir, name: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, b"\x7fELF payload").unwrap();
    path
}

fn write_apk(dir: &TempDir, name: &str, lib_entry: &str) -> PathBuf {
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    let path = dir.path().join(name);
    let file = std::fs::File::create(&path).unwrap();
    let mut writer = zip::ZipWriter::new(file);
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    writer.start_file(lib_entry, options).unwrap();
    writer.write_all(b"\x7fELF hook").unwrap();
    writer.finish().unwrap();
    path
}

fn options(payloads: Vec<PathBuf>, timeout: Duration) -> InjectOptions {
    InjectOptions {
        serial: None,
        package: "com.example.app".to_string(),
        payloads,
        breakpoints: None,
        timeout,
    }
}

const ELF64: &str = "/data/data/com.example.app/libnative.so: ELF 64-bit LSB shared object, ARM aarch64";
const ELF32: &str = "/data/data/com.example.app/libnative.so: ELF 32-bit LSB shared object, ARM";

#[tokio::test]
async fn missing_payload_fails_before_touching_the_device() {
    let transport = MockTransport::new(1, "64-bit (arm64)", ELF64);
    let injector = ArtInjector::new(transport.clone());

    let opts = options(
        vec![PathBuf::from("/nonexistent/libnative.so")],
        Duration::from_secs(1),
    );
    let err = injector.inject(&opts).await.unwrap_err();

    assert!(matches!(err, InjectError::PayloadNotFound(_)));
    assert_eq!(err.code(), codes::PAYLOAD_NOT_FOUND);
    assert!(transport.shell_log().is_empty());
    assert!(transport.pushes().is_empty());
}

#[tokio::test]
async fn abi_mismatch_fails_before_any_attach() {
    // debug port 1 is not listening; reaching the attach phase would surface
    // AttachFailed instead of AbiMismatch
    let transport = MockTransport::new(1, "64-bit (arm64)", ELF32);
    let injector = ArtInjector::new(transport.clone());

    let dir = TempDir::new().unwrap();
    let payload = write_payload(&dir, "libnative.so");
    let err = injector
        .inject(&options(vec![payload], Duration::from_secs(2)))
        .await
        .unwrap_err();

    match &err {
        InjectError::AbiMismatch {
            payload,
            payload_bits,
            app_bits,
        } => {
            assert_eq!(payload, "libnative.so");
            assert_eq!(*payload_bits, 32);
            assert_eq!(*app_bits, 64);
        }
        other => panic!("expected AbiMismatch, got {:?}", other),
    }
    assert_eq!(err.code(), codes::PAYLOAD_SHOULD_BE_64BIT);
}

#[tokio::test]
async fn breakpoint_timeout_disposes_the_session() {
    // no breakpoint class is loaded and nothing ever fires
    let vm = FakeVmBuilder::new().start().await;
    let transport = MockTransport::new(vm.port, "64-bit (arm64)", ELF64);
    let injector = ArtInjector::new(transport);

    let dir = TempDir::new().unwrap();
    let payload = write_payload(&dir, "libnative.so");

    let started = std::time::Instant::now();
    let err = injector
        .inject(&options(vec![payload], Duration::from_millis(500)))
        .await
        .unwrap_err();

    assert!(matches!(err, InjectError::BreakpointTimeout(_)));
    assert_eq!(err.code(), codes::BREAKPOINT_TIMEOUT);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(vm.disposed());
}

#[tokio::test]
async fn injects_library_on_main_thread_hit() {
    let vm = FakeVmBuilder::new()
        .class(
            "android.content.ContextWrapper",
            &[("attachBaseContext", "(Landroid/content/Context;)V")],
        )
        .fire_on(
            "android.content.ContextWrapper",
            "attachBaseContext",
            Duration::from_millis(100),
            1,
        )
        .start()
        .await;
    let transport = MockTransport::new(vm.port, "64-bit (arm64)", ELF64);
    let injector = ArtInjector::new(transport.clone());

    let dir = TempDir::new().unwrap();
    let payload = write_payload(&dir, "libnative.so");

    injector
        .inject(&options(vec![payload.clone()], Duration::from_secs(5)))
        .await
        .unwrap();

    // staged via /data/local/tmp, then copied into the app data dir
    assert_eq!(
        transport.pushes(),
        vec![(payload, "/data/local/tmp/libnative.so".to_string())]
    );
    assert!(transport.shell_log().iter().any(|cmd| cmd
        == "run-as com.example.app cp /data/local/tmp/libnative.so /data/data/com.example.app/libnative.so"));

    assert_eq!(
        vm.loads(),
        vec!["/data/data/com.example.app/libnative.so".to_string()]
    );
    assert!(vm.disposed());
}

#[tokio::test]
async fn injects_apk_through_the_entry_point_sequence() {
    let vm = FakeVmBuilder::new()
        .class(
            "android.content.ContextWrapper",
            &[("attachBaseContext", "(Landroid/content/Context;)V")],
        )
        .class(
            "android.app.ContextImpl",
            &[("getClassLoader", "()Ljava/lang/ClassLoader;")],
        )
        .class("java.lang.ClassLoader", &[])
        .class(
            "dalvik.system.DexClassLoader",
            &[(
                "<init>",
                "(Ljava/lang/String;Ljava/lang/String;Ljava/lang/String;Ljava/lang/ClassLoader;)V",
            )],
        )
        .class(
            "java.lang.Class",
            &[
                (
                    "forName",
                    "(Ljava/lang/String;ZLjava/lang/ClassLoader;)Ljava/lang/Class;",
                ),
                (
                    "getDeclaredMethod",
                    "(Ljava/lang/String;[Ljava/lang/Class;)Ljava/lang/reflect/Method;",
                ),
            ],
        )
        .class(
            "java.lang.reflect.Method",
            &[(
                "invoke",
                "(Ljava/lang/Object;[Ljava/lang/Object;)Ljava/lang/Object;",
            )],
        )
        .frame_context_class("android.app.ContextImpl")
        .fire_on(
            "android.content.ContextWrapper",
            "attachBaseContext",
            Duration::from_millis(100),
            1,
        )
        .start()
        .await;
    let transport = MockTransport::new(vm.port, "64-bit (arm64)", ELF64);
    let injector = ArtInjector::new(transport.clone());

    let dir = TempDir::new().unwrap();
    let apk = write_apk(&dir, "payload.apk", "lib/arm64-v8a/libhook.so");

    injector
        .inject(&options(vec![apk], Duration::from_secs(5)))
        .await
        .unwrap();

    // apk mode arms the single attachBaseContext hook
    assert_eq!(vm.armed_request_ids().len(), 1);

    // the apk and its abi-matching native library both go through staging
    let pushes = transport.pushes();
    assert_eq!(pushes[0].1, "/data/local/tmp/payload.apk");
    assert!(pushes
        .iter()
        .any(|(_, remote)| remote == "/data/local/tmp/libhook.so"));

    let invocations = vm.invocations();
    let calls: Vec<(&str, &str)> = invocations
        .iter()
        .map(|(class, method, _)| (class.as_str(), method.as_str()))
        .collect();
    assert_eq!(
        calls,
        vec![
            ("android.app.ContextImpl", "getClassLoader"),
            ("dalvik.system.DexClassLoader", "<init>"),
            ("java.lang.Class", "forName"),
            ("java.lang.Class", "forName"),
            ("java.lang.Class", "forName"),
            ("java.lang.Class", "getDeclaredMethod"),
            ("java.lang.reflect.Method", "invoke"),
        ]
    );

    // DexClassLoader gets the staged apk, the code cache, and the data dir
    let dex_args = &invocations[1].2;
    assert_eq!(dex_args[0], "/data/data/com.example.app/payload.apk");
    assert_eq!(dex_args[1], "/data/data/com.example.app/cache");
    assert_eq!(dex_args[2], "/data/data/com.example.app");

    // the first forName resolves the entry class through the dex loader
    assert_eq!(invocations[2].2[0], "com.artinjector.EntryPoint");
    assert_eq!(invocations[2].2[1], "true");
    assert_eq!(invocations[5].2[0], "entry");

    // static invoke: null receiver, then application, dex loader, origin loader
    let invoke_args = &invocations[6].2;
    assert_eq!(invoke_args.len(), 4);
    assert_eq!(invoke_args[0], "null");

    assert!(vm.disposed());
}

#[tokio::test]
async fn duplicate_hits_load_the_payload_once() {
    let vm = FakeVmBuilder::new()
        .class(
            "android.content.ContextWrapper",
            &[("attachBaseContext", "(Landroid/content/Context;)V")],
        )
        .fire_on(
            "android.content.ContextWrapper",
            "attachBaseContext",
            Duration::from_millis(50),
            2,
        )
        .start()
        .await;
    let transport = MockTransport::new(vm.port, "64-bit (arm64)", ELF64);
    let injector = ArtInjector::new(transport);

    let dir = TempDir::new().unwrap();
    let payload = write_payload(&dir, "libnative.so");

    injector
        .inject(&options(vec![payload], Duration::from_secs(5)))
        .await
        .unwrap();

    // let the second firing land before asserting
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        vm.loads(),
        vec!["/data/data/com.example.app/libnative.so".to_string()]
    );
}

#[tokio::test]
async fn remote_load_failure_surfaces_the_linker_error() {
    let vm = FakeVmBuilder::new()
        .class(
            "android.content.ContextWrapper",
            &[("attachBaseContext", "(Landroid/content/Context;)V")],
        )
        .fire_on(
            "android.content.ContextWrapper",
            "attachBaseContext",
            Duration::from_millis(100),
            1,
        )
        .fail_load(
            "dlopen failed: \"/data/data/com.example.app/libnative.so\" \
             is 32-bit instead of 64-bit",
        )
        .start()
        .await;
    let transport = MockTransport::new(vm.port, "64-bit (arm64)", ELF64);
    let injector = ArtInjector::new(transport);

    let dir = TempDir::new().unwrap();
    let payload = write_payload(&dir, "libnative.so");

    let err = injector
        .inject(&options(vec![payload], Duration::from_secs(5)))
        .await
        .unwrap_err();

    match &err {
        InjectError::RemoteInvocation(message) => {
            assert!(message.contains("java.lang.UnsatisfiedLinkError"), "{}", message);
            assert!(message.contains("32-bit instead of 64-bit"), "{}", message);
        }
        other => panic!("expected RemoteInvocation, got {:?}", other),
    }
    assert_eq!(err.code(), codes::PAYLOAD_SHOULD_BE_64BIT);
    assert!(vm.loads().is_empty());
    assert!(vm.disposed());
}

#[tokio::test]
async fn hits_on_other_threads_are_ignored() {
    let vm = FakeVmBuilder::new()
        .class("android.os.Looper", &[("myLooper", "()Landroid/os/Looper;")])
        .fire_on("android.os.Looper", "myLooper", Duration::from_millis(50), 1)
        .thread_name("GLThread 72")
        .start()
        .await;
    let transport = MockTransport::new(vm.port, "64-bit (arm64)", ELF64);
    let injector = ArtInjector::new(transport);

    let dir = TempDir::new().unwrap();
    let payload = write_payload(&dir, "libnative.so");

    let err = injector
        .inject(&options(vec![payload], Duration::from_millis(800)))
        .await
        .unwrap_err();

    assert!(matches!(err, InjectError::BreakpointTimeout(_)));
    assert!(vm.loads().is_empty());
}
