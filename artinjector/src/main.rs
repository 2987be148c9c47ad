use anyhow::Result;
use artinjector::{AdbTransport, ArtInjector, InjectOptions};
use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser)]
#[command(
    name = "artinjector",
    about = "Inject shared libraries and apks into a debuggable Android app over JDWP"
)]
struct Cli {
    /// Package name of the target application
    #[arg(short = 'p', long = "package")]
    package: String,

    /// Payloads to inject (.so or .apk), repeatable
    #[arg(short = 'i', long = "inject", required = true, num_args = 1..)]
    payloads: Vec<PathBuf>,

    /// Device serial; defaults to the first connected device
    #[arg(short = 's', long = "serial")]
    serial: Option<String>,

    /// Comma-separated Class.method breakpoints overriding the default set
    #[arg(short = 'b', long = "breakpoints")]
    breakpoints: Option<String>,

    /// Overall timeout in milliseconds
    #[arg(short = 't', long = "timeout", default_value_t = 10_000)]
    timeout_ms: u64,

    /// Launch the app with the debugger gate held before injecting
    #[arg(long = "launch")]
    launch: bool,

    /// Activity to start with --launch; defaults to the launcher activity
    #[arg(long = "activity", requires = "launch")]
    activity: Option<String>,

    /// Path to the adb binary
    #[arg(long = "adb", default_value = "adb")]
    adb: PathBuf,

    /// Print the outcome as JSON on stdout
    #[arg(long = "json")]
    json: bool,
}

#[derive(Serialize)]
struct Outcome {
    ok: bool,
    code: i32,
    error: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("artinjector=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let timeout = Duration::from_millis(cli.timeout_ms);

    let injector = ArtInjector::new(AdbTransport::new(&cli.adb));

    if cli.launch {
        injector
            .launch_application(
                cli.serial.as_deref(),
                &cli.package,
                cli.activity.as_deref(),
                timeout,
            )
            .await?;
    }

    let options = InjectOptions {
        serial: cli.serial.clone(),
        package: cli.package.clone(),
        payloads: cli.payloads.clone(),
        breakpoints: cli.breakpoints.clone(),
        timeout,
    };

    match injector.inject(&options).await {
        Ok(()) => {
            info!("inject ok");
            if cli.json {
                let outcome = Outcome {
                    ok: true,
                    code: 0,
                    error: None,
                };
                println!("{}", serde_json::to_string(&outcome)?);
            }
            Ok(())
        }
        Err(e) => {
            let code = e.code();
            error!("inject failed (code {}): {}", code, e);
            if cli.json {
                let outcome = Outcome {
                    ok: false,
                    code,
                    error: Some(e.to_string()),
                };
                println!("{}", serde_json::to_string(&outcome)?);
            }
            std::process::exit(code);
        }
    }
}
