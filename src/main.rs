//! droidpilot CLI: run one natural-language task against a connected device.
//!
//! Configuration comes from the environment (and an optional `.env` file):
//! `MODEL_BASE_URL`, `MODEL_API_KEY`, `MODEL_NAME`, `ADB_DEVICE_ID`,
//! `AGENT_LANG`, `MAX_STEPS`, `RECORD_SCRIPT`, `SCRIPT_OUTPUT_DIR`.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use droidpilot::actions::{Action, ActionDispatcher, AutoApprove, AutoCancelTakeover};
use droidpilot::adb::{Adb, ConnectionManager, DeviceControl};
use droidpilot::agent::AgentConfig;
use droidpilot::config::{self, Language};
use droidpilot::model::{ModelClient, ModelConfig};
use droidpilot::session::{SessionManager, TaskEvent};
use droidpilot::storage::{MemoryBlobStore, MemoryTaskStore};
use droidpilot::tracker::ScriptFile;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "droidpilot=info".into()),
        )
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let language = Language::from_code(&env::var("AGENT_LANG").unwrap_or_default());

    match args.first().map(String::as_str) {
        Some("--list-apps") => {
            for name in config::list_supported() {
                println!("{}", name);
            }
            return Ok(());
        }
        Some("--devices") => {
            let manager = ConnectionManager::new(language);
            let devices = manager.list_devices(&CancellationToken::new()).await?;
            if devices.is_empty() {
                println!("no devices attached");
            }
            for d in devices {
                println!(
                    "{}\t{:?}\t{:?}\t{}",
                    d.device_id,
                    d.status,
                    d.connection_type,
                    d.model.as_deref().unwrap_or("-")
                );
            }
            return Ok(());
        }
        Some("--connect") => {
            let address = args.get(1).context("usage: droidpilot --connect <host[:port]>")?;
            let manager = ConnectionManager::new(language);
            let (ok, message) = manager.connect(address, &CancellationToken::new()).await;
            println!("{}", message);
            if !ok {
                std::process::exit(1);
            }
            return Ok(());
        }
        Some("--replay") => {
            let path = args
                .get(1)
                .context("usage: droidpilot --replay <script.json>")?;
            return replay_script(path, language).await;
        }
        None => bail!(
            "usage: droidpilot <task description> | --list-apps | --devices | --connect <addr> | --replay <script.json>"
        ),
        _ => {}
    }
    let task = args.join(" ");

    let base_url =
        env::var("MODEL_BASE_URL").unwrap_or_else(|_| "http://localhost:8000/v1".to_string());
    let api_key = env::var("MODEL_API_KEY").unwrap_or_else(|_| "EMPTY".to_string());
    let model_name = env::var("MODEL_NAME").unwrap_or_else(|_| "autoglm-phone-9b".to_string());

    let model_config = ModelConfig::default()
        .with_base_url(&base_url)
        .with_api_key(api_key)
        .with_model_name(&model_name);

    let mut agent_config = AgentConfig::default().with_language(language);
    if let Ok(id) = env::var("ADB_DEVICE_ID") {
        agent_config = agent_config.with_device_id(id);
    }
    if let Ok(steps) = env::var("MAX_STEPS") {
        agent_config = agent_config.with_max_steps(
            steps
                .parse()
                .context("MAX_STEPS must be a positive integer")?,
        );
    }
    if env::var("RECORD_SCRIPT").map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        == Ok(true)
    {
        let dir = env::var("SCRIPT_OUTPUT_DIR").unwrap_or_else(|_| "scripts".to_string());
        agent_config = agent_config.with_script_recording(dir);
    }

    let device = Arc::new(Adb::new());
    device
        .check_available()
        .await
        .context("adb not found; install Android SDK platform-tools and add it to PATH")?;

    println!("droidpilot, model {} @ {}", model_name, base_url);
    println!("task: {}\n", task);

    let model = Arc::new(ModelClient::new(model_config));
    let manager = SessionManager::new(
        model.clone(),
        device,
        MemoryTaskStore::shared(),
        MemoryBlobStore::shared(),
        Arc::new(AutoApprove),
        Arc::new(AutoCancelTakeover),
        agent_config,
    );

    let session = manager.create_session(None);
    let mut events = manager.subscribe(session)?;
    manager.start(session, task, None).await?;

    // ctrl-c maps to cooperative task cancellation
    let stopper = manager.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = stopper.stop(session).await;
        }
    });

    while let Some(event) = events.recv().await {
        match &event {
            TaskEvent::StepUpdate {
                step_number,
                thought,
                action,
                success,
                ..
            } => {
                println!("step {} [{}]", step_number, if *success { "ok" } else { "failed" });
                if !thought.is_empty() {
                    println!("  thought: {}", thought);
                }
                println!("  action: {}", action);
            }
            TaskEvent::Overflow { dropped, .. } => {
                println!("warning: {} step(s) dropped from the trace buffer", dropped);
            }
            TaskEvent::Terminal {
                status, message, ..
            } => {
                println!("\nresult [{:?}]: {}", status, message);
                break;
            }
            TaskEvent::Disconnected { reason } => {
                println!("event stream disconnected: {}", reason);
                break;
            }
        }
    }

    let stats = model.monitor().summary();
    if stats.total_requests > 0 {
        println!(
            "model requests: {} ({}% ok, avg {:.0}ms)",
            stats.total_requests,
            (stats.success_rate * 100.0).round(),
            stats.average_duration_ms
        );
    }

    Ok(())
}

/// Replay a recorded script against the connected device. Each step's action
/// runs through the dispatcher, so the recorded relative coordinates are
/// mapped against the live screen at replay time.
async fn replay_script(path: &str, language: Language) -> anyhow::Result<()> {
    let script = ScriptFile::load(path).with_context(|| format!("cannot load {}", path))?;
    print!("{}", script.summary());

    let device = Arc::new(Adb::new());
    device
        .check_available()
        .await
        .context("adb not found; install Android SDK platform-tools and add it to PATH")?;

    let device_id = env::var("ADB_DEVICE_ID")
        .ok()
        .or_else(|| script.metadata.device_id.clone());
    let dispatcher = ActionDispatcher::new(
        device.clone(),
        device_id.clone(),
        Arc::new(AutoApprove),
        Arc::new(AutoCancelTakeover),
        language,
    );
    let cancel = CancellationToken::new();
    let total = script.steps.len();
    let mut replayed = 0usize;

    for step in &script.steps {
        println!("\n--- step {}/{}: {} ---", step.step_number, total, step.action_type);
        if !step.success {
            println!(
                "skipping step that failed when recorded: {}",
                step.error_message.as_deref().unwrap_or("unknown error")
            );
            continue;
        }
        let Some(action) = Action::from_json(&step.action) else {
            println!("skipping unreplayable action payload");
            continue;
        };

        let shot = device.screenshot(device_id.as_deref(), &cancel).await?;
        let outcome = dispatcher
            .execute(&action, (shot.width, shot.height), &cancel)
            .await?;
        if outcome.success {
            replayed += 1;
        } else {
            println!(
                "step did not take effect: {}",
                outcome.user_message.as_deref().unwrap_or("unknown")
            );
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    println!("\nreplay finished: {}/{} steps executed", replayed, total);
    Ok(())
}
