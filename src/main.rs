#[cfg(target_os = "espidf")]
mod firmware {
    use embassy_executor::{Executor, Spawner};
    use log::{error, info, warn};

    use pup_coordinator::esp::{EspBoard, EspRestart};
    use pup_coordinator::orchestrator::Device;
    use pup_coordinator::Restart;

    // A new image that cannot keep this much heap after startup is rolled back
    const MIN_FREE_HEAP: u32 = 32 * 1024;

    fn self_test() -> bool {
        let free = unsafe { esp_idf_svc::sys::esp_get_free_heap_size() };
        if free < MIN_FREE_HEAP {
            warn!("⚠️ Only {} bytes of heap left after startup", free);
            return false;
        }
        info!("✅ Self-test passed ({} bytes free)", free);
        true
    }

    #[embassy_executor::task]
    async fn device_task(spawner: Spawner) {
        let device = match EspBoard::new(spawner).and_then(|board| Device::bring_up(Box::new(board))) {
            Ok(device) => device,
            Err(e) => {
                error!("❌ Device bring-up failed: {:#}", e);
                EspRestart.restart()
            }
        };

        if let Err(e) = device.run(self_test).await {
            error!("❌ Startup failed: {:#}", e);
        }
        EspRestart.restart()
    }

    pub fn main() -> ! {
        // It is necessary to call this function once. Otherwise some patches to the runtime
        // implemented by esp-idf-sys might not link properly. See https://github.com/esp-rs/esp-idf-template/issues/71
        esp_idf_svc::sys::link_patches();

        // Bind the log crate to the ESP Logging facilities
        esp_idf_svc::log::EspLogger::initialize_default();

        info!("🐶 Starting pup coordinator v{}", env!("CARGO_PKG_VERSION"));

        let executor: &'static mut Executor = Box::leak(Box::new(Executor::new()));
        executor.run(|spawner| {
            if let Err(e) = spawner.spawn(device_task(spawner)) {
                error!("❌ Failed to spawn device task: {:?}", e);
            }
        })
    }
}

#[cfg(target_os = "espidf")]
fn main() {
    firmware::main()
}

// Host build: run the coordinator against the simulated board and exit once started
#[cfg(not(target_os = "espidf"))]
fn main() -> anyhow::Result<()> {
    use std::sync::Arc;

    use pup_coordinator::orchestrator::Device;
    use pup_coordinator::sim::{ProcessRestart, SimBoard};
    use pup_coordinator::store::{MemoryStore, BROKER_KEY, MQTT_NAMESPACE};

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let provisioned = std::env::args().any(|arg| arg == "--provisioned");
    let store = MemoryStore::new().with(MQTT_NAMESPACE, BROKER_KEY, "mqtt://127.0.0.1:1883");
    let board = SimBoard::new(provisioned)
        .with_store(store)
        .with_restart(Arc::new(ProcessRestart));

    let mut device = Device::bring_up(Box::new(board))?;
    let ip = embassy_futures::block_on(device.start(|| true))?;

    log::info!(
        "🐶 {} is up at {} (topics under '{}')",
        device.identity().hostname,
        ip,
        device.topic_base()
    );
    Ok(())
}
