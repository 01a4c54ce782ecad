use crate::remote;
use anyhow::{bail, Context, Result};
use log::{info, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wtvb01_lib::registers::{Key, Sample};
use wtvb01_lib::session::{Sensor, Session};
use wtvb01_lib::transport::SerialConnector;

type SharedSession = Arc<Mutex<Session<SerialConnector>>>;

fn unit(key: Key) -> &'static str {
    match key {
        Key::Channel(channel) => channel.quantity().unit(),
        Key::Register(_) => "",
    }
}

pub fn print_console(samples: &[Sample]) {
    println!("--- Data at {} ---", chrono::Local::now().to_rfc3339());
    if samples.is_empty() {
        println!("no values received yet");
    }
    for sample in samples {
        println!("{}: {:.3} {}", sample.key, sample.value, unit(sample.key));
    }
    println!("--------------------------");
}

pub fn to_json(samples: &[Sample]) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    map.insert(
        "timestamp".to_string(),
        serde_json::Value::String(chrono::Utc::now().to_rfc3339()),
    );
    for sample in samples {
        map.insert(sample.key.to_string(), serde_json::json!(sample.value));
    }
    serde_json::Value::Object(map)
}

fn lock(session: &SharedSession) -> std::sync::MutexGuard<'_, Session<SerialConnector>> {
    session.lock().unwrap_or_else(|e| e.into_inner())
}

pub fn run(
    mut session: Session<SerialConnector>,
    interval: Duration,
    listen: Option<String>,
) -> Result<()> {
    info!("Starting monitor mode: interval={interval:?}, listen={listen:?}");
    session.open().with_context(|| "Cannot open device")?;
    session
        .start_acquisition()
        .with_context(|| "Cannot start acquisition")?;
    let session: SharedSession = Arc::new(Mutex::new(session));

    // kept alive for as long as the monitor runs
    let _runtime = match listen {
        Some(addr) => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .with_context(|| "Cannot create async runtime")?;
            let listener = runtime.block_on(remote::bind(&addr))?;
            runtime.spawn(remote::serve(listener, Arc::clone(&session)));
            Some(runtime)
        }
        None => None,
    };

    loop {
        std::thread::sleep(interval);
        let session = lock(&session);
        if let Some(fault) = session.take_fault() {
            bail!("Device stopped: {fault}");
        }
        if !session.is_open() {
            bail!("Device closed");
        }
        if session.is_acquiring() {
            print_console(&session.store().snapshot());
        } else {
            warn!("Acquisition paused, waiting for START");
        }
    }
}
