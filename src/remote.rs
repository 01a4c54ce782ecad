//! Line oriented TCP remote control: `START` / `STOP` toggle acquisition.

use anyhow::{Context, Result};
use log::{info, warn};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use wtvb01_lib::session::Sensor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteCommand {
    Start,
    Stop,
}

pub fn parse_command(line: &str) -> Option<RemoteCommand> {
    match line.trim().to_ascii_uppercase().as_str() {
        "START" => Some(RemoteCommand::Start),
        "STOP" => Some(RemoteCommand::Stop),
        _ => None,
    }
}

pub async fn bind(addr: &str) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Cannot listen on {addr}"))?;
    info!("Remote control listening on {}", listener.local_addr()?);
    Ok(listener)
}

/// Accepts clients forever, every client is served on its own task.
pub async fn serve<S>(listener: TcpListener, sensor: Arc<Mutex<S>>)
where
    S: Sensor + Send + 'static,
{
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                info!("Remote control client {peer} connected");
                let sensor = Arc::clone(&sensor);
                tokio::spawn(async move {
                    if let Err(err) = handle_client(stream, sensor).await {
                        warn!("Remote control client {peer}: {err:#}");
                    }
                    info!("Remote control client {peer} disconnected");
                });
            }
            Err(err) => warn!("Cannot accept remote control client: {err}"),
        }
    }
}

async fn handle_client<S>(stream: TcpStream, sensor: Arc<Mutex<S>>) -> Result<()>
where
    S: Sensor + Send + 'static,
{
    let mut lines = BufReader::new(stream).lines();
    while let Some(line) = lines.next_line().await? {
        let Some(command) = parse_command(&line) else {
            warn!("Ignoring remote command {line:?}");
            continue;
        };
        info!("Remote command {command:?}");
        let sensor = Arc::clone(&sensor);
        // start/stop may wait for the polling thread, keep that off the runtime
        tokio::task::spawn_blocking(move || {
            let mut sensor = sensor.lock().unwrap_or_else(|e| e.into_inner());
            match command {
                RemoteCommand::Start => sensor.start_acquisition(),
                RemoteCommand::Stop => {
                    sensor.stop_acquisition();
                    Ok(())
                }
            }
        })
        .await?
        .with_context(|| format!("Remote command {command:?} failed"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use wtvb01_lib::registers::Channel;

    #[derive(Default)]
    struct RecordingSensor {
        calls: Vec<&'static str>,
    }

    impl Sensor for RecordingSensor {
        fn open(&mut self) -> wtvb01_lib::Result<()> {
            Ok(())
        }
        fn close(&mut self) {}
        fn start_acquisition(&mut self) -> wtvb01_lib::Result<()> {
            self.calls.push("start");
            Ok(())
        }
        fn stop_acquisition(&mut self) {
            self.calls.push("stop");
        }
        fn read_all_channels(&self) -> wtvb01_lib::Result<()> {
            Ok(())
        }
        fn write_register(&self, _register: u16, _value: u16) -> wtvb01_lib::Result<()> {
            Ok(())
        }
        fn get(&self, _channel: Channel) -> Option<f64> {
            None
        }
    }

    #[test]
    fn commands_are_case_insensitive() {
        assert_eq!(parse_command("START"), Some(RemoteCommand::Start));
        assert_eq!(parse_command(" stop\r"), Some(RemoteCommand::Stop));
        assert_eq!(parse_command("restart"), None);
        assert_eq!(parse_command(""), None);
    }

    #[tokio::test]
    async fn forwards_commands_to_sensor() {
        let sensor = Arc::new(Mutex::new(RecordingSensor::default()));
        let listener = bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, Arc::clone(&sensor)));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"START\nhello\nstop\n").await.unwrap();
        client.flush().await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if sensor.lock().unwrap().calls.len() == 2 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "commands not forwarded");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(sensor.lock().unwrap().calls, vec!["start", "stop"]);
    }
}
