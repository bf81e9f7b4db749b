//! Async driver for the protocol engine
//!
//! Wraps a [`ProtocolEngine`] in one tokio task that serializes the
//! three input sources — serial lines from a dedicated reader thread,
//! user commands from an mpsc channel, and the 250 ms housekeeping
//! tick. The engine itself never runs concurrently with itself, which
//! is the concurrency model the protocol assumes.

use crate::engine::{MacroStore, ProgramSource, ProtocolEngine, TICK_INTERVAL};
use crate::transport::{ConnectionParams, SerialTransport};
use crate::trigger::TaskRunner;
use async_trait::async_trait;
use grblkit_core::{Controller, ControllerError, EventDispatcher, ProtocolEvent};
use parking_lot::RwLock;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

enum DriverMessage {
    Command { name: String, args: serde_json::Value },
    Write(String),
    Close,
}

/// Grbl controller driver
pub struct GrblDriver {
    params: ConnectionParams,
    events: EventDispatcher,
    open: Arc<RwLock<bool>>,
    cmd_tx: Option<mpsc::Sender<DriverMessage>>,
    task: Option<JoinHandle<()>>,
    reader_stop: Option<Arc<AtomicBool>>,
    macros: Option<Arc<dyn MacroStore>>,
    programs: Option<Arc<dyn ProgramSource>>,
    runner: Option<Arc<dyn TaskRunner>>,
}

impl GrblDriver {
    /// Create a driver for the given connection parameters
    pub fn new(params: ConnectionParams) -> Self {
        Self {
            params,
            events: EventDispatcher::default(),
            open: Arc::new(RwLock::new(false)),
            cmd_tx: None,
            task: None,
            reader_stop: None,
            macros: None,
            programs: None,
            runner: None,
        }
    }

    /// Attach the external macro store
    pub fn with_macro_store(mut self, store: Arc<dyn MacroStore>) -> Self {
        self.macros = Some(store);
        self
    }

    /// Attach the external watch-directory loader
    pub fn with_program_source(mut self, source: Arc<dyn ProgramSource>) -> Self {
        self.programs = Some(source);
        self
    }

    /// Attach the external task runner
    pub fn with_task_runner(mut self, runner: Arc<dyn TaskRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    async fn send(&self, msg: DriverMessage) -> anyhow::Result<()> {
        let tx = self
            .cmd_tx
            .as_ref()
            .ok_or(ControllerError::NotOpen)?
            .clone();
        tx.send(msg)
            .await
            .map_err(|_| anyhow::anyhow!("Driver task is gone"))?;
        Ok(())
    }
}

#[async_trait]
impl Controller for GrblDriver {
    fn controller_type(&self) -> &str {
        "Grbl"
    }

    fn is_open(&self) -> bool {
        *self.open.read()
    }

    async fn open(&mut self) -> anyhow::Result<()> {
        if self.is_open() {
            tracing::error!("Cannot open port \"{}\" twice", self.params.port);
            return Err(ControllerError::AlreadyOpen.into());
        }

        let transport = SerialTransport::open(&self.params)?;
        let reader_port = transport.clone_reader()?;

        let mut engine = ProtocolEngine::with_events(self.events.clone());
        if let Some(store) = &self.macros {
            engine.set_macro_store(store.clone());
        }
        if let Some(source) = &self.programs {
            engine.set_program_source(source.clone());
        }
        if let Some(runner) = &self.runner {
            engine.set_task_runner(runner.clone());
        }
        engine.open(Box::new(transport))?;

        let (line_tx, line_rx) = mpsc::channel::<String>(256);
        let (cmd_tx, cmd_rx) = mpsc::channel::<DriverMessage>(64);

        let stop = Arc::new(AtomicBool::new(false));
        spawn_reader(reader_port, line_tx, stop.clone())?;

        let open_flag = self.open.clone();
        *open_flag.write() = true;

        let task = tokio::spawn(run_engine_loop(engine, line_rx, cmd_rx, open_flag));

        self.cmd_tx = Some(cmd_tx);
        self.task = Some(task);
        self.reader_stop = Some(stop);
        Ok(())
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        if let Some(stop) = self.reader_stop.take() {
            stop.store(true, Ordering::Relaxed);
        }
        if let Some(tx) = self.cmd_tx.take() {
            let _ = tx.send(DriverMessage::Close).await;
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        *self.open.write() = false;
        Ok(())
    }

    async fn command(&mut self, name: &str, args: serde_json::Value) -> anyhow::Result<()> {
        self.send(DriverMessage::Command {
            name: name.to_string(),
            args,
        })
        .await
    }

    async fn write(&mut self, data: &str) -> anyhow::Result<()> {
        self.send(DriverMessage::Write(data.to_string())).await
    }

    fn subscribe(&self) -> broadcast::Receiver<ProtocolEvent> {
        self.events.subscribe()
    }
}

/// The single task that owns the engine
async fn run_engine_loop(
    mut engine: ProtocolEngine,
    mut line_rx: mpsc::Receiver<String>,
    mut cmd_rx: mpsc::Receiver<DriverMessage>,
    open_flag: Arc<RwLock<bool>>,
) {
    let mut interval = tokio::time::interval(TICK_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            line = line_rx.recv() => match line {
                Some(line) => engine.on_line(&line),
                None => {
                    // Reader is gone: the port disconnected underneath us
                    tracing::warn!("Serial reader stopped; closing port");
                    engine.close();
                    break;
                }
            },
            msg = cmd_rx.recv() => match msg {
                Some(DriverMessage::Command { name, args }) => {
                    if let Err(e) = engine.command_by_name(&name, &args) {
                        tracing::error!("Command {} failed: {}", name, e);
                    }
                }
                Some(DriverMessage::Write(data)) => engine.write(&data),
                Some(DriverMessage::Close) | None => {
                    engine.close();
                    break;
                }
            },
            _ = interval.tick() => engine.tick(),
        }
    }

    *open_flag.write() = false;
    engine.destroy();
}

/// Blocking reader thread: accumulates bytes from the port and hands
/// complete lines to the engine task
fn spawn_reader(
    mut port: Box<dyn serialport::SerialPort>,
    line_tx: mpsc::Sender<String>,
    stop: Arc<AtomicBool>,
) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name("grbl-serial-reader".to_string())
        .spawn(move || {
            let mut buffer: Vec<u8> = Vec::new();
            let mut chunk = [0u8; 256];

            while !stop.load(Ordering::Relaxed) {
                match port.read(&mut chunk) {
                    Ok(0) => {}
                    Ok(n) => {
                        buffer.extend_from_slice(&chunk[..n]);
                        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                            let line: Vec<u8> = buffer.drain(..=pos).collect();
                            let text = String::from_utf8_lossy(&line).trim().to_string();
                            if !text.is_empty()
                                && line_tx.blocking_send(text).is_err()
                            {
                                return;
                            }
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(e) => {
                        tracing::error!("Serial read failed: {}", e);
                        return;
                    }
                }
            }
        })?;
    Ok(())
}
