// Device workers: one fixed-tick loop per device
//
// Each tick: connect if needed, drain queued commands, run one device
// exchange, publish the snapshot. Device I/O is blocking and runs on the
// blocking pool; the device value moves there and back every call, so the
// loop task is its only owner.

mod panel;
mod servo;
mod stage;

pub use panel::PanelDevice;
pub use servo::ServoDevice;
pub use stage::StageDevice;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{MissedTickBehavior, interval, sleep};
use tracing::{error, info, warn};

use crate::error::{DeviceError, Result, TransportError};
use crate::link::{PortLink, PortSettings, SerialLink};
use crate::messages::{
    PanelCommand, PanelReading, ServoCommand, ServoReading, Snapshot, StageCommand, StageReading,
    unix_millis,
};

/// Opens a fresh link on every (re)connect
pub type Connector =
    Box<dyn FnMut() -> std::result::Result<Box<dyn SerialLink>, TransportError> + Send>;

/// Connector for an OS serial port
pub fn port_connector(settings: PortSettings) -> Connector {
    Box::new(move || {
        let link = PortLink::open(&settings)?;
        Ok(Box::new(link) as Box<dyn SerialLink>)
    })
}

/// One hardware device driven by a worker loop
///
/// All methods block on I/O; the runner calls them off the async threads.
pub trait Device: Send + 'static {
    type Command: Send + 'static;
    type Reading: Clone + Default + Send + 'static;

    fn name(&self) -> &str;

    fn is_connected(&self) -> bool;

    fn connect(&mut self) -> Result<()>;

    /// Release the link; never fails
    fn disconnect(&mut self);

    /// Apply the drained commands, then read the device
    fn tick(&mut self, commands: Vec<Self::Command>) -> Result<Self::Reading>;
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub tick: Duration,
    pub reconnect_delay: Duration,
}

impl WorkerSettings {
    pub fn from_millis(tick_ms: u64, reconnect_delay_ms: u64) -> Self {
        Self {
            tick: Duration::from_millis(tick_ms),
            reconnect_delay: Duration::from_millis(reconnect_delay_ms),
        }
    }
}

struct Shared<C, R> {
    pending: VecDeque<C>,
    snapshot: Snapshot<R>,
}

type SharedState<C, R> = Arc<Mutex<Shared<C, R>>>;

fn lock<C, R>(shared: &SharedState<C, R>) -> MutexGuard<'_, Shared<C, R>> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to a running worker: submit commands, read status, shut down
pub struct WorkerHandle<C, R> {
    name: String,
    shared: SharedState<C, R>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub type StageWorker = WorkerHandle<StageCommand, StageReading>;
pub type PanelWorker = WorkerHandle<PanelCommand, PanelReading>;
pub type ServoWorker = WorkerHandle<ServoCommand, ServoReading>;

impl<C: Send + 'static, R: Clone + Default + Send + 'static> WorkerHandle<C, R> {
    /// Start the loop on the current tokio runtime
    pub fn spawn<D>(device: D, settings: WorkerSettings) -> Self
    where
        D: Device<Command = C, Reading = R>,
    {
        let name = device.name().to_string();
        let shared = Arc::new(Mutex::new(Shared {
            pending: VecDeque::new(),
            snapshot: Snapshot::default(),
        }));
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run_worker(device, Arc::clone(&shared), settings, stop_rx));
        Self {
            name,
            shared,
            stop,
            task,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a command for the next tick; never blocks on I/O
    pub fn submit(&self, command: C) {
        lock(&self.shared).pending.push_back(command);
    }

    /// Copy of the latest snapshot
    pub fn status(&self) -> Snapshot<R> {
        lock(&self.shared).snapshot.clone()
    }

    /// Signal stop and wait for the current tick and the final disconnect
    pub async fn shutdown(self) {
        info!("Stopping {} worker...", self.name);
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            error!("{} worker task failed: {}", self.name, e);
        }
    }
}

/// Run `f` against the device on the blocking pool and hand the device back
async fn on_blocking_pool<D, T, F>(mut device: D, f: F) -> std::result::Result<(D, T), JoinError>
where
    D: Send + 'static,
    T: Send + 'static,
    F: FnOnce(&mut D) -> T + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let out = f(&mut device);
        (device, out)
    })
    .await
}

async fn run_worker<D: Device>(
    mut device: D,
    shared: SharedState<D::Command, D::Reading>,
    settings: WorkerSettings,
    mut stop: watch::Receiver<bool>,
) {
    let name = device.name().to_string();
    let mut ticker = interval(settings.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!("{} worker started: {:?} tick", name, settings.tick);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = stop.changed() => {
                // Handle dropped without shutdown
                if changed.is_err() {
                    break;
                }
            }
        }
        if *stop.borrow() {
            break;
        }

        // 1. (Re)connect
        if !device.is_connected() {
            let (d, result) = match on_blocking_pool(device, |d| d.connect()).await {
                Ok(v) => v,
                Err(e) => {
                    error!("{} worker aborted during connect: {}", name, e);
                    return;
                }
            };
            device = d;
            match result {
                Ok(()) => {
                    info!("{} connected", name);
                    lock(&shared).snapshot.connected = true;
                }
                Err(e) => {
                    warn!(
                        "{} connect failed: {} (retrying in {:?})",
                        name, e, settings.reconnect_delay
                    );
                    {
                        let mut state = lock(&shared);
                        state.snapshot.connected = false;
                        state.snapshot.error_count += 1;
                    }
                    sleep(settings.reconnect_delay).await;
                    continue;
                }
            }
        }

        // 2. Drain commands
        let commands: Vec<D::Command> = lock(&shared).pending.drain(..).collect();

        // 3. Exchange
        let (d, outcome) = match on_blocking_pool(device, move |d| d.tick(commands)).await {
            Ok(v) => v,
            Err(e) => {
                error!("{} worker aborted during tick: {}", name, e);
                return;
            }
        };
        device = d;

        // 4. Publish or recover
        match outcome {
            Ok(reading) => {
                let mut state = lock(&shared);
                let error_count = state.snapshot.error_count;
                state.snapshot = Snapshot {
                    connected: true,
                    error_count,
                    last_update_ms: Some(unix_millis()),
                    device: reading,
                };
            }
            Err(DeviceError::Frame(e)) => {
                warn!("{} bad frame discarded: {}", name, e);
                lock(&shared).snapshot.error_count += 1;
            }
            Err(DeviceError::Transport(e)) => {
                warn!(
                    "{} link error: {} (reconnecting in {:?})",
                    name, e, settings.reconnect_delay
                );
                {
                    let mut state = lock(&shared);
                    state.snapshot.connected = false;
                    state.snapshot.error_count += 1;
                }
                device = match on_blocking_pool(device, |d| d.disconnect()).await {
                    Ok((d, ())) => d,
                    Err(e) => {
                        error!("{} worker aborted during disconnect: {}", name, e);
                        return;
                    }
                };
                sleep(settings.reconnect_delay).await;
            }
        }
    }

    if device.is_connected() {
        if let Err(e) = on_blocking_pool(device, |d| d.disconnect()).await {
            error!("{} final disconnect failed: {}", name, e);
        }
    }
    lock(&shared).snapshot.connected = false;
    info!("{} worker stopped", name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FrameError;
    use std::time::Instant;

    #[derive(Debug, Clone, Copy)]
    enum Step {
        Reading(u32),
        FrameFault,
        LinkFault,
    }

    #[derive(Default)]
    struct Script {
        /// Consumed one per tick; the last step repeats
        steps: VecDeque<Step>,
        connect_failures: usize,
        received: Vec<u32>,
        connects: usize,
        disconnects: usize,
    }

    struct FakeDevice {
        script: Arc<Mutex<Script>>,
        connected: bool,
    }

    impl FakeDevice {
        fn new(script: Script) -> (Self, Arc<Mutex<Script>>) {
            let script = Arc::new(Mutex::new(script));
            let device = Self {
                script: Arc::clone(&script),
                connected: false,
            };
            (device, script)
        }
    }

    impl Device for FakeDevice {
        type Command = u32;
        type Reading = u32;

        fn name(&self) -> &str {
            "fake"
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn connect(&mut self) -> Result<()> {
            let mut script = self.script.lock().unwrap();
            if script.connect_failures > 0 {
                script.connect_failures -= 1;
                return Err(TransportError::NotConnected.into());
            }
            script.connects += 1;
            self.connected = true;
            Ok(())
        }

        fn disconnect(&mut self) {
            self.script.lock().unwrap().disconnects += 1;
            self.connected = false;
        }

        fn tick(&mut self, commands: Vec<u32>) -> Result<u32> {
            let mut script = self.script.lock().unwrap();
            script.received.extend(commands);
            let step = if script.steps.len() > 1 {
                script.steps.pop_front()
            } else {
                script.steps.front().copied()
            };
            match step {
                None => Ok(script.received.iter().sum()),
                Some(Step::Reading(v)) => Ok(v),
                Some(Step::FrameFault) => Err(FrameError::Checksum {
                    computed: 1,
                    received: 2,
                }
                .into()),
                Some(Step::LinkFault) => Err(TransportError::Timeout {
                    expected: 8,
                    received: 0,
                }
                .into()),
            }
        }
    }

    fn fast() -> WorkerSettings {
        WorkerSettings {
            tick: Duration::from_millis(2),
            reconnect_delay: Duration::from_millis(10),
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            sleep(Duration::from_millis(2)).await;
        }
    }

    #[tokio::test]
    async fn test_commands_reach_device_and_snapshot_published() {
        let (device, script) = FakeDevice::new(Script::default());
        let worker = WorkerHandle::spawn(device, fast());
        worker.submit(5);
        worker.submit(7);

        wait_until(|| worker.status().device == 12).await;
        let status = worker.status();
        assert!(status.connected);
        assert_eq!(status.error_count, 0);
        assert!(status.last_update_ms.is_some());

        worker.shutdown().await;
        let script = script.lock().unwrap();
        assert_eq!(script.received, vec![5, 7]);
        assert_eq!(script.disconnects, 1);
    }

    #[tokio::test]
    async fn test_frame_error_keeps_last_reading() {
        let (device, script) = FakeDevice::new(Script {
            steps: VecDeque::from([Step::Reading(3), Step::FrameFault]),
            ..Default::default()
        });
        let worker = WorkerHandle::spawn(device, fast());

        wait_until(|| worker.status().error_count >= 3).await;
        let status = worker.status();
        assert_eq!(status.device, 3);
        assert!(status.connected);
        assert_eq!(script.lock().unwrap().connects, 1);
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_link_error_reconnects() {
        let (device, script) = FakeDevice::new(Script {
            steps: VecDeque::from([Step::Reading(3), Step::LinkFault, Step::Reading(9)]),
            ..Default::default()
        });
        let worker = WorkerHandle::spawn(device, fast());

        wait_until(|| worker.status().device == 9).await;
        let status = worker.status();
        assert!(status.connected);
        assert_eq!(status.error_count, 1);
        {
            let script = script.lock().unwrap();
            assert_eq!(script.connects, 2);
            assert_eq!(script.disconnects, 1);
        }
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_commands_wait_while_disconnected() {
        let (device, script) = FakeDevice::new(Script {
            connect_failures: 3,
            ..Default::default()
        });
        let worker = WorkerHandle::spawn(device, fast());
        worker.submit(4);

        wait_until(|| worker.status().device == 4).await;
        assert_eq!(worker.status().error_count, 3);
        assert_eq!(script.lock().unwrap().received, vec![4]);
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_marks_disconnected() {
        let (device, script) = FakeDevice::new(Script::default());
        let worker = WorkerHandle::spawn(device, fast());
        wait_until(|| worker.status().connected).await;

        let shared = Arc::clone(&worker.shared);
        worker.shutdown().await;
        assert!(!lock(&shared).snapshot.connected);
        assert_eq!(script.lock().unwrap().disconnects, 1);
    }
}
