// Pub/sub surface of the rig
//
// Commands arrive as JSON on <prefix>/cmd/{stage,panel,servo} and are queued
// on the matching worker. Snapshots of every running worker are published
// on <prefix>/state/{stage,panel,servo} at a fixed rate.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use zenoh::Session;
use zenoh::handlers::FifoChannelHandler;
use zenoh::pubsub::{Publisher, Subscriber};
use zenoh::sample::Sample;

// local imports
use crate::config::{ConfigError, OffsetStore, RigConfig, load_schedule};
use crate::messages::{
    PanelCommand, PanelReading, ServoCommand, ServoReading, StageCommand, StageReading,
};
use crate::worker::{
    Device, PanelDevice, ServoDevice, StageDevice, WorkerHandle, WorkerSettings, port_connector,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type CommandSubscriber = Subscriber<FifoChannelHandler<Sample>>;

pub fn command_topic(prefix: &str, device: &str) -> String {
    format!("{}/cmd/{}", prefix, device)
}

pub fn state_topic(prefix: &str, device: &str) -> String {
    format!("{}/state/{}", prefix, device)
}

pub fn save_offset_topic(prefix: &str) -> String {
    format!("{}/cmd/stage/save_offset", prefix)
}

/// A worker with its command subscription and state publisher
struct Route<C, R> {
    worker: WorkerHandle<C, R>,
    commands: CommandSubscriber,
    state: Publisher<'static>,
}

impl<C, R> Route<C, R>
where
    C: DeserializeOwned + Debug + Send + 'static,
    R: Serialize + Clone + Default + Send + 'static,
{
    /// Declare the topics, then start the worker
    async fn start<D>(session: &Session, prefix: &str, device: D, settings: WorkerSettings) -> Result<Self, BoxError>
    where
        D: Device<Command = C, Reading = R>,
    {
        let cmd_topic = command_topic(prefix, device.name());
        let state_topic = state_topic(prefix, device.name());
        let commands = session.declare_subscriber(cmd_topic.clone()).await?;
        let state = session.declare_publisher(state_topic.clone()).await?;
        info!("{}: commands on {}, state on {}", device.name(), cmd_topic, state_topic);
        Ok(Self {
            worker: WorkerHandle::spawn(device, settings),
            commands,
            state,
        })
    }

    /// Queue every pending command (non-blocking)
    fn route_commands(&self) {
        while let Ok(Some(sample)) = self.commands.try_recv() {
            let payload = sample.payload().to_bytes();
            match serde_json::from_slice::<C>(&payload) {
                Ok(cmd) => {
                    debug!("{} command: {:?}", self.worker.name(), cmd);
                    self.worker.submit(cmd);
                }
                Err(e) => {
                    warn!("Failed to parse {} command: {}", self.worker.name(), e);
                }
            }
        }
    }

    async fn publish(&self) -> Result<(), BoxError> {
        let json = serde_json::to_string(&self.worker.status())?;
        self.state.put(json).await?;
        Ok(())
    }

    async fn shutdown(self) {
        self.worker.shutdown().await;
    }
}

/// Every running worker; whatever has started is stopped by `shutdown`
#[derive(Default)]
struct Routes {
    stage: Option<Route<StageCommand, StageReading>>,
    panel: Option<Route<PanelCommand, PanelReading>>,
    servo: Option<Route<ServoCommand, ServoReading>>,
}

impl Routes {
    fn is_empty(&self) -> bool {
        self.stage.is_none() && self.panel.is_none() && self.servo.is_none()
    }

    fn route_commands(&self) {
        if let Some(route) = &self.stage {
            route.route_commands();
        }
        if let Some(route) = &self.panel {
            route.route_commands();
        }
        if let Some(route) = &self.servo {
            route.route_commands();
        }
    }

    async fn publish(&self) -> Result<(), BoxError> {
        if let Some(route) = &self.stage {
            route.publish().await?;
        }
        if let Some(route) = &self.panel {
            route.publish().await?;
        }
        if let Some(route) = &self.servo {
            route.publish().await?;
        }
        Ok(())
    }

    /// Each worker finishes its tick and disconnects
    async fn shutdown(self) {
        if let Some(route) = self.stage {
            route.shutdown().await;
        }
        if let Some(route) = self.panel {
            route.shutdown().await;
        }
        if let Some(route) = self.servo {
            route.shutdown().await;
        }
    }
}

/// Stage device with the schedule and stored offset loaded
fn prepare_stage(config: &RigConfig) -> Result<Option<(StageDevice, WorkerSettings)>, ConfigError> {
    let Some(stage) = &config.stage else {
        return Ok(None);
    };
    let schedule = load_schedule(&stage.schedule_path)?;
    let store = OffsetStore::new(&stage.offset_path);
    let zero_offset = store.load_or(stage.zero_offset);
    info!(
        "Stage on {} ({} baud, slave {}), {} scheduled commands, zero offset {}",
        stage.port,
        stage.baud_rate,
        stage.slave_id,
        schedule.len(),
        zero_offset
    );
    let device = StageDevice::new(
        stage,
        schedule,
        zero_offset,
        port_connector(stage.port_settings()),
    )
    .with_offset_store(store);
    let settings = WorkerSettings::from_millis(stage.tick_ms, stage.reconnect_delay_ms);
    Ok(Some((device, settings)))
}

pub async fn run(config: RigConfig) -> Result<(), BoxError> {
    // A bad schedule is fatal before anything starts
    let stage_device = prepare_stage(&config)?;

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    serve_until_stopped(&session, &config, stage_device, Routes::default()).await
}

/// Serve, then stop every worker that was started, also on error
async fn serve_until_stopped(
    session: &Session,
    config: &RigConfig,
    stage_device: Option<(StageDevice, WorkerSettings)>,
    mut routes: Routes,
) -> Result<(), BoxError> {
    let result = serve(session, config, stage_device, &mut routes).await;
    routes.shutdown().await;
    match &result {
        Ok(()) => info!("Runtime stopped"),
        Err(e) => error!("Runtime stopped: {}", e),
    }
    result
}

/// Start the configured workers into `routes` and serve until Ctrl-C
async fn serve(
    session: &Session,
    config: &RigConfig,
    stage_device: Option<(StageDevice, WorkerSettings)>,
    routes: &mut Routes,
) -> Result<(), BoxError> {
    let prefix = config.runtime.topic_prefix.as_str();

    info!("Starting workers...");
    if let Some((device, settings)) = stage_device {
        routes.stage = Some(Route::start(session, prefix, device, settings).await?);
    }
    if let Some(panel) = &config.panel {
        info!("Panel on {} ({} baud)", panel.port, panel.baud_rate);
        let device = PanelDevice::new(panel, port_connector(panel.port_settings()));
        let settings = WorkerSettings::from_millis(panel.tick_ms, panel.reconnect_delay_ms);
        routes.panel = Some(Route::start(session, prefix, device, settings).await?);
    }
    if let Some(servo) = &config.servo {
        info!(
            "Servo on {} ({} baud, id {}, {:?})",
            servo.port, servo.baud_rate, servo.motor_id, servo.operating_mode
        );
        let device = ServoDevice::new(servo, port_connector(servo.port_settings()));
        let settings = WorkerSettings::from_millis(servo.tick_ms, servo.reconnect_delay_ms);
        routes.servo = Some(Route::start(session, prefix, device, settings).await?);
    }
    if routes.is_empty() {
        warn!("No device sections configured; only the pub/sub surface is running");
    }

    let save_offset = session.declare_subscriber(save_offset_topic(prefix)).await?;
    info!("Listening for offset saves on {}", save_offset_topic(prefix));

    let publish_hz = config.runtime.publish_hz;
    let mut tick = interval(Duration::from_millis((1000 / publish_hz).max(1)));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    info!("Runtime started: publishing state at {}Hz", publish_hz);

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            result = &mut shutdown => {
                if let Err(e) = result {
                    warn!("Ctrl-C handler failed: {}", e);
                }
                info!("Shutdown requested");
                return Ok(());
            }
        }

        // 1. Route commands to workers
        routes.route_commands();

        // 2. Offset saves queue behind the stage commands routed above
        while let Ok(Some(_sample)) = save_offset.try_recv() {
            match &routes.stage {
                Some(route) => route.worker.submit(StageCommand::SaveZeroOffset),
                None => warn!("Offset save requested but no stage is configured"),
            }
        }

        // 3. Publish snapshots
        routes.publish().await?;
    }
}
