use std::{
    collections::HashMap,
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::get,
    Json, Router,
};
use reqwest::{header::CONTENT_TYPE, Method};
use serde::Serialize;
use tokio::{
    net::TcpListener,
    runtime::Handle,
    sync::{oneshot, Mutex},
};
use tracing::{debug, info, warn};

use skywatch_common::{
    run_cycle,
    seeing::{check_shutdown_reply, parse_seeing_reply},
    sensors, Collaborators, CredentialStore, CycleReport, LinkError, Lightning, NetworkConfig,
    NextStep, NodeConfig, PersistentState, PinPolarity, PowerController, PowerPin,
    ProvisioningForm, RecoveryExitPolicy, RemoteSettings, SeeingLink, SensorError, SensorSuite,
    SerialError, SkyBrightness, SkyTemperatures, StatusDisplay, StatusScreen, StoreError,
    TelemetryPayload, Uplink, PROVISIONING_PAGE_HTML,
};

const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SkyProfile {
    Clear,
    Cloudy,
    Rain,
    Drifting,
}

impl FromStr for SkyProfile {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "clear" => Ok(Self::Clear),
            "cloudy" => Ok(Self::Cloudy),
            "rain" => Ok(Self::Rain),
            "drifting" => Ok(Self::Drifting),
            other => Err(anyhow::anyhow!("unknown sky profile `{other}`")),
        }
    }
}

#[derive(Clone)]
struct NodeStore {
    node_path: Arc<PathBuf>,
    credentials_path: Arc<PathBuf>,
    state_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Clone)]
struct PortalState {
    node: Arc<Mutex<PersistentState>>,
    store: NodeStore,
    done: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = NodeStore::new();
    let mut config = store.load_node_config().await.unwrap_or_else(|err| {
        warn!("failed to load node config from store: {err:#}");
        NodeConfig::default()
    });
    if let Ok(ip) = std::env::var("SKYWATCH_SERVER_IP") {
        config.network.server_ip = ip;
    }
    config.sanitize();
    let config = Arc::new(config);

    let sky = match std::env::var("SKYWATCH_SKY") {
        Ok(value) => value.parse::<SkyProfile>()?,
        Err(_) => SkyProfile::Drifting,
    };
    let time_scale = std::env::var("SKYWATCH_TIME_SCALE")
        .ok()
        .and_then(|value| value.parse::<f64>().ok())
        .filter(|scale| scale.is_finite() && *scale > 0.0)
        .unwrap_or(1.0);
    let portal_port = std::env::var("SKYWATCH_PORTAL_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let link_up = std::env::var("SKYWATCH_LINK")
        .map(|value| value != "down")
        .unwrap_or(true);

    info!("simulated node starting (sky {sky:?}, time scale {time_scale})");

    let mut node = SimulatedNode::new(&store, &config, sky, link_up)?;

    loop {
        let stored = store.load_state().await?;
        let mut state = PersistentState::restore(stored, &config);

        let cycle_config = config.clone();
        let (returned_node, returned_state, report) = tokio::task::spawn_blocking(move || {
            let report = node.cycle(&mut state, &cycle_config);
            (node, state, report)
        })
        .await
        .context("cycle task panicked")?;
        node = returned_node;
        state = returned_state;

        store
            .save_state(&state)
            .await
            .context("failed to persist state before sleep")?;

        match report.next {
            NextStep::Sleep(duration) => {
                info!("sleeping {}s", duration.as_secs());
                tokio::time::sleep(duration.mul_f64(time_scale)).await;
            }
            NextStep::Recovery => {
                let window = Duration::from_secs(config.recovery.window_s).mul_f64(time_scale);
                loop {
                    let (next_state, provisioned) =
                        run_portal(&store, state, window, portal_port).await?;
                    state = next_state;
                    store.save_state(&state).await?;

                    if provisioned {
                        info!("credentials saved; restarting cycle");
                        break;
                    }
                    match config.recovery.exit_policy {
                        RecoveryExitPolicy::RestartPortal => {
                            info!("provisioning window closed; reopening portal");
                        }
                        RecoveryExitPolicy::SleepForever => {
                            warn!("provisioning window closed; sleeping until interrupted");
                            tokio::signal::ctrl_c().await?;
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

async fn run_portal(
    store: &NodeStore,
    state: PersistentState,
    window: Duration,
    port: u16,
) -> anyhow::Result<(PersistentState, bool)> {
    let (done_tx, done_rx) = oneshot::channel();
    let portal = PortalState {
        node: Arc::new(Mutex::new(state)),
        store: store.clone(),
        done: Arc::new(Mutex::new(Some(done_tx))),
    };

    let app = Router::new()
        .route("/", get(handle_portal_page).post(handle_provision))
        .with_state(portal.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind recovery portal at {addr}"))?;
    info!(
        "recovery portal listening on http://{addr} for {}s",
        window.as_secs()
    );

    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = done_rx.await;
    });
    let provisioned = match tokio::time::timeout(window, server).await {
        Ok(result) => {
            result?;
            true
        }
        Err(_) => false,
    };

    let state = portal.node.lock().await.clone();
    Ok((state, provisioned))
}

async fn handle_portal_page() -> Html<&'static str> {
    Html(PROVISIONING_PAGE_HTML)
}

async fn handle_provision(
    State(portal): State<PortalState>,
    Json(form): Json<ProvisioningForm>,
) -> axum::response::Response {
    let mut state = portal.node.lock().await;
    let response = match form.apply_to(&mut state) {
        Ok(response) => response,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    };

    if let Err(err) = portal.store.save_credentials(&state.network).await {
        warn!("failed to save credentials: {err:#}");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to save credentials");
    }
    if let Some(done) = portal.done.lock().await.take() {
        let _ = done.send(());
    }

    Json(response).into_response()
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

struct SimulatedNode {
    sensors: SimulatedSensors,
    uplink: HttpUplink,
    seeing: SimulatedSeeing,
    power: LoggingPower,
    display: ConsoleDisplay,
    credentials: FileCredentials,
}

impl SimulatedNode {
    fn new(
        store: &NodeStore,
        config: &NodeConfig,
        sky: SkyProfile,
        link_up: bool,
    ) -> anyhow::Result<Self> {
        let seeing_line = Arc::new(AtomicBool::new(false));
        Ok(Self {
            sensors: SimulatedSensors { profile: sky, tick: 0 },
            uplink: HttpUplink::new(link_up)?,
            seeing: SimulatedSeeing {
                line_high: seeing_line.clone(),
                polarity: config.seeing.power_polarity,
            },
            power: LoggingPower {
                levels: HashMap::new(),
                seeing_line,
            },
            display: ConsoleDisplay,
            credentials: FileCredentials {
                path: store.credentials_path.as_ref().clone(),
            },
        })
    }

    fn cycle(&mut self, state: &mut PersistentState, config: &NodeConfig) -> CycleReport {
        self.sensors.tick = self.sensors.tick.wrapping_add(1);
        let mut io = Collaborators {
            sensors: &mut self.sensors,
            uplink: &mut self.uplink,
            seeing: &mut self.seeing,
            power: &mut self.power,
            display: &mut self.display,
            credentials: &mut self.credentials,
        };
        run_cycle(state, config, &mut io)
    }
}

struct SimulatedSensors {
    profile: SkyProfile,
    tick: u64,
}

impl SimulatedSensors {
    fn clear_now(&self) -> bool {
        match self.profile {
            SkyProfile::Clear => true,
            SkyProfile::Cloudy | SkyProfile::Rain => false,
            SkyProfile::Drifting => (self.tick / 8) % 2 == 0,
        }
    }
}

impl SensorSuite for SimulatedSensors {
    fn read_sky_temperatures(&mut self) -> Result<SkyTemperatures, SensorError> {
        let ambient_c = 8.0 + (self.tick % 5) as f32 * 0.1;
        let gap = match (self.profile, self.clear_now()) {
            (SkyProfile::Rain, _) => 0.5,
            (_, true) => 27.0,
            (_, false) => 1.5,
        };
        Ok(SkyTemperatures {
            ambient_c,
            object_c: ambient_c - gap,
        })
    }

    fn read_lux(&mut self) -> Result<f32, SensorError> {
        Ok(if self.clear_now() { 0.02 } else { 0.4 })
    }

    fn read_sky_brightness(&mut self, sqm_limit: f32) -> Result<SkyBrightness, SensorError> {
        let frequency_hz = if self.clear_now() { 2.5 } else { 40.0 };
        sensors::sky_brightness(frequency_hz, sqm_limit)
    }

    fn read_particulates(&mut self) -> Result<f32, SensorError> {
        let low_pulse_us = 15_000 + (self.tick % 7) * 500;
        sensors::dust_concentration(low_pulse_us, sensors::DUST_SAMPLE_MS)
    }

    fn read_rain(&mut self) -> Result<bool, SensorError> {
        Ok(self.profile == SkyProfile::Rain)
    }

    fn read_lightning(&mut self) -> Result<Lightning, SensorError> {
        if self.profile == SkyProfile::Rain && self.tick % 4 == 0 {
            Ok(Lightning::Strike { distance_km: 12 })
        } else {
            Ok(Lightning::Quiet)
        }
    }
}

/// Stands in for the imaging computer: it only answers while its supply pin
/// is in the active state.
struct SimulatedSeeing {
    line_high: Arc<AtomicBool>,
    polarity: PinPolarity,
}

impl SimulatedSeeing {
    fn powered(&self) -> bool {
        let high = self.line_high.load(Ordering::Relaxed);
        match self.polarity {
            PinPolarity::ActiveHigh => high,
            PinPolarity::ActiveLow => !high,
        }
    }
}

impl SeeingLink for SimulatedSeeing {
    fn query_seeing(&mut self, timeout_ms: u64) -> Result<f32, SerialError> {
        if !self.powered() {
            return Err(SerialError::Timeout(timeout_ms));
        }
        parse_seeing_reply("1.38\n")
    }

    fn shutdown(&mut self, timeout_ms: u64) -> Result<(), SerialError> {
        if !self.powered() {
            return Err(SerialError::Timeout(timeout_ms));
        }
        check_shutdown_reply("ok\n")
    }
}

struct LoggingPower {
    levels: HashMap<PowerPin, bool>,
    seeing_line: Arc<AtomicBool>,
}

impl LoggingPower {
    fn latch(&mut self, pin: PowerPin, high: bool) {
        if self.levels.insert(pin, high) != Some(high) {
            info!("pin {} held {}", pin.as_str(), if high { "high" } else { "low" });
        }
        if pin == PowerPin::Seeing {
            self.seeing_line.store(high, Ordering::Relaxed);
        }
    }
}

impl PowerController for LoggingPower {
    fn hold_high(&mut self, pin: PowerPin) {
        self.latch(pin, true);
    }

    fn hold_low(&mut self, pin: PowerPin) {
        self.latch(pin, false);
    }
}

struct ConsoleDisplay;

impl StatusDisplay for ConsoleDisplay {
    fn render(&mut self, screen: &StatusScreen) {
        for line in &screen.lines {
            info!("display | {line}");
        }
    }
}

struct FileCredentials {
    path: PathBuf,
}

impl CredentialStore for FileCredentials {
    fn load(&mut self) -> Result<Option<NetworkConfig>, StoreError> {
        match std::fs::read(&self.path) {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::Backend(err.to_string())),
        }
    }

    fn save(&mut self, network: &NetworkConfig) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| StoreError::Backend(err.to_string()))?;
        }
        let payload = serde_json::to_vec_pretty(network)?;
        std::fs::write(&self.path, payload).map_err(|err| StoreError::Backend(err.to_string()))
    }
}

/// Collection-server client. Cycles run on a blocking worker, so requests
/// are driven to completion on the host runtime's handle.
struct HttpUplink {
    link_up: bool,
    client: reqwest::Client,
    runtime: Handle,
}

impl HttpUplink {
    fn new(link_up: bool) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            link_up,
            client,
            runtime: Handle::current(),
        })
    }

    fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<String>,
    ) -> Result<(u16, Vec<u8>), LinkError> {
        self.runtime.block_on(async {
            let mut request = self.client.request(method, url);
            if let Some(body) = body {
                request = request.header(CONTENT_TYPE, "application/json").body(body);
            }
            let response = request.send().await.map_err(link_error)?;
            let status = response.status().as_u16();
            let body = response.bytes().await.map_err(link_error)?;
            debug!("{url} answered {status} with {} bytes", body.len());
            Ok::<_, LinkError>((status, body.to_vec()))
        })
    }
}

impl Uplink for HttpUplink {
    fn connect(&mut self, network: &NetworkConfig) -> bool {
        if !self.link_up {
            return false;
        }
        if !network.has_station_credentials() {
            warn!("no station credentials configured");
            return false;
        }
        debug!("simulated link up on `{}`", network.wifi_ssid);
        true
    }

    fn fetch_settings(&mut self, network: &NetworkConfig) -> Result<RemoteSettings, LinkError> {
        let (status, body) = self.request(Method::GET, &network.fetch_url(), None)?;
        if status != 200 {
            return Err(LinkError::Status(status));
        }
        Ok(RemoteSettings::from_json(&body)?)
    }

    fn post_telemetry(
        &mut self,
        network: &NetworkConfig,
        payload: &TelemetryPayload,
    ) -> Result<(), LinkError> {
        let body = payload.to_json()?;
        let (status, _) = self.request(Method::POST, &network.send_url(), Some(body))?;
        if status != 200 {
            return Err(LinkError::Status(status));
        }
        Ok(())
    }
}

fn link_error(err: reqwest::Error) -> LinkError {
    if err.is_timeout() {
        LinkError::Timeout
    } else {
        LinkError::Transport(err.to_string())
    }
}

impl NodeStore {
    fn new() -> Self {
        let data_dir = std::env::var("SKYWATCH_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.skywatch"));

        Self {
            node_path: Arc::new(data_dir.join("node.json")),
            credentials_path: Arc::new(data_dir.join("credentials.json")),
            state_path: Arc::new(data_dir.join("state.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_node_config(&self) -> anyhow::Result<NodeConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.node_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<NodeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(NodeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn load_state(
        &self,
    ) -> anyhow::Result<Result<Option<PersistentState>, skywatch_common::StateCodecError>> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.state_path.as_ref()).await {
            Ok(raw) => Ok(PersistentState::decode(&raw).map(Some)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Ok(None)),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_state(&self, state: &PersistentState) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.state_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, state.encode()?).await?;
        Ok(())
    }

    async fn save_credentials(&self, network: &NetworkConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.credentials_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(network)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }
}
