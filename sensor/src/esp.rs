use std::{
    cell::RefCell,
    net::Ipv4Addr,
    rc::Rc,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_graphics::{
    mono_font::{ascii::FONT_6X10, MonoTextStyle},
    pixelcolor::BinaryColor,
    prelude::*,
    text::{Baseline, Text},
};
use embedded_svc::{
    http::{client::Client as HttpClient, Headers, Method, Status},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::{FreeRtos, BLOCK, NON_BLOCK},
    gpio::{AnyIOPin, AnyInputPin, IOPin, Input, PinDriver},
    i2c::{I2cConfig, I2cDriver},
    pcnt::{
        PcntChannel, PcntChannelConfig, PcntControlMode, PcntCountMode, PcntDriver, PinIndex,
    },
    uart::{config::Config as UartConfig, UartDriver},
    units::Hertz,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::{
        client::{Configuration as HttpClientConfiguration, EspHttpConnection},
        server::{Configuration as HttpConfiguration, EspHttpServer},
    },
    ipv4::{Configuration as IpConfiguration, Mask, RouterConfiguration, Subnet},
    log::EspLogger,
    netif::{EspNetif, NetifConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::Serialize;
use ssd1306::{prelude::*, I2CDisplayInterface, Ssd1306};

use skywatch_common::{
    run_cycle,
    seeing::{check_shutdown_reply, parse_seeing_reply},
    sensors::{self, LightningEvent, Tsl2561Integration},
    Collaborators, CredentialStore, LinkError, Lightning, NetworkConfig, NextStep, NodeConfig,
    PersistentState, PowerController, PowerPin, ProvisioningForm, RecoveryExitPolicy,
    RemoteSettings, SeeingLink, SensorError, SensorSuite, SerialError, SkyBrightness,
    SkyTemperatures, StateCodecError, StatusDisplay, StatusScreen, StoreError, TelemetryPayload,
    Uplink, PROVISIONING_PAGE_HTML, RECOVERY_AP_IP, RECOVERY_AP_SSID, SERIAL_BAUD,
    SERIAL_CMD_GET, SERIAL_CMD_SHUT,
};

const NVS_NAMESPACE: &str = "skywatch";
const NVS_CREDENTIALS_KEY: &str = "network_json";

const SENSOR_RAIL_3V3_PIN: i32 = 15;
const SENSOR_RAIL_5V_PIN: i32 = 2;
const SEEING_POWER_PIN: i32 = 14;
const DISPLAY_POWER_PIN: i32 = 4;

const SSD1306_ROW_HEIGHT: i32 = 12;
const MAX_HTTP_BODY: usize = 4096;
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const WIFI_CONNECT_ATTEMPTS: u32 = 3;
const WIFI_RETRY_DELAY_MS: u64 = 1_000;

const TSL2561_CMD: u8 = 0x80;
const TSL2561_WORD: u8 = 0x20;
const TSL2561_REG_CONTROL: u8 = 0x00;
const TSL2561_REG_TIMING: u8 = 0x01;
const TSL2561_REG_DATA0: u8 = 0x0C;
const TSL2561_REG_DATA1: u8 = 0x0E;
const TSL2561_INTEGRATION: Tsl2561Integration = Tsl2561Integration::Ms101;

const SKY_SLICE_MS: u64 = 100;

const AS3935_REG_INTERRUPT: u8 = 0x03;
const AS3935_REG_DISTANCE: u8 = 0x07;

const RETAINED_LEN: usize = 2048;

// Survives deep sleep; zeroed on every other kind of reset.
#[link_section = ".rtc.data"]
static mut RETAINED_STATE: [u8; RETAINED_LEN] = [0; RETAINED_LEN];

type SharedI2c = Rc<RefCell<I2cDriver<'static>>>;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let config = node_config();
    let mut state = PersistentState::restore(load_retained(), &config);

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let mut credentials = NvsCredentials {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let Peripherals {
        modem,
        pins,
        i2c0,
        uart2,
        pcnt0,
        ..
    } = Peripherals::take()?;

    let i2c: SharedI2c = Rc::new(RefCell::new(
        I2cDriver::new(
            i2c0,
            pins.gpio21,
            pins.gpio22,
            &I2cConfig::new().baudrate(Hertz(100_000)),
        )
        .context("failed to initialize i2c bus")?,
    ));

    let mut sensors = EspSensors {
        i2c: i2c.clone(),
        dust: PinDriver::input(pins.gpio27.downgrade())?,
        sky: sky_counter(pcnt0, pins.gpio25)?,
        rain: PinDriver::input(pins.gpio18.downgrade())?,
        lightning_irq: PinDriver::input(pins.gpio13.downgrade())?,
    };
    let mut seeing = UartSeeing {
        uart: UartDriver::new(
            uart2,
            pins.gpio17,
            pins.gpio16,
            Option::<AnyIOPin>::None,
            Option::<AnyIOPin>::None,
            &UartConfig::default().baudrate(Hertz(SERIAL_BAUD)),
        )
        .context("failed to initialize seeing uart")?,
    };
    let mut display = OledDisplay { i2c };
    let mut power = HeldPins;
    let mut uplink = WifiUplink::new(modem, sys_loop, nvs_partition)?;

    let report = {
        let mut io = Collaborators {
            sensors: &mut sensors,
            uplink: &mut uplink,
            seeing: &mut seeing,
            power: &mut power,
            display: &mut display,
            credentials: &mut credentials,
        };
        run_cycle(&mut state, &config, &mut io)
    };

    match report.next {
        NextStep::Sleep(duration) => {
            let written = store_retained(&state).context("failed to retain state")?;
            info!("retained {written} bytes; sleeping {}s", duration.as_secs());
            uplink.shutdown();
            deep_sleep(duration)
        }
        NextStep::Recovery => run_recovery(uplink, credentials, state, &config),
    }
}

fn node_config() -> NodeConfig {
    let mut config = NodeConfig::default();
    if let Some(ssid) = option_env!("WIFI_SSID") {
        config.network.wifi_ssid = ssid.to_string();
    }
    if let Some(pass) = option_env!("WIFI_PASS") {
        config.network.wifi_pass = pass.to_string();
    }
    if let Some(ip) = option_env!("SERVER_IP") {
        config.network.server_ip = ip.to_string();
    }
    config.sanitize();
    config
}

fn load_retained() -> Result<Option<PersistentState>, StateCodecError> {
    // Only touched from the main task before anything else is spawned.
    let buf = unsafe { &*core::ptr::addr_of!(RETAINED_STATE) };
    PersistentState::decode_from(buf)
}

fn store_retained(state: &PersistentState) -> Result<usize, StateCodecError> {
    let buf = unsafe { &mut *core::ptr::addr_of_mut!(RETAINED_STATE) };
    state.encode_into(buf)
}

fn deep_sleep(duration: Duration) -> ! {
    unsafe {
        esp_idf_svc::sys::gpio_deep_sleep_hold_en();
        esp_idf_svc::sys::esp_deep_sleep(duration.as_micros() as u64)
    }
}

fn sleep_forever() -> ! {
    warn!("sleeping until reset");
    unsafe {
        esp_idf_svc::sys::gpio_deep_sleep_hold_en();
        esp_idf_svc::sys::esp_sleep_disable_wakeup_source(
            esp_idf_svc::sys::esp_sleep_source_t_ESP_SLEEP_WAKEUP_ALL,
        );
        esp_idf_svc::sys::esp_deep_sleep_start()
    }
}

fn run_recovery(
    mut uplink: WifiUplink,
    credentials: NvsCredentials,
    state: PersistentState,
    config: &NodeConfig,
) -> anyhow::Result<()> {
    let state = Arc::new(Mutex::new(state));
    let window = Duration::from_secs(config.recovery.window_s);

    uplink.shutdown();
    install_recovery_netif(&mut uplink.wifi)?;

    loop {
        uplink.shutdown();
        start_recovery_ap(&mut uplink.wifi)?;
        let server = create_recovery_http_server(state.clone(), credentials.clone())?;

        let opened = Instant::now();
        while opened.elapsed() < window {
            thread::sleep(Duration::from_secs(1));
        }
        drop(server);

        match config.recovery.exit_policy {
            RecoveryExitPolicy::SleepForever => sleep_forever(),
            RecoveryExitPolicy::RestartPortal => {
                info!("provisioning window closed; reopening access point");
            }
        }
    }
}

fn install_recovery_netif(wifi: &mut BlockingWifi<EspWifi<'static>>) -> anyhow::Result<()> {
    let [a, b, c, d] = RECOVERY_AP_IP;
    let mut conf = NetifConfiguration::wifi_default_router();
    conf.key = "WIFI_AP_RECOVERY"
        .try_into()
        .map_err(|_| anyhow!("netif key too long"))?;
    conf.ip_configuration = Some(IpConfiguration::Router(RouterConfiguration {
        subnet: Subnet {
            gateway: Ipv4Addr::new(a, b, c, d),
            mask: Mask(24),
        },
        dhcp_enabled: true,
        dns: None,
        secondary_dns: None,
    }));
    let ap_netif = EspNetif::new_with_conf(&conf).context("failed to create recovery netif")?;
    let _ = wifi
        .wifi_mut()
        .swap_netif_ap(ap_netif)
        .context("failed to apply recovery netif")?;
    Ok(())
}

fn start_recovery_ap(wifi: &mut BlockingWifi<EspWifi<'static>>) -> anyhow::Result<()> {
    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: RECOVERY_AP_SSID
            .try_into()
            .map_err(|_| anyhow!("recovery AP SSID too long"))?,
        auth_method: AuthMethod::None,
        channel: 1,
        ..Default::default()
    }))?;
    wifi.start()?;
    wifi.wait_netif_up()?;
    let [a, b, c, d] = RECOVERY_AP_IP;
    info!("recovery AP `{RECOVERY_AP_SSID}` up at http://{a}.{b}.{c}.{d}");
    Ok(())
}

fn create_recovery_http_server(
    state: Arc<Mutex<PersistentState>>,
    credentials: NvsCredentials,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 12 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    for path in ["/", "/generate_204", "/hotspot-detect.html", "/connecttest.txt"] {
        server.fn_handler::<anyhow::Error, _>(path, Method::Get, move |req| {
            req.into_response(200, Some("OK"), &[("Content-Type", "text/html; charset=utf-8")])?
                .write_all(PROVISIONING_PAGE_HTML.as_bytes())?;
            Ok(())
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/", Method::Post, move |mut req| {
        let body = read_request_body(&mut req)?;
        let form: ProvisioningForm = match serde_json::from_slice(&body) {
            Ok(form) => form,
            Err(_) => return write_error(req, 400, "invalid provisioning payload"),
        };

        let (response, network) = {
            let mut state = state.lock().map_err(|_| anyhow!("state lock poisoned"))?;
            match form.apply_to(&mut state) {
                Ok(response) => (response, state.network.clone()),
                Err(err) => return write_error(req, 400, &err.to_string()),
            }
        };

        let mut credentials = credentials.clone();
        if let Err(err) = credentials.save(&network) {
            warn!("failed to save credentials: {err}");
            return write_error(req, 500, "failed to save credentials");
        }

        thread::Builder::new()
            .name("restart-request".into())
            .spawn(|| {
                thread::sleep(Duration::from_millis(500));
                unsafe { esp_idf_svc::sys::esp_restart() };
            })?;

        write_json(req, &response)
    })?;

    Ok(server)
}

fn read_request_body(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_json<T: Serialize>(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "error": message });
    let body = serde_json::to_vec(&payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn sky_counter(
    pcnt: esp_idf_hal::pcnt::PCNT0,
    pin: esp_idf_hal::gpio::Gpio25,
) -> anyhow::Result<PcntDriver<'static>> {
    let mut counter = PcntDriver::new(
        pcnt,
        Some(pin),
        Option::<AnyInputPin>::None,
        Option::<AnyInputPin>::None,
        Option::<AnyInputPin>::None,
    )
    .context("failed to claim pulse counter")?;
    counter.channel_config(
        PcntChannel::Channel0,
        PinIndex::Pin0,
        PinIndex::Pin1,
        &PcntChannelConfig {
            lctrl_mode: PcntControlMode::Keep,
            hctrl_mode: PcntControlMode::Keep,
            pos_mode: PcntCountMode::Increment,
            neg_mode: PcntCountMode::Hold,
            counter_h_lim: i16::MAX,
            counter_l_lim: 0,
        },
    )?;
    counter.counter_pause()?;
    Ok(counter)
}

fn pcnt_error(err: esp_idf_svc::sys::EspError) -> SensorError {
    SensorError::Bus(format!("pulse counter: {err:?}"))
}

struct EspSensors {
    i2c: SharedI2c,
    dust: PinDriver<'static, AnyIOPin, Input>,
    sky: PcntDriver<'static>,
    rain: PinDriver<'static, AnyIOPin, Input>,
    lightning_irq: PinDriver<'static, AnyIOPin, Input>,
}

impl EspSensors {
    fn read_register(&self, addr: u8, reg: u8, buf: &mut [u8]) -> Result<(), SensorError> {
        self.i2c
            .borrow_mut()
            .write_read(addr, &[reg], buf, BLOCK)
            .map_err(|err| SensorError::Bus(format!("{err:?}")))
    }

    fn write_register(&self, addr: u8, bytes: &[u8]) -> Result<(), SensorError> {
        self.i2c
            .borrow_mut()
            .write(addr, bytes, BLOCK)
            .map_err(|err| SensorError::Bus(format!("{err:?}")))
    }

    fn read_mlx(&self, reg: u8) -> Result<f32, SensorError> {
        // Low byte, high byte, PEC.
        let mut buf = [0_u8; 3];
        self.read_register(sensors::MLX90614_ADDR, reg, &mut buf)?;
        sensors::mlx90614_celsius(u16::from_le_bytes([buf[0], buf[1]]))
    }

    fn read_tsl_channel(&self, reg: u8) -> Result<u16, SensorError> {
        let mut buf = [0_u8; 2];
        self.read_register(
            sensors::TSL2561_ADDR,
            TSL2561_CMD | TSL2561_WORD | reg,
            &mut buf,
        )?;
        Ok(u16::from_le_bytes(buf))
    }
}

impl SensorSuite for EspSensors {
    fn read_sky_temperatures(&mut self) -> Result<SkyTemperatures, SensorError> {
        let ambient_c = self.read_mlx(sensors::MLX90614_REG_AMBIENT)?;
        let object_c = self.read_mlx(sensors::MLX90614_REG_OBJECT)?;
        info!("[MLX90614] ambient {ambient_c:.2}°C, sky {object_c:.2}°C");
        Ok(SkyTemperatures {
            ambient_c,
            object_c,
        })
    }

    fn read_lux(&mut self) -> Result<f32, SensorError> {
        self.write_register(
            sensors::TSL2561_ADDR,
            &[TSL2561_CMD | TSL2561_REG_CONTROL, 0x03],
        )?;
        self.write_register(
            sensors::TSL2561_ADDR,
            &[
                TSL2561_CMD | TSL2561_REG_TIMING,
                TSL2561_INTEGRATION.timing_bits(),
            ],
        )?;
        FreeRtos::delay_ms(TSL2561_INTEGRATION.duration_ms() as u32 + 12);

        let broadband = self.read_tsl_channel(TSL2561_REG_DATA0);
        let infrared = self.read_tsl_channel(TSL2561_REG_DATA1);
        let _ = self.write_register(
            sensors::TSL2561_ADDR,
            &[TSL2561_CMD | TSL2561_REG_CONTROL, 0x00],
        );

        let lux = sensors::tsl2561_lux(broadband?, infrared?, TSL2561_INTEGRATION, false)?;
        info!("[TSL2561] {lux:.3} lux");
        Ok(lux)
    }

    fn read_sky_brightness(&mut self, sqm_limit: f32) -> Result<SkyBrightness, SensorError> {
        // Short slices keep each count below the 16-bit counter limit.
        let mut pulses = 0_u32;
        let mut counted = Duration::ZERO;
        for _ in 0..sensors::SKY_GATE_MS / SKY_SLICE_MS {
            self.sky.counter_clear().map_err(pcnt_error)?;
            let opened = Instant::now();
            self.sky.counter_resume().map_err(pcnt_error)?;
            FreeRtos::delay_ms(SKY_SLICE_MS as u32);
            self.sky.counter_pause().map_err(pcnt_error)?;
            counted += opened.elapsed();

            let count = self.sky.get_counter_value().map_err(pcnt_error)?;
            if count == i16::MAX {
                return Err(SensorError::Saturated);
            }
            pulses = pulses.saturating_add(u32::from(count.unsigned_abs()));
        }

        let frequency_hz = sensors::pulse_frequency_hz(pulses, counted)?;
        let brightness = sensors::sky_brightness(frequency_hz, sqm_limit)?;
        info!(
            "[TSL237] {frequency_hz:.1} Hz, {:.2} mag/arcsec², nelm {:.2}",
            brightness.magnitude, brightness.nelm
        );
        Ok(brightness)
    }

    fn read_particulates(&mut self) -> Result<f32, SensorError> {
        let sample = Duration::from_millis(sensors::DUST_SAMPLE_MS);
        let started = Instant::now();
        let mut low_since: Option<Instant> = None;
        let mut low_us = 0_u64;
        while started.elapsed() < sample {
            if self.dust.is_low() {
                low_since.get_or_insert_with(Instant::now);
            } else if let Some(since) = low_since.take() {
                low_us += since.elapsed().as_micros() as u64;
            }
        }
        if let Some(since) = low_since {
            low_us += since.elapsed().as_micros() as u64;
        }

        let concentration = sensors::dust_concentration(low_us, sensors::DUST_SAMPLE_MS)?;
        info!("[dust] {concentration:.1} pcs/0.01cf");
        Ok(concentration)
    }

    fn read_rain(&mut self) -> Result<bool, SensorError> {
        Ok(self.rain.is_low())
    }

    fn read_lightning(&mut self) -> Result<Lightning, SensorError> {
        if !self.lightning_irq.is_high() {
            return Ok(Lightning::Quiet);
        }

        let mut interrupt = [0_u8; 1];
        self.read_register(sensors::AS3935_ADDR, AS3935_REG_INTERRUPT, &mut interrupt)?;
        match sensors::as3935_event(interrupt[0]) {
            LightningEvent::Strike => {
                let mut distance = [0_u8; 1];
                self.read_register(sensors::AS3935_ADDR, AS3935_REG_DISTANCE, &mut distance)?;
                Ok(match sensors::as3935_distance_km(distance[0]) {
                    Some(distance_km) => {
                        info!("[AS3935] lightning {distance_km} km away");
                        Lightning::Strike { distance_km }
                    }
                    None => Lightning::Quiet,
                })
            }
            event => {
                info!("[AS3935] ignored {event:?}");
                Ok(Lightning::Quiet)
            }
        }
    }
}

struct UartSeeing {
    uart: UartDriver<'static>,
}

impl UartSeeing {
    fn transact(&mut self, command: &str, timeout_ms: u64) -> Result<String, SerialError> {
        let io_error = |err: esp_idf_svc::sys::EspError| SerialError::Io(format!("{err:?}"));

        self.uart.clear_rx().map_err(io_error)?;
        self.uart.write(command.as_bytes()).map_err(io_error)?;
        self.uart.write(b"\n").map_err(io_error)?;

        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut line = Vec::new();
        let mut byte = [0_u8; 1];
        while Instant::now() < deadline {
            match self.uart.read(&mut byte, NON_BLOCK).map_err(io_error)? {
                0 => FreeRtos::delay_ms(10),
                _ if byte[0] == b'\n' && !line.is_empty() => {
                    return Ok(String::from_utf8_lossy(&line).into_owned());
                }
                _ if byte[0] == b'\n' || byte[0] == b'\r' => {}
                _ => line.push(byte[0]),
            }
        }
        Err(SerialError::Timeout(timeout_ms))
    }
}

impl SeeingLink for UartSeeing {
    fn query_seeing(&mut self, timeout_ms: u64) -> Result<f32, SerialError> {
        let reply = self.transact(SERIAL_CMD_GET, timeout_ms)?;
        parse_seeing_reply(&reply)
    }

    fn shutdown(&mut self, timeout_ms: u64) -> Result<(), SerialError> {
        let reply = self.transact(SERIAL_CMD_SHUT, timeout_ms)?;
        check_shutdown_reply(&reply)
    }
}

/// Output pins latched with the pad hold so they keep their level through
/// deep sleep.
struct HeldPins;

impl HeldPins {
    fn gpios(pin: PowerPin) -> &'static [i32] {
        match pin {
            PowerPin::SensorRail => &[SENSOR_RAIL_3V3_PIN, SENSOR_RAIL_5V_PIN],
            PowerPin::Display => &[DISPLAY_POWER_PIN],
            PowerPin::Seeing => &[SEEING_POWER_PIN],
        }
    }

    fn latch(&mut self, pin: PowerPin, high: bool) {
        for &gpio in Self::gpios(pin) {
            let rc = unsafe {
                esp_idf_svc::sys::gpio_hold_dis(gpio);
                esp_idf_svc::sys::gpio_set_direction(
                    gpio,
                    esp_idf_svc::sys::gpio_mode_t_GPIO_MODE_OUTPUT,
                );
                esp_idf_svc::sys::gpio_set_level(gpio, u32::from(high));
                esp_idf_svc::sys::gpio_hold_en(gpio)
            };
            if rc != esp_idf_svc::sys::ESP_OK {
                warn!(
                    "failed to hold {} (GPIO{gpio}) {}: esp_err_t={rc}",
                    pin.as_str(),
                    if high { "high" } else { "low" }
                );
            }
        }
    }
}

impl PowerController for HeldPins {
    fn hold_high(&mut self, pin: PowerPin) {
        self.latch(pin, true);
    }

    fn hold_low(&mut self, pin: PowerPin) {
        self.latch(pin, false);
    }
}

struct OledDisplay {
    i2c: SharedI2c,
}

impl OledDisplay {
    fn draw(&self, screen: &StatusScreen) -> anyhow::Result<()> {
        let mut bus = self.i2c.borrow_mut();
        let interface = I2CDisplayInterface::new(&mut *bus);
        let mut display = Ssd1306::new(interface, DisplaySize128x64, DisplayRotation::Rotate0)
            .into_buffered_graphics_mode();
        display
            .init()
            .map_err(|err| anyhow!("display init failed: {err:?}"))?;
        display.clear_buffer();

        let style = MonoTextStyle::new(&FONT_6X10, BinaryColor::On);
        for (row, line) in screen.lines.iter().enumerate() {
            Text::with_baseline(
                line,
                Point::new(0, row as i32 * SSD1306_ROW_HEIGHT),
                style,
                Baseline::Top,
            )
            .draw(&mut display)
            .map_err(|err| anyhow!("display draw failed: {err:?}"))?;
        }

        display
            .flush()
            .map_err(|err| anyhow!("display flush failed: {err:?}"))?;
        Ok(())
    }
}

impl StatusDisplay for OledDisplay {
    fn render(&mut self, screen: &StatusScreen) {
        // Panel needs a moment after its supply pin is raised.
        FreeRtos::delay_ms(3);
        if let Err(err) = self.draw(screen) {
            warn!("{err:#}");
        }
    }
}

#[derive(Clone)]
struct NvsCredentials {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

impl CredentialStore for NvsCredentials {
    fn load(&mut self) -> Result<Option<NetworkConfig>, StoreError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| StoreError::Backend("nvs lock poisoned".to_string()))?;
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true).map_err(nvs_error)?;
        let mut buffer = vec![0_u8; 512];

        match nvs.get_str(NVS_CREDENTIALS_KEY, &mut buffer).map_err(nvs_error)? {
            Some(value) => Ok(Some(serde_json::from_str::<NetworkConfig>(value)?)),
            None => Ok(None),
        }
    }

    fn save(&mut self, network: &NetworkConfig) -> Result<(), StoreError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| StoreError::Backend("nvs lock poisoned".to_string()))?;
        let mut nvs =
            EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true).map_err(nvs_error)?;
        let payload = serde_json::to_string(network)?;
        nvs.set_str(NVS_CREDENTIALS_KEY, &payload).map_err(nvs_error)?;
        Ok(())
    }
}

fn nvs_error(err: esp_idf_svc::sys::EspError) -> StoreError {
    StoreError::Backend(format!("{err:?}"))
}

struct WifiUplink {
    wifi: BlockingWifi<EspWifi<'static>>,
}

impl WifiUplink {
    fn new(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs_partition: EspDefaultNvsPartition,
    ) -> anyhow::Result<Self> {
        let esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
        Ok(Self {
            wifi: BlockingWifi::wrap(esp_wifi, sys_loop)?,
        })
    }

    fn shutdown(&mut self) {
        let _ = self.wifi.disconnect();
        let _ = self.wifi.stop();
    }

    fn connect_station(&mut self, network: &NetworkConfig) -> anyhow::Result<()> {
        if !network.has_station_credentials() {
            return Err(anyhow!("wifi credentials missing"));
        }

        let auth_method = if network.wifi_pass.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        self.wifi
            .set_configuration(&Configuration::Client(ClientConfiguration {
                ssid: network
                    .wifi_ssid
                    .as_str()
                    .try_into()
                    .map_err(|_| anyhow!("wifi ssid too long"))?,
                password: network
                    .wifi_pass
                    .as_str()
                    .try_into()
                    .map_err(|_| anyhow!("wifi password too long"))?,
                auth_method,
                ..Default::default()
            }))?;

        self.wifi.start()?;
        info!("wifi started, connecting to `{}`", network.wifi_ssid);

        let mut last_err = None;
        for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
            match self.wifi.connect().and_then(|()| self.wifi.wait_netif_up()) {
                Ok(()) => {
                    info!("wifi connected on attempt {attempt}");
                    return Ok(());
                }
                Err(err) => {
                    warn!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS} failed: {err:#}");
                    last_err = Some(err);
                }
            }

            if attempt < WIFI_CONNECT_ATTEMPTS {
                let _ = self.wifi.disconnect();
                thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
            }
        }

        Err(last_err.map_or_else(|| anyhow!("wifi connect failed"), anyhow::Error::from))
    }
}

impl Uplink for WifiUplink {
    fn connect(&mut self, network: &NetworkConfig) -> bool {
        match self.connect_station(network) {
            Ok(()) => true,
            Err(err) => {
                warn!("no network link: {err:#}");
                false
            }
        }
    }

    fn fetch_settings(&mut self, network: &NetworkConfig) -> Result<RemoteSettings, LinkError> {
        let (status, body) = http_request(Method::Get, &network.fetch_url(), &[])?;
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
        let (status, _) = http_request(Method::Post, &network.send_url(), body.as_bytes())?;
        if status != 200 {
            return Err(LinkError::Status(status));
        }
        Ok(())
    }
}

fn http_request(method: Method, url: &str, body: &[u8]) -> Result<(u16, Vec<u8>), LinkError> {
    let transport = |err: esp_idf_svc::io::EspIOError| LinkError::Transport(format!("{err:?}"));

    let http_conf = HttpClientConfiguration {
        timeout: Some(HTTP_TIMEOUT),
        ..Default::default()
    };
    let mut client = HttpClient::wrap(EspHttpConnection::new(&http_conf).map_err(|err| {
        LinkError::Transport(format!("{err:?}"))
    })?);

    let content_length = body.len().to_string();
    let headers = [
        ("Content-Type", "application/json"),
        ("Content-Length", content_length.as_str()),
    ];
    let mut request = client.request(method, url, &headers).map_err(transport)?;
    if !body.is_empty() {
        request.write_all(body).map_err(transport)?;
        request.flush().map_err(transport)?;
    }
    let mut response = request.submit().map_err(transport)?;
    let status = response.status();

    let mut received = Vec::new();
    let mut chunk = [0_u8; 512];
    loop {
        let read = response.read(&mut chunk).map_err(transport)?;
        if read == 0 {
            break;
        }
        if received.len() + read > MAX_HTTP_BODY {
            return Err(LinkError::Transport("response too large".to_string()));
        }
        received.extend_from_slice(&chunk[..read]);
    }

    Ok((status, received))
}
