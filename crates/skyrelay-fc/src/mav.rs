use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use mavlink::common::{
    MavAutopilot, MavCmd, MavMessage, MavModeFlag, MavResult, MavState, MavSysStatusSensor, MavType,
    ATTITUDE_DATA, COMMAND_LONG_DATA, GLOBAL_POSITION_INT_DATA, HEARTBEAT_DATA, SYS_STATUS_DATA,
};
use mavlink::error::MessageReadError;
use mavlink::{MavConnection, MavHeader};
use skyrelay_proto::telemetry::{Attitude, Battery, Health, Position, TelemetrySample, Velocity};
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::actions::{CommandError, VehicleActions};
use crate::link::{LinkError, TelemetrySource};
use crate::state::SamplePublisher;
use crate::VehicleConfig;

type MavConn = Box<dyn MavConnection<MavMessage> + Send + Sync>;
type Inbound = Result<(MavHeader, MavMessage), String>;

const INBOX_DEPTH: usize = 256;
const GCS_HEARTBEAT_EVERY: Duration = Duration::from_secs(1);

struct Session {
    conn: Arc<MavConn>,
    inbox: tokio::sync::Mutex<mpsc::Receiver<Inbound>>,
}

/// What we have learned about the vehicle on the other end.
#[derive(Debug, Clone, Copy, Default)]
struct Peer {
    target: Option<(u8, u8)>,
    autopilot: Option<MavAutopilot>,
    home_amsl_m: Option<f32>,
}

/// Live vehicle over MAVLink.
///
/// The connection is opened once and kept across reconnect attempts, including
/// after the vehicle goes silent; a dedicated reader thread forwards every
/// message into an inbox that `connect` (waiting for the first HEARTBEAT) and
/// `acquire` drain in turn. Only a hard I/O error tears the session down so the
/// next attempt reopens it.
pub struct MavSource {
    address: String,
    sample_period: Duration,
    heartbeat_timeout: Duration,
    stream_timeout: Duration,
    ack_timeout: Duration,
    sys_id: u8,
    comp_id: u8,
    sequence: AtomicU8,
    session: Mutex<Option<Arc<Session>>>,
    peer: Mutex<Peer>,
    pending: Mutex<Vec<(MavCmd, oneshot::Sender<MavResult>)>>,
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MavSource {
    pub fn new(cfg: &VehicleConfig) -> Self {
        Self {
            address: cfg.address.clone(),
            sample_period: cfg.sample_period(),
            heartbeat_timeout: Duration::from_millis(cfg.heartbeat_timeout_ms),
            stream_timeout: Duration::from_millis(cfg.stream_timeout_ms),
            ack_timeout: Duration::from_millis(cfg.command_ack_timeout_ms),
            sys_id: cfg.sys_id,
            comp_id: cfg.comp_id,
            sequence: AtomicU8::new(0),
            session: Mutex::new(None),
            peer: Mutex::new(Peer::default()),
            pending: Mutex::new(Vec::new()),
        }
    }

    fn next_header(&self) -> MavHeader {
        MavHeader {
            system_id: self.sys_id,
            component_id: self.comp_id,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed).wrapping_add(1),
        }
    }

    fn current_session(&self) -> Option<Arc<Session>> {
        locked(&self.session).clone()
    }

    fn drop_session(&self, dead: &Arc<Session>) {
        let mut slot = locked(&self.session);
        if slot.as_ref().is_some_and(|s| Arc::ptr_eq(s, dead)) {
            *slot = None;
        }
        // nobody will ever answer these
        locked(&self.pending).clear();
    }

    async fn open_session(&self) -> Result<Arc<Session>, LinkError> {
        if let Some(s) = self.current_session() {
            return Ok(s);
        }

        let address = self.address.clone();
        let conn = tokio::task::spawn_blocking(move || mavlink::connect::<MavMessage>(&address))
            .await
            .map_err(|e| LinkError::Unreachable(e.to_string()))?
            .map_err(|e| LinkError::Unreachable(format!("mavlink connect {}: {}", self.address, e)))?;
        let conn: Arc<MavConn> = Arc::new(conn);

        let (tx, rx) = mpsc::channel(INBOX_DEPTH);
        let reader = Arc::clone(&conn);
        // Detached: `recv` has no timeout, and the runtime must not wait on it
        // at shutdown.
        std::thread::Builder::new()
            .name("mavlink-rx".into())
            .spawn(move || read_loop(reader, tx))
            .map_err(|e| LinkError::Unreachable(format!("spawn mavlink reader: {}", e)))?;

        let session = Arc::new(Session { conn, inbox: tokio::sync::Mutex::new(rx) });
        *locked(&self.session) = Some(Arc::clone(&session));
        info!("vehicle: mavlink endpoint {} open", self.address);
        Ok(session)
    }

    async fn send(&self, session: &Session, msg: MavMessage) -> Result<(), String> {
        let header = self.next_header();
        let conn = Arc::clone(&session.conn);
        tokio::task::spawn_blocking(move || conn.send(&header, &msg))
            .await
            .map_err(|e| e.to_string())?
            .map_err(|e| format!("mavlink send: {}", e))?;
        Ok(())
    }

    /// Records vehicle identity from a heartbeat. Returns false for heartbeats
    /// that do not come from a vehicle (other ground stations, ourselves).
    fn note_heartbeat(&self, header: &MavHeader, hb: &HEARTBEAT_DATA) -> bool {
        if hb.mavtype == MavType::MAV_TYPE_GCS || header.system_id == self.sys_id {
            return false;
        }
        let mut peer = locked(&self.peer);
        if peer.target.is_none() {
            info!("vehicle: heartbeat from system {} ({:?})", header.system_id, hb.autopilot);
        }
        peer.target = Some((header.system_id, header.component_id));
        peer.autopilot = Some(hb.autopilot);
        true
    }

    fn complete_command(&self, command: MavCmd, result: MavResult) {
        let mut pending = locked(&self.pending);
        if let Some(i) = pending.iter().position(|(c, _)| *c == command) {
            let (_, tx) = pending.swap_remove(i);
            let _ = tx.send(result);
        } else {
            debug!("vehicle: unsolicited ack for {:?}: {:?}", command, result);
        }
    }

    async fn command(&self, name: &'static str, command: MavCmd, params: [f32; 7]) -> Result<(), CommandError> {
        let session = self.current_session().ok_or(CommandError::NotConnected)?;
        let (target_system, target_component) = locked(&self.peer).target.ok_or(CommandError::NotConnected)?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = locked(&self.pending);
            // a newer request for the same command supersedes the old wait
            pending.retain(|(c, _)| *c != command);
            pending.push((command, tx));
        }

        let cmd = COMMAND_LONG_DATA {
            target_system,
            target_component,
            command,
            confirmation: 0,
            param1: params[0],
            param2: params[1],
            param3: params[2],
            param4: params[3],
            param5: params[4],
            param6: params[5],
            param7: params[6],
        };
        info!("vehicle: sending {}", name);
        self.send(&session, MavMessage::COMMAND_LONG(cmd)).await.map_err(CommandError::Link)?;

        match timeout(self.ack_timeout, rx).await {
            Ok(Ok(MavResult::MAV_RESULT_ACCEPTED | MavResult::MAV_RESULT_IN_PROGRESS)) => Ok(()),
            Ok(Ok(other)) => Err(CommandError::Rejected(format!("{}: {:?}", name, other))),
            Ok(Err(_)) => Err(CommandError::Link("link dropped while waiting for ack".into())),
            Err(_) => {
                locked(&self.pending).retain(|(c, _)| *c != command);
                Err(CommandError::Timeout(name, self.ack_timeout))
            }
        }
    }
}

fn read_loop(conn: Arc<MavConn>, tx: mpsc::Sender<Inbound>) {
    loop {
        match conn.recv() {
            Ok(frame) => {
                if tx.blocking_send(Ok(frame)).is_err() {
                    return;
                }
            }
            Err(MessageReadError::Io(e)) => {
                let _ = tx.blocking_send(Err(e.to_string()));
                return;
            }
            Err(e) => debug!("vehicle: dropping unparseable mavlink frame: {:?}", e),
        }
    }
}

fn gcs_heartbeat() -> MavMessage {
    MavMessage::HEARTBEAT(HEARTBEAT_DATA {
        custom_mode: 0,
        mavtype: MavType::MAV_TYPE_GCS,
        autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
        base_mode: MavModeFlag::empty(),
        system_status: MavState::MAV_STATE_ACTIVE,
        mavlink_version: 3,
    })
}

#[async_trait]
impl TelemetrySource for MavSource {
    fn describe(&self) -> String {
        self.address.clone()
    }

    async fn connect(&self) -> Result<(), LinkError> {
        let session = self.open_session().await?;
        let mut inbox = session.inbox.lock().await;

        let wait = async {
            while let Some(item) = inbox.recv().await {
                match item {
                    Ok((header, MavMessage::HEARTBEAT(hb))) if self.note_heartbeat(&header, &hb) => return Ok(()),
                    Ok(_) => {}
                    Err(e) => return Err(e),
                }
            }
            Err("mavlink reader stopped".to_string())
        };

        match timeout(self.heartbeat_timeout, wait).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                drop(inbox);
                self.drop_session(&session);
                Err(LinkError::Unreachable(e))
            }
            // keep the endpoint open; the vehicle may just not be up yet
            Err(_) => Err(LinkError::Unreachable(format!(
                "no heartbeat on {} within {}s",
                self.address,
                self.heartbeat_timeout.as_secs_f32()
            ))),
        }
    }

    async fn acquire(&self, samples: SamplePublisher) -> Result<(), LinkError> {
        let session = self.current_session().ok_or_else(|| LinkError::StreamLost("no session".into()))?;
        let mut inbox = session.inbox.lock().await;
        let mut builder = SampleBuilder::default();
        let mut last_publish: Option<Instant> = None;
        let mut heartbeat = tokio::time::interval(GCS_HEARTBEAT_EVERY);
        let silence = tokio::time::sleep(self.stream_timeout);
        tokio::pin!(silence);

        let (outcome, endpoint_dead) = loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if let Err(e) = self.send(&session, gcs_heartbeat()).await {
                        warn!("vehicle: {}", e);
                    }
                }
                _ = &mut silence => {
                    break (
                        LinkError::StreamLost(format!(
                            "no mavlink traffic for {}s",
                            self.stream_timeout.as_secs_f32()
                        )),
                        false,
                    );
                }
                item = inbox.recv() => {
                    let (header, msg) = match item {
                        None => break (LinkError::StreamLost("mavlink reader stopped".into()), true),
                        Some(Err(e)) => break (LinkError::StreamLost(e), true),
                        Some(Ok(frame)) => frame,
                    };
                    silence.as_mut().reset(Instant::now() + self.stream_timeout);

                    match &msg {
                        MavMessage::HEARTBEAT(hb) => {
                            if !self.note_heartbeat(&header, hb) {
                                continue;
                            }
                        }
                        MavMessage::COMMAND_ACK(ack) => {
                            self.complete_command(ack.command, ack.result);
                            continue;
                        }
                        MavMessage::HOME_POSITION(home) => {
                            locked(&self.peer).home_amsl_m = Some(home.altitude as f32 / 1000.0);
                        }
                        _ => {}
                    }

                    if builder.apply(&msg) && last_publish.map_or(true, |t| t.elapsed() >= self.sample_period) {
                        samples.publish(builder.snapshot(OffsetDateTime::now_utc()));
                        last_publish = Some(Instant::now());
                    }
                }
            }
        };

        drop(inbox);
        if endpoint_dead {
            self.drop_session(&session);
        }
        Err(outcome)
    }
}

#[async_trait]
impl VehicleActions for MavSource {
    async fn arm(&self) -> Result<(), CommandError> {
        self.command("ARM", MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]).await
    }

    async fn disarm(&self) -> Result<(), CommandError> {
        self.command("DISARM", MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, [0.0; 7]).await
    }

    async fn takeoff(&self, altitude_m: f32) -> Result<(), CommandError> {
        let peer = *locked(&self.peer);
        // PX4 wants an AMSL target; ArduPilot takes it relative to home.
        let target = match (peer.autopilot, peer.home_amsl_m) {
            (Some(MavAutopilot::MAV_AUTOPILOT_PX4), Some(home)) => home + altitude_m,
            _ => altitude_m,
        };
        self.command(
            "TAKEOFF",
            MavCmd::MAV_CMD_NAV_TAKEOFF,
            [0.0, 0.0, 0.0, f32::NAN, f32::NAN, f32::NAN, target],
        )
        .await
    }

    async fn land(&self) -> Result<(), CommandError> {
        self.command("LAND", MavCmd::MAV_CMD_NAV_LAND, [0.0, 0.0, 0.0, f32::NAN, f32::NAN, f32::NAN, f32::NAN])
            .await
    }
}

/// Folds individual MAVLink messages into a running telemetry sample.
#[derive(Debug, Default)]
pub struct SampleBuilder {
    position: Position,
    attitude: Attitude,
    velocity: Velocity,
    battery: Battery,
    flight_mode: Option<String>,
    health: Health,
}

impl SampleBuilder {
    /// Returns true when `msg` changed the sample.
    pub fn apply(&mut self, msg: &MavMessage) -> bool {
        match msg {
            MavMessage::HEARTBEAT(hb) => {
                self.flight_mode = Some(flight_mode_name(hb.autopilot, hb.base_mode, hb.custom_mode));
            }
            MavMessage::GLOBAL_POSITION_INT(p) => self.update_position(p),
            MavMessage::ATTITUDE(a) => self.update_attitude(a),
            MavMessage::SYS_STATUS(s) => self.update_status(s),
            MavMessage::HOME_POSITION(_) => self.health.is_home_position_ok = true,
            MavMessage::LOCAL_POSITION_NED(_) => self.health.is_local_position_ok = true,
            _ => return false,
        }
        self.health.is_armable = self.health.is_gyrometer_calibration_ok
            && self.health.is_accelerometer_calibration_ok
            && self.health.is_magnetometer_calibration_ok
            && self.health.is_global_position_ok
            && self.health.is_home_position_ok;
        true
    }

    fn update_position(&mut self, p: &GLOBAL_POSITION_INT_DATA) {
        self.position = Position {
            lat: p.lat as f64 / 1e7,
            lon: p.lon as f64 / 1e7,
            relative_alt_m: p.relative_alt as f32 / 1000.0,
            absolute_alt_m: p.alt as f32 / 1000.0,
        };
        // cm/s, NED
        self.velocity = Velocity {
            north_m_s: p.vx as f32 / 100.0,
            east_m_s: p.vy as f32 / 100.0,
            down_m_s: p.vz as f32 / 100.0,
        };
        self.health.is_global_position_ok = p.lat != 0 || p.lon != 0;
    }

    fn update_attitude(&mut self, a: &ATTITUDE_DATA) {
        self.attitude = Attitude {
            roll_deg: a.roll.to_degrees(),
            pitch_deg: a.pitch.to_degrees(),
            yaw_deg: a.yaw.to_degrees(),
        };
    }

    fn update_status(&mut self, status: &SYS_STATUS_DATA) {
        // millivolts; u16::MAX means unknown
        if status.voltage_battery != u16::MAX {
            self.battery.voltage_v = status.voltage_battery as f32 / 1000.0;
        }
        // -1 means unknown
        if (0..=100).contains(&status.battery_remaining) {
            self.battery.remaining_percent = status.battery_remaining as f32;
        }

        let ok = |sensor: MavSysStatusSensor| {
            !status.onboard_control_sensors_present.contains(sensor)
                || status.onboard_control_sensors_health.contains(sensor)
        };
        self.health.is_gyrometer_calibration_ok = ok(MavSysStatusSensor::MAV_SYS_STATUS_SENSOR_3D_GYRO);
        self.health.is_accelerometer_calibration_ok = ok(MavSysStatusSensor::MAV_SYS_STATUS_SENSOR_3D_ACCEL);
        self.health.is_magnetometer_calibration_ok = ok(MavSysStatusSensor::MAV_SYS_STATUS_SENSOR_3D_MAG);
        self.health.is_level_calibration_ok = ok(MavSysStatusSensor::MAV_SYS_STATUS_AHRS);
    }

    pub fn snapshot(&self, timestamp: OffsetDateTime) -> TelemetrySample {
        TelemetrySample {
            timestamp,
            connected: true,
            position: self.position,
            attitude: self.attitude,
            velocity: self.velocity,
            battery: self.battery,
            flight_mode: self.flight_mode.clone().unwrap_or_else(|| "UNKNOWN".into()),
            health: self.health,
        }
    }
}

/// Human-readable flight mode from a HEARTBEAT's custom mode.
pub fn flight_mode_name(autopilot: MavAutopilot, base_mode: MavModeFlag, custom_mode: u32) -> String {
    if !base_mode.contains(MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED) {
        return "UNKNOWN".into();
    }
    let name = match autopilot {
        MavAutopilot::MAV_AUTOPILOT_PX4 => px4_mode(custom_mode),
        MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA => copter_mode(custom_mode),
        _ => None,
    };
    name.unwrap_or("UNKNOWN").to_string()
}

fn px4_mode(custom_mode: u32) -> Option<&'static str> {
    let main = (custom_mode >> 16) & 0xFF;
    let sub = (custom_mode >> 24) & 0xFF;
    Some(match main {
        1 => "MANUAL",
        2 => "ALTCTL",
        3 => "POSCTL",
        4 => match sub {
            1 => "READY",
            2 => "TAKEOFF",
            3 => "HOLD",
            4 => "MISSION",
            5 => "RETURN_TO_LAUNCH",
            6 => "LAND",
            8 => "FOLLOW_ME",
            9 => "PRECISION_LAND",
            _ => "AUTO",
        },
        5 => "ACRO",
        6 => "OFFBOARD",
        7 => "STABILIZED",
        8 => "RATTITUDE",
        _ => return None,
    })
}

fn copter_mode(custom_mode: u32) -> Option<&'static str> {
    Some(match custom_mode {
        0 => "STABILIZE",
        1 => "ACRO",
        2 => "ALT_HOLD",
        3 => "AUTO",
        4 => "GUIDED",
        5 => "LOITER",
        6 => "RTL",
        7 => "CIRCLE",
        9 => "LAND",
        11 => "DRIFT",
        13 => "SPORT",
        14 => "FLIP",
        15 => "AUTOTUNE",
        16 => "POSHOLD",
        17 => "BRAKE",
        18 => "THROW",
        19 => "AVOID_ADSB",
        20 => "GUIDED_NOGPS",
        21 => "SMART_RTL",
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn heartbeat(autopilot: MavAutopilot, custom_mode: u32) -> HEARTBEAT_DATA {
        HEARTBEAT_DATA {
            custom_mode,
            mavtype: MavType::MAV_TYPE_QUADROTOR,
            autopilot,
            base_mode: MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED,
            system_status: MavState::MAV_STATE_ACTIVE,
            mavlink_version: 3,
        }
    }

    #[test]
    fn decodes_px4_modes() {
        let custom = |main: u32, sub: u32| (sub << 24) | (main << 16);
        let on = MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED;
        assert_eq!(flight_mode_name(MavAutopilot::MAV_AUTOPILOT_PX4, on, custom(3, 0)), "POSCTL");
        assert_eq!(flight_mode_name(MavAutopilot::MAV_AUTOPILOT_PX4, on, custom(4, 3)), "HOLD");
        assert_eq!(flight_mode_name(MavAutopilot::MAV_AUTOPILOT_PX4, on, custom(4, 6)), "LAND");
        assert_eq!(flight_mode_name(MavAutopilot::MAV_AUTOPILOT_PX4, on, custom(42, 0)), "UNKNOWN");
    }

    #[test]
    fn decodes_ardupilot_modes() {
        let on = MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED;
        assert_eq!(flight_mode_name(MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA, on, 4), "GUIDED");
        assert_eq!(flight_mode_name(MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA, on, 0), "STABILIZE");
        // custom mode flag not set
        assert_eq!(flight_mode_name(MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA, MavModeFlag::empty(), 4), "UNKNOWN");
    }

    #[test]
    fn folds_position_and_attitude() {
        let mut b = SampleBuilder::default();
        assert!(b.apply(&MavMessage::GLOBAL_POSITION_INT(GLOBAL_POSITION_INT_DATA {
            time_boot_ms: 1000,
            lat: 473_977_000,
            lon: 85_456_000,
            alt: 488_000,
            relative_alt: 10_500,
            vx: 150,
            vy: -50,
            vz: 20,
            hdg: 9000,
        })));
        assert!(b.apply(&MavMessage::ATTITUDE(ATTITUDE_DATA {
            time_boot_ms: 1000,
            roll: 0.0,
            pitch: std::f32::consts::FRAC_PI_4,
            yaw: -std::f32::consts::FRAC_PI_2,
            rollspeed: 0.0,
            pitchspeed: 0.0,
            yawspeed: 0.0,
        })));
        assert!(b.apply(&MavMessage::HEARTBEAT(heartbeat(MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA, 5))));

        let s = b.snapshot(OffsetDateTime::UNIX_EPOCH);
        assert!((s.position.lat - 47.3977).abs() < 1e-9);
        assert!((s.position.lon - 8.5456).abs() < 1e-9);
        assert!((s.position.relative_alt_m - 10.5).abs() < 1e-4);
        assert!((s.position.absolute_alt_m - 488.0).abs() < 1e-3);
        assert!((s.velocity.north_m_s - 1.5).abs() < 1e-6);
        assert!((s.velocity.east_m_s + 0.5).abs() < 1e-6);
        assert!((s.attitude.pitch_deg - 45.0).abs() < 1e-3);
        assert!((s.attitude.yaw_deg + 90.0).abs() < 1e-3);
        assert_eq!(s.flight_mode, "LOITER");
        assert!(s.health.is_global_position_ok);
        // no home yet
        assert!(!s.health.is_armable);
    }

    #[test]
    fn unrelated_messages_are_ignored() {
        let mut b = SampleBuilder::default();
        assert!(!b.apply(&param_request()));
        assert_eq!(b.snapshot(OffsetDateTime::UNIX_EPOCH).flight_mode, "UNKNOWN");
    }

    fn param_request() -> MavMessage {
        MavMessage::PARAM_REQUEST_LIST(mavlink::common::PARAM_REQUEST_LIST_DATA {
            target_system: 1,
            target_component: 1,
        })
    }

    #[test]
    fn vehicle_heartbeats_set_target_but_gcs_ones_do_not() {
        let src = MavSource::new(&VehicleConfig::default());
        let gcs = HEARTBEAT_DATA { mavtype: MavType::MAV_TYPE_GCS, ..heartbeat(MavAutopilot::MAV_AUTOPILOT_INVALID, 0) };
        let hdr = |system_id| MavHeader { system_id, component_id: 1, sequence: 0 };

        assert!(!src.note_heartbeat(&hdr(255), &gcs));
        assert!(locked(&src.peer).target.is_none());

        assert!(src.note_heartbeat(&hdr(1), &heartbeat(MavAutopilot::MAV_AUTOPILOT_PX4, 0)));
        assert_eq!(locked(&src.peer).target, Some((1, 1)));
    }

    #[tokio::test]
    async fn acks_resolve_matching_waiters() {
        let src = MavSource::new(&VehicleConfig::default());
        let (tx, rx) = oneshot::channel();
        locked(&src.pending).push((MavCmd::MAV_CMD_NAV_LAND, tx));

        src.complete_command(MavCmd::MAV_CMD_NAV_TAKEOFF, MavResult::MAV_RESULT_ACCEPTED);
        assert_eq!(locked(&src.pending).len(), 1);

        src.complete_command(MavCmd::MAV_CMD_NAV_LAND, MavResult::MAV_RESULT_DENIED);
        assert_eq!(rx.await.unwrap(), MavResult::MAV_RESULT_DENIED);
        assert!(locked(&src.pending).is_empty());
    }

    /// Fake vehicle on a `udpout:` endpoint sending heartbeats every 50ms
    /// while `talking` is set.
    fn fake_vehicle(port: u16, talking: Arc<AtomicBool>, stop: Arc<AtomicBool>) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            let conn = mavlink::connect::<MavMessage>(&format!("udpout:127.0.0.1:{}", port)).unwrap();
            let mut seq = 0u8;
            while !stop.load(Ordering::SeqCst) {
                if talking.load(Ordering::SeqCst) {
                    let header = MavHeader { system_id: 1, component_id: 1, sequence: seq };
                    seq = seq.wrapping_add(1);
                    let hb = MavMessage::HEARTBEAT(heartbeat(MavAutopilot::MAV_AUTOPILOT_PX4, 0));
                    let _ = conn.send(&header, &hb);
                }
                std::thread::sleep(Duration::from_millis(50));
            }
        })
    }

    fn free_udp_port() -> u16 {
        std::net::UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn silent_vehicle_ends_acquire_and_endpoint_survives() {
        let port = free_udp_port();
        let cfg = VehicleConfig {
            address: format!("udpin:127.0.0.1:{}", port),
            heartbeat_timeout_ms: 3000,
            stream_timeout_ms: 400,
            ..VehicleConfig::default()
        };
        let src = MavSource::new(&cfg);
        let talking = Arc::new(AtomicBool::new(true));
        let stop = Arc::new(AtomicBool::new(false));
        let vehicle = fake_vehicle(port, Arc::clone(&talking), Arc::clone(&stop));

        src.connect().await.unwrap();

        // GCS heartbeats go out every second, well past the silence limit.
        talking.store(false, Ordering::SeqCst);
        let (writer, _view) = crate::state::channel();
        let started = Instant::now();
        let outcome = timeout(Duration::from_secs(5), src.acquire(writer.samples())).await;
        assert!(matches!(outcome, Ok(Err(LinkError::StreamLost(_)))), "acquire kept running: {:?}", outcome);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(src.current_session().is_some());

        // Same endpoint, no rebind: the vehicle is picked up again.
        talking.store(true, Ordering::SeqCst);
        src.connect().await.unwrap();

        stop.store(true, Ordering::SeqCst);
        vehicle.join().unwrap();
    }

    #[tokio::test]
    async fn commands_without_session_are_not_connected() {
        let src = MavSource::new(&VehicleConfig::default());
        assert!(matches!(src.arm().await, Err(CommandError::NotConnected)));
    }
}
