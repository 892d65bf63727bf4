//! Module Reader (C2, §4.2).
//!
//! Owns exactly one TCP connection to one I/O module and drives it through
//! Created → Connecting → Connected → Polling ⇄ Reconnecting → Stopped.
//! Generalizes the teacher's `tokio::spawn`-a-task-with-its-own-loop shape
//! (see `gateway-service/src/main.rs::parse_probe_rs_output`) and the
//! per-slave polling task in `modbus_polling.rs::ModbusPollingEngine::start`
//! into an explicit state machine with socket ownership per §4.2.

use crate::config::{AcquisitionConfig, ModuleConfig};
use crate::decode;
use crate::error::GatewayError;
use crate::modbus::{decode_response, encode_request, ModbusRequest};
use crate::stats::{ReaderCounters, ReaderState, ReaderStatus};
use crate::types::{SensorReading, SensorType};
use rand::Rng;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Modbus RTU maximum frame size; caps a corrupted `byte_count` field so a
/// garbled response can't trigger an unbounded read allocation.
const MAX_RTU_FRAME: usize = 256;

fn state_to_u8(s: ReaderState) -> u8 {
    match s {
        ReaderState::Created => 0,
        ReaderState::Connecting => 1,
        ReaderState::Connected => 2,
        ReaderState::Polling => 3,
        ReaderState::Reconnecting => 4,
        ReaderState::Stopped => 5,
    }
}

fn state_from_u8(v: u8) -> ReaderState {
    match v {
        0 => ReaderState::Created,
        1 => ReaderState::Connecting,
        2 => ReaderState::Connected,
        3 => ReaderState::Polling,
        4 => ReaderState::Reconnecting,
        _ => ReaderState::Stopped,
    }
}

/// Bounded exponential backoff with jitter (§4.2, §8).
struct Backoff {
    initial_ms: f64,
    max_ms: f64,
    multiplier: f64,
    jitter_pct: f64,
    current_ms: f64,
}

impl Backoff {
    fn new(cfg: &crate::config::ReconnectBackoffConfig) -> Self {
        Self {
            initial_ms: cfg.initial_ms as f64,
            max_ms: cfg.max_ms as f64,
            multiplier: cfg.multiplier,
            jitter_pct: cfg.jitter_pct,
            current_ms: cfg.initial_ms as f64,
        }
    }

    fn reset(&mut self) {
        self.current_ms = self.initial_ms;
    }

    /// Next delay, bounded by `max_ms * (1 + jitter_pct)` regardless of how
    /// large `current_ms` has grown.
    fn next_delay(&mut self) -> Duration {
        let capped = self.current_ms.min(self.max_ms);
        let jitter = rand::thread_rng().gen_range(-self.jitter_pct..=self.jitter_pct);
        let upper_bound = self.max_ms * (1.0 + self.jitter_pct);
        let delay = (capped * (1.0 + jitter)).clamp(0.0, upper_bound);
        self.current_ms = (self.current_ms * self.multiplier).min(self.max_ms);
        Duration::from_millis(delay as u64)
    }
}

/// Handle returned by [`spawn`]: lets the owner poll status and await
/// completion without holding the socket itself.
pub struct ModuleReaderHandle {
    module_id: String,
    counters: Arc<ReaderCounters>,
    state: Arc<AtomicU8>,
    join: tokio::task::JoinHandle<()>,
}

impl ModuleReaderHandle {
    pub fn module_id(&self) -> &str {
        &self.module_id
    }

    /// `status() → {state, last_success_ts, consecutive_failures,
    /// total_reads, total_errors}` (§4.2).
    pub fn status(&self) -> ReaderStatus {
        self.counters
            .snapshot(state_from_u8(self.state.load(Ordering::Relaxed)))
    }

    pub async fn join(self) {
        let _ = self.join.await;
    }
}

/// Spawn a reader task for `config`. Non-blocking: returns immediately with
/// a handle; the task runs until `cancel` reports `true` or an irrecoverable
/// config error occurs (§4.2 `start(ctx, out_channel) → handle`).
pub fn spawn(
    config: ModuleConfig,
    acquisition: AcquisitionConfig,
    session_prefix: String,
    cancel: watch::Receiver<bool>,
    out: mpsc::Sender<SensorReading>,
) -> ModuleReaderHandle {
    let counters = Arc::new(ReaderCounters::default());
    let state = Arc::new(AtomicU8::new(state_to_u8(ReaderState::Created)));
    let module_id = config.module_id.clone();

    let task_counters = counters.clone();
    let task_state = state.clone();
    let join = tokio::spawn(async move {
        run(
            config,
            acquisition,
            session_prefix,
            cancel,
            out,
            task_counters,
            task_state,
        )
        .await;
    });

    ModuleReaderHandle {
        module_id,
        counters,
        state,
        join,
    }
}

fn set_state(state: &Arc<AtomicU8>, s: ReaderState) {
    state.store(state_to_u8(s), Ordering::Relaxed);
}

enum PollOutcome {
    Cancelled,
    NeedReconnect,
}

async fn run(
    config: ModuleConfig,
    acquisition: AcquisitionConfig,
    session_prefix: String,
    mut cancel: watch::Receiver<bool>,
    out: mpsc::Sender<SensorReading>,
    counters: Arc<ReaderCounters>,
    state: Arc<AtomicU8>,
) {
    let mut backoff = Backoff::new(&acquisition.reconnect_backoff);
    let connect_deadline = Duration::from_secs(3);
    let read_deadline = Duration::from_millis(acquisition.default_read_timeout_ms);

    loop {
        if *cancel.borrow() {
            break;
        }

        set_state(&state, ReaderState::Connecting);
        match connect_once(&config, connect_deadline, &mut cancel).await {
            ConnectOutcome::Cancelled => break,
            ConnectOutcome::Failed => {
                set_state(&state, ReaderState::Reconnecting);
                if sleep_or_cancel(backoff.next_delay(), &mut cancel).await {
                    break;
                }
            }
            ConnectOutcome::Connected(stream) => {
                set_state(&state, ReaderState::Connected);
                info!(module_id = %config.module_id, "module connected");
                backoff.reset();
                set_state(&state, ReaderState::Polling);
                match poll_loop(
                    stream,
                    &config,
                    &acquisition,
                    &session_prefix,
                    read_deadline,
                    &mut cancel,
                    &out,
                    &counters,
                )
                .await
                {
                    PollOutcome::Cancelled => break,
                    PollOutcome::NeedReconnect => {
                        set_state(&state, ReaderState::Reconnecting);
                        if sleep_or_cancel(backoff.next_delay(), &mut cancel).await {
                            break;
                        }
                    }
                }
            }
        }
    }

    set_state(&state, ReaderState::Stopped);
    info!(module_id = %config.module_id, "module reader stopped");
}

enum ConnectOutcome {
    Connected(TcpStream),
    Failed,
    Cancelled,
}

async fn connect_once(
    config: &ModuleConfig,
    deadline: Duration,
    cancel: &mut watch::Receiver<bool>,
) -> ConnectOutcome {
    let addr = (config.host.as_str(), config.port);
    tokio::select! {
        biased;
        _ = cancel.changed() => ConnectOutcome::Cancelled,
        result = timeout(deadline, TcpStream::connect(addr)) => {
            match result {
                Ok(Ok(stream)) => ConnectOutcome::Connected(stream),
                Ok(Err(e)) => {
                    warn!(module_id = %config.module_id, error = %e, "connect failed");
                    ConnectOutcome::Failed
                }
                Err(_) => {
                    warn!(module_id = %config.module_id, "connect timed out");
                    ConnectOutcome::Failed
                }
            }
        }
    }
}

/// Sleep for `delay`, returning `true` if cancellation arrived first.
async fn sleep_or_cancel(delay: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        biased;
        _ = cancel.changed() => true,
        _ = tokio::time::sleep(delay) => *cancel.borrow(),
    }
}

#[allow(clippy::too_many_arguments)]
async fn poll_loop(
    mut stream: TcpStream,
    config: &ModuleConfig,
    acquisition: &AcquisitionConfig,
    session_prefix: &str,
    read_deadline: Duration,
    cancel: &mut watch::Receiver<bool>,
    out: &mpsc::Sender<SensorReading>,
    counters: &Arc<ReaderCounters>,
) -> PollOutcome {
    let mut ticker = tokio::time::interval(config.poll_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.changed() => return PollOutcome::Cancelled,
            _ = ticker.tick() => {}
        }
        if *cancel.borrow() {
            return PollOutcome::Cancelled;
        }

        match poll_once(&mut stream, config, read_deadline).await {
            Ok(words) => {
                counters.record_success();
                emit_readings(config, session_prefix, &words, out).await;
            }
            Err(e) => {
                warn!(module_id = %config.module_id, error = %e, "poll failed");
                let consecutive = counters.record_failure();
                if consecutive >= acquisition.failure_threshold {
                    return PollOutcome::NeedReconnect;
                }
            }
        }
    }
}

async fn poll_once(
    stream: &mut TcpStream,
    config: &ModuleConfig,
    read_deadline: Duration,
) -> Result<Vec<u16>, GatewayError> {
    let req = ModbusRequest {
        slave_addr: config.slave_addr,
        function_code: config.function_code,
        start_register: config.start_register,
        count: config.register_count,
    };
    let frame = encode_request(&req);
    stream.write_all(&frame).await?;

    let raw = timeout(read_deadline, read_frame(stream, config.register_count))
        .await
        .map_err(|_| {
            GatewayError::IoError(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "response read deadline exceeded",
            ))
        })??;

    decode_response(&raw, config.slave_addr, config.register_count)
}

/// Read one response frame: header first (slave, function, byte_count-or-
/// exception-code), then the rest once the total length is known.
async fn read_frame(stream: &mut TcpStream, expected_count: u16) -> Result<Vec<u8>, GatewayError> {
    let mut header = [0u8; 3];
    stream.read_exact(&mut header).await?;

    let function_code = header[1];
    let mut frame = header.to_vec();

    if function_code & 0x80 != 0 {
        let mut rest = [0u8; 2]; // crc
        stream.read_exact(&mut rest).await?;
        frame.extend_from_slice(&rest);
        return Ok(frame);
    }

    let byte_count = header[2] as usize;
    if byte_count > MAX_RTU_FRAME {
        return Err(GatewayError::FrameMalformed {
            expected: 2 * expected_count as usize,
            actual: byte_count,
        });
    }
    let mut rest = vec![0u8; byte_count + 2];
    stream.read_exact(&mut rest).await?;
    frame.extend_from_slice(&rest);
    Ok(frame)
}

async fn emit_readings(
    config: &ModuleConfig,
    session_prefix: &str,
    words: &[u16],
    out: &mpsc::Sender<SensorReading>,
) {
    let now = chrono::Utc::now();
    for (channel, &raw) in words.iter().enumerate().take(config.channel_count as usize) {
        let channel = channel as u32;
        let sensor_id =
            SensorReading::make_sensor_id(config.sensor_type, &config.module_id, channel);
        match decode::decode(
            config.sensor_type,
            config.is_rtc,
            config.conversion.as_ref(),
            &sensor_id,
            raw,
        ) {
            Ok(value) => {
                let reading = SensorReading {
                    module_id: config.module_id.clone(),
                    sensor_type: config.sensor_type,
                    sensor_id,
                    channel,
                    timestamp: now,
                    raw,
                    value,
                    unit: config.sensor_type.unit().to_string(),
                    session_prefix: session_prefix.to_string(),
                };
                if out.send(reading).await.is_err() {
                    debug!(module_id = %config.module_id, "output channel closed");
                }
            }
            Err(e) => {
                debug!(module_id = %config.module_id, error = %e, "sample dropped on decode error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModuleConfig, ReconnectBackoffConfig};
    use tokio::net::TcpListener;

    fn module_config(host: String, port: u16) -> ModuleConfig {
        ModuleConfig {
            module_id: "m1".into(),
            host,
            port,
            slave_addr: 1,
            function_code: 4,
            start_register: 0,
            register_count: 2,
            poll_interval_ms: 20,
            sensor_type: SensorType::Temperature,
            channel_count: 2,
            conversion: None,
            is_rtc: true,
        }
    }

    fn acquisition_config() -> AcquisitionConfig {
        AcquisitionConfig {
            default_poll_interval_ms: 20,
            default_read_timeout_ms: 200,
            reconnect_backoff: ReconnectBackoffConfig {
                initial_ms: 10,
                max_ms: 50,
                multiplier: 2.0,
                jitter_pct: 0.0,
            },
            failure_threshold: 3,
        }
    }

    #[test]
    fn backoff_never_exceeds_bound() {
        let cfg = crate::config::ReconnectBackoffConfig {
            initial_ms: 1000,
            max_ms: 30_000,
            multiplier: 2.0,
            jitter_pct: 0.2,
        };
        let mut backoff = Backoff::new(&cfg);
        let upper_bound_ms = 30_000.0 * 1.2;
        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!((delay.as_millis() as f64) <= upper_bound_ms + 1.0);
        }
    }

    #[tokio::test]
    async fn reconnects_after_threshold_crc_failures() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Fake device: always replies with a correct 2-register frame first
        // accept, then a CRC-corrupted frame forever after, until the client
        // disconnects (triggering the reader's reconnect).
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 8];
            loop {
                if sock.read_exact(&mut buf).await.is_err() {
                    break;
                }
                let mut frame = vec![0x01, 0x04, 0x04, 0x00, 0xFA, 0xFF, 0xEC];
                let crc = crc::Crc::<u16>::new(&crc::CRC_16_MODBUS).checksum(&frame);
                frame.extend_from_slice(&crc.to_le_bytes());
                frame[7] ^= 0xFF; // corrupt CRC byte
                if sock.write_all(&frame).await.is_err() {
                    break;
                }
            }
        });

        let config = module_config(addr.ip().to_string(), addr.port());
        let acquisition = acquisition_config();
        let (tx, mut rx) = mpsc::channel(16);
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let handle = spawn(config, acquisition, "20260101_000000".into(), cancel_rx, tx);

        // No readings should ever be emitted since every response is corrupt.
        let drained = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await;
        assert!(drained.is_err() || drained.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(300)).await;
        let status = handle.status();
        assert!(status.total_errors >= 3);
    }
}
