// =============================================================================
// Kline WebSocket connection task
// =============================================================================
//
// One task per stream.  The loop is: backfill, connect, read until something
// goes wrong, reconnect with exponential backoff.  Backfilling before every
// (re)connect closes the window where bars closed while the socket was down —
// the cache is rebuilt from REST history, so the live feed only ever has to
// deliver bars from "now" forward.
//
// A heartbeat interval drives three checks while connected: socket silence
// (force-close after the timeout), bar staleness, and pending resyncs.  A
// served resync also reopens the socket so feed and history restart from the
// same point.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::stream::manager::StreamManager;
use crate::types::{now_ms, Bar};

/// Why the inner read loop ended.
enum LoopExit {
    /// Socket closed, errored, or went silent: reconnect.
    Reconnect,
    /// Shutdown was requested: stop the task.
    Shutdown,
}

/// Exponential reconnect delay, reset to base every time a socket opens.
/// Only failures without an intervening successful open escalate the delay.
struct Backoff {
    base_ms: u64,
    max_ms: u64,
    current_ms: u64,
}

impl Backoff {
    fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base_ms,
            max_ms,
            current_ms: base_ms,
        }
    }

    fn delay_ms(&self) -> u64 {
        self.current_ms
    }

    fn advance(&mut self) {
        self.current_ms = (self.current_ms * 2).min(self.max_ms);
    }

    fn reset(&mut self) {
        self.current_ms = self.base_ms;
    }
}

/// Run one stream's connection lifecycle until shutdown.
pub async fn run(manager: Arc<StreamManager>) {
    let timing = manager.timing().clone();
    let mut backoff = Backoff::new(timing.reconnect_base_ms, timing.reconnect_max_ms);
    let mut first_connect = true;

    loop {
        if manager.is_shutting_down() {
            break;
        }

        // History first, so the feed only has to cover "now" forward.
        if let Err(e) = manager.backfill().await {
            warn!(
                symbol = %manager.symbol(),
                timeframe = %manager.timeframe(),
                error = %e,
                "pre-connect backfill failed, backing off"
            );
            if sleep_or_shutdown(&manager, backoff.delay_ms()).await {
                break;
            }
            backoff.advance();
            continue;
        }

        let ws_stream = match connect(&manager).await {
            Ok(ws_stream) => ws_stream,
            Err(e) => {
                warn!(
                    symbol = %manager.symbol(),
                    timeframe = %manager.timeframe(),
                    error = %e,
                    backoff_ms = backoff.delay_ms(),
                    "kline WebSocket connect failed, backing off"
                );
                if sleep_or_shutdown(&manager, backoff.delay_ms()).await {
                    break;
                }
                backoff.advance();
                continue;
            }
        };

        // An open socket resets the delay; a session that later dies from a
        // read error starts over from the base.
        backoff.reset();
        if !first_connect {
            manager.health().record_reconnect();
        }
        first_connect = false;

        match read_session(&manager, ws_stream).await {
            Ok(LoopExit::Shutdown) => break,
            Ok(LoopExit::Reconnect) => {}
            Err(e) => {
                warn!(
                    symbol = %manager.symbol(),
                    timeframe = %manager.timeframe(),
                    error = %e,
                    backoff_ms = backoff.delay_ms(),
                    "kline stream error, reconnecting"
                );
                if sleep_or_shutdown(&manager, backoff.delay_ms()).await {
                    break;
                }
                backoff.advance();
            }
        }
    }

    info!(
        symbol = %manager.symbol(),
        timeframe = %manager.timeframe(),
        "kline stream task stopped"
    );
}

/// Sleep for `ms`, returning `true` if shutdown arrived first.
async fn sleep_or_shutdown(manager: &StreamManager, ms: u64) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(ms)) => false,
        _ = manager.shutdown_notified() => true,
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = futures_util::stream::SplitSink<WsStream, Message>;
type WsSource = futures_util::stream::SplitStream<WsStream>;

async fn connect(manager: &StreamManager) -> Result<WsStream> {
    let lower = manager.symbol().to_lowercase();
    let url = format!(
        "wss://stream.binance.com:9443/ws/{lower}@kline_{}",
        manager.timeframe().as_str()
    );
    info!(url = %url, timeframe = %manager.timeframe(), "connecting to kline WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to kline WebSocket")?;

    info!(
        symbol = %manager.symbol(),
        timeframe = %manager.timeframe(),
        "kline WebSocket connected"
    );
    Ok(ws_stream)
}

async fn read_session(manager: &Arc<StreamManager>, ws_stream: WsStream) -> Result<LoopExit> {
    let (mut write, mut read) = ws_stream.split();
    manager.health().set_alive(true);
    manager.health().record_message(now_ms());

    let result = read_loop(manager, &mut write, &mut read).await;
    manager.health().set_alive(false);
    result
}

async fn read_loop(
    manager: &Arc<StreamManager>,
    write: &mut WsSink,
    read: &mut WsSource,
) -> Result<LoopExit> {
    let timing = manager.timing().clone();

    let mut heartbeat = tokio::time::interval(Duration::from_millis(timing.heartbeat_poll_ms));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            _ = manager.shutdown_notified() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(LoopExit::Shutdown);
            }

            _ = heartbeat.tick() => {
                let now = now_ms();

                // Silent socket: force a reconnect rather than waiting on TCP.
                if let Some(last) = manager.health().last_message_at() {
                    if now - last > timing.heartbeat_timeout_ms as i64 {
                        warn!(
                            symbol = %manager.symbol(),
                            timeframe = %manager.timeframe(),
                            silent_ms = now - last,
                            "no messages within heartbeat timeout, closing socket"
                        );
                        manager.health().record_heartbeat_timeout();
                        return Ok(LoopExit::Reconnect);
                    }
                }

                manager.check_staleness(now);

                // Drain a pending resync; fresh history wants a fresh socket.
                if manager.maybe_resync().await {
                    return Ok(LoopExit::Reconnect);
                }
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        manager.health().record_message(now_ms());
                        match parse_kline_message(&text) {
                            Ok(Some(bar)) => manager.handle_closed_bar(bar),
                            Ok(None) => {} // in-progress bar, ignored
                            Err(e) => {
                                manager.health().record_parse_error();
                                warn!(
                                    timeframe = %manager.timeframe(),
                                    error = %e,
                                    "failed to parse kline message"
                                );
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        manager.health().record_message(now_ms());
                        write
                            .send(Message::Pong(payload))
                            .await
                            .context("failed to send pong")?;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(
                            timeframe = %manager.timeframe(),
                            frame = ?frame,
                            "kline WebSocket closed by server"
                        );
                        return Ok(LoopExit::Reconnect);
                    }
                    Some(Ok(_)) => {
                        manager.health().record_message(now_ms());
                    }
                    Some(Err(e)) => {
                        return Err(e).context("kline WebSocket read error");
                    }
                    None => {
                        warn!(timeframe = %manager.timeframe(), "kline WebSocket stream ended");
                        return Ok(LoopExit::Reconnect);
                    }
                }
            }
        }
    }
}

/// Parse a Binance kline event; returns a `Bar` only for closed klines.
///
/// Expected shape:
/// ```json
/// { "e": "kline", "k": { "t": 1700000000000, "T": 1700000299999,
///   "o": "2200.1", "h": "2205.0", "l": "2199.0", "c": "2203.4",
///   "v": "153.2", "x": true } }
/// ```
fn parse_kline_message(text: &str) -> Result<Option<Bar>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse kline JSON")?;

    let k = root
        .get("k")
        .context("missing field k")?;

    let closed = k["x"].as_bool().context("missing field x")?;
    if !closed {
        return Ok(None);
    }

    let parse_price = |field: &str| -> Result<f64> {
        k[field]
            .as_str()
            .with_context(|| format!("missing field {field}"))?
            .parse::<f64>()
            .with_context(|| format!("failed to parse field {field}"))
    };

    Ok(Some(Bar {
        open_time: k["t"].as_i64().context("missing field t")?,
        close_time: k["T"].as_i64().context("missing field T")?,
        open: parse_price("o")?,
        high: parse_price("h")?,
        low: parse_price("l")?,
        close: parse_price("c")?,
        volume: parse_price("v")?,
    }))
}
