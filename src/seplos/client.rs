use super::decoder::FrameScanner;
use super::frame::{Frame, ResponseCode};
use super::interpack;
use super::request::{PendingRequest, Request, RequestCommon};
use crate::prelude::*;

use futures::StreamExt;
use net2::TcpStreamExt;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::FramedRead;

static METRICS: Lazy<HashMap<&'static str, Arc<Definition>>> = Lazy::new(|| {
    [
        ("request_duration_seconds_total", "s"),
        ("request_count_total", "-"),
        ("request_count_expired_total", "-"),
        ("request_errors_count_total", "-"),
        ("client_reset_count_total", "-"),
    ]
    .iter()
    .map(|(metric, unit)| {
        (
            *metric,
            Arc::new(Definition::new(
                format!("seplos_{metric}"),
                *unit,
                ValueKind::MonotonicIncreasing,
                "-",
                Route::None,
            )),
        )
    })
    .collect()
});

pub const INTERVAL: Duration = Duration::from_millis(500);

const ENQUEUE_INTERVAL: Duration = Duration::from_secs(1);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const RESET_DELAY: Duration = Duration::from_secs(1);
const TCP_KEEPALIVE_SECS: u64 = 60;

/// Request/response client for a Seplos-class BMS. A producer task enqueues
/// the request rotation on a fixed cadence; a writer owns the socket's write
/// half and works the queue strictly in order; a reader owns the read half
/// and routes decoded frames back to the writer's wait point.
pub struct Seplos {
    name: String,
    host: String,
    port: u16,
    address: u8,
    interval: Duration,
    registry: Arc<Registry>,
    connected: AtomicBool,
}

impl Seplos {
    pub fn new(registry: Arc<Registry>, config: &config::Seplos) -> Arc<Self> {
        Arc::new(Self {
            name: config.name.clone(),
            host: config.host.clone(),
            port: config.port,
            address: config.address(),
            interval: config.interval(),
            registry,
            connected: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Supervised client loop; the producer task outlives reconnects, the
    /// socket tasks are rebuilt after every failure.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        let (request_tx, mut request_rx) = mpsc::unbounded_channel();

        let producer = self.clone();
        tokio::spawn(async move { producer.enqueue_loop(request_tx).await });

        loop {
            if let Err(err) = self.process_loop(&mut request_rx).await {
                self.connected.store(false, Ordering::SeqCst);
                error!("{}: caught error: {err:#}, resetting connection", self.name);
                self.increment("client_reset_count_total", &[], 1.0);
                tokio::time::sleep(RESET_DELAY).await;
            }
        }
    }

    async fn enqueue_loop(self: Arc<Self>, request_tx: mpsc::UnboundedSender<PendingRequest>) {
        let mut ticker = tokio::time::interval(ENQUEUE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            for request in Request::all() {
                if let Err(err) = self.enqueue(&request_tx, request, self.interval) {
                    warn!("{}: failed to enqueue request: {err}", self.name);
                }
            }
        }
    }

    /// Queue one request with its expiry deadline. The queue is unbounded;
    /// backpressure is handled by discarding expired entries at dequeue time.
    fn enqueue(
        &self,
        request_tx: &mpsc::UnboundedSender<PendingRequest>,
        request: Request,
        timeout: Duration,
    ) -> Result<(), Error> {
        if timeout > self.interval {
            return Err(Error::InvalidArgument(format!(
                "timeout({}ms) must be lte interval({}ms)",
                timeout.as_millis(),
                self.interval.as_millis()
            )));
        }

        if !self.connected() {
            debug!(
                "{}: skip enqueueing of {:?}, not yet connected",
                self.name,
                request.label()
            );
            return Ok(());
        }

        request_tx
            .send(PendingRequest {
                request,
                enqueued_at: Instant::now(),
                timeout,
            })
            .map_err(|_| Error::Transport("request queue closed".into()))
    }

    async fn process_loop(
        self: &Arc<Self>,
        request_rx: &mut mpsc::UnboundedReceiver<PendingRequest>,
    ) -> Result<()> {
        let stream = tokio::time::timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| anyhow!("connect timeout after {CONNECT_TIMEOUT:?}"))??;

        let std_stream = stream.into_std()?;
        if let Err(err) = std_stream.set_keepalive(Some(Duration::new(TCP_KEEPALIVE_SECS, 0))) {
            warn!("{}: failed to set TCP keepalive: {err}", self.name);
        }
        let stream = TcpStream::from_std(std_stream)?;

        let (read_half, write_half) = stream.into_split();
        self.connected.store(true, Ordering::SeqCst);
        info!("{}: connected to {}:{}", self.name, self.host, self.port);

        let (response_tx, mut response_rx) = mpsc::channel(8);
        let reader = {
            let this = self.clone();
            tokio::spawn(async move { this.reader_loop(read_half, response_tx).await })
        };

        let result = self
            .writer_loop(request_rx, write_half, &mut response_rx)
            .await;
        reader.abort();
        result
    }

    /// Strictly serial consumer of the request queue. One request on the
    /// wire at a time; the matching response is whatever the reader forwards
    /// next.
    async fn writer_loop(
        self: &Arc<Self>,
        request_rx: &mut mpsc::UnboundedReceiver<PendingRequest>,
        mut writer: OwnedWriteHalf,
        response_rx: &mut mpsc::Receiver<Frame>,
    ) -> Result<()> {
        loop {
            let Some(pending) = request_rx.recv().await else {
                bail!("request queue closed");
            };

            let label = pending.request.label();
            let started_at = Instant::now();
            self.increment("request_count_total", &[("request", label)], 1.0);

            if pending.expired() {
                self.increment("request_count_expired_total", &[("request", label)], 1.0);
                continue;
            }

            let wire = pending.request.frame(self.address).wire()?;
            match tokio::time::timeout(WRITE_TIMEOUT, writer.write_all(&wire)).await {
                Ok(Ok(())) => writer.flush().await?,
                Ok(Err(err)) => bail!("failed to write {label}: {err}"),
                Err(_) => bail!("write timeout after {WRITE_TIMEOUT:?} for {label}"),
            }

            let response = match tokio::time::timeout(pending.timeout, response_rx.recv()).await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    self.count_request_error("read_error", label);
                    bail!("reader task ended while waiting for {label} response");
                }
                Err(_) => {
                    self.count_request_error("read_timeout", label);
                    bail!("timeout waiting for {label} response");
                }
            };

            self.increment(
                "request_duration_seconds_total",
                &[("request", label)],
                started_at.elapsed().as_secs_f64(),
            );

            if let Err(err) = pending
                .request
                .process(&self.name, &self.registry, &response.info)
            {
                error!("{}: failed to process {label} response: {err}", self.name);
            }
        }
    }

    /// Owns the read half: scans for frames, drops noise, dispatches on the
    /// RTN status byte. Normal responses go to the writer's wait point;
    /// inter-pack subframes are decoded inline; everything else is
    /// logged and dropped.
    async fn reader_loop(
        self: Arc<Self>,
        read_half: OwnedReadHalf,
        response_tx: mpsc::Sender<Frame>,
    ) {
        let mut framed = FramedRead::new(read_half, FrameScanner);

        while let Some(item) = framed.next().await {
            let body = match item {
                Ok(body) => body,
                Err(err) => {
                    warn!("{}: read failed: {err}", self.name);
                    break;
                }
            };

            let frame = match Frame::decode(&body) {
                Ok(frame) => frame,
                Err(err) => {
                    self.count_request_error("decode_error", "response");
                    warn!("{}: dropping undecodable frame: {err}", self.name);
                    continue;
                }
            };

            match frame.response_code() {
                Some(ResponseCode::Normal) => {
                    if response_tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Some(ResponseCode::InterPackSubframe) => {
                    if let Err(err) = interpack::process(&self.name, &self.registry, &frame.info) {
                        error!("{}: failed to process inter-pack frame: {err}", self.name);
                    }
                }
                Some(code) => {
                    self.count_request_error("status_rejected", "response");
                    warn!("{}: dropping response with status {code:?}", self.name);
                }
                None => {
                    self.count_request_error("status_unknown", "response");
                    warn!(
                        "{}: dropping response with unknown status {:#04x}",
                        self.name, frame.cid2
                    );
                }
            }
        }
    }

    fn counter(&self, key: &str, labels: &[(&str, &str)]) -> Metric {
        let definition = METRICS
            .get(key)
            .unwrap_or_else(|| panic!("unknown seplos counter {key:?}"))
            .clone();
        let mut metric = Metric::now(definition, 0.0).with_label("bms", &self.name);
        for (label, value) in labels {
            metric = metric.with_label(*label, *value);
        }
        metric
    }

    fn increment(&self, key: &str, labels: &[(&str, &str)], delta: f64) {
        if let Err(err) = self.registry.increment(self.counter(key, labels), delta) {
            warn!("{}: failed to increment {key}: {err}", self.name);
        }
    }

    fn count_request_error(&self, kind: &str, request: &str) {
        self.increment(
            "request_errors_count_total",
            &[("error", kind), ("request", request)],
            1.0,
        );
    }
}
