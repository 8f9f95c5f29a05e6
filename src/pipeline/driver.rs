use crate::data::cache::DedupStore;
use crate::data::stream::{StreamError, TipSource};
use crate::data::types::{CanonicalRecord, RawTip};
use crate::execution::forwarder::{ForwardError, RecordSink};
use crate::monitoring::logger::CsvLogger;
use crate::pipeline::backoff::Backoff;
use crate::pipeline::normalizer::normalize;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub tips_received: u64,
    pub forwarded: u64,
    pub duplicates: u64,
    pub malformed_tips: u64,
    pub skipped_frames: u64,
    pub forward_failures: u64,
    pub reconnects: u64,
}

/// Stream -> normalize -> dedup -> forward, forever.
pub struct Pipeline<S, K> {
    source: S,
    sink: K,
    store: DedupStore,
    backoff: Backoff,
    audit: Option<CsvLogger>,
    purge_every: u64,
    echo: bool,
    stats: PipelineStats,
}

impl<S: TipSource, K: RecordSink> Pipeline<S, K> {
    pub fn new(source: S, sink: K, store: DedupStore, backoff: Backoff) -> Self {
        Self {
            source,
            sink,
            store,
            backoff,
            audit: None,
            purge_every: 1_000,
            echo: false,
            stats: PipelineStats::default(),
        }
    }

    pub fn with_audit_log(mut self, audit: CsvLogger) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_purge_every(mut self, purge_every: u64) -> Self {
        self.purge_every = purge_every.max(1);
        self
    }

    /// Print each forwarded record to stdout.
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    #[cfg(test)]
    pub fn store(&self) -> &DedupStore {
        &self.store
    }

    /// Runs until the process is terminated.
    pub async fn run(&mut self) {
        loop {
            let err = self.run_session().await;
            self.stats.reconnects += 1;

            error!(
                "Exception occurred while streaming tips from the server, cause: {}",
                err
            );
            info!("Pipeline stats: {:?}", self.stats);

            let delay = self.backoff.next_delay();
            warn!(
                "Reconnecting in {:?} (attempt {})",
                delay,
                self.backoff.attempts()
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// One connection's worth of work. Only returns on a connection-level
    /// error.
    async fn run_session(&mut self) -> StreamError {
        let mut reader = match self.source.open().await {
            Ok(reader) => reader,
            Err(e) => return e,
        };
        info!("Connected to tip stream");

        loop {
            let result = reader.next_tip().await;

            // A session that produced frames counts as healthy.
            if reader.frames() > 0 && self.backoff.attempts() > 0 {
                self.backoff.reset();
            }

            match result {
                Ok(tip) => self.handle_tip(tip).await,
                Err(e) if e.is_connection_level() => return e,
                Err(e @ StreamError::MalformedTip(_)) => {
                    self.stats.malformed_tips += 1;
                    warn!("Skipping tip: {}", e);
                }
                Err(e) => {
                    self.stats.skipped_frames += 1;
                    warn!("Skipping frame: {}", e);
                }
            }
        }
    }

    async fn handle_tip(&mut self, tip: RawTip) {
        self.stats.tips_received += 1;
        if self.stats.tips_received % self.purge_every == 0 {
            let purged = self.store.purge_expired();
            if purged > 0 {
                info!("Purged {} expired tip identities", purged);
            }
        }

        match normalize(tip, &self.store) {
            Some(record) => self.forward(record).await,
            None => self.stats.duplicates += 1,
        }
    }

    async fn forward(&mut self, record: CanonicalRecord) {
        if self.echo {
            match serde_json::to_string(&record) {
                Ok(json) => println!("{}", json),
                Err(e) => warn!("Failed to render record: {}", e),
            }
        }

        let status = match self.sink.forward(&record).await {
            Ok(status) => {
                self.stats.forwarded += 1;
                info!("Sent to API: {}", status);
                status.to_string()
            }
            Err(e) => {
                self.stats.forward_failures += 1;
                error!("Error sending to API: {}", e);
                match e {
                    ForwardError::Rejected(code) => format!("rejected:{}", code),
                    _ => "error".to_string(),
                }
            }
        };

        if let Some(audit) = &self.audit {
            if let Err(e) = audit.log_record(&record, &status) {
                warn!("Failed to write audit log: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::stream::{ByteStream, TipReader};
    use async_trait::async_trait;
    use futures::{stream, StreamExt};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    const FRAME: &str = r#"data: [{"id":1,"league_id":10,"market":"Total","outcome":"AwayOver","period":0,"point":2.5,"alerted":1.905,"nvp":1.91,"home":"A","away":"B"}]"#;
    const OTHER: &str = r#"data: [{"id":2,"league_id":10,"market":"TeamTotal","outcome":"HomeUnder","period":1,"point":1.5,"alerted":2.1,"nvp":2.05,"home":"C","away":"D"}]"#;

    enum Session {
        Refused,
        Body(Vec<Result<Vec<u8>, StreamError>>),
        Stall(Vec<Result<Vec<u8>, StreamError>>),
        Raw(ByteStream),
    }

    /// Hands out scripted sessions, then stalls forever.
    struct ScriptedSource {
        sessions: Mutex<VecDeque<Session>>,
        opens: Arc<Mutex<u32>>,
    }

    impl ScriptedSource {
        fn new(sessions: Vec<Session>) -> (Self, Arc<Mutex<u32>>) {
            let opens = Arc::new(Mutex::new(0));
            let source = Self {
                sessions: Mutex::new(sessions.into()),
                opens: opens.clone(),
            };
            (source, opens)
        }
    }

    fn chunk(text: &str) -> Result<Vec<u8>, StreamError> {
        Ok(format!("{}\n", text).into_bytes())
    }

    fn reset() -> Result<Vec<u8>, StreamError> {
        Err(StreamError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        )))
    }

    #[async_trait]
    impl TipSource for ScriptedSource {
        async fn open(&self) -> Result<TipReader, StreamError> {
            *self.opens.lock().unwrap() += 1;
            let next = self.sessions.lock().unwrap().pop_front();

            let body: ByteStream = match next {
                Some(Session::Refused) => {
                    return Err(StreamError::Io(std::io::Error::new(
                        std::io::ErrorKind::ConnectionRefused,
                        "connection refused",
                    )))
                }
                Some(Session::Body(chunks)) => stream::iter(chunks).boxed(),
                Some(Session::Stall(chunks)) => stream::iter(chunks).chain(stream::pending()).boxed(),
                Some(Session::Raw(body)) => body,
                None => stream::pending().boxed(),
            };
            Ok(TipReader::new(body))
        }
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        records: Arc<Mutex<Vec<CanonicalRecord>>>,
        reject: bool,
    }

    #[async_trait]
    impl RecordSink for RecordingSink {
        async fn forward(&self, record: &CanonicalRecord) -> Result<u16, ForwardError> {
            self.records.lock().unwrap().push(record.clone());
            if self.reject {
                Err(ForwardError::Rejected(500))
            } else {
                Ok(200)
            }
        }
    }

    fn pipeline(sessions: Vec<Session>, sink: RecordingSink) -> (Pipeline<ScriptedSource, RecordingSink>, Arc<Mutex<u32>>) {
        let (source, opens) = ScriptedSource::new(sessions);
        let backoff = Backoff::new(Duration::ZERO, Duration::ZERO);
        (Pipeline::new(source, sink, DedupStore::new(), backoff), opens)
    }

    async fn run_for(pipeline: &mut Pipeline<ScriptedSource, RecordingSink>, limit: Duration) {
        let res = tokio::time::timeout(limit, pipeline.run()).await;
        assert!(res.is_err(), "pipeline should never return");
    }

    async fn run_briefly(pipeline: &mut Pipeline<ScriptedSource, RecordingSink>) {
        run_for(pipeline, Duration::from_millis(200)).await;
    }

    fn after(delay: Duration, text: &'static str) -> ByteStream {
        stream::once(async move {
            tokio::time::sleep(delay).await;
            chunk(text)
        })
        .boxed()
    }

    #[tokio::test]
    async fn test_end_to_end_frame_forwarded_once() {
        let sink = RecordingSink::default();
        let (mut pipeline, _) = pipeline(
            vec![Session::Stall(vec![chunk(FRAME), chunk(FRAME)])],
            sink.clone(),
        );

        run_briefly(&mut pipeline).await;

        let records = sink.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(
            serde_json::to_value(&records[0]).unwrap(),
            serde_json::json!({
                "home": "A",
                "away": "B",
                "points": 2.5,
                "is_first_half": false,
                "team": "away",
                "market_type": "total",
                "odds": 1.91,
                "outcome": "over"
            })
        );
        assert_eq!(pipeline.stats().duplicates, 1);
    }

    #[tokio::test]
    async fn test_reconnects_after_transport_error() {
        let sink = RecordingSink::default();
        let (mut pipeline, opens) = pipeline(
            vec![
                Session::Body(vec![chunk(FRAME), reset()]),
                Session::Refused,
                Session::Stall(vec![chunk(FRAME), chunk(OTHER)]),
            ],
            sink.clone(),
        );

        run_briefly(&mut pipeline).await;

        assert_eq!(*opens.lock().unwrap(), 3);
        assert_eq!(pipeline.stats().reconnects, 2);

        // The replayed FRAME after reconnecting is still a duplicate.
        let records = sink.records.lock().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].market_type, "team_totals");
        assert_eq!(pipeline.stats().duplicates, 1);
    }

    #[tokio::test]
    async fn test_end_of_stream_triggers_reconnect() {
        let sink = RecordingSink::default();
        let (mut pipeline, opens) = pipeline(
            vec![Session::Body(vec![chunk(FRAME)]), Session::Stall(vec![chunk(OTHER)])],
            sink.clone(),
        );

        run_briefly(&mut pipeline).await;

        assert_eq!(*opens.lock().unwrap(), 2);
        assert_eq!(sink.records.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_bad_frame_does_not_reconnect() {
        let sink = RecordingSink::default();
        let (mut pipeline, opens) = pipeline(
            vec![Session::Stall(vec![chunk("data: [oops"), chunk(FRAME)])],
            sink.clone(),
        );

        run_briefly(&mut pipeline).await;

        assert_eq!(*opens.lock().unwrap(), 1);
        assert_eq!(pipeline.stats().skipped_frames, 1);
        assert_eq!(pipeline.stats().reconnects, 0);
        assert_eq!(sink.records.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_forward_failure_keeps_streaming() {
        let sink = RecordingSink {
            reject: true,
            ..Default::default()
        };
        let (mut pipeline, opens) = pipeline(
            vec![Session::Stall(vec![chunk(FRAME), chunk(OTHER)])],
            sink.clone(),
        );

        run_briefly(&mut pipeline).await;

        assert_eq!(*opens.lock().unwrap(), 1);
        assert_eq!(sink.records.lock().unwrap().len(), 2);
        assert_eq!(pipeline.stats().forward_failures, 2);
        assert_eq!(pipeline.stats().forwarded, 0);
        // A failed forward still consumes the identity.
        assert_eq!(pipeline.store().len(), 2);
    }

    #[tokio::test]
    async fn test_expired_identities_purged_and_reforwarded() {
        let gap = Duration::from_millis(150);
        let body = stream::iter(vec![chunk(FRAME)])
            .chain(after(gap, FRAME))
            .chain(after(gap, OTHER))
            .chain(stream::pending())
            .boxed();
        let (source, _) = ScriptedSource::new(vec![Session::Raw(body)]);
        let sink = RecordingSink::default();
        let store = DedupStore::with_window(Duration::from_millis(50));

        // Zero is clamped to purging on every tip.
        let mut pipeline = Pipeline::new(source, sink.clone(), store, Backoff::new(Duration::ZERO, Duration::ZERO))
            .with_purge_every(0);

        run_for(&mut pipeline, Duration::from_millis(600)).await;

        let records = sink.records.lock().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0], records[1]);
        assert_eq!(pipeline.stats().duplicates, 0);
        // The replayed FRAME identity expired and was purged before OTHER arrived.
        assert_eq!(pipeline.store().len(), 1);
    }
}
