//! Request processing pipeline.
//!
//! One call to [`RequestProcessor::on_message`] handles one queue message:
//!
//! 1. Decode the transport headers; drop the message if they are unusable
//! 2. Drop the message if its `expireTs` has passed
//! 3. Decode the envelope; drop it if no request kind is recognised
//! 4. Run the compile, invoke or release path against the [`ScriptCache`]
//! 5. Encode the response and hand it to the [`ResponseSink`]
//!
//! Failures inside step 4 become error responses. Dropped messages get no
//! response at all, which the requester observes as a timeout.

use jsexec_common::{
    Codec, CompileRequest, CompileResponse, ErrorCode, Headers, InvokeRequest, InvokeResponse,
    ReleaseResponse, RemoteRequest, RemoteResponse, ResponseBody, ScriptId, TransportHeaders,
};
use jsexec_metrics::{FailureKind, Operation, Outcome, ProcessorStats};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use sysinfo::System;

use crate::cache::ScriptCache;
use crate::error::{AdapterError, EngineError};
use crate::runtime::Engine;

/// Where encoded responses go.
///
/// Implemented by the queue adapter; the processor treats a failed send as
/// final and only logs it.
pub trait ResponseSink: Send + Sync + 'static {
    fn send(
        &self,
        topic: &str,
        key: &str,
        payload: Vec<u8>,
        headers: Headers,
    ) -> impl Future<Output = Result<(), AdapterError>> + Send;
}

/// Tunables for the processing pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorConfig {
    /// Longest invoke result, in characters, returned to the caller.
    pub max_result_size: usize,
    /// Requests slower than this are logged at warn.
    pub slow_query_threshold: Duration,
    /// Include the raw request in slow-request warnings.
    pub slow_query_log_body: bool,
    /// Emit a stats line every this many invocations (0 = never).
    pub stat_print_frequency: u64,
    /// Log process memory every this many invocations (0 = never).
    pub memory_usage_trace_frequency: u64,
    /// Log the invoked script body every this many invocations (0 = never).
    pub script_body_trace_frequency: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_result_size: 300_000,
            slow_query_threshold: Duration::from_millis(5000),
            slow_query_log_body: false,
            stat_print_frequency: 10_000,
            memory_usage_trace_frequency: 0,
            script_body_trace_frequency: 0,
        }
    }
}

/// What became of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// A response was produced and handed to the sink.
    Responded,
    /// The requester's deadline had already passed.
    Expired,
    /// Undecodable; no response.
    Dropped,
    /// Processed, but the sink refused the response. The message must stay
    /// unacknowledged so the broker redelivers it.
    Unsent,
}

pub struct RequestProcessor<E: Engine, S: ResponseSink> {
    cache: Arc<ScriptCache<E>>,
    sink: S,
    stats: ProcessorStats,
    config: ProcessorConfig,
    codec: Codec,
    system: Mutex<System>,
}

impl<E: Engine, S: ResponseSink> RequestProcessor<E, S> {
    pub fn new(
        cache: Arc<ScriptCache<E>>,
        sink: S,
        stats: ProcessorStats,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            cache,
            sink,
            stats,
            config,
            codec: Codec::default(),
            system: Mutex::new(System::new()),
        }
    }

    pub fn cache(&self) -> &Arc<ScriptCache<E>> {
        &self.cache
    }

    pub fn stats(&self) -> &ProcessorStats {
        &self.stats
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Processes one raw queue message.
    pub async fn on_message(&self, payload: &[u8], headers: &Headers) -> Disposition {
        let start = Instant::now();

        let transport = match TransportHeaders::parse(headers) {
            Ok(transport) => transport,
            Err(e) => {
                tracing::warn!("Dropping message with unusable headers: {}", e);
                self.stats.record_dropped();
                return Disposition::Dropped;
            }
        };

        if transport.is_expired(now_ms()) {
            tracing::debug!(
                request_id = %transport.request_id,
                expire_ts = ?transport.expire_ts,
                "Skipping expired request"
            );
            self.stats.record_expired();
            return Disposition::Expired;
        }

        let request = match self.codec.decode_request(payload) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(request_id = %transport.request_id, "Dropping unrecognised request: {}", e);
                self.stats.record_dropped();
                return Disposition::Dropped;
            }
        };

        let script_id = match request.script_id() {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(request_id = %transport.request_id, "Dropping request: {}", e);
                self.stats.record_dropped();
                return Disposition::Dropped;
            }
        };

        tracing::debug!(
            request_id = %transport.request_id,
            script_id = %script_id,
            kind = request.kind(),
            "Processing request"
        );

        let (operation, body) = match &request {
            RemoteRequest::CompileRequest(r) => (Operation::Compile, self.compile(script_id, r).await),
            RemoteRequest::InvokeRequest(r) => (Operation::Invoke, self.invoke(script_id, r).await),
            RemoteRequest::ReleaseRequest(_) => (Operation::Release, self.release(script_id)),
        };
        self.stats.record_request(operation, start, outcome(&body));

        let response = RemoteResponse::new(&transport.request_id, body);
        let disposition = match self.codec.encode_response(&response) {
            Ok(bytes) => {
                let key = script_id.to_canonical_string();
                match self
                    .sink
                    .send(&transport.response_topic, &key, bytes, headers.clone())
                    .await
                {
                    Ok(()) => Disposition::Responded,
                    Err(e) => {
                        tracing::error!(
                            request_id = %transport.request_id,
                            topic = %transport.response_topic,
                            "Failed to send response: {}",
                            e
                        );
                        Disposition::Unsent
                    }
                }
            }
            Err(e) => {
                // Redelivery would fail the same way
                tracing::error!(request_id = %transport.request_id, "Failed to encode response: {}", e);
                Disposition::Responded
            }
        };

        self.log_if_slow(start, &request, script_id, payload);
        disposition
    }

    async fn compile(&self, id: ScriptId, request: &CompileRequest) -> ResponseBody {
        if self.cache.contains(&id) {
            return ResponseBody::Compile(CompileResponse::success(&id));
        }

        match self.cache.resolve(id, Some(&request.script_body)).await {
            Ok(resolved) => {
                if let Some(elapsed) = resolved.compile_time {
                    self.stats.record_compile_time(elapsed);
                }
                ResponseBody::Compile(CompileResponse::success(&id))
            }
            Err(e) => {
                tracing::debug!(script_id = %id, "Compilation failed: {}", e);
                ResponseBody::Compile(CompileResponse::failure(&id, ErrorCode::Compilation, e.to_string()))
            }
        }
    }

    async fn invoke(&self, id: ScriptId, request: &InvokeRequest) -> ResponseBody {
        let invocation = self.stats.record_invocation();
        self.trace_periodic(invocation, id, request);

        let resolved = match self.cache.resolve(id, request.body()).await {
            Ok(resolved) => resolved,
            Err(e) => {
                return ResponseBody::Invoke(InvokeResponse::failure(e.error_code(), e.to_string()));
            }
        };
        if let Some(elapsed) = resolved.compile_time {
            self.stats.record_compile_time(elapsed);
        }

        let result = self
            .cache
            .engine()
            .execute(&resolved.script, &request.args, request.timeout())
            .await
            .and_then(|result| self.check_result_size(result));

        match result {
            Ok(result) => ResponseBody::Invoke(InvokeResponse::success(result)),
            Err(e) => {
                tracing::debug!(script_id = %id, "Invocation failed: {}", e);
                ResponseBody::Invoke(InvokeResponse::failure(e.error_code(), e.to_string()))
            }
        }
    }

    fn release(&self, id: ScriptId) -> ResponseBody {
        let removed = self.cache.release(&id);
        tracing::debug!(script_id = %id, removed, "Released script");
        ResponseBody::Release(ReleaseResponse::success(&id))
    }

    fn check_result_size(&self, result: String) -> Result<String, EngineError> {
        let max = self.config.max_result_size;
        // Cheap byte-length check first; chars <= bytes
        if result.len() <= max {
            return Ok(result);
        }
        let len = result.chars().count();
        if len > max {
            return Err(EngineError::ResultTooLarge { len, max });
        }
        Ok(result)
    }

    fn trace_periodic(&self, invocation: u64, id: ScriptId, request: &InvokeRequest) {
        if due(invocation, self.config.stat_print_frequency) {
            let snapshot = self.stats.snapshot();
            tracing::info!(
                invocations = invocation,
                requests = snapshot.total_requests,
                compilations = snapshot.compilations,
                avg_compile_time_us = snapshot.avg_compile_time_us,
                invoke_failures = snapshot.invoke.failure_count,
                expired = snapshot.expired,
                cached_scripts = self.cache.len(),
                "Processor stats"
            );
        }

        if due(invocation, self.config.memory_usage_trace_frequency) {
            if let Some(rss) = self.resident_memory() {
                tracing::debug!(invocations = invocation, rss_bytes = rss, "Memory usage");
            }
        }

        if due(invocation, self.config.script_body_trace_frequency) {
            match request.body() {
                Some(body) => tracing::debug!(script_id = %id, "Script body: {}", body),
                None => tracing::debug!(script_id = %id, "Script body not supplied"),
            }
        }
    }

    fn resident_memory(&self) -> Option<u64> {
        let pid = sysinfo::get_current_pid().ok()?;
        let mut system = self.system.lock();
        system.refresh_process(pid);
        system.process(pid).map(|process| process.memory())
    }

    fn log_if_slow(&self, start: Instant, request: &RemoteRequest, id: ScriptId, payload: &[u8]) {
        let elapsed = start.elapsed();
        if elapsed <= self.config.slow_query_threshold {
            return;
        }

        if self.config.slow_query_log_body {
            tracing::warn!(
                script_id = %id,
                kind = request.kind(),
                elapsed_ms = elapsed.as_millis() as u64,
                body = %String::from_utf8_lossy(payload),
                "Slow request"
            );
        } else {
            tracing::warn!(
                script_id = %id,
                kind = request.kind(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Slow request"
            );
        }
    }
}

fn due(count: u64, frequency: u64) -> bool {
    frequency > 0 && count % frequency == 0
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn outcome(body: &ResponseBody) -> Outcome {
    match body.error_code() {
        None => Outcome::Success,
        Some(code) => Outcome::Failure(match code {
            ErrorCode::Compilation => FailureKind::Compilation,
            ErrorCode::Runtime => FailureKind::Runtime,
            ErrorCode::Timeout => FailureKind::Timeout,
            ErrorCode::NotFound => FailureKind::NotFound,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeEngine;
    use jsexec_common::{ReleaseRequest, RequestId};

    #[derive(Debug, Clone)]
    struct Sent {
        topic: String,
        key: String,
        response: RemoteResponse,
        headers: Headers,
    }

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<Sent>>,
        fail: bool,
    }

    impl ResponseSink for RecordingSink {
        async fn send(
            &self,
            topic: &str,
            key: &str,
            payload: Vec<u8>,
            headers: Headers,
        ) -> Result<(), AdapterError> {
            if self.fail {
                return Err(AdapterError::Send("broker unavailable".into()));
            }
            self.sent.lock().push(Sent {
                topic: topic.to_string(),
                key: key.to_string(),
                response: Codec::default().decode_response(&payload).unwrap(),
                headers,
            });
            Ok(())
        }
    }

    type Processor = RequestProcessor<FakeEngine, RecordingSink>;

    fn processor_with(config: ProcessorConfig, sink: RecordingSink) -> Processor {
        let cache = Arc::new(ScriptCache::new(Arc::new(FakeEngine::default()), 16));
        RequestProcessor::new(cache, sink, ProcessorStats::new(), config)
    }

    fn processor() -> Processor {
        processor_with(ProcessorConfig::default(), RecordingSink::default())
    }

    fn headers(request_id: RequestId) -> Headers {
        TransportHeaders::new(request_id, "js_eval.responses").to_headers()
    }

    fn encode(request: RemoteRequest) -> Vec<u8> {
        Codec::default().encode_request(&request).unwrap()
    }

    async fn send(processor: &Processor, request: RemoteRequest) -> (Disposition, Option<Sent>) {
        let before = processor.sink().sent.lock().len();
        let disposition = processor.on_message(&encode(request), &headers(RequestId::random())).await;
        let sent = processor.sink().sent.lock();
        let last = if sent.len() > before { sent.last().cloned() } else { None };
        (disposition, last)
    }

    fn invoke_body(sent: &Sent) -> InvokeResponse {
        match sent.response.body() {
            Some(ResponseBody::Invoke(r)) => r,
            other => panic!("expected invoke response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn compile_then_invoke() {
        let processor = processor();
        let id = ScriptId::random();

        let (disposition, sent) =
            send(&processor, RemoteRequest::CompileRequest(CompileRequest::new(id, "echo"))).await;
        assert_eq!(disposition, Disposition::Responded);
        let sent = sent.unwrap();
        assert!(sent.response.body().unwrap().is_success());
        assert_eq!(sent.topic, "js_eval.responses");
        assert_eq!(sent.key, id.to_canonical_string());

        let request = InvokeRequest::new(id, vec!["a".into(), "b".into()]);
        let (_, sent) = send(&processor, RemoteRequest::InvokeRequest(request)).await;
        let response = invoke_body(&sent.unwrap());
        assert!(response.success);
        assert_eq!(response.result.as_deref(), Some("a,b"));
        assert_eq!(processor.cache().engine().compiles(), 1);
    }

    #[tokio::test]
    async fn compile_of_cached_script_short_circuits() {
        let processor = processor();
        let id = ScriptId::random();

        for _ in 0..3 {
            let (_, sent) =
                send(&processor, RemoteRequest::CompileRequest(CompileRequest::new(id, "echo"))).await;
            assert!(sent.unwrap().response.body().unwrap().is_success());
        }
        assert_eq!(processor.cache().engine().compiles(), 1);
        assert_eq!(processor.cache().invocation_count(&id), Some(0));
    }

    #[tokio::test]
    async fn compile_failure_is_reported() {
        let processor = processor();
        let id = ScriptId::random();

        let (_, sent) = send(
            &processor,
            RemoteRequest::CompileRequest(CompileRequest::new(id, "syntax error")),
        )
        .await;
        let body = sent.unwrap().response.body().unwrap();
        assert!(!body.is_success());
        assert_eq!(body.error_code(), Some(ErrorCode::Compilation));
        assert!(!processor.cache().contains(&id));
    }

    #[tokio::test]
    async fn invoke_without_body_is_not_found() {
        let processor = processor();
        let request = InvokeRequest::new(ScriptId::random(), vec![]);

        let (_, sent) = send(&processor, RemoteRequest::InvokeRequest(request)).await;
        let response = invoke_body(&sent.unwrap());
        assert!(!response.success);
        assert_eq!(response.error_code, Some(ErrorCode::NotFound));
        assert_eq!(processor.cache().engine().compiles(), 0);
    }

    #[tokio::test]
    async fn invoke_with_bad_inline_body_is_compilation_error() {
        let processor = processor();
        let request = InvokeRequest::new(ScriptId::random(), vec![]).with_body("syntax error");

        let (_, sent) = send(&processor, RemoteRequest::InvokeRequest(request)).await;
        assert_eq!(invoke_body(&sent.unwrap()).error_code, Some(ErrorCode::Compilation));
    }

    #[tokio::test]
    async fn engine_failures_keep_their_codes() {
        let processor = processor();

        let request = InvokeRequest::new(ScriptId::random(), vec![]).with_body("fail");
        let (_, sent) = send(&processor, RemoteRequest::InvokeRequest(request)).await;
        let response = invoke_body(&sent.unwrap());
        assert_eq!(response.error_code, Some(ErrorCode::Runtime));
        assert!(response.error_details.unwrap().contains("boom"));

        let request = InvokeRequest::new(ScriptId::random(), vec![])
            .with_body("hang")
            .with_timeout(100);
        let (_, sent) = send(&processor, RemoteRequest::InvokeRequest(request)).await;
        assert_eq!(invoke_body(&sent.unwrap()).error_code, Some(ErrorCode::Timeout));
    }

    #[tokio::test]
    async fn result_size_is_capped() {
        let config = ProcessorConfig {
            max_result_size: 10,
            ..Default::default()
        };
        let processor = processor_with(config, RecordingSink::default());

        let request = InvokeRequest::new(ScriptId::random(), vec![]).with_body("repeat:10");
        let (_, sent) = send(&processor, RemoteRequest::InvokeRequest(request)).await;
        let response = invoke_body(&sent.unwrap());
        assert!(response.success);
        assert_eq!(response.result.unwrap().len(), 10);

        let request = InvokeRequest::new(ScriptId::random(), vec![]).with_body("repeat:11");
        let (_, sent) = send(&processor, RemoteRequest::InvokeRequest(request)).await;
        let response = invoke_body(&sent.unwrap());
        assert!(!response.success);
        assert_eq!(response.error_code, Some(ErrorCode::Runtime));
        assert!(response.error_details.unwrap().contains("exceeds maximum allowed size"));
    }

    #[tokio::test]
    async fn result_size_counts_characters() {
        let config = ProcessorConfig {
            max_result_size: 3,
            ..Default::default()
        };
        let processor = processor_with(config, RecordingSink::default());

        // Three characters, nine bytes
        let request = InvokeRequest::new(ScriptId::random(), vec!["日本語".into()]).with_body("echo");
        let (_, sent) = send(&processor, RemoteRequest::InvokeRequest(request)).await;
        assert!(invoke_body(&sent.unwrap()).success);
    }

    #[tokio::test]
    async fn release_always_succeeds() {
        let processor = processor();
        let id = ScriptId::random();

        send(&processor, RemoteRequest::CompileRequest(CompileRequest::new(id, "echo"))).await;
        for _ in 0..2 {
            let (_, sent) =
                send(&processor, RemoteRequest::ReleaseRequest(ReleaseRequest::new(id))).await;
            assert!(sent.unwrap().response.body().unwrap().is_success());
        }
        assert!(!processor.cache().contains(&id));
    }

    #[tokio::test]
    async fn expired_messages_are_dropped_untouched() {
        let processor = processor();
        let id = ScriptId::random();
        let payload = encode(RemoteRequest::CompileRequest(CompileRequest::new(id, "echo")));
        let headers = TransportHeaders::new(RequestId::random(), "js_eval.responses")
            .with_expire_ts(now_ms() - 1000)
            .to_headers();

        let disposition = processor.on_message(&payload, &headers).await;

        assert_eq!(disposition, Disposition::Expired);
        assert!(processor.sink().sent.lock().is_empty());
        assert_eq!(processor.cache().engine().compiles(), 0);
        assert_eq!(processor.cache().engine().executions(), 0);
        assert!(processor.cache().is_empty());
        assert_eq!(processor.stats().snapshot().expired, 1);
    }

    #[tokio::test]
    async fn future_deadline_is_processed() {
        let processor = processor();
        let payload = encode(RemoteRequest::CompileRequest(CompileRequest::new(
            ScriptId::random(),
            "echo",
        )));
        let headers = TransportHeaders::new(RequestId::random(), "js_eval.responses")
            .with_expire_ts(now_ms() + 60_000)
            .to_headers();

        assert_eq!(processor.on_message(&payload, &headers).await, Disposition::Responded);
    }

    #[tokio::test]
    async fn undecodable_messages_are_dropped() {
        let processor = processor();
        let request_headers = headers(RequestId::random());

        let unknown = br#"{"evalRequest":{"scriptIdMSB":"1","scriptIdLSB":"2"}}"#;
        assert_eq!(processor.on_message(unknown, &request_headers).await, Disposition::Dropped);

        let bad_id = br#"{"releaseRequest":{"scriptIdMSB":"-1","scriptIdLSB":"2"}}"#;
        assert_eq!(processor.on_message(bad_id, &request_headers).await, Disposition::Dropped);

        let payload = encode(RemoteRequest::ReleaseRequest(ReleaseRequest::new(ScriptId::random())));
        assert_eq!(processor.on_message(&payload, &Headers::new()).await, Disposition::Dropped);

        assert!(processor.sink().sent.lock().is_empty());
        assert_eq!(processor.stats().snapshot().dropped, 3);
    }

    #[tokio::test]
    async fn response_echoes_request_id_and_headers() {
        let processor = processor();
        let request_id = RequestId::random();
        let request_headers = headers(request_id);
        let payload = encode(RemoteRequest::ReleaseRequest(ReleaseRequest::new(ScriptId::random())));

        processor.on_message(&payload, &request_headers).await;

        let sent = processor.sink().sent.lock()[0].clone();
        assert_eq!(sent.headers, request_headers);
        assert_eq!(sent.response.request_id().unwrap(), request_id);
    }

    #[tokio::test]
    async fn send_failure_is_reported_as_unsent() {
        let sink = RecordingSink {
            fail: true,
            ..Default::default()
        };
        let processor = processor_with(ProcessorConfig::default(), sink);
        let payload = encode(RemoteRequest::CompileRequest(CompileRequest::new(
            ScriptId::random(),
            "echo",
        )));

        let disposition = processor.on_message(&payload, &headers(RequestId::random())).await;
        assert_eq!(disposition, Disposition::Unsent);
        // The compile itself still happened
        assert_eq!(processor.cache().len(), 1);
    }

    #[tokio::test]
    async fn stats_follow_outcomes() {
        let processor = processor();
        let id = ScriptId::random();

        send(&processor, RemoteRequest::CompileRequest(CompileRequest::new(id, "echo"))).await;
        send(&processor, RemoteRequest::InvokeRequest(InvokeRequest::new(id, vec![]))).await;
        send(
            &processor,
            RemoteRequest::InvokeRequest(InvokeRequest::new(ScriptId::random(), vec![])),
        )
        .await;

        let snapshot = processor.stats().snapshot();
        assert_eq!(snapshot.compile.success_count, 1);
        assert_eq!(snapshot.invoke.count, 2);
        assert_eq!(snapshot.invoke.failures.not_found, 1);
        assert_eq!(snapshot.compilations, 1);
    }

    #[test]
    fn due_ignores_zero_frequency() {
        assert!(!due(10, 0));
        assert!(due(10, 5));
        assert!(!due(11, 5));
    }
}
