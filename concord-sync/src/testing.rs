//! Hand-driven query backend for unit tests.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::protocol::{QueryBackend, QueryError, QueryRequest, ResponseSink};

/// Records every request and keeps its sink so a test can push responses.
#[derive(Default)]
pub(crate) struct ScriptedBackend {
    requests: Mutex<Vec<QueryRequest>>,
    sinks: Mutex<Vec<ResponseSink>>,
    cancelled: Mutex<Vec<String>>,
    fail_cancel: bool,
}

impl ScriptedBackend {
    pub(crate) fn failing_cancel() -> Self {
        Self {
            fail_cancel: true,
            ..Self::default()
        }
    }

    pub(crate) fn requests(&self) -> Vec<QueryRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }

    pub(crate) fn last_sink(&self) -> ResponseSink {
        self.sinks.lock().unwrap().last().cloned().unwrap()
    }

    pub(crate) fn sink(&self, index: usize) -> ResponseSink {
        self.sinks.lock().unwrap()[index].clone()
    }

    pub(crate) fn drop_sinks(&self) {
        self.sinks.lock().unwrap().clear();
    }

    /// Wait until a new query arrives and return its sink.
    pub(crate) async fn next_sink(&self) -> ResponseSink {
        let seen = self.sinks.lock().unwrap().len();
        for _ in 0..1000 {
            if let Some(sink) = self.sinks.lock().unwrap().get(seen) {
                return sink.clone();
            }
            tokio::task::yield_now().await;
        }
        panic!("no query issued");
    }
}

#[async_trait]
impl QueryBackend for ScriptedBackend {
    fn query(&self, request: QueryRequest, sink: ResponseSink) {
        self.requests.lock().unwrap().push(request);
        self.sinks.lock().unwrap().push(sink);
    }

    async fn query_cancel(&self, id: &str) -> Result<(), QueryError> {
        self.cancelled.lock().unwrap().push(id.to_string());
        if self.fail_cancel {
            Err(QueryError::UnknownQuery(id.to_string()))
        } else {
            Ok(())
        }
    }
}
