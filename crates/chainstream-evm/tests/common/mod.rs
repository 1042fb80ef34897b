//! Scripted `EvmRpcClient` and fixtures shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use chainstream_core::filter::keccak256_hex;
use chainstream_core::{
    BlockHashEvent, Checkpoint, ListenerAddRequest, ListenerEvent, ListenerOptions, LogQuery,
    RawLog, RetryConfig, StreamConfig,
};
use chainstream_evm::{
    EvmRpcClient, FilterId, JsonRpcError, PollerState, StreamManager, StreamOutputs,
    TransportError,
};

pub const TOKEN_A: &str = "0x5600ff383458ae30de902d096ba89f7f81f0a2fc";
pub const TOKEN_B: &str = "0x00000000219ab540356cbb839cbe05303d7705fa";

pub const TRANSFER_EVENT: &str = r#"{
    "anonymous": false,
    "inputs": [
        {"indexed": true, "name": "from", "type": "address"},
        {"indexed": true, "name": "to", "type": "address"},
        {"indexed": false, "name": "value", "type": "uint256"}
    ],
    "name": "Transfer",
    "type": "event"
}"#;

pub const TRANSFER_FN: &str = r#"{
    "constant": false,
    "inputs": [
        {"name": "_to", "type": "address"},
        {"name": "_value", "type": "uint256"}
    ],
    "name": "transfer",
    "outputs": [{"name": "", "type": "bool"}],
    "payable": false,
    "stateMutability": "nonpayable",
    "type": "function"
}"#;

pub fn transfer_topic() -> String {
    keccak256_hex("Transfer(address,address,uint256)")
}

pub fn transfer_filter(address: &str) -> String {
    format!(r#"{{"address": "{address}", "event": {TRANSFER_EVENT}}}"#)
}

/// An ERC-20 `Transfer` log at `(block, tx_index, log_index)`.
pub fn transfer_log(
    address: &str,
    block: i64,
    tx_index: i64,
    log_index: i64,
    value: u64,
) -> RawLog {
    RawLog {
        address: address.into(),
        topics: vec![
            transfer_topic(),
            format!("0x{:0>64}", "d8da6bf26964af9d7eed9e03e53415d37aa96045"),
            format!("0x{:0>64}", "ab5801a7d398351b8be11c439e05c5b3259aec9b"),
        ],
        data: format!("0x{value:064x}"),
        block_number: Some(format!("0x{block:x}")),
        block_hash: Some(format!("0x{block:064x}")),
        transaction_hash: Some(format!("0x{:064x}", block * 1_000 + tx_index)),
        transaction_index: Some(format!("0x{tx_index:x}")),
        log_index: Some(format!("0x{log_index:x}")),
        removed: Some(false),
    }
}

pub fn listener_request(
    stream_id: Uuid,
    address: &str,
    from_block: Option<&str>,
    checkpoint: Option<Checkpoint>,
) -> ListenerAddRequest {
    ListenerAddRequest {
        stream_id,
        listener_id: Uuid::new_v4(),
        name: format!("transfers-{address}"),
        options: ListenerOptions {
            from_block: from_block.map(String::from),
            filters: vec![transfer_filter(address)],
            options: Some(format!(r#"{{"methods": [{TRANSFER_FN}]}}"#)),
        },
        checkpoint,
    }
}

pub fn fast_config() -> StreamConfig {
    StreamConfig {
        poll_interval_ms: 10,
        catchup_page_size: 10,
        retry: RetryConfig {
            initial_backoff_ms: 5,
            max_backoff_ms: 20,
            multiplier: 2.0,
        },
        block_notices: true,
    }
}

pub struct Outputs {
    pub outputs: StreamOutputs,
    pub events: mpsc::Receiver<ListenerEvent>,
    pub notices: mpsc::Receiver<BlockHashEvent>,
}

pub fn outputs(capacity: usize) -> Outputs {
    let (events_tx, events) = mpsc::channel(capacity);
    let (notices_tx, notices) = mpsc::channel(64);
    Outputs {
        outputs: StreamOutputs {
            events: events_tx,
            block_notices: Some(notices_tx),
        },
        events,
        notices,
    }
}

pub async fn next_event(rx: &mut mpsc::Receiver<ListenerEvent>) -> ListenerEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

pub async fn next_notice(rx: &mut mpsc::Receiver<BlockHashEvent>) -> BlockHashEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for block notice")
        .expect("notice channel closed")
}

/// Poll until `cond` holds, panicking after five seconds.
pub async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn wait_for_state<C: EvmRpcClient>(
    manager: &StreamManager<C>,
    stream_id: Uuid,
    state: PollerState,
) {
    eventually(&format!("{state:?}"), || manager.poller_state(stream_id).ok() == Some(state)).await;
}

/// In-memory node: a settable head, a queue of scripted filter changes and
/// a log history served by `eth_getLogs`.
#[derive(Default)]
pub struct MockClient {
    head: AtomicI64,
    changes: Mutex<VecDeque<Result<Vec<RawLog>, TransportError>>>,
    history: Mutex<Vec<RawLog>>,
    block_number_failures: AtomicU32,
    pub get_logs_queries: Mutex<Vec<LogQuery>>,
    pub block_number_calls: AtomicUsize,
    pub new_filter_calls: AtomicUsize,
    pub changes_calls: AtomicUsize,
    pub uninstall_calls: AtomicUsize,
}

impl MockClient {
    pub fn with_head(head: i64) -> Self {
        let client = Self::default();
        client.set_head(head);
        client
    }

    pub fn set_head(&self, head: i64) {
        self.head.store(head, Ordering::SeqCst);
    }

    pub fn push_changes(&self, logs: Vec<RawLog>) {
        self.changes.lock().push_back(Ok(logs));
    }

    /// A transient failure on the next `eth_getFilterChanges`.
    pub fn push_changes_error(&self, reason: &str) {
        self.changes
            .lock()
            .push_back(Err(TransportError::Http(reason.into())));
    }

    /// The node forgets the installed filter.
    pub fn push_filter_lost(&self) {
        self.changes.lock().push_back(Err(TransportError::Rpc(JsonRpcError {
            code: -32000,
            message: "filter not found".into(),
            data: None,
        })));
    }

    pub fn add_history(&self, logs: impl IntoIterator<Item = RawLog>) {
        self.history.lock().extend(logs);
    }

    /// Make the next `n` `eth_blockNumber` calls fail.
    pub fn fail_block_number(&self, n: u32) {
        self.block_number_failures.store(n, Ordering::SeqCst);
    }

    pub fn get_logs_calls(&self) -> usize {
        self.get_logs_queries.lock().len()
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EvmRpcClient for MockClient {
    async fn block_number(&self) -> Result<i64, TransportError> {
        self.block_number_calls.fetch_add(1, Ordering::SeqCst);
        let pending = self.block_number_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.block_number_failures.store(pending - 1, Ordering::SeqCst);
            return Err(TransportError::Http("connection refused".into()));
        }
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn block_hash(&self, number: i64) -> Result<Option<String>, TransportError> {
        Ok(Some(format!("0x{number:064x}")))
    }

    async fn new_filter(&self, _query: &LogQuery) -> Result<FilterId, TransportError> {
        let n = self.new_filter_calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("0xf{n}"))
    }

    async fn get_filter_changes(&self, _id: &FilterId) -> Result<Vec<RawLog>, TransportError> {
        self.changes_calls.fetch_add(1, Ordering::SeqCst);
        match self.changes.lock().pop_front() {
            Some(result) => result,
            None => Ok(vec![]),
        }
    }

    async fn get_logs(&self, query: &LogQuery) -> Result<Vec<RawLog>, TransportError> {
        self.get_logs_queries.lock().push(query.clone());
        let from = query.from_block.unwrap_or(0);
        let to = query.to_block.unwrap_or(i64::MAX);
        Ok(self
            .history
            .lock()
            .iter()
            .filter(|log| {
                let block = log.block().unwrap_or(-1);
                block >= from
                    && block <= to
                    && query.addresses.iter().any(|a| a.eq_ignore_ascii_case(&log.address))
                    && query
                        .topic0s
                        .iter()
                        .any(|t| log.topics.first().is_some_and(|t0| t0.eq_ignore_ascii_case(t)))
            })
            .cloned()
            .collect())
    }

    async fn uninstall_filter(&self, _id: &FilterId) -> Result<(), TransportError> {
        self.uninstall_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
