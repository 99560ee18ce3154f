//! Shared fixtures for the integration suites: an in-process pool bound to
//! an ephemeral port, hand-driven template/repository collaborators, and
//! thin v1/v2 test clients.

#![allow(dead_code)]

use forgepool::hashing::{HashEngine, HashError};
use forgepool::server::{run_template_pump, PoolServer};
use forgepool::stratum::v2::codec::Frame;
use forgepool::stratum::v2::messages::V2Payload;
use forgepool::stratum::v2::noise::{HandshakeInitiator, NoiseTransport, RESPONSE_LEN};
use forgepool::template::provider::ManualTemplateProvider;
use forgepool::{
    BlockTemplate, MemoryRepository, PoolConfig, PoolContext, ShareRepository, TemplateProvider,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Engine returning the all-zero digest: every share solves the block.
pub struct ZeroEngine;

impl HashEngine for ZeroEngine {
    fn hash(&self, _data: &[u8]) -> Result<[u8; 32], HashError> {
        Ok([0u8; 32])
    }
}

/// Engine returning the all-ones digest: every share misses every target.
pub struct MaxEngine;

impl HashEngine for MaxEngine {
    fn hash(&self, _data: &[u8]) -> Result<[u8; 32], HashError> {
        Ok([0xff; 32])
    }
}

pub struct TestPool {
    pub context: Arc<PoolContext>,
    pub provider: Arc<ManualTemplateProvider>,
    pub repository: Arc<MemoryRepository>,
    pub addr: SocketAddr,
    pub cancel: CancellationToken,
}

impl TestPool {
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.context.batch.stop().await;
    }
}

/// Configuration tuned for fast tests; callers adjust fields as needed.
pub fn test_config() -> PoolConfig {
    let mut config = PoolConfig::default();
    config.stratum.idle_timeout_secs = 30;
    config.batch.batch_timeout_ms = 2;
    config.template.stale_grace_secs = 1;
    config
}

pub fn test_template(height: u64, timestamp: u32) -> BlockTemplate {
    BlockTemplate::new(
        0x2000_0000,
        [0xab; 32],
        timestamp,
        0x1d00ffff,
        height,
        50_0000_0000,
        b"cb-prefix".to_vec(),
        b"cb-suffix".to_vec(),
        vec![[0x11; 32]],
        vec![vec![0xde, 0xad]],
    )
}

/// Boot a pool on 127.0.0.1:0 with the given engine and config.
pub async fn spawn_pool(config: PoolConfig, engine: Arc<dyn HashEngine>) -> TestPool {
    let repository = Arc::new(MemoryRepository::new());
    let provider = Arc::new(ManualTemplateProvider::new());
    let context = PoolContext::new(
        config,
        engine,
        Arc::clone(&repository) as Arc<dyn ShareRepository>,
        Arc::clone(&provider) as Arc<dyn TemplateProvider>,
    );

    let cancel = CancellationToken::new();
    tokio::spawn(Arc::clone(&context.distributor).run(cancel.child_token()));
    tokio::spawn(run_template_pump(
        Arc::clone(&context.store),
        Arc::clone(&context.distributor),
        Arc::clone(&provider) as Arc<dyn TemplateProvider>,
        cancel.child_token(),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind test listener");
    let addr = listener.local_addr().expect("listener addr");
    let server = PoolServer::new(Arc::clone(&context));
    let server_cancel = cancel.child_token();
    tokio::spawn(async move {
        let _ = server.serve(listener, server_cancel).await;
    });

    TestPool { context, provider, repository, addr, cancel }
}

/// Publish a template and wait until the store serves it.
pub async fn publish_and_wait(pool: &TestPool, template: BlockTemplate) -> u64 {
    let height = template.height;
    pool.provider.push(template);
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    loop {
        if let Some((job_id, current)) = pool.context.store.current() {
            if current.height == height {
                return job_id;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "template at height {height} never became current"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Line-oriented v1 test client.
pub struct V1Client {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    next_id: u64,
}

impl V1Client {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect v1 client");
        let (read_half, writer) = stream.into_split();
        Self { lines: BufReader::new(read_half).lines(), writer, next_id: 1 }
    }

    pub async fn send_raw(&mut self, value: &Value) {
        let mut line = value.to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await.expect("client write");
    }

    /// Send a request, returning the id used.
    pub async fn request(&mut self, method: &str, params: Value) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.send_raw(&json!({"id": id, "method": method, "params": params})).await;
        id
    }

    pub async fn recv(&mut self) -> Value {
        let line = tokio::time::timeout(RECV_TIMEOUT, self.lines.next_line())
            .await
            .expect("v1 recv timeout")
            .expect("v1 read error")
            .expect("v1 connection closed");
        serde_json::from_str(&line).expect("v1 line is not JSON")
    }

    /// Skip notifications until the response with `id` arrives.
    pub async fn response(&mut self, id: u64) -> Value {
        loop {
            let message = self.recv().await;
            if message.get("id").and_then(Value::as_u64) == Some(id) {
                return message;
            }
        }
    }

    /// Wait for the next notification with the given method.
    pub async fn notification(&mut self, method: &str) -> Value {
        loop {
            let message = self.recv().await;
            if message.get("id").is_none()
                && message.get("method").and_then(Value::as_str) == Some(method)
            {
                return message;
            }
        }
    }

    /// Drain frames until the server closes the connection.
    pub async fn expect_close(&mut self) {
        loop {
            match tokio::time::timeout(RECV_TIMEOUT, self.lines.next_line())
                .await
                .expect("timed out waiting for close")
            {
                Ok(None) | Err(_) => return,
                Ok(Some(_)) => {}
            }
        }
    }

    /// subscribe + authorize; returns (extranonce1 hex, first job id hex).
    pub async fn bring_up(&mut self, worker: &str) -> (String, String) {
        let id = self.request("mining.subscribe", json!(["test-rig/0.1"])).await;
        let reply = self.response(id).await;
        let extranonce1 = reply["result"][1].as_str().expect("extranonce1").to_string();

        let id = self.request("mining.authorize", json!([worker, "x"])).await;
        let reply = self.response(id).await;
        assert_eq!(reply["result"], json!(true), "authorize failed: {reply}");

        let notify = self.notification("mining.notify").await;
        let job_id = notify["params"][0].as_str().expect("job id").to_string();
        (extranonce1, job_id)
    }
}

/// Frame-oriented v2 test client over the noise transport.
pub struct V2Client {
    stream: TcpStream,
    transport: NoiseTransport,
}

impl V2Client {
    pub async fn connect(addr: SocketAddr) -> Self {
        let mut stream = TcpStream::connect(addr).await.expect("connect v2 client");
        let (initiator, first_message) = HandshakeInitiator::new();
        stream.write_all(&first_message).await.expect("handshake write");

        let mut response = [0u8; RESPONSE_LEN];
        tokio::time::timeout(RECV_TIMEOUT, stream.read_exact(&mut response))
            .await
            .expect("handshake timeout")
            .expect("handshake read");
        let (transport, _server_static) =
            initiator.finalize(&response).expect("handshake finalize");
        Self { stream, transport }
    }

    pub async fn send<M: V2Payload>(&mut self, message: M) {
        let record = self
            .transport
            .seal_record(&message.into_frame().to_bytes())
            .expect("seal record");
        self.stream.write_all(&record).await.expect("v2 write");
    }

    pub async fn recv_frame(&mut self) -> Frame {
        let mut len_bytes = [0u8; 2];
        tokio::time::timeout(RECV_TIMEOUT, self.stream.read_exact(&mut len_bytes))
            .await
            .expect("v2 recv timeout")
            .expect("v2 read error");
        let len = u16::from_le_bytes(len_bytes) as usize;
        let mut ciphertext = vec![0u8; len];
        self.stream.read_exact(&mut ciphertext).await.expect("v2 read body");
        let plaintext = self.transport.open_record(&ciphertext).expect("open record");
        Frame::from_bytes(&plaintext).expect("decode frame")
    }

    /// Skip pushes until a frame of the wanted type arrives.
    pub async fn recv_type(&mut self, msg_type: u8) -> Frame {
        loop {
            let frame = self.recv_frame().await;
            if frame.msg_type == msg_type {
                return frame;
            }
        }
    }
}
