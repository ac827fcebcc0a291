// Switcheroo - JSON-RPC traffic switch
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! End-to-end tests: a real switch between a WebSocket client and a mock node

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use switcheroo_common::logging::ensure_test_logging;
use switcheroo_proxy::{Config, Server, ServerBuilder};
use tokio::{net::TcpListener, time::timeout};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, Message},
    MaybeTlsStream, WebSocketStream,
};

type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

/// Mock node answering every request with its method name as result.
/// `eth_subscribe` is also followed by one subscription notification.
struct MockNode {
    address: SocketAddr,
    requests: Arc<AtomicUsize>,
}

impl MockNode {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let requests = Arc::new(AtomicUsize::new(0));
        let counter = requests.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let counter = counter.clone();
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else { return };
                    while let Some(Ok(frame)) = ws.next().await {
                        let Message::Text(text) = frame else { continue };
                        let request: Value = serde_json::from_str(text.as_str()).unwrap();
                        counter.fetch_add(1, Ordering::SeqCst);
                        let method = request["method"].as_str().unwrap_or_default().to_string();
                        let answer =
                            json!({"jsonrpc": "2.0", "id": request["id"], "result": method});
                        if ws.send(Message::text(answer.to_string())).await.is_err() {
                            return;
                        }
                        if method == "eth_subscribe" {
                            let push = json!({
                                "jsonrpc": "2.0",
                                "method": "eth_subscription",
                                "params": {"subscription": "0x1", "result": "0xabc"},
                            });
                            let _ = ws.send(Message::text(push.to_string())).await;
                        }
                    }
                });
            }
        });
        Self { address, requests }
    }

    fn endpoint(&self) -> String {
        format!("ws://{}", self.address)
    }

    fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

async fn start_switch(config: &str) -> (Server, SocketAddr) {
    ensure_test_logging(None);
    let server = ServerBuilder::new()
        .listen_addr("127.0.0.1:0".parse().unwrap())
        .config(Config::from_yaml_str(config).unwrap())
        .build()
        .unwrap();
    let address = server.start().await.unwrap();
    (server, address)
}

async fn dial(switch: SocketAddr, source: &str) -> Client {
    let (client, _) = connect_async(format!("ws://{switch}/dial/{source}")).await.unwrap();
    client
}

async fn call(client: &mut Client, id: u64, method: &str) -> Value {
    let request = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": []});
    client.send(Message::text(request.to_string())).await.unwrap();
    next_json(client).await
}

async fn next_json(client: &mut Client) -> Value {
    loop {
        let frame = timeout(WAIT, client.next()).await.unwrap().unwrap().unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

fn plain_config(node: &MockNode) -> String {
    format!(
        r#"
targets:
  node:
    endpoint: {}
sources:
  wallet: {{}}
"#,
        node.endpoint()
    )
}

#[tokio::test]
async fn test_requests_and_responses_are_switched() {
    let node = MockNode::start().await;
    let (server, switch) = start_switch(&plain_config(&node)).await;
    let mut client = dial(switch, "wallet").await;

    let answer = call(&mut client, 1, "eth_blockNumber").await;
    assert_eq!(answer["id"], 1);
    assert_eq!(answer["result"], "eth_blockNumber");

    let answer = call(&mut client, 2, "eth_chainId").await;
    assert_eq!(answer["id"], 2);
    assert_eq!(answer["result"], "eth_chainId");
    assert_eq!(node.requests(), 2);

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_target_initiated_messages_reach_source() {
    let node = MockNode::start().await;
    let (server, switch) = start_switch(&plain_config(&node)).await;
    let mut client = dial(switch, "wallet").await;

    let answer = call(&mut client, 7, "eth_subscribe").await;
    assert_eq!(answer["result"], "eth_subscribe");
    let push = next_json(&mut client).await;
    assert_eq!(push["method"], "eth_subscription");
    assert_eq!(push["params"]["result"], "0xabc");

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_batch_frames_are_split() {
    let node = MockNode::start().await;
    let (server, switch) = start_switch(&plain_config(&node)).await;
    let mut client = dial(switch, "wallet").await;

    let batch = json!([
        {"jsonrpc": "2.0", "id": 1, "method": "eth_blockNumber"},
        {"jsonrpc": "2.0", "id": 2, "method": "eth_gasPrice"},
    ]);
    client.send(Message::text(batch.to_string())).await.unwrap();
    let first = next_json(&mut client).await;
    let second = next_json(&mut client).await;
    assert_eq!(first["result"], "eth_blockNumber");
    assert_eq!(second["result"], "eth_gasPrice");

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_error_effect_answers_without_reaching_target() {
    let node = MockNode::start().await;
    let config = format!(
        r#"
targets:
  node:
    endpoint: {}
sources:
  wallet:
    effects:
      - filter: ^eth_sendRawTransaction$
        error: {{ chance: 1.0, code: -32000, message: nonce too low }}
"#,
        node.endpoint()
    );
    let (server, switch) = start_switch(&config).await;
    let mut client = dial(switch, "wallet").await;

    let answer = call(&mut client, 1, "eth_sendRawTransaction").await;
    assert_eq!(answer["id"], 1);
    assert_eq!(answer["error"]["code"], -32000);
    assert_eq!(answer["error"]["message"], "nonce too low");
    assert_eq!(node.requests(), 0);

    let answer = call(&mut client, 2, "eth_blockNumber").await;
    assert_eq!(answer["result"], "eth_blockNumber");
    assert_eq!(node.requests(), 1);

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_unreachable_target_answers_with_internal_error() {
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("ws://{}", closed.local_addr().unwrap());
    drop(closed);

    let config = format!("targets:\n  node:\n    endpoint: {endpoint}\nsources:\n  wallet: {{}}\n");
    let (server, switch) = start_switch(&config).await;
    let mut client = dial(switch, "wallet").await;

    let answer = call(&mut client, 3, "eth_blockNumber").await;
    assert_eq!(answer["id"], 3);
    assert_eq!(answer["error"]["code"], -32603);

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_dials_without_a_known_source_are_rejected() {
    let node = MockNode::start().await;
    let (server, switch) = start_switch(&plain_config(&node)).await;

    let status = |result: Result<_, tungstenite::Error>| match result {
        Err(tungstenite::Error::Http(response)) => response.status().as_u16(),
        Err(e) => panic!("unexpected error {e}"),
        Ok(_) => panic!("dial should have been rejected"),
    };
    assert_eq!(status(connect_async(format!("ws://{switch}/dial/nobody")).await), 404);
    assert_eq!(status(connect_async(format!("ws://{switch}/dial/")).await), 400);
    assert_eq!(server.backend().session_count(), 0);

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_close_ends_sessions_and_listener() {
    let node = MockNode::start().await;
    let (server, switch) = start_switch(&plain_config(&node)).await;
    let mut first = dial(switch, "wallet").await;
    let mut second = dial(switch, "wallet").await;
    call(&mut first, 1, "eth_blockNumber").await;
    call(&mut second, 1, "eth_blockNumber").await;
    assert_eq!(server.backend().session_count(), 2);

    server.close().await.unwrap();
    assert_eq!(server.backend().session_count(), 0);

    for client in [&mut first, &mut second] {
        let ended = timeout(WAIT, async {
            loop {
                match client.next().await {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        })
        .await;
        assert!(ended.is_ok(), "client was not disconnected");
    }

    assert!(connect_async(format!("ws://{switch}/dial/wallet")).await.is_err());
    assert!(server.close().await.is_err());
}
