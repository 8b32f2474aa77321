use crate::config::EngineConfig;
use crate::routing::{Dispatcher, RouteRequest};
use crate::yate::protocol::{apply_routing_result, install_line, parse_line, Incoming, Message};
use anyhow::Result;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Connects to the telephone engine's external-module port, installs the
/// `call.route` handler and answers routing requests. One task per incoming
/// message; answers are funneled through a single writer task.
pub struct EngineClient {
    dispatcher: Arc<Dispatcher>,
    config: EngineConfig,
    token: CancellationToken,
}

impl EngineClient {
    pub fn new(dispatcher: Arc<Dispatcher>, config: EngineConfig, token: CancellationToken) -> Self {
        Self {
            dispatcher,
            config,
            token,
        }
    }

    pub async fn run(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.token.cancelled() => {
                    info!("engine client stopped");
                    return;
                }
                result = self.serve_connection() => {
                    match result {
                        Ok(()) => info!("engine connection closed"),
                        Err(err) => warn!("engine connection failed: {}", err),
                    }
                    sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }

    async fn serve_connection(&self) -> Result<()> {
        let stream = TcpStream::connect(&self.config.addr).await?;
        info!(addr = %self.config.addr, "connected to telephone engine");
        let (reader, mut writer) = stream.into_split();

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let writer_task = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if writer.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if writer.write_all(b"\n").await.is_err() {
                    break;
                }
            }
        });

        tx.send(install_line(self.config.priority, "call.route"))?;

        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await? {
            let incoming = match parse_line(&line) {
                Ok(incoming) => incoming,
                Err(err) => {
                    warn!("unparseable engine line: {}", err);
                    continue;
                }
            };
            match incoming {
                Incoming::Message(msg) if msg.name == "call.route" => {
                    let dispatcher = self.dispatcher.clone();
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let line = handle_route(dispatcher, msg).await;
                        let _ = tx.send(line);
                    });
                }
                Incoming::Message(msg) => {
                    // Not ours; hand it back untouched.
                    let _ = tx.send(msg.answer(false));
                }
                Incoming::InstallReply { name, success } => {
                    if success {
                        info!(handler = %name, "engine handler installed");
                    } else {
                        error!(handler = %name, "engine refused handler installation");
                    }
                }
                Incoming::Other(line) => debug!("ignoring engine line: {}", line),
            }
        }

        drop(tx);
        let _ = writer_task.await;
        Ok(())
    }
}

/// Decide and answer one `call.route` message.
async fn handle_route(dispatcher: Arc<Dispatcher>, mut msg: Message) -> String {
    let called = msg.param("called").unwrap_or_default().to_string();
    let caller = msg.param("caller").unwrap_or_default().to_string();

    if called.is_empty() || caller.is_empty() {
        return msg.answer(false);
    }

    if called.starts_with("stage1-") {
        return match dispatcher.lateroute(&called).await {
            Ok(result) => {
                apply_routing_result(&mut msg, &result);
                msg.answer(true)
            }
            Err(err) => {
                debug!(called = %called, "late-route failed: {}", err);
                msg.retvalue.clear();
                msg.answer(true)
            }
        };
    }

    if !called.chars().all(|c| c.is_ascii_digit()) {
        return msg.answer(false);
    }

    let call_id = msg
        .param("x_eventphone_id")
        .filter(|id| !id.is_empty())
        .or_else(|| msg.param("billid").filter(|id| !id.is_empty()))
        .map(str::to_string);
    let request = RouteRequest {
        caller,
        called,
        call_id,
    };
    match dispatcher.route(request).await {
        Ok(outcome) => {
            apply_routing_result(&mut msg, &outcome.result);
            msg.answer(true)
        }
        Err(err) => {
            msg.set_param("error", err.code());
            if err.pass_through() {
                // Leave the message to lower-priority engine modules.
                msg.answer(false)
            } else {
                msg.retvalue.clear();
                msg.answer(true)
            }
        }
    }
}
