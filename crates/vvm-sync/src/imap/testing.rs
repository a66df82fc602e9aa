//! Scripted in-process IMAP server for transport tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::task::JoinHandle;

use super::stream::{ImapStream, StreamOpener};
use crate::error::{SyncError, SyncResult};

/// One expected command and the reply to it. `{tag}` in the reply is
/// replaced with the tag of the last tagged command received.
pub struct Step {
    pub expect: String,
    pub reply: String,
    pub tagged: bool,
}

pub fn script(expect: &str, reply: &str) -> Step {
    Step {
        expect: expect.to_string(),
        reply: reply.to_string(),
        tagged: true,
    }
}

/// Accepts one untagged client line (an AUTHENTICATE answer).
pub fn continuation(reply: &str) -> Step {
    Step {
        expect: String::new(),
        reply: reply.to_string(),
        tagged: false,
    }
}

/// Hands out the client end of one duplex pipe.
pub struct ScriptedOpener {
    stream: Mutex<Option<DuplexStream>>,
    tls_upgrades: AtomicUsize,
    opened: Mutex<Vec<(String, u16, bool)>>,
}

impl ScriptedOpener {
    pub fn tls_upgrades(&self) -> usize {
        self.tls_upgrades.load(Ordering::SeqCst)
    }

    /// `(host, port, implicit_tls)` of every open call.
    pub fn opened(&self) -> Vec<(String, u16, bool)> {
        self.opened.lock().unwrap().clone()
    }
}

#[async_trait]
impl StreamOpener for ScriptedOpener {
    async fn open(
        &self,
        host: &str,
        port: u16,
        implicit_tls: bool,
    ) -> SyncResult<Box<dyn ImapStream>> {
        self.opened
            .lock()
            .unwrap()
            .push((host.to_string(), port, implicit_tls));
        match self.stream.lock().unwrap().take() {
            Some(stream) => Ok(Box::new(stream)),
            None => Err(SyncError::ConnectionFailed("connection refused".into())),
        }
    }

    async fn start_tls(
        &self,
        stream: Box<dyn ImapStream>,
        _host: &str,
    ) -> SyncResult<Box<dyn ImapStream>> {
        self.tls_upgrades.fetch_add(1, Ordering::SeqCst);
        Ok(stream)
    }
}

/// Server task replaying a script, recording every command line received.
pub struct ScriptedServer {
    pub opener: Arc<ScriptedOpener>,
    handle: JoinHandle<Vec<String>>,
}

impl ScriptedServer {
    pub fn spawn(greeting: &str, steps: Vec<Step>) -> Self {
        let (client, server) = tokio::io::duplex(256 * 1024);
        let greeting = format!("{}\r\n", greeting);

        let handle = tokio::spawn(async move {
            let mut server = BufReader::new(server);
            let mut received = Vec::new();
            let mut tag = String::new();
            if server.get_mut().write_all(greeting.as_bytes()).await.is_err() {
                return received;
            }

            for step in steps {
                let mut line = String::new();
                match server.read_line(&mut line).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                let line = line.trim_end().to_string();
                if step.tagged {
                    tag = line.split(' ').next().unwrap_or_default().to_string();
                    let command = line[tag.len()..].trim_start();
                    assert!(
                        command.starts_with(&step.expect),
                        "expected {:?}, got {:?}",
                        step.expect,
                        command
                    );
                }
                received.push(line.clone());

                let reply = format!("{}\r\n", step.reply.replace("{tag}", &tag));
                if server.get_mut().write_all(reply.as_bytes()).await.is_err() {
                    break;
                }
            }
            received
        });

        ScriptedServer {
            opener: Arc::new(ScriptedOpener {
                stream: Mutex::new(Some(client)),
                tls_upgrades: AtomicUsize::new(0),
                opened: Mutex::new(Vec::new()),
            }),
            handle,
        }
    }

    /// Waits for the script to end and returns the received command lines.
    pub async fn finish(self) -> Vec<String> {
        self.handle.await.unwrap()
    }
}
