// In-process RESP server standing in for Redis.
//
// Speaks just enough of the protocol for the relay: connection setup
// commands are acknowledged with +OK, PSUBSCRIBE registers a pattern
// subscriber, PUBLISH routes a pmessage to every matching subscriber and
// PING answers PONG. Tests can also push raw messages and cut every
// subscriber connection.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

type Writer = Arc<AsyncMutex<OwnedWriteHalf>>;

struct Subscriber {
    /// Pattern with the trailing `*` removed.
    prefix: String,
    pattern: String,
    writer: Writer,
}

#[derive(Default)]
struct State {
    subscribers: Mutex<Vec<Subscriber>>,
    commands: Mutex<Vec<String>>,
}

pub struct FakeRedis {
    addr: SocketAddr,
    state: Arc<State>,
    accept: JoinHandle<()>,
}

impl FakeRedis {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake redis");
        let addr = listener.local_addr().expect("local addr");
        let state = Arc::new(State::default());

        let accept = tokio::spawn({
            let state = state.clone();
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    tokio::spawn(serve(stream, state.clone()));
                }
            }
        });

        Self {
            addr,
            state,
            accept,
        }
    }

    pub fn url(&self) -> String {
        format!("redis://{}/", self.addr)
    }

    /// How many times a command (upper case) has been received.
    pub fn command_count(&self, name: &str) -> usize {
        self.state
            .commands
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.as_str() == name)
            .count()
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.subscribers.lock().unwrap().len()
    }

    /// Delivers a message as if another process had published it.
    pub async fn push(&self, channel: &str, payload: &[u8]) -> usize {
        deliver(&self.state, channel.as_bytes(), payload).await
    }

    /// Closes every pub/sub connection from the server side.
    pub async fn drop_subscribers(&self) {
        let writers: Vec<Writer> = self
            .state
            .subscribers
            .lock()
            .unwrap()
            .drain(..)
            .map(|s| s.writer)
            .collect();
        for writer in writers {
            let _ = writer.lock().await.shutdown().await;
        }
    }
}

impl Drop for FakeRedis {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

/// Polls `condition` until it holds or two seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

async fn serve(stream: TcpStream, state: Arc<State>) {
    let (read, write) = stream.into_split();
    let writer: Writer = Arc::new(AsyncMutex::new(write));
    let mut reader = BufReader::new(read);

    while let Some(args) = read_command(&mut reader).await {
        let Some(name) = args.first() else {
            continue;
        };
        let name = String::from_utf8_lossy(name).to_uppercase();
        state.commands.lock().unwrap().push(name.clone());

        let ok = match name.as_str() {
            "PSUBSCRIBE" => psubscribe(&state, &writer, &args[1..]).await,
            "PUBLISH" if args.len() == 3 => {
                let receivers = deliver(&state, &args[1], &args[2]).await;
                write_all(&writer, format!(":{receivers}\r\n").as_bytes()).await
            }
            "PING" => write_all(&writer, b"+PONG\r\n").await,
            _ => write_all(&writer, b"+OK\r\n").await,
        };
        if !ok {
            break;
        }
    }
}

async fn psubscribe(state: &State, writer: &Writer, patterns: &[Vec<u8>]) -> bool {
    // Registered under the writer lock so no pmessage can overtake the
    // confirmation.
    let mut out = writer.lock().await;
    for (i, pattern) in patterns.iter().enumerate() {
        let pattern = String::from_utf8_lossy(pattern).into_owned();
        state.subscribers.lock().unwrap().push(Subscriber {
            prefix: pattern.trim_end_matches('*').to_string(),
            pattern: pattern.clone(),
            writer: writer.clone(),
        });

        let mut reply = b"*3\r\n".to_vec();
        reply.extend(bulk(b"psubscribe"));
        reply.extend(bulk(pattern.as_bytes()));
        reply.extend(format!(":{}\r\n", i + 1).into_bytes());
        if out.write_all(&reply).await.is_err() {
            return false;
        }
    }
    true
}

async fn deliver(state: &State, channel: &[u8], payload: &[u8]) -> usize {
    let channel_str = String::from_utf8_lossy(channel);
    let targets: Vec<(String, Writer)> = state
        .subscribers
        .lock()
        .unwrap()
        .iter()
        .filter(|s| channel_str.starts_with(&s.prefix))
        .map(|s| (s.pattern.clone(), s.writer.clone()))
        .collect();

    let mut delivered = 0;
    for (pattern, writer) in targets {
        let mut frame = b"*4\r\n".to_vec();
        frame.extend(bulk(b"pmessage"));
        frame.extend(bulk(pattern.as_bytes()));
        frame.extend(bulk(channel));
        frame.extend(bulk(payload));
        if write_all(&writer, &frame).await {
            delivered += 1;
        }
    }
    delivered
}

fn bulk(data: &[u8]) -> Vec<u8> {
    let mut out = format!("${}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

async fn write_all(writer: &Writer, data: &[u8]) -> bool {
    writer.lock().await.write_all(data).await.is_ok()
}

/// Reads one command sent as an array of bulk strings.
async fn read_command(reader: &mut BufReader<OwnedReadHalf>) -> Option<Vec<Vec<u8>>> {
    let mut line = String::new();
    if reader.read_line(&mut line).await.ok()? == 0 {
        return None;
    }
    let count: usize = line.trim_end().strip_prefix('*')?.parse().ok()?;

    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        line.clear();
        reader.read_line(&mut line).await.ok()?;
        let len: usize = line.trim_end().strip_prefix('$')?.parse().ok()?;
        let mut buf = vec![0; len + 2];
        reader.read_exact(&mut buf).await.ok()?;
        buf.truncate(len);
        args.push(buf);
    }
    Some(args)
}
